use crate::cache::{CacheKey, LookupCache};
use crate::config::{Config, DockerHubConfig};
use crate::image_reference::ImageReference;
use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use reqwest::header::{ACCEPT, HeaderValue};
use reqwest::{Certificate, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

const DIGEST_HEADER: &str = "Docker-Content-Digest";
const MANIFEST_MEDIA_TYPES: &str = "application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.docker.distribution.manifest.v2+json, \
    application/vnd.oci.image.index.v1+json, \
    application/vnd.oci.image.manifest.v1+json";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry returned status {status} for repository {repository}")]
    Status {
        repository: String,
        status: StatusCode,
    },
    #[error("request for repository {repository} failed: {source}")]
    Transport {
        repository: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("malformed registry response for repository {repository}: {source}")]
    Decode {
        repository: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest response for repository {repository} has no Docker-Content-Digest header")]
    MissingDigest { repository: String },
    #[error("lookup for repository {repository} was cancelled")]
    Cancelled { repository: String },
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token endpoint returned status {status} for repository {repository}")]
    Status {
        repository: String,
        status: StatusCode,
    },
    #[error("token request for repository {repository} failed: {source}")]
    Transport {
        repository: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("malformed token response for repository {repository}: {source}")]
    Decode {
        repository: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("token response for repository {repository} contains no token")]
    MissingToken { repository: String },
}

/// Public hub endpoints resolved from configuration.
#[derive(Debug, Clone)]
pub struct DockerHub {
    pub registry_url: Url,
    pub auth_url: Url,
    pub service: String,
}

impl DockerHub {
    pub fn from_config(config: &DockerHubConfig) -> Result<Self> {
        let registry_url = Url::parse(&config.registry_url).with_context(|| {
            format!("Invalid Docker Hub registry URL {}", config.registry_url)
        })?;
        if registry_url.path() != "/" {
            anyhow::bail!(
                "Docker Hub registry URL {} must not contain a path",
                config.registry_url
            );
        }
        let auth_url = Url::parse(&config.auth_url)
            .with_context(|| format!("Invalid Docker Hub auth URL {}", config.auth_url))?;
        Ok(Self {
            registry_url,
            auth_url,
            service: config.service.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenEndpoint {
    pub realm: Url,
    pub service: String,
}

/// Connection descriptor for one registry, anonymous unless a token endpoint is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryHandle {
    pub base_url: Url,
    pub token_endpoint: Option<TokenEndpoint>,
}

impl RegistryHandle {
    pub fn new(base_url: &Url, docker_hub: &DockerHub) -> Self {
        let token_endpoint = (*base_url == docker_hub.registry_url).then(|| TokenEndpoint {
            realm: docker_hub.auth_url.clone(),
            service: docker_hub.service.clone(),
        });
        Self {
            base_url: base_url.clone(),
            token_endpoint,
        }
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(path);
        url
    }

    fn tags_url(&self, repository: &str) -> Url {
        self.endpoint(&format!("/v2/{}/tags/list", repository))
    }

    fn manifest_url(&self, repository: &str, reference: &str) -> Url {
        self.endpoint(&format!("/v2/{}/manifests/{}", repository, reference))
    }
}

#[derive(Debug, Deserialize)]
struct TagList {
    name: Option<String>,
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

impl TokenResponse {
    fn into_token(self) -> Option<SecretString> {
        [self.token, self.access_token]
            .into_iter()
            .flatten()
            .map(SecretString::from)
            .find(|token| !token.is_empty())
    }
}

pub fn create_client(config: &Config) -> Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder()
        .user_agent(concat!("kverso/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(config.registry.request_timeout_seconds))
        .connect_timeout(Duration::from_secs(config.registry.connect_timeout_seconds));

    for file_path in &config.tls.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder
        .build()
        .context("Failed to build HTTP client")
}

/// Read-only client for the registry HTTP API v2.
pub struct RegistryClient {
    http: Client,
    cache: Arc<LookupCache>,
    docker_hub: DockerHub,
}

impl RegistryClient {
    pub fn new(http: Client, cache: Arc<LookupCache>, docker_hub: DockerHub) -> Self {
        Self {
            http,
            cache,
            docker_hub,
        }
    }

    pub fn cache(&self) -> &LookupCache {
        &self.cache
    }

    /// All tags of the repository in the order the registry returned them.
    pub async fn tags(
        &self,
        image_reference: &ImageReference,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, RegistryError> {
        self.cache
            .get_or_fetch_tags(CacheKey::repository(image_reference), || {
                self.fetch_tags(image_reference, cancel)
            })
            .await
    }

    /// Manifest digest the registry currently serves for the reference's tag.
    pub async fn digest(
        &self,
        image_reference: &ImageReference,
        cancel: &CancellationToken,
    ) -> Result<String, RegistryError> {
        self.cache
            .get_or_fetch_digest(CacheKey::manifest(image_reference), || {
                self.fetch_digest(image_reference, cancel)
            })
            .await
    }

    fn handle(&self, base_url: &Url) -> Arc<RegistryHandle> {
        self.cache
            .get_or_create_handle(base_url, || RegistryHandle::new(base_url, &self.docker_hub))
    }

    async fn fetch_tags(
        &self,
        image_reference: &ImageReference,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, RegistryError> {
        let repository = &image_reference.repository;
        let handle = self.handle(&image_reference.registry_base_url);
        let url = handle.tags_url(repository);
        info!("Fetching tag list from URL {}", url);

        let request = self.authorize(&handle, repository, self.http.get(url), cancel).await?;
        let response = send(request, repository, cancel).await?;
        let tag_list: TagList = read_json(response, repository, cancel).await?;
        let tags = tag_list.tags.unwrap_or_default();
        debug!(
            "Registry returned {} tags for {}",
            tags.len(),
            tag_list.name.as_deref().unwrap_or(repository)
        );
        Ok(tags)
    }

    async fn fetch_digest(
        &self,
        image_reference: &ImageReference,
        cancel: &CancellationToken,
    ) -> Result<String, RegistryError> {
        let repository = &image_reference.repository;
        let handle = self.handle(&image_reference.registry_base_url);
        let url = handle.manifest_url(repository, &image_reference.tag);
        info!("Fetching docker manifest from URL {}", url);

        let request = self.http.get(url).header(ACCEPT, MANIFEST_MEDIA_TYPES);
        let request = self.authorize(&handle, repository, request, cancel).await?;
        let response = send(request, repository, cancel).await?;
        let digest = get_digest_from_response(&response).ok_or_else(|| {
            RegistryError::MissingDigest {
                repository: repository.clone(),
            }
        })?;

        info!("Found remote image digest {} for {}", digest, image_reference);
        Ok(digest)
    }

    /// Attaches a freshly issued bearer token when the registry requires one.
    async fn authorize(
        &self,
        handle: &RegistryHandle,
        repository: &str,
        request: RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<RequestBuilder, RegistryError> {
        match &handle.token_endpoint {
            Some(endpoint) => {
                let token = self.fetch_token(endpoint, repository, cancel).await?;
                Ok(request.bearer_auth(token.expose_secret()))
            }
            None => Ok(request),
        }
    }

    async fn fetch_token(
        &self,
        endpoint: &TokenEndpoint,
        repository: &str,
        cancel: &CancellationToken,
    ) -> Result<SecretString, RegistryError> {
        let scope = format!("repository:{}:pull", repository);
        debug!("Requesting token from {} for scope {}", endpoint.realm, scope);
        let request = self.http.get(endpoint.realm.clone()).query(&[
            ("service", endpoint.service.as_str()),
            ("scope", scope.as_str()),
        ]);

        let response = cancellable(cancel, repository, request.send())
            .await?
            .map_err(|source| AuthError::Transport {
                repository: repository.to_string(),
                source,
            })?;
        if response.status() != StatusCode::OK {
            return Err(AuthError::Status {
                repository: repository.to_string(),
                status: response.status(),
            }
            .into());
        }
        let body = cancellable(cancel, repository, response.bytes())
            .await?
            .map_err(|source| AuthError::Transport {
                repository: repository.to_string(),
                source,
            })?;
        let token_response: TokenResponse =
            serde_json::from_slice(&body).map_err(|source| AuthError::Decode {
                repository: repository.to_string(),
                source,
            })?;

        let token = token_response
            .into_token()
            .ok_or_else(|| AuthError::MissingToken {
                repository: repository.to_string(),
            })?;
        Ok(token)
    }
}

async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    repository: &str,
    future: F,
) -> Result<F::Output, RegistryError> {
    cancel
        .run_until_cancelled(future)
        .await
        .ok_or_else(|| RegistryError::Cancelled {
            repository: repository.to_string(),
        })
}

async fn send(
    request: RequestBuilder,
    repository: &str,
    cancel: &CancellationToken,
) -> Result<Response, RegistryError> {
    let response = cancellable(cancel, repository, request.send())
        .await?
        .map_err(|source| RegistryError::Transport {
            repository: repository.to_string(),
            source,
        })?;

    if response.status() != StatusCode::OK {
        return Err(RegistryError::Status {
            repository: repository.to_string(),
            status: response.status(),
        });
    }
    Ok(response)
}

async fn read_json<T: DeserializeOwned>(
    response: Response,
    repository: &str,
    cancel: &CancellationToken,
) -> Result<T, RegistryError> {
    let body = cancellable(cancel, repository, response.bytes())
        .await?
        .map_err(|source| RegistryError::Transport {
            repository: repository.to_string(),
            source,
        })?;
    serde_json::from_slice(&body).map_err(|source| RegistryError::Decode {
        repository: repository.to_string(),
        source,
    })
}

fn get_digest_from_response(response: &Response) -> Option<String> {
    response
        .headers()
        .get(DIGEST_HEADER)
        .and_then(|value: &HeaderValue| value.to_str().ok())
        .map(str::to_owned)
}
