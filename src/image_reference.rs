use std::fmt;
use url::Url;

/// Registry hosts that name the public Docker Hub rather than a real API host.
pub const DOCKER_HUB_MARKERS: [&str; 2] = ["docker.io", "index.docker.io"];
pub const DEFAULT_NAMESPACE: &str = "library";
pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Scheme, host and optional port of the registry API, without a path.
    pub registry_base_url: Url,
    /// Registry host and port exactly as written in the image string.
    pub registry_host: String,
    pub repository: String,
    pub tag: String,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("image reference is empty")]
    Empty,
    #[error("digest references are not allowed: {0}")]
    DigestNotAllowed(String),
    #[error("tag is missing: {0}")]
    MissingTag(String),
    #[error("repository is missing: {0}")]
    MissingRepository(String),
    #[error("invalid image format: {0}")]
    InvalidFormat(String),
    #[error("invalid registry host {host} in {image}")]
    InvalidHost { image: String, host: String },
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry_host, self.repository, self.tag)
    }
}

/// Repository part of an image string, before any registry defaults are applied.
struct RawReference<'a> {
    repository: &'a str,
}

enum Registry<'a> {
    DockerHub,
    Host(&'a str),
}

struct Resolved<'a> {
    registry: Registry<'a>,
    repository: String,
}

type Rule = for<'a> fn(&RawReference<'a>) -> Option<Resolved<'a>>;

/// Evaluated in order, the first matching rule decides registry and repository.
const RULES: [Rule; 3] = [official_image, hub_namespaced_image, registry_hosted_image];

/// `nginx` is `library/nginx` on Docker Hub.
fn official_image<'a>(raw: &RawReference<'a>) -> Option<Resolved<'a>> {
    (!raw.repository.contains('/')).then(|| Resolved {
        registry: Registry::DockerHub,
        repository: format!("{}/{}", DEFAULT_NAMESPACE, raw.repository),
    })
}

/// `bitnami/redis` is a namespaced repository on Docker Hub.
fn hub_namespaced_image<'a>(raw: &RawReference<'a>) -> Option<Resolved<'a>> {
    (raw.repository.matches('/').count() == 1).then(|| Resolved {
        registry: Registry::DockerHub,
        repository: raw.repository.to_string(),
    })
}

/// `ghcr.io/org/app` starts with the registry host.
fn registry_hosted_image<'a>(raw: &RawReference<'a>) -> Option<Resolved<'a>> {
    let (host, path) = raw.repository.split_once('/')?;
    if !path.contains('/') {
        return None;
    }
    let registry = if DOCKER_HUB_MARKERS.contains(&host) {
        Registry::DockerHub
    } else {
        Registry::Host(host)
    };
    Some(Resolved {
        registry,
        repository: path.to_string(),
    })
}

/// Turns image strings from pod specs into registry API coordinates.
#[derive(Debug, Clone)]
pub struct ImageReferenceParser {
    docker_hub_url: Url,
}

impl ImageReferenceParser {
    pub fn new(docker_hub_url: Url) -> Self {
        Self { docker_hub_url }
    }

    pub fn parse(&self, image: &str) -> Result<ImageReference, ParseError> {
        let image = image.trim();
        if image.is_empty() {
            return Err(ParseError::Empty);
        }
        // digest references are not supported
        if image.contains('@') {
            return Err(ParseError::DigestNotAllowed(image.to_string()));
        }

        let last_slash = image.rfind('/');
        let (repository, tag) = match image.rfind(':') {
            Some(pos) if last_slash.is_none_or(|slash| pos > slash) => {
                (&image[..pos], &image[pos + 1..])
            }
            _ => (image, DEFAULT_TAG),
        };
        if tag.is_empty() {
            return Err(ParseError::MissingTag(image.to_string()));
        }
        if repository.is_empty() {
            return Err(ParseError::MissingRepository(image.to_string()));
        }
        if repository.split('/').any(str::is_empty) {
            return Err(ParseError::InvalidFormat(image.to_string()));
        }

        let raw = RawReference { repository };
        let resolved = RULES
            .iter()
            .find_map(|rule| rule(&raw))
            .ok_or_else(|| ParseError::InvalidFormat(image.to_string()))?;

        let (registry_base_url, registry_host) = match resolved.registry {
            Registry::DockerHub => (self.docker_hub_url.clone(), host_of(&self.docker_hub_url)),
            Registry::Host(host) => {
                let url = registry_url(host).ok_or_else(|| ParseError::InvalidHost {
                    image: image.to_string(),
                    host: host.to_string(),
                })?;
                (url, host.to_string())
            }
        };

        Ok(ImageReference {
            registry_base_url,
            registry_host,
            repository: resolved.repository,
            tag: tag.to_string(),
        })
    }
}

fn host_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

fn registry_url(host: &str) -> Option<Url> {
    let url = Url::parse(&format!("https://{}", host)).ok()?;
    // a host that smuggles in userinfo, a query or a path is not a registry host
    let bare = url.host_str().is_some()
        && url.username().is_empty()
        && url.path() == "/"
        && url.query().is_none()
        && url.fragment().is_none();
    bare.then_some(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> ImageReferenceParser {
        ImageReferenceParser::new(Url::parse("https://registry.hub.docker.com").unwrap())
    }

    #[test]
    fn test_parse_official_image_defaults_namespace_and_tag() {
        let reference = parser().parse("nginx").unwrap();
        assert_eq!(reference.registry_host, "registry.hub.docker.com");
        assert_eq!(reference.repository, "library/nginx");
        assert_eq!(reference.tag, "latest");
    }

    #[test]
    fn test_parse_single_segment_names_always_land_in_library() {
        for image in ["redis:7.2", "busybox", "alpine:3.19.1", "my-app:v1.0.0-rc1"] {
            let reference = parser().parse(image).unwrap();
            assert_eq!(reference.registry_host, "registry.hub.docker.com");
            assert!(
                reference.repository.starts_with("library/"),
                "{} parsed to {}",
                image,
                reference.repository
            );
        }
    }

    #[test]
    fn test_parse_hub_namespaced_image() {
        let reference = parser().parse("myrepo/app:v1.2.3").unwrap();
        assert_eq!(reference.registry_host, "registry.hub.docker.com");
        assert_eq!(reference.repository, "myrepo/app");
        assert_eq!(reference.tag, "v1.2.3");
    }

    #[test]
    fn test_parse_explicit_registry_round_trips() {
        for image in [
            "ghcr.io/org/app:1.0.0",
            "registry.example.com:5000/team/service/api:v2.3.4",
            "quay.io/prometheus/node-exporter:v1.8.2",
            "registry.example.com:443/team/app:v1",
            "Registry.Example.com/team/app:v1",
        ] {
            let reference = parser().parse(image).unwrap();
            assert_eq!(reference.to_string(), image);
            assert_eq!(reference.registry_base_url.path(), "/");
            assert!(!reference.repository.starts_with('/'));
        }
    }

    #[test]
    fn test_parse_keeps_host_as_written_but_normalizes_url() {
        let reference = parser().parse("Registry.Example.com:443/team/app:v1").unwrap();
        assert_eq!(reference.registry_host, "Registry.Example.com:443");
        assert_eq!(
            reference.registry_base_url.as_str(),
            "https://registry.example.com/"
        );
    }

    #[test]
    fn test_parse_port_without_tag_is_not_a_tag() {
        let reference = parser().parse("registry.example.com:5000/team/app").unwrap();
        assert_eq!(reference.registry_host, "registry.example.com:5000");
        assert_eq!(reference.repository, "team/app");
        assert_eq!(reference.tag, "latest");
    }

    #[test]
    fn test_parse_rewrites_docker_hub_marker() {
        let reference = parser().parse("docker.io/library/nginx:1.25").unwrap();
        assert_eq!(
            reference.registry_base_url.as_str(),
            "https://registry.hub.docker.com/"
        );
        assert_eq!(reference.repository, "library/nginx");
        assert_eq!(reference.tag, "1.25");
    }

    #[test]
    fn test_parse_uses_configured_hub_url() {
        let parser = ImageReferenceParser::new(Url::parse("http://127.0.0.1:5000").unwrap());
        let reference = parser.parse("nginx:1.25").unwrap();
        assert_eq!(reference.registry_base_url.as_str(), "http://127.0.0.1:5000/");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parser().parse("  "), Err(ParseError::Empty));
        assert!(matches!(
            parser().parse("nginx@sha256:abcdef"),
            Err(ParseError::DigestNotAllowed(_))
        ));
        assert!(matches!(
            parser().parse("nginx:"),
            Err(ParseError::MissingTag(_))
        ));
        assert!(matches!(
            parser().parse(":v1"),
            Err(ParseError::MissingRepository(_))
        ));
        assert!(matches!(
            parser().parse("ghcr.io//app:v1"),
            Err(ParseError::InvalidFormat(_))
        ));
        assert!(matches!(
            parser().parse("/org/app:v1"),
            Err(ParseError::InvalidFormat(_))
        ));
        assert!(matches!(
            parser().parse("bad host/org/app:v1"),
            Err(ParseError::InvalidHost { .. })
        ));
    }

    #[test]
    fn test_rules_are_independent_of_each_other() {
        let raw = RawReference { repository: "nginx" };
        assert!(official_image(&raw).is_some());
        assert!(hub_namespaced_image(&raw).is_none());
        assert!(registry_hosted_image(&raw).is_none());

        let raw = RawReference {
            repository: "org/app",
        };
        assert!(official_image(&raw).is_none());
        assert!(hub_namespaced_image(&raw).is_some());
        assert!(registry_hosted_image(&raw).is_none());

        let raw = RawReference {
            repository: "index.docker.io/org/app",
        };
        let resolved = registry_hosted_image(&raw).unwrap();
        assert!(matches!(resolved.registry, Registry::DockerHub));
        assert_eq!(resolved.repository, "org/app");
    }
}
