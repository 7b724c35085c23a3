use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::{env, fs, path::Path};
use tracing::info;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub webserver: Webserver,
    pub registry: Registry,
    pub tls: Tls,
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Webserver {
    pub port: u16,
    pub bind_address: IpAddr,
}

impl Default for Webserver {
    fn default() -> Self {
        Self {
            port: 3000,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Registry {
    pub request_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub docker_hub: DockerHubConfig,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 30,
            connect_timeout_seconds: 10,
            docker_hub: DockerHubConfig::default(),
        }
    }
}

/// Endpoints of the public hub that images without a registry host resolve to.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DockerHubConfig {
    pub registry_url: String,
    pub auth_url: String,
    pub service: String,
}

impl Default for DockerHubConfig {
    fn default() -> Self {
        Self {
            registry_url: "https://registry.hub.docker.com".to_string(),
            auth_url: "https://auth.docker.io/token".to_string(),
            service: "registry.docker.io".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Tls {
    pub ca_certificate_paths: Vec<PathBuf>,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every missing env var.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable: {}", missing.join(", "));
    }

    Ok(result.into_owned())
}
