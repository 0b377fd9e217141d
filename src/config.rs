use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Registry host aliases accepted in request URLs (e.g. `docker.io`,
    /// `ghcr.io`).
    pub registries: Vec<String>,
    /// Root directory of the on-disk object cache.
    pub cache_dir: PathBuf,
    /// Byte quota for the cache.
    #[serde(default = "default_cache_size")]
    pub cache_size: u64,
    /// How long (seconds) a cached object is served without revalidation.
    #[serde(default = "default_unconditional_cache_time")]
    pub unconditional_cache_time: u64,
    /// Per-request upstream deadline in seconds.
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    /// Fallback TTL (seconds) for bearer tokens without `expires_in`.
    #[serde(default = "default_token_ttl")]
    pub token_ttl: u64,
    /// Socket address for the HTTP listener.
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_cache_size() -> u64 {
    1 << 30
}

fn default_unconditional_cache_time() -> u64 {
    300
}

fn default_upstream_timeout() -> u64 {
    10
}

fn default_token_ttl() -> u64 {
    300
}

fn default_http_listen() -> String {
    "127.0.0.1:5000".to_string()
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Alias table
// ---------------------------------------------------------------------------

impl Config {
    /// Map each configured registry alias to its upstream host. `docker.io`
    /// serves its content from `registry-1.docker.io`; everything else
    /// passes through unchanged.
    pub fn registry_aliases(&self) -> HashMap<String, String> {
        self.registries
            .iter()
            .map(|reg| {
                let host = if reg == "docker.io" {
                    "registry-1.docker.io"
                } else {
                    reg.as_str()
                };
                (reg.clone(), host.to_string())
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.registries.is_empty(),
        "at least one registry must be configured"
    );
    anyhow::ensure!(config.cache_size > 0, "cache_size must be positive");
    anyhow::ensure!(
        config.upstream_timeout > 0,
        "upstream_timeout must be positive"
    );
    anyhow::ensure!(
        config.http_listen.parse::<std::net::SocketAddr>().is_ok(),
        "http_listen must be a socket address"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = serde_yaml::from_str(
            "registries: [docker.io]\ncache_dir: /var/cache/cachistry\n",
        )
        .unwrap();
        assert_eq!(config.cache_size, 1 << 30);
        assert_eq!(config.unconditional_cache_time, 300);
        assert_eq!(config.upstream_timeout, 10);
        assert_eq!(config.token_ttl, 300);
        assert_eq!(config.http_listen, "127.0.0.1:5000");
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, LogFormat::Text);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn docker_io_aliases_to_its_real_host() {
        let config: Config = serde_yaml::from_str(
            "registries: [docker.io, ghcr.io]\ncache_dir: /tmp/c\n",
        )
        .unwrap();
        let aliases = config.registry_aliases();
        assert_eq!(aliases["docker.io"], "registry-1.docker.io");
        assert_eq!(aliases["ghcr.io"], "ghcr.io");
        assert!(!aliases.contains_key("evil.example"));
    }

    #[test]
    fn empty_registries_fail_validation() {
        let config: Config =
            serde_yaml::from_str("registries: []\ncache_dir: /tmp/c\n").unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn bad_listen_address_fails_validation() {
        let config: Config = serde_yaml::from_str(
            "registries: [docker.io]\ncache_dir: /tmp/c\nhttp_listen: not-an-addr\n",
        )
        .unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn log_format_parses_json() {
        let config: Config = serde_yaml::from_str(
            "registries: [docker.io]\ncache_dir: /tmp/c\nlog:\n  format: json\n",
        )
        .unwrap();
        assert_eq!(config.log.format, LogFormat::Json);
    }
}
