use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::factory::FactoryOptions;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub services: ServicesConfig,
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProxyConfig {
    /// Socket address the smart-HTTP server binds to.
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the bare repositories, one `<name>.git` per repo.
    pub repos_path: PathBuf,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of repository handles kept open.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Seconds a single handle build may take before it is abandoned.
    #[serde(default = "default_build_timeout")]
    pub build_timeout: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            build_timeout: default_build_timeout(),
        }
    }
}

fn default_max_size() -> usize {
    64
}

fn default_build_timeout() -> u64 {
    30
}

impl CacheConfig {
    pub fn factory_options(&self) -> FactoryOptions {
        FactoryOptions {
            max_size: self.max_size,
            build_timeout: Duration::from_secs(self.build_timeout),
        }
    }
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Which Git services the server answers.  `git-receive-pack` is never
/// served.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServicesConfig {
    #[serde(default = "default_true")]
    pub upload_pack: bool,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self { upload_pack: true }
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(config.cache.max_size > 0, "cache.max_size must be greater than 0");
    anyhow::ensure!(
        config.cache.build_timeout > 0,
        "cache.build_timeout must be at least 1 second"
    );
    anyhow::ensure!(
        config.proxy.http_listen.parse::<std::net::SocketAddr>().is_ok(),
        "proxy.http_listen is not a socket address: {}",
        config.proxy.http_listen
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config("storage:\n  repos_path: /srv/git\n").unwrap();
        assert_eq!(config.proxy.http_listen, "0.0.0.0:8080");
        assert_eq!(config.storage.repos_path, PathBuf::from("/srv/git"));
        assert_eq!(config.cache.max_size, 64);
        assert_eq!(config.cache.build_timeout, 30);
        assert!(config.services.upload_pack);

        let options = config.cache.factory_options();
        assert_eq!(options.max_size, 64);
        assert_eq!(options.build_timeout, Duration::from_secs(30));
    }

    #[test]
    fn full_config_parses() {
        let yaml = r#"
proxy:
  http_listen: "127.0.0.1:9418"
storage:
  repos_path: "/var/lib/packgate/repos"
cache:
  max_size: 8
  build_timeout: 5
services:
  upload_pack: false
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.proxy.http_listen, "127.0.0.1:9418");
        assert_eq!(config.cache.max_size, 8);
        assert_eq!(config.cache.build_timeout, 5);
        assert!(!config.services.upload_pack);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let yaml = "storage:\n  repos_path: /srv/git\ncache:\n  max_size: 0\n";
        let err = parse_config(yaml).unwrap_err();
        assert!(err.to_string().contains("max_size"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let yaml = "storage:\n  repos_path: /srv/git\ncache:\n  build_timeout: 0\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn bad_listen_address_is_rejected() {
        let yaml = "proxy:\n  http_listen: nowhere\nstorage:\n  repos_path: /srv/git\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn missing_storage_is_rejected() {
        assert!(parse_config("cache:\n  max_size: 4\n").is_err());
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "storage:\n  repos_path: /srv/git\n").unwrap();
        assert_eq!(load_config(&path).unwrap().cache.max_size, 64);

        let err = load_config(dir.path().join("absent.yaml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
