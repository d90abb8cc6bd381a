//! Node configuration: TOML file plus environment overrides.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use scrapnet_ring::RingConfig;

/// Full configuration for one server node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// External HTTP API
    pub http: HttpConfig,
    /// Overlay ring (ports, timers, discovery)
    pub ring: RingConfig,
    /// Token issuing
    pub auth: AuthConfig,
    /// Artifact store
    pub storage: StorageConfig,
    /// Neighbor replication
    pub replication: ReplicationConfig,
    /// Scrape collaborator
    pub scrape: ScrapeConfig,
}

/// External HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind host
    pub host: String,
    /// Bind port; also the port redirects and replication pushes target
    pub port: u16,
    /// actix worker threads
    pub workers: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            workers: 4,
        }
    }
}

/// Bearer token settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 signing secret, required
    pub jwt_secret: String,
    /// Token lifetime in minutes
    pub token_ttl_minutes: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl_minutes: 10,
        }
    }
}

/// Artifact store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Parent directory; the node writes under `<root>/<own-ip>/`
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("database"),
        }
    }
}

/// Neighbor replication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Pause between replication rounds
    pub interval: Duration,
    /// Deadline per HTTP call to a neighbor
    pub request_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Scrape collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    /// Deadline for fetching one page or asset
    pub timeout: Duration,
    /// User-Agent header sent upstream
    pub user_agent: String,
    /// Also download stylesheets and scripts referenced by the page
    pub fetch_assets: bool,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36"
                .to_string(),
            fetch_assets: false,
        }
    }
}

impl NodeConfig {
    /// Load configuration.
    ///
    /// Order: explicit path argument, then `SCRAPNET_CONFIG`, then
    /// `config/scrapnet.toml`; a missing file falls back to defaults.
    /// Environment variables override whatever was loaded.
    pub fn load(explicit_path: Option<&str>) -> Result<Self> {
        let path = explicit_path
            .map(str::to_string)
            .or_else(|| env::var("SCRAPNET_CONFIG").ok())
            .unwrap_or_else(|| "config/scrapnet.toml".to_string());

        let mut config = match fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content)?,
            Err(_) => Self::default(),
        };

        if let Ok(host) = env::var("SCRAPNET_HOST") {
            config.http.host = host;
        }
        if let Ok(port) = env::var("SCRAPNET_HTTP_PORT") {
            config.http.port = port.parse()?;
        }
        if let Ok(port) = env::var("SCRAPNET_RPC_PORT") {
            config.ring.rpc_port = port.parse()?;
        }
        if let Ok(secret) = env::var("SCRAPNET_JWT_SECRET") {
            config.auth.jwt_secret = secret;
        }

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.http.port == 0 {
            anyhow::bail!("HTTP port cannot be 0");
        }
        if self.http.workers == 0 {
            anyhow::bail!("HTTP workers cannot be 0");
        }
        if self.auth.jwt_secret.is_empty() {
            anyhow::bail!(
                "JWT secret is not configured; set auth.jwt_secret or SCRAPNET_JWT_SECRET"
            );
        }
        if self.auth.token_ttl_minutes <= 0 {
            anyhow::bail!("token TTL must be positive");
        }
        if self.replication.interval.is_zero() {
            anyhow::bail!("replication interval must be non-zero");
        }
        self.ring
            .validate()
            .map_err(|e| anyhow::anyhow!("ring configuration: {e}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.auth.jwt_secret = "test-secret-long-enough-for-hs256!!".into();
        config
    }

    #[test]
    fn defaults_need_a_secret() {
        let config = NodeConfig::default();
        assert!(config.validate().is_err());
        assert!(configured().validate().is_ok());
    }

    #[test]
    fn default_ports_and_intervals() {
        let config = NodeConfig::default();
        assert_eq!(config.http.port, 8000);
        assert_eq!(config.replication.interval, Duration::from_secs(10));
        assert_eq!(config.scrape.timeout, Duration::from_secs(15));
        assert!(!config.scrape.fetch_assets);
    }

    #[test]
    fn toml_roundtrip_with_partial_file() {
        let toml_src = r#"
            [http]
            port = 9001

            [auth]
            jwt_secret = "roundtrip-secret-roundtrip-secret"

            [ring]
            rpc_port = 52000
        "#;
        let config: NodeConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.http.port, 9001);
        assert_eq!(config.ring.rpc_port, 52000);
        // Untouched sections keep their defaults.
        assert_eq!(config.http.workers, 4);
        assert_eq!(config.ring.multicast_port, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_http_port_rejected() {
        let mut config = configured();
        config.http.port = 0;
        assert!(config.validate().is_err());
    }
}
