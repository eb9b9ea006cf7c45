//! Gateway configuration loaded from TOML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// SSH server listen port (default: 2222)
    pub ssh_port: u16,

    /// Base URL of the identity/directory service
    pub api_base_url: String,

    /// Shared secret of the identity service. Not used by the password path.
    pub jwt_secret: String,

    /// Path to the SSH host key
    pub host_key_path: PathBuf,

    /// How the gateway reaches backend containers
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("container-gateway");

        Self {
            ssh_port: 2222,
            api_base_url: "http://localhost:8080/api".to_string(),
            jwt_secret: "mySecretKey123456789012345678901234567890".to_string(),
            host_key_path: data_dir.join("host_key"),
            backend: BackendConfig::default(),
        }
    }
}

/// Outbound SSH settings for backend containers.
///
/// The defaults are insecure: every container is reached with the same
/// password and the backend host key is never verified.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Host the container SSH ports are published on
    pub host: String,

    /// Login used on every container
    pub username: String,

    /// Password used on every container
    pub password: String,

    /// Terminal type requested for the backend PTY
    pub term: String,

    /// PTY width in columns
    pub cols: u32,

    /// PTY height in rows
    pub rows: u32,

    /// Dial + login timeout for relayed sessions, in seconds
    pub connect_timeout_secs: u64,

    /// Overall timeout for health checks, in seconds
    pub health_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            username: "root".to_string(),
            password: "password".to_string(),
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
            connect_timeout_secs: 10,
            health_timeout_secs: 5,
        }
    }
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Ensure the host key directory exists.
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.host_key_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create host key directory: {}", parent.display())
                })?;
            }
        }
        Ok(())
    }

    /// Hint shown to users who have no containers yet.
    pub fn create_container_hint(&self) -> String {
        format!(
            "curl -X POST {}/containers",
            self.api_base_url.trim_end_matches('/')
        )
    }
}
