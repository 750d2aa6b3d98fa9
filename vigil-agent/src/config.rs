//! Agent configuration management
//!
//! Handles:
//! - Kernel API endpoint and key for the registration handshake
//! - MQTT broker settings
//! - Identity (tenant/org/group, device id and token once registered)
//! - Cross-platform storage under the OS config directory

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub kernel: KernelApiConfig,
    pub mqtt: MqttConfig,
    pub identity: IdentityConfig,
    pub intervals: Intervals,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelApiConfig {
    pub url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub keep_alive_secs: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub tenant: String,
    pub org: String,
    pub group: String,
    pub hostname: String,
    /// Assigned by the kernel at registration, persisted afterwards.
    pub device_id: Option<String>,
    /// Bus credential returned by the handshake.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervals {
    pub heartbeat_secs: u64,
    pub snapshot_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            kernel: KernelApiConfig {
                url: "http://127.0.0.1:8080".to_string(),
                api_key: String::new(),
            },
            mqtt: MqttConfig {
                broker_host: "127.0.0.1".to_string(),
                broker_port: 1883,
                keep_alive_secs: 30,
            },
            identity: IdentityConfig {
                tenant: "default".to_string(),
                org: "default".to_string(),
                group: "default".to_string(),
                hostname: gethostname::gethostname().to_string_lossy().to_string(),
                device_id: None,
                token: None,
            },
            intervals: Intervals { heartbeat_secs: 30, snapshot_secs: 300 },
        }
    }
}

impl AgentConfig {
    /// Load config from the OS-specific location, then apply env overrides.
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };

        if let Ok(url) = std::env::var("VIGIL_KERNEL_URL") {
            config.kernel.url = url;
        }
        if let Ok(key) = std::env::var("VIGIL_API_KEY") {
            config.kernel.api_key = key;
        }
        if let Ok(host) = std::env::var("VIGIL_MQTT_HOST") {
            config.mqtt.broker_host = host;
        }
        if let Ok(tenant) = std::env::var("VIGIL_TENANT") {
            config.identity.tenant = tenant;
        }

        Ok(config)
    }

    /// Save config to the OS-specific location.
    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path()?;
        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&config_path, content).await?;
        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("vigil-agent");
        path.push("config.toml");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.mqtt.broker_port, 1883);
        assert!(config.identity.device_id.is_none());
        assert_eq!(config.intervals.heartbeat_secs, 30);
    }

    #[test]
    fn test_config_file_path() {
        let path = AgentConfig::config_file_path().unwrap();
        assert!(path.to_string_lossy().contains("vigil-agent"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = AgentConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: AgentConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.mqtt.broker_host, config.mqtt.broker_host);
        assert_eq!(back.identity.tenant, config.identity.tenant);
    }
}
