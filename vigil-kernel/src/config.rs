use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KernelConfig {
    pub mqtt: Option<MqttConf>,
    pub http_port: u16,
    pub data_dir: String,
    /// Fenêtre de vivacité : sans heartbeat au-delà, le sweep passe le device offline.
    pub liveness_window_secs: u64,
    pub sweep_interval_secs: u64,
    /// Timeout d'attente d'une réponse corrélée à une commande.
    pub command_timeout_secs: u64,
    pub log_limits: LogLimits,
    pub backoff: BackoffConf,
    pub drain_interval_secs: u64,
    /// Rétention des entrées consolidées avant purge (audit historique).
    pub consolidated_retention_secs: u64,
    pub health_publish_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

/// Bornes du log durable par tenant. Les deux bornes sont indépendantes,
/// la première atteinte tronque côté ancien (last-write survit).
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct LogLimits {
    pub max_messages: usize,
    pub max_age_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct BackoffConf {
    pub base_ms: u64,
    pub cap_ms: u64,
    /// Tentatives consécutives avant de marquer le transport down.
    pub max_attempts: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            mqtt: Some(MqttConf { host: "localhost".into(), port: 1883 }),
            http_port: 8080,
            data_dir: "./data".into(),
            liveness_window_secs: 120,
            sweep_interval_secs: 30,
            command_timeout_secs: 30,
            log_limits: LogLimits { max_messages: 10_000, max_age_secs: 86_400 },
            backoff: BackoffConf { base_ms: 500, cap_ms: 30_000, max_attempts: 10 },
            drain_interval_secs: 15,
            consolidated_retention_secs: 7 * 86_400,
            health_publish_interval_secs: 30,
        }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("VIGIL_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return KernelConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            warn!("invalid config in {path}: {e}, falling back to defaults");
            KernelConfig::default()
        })
    } else {
        warn!("no kernel.yaml found, using default config");
        KernelConfig::default()
    }
}
