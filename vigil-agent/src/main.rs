//! Vigil Agent - Device-side telemetry agent
//!
//! This agent reports to a Vigil kernel:
//! - One-time registration handshake over the kernel HTTP API
//! - Periodic heartbeats with a monotonic sequence number
//! - Periodic telemetry snapshots (hardware, storage, network)
//! - Correlated command execution (command in, response out)

mod config;
mod metrics;

use anyhow::{Context, Result};
use chrono::Utc;
use config::AgentConfig;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Heartbeat message (matches the kernel's session wire schema).
#[derive(Debug, Serialize)]
struct HeartbeatMessage {
    device_id: String,
    seq: u64,
    hostname: String,
    status: String,
    timestamp: String,
}

/// Telemetry message: one category snapshot, flattened next to the envelope.
#[derive(Debug, Serialize)]
struct TelemetryMessage {
    device_id: String,
    seq: u64,
    ts: String,
    #[serde(flatten)]
    snapshot: metrics::Snapshot,
}

/// Incoming command from the kernel.
#[derive(Debug, Deserialize)]
struct IncomingCommand {
    command_id: String,
    device_id: String,
    command_type: String,
    parameters: Option<Value>,
}

/// Command response back to the kernel.
#[derive(Debug, Serialize)]
struct CommandResponse {
    command_id: String,
    device_id: String,
    status: String,
    result: Option<Value>,
    error_message: Option<String>,
}

#[derive(Debug, Serialize)]
struct RegisterRequest {
    device_id: Option<String>,
    tenant: String,
    org: String,
    group: String,
    hostname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    device_id: String,
    token: String,
}

struct Agent {
    config: AgentConfig,
    device_id: String,
    mqtt_client: AsyncClient,
    commands: mpsc::UnboundedReceiver<IncomingCommand>,
    seq: Arc<AtomicU64>,
}

impl Agent {
    /// Register with the kernel if this agent has no identity yet, then
    /// connect to the broker.
    async fn new(mut config: AgentConfig) -> Result<Self> {
        if config.identity.device_id.is_none() {
            let assigned = register_with_kernel(&config).await?;
            info!("registered as device {}", assigned.device_id);
            config.identity.device_id = Some(assigned.device_id);
            config.identity.token = Some(assigned.token);
            if let Err(e) = config.save().await {
                warn!("could not persist config after registration: {e}");
            }
        }
        let device_id = config
            .identity
            .device_id
            .clone()
            .context("device id missing after registration")?;

        let client_id = format!("vigil-agent-{device_id}");
        let mut mqtt_options =
            MqttOptions::new(&client_id, &config.mqtt.broker_host, config.mqtt.broker_port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.mqtt.keep_alive_secs as u64));
        mqtt_options.set_clean_session(true);
        // Le token émis au handshake est le credential broker du device.
        match &config.identity.token {
            Some(token) => {
                mqtt_options.set_credentials(&device_id, token);
            }
            None => warn!("no bus token in config, broker may refuse this device"),
        }

        let (mqtt_client, mut eventloop) = AsyncClient::new(mqtt_options, 10);
        let (tx, commands) = mpsc::unbounded_channel();

        // Event loop in the background: publishes on the command topic are
        // decoded and handed to the main loop.
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        match serde_json::from_slice::<IncomingCommand>(&publish.payload) {
                            Ok(cmd) => {
                                if tx.send(cmd).is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!("undecodable command payload: {e}"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {e}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        Ok(Agent {
            config,
            device_id,
            mqtt_client,
            commands,
            seq: Arc::new(AtomicU64::new(1)),
        })
    }

    fn topic(&self, kind: &str) -> String {
        format!(
            "tenant/{}/device/{}/{kind}",
            self.config.identity.tenant, self.device_id
        )
    }

    async fn run(&mut self) -> Result<()> {
        let command_topic = self.topic("command");
        self.mqtt_client
            .subscribe(&command_topic, QoS::AtLeastOnce)
            .await
            .context("Failed to subscribe to command topic")?;
        info!("subscribed to commands on {command_topic}");

        let mut heartbeat_timer = interval(Duration::from_secs(self.config.intervals.heartbeat_secs));
        let mut snapshot_timer = interval(Duration::from_secs(self.config.intervals.snapshot_secs));

        loop {
            tokio::select! {
                _ = heartbeat_timer.tick() => {
                    if let Err(e) = self.send_heartbeat().await {
                        error!("failed to send heartbeat: {e}");
                    }
                }
                _ = snapshot_timer.tick() => {
                    if let Err(e) = self.send_snapshots().await {
                        error!("failed to send snapshots: {e}");
                    }
                }
                Some(cmd) = self.commands.recv() => {
                    self.handle_command(cmd).await;
                }
            }
        }
    }

    async fn send_heartbeat(&self) -> Result<()> {
        let heartbeat = HeartbeatMessage {
            device_id: self.device_id.clone(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            hostname: self.config.identity.hostname.clone(),
            status: "ok".to_string(),
            timestamp: Utc::now().to_rfc3339(),
        };
        let payload = serde_json::to_string(&heartbeat)?;
        self.mqtt_client
            .publish(self.topic("heartbeat"), QoS::AtLeastOnce, false, payload)
            .await
            .context("Failed to publish heartbeat")?;
        debug!("heartbeat sent (seq {})", heartbeat.seq);
        Ok(())
    }

    /// One telemetry message per category, all sharing the same monotonic
    /// sequence stream so the kernel can order them.
    async fn send_snapshots(&self) -> Result<()> {
        let snapshots = metrics::collect_all()?;
        for snapshot in snapshots {
            let msg = TelemetryMessage {
                device_id: self.device_id.clone(),
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                ts: Utc::now().to_rfc3339(),
                snapshot,
            };
            let payload = serde_json::to_string(&msg)?;
            self.mqtt_client
                .publish(self.topic("sysinfo"), QoS::AtLeastOnce, false, payload)
                .await
                .context("Failed to publish telemetry")?;
        }
        info!("telemetry snapshots sent");
        Ok(())
    }

    async fn handle_command(&self, cmd: IncomingCommand) {
        if cmd.device_id != self.device_id {
            debug!("command {} addressed to {}, ignored", cmd.command_id, cmd.device_id);
            return;
        }
        info!("executing command {} ({})", cmd.command_id, cmd.command_type);

        let response = match self.execute(&cmd.command_type, cmd.parameters.as_ref()).await {
            Ok(result) => CommandResponse {
                command_id: cmd.command_id,
                device_id: self.device_id.clone(),
                status: "success".to_string(),
                result: Some(result),
                error_message: None,
            },
            Err(e) => CommandResponse {
                command_id: cmd.command_id,
                device_id: self.device_id.clone(),
                status: "error".to_string(),
                result: None,
                error_message: Some(e.to_string()),
            },
        };

        match serde_json::to_string(&response) {
            Ok(payload) => {
                if let Err(e) = self
                    .mqtt_client
                    .publish(self.topic("response"), QoS::AtLeastOnce, false, payload)
                    .await
                {
                    error!("failed to publish command response: {e}");
                }
            }
            Err(e) => error!("failed to serialize command response: {e}"),
        }
    }

    async fn execute(&self, command_type: &str, _parameters: Option<&Value>) -> Result<Value> {
        match command_type {
            "ping" => Ok(serde_json::json!({ "pong": true })),
            "collect_now" => {
                self.send_snapshots().await?;
                Ok(serde_json::json!({ "collected": true }))
            }
            "identify" => Ok(serde_json::json!({
                "device_id": self.device_id,
                "hostname": self.config.identity.hostname,
                "version": env!("CARGO_PKG_VERSION"),
            })),
            other => anyhow::bail!("unsupported command type '{other}'"),
        }
    }
}

async fn register_with_kernel(config: &AgentConfig) -> Result<RegisterResponse> {
    let client = reqwest::Client::new();
    let request = RegisterRequest {
        device_id: None,
        tenant: config.identity.tenant.clone(),
        org: config.identity.org.clone(),
        group: config.identity.group.clone(),
        hostname: Some(config.identity.hostname.clone()),
    };
    let response = client
        .post(format!("{}/register", config.kernel.url))
        .header("x-api-key", &config.kernel.api_key)
        .json(&request)
        .send()
        .await
        .context("registration request failed")?;
    if !response.status().is_success() {
        anyhow::bail!("registration rejected: {}", response.status());
    }
    response
        .json::<RegisterResponse>()
        .await
        .context("undecodable registration response")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    info!("Vigil Agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load().await.context("Failed to load config")?;
    let mut agent = Agent::new(config).await.context("Failed to create agent")?;
    agent.run().await.context("Agent execution failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_wire_shape() {
        let hb = HeartbeatMessage {
            device_id: "dev-1".into(),
            seq: 4,
            hostname: "box".into(),
            status: "ok".into(),
            timestamp: Utc::now().to_rfc3339(),
        };
        let value = serde_json::to_value(&hb).unwrap();
        assert_eq!(value["device_id"], "dev-1");
        assert_eq!(value["seq"], 4);
    }

    #[test]
    fn test_telemetry_flattens_snapshot() {
        let msg = TelemetryMessage {
            device_id: "dev-1".into(),
            seq: 9,
            ts: Utc::now().to_rfc3339(),
            snapshot: metrics::Snapshot::Storage(vec![]),
        };
        let value = serde_json::to_value(&msg).unwrap();
        // category/items land next to the envelope, not nested.
        assert_eq!(value["category"], "storage");
        assert!(value["items"].is_array());
    }
}
