/**
 * DEVICE LISTENER - Routage du flux device entrant
 *
 * RÔLE :
 * Une task abonnée en scope service sur `tenant.>` qui aiguille chaque
 * message par type de sujet : heartbeat/status vers le registre de
 * sessions, response vers la corrélation de commandes, sysinfo/monitoring
 * vers le backlog de consolidation. Un payload malformé est loggé et
 * jeté, jamais bloquant pour le flux.
 */

use crate::bus::TenantBus;
use crate::consolidate::Consolidator;
use crate::errors::CoreError;
use crate::sessions::{CommandResponseMsg, DeviceRegistry, HeartbeatMsg};
use crate::subjects::{MessageType, Subject};
use crate::telemetry::{TelemetryEntry, TelemetryMsg};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub fn spawn_device_listener(
    bus: Arc<TenantBus>,
    service_token: String,
    registry: DeviceRegistry,
    consolidator: Arc<Consolidator>,
) -> Result<JoinHandle<()>, CoreError> {
    let mut sub = bus.subscribe(&service_token, "tenant.>")?;
    info!("device listener subscribed to tenant.>");

    Ok(tokio::spawn(async move {
        while let Some(msg) = sub.recv().await {
            let Subject::Device { tenant, device, kind } = &msg.subject else {
                continue;
            };
            match kind {
                MessageType::Heartbeat | MessageType::Status => {
                    match serde_json::from_slice::<HeartbeatMsg>(&msg.payload) {
                        Ok(hb) if hb.device_id == *device => registry.handle_heartbeat(hb).await,
                        Ok(hb) => warn!(
                            "heartbeat device_id '{}' does not match subject device '{device}', dropped",
                            hb.device_id
                        ),
                        Err(e) => warn!("malformed heartbeat from {device}: {e}"),
                    }
                }
                MessageType::Response => {
                    match serde_json::from_slice::<CommandResponseMsg>(&msg.payload) {
                        Ok(resp) => registry.handle_response(resp),
                        Err(e) => warn!("malformed command response from {device}: {e}"),
                    }
                }
                MessageType::Sysinfo | MessageType::Monitoring => {
                    match serde_json::from_slice::<TelemetryMsg>(&msg.payload) {
                        Ok(telemetry) => {
                            let entry = TelemetryEntry::new(
                                tenant,
                                device,
                                telemetry.seq,
                                telemetry.snapshot,
                            );
                            debug!(
                                "queued {} snapshot seq {} from {device}",
                                entry.category().as_str(),
                                entry.seq
                            );
                            consolidator.enqueue(entry);
                        }
                        Err(e) => warn!("malformed telemetry from {device}: {e}"),
                    }
                }
                MessageType::Command => {
                    // Émises par le kernel lui-même, rien à router.
                }
            }
        }
        info!("device listener stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryTransport;
    use crate::config::LogLimits;
    use crate::sessions::SessionState;
    use crate::subjects::Scope;
    use crate::telemetry::Category;
    use crate::tenants::{CredentialStore, Membership, TenantDirectory};
    use tokio::time::Duration;

    async fn setup() -> (Arc<MemoryTransport>, DeviceRegistry, Arc<Consolidator>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (transport, incoming) = MemoryTransport::channel();
        let creds = CredentialStore::new();
        let bus = TenantBus::new(
            transport.clone(),
            creds.clone(),
            LogLimits { max_messages: 100, max_age_secs: 3600 },
            dir.path(),
        );
        bus.spawn_dispatcher(incoming);
        let directory = TenantDirectory::new(creds.clone());
        directory.provision_tenant("acme").unwrap();
        let service = creds.issue(Scope::Service);
        let registry = DeviceRegistry::new(
            bus.clone(),
            directory,
            service.token.clone(),
            dir.path(),
            60,
            5,
        );
        let consolidator = Consolidator::new(3600);
        spawn_device_listener(bus, service.token, registry.clone(), consolidator.clone()).unwrap();
        (transport, registry, consolidator, dir)
    }

    #[tokio::test]
    async fn test_heartbeat_routed_to_registry() {
        let (transport, registry, _c, _dir) = setup().await;
        register(&registry).await;

        let payload = serde_json::json!({"device_id": "dev-1", "seq": 1}).to_string();
        transport.inject("tenant.acme.device.dev-1.heartbeat", payload.into_bytes());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(registry.get("dev-1").await.unwrap().state, SessionState::Online);
    }

    async fn register(registry: &DeviceRegistry) {
        registry
            .register_device(
                Some("dev-1".into()),
                Membership { tenant: "acme".into(), org: "ops".into(), group: "g".into() },
                None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_telemetry_routed_to_backlog() {
        let (transport, registry, consolidator, _dir) = setup().await;
        register(&registry).await;
        let payload = serde_json::json!({
            "device_id": "dev-1",
            "seq": 7,
            "ts": "2026-08-30T12:00:00Z",
            "category": "storage",
            "items": [
                {"mount": "C:", "filesystem": "ntfs", "total_gb": 500.0, "free_gb": 120.0}
            ]
        })
        .to_string();
        transport.inject("tenant.acme.device.dev-1.sysinfo", payload.into_bytes());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(consolidator.pending_count("dev-1", Category::Storage), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_dropped_not_fatal() {
        let (transport, registry, consolidator, _dir) = setup().await;
        register(&registry).await;
        transport.inject("tenant.acme.device.dev-1.sysinfo", b"not json".to_vec());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(consolidator.pending_count("dev-1", Category::Storage), 0);

        // Le flux continue après le message pourri.
        let payload = serde_json::json!({
            "device_id": "dev-1",
            "seq": 1,
            "ts": "2026-08-30T12:00:00Z",
            "category": "events",
            "items": []
        })
        .to_string();
        transport.inject("tenant.acme.device.dev-1.monitoring", payload.into_bytes());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(consolidator.pending_count("dev-1", Category::Events), 1);
    }
}
