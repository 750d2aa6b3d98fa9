/**
 * DEVICE SESSION MANAGER - Cycle de vie des devices et dispatch de commandes
 *
 * RÔLE :
 * Machine à états par device (registered, awaiting_heartbeat, online,
 * offline, decommissioned), liveness par heartbeat, et envoi de commandes
 * corrélées avec attente de réponse bornée.
 *
 * FONCTIONNEMENT :
 * - Registry partagé avec persistance JSON différée (pas à chaque heartbeat)
 * - Sweep périodique : online -> offline quand la fenêtre de liveness expire,
 *   jamais déclenchée par l'absence elle-même
 * - Commandes : publish sur ...command avec un correlation id frais, oneshot
 *   en attente dans la pending map, timeout = commande marquée failed et
 *   conservée pour retry (nouveau correlation id), jamais re-soumise en douce
 * - Les messages en retard (seq périmée) sont jetés sans toucher l'état
 */

use crate::bus::TenantBus;
use crate::errors::CoreError;
use crate::state::{new_map, Shared};
use crate::subjects::{MessageType, Scope, Subject};
use crate::tenants::{Membership, TenantDirectory};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Registered,
    AwaitingHeartbeat,
    Online,
    Offline,
    /// Terminal : droits bus révoqués, aucune transition sortante.
    Decommissioned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSession {
    pub device_id: String,
    pub tenant: String,
    pub hostname: Option<String>,
    pub state: SessionState,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub last_seq: u64,
    pub last_status: Option<String>,
}

/// Vue API d'un device, avec la staleness calculée à la lecture.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub device_id: String,
    pub tenant: String,
    pub org: Option<String>,
    pub group: Option<String>,
    pub hostname: Option<String>,
    pub state: SessionState,
    pub last_seen: String,
    pub seconds_since_seen: i64,
    pub last_status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    Pending,
    Completed,
    Failed,
}

/// Trace d'une commande émise, conservée après échec pour décision opérateur.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub command_id: String,
    pub device_id: String,
    pub command_type: String,
    pub parameters: Option<Value>,
    pub state: CommandState,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    pub failure_reason: Option<String>,
    pub response: Option<CommandResponseMsg>,
    /// Id de la commande d'origine quand celle-ci est un retry.
    pub retried_from: Option<String>,
}

// Messages sur le fil (device <-> kernel)
#[derive(Debug, Deserialize)]
pub struct HeartbeatMsg {
    pub device_id: String,
    pub seq: u64,
    pub hostname: Option<String>,
    pub status: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CommandMsg {
    pub command_id: String,
    pub device_id: String,
    pub command_type: String,
    pub parameters: Option<Value>,
    pub timeout_seconds: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponseMsg {
    pub command_id: String,
    pub device_id: String,
    pub status: String,
    pub result: Option<Value>,
    pub error_message: Option<String>,
}

pub type SessionsMap = HashMap<String, DeviceSession>;

#[derive(Clone)]
pub struct DeviceRegistry {
    sessions: Arc<RwLock<SessionsMap>>,
    commands: Shared<HashMap<String, CommandRecord>>,
    pending: Shared<HashMap<String, oneshot::Sender<CommandResponseMsg>>>,
    bus: Arc<TenantBus>,
    directory: TenantDirectory,
    service_token: String,
    data_file: PathBuf,
    liveness_window: time::Duration,
    command_timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(
        bus: Arc<TenantBus>,
        directory: TenantDirectory,
        service_token: String,
        data_dir: impl AsRef<Path>,
        liveness_window_secs: u64,
        command_timeout_secs: u64,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            commands: new_map(),
            pending: new_map(),
            bus,
            directory,
            service_token,
            data_file: data_dir.as_ref().join("sessions.json"),
            liveness_window: time::Duration::seconds(liveness_window_secs as i64),
            command_timeout: Duration::from_secs(command_timeout_secs),
        }
    }

    /// Charge les sessions persistées. Les états volatils (online) sont
    /// ramenés à offline : le prochain heartbeat les remontera.
    pub async fn load(&self) -> Result<(), CoreError> {
        if !self.data_file.exists() {
            info!("no existing sessions file, starting fresh");
            return Ok(());
        }
        let content = tokio::fs::read_to_string(&self.data_file)
            .await
            .map_err(|e| CoreError::Transport(format!("read sessions: {e}")))?;
        let mut loaded: SessionsMap = serde_json::from_str(&content)?;
        for session in loaded.values_mut() {
            if session.state == SessionState::Online {
                session.state = SessionState::Offline;
            }
        }
        let count = loaded.len();
        *self.sessions.write().await = loaded;
        info!("loaded {count} device sessions");
        Ok(())
    }

    pub async fn save(&self) -> Result<(), CoreError> {
        let sessions = self.sessions.read().await;
        let content = serde_json::to_string_pretty(&*sessions)?;
        tokio::fs::write(&self.data_file, content)
            .await
            .map_err(|e| CoreError::Transport(format!("write sessions: {e}")))?;
        Ok(())
    }

    /// Handshake d'enregistrement : rattache le device à la topologie,
    /// émet son credential et ouvre la session en awaiting_heartbeat.
    pub async fn register_device(
        &self,
        device_id: Option<String>,
        membership: Membership,
        hostname: Option<String>,
    ) -> Result<(String, crate::tenants::Credential), CoreError> {
        if !self.directory.is_provisioned(&membership.tenant) {
            return Err(CoreError::Authorization(format!(
                "tenant '{}' is not provisioned",
                membership.tenant
            )));
        }
        let device_id = device_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        {
            let sessions = self.sessions.read().await;
            if let Some(existing) = sessions.get(&device_id) {
                if existing.state == SessionState::Decommissioned {
                    return Err(CoreError::Authorization(format!(
                        "device '{device_id}' is decommissioned"
                    )));
                }
            }
        }
        let tenant = membership.tenant.clone();
        self.directory.assign_device(&device_id, membership)?;

        let now = OffsetDateTime::now_utc();
        let session = DeviceSession {
            device_id: device_id.clone(),
            tenant: tenant.clone(),
            hostname,
            state: SessionState::Registered,
            registered_at: now,
            last_seen: now,
            last_seq: 0,
            last_status: None,
        };
        self.sessions.write().await.insert(device_id.clone(), session);

        // registered -> awaiting_heartbeat à l'émission du premier credential.
        let cred = self.bus.credentials().issue(Scope::Device {
            tenant: tenant.clone(),
            device: device_id.clone(),
        });
        if let Some(s) = self.sessions.write().await.get_mut(&device_id) {
            s.state = SessionState::AwaitingHeartbeat;
        }
        self.bus.ensure_tenant_log(&tenant).await;

        if let Err(e) = self.save().await {
            warn!("failed to save sessions after registration: {e}");
        }
        info!("registered device {device_id} for tenant {tenant}");
        Ok((device_id, cred))
    }

    /// Heartbeat ou status : liveness et last-seen mis à jour d'un bloc,
    /// sous le write lock. Une seq périmée est jetée sans toucher l'état.
    pub async fn handle_heartbeat(&self, msg: HeartbeatMsg) {
        let now = OffsetDateTime::now_utc();
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(&msg.device_id) else {
            debug!("heartbeat from unknown device {}", msg.device_id);
            return;
        };
        if session.state == SessionState::Decommissioned {
            debug!("heartbeat from decommissioned device {}, ignored", msg.device_id);
            return;
        }
        if msg.seq <= session.last_seq {
            debug!(
                "stale heartbeat seq {} <= {} from {}, discarded",
                msg.seq, session.last_seq, msg.device_id
            );
            return;
        }
        session.last_seq = msg.seq;
        session.last_seen = now;
        if let Some(h) = msg.hostname {
            session.hostname = Some(h);
        }
        if let Some(s) = msg.status {
            session.last_status = Some(s);
        }
        if session.state != SessionState::Online {
            info!("device {} is online", msg.device_id);
            session.state = SessionState::Online;
        }
    }

    /// Réserve la seq suivante dans le domaine de séquence de la session.
    /// Les audits ingérés sans seq explicite passent par ici : leur rang
    /// reste comparable aux snapshots MQTT du même device, là où un seq
    /// dérivé de l'horloge affamerait définitivement le flux agent.
    pub async fn allocate_seq(&self, device_id: &str) -> Result<u64, CoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(device_id)
            .ok_or_else(|| CoreError::Schema(format!("unknown device '{device_id}'")))?;
        session.last_seq += 1;
        Ok(session.last_seq)
    }

    /// Sweep périodique : bascule offline les devices dont la fenêtre de
    /// liveness a expiré. Retourne les devices basculés.
    pub async fn sweep(&self) -> Vec<String> {
        let cutoff = OffsetDateTime::now_utc() - self.liveness_window;
        let mut flipped = Vec::new();
        let mut sessions = self.sessions.write().await;
        for (id, session) in sessions.iter_mut() {
            if session.state == SessionState::Online && session.last_seen < cutoff {
                session.state = SessionState::Offline;
                flipped.push(id.clone());
            }
        }
        drop(sessions);
        for id in &flipped {
            info!("device {id} went offline (liveness window lapsed)");
        }
        flipped
    }

    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let flipped = registry.sweep().await;
                if !flipped.is_empty() {
                    if let Err(e) = registry.save().await {
                        warn!("failed to save sessions after sweep: {e}");
                    }
                }
            }
        })
    }

    /// Décommission : révocation des credentials du device, état terminal.
    pub async fn decommission(&self, device_id: &str) -> Result<(), CoreError> {
        let tenant = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(device_id).ok_or_else(|| {
                CoreError::Authorization(format!("unknown device '{device_id}'"))
            })?;
            session.state = SessionState::Decommissioned;
            session.tenant.clone()
        };
        self.bus.credentials().revoke_device(&tenant, device_id);
        self.directory.remove_device(device_id);
        if let Err(e) = self.save().await {
            warn!("failed to save sessions after decommission: {e}");
        }
        info!("decommissioned device {device_id}");
        Ok(())
    }

    /// Publie une commande corrélée et attend la réponse dans le délai
    /// imparti. Au timeout la corrélation est libérée et la commande
    /// marquée failed, conservée pour retry.
    pub async fn send_command(
        &self,
        device_id: &str,
        command_type: &str,
        parameters: Option<Value>,
    ) -> Result<CommandResponseMsg, CoreError> {
        self.dispatch_command(device_id, command_type, parameters, None).await
    }

    /// Retry manuel d'une commande failed : même sujet, même contenu,
    /// NOUVEAU correlation id.
    pub async fn retry_command(&self, command_id: &str) -> Result<CommandResponseMsg, CoreError> {
        let original = self
            .commands
            .lock()
            .get(command_id)
            .cloned()
            .ok_or_else(|| CoreError::Authorization(format!("unknown command '{command_id}'")))?;
        if original.state != CommandState::Failed {
            return Err(CoreError::Authorization(format!(
                "command '{command_id}' is not failed, nothing to retry"
            )));
        }
        self.dispatch_command(
            &original.device_id,
            &original.command_type,
            original.parameters.clone(),
            Some(command_id.to_string()),
        )
        .await
    }

    async fn dispatch_command(
        &self,
        device_id: &str,
        command_type: &str,
        parameters: Option<Value>,
        retried_from: Option<String>,
    ) -> Result<CommandResponseMsg, CoreError> {
        let tenant = {
            let sessions = self.sessions.read().await;
            let session = sessions.get(device_id).ok_or_else(|| {
                CoreError::Authorization(format!("unknown device '{device_id}'"))
            })?;
            if session.state == SessionState::Decommissioned {
                return Err(CoreError::Authorization(format!(
                    "device '{device_id}' is decommissioned"
                )));
            }
            session.tenant.clone()
        };

        let command_id = Uuid::new_v4().to_string();
        let now = OffsetDateTime::now_utc();
        let msg = CommandMsg {
            command_id: command_id.clone(),
            device_id: device_id.to_string(),
            command_type: command_type.to_string(),
            parameters: parameters.clone(),
            timeout_seconds: self.command_timeout.as_secs(),
            timestamp: now
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default(),
        };

        self.commands.lock().insert(
            command_id.clone(),
            CommandRecord {
                command_id: command_id.clone(),
                device_id: device_id.to_string(),
                command_type: command_type.to_string(),
                parameters,
                state: CommandState::Pending,
                issued_at: now,
                failure_reason: None,
                response: None,
                retried_from,
            },
        );

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(command_id.clone(), tx);

        let subject = Subject::device(&tenant, device_id, MessageType::Command);
        let payload = serde_json::to_vec(&msg)?;
        if let Err(e) = self.bus.publish(&self.service_token, &subject, &payload) {
            self.pending.lock().remove(&command_id);
            self.fail_command(&command_id, &format!("publish failed: {e}"));
            return Err(e);
        }
        debug!("sent command {command_id} ({command_type}) to {device_id}");

        match timeout(self.command_timeout, rx).await {
            Ok(Ok(response)) => {
                let mut commands = self.commands.lock();
                if let Some(record) = commands.get_mut(&command_id) {
                    record.state = if response.status == "error" {
                        record.failure_reason = response.error_message.clone();
                        CommandState::Failed
                    } else {
                        CommandState::Completed
                    };
                    record.response = Some(response.clone());
                }
                Ok(response)
            }
            Ok(Err(_)) => {
                // Sender lâché sans réponse : traité comme un timeout.
                self.fail_command(&command_id, "correlation channel closed");
                Err(CoreError::Timeout(format!("command {command_id} to {device_id}")))
            }
            Err(_) => {
                self.pending.lock().remove(&command_id);
                self.fail_command(&command_id, "no response within timeout");
                warn!("command {command_id} to {device_id} timed out, kept for retry");
                Err(CoreError::Timeout(format!("command {command_id} to {device_id}")))
            }
        }
    }

    fn fail_command(&self, command_id: &str, reason: &str) {
        if let Some(record) = self.commands.lock().get_mut(command_id) {
            record.state = CommandState::Failed;
            record.failure_reason = Some(reason.to_string());
        }
    }

    /// Route une réponse corrélée vers son waiter. Une réponse arrivée
    /// après le timeout est loggée, jamais appliquée.
    pub fn handle_response(&self, response: CommandResponseMsg) {
        let Some(sender) = self.pending.lock().remove(&response.command_id) else {
            warn!(
                "late or unknown response for command {}, dropped",
                response.command_id
            );
            return;
        };
        if sender.send(response).is_err() {
            debug!("command waiter already gone");
        }
    }

    pub fn command(&self, command_id: &str) -> Option<CommandRecord> {
        self.commands.lock().get(command_id).cloned()
    }

    pub fn failed_commands(&self) -> Vec<CommandRecord> {
        self.commands
            .lock()
            .values()
            .filter(|c| c.state == CommandState::Failed)
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn get(&self, device_id: &str) -> Option<DeviceSession> {
        self.sessions.read().await.get(device_id).cloned()
    }

    pub async fn view(&self, device_id: &str) -> Option<DeviceView> {
        let session = self.get(device_id).await?;
        Some(self.to_view(session))
    }

    pub async fn list_views(&self) -> Vec<DeviceView> {
        let sessions = self.sessions.read().await.clone();
        let mut views: Vec<DeviceView> =
            sessions.into_values().map(|s| self.to_view(s)).collect();
        views.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        views
    }

    fn to_view(&self, session: DeviceSession) -> DeviceView {
        let membership = self.directory.membership(&session.device_id);
        let since = OffsetDateTime::now_utc() - session.last_seen;
        DeviceView {
            device_id: session.device_id,
            tenant: session.tenant,
            org: membership.as_ref().map(|m| m.org.clone()),
            group: membership.map(|m| m.group),
            hostname: session.hostname,
            state: session.state,
            last_seen: session
                .last_seen
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default(),
            seconds_since_seen: since.whole_seconds(),
            last_status: session.last_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryTransport;
    use crate::config::LogLimits;
    use crate::tenants::CredentialStore;

    async fn setup(command_timeout_secs: u64) -> (Arc<MemoryTransport>, DeviceRegistry, tempfile::TempDir) {
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
            bus,
            directory,
            service.token,
            dir.path(),
            60,
            command_timeout_secs,
        );
        (transport, registry, dir)
    }

    fn membership() -> Membership {
        Membership { tenant: "acme".into(), org: "ops".into(), group: "paris".into() }
    }

    fn heartbeat(device: &str, seq: u64) -> HeartbeatMsg {
        HeartbeatMsg {
            device_id: device.into(),
            seq,
            hostname: Some("box-1".into()),
            status: Some("ok".into()),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_register_then_heartbeat_goes_online() {
        let (_t, registry, _dir) = setup(5).await;
        let (device_id, cred) = registry
            .register_device(Some("dev-1".into()), membership(), None)
            .await
            .unwrap();
        assert_eq!(device_id, "dev-1");
        assert!(matches!(cred.scope, Scope::Device { .. }));
        assert_eq!(registry.get("dev-1").await.unwrap().state, SessionState::AwaitingHeartbeat);

        registry.handle_heartbeat(heartbeat("dev-1", 1)).await;
        let session = registry.get("dev-1").await.unwrap();
        assert_eq!(session.state, SessionState::Online);
        assert_eq!(session.last_seq, 1);
        assert_eq!(session.hostname.as_deref(), Some("box-1"));
    }

    #[tokio::test]
    async fn test_unprovisioned_tenant_cannot_register() {
        let (_t, registry, _dir) = setup(5).await;
        let ghost = Membership { tenant: "ghost".into(), org: "o".into(), group: "g".into() };
        assert!(registry.register_device(None, ghost, None).await.is_err());
    }

    #[tokio::test]
    async fn test_stale_seq_discarded_without_state_change() {
        let (_t, registry, _dir) = setup(5).await;
        registry.register_device(Some("dev-1".into()), membership(), None).await.unwrap();
        registry.handle_heartbeat(heartbeat("dev-1", 5)).await;
        let seen_before = registry.get("dev-1").await.unwrap().last_seen;

        registry.handle_heartbeat(heartbeat("dev-1", 3)).await;
        let session = registry.get("dev-1").await.unwrap();
        assert_eq!(session.last_seq, 5);
        assert_eq!(session.last_seen, seen_before);
        assert_eq!(session.state, SessionState::Online);
    }

    #[tokio::test]
    async fn test_allocate_seq_follows_session_counter() {
        let (_t, registry, _dir) = setup(5).await;
        registry.register_device(Some("dev-1".into()), membership(), None).await.unwrap();
        registry.handle_heartbeat(heartbeat("dev-1", 4)).await;

        // Deux allocations consécutives : seqs distincts, dans le domaine
        // de la session, jamais dérivés de l'horloge.
        assert_eq!(registry.allocate_seq("dev-1").await.unwrap(), 5);
        assert_eq!(registry.allocate_seq("dev-1").await.unwrap(), 6);
        assert!(registry.allocate_seq("dev-9").await.is_err());

        // Le flux agent rattrape le compteur au lieu de s'affamer.
        registry.handle_heartbeat(heartbeat("dev-1", 7)).await;
        assert_eq!(registry.get("dev-1").await.unwrap().last_seq, 7);
    }

    #[tokio::test]
    async fn test_sweep_flips_online_to_offline() {
        let (_t, registry, _dir) = setup(5).await;
        let registry = DeviceRegistry {
            // Fenêtre nulle : tout online est immédiatement balayable.
            liveness_window: time::Duration::seconds(0),
            ..registry
        };
        registry.register_device(Some("dev-1".into()), membership(), None).await.unwrap();
        registry.handle_heartbeat(heartbeat("dev-1", 1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let flipped = registry.sweep().await;
        assert_eq!(flipped, vec!["dev-1".to_string()]);
        assert_eq!(registry.get("dev-1").await.unwrap().state, SessionState::Offline);

        // offline -> online sur le heartbeat suivant.
        registry.handle_heartbeat(heartbeat("dev-1", 2)).await;
        assert_eq!(registry.get("dev-1").await.unwrap().state, SessionState::Online);
    }

    #[tokio::test]
    async fn test_decommission_is_terminal_and_revokes() {
        let (_t, registry, _dir) = setup(5).await;
        let (_, cred) = registry
            .register_device(Some("dev-1".into()), membership(), None)
            .await
            .unwrap();
        registry.decommission("dev-1").await.unwrap();

        assert_eq!(registry.get("dev-1").await.unwrap().state, SessionState::Decommissioned);
        assert!(registry.bus.credentials().check(&cred.token).is_err());

        // Heartbeat ignoré, pas de résurrection.
        registry.handle_heartbeat(heartbeat("dev-1", 1)).await;
        assert_eq!(registry.get("dev-1").await.unwrap().state, SessionState::Decommissioned);

        // Ré-enregistrement refusé.
        assert!(registry
            .register_device(Some("dev-1".into()), membership(), None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_command_roundtrip() {
        let (transport, registry, _dir) = setup(5).await;
        registry.register_device(Some("dev-1".into()), membership(), None).await.unwrap();

        let responder = registry.clone();
        let transport_clone = transport.clone();
        let task = tokio::spawn(async move {
            // Laisse la commande partir, puis répond comme un device.
            tokio::time::sleep(Duration::from_millis(50)).await;
            let published = transport_clone.published();
            let cmd: serde_json::Value =
                serde_json::from_slice(&published.last().unwrap().payload).unwrap();
            responder.handle_response(CommandResponseMsg {
                command_id: cmd["command_id"].as_str().unwrap().to_string(),
                device_id: "dev-1".into(),
                status: "success".into(),
                result: Some(serde_json::json!({"rc": 0})),
                error_message: None,
            });
        });

        let response = registry.send_command("dev-1", "reboot", None).await.unwrap();
        assert_eq!(response.status, "success");
        task.await.unwrap();

        let published = transport.published();
        assert!(published
            .iter()
            .any(|m| m.subject == "tenant.acme.device.dev-1.command"));
    }

    #[tokio::test]
    async fn test_command_timeout_kept_for_retry() {
        let (transport, registry, _dir) = setup(1).await;
        registry.register_device(Some("dev-1".into()), membership(), None).await.unwrap();

        let err = registry.send_command("dev-1", "reboot", None).await;
        assert!(matches!(err, Err(CoreError::Timeout(_))));

        let failed = registry.failed_commands();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failure_reason.as_deref(), Some("no response within timeout"));
        // La corrélation est libérée au timeout.
        assert!(registry.pending.lock().is_empty());

        // Retry : même sujet, nouveau correlation id.
        let first_id = failed[0].command_id.clone();
        let retry = registry.retry_command(&first_id).await;
        assert!(retry.is_err());

        let commands: Vec<String> = transport
            .published()
            .iter()
            .map(|m| {
                let v: serde_json::Value = serde_json::from_slice(&m.payload).unwrap();
                v["command_id"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(commands.len(), 2);
        assert_ne!(commands[0], commands[1]);

        let second = registry
            .commands
            .lock()
            .values()
            .find(|c| c.retried_from.as_deref() == Some(first_id.as_str()))
            .cloned()
            .unwrap();
        assert_eq!(second.state, CommandState::Failed);
    }

    #[tokio::test]
    async fn test_late_response_is_dropped() {
        let (_t, registry, _dir) = setup(1).await;
        registry.register_device(Some("dev-1".into()), membership(), None).await.unwrap();
        let _ = registry.send_command("dev-1", "reboot", None).await;
        let failed = registry.failed_commands();

        // La réponse arrive trop tard : l'état failed ne bouge plus.
        registry.handle_response(CommandResponseMsg {
            command_id: failed[0].command_id.clone(),
            device_id: "dev-1".into(),
            status: "success".into(),
            result: None,
            error_message: None,
        });
        assert_eq!(
            registry.command(&failed[0].command_id).unwrap().state,
            CommandState::Failed
        );
    }

    #[tokio::test]
    async fn test_save_load_roundtrip_resets_online() {
        let (_t, registry, dir) = setup(5).await;
        registry.register_device(Some("dev-1".into()), membership(), None).await.unwrap();
        registry.handle_heartbeat(heartbeat("dev-1", 1)).await;
        registry.save().await.unwrap();

        let (_t2, fresh, _dir2) = setup(5).await;
        let fresh = DeviceRegistry {
            data_file: dir.path().join("sessions.json"),
            ..fresh
        };
        fresh.load().await.unwrap();
        // online ne survit pas au redémarrage, offline en attendant un heartbeat.
        assert_eq!(fresh.get("dev-1").await.unwrap().state, SessionState::Offline);
    }
}
