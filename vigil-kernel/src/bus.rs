/**
 * TENANT BUS - Transport publish/subscribe scoped par tenant
 *
 * RÔLE :
 * Enveloppe un transport pub/sub (MQTT en production, mémoire en test)
 * derrière l'autorité des sujets : chaque publish/subscribe passe par le
 * credential de l'appelant, et tout message device traversant le bus est
 * journalisé dans le log durable de son tenant pour replay.
 *
 * FONCTIONNEMENT :
 * - Trait Transport = couture testable (try_publish/try_subscribe côté rumqttc)
 * - Les sujets canoniques restent pointés ; seule la couche transport
 *   traduit vers les topics MQTT (`.` -> `/`, `>` -> `#`, `*` -> `+`)
 * - Dispatcher : une task consomme le flux entrant et route vers les files
 *   mpsc des abonnements, élaguées quand le consommateur annule
 * - Reconnexion à backoff exponentiel plafonné ; un publish acquitté n'est
 *   jamais re-soumis (at-least-once, les consommateurs dédupliquent par seq)
 */

use crate::config::{BackoffConf, LogLimits, MqttConf};
use crate::durable_log::{DurableLog, LogDescriptor, LogEntry};
use crate::errors::CoreError;
use crate::health::HealthTracker;
use crate::state::{new_map, Shared};
use crate::subjects::{authorize_publish, authorize_subscribe, Subject, SubjectPattern};
use crate::tenants::CredentialStore;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Message brut côté transport, sujet déjà en forme canonique pointée.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// Couture transport. Les impls poussent le flux entrant dans le channel
/// retourné par leur constructeur.
pub trait Transport: Send + Sync {
    fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), CoreError>;
    fn subscribe(&self, pattern: &str) -> Result<(), CoreError>;
}

fn subject_to_topic(subject: &str) -> String {
    subject.replace('.', "/")
}

fn topic_to_subject(topic: &str) -> String {
    topic.replace('/', ".")
}

fn pattern_to_filter(pattern: &str) -> String {
    pattern.replace('.', "/").replace('>', "#").replace('*', "+")
}

/// Backoff exponentiel plafonné, remis à zéro sur succès.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(conf: BackoffConf) -> Self {
        let base = Duration::from_millis(conf.base_ms);
        Self { base, cap: Duration::from_millis(conf.cap_ms), current: base }
    }

    /// Délai à attendre maintenant, puis double pour la prochaine fois.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Transport de production au-dessus de rumqttc.
pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    /// Connecte le client et démarre l'event loop en task de fond.
    /// Les erreurs de poll déclenchent le backoff ; au-delà du plafond de
    /// tentatives le transport est marqué down (les devices paraîtront
    /// offline au sweep suivant) mais la boucle continue d'essayer.
    pub fn connect(
        conf: &MqttConf,
        backoff_conf: BackoffConf,
        tracker: HealthTracker,
    ) -> (Self, mpsc::UnboundedReceiver<RawMessage>) {
        let mut opts = MqttOptions::new("vigil-kernel", &conf.host, conf.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 64);
        let (tx, rx) = mpsc::unbounded_channel();

        let max_attempts = backoff_conf.max_attempts;
        tokio::spawn(async move {
            let mut backoff = Backoff::new(backoff_conf);
            let mut attempts: u32 = 0;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        tracker.mark_transport_connected();
                        backoff.reset();
                        attempts = 0;
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        let msg = RawMessage {
                            subject: topic_to_subject(&p.topic),
                            payload: p.payload.to_vec(),
                        };
                        if tx.send(msg).is_err() {
                            // Dispatcher parti, plus rien à livrer.
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        attempts += 1;
                        tracker.increment_reconnects();
                        if attempts >= max_attempts {
                            tracker.mark_transport_down();
                            error!("transport down after {attempts} attempts: {e}");
                        } else {
                            warn!("transport error (attempt {attempts}): {e}");
                        }
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
            }
        });

        (Self { client }, rx)
    }
}

impl Transport for MqttTransport {
    fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), CoreError> {
        self.client
            .try_publish(subject_to_topic(subject), QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(CoreError::from)
    }

    fn subscribe(&self, pattern: &str) -> Result<(), CoreError> {
        self.client
            .try_subscribe(pattern_to_filter(pattern), QoS::AtLeastOnce)
            .map_err(CoreError::from)
    }
}

/// Transport mémoire pour les tests : tout publish reboucle sur le flux
/// entrant, comme un broker qui écho à ses abonnés.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<RawMessage>,
    published: Shared<Vec<RawMessage>>,
    filters: Shared<Vec<String>>,
}

impl MemoryTransport {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<RawMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            tx,
            published: crate::state::new_state(Vec::new()),
            filters: crate::state::new_state(Vec::new()),
        });
        (transport, rx)
    }

    /// Simule un message arrivant de l'extérieur (un device sur le broker).
    pub fn inject(&self, subject: &str, payload: Vec<u8>) {
        let _ = self.tx.send(RawMessage { subject: subject.to_string(), payload });
    }

    pub fn published(&self) -> Vec<RawMessage> {
        self.published.lock().clone()
    }

    pub fn filters(&self) -> Vec<String> {
        self.filters.lock().clone()
    }
}

impl Transport for MemoryTransport {
    fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), CoreError> {
        let msg = RawMessage { subject: subject.to_string(), payload: payload.to_vec() };
        self.published.lock().push(msg.clone());
        self.tx
            .send(msg)
            .map_err(|_| CoreError::Transport("memory transport closed".into()))
    }

    fn subscribe(&self, pattern: &str) -> Result<(), CoreError> {
        self.filters.lock().push(pattern.to_string());
        Ok(())
    }
}

/// Message livré à un abonnement du bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: Subject,
    pub raw_subject: String,
    pub payload: Vec<u8>,
    /// Séquence dans le log durable du tenant, pour les sujets device.
    pub log_seq: Option<u64>,
}

struct SubEntry {
    pattern: SubjectPattern,
    sender: mpsc::UnboundedSender<BusMessage>,
}

/// Abonnement actif : séquence paresseuse de messages jusqu'à annulation.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<BusMessage>,
    subs: Shared<HashMap<u64, SubEntry>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Arrêt explicite : plus aucun message ne sera produit.
    pub fn cancel(&mut self) {
        self.subs.lock().remove(&self.id);
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subs.lock().remove(&self.id);
    }
}

pub struct TenantBus {
    transport: Arc<dyn Transport>,
    creds: CredentialStore,
    logs: Shared<HashMap<String, DurableLog>>,
    limits: LogLimits,
    data_dir: PathBuf,
    subs: Shared<HashMap<u64, SubEntry>>,
    next_sub: AtomicU64,
}

impl TenantBus {
    pub fn new(
        transport: Arc<dyn Transport>,
        creds: CredentialStore,
        limits: LogLimits,
        data_dir: impl Into<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            creds,
            logs: new_map(),
            limits,
            data_dir: data_dir.into(),
            subs: new_map(),
            next_sub: AtomicU64::new(1),
        })
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.creds
    }

    /// Crée (ou recharge depuis disque) le log durable d'un tenant.
    pub async fn ensure_tenant_log(&self, tenant: &str) {
        if self.logs.lock().contains_key(tenant) {
            return;
        }
        let descriptor = LogDescriptor::for_tenant(tenant, self.limits);
        let log = DurableLog::load(&self.data_dir, descriptor).await;
        self.logs.lock().entry(tenant.to_string()).or_insert(log);
    }

    /// Publish autorisé : retourne une fois accepté par le transport,
    /// sinon échoue en erreur transport. Jamais re-soumis après coup.
    pub fn publish(&self, token: &str, subject: &Subject, payload: &[u8]) -> Result<(), CoreError> {
        let cred = self.creds.check(token)?;
        authorize_publish(&cred.scope, subject)?;
        self.transport.publish(&subject.to_string(), payload)
    }

    /// Abonnement autorisé : rend une file non bornée de messages,
    /// consommée jusqu'à `cancel()` (ou drop).
    pub fn subscribe(&self, token: &str, pattern: &str) -> Result<Subscription, CoreError> {
        let cred = self.creds.check(token)?;
        let pattern = SubjectPattern::parse(pattern)?;
        authorize_subscribe(&cred.scope, &pattern)?;
        self.transport.subscribe(pattern.as_str())?;

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_sub.fetch_add(1, Ordering::Relaxed);
        self.subs.lock().insert(id, SubEntry { pattern, sender: tx });
        Ok(Subscription { id, rx, subs: self.subs.clone() })
    }

    /// Rejoue le log durable d'un tenant après `seq`, scope vérifié.
    pub fn replay_since(&self, token: &str, tenant: &str, seq: u64) -> Result<Vec<LogEntry>, CoreError> {
        let cred = self.creds.check(token)?;
        // Un replay est une lecture du namespace du tenant : mêmes règles
        // qu'un abonnement sur tenant.<id>.device.>.
        let pattern = SubjectPattern::parse(&format!("tenant.{tenant}.device.>"))?;
        authorize_subscribe(&cred.scope, &pattern)?;
        Ok(self
            .logs
            .lock()
            .get(tenant)
            .map(|l| l.replay_since(seq))
            .unwrap_or_default())
    }

    /// Task de routage : consomme le flux transport, journalise les sujets
    /// device dans le log du tenant, livre aux abonnements qui matchent.
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        mut incoming: mpsc::UnboundedReceiver<RawMessage>,
    ) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = incoming.recv().await {
                bus.dispatch(msg);
            }
            debug!("bus dispatcher stopped");
        })
    }

    fn dispatch(&self, msg: RawMessage) {
        let subject = match Subject::parse(&msg.subject) {
            Ok(s) => s,
            Err(e) => {
                warn!("dropping message on unparseable subject '{}': {e}", msg.subject);
                return;
            }
        };

        // Le flux broker est hors de portée des checks publish() : un sujet
        // device n'est accepté que si le device détient un credential actif
        // lié à ce tenant. Sinon le message n'atteint ni le log ni les abonnés.
        let log_seq = match &subject {
            Subject::Device { tenant, device, .. } => {
                if !self.creds.device_active(tenant, device) {
                    warn!(
                        "dropping message on '{}': device '{device}' holds no active credential for tenant '{tenant}'",
                        msg.subject
                    );
                    return;
                }
                Some(self.append_to_log(tenant, &msg))
            }
            _ => None,
        };

        let bus_msg = BusMessage {
            subject,
            raw_subject: msg.subject,
            payload: msg.payload,
            log_seq,
        };

        let mut subs = self.subs.lock();
        subs.retain(|_, entry| {
            if entry.pattern.matches(&bus_msg.raw_subject) {
                entry.sender.send(bus_msg.clone()).is_ok()
            } else {
                !entry.sender.is_closed()
            }
        });
    }

    fn append_to_log(&self, tenant: &str, msg: &RawMessage) -> u64 {
        let mut logs = self.logs.lock();
        let log = logs
            .entry(tenant.to_string())
            .or_insert_with(|| DurableLog::new(LogDescriptor::for_tenant(tenant, self.limits)));
        log.append(&msg.subject, msg.payload.clone())
    }

    /// Sauvegarde tous les logs durables (appelée par la task périodique).
    pub async fn save_logs(&self) {
        let snapshot: Vec<DurableLog> = self.logs.lock().values().cloned().collect();
        for log in snapshot {
            if let Err(e) = log.save(&self.data_dir).await {
                warn!("failed to save durable log {}: {e}", log.descriptor.name);
            }
        }
    }

    /// Sauvegarde périodique, même cadence que la persistance des sessions.
    pub fn spawn_log_saver(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                bus.save_logs().await;
            }
        })
    }
}
