/**
 * DURABLE LOG - Journal borné par tenant pour le replay
 *
 * RÔLE :
 * Un journal durable par namespace tenant (descripteur TENANT_{id}_DEVICES,
 * filtre tenant.{id}.device.>) pour qu'un device déconnecté rejoue les
 * messages manqués au retour.
 *
 * BORNES :
 * Nombre max de messages ET âge max de rétention, indépendants.
 * La première borne atteinte tronque côté ancien : le last-write survit.
 *
 * PERSISTANCE :
 * JSON dans data_dir, un fichier par tenant, rechargé au boot.
 */

use crate::config::LogLimits;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDescriptor {
    pub name: String,
    pub subject_filter: String,
    pub max_messages: usize,
    pub max_age_secs: u64,
}

impl LogDescriptor {
    pub fn for_tenant(tenant: &str, limits: LogLimits) -> Self {
        Self {
            name: format!("TENANT_{tenant}_DEVICES"),
            subject_filter: format!("tenant.{tenant}.device.>"),
            max_messages: limits.max_messages,
            max_age_secs: limits.max_age_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub subject: String,
    pub payload: Vec<u8>,
    #[serde(with = "time::serde::rfc3339")]
    pub logged_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableLog {
    pub descriptor: LogDescriptor,
    entries: VecDeque<LogEntry>,
    next_seq: u64,
}

impl DurableLog {
    pub fn new(descriptor: LogDescriptor) -> Self {
        Self { descriptor, entries: VecDeque::new(), next_seq: 1 }
    }

    /// Ajoute une entrée et applique les bornes. Retourne la séquence assignée.
    pub fn append(&mut self, subject: &str, payload: Vec<u8>) -> u64 {
        self.append_at(subject, payload, OffsetDateTime::now_utc())
    }

    pub(crate) fn append_at(&mut self, subject: &str, payload: Vec<u8>, at: OffsetDateTime) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(LogEntry {
            seq,
            subject: subject.to_string(),
            payload,
            logged_at: at,
        });
        self.enforce_bounds(at);
        seq
    }

    /// Tronque côté ancien tant qu'une borne est dépassée.
    pub fn enforce_bounds(&mut self, now: OffsetDateTime) {
        while self.entries.len() > self.descriptor.max_messages {
            self.entries.pop_front();
        }
        let max_age = Duration::seconds(self.descriptor.max_age_secs as i64);
        while let Some(front) = self.entries.front() {
            if now - front.logged_at > max_age {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Entrées strictement après `seq`, dans l'ordre d'écriture.
    pub fn replay_since(&self, seq: u64) -> Vec<LogEntry> {
        self.entries.iter().filter(|e| e.seq > seq).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first_seq(&self) -> Option<u64> {
        self.entries.front().map(|e| e.seq)
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.entries.back().map(|e| e.seq)
    }

    fn file_name(&self) -> String {
        format!("{}.json", self.descriptor.name)
    }

    /// Sauvegarde JSON du journal complet (pattern agents.json).
    pub async fn save(&self, dir: &Path) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        fs::write(dir.join(self.file_name()), content).await
    }

    pub async fn load(dir: &Path, descriptor: LogDescriptor) -> Self {
        let path: PathBuf = dir.join(format!("{}.json", descriptor.name));
        if !path.exists() {
            return Self::new(descriptor);
        }
        match fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<DurableLog>(&content) {
                Ok(mut log) => {
                    // Le descripteur courant prime (les bornes ont pu changer en config).
                    log.descriptor = descriptor;
                    log.enforce_bounds(OffsetDateTime::now_utc());
                    info!("loaded durable log {} ({} entries)", log.descriptor.name, log.len());
                    log
                }
                Err(e) => {
                    warn!("corrupt durable log at {path:?}: {e}, starting fresh");
                    Self::new(descriptor)
                }
            },
            Err(e) => {
                warn!("failed to read durable log at {path:?}: {e}, starting fresh");
                Self::new(descriptor)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_messages: usize, max_age_secs: u64) -> LogLimits {
        LogLimits { max_messages, max_age_secs }
    }

    #[test]
    fn test_descriptor_naming() {
        let d = LogDescriptor::for_tenant("acme", limits(100, 60));
        assert_eq!(d.name, "TENANT_acme_DEVICES");
        assert_eq!(d.subject_filter, "tenant.acme.device.>");
    }

    #[test]
    fn test_count_bound_drops_oldest() {
        let mut log = DurableLog::new(LogDescriptor::for_tenant("t1", limits(3, 3600)));
        for i in 0..5u8 {
            log.append("tenant.t1.device.d.heartbeat", vec![i]);
        }
        assert_eq!(log.len(), 3);
        // Les plus récents survivent.
        assert_eq!(log.first_seq(), Some(3));
        assert_eq!(log.last_seq(), Some(5));
    }

    #[test]
    fn test_age_bound_drops_expired() {
        let mut log = DurableLog::new(LogDescriptor::for_tenant("t1", limits(100, 60)));
        let old = OffsetDateTime::now_utc() - Duration::seconds(120);
        log.append_at("tenant.t1.device.d.heartbeat", vec![1], old);
        log.append_at("tenant.t1.device.d.heartbeat", vec![2], old);
        // Le troisième append à "maintenant" déclenche la purge des expirés.
        log.append("tenant.t1.device.d.heartbeat", vec![3]);
        assert_eq!(log.len(), 1);
        assert_eq!(log.first_seq(), Some(3));
    }

    #[test]
    fn test_first_bound_hit_wins() {
        // Les deux bornes proches : le count tronque d'abord, l'âge ensuite,
        // peu importe l'ordre, le résultat respecte les deux.
        let mut log = DurableLog::new(LogDescriptor::for_tenant("t1", limits(2, 60)));
        let stale = OffsetDateTime::now_utc() - Duration::seconds(90);
        log.append_at("s", vec![1], stale);
        log.append("s", vec![2]);
        log.append("s", vec![3]);
        assert!(log.len() <= 2);
        assert_eq!(log.first_seq(), Some(2));
    }

    #[test]
    fn test_replay_since() {
        let mut log = DurableLog::new(LogDescriptor::for_tenant("t1", limits(10, 3600)));
        for i in 0..4u8 {
            log.append("tenant.t1.device.d.command", vec![i]);
        }
        let replayed = log.replay_since(2);
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].seq, 3);
        assert_eq!(replayed[1].seq, 4);
        assert!(log.replay_since(10).is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = LogDescriptor::for_tenant("t1", limits(10, 3600));
        let mut log = DurableLog::new(descriptor.clone());
        log.append("tenant.t1.device.d.sysinfo", b"{\"x\":1}".to_vec());
        log.append("tenant.t1.device.d.sysinfo", b"{\"x\":2}".to_vec());
        log.save(dir.path()).await.unwrap();

        let loaded = DurableLog::load(dir.path(), descriptor).await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.last_seq(), Some(2));
        assert_eq!(loaded.replay_since(1)[0].payload, b"{\"x\":2}".to_vec());
    }
}
