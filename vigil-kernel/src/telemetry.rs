/**
 * TELEMETRY MODEL - Snapshots typés par catégorie et cycle de vie des entrées
 *
 * RÔLE :
 * Ferme les payloads dynamiques en un jeu de variantes taguées, une par
 * catégorie de données, validées à la frontière du bus avant d'entrer dans
 * le pipeline. Porte aussi la validation du payload d'audit ingéré en HTTP.
 *
 * CLÉS STABLES :
 * Chaque item expose une clé par catégorie (lettre de lecteur, nom
 * d'interface, id+type d'événement...) qui pilote le diff de consolidation.
 */

use crate::errors::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Hardware,
    Storage,
    Network,
    Events,
    Software,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Hardware,
        Category::Storage,
        Category::Network,
        Category::Events,
        Category::Software,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Hardware => "hardware",
            Category::Storage => "storage",
            Category::Network => "network",
            Category::Events => "events",
            Category::Software => "software",
        }
    }
}

/// Clé stable d'un item dans sa catégorie.
pub trait Keyed {
    fn key(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareItem {
    /// Identifiant du composant (ex: cpu0, dimm-1, gpu0).
    pub component: String,
    pub model: String,
    pub status: String,
}

impl Keyed for HardwareItem {
    fn key(&self) -> String {
        self.component.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveItem {
    /// Lettre de lecteur ou point de montage (ex: "C:", "/").
    pub mount: String,
    pub filesystem: String,
    pub total_gb: f64,
    pub free_gb: f64,
}

impl Keyed for DriveItem {
    fn key(&self) -> String {
        self.mount.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceItem {
    pub name: String,
    pub mac: String,
    pub ip: String,
    pub up: bool,
}

impl Keyed for InterfaceItem {
    fn key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventItem {
    pub event_id: u32,
    pub event_type: String,
    pub source: String,
    pub count: u32,
}

impl Keyed for EventItem {
    // La clé combine id et type : deux sources peuvent partager un id.
    fn key(&self) -> String {
        format!("{}:{}", self.event_id, self.event_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageItem {
    pub name: String,
    pub version: String,
    pub publisher: Option<String>,
}

impl Keyed for PackageItem {
    fn key(&self) -> String {
        self.name.clone()
    }
}

/// Snapshot brut d'une catégorie, jeu fermé de variantes taguées.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", content = "items", rename_all = "lowercase")]
pub enum Snapshot {
    Hardware(Vec<HardwareItem>),
    Storage(Vec<DriveItem>),
    Network(Vec<InterfaceItem>),
    Events(Vec<EventItem>),
    Software(Vec<PackageItem>),
}

impl Snapshot {
    pub fn category(&self) -> Category {
        match self {
            Snapshot::Hardware(_) => Category::Hardware,
            Snapshot::Storage(_) => Category::Storage,
            Snapshot::Network(_) => Category::Network,
            Snapshot::Events(_) => Category::Events,
            Snapshot::Software(_) => Category::Software,
        }
    }

    pub fn item_count(&self) -> usize {
        match self {
            Snapshot::Hardware(v) => v.len(),
            Snapshot::Storage(v) => v.len(),
            Snapshot::Network(v) => v.len(),
            Snapshot::Events(v) => v.len(),
            Snapshot::Software(v) => v.len(),
        }
    }
}

/// États du cycle de vie d'une entrée de télémétrie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// En file, pas encore consolidée.
    Pending,
    /// Dépassée par un snapshot plus récent sans avoir été appliquée.
    Processed,
    /// Fondue dans une baseline lors d'un cycle de consolidation.
    Consolidated,
    /// Erreur terminale de parse/diff, raison conservée pour l'opérateur.
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEntry {
    pub id: String,
    pub tenant: String,
    pub device: String,
    pub seq: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
    pub snapshot: Snapshot,
    pub state: EntryState,
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

impl TelemetryEntry {
    pub fn new(tenant: &str, device: &str, seq: u64, snapshot: Snapshot) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant: tenant.to_string(),
            device: device.to_string(),
            seq,
            submitted_at: OffsetDateTime::now_utc(),
            snapshot,
            state: EntryState::Pending,
            failure_reason: None,
            finished_at: None,
        }
    }

    pub fn category(&self) -> Category {
        self.snapshot.category()
    }
}

/// Message télémétrie sur le fil (sujets sysinfo/monitoring).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryMsg {
    pub device_id: String,
    pub seq: u64,
    pub ts: String,
    #[serde(flatten)]
    pub snapshot: Snapshot,
}

/// Payload d'audit accepté par l'endpoint d'ingestion. Le schéma est fixe :
/// device_id et les blocs cpu/memory/disk/network sont obligatoires, les
/// métriques étendues par catégorie sont optionnelles.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditReport {
    pub device_id: String,
    #[serde(default)]
    pub seq: Option<u64>,
    pub cpu: CpuBlock,
    pub memory: MemoryBlock,
    pub disk: Vec<DriveItem>,
    pub network: Vec<InterfaceItem>,
    #[serde(default)]
    pub events: Option<Vec<EventItem>>,
    #[serde(default)]
    pub software: Option<Vec<PackageItem>>,
    /// Objets de métriques étendues, conservés tels quels.
    #[serde(default)]
    pub extended: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CpuBlock {
    pub model: String,
    pub percent: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryBlock {
    pub total_mb: u64,
    pub used_mb: u64,
}

impl AuditReport {
    /// Validation contre le schéma fixe, avec des messages exploitables.
    pub fn validate(value: &Value) -> Result<Self, CoreError> {
        let obj = value
            .as_object()
            .ok_or_else(|| CoreError::Schema("audit payload must be a JSON object".into()))?;
        for field in ["device_id", "cpu", "memory", "disk", "network"] {
            if !obj.contains_key(field) {
                return Err(CoreError::Schema(format!("missing required field '{field}'")));
            }
        }
        let report: AuditReport = serde_json::from_value(value.clone())?;
        if report.device_id.is_empty() {
            return Err(CoreError::Schema("empty device_id".into()));
        }
        Ok(report)
    }

    /// Découpe le rapport en entrées pending, une par catégorie présente.
    /// Sans seq explicite dans le payload, `fallback_seq` s'applique : il
    /// vient du domaine de séquence de la session du device, jamais de
    /// l'horloge, pour rester ordonnable avec la télémétrie MQTT.
    pub fn into_entries(self, tenant: &str, fallback_seq: u64) -> Vec<TelemetryEntry> {
        let seq = self.seq.unwrap_or(fallback_seq);
        let hardware = vec![
            HardwareItem {
                component: "cpu0".into(),
                model: self.cpu.model.clone(),
                status: format!("{:.0}%", self.cpu.percent),
            },
            HardwareItem {
                component: "memory".into(),
                model: format!("{} MB", self.memory.total_mb),
                status: format!("{} MB used", self.memory.used_mb),
            },
        ];

        let mut snapshots = vec![
            Snapshot::Hardware(hardware),
            Snapshot::Storage(self.disk),
            Snapshot::Network(self.network),
        ];
        if let Some(events) = self.events {
            snapshots.push(Snapshot::Events(events));
        }
        if let Some(software) = self.software {
            snapshots.push(Snapshot::Software(software));
        }

        snapshots
            .into_iter()
            .map(|s| TelemetryEntry::new(tenant, &self.device_id, seq, s))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_payload() -> Value {
        json!({
            "device_id": "dev-1",
            "seq": 42,
            "cpu": { "model": "Ryzen 7", "percent": 12.5 },
            "memory": { "total_mb": 32000, "used_mb": 9000 },
            "disk": [
                { "mount": "C:", "filesystem": "ntfs", "total_gb": 512.0, "free_gb": 100.0 }
            ],
            "network": [
                { "name": "eth0", "mac": "aa:bb:cc:dd:ee:ff", "ip": "10.0.0.2", "up": true }
            ],
            "events": [
                { "event_id": 41, "event_type": "error", "source": "disk", "count": 3 }
            ]
        })
    }

    #[test]
    fn test_validate_accepts_full_payload() {
        let report = AuditReport::validate(&full_payload()).unwrap();
        assert_eq!(report.device_id, "dev-1");
        assert_eq!(report.seq, Some(42));
        assert_eq!(report.disk.len(), 1);
    }

    #[test]
    fn test_validate_reports_missing_field() {
        let mut payload = full_payload();
        payload.as_object_mut().unwrap().remove("memory");
        let err = AuditReport::validate(&payload).unwrap_err();
        match err {
            CoreError::Schema(msg) => assert!(msg.contains("memory")),
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_non_object() {
        assert!(AuditReport::validate(&json!([1, 2, 3])).is_err());
        assert!(AuditReport::validate(&json!({"device_id": "", "cpu": {"model": "x", "percent": 0.0},
            "memory": {"total_mb": 1, "used_mb": 1}, "disk": [], "network": []})).is_err());
    }

    #[test]
    fn test_into_entries_one_per_category() {
        let report = AuditReport::validate(&full_payload()).unwrap();
        let entries = report.into_entries("acme", 7);
        let categories: Vec<Category> = entries.iter().map(|e| e.category()).collect();
        assert_eq!(
            categories,
            vec![Category::Hardware, Category::Storage, Category::Network, Category::Events]
        );
        assert!(entries.iter().all(|e| e.state == EntryState::Pending));
        assert!(entries.iter().all(|e| e.seq == 42 && e.tenant == "acme" && e.device == "dev-1"));
    }

    #[test]
    fn test_into_entries_without_seq_uses_fallback() {
        let mut payload = full_payload();
        payload.as_object_mut().unwrap().remove("seq");
        let report = AuditReport::validate(&payload).unwrap();
        let entries = report.into_entries("acme", 9);
        assert!(entries.iter().all(|e| e.seq == 9));
    }

    #[test]
    fn test_telemetry_msg_wire_format() {
        let msg = TelemetryMsg {
            device_id: "dev-1".into(),
            seq: 7,
            ts: "2026-08-30T12:00:00Z".into(),
            snapshot: Snapshot::Storage(vec![DriveItem {
                mount: "C:".into(),
                filesystem: "ntfs".into(),
                total_gb: 512.0,
                free_gb: 42.0,
            }]),
        };
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["category"], "storage");
        assert_eq!(wire["items"][0]["mount"], "C:");
        let back: TelemetryMsg = serde_json::from_value(wire).unwrap();
        assert_eq!(back.snapshot.category(), Category::Storage);
    }

    #[test]
    fn test_event_key_combines_id_and_type() {
        let e = EventItem { event_id: 41, event_type: "error".into(), source: "disk".into(), count: 1 };
        assert_eq!(e.key(), "41:error");
    }
}
