/*!
Constructeurs de payloads conformes au protocole devices

Facilite le développement en fournissant des utilitaires pour:
- Construire des messages heartbeat, telemetry, command et response
- Assembler des payloads libres champ par champ
- Vérifier qu'un payload porte les champs requis par son type
*/

use serde_json::{Map, Value};
use anyhow::Result;

/// Helper pour créer des messages de test conformes au protocole Vigil
pub struct VigilMessageBuilder;

impl VigilMessageBuilder {
    /// Crée un message heartbeat
    pub fn heartbeat<S: Into<String>>(device_id: S, seq: u64, hostname: S, status: S) -> Value {
        serde_json::json!({
            "device_id": device_id.into(),
            "seq": seq,
            "hostname": hostname.into(),
            "status": status.into(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Crée un message telemetry pour une catégorie donnée
    pub fn telemetry<S: Into<String>>(device_id: S, seq: u64, category: S, items: Value) -> Value {
        serde_json::json!({
            "device_id": device_id.into(),
            "seq": seq,
            "ts": chrono::Utc::now().to_rfc3339(),
            "category": category.into(),
            "items": items
        })
    }

    /// Crée un message command tel que le kernel le publie
    pub fn command<S: Into<String>>(
        command_id: S,
        device_id: S,
        command_type: S,
        parameters: Option<Value>,
    ) -> Value {
        serde_json::json!({
            "command_id": command_id.into(),
            "device_id": device_id.into(),
            "command_type": command_type.into(),
            "parameters": parameters,
            "timeout_seconds": 30,
            "timestamp": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Crée une réponse de commande côté device
    pub fn command_response<S: Into<String>>(
        command_id: S,
        device_id: S,
        status: S,
        result: Option<Value>,
    ) -> Value {
        serde_json::json!({
            "command_id": command_id.into(),
            "device_id": device_id.into(),
            "status": status.into(),
            "result": result,
            "error_message": Value::Null
        })
    }

    /// Crée un snapshot de santé du kernel
    pub fn kernel_health(uptime_seconds: u64, devices_tracked: u32, transport_status: &str) -> Value {
        serde_json::json!({
            "uptime_seconds": uptime_seconds,
            "devices_tracked": devices_tracked,
            "scores_tracked": 0,
            "memory_usage_mb": 0.0,
            "transport_status": transport_status,
            "transport_reconnects": 0
        })
    }
}

/// Champs requis par type de message device
pub fn required_fields(kind: &str) -> Vec<&'static str> {
    match kind {
        "heartbeat" => vec!["device_id", "seq"],
        "sysinfo" | "monitoring" => vec!["device_id", "seq", "ts", "category", "items"],
        "command" => vec!["command_id", "device_id", "command_type"],
        "response" => vec!["command_id", "device_id", "status"],
        _ => vec![],
    }
}

/// Vérifie qu'un payload porte tous les champs requis pour son type
pub fn check_payload(kind: &str, payload: &Value) -> Result<()> {
    let obj = payload
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("payload for '{}' is not a JSON object", kind))?;

    for field in required_fields(kind) {
        if !obj.contains_key(field) {
            anyhow::bail!("payload for '{}' is missing required field '{}'", kind, field);
        }
    }
    Ok(())
}

/// Assemblage libre d'un payload avec son topic de destination
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    pub topic: String,
    pub payload: Value,
}

impl PayloadBuilder {
    pub fn new<S: Into<String>>(topic: S) -> Self {
        Self {
            topic: topic.into(),
            payload: Value::Object(Map::new()),
        }
    }

    /// Définit un champ dans le payload
    pub fn set_field<S: Into<String>>(mut self, field: S, value: Value) -> Self {
        if let Value::Object(ref mut obj) = self.payload {
            obj.insert(field.into(), value);
        }
        self
    }

    /// Définit un champ string
    pub fn set_string<S: Into<String>, V: Into<String>>(self, field: S, value: V) -> Self {
        self.set_field(field, Value::String(value.into()))
    }

    /// Définit un champ number
    pub fn set_number<S: Into<String>>(self, field: S, value: f64) -> Self {
        match serde_json::Number::from_f64(value) {
            Some(n) => self.set_field(field, Value::Number(n)),
            None => self,
        }
    }

    /// Définit un champ entier (seq, compteurs)
    pub fn set_u64<S: Into<String>>(self, field: S, value: u64) -> Self {
        self.set_field(field, Value::Number(serde_json::Number::from(value)))
    }

    /// Définit un champ boolean
    pub fn set_bool<S: Into<String>>(self, field: S, value: bool) -> Self {
        self.set_field(field, Value::Bool(value))
    }

    /// Ajoute un timestamp automatiquement (format ISO)
    pub fn with_timestamp(self) -> Self {
        self.set_string("timestamp", chrono::Utc::now().to_rfc3339())
    }

    /// Convertit en bytes JSON pour envoi sur le bus
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.payload)?)
    }
}
