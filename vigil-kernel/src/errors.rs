use thiserror::Error;

/// Erreurs du cœur Vigil. Chaque variante a sa politique de retry :
/// transport et timeout se retentent localement avec backoff,
/// autorisation et schéma ne se retentent jamais automatiquement.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Sujet hors du préfixe accordé au credential. Refusé, loggé, jamais retenté.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// Connexion transport perdue ou publish refusé par le broker.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Payload de télémétrie malformé. L'entrée passe en `failed`, visible opérateur.
    #[error("schema violation: {0}")]
    Schema(String),

    /// Échec de diff/merge contre la baseline. La baseline reste intacte.
    #[error("consolidation failed: {0}")]
    Consolidation(String),

    /// Corrélation commande/réponse expirée. La commande passe en `failed`,
    /// éligible au retry manuel.
    #[error("timed out waiting for {0}")]
    Timeout(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Schema(format!("invalid JSON: {e}"))
    }
}

impl From<rumqttc::ClientError> for CoreError {
    fn from(e: rumqttc::ClientError) -> Self {
        CoreError::Transport(e.to_string())
    }
}
