/*!
# Vigil DevKit - Stubs et Utilitaires pour Développement

Bibliothèque facilitant le développement d'agents et d'outils Vigil avec:
- Stub de bus MQTT pour tests sans broker
- Constructeurs de payloads conformes au protocole devices
- Harness de test complet avec assertions sur les messages
*/

pub mod bus_stub;
pub mod payloads;
pub mod test_utils;

pub use bus_stub::MockBusClient;
pub use payloads::{PayloadBuilder, VigilMessageBuilder};
pub use test_utils::TestHarness;
