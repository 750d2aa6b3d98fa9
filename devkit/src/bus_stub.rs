/*!
Mock du bus MQTT pour développement sans broker

Permet de développer et tester des agents sans démarrer un broker MQTT réel.
Enregistre tous les messages publiés et permet de simuler la réception.
*/

use rumqttc::QoS;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use anyhow::Result;

/// Topic agent pour un message device (forme transport, séparateur `/`)
pub fn device_topic(tenant: &str, device_id: &str, kind: &str) -> String {
    format!("tenant/{}/device/{}/{}", tenant, device_id, kind)
}

/// Topic de santé du kernel
pub fn kernel_health_topic() -> String {
    "admin/health/kernel".to_string()
}

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock de client bus qui simule rumqttc::AsyncClient
#[derive(Clone)]
pub struct MockBusClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    message_sender: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
}

impl MockBusClient {
    pub fn new() -> Self {
        Self {
            published_messages: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            message_sender: Arc::new(Mutex::new(None)),
        }
    }

    /// Configuration d'un channel pour recevoir les messages simulés
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.message_sender.lock().unwrap() = Some(sender);
        receiver
    }

    /// Simule la publication d'un message (compatible avec AsyncClient)
    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        };

        self.published_messages.lock().unwrap().push(message.clone());

        log::info!("📤 [MOCK] Published to {}: {} bytes", message.topic, message.payload.len());
        Ok(())
    }

    /// Simule l'abonnement à un topic (compatible avec AsyncClient)
    pub async fn subscribe<S: Into<String>>(&self, topic: S, _qos: QoS) -> Result<()> {
        let topic = topic.into();
        self.subscriptions.lock().unwrap().push(topic.clone());
        log::info!("📥 [MOCK] Subscribed to {}", topic);
        Ok(())
    }

    /// Simule la réception d'un message (pour tests)
    pub async fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        };

        if let Some(sender) = self.message_sender.lock().unwrap().as_ref() {
            sender.send(message.clone()).map_err(|e| anyhow::anyhow!("Send error: {}", e))?;
        }

        log::info!("📨 [MOCK] Simulated incoming: {}", message.topic);
        Ok(())
    }

    /// Récupère tous les messages publiés (pour assertions de tests)
    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    /// Récupère les abonnements (pour assertions de tests)
    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Trouve les messages publiés sur un topic donné
    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Trouve les messages publiés sous un tenant donné (tous devices et kinds)
    pub fn find_messages_for_tenant(&self, tenant: &str) -> Vec<MockMessage> {
        let prefix = format!("tenant/{}/", tenant);
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Parse le dernier message d'un topic en JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let messages = self.find_messages_by_topic(topic);
        if let Some(last_msg) = messages.last() {
            let parsed: T = serde_json::from_slice(&last_msg.payload)?;
            Ok(Some(parsed))
        } else {
            Ok(None)
        }
    }

    /// Reset tous les messages enregistrés
    pub fn clear(&self) {
        self.published_messages.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
    }
}

impl Default for MockBusClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio;

    #[tokio::test]
    async fn test_mock_client_publish_subscribe() {
        let client = MockBusClient::new();

        client.subscribe("tenant/acme/device/dev-1/heartbeat", QoS::AtLeastOnce).await.unwrap();
        assert_eq!(client.get_subscriptions(), vec!["tenant/acme/device/dev-1/heartbeat"]);

        let payload = b"test message";
        client
            .publish("tenant/acme/device/dev-1/heartbeat", QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .unwrap();

        let messages = client.get_published_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "tenant/acme/device/dev-1/heartbeat");
        assert_eq!(messages[0].payload, payload);
    }

    #[tokio::test]
    async fn test_json_message_parsing() {
        let client = MockBusClient::new();

        let test_data = serde_json::json!({
            "device_id": "dev-1",
            "seq": 42
        });

        let payload = serde_json::to_vec(&test_data).unwrap();
        client.publish("json/topic", QoS::AtLeastOnce, false, payload).await.unwrap();

        let parsed: Option<serde_json::Value> = client.get_last_json_message("json/topic").unwrap();
        assert!(parsed.is_some());
        assert_eq!(parsed.unwrap()["device_id"], "dev-1");
    }

    #[tokio::test]
    async fn test_tenant_filtering() {
        let client = MockBusClient::new();

        client
            .publish(device_topic("acme", "dev-1", "heartbeat"), QoS::AtLeastOnce, false, b"a".to_vec())
            .await
            .unwrap();
        client
            .publish(device_topic("acme", "dev-2", "sysinfo"), QoS::AtLeastOnce, false, b"b".to_vec())
            .await
            .unwrap();
        client
            .publish(device_topic("globex", "dev-3", "heartbeat"), QoS::AtLeastOnce, false, b"c".to_vec())
            .await
            .unwrap();

        assert_eq!(client.find_messages_for_tenant("acme").len(), 2);
        assert_eq!(client.find_messages_for_tenant("globex").len(), 1);
    }

    #[test]
    fn test_topic_helpers() {
        assert_eq!(device_topic("acme", "dev-1", "command"), "tenant/acme/device/dev-1/command");
        assert_eq!(kernel_health_topic(), "admin/health/kernel");
    }
}
