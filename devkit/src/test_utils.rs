/*!
Test Harness pour agents Vigil

Facilite l'écriture de tests pour agents et outils avec:
- Setup automatique du mock de bus
- Assertions sur les messages échangés
- Simulation de trafic device complet (heartbeat, telemetry, command)
*/

use crate::bus_stub::{device_topic, MockBusClient};
use crate::payloads::{check_payload, VigilMessageBuilder};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use anyhow::Result;

/// Harness de test complet pour agents Vigil
pub struct TestHarness {
    pub bus_client: MockBusClient,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl TestHarness {
    /// Crée un nouveau harness de test
    pub fn new() -> Self {
        env_logger::try_init().ok(); // Init logging pour tests

        Self {
            bus_client: MockBusClient::new(),
            expectations: Vec::new(),
        }
    }

    /// Ajoute une expectation: on s'attend à recevoir N messages sur un topic
    pub fn expect_messages(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
        });
        self
    }

    /// Simule l'envoi d'un message device arbitraire, validé contre son type
    pub async fn send_device_message(
        &self,
        tenant: &str,
        device_id: &str,
        kind: &str,
        payload: Value,
    ) -> Result<()> {
        check_payload(kind, &payload)?;
        let topic = device_topic(tenant, device_id, kind);
        let bytes = serde_json::to_vec(&payload)?;
        self.bus_client.simulate_incoming(topic, bytes).await?;
        log::info!("📨 Sent test message: {}/{}", device_id, kind);
        Ok(())
    }

    /// Simule l'envoi d'un heartbeat device
    pub async fn send_heartbeat(&self, tenant: &str, device_id: &str, seq: u64) -> Result<()> {
        let payload = VigilMessageBuilder::heartbeat(device_id, seq, "test-host", "ok");
        self.send_device_message(tenant, device_id, "heartbeat", payload).await?;
        log::info!("💓 Sent heartbeat for device: {}", device_id);
        Ok(())
    }

    /// Simule l'envoi d'un snapshot telemetry
    pub async fn send_telemetry(
        &self,
        tenant: &str,
        device_id: &str,
        seq: u64,
        category: &str,
        items: Value,
    ) -> Result<()> {
        let payload = VigilMessageBuilder::telemetry(device_id, seq, category, items);
        self.send_device_message(tenant, device_id, "sysinfo", payload).await?;
        log::info!("📊 Sent telemetry ({}) for device: {}", category, device_id);
        Ok(())
    }

    /// Simule une commande kernel vers un device
    pub async fn send_command(
        &self,
        tenant: &str,
        device_id: &str,
        command_id: &str,
        command_type: &str,
    ) -> Result<()> {
        let payload = VigilMessageBuilder::command(command_id, device_id, command_type, None);
        self.send_device_message(tenant, device_id, "command", payload).await?;
        log::info!("⚡ Sent command '{}' to device: {}", command_type, device_id);
        Ok(())
    }

    /// Attend et vérifie qu'un message a été publié sur un topic
    pub async fn wait_for_message(&self, topic: &str, timeout_ms: u64) -> Result<Option<Value>> {
        let start = std::time::Instant::now();

        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Some(msg) = self.bus_client.get_last_json_message::<Value>(topic)? {
                log::info!("✅ Received expected message on {}", topic);
                return Ok(Some(msg));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        log::warn!("⏰ Timeout waiting for message on {}", topic);
        Ok(None)
    }

    /// Vérifie toutes les expectations configurées
    pub async fn verify_expectations(&self) -> Result<()> {
        log::info!("🔍 Verifying {} expectations...", self.expectations.len());

        for expectation in &self.expectations {
            let messages = self.bus_client.find_messages_by_topic(&expectation.topic);
            let actual_count = messages.len();

            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for topic '{}': expected {} messages, got {}",
                    expectation.topic, expectation.expected_count, actual_count
                );
            }

            log::info!("✅ Topic '{}': {} messages as expected",
                      expectation.topic, actual_count);
        }

        log::info!("🎉 All expectations verified successfully");
        Ok(())
    }

    /// Assert qu'un message spécifique a été publié
    pub fn assert_message_sent(&self, topic: &str, expected_payload: &Value) -> Result<()> {
        let messages = self.bus_client.find_messages_by_topic(topic);

        for msg in messages {
            let payload: Value = serde_json::from_slice(&msg.payload)?;
            if payload == *expected_payload {
                log::info!("✅ Found expected message on {}", topic);
                return Ok(());
            }
        }

        anyhow::bail!("Expected message not found on topic: {}", topic);
    }

    /// Assert qu'un champ spécifique existe dans le dernier message
    pub fn assert_field_exists(&self, topic: &str, field_path: &str) -> Result<()> {
        if let Some(msg) = self.bus_client.get_last_json_message::<Value>(topic)? {
            if self.get_nested_field(&msg, field_path).is_some() {
                log::info!("✅ Field '{}' exists in {}", field_path, topic);
                return Ok(());
            }
        }

        anyhow::bail!("Field '{}' not found in latest message on {}", field_path, topic);
    }

    /// Assert qu'un champ a une valeur spécifique
    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        if let Some(msg) = self.bus_client.get_last_json_message::<Value>(topic)? {
            if let Some(actual) = self.get_nested_field(&msg, field_path) {
                if actual == expected {
                    log::info!("✅ Field '{}' = {:?} in {}", field_path, expected, topic);
                    return Ok(());
                } else {
                    anyhow::bail!("Field '{}' mismatch: expected {:?}, got {:?}",
                                 field_path, expected, actual);
                }
            }
        }

        anyhow::bail!("Field '{}' not found for comparison in {}", field_path, topic);
    }

    fn get_nested_field<'a>(&self, value: &'a Value, path: &str) -> Option<&'a Value> {
        let parts: Vec<&str> = path.split('.').collect();
        let mut current = value;

        for part in parts {
            match current {
                Value::Object(obj) => {
                    current = obj.get(part)?;
                }
                _ => return None,
            }
        }

        Some(current)
    }

    /// Stats sur les messages collectés
    pub fn get_stats(&self) -> TestStats {
        let messages = self.bus_client.get_published_messages();
        let mut topic_counts = HashMap::new();

        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }

        TestStats {
            total_messages: messages.len(),
            topic_counts,
            subscriptions: self.bus_client.get_subscriptions(),
        }
    }

    /// Exporte les messages capturés en JSON lines (debug de tests)
    pub fn dump_messages<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let messages = self.bus_client.get_published_messages();
        let mut out = String::new();

        for msg in &messages {
            let payload: Value = serde_json::from_slice(&msg.payload)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&msg.payload).to_string()));
            let line = serde_json::json!({
                "topic": msg.topic,
                "payload": payload,
            });
            out.push_str(&serde_json::to_string(&line)?);
            out.push('\n');
        }

        std::fs::write(path.as_ref(), out)?;
        log::info!("💾 Dumped {} messages to {}", messages.len(), path.as_ref().display());
        Ok(messages.len())
    }

    /// Reset le harness pour un nouveau test
    pub fn reset(&mut self) {
        self.bus_client.clear();
        self.expectations.clear();
        log::info!("🧹 Test harness reset");
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
    pub subscriptions: Vec<String>,
}

impl TestStats {
    pub fn print(&self) {
        println!("📊 Test Statistics:");
        println!("  Total messages: {}", self.total_messages);
        println!("  Topics with messages:");
        for (topic, count) in &self.topic_counts {
            println!("    {}: {} messages", topic, count);
        }
        println!("  Subscriptions: {:?}", self.subscriptions);
    }
}

/// Macro pour créer facilement des tests d'agents
#[macro_export]
macro_rules! agent_test {
    ($name:ident, $body:expr) => {
        #[tokio::test]
        async fn $name() {
            use $crate::test_utils::TestHarness;

            let mut harness = TestHarness::new();
            let test_fn: Box<dyn for<'a> Fn(&'a mut TestHarness) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + 'a>>> = Box::new($body);

            match test_fn(&mut harness).await {
                Ok(_) => {
                    harness.get_stats().print();
                    println!("✅ Test '{}' passed", stringify!($name));
                }
                Err(e) => {
                    eprintln!("❌ Test '{}' failed: {}", stringify!($name), e);
                    panic!("Test failed: {}", e);
                }
            }
        }
    };
}
