//! Outbound actuation commands. A thin seam over the MQTT client so the
//! scheduler can be driven in tests with a recording fake.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct PumpCommand {
    action: &'static str,
    duration: i64,
}

#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Send a pump-on command with the given run duration in seconds.
    async fn pump_on(&self, device_id: &str, duration_sec: i64) -> Result<()>;
}

/// Build the per-device command topic: `<ns>/device/<id>/command`.
pub fn command_topic(namespace: &str, device_id: &str) -> String {
    format!("{namespace}/device/{device_id}/command")
}

pub struct MqttDispatcher {
    client: AsyncClient,
    namespace: String,
}

impl MqttDispatcher {
    pub fn new(client: AsyncClient, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl CommandDispatcher for MqttDispatcher {
    async fn pump_on(&self, device_id: &str, duration_sec: i64) -> Result<()> {
        let payload = serde_json::to_vec(&PumpCommand {
            action: "pump_on",
            duration: duration_sec,
        })
        .context("failed to encode pump command")?;

        self.client
            .publish(
                command_topic(&self.namespace, device_id),
                QoS::AtLeastOnce,
                false,
                payload,
            )
            .await
            .with_context(|| format!("failed to publish pump command to device '{device_id}'"))?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
