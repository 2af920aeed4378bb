//! Device registry: maps raw device identifiers to their plant linkage and
//! answers the online/offline health question from heartbeat age.
//!
//! Resolution of an unknown id is `Ok(None)`, never an error — callers decide
//! whether that means warn-and-drop (ingest) or skip-and-log (scheduler).

use std::time::Duration;

use anyhow::Result;

use crate::db::{now_unix, Db, DeviceRecord};

/// Heartbeats older than this count as offline.
pub const DEFAULT_HEALTH_TIMEOUT_MIN: u64 = 5;

#[derive(Clone)]
pub struct DeviceRegistry {
    db: Db,
    health_timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(db: Db, health_timeout: Duration) -> Self {
        Self { db, health_timeout }
    }

    pub fn with_default_timeout(db: Db) -> Self {
        Self::new(db, Duration::from_secs(DEFAULT_HEALTH_TIMEOUT_MIN * 60))
    }

    pub async fn resolve(&self, raw_id: &str) -> Result<Option<DeviceRecord>> {
        self.db.get_device(raw_id).await
    }

    /// Record a heartbeat. Called once per accepted telemetry message.
    /// Unknown devices are a no-op (provisioning is an external action).
    pub async fn touch(&self, raw_id: &str, ts: i64) -> Result<()> {
        if !self.db.touch_device(raw_id, ts).await? {
            tracing::debug!(device = %raw_id, "touch on unprovisioned device ignored");
        }
        Ok(())
    }

    /// A device is online when its last heartbeat is younger than the
    /// health timeout. No heartbeat yet means offline.
    pub async fn is_online(&self, device_id: &str) -> Result<bool> {
        let Some(device) = self.db.get_device(device_id).await? else {
            return Ok(false);
        };
        Ok(self.record_is_online(&device))
    }

    pub fn record_is_online(&self, device: &DeviceRecord) -> bool {
        match device.last_seen {
            Some(seen) => now_unix() - seen < self.health_timeout.as_secs() as i64,
            None => false,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> DeviceRegistry {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        DeviceRegistry::new(db.clone(), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn resolve_unknown_is_none_not_error() {
        let reg = registry().await;
        assert!(reg.resolve("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn touch_then_online() {
        let reg = registry().await;
        reg.db.upsert_device("dev-1", Some("plant-1")).await.unwrap();

        // Never seen → offline.
        assert!(!reg.is_online("dev-1").await.unwrap());

        reg.touch("dev-1", now_unix()).await.unwrap();
        assert!(reg.is_online("dev-1").await.unwrap());
    }

    #[tokio::test]
    async fn stale_heartbeat_is_offline() {
        let reg = registry().await;
        reg.db.upsert_device("dev-1", None).await.unwrap();
        reg.touch("dev-1", now_unix() - 3600).await.unwrap();

        assert!(!reg.is_online("dev-1").await.unwrap());
    }

    #[tokio::test]
    async fn touch_unknown_device_is_noop() {
        let reg = registry().await;
        reg.touch("ghost", now_unix()).await.unwrap();
        assert!(reg.resolve("ghost").await.unwrap().is_none());
        assert!(!reg.is_online("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_device_is_offline() {
        let reg = registry().await;
        assert!(!reg.is_online("ghost").await.unwrap());
    }
}
