//! Telemetry ingest: parses MQTT publish events, resolves the sending
//! device, persists the reading, and fans it out to in-process observers.
//!
//! Two outcomes are deliberately different: a message whose device id cannot
//! be determined at all is dropped with a single WARN system-log entry (no
//! row is written — malformed telemetry must never fill in history), while a
//! known id whose plant link is missing still persists the reading with a
//! null plant id, because raw telemetry has standalone diagnostic value.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::DateTime;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::db::{now_unix, Db, LogLevel, StoredReading};
use crate::registry::DeviceRegistry;

/// Capacity of the broadcast side-channel used for live-dashboard push.
const NOTIFY_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Inbound telemetry payload. Every field is optional; the device id may
/// instead be embedded in the topic path.
#[derive(Debug, Deserialize)]
pub struct TelemetryMsg {
    #[serde(default, alias = "deviceId")]
    pub device_id: Option<String>,
    /// RFC3339; falls back to receive time when absent or unparseable.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub soil_moisture: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub light: Option<f64>,
    #[serde(default)]
    pub water_level: Option<f64>,
    #[serde(default)]
    pub battery: Option<f64>,
}

// ---------------------------------------------------------------------------
// Device identification
// ---------------------------------------------------------------------------

/// Where a message's device id came from, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceIdSource {
    Payload(String),
    Topic(String),
    Unresolved,
}

impl DeviceIdSource {
    pub fn id(&self) -> Option<&str> {
        match self {
            DeviceIdSource::Payload(id) | DeviceIdSource::Topic(id) => Some(id),
            DeviceIdSource::Unresolved => None,
        }
    }
}

/// Extract a device id from a topic of the form `<ns>/device/<id>/...`.
pub fn extract_device_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    let pos = parts.iter().position(|p| *p == "device")?;
    match parts.get(pos + 1) {
        Some(id) if !id.is_empty() => Some(id),
        _ => None,
    }
}

/// Pure resolution step: prefer an explicit payload field, fall back to the
/// topic path, otherwise `Unresolved`.
pub fn identify_device(msg: &TelemetryMsg, topic: &str) -> DeviceIdSource {
    if let Some(id) = msg.device_id.as_deref().filter(|id| !id.is_empty()) {
        return DeviceIdSource::Payload(id.to_string());
    }
    match extract_device_id(topic) {
        Some(id) => DeviceIdSource::Topic(id.to_string()),
        None => DeviceIdSource::Unresolved,
    }
}

// ---------------------------------------------------------------------------
// Interceptors
// ---------------------------------------------------------------------------

type InterceptorFn = Arc<dyn Fn(&StoredReading) + Send + Sync>;

/// In-process observer list for live-data fan-out. Observers live only for
/// the lifetime of the process; this is not a durable subscription.
#[derive(Clone, Default)]
pub struct Interceptors {
    inner: Arc<InterceptorsInner>,
}

#[derive(Default)]
struct InterceptorsInner {
    callbacks: Mutex<HashMap<u64, InterceptorFn>>,
    next_id: AtomicU64,
}

/// Returned by [`Interceptors::add`]; call [`unsubscribe`] to deregister.
///
/// [`unsubscribe`]: InterceptorHandle::unsubscribe
pub struct InterceptorHandle {
    id: u64,
    set: Interceptors,
}

impl InterceptorHandle {
    pub fn unsubscribe(self) {
        self.set
            .inner
            .callbacks
            .lock()
            .expect("interceptor lock")
            .remove(&self.id);
    }
}

impl Interceptors {
    pub fn add(&self, callback: impl Fn(&StoredReading) + Send + Sync + 'static) -> InterceptorHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .callbacks
            .lock()
            .expect("interceptor lock")
            .insert(id, Arc::new(callback));
        InterceptorHandle {
            id,
            set: self.clone(),
        }
    }

    pub fn clear_all(&self) {
        self.inner.callbacks.lock().expect("interceptor lock").clear();
    }

    pub fn count(&self) -> usize {
        self.inner.callbacks.lock().expect("interceptor lock").len()
    }

    /// Invoke every registered callback with the reading. Callbacks are
    /// snapshotted first so none runs under the lock, and each runs under
    /// the isolation policy below.
    pub(crate) fn invoke_all(&self, reading: &StoredReading) {
        let snapshot: Vec<(u64, InterceptorFn)> = {
            let guard = self.inner.callbacks.lock().expect("interceptor lock");
            guard.iter().map(|(id, cb)| (*id, Arc::clone(cb))).collect()
        };
        for (id, cb) in snapshot {
            invoke_isolated(id, &cb, reading);
        }
    }
}

/// Isolation policy: a panicking observer is logged and swallowed. It must
/// never abort the persistence path or starve later observers.
fn invoke_isolated(id: u64, cb: &InterceptorFn, reading: &StoredReading) {
    if catch_unwind(AssertUnwindSafe(|| cb(reading))).is_err() {
        warn!(interceptor = id, device = %reading.device_id, "interceptor panicked; continuing");
    }
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored,
    DroppedBadJson,
    DroppedNoDevice,
}

pub struct Ingestor {
    db: Db,
    registry: DeviceRegistry,
    interceptors: Interceptors,
    notifier: broadcast::Sender<StoredReading>,
}

impl Ingestor {
    pub fn new(db: Db, registry: DeviceRegistry) -> Self {
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            db,
            registry,
            interceptors: Interceptors::default(),
            notifier,
        }
    }

    /// Handle to the observer list, for registration by a UI push layer.
    pub fn interceptors(&self) -> Interceptors {
        self.interceptors.clone()
    }

    /// Subscribe to the broadcast side-channel of normalized readings.
    pub fn subscribe(&self) -> broadcast::Receiver<StoredReading> {
        self.notifier.subscribe()
    }

    /// Process one inbound publish event. Data-quality failures are dropped
    /// outcomes, not errors; only storage failures surface as `Err`, and the
    /// caller's event loop logs those and keeps polling.
    pub async fn handle_publish(&self, topic: &str, payload: &[u8]) -> Result<IngestOutcome> {
        let msg: TelemetryMsg = match serde_json::from_slice(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(topic, "dropping unparseable telemetry: {e}");
                self.db
                    .log(
                        LogLevel::Warn,
                        "ingest",
                        &format!("unparseable telemetry on '{topic}': {e}"),
                    )
                    .await;
                return Ok(IngestOutcome::DroppedBadJson);
            }
        };

        let source = identify_device(&msg, topic);
        let Some(device_id) = source.id() else {
            warn!(topic, "telemetry carries no device id; dropping");
            self.db
                .log(
                    LogLevel::Warn,
                    "ingest",
                    &format!("telemetry on '{topic}' carries no device id; message dropped"),
                )
                .await;
            return Ok(IngestOutcome::DroppedNoDevice);
        };

        let ts = msg
            .timestamp
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.timestamp())
            .unwrap_or_else(now_unix);

        self.registry.touch(device_id, ts).await?;

        let plant_id = self
            .registry
            .resolve(device_id)
            .await?
            .and_then(|d| d.plant_id);
        if plant_id.is_none() {
            debug!(device = %device_id, "no plant link; persisting reading unlinked");
        }

        let reading = StoredReading {
            device_id: device_id.to_string(),
            plant_id,
            ts,
            soil_moisture: msg.soil_moisture,
            temperature: msg.temperature,
            humidity: msg.humidity,
            light: msg.light,
            water_level: msg.water_level,
            battery: msg.battery,
        };

        self.db.insert_reading(&reading).await?;

        self.interceptors.invoke_all(&reading);

        // Fire-and-forget: a send with no connected receivers is normal.
        let _ = self.notifier.send(reading);

        Ok(IngestOutcome::Stored)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
