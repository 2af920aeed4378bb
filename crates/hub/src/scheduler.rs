//! Cron-driven irrigation jobs. The manager owns the in-memory map of armed
//! timers (one per schedule id, hard invariant) and rebuilds it from
//! persisted schedules at startup. Each firing re-checks device health
//! through the registry before anything is dispatched, and every failure
//! path inside a timer callback terminates in a log write — an exception
//! must never deregister future firings or take down the process.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::db::{now_unix, Db, LogLevel, PumpSchedule};
use crate::dispatch::CommandDispatcher;
use crate::registry::DeviceRegistry;

// ---------------------------------------------------------------------------
// Cron parsing
// ---------------------------------------------------------------------------

/// The cron library wants a seconds field; classic 5-field expressions get
/// one prepended so user-facing schedules stay in the familiar format.
pub fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

pub fn parse_cron(expr: &str) -> Result<Schedule> {
    Schedule::from_str(&normalize_cron(expr))
        .with_context(|| format!("invalid cron expression '{expr}'"))
}

pub fn parse_timezone(tz: &str) -> Result<Tz> {
    tz.parse::<Tz>()
        .map_err(|e| anyhow!("invalid timezone '{tz}': {e}"))
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// A live timer for one schedule. Dropping it drops the cancel sender,
/// which stops the job task at its next poll.
struct ActiveJob {
    _cancel: oneshot::Sender<()>,
    _handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ScheduleManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    db: Db,
    registry: DeviceRegistry,
    dispatcher: Arc<dyn CommandDispatcher>,
    jobs: Mutex<HashMap<i64, ActiveJob>>,
}

impl ScheduleManager {
    pub fn new(db: Db, registry: DeviceRegistry, dispatcher: Arc<dyn CommandDispatcher>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                db,
                registry,
                dispatcher,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Arm (or re-arm) the timer for a schedule. Replace, not merge: any
    /// prior timer for the same id is cancelled inside the same lock scope
    /// that installs the new one, so two timers are never armed at once.
    /// An inactive schedule is treated as a removal.
    pub fn upsert_job(&self, sched: &PumpSchedule) -> Result<()> {
        if !sched.active {
            self.remove_job(sched.id);
            return Ok(());
        }

        let schedule = parse_cron(&sched.cron_expr)?;
        let tz = parse_timezone(&sched.timezone)?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let mut jobs = self.inner.jobs.lock().expect("job map lock");
        jobs.remove(&sched.id); // drops the prior cancel sender, if any

        let handle = tokio::spawn(run_job(
            sched.clone(),
            schedule,
            tz,
            self.inner.db.clone(),
            self.inner.registry.clone(),
            Arc::clone(&self.inner.dispatcher),
            cancel_rx,
        ));
        jobs.insert(
            sched.id,
            ActiveJob {
                _cancel: cancel_tx,
                _handle: handle,
            },
        );

        info!(
            schedule = sched.id,
            device = %sched.device_id,
            cron = %sched.cron_expr,
            tz = %sched.timezone,
            "schedule armed"
        );
        Ok(())
    }

    /// Cancel and forget a schedule's timer. Idempotent: removing an id that
    /// was never armed is a no-op.
    pub fn remove_job(&self, id: i64) -> bool {
        let removed = self
            .inner
            .jobs
            .lock()
            .expect("job map lock")
            .remove(&id)
            .is_some();
        if removed {
            info!(schedule = id, "schedule disarmed");
        }
        removed
    }

    /// Rebuild the job map from persisted schedules; called once at startup.
    /// A schedule that fails to arm (bad cron, bad timezone) is logged and
    /// skipped so one bad row cannot block the rest of the fleet.
    pub async fn schedule_all(&self) -> Result<usize> {
        let schedules = self.inner.db.load_active_schedules().await?;
        let mut armed = 0;
        for sched in &schedules {
            match self.upsert_job(sched) {
                Ok(()) => armed += 1,
                Err(e) => {
                    error!(schedule = sched.id, "failed to arm schedule: {e:#}");
                    self.inner
                        .db
                        .log(
                            LogLevel::Error,
                            "scheduler",
                            &format!("schedule {}: failed to arm: {e:#}", sched.id),
                        )
                        .await;
                }
            }
        }
        info!(armed, total = schedules.len(), "schedules loaded");
        Ok(armed)
    }

    pub fn job_count(&self) -> usize {
        self.inner.jobs.lock().expect("job map lock").len()
    }

    pub fn is_armed(&self, id: i64) -> bool {
        self.inner.jobs.lock().expect("job map lock").contains_key(&id)
    }
}

/// Timer loop for one schedule: sleep until the next cron occurrence, fire,
/// re-arm. Cancellation wins over a simultaneous fire (`biased`), and the
/// follow-up occurrence is computed strictly after the previous one so a
/// sub-second dispatch cannot double-fire within the same cron slot.
async fn run_job(
    sched: PumpSchedule,
    schedule: Schedule,
    tz: Tz,
    db: Db,
    registry: DeviceRegistry,
    dispatcher: Arc<dyn CommandDispatcher>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let mut after = Utc::now().with_timezone(&tz);
    loop {
        let Some(next) = schedule.after(&after).next() else {
            warn!(schedule = sched.id, "cron has no upcoming occurrence; disarming");
            return;
        };

        let wait = (next.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        tokio::select! {
            biased;
            _ = &mut cancel_rx => return,
            _ = tokio::time::sleep(wait) => {
                fire_schedule(&sched, &registry, dispatcher.as_ref(), &db).await;
                after = next;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch on fire
// ---------------------------------------------------------------------------

/// One firing: resolve the target device, check health, dispatch. All
/// failure paths log and return; the schedule stays armed either way.
pub(crate) async fn fire_schedule(
    sched: &PumpSchedule,
    registry: &DeviceRegistry,
    dispatcher: &dyn CommandDispatcher,
    db: &Db,
) {
    let device = match registry.resolve(&sched.device_id).await {
        Ok(Some(d)) => d,
        Ok(None) => {
            error!(schedule = sched.id, device = %sched.device_id, "device not found");
            db.log(
                LogLevel::Error,
                "scheduler",
                &format!("schedule {}: device '{}' not found", sched.id, sched.device_id),
            )
            .await;
            return;
        }
        Err(e) => {
            error!(schedule = sched.id, device = %sched.device_id, "device lookup failed: {e:#}");
            return;
        }
    };

    if !registry.record_is_online(&device) {
        warn!(schedule = sched.id, device = %sched.device_id, "skipped - device offline");
        db.log(
            LogLevel::Warn,
            "scheduler",
            &format!(
                "schedule {}: skipped - device '{}' offline",
                sched.id, sched.device_id
            ),
        )
        .await;
        return;
    }

    match dispatcher.pump_on(&sched.device_id, sched.duration_sec).await {
        Ok(()) => {
            info!(
                schedule = sched.id,
                device = %sched.device_id,
                duration_sec = sched.duration_sec,
                "pump command dispatched"
            );
            db.log(
                LogLevel::Info,
                "scheduler",
                &format!(
                    "schedule {}: pump_on dispatched to '{}' for {}s",
                    sched.id, sched.device_id, sched.duration_sec
                ),
            )
            .await;
            if let Err(e) = db
                .insert_watering_event(&sched.device_id, now_unix(), sched.duration_sec, "schedule")
                .await
            {
                error!(schedule = sched.id, "failed to record watering event: {e:#}");
            }
        }
        Err(e) => {
            error!(schedule = sched.id, device = %sched.device_id, "dispatch failed: {e:#}");
            db.log(
                LogLevel::Error,
                "scheduler",
                &format!(
                    "schedule {}: dispatch to '{}' failed: {e:#}",
                    sched.id, sched.device_id
                ),
            )
            .await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
