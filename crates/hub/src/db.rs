use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::fmt;
use std::str::FromStr;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub plant_id: Option<String>,
    /// Unix seconds of the last accepted telemetry message, if any.
    pub last_seen: Option<i64>,
}

/// One telemetry reading, append-only once persisted. Every sensor field is
/// optional — a message may carry any subset.
#[derive(Debug, Clone, Serialize)]
pub struct StoredReading {
    pub device_id: String,
    pub plant_id: Option<String>,
    pub ts: i64,
    pub soil_moisture: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub light: Option<f64>,
    pub water_level: Option<f64>,
    pub battery: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpSchedule {
    pub id: i64,
    pub device_id: String,
    pub cron_expr: String,
    pub timezone: String,
    pub duration_sec: i64,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemLog {
    pub ts: i64,
    pub level: String,
    pub source: String,
    pub message: String,
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/plantcare/hub.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Devices
    // ----------------------------

    pub async fn upsert_device(&self, device_id: &str, plant_id: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, plant_id)
            VALUES (?, ?)
            ON CONFLICT(device_id) DO UPDATE SET plant_id = excluded.plant_id
            "#,
        )
        .bind(device_id)
        .bind(plant_id)
        .execute(&self.pool)
        .await
        .context("upsert_device failed")?;
        Ok(())
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let row = sqlx::query(
            "SELECT device_id, plant_id, last_seen FROM devices WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_device failed")?;

        Ok(row.map(|r| DeviceRecord {
            device_id: r.get("device_id"),
            plant_id: r.get("plant_id"),
            last_seen: r.get("last_seen"),
        }))
    }

    /// Update a device's heartbeat. Unknown ids are left alone — devices are
    /// provisioned externally, telemetry never creates them. Returns whether
    /// a row was actually updated.
    pub async fn touch_device(&self, device_id: &str, ts: i64) -> Result<bool> {
        let res = sqlx::query("UPDATE devices SET last_seen = ? WHERE device_id = ?")
            .bind(ts)
            .bind(device_id)
            .execute(&self.pool)
            .await
            .context("touch_device failed")?;
        Ok(res.rows_affected() > 0)
    }

    // ----------------------------
    // Readings (append-only)
    // ----------------------------

    pub async fn insert_reading(&self, r: &StoredReading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensor_readings
              (device_id, plant_id, ts,
               soil_moisture, temperature, humidity, light, water_level, battery)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&r.device_id)
        .bind(&r.plant_id)
        .bind(r.ts)
        .bind(r.soil_moisture)
        .bind(r.temperature)
        .bind(r.humidity)
        .bind(r.light)
        .bind(r.water_level)
        .bind(r.battery)
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    pub async fn latest_reading_for_plant(&self, plant_id: &str) -> Result<Option<StoredReading>> {
        let row = sqlx::query(
            r#"
            SELECT device_id, plant_id, ts,
                   soil_moisture, temperature, humidity, light, water_level, battery
            FROM sensor_readings
            WHERE plant_id = ?
            ORDER BY ts DESC
            LIMIT 1
            "#,
        )
        .bind(plant_id)
        .fetch_optional(&self.pool)
        .await
        .context("latest_reading_for_plant failed")?;

        Ok(row.map(|r| StoredReading {
            device_id: r.get("device_id"),
            plant_id: r.get("plant_id"),
            ts: r.get("ts"),
            soil_moisture: r.get("soil_moisture"),
            temperature: r.get("temperature"),
            humidity: r.get("humidity"),
            light: r.get("light"),
            water_level: r.get("water_level"),
            battery: r.get("battery"),
        }))
    }

    pub async fn reading_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sensor_readings")
            .fetch_one(&self.pool)
            .await
            .context("reading_count failed")?;
        Ok(row.get("n"))
    }

    // ----------------------------
    // Schedules
    // ----------------------------

    pub async fn insert_schedule(
        &self,
        device_id: &str,
        cron_expr: &str,
        timezone: &str,
        duration_sec: i64,
        active: bool,
    ) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO pump_schedules (device_id, cron_expr, timezone, duration_sec, active)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(device_id)
        .bind(cron_expr)
        .bind(timezone)
        .bind(duration_sec)
        .bind(active)
        .execute(&self.pool)
        .await
        .context("insert_schedule failed")?;
        Ok(res.last_insert_rowid())
    }

    /// Seed-time check so re-applying the same config never duplicates rows.
    pub async fn schedule_exists(&self, device_id: &str, cron_expr: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM pump_schedules WHERE device_id = ? AND cron_expr = ? LIMIT 1",
        )
        .bind(device_id)
        .bind(cron_expr)
        .fetch_optional(&self.pool)
        .await
        .context("schedule_exists failed")?;
        Ok(row.is_some())
    }

    pub async fn load_active_schedules(&self) -> Result<Vec<PumpSchedule>> {
        let rows = sqlx::query(
            r#"
            SELECT id, device_id, cron_expr, timezone, duration_sec, active
            FROM pump_schedules
            WHERE active = 1
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_active_schedules failed")?;

        Ok(rows
            .into_iter()
            .map(|r| PumpSchedule {
                id: r.get("id"),
                device_id: r.get("device_id"),
                cron_expr: r.get("cron_expr"),
                timezone: r.get("timezone"),
                duration_sec: r.get("duration_sec"),
                active: r.get("active"),
            })
            .collect())
    }

    pub async fn delete_schedule(&self, id: i64) -> Result<bool> {
        let res = sqlx::query("DELETE FROM pump_schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_schedule failed")?;
        Ok(res.rows_affected() > 0)
    }

    // ----------------------------
    // Watering events (actuation audit trail)
    // ----------------------------

    pub async fn insert_watering_event(
        &self,
        device_id: &str,
        ts: i64,
        duration_sec: i64,
        source: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watering_events (device_id, ts, duration_sec, source)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(device_id)
        .bind(ts)
        .bind(duration_sec)
        .bind(source)
        .execute(&self.pool)
        .await
        .context("insert_watering_event failed")?;
        Ok(())
    }

    pub async fn last_actuation(&self, device_id: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            r#"
            SELECT ts FROM watering_events
            WHERE device_id = ?
            ORDER BY ts DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("last_actuation failed")?;
        Ok(row.map(|r| r.get("ts")))
    }

    // ----------------------------
    // Operational log sink
    // ----------------------------

    /// Persist an operational log record. Infallible from the caller's
    /// perspective: a failed write is reported through tracing only, so a
    /// broken log sink can never take down an ingest or dispatch path.
    pub async fn log(&self, level: LogLevel, source: &str, message: &str) {
        let res = sqlx::query(
            "INSERT INTO system_logs (ts, level, source, message) VALUES (?, ?, ?, ?)",
        )
        .bind(now_unix())
        .bind(level.as_str())
        .bind(source)
        .bind(message)
        .execute(&self.pool)
        .await;

        if let Err(e) = res {
            tracing::error!(source, message, "system log write failed: {e}");
        }
    }

    pub async fn recent_logs(&self, limit: i64) -> Result<Vec<SystemLog>> {
        let rows = sqlx::query(
            r#"
            SELECT ts, level, source, message
            FROM system_logs
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_logs failed")?;

        Ok(rows
            .into_iter()
            .map(|r| SystemLog {
                ts: r.get("ts"),
                level: r.get("level"),
                source: r.get("source"),
                message: r.get("message"),
            })
            .collect())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
