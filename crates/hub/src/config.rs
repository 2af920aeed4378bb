//! TOML config file loading, validation, and database seeding for devices
//! and pump schedules.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::db::Db;
use crate::scheduler::{parse_cron, parse_timezone};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
}

#[derive(Debug, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Topic namespace: telemetry arrives on `<ns>/pub` and
    /// `<ns>/device/+/response`, commands go to `<ns>/device/<id>/command`.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

#[derive(Debug, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_health_timeout_min")]
    pub health_timeout_min: u64,
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    #[serde(default)]
    pub plant_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleEntry {
    pub device_id: String,
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_duration_sec")]
    pub duration_sec: i64,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "plantcare-hub".to_string()
}
fn default_namespace() -> String {
    "plantcare".to_string()
}
fn default_health_timeout_min() -> u64 {
    crate::registry::DEFAULT_HEALTH_TIMEOUT_MIN
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_duration_sec() -> i64 {
    10
}
fn default_true() -> bool {
    true
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            namespace: default_namespace(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_timeout_min: default_health_timeout_min(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_devices(&mut errors);
        self.validate_schedules(&mut errors);

        if self.mqtt.namespace.trim().is_empty() {
            errors.push("mqtt.namespace is empty".to_string());
        }
        if self.registry.health_timeout_min == 0 {
            errors.push("registry.health_timeout_min must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.device_id.is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.device_id)
                }
            };

            if d.device_id.trim().is_empty() {
                errors.push(format!("{}: device_id is empty", ctx()));
            } else if !seen_ids.insert(&d.device_id) {
                errors.push(format!("{}: duplicate device_id", ctx()));
            }

            if let Some(plant) = &d.plant_id {
                if plant.trim().is_empty() {
                    errors.push(format!("{}: plant_id is empty (omit it instead)", ctx()));
                }
            }
        }
    }

    fn validate_schedules(&self, errors: &mut Vec<String>) {
        let device_ids: HashSet<&str> =
            self.devices.iter().map(|d| d.device_id.as_str()).collect();

        for (i, s) in self.schedules.iter().enumerate() {
            let ctx = || format!("schedules[{i}]");

            if s.device_id.trim().is_empty() {
                errors.push(format!("{}: device_id is empty", ctx()));
            } else if !device_ids.contains(s.device_id.as_str()) {
                errors.push(format!(
                    "{}: device_id '{}' does not match any defined device",
                    ctx(),
                    s.device_id
                ));
            }

            if let Err(e) = parse_cron(&s.cron) {
                errors.push(format!("{}: {e:#}", ctx()));
            }
            if let Err(e) = parse_timezone(&s.timezone) {
                errors.push(format!("{}: {e:#}", ctx()));
            }
            if s.duration_sec <= 0 {
                errors.push(format!(
                    "{}: duration_sec must be positive, got {}",
                    ctx(),
                    s.duration_sec
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Seed devices and schedules from the config into the database. Devices
/// are upserted; a schedule is only inserted when no row with the same
/// device and cron already exists, so repeated boots don't duplicate jobs.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for d in &config.devices {
        db.upsert_device(&d.device_id, d.plant_id.as_deref())
            .await
            .with_context(|| format!("failed to upsert device '{}'", d.device_id))?;
    }

    let mut seeded = 0;
    for s in &config.schedules {
        if db.schedule_exists(&s.device_id, &s.cron).await? {
            continue;
        }
        db.insert_schedule(&s.device_id, &s.cron, &s.timezone, s.duration_sec, s.active)
            .await
            .with_context(|| format!("failed to insert schedule for '{}'", s.device_id))?;
        seeded += 1;
    }

    tracing::info!(
        devices = config.devices.len(),
        schedules = seeded,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn empty_config_is_valid_with_defaults() {
        let cfg = parse("");
        cfg.validate().unwrap();
        assert_eq!(cfg.mqtt.host, "127.0.0.1");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.namespace, "plantcare");
        assert_eq!(cfg.registry.health_timeout_min, 5);
    }

    #[test]
    fn schedule_defaults_applied() {
        let cfg = parse(
            r#"
            [[devices]]
            device_id = "dev-1"
            plant_id = "plant-1"

            [[schedules]]
            device_id = "dev-1"
            cron = "0 6 * * *"
            "#,
        );
        cfg.validate().unwrap();
        assert_eq!(cfg.schedules[0].timezone, "UTC");
        assert_eq!(cfg.schedules[0].duration_sec, 10);
        assert!(cfg.schedules[0].active);
    }

    #[test]
    fn duplicate_device_id_rejected() {
        let cfg = parse(
            r#"
            [[devices]]
            device_id = "dev-1"
            [[devices]]
            device_id = "dev-1"
            "#,
        );
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate device_id"));
    }

    #[test]
    fn schedule_for_unknown_device_rejected() {
        let cfg = parse(
            r#"
            [[schedules]]
            device_id = "ghost"
            cron = "0 6 * * *"
            "#,
        );
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("does not match any defined device"));
    }

    #[test]
    fn bad_cron_and_timezone_collected_together() {
        let cfg = parse(
            r#"
            [[devices]]
            device_id = "dev-1"

            [[schedules]]
            device_id = "dev-1"
            cron = "whenever"
            timezone = "Mars/Olympus"
            duration_sec = -3
            "#,
        );
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("3 errors"), "got: {err}");
        assert!(err.contains("cron"));
        assert!(err.contains("timezone"));
        assert!(err.contains("duration_sec"));
    }

    #[tokio::test]
    async fn apply_seeds_and_is_idempotent() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let cfg = parse(
            r#"
            [[devices]]
            device_id = "dev-1"
            plant_id = "plant-1"

            [[schedules]]
            device_id = "dev-1"
            cron = "0 0 6 * * *"
            duration_sec = 20
            "#,
        );
        cfg.validate().unwrap();

        apply(&cfg, &db).await.unwrap();
        apply(&cfg, &db).await.unwrap();

        let dev = db.get_device("dev-1").await.unwrap().unwrap();
        assert_eq!(dev.plant_id.as_deref(), Some("plant-1"));

        let schedules = db.load_active_schedules().await.unwrap();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].duration_sec, 20);
    }
}
