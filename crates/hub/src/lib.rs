//! Irrigation control core for the plant-care platform: telemetry ingest
//! over MQTT, a device registry with heartbeat-based health, cron-driven
//! pump schedules, and a watering prediction engine.
//!
//! The hub binary wires these together; the modules are public so an API
//! layer can consume the prediction service and the live-reading fan-out.

pub mod config;
pub mod db;
pub mod dispatch;
pub mod predict;
pub mod registry;
pub mod scheduler;
pub mod telemetry;
