use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use plantcare_hub::config;
use plantcare_hub::db::Db;
use plantcare_hub::dispatch::MqttDispatcher;
use plantcare_hub::registry::DeviceRegistry;
use plantcare_hub::scheduler::ScheduleManager;
use plantcare_hub::telemetry::Ingestor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env + config file ───────────────────────────────────────────
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:plantcare.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    let cfg = if Path::new(&config_path).exists() {
        config::load(&config_path)?
    } else {
        warn!(path = %config_path, "config file not found; running with defaults");
        config::Config::default()
    };

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    config::apply(&cfg, &db).await?;

    let registry = DeviceRegistry::new(
        db.clone(),
        Duration::from_secs(cfg.registry.health_timeout_min * 60),
    );

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.host, cfg.mqtt.port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    let namespace = cfg.mqtt.namespace.clone();
    let dispatcher = Arc::new(MqttDispatcher::new(client.clone(), namespace.clone()));

    // ── Schedules: rebuild the job map from persisted rows ──────────
    let manager = ScheduleManager::new(db.clone(), registry.clone(), dispatcher);
    let armed = manager.schedule_all().await?;
    info!(armed, "schedule manager ready");

    // ── Telemetry ingest ────────────────────────────────────────────
    let ingestor = Ingestor::new(db.clone(), registry);

    client
        .subscribe(format!("{namespace}/pub"), QoS::AtLeastOnce)
        .await?;
    client
        .subscribe(format!("{namespace}/device/+/response"), QoS::AtLeastOnce)
        .await?;
    info!(%namespace, "subscribed to telemetry topics");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                match ingestor.handle_publish(&p.topic, &p.payload).await {
                    Ok(outcome) => debug!(topic = %p.topic, ?outcome, "telemetry handled"),
                    Err(e) => error!(topic = %p.topic, "telemetry handling failed: {e:#}"),
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
