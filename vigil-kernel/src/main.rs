/**
 * VIGIL KERNEL - Point d'entrée principal du service de télémétrie
 *
 * RÔLE : Orchestration de tous les modules : config, bus tenant, sessions,
 * consolidation, santé, HTTP. Bootstrap du système complet.
 *
 * ARCHITECTURE : Event-driven via MQTT multi-tenant + API REST + scores
 * de santé hiérarchiques. Point d'administration unique de la flotte.
 */

mod bus;
mod config;
mod consolidate;
mod durable_log;
mod errors;
mod health;
mod http;
mod listener;
mod sessions;
mod state;
mod subjects;
mod telemetry;
mod tenants;

use crate::bus::{MqttTransport, TenantBus};
use crate::config::{load_config, MqttConf};
use crate::consolidate::Consolidator;
use crate::health::{DefaultScoreRule, HealthBoard, HealthTracker};
use crate::http::AppState;
use crate::sessions::DeviceRegistry;
use crate::subjects::Scope;
use crate::tenants::{CredentialStore, TenantDirectory};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;

    if let Err(e) = std::fs::create_dir_all(&cfg.data_dir) {
        warn!("failed to create data dir {}: {e}", cfg.data_dir);
    }

    // Transport MQTT + tracker de santé branché sur l'event loop
    let tracker = HealthTracker::new();
    let mqtt_conf = cfg
        .mqtt
        .clone()
        .unwrap_or(MqttConf { host: "localhost".into(), port: 1883 });
    let (transport, incoming) = MqttTransport::connect(&mqtt_conf, cfg.backoff, tracker.clone());

    // Bus tenant : credentials, logs durables, dispatch
    let creds = CredentialStore::new();
    let service = creds.issue(Scope::Service);
    let bus = TenantBus::new(Arc::new(transport), creds.clone(), cfg.log_limits, &cfg.data_dir);
    bus.spawn_dispatcher(incoming);
    bus.spawn_log_saver(Duration::from_secs(60));

    // Annuaire tenants + topologie device/group/org
    let directory = TenantDirectory::new(creds);

    // Sessions devices : liveness, commandes corrélées, persistance
    let registry = DeviceRegistry::new(
        bus.clone(),
        directory.clone(),
        service.token.clone(),
        &cfg.data_dir,
        cfg.liveness_window_secs,
        cfg.command_timeout_secs,
    );
    if let Err(e) = registry.load().await {
        warn!("failed to load device sessions: {e}");
    }
    registry.spawn_sweeper(Duration::from_secs(cfg.sweep_interval_secs));

    // Consolidation + agrégation santé
    let consolidator = Consolidator::new(cfg.consolidated_retention_secs);
    let board = HealthBoard::new(directory.clone(), Box::new(DefaultScoreRule::default()));
    consolidator.spawn_drain(board.clone(), Duration::from_secs(cfg.drain_interval_secs));

    // Flux device entrant -> sessions / corrélation / backlog
    match listener::spawn_device_listener(
        bus.clone(),
        service.token.clone(),
        registry.clone(),
        consolidator.clone(),
    ) {
        Ok(_) => info!("device listener started"),
        Err(e) => {
            error!("failed to start device listener: {e}");
            std::process::exit(1);
        }
    }

    // Publication auto de la santé kernel sur admin.health.kernel
    tracker.spawn_health_publisher(
        bus.clone(),
        service.token.clone(),
        board.clone(),
        registry.clone(),
        Duration::from_secs(cfg.health_publish_interval_secs),
    );

    // Fabrique l'état unique pour Axum
    let app_state = AppState {
        registry,
        directory,
        consolidator,
        board,
        tracker,
        bus: bus.clone(),
        service_token: service.token.clone(),
    };
    let app = http::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    info!("kernel listening on http://{addr}");
    let tcp = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(tcp, app).await {
        error!("http server stopped: {e}");
    }
}
