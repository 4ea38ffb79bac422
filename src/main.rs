//! Collaboration engine server entry point.

use std::panic;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tracing_subscriber::EnvFilter;

use collab_engine::config::ServerConfig;
use collab_engine::registry::HubRegistry;
use collab_engine::session::SessionManager;
use collab_engine::state::AppState;
use collab_engine::store::{OperationStore, SqliteOperationStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    panic::set_hook(Box::new(|panic_info| {
        eprintln!("collaboration engine fatal error:");
        eprintln!("{}", panic_info);
        if let Some(location) = panic_info.location() {
            eprintln!("location: {}:{}:{}", location.file(), location.line(), location.column());
        }
    }));

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env();

    tracing::info!(version = collab_engine::VERSION, "starting collaboration engine");

    let store = SqliteOperationStore::connect(&config.database_url).await?;
    let store: Arc<dyn OperationStore> = Arc::new(store);

    let registry = HubRegistry::new(
        store,
        config.inbound_queue_capacity,
        config.retention_window,
        Duration::from_secs(config.hub_idle_grace_secs),
    );
    let sessions = SessionManager::new();
    let state = AppState::new(registry.clone(), sessions.clone(), config.clone());

    spawn_idle_sweeper(sessions, registry, Duration::from_secs(config.sweep_interval_secs));

    let app = Router::new()
        .route("/ws/:document_id/:user_id", axum::routing::get(collab_engine::ws::ws_handler))
        .nest("/api/v1", collab_engine::api::router())
        .with_state(state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Periodically reaps sessions idle past `session_idle_timeout_secs`, tearing
/// down their Hub subscription so presence stays accurate without relying on
/// clients to send an explicit `leave`.
fn spawn_idle_sweeper(sessions: Arc<SessionManager>, registry: Arc<HubRegistry>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let reaped = sessions.cleanup_inactive(chrono::Duration::seconds(30 * 60));
            for session in reaped {
                if let Some(hub) = registry.get(session.document_id) {
                    hub.leave(session.session_id);
                }
            }
        }
    });
}
