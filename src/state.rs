//! Shared application state for the websocket and pull-surface handlers.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::registry::HubRegistry;
use crate::session::SessionManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<HubRegistry>,
    pub sessions: Arc<SessionManager>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(registry: Arc<HubRegistry>, sessions: Arc<SessionManager>, config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            sessions,
            config,
        })
    }
}
