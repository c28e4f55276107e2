//! Shared application state handed to every request handler.

use rtcast_router::{Endpoint, MediaCapabilities, RelayClient, SessionRegistry};
use std::sync::Arc;

pub struct AppState {
    pub registry: SessionRegistry,
    pub endpoint: Arc<dyn Endpoint>,
    pub relay: RelayClient,
    pub capabilities: MediaCapabilities,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    #[must_use]
    pub fn new(
        endpoint: Arc<dyn Endpoint>,
        capabilities: MediaCapabilities,
        origins: Vec<String>,
    ) -> SharedState {
        Arc::new(Self {
            registry: SessionRegistry::new(),
            endpoint,
            relay: RelayClient::new(origins),
            capabilities,
        })
    }
}
