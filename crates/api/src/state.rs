//! Application state

use std::sync::Arc;

use paysync_recon::ReconService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ReconService>,
}

impl AppState {
    pub fn new(service: ReconService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}
