use std::sync::Arc;

use crate::auth::SecurityService;
use crate::config::Config;
use crate::services::session_manager::SessionManager;

/// Shared application state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub security: Arc<SecurityService>,
    pub manager: Arc<SessionManager>,
}

impl AppState {
    pub fn new(config: Config, security: Arc<SecurityService>, manager: Arc<SessionManager>) -> Self {
        Self {
            config,
            security,
            manager,
        }
    }
}
