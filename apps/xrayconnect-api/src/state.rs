use std::sync::Arc;

use crate::services::connection_service::ConnectionService;

#[derive(Clone)]
pub struct AppState {
    pub connection_service: Arc<ConnectionService>,
}
