use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;
use xrayconnect_db::models::server::XrayPanel;
use xrayconnect_panel::{PanelApi, PanelClient, PanelError};

/// Builds a client for one stored panel.
pub trait PanelConnector: Send + Sync {
    fn connect(&self, panel: &XrayPanel) -> Result<Arc<dyn PanelApi>, PanelError>;
}

/// Keeps one logged-in client per panel; an edited panel row gets a fresh one.
pub struct HttpPanelConnector {
    timeout: Duration,
    clients: Mutex<HashMap<Uuid, (DateTime<Utc>, Arc<PanelClient>)>>,
}

impl HttpPanelConnector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl PanelConnector for HttpPanelConnector {
    fn connect(&self, panel: &XrayPanel) -> Result<Arc<dyn PanelApi>, PanelError> {
        let mut clients = self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((updated_at, client)) = clients.get(&panel.id) {
            if *updated_at == panel.updated_at {
                return Ok(client.clone());
            }
        }

        let client = Arc::new(PanelClient::new(&panel.url, &panel.username, &panel.password, self.timeout)?);
        clients.insert(panel.id, (panel.updated_at, client.clone()));
        Ok(client)
    }
}
