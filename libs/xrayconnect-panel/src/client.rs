use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, header, redirect};
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::{PanelError, Result};
use crate::models::{AddedClient, ClientTraffic, Envelope, Inbound, InboundClient};

const SESSION_COOKIES: [&str; 3] = ["3x-ui", "session", "JSESSIONID"];

type InboundKey = (String, i32);

/// One lock per panel inbound, shared by every client in the process, so two
/// read-modify-write cycles on the same client list never interleave.
static INBOUND_LOCKS: LazyLock<std::sync::Mutex<HashMap<InboundKey, Arc<Mutex<()>>>>> =
    LazyLock::new(|| std::sync::Mutex::new(HashMap::new()));

/// Operations the provisioning worker needs from a control panel.
#[async_trait]
pub trait PanelApi: Send + Sync {
    async fn get_inbound(&self, inbound_id: i32) -> Result<Inbound>;

    /// Adds a client, or reuses one already registered under `email`.
    async fn add_client(
        &self,
        inbound_id: i32,
        email: &str,
        uuid: &str,
        expiry_millis: i64,
        total_bytes: i64,
    ) -> Result<AddedClient>;

    /// Returns whether a client was actually removed.
    async fn delete_client(&self, inbound_id: i32, email: &str) -> Result<bool>;

    /// `None` when the panel has no statistics for `email` yet.
    async fn client_traffic(&self, email: &str) -> Result<Option<ClientTraffic>>;
}

/// HTTP client for a 3x-ui panel.
pub struct PanelClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    session: Mutex<Option<String>>,
}

/// Outcome of one authenticated request.
enum Reply<T> {
    Done(Option<T>),
    /// The panel no longer accepts the cookie: a 401, a redirect to its login
    /// page, or an HTML body instead of JSON.
    SessionExpired,
}

impl PanelClient {
    pub fn new(base_url: &str, username: &str, password: &str, timeout: Duration) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        // Panels commonly run with self-signed certificates. Redirects are not
        // followed: an expired session is answered with one to the login page.
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            session: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn login(&self) -> Result<String> {
        let url = format!("{}/login", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "username": self.username, "password": self.password }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(PanelError::Login(format!("status {status}: {body}")));
        }

        let cookie = response
            .cookies()
            .find(|c| SESSION_COOKIES.contains(&c.name()))
            .map(|c| format!("{}={}", c.name(), c.value()));

        let envelope: Envelope<serde_json::Value> = response.json().await?;
        if !envelope.success {
            return Err(PanelError::Login(envelope.msg));
        }

        let cookie = cookie.ok_or_else(|| PanelError::Login("session cookie not found in response".into()))?;
        debug!(panel = %self.base_url, "Logged in to panel");
        Ok(cookie)
    }

    async fn session(&self) -> Result<String> {
        let mut session = self.session.lock().await;
        if let Some(cookie) = session.as_ref() {
            return Ok(cookie.clone());
        }
        let cookie = self.login().await?;
        *session = Some(cookie.clone());
        Ok(cookie)
    }

    /// Forgets `cookie` unless another request already replaced it.
    async fn expire_session(&self, cookie: &str) {
        let mut session = self.session.lock().await;
        if session.as_deref() == Some(cookie) {
            *session = None;
        }
    }

    /// Sends an authenticated request and unwraps the `{success, msg, obj}`
    /// envelope. A rejected session is renewed and the request sent once more.
    async fn call<T, F>(&self, build: F) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let mut renewed = false;
        loop {
            let cookie = self.session().await?;
            match self.try_call(build(), &cookie).await? {
                Reply::Done(obj) => return Ok(obj),
                Reply::SessionExpired => {
                    self.expire_session(&cookie).await;
                    if renewed {
                        return Err(PanelError::Login("panel keeps rejecting a fresh session".into()));
                    }
                    warn!(panel = %self.base_url, "Panel session expired, logging in again");
                    renewed = true;
                }
            }
        }
    }

    async fn try_call<T: DeserializeOwned>(&self, request: RequestBuilder, cookie: &str) -> Result<Reply<T>> {
        let response = request
            .header(header::COOKIE, cookie)
            .header("X-Requested-With", "XMLHttpRequest")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status.is_redirection() {
            return Ok(Reply::SessionExpired);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PanelError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(&body) else {
            return Ok(Reply::SessionExpired);
        };
        let envelope: Envelope<T> = serde_json::from_value(value)?;
        if !envelope.success {
            return Err(PanelError::Api(envelope.msg));
        }
        Ok(Reply::Done(envelope.obj))
    }

    async fn lock_inbound(&self, inbound_id: i32) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = INBOUND_LOCKS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry((self.base_url.clone(), inbound_id))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn update_inbound(&self, inbound: &Inbound) -> Result<()> {
        let url = format!("{}/panel/inbound/update/{}", self.base_url, inbound.id);
        self.call::<serde_json::Value, _>(|| self.client.post(&url).json(inbound))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PanelApi for PanelClient {
    async fn get_inbound(&self, inbound_id: i32) -> Result<Inbound> {
        let url = format!("{}/panel/inbound/get/{}", self.base_url, inbound_id);
        self.call(|| self.client.get(&url))
            .await?
            .ok_or_else(|| PanelError::Api(format!("inbound {inbound_id} not found")))
    }

    async fn add_client(
        &self,
        inbound_id: i32,
        email: &str,
        uuid: &str,
        expiry_millis: i64,
        total_bytes: i64,
    ) -> Result<AddedClient> {
        let _guard = self.lock_inbound(inbound_id).await;
        let mut inbound = self.get_inbound(inbound_id).await?;
        let mut clients = inbound.clients()?;

        if let Some(index) = clients.iter().position(|c| c.email == email) {
            info!(inbound_id, email, "Client already present on panel, reusing it");
            return Ok(AddedClient {
                position: index as i32 + 1,
                uuid: clients[index].credential().to_string(),
                reused: true,
            });
        }

        let mut client = InboundClient::new(email, uuid, expiry_millis, total_bytes);
        if inbound.protocol == "trojan" {
            client.password = uuid.to_string();
        }
        clients.push(client);
        inbound.set_clients(&clients)?;
        self.update_inbound(&inbound).await?;

        let stored = self.get_inbound(inbound_id).await?.clients()?;
        let position = stored
            .iter()
            .position(|c| c.email == email)
            .ok_or_else(|| PanelError::Api(format!("client {email} missing after update")))?;

        Ok(AddedClient {
            position: position as i32 + 1,
            uuid: uuid.to_string(),
            reused: false,
        })
    }

    async fn delete_client(&self, inbound_id: i32, email: &str) -> Result<bool> {
        let _guard = self.lock_inbound(inbound_id).await;
        let mut inbound = self.get_inbound(inbound_id).await?;
        let clients = inbound.clients()?;
        let remaining: Vec<InboundClient> = clients.iter().filter(|c| c.email != email).cloned().collect();
        if remaining.len() == clients.len() {
            return Ok(false);
        }
        inbound.set_clients(&remaining)?;
        self.update_inbound(&inbound).await?;
        Ok(true)
    }

    async fn client_traffic(&self, email: &str) -> Result<Option<ClientTraffic>> {
        let url = format!("{}/panel/inbound/getClientTraffics/{}", self.base_url, email);
        self.call(|| self.client.get(&url)).await
    }
}
