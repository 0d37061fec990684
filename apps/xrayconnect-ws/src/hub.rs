//! Registry of live sockets. The dispatch loop owns the map; everything else
//! talks to it through [`HubHandle`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;
use xrayconnect_shared::NotificationMessage;

const HUB_BUFFER: usize = 100;

pub type ClientId = u64;

enum Command {
    Register {
        id: ClientId,
        user_id: Uuid,
        tx: mpsc::Sender<NotificationMessage>,
    },
    Unregister(ClientId),
    Broadcast(NotificationMessage),
    Count(oneshot::Sender<usize>),
}

#[derive(Debug, Error)]
#[error("notification hub has stopped")]
pub struct HubClosed;

struct Client {
    user_id: Uuid,
    tx: mpsc::Sender<NotificationMessage>,
}

#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
    next_id: Arc<AtomicU64>,
    client_buffer: usize,
}

impl HubHandle {
    /// Adds a socket for `user_id`; its messages arrive on the returned receiver.
    pub async fn register(&self, user_id: Uuid) -> Result<(ClientId, mpsc::Receiver<NotificationMessage>), HubClosed> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.client_buffer);
        self.send(Command::Register { id, user_id, tx }).await?;
        Ok((id, rx))
    }

    pub async fn unregister(&self, id: ClientId) {
        let _ = self.send(Command::Unregister(id)).await;
    }

    /// Queues `msg` for every matching socket. Returns once it is queued,
    /// not once it is delivered.
    pub async fn broadcast(&self, msg: NotificationMessage) -> Result<(), HubClosed> {
        self.send(Command::Broadcast(msg)).await
    }

    pub async fn client_count(&self) -> Result<usize, HubClosed> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Count(tx)).await?;
        rx.await.map_err(|_| HubClosed)
    }

    async fn send(&self, command: Command) -> Result<(), HubClosed> {
        self.commands.send(command).await.map_err(|_| HubClosed)
    }
}

/// Starts the dispatch loop. It runs until every handle is dropped.
pub fn spawn(client_buffer: usize) -> (HubHandle, JoinHandle<()>) {
    let (commands, rx) = mpsc::channel(HUB_BUFFER);
    let handle = HubHandle {
        commands,
        next_id: Arc::new(AtomicU64::new(1)),
        client_buffer: client_buffer.max(1),
    };
    let hub = Hub {
        rx,
        clients: HashMap::new(),
    };
    (handle, tokio::spawn(hub.run()))
}

struct Hub {
    rx: mpsc::Receiver<Command>,
    clients: HashMap<ClientId, Client>,
}

impl Hub {
    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Register { id, user_id, tx } => {
                    self.clients.insert(id, Client { user_id, tx });
                    info!(client_id = id, user_id = %user_id, "Client registered");
                }
                Command::Unregister(id) => {
                    if self.clients.remove(&id).is_some() {
                        info!(client_id = id, "Client unregistered");
                    }
                }
                Command::Broadcast(msg) => self.dispatch(&msg),
                Command::Count(reply) => {
                    let _ = reply.send(self.clients.len());
                }
            }
        }
        debug!("Notification hub stopped");
    }

    fn dispatch(&mut self, msg: &NotificationMessage) {
        self.clients.retain(|id, client| {
            if !msg.is_for(client.user_id) {
                return true;
            }
            match client.tx.try_send(msg.clone()) {
                Ok(()) => true,
                Err(e) => {
                    info!(client_id = *id, "Dropping stale client: {}", e);
                    false
                }
            }
        });
    }
}
