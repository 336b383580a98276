//! Live delivery registry
//!
//! Maps a user id to the one connection currently allowed to receive pushes
//! for that user. The socket handling lives in the notifier; the registry only
//! holds an outbound channel per connection.

use crate::metrics;
use crate::models::LivePayload;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Receiving half handed to the socket task of a registered connection
pub struct LiveConnection {
    pub id: Uuid,
    pub user_id: Uuid,
    pub receiver: mpsc::Receiver<LivePayload>,
}

struct Entry {
    connection_id: Uuid,
    sender: mpsc::Sender<LivePayload>,
}

#[derive(Clone)]
pub struct LiveRegistry {
    connections: Arc<RwLock<HashMap<Uuid, Entry>>>,
    buffer: usize,
}

impl LiveRegistry {
    /// `buffer` is the number of pushes queued per connection before new
    /// ones are dropped
    pub fn new(buffer: usize) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            buffer: buffer.max(1),
        }
    }

    /// Register a connection for `user_id`. A previous connection of the same
    /// user stops receiving pushes; its receiver sees the channel close.
    pub async fn register(&self, user_id: Uuid) -> LiveConnection {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();

        let mut connections = self.connections.write().await;
        if connections.insert(user_id, Entry { connection_id: id, sender }).is_some() {
            debug!(user_id = %user_id, "Replaced existing live connection");
        }
        metrics::set_live_connections(connections.len());
        info!(user_id = %user_id, connection_id = %id, "Live connection registered");

        LiveConnection { id, user_id, receiver }
    }

    /// Remove the registration if it still belongs to `connection_id`
    pub async fn unregister(&self, user_id: Uuid, connection_id: Uuid) -> bool {
        let mut connections = self.connections.write().await;
        let current = connections
            .get(&user_id)
            .is_some_and(|entry| entry.connection_id == connection_id);
        if current {
            connections.remove(&user_id);
            metrics::set_live_connections(connections.len());
            info!(user_id = %user_id, connection_id = %connection_id, "Live connection unregistered");
        }
        current
    }

    /// Queue `payload` for the user's connection. Returns false when the
    /// user is not connected or its buffer is full.
    pub async fn push(&self, user_id: Uuid, payload: LivePayload) -> bool {
        let sender = match self.connections.read().await.get(&user_id) {
            Some(entry) => entry.sender.clone(),
            None => {
                metrics::record_push(false);
                return false;
            }
        };

        let delivered = match sender.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(user_id = %user_id, "Live connection buffer full, push dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        };
        metrics::record_push(delivered);
        delivered
    }

    pub async fn connected_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Drop every registration; socket tasks see their channel close
    pub async fn close_all(&self) {
        let mut connections = self.connections.write().await;
        let count = connections.len();
        connections.clear();
        metrics::set_live_connections(0);
        info!(count, "Closed all live connections");
    }
}
