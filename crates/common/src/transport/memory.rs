//! In-process broker
//!
//! Behaves like a durable broker that outlives its sessions: queued and
//! in-flight messages survive [`MemoryBroker::simulate_disconnect`], and
//! unacknowledged deliveries are returned to their queue when the session
//! that took them dies.

use super::broker::{Broker, Connector, Delivery, Headers, OutboundMessage};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    body: String,
    headers: Headers,
    /// Times the message has been handed out
    deliveries: u32,
}

#[derive(Default)]
struct MemoryQueue {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<String, StoredMessage>,
}

#[derive(Default)]
struct State {
    epoch: u64,
    unavailable: bool,
    queues: HashMap<String, MemoryQueue>,
}

/// Shared broker state; cloning yields another handle to the same broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill every open session. In-flight messages go back to the front of
    /// their queue.
    pub async fn simulate_disconnect(&self) {
        let mut state = self.state.lock().await;
        state.epoch += 1;
        for queue in state.queues.values_mut() {
            let mut returned: Vec<StoredMessage> = queue.in_flight.drain().map(|(_, m)| m).collect();
            returned.sort_by(|a, b| a.id.cmp(&b.id));
            for message in returned.into_iter().rev() {
                queue.ready.push_front(message);
            }
        }
    }

    /// Refuse new sessions while false
    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.unavailable = !available;
    }

    /// Drop every declared queue, as a broker restart without durable
    /// declarations would
    pub async fn forget_topology(&self) {
        self.state.lock().await.queues.retain(|_, q| !q.ready.is_empty() || !q.in_flight.is_empty());
    }

    /// Messages waiting or in flight on `channel`
    pub async fn depth(&self, channel: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(channel)
            .map_or(0, |q| q.ready.len() + q.in_flight.len())
    }

    /// Bodies waiting on `channel`, oldest first
    pub async fn peek(&self, channel: &str) -> Vec<(String, Headers)> {
        self.state
            .lock()
            .await
            .queues
            .get(channel)
            .map(|q| q.ready.iter().map(|m| (m.body.clone(), m.headers.clone())).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Broker>> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(AppError::ConnectionLost {
                message: "memory broker unavailable".to_string(),
            });
        }
        Ok(Arc::new(MemorySession {
            state: self.state.clone(),
            epoch: state.epoch,
        }))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

struct MemorySession {
    state: Arc<Mutex<State>>,
    epoch: u64,
}

impl MemorySession {
    fn check(&self, state: &State) -> Result<()> {
        if state.epoch != self.epoch || state.unavailable {
            return Err(AppError::ConnectionLost {
                message: "memory broker session closed".to_string(),
            });
        }
        Ok(())
    }
}

fn undeclared(channel: &str) -> AppError {
    AppError::QueueError {
        message: format!("channel '{}' is not declared", channel),
    }
}

fn not_in_flight(delivery: &Delivery) -> AppError {
    AppError::QueueError {
        message: format!("delivery {} is no longer in flight", delivery.id),
    }
}

#[async_trait]
impl Broker for MemorySession {
    async fn declare(&self, channel: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        self.check(&state)?;
        state.queues.entry(channel.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, channel: &str, message: OutboundMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        self.check(&state)?;
        let queue = state.queues.get_mut(channel).ok_or_else(|| undeclared(channel))?;
        queue.ready.push_back(StoredMessage {
            // v7 ids sort by creation, keeping redelivery order stable
            id: Uuid::now_v7().to_string(),
            body: message.body,
            headers: message.headers,
            deliveries: 0,
        });
        Ok(())
    }

    async fn receive(&self, channel: &str, max: usize) -> Result<Vec<Delivery>> {
        let mut state = self.state.lock().await;
        self.check(&state)?;
        let queue = state.queues.get_mut(channel).ok_or_else(|| undeclared(channel))?;

        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let Some(mut message) = queue.ready.pop_front() else {
                break;
            };
            message.deliveries += 1;
            deliveries.push(Delivery {
                id: message.id.clone(),
                channel: channel.to_string(),
                body: message.body.clone(),
                headers: message.headers.clone(),
                attempt: message.deliveries,
                receipt: message.id.clone(),
            });
            queue.in_flight.insert(message.id.clone(), message);
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        self.check(&state)?;
        let queue = state
            .queues
            .get_mut(&delivery.channel)
            .ok_or_else(|| undeclared(&delivery.channel))?;
        queue
            .in_flight
            .remove(&delivery.receipt)
            .map(|_| ())
            .ok_or_else(|| not_in_flight(delivery))
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        self.check(&state)?;
        let queue = state
            .queues
            .get_mut(&delivery.channel)
            .ok_or_else(|| undeclared(&delivery.channel))?;
        let message = queue
            .in_flight
            .remove(&delivery.receipt)
            .ok_or_else(|| not_in_flight(delivery))?;
        queue.ready.push_back(message);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let state = self.state.lock().await;
        self.check(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session(broker: &MemoryBroker) -> Arc<dyn Broker> {
        let session = broker.connect().await.unwrap();
        session.declare("news_articles").await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_receive_respects_max() {
        let broker = MemoryBroker::new();
        let session = session(&broker).await;
        for i in 0..5 {
            session
                .publish("news_articles", OutboundMessage::new(i.to_string()))
                .await
                .unwrap();
        }

        let batch = session.receive("news_articles", 3).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].body, "0");
        assert_eq!(broker.depth("news_articles").await, 5);
    }

    #[tokio::test]
    async fn test_requeue_increments_attempt() {
        let broker = MemoryBroker::new();
        let session = session(&broker).await;
        session
            .publish("news_articles", OutboundMessage::new("x".into()))
            .await
            .unwrap();

        let first = session.receive("news_articles", 1).await.unwrap().remove(0);
        session.requeue(&first).await.unwrap();
        let second = session.receive("news_articles", 1).await.unwrap().remove(0);

        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_channel_fails() {
        let broker = MemoryBroker::new();
        let session = broker.connect().await.unwrap();
        let err = session
            .publish("nowhere", OutboundMessage::new("x".into()))
            .await
            .unwrap_err();
        assert!(!err.is_connection_lost());
    }

    #[tokio::test]
    async fn test_stale_session_reports_connection_lost() {
        let broker = MemoryBroker::new();
        let session = session(&broker).await;
        broker.simulate_disconnect().await;

        let err = session.ping().await.unwrap_err();
        assert!(err.is_connection_lost());
        assert!(broker.connect().await.unwrap().ping().await.is_ok());
    }
}
