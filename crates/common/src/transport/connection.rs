//! Long-lived broker connection with automatic recovery

use super::broker::{dead_letter_channel, inspection_channel, Broker, Connector, Delivery, OutboundMessage};
use crate::errors::{AppError, Result};
use crate::metrics;
use crate::retry::RetryPolicy;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// Owns the current broker session and the declared topology.
///
/// When an operation fails with `ConnectionLost`, the session is replaced
/// under the reconnect policy, every declared channel is declared again, and
/// the operation is attempted once more on the new session. Deliveries taken
/// from the old session are not acknowledged; the broker redelivers them.
pub struct Connection {
    connector: Arc<dyn Connector>,
    session: RwLock<Arc<dyn Broker>>,
    generation: AtomicU64,
    topology: Mutex<BTreeSet<String>>,
    reconnect_policy: RetryPolicy,
    operation_timeout: Duration,
}

impl Connection {
    /// Open the first session under the reconnect policy
    pub async fn open(
        connector: Arc<dyn Connector>,
        reconnect: RetryPolicy,
        operation_timeout: Duration,
    ) -> Result<Self> {
        let backend = connector.backend();
        let session = reconnect
            .retry("broker connect", || connector.connect())
            .await?;
        info!(backend, "Broker connection established");

        Ok(Self {
            connector,
            session: RwLock::new(session),
            generation: AtomicU64::new(0),
            topology: Mutex::new(BTreeSet::new()),
            reconnect_policy: reconnect,
            operation_timeout,
        })
    }

    /// Declare `channel` plus its dead-letter and inspection channels,
    /// remember them for redeclaration after a reconnect and take back what
    /// a previous run of this consumer left unacknowledged on `channel`
    pub async fn declare_channel(&self, channel: &str) -> Result<()> {
        let names = [
            channel.to_string(),
            dead_letter_channel(channel),
            inspection_channel(channel),
        ];
        for name in &names {
            self.run("declare", |broker| {
                let name = name.clone();
                async move { broker.declare(&name).await }
            })
            .await?;
        }
        self.topology.lock().await.extend(names);

        let recovered = self
            .run("recover", |broker| async move { broker.recover(channel).await })
            .await?;
        info!(channel, recovered, "Channel declared");
        Ok(())
    }

    pub async fn publish(&self, channel: &str, message: OutboundMessage) -> Result<()> {
        self.run("publish", |broker| {
            let message = message.clone();
            async move { broker.publish(channel, message).await }
        })
        .await
    }

    /// Serialize and publish one value under `policy`
    pub async fn publish_json<T: Serialize>(
        &self,
        channel: &str,
        value: &T,
        policy: &RetryPolicy,
    ) -> Result<()> {
        let message = OutboundMessage::json(value)?;
        policy
            .retry(&format!("publish to {}", channel), || {
                self.publish(channel, message.clone())
            })
            .await
    }

    pub async fn receive(&self, channel: &str, max: usize) -> Result<Vec<Delivery>> {
        self.run("receive", |broker| async move { broker.receive(channel, max).await })
            .await
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.run_once("ack", |broker| async move { broker.ack(delivery).await })
            .await
    }

    pub async fn requeue(&self, delivery: &Delivery) -> Result<()> {
        self.run_once("requeue", |broker| async move { broker.requeue(delivery).await })
            .await
    }

    pub async fn ping(&self) -> Result<()> {
        self.run_once("ping", |broker| async move { broker.ping().await })
            .await
    }

    pub fn backend(&self) -> &'static str {
        self.connector.backend()
    }

    /// Number of sessions replaced so far
    pub fn reconnects(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Run an operation, reconnecting and retrying once if the session died
    async fn run<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn Broker>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (session, generation) = self.current().await;
        match self.timed(operation, op(session)).await {
            Err(e) if e.is_connection_lost() => {
                warn!(operation, error = %e, "Broker session lost");
                self.reconnect(generation).await?;
                let (session, _) = self.current().await;
                self.timed(operation, op(session)).await
            }
            other => other,
        }
    }

    /// Settlement is bound to the session that produced the delivery, so a
    /// lost session is replaced but the operation is not repeated.
    async fn run_once<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Broker>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (session, generation) = self.current().await;
        let result = self.timed(operation, op(session)).await;
        if let Err(ref e) = result {
            if e.is_connection_lost() {
                warn!(operation, error = %e, "Broker session lost");
                self.reconnect(generation).await?;
            }
        }
        result
    }

    async fn current(&self) -> (Arc<dyn Broker>, u64) {
        let session = self.session.read().await;
        (session.clone(), self.generation.load(Ordering::SeqCst))
    }

    async fn timed<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.operation_timeout, fut)
            .await
            .map_err(|_| AppError::Timeout {
                operation: format!("broker {}", operation),
                timeout_ms: self.operation_timeout.as_millis() as u64,
            })?
    }

    /// Replace the session unless another task already did
    async fn reconnect(&self, failed_generation: u64) -> Result<()> {
        let mut session = self.session.write().await;
        if self.generation.load(Ordering::SeqCst) != failed_generation {
            return Ok(());
        }

        let result = self
            .reconnect_policy
            .retry("broker reconnect", || self.establish())
            .await;

        match result {
            Ok(fresh) => {
                *session = fresh;
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                metrics::record_reconnect(true);
                info!(backend = self.backend(), generation, "Broker connection re-established");
                Ok(())
            }
            Err(e) => {
                metrics::record_reconnect(false);
                error!(backend = self.backend(), error = %e, "Broker reconnect failed");
                Err(e)
            }
        }
    }

    /// Open a session and redeclare the topology. Deliveries still held by
    /// running handlers are not recovered here.
    async fn establish(&self) -> Result<Arc<dyn Broker>> {
        let fresh = self.connector.connect().await?;
        let topology: Vec<String> = self.topology.lock().await.iter().cloned().collect();
        for channel in &topology {
            self.timed("declare", fresh.declare(channel)).await?;
        }
        Ok(fresh)
    }
}
