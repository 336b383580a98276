//! Health check handlers

use crate::AppState;
use async_trait::async_trait;
use axum::{extract::State, Json};
use newswire_common::db::Repository;
use newswire_common::transport::Connection;
use newswire_common::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

/// A dependency the readiness probe checks
#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &'static str;
    async fn check(&self) -> Result<()>;
}

#[async_trait]
impl Probe for Repository {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn check(&self) -> Result<()> {
        self.ping().await
    }
}

#[async_trait]
impl Probe for Connection {
    fn name(&self) -> &'static str {
        "broker"
    }

    async fn check(&self) -> Result<()> {
        self.ping().await
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub checks: BTreeMap<&'static str, CheckResult>,
    pub live_connections: usize,
}

#[derive(Serialize)]
pub struct CheckResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Liveness probe - always returns healthy if server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

/// Readiness probe - checks all dependencies
pub async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    let mut checks = BTreeMap::new();
    for probe in state.probes.iter() {
        let start = Instant::now();
        let result = match probe.check().await {
            Ok(()) => CheckResult {
                status: "up".to_string(),
                latency_ms: Some(start.elapsed().as_millis() as u64),
                error: None,
            },
            Err(e) => CheckResult {
                status: "down".to_string(),
                latency_ms: None,
                error: Some(e.to_string()),
            },
        };
        checks.insert(probe.name(), result);
    }

    let all_healthy = checks.values().all(|check| check.status == "up");
    Json(ReadyResponse {
        status: if all_healthy { "ready" } else { "not_ready" }.to_string(),
        checks,
        live_connections: state.registry.connected_count().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use newswire_common::db::MemoryStore;
    use newswire_common::live::LiveRegistry;
    use newswire_common::transport::MemoryBroker;
    use newswire_common::RetryPolicy;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    async fn state(broker: &MemoryBroker) -> AppState {
        let connection = Connection::open(
            Arc::new(broker.clone()),
            RetryPolicy::new(1, 10),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        AppState {
            registry: LiveRegistry::new(8),
            notifications: Arc::new(MemoryStore::new()),
            probes: Arc::new(vec![Arc::new(connection) as Arc<dyn Probe>]),
        }
    }

    #[tokio::test]
    async fn test_health() {
        assert_eq!(health().await.0.status, "healthy");
    }

    #[tokio::test]
    async fn test_ready_reports_checks_and_connections() {
        let broker = MemoryBroker::new();
        let state = state(&broker).await;
        let _live = state.registry.register(Uuid::new_v4()).await;

        let response = ready(State(state)).await.0;
        assert_eq!(response.status, "ready");
        assert_eq!(response.checks["broker"].status, "up");
        assert_eq!(response.live_connections, 1);
    }

    #[tokio::test]
    async fn test_ready_reports_broker_down() {
        let broker = MemoryBroker::new();
        let state = state(&broker).await;
        broker.set_available(false).await;

        let response = ready(State(state)).await.0;
        assert_eq!(response.status, "not_ready");
        assert_eq!(response.checks["broker"].status, "down");
        assert!(response.checks["broker"].error.is_some());
    }
}
