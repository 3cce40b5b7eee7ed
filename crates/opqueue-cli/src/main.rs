use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing_subscriber::EnvFilter;

use opqueue_core::domain::{OperationError, RefreshError};
use opqueue_core::ports::{TokenExchange, TokenGrant};
use opqueue_core::{
    Credential, OAuth2Session, Operation, OperationBody, OperationContext, QueueConfig,
    QueueManager, WorkerQueueManager,
};

/// Stand-in for the HTTP token endpoint: rotates both tokens on every call.
struct SimulatedTokenEndpoint {
    issued: AtomicU32,
}

#[async_trait]
impl TokenExchange for SimulatedTokenEndpoint {
    async fn exchange(&self, _refresh_token: &str) -> Result<TokenGrant, RefreshError> {
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(generation = n, "token endpoint called");
        Ok(TokenGrant {
            access_token: format!("access-{n}"),
            refresh_token: Some(format!("refresh-{n}")),
            expires_at: Utc::now() + Duration::hours(1),
        })
    }
}

/// Pretend API call: reports which access token it would have sent.
struct ApiCall {
    session: Arc<OAuth2Session>,
    endpoint: &'static str,
}

#[async_trait]
impl OperationBody for ApiCall {
    async fn run(&self, ctx: &OperationContext) -> Result<(), OperationError> {
        let token = self
            .session
            .access_token()
            .ok_or_else(|| OperationError::Failed("not authorized".to_string()))?;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tracing::info!(operation_id = %ctx.operation_id(), endpoint = self.endpoint, %token, "request sent");
        Ok(())
    }
}

fn load_config() -> Result<QueueConfig, Box<dyn std::error::Error>> {
    match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)?;
            Ok(QueueConfig::from_json_str(&json)?)
        }
        None => Ok(QueueConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = load_config()?;
    tracing::info!(?config, "opqueue demo starting");

    // (A) session whose access token is about to expire
    let session = Arc::new(OAuth2Session::new(
        Credential::new("access-0", "refresh-0", Utc::now() + Duration::seconds(5)),
        Arc::new(SimulatedTokenEndpoint {
            issued: AtomicU32::new(0),
        }),
    ));
    let mut events = session.subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!(?event, "session event");
        }
    });

    let manager = WorkerQueueManager::new(&session, config)?;

    // (B) refresh first, then the calls that must see the new token
    if session.needs_refresh() {
        manager.enqueue(session.refresh_operation());
    }
    let mut calls = Vec::new();
    for endpoint in ["/folders/0/items", "/users/me", "/files/42", "/events"] {
        let op = Operation::regular(
            endpoint,
            Arc::new(ApiCall {
                session: Arc::clone(&session),
                endpoint,
            }),
        );
        manager.enqueue(op.clone());
        calls.push(op);
    }
    tracing::info!(
        tracked = %serde_json::to_string(&manager.tracked_refresh_operations())?,
        "queued"
    );

    // (C) wait for the queue to drain
    manager.wait_until_idle().await;
    for op in &calls {
        tracing::info!(name = op.name(), state = %op.state(), outcome = ?op.outcome(), "final status");
    }

    // last session handle goes away here, which closes the event stream
    drop(calls);
    drop(manager);
    drop(session);
    let _ = event_log.await;
    Ok(())
}
