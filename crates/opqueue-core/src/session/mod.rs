//! OAuth2 session: holds the credential and performs refreshes.
//!
//! The session is owned by whoever built it (an SDK instance, the CLI);
//! queue managers only hold a `Weak` reference to it.
//!
//! # Thread Safety
//!
//! Credential reads take a std `RwLock` read guard and never block on a
//! refresh in flight. Refresh exchanges are serialized by an async mutex, so
//! two callers never send the same refresh token at once. The second caller
//! waits and then exchanges the token the first one stored.

mod credential;
mod refresh;

pub use credential::Credential;
pub use refresh::RefreshBody;

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::domain::RefreshError;
use crate::operation::Operation;
use crate::ports::{Clock, SystemClock, TokenExchange};

const EVENT_CAPACITY: usize = 64;

/// Lifecycle notifications published by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    RefreshStarted,
    TokensRefreshed { expires_at: DateTime<Utc> },
    RefreshFailed { reason: String },
    CredentialsRevoked,
}

pub struct OAuth2Session {
    credential: RwLock<Option<Credential>>,
    exchange: Arc<dyn TokenExchange>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    refresh_guard: Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
}

impl OAuth2Session {
    pub fn new(credential: Credential, exchange: Arc<dyn TokenExchange>) -> Self {
        Self::with_parts(
            Some(credential),
            exchange,
            Arc::new(SystemClock),
            SessionConfig::default(),
        )
    }

    pub fn with_parts(
        credential: Option<Credential>,
        exchange: Arc<dyn TokenExchange>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        if let Err(err) = config.validate() {
            warn!(error = %err, buffer_secs = config.expiry_buffer().num_seconds(), "expiry buffer clamped");
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            credential: RwLock::new(credential),
            exchange,
            clock,
            config,
            refresh_guard: Mutex::new(()),
            events,
        }
    }

    pub fn current_credential(&self) -> Option<Credential> {
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.current_credential().map(|c| c.access_token)
    }

    /// Has a credential whose access token is still usable?
    pub fn is_authorized(&self) -> bool {
        self.current_credential()
            .is_some_and(|c| c.expires_at > self.clock.now())
    }

    /// Should a refresh be scheduled before the next request?
    pub fn needs_refresh(&self) -> bool {
        self.current_credential().is_some_and(|c| {
            c.expires_within(self.clock.now(), self.config.expiry_buffer())
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Build a refresh operation bound to this session.
    pub fn refresh_operation(self: &Arc<Self>) -> Operation {
        Operation::refresh(
            "oauth2-refresh",
            Arc::new(RefreshBody::new(Arc::downgrade(self))),
        )
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// Emits `RefreshStarted`, then `TokensRefreshed` or `RefreshFailed`.
    pub async fn refresh(&self) -> Result<Credential, RefreshError> {
        let _exclusive = self.refresh_guard.lock().await;

        let refresh_token = self
            .current_credential()
            .and_then(|c| c.refresh_token)
            .ok_or(RefreshError::MissingRefreshToken)?;

        self.emit(SessionEvent::RefreshStarted);

        match self.exchange.exchange(&refresh_token).await {
            Ok(grant) => {
                let updated = self
                    .credential
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_mut()
                    .map(|credential| {
                        credential.apply(grant);
                        credential.clone()
                    });
                let Some(updated) = updated else {
                    // revoked while the exchange was in flight
                    let err = RefreshError::Exchange("credentials revoked".to_string());
                    self.emit(SessionEvent::RefreshFailed {
                        reason: err.to_string(),
                    });
                    return Err(err);
                };
                info!(expires_at = %updated.expires_at, "access token refreshed");
                self.emit(SessionEvent::TokensRefreshed {
                    expires_at: updated.expires_at,
                });
                Ok(updated)
            }
            Err(err) => {
                warn!(error = %err, "token refresh failed");
                self.emit(SessionEvent::RefreshFailed {
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Drop the stored credential.
    pub fn revoke(&self) {
        *self
            .credential
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        info!("credentials revoked");
        self.emit(SessionEvent::CredentialsRevoked);
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}
