//! TokenExchange port: trades a refresh token for a new access token.
//!
//! The HTTP request itself lives outside this crate; the session only needs
//! something that turns a refresh token into a new grant.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::RefreshError;

/// Tokens returned by a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,

    /// `None` when the server does not rotate the refresh token.
    pub refresh_token: Option<String>,

    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError>;
}
