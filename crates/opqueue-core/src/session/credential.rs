//! OAuth2 credential state.

use chrono::{DateTime, Duration, Utc};
use std::fmt;

use crate::ports::TokenGrant;

/// Access/refresh token pair plus the access token's expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: Some(refresh_token.into()),
            expires_at,
        }
    }

    /// Is the access token expired, or within `buffer` of expiring, at `now`?
    ///
    /// An expiry too close to the start of time to subtract `buffer` from
    /// counts as expired.
    pub fn expires_within(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        self.expires_at
            .checked_sub_signed(buffer)
            .is_none_or(|deadline| deadline <= now)
    }

    /// Apply a grant. A grant without a refresh token keeps the current one.
    pub fn apply(&mut self, grant: TokenGrant) {
        self.access_token = grant.access_token;
        if let Some(refresh_token) = grant.refresh_token {
            self.refresh_token = Some(refresh_token);
        }
        self.expires_at = grant.expires_at;
    }
}

// Tokens stay out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
