//! Body of a refresh operation.

use std::sync::Weak;

use async_trait::async_trait;
use tracing::debug;

use super::OAuth2Session;
use crate::domain::{OperationError, RefreshError};
use crate::operation::{OperationBody, OperationContext};

/// Runs `OAuth2Session::refresh` if the session still exists.
pub struct RefreshBody {
    session: Weak<OAuth2Session>,
}

impl RefreshBody {
    pub fn new(session: Weak<OAuth2Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl OperationBody for RefreshBody {
    async fn run(&self, ctx: &OperationContext) -> Result<(), OperationError> {
        if ctx.is_cancelled() {
            debug!(operation_id = %ctx.operation_id(), "refresh cancelled before exchange");
            return Ok(());
        }
        let session = self
            .session
            .upgrade()
            .ok_or(RefreshError::SessionUnavailable)?;
        session.refresh().await?;
        Ok(())
    }
}
