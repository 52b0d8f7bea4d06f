use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{StorageError, StorageResult};

/// Per-request context: cancellation plus the caller identity stamped into
/// `createdBy`/`updatedBy`.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    token: CancellationToken,
    user: Option<String>,
}

impl RequestContext {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Derived context that is cancelled with this one but can also be
    /// cancelled on its own.
    pub fn child(&self) -> Self {
        Self { token: self.token.child_token(), user: self.user.clone() }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run `fut` unless the context is (or becomes) cancelled.
    pub async fn guard<F, T, E>(&self, fut: F) -> StorageResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<StorageError>,
    {
        if self.token.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(StorageError::Cancelled),
            res = fut => res.map_err(Into::into),
        }
    }
}
