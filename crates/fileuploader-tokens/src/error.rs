use std::io;
use std::time::Duration;

use futures::channel::oneshot;
use thiserror::Error;

/// An error that happens while acquiring a token from a peer.
///
/// Errors are shared between all callers waiting on the same request, hence `Clone`.
/// Only [`Unsupported`](Self::Unsupported) is ever remembered; every other variant is
/// reported to the caller once and the next lookup tries again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// No complete response arrived in time.
    #[error("no response within {0:?}")]
    Timeout(Duration),
    /// The peer answered that it does not know the requested command.
    #[error("peer does not support {0}")]
    Unsupported(String),
    /// A cached token is older than allowed.
    ///
    /// This only ever triggers a new request and is not returned to callers.
    #[error("token is stale after {0:?}")]
    Stale(Duration),
    /// The peer rejected the request with a protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The peer answered, but the response is unusable.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The peer's message stream ended while waiting for the response.
    #[error("peer disconnected")]
    Disconnected,
    /// The request could not be sent to the peer.
    #[error("failed to send request: {0}")]
    SendFailed(String),
    /// An unexpected error in the token cache itself.
    #[error("internal error")]
    InternalError,
}

impl From<io::Error> for TokenError {
    fn from(err: io::Error) -> Self {
        Self::SendFailed(err.to_string())
    }
}

impl From<oneshot::Canceled> for TokenError {
    #[track_caller]
    fn from(err: oneshot::Canceled) -> Self {
        tracing::error!(error = &err as &dyn std::error::Error, "Token request dropped");
        Self::InternalError
    }
}

impl TokenError {
    /// A short, stable name of the error kind, for use in metric tags.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Unsupported(_) => "unsupported",
            Self::Stale(_) => "stale",
            Self::Protocol(_) => "protocol",
            Self::Malformed(_) => "malformed",
            Self::Disconnected => "disconnected",
            Self::SendFailed(_) => "send-failed",
            Self::InternalError => "internal",
        }
    }
}
