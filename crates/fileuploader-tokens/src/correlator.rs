//! Correlates a request sent to a peer with the messages answering it.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::TokenError;
use crate::protocol::{Message, Peer};
use crate::utils::defer::defer;

/// What a matcher makes of an inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The message does not belong to this exchange.
    Skip,
    /// A fragment of the response. More fragments follow.
    Partial(String),
    /// The last fragment of the response.
    Complete(String),
    /// The exchange failed.
    Reject(TokenError),
}

/// Waits for the response to a request on `peer`.
///
/// The listener is registered immediately, so the request should be sent *after* calling this
/// and before awaiting the returned future. Every inbound message is passed to `matcher`, in
/// arrival order. Fragments are concatenated until a [`Verdict::Complete`] arrives, and the
/// future resolves to the whole payload.
///
/// The future fails with [`TokenError::Timeout`] if no complete response arrives within
/// `timeout`, and with [`TokenError::Disconnected`] if the peer stops delivering messages.
/// The listener is removed when the future resolves or is dropped.
pub fn await_response<P, M>(
    peer: &P,
    mut matcher: M,
    timeout: Duration,
) -> BoxFuture<'static, Result<String, TokenError>>
where
    P: Peer,
    M: FnMut(&Message) -> Verdict + Send + 'static,
{
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let listener = peer.subscribe(sender);
    let subscription = {
        let peer = peer.clone();
        defer(move || {
            tracing::trace!(?peer, ?listener, "Removing response listener");
            peer.unsubscribe(listener);
        })
    };

    Box::pin(async move {
        let _subscription = subscription;

        let exchange = async {
            let mut payload = String::new();
            while let Some(message) = receiver.recv().await {
                match matcher(&message) {
                    Verdict::Skip => {}
                    Verdict::Partial(fragment) => {
                        tracing::trace!(fragment_len = fragment.len(), "Received partial response");
                        payload.push_str(&fragment);
                    }
                    Verdict::Complete(fragment) => {
                        payload.push_str(&fragment);
                        return Ok(payload);
                    }
                    Verdict::Reject(err) => return Err(err),
                }
            }
            Err(TokenError::Disconnected)
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .unwrap_or(Err(TokenError::Timeout(timeout)))
    })
}
