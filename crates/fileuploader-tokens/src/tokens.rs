//! Acquisition and caching of `EXTJWT` tokens per peer.
//!
//! For every peer, the [`TokenManager`] moves through these states:
//!
//! - *no record*: the first lookup requests a token, and the peer is *pending*.
//! - *pending*: lookups attach to the running request.
//! - *valid*: the token is younger than [`max_token_age`](TokenConfig::max_token_age) and is
//!   handed out without talking to the peer.
//! - *stale*: the token is too old; the next lookup requests a new one.
//! - *unsupported*: the peer answered that it does not know `EXTJWT`. Lookups return no token
//!   without talking to the peer until [`unsupported_ttl`](TokenConfig::unsupported_ttl) has
//!   passed, after which the peer is asked again.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::time::Instant;

use crate::caching::{CacheItemRequest, CacheLoader, Lookup};
use crate::config::TokenConfig;
use crate::correlator::{Verdict, await_response};
use crate::error::TokenError;
use crate::protocol::{ERR_UNKNOWNCOMMAND, EXTJWT, FAIL, Message, Peer};

/// The requested token target: the connection's own server.
const TARGET_ANY: &str = "*";

/// `EXTJWT <target> <service> * <chunk>`, with more chunks to follow.
const CONTINUATION_PARAMS: usize = 4;

/// A token handed out by a peer.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    /// The encoded token.
    pub value: String,
    /// When the token response was complete.
    pub acquired_at: Instant,
}

impl Token {
    /// Time since the token was acquired.
    pub fn age(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("len", &self.value.len())
            .field("age", &self.age())
            .finish()
    }
}

/// The result of [`TokenManager::lookup`].
pub enum TokenLookup {
    /// A valid cached token.
    Ready(Token),
    /// The peer does not support `EXTJWT`. Do not ask again for now.
    Unsupported,
    /// A token request is running.
    ///
    /// Resolves to `None` if the peer turns out to not support `EXTJWT`.
    Pending(BoxFuture<'static, Result<Option<Token>, TokenError>>),
}

impl TokenLookup {
    /// Waits for the token, if the request is still running.
    pub async fn resolve(self) -> Result<Option<Token>, TokenError> {
        match self {
            Self::Ready(token) => Ok(Some(token)),
            Self::Unsupported => Ok(None),
            Self::Pending(request) => request.await,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

impl fmt::Debug for TokenLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(token) => f.debug_tuple("Ready").field(token).finish(),
            Self::Unsupported => f.write_str("Unsupported"),
            Self::Pending(_) => f.write_str("Pending"),
        }
    }
}

/// Peers that answered `EXTJWT` with an unknown command reply, and when they did.
#[derive(Debug)]
struct UnsupportedPeers<P> {
    marks: Mutex<HashMap<P, Instant>>,
    ttl: Duration,
}

impl<P: Clone + Eq + Hash + fmt::Debug> UnsupportedPeers<P> {
    fn new(ttl: Duration) -> Self {
        Self {
            marks: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<P, Instant>> {
        self.marks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks for an unexpired mark, dropping it if it has expired.
    fn contains(&self, peer: &P) -> bool {
        let mut marks = self.lock();
        let Some(marked_at) = marks.get(peer) else {
            return false;
        };
        if marked_at.elapsed() <= self.ttl {
            return true;
        }
        marks.remove(peer);
        tracing::debug!(?peer, "Retrying EXTJWT on previously unsupported peer");
        false
    }

    /// Marks `peer` as unsupported, dropping all expired marks along the way.
    fn mark(&self, peer: &P) {
        let mut marks = self.lock();
        marks.retain(|_, marked_at| marked_at.elapsed() <= self.ttl);
        marks.insert(peer.clone(), Instant::now());
        let count = marks.len();
        drop(marks);

        metric!(counter("tokens.unsupported.marked") += 1);
        metric!(gauge("tokens.unsupported.peers") = count as u64);
    }

    fn remove(&self, peer: &P) -> bool {
        self.lock().remove(peer).is_some()
    }
}

/// Classifies a message as part of the response to `EXTJWT *`.
///
/// - `EXTJWT * ...` carries the token in its last parameter. With exactly four parameters more
///   chunks follow, with any other count it is the last chunk.
/// - `421 <nick> EXTJWT ...` means the server does not know the command.
/// - `FAIL EXTJWT <code> ... :<description>` means the request was rejected.
pub fn match_extjwt(message: &Message) -> Verdict {
    let names_extjwt = |index| {
        message
            .param(index)
            .is_some_and(|param| param.eq_ignore_ascii_case(EXTJWT))
    };

    match message.command.as_str() {
        EXTJWT if message.param(0) == Some(TARGET_ANY) => {
            let fragment = message.last_param().unwrap_or_default().to_owned();
            if message.params.len() == CONTINUATION_PARAMS {
                Verdict::Partial(fragment)
            } else {
                Verdict::Complete(fragment)
            }
        }
        ERR_UNKNOWNCOMMAND if names_extjwt(1) => {
            Verdict::Reject(TokenError::Unsupported(EXTJWT.to_owned()))
        }
        FAIL if names_extjwt(0) => {
            let code = message.param(1).unwrap_or("UNKNOWN");
            let description = message.last_param().unwrap_or_default();
            Verdict::Reject(TokenError::Protocol(format!("{code}: {description}")))
        }
        _ => Verdict::Skip,
    }
}

/// Requests a token from `peer` and waits for the complete response.
///
/// This always talks to the peer, use a [`TokenManager`] for caching.
pub async fn request_token<P: Peer>(
    peer: &P,
    service: Option<&str>,
    timeout: Duration,
) -> Result<Token, TokenError> {
    let start = Instant::now();

    let response = await_response(peer, match_extjwt, timeout);
    let mut args = vec![TARGET_ANY];
    args.extend(service);

    let result = match peer.send_raw(EXTJWT, &args) {
        Ok(()) => response.await,
        Err(err) => Err(err.into()),
    };
    let result = result.and_then(|value| {
        if value.is_empty() {
            return Err(TokenError::Malformed("empty token".into()));
        }
        Ok(Token {
            value,
            acquired_at: Instant::now(),
        })
    });

    let status = match &result {
        Ok(_) => "ok",
        Err(err) => err.metrics_tag(),
    };
    metric!(counter("tokens.request") += 1, "status" => status);
    metric!(timer("tokens.request.duration") = start.elapsed(), "status" => status);

    result
}

/// The [`CacheItemRequest`] loading tokens for a [`TokenManager`].
struct ExtjwtRequest<P> {
    config: TokenConfig,
    unsupported: Arc<UnsupportedPeers<P>>,
}

impl<P: Peer> CacheItemRequest for ExtjwtRequest<P> {
    type Key = P;
    type Item = Token;
    type Error = TokenError;

    const NAME: &'static str = "tokens";

    fn load(&self, peer: P) -> BoxFuture<'static, Result<Token, TokenError>> {
        let service = self.config.service.clone();
        let timeout = self.config.request_timeout;
        let unsupported = Arc::clone(&self.unsupported);

        Box::pin(async move {
            // The peer may have been marked by a request that finished right after the lookup
            // checked for it.
            if unsupported.contains(&peer) {
                tracing::debug!(?peer, "Not requesting a token from unsupported peer");
                return Err(TokenError::Unsupported(EXTJWT.to_owned()));
            }

            let result = request_token(&peer, service.as_deref(), timeout).await;
            match &result {
                Ok(token) => {
                    tracing::debug!(?peer, len = token.value.len(), "Acquired token");
                }
                Err(TokenError::Unsupported(_)) => {
                    tracing::info!(?peer, "Peer does not support EXTJWT");
                    unsupported.mark(&peer);
                }
                Err(err) => {
                    tracing::warn!(
                        error = err as &dyn std::error::Error,
                        ?peer,
                        "Failed to acquire token"
                    );
                }
            }
            result
        })
    }

    fn validate(&self, token: &Token) -> Result<(), TokenError> {
        let age = token.age();
        if age > self.config.max_token_age {
            return Err(TokenError::Stale(age));
        }
        Ok(())
    }
}

/// Hands out `EXTJWT` tokens per peer.
///
/// Tokens are cached while fresh, concurrent lookups for the same peer share one request, and
/// peers that do not know the command are left alone for a while. Every manager owns its state;
/// independent managers never share tokens.
pub struct TokenManager<P: Peer> {
    tokens: CacheLoader<ExtjwtRequest<P>>,
    unsupported: Arc<UnsupportedPeers<P>>,
}

impl<P: Peer> Clone for TokenManager<P> {
    fn clone(&self) -> Self {
        TokenManager {
            tokens: self.tokens.clone(),
            unsupported: Arc::clone(&self.unsupported),
        }
    }
}

impl<P: Peer> fmt::Debug for TokenManager<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("tokens", &self.tokens)
            .field("unsupported", &self.unsupported)
            .finish()
    }
}

impl<P: Peer> TokenManager<P> {
    pub fn new(config: TokenConfig) -> Self {
        let unsupported = Arc::new(UnsupportedPeers::new(config.unsupported_ttl));
        let request = ExtjwtRequest {
            config,
            unsupported: Arc::clone(&unsupported),
        };
        TokenManager {
            tokens: CacheLoader::new(request),
            unsupported,
        }
    }

    pub fn config(&self) -> &TokenConfig {
        &self.tokens.request().config
    }

    /// Returns the token for `peer` if it is at hand, or the request that will produce it.
    ///
    /// This never blocks. A request is only started if there is no fresh token, no running
    /// request and the peer is not known to lack `EXTJWT` support.
    pub fn lookup(&self, peer: &P) -> TokenLookup {
        if self.unsupported.contains(peer) {
            metric!(counter("tokens.unsupported.hit") += 1);
            return TokenLookup::Unsupported;
        }

        match self.tokens.lookup(peer) {
            Lookup::Cached(token) => TokenLookup::Ready(token),
            Lookup::Loading(load) => TokenLookup::Pending(
                load.map(|result| match result {
                    Ok(token) => Ok(Some(token)),
                    Err(TokenError::Unsupported(_)) => Ok(None),
                    Err(err) => Err(err),
                })
                .boxed(),
            ),
        }
    }

    /// Returns the token for `peer`, requesting one if necessary.
    ///
    /// `Ok(None)` means the peer does not support `EXTJWT`. Errors are not remembered, the next
    /// call asks the peer again.
    pub async fn get(&self, peer: &P) -> Result<Option<Token>, TokenError> {
        self.lookup(peer).resolve().await
    }

    /// Checks whether `peer` recently answered that it does not support `EXTJWT`.
    pub fn is_unsupported(&self, peer: &P) -> bool {
        self.unsupported.contains(peer)
    }

    /// Forgets everything known about `peer`, for example after it reconnected.
    ///
    /// The manager holds on to every peer it handed out a token for. Call this once a peer is
    /// disconnected, so its connection can be released. A running request is not affected.
    pub fn forget(&self, peer: &P) {
        let had_token = self.tokens.invalidate(peer).is_some();
        let was_unsupported = self.unsupported.remove(peer);
        tracing::debug!(?peer, had_token, was_unsupported, "Forgot peer");
    }
}
