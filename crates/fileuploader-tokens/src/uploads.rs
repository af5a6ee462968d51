//! Attaching tokens to outgoing uploads.

use std::collections::{BTreeMap, HashMap};

use futures::future;

use crate::protocol::{EXTJWT, Peer};
use crate::tokens::{TokenLookup, TokenManager};

/// Metadata key under which the token is sent to the file host.
pub const EXTJWT_METADATA_KEY: &str = "extjwt";

/// A file about to be uploaded on behalf of a connection.
#[derive(Clone, Debug)]
pub struct Upload<P> {
    /// The connection the upload belongs to.
    pub target: P,
    /// Metadata sent along with the upload.
    pub metadata: BTreeMap<String, String>,
}

impl<P> Upload<P> {
    pub fn new(target: P) -> Self {
        Upload {
            target,
            metadata: BTreeMap::new(),
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.metadata.get(EXTJWT_METADATA_KEY).map(String::as_str)
    }
}

/// What [`attach_tokens`] did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttachSummary {
    /// Uploads that carry a token now.
    pub attached: usize,
    /// Uploads whose connection does not support tokens.
    pub skipped: usize,
    /// Uploads for which acquiring a token failed.
    pub failed: usize,
}

fn advertises_extjwt<P: Peer>(peer: &P) -> bool {
    peer.isupport(EXTJWT).as_deref() == Some("1")
}

/// Attaches a token to every upload whose connection supports `EXTJWT`.
///
/// Uploads without a token are not dropped, they go out anonymously. Every connection is asked
/// at most once, no matter how many uploads belong to it.
pub async fn attach_tokens<P: Peer>(
    manager: &TokenManager<P>,
    uploads: &mut [Upload<P>],
) -> AttachSummary {
    let mut summary = AttachSummary::default();

    // Indices of uploads waiting on the token of a peer, by the position of the peer's request.
    let mut pending_peers: HashMap<P, usize> = HashMap::new();
    let mut requests = Vec::new();
    let mut waiting: Vec<Vec<usize>> = Vec::new();

    for (index, upload) in uploads.iter_mut().enumerate() {
        if !advertises_extjwt(&upload.target) {
            summary.skipped += 1;
            continue;
        }

        if let Some(&slot) = pending_peers.get(&upload.target) {
            waiting[slot].push(index);
            continue;
        }

        match manager.lookup(&upload.target) {
            TokenLookup::Ready(token) => {
                upload
                    .metadata
                    .insert(EXTJWT_METADATA_KEY.to_owned(), token.value);
                summary.attached += 1;
            }
            TokenLookup::Unsupported => summary.skipped += 1,
            TokenLookup::Pending(request) => {
                pending_peers.insert(upload.target.clone(), requests.len());
                requests.push(request);
                waiting.push(vec![index]);
            }
        }
    }

    let results = future::join_all(requests).await;

    for (result, indices) in results.into_iter().zip(waiting) {
        match result {
            Ok(Some(token)) => {
                for &index in &indices {
                    uploads[index]
                        .metadata
                        .insert(EXTJWT_METADATA_KEY.to_owned(), token.value.clone());
                }
                summary.attached += indices.len();
            }
            Ok(None) => summary.skipped += indices.len(),
            Err(err) => {
                let peer = &uploads[indices[0]].target;
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    ?peer,
                    uploads = indices.len(),
                    "Uploading without token"
                );
                summary.failed += indices.len();
            }
        }
    }

    metric!(counter("uploads.tokens") += summary.attached as i64, "result" => "attached");
    metric!(counter("uploads.tokens") += summary.skipped as i64, "result" => "skipped");
    metric!(counter("uploads.tokens") += summary.failed as i64, "result" => "failed");

    summary
}
