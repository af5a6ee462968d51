//! A minimal IRC client connection.
//!
//! Just enough of the protocol to register a nick, stay connected, and pass every inbound
//! message on to token requests.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};

use fileuploader_tokens::correlator::{Verdict, await_response};
use fileuploader_tokens::protocol::{ListenerId, Listeners};
use fileuploader_tokens::{Message, Peer, TokenError};

/// Longest line accepted from the server, including message tags.
const MAX_LINE_LENGTH: usize = 8191;

const RPL_ISUPPORT: &str = "005";
const RPL_ENDOFMOTD: &str = "376";
const ERR_NOMOTD: &str = "422";
const ERR_ERRONEUSNICKNAME: &str = "432";
const ERR_NICKNAMEINUSE: &str = "433";

struct Connection {
    addr: String,
    listeners: Listeners,
    outgoing: mpsc::UnboundedSender<String>,
    isupport: Mutex<BTreeMap<String, String>>,
}

impl Connection {
    fn send_line(&self, line: String) -> io::Result<()> {
        tracing::trace!(addr = %self.addr, "> {line}");
        self.outgoing
            .send(line)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))
    }

    fn handle(&self, message: &Message) -> io::Result<()> {
        match message.command.as_str() {
            "PING" => {
                let pong = Message::new("PONG", message.params.iter().map(String::as_str));
                self.send_line(pong.to_string())?;
            }
            RPL_ISUPPORT => {
                // 005 <nick> <token>... :are supported by this server
                let tokens = message
                    .params
                    .iter()
                    .skip(1)
                    .take(message.params.len().saturating_sub(2));
                let mut isupport = self.isupport.lock().unwrap_or_else(PoisonError::into_inner);
                for token in tokens {
                    let (key, value) = token.split_once('=').unwrap_or((token, ""));
                    match key.strip_prefix('-') {
                        Some(removed) => isupport.remove(removed),
                        None => isupport.insert(key.to_ascii_uppercase(), value.to_owned()),
                    };
                }
            }
            _ => {}
        }

        self.listeners.dispatch(message);
        Ok(())
    }
}

/// A registered connection to an IRC server.
#[derive(Clone)]
pub struct IrcPeer {
    inner: Arc<Connection>,
}

impl IrcPeer {
    /// Connects to `addr` and registers as `nick`.
    ///
    /// Resolves once the server finished its welcome burst, so the advertised capabilities are
    /// known.
    pub async fn connect(addr: &str, nick: &str, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        tracing::info!(addr, "Connected");

        let peer = Self::from_stream(addr, stream);

        let welcome = await_response(&peer, match_registration, timeout);
        peer.send_raw("NICK", &[nick])?;
        peer.send_raw("USER", &[nick, "0", "*", nick])?;
        welcome.await.context("registration failed")?;

        tracing::info!(addr, nick, "Registered");
        Ok(peer)
    }

    /// Runs the protocol over an established stream.
    fn from_stream<S>(addr: &str, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut sink, mut lines) =
            Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)).split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();

        let peer = IrcPeer {
            inner: Arc::new(Connection {
                addr: addr.to_owned(),
                listeners: Listeners::new(),
                outgoing,
                isupport: Mutex::new(BTreeMap::new()),
            }),
        };

        tokio::spawn(async move {
            while let Some(line) = outgoing_rx.recv().await {
                if let Err(error) = sink.send(line).await {
                    tracing::warn!(error = &error as &dyn std::error::Error, "Failed to send");
                    break;
                }
            }
        });

        // The reader only holds on weakly, so the connection goes away with the last handle.
        let connection = Arc::downgrade(&peer.inner);
        tokio::spawn(async move {
            while let Some(line) = lines.next().await {
                let Some(inner) = connection.upgrade() else {
                    return;
                };
                let line = match line {
                    Ok(line) => line,
                    Err(error) => {
                        tracing::warn!(error = &error as &dyn std::error::Error, "Read failed");
                        break;
                    }
                };

                tracing::trace!(addr = %inner.addr, "< {line}");
                let Some(message) = Message::parse(&line) else {
                    continue;
                };
                if inner.handle(&message).is_err() {
                    break;
                }
            }

            if let Some(inner) = connection.upgrade() {
                tracing::info!(addr = %inner.addr, "Disconnected");
                inner.listeners.clear();
            }
        });

        peer
    }

    /// The address this peer is connected to.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Leaves the server.
    pub fn quit(&self, reason: &str) {
        self.send_raw("QUIT", &[reason]).ok();
    }
}

/// Waits for the end of the welcome burst, failing on rejected nicks.
fn match_registration(message: &Message) -> Verdict {
    match message.command.as_str() {
        RPL_ENDOFMOTD | ERR_NOMOTD => Verdict::Complete(String::new()),
        ERR_ERRONEUSNICKNAME | ERR_NICKNAMEINUSE => Verdict::Reject(TokenError::Protocol(
            message.last_param().unwrap_or_default().to_owned(),
        )),
        _ => Verdict::Skip,
    }
}

impl PartialEq for IrcPeer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for IrcPeer {}

impl Hash for IrcPeer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.inner).hash(state);
    }
}

impl fmt::Debug for IrcPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IrcPeer").field(&self.inner.addr).finish()
    }
}

impl Peer for IrcPeer {
    fn subscribe(&self, sender: mpsc::UnboundedSender<Message>) -> ListenerId {
        self.inner.listeners.add(sender)
    }

    fn unsubscribe(&self, id: ListenerId) {
        self.inner.listeners.remove(id);
    }

    fn send_raw(&self, command: &str, args: &[&str]) -> io::Result<()> {
        let message = Message::new(command, args.iter().copied());
        self.inner.send_line(message.to_string())
    }

    fn isupport(&self, name: &str) -> Option<String> {
        self.inner
            .isupport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name.to_ascii_uppercase())
            .cloned()
    }
}
