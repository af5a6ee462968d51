//! The chat protocol as far as token requests need it.
//!
//! A [`Message`] is a command with an ordered list of string parameters. Peers hand every inbound
//! message to all registered listeners and accept raw outbound commands, see [`Peer`].

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc::UnboundedSender;

/// The command requesting a token, and the command of the response carrying it.
pub const EXTJWT: &str = "EXTJWT";

/// Numeric reply for commands the server does not know.
pub const ERR_UNKNOWNCOMMAND: &str = "421";

/// Standard reply signalling that a command failed.
pub const FAIL: &str = "FAIL";

/// A single protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// The origin of the message, if any.
    pub prefix: Option<String>,
    /// The command or numeric reply, uppercased.
    pub command: String,
    /// Parameters in order, including the trailing one.
    pub params: Vec<String>,
}

impl Message {
    /// Creates a message without prefix.
    pub fn new<C, I, S>(command: C, params: I) -> Self
    where
        C: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Message {
            prefix: None,
            command: command.into().to_ascii_uppercase(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses a single line in IRC framing.
    ///
    /// Message tags are skipped. Returns `None` for lines without a command.
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim_end_matches(['\r', '\n']).trim_start_matches(' ');

        if rest.starts_with('@') {
            let (_tags, after) = rest.split_once(' ')?;
            rest = after.trim_start_matches(' ');
        }

        let mut prefix = None;
        if let Some(prefixed) = rest.strip_prefix(':') {
            let (origin, after) = prefixed.split_once(' ')?;
            prefix = Some(origin.to_owned());
            rest = after.trim_start_matches(' ');
        }

        let (command, mut rest) = rest.split_once(' ').unwrap_or((rest, ""));
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            match rest.split_once(' ') {
                Some((param, after)) => {
                    params.push(param.to_owned());
                    rest = after;
                }
                None => {
                    params.push(rest.to_owned());
                    break;
                }
            }
        }

        Some(Message {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Returns the parameter at `index`.
    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// Returns the last parameter.
    pub fn last_param(&self) -> Option<&str> {
        self.params.last().map(String::as_str)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }
        f.write_str(&self.command)?;

        if let Some((last, middle)) = self.params.split_last() {
            for param in middle {
                write!(f, " {param}")?;
            }
            if last.is_empty() || last.contains(' ') || last.starts_with(':') {
                write!(f, " :{last}")?;
            } else {
                write!(f, " {last}")?;
            }
        }
        Ok(())
    }
}

/// Identifies a registered listener, see [`Peer::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

/// A remote connection that tokens are requested from.
///
/// Peers are cheap handles: they are cloned into pending requests and used as cache keys, so
/// equality has to identify the connection rather than its current state.
pub trait Peer: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Registers a listener that receives every inbound message from now on, in arrival order.
    ///
    /// Dropping all senders of a peer ends the stream for its listeners.
    fn subscribe(&self, sender: UnboundedSender<Message>) -> ListenerId;

    /// Removes a listener registered with [`subscribe`](Self::subscribe).
    fn unsubscribe(&self, id: ListenerId);

    /// Sends a raw command with the given arguments.
    fn send_raw(&self, command: &str, args: &[&str]) -> io::Result<()>;

    /// Returns a capability the server advertised, like `EXTJWT=1`.
    fn isupport(&self, _name: &str) -> Option<String> {
        None
    }
}

/// A set of listeners for one peer.
///
/// Peer implementations can use this to fan inbound messages out to everyone subscribed.
#[derive(Debug, Default)]
pub struct Listeners {
    next_id: AtomicU64,
    senders: Mutex<BTreeMap<ListenerId, UnboundedSender<Message>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener and returns its id.
    pub fn add(&self, sender: UnboundedSender<Message>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, sender);
        id
    }

    /// Removes a listener, returning whether it was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Hands `message` to every listener.
    ///
    /// Listeners whose receiving side is gone are dropped.
    pub fn dispatch(&self, message: &Message) {
        self.lock()
            .retain(|_, sender| sender.send(message.clone()).is_ok());
    }

    /// Drops all listeners, which ends their message streams.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Returns the number of registered listeners.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ListenerId, UnboundedSender<Message>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
