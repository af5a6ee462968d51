//! Helpers for testing token acquisition.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Tests depending on token age or timeouts should run with a paused clock, that is
//!    `#[tokio::test(start_paused = true)]`. Waiting on a [`MockPeer`] then never takes real time.
//!
//!  - A [`MockPeer`] does not answer anything by itself. Either deliver the server's replies with
//!    [`MockPeer::deliver`] once the request was sent, see [`MockPeer::wait_for_sends`], or install
//!    a responder with [`MockPeer::respond_with`].

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use fileuploader_tokens::protocol::{ListenerId, Listeners};
use fileuploader_tokens::{Message, Peer};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `fileuploader_tokens` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("fileuploader_tokens=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

type Responder = Box<dyn Fn(&Message) -> Vec<String> + Send + Sync>;

struct MockPeerInner {
    name: String,
    listeners: Listeners,
    sent: watch::Sender<Vec<Message>>,
    isupport: Mutex<BTreeMap<String, String>>,
    responder: Mutex<Option<Arc<Responder>>>,
    disconnected: AtomicBool,
}

/// An in-memory connection to a chat server.
///
/// Clones refer to the same connection. Two peers created separately are different connections,
/// even if they share a name.
#[derive(Clone)]
pub struct MockPeer {
    inner: Arc<MockPeerInner>,
}

impl MockPeer {
    /// Creates a connected peer that advertises `EXTJWT=1`.
    pub fn new(name: &str) -> Self {
        let peer = Self {
            inner: Arc::new(MockPeerInner {
                name: name.to_owned(),
                listeners: Listeners::new(),
                sent: watch::Sender::new(Vec::new()),
                isupport: Mutex::new(BTreeMap::new()),
                responder: Mutex::new(None),
                disconnected: AtomicBool::new(false),
            }),
        };
        peer.set_isupport("EXTJWT", Some("1"));
        peer
    }

    /// Sets or removes an advertised capability.
    pub fn set_isupport(&self, name: &str, value: Option<&str>) {
        let mut isupport = self.inner.isupport.lock().unwrap();
        match value {
            Some(value) => isupport.insert(name.to_owned(), value.to_owned()),
            None => isupport.remove(name),
        };
    }

    /// Answers every sent command with the lines returned by `responder`.
    ///
    /// The lines are delivered right away, before `send_raw` returns.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&Message) -> Vec<String> + Send + Sync + 'static,
    {
        *self.inner.responder.lock().unwrap() = Some(Arc::new(Box::new(responder)));
    }

    /// Delivers an inbound line to all listeners.
    pub fn deliver(&self, line: &str) {
        let message = Message::parse(line).unwrap_or_else(|| panic!("invalid line: {line:?}"));
        self.inner.listeners.dispatch(&message);
    }

    /// Drops the connection, ending the message stream of every listener.
    ///
    /// Sending fails from now on, and new listeners are closed right away.
    pub fn disconnect(&self) {
        self.inner.disconnected.store(true, Ordering::SeqCst);
        self.inner.listeners.clear();
    }

    /// All commands sent so far.
    pub fn sent(&self) -> Vec<Message> {
        self.inner.sent.borrow().clone()
    }

    /// The number of sent commands named `command`.
    pub fn sent_count(&self, command: &str) -> usize {
        self.inner
            .sent
            .borrow()
            .iter()
            .filter(|message| message.command == command)
            .count()
    }

    /// Waits until at least `count` commands were sent.
    pub async fn wait_for_sends(&self, count: usize) {
        let mut sent = self.inner.sent.subscribe();
        sent.wait_for(|sent| sent.len() >= count).await.unwrap();
    }

    /// The number of currently registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }
}

impl PartialEq for MockPeer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for MockPeer {}

impl Hash for MockPeer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.inner).hash(state);
    }
}

impl fmt::Debug for MockPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MockPeer").field(&self.inner.name).finish()
    }
}

impl Peer for MockPeer {
    fn subscribe(&self, sender: UnboundedSender<Message>) -> ListenerId {
        let id = self.inner.listeners.add(sender);
        if self.inner.disconnected.load(Ordering::SeqCst) {
            self.inner.listeners.remove(id);
        }
        id
    }

    fn unsubscribe(&self, id: ListenerId) {
        self.inner.listeners.remove(id);
    }

    fn send_raw(&self, command: &str, args: &[&str]) -> io::Result<()> {
        if self.inner.disconnected.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "disconnected"));
        }

        let message = Message::new(command, args.iter().copied());
        self.inner
            .sent
            .send_modify(|sent| sent.push(message.clone()));

        let responder = self.inner.responder.lock().unwrap().clone();
        if let Some(responder) = responder {
            for line in responder(&message) {
                self.deliver(&line);
            }
        }
        Ok(())
    }

    fn isupport(&self, name: &str) -> Option<String> {
        self.inner.isupport.lock().unwrap().get(name).cloned()
    }
}
