//! Transport capability traits
//!
//! A `MessageChannel` is anything inbound feed frames reach application code
//! through: a point-to-point socket or one consumer's port on a broadcast
//! context. Both expose the same two delivery paths, an explicit listener
//! registration and a single assignable handler slot.
//!
//! Channels live in a single-threaded execution context. Inbound frames are
//! queued by the transport and delivered when the context runs an event-loop
//! turn (`dispatch_pending`); delivery is synchronous and in arrival order.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use feed_core::rewriter::Payload;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransportError;

/// Inbound message delivered to application listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub data: Payload,
}

/// Application callback for inbound messages.
pub type Listener = Rc<dyn Fn(&MessageEvent)>;

/// Wrap a closure as a [`Listener`].
pub fn listener(f: impl Fn(&MessageEvent) + 'static) -> Listener {
    Rc::new(f)
}

/// Registration handle returned by `add_message_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Listener list plus the assignable handler slot.
///
/// The handler is stored as an ordinary listener; assigning a new one first
/// removes the previous registration so a frame reaches at most one handler.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: u64,
    listeners: Vec<(ListenerId, Listener)>,
    handler: Option<(ListenerId, Listener)>,
}

impl ListenerRegistry {
    pub fn add(&mut self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        if matches!(self.handler, Some((handler_id, _)) if handler_id == id) {
            self.handler = None;
        }
        self.listeners.len() != before
    }

    /// Replace the handler slot. `None` clears it.
    pub fn set_handler(&mut self, handler: Option<Listener>) {
        if let Some((previous, _)) = self.handler.take() {
            self.remove(previous);
        }
        if let Some(handler) = handler {
            let id = self.add(Rc::clone(&handler));
            self.handler = Some((id, handler));
        }
    }

    pub fn handler(&self) -> Option<Listener> {
        self.handler.as_ref().map(|(_, handler)| Rc::clone(handler))
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Listeners in registration order.
    pub fn snapshot(&self) -> Vec<Listener> {
        self.listeners.iter().map(|(_, l)| Rc::clone(l)).collect()
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listeners.len())
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Deliver `event` to every listener registered at the time of the call.
///
/// The registry is not borrowed while listeners run, so a listener may
/// register, remove or reassign handlers.
pub fn dispatch(registry: &RefCell<ListenerRegistry>, event: &MessageEvent) -> usize {
    let listeners = registry.borrow().snapshot();
    for listener in &listeners {
        listener(event);
    }
    listeners.len()
}

/// Capability interface shared by sockets, ports and their decorators.
pub trait MessageChannel {
    /// Register an inbound listener.
    fn add_message_listener(&self, listener: Listener) -> Result<ListenerId, TransportError>;

    fn remove_message_listener(&self, id: ListenerId) -> bool;

    /// Assign (or clear) the single inbound handler.
    fn set_onmessage(&self, handler: Option<Listener>);

    fn onmessage(&self) -> Option<Listener>;

    /// Send a message to the other end.
    fn post(&self, data: Payload) -> Result<(), TransportError>;

    /// Begin delivery on channels that queue until started.
    fn start(&self) {}

    /// Deliver every queued inbound frame. Returns the number of frames.
    fn dispatch_pending(&self) -> usize;

    /// Whether interception is already installed on this channel.
    fn is_intercepted(&self) -> bool {
        false
    }
}

/// Test driver: run event-loop turns until `expected` frames were delivered
/// or `timeout` elapses. Returns the number of frames delivered.
///
/// Polls every millisecond. Hosts with their own event loop call
/// `dispatch_pending` from it instead.
pub fn run_until<C: MessageChannel + ?Sized>(
    channel: &C,
    expected: usize,
    timeout: Duration,
) -> usize {
    let deadline = Instant::now() + timeout;
    let mut delivered = channel.dispatch_pending();
    while delivered < expected && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
        delivered += channel.dispatch_pending();
    }
    delivered
}

/// Constructor for point-to-point channels.
pub trait SocketFactory {
    type Socket: MessageChannel;

    fn connect(&self, url: &str, protocols: &[&str]) -> Result<Self::Socket, TransportError>;

    /// Whether sockets from this factory are already intercepted.
    fn is_intercepted(&self) -> bool {
        false
    }
}

/// Address of a loadable background script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScriptLocator(String);

impl ScriptLocator {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScriptLocator {
    fn from(locator: &str) -> Self {
        Self::new(locator)
    }
}

/// Options for constructing a background context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Contexts with the same locator and name are shared.
    pub name: Option<String>,
}

impl WorkerOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

/// A consumer's connection to a background context.
#[derive(Debug)]
pub struct WorkerHandle<P> {
    /// Background context identifier (shared across attached consumers).
    pub id: Uuid,
    /// Script the caller asked for.
    pub locator: ScriptLocator,
    /// This consumer's port.
    pub port: P,
}

impl<P> WorkerHandle<P> {
    pub fn map_port<Q>(self, f: impl FnOnce(P) -> Q) -> WorkerHandle<Q> {
        WorkerHandle {
            id: self.id,
            locator: self.locator,
            port: f(self.port),
        }
    }
}

/// Constructor for broadcast background contexts.
pub trait WorkerFactory {
    type Port: MessageChannel;

    fn spawn(
        &self,
        locator: &ScriptLocator,
        options: &WorkerOptions,
    ) -> Result<WorkerHandle<Self::Port>, TransportError>;

    /// Whether ports from this factory are already intercepted.
    fn is_intercepted(&self) -> bool {
        false
    }
}
