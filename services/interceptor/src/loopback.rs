//! In-memory point-to-point transport
//!
//! `LoopbackNetwork` hands out sockets whose far end is a `LoopbackPeer`
//! held by the test driver: the peer pushes server frames and inspects what
//! the application sent. Frames are queued until the context dispatches.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use feed_core::rewriter::Payload;
use tracing::debug;

use crate::channel::{
    dispatch, Listener, ListenerId, ListenerRegistry, MessageChannel, MessageEvent, SocketFactory,
};
use crate::error::TransportError;

#[derive(Debug)]
struct Connection {
    url: String,
    protocols: Vec<String>,
    inbox: VecDeque<Payload>,
    sent: Vec<Payload>,
    closed: bool,
}

/// Socket end held by application code.
#[derive(Debug)]
pub struct LoopbackSocket {
    connection: Rc<RefCell<Connection>>,
    registry: Rc<RefCell<ListenerRegistry>>,
}

impl LoopbackSocket {
    pub fn url(&self) -> String {
        self.connection.borrow().url.clone()
    }

    pub fn protocols(&self) -> Vec<String> {
        self.connection.borrow().protocols.clone()
    }
}

impl MessageChannel for LoopbackSocket {
    fn add_message_listener(&self, listener: Listener) -> Result<ListenerId, TransportError> {
        if self.connection.borrow().closed {
            return Err(TransportError::Closed);
        }
        Ok(self.registry.borrow_mut().add(listener))
    }

    fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.registry.borrow_mut().remove(id)
    }

    fn set_onmessage(&self, handler: Option<Listener>) {
        self.registry.borrow_mut().set_handler(handler);
    }

    fn onmessage(&self) -> Option<Listener> {
        self.registry.borrow().handler()
    }

    fn post(&self, data: Payload) -> Result<(), TransportError> {
        let mut connection = self.connection.borrow_mut();
        if connection.closed {
            return Err(TransportError::Closed);
        }
        connection.sent.push(data);
        Ok(())
    }

    fn dispatch_pending(&self) -> usize {
        let mut delivered = 0;
        loop {
            // Release the borrow before listeners run.
            let next = self.connection.borrow_mut().inbox.pop_front();
            let Some(data) = next else {
                break;
            };
            dispatch(&self.registry, &MessageEvent { data });
            delivered += 1;
        }
        delivered
    }
}

/// Server end of a loopback socket.
#[derive(Debug, Clone)]
pub struct LoopbackPeer {
    connection: Rc<RefCell<Connection>>,
}

impl LoopbackPeer {
    /// Queue a server frame for the application.
    pub fn push(&self, data: impl Into<Payload>) {
        let mut connection = self.connection.borrow_mut();
        if !connection.closed {
            connection.inbox.push_back(data.into());
        }
    }

    /// Frames the application has sent so far.
    pub fn sent(&self) -> Vec<Payload> {
        self.connection.borrow().sent.clone()
    }

    pub fn close(&self) {
        let mut connection = self.connection.borrow_mut();
        connection.closed = true;
        connection.inbox.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.connection.borrow().closed
    }
}

/// Socket constructor backed by in-memory connections.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    connections: Rc<RefCell<Vec<Rc<RefCell<Connection>>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server end of the most recent connection to `url`.
    pub fn peer(&self, url: &str) -> Option<LoopbackPeer> {
        self.connections
            .borrow()
            .iter()
            .rev()
            .find(|c| c.borrow().url == url)
            .map(|c| LoopbackPeer {
                connection: Rc::clone(c),
            })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.borrow().len()
    }
}

impl SocketFactory for LoopbackNetwork {
    type Socket = LoopbackSocket;

    fn connect(&self, url: &str, protocols: &[&str]) -> Result<LoopbackSocket, TransportError> {
        let connection = Rc::new(RefCell::new(Connection {
            url: url.to_string(),
            protocols: protocols.iter().map(|p| p.to_string()).collect(),
            inbox: VecDeque::new(),
            sent: Vec::new(),
            closed: false,
        }));
        self.connections.borrow_mut().push(Rc::clone(&connection));
        debug!(url, "Loopback socket connected");

        Ok(LoopbackSocket {
            connection,
            registry: Rc::new(RefCell::new(ListenerRegistry::default())),
        })
    }
}
