//! Background execution contexts
//!
//! A background context runs a registered script on its own thread. It
//! shares no memory with consumers: consumers talk to it only through their
//! port, and everything it posts is broadcast to every attached port.
//!
//! ```text
//!  consumer A ──port──┐                 ┌── broadcast ──► port A
//!                     ├── mpsc inbox ──►│ WorkerScope
//!  consumer B ──port──┘                 └── broadcast ──► port B
//! ```
//!
//! Contexts are shared by (locator, name): spawning an already running pair
//! attaches a new port instead of starting another thread.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use feed_core::rewriter::Payload;
use parking_lot::RwLock;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{
    dispatch, Listener, ListenerId, ListenerRegistry, MessageChannel, MessageEvent, ScriptLocator,
    WorkerFactory, WorkerHandle, WorkerOptions,
};
use crate::error::{ScriptError, TransportError};

/// Default number of frames buffered per consumer port.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Code loadable into a background context.
pub trait WorkerScript: Send + Sync {
    fn run(&self, scope: &mut WorkerScope) -> Result<(), ScriptError>;
}

impl<F> WorkerScript for F
where
    F: Fn(&mut WorkerScope) -> Result<(), ScriptError> + Send + Sync,
{
    fn run(&self, scope: &mut WorkerScope) -> Result<(), ScriptError> {
        self(scope)
    }
}

/// Wrap a closure as a loadable script.
pub fn script(
    f: impl Fn(&mut WorkerScope) -> Result<(), ScriptError> + Send + Sync + 'static,
) -> Arc<dyn WorkerScript> {
    Arc::new(f)
}

/// Locator → script table shared by factories and running contexts.
#[derive(Default)]
pub struct ScriptRegistry {
    scripts: RwLock<HashMap<ScriptLocator, Arc<dyn WorkerScript>>>,
}

impl ScriptRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `script` loadable under `locator`, replacing any previous entry.
    pub fn register(&self, locator: impl Into<ScriptLocator>, script: Arc<dyn WorkerScript>) {
        self.scripts.write().insert(locator.into(), script);
    }

    /// Forget `locator`. Contexts that already loaded it keep running.
    pub fn unregister(&self, locator: &ScriptLocator) -> bool {
        self.scripts.write().remove(locator).is_some()
    }

    /// Registered locators, sorted.
    pub fn locators(&self) -> Vec<ScriptLocator> {
        let mut locators: Vec<ScriptLocator> = self.scripts.read().keys().cloned().collect();
        locators.sort();
        locators
    }

    pub fn load(&self, locator: &ScriptLocator) -> Result<Arc<dyn WorkerScript>, ScriptError> {
        self.scripts
            .read()
            .get(locator)
            .cloned()
            .ok_or_else(|| ScriptError::NotFound {
                locator: locator.to_string(),
            })
    }
}

impl fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRegistry").field("scripts", &self.locators()).finish()
    }
}

/// Transformation applied to every outbound post from a context.
pub type PostFilter = Box<dyn FnMut(Payload) -> Payload + Send>;

/// Global scope of a running background context.
pub struct WorkerScope {
    id: Uuid,
    locator: ScriptLocator,
    registry: Arc<ScriptRegistry>,
    outbound: broadcast::Sender<Payload>,
    inbound: mpsc::UnboundedReceiver<Payload>,
    post_filter: Option<PostFilter>,
}

impl WorkerScope {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Locator this context was started with.
    pub fn locator(&self) -> &ScriptLocator {
        &self.locator
    }

    /// Install a filter over every subsequent `post` in this context.
    ///
    /// Filters compose: a later patch sees the output of earlier ones.
    pub fn patch_post(&mut self, filter: PostFilter) {
        self.post_filter = Some(match self.post_filter.take() {
            Some(mut earlier) => {
                let mut later = filter;
                Box::new(move |data| later(earlier(data)))
            }
            None => filter,
        });
    }

    pub fn is_post_patched(&self) -> bool {
        self.post_filter.is_some()
    }

    /// Broadcast to every attached port. Returns the number of receivers.
    pub fn post(&mut self, data: Payload) -> usize {
        let data = match self.post_filter.as_mut() {
            Some(filter) => filter(data),
            None => data,
        };
        debug!(worker_id = %self.id, kind = data.kind(), data = %data.render(), "Background post");
        self.outbound.send(data).unwrap_or(0)
    }

    /// Block until a consumer message arrives. `None` once every port and
    /// the owning factory are gone.
    pub fn recv(&mut self) -> Option<Payload> {
        self.inbound.blocking_recv()
    }

    /// Load and run another script synchronously in this scope.
    pub fn import_script(&mut self, locator: &ScriptLocator) -> Result<(), ScriptError> {
        let script = self.registry.load(locator)?;
        debug!(worker_id = %self.id, %locator, "Importing script");
        script.run(self)
    }
}

/// Consumer-side port of a background context.
///
/// Frames queue until the port is started; assigning a handler starts it.
pub struct WorkerPort {
    receiver: RefCell<broadcast::Receiver<Payload>>,
    sender: mpsc::UnboundedSender<Payload>,
    registry: Rc<RefCell<ListenerRegistry>>,
    started: Cell<bool>,
}

impl WorkerPort {
    fn new(receiver: broadcast::Receiver<Payload>, sender: mpsc::UnboundedSender<Payload>) -> Self {
        Self {
            receiver: RefCell::new(receiver),
            sender,
            registry: Rc::new(RefCell::new(ListenerRegistry::default())),
            started: Cell::new(false),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.get()
    }
}

impl fmt::Debug for WorkerPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPort")
            .field("registry", &self.registry.borrow())
            .field("started", &self.started.get())
            .finish()
    }
}

impl MessageChannel for WorkerPort {
    fn add_message_listener(&self, listener: Listener) -> Result<ListenerId, TransportError> {
        Ok(self.registry.borrow_mut().add(listener))
    }

    fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.registry.borrow_mut().remove(id)
    }

    fn set_onmessage(&self, handler: Option<Listener>) {
        self.registry.borrow_mut().set_handler(handler);
        self.start();
    }

    fn onmessage(&self) -> Option<Listener> {
        self.registry.borrow().handler()
    }

    fn post(&self, data: Payload) -> Result<(), TransportError> {
        self.sender.send(data).map_err(|_| TransportError::Closed)
    }

    fn start(&self) {
        self.started.set(true);
    }

    fn dispatch_pending(&self) -> usize {
        if !self.started.get() {
            return 0;
        }
        let mut delivered = 0;
        loop {
            let next = self.receiver.borrow_mut().try_recv();
            match next {
                Ok(data) => {
                    dispatch(&self.registry, &MessageEvent { data });
                    delivered += 1;
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Consumer port lagged behind broadcast buffer");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        delivered
    }
}

struct RunningContext {
    id: Uuid,
    outbound: broadcast::Sender<Payload>,
    inbound: mpsc::UnboundedSender<Payload>,
    alive: Arc<AtomicBool>,
}

/// Starts each background context on a dedicated thread.
pub struct ThreadWorkerFactory {
    registry: Arc<ScriptRegistry>,
    capacity: usize,
    contexts: RefCell<HashMap<(ScriptLocator, Option<String>), RunningContext>>,
}

impl ThreadWorkerFactory {
    pub fn new(registry: Arc<ScriptRegistry>) -> Self {
        Self::with_capacity(registry, DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(registry: Arc<ScriptRegistry>, capacity: usize) -> Self {
        Self {
            registry,
            capacity: capacity.max(1),
            contexts: RefCell::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ScriptRegistry> {
        &self.registry
    }

    /// Number of contexts whose script is still running.
    pub fn running_count(&self) -> usize {
        self.contexts
            .borrow()
            .values()
            .filter(|c| c.alive.load(Ordering::Acquire))
            .count()
    }
}

impl fmt::Debug for ThreadWorkerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadWorkerFactory")
            .field("capacity", &self.capacity)
            .field("contexts", &self.contexts.borrow().len())
            .finish()
    }
}

impl WorkerFactory for ThreadWorkerFactory {
    type Port = WorkerPort;

    fn spawn(
        &self,
        locator: &ScriptLocator,
        options: &WorkerOptions,
    ) -> Result<WorkerHandle<WorkerPort>, TransportError> {
        let key = (locator.clone(), options.name.clone());

        // Finished contexts are never reattached.
        self.contexts
            .borrow_mut()
            .retain(|_, context| context.alive.load(Ordering::Acquire));

        if let Some(context) = self.contexts.borrow().get(&key) {
            if context.alive.load(Ordering::Acquire) {
                debug!(worker_id = %context.id, %locator, "Attaching port to running context");
                return Ok(WorkerHandle {
                    id: context.id,
                    locator: locator.clone(),
                    port: WorkerPort::new(context.outbound.subscribe(), context.inbound.clone()),
                });
            }
        }

        let id = Uuid::now_v7();
        // The first port subscribes before the script starts so posts made
        // during its top-level evaluation are not lost.
        let (outbound, first_receiver) = broadcast::channel(self.capacity);
        let (inbound, inbox) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));

        let scope = WorkerScope {
            id,
            locator: locator.clone(),
            registry: Arc::clone(&self.registry),
            outbound: outbound.clone(),
            inbound: inbox,
            post_filter: None,
        };

        let thread_name = match &options.name {
            Some(name) => format!("worker-{name}"),
            None => format!("worker-{id}"),
        };
        // Resolved now so the script may be unregistered once spawn returns.
        let script = self.registry.load(locator);
        let running = Arc::clone(&alive);
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_context(scope, script, running))
            .map_err(|e| TransportError::Spawn(e.to_string()))?;

        info!(worker_id = %id, %locator, name = ?options.name, "Background context started");

        self.contexts.borrow_mut().insert(
            key,
            RunningContext {
                id,
                outbound,
                inbound: inbound.clone(),
                alive,
            },
        );

        Ok(WorkerHandle {
            id,
            locator: locator.clone(),
            port: WorkerPort::new(first_receiver, inbound),
        })
    }
}

fn run_context(
    mut scope: WorkerScope,
    script: Result<Arc<dyn WorkerScript>, ScriptError>,
    alive: Arc<AtomicBool>,
) {
    let locator = scope.locator().clone();
    match script.and_then(|script| script.run(&mut scope)) {
        Ok(()) => debug!(worker_id = %scope.id(), %locator, "Background script finished"),
        Err(error) => {
            error!(worker_id = %scope.id(), %locator, %error, "Background script failed")
        }
    }
    alive.store(false, Ordering::Release);
}
