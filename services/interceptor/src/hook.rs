//! Transport hook
//!
//! Decorators that put payload rewriting between a transport and the
//! application code listening on it. Both inbound paths are covered:
//! listeners registered with `add_message_listener` and the assignable
//! `onmessage` handler.
//!
//! Each decorated channel registers exactly one tap on the underlying
//! channel. The tap rewrites a frame once, then fans it out to the
//! decorator's own listeners, so the generator advances once per frame no
//! matter how many listeners exist or how often the handler is reassigned.
//!
//! Installation is best-effort. Decorating something that is already
//! intercepted is a no-op passthrough, and if the tap cannot be registered
//! the decorator logs the failure and delegates untouched.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use feed_core::config::SharedConfig;
use feed_core::rewriter::{Payload, RewriteStrategy};
use tracing::{debug, info, warn};

use crate::channel::{
    dispatch, listener, Listener, ListenerId, ListenerRegistry, MessageChannel, MessageEvent,
    ScriptLocator, SocketFactory, WorkerFactory, WorkerHandle, WorkerOptions,
};
use crate::error::TransportError;

/// User transformation applied to frames after mode logic.
pub type PayloadHook = Arc<dyn Fn(Payload) -> Payload + Send + Sync>;

/// Optional behaviour layered on top of the configured rewrite.
#[derive(Clone, Default)]
pub struct HookOptions {
    pub strategy: RewriteStrategy,
    /// Runs on every inbound frame after the generated value was applied.
    pub inbound: Option<PayloadHook>,
    /// Runs on every outbound frame; without it sends are unmodified.
    pub outbound: Option<PayloadHook>,
}

impl fmt::Debug for HookOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookOptions")
            .field("strategy", &self.strategy)
            .field("inbound", &self.inbound.is_some())
            .field("outbound", &self.outbound.is_some())
            .finish()
    }
}

/// Installs interception over channels and channel constructors.
#[derive(Debug, Clone)]
pub struct TransportHook {
    config: SharedConfig,
    options: HookOptions,
}

impl TransportHook {
    pub fn new(config: SharedConfig) -> Self {
        Self::with_options(config, HookOptions::default())
    }

    pub fn with_options(config: SharedConfig, options: HookOptions) -> Self {
        Self { config, options }
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Decorate a single channel.
    pub fn wrap<C: MessageChannel>(
        &self,
        channel: C,
        label: impl Into<String>,
    ) -> InterceptedChannel<C> {
        InterceptedChannel::new(channel, self.clone(), label.into())
    }

    /// Decorate a socket constructor.
    pub fn sockets<F: SocketFactory>(&self, factory: F) -> InterceptingSocketFactory<F> {
        if factory.is_intercepted() {
            warn!("Socket interception already installed; new hook will pass through");
        } else {
            info!(strategy = ?self.options.strategy, "Socket interception installed");
        }
        InterceptingSocketFactory {
            inner: factory,
            hook: self.clone(),
        }
    }

    /// Decorate a background-context constructor; applies to every port.
    pub fn workers<F: WorkerFactory>(&self, factory: F) -> InterceptingWorkerFactory<F> {
        if factory.is_intercepted() {
            warn!("Port interception already installed; new hook will pass through");
        } else {
            info!(strategy = ?self.options.strategy, "Port interception installed");
        }
        InterceptingWorkerFactory {
            inner: factory,
            hook: self.clone(),
        }
    }

    fn inbound(&self, data: Payload) -> Payload {
        let data = self.config.intercept(data, self.options.strategy);
        match &self.options.inbound {
            Some(hook) => hook(data),
            None => data,
        }
    }

    fn outbound(&self, data: Payload) -> Payload {
        match &self.options.outbound {
            Some(hook) => hook(data),
            None => data,
        }
    }
}

enum Interception {
    Active {
        registry: Rc<RefCell<ListenerRegistry>>,
        tap: ListenerId,
    },
    Passthrough,
}

/// A channel whose inbound frames are rewritten before application code sees them.
pub struct InterceptedChannel<C> {
    inner: C,
    hook: TransportHook,
    label: String,
    interception: Interception,
}

impl<C: MessageChannel> InterceptedChannel<C> {
    fn new(inner: C, hook: TransportHook, label: String) -> Self {
        if inner.is_intercepted() {
            debug!(channel = %label, "Channel already intercepted; passing through");
            return Self {
                inner,
                hook,
                label,
                interception: Interception::Passthrough,
            };
        }

        let registry = Rc::new(RefCell::new(ListenerRegistry::default()));
        let tap = {
            let registry = Rc::clone(&registry);
            let hook = hook.clone();
            let label = label.clone();
            listener(move |event: &MessageEvent| {
                let data = hook.inbound(event.data.clone());
                debug!(channel = %label, kind = data.kind(), data = %data.render(), "recv");
                dispatch(&registry, &MessageEvent { data });
            })
        };

        let interception = match inner.add_message_listener(tap) {
            Ok(tap) => {
                inner.start();
                Interception::Active { registry, tap }
            }
            Err(error) => {
                warn!(
                    channel = %label,
                    %error,
                    "Interception unavailable; channel left unmodified"
                );
                Interception::Passthrough
            }
        };

        Self {
            inner,
            hook,
            label,
            interception,
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Remove the tap and return the undecorated channel.
    pub fn into_inner(self) -> C {
        if let Interception::Active { tap, .. } = &self.interception {
            self.inner.remove_message_listener(*tap);
        }
        self.inner
    }
}

impl<C: MessageChannel> MessageChannel for InterceptedChannel<C> {
    fn add_message_listener(&self, listener: Listener) -> Result<ListenerId, TransportError> {
        match &self.interception {
            Interception::Active { registry, .. } => Ok(registry.borrow_mut().add(listener)),
            Interception::Passthrough => self.inner.add_message_listener(listener),
        }
    }

    fn remove_message_listener(&self, id: ListenerId) -> bool {
        match &self.interception {
            Interception::Active { registry, .. } => registry.borrow_mut().remove(id),
            Interception::Passthrough => self.inner.remove_message_listener(id),
        }
    }

    fn set_onmessage(&self, handler: Option<Listener>) {
        match &self.interception {
            Interception::Active { registry, .. } => registry.borrow_mut().set_handler(handler),
            Interception::Passthrough => self.inner.set_onmessage(handler),
        }
    }

    fn onmessage(&self) -> Option<Listener> {
        match &self.interception {
            Interception::Active { registry, .. } => registry.borrow().handler(),
            Interception::Passthrough => self.inner.onmessage(),
        }
    }

    fn post(&self, data: Payload) -> Result<(), TransportError> {
        match &self.interception {
            Interception::Active { .. } => {
                let data = self.hook.outbound(data);
                debug!(channel = %self.label, kind = data.kind(), data = %data.render(), "send");
                self.inner.post(data)
            }
            Interception::Passthrough => self.inner.post(data),
        }
    }

    fn start(&self) {
        self.inner.start();
    }

    fn dispatch_pending(&self) -> usize {
        self.inner.dispatch_pending()
    }

    fn is_intercepted(&self) -> bool {
        match &self.interception {
            Interception::Active { .. } => true,
            Interception::Passthrough => self.inner.is_intercepted(),
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for InterceptedChannel<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptedChannel")
            .field("label", &self.label)
            .field("active", &matches!(self.interception, Interception::Active { .. }))
            .field("inner", &self.inner)
            .finish()
    }
}

/// Socket constructor producing intercepted sockets.
#[derive(Debug)]
pub struct InterceptingSocketFactory<F> {
    inner: F,
    hook: TransportHook,
}

impl<F> InterceptingSocketFactory<F> {
    pub fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F: SocketFactory> SocketFactory for InterceptingSocketFactory<F> {
    type Socket = InterceptedChannel<F::Socket>;

    fn connect(&self, url: &str, protocols: &[&str]) -> Result<Self::Socket, TransportError> {
        let socket = self.inner.connect(url, protocols)?;
        Ok(self.hook.wrap(socket, url))
    }

    fn is_intercepted(&self) -> bool {
        true
    }
}

/// Background-context constructor whose consumer ports are intercepted.
#[derive(Debug)]
pub struct InterceptingWorkerFactory<F> {
    inner: F,
    hook: TransportHook,
}

impl<F> InterceptingWorkerFactory<F> {
    pub fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F: WorkerFactory> WorkerFactory for InterceptingWorkerFactory<F> {
    type Port = InterceptedChannel<F::Port>;

    fn spawn(
        &self,
        locator: &ScriptLocator,
        options: &WorkerOptions,
    ) -> Result<WorkerHandle<Self::Port>, TransportError> {
        let handle = self.inner.spawn(locator, options)?;
        let label = format!("{locator}#port");
        Ok(handle.map_port(|port| self.hook.wrap(port, label)))
    }

    fn is_intercepted(&self) -> bool {
        true
    }
}
