//! Background bootstrap proxy
//!
//! Messages produced inside a background context never pass through the
//! consumer's memory, so the consumer-side hook cannot reach them before
//! they are broadcast. Instead, the proxy starts the context on a
//! synthesised bootstrap unit that runs in two phases:
//!
//! 1. **patch**: restore the frozen configuration snapshot and install a
//!    scope-level post filter. Every post made from here on, including posts
//!    made during the original script's top-level evaluation, goes through
//!    the rewriter.
//! 2. **load**: run the original script synchronously in the same scope.
//!
//! The snapshot is taken when the context is spawned. Later controller
//! changes in the consumer context are not visible to the background
//! context until a new one is spawned.

use std::sync::Arc;

use feed_core::config::{InterceptConfig, SharedConfig};
use feed_core::rewriter::RewriteStrategy;
use feed_core::snapshot::ConfigSnapshot;
use tracing::{debug, info, warn};

use crate::channel::{ScriptLocator, WorkerFactory, WorkerHandle, WorkerOptions};
use crate::error::{ScriptError, TransportError};
use crate::worker::{ScriptRegistry, WorkerScope, WorkerScript};

/// Locator prefix of synthesised bootstrap units.
pub const BOOTSTRAP_PREFIX: &str = "bootstrap:";

/// Loadable unit that patches a background context and then runs the
/// original script inside it.
#[derive(Debug, Clone)]
pub struct BootstrapUnit {
    snapshot: ConfigSnapshot,
    original: ScriptLocator,
    strategy: RewriteStrategy,
}

impl BootstrapUnit {
    /// Freeze the live configuration for `original`.
    pub fn synthesize(
        config: &SharedConfig,
        original: &ScriptLocator,
        strategy: RewriteStrategy,
    ) -> Result<Self, ScriptError> {
        Ok(Self {
            snapshot: config.snapshot()?,
            original: original.clone(),
            strategy,
        })
    }

    /// `bootstrap:<digest>:<original>`; identical snapshots share a locator.
    pub fn locator(&self) -> ScriptLocator {
        ScriptLocator::new(format!(
            "{BOOTSTRAP_PREFIX}{}:{}",
            self.snapshot.short_digest(),
            self.original
        ))
    }

    pub fn original(&self) -> &ScriptLocator {
        &self.original
    }

    pub fn snapshot(&self) -> &ConfigSnapshot {
        &self.snapshot
    }

    fn patch(&self, scope: &mut WorkerScope) -> Result<(), ScriptError> {
        let mut config: InterceptConfig = self.snapshot.restore()?;
        let strategy = self.strategy;
        scope.patch_post(Box::new(move |data| config.intercept(data, strategy)));
        Ok(())
    }
}

impl WorkerScript for BootstrapUnit {
    fn run(&self, scope: &mut WorkerScope) -> Result<(), ScriptError> {
        match self.patch(scope) {
            Ok(()) => debug!(
                worker_id = %scope.id(),
                original = %self.original,
                digest = self.snapshot.short_digest(),
                "Background post patched"
            ),
            Err(error) => warn!(
                worker_id = %scope.id(),
                original = %self.original,
                %error,
                "Background patch skipped; posts will not be rewritten"
            ),
        }
        scope.import_script(&self.original)
    }
}

/// Background-context constructor that starts every context on a bootstrap
/// unit. Same signature and handle shape as the factory it wraps.
#[derive(Debug)]
pub struct BootstrapWorkerFactory<F> {
    inner: F,
    registry: Arc<ScriptRegistry>,
    config: SharedConfig,
    strategy: RewriteStrategy,
}

impl<F: WorkerFactory> BootstrapWorkerFactory<F> {
    /// `registry` must be the one `inner` loads scripts from, and `inner`
    /// must resolve a locator before `spawn` returns.
    pub fn new(inner: F, registry: Arc<ScriptRegistry>, config: SharedConfig) -> Self {
        info!("Background bootstrap proxy installed");
        Self {
            inner,
            registry,
            config,
            strategy: RewriteStrategy::DeepSweep,
        }
    }

    pub fn with_strategy(mut self, strategy: RewriteStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    fn spawn_bootstrapped(
        &self,
        locator: &ScriptLocator,
        options: &WorkerOptions,
    ) -> Result<WorkerHandle<F::Port>, TransportError> {
        let unit = BootstrapUnit::synthesize(&self.config, locator, self.strategy)
            .map_err(|e| TransportError::Bootstrap(e.to_string()))?;
        let bootstrap = unit.locator();
        self.registry.register(bootstrap.clone(), Arc::new(unit));

        // A started context has already resolved its script.
        let spawned = self.inner.spawn(&bootstrap, options);
        self.registry.unregister(&bootstrap);
        let mut handle = spawned?;
        debug!(worker_id = %handle.id, %locator, %bootstrap, "Background context bootstrapped");
        handle.locator = locator.clone();
        Ok(handle)
    }
}

impl<F: WorkerFactory> WorkerFactory for BootstrapWorkerFactory<F> {
    type Port = F::Port;

    fn spawn(
        &self,
        locator: &ScriptLocator,
        options: &WorkerOptions,
    ) -> Result<WorkerHandle<Self::Port>, TransportError> {
        if locator.as_str().starts_with(BOOTSTRAP_PREFIX) {
            return self.inner.spawn(locator, options);
        }
        match self.spawn_bootstrapped(locator, options) {
            Ok(handle) => Ok(handle),
            Err(error) => {
                warn!(%locator, %error, "Bootstrap failed; starting original script");
                self.inner.spawn(locator, options)
            }
        }
    }

    fn is_intercepted(&self) -> bool {
        self.inner.is_intercepted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{listener, run_until, MessageChannel};
    use crate::worker::{script, ThreadWorkerFactory, WorkerPort};
    use feed_core::config::{Mode, SymbolOverride};
    use feed_core::rewriter::Payload;
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::thread;
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);
    const FEED: &str = "/feed-worker";

    fn collecting(port: &impl MessageChannel) -> Rc<RefCell<Vec<Payload>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        port.set_onmessage(Some(listener(move |ev| sink.borrow_mut().push(ev.data.clone()))));
        seen
    }

    /// Posts two value frames during top-level evaluation.
    fn feed_registry() -> Arc<ScriptRegistry> {
        let registry = ScriptRegistry::new();
        registry.register(
            FEED,
            script(|scope| {
                scope.post(Payload::from(r#"{"value":0.5}"#));
                scope.post(Payload::from(r#"{"value":0.6}"#));
                Ok(())
            }),
        );
        registry
    }

    fn proxied(
        registry: &Arc<ScriptRegistry>,
        config: &SharedConfig,
    ) -> BootstrapWorkerFactory<ThreadWorkerFactory> {
        BootstrapWorkerFactory::new(
            ThreadWorkerFactory::new(Arc::clone(registry)),
            Arc::clone(registry),
            config.clone(),
        )
    }

    #[test]
    fn test_top_level_posts_are_rewritten() {
        let registry = feed_registry();
        let config = SharedConfig::new(InterceptConfig::series(
            Mode::Increasing,
            Decimal::from(100),
            Decimal::ONE,
        ));
        let factory = proxied(&registry, &config);

        let handle = factory.spawn(&ScriptLocator::from(FEED), &WorkerOptions::default()).unwrap();
        assert_eq!(handle.locator.as_str(), FEED);
        let seen = collecting(&handle.port);
        assert_eq!(run_until(&handle.port, 2, WAIT), 2);

        assert_eq!(
            *seen.borrow(),
            vec![Payload::from(r#"{"value":100}"#), Payload::from(r#"{"value":101}"#)]
        );
        // The background context advances its own copy only.
        assert_eq!(config.get().generator.current, Decimal::from(100));
    }

    #[test]
    fn test_snapshot_is_frozen_at_spawn() {
        let registry = ScriptRegistry::new();
        registry.register(
            FEED,
            script(|scope| {
                while let Some(request) = scope.recv() {
                    if request == Payload::from("stop") {
                        break;
                    }
                    scope.post(Payload::from(r#"{"value":0}"#));
                }
                Ok(())
            }),
        );
        let config = SharedConfig::new(InterceptConfig::constant(Decimal::from(5)));
        let factory = proxied(&registry, &config);
        let handle = factory.spawn(&ScriptLocator::from(FEED), &WorkerOptions::default()).unwrap();
        let seen = collecting(&handle.port);

        config.set_constant(Decimal::from(9));
        handle.port.post(Payload::from("tick")).unwrap();
        assert_eq!(run_until(&handle.port, 1, WAIT), 1);
        handle.port.post(Payload::from("stop")).unwrap();

        assert_eq!(*seen.borrow(), vec![Payload::from(r#"{"value":5}"#)]);
    }

    #[test]
    fn test_deep_sweep_rewrites_nested_ticks() {
        let registry = ScriptRegistry::new();
        registry.register(
            FEED,
            script(|scope| {
                let frame = json!({
                    "channel": "quotes",
                    "data": {
                        "batch": [
                            {"sl": "XAUUSD", "ba": [1.0, 1.1]},
                            {"sl": "EURUSD", "ba": [2.0, 2.1]}
                        ]
                    }
                });
                scope.post(Payload::Json(frame));
                Ok(())
            }),
        );
        let mut initial = InterceptConfig::constant(Decimal::from(3380));
        initial.symbol_override = Some(SymbolOverride::spread("XAUUSD", Decimal::new(5, 1)));
        let config = SharedConfig::new(initial);
        let factory = proxied(&registry, &config);

        let handle = factory.spawn(&ScriptLocator::from(FEED), &WorkerOptions::default()).unwrap();
        let seen = collecting(&handle.port);
        assert_eq!(run_until(&handle.port, 1, WAIT), 1);

        let expected = json!({
            "channel": "quotes",
            "data": {
                "batch": [
                    {"sl": "XAUUSD", "ba": [3379.5, 3380.5]},
                    {"sl": "EURUSD", "ba": [2.0, 2.1]}
                ]
            }
        });
        assert_eq!(*seen.borrow(), vec![Payload::Json(expected)]);
    }

    #[test]
    fn test_unchanged_config_shares_context() {
        let registry = ScriptRegistry::new();
        registry.register(
            FEED,
            script(|scope| {
                while scope.recv().is_some() {}
                Ok(())
            }),
        );
        let config = SharedConfig::new(InterceptConfig::constant(Decimal::ONE));
        let factory = proxied(&registry, &config);
        let locator = ScriptLocator::from(FEED);
        let options = WorkerOptions::named("ws-shared");

        let unit =
            BootstrapUnit::synthesize(&config, &locator, RewriteStrategy::DeepSweep).unwrap();
        assert!(unit.locator().as_str().starts_with(BOOTSTRAP_PREFIX));
        assert!(unit.locator().as_str().ends_with(FEED));

        let first = factory.spawn(&locator, &options).unwrap();
        let second = factory.spawn(&locator, &options).unwrap();
        config.set_constant(Decimal::TWO);
        let third = factory.spawn(&locator, &options).unwrap();

        assert_eq!(registry.locators(), vec![locator.clone()]);
        assert_eq!(first.id, second.id);
        assert_ne!(first.id, third.id);
        assert_eq!(third.locator, locator);
    }

    #[test]
    fn test_nested_proxy_bootstraps_once() {
        let registry = ScriptRegistry::new();
        registry.register(
            FEED,
            script(|scope| {
                scope.post(Payload::from(r#"{"ts":1,"value":0.5}"#));
                Ok(())
            }),
        );
        // The inner layer would rewrite `ts` if it bootstrapped too.
        let mut inner = InterceptConfig::constant(Decimal::TWO);
        inner.value_key = "ts".to_string();
        let outer = SharedConfig::new(InterceptConfig::constant(Decimal::from(10)));
        let factory = BootstrapWorkerFactory::new(
            proxied(&registry, &SharedConfig::new(inner)),
            Arc::clone(&registry),
            outer,
        );

        let handle = factory.spawn(&ScriptLocator::from(FEED), &WorkerOptions::default()).unwrap();
        assert_eq!(handle.locator.as_str(), FEED);
        let seen = collecting(&handle.port);
        assert_eq!(run_until(&handle.port, 1, WAIT), 1);

        assert_eq!(*seen.borrow(), vec![Payload::from(r#"{"ts":1,"value":10}"#)]);
        assert_eq!(registry.locators(), vec![ScriptLocator::from(FEED)]);
    }

    #[test]
    fn test_finished_contexts_are_pruned() {
        let registry = feed_registry();
        let config = SharedConfig::new(InterceptConfig::series(
            Mode::Increasing,
            Decimal::ZERO,
            Decimal::ONE,
        ));
        let factory = proxied(&registry, &config);
        let locator = ScriptLocator::from(FEED);

        for step in 0..5 {
            config.set_series(Mode::Increasing, Decimal::from(step), Decimal::ONE);
            let handle = factory.spawn(&locator, &WorkerOptions::default()).unwrap();
            let seen = collecting(&handle.port);
            assert_eq!(run_until(&handle.port, 2, WAIT), 2);
            assert_eq!(seen.borrow()[0], Payload::from(format!(r#"{{"value":{step}}}"#)));
        }

        let deadline = Instant::now() + WAIT;
        while factory.inner().running_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        factory.spawn(&locator, &WorkerOptions::default()).unwrap();

        assert_eq!(registry.locators(), vec![locator]);
        assert!(format!("{:?}", factory.inner()).contains("contexts: 1"));
    }

    /// Refuses to start anything but the original scripts.
    struct NoBootstrap(ThreadWorkerFactory);

    impl WorkerFactory for NoBootstrap {
        type Port = WorkerPort;

        fn spawn(
            &self,
            locator: &ScriptLocator,
            options: &WorkerOptions,
        ) -> Result<WorkerHandle<Self::Port>, TransportError> {
            if locator.as_str().starts_with(BOOTSTRAP_PREFIX) {
                return Err(TransportError::Unsupported("blob locators".to_string()));
            }
            self.0.spawn(locator, options)
        }
    }

    #[test]
    fn test_falls_back_to_original_script() {
        let registry = feed_registry();
        let config = SharedConfig::new(InterceptConfig::constant(Decimal::from(42)));
        let factory = BootstrapWorkerFactory::new(
            NoBootstrap(ThreadWorkerFactory::new(Arc::clone(&registry))),
            Arc::clone(&registry),
            config,
        );

        let handle = factory.spawn(&ScriptLocator::from(FEED), &WorkerOptions::default()).unwrap();
        let seen = collecting(&handle.port);
        assert_eq!(run_until(&handle.port, 2, WAIT), 2);
        assert_eq!(
            *seen.borrow(),
            vec![Payload::from(r#"{"value":0.5}"#), Payload::from(r#"{"value":0.6}"#)]
        );
    }

    #[test]
    fn test_missing_original_script_delivers_nothing() {
        let registry = ScriptRegistry::new();
        let config = SharedConfig::new(InterceptConfig::constant(Decimal::ONE));
        let factory = proxied(&registry, &config);

        let handle = factory
            .spawn(&ScriptLocator::from("/missing.js"), &WorkerOptions::default())
            .unwrap();
        let seen = collecting(&handle.port);
        assert_eq!(run_until(&handle.port, 1, Duration::from_millis(100)), 0);
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_untouched_snapshot_leaves_posts_alone() {
        let registry = feed_registry();
        let factory = proxied(&registry, &SharedConfig::default());
        let handle = factory.spawn(&ScriptLocator::from(FEED), &WorkerOptions::default()).unwrap();
        let seen = collecting(&handle.port);
        assert_eq!(run_until(&handle.port, 2, WAIT), 2);
        assert_eq!(
            *seen.borrow(),
            vec![Payload::from(r#"{"value":0.5}"#), Payload::from(r#"{"value":0.6}"#)]
        );
    }
}
