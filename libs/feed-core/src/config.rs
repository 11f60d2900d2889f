//! Interception configuration
//!
//! `InterceptConfig` is the per-session control surface: generator mode and
//! counters, the rewrite target field, and the optional bid/ask symbol
//! override. It is created with defaults and mutated in place by a test
//! controller through [`SharedConfig`].
//!
//! All numeric fields use `rust_decimal` so that increasing and decreasing
//! series are exact: the n-th value is always `start ± (n-1)*step`.

use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Generator mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Never produce a value; messages pass through unchanged.
    #[default]
    Untouched,
    /// Always produce `constant`.
    Constant,
    /// Produce `current`, then advance it by `+step`.
    Increasing,
    /// Produce `current`, then advance it by `-step`.
    Decreasing,
}

impl Mode {
    pub fn label(&self) -> &'static str {
        match self {
            Mode::Untouched => "untouched",
            Mode::Constant => "constant",
            Mode::Increasing => "increasing",
            Mode::Decreasing => "decreasing",
        }
    }
}

/// Value generator state.
///
/// `current` is generator-owned: only `Increasing`/`Decreasing` advance it,
/// by exactly one `step` per produced value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorConfig {
    pub mode: Mode,
    pub constant: Decimal,
    pub start: Decimal,
    pub step: Decimal,
    pub current: Decimal,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Untouched,
            constant: Decimal::new(4, 1),
            start: Decimal::ZERO,
            step: Decimal::new(1, 1),
            current: Decimal::ZERO,
        }
    }
}

/// How a matching tick's bid/ask pair is overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaMode {
    /// `ba = [v, v]`
    #[default]
    #[serde(alias = "same")]
    Pinned,
    /// `ba = [v - delta, v + delta]`
    Spread,
}

/// Selects which tick's bid/ask pair is rewritten inside batch envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolOverride {
    /// Exact, case-sensitive symbol identifier (`sl`) to match.
    pub target_symbol: String,
    pub ba_mode: BaMode,
    #[serde(default)]
    pub spread_delta: Decimal,
}

impl SymbolOverride {
    /// Pinned override: both sides set to the generated value.
    pub fn pinned(target_symbol: impl Into<String>) -> Self {
        Self {
            target_symbol: target_symbol.into(),
            ba_mode: BaMode::Pinned,
            spread_delta: Decimal::ZERO,
        }
    }

    /// Spread override: sides set to `value ± delta`.
    pub fn spread(target_symbol: impl Into<String>, delta: Decimal) -> Self {
        Self {
            target_symbol: target_symbol.into(),
            ba_mode: BaMode::Spread,
            spread_delta: delta,
        }
    }

    /// Bid/ask pair for a reference price, `None` if a side overflows.
    pub fn bid_ask(&self, reference: Decimal) -> Option<(Decimal, Decimal)> {
        match self.ba_mode {
            BaMode::Pinned => Some((reference, reference)),
            BaMode::Spread => Some((
                reference.checked_sub(self.spread_delta)?,
                reference.checked_add(self.spread_delta)?,
            )),
        }
    }
}

/// Field name rewritten by the flat and nested envelope rules.
pub const DEFAULT_VALUE_KEY: &str = "value";

fn default_value_key() -> String {
    DEFAULT_VALUE_KEY.to_string()
}

/// Complete interception configuration for one execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptConfig {
    #[serde(flatten)]
    pub generator: GeneratorConfig,
    #[serde(default = "default_value_key")]
    pub value_key: String,
    #[serde(default)]
    pub symbol_override: Option<SymbolOverride>,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            generator: GeneratorConfig::default(),
            value_key: default_value_key(),
            symbol_override: None,
        }
    }
}

impl InterceptConfig {
    /// Configuration with `constant` mode already selected.
    pub fn constant(value: Decimal) -> Self {
        let mut config = Self::default();
        config.generator.mode = Mode::Constant;
        config.generator.constant = value;
        config
    }

    /// Configuration with an increasing or decreasing series selected.
    pub fn series(mode: Mode, start: Decimal, step: Decimal) -> Self {
        let mut config = Self::default();
        config.set_series(mode, start, step);
        config
    }

    /// Set mode, start and step, and reset `current` to `start`.
    pub fn set_series(&mut self, mode: Mode, start: Decimal, step: Decimal) {
        self.generator.mode = mode;
        self.generator.start = start;
        self.generator.step = step;
        self.generator.current = start;
    }
}

/// Live configuration handle shared by every installer in a context.
///
/// Controllers mutate it at any time; changes apply to the next message,
/// never retroactively.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<Mutex<InterceptConfig>>,
}

impl SharedConfig {
    pub fn new(config: InterceptConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(config)),
        }
    }

    /// Copy of the current configuration.
    pub fn get(&self) -> InterceptConfig {
        self.inner.lock().clone()
    }

    /// Apply an arbitrary mutation.
    pub fn update<R>(&self, f: impl FnOnce(&mut InterceptConfig) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn set_mode(&self, mode: Mode) {
        debug!(mode = mode.label(), "Interception mode changed");
        self.inner.lock().generator.mode = mode;
    }

    pub fn set_constant(&self, value: Decimal) {
        self.inner.lock().generator.constant = value;
    }

    /// Switch to a series and restart it from `start`.
    pub fn set_series(&self, mode: Mode, start: Decimal, step: Decimal) {
        debug!(mode = mode.label(), %start, %step, "Interception series reset");
        self.inner.lock().set_series(mode, start, step);
    }

    pub fn set_value_key(&self, key: impl Into<String>) {
        self.inner.lock().value_key = key.into();
    }

    pub fn set_symbol_override(&self, symbol_override: Option<SymbolOverride>) {
        self.inner.lock().symbol_override = symbol_override;
    }
}
