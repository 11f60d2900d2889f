//! Payload rewriter
//!
//! Locates the target field(s) inside a decoded feed message and replaces
//! them with a generated value. Three envelope shapes are recognised, tried
//! in this order:
//!
//! 1. flat: `{"value": 0.12, ...}`
//! 2. nested: `{"payload": {"value": 0.12, ...}, ...}`
//! 3. batch: `{"messages": [tick | {"tk": tick} | {"ts": tick} | {"ts": {"tk": tick}}]}`
//!    where `tick = {"sl": "GOLDm#", "ba": [bid, ask], ...}`
//!
//! The order is a plain tie-break for envelopes that satisfy more than one
//! shape; the first match wins and later rules are not applied.
//!
//! Messages arrive either as JSON text or as an already-decoded tree. Text
//! is decoded into a private copy and re-encoded only when something was
//! rewritten, so unmatched or malformed text is returned byte-for-byte.

use std::borrow::Cow;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::trace;

use crate::config::{InterceptConfig, SharedConfig, SymbolOverride};
use crate::errors::RewriteError;

/// Batch sequence field.
const MESSAGES_KEY: &str = "messages";
/// Nested envelope field.
const PAYLOAD_KEY: &str = "payload";
/// Tick symbol identifier.
const SYMBOL_KEY: &str = "sl";
/// Tick bid/ask pair.
const BID_ASK_KEY: &str = "ba";
/// Tick wrapper inside a batch entry.
const TICK_KEY: &str = "tk";
/// Timestamped wrapper one level above the tick.
const STAMPED_KEY: &str = "ts";

/// A message as it travels through a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// JSON-encoded text frame.
    Text(String),
    /// Structured message object.
    Json(Value),
    /// Opaque binary frame; never rewritten.
    Binary(Vec<u8>),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text",
            Payload::Json(_) => "json",
            Payload::Binary(_) => "binary",
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Payload::Binary(_))
    }

    /// Decoded JSON view of the payload, if it has one.
    pub fn decode(&self) -> Option<Value> {
        match self {
            Payload::Text(text) => serde_json::from_str(text).ok(),
            Payload::Json(tree) => Some(tree.clone()),
            Payload::Binary(bytes) => serde_json::from_slice(bytes).ok(),
        }
    }

    /// Human-readable rendering for traffic logs.
    pub fn render(&self) -> Cow<'_, str> {
        match self {
            Payload::Text(text) => Cow::Borrowed(text),
            Payload::Json(tree) => Cow::Owned(tree.to_string()),
            Payload::Binary(bytes) => String::from_utf8_lossy(bytes),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Value> for Payload {
    fn from(tree: Value) -> Self {
        Payload::Json(tree)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

/// Which tick-locating rule follows the flat and nested value rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RewriteStrategy {
    /// Fixed `messages` batch shape.
    #[default]
    Envelope,
    /// Depth-first sweep of the whole tree for any tick object.
    DeepSweep,
}

/// Which rule rewrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rewrite {
    FlatValue,
    NestedValue,
    /// Number of ticks whose bid/ask pair was overwritten.
    Ticks(usize),
}

/// Stateless rewriter borrowing the active rewrite settings.
#[derive(Debug, Clone, Copy)]
pub struct PayloadRewriter<'a> {
    value_key: &'a str,
    symbol_override: Option<&'a SymbolOverride>,
    strategy: RewriteStrategy,
}

impl<'a> PayloadRewriter<'a> {
    pub fn new(config: &'a InterceptConfig) -> Self {
        Self {
            value_key: &config.value_key,
            symbol_override: config.symbol_override.as_ref(),
            strategy: RewriteStrategy::Envelope,
        }
    }

    pub fn with_strategy(mut self, strategy: RewriteStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Rewrite a message, passing it through unchanged on any failure.
    ///
    /// `None` is the fast path: nothing is decoded.
    pub fn rewrite(&self, message: Payload, generated: Option<Decimal>) -> Payload {
        let Some(generated) = generated else {
            return message;
        };

        match message {
            Payload::Text(text) => match self.rewrite_text(&text, generated) {
                Ok((rewritten, _)) => Payload::Text(rewritten),
                Err(error) => {
                    trace!(%error, "Passing text payload through unchanged");
                    Payload::Text(text)
                }
            },
            Payload::Json(mut tree) => {
                if let Err(error) = self.rewrite_tree(&mut tree, generated) {
                    trace!(%error, "Passing structured payload through unchanged");
                }
                Payload::Json(tree)
            }
            binary @ Payload::Binary(_) => binary,
        }
    }

    /// Fallible variant of [`rewrite`](Self::rewrite) that leaves `message`
    /// untouched and reports why nothing was rewritten.
    pub fn try_rewrite(
        &self,
        message: &Payload,
        generated: Decimal,
    ) -> Result<(Payload, Rewrite), RewriteError> {
        match message {
            Payload::Text(text) => self
                .rewrite_text(text, generated)
                .map(|(rewritten, rule)| (Payload::Text(rewritten), rule)),
            Payload::Json(tree) => {
                let mut copy = tree.clone();
                let rule = self.rewrite_tree(&mut copy, generated)?;
                Ok((Payload::Json(copy), rule))
            }
            Payload::Binary(_) => Err(RewriteError::Binary),
        }
    }

    /// Decode, rewrite and re-encode a JSON text frame.
    pub fn rewrite_text(
        &self,
        text: &str,
        generated: Decimal,
    ) -> Result<(String, Rewrite), RewriteError> {
        let mut tree: Value =
            serde_json::from_str(text).map_err(|e| RewriteError::Decode(e.to_string()))?;
        let rule = self.rewrite_tree(&mut tree, generated)?;
        Ok((tree.to_string(), rule))
    }

    /// Rewrite a decoded tree in place.
    ///
    /// On `Err` the tree has not been modified.
    pub fn rewrite_tree(
        &self,
        tree: &mut Value,
        generated: Decimal,
    ) -> Result<Rewrite, RewriteError> {
        let Value::Object(root) = tree else {
            return Err(RewriteError::ShapeMismatch);
        };

        if let Some(slot) = root.get_mut(self.value_key).filter(|v| is_scalar(&**v)) {
            *slot = decimal_to_json(generated);
            return Ok(Rewrite::FlatValue);
        }

        if let Some(slot) = root
            .get_mut(PAYLOAD_KEY)
            .and_then(|payload| payload.as_object_mut())
            .and_then(|payload| payload.get_mut(self.value_key))
            .filter(|v| is_scalar(&**v))
        {
            *slot = decimal_to_json(generated);
            return Ok(Rewrite::NestedValue);
        }

        let Some(symbol_override) = self.symbol_override else {
            return Err(RewriteError::ShapeMismatch);
        };

        let touched = match self.strategy {
            RewriteStrategy::Envelope => rewrite_batch(tree, generated, symbol_override),
            RewriteStrategy::DeepSweep => sweep_ticks(tree, generated, symbol_override),
        };

        if touched == 0 {
            Err(RewriteError::ShapeMismatch)
        } else {
            Ok(Rewrite::Ticks(touched))
        }
    }
}

/// Rewrite matching ticks inside a `messages` batch envelope.
///
/// Each entry is checked as a tick itself, through `tk`, through `ts`, and
/// through `ts.tk`. Returns the number of ticks rewritten.
pub fn rewrite_batch(
    tree: &mut Value,
    generated: Decimal,
    symbol_override: &SymbolOverride,
) -> usize {
    let Some(entries) = tree.get_mut(MESSAGES_KEY).and_then(Value::as_array_mut) else {
        return 0;
    };

    let Some(pair) = bid_ask_pair(generated, symbol_override) else {
        return 0;
    };
    let target = symbol_override.target_symbol.as_str();
    let mut touched = 0;

    for entry in entries.iter_mut() {
        if apply_tick(entry, target, &pair) {
            touched += 1;
            continue;
        }
        if let Some(tick) = entry.get_mut(TICK_KEY) {
            if apply_tick(tick, target, &pair) {
                touched += 1;
            }
        }
        if let Some(stamped) = entry.get_mut(STAMPED_KEY) {
            if apply_tick(stamped, target, &pair) {
                touched += 1;
            } else if let Some(tick) = stamped.get_mut(TICK_KEY) {
                if apply_tick(tick, target, &pair) {
                    touched += 1;
                }
            }
        }
    }

    touched
}

/// Depth-first sweep of the whole tree for tick objects of the target symbol.
///
/// Visits arrays and mappings in any order; a matched tick is not descended
/// into. `Value` is an owned tree, so there are no shared or cyclic nodes to
/// track and every node is visited exactly once. The traversal uses an
/// explicit stack so deeply nested input cannot exhaust the call stack.
pub fn sweep_ticks(
    tree: &mut Value,
    generated: Decimal,
    symbol_override: &SymbolOverride,
) -> usize {
    let Some(pair) = bid_ask_pair(generated, symbol_override) else {
        return 0;
    };
    let target = symbol_override.target_symbol.as_str();
    let mut touched = 0;
    let mut stack: Vec<&mut Value> = vec![tree];

    while let Some(node) = stack.pop() {
        if apply_tick(&mut *node, target, &pair) {
            touched += 1;
            continue;
        }
        match node {
            Value::Object(map) => stack.extend(map.values_mut()),
            Value::Array(items) => stack.extend(items.iter_mut()),
            _ => {}
        }
    }

    touched
}

fn bid_ask_pair(generated: Decimal, symbol_override: &SymbolOverride) -> Option<[Value; 2]> {
    let (bid, ask) = symbol_override.bid_ask(generated)?;
    Some([decimal_to_json(bid), decimal_to_json(ask)])
}

/// Overwrite `ba` if `node` is a tick of the target symbol.
fn apply_tick(node: &mut Value, target: &str, pair: &[Value; 2]) -> bool {
    let Value::Object(tick) = node else {
        return false;
    };
    if tick.get(SYMBOL_KEY).and_then(Value::as_str) != Some(target) {
        return false;
    }
    match tick.get_mut(BID_ASK_KEY).and_then(Value::as_array_mut) {
        Some(ba) if ba.len() == 2 => {
            ba[0] = pair[0].clone();
            ba[1] = pair[1].clone();
            true
        }
        _ => false,
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Object(_) | Value::Array(_))
}

/// Encode a decimal as a JSON number, integral values without a fraction.
pub fn decimal_to_json(value: Decimal) -> Value {
    if value.fract().is_zero() {
        if let Some(int) = value.to_i64() {
            return Value::Number(Number::from(int));
        }
    }
    value
        .to_f64()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

impl InterceptConfig {
    /// Consume one generated value and rewrite `message` with it.
    ///
    /// Binary frames are passed through without consuming a value.
    pub fn intercept(&mut self, message: Payload, strategy: RewriteStrategy) -> Payload {
        if message.is_binary() {
            return message;
        }
        let generated = self.next_value();
        PayloadRewriter::new(self)
            .with_strategy(strategy)
            .rewrite(message, generated)
    }
}

impl SharedConfig {
    /// [`InterceptConfig::intercept`] against the live configuration.
    pub fn intercept(&self, message: Payload, strategy: RewriteStrategy) -> Payload {
        self.update(|config| config.intercept(message, strategy))
    }
}
