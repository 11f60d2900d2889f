//! Value generator
//!
//! Pure state machine that yields the next override value for the selected
//! mode. No I/O, no error conditions; negative steps are allowed.

use rust_decimal::Decimal;

use crate::config::{GeneratorConfig, InterceptConfig, Mode, SharedConfig};

impl GeneratorConfig {
    /// Produce the next override value, or `None` in `Untouched` mode.
    ///
    /// Only the series modes mutate state, and only `current`. A series
    /// that would leave the `Decimal` range stays at the boundary.
    pub fn next_value(&mut self) -> Option<Decimal> {
        match self.mode {
            Mode::Untouched => None,
            Mode::Constant => Some(self.constant),
            Mode::Increasing => {
                let value = self.current;
                self.current = self.current.saturating_add(self.step);
                Some(value)
            }
            Mode::Decreasing => {
                let value = self.current;
                self.current = self.current.saturating_sub(self.step);
                Some(value)
            }
        }
    }
}

impl InterceptConfig {
    pub fn next_value(&mut self) -> Option<Decimal> {
        self.generator.next_value()
    }
}

impl SharedConfig {
    /// Consume one value from the live generator.
    pub fn next_value(&self) -> Option<Decimal> {
        self.update(|config| config.next_value())
    }
}
