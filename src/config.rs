//! Core configuration.
//!
//! Fixed at initialization. Everything the host may change at runtime lives
//! in the register file instead.
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::registers::ControlWord;
use crate::{Error, Result};

/// Largest supported filter order.
pub const MAX_ORDER: usize = 1024;

/// Default NLMS denominator floor, in delay line energy units.
///
/// Energy is the sum of squared sample magnitudes, so with Q1.15 samples a
/// full scale tap contributes 2^30. The default floor is 2^-20 of that.
pub const DEFAULT_NLMS_FLOOR: u64 = 1 << 10;

/// Default depth of the framer to core queues.
pub const DEFAULT_QUEUE_DEPTH: usize = 4096;

/// Power on register values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Value of `REG_USER_DEFAULT`, and power on value of `REG_USER_ADDR`.
    pub control: u32,
    /// Power on coefficient seed, packed sc16 Q1.15.
    pub coeff_seed: u32,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            control: ControlWord::default().bits(),
            coeff_seed: 0,
        }
    }
}

/// Adaptive filter configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of taps.
    pub order: usize,
    /// Power on register values.
    pub defaults: Defaults,
    /// NLMS denominator floor. Must be strictly positive.
    pub nlms_floor: u64,
    /// Capacity of each bounded queue.
    pub queue_depth: usize,
    /// Reject beats with a partial `keep`.
    pub require_full_width: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            order: 8,
            defaults: Defaults::default(),
            nlms_floor: DEFAULT_NLMS_FLOOR,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            require_full_width: true,
        }
    }
}

impl Config {
    /// Default config with the given order.
    #[must_use]
    pub fn with_order(order: usize) -> Self {
        Self {
            order,
            ..Default::default()
        }
    }

    /// Parse from JSON. Missing fields get defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let c: Config = serde_json::from_str(s)?;
        c.validate()?;
        Ok(c)
    }

    /// Load from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading config {}", path.display());
        let s = std::fs::read_to_string(path)?;
        Self::from_json_str(&s).map_err(|e| Error::wrap(e, format!("in {}", path.display())))
    }

    /// Check the config.
    pub fn validate(&self) -> Result<()> {
        if self.order == 0 || self.order > MAX_ORDER {
            return Err(Error::InvalidConfiguration(format!(
                "order {} not in 1..={MAX_ORDER}",
                self.order
            )));
        }
        if self.nlms_floor == 0 {
            return Err(Error::InvalidConfiguration(
                "NLMS floor must be strictly positive".into(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(Error::InvalidConfiguration(
                "queue depth must be at least 1".into(),
            ));
        }
        if ControlWord::from_bits(self.defaults.control).is_err() {
            return Err(Error::InvalidConfiguration(format!(
                "default control word {:#010x} has reserved bits set",
                self.defaults.control
            )));
        }
        Ok(())
    }
}
