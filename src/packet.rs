/*! Stream transfers.

One [`Packet`] is one beat on an AXI4-Stream style bus carrying one `sc16`
sample, with the usual out of band signals:

* `valid`: the beat carries live data.
* `last`: the beat ends a burst.
* `keep`: which of the four byte lanes are meaningful.

The filter core needs whole samples, so a partial `keep` is malformed
framing, never a short sample.
*/
use crate::fixed::Sc16;
use crate::{Error, Result};

/// Number of byte lanes in one beat.
pub const LANES: u32 = 4;

/// All byte lanes meaningful.
pub const KEEP_ALL: u8 = 0b1111;

/// One stream beat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Sample payload.
    pub data: Sc16,
    /// Beat carries live data.
    pub valid: bool,
    /// Final beat of a burst.
    pub last: bool,
    /// Byte lane mask.
    pub keep: u8,
}

impl Packet {
    /// Create a valid, full width beat.
    #[must_use]
    pub fn new(data: Sc16, last: bool) -> Self {
        Self {
            data,
            valid: true,
            last,
            keep: KEEP_ALL,
        }
    }

    /// Create a beat with an explicit lane mask.
    #[must_use]
    pub fn with_keep(data: Sc16, last: bool, keep: u8) -> Self {
        Self {
            data,
            valid: true,
            last,
            keep,
        }
    }

    /// True if every byte lane is meaningful.
    #[must_use]
    pub fn is_full_width(&self) -> bool {
        self.keep & KEEP_ALL == KEEP_ALL
    }

    /// Check that the beat can be handed to the filter core.
    ///
    /// The beat must be valid, and full width unless `require_full_width` is
    /// turned off.
    pub fn check(&self, require_full_width: bool) -> Result<()> {
        if !self.valid {
            return Err(Error::MalformedFraming("beat without valid".into()));
        }
        if self.keep & !KEEP_ALL != 0 {
            return Err(Error::MalformedFraming(format!(
                "keep {:#06b} names lanes beyond {LANES}",
                self.keep
            )));
        }
        if require_full_width && !self.is_full_width() {
            return Err(Error::MalformedFraming(format!(
                "partial keep {:#06b} on a full width sample",
                self.keep
            )));
        }
        Ok(())
    }

    /// Same flags, new payload.
    #[must_use]
    pub fn map(&self, data: Sc16) -> Self {
        Self { data, ..*self }
    }
}
