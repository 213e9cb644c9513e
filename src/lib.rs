/*! Streaming fixed point LMS/NLMS adaptive filter core.

This crate is the algorithmic core of an FPGA resident adaptive filter:
what the hardware block computes per sample, how samples are framed on the
stream bus, and how a host pokes its registers. Flow graph wrappers, device
discovery, and transport are somebody else's problem.

# Architecture overview

```text
   host writes registers ──────────────┐
                                       ↓
  [ Framer ] → bounded stream → [ AdaptiveFilter ] → bounded stream → [ Framer ]
  push(sample, last, keep)        per sample LMS/NLMS                  pop()
```

* [`fixed`]: `sc16`, the saturating 16 bit complex sample.
* [`packet`]: one stream beat with `valid`/`last`/`keep`.
* [`stream`]: bounded queues with backpressure.
* [`framer`]: host side push/pop, and burst assembly.
* [`lms`]: the adaptive filter itself.
* [`registers`]: the register map and control word.
* [`block`]: runs the filter core over streams.
* [`bridge`]: the interface a host bridge drives, and a threaded pipeline.

# Examples

System identification, one sample at a time:

```
use adaptive_filter::config::Config;
use adaptive_filter::fixed::Sc16;
use adaptive_filter::lms::AdaptiveFilter;
use adaptive_filter::packet::Packet;
use adaptive_filter::registers::{ControlWord, REG_USER_ADDR};

let mut filter = AdaptiveFilter::new(&Config::with_order(4))?;
let ctrl = ControlWord::default().with_step_size(0x4000).with_nlms(true);
filter.write_register(REG_USER_ADDR, ctrl.bits())?;
let input = Packet::new(Sc16::new(1000, 0), false);
let desired = Packet::new(Sc16::new(500, 0), false);
let out = filter.process(&input, Some(&desired))?;
assert_eq!(out.data, Sc16::new(500, 0));
# Ok::<(), adaptive_filter::Error>(())
```
*/

pub mod block;
pub mod bridge;
pub mod config;
pub mod fixed;
pub mod framer;
pub mod lms;
pub mod packet;
pub mod registers;
pub mod stream;

use fixed::Sc16;

/// Adaptive filter error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Beat rejected before any state was touched.
    #[error("malformed framing: {0}")]
    MalformedFraming(String),

    /// No register at this address, in the address space accessed.
    #[error("unmapped register {0}")]
    UnmappedRegister(u32),

    /// Register exists, but doesn't accept this value.
    #[error("invalid value {value:#010x} for register {addr}")]
    InvalidValue {
        /// Register address.
        addr: u32,
        /// Rejected value.
        value: u32,
    },

    /// Rejected at initialization.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Operation not allowed in the current lifecycle state.
    #[error("{op} not allowed: {state}")]
    InvalidState {
        /// What was attempted.
        op: &'static str,
        /// Why not.
        state: String,
    },

    /// Stream is full. Nothing was dropped.
    #[error("stream busy")]
    Busy,

    /// Other end of the stream is gone.
    #[error("stream closed")]
    Closed,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config parse error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error with added context.
    #[error("{msg}: {source}")]
    Wrap {
        /// Context.
        msg: String,
        /// Underlying error.
        source: Box<Error>,
    },
}

impl Error {
    /// Add context to an error.
    #[must_use]
    pub fn wrap(e: Error, msg: impl Into<String>) -> Self {
        Self::Wrap {
            msg: msg.into(),
            source: Box::new(e),
        }
    }

    /// Error for a poisoned lock.
    #[must_use]
    pub fn poisoned(op: &'static str) -> Self {
        Self::InvalidState {
            op,
            state: "lock poisoned".into(),
        }
    }

    /// Unwrap context, returning the innermost error.
    #[must_use]
    pub fn root(&self) -> &Error {
        match self {
            Error::Wrap { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type with crate error.
pub type Result<T> = std::result::Result<T, Error>;

/// A trait all sample types on the host wire must implement.
pub trait Sample {
    /// The type of the sample.
    type Type;

    /// The serialized size of one sample.
    fn size() -> usize;

    /// Parse one sample.
    fn parse(data: &[u8]) -> Result<Self::Type>;

    /// Serialize one sample.
    fn serialize(&self) -> Vec<u8>;
}

/// Host wire format `sc16`: I then Q, little endian.
impl Sample for Sc16 {
    type Type = Sc16;
    fn size() -> usize {
        4
    }
    fn parse(data: &[u8]) -> Result<Self::Type> {
        let [i0, i1, q0, q1] = data else {
            return Err(Error::MalformedFraming(format!(
                "sc16 needs {} bytes, got {}",
                Self::size(),
                data.len()
            )));
        };
        Ok(Sc16::new(
            i16::from_le_bytes([*i0, *i1]),
            i16::from_le_bytes([*q0, *q1]),
        ))
    }
    fn serialize(&self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(Self::size());
        ret.extend(self.re.raw().to_le_bytes());
        ret.extend(self.im.raw().to_le_bytes());
        ret
    }
}

#[cfg(test)]
pub mod tests {
    //! Test helper functions.
    use super::*;

    /// For testing, assert that two sample slices are within `tol` LSBs.
    pub fn assert_within(left: &[Sc16], right: &[Sc16], tol: i64) {
        assert_eq!(
            left.len(),
            right.len(),
            "\nleft: {:?}\nright: {:?}",
            left,
            right
        );
        for i in 0..left.len() {
            let dre = (left[i].re.wide() - right[i].re.wide()).abs();
            let dim = (left[i].im.wide() - right[i].im.wide()).abs();
            if dre > tol || dim > tol {
                assert_eq!(
                    left[i], right[i],
                    "\nElement {i}:\nleft: {:?}\nright: {:?}",
                    left, right
                );
            }
        }
    }

    #[test]
    fn sc16_wire() -> Result<()> {
        let s = Sc16::new(-2, 0x1234);
        let b = s.serialize();
        assert_eq!(b, vec![0xfe, 0xff, 0x34, 0x12]);
        assert_eq!(Sc16::parse(&b)?, s);
        assert!(matches!(
            Sc16::parse(&b[..3]),
            Err(Error::MalformedFraming(_))
        ));
        Ok(())
    }

    #[test]
    fn wrapped_root() {
        let e = Error::wrap(Error::UnmappedRegister(7), "in filter thread");
        assert!(matches!(e.root(), Error::UnmappedRegister(7)));
        assert_eq!(
            e.to_string(),
            "in filter thread: unmapped register 7"
        );
    }
}
