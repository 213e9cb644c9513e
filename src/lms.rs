/*! LMS / NLMS adaptive filter core.

Links:
* <https://en.wikipedia.org/wiki/Least_mean_squares_filter>

Per accepted sample, in strict arrival order:

```text
shift x[n] into the delay line, dropping the oldest
y[n]   = Σ w[i] * x[n-i]
e[n]   = d[n] - y[n]
w[i]  += μ * e[n] * conj(x[n-i])                       (LMS)
w[i]  += μ * e[n] * conj(x[n-i]) / (Σ|x[n-k]|² + δ)     (NLMS)
```

Numeric formats:
* Samples are read as Q1.15.
* Coefficients are Q1.30 in saturating 32 bit words. They're read back over
  the register bus as Q1.15.
* Step size μ is unsigned Q0.16, from the control word.
* δ is the NLMS floor from the config, in the same units as the delay line
  energy (one full scale sample is 2^30).

Sums and products are exact in 64 and 128 bit. Rounding (toward zero) and
saturation happen only when a value is stored into a coefficient or emitted.

Each sample's coefficient update completes before the next sample is
shifted in, so the filter can't be parallelized across samples.
*/
use std::collections::VecDeque;

use itertools::Itertools;
use log::{debug, trace, warn};

use crate::config::Config;
use crate::fixed::{Sc16, Wide, narrow_i128, saturate_bits};
use crate::framer::check_aligned;
use crate::packet::Packet;
use crate::registers::{
    ControlWord, DesiredSource, OutputSelect, REG_COEFF_BASE, REG_NUM_TAPS, REG_REJECT_COUNT,
    REG_SAMPLE_COUNT, REG_SAT_COUNT, REG_STATUS, RegisterFile, STATUS_NLMS,
};
use crate::{Error, Result};

/// Fractional bits of a coefficient.
pub const COEFF_FRAC_BITS: u32 = 30;

/// Fractional bits of a sample, as the algorithm reads it.
pub const SAMPLE_FRAC_BITS: u32 = 15;

/// Fractional bits of the step size.
pub const STEP_FRAC_BITS: u32 = 16;

/// One coefficient, Q1.30.
pub type Coeff = num_complex::Complex<i32>;

/// Core lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Not set up. A core only exists in this state conceptually: a config
    /// that fails validation never produces one.
    Uninitialized,
    /// Set up, no sample seen since power on or reset.
    Ready,
    /// Processing samples.
    Running,
    /// Shut down. Registers can still be read.
    Shutdown,
}

impl State {
    /// Status register encoding.
    #[must_use]
    pub fn bits(self) -> u32 {
        match self {
            State::Uninitialized => 0,
            State::Ready => 1,
            State::Running => 2,
            State::Shutdown => 3,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            State::Uninitialized => "uninitialized",
            State::Ready => "ready",
            State::Running => "running",
            State::Shutdown => "shut down",
        };
        write!(f, "{s}")
    }
}

/// Adaptive filter core.
///
/// Owns its delay line, coefficients, and register file outright. Share it
/// between a host control path and a sample path with
/// [`crate::bridge::SharedFilter`].
#[derive(Debug)]
pub struct AdaptiveFilter {
    state: State,
    regs: RegisterFile,

    // Newest first.
    delay: VecDeque<Sc16>,
    coeffs: Vec<Coeff>,
    // Sum of |x|² over the delay line.
    energy: u64,
    // Last input, for `DesiredSource::Input`.
    prev_input: Sc16,

    nlms_floor: u64,
    require_full_width: bool,

    samples: u64,
    saturations: u64,
    rejected: u64,
}

impl AdaptiveFilter {
    /// Create a new core in state `Ready`.
    ///
    /// Fails with `InvalidConfiguration` if the config doesn't validate.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let regs = RegisterFile::new(config.defaults.control, config.defaults.coeff_seed)?;
        let seed = seed_coeff(regs.seed());
        debug!(
            "AdaptiveFilter: order {} control {:#010x} seed {}",
            config.order,
            regs.control().bits(),
            regs.seed()
        );
        Ok(Self {
            state: State::Ready,
            regs,
            delay: VecDeque::from(vec![Sc16::ZERO; config.order]),
            coeffs: vec![seed; config.order],
            energy: 0,
            prev_input: Sc16::ZERO,
            nlms_floor: config.nlms_floor,
            require_full_width: config.require_full_width,
            samples: 0,
            saturations: 0,
            rejected: 0,
        })
    }

    /// Number of taps.
    #[must_use]
    pub fn order(&self) -> usize {
        self.coeffs.len()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Active control word.
    #[must_use]
    pub fn control(&self) -> ControlWord {
        self.regs.control()
    }

    /// Samples processed since power on.
    #[must_use]
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Saturation events since power on.
    #[must_use]
    pub fn saturations(&self) -> u64 {
        self.saturations
    }

    /// Packets rejected since power on.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Delay line, newest first.
    #[must_use]
    pub fn delay_line(&self) -> Vec<Sc16> {
        self.delay.iter().copied().collect()
    }

    /// Coefficients at full precision, Q1.30.
    #[must_use]
    pub fn coefficients_raw(&self) -> &[Coeff] {
        &self.coeffs
    }

    /// Coefficients as read back over the register bus, Q1.15.
    #[must_use]
    pub fn coefficients(&self) -> Vec<Sc16> {
        self.coeffs.iter().map(|w| readback(*w)).collect()
    }

    /// Process one beat.
    ///
    /// `desired` is the matching beat of the desired response stream. It's
    /// required when the control word takes the desired response from a
    /// reference stream, and ignored otherwise.
    ///
    /// The output beat carries the input's `last` and `keep`.
    ///
    /// On error no filter state is touched.
    pub fn process(&mut self, input: &Packet, desired: Option<&Packet>) -> Result<Packet> {
        if self.state == State::Shutdown {
            return Err(Error::InvalidState {
                op: "process",
                state: self.state.to_string(),
            });
        }
        let ctrl = self.regs.control();
        let d = match self.check(input, desired, ctrl) {
            Ok(d) => d,
            Err(e) => {
                self.rejected += 1;
                warn!("AdaptiveFilter: rejected packet: {e}");
                return Err(e);
            }
        };
        if self.state == State::Ready {
            debug!("AdaptiveFilter: first sample, running");
            self.state = State::Running;
        }
        let (y, e) = self.step(input.data, d, ctrl);
        let out = match ctrl.output() {
            OutputSelect::Error => e,
            OutputSelect::Filtered => y,
        };
        Ok(input.map(out))
    }

    // Validate framing, and pick the desired sample.
    fn check(&self, input: &Packet, desired: Option<&Packet>, ctrl: ControlWord) -> Result<Sc16> {
        input.check(self.require_full_width)?;
        match ctrl.desired() {
            DesiredSource::Input => Ok(input.data),
            DesiredSource::Reference => {
                let Some(d) = desired else {
                    return Err(Error::MalformedFraming(
                        "no desired response beat in reference mode".into(),
                    ));
                };
                d.check(self.require_full_width)?;
                check_aligned(input, d)?;
                Ok(d.data)
            }
        }
    }

    // One sample of the recursion. Returns filter output and error.
    fn step(&mut self, x: Sc16, d: Sc16, ctrl: ControlWord) -> (Sc16, Sc16) {
        // Tracked in every mode, so switching to the predictor starts from
        // the sample that really came before.
        let prev = std::mem::replace(&mut self.prev_input, x);
        let x = match ctrl.desired() {
            DesiredSource::Reference => x,
            DesiredSource::Input => prev,
        };

        // Shift.
        if let Some(old) = self.delay.pop_back() {
            self.energy -= old.norm_sqr() as u64;
        }
        self.delay.push_front(x);
        self.energy += x.norm_sqr() as u64;

        // Filter.
        let acc: Wide = self
            .coeffs
            .iter()
            .zip_eq(self.delay.iter())
            .map(|(w, x)| Wide::new(w.re as i64, w.im as i64) * x.wide())
            .sum();
        let (y, sat_y) = Sc16::from_wide(acc, COEFF_FRAC_BITS);

        // Error, at accumulator precision.
        let e_acc = Wide::new(
            d.re.wide() << COEFF_FRAC_BITS,
            d.im.wide() << COEFF_FRAC_BITS,
        ) - acc;
        let (e, sat_e) = Sc16::from_wide(e_acc, COEFF_FRAC_BITS);

        let emitted_sats = match ctrl.output() {
            OutputSelect::Error => sat_e,
            OutputSelect::Filtered => sat_y,
        };
        let mut sats = emitted_sats as u64;

        // Update.
        let mu = ctrl.step_size() as i128;
        if mu != 0 {
            // Units: e_acc has 45 fractional bits, x 15, μ 16. Coefficients
            // want 30.
            let divisor: i128 = if ctrl.nlms() {
                ((self.energy + self.nlms_floor) as i128) << STEP_FRAC_BITS
            } else {
                1i128 << (2 * SAMPLE_FRAC_BITS + STEP_FRAC_BITS)
            };
            let (er, ei) = (e_acc.re as i128, e_acc.im as i128);
            for (w, x) in self.coeffs.iter_mut().zip_eq(self.delay.iter()) {
                let (xr, xi) = (x.re.wide() as i128, x.im.wide() as i128);
                // e * conj(x)
                let pr = er * xr + ei * xi;
                let pi = ei * xr - er * xi;
                let (re, sr) = store_coeff(w.re, mu * pr / divisor);
                let (im, si) = store_coeff(w.im, mu * pi / divisor);
                *w = Coeff::new(re, im);
                sats += sr as u64 + si as u64;
            }
        }

        if sats > 0 {
            trace!(
                "AdaptiveFilter: {sats} saturation(s) at sample {}",
                self.samples
            );
            self.saturations += sats;
        }
        self.samples += 1;
        (y, e)
    }

    /// Reset to `Ready` at a sample boundary.
    ///
    /// Clears the delay line. If `reseed`, every coefficient is set to the
    /// value in `REG_COEFF_SEED`. Registers and counters are kept.
    pub fn reset(&mut self, reseed: bool) -> Result<()> {
        if self.state == State::Shutdown {
            return Err(Error::InvalidState {
                op: "reset",
                state: self.state.to_string(),
            });
        }
        debug!("AdaptiveFilter: reset from {} (reseed: {reseed})", self.state);
        self.delay.iter_mut().for_each(|x| *x = Sc16::ZERO);
        self.energy = 0;
        self.prev_input = Sc16::ZERO;
        if reseed {
            let seed = seed_coeff(self.regs.seed());
            self.coeffs.iter_mut().for_each(|w| *w = seed);
        }
        self.state = State::Ready;
        Ok(())
    }

    /// Shut down. Only register reads are allowed after this.
    pub fn shutdown(&mut self) {
        if self.state != State::Shutdown {
            debug!(
                "AdaptiveFilter: shutdown after {} samples, {} saturations, {} rejected",
                self.samples, self.saturations, self.rejected
            );
        }
        self.state = State::Shutdown;
    }

    /// Read a register on the readback bus.
    pub fn read_register(&self, addr: u32) -> Result<u32> {
        match addr {
            REG_STATUS => {
                let nlms = if self.regs.control().nlms() {
                    STATUS_NLMS
                } else {
                    0
                };
                Ok(self.state.bits() | nlms)
            }
            REG_NUM_TAPS => Ok(self.order() as u32),
            REG_SAMPLE_COUNT => Ok(self.samples as u32),
            REG_SAT_COUNT => Ok(self.saturations as u32),
            REG_REJECT_COUNT => Ok(self.rejected as u32),
            a if a >= REG_COEFF_BASE && ((a - REG_COEFF_BASE) as usize) < self.order() => {
                Ok(readback(self.coeffs[(a - REG_COEFF_BASE) as usize]).pack())
            }
            a => self.regs.read(a),
        }
    }

    /// Write a register on the settings bus.
    ///
    /// Takes `&mut self`, so it can't land in the middle of a sample. It
    /// applies to every sample processed after it returns.
    pub fn write_register(&mut self, addr: u32, value: u32) -> Result<()> {
        self.regs.write(addr, value)
    }

    /// Lock the desired response source to what the plumbing can feed.
    ///
    /// Later control word writes asking for the other source fail with
    /// `InvalidValue`.
    pub fn pin_desired(&mut self, d: DesiredSource) -> Result<()> {
        self.regs.pin_desired(d)?;
        debug!("desired response pinned to {d:?}");
        Ok(())
    }
}

// Q1.15 seed to Q1.30 coefficient.
fn seed_coeff(s: Sc16) -> Coeff {
    let shift = COEFF_FRAC_BITS - SAMPLE_FRAC_BITS;
    Coeff::new((s.re.raw() as i32) << shift, (s.im.raw() as i32) << shift)
}

// Q1.30 coefficient to Q1.15, rounding toward zero.
fn readback(w: Coeff) -> Sc16 {
    Sc16::from_wide(
        Wide::new(w.re as i64, w.im as i64),
        COEFF_FRAC_BITS - SAMPLE_FRAC_BITS,
    )
    .0
}

// Add an update to a coefficient, saturating to 32 bits.
fn store_coeff(w: i32, delta: i128) -> (i32, bool) {
    let (sum, s1) = narrow_i128(w as i128 + delta);
    let (v, s2) = saturate_bits(sum, 32);
    (v as i32, s1 || s2)
}
