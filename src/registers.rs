/*! Register map and control word.

Like an RFNoC block, the core has two address spaces: a settings bus the
host writes, and a readback bus the host reads. An address mapped on one bus
is not necessarily mapped on the other, so writing a read only register is an
unmapped access on the settings bus.

| Addr  | Name               | Read | Write |
|-------|--------------------|------|-------|
| 128   | `REG_USER_ADDR`    | yes  | yes   |
| 129   | `REG_USER_DEFAULT` | yes  | no    |
| 130   | `REG_COEFF_SEED`   | yes  | yes   |
| 131   | `REG_STATUS`       | yes  | no    |
| 132   | `REG_NUM_TAPS`     | yes  | no    |
| 133   | `REG_SAMPLE_COUNT` | yes  | no    |
| 134   | `REG_SAT_COUNT`    | yes  | no    |
| 135   | `REG_REJECT_COUNT` | yes  | no    |
| 256+i | `REG_COEFF_BASE`   | yes  | no    |

This module only holds the slots the host can write (and their defaults).
Status and coefficient readback are decoded by the filter core, since that's
where the values live.
*/
use log::debug;

use crate::fixed::Sc16;
use crate::{Error, Result};

/// Control word: step size and mode bits.
pub const REG_USER_ADDR: u32 = 128;
/// Power on default of the control word. Read only.
pub const REG_USER_DEFAULT: u32 = 129;
/// Value all coefficients are seeded to, packed sc16 Q1.15.
pub const REG_COEFF_SEED: u32 = 130;
/// Core state and mode.
pub const REG_STATUS: u32 = 131;
/// Filter order.
pub const REG_NUM_TAPS: u32 = 132;
/// Samples processed since power on, low 32 bits.
pub const REG_SAMPLE_COUNT: u32 = 133;
/// Saturation events since power on, low 32 bits.
pub const REG_SAT_COUNT: u32 = 134;
/// Packets rejected as malformed since power on.
pub const REG_REJECT_COUNT: u32 = 135;
/// Coefficient `i` is at `REG_COEFF_BASE + i`, packed sc16 Q1.15.
pub const REG_COEFF_BASE: u32 = 256;

/// Status bit: NLMS is active.
pub const STATUS_NLMS: u32 = 1 << 2;

/// Default step size, about 0.01 in Q0.16.
pub const DEFAULT_STEP_SIZE: u16 = 0x028f;

/// What the core emits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputSelect {
    /// Error sample, desired minus filter output.
    #[default]
    Error,
    /// Filter output sample.
    Filtered,
}

/// Where the desired response comes from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DesiredSource {
    /// A second input stream.
    #[default]
    Reference,
    /// The input stream itself. The delay line then sees the input delayed
    /// by one sample, which makes the core a one step linear predictor.
    Input,
}

/// Control word.
///
/// * `[15:0]`: step size, unsigned Q0.16.
/// * `[16]`: NLMS instead of LMS.
/// * `[17]`: emit filter output instead of error.
/// * `[18]`: desired response from the input stream.
/// * `[31:19]`: reserved, must be zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlWord(u32);

impl ControlWord {
    /// Step size bits.
    pub const STEP_MASK: u32 = 0xffff;
    /// NLMS bit.
    pub const NLMS: u32 = 1 << 16;
    /// Output select bit.
    pub const OUTPUT_FILTERED: u32 = 1 << 17;
    /// Desired source bit.
    pub const DESIRED_FROM_INPUT: u32 = 1 << 18;
    /// Bits that must be zero.
    pub const RESERVED: u32 = !((1 << 19) - 1);

    /// Parse a control word, rejecting reserved bits.
    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & Self::RESERVED != 0 {
            return Err(Error::InvalidValue {
                addr: REG_USER_ADDR,
                value: bits,
            });
        }
        Ok(Self(bits))
    }

    /// Raw bits.
    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Step size, Q0.16.
    #[must_use]
    pub fn step_size(self) -> u16 {
        (self.0 & Self::STEP_MASK) as u16
    }

    /// True if NLMS.
    #[must_use]
    pub fn nlms(self) -> bool {
        self.0 & Self::NLMS != 0
    }

    /// Output selection.
    #[must_use]
    pub fn output(self) -> OutputSelect {
        if self.0 & Self::OUTPUT_FILTERED != 0 {
            OutputSelect::Filtered
        } else {
            OutputSelect::Error
        }
    }

    /// Desired response source.
    #[must_use]
    pub fn desired(self) -> DesiredSource {
        if self.0 & Self::DESIRED_FROM_INPUT != 0 {
            DesiredSource::Input
        } else {
            DesiredSource::Reference
        }
    }

    /// Set step size.
    #[must_use]
    pub fn with_step_size(self, mu: u16) -> Self {
        Self((self.0 & !Self::STEP_MASK) | mu as u32)
    }

    /// Set NLMS.
    #[must_use]
    pub fn with_nlms(self, on: bool) -> Self {
        self.with_bit(Self::NLMS, on)
    }

    /// Set output selection.
    #[must_use]
    pub fn with_output(self, o: OutputSelect) -> Self {
        self.with_bit(Self::OUTPUT_FILTERED, o == OutputSelect::Filtered)
    }

    /// Set desired source.
    #[must_use]
    pub fn with_desired(self, d: DesiredSource) -> Self {
        self.with_bit(Self::DESIRED_FROM_INPUT, d == DesiredSource::Input)
    }

    fn with_bit(self, bit: u32, on: bool) -> Self {
        if on { Self(self.0 | bit) } else { Self(self.0 & !bit) }
    }
}

impl Default for ControlWord {
    fn default() -> Self {
        Self(DEFAULT_STEP_SIZE as u32)
    }
}

/// Convert a real step size to Q0.16, truncating toward zero.
///
/// Returns `None` if it doesn't fit in `[0, 1)`.
#[must_use]
pub fn step_size_from_f64(mu: f64) -> Option<u16> {
    if !(0.0..1.0).contains(&mu) {
        return None;
    }
    Some((mu * 65536.0).trunc() as u16)
}

/// The host writable slots, and their defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterFile {
    default_control: ControlWord,
    control: ControlWord,
    seed: Sc16,
    // Desired source the surrounding plumbing can feed, if it can only do one.
    pinned: Option<DesiredSource>,
}

impl RegisterFile {
    /// Create register file with power on defaults.
    pub fn new(default_control: u32, default_seed: u32) -> Result<Self> {
        let default_control = ControlWord::from_bits(default_control).map_err(|_| {
            Error::InvalidConfiguration(format!(
                "default control word {default_control:#010x} has reserved bits set"
            ))
        })?;
        Ok(Self {
            default_control,
            control: default_control,
            seed: Sc16::unpack(default_seed),
            pinned: None,
        })
    }

    /// Only accept control words with this desired source from now on.
    ///
    /// Fails if the active control word already selects another one.
    pub fn pin_desired(&mut self, d: DesiredSource) -> Result<()> {
        if self.control.desired() != d {
            return Err(Error::InvalidConfiguration(format!(
                "control word {:#010x} wants {:?} desired response, only {d:?} is wired",
                self.control.bits(),
                self.control.desired()
            )));
        }
        self.pinned = Some(d);
        Ok(())
    }

    /// Active control word.
    #[must_use]
    pub fn control(&self) -> ControlWord {
        self.control
    }

    /// Active coefficient seed, Q1.15.
    #[must_use]
    pub fn seed(&self) -> Sc16 {
        self.seed
    }

    /// Read a slot on the readback bus.
    pub fn read(&self, addr: u32) -> Result<u32> {
        match addr {
            REG_USER_ADDR => Ok(self.control.bits()),
            REG_USER_DEFAULT => Ok(self.default_control.bits()),
            REG_COEFF_SEED => Ok(self.seed.pack()),
            other => Err(Error::UnmappedRegister(other)),
        }
    }

    /// Write a slot on the settings bus.
    ///
    /// On error nothing changes.
    pub fn write(&mut self, addr: u32, value: u32) -> Result<()> {
        match addr {
            REG_USER_ADDR => {
                let c = ControlWord::from_bits(value)?;
                if let Some(d) = self.pinned
                    && c.desired() != d
                {
                    return Err(Error::InvalidValue { addr, value });
                }
                self.control = c;
                debug!("control word now {value:#010x}");
            }
            REG_COEFF_SEED => {
                self.seed = Sc16::unpack(value);
                debug!("coefficient seed now {}", self.seed);
            }
            other => return Err(Error::UnmappedRegister(other)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_word_fields() -> Result<()> {
        let c = ControlWord::from_bits(0x0003_1234)?;
        assert_eq!(c.step_size(), 0x1234);
        assert!(c.nlms());
        assert_eq!(c.output(), OutputSelect::Filtered);
        assert_eq!(c.desired(), DesiredSource::Reference);
        let c = c
            .with_step_size(7)
            .with_nlms(false)
            .with_output(OutputSelect::Error)
            .with_desired(DesiredSource::Input);
        assert_eq!(c.bits(), 0x0004_0007);
        assert!(matches!(
            ControlWord::from_bits(1 << 19),
            Err(Error::InvalidValue { addr: REG_USER_ADDR, .. })
        ));
        Ok(())
    }

    #[test]
    fn step_size_conversion() {
        assert_eq!(step_size_from_f64(0.01), Some(655));
        assert_eq!(step_size_from_f64(0.5), Some(0x8000));
        assert_eq!(step_size_from_f64(0.0), Some(0));
        assert_eq!(step_size_from_f64(1.0), None);
        assert_eq!(step_size_from_f64(-0.1), None);
    }

    #[test]
    fn round_trip() -> Result<()> {
        let mut r = RegisterFile::new(0x0001_0100, 0)?;
        assert_eq!(r.read(REG_USER_ADDR)?, 0x0001_0100);
        assert_eq!(r.read(REG_USER_DEFAULT)?, 0x0001_0100);
        for v in [0u32, 1, 0xffff, 0x0007_ffff, 0x0002_0000] {
            r.write(REG_USER_ADDR, v)?;
            assert_eq!(r.read(REG_USER_ADDR)?, v);
        }
        assert_eq!(r.read(REG_USER_DEFAULT)?, 0x0001_0100);
        r.write(REG_COEFF_SEED, 0x4000_0000)?;
        assert_eq!(r.seed(), Sc16::new(0x4000, 0));
        assert_eq!(r.read(REG_COEFF_SEED)?, 0x4000_0000);
        Ok(())
    }

    #[test]
    fn pinned_desired_source() -> Result<()> {
        let predictor = ControlWord::default().with_desired(DesiredSource::Input);
        let mut r = RegisterFile::new(ControlWord::default().bits(), 0)?;
        assert!(matches!(
            r.pin_desired(DesiredSource::Input),
            Err(Error::InvalidConfiguration(_))
        ));

        let mut r = RegisterFile::new(predictor.bits(), 0)?;
        r.pin_desired(DesiredSource::Input)?;
        r.write(REG_USER_ADDR, predictor.with_nlms(true).bits())?;
        let before = r.clone();
        let reference = predictor.with_desired(DesiredSource::Reference).bits();
        assert!(matches!(
            r.write(REG_USER_ADDR, reference),
            Err(Error::InvalidValue { addr: REG_USER_ADDR, value }) if value == reference
        ));
        assert_eq!(r, before);
        assert_eq!(r.control().desired(), DesiredSource::Input);
        Ok(())
    }

    #[test]
    fn rejected_writes_change_nothing() -> Result<()> {
        let mut r = RegisterFile::new(0x10, 0)?;
        let before = r.clone();
        assert!(matches!(
            r.write(REG_USER_ADDR, 0x8000_0000),
            Err(Error::InvalidValue { .. })
        ));
        assert!(matches!(
            r.write(REG_USER_DEFAULT, 1),
            Err(Error::UnmappedRegister(REG_USER_DEFAULT))
        ));
        assert!(matches!(r.write(999, 1), Err(Error::UnmappedRegister(999))));
        assert!(matches!(r.read(999), Err(Error::UnmappedRegister(999))));
        assert_eq!(r, before);
        Ok(())
    }

    #[test]
    fn bad_default() {
        assert!(matches!(
            RegisterFile::new(0xffff_ffff, 0),
            Err(Error::InvalidConfiguration(_))
        ));
    }
}
