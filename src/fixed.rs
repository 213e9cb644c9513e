/*! Saturating fixed point samples.

The streaming core works on `sc16`: a complex pair of 16 bit integers, where
each half behaves like `ap_fixed<16,16,AP_RND_ZERO,AP_SAT>`. That is, all
sixteen bits are integer bits, narrowing rounds toward zero, and any value
that doesn't fit clamps to the nearest extreme instead of wrapping.

The type carries no scaling. The filter core reads samples as Q1.15, but
that's a convention of the algorithm, not of the type.

Arithmetic is done wide (`i64`) and only narrowed on store, so intermediate
results never overflow before the final saturation.
*/
use std::ops::{Add, Mul, Neg, Sub};

/// Wide complex accumulator.
pub type Wide = num_complex::Complex<i64>;

/// Saturate a wide value to a signed `bits` wide integer.
///
/// Returns the clamped value, and whether clamping happened.
#[must_use]
pub fn saturate_bits(v: i64, bits: u32) -> (i64, bool) {
    debug_assert!((2..=63).contains(&bits));
    let max = (1i64 << (bits - 1)) - 1;
    let min = -(1i64 << (bits - 1));
    if v > max {
        (max, true)
    } else if v < min {
        (min, true)
    } else {
        (v, false)
    }
}

/// Shift right, rounding toward zero.
///
/// An arithmetic shift rounds toward negative infinity, which is not what
/// AP_RND_ZERO does.
#[must_use]
pub fn shr_round_to_zero(v: i64, shift: u32) -> i64 {
    if shift == 0 {
        return v;
    }
    v / (1i64 << shift)
}

/// Saturate a 128 bit value into an `i64`.
#[must_use]
pub fn narrow_i128(v: i128) -> (i64, bool) {
    if v > i64::MAX as i128 {
        (i64::MAX, true)
    } else if v < i64::MIN as i128 {
        (i64::MIN, true)
    } else {
        (v as i64, false)
    }
}

/// One saturating 16 bit fixed point value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fix16(i16);

impl Fix16 {
    /// Largest representable value.
    pub const MAX: Fix16 = Fix16(i16::MAX);
    /// Most negative representable value.
    pub const MIN: Fix16 = Fix16(i16::MIN);
    /// Zero.
    pub const ZERO: Fix16 = Fix16(0);

    /// Create from raw bits.
    #[must_use]
    pub const fn new(v: i16) -> Self {
        Self(v)
    }

    /// Get raw bits.
    #[must_use]
    pub const fn raw(self) -> i16 {
        self.0
    }

    /// Saturate a wide value into range.
    ///
    /// The bool is true if the value was clamped.
    #[must_use]
    pub fn saturate(v: i64) -> (Self, bool) {
        let (v, sat) = saturate_bits(v, 16);
        (Self(v as i16), sat)
    }

    /// Saturate, dropping the saturation flag.
    #[must_use]
    pub fn saturating(v: i64) -> Self {
        Self::saturate(v).0
    }

    /// Narrow a wide value with `shift` fractional bits.
    #[must_use]
    pub fn from_wide(v: i64, shift: u32) -> (Self, bool) {
        Self::saturate(shr_round_to_zero(v, shift))
    }

    /// Convert from float, truncating toward zero and saturating.
    ///
    /// NaN becomes zero, and counts as a saturation.
    #[must_use]
    pub fn from_f64(v: f64) -> (Self, bool) {
        if v.is_nan() {
            return (Self::ZERO, true);
        }
        let t = v.trunc();
        if t > i16::MAX as f64 {
            (Self::MAX, true)
        } else if t < i16::MIN as f64 {
            (Self::MIN, true)
        } else {
            (Self(t as i16), false)
        }
    }

    /// Value as wide integer.
    #[must_use]
    pub fn wide(self) -> i64 {
        self.0 as i64
    }
}

impl From<i16> for Fix16 {
    fn from(v: i16) -> Self {
        Self(v)
    }
}

impl From<Fix16> for i16 {
    fn from(v: Fix16) -> Self {
        v.0
    }
}

impl Add for Fix16 {
    type Output = Fix16;
    fn add(self, o: Fix16) -> Fix16 {
        Fix16::saturating(self.wide() + o.wide())
    }
}

impl Sub for Fix16 {
    type Output = Fix16;
    fn sub(self, o: Fix16) -> Fix16 {
        Fix16::saturating(self.wide() - o.wide())
    }
}

impl Mul for Fix16 {
    type Output = Fix16;
    fn mul(self, o: Fix16) -> Fix16 {
        Fix16::saturating(self.wide() * o.wide())
    }
}

impl Neg for Fix16 {
    type Output = Fix16;
    fn neg(self) -> Fix16 {
        Fix16::saturating(-self.wide())
    }
}

impl std::fmt::Display for Fix16 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Complex 16 bit saturating sample, I/Q.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Sc16 {
    /// In-phase.
    pub re: Fix16,
    /// Quadrature.
    pub im: Fix16,
}

impl Sc16 {
    /// Zero sample.
    pub const ZERO: Sc16 = Sc16 {
        re: Fix16::ZERO,
        im: Fix16::ZERO,
    };

    /// Create sample from raw I and Q.
    #[must_use]
    pub const fn new(re: i16, im: i16) -> Self {
        Self {
            re: Fix16::new(re),
            im: Fix16::new(im),
        }
    }

    /// Create from floats, truncating and saturating each half.
    ///
    /// Returns the number of halves that saturated.
    #[must_use]
    pub fn from_f64(re: f64, im: f64) -> (Self, u32) {
        let (re, a) = Fix16::from_f64(re);
        let (im, b) = Fix16::from_f64(im);
        (Self { re, im }, a as u32 + b as u32)
    }

    /// Narrow a wide accumulator with `shift` fractional bits.
    ///
    /// Returns the number of halves that saturated.
    #[must_use]
    pub fn from_wide(v: Wide, shift: u32) -> (Self, u32) {
        let (re, a) = Fix16::from_wide(v.re, shift);
        let (im, b) = Fix16::from_wide(v.im, shift);
        (Self { re, im }, a as u32 + b as u32)
    }

    /// Widen for accumulation.
    #[must_use]
    pub fn wide(self) -> Wide {
        Wide::new(self.re.wide(), self.im.wide())
    }

    /// Complex conjugate. `-MIN` saturates to `MAX`.
    #[must_use]
    pub fn conj(self) -> Self {
        Self {
            re: self.re,
            im: -self.im,
        }
    }

    /// Squared magnitude, exact.
    #[must_use]
    pub fn norm_sqr(self) -> i64 {
        let w = self.wide();
        w.re * w.re + w.im * w.im
    }

    /// Pack as a 32 bit word, I in the upper half.
    #[must_use]
    pub fn pack(self) -> u32 {
        ((self.re.raw() as u16 as u32) << 16) | (self.im.raw() as u16 as u32)
    }

    /// Unpack a 32 bit word, I in the upper half.
    #[must_use]
    pub fn unpack(v: u32) -> Self {
        Self::new((v >> 16) as u16 as i16, v as u16 as i16)
    }
}

impl Add for Sc16 {
    type Output = Sc16;
    fn add(self, o: Sc16) -> Sc16 {
        Sc16::from_wide(self.wide() + o.wide(), 0).0
    }
}

impl Sub for Sc16 {
    type Output = Sc16;
    fn sub(self, o: Sc16) -> Sc16 {
        Sc16::from_wide(self.wide() - o.wide(), 0).0
    }
}

impl Mul for Sc16 {
    type Output = Sc16;
    fn mul(self, o: Sc16) -> Sc16 {
        Sc16::from_wide(self.wide() * o.wide(), 0).0
    }
}

impl From<(i16, i16)> for Sc16 {
    fn from((re, im): (i16, i16)) -> Self {
        Self::new(re, im)
    }
}

impl std::fmt::Display for Sc16 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({},{})", self.re, self.im)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturate_boundaries() {
        assert_eq!(Fix16::saturate(32767), (Fix16::MAX, false));
        assert_eq!(Fix16::saturate(32768), (Fix16::MAX, true));
        assert_eq!(Fix16::saturate(-32768), (Fix16::MIN, false));
        assert_eq!(Fix16::saturate(-32769), (Fix16::MIN, true));
        assert_eq!(Fix16::saturate(0), (Fix16::ZERO, false));
        assert_eq!(Fix16::saturate(i64::MAX), (Fix16::MAX, true));
        assert_eq!(Fix16::saturate(i64::MIN), (Fix16::MIN, true));
    }

    #[test]
    fn arithmetic_saturates() {
        assert_eq!(Fix16::MAX + Fix16::new(1), Fix16::MAX);
        assert_eq!(Fix16::MIN - Fix16::new(1), Fix16::MIN);
        assert_eq!(Fix16::MIN + Fix16::MIN, Fix16::MIN);
        assert_eq!(-Fix16::MIN, Fix16::MAX);
        assert_eq!(-Fix16::MAX, Fix16::new(-32767));
        assert_eq!(Fix16::new(200) * Fix16::new(200), Fix16::MAX);
        assert_eq!(Fix16::new(-200) * Fix16::new(200), Fix16::MIN);
        assert_eq!(Fix16::new(181) * Fix16::new(181), Fix16::new(32761));
        assert_eq!(Fix16::new(100) - Fix16::new(300), Fix16::new(-200));
    }

    #[test]
    fn float_rounds_to_zero() {
        assert_eq!(Fix16::from_f64(0.0), (Fix16::ZERO, false));
        assert_eq!(Fix16::from_f64(1.9), (Fix16::new(1), false));
        assert_eq!(Fix16::from_f64(-0.9), (Fix16::ZERO, false));
        assert_eq!(Fix16::from_f64(-1.9), (Fix16::new(-1), false));
        assert_eq!(Fix16::from_f64(32767.99), (Fix16::MAX, false));
        assert_eq!(Fix16::from_f64(32768.0), (Fix16::MAX, true));
        assert_eq!(Fix16::from_f64(-32768.99), (Fix16::MIN, false));
        assert_eq!(Fix16::from_f64(-32769.0), (Fix16::MIN, true));
        assert_eq!(Fix16::from_f64(f64::INFINITY), (Fix16::MAX, true));
        assert_eq!(Fix16::from_f64(f64::NEG_INFINITY), (Fix16::MIN, true));
        assert_eq!(Fix16::from_f64(f64::NAN), (Fix16::ZERO, true));
    }

    #[test]
    fn wide_narrowing() {
        // 3 / 2 = 1.5 -> 1, and -1.5 -> -1, not -2.
        assert_eq!(Fix16::from_wide(3, 1), (Fix16::new(1), false));
        assert_eq!(Fix16::from_wide(-3, 1), (Fix16::new(-1), false));
        assert_eq!(Fix16::from_wide(-1, 30), (Fix16::ZERO, false));
        assert_eq!(Fix16::from_wide(32767 << 30, 30), (Fix16::MAX, false));
        assert_eq!(Fix16::from_wide(32768 << 30, 30), (Fix16::MAX, true));
        assert_eq!(shr_round_to_zero(-7, 2), -1);
        assert_eq!(shr_round_to_zero(7, 2), 1);
        assert_eq!(shr_round_to_zero(-7, 0), -7);
        assert_eq!(narrow_i128(i128::MAX), (i64::MAX, true));
        assert_eq!(narrow_i128(-5), (-5, false));
    }

    #[test]
    fn complex_ops() {
        let a = Sc16::new(3, 4);
        let b = Sc16::new(1, -2);
        assert_eq!(a + b, Sc16::new(4, 2));
        assert_eq!(a - b, Sc16::new(2, 6));
        // (3+4i)(1-2i) = 3 - 6i + 4i + 8 = 11 - 2i
        assert_eq!(a * b, Sc16::new(11, -2));
        assert_eq!(a.conj(), Sc16::new(3, -4));
        assert_eq!(a.norm_sqr(), 25);
        assert_eq!(Sc16::new(0, i16::MIN).conj(), Sc16::new(0, i16::MAX));
        assert_eq!(
            Sc16::new(i16::MAX, i16::MIN) + Sc16::new(1, -1),
            Sc16::new(i16::MAX, i16::MIN)
        );
        let (s, sats) = Sc16::from_wide(Wide::new(1 << 20, -(1 << 20)), 0);
        assert_eq!(s, Sc16::new(i16::MAX, i16::MIN));
        assert_eq!(sats, 2);
    }

    #[test]
    fn add_is_commutative_and_bounded() {
        let edges = [i16::MIN, i16::MIN + 1, -1, 0, 1, i16::MAX - 1, i16::MAX];
        for &ar in &edges {
            for &ai in &edges {
                for &br in &edges {
                    for &bi in &edges {
                        let a = Sc16::new(ar, ai);
                        let b = Sc16::new(br, bi);
                        let s = a + b;
                        assert_eq!(s, b + a);
                        let want_re = (ar as i64 + br as i64).clamp(-32768, 32767);
                        let want_im = (ai as i64 + bi as i64).clamp(-32768, 32767);
                        assert_eq!(s.re.wide(), want_re);
                        assert_eq!(s.im.wide(), want_im);
                    }
                }
            }
        }
    }

    #[test]
    fn pack_unpack() {
        let s = Sc16::new(-2, 0x1234);
        assert_eq!(s.pack(), 0xfffe_1234);
        assert_eq!(Sc16::unpack(0xfffe_1234), s);
        assert_eq!(Sc16::unpack(0x8000_7fff), Sc16::new(i16::MIN, i16::MAX));
    }
}
