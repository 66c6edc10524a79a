//! Fixed-point monetary arithmetic.
//!
//! All monetary quantities in the core are `Money`: a signed i128 scaled by
//! 10^18, giving 18 fractional digits and 38+ significant digits. Arithmetic
//! is checked and fails loudly on overflow; nothing here silently wraps or
//! rounds without being asked.
//!
//! String form is canonical: no scientific notation, `-` sign, plain decimal
//! digits. Parsing accepts at most one decimal point and rounds half-to-even
//! past the 18th fractional digit.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Scale factor: 1 unit = 10^18 minor units.
pub const MONEY_SCALE: i128 = 1_000_000_000_000_000_000;

/// Fractional digits carried by every `Money` value.
pub const MONEY_DECIMALS: u32 = 18;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum MoneyError {
    #[error("money arithmetic overflow")]
    Overflow,
    #[error("division by zero")]
    DivideByZero,
    #[error("invalid money literal: {0}")]
    Parse(String),
}

/// Rounding behaviour for division and explicit rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoundingMode {
    /// Banker's rounding: ties go to the even digit.
    #[default]
    HalfEven,
    /// Ties round away from zero.
    HalfUp,
    /// Truncate toward zero.
    Down,
}

/// Signed fixed-point amount with 18 fractional digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money(i128);

impl Money {
    pub const ZERO: Money = Money(0);
    pub const ONE: Money = Money(MONEY_SCALE);

    /// Construct from raw scaled units (value * 10^18).
    pub const fn from_raw(raw: i128) -> Self {
        Money(raw)
    }

    /// Raw scaled representation.
    pub const fn raw(self) -> i128 {
        self.0
    }

    /// Construct from a whole number of units.
    pub fn from_int(units: i64) -> Self {
        Money(units as i128 * MONEY_SCALE)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn abs(self) -> Money {
        Money(self.0.abs())
    }

    pub fn neg(self) -> Money {
        Money(-self.0)
    }

    pub fn min(self, other: Money) -> Money {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }

    pub fn max(self, other: Money) -> Money {
        if self.0 >= other.0 {
            self
        } else {
            other
        }
    }

    pub fn checked_add(self, other: Money) -> Result<Money, MoneyError> {
        self.0
            .checked_add(other.0)
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }

    pub fn checked_sub(self, other: Money) -> Result<Money, MoneyError> {
        self.0
            .checked_sub(other.0)
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }

    /// Multiply two fixed-point values, rounding the final fractional product
    /// half-to-even.
    ///
    /// The product is decomposed into integer/fraction limbs so that no
    /// intermediate exceeds i128 unless the true result does.
    pub fn checked_mul(self, other: Money) -> Result<Money, MoneyError> {
        let negative = (self.0 < 0) != (other.0 < 0);
        let a = self.0.unsigned_abs();
        let b = other.0.unsigned_abs();

        let (ai, af) = (a / MONEY_SCALE as u128, a % MONEY_SCALE as u128);
        let (bi, bf) = (b / MONEY_SCALE as u128, b % MONEY_SCALE as u128);

        // a*b/SCALE = ai*bi*SCALE + ai*bf + af*bi + af*bf/SCALE
        let hi = ai
            .checked_mul(bi)
            .and_then(|v| v.checked_mul(MONEY_SCALE as u128))
            .ok_or(MoneyError::Overflow)?;
        let mid1 = ai.checked_mul(bf).ok_or(MoneyError::Overflow)?;
        let mid2 = af.checked_mul(bi).ok_or(MoneyError::Overflow)?;
        // af, bf < 10^18 so af*bf < 10^36 never overflows u128.
        let low_product = af * bf;
        let low = round_div_u128(low_product, MONEY_SCALE as u128, RoundingMode::HalfEven);

        let total = hi
            .checked_add(mid1)
            .and_then(|v| v.checked_add(mid2))
            .and_then(|v| v.checked_add(low))
            .ok_or(MoneyError::Overflow)?;

        signed_from_parts(total, negative)
    }

    /// Divide by another fixed-point value with the given rounding mode.
    pub fn checked_div(self, other: Money, mode: RoundingMode) -> Result<Money, MoneyError> {
        if other.0 == 0 {
            return Err(MoneyError::DivideByZero);
        }
        let negative = (self.0 < 0) != (other.0 < 0);
        let a = self.0.unsigned_abs();
        let b = other.0.unsigned_abs();

        // Integer-unit quotient, then long-divide the remainder digit by
        // digit to recover 18 fractional digits without widening past u128.
        let q_units = a / b;
        let mut rem = a % b;
        let mut result = q_units
            .checked_mul(MONEY_SCALE as u128)
            .ok_or(MoneyError::Overflow)?;

        let mut frac: u128 = 0;
        for _ in 0..MONEY_DECIMALS {
            rem = rem.checked_mul(10).ok_or(MoneyError::Overflow)?;
            frac = frac * 10 + rem / b;
            rem %= b;
        }
        // One guard digit for the rounding decision.
        rem = rem.checked_mul(10).ok_or(MoneyError::Overflow)?;
        let guard = rem / b;
        let sticky = rem % b != 0;
        if should_round_up(frac, guard, sticky, mode) {
            frac += 1;
        }
        result = result.checked_add(frac).ok_or(MoneyError::Overflow)?;

        signed_from_parts(result, negative)
    }

    /// Multiply by an integer count.
    pub fn checked_mul_int(self, n: i64) -> Result<Money, MoneyError> {
        self.0
            .checked_mul(n as i128)
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }

    /// Round to `dp` fractional digits (dp <= 18) with the given mode.
    pub fn round_dp(self, dp: u32, mode: RoundingMode) -> Money {
        if dp >= MONEY_DECIMALS {
            return self;
        }
        let factor = 10i128.pow(MONEY_DECIMALS - dp);
        let negative = self.0 < 0;
        let magnitude = self.0.unsigned_abs();
        let rounded = round_div_u128(magnitude, factor as u128, mode) * factor as u128;
        // Magnitude shrank or stayed within one step of the input, so the
        // conversion back to i128 cannot overflow for in-range inputs.
        let raw = rounded as i128;
        Money(if negative { -raw } else { raw })
    }

    /// Lossy conversion for presentation layers only.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / MONEY_SCALE as f64
    }

    /// Full-scale string with all 18 fractional digits.
    pub fn to_plain_string(self) -> String {
        let negative = self.0 < 0;
        let magnitude = self.0.unsigned_abs();
        let units = magnitude / MONEY_SCALE as u128;
        let frac = magnitude % MONEY_SCALE as u128;
        format!(
            "{}{}.{:018}",
            if negative { "-" } else { "" },
            units,
            frac
        )
    }
}

fn signed_from_parts(magnitude: u128, negative: bool) -> Result<Money, MoneyError> {
    if magnitude > i128::MAX as u128 {
        return Err(MoneyError::Overflow);
    }
    let raw = magnitude as i128;
    Ok(Money(if negative { -raw } else { raw }))
}

/// Divide with rounding; `p / q` where q > 0.
fn round_div_u128(p: u128, q: u128, mode: RoundingMode) -> u128 {
    let quotient = p / q;
    let rem = p % q;
    let round_up = match mode {
        RoundingMode::Down => false,
        RoundingMode::HalfUp => rem * 2 >= q,
        RoundingMode::HalfEven => {
            let doubled = rem * 2;
            doubled > q || (doubled == q && quotient % 2 == 1)
        }
    };
    if round_up {
        quotient + 1
    } else {
        quotient
    }
}

/// Rounding decision for long division given the guard digit and whether any
/// non-zero remainder follows it.
fn should_round_up(current: u128, guard: u128, sticky: bool, mode: RoundingMode) -> bool {
    match mode {
        RoundingMode::Down => false,
        RoundingMode::HalfUp => guard >= 5,
        RoundingMode::HalfEven => {
            guard > 5 || (guard == 5 && (sticky || current % 2 == 1))
        }
    }
}

impl FromStr for Money {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MoneyError::Parse("empty".to_string()));
        }
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        if body.is_empty() {
            return Err(MoneyError::Parse(s.to_string()));
        }

        let mut parts = body.splitn(2, '.');
        let int_part = parts.next().unwrap_or("");
        let frac_part = parts.next().unwrap_or("");

        if int_part.is_empty() && frac_part.is_empty() {
            return Err(MoneyError::Parse(s.to_string()));
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(MoneyError::Parse(s.to_string()));
        }

        let units: u128 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| MoneyError::Parse(s.to_string()))?
        };

        // Scale the fractional digits to exactly 18 places, rounding
        // half-to-even past the end.
        let mut frac: u128 = 0;
        let digits: Vec<u32> = frac_part.chars().filter_map(|c| c.to_digit(10)).collect();
        for i in 0..MONEY_DECIMALS as usize {
            let d = digits.get(i).copied().unwrap_or(0) as u128;
            frac = frac * 10 + d;
        }
        if digits.len() > MONEY_DECIMALS as usize {
            let guard = digits[MONEY_DECIMALS as usize] as u128;
            let sticky = digits[MONEY_DECIMALS as usize + 1..]
                .iter()
                .any(|&d| d != 0);
            if should_round_up(frac, guard, sticky, RoundingMode::HalfEven) {
                frac += 1;
            }
        }

        let magnitude = units
            .checked_mul(MONEY_SCALE as u128)
            .and_then(|v| v.checked_add(frac))
            .ok_or(MoneyError::Overflow)?;
        signed_from_parts(magnitude, negative)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let negative = self.0 < 0;
        let magnitude = self.0.unsigned_abs();
        let units = magnitude / MONEY_SCALE as u128;
        let frac = magnitude % MONEY_SCALE as u128;
        if frac == 0 {
            return write!(f, "{}{}", if negative { "-" } else { "" }, units);
        }
        let mut frac_str = format!("{:018}", frac);
        while frac_str.ends_with('0') {
            frac_str.pop();
        }
        write!(f, "{}{}.{}", if negative { "-" } else { "" }, units, frac_str)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(s: &str) -> Money {
        s.parse().unwrap()
    }

    #[test]
    fn parse_and_display_round_trip() {
        for s in ["0", "1", "-1", "1.5", "-0.25", "123456789.000000000000000001"] {
            let v = m(s);
            assert_eq!(v.to_string(), s, "round trip for {s}");
            assert_eq!(v.to_string().parse::<Money>().unwrap(), v);
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<Money>().is_err());
        assert!("abc".parse::<Money>().is_err());
        assert!("1e5".parse::<Money>().is_err());
        assert!("1.2.3".parse::<Money>().is_err());
        assert!("-".parse::<Money>().is_err());
    }

    #[test]
    fn parse_rounds_past_scale_half_even() {
        // 19th digit 5 with nothing after: ties to even.
        assert_eq!(
            m("0.0000000000000000015").to_plain_string(),
            "0.000000000000000002"
        );
        assert_eq!(
            m("0.0000000000000000025").to_plain_string(),
            "0.000000000000000002"
        );
        assert_eq!(
            m("0.00000000000000000251").to_plain_string(),
            "0.000000000000000003"
        );
    }

    #[test]
    fn add_sub() {
        assert_eq!(m("1.5").checked_add(m("2.25")).unwrap(), m("3.75"));
        assert_eq!(m("1").checked_sub(m("2.5")).unwrap(), m("-1.5"));
    }

    #[test]
    fn mul_exact() {
        assert_eq!(m("1.5").checked_mul(m("2")).unwrap(), m("3"));
        assert_eq!(m("0.1").checked_mul(m("0.1")).unwrap(), m("0.01"));
        assert_eq!(m("-3").checked_mul(m("2.5")).unwrap(), m("-7.5"));
        // Large values that would overflow a naive i128 product.
        assert_eq!(
            m("1000000000").checked_mul(m("1000000000")).unwrap(),
            m("1000000000000000000")
        );
    }

    #[test]
    fn mul_overflow_fails_loudly() {
        let huge = Money::from_raw(i128::MAX / 2);
        assert_eq!(huge.checked_mul(huge), Err(MoneyError::Overflow));
    }

    #[test]
    fn div_exact_and_rounded() {
        assert_eq!(m("3").checked_div(m("2"), RoundingMode::HalfEven).unwrap(), m("1.5"));
        assert_eq!(m("10").checked_div(m("4"), RoundingMode::HalfEven).unwrap(), m("2.5"));
        assert_eq!(
            m("1").checked_div(m("3"), RoundingMode::HalfEven).unwrap().to_plain_string(),
            "0.333333333333333333"
        );
        assert_eq!(
            m("2").checked_div(m("3"), RoundingMode::HalfEven).unwrap().to_plain_string(),
            "0.666666666666666667"
        );
        assert_eq!(
            m("1").checked_div(Money::ZERO, RoundingMode::HalfEven),
            Err(MoneyError::DivideByZero)
        );
    }

    #[test]
    fn round_dp_modes() {
        assert_eq!(m("2.345").round_dp(2, RoundingMode::HalfUp), m("2.35"));
        assert_eq!(m("2.345").round_dp(2, RoundingMode::Down), m("2.34"));
        // Banker's: 2.345 -> 2.34 (4 is even), 2.355 -> 2.36.
        assert_eq!(m("2.345").round_dp(2, RoundingMode::HalfEven), m("2.34"));
        assert_eq!(m("2.355").round_dp(2, RoundingMode::HalfEven), m("2.36"));
        assert_eq!(m("-2.345").round_dp(2, RoundingMode::HalfUp), m("-2.35"));
    }

    #[test]
    fn serde_as_canonical_string() {
        let v = m("12.5");
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"12.5\"");
        let back: Money = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
