//! Deterministic fixed-point square root.
//!
//! `sqrt_fixed(x)` is `floor(sqrt(x))` at `SCALE` decimal places, computed only
//! with decimal arithmetic so every platform produces the same digits:
//!
//! 1. Newton iteration `y' = (y + x / y) / 2` from `y0 = max(x, 1)`. The seed is
//!    never below `sqrt(x)`, so the sequence decreases; it stops at the first
//!    step that does not decrease.
//! 2. Truncate to `SCALE` places.
//! 3. Correct by one unit in the last place so that `r^2 <= x < (r + ulp)^2`.
//!
//! Roots with more than ten integer digits keep fewer than `SCALE` places, since
//! the mantissa holds 28 significant digits.

use rust_decimal::Decimal as RustDecimal;

use crate::domain::Decimal;

/// Decimal places kept by the square root and the QF score.
pub const SCALE: u32 = 18;

/// Upper bound on Newton steps. Convergence from `max(x, 1)` needs about
/// `log2(x) / 2` halving steps plus a handful of quadratic ones.
const MAX_ITERATIONS: usize = 400;

/// Significant digits a `rust_decimal` mantissa always holds.
const MAX_DIGITS: u32 = 28;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SqrtError {
    #[error("square root of negative value {0}")]
    Negative(Decimal),
    #[error("square root of {0} overflows the decimal range")]
    Overflow(Decimal),
}

pub fn sqrt_fixed(x: Decimal) -> Result<Decimal, SqrtError> {
    if x.is_negative() {
        return Err(SqrtError::Negative(x));
    }
    if x.is_zero() {
        return Ok(Decimal::zero());
    }

    let value: RustDecimal = x.inner();
    let two = RustDecimal::TWO;
    let mut y = value.max(RustDecimal::ONE);
    for _ in 0..MAX_ITERATIONS {
        let quotient = value.checked_div(y).ok_or(SqrtError::Overflow(x))?;
        let next = y
            .checked_add(quotient)
            .and_then(|s| s.checked_div(two))
            .ok_or(SqrtError::Overflow(x))?;
        if next >= y {
            break;
        }
        y = next;
    }

    let scale = SCALE.min(MAX_DIGITS.saturating_sub(integer_digits(y)));
    let ulp = RustDecimal::new(1, scale);
    let mut r = y.round_dp_with_strategy(scale, rust_decimal::RoundingStrategy::ToZero);
    let square = |v: RustDecimal| v.checked_mul(v).ok_or(SqrtError::Overflow(x));

    while r > RustDecimal::ZERO && square(r)? > value {
        let down = r - ulp;
        if down == r {
            break;
        }
        r = down;
    }
    loop {
        let up = r.checked_add(ulp).ok_or(SqrtError::Overflow(x))?;
        if up == r || square(up)? > value {
            break;
        }
        r = up;
    }
    Ok(Decimal::new(r))
}

fn integer_digits(v: RustDecimal) -> u32 {
    v.trunc().abs().to_string().len() as u32
}
