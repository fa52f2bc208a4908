//! Tagged 32-bit values.
//!
//! A [`Value`] is either a SmallInteger (low bit set, 31-bit signed payload)
//! or a reference to a heap object (low bit clear, payload is the object's
//! arena index).

use std::fmt;

pub const MIN_SMALL: i32 = -0x4000_0000;
pub const MAX_SMALL: i32 = 0x3FFF_FFFF;

#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Value(u32);

impl Value {
    #[inline(always)]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub const fn from_index(index: u32) -> Self {
        Self(index << 1)
    }

    /// Tags `value`, or `None` if it does not fit the SmallInteger range.
    #[inline(always)]
    pub const fn small(value: i32) -> Option<Self> {
        if value < MIN_SMALL || value > MAX_SMALL {
            None
        } else {
            Some(Self(((value as u32) << 1) | 1))
        }
    }

    /// Tags an `i64` result, failing when it is out of range.
    #[inline(always)]
    pub const fn small_i64(value: i64) -> Option<Self> {
        if value < MIN_SMALL as i64 || value > MAX_SMALL as i64 {
            None
        } else {
            Self::small(value as i32)
        }
    }

    #[inline(always)]
    pub const fn is_small_int(self) -> bool {
        self.0 & 1 == 1
    }

    #[inline(always)]
    pub const fn is_object(self) -> bool {
        self.0 & 1 == 0
    }

    #[inline(always)]
    pub const fn as_small(self) -> Option<i32> {
        if self.is_small_int() {
            Some((self.0 as i32) >> 1)
        } else {
            None
        }
    }

    #[inline(always)]
    pub const fn index(self) -> Option<usize> {
        if self.is_object() {
            Some((self.0 >> 1) as usize)
        } else {
            None
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.as_small(), self.index()) {
            (Some(n), _) => write!(f, "Small({n})"),
            (_, Some(index)) => write!(f, "Oop(#{index})"),
            _ => unreachable!(),
        }
    }
}

/// Overflow-checked SmallInteger arithmetic.
///
/// Every helper returns `None` where the primitive has to fail and the
/// caller falls back to a real message send.
pub mod arith {
    use super::{MAX_SMALL, MIN_SMALL};

    #[inline]
    fn in_range(value: i64) -> Option<i32> {
        if value < MIN_SMALL as i64 || value > MAX_SMALL as i64 {
            None
        } else {
            Some(value as i32)
        }
    }

    pub fn safe_add(a: i32, b: i32) -> Option<i32> {
        in_range(a as i64 + b as i64)
    }

    pub fn safe_sub(a: i32, b: i32) -> Option<i32> {
        in_range(a as i64 - b as i64)
    }

    pub fn safe_multiply(a: i32, b: i32) -> Option<i32> {
        let product = a.wrapping_mul(b);
        if b != 0 && (product / b != a || (a == -1 && b == i32::MIN)) {
            return None;
        }
        in_range(product as i64)
    }

    /// Left shift for positive counts, arithmetic right shift for negative ones.
    pub fn safe_shift(value: i32, count: i32) -> Option<i32> {
        if count < 0 {
            let count = count.unsigned_abs().min(31);
            return Some(value >> count);
        }
        if count >= 31 {
            return if value == 0 { Some(0) } else { None };
        }
        let shifted = value << count;
        if shifted >> count != value {
            return None;
        }
        in_range(shifted as i64)
    }

    /// Floored division.
    pub fn div(a: i32, b: i32) -> Option<i32> {
        if b == 0 {
            return None;
        }
        let (a, b) = (a as i64, b as i64);
        let quotient = a / b;
        let floored = if (a % b != 0) && ((a < 0) != (b < 0)) {
            quotient - 1
        } else {
            quotient
        };
        in_range(floored)
    }

    /// Floored modulo; the result has the sign of `b`.
    pub fn modulo(a: i32, b: i32) -> Option<i32> {
        let quotient = div(a, b)?;
        in_range(a as i64 - quotient as i64 * b as i64)
    }

    /// Truncated division.
    pub fn quo(a: i32, b: i32) -> Option<i32> {
        if b == 0 {
            return None;
        }
        in_range(a as i64 / b as i64)
    }

    /// Only exact quotients succeed.
    pub fn quick_divide(a: i32, b: i32) -> Option<i32> {
        if b == 0 || a % b != 0 {
            return None;
        }
        in_range(a as i64 / b as i64)
    }
}
