//! Bit-vector machine integers.

use std::fmt::{self, Display, Formatter};
use std::ops::{Add, Sub, Mul, BitAnd, BitOr, BitXor, Not, Neg};


/// A bit width between 1 and 64.
pub type Width = u32;

/// The order in which multi-byte values are laid out in memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Endianness {
    Little,
    Big,
}

impl Display for Endianness {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Endianness::Little => write!(f, "little"),
            Endianness::Big => write!(f, "big"),
        }
    }
}

/// A fixed-width integer with wrapping machine semantics.
///
/// The value is always kept masked to the width, so two integers with the
/// same width and value are equal regardless of how they were computed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Integer(pub Width, pub u64);

/// The mask covering the lowest `bits` bits.
pub fn mask(bits: Width) -> u64 {
    assert!(bits >= 1 && bits <= 64, "invalid bit width {}", bits);
    if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

impl Integer {
    /// Create a new integer, truncating the value to the width.
    pub fn new(bits: Width, value: u64) -> Integer {
        Integer(bits, value & mask(bits))
    }

    /// The one-bit truth value.
    pub fn from_bool(value: bool) -> Integer {
        Integer(1, value as u64)
    }

    /// The all-zero integer of a width.
    pub fn zero(bits: Width) -> Integer {
        Integer(bits, 0)
    }

    /// The all-one integer of a width.
    pub fn ones(bits: Width) -> Integer {
        Integer(bits, mask(bits))
    }

    /// The width in bits.
    pub fn bits(self) -> Width {
        self.0
    }

    /// The unsigned value.
    pub fn value(self) -> u64 {
        self.1
    }

    /// The value interpreted as two's complement.
    pub fn signed(self) -> i64 {
        let shift = 64 - self.0;
        ((self.1 << shift) as i64) >> shift
    }

    /// Whether the integer is non-zero.
    pub fn is_true(self) -> bool {
        self.1 != 0
    }

    /// Whether all bits are set.
    pub fn is_ones(self) -> bool {
        self.1 == mask(self.0)
    }

    /// Unsigned division. Division by zero yields all ones like most
    /// bit-vector theories define it.
    pub fn udiv(self, other: Integer) -> Integer {
        check_widths(self, other, "udiv");
        if other.1 == 0 {
            Integer::ones(self.0)
        } else {
            Integer::new(self.0, self.1 / other.1)
        }
    }

    /// Unsigned remainder. The remainder by zero is the dividend.
    pub fn urem(self, other: Integer) -> Integer {
        check_widths(self, other, "urem");
        if other.1 == 0 {
            self
        } else {
            Integer::new(self.0, self.1 % other.1)
        }
    }

    /// Logical left shift. Shifting by the width or more yields zero.
    pub fn shl(self, other: Integer) -> Integer {
        if other.1 >= self.0 as u64 {
            Integer::zero(self.0)
        } else {
            Integer::new(self.0, self.1 << other.1)
        }
    }

    /// Logical right shift.
    pub fn shr(self, other: Integer) -> Integer {
        if other.1 >= self.0 as u64 {
            Integer::zero(self.0)
        } else {
            Integer::new(self.0, self.1 >> other.1)
        }
    }

    /// Arithmetic right shift.
    pub fn sar(self, other: Integer) -> Integer {
        let amount = other.1.min(self.0 as u64 - 1);
        Integer::new(self.0, (self.signed() >> amount) as u64)
    }

    /// Equality as a one-bit integer.
    pub fn eq_bit(self, other: Integer) -> Integer {
        check_widths(self, other, "eq");
        Integer::from_bool(self.1 == other.1)
    }

    /// Inequality as a one-bit integer.
    pub fn ne_bit(self, other: Integer) -> Integer {
        check_widths(self, other, "ne");
        Integer::from_bool(self.1 != other.1)
    }

    /// Unsigned or signed less-than comparison.
    pub fn lt(self, other: Integer, signed: bool) -> Integer {
        check_widths(self, other, "lt");
        Integer::from_bool(if signed {
            self.signed() < other.signed()
        } else {
            self.1 < other.1
        })
    }

    /// Unsigned or signed less-or-equal comparison.
    pub fn le(self, other: Integer, signed: bool) -> Integer {
        check_widths(self, other, "le");
        Integer::from_bool(if signed {
            self.signed() <= other.signed()
        } else {
            self.1 <= other.1
        })
    }

    /// The `size` bits starting at bit `offset`.
    pub fn extract(self, offset: Width, size: Width) -> Integer {
        assert!(offset + size <= self.0, "extract out of range");
        Integer::new(size, self.1 >> offset)
    }

    /// Zero-extend to a wider width.
    pub fn zero_extend(self, bits: Width) -> Integer {
        assert!(bits >= self.0, "zero extension to a smaller width");
        Integer(bits, self.1)
    }

    /// Sign-extend to a wider width.
    pub fn sign_extend(self, bits: Width) -> Integer {
        assert!(bits >= self.0, "sign extension to a smaller width");
        Integer::new(bits, self.signed() as u64)
    }

    /// Concatenate, with `self` as the high part.
    pub fn concat(self, low: Integer) -> Integer {
        let bits = self.0 + low.0;
        assert!(bits <= 64, "concatenation wider than 64 bits");
        Integer::new(bits, (self.1 << low.0) | low.1)
    }
}

fn check_widths(a: Integer, b: Integer, operation: &str) {
    assert_eq!(a.0, b.0, "incompatible widths for integer operation {}", operation);
}

macro_rules! int_operation {
    ($trait:ident, $func:ident, $op:ident) => {
        impl $trait for Integer {
            type Output = Integer;

            fn $func(self, other: Integer) -> Integer {
                check_widths(self, other, stringify!($func));
                Integer::new(self.0, self.1.$op(other.1))
            }
        }
    };
}

int_operation!(Add, add, wrapping_add);
int_operation!(Sub, sub, wrapping_sub);
int_operation!(Mul, mul, wrapping_mul);
int_operation!(BitAnd, bitand, bitand);
int_operation!(BitOr, bitor, bitor);
int_operation!(BitXor, bitxor, bitxor);

impl Not for Integer {
    type Output = Integer;

    fn not(self) -> Integer {
        Integer::new(self.0, !self.1)
    }
}

impl Neg for Integer {
    type Output = Integer;

    fn neg(self) -> Integer {
        Integer::new(self.0, self.1.wrapping_neg())
    }
}

impl Display for Integer {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:#x}:{}", self.1, self.0)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn n(bits: Width, x: u64) -> Integer { Integer::new(bits, x) }

    #[test]
    fn wrapping() {
        assert_eq!(n(8, 0xff) + n(8, 1), n(8, 0));
        assert_eq!(n(8, 0) - n(8, 1), n(8, 0xff));
        assert_eq!(n(32, 0x10000) * n(32, 0x10000), n(32, 0));
        assert_eq!(-n(16, 1), n(16, 0xffff));
        assert_eq!(!n(4, 0b1010), n(4, 0b0101));
        assert_eq!(n(64, u64::MAX) + n(64, 2), n(64, 1));
    }

    #[test]
    fn comparisons() {
        assert_eq!(n(8, 0x80).lt(n(8, 1), false), Integer::from_bool(false));
        assert_eq!(n(8, 0x80).lt(n(8, 1), true), Integer::from_bool(true));
        assert_eq!(n(8, 5).le(n(8, 5), true), Integer::from_bool(true));
        assert_eq!(n(8, 0x80).signed(), -128);
    }

    #[test]
    fn bit_fiddling() {
        assert_eq!(n(32, 0x12345678).extract(8, 8), n(8, 0x56));
        assert_eq!(n(8, 0x12).concat(n(8, 0x34)), n(16, 0x1234));
        assert_eq!(n(8, 0x80).sign_extend(16), n(16, 0xff80));
        assert_eq!(n(8, 0x80).zero_extend(16), n(16, 0x80));
        assert_eq!(n(8, 0x81).sar(n(8, 1)), n(8, 0xc0));
        assert_eq!(n(8, 0x81).shr(n(8, 1)), n(8, 0x40));
        assert_eq!(n(8, 1).shl(n(8, 9)), n(8, 0));
        assert_eq!(n(8, 7).udiv(n(8, 0)), n(8, 0xff));
        assert_eq!(n(8, 7).urem(n(8, 2)), n(8, 1));
    }
}
