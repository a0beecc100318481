//! Cache capacity bitmask value type
//!
//! A [`Bitmask`] is the raw 64-bit value written to the resctrl `schemata`
//! file for one cache ID. Bitmasks can be parsed from and rendered to the
//! two textual forms the kernel uses:
//!
//! - hexadecimal, e.g. `ff00` or `0xff00`
//! - bit lists, e.g. `8-15` or `0,2,4-7`
//!
//! # Example
//!
//! ```
//! use rdtctl_raw::Bitmask;
//!
//! let mask = Bitmask::from_list_str("8-15").unwrap();
//! assert_eq!(mask, Bitmask::new(0xff00));
//! assert_eq!(mask.to_hex_string(), "ff00");
//! assert!(mask.is_contiguous());
//! ```

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Shl};

/// Highest bit number accepted in a bit list
pub const MAX_BIT: u64 = 63;

/// Errors that can occur when parsing bitmasks and integer lists
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BitmaskError {
    #[error("invalid bit number {0:?}")]
    InvalidBit(String),

    #[error("bit number {0} out of range (0-63)")]
    BitOutOfRange(u64),

    #[error("invalid bit range {range:?} in {list:?}")]
    InvalidBitRange { range: String, list: String },

    #[error("invalid hex bitmask {0:?}")]
    InvalidHex(String),

    #[error("invalid integer {0:?}")]
    InvalidInteger(String),

    #[error("invalid integer range {range:?} in {list:?}")]
    InvalidIntegerRange { range: String, list: String },
}

/// A 64-bit cache capacity bitmask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bitmask(pub u64);

impl Bitmask {
    /// Bitmask with all 64 bits set
    pub const FULL: Bitmask = Bitmask(u64::MAX);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn count_ones(self) -> u32 {
        self.0.count_ones()
    }

    /// Index of the lowest set bit, `None` for an empty mask
    pub const fn lsb_one(self) -> Option<u32> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros())
        }
    }

    /// Index of the highest set bit, `None` for an empty mask
    pub const fn msb_one(self) -> Option<u32> {
        if self.0 == 0 {
            None
        } else {
            Some(63 - self.0.leading_zeros())
        }
    }

    /// Index of the lowest cleared bit, i.e. the number of consecutive ones
    /// starting from bit 0
    pub const fn lsb_zero(self) -> u32 {
        self.0.trailing_ones()
    }

    /// Distance between the lowest and the highest set bit, inclusive
    pub const fn span(self) -> u32 {
        match (self.lsb_one(), self.msb_one()) {
            (Some(lsb), Some(msb)) => msb - lsb + 1,
            _ => 0,
        }
    }

    /// True if the mask contains exactly one contiguous block of ones
    pub const fn is_contiguous(self) -> bool {
        self.0 != 0 && self.count_ones() == self.span()
    }

    /// True if every bit of `self` is also set in `other`
    pub const fn is_subset_of(self, other: Bitmask) -> bool {
        self.0 | other.0 == other.0
    }

    /// True if `self` and `other` share at least one set bit
    pub const fn overlaps(self, other: Bitmask) -> bool {
        self.0 & other.0 != 0
    }

    /// Bitmask with `num_bits` consecutive ones starting at bit `lsb`
    pub fn from_range(lsb: u32, num_bits: u32) -> Self {
        if num_bits == 0 || lsb > 63 {
            return Self(0);
        }
        let ones = if num_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << num_bits) - 1
        };
        Self(ones << lsb)
    }

    /// Render in the hexadecimal format accepted by the resctrl schemata file
    pub fn to_hex_string(self) -> String {
        format!("{:x}", self.0)
    }

    /// Render as a human readable bit list, e.g. `0,3-7`
    pub fn to_list_string(self) -> String {
        let mut parts: Vec<String> = Vec::new();
        let mut bit = 0u32;

        while bit < 64 {
            if self.0 & (1 << bit) == 0 {
                bit += 1;
                continue;
            }
            let start = bit;
            while bit < 64 && self.0 & (1 << bit) != 0 {
                bit += 1;
            }
            let end = bit - 1;
            if start == end {
                parts.push(start.to_string());
            } else {
                parts.push(format!("{start}-{end}"));
            }
        }

        parts.join(",")
    }

    /// Parse a hexadecimal bitmask, with or without the `0x` prefix
    pub fn from_hex_str(s: &str) -> Result<Self, BitmaskError> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        u64::from_str_radix(digits, 16)
            .map(Self)
            .map_err(|_| BitmaskError::InvalidHex(s.to_string()))
    }

    /// Parse a bit list like `0,2,4-7` into a bitmask
    ///
    /// An empty string yields an empty mask. Ranges must be strictly
    /// increasing and bit numbers must be in the range 0-63.
    pub fn from_list_str(s: &str) -> Result<Self, BitmaskError> {
        let mut mask = 0u64;

        if s.is_empty() {
            return Ok(Self(mask));
        }

        for part in s.split(',') {
            match part.split_once('-') {
                Some((start, end)) => {
                    let start = parse_bit_number(start)?;
                    let end = parse_bit_number(end)?;
                    if end <= start {
                        return Err(BitmaskError::InvalidBitRange {
                            range: part.to_string(),
                            list: s.to_string(),
                        });
                    }
                    mask |= Self::from_range(start as u32, (end - start + 1) as u32).0;
                }
                None => {
                    let bit = parse_bit_number(part)?;
                    mask |= 1 << bit;
                }
            }
        }

        Ok(Self(mask))
    }
}

fn parse_bit_number(s: &str) -> Result<u64, BitmaskError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BitmaskError::InvalidBit(s.to_string()));
    }
    let bit: u64 = s
        .parse()
        .map_err(|_| BitmaskError::InvalidBit(s.to_string()))?;
    if bit > MAX_BIT {
        return Err(BitmaskError::BitOutOfRange(bit));
    }
    Ok(bit)
}

impl fmt::Display for Bitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Bitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<u64> for Bitmask {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Bitmask> for u64 {
    fn from(mask: Bitmask) -> Self {
        mask.0
    }
}

impl BitOr for Bitmask {
    type Output = Bitmask;

    fn bitor(self, rhs: Bitmask) -> Bitmask {
        Bitmask(self.0 | rhs.0)
    }
}

impl BitOrAssign for Bitmask {
    fn bitor_assign(&mut self, rhs: Bitmask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Bitmask {
    type Output = Bitmask;

    fn bitand(self, rhs: Bitmask) -> Bitmask {
        Bitmask(self.0 & rhs.0)
    }
}

impl Shl<u32> for Bitmask {
    type Output = Bitmask;

    fn shl(self, rhs: u32) -> Bitmask {
        Bitmask(self.0.checked_shl(rhs).unwrap_or(0))
    }
}
