//! Cache allocation requests and their projection onto a base bitmask

use std::fmt;

use rdtctl_raw::Bitmask;

use crate::common::CacheLevel;
use crate::error::{RdtError, Result};

/// One cache allocation request of a partition or a class
///
/// Percentages are only meaningful relative to a base bitmask and are
/// turned into a [`Bitmask`] by [`CacheAllocation::overlay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAllocation {
    /// Explicit bitmask, relative to the lowest bit of the base mask
    Absolute(Bitmask),
    /// Share of the base mask, counted from its lowest bit
    Percentage(u64),
    /// Slice of the base mask between two percentages
    PercentageRange { low: u64, high: u64 },
}

impl CacheAllocation {
    /// Parse an allocation from its textual form
    ///
    /// Accepted forms are `NN%`, `LOW-HIGH%`, `0xHEX` and bit lists such as
    /// `0,2,4-7`. Absolute bitmasks must be contiguous and have at least
    /// `min_bits` bits set.
    pub fn parse(data: &str, level: CacheLevel, min_bits: u64) -> Result<Self> {
        let data = data.trim();

        if let Some(pct) = data.strip_suffix('%') {
            return match pct.split_once('-') {
                None => {
                    let value = parse_percentage(pct, data)?;
                    if value > 100 {
                        return Err(RdtError::InvalidPercentage(data.to_string()));
                    }
                    Ok(Self::Percentage(value))
                }
                Some((low, high)) => {
                    let low = parse_percentage(low, data)?;
                    let high = parse_percentage(high, data)?;
                    if low > high || high > 100 {
                        return Err(RdtError::InvalidPercentage(data.to_string()));
                    }
                    Ok(Self::PercentageRange { low, high })
                }
            };
        }

        let parsed = if data.starts_with("0x") {
            Bitmask::from_hex_str(data)
        } else {
            Bitmask::from_list_str(data)
        };
        let mask = parsed.map_err(|e| RdtError::InvalidBitmask {
            value: data.to_string(),
            reason: e.to_string(),
        })?;

        if mask.is_empty() {
            return Err(RdtError::InvalidBitmask {
                value: data.to_string(),
                reason: "no bits set".to_string(),
            });
        }
        if !mask.is_contiguous() {
            return Err(RdtError::InvalidBitmask {
                value: data.to_string(),
                reason: "more than one continuous block of ones".to_string(),
            });
        }
        if u64::from(mask.count_ones()) < min_bits {
            return Err(RdtError::InvalidBitmask {
                value: data.to_string(),
                reason: format!("number of {level} bits less than {min_bits}"),
            });
        }

        Ok(Self::Absolute(mask))
    }

    pub fn is_absolute(&self) -> bool {
        matches!(self, Self::Absolute(_))
    }

    /// Project the request onto `base`
    ///
    /// Absolute masks are shifted to the lowest bit of `base` and must fit
    /// inside it. Percentages select a proportional slice of `base`, widened
    /// to at least `min_bits` bits.
    pub fn overlay(&self, base: Bitmask, min_bits: u64) -> Result<Bitmask> {
        verify_base_mask(base, min_bits)?;

        match *self {
            Self::Absolute(value) => {
                let shift = base.lsb_one().unwrap_or(0);
                let shifted = value << shift;
                let overflows = value.msb_one().unwrap_or(0) + shift > 63;
                if overflows || !shifted.is_subset_of(base) {
                    return Err(RdtError::DoesNotFitBase {
                        value,
                        shift,
                        shifted,
                        base,
                    });
                }
                Ok(shifted)
            }
            Self::Percentage(pct) => Self::PercentageRange { low: 1, high: pct }.overlay(base, min_bits),
            Self::PercentageRange { low, high } => overlay_range(low, high, base, min_bits, self),
        }
    }
}

impl fmt::Display for CacheAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute(mask) => write!(f, "{mask}"),
            Self::Percentage(pct) => write!(f, "{pct}%"),
            Self::PercentageRange { low, high } => write!(f, "{low}-{high}%"),
        }
    }
}

fn parse_percentage(s: &str, data: &str) -> Result<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RdtError::InvalidPercentage(data.to_string()));
    }
    s.parse()
        .map_err(|_| RdtError::InvalidPercentage(data.to_string()))
}

/// Base masks must hold one contiguous block of at least `min_bits` bits
fn verify_base_mask(base: Bitmask, min_bits: u64) -> Result<()> {
    if base.is_empty() {
        return Err(RdtError::InvalidBaseMask {
            base,
            reason: "empty basemask not allowed".to_string(),
        });
    }
    if !base.is_contiguous() {
        return Err(RdtError::InvalidBaseMask {
            base,
            reason: "more than one block of bits set".to_string(),
        });
    }
    if u64::from(base.count_ones()) < min_bits {
        return Err(RdtError::InvalidBaseMask {
            base,
            reason: format!("fewer than {min_bits} bits set"),
        });
    }
    Ok(())
}

fn overlay_range(
    low: u64,
    high: u64,
    base: Bitmask,
    min_bits: u64,
    request: &CacheAllocation,
) -> Result<Bitmask> {
    let base_lsb = u64::from(base.lsb_one().unwrap_or(0));
    let base_bits = u64::from(base.span());

    // Effective range is 1%-100%
    let low = low.max(1);
    if low > high || high > 100 {
        return Err(RdtError::InvalidPercentage(request.to_string()));
    }

    // Subtract one so that 100% maps to the last bit of the base
    let mut lsb = (low - 1) * base_bits / 100;
    let mut msb = (high - 1) * base_bits / 100;

    let num_bits = msb - lsb + 1;
    if num_bits < min_bits {
        let mut gap = min_bits - num_bits;

        // Widen from the low end first
        let from_low = gap.min(lsb);
        lsb -= from_low;
        gap -= from_low;

        let msb_available = base_bits - msb - 1;
        if gap > msb_available {
            return Err(RdtError::InsufficientBits {
                request: request.to_string(),
                base,
            });
        }
        msb += gap;
    }

    Ok(Bitmask::from_range(
        (lsb + base_lsb) as u32,
        (msb - lsb + 1) as u32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(low: u64, high: u64) -> CacheAllocation {
        CacheAllocation::PercentageRange { low, high }
    }

    #[test]
    fn test_parse() {
        let parse = |s| CacheAllocation::parse(s, CacheLevel::L3, 2);

        assert_eq!(parse("60%").unwrap(), CacheAllocation::Percentage(60));
        assert_eq!(parse("0%").unwrap(), CacheAllocation::Percentage(0));
        assert_eq!(parse("10-20%").unwrap(), range(10, 20));
        assert_eq!(
            parse("0xff00").unwrap(),
            CacheAllocation::Absolute(Bitmask::new(0xff00))
        );
        assert_eq!(
            parse("3,4,5-7,8").unwrap(),
            CacheAllocation::Absolute(Bitmask::new(0x1f8))
        );
    }

    #[test]
    fn test_parse_invalid() {
        let invalid = [
            "101%", "1f%", "%", "-5%", "20-10%", "0-101%", "0x11", "3,5", "1", "0x", "", "0-64",
            "ab",
        ];
        for s in invalid {
            assert!(
                CacheAllocation::parse(s, CacheLevel::L3, 2).is_err(),
                "{s:?} parsed"
            );
        }

        let err = CacheAllocation::parse("0x2f", CacheLevel::L3, 1).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid cache bitmask \"0x2f\": more than one continuous block of ones"
        );
    }

    #[test]
    fn test_overlay_absolute() {
        let abs = CacheAllocation::Absolute(Bitmask::new(0x7));
        assert_eq!(
            abs.overlay(Bitmask::new(0xf00), 4).unwrap(),
            Bitmask::new(0x700)
        );
        assert!(abs.overlay(Bitmask::new(0x30), 1).is_err());
        // Base must be contiguous
        assert!(abs.overlay(Bitmask::new(0xf0f), 1).is_err());

        let err = CacheAllocation::Absolute(Bitmask::new(0x1ff))
            .overlay(Bitmask::new(0xff00), 1)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "bitmask 0x1ff00 (0x1ff << 8) does not fit basemask 0xff00"
        );
    }

    #[test]
    fn test_overlay_absolute_is_deterministic() {
        let abs = CacheAllocation::Absolute(Bitmask::new(0x3c));
        let base = Bitmask::new(0xfff0);
        assert_eq!(
            abs.overlay(base, 2).unwrap(),
            abs.overlay(base, 2).unwrap()
        );
    }

    #[test]
    fn test_overlay_range() {
        let base = Bitmask::new(0xff00);
        assert_eq!(range(0, 100).overlay(base, 4).unwrap(), Bitmask::new(0xff00));
        assert_eq!(range(99, 100).overlay(base, 4).unwrap(), Bitmask::new(0xf000));
        assert_eq!(range(0, 1).overlay(base, 4).unwrap(), Bitmask::new(0xf00));
        assert_eq!(
            range(20, 30).overlay(Bitmask::new(0x3ff00), 4).unwrap(),
            Bitmask::new(0xf00)
        );
        assert_eq!(
            range(30, 60).overlay(Bitmask::new(0xf00), 4).unwrap(),
            Bitmask::new(0xf00)
        );
        assert!(range(50, 40).overlay(base, 1).is_err());
    }

    #[test]
    fn test_overlay_percentage() {
        let base = Bitmask::new(0xfffff);
        assert_eq!(
            CacheAllocation::Percentage(100).overlay(base, 1).unwrap(),
            base
        );
        assert_eq!(
            CacheAllocation::Percentage(66)
                .overlay(Bitmask::new(0xff), 1)
                .unwrap(),
            Bitmask::new(0x3f)
        );
        // 1% is widened to the minimum number of bits
        assert_eq!(
            CacheAllocation::Percentage(1).overlay(base, 2).unwrap(),
            Bitmask::new(0x3)
        );
        assert!(CacheAllocation::Percentage(0).overlay(base, 1).is_err());
    }

    #[test]
    fn test_overlay_invalid_base() {
        let pct = CacheAllocation::Percentage(50);
        assert!(pct.overlay(Bitmask::new(0), 1).is_err());
        assert!(pct.overlay(Bitmask::new(0xf0f), 1).is_err());
        assert!(pct.overlay(Bitmask::new(0x7), 4).is_err());
    }
}
