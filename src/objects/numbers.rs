//! Checked numeric value types

use crate::error::{Error, Result};

fn range_check(kind: &'static str, value: u32, max: u32) -> Result<()> {
    if value > max {
        Err(Error::OutOfRange {
            kind,
            value: i64::from(value),
            min: 0,
            max: i64::from(max),
        })
    } else {
        Ok(())
    }
}

// =============================================================================
// Volume Number
// =============================================================================

/// Number of a volume within its resource definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VolumeNumber(u32);

impl VolumeNumber {
    pub const MAX: u32 = 0x7FFF;

    pub fn new(value: u32) -> Result<Self> {
        range_check("VolumeNumber", value, Self::MAX)?;
        Ok(Self(value))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for VolumeNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Minor Number
// =============================================================================

/// Unix device minor number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MinorNumber(u32);

impl MinorNumber {
    pub const MAX: u32 = (1 << 20) - 1;

    pub fn new(value: u32) -> Result<Self> {
        range_check("MinorNumber", value, Self::MAX)?;
        Ok(Self(value))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for MinorNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
