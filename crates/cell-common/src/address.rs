//! PLC flag addressing.
//!
//! Flags are written as `"register.bit"` in configuration files
//! (e.g. `"1414.15"`), matching the notation used on the PLC side.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Highest bit index inside a 16-bit register.
pub const MAX_BIT: u8 = 15;

/// A single boolean flag inside a numbered 16-bit PLC register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterAddress {
    /// Register number.
    pub register: u16,
    /// Bit index, 0..=15.
    pub bit: u8,
}

impl RegisterAddress {
    /// Create an address. Bits above 15 are clamped.
    #[must_use]
    pub const fn new(register: u16, bit: u8) -> Self {
        let bit = if bit > MAX_BIT { MAX_BIT } else { bit };
        Self { register, bit }
    }

    /// Mask selecting this bit within its register.
    #[must_use]
    pub const fn mask(&self) -> u16 {
        1 << self.bit
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.register, self.bit)
    }
}

/// Error returned when a `"register.bit"` string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid register address {0:?}, expected \"register.bit\" with bit 0-15")]
pub struct AddressParseError(pub String);

impl FromStr for RegisterAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || AddressParseError(s.to_string());
        let (register, bit) = s.trim().split_once('.').ok_or_else(err)?;
        let register = register.parse::<u16>().map_err(|_| err())?;
        let bit = bit.parse::<u8>().map_err(|_| err())?;
        if bit > MAX_BIT {
            return Err(err());
        }
        Ok(Self { register, bit })
    }
}

impl Serialize for RegisterAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RegisterAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A set of bits cleared together in one register by a masked reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskedBits {
    /// Register holding the bits.
    pub register: u16,
    /// Bit indices to clear.
    pub bits: Vec<u8>,
}

impl MaskedBits {
    /// Combined mask of every listed bit (bits above 15 are ignored).
    #[must_use]
    pub fn mask(&self) -> u16 {
        self.bits
            .iter()
            .filter(|&&b| b <= MAX_BIT)
            .fold(0u16, |acc, &b| acc | (1 << b))
    }
}
