//! Byte-count and settlement-unit newtypes.

use std::{fmt, ops};

use serde::{Deserialize, Serialize};

/// A size in bytes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ByteCount(pub u64);

impl ByteCount {
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl From<u64> for ByteCount {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<usize> for ByteCount {
    fn from(value: usize) -> Self {
        Self(value as u64)
    }
}

impl ops::Add for ByteCount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl ops::AddAssign for ByteCount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl fmt::Display for ByteCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Winston: the smallest settlement unit of the payment currency.
///
/// Balances can exceed `u64::MAX` (the currency's total supply does), so the
/// inner representation is `u128`. Serialized as a decimal string, matching
/// the payment service's JSON surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Winston(pub u128);

impl Winston {
    pub const ZERO: Self = Self(0);

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for Winston {
    fn from(value: u64) -> Self {
        Self(value as u128)
    }
}

impl std::str::FromStr for Winston {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u128>().map(Self)
    }
}

impl fmt::Display for Winston {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Serialize for Winston {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Winston {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn winston_serializes_as_decimal_string() {
        let w = Winston(123_456_789_000_000_000_000_000u128);
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(json, "\"123456789000000000000000\"");
        let back: Winston = serde_json::from_str(&json).unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn byte_count_arithmetic() {
        let a = ByteCount(10) + ByteCount(5);
        assert_eq!(a, ByteCount(15));
        assert_eq!(a.saturating_sub(ByteCount(20)), ByteCount(0));
    }
}
