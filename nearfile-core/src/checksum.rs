//! Integrity: rolling 32-bit hash over byte buffers, used per chunk and per file.
//! Detects corruption only; it is not a cryptographic digest.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Rolling hash value. Wire form is lower-case hex of the signed value (`-` for negatives).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Checksum(i32);

impl Checksum {
    /// Hash a whole buffer.
    pub fn of(data: &[u8]) -> Self {
        let mut h = Hasher::new();
        h.update(data);
        h.finish()
    }

    pub fn value(&self) -> i32 {
        self.0
    }
}

/// Incremental form of [`Checksum::of`]; `h = h * 31 + byte` with 32-bit wraparound.
#[derive(Debug, Clone, Default)]
pub struct Hasher {
    state: i32,
}

impl Hasher {
    pub fn new() -> Self {
        Self { state: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        for &b in data {
            self.state = self.state.wrapping_mul(31).wrapping_add(b as i32);
        }
    }

    pub fn finish(&self) -> Checksum {
        Checksum(self.state)
    }
}

/// Verify a buffer against an expected checksum.
pub fn verify(data: &[u8], expected: Checksum) -> bool {
    Checksum::of(data) == expected
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0 as i64;
        if v < 0 {
            write!(f, "-{:x}", v.unsigned_abs())
        } else {
            write!(f, "{:x}", v)
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid checksum text: {0:?}")]
pub struct ParseChecksumError(String);

impl FromStr for Checksum {
    type Err = ParseChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (neg, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseChecksumError(s.to_string()));
        }
        let magnitude =
            i64::from_str_radix(digits, 16).map_err(|_| ParseChecksumError(s.to_string()))?;
        let v = if neg { -magnitude } else { magnitude };
        i32::try_from(v)
            .map(Checksum)
            .map_err(|_| ParseChecksumError(s.to_string()))
    }
}

impl Serialize for Checksum {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_hashes_to_zero() {
        assert_eq!(Checksum::of(&[]).value(), 0);
        assert_eq!(Checksum::of(&[]).to_string(), "0");
    }

    #[test]
    fn matches_known_values() {
        // "abc" -> 97*31^2 + 98*31 + 99
        assert_eq!(Checksum::of(b"abc").value(), 96354);
        assert_eq!(Checksum::of(b"abc").to_string(), "17862");
    }

    #[test]
    fn wraps_to_negative_hex() {
        let sum = Checksum::of(&[0xffu8; 64]);
        assert_eq!(sum.to_string().parse::<Checksum>().unwrap(), sum);
        assert_eq!(Checksum(-255).to_string(), "-ff");
        assert_eq!(Checksum(i32::MIN).to_string(), "-80000000");
        assert_eq!("-80000000".parse::<Checksum>().unwrap(), Checksum(i32::MIN));
    }

    #[test]
    fn incremental_equals_one_shot() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut h = Hasher::new();
        for part in data.chunks(7) {
            h.update(part);
        }
        assert_eq!(h.finish(), Checksum::of(&data));
    }

    #[test]
    fn verify_rejects_tampered() {
        let sum = Checksum::of(b"hello chunk");
        assert!(verify(b"hello chunk", sum));
        assert!(!verify(b"hello chunk!", sum));
    }

    #[test]
    fn rejects_garbage_text() {
        assert!("xyz".parse::<Checksum>().is_err());
        assert!("1ffffffff".parse::<Checksum>().is_err());
        assert!("--5".parse::<Checksum>().is_err());
        assert!("-+5".parse::<Checksum>().is_err());
        assert!("+5".parse::<Checksum>().is_err());
        assert!("-".parse::<Checksum>().is_err());
        assert!("".parse::<Checksum>().is_err());
    }
}
