//! Device identity and pairing codes.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

const ID_PREFIX: &str = "device_";
const ID_SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Device ID: random, generated once per process. Used in discovery, pairing and the peer table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Generate a fresh id of the form `device_xxxxxxxxx` (base36 suffix).
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..ID_SUFFIX_LEN)
            .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
            .collect();
        DeviceId(format!("{ID_PREFIX}{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        DeviceId(s)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Local identity: id plus the name shown to other devices.
#[derive(Debug, Clone)]
pub struct Identity {
    pub device_id: DeviceId,
    pub display_name: String,
    /// Free-form platform tag carried in discovery (`deviceType`).
    pub device_type: String,
}

impl Identity {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            device_id: DeviceId::generate(),
            display_name: display_name.into(),
            device_type: std::env::consts::OS.to_string(),
        }
    }
}

/// Four-digit pairing code. Travels in-band in `pair_request`; it is an
/// operator confirmation, not a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PairCode(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("pairing code must be {} digits, got {0:?}", PairCode::LEN)]
pub struct InvalidPairCode(String);

impl PairCode {
    pub const LEN: usize = 4;

    /// Random code in 1000..=9999.
    pub fn generate() -> Self {
        let n: u16 = rand::thread_rng().gen_range(1000..=9999);
        PairCode(n.to_string())
    }

    /// Accept exactly four ASCII digits (surrounding whitespace ignored).
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() == Self::LEN && s.bytes().all(|b| b.is_ascii_digit()) {
            Some(PairCode(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PairCode {
    type Error = InvalidPairCode;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        PairCode::parse(&s).ok_or(InvalidPairCode(s))
    }
}

impl From<PairCode> for String {
    fn from(code: PairCode) -> Self {
        code.0
    }
}

impl fmt::Display for PairCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
