//! Time-sortable 64-bit row identifiers
//!
//! Layout (most significant bit first):
//! - bit 63: always zero
//! - bits 62..20: milliseconds since [`EPOCH_MS`] (~278 years)
//! - bits 19..4: random start, then a counter within the same millisecond
//! - bits 3..0: format version
//!
//! The printable form is always 11 characters: the 8 big-endian bytes encoded
//! with a base64 alphabet listed in ASCII order, so byte-wise string comparison
//! agrees with integer comparison.

use std::fmt;
use std::str::FromStr;

use base64::alphabet::Alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::{Result, StoreError};

/// 2024-01-01T00:00:00Z in Unix milliseconds.
pub const EPOCH_MS: i64 = 1_704_067_200_000;

/// Current identifier layout version, stored in the low 4 bits.
pub const ID_VERSION: u64 = 1;

/// Length of every encoded identifier.
pub const ENCODED_LEN: usize = 11;

const TIME_SHIFT: u32 = 20;
const RANDOM_SHIFT: u32 = 4;
const COUNTER_STEP: u64 = 1 << RANDOM_SHIFT;
const TIME_MASK: u64 = (1 << 43) - 1;

const SORTABLE: Alphabet =
    match Alphabet::new("-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz") {
        Ok(alphabet) => alphabet,
        Err(_) => panic!("sortable alphabet must hold 64 distinct printable characters"),
    };

const SORTABLE_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &SORTABLE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::RequireNone),
);

/// A row identifier. Zero means "unset".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u64);

impl Id {
    pub const ZERO: Id = Id(0);

    pub const fn from_raw(raw: u64) -> Self {
        Id(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Build an identifier for a specific instant with fresh random bits.
    ///
    /// Unlike [`IdGenerator::next`] there is no uniqueness guarantee; useful
    /// for imports and tests that need a known creation time.
    pub fn at(time: DateTime<Utc>) -> Self {
        Id::from_parts(millis_since_epoch(time), u64::from(rand::random::<u16>()))
    }

    fn from_parts(ms: u64, random: u64) -> Self {
        Id(((ms & TIME_MASK) << TIME_SHIFT) | ((random & 0xFFFF) << RANDOM_SHIFT) | (ID_VERSION & 0xF))
    }

    /// Fixed-width, order-preserving printable form.
    pub fn encode(self) -> String {
        SORTABLE_ENGINE.encode(self.0.to_be_bytes())
    }

    pub fn decode(s: &str) -> Result<Self> {
        if s.len() != ENCODED_LEN {
            return Err(StoreError::InvalidId(format!(
                "{:?}: length {} (want {})",
                s,
                s.len(),
                ENCODED_LEN
            )));
        }
        let bytes = SORTABLE_ENGINE
            .decode(s)
            .map_err(|e| StoreError::InvalidId(format!("{:?}: {}", s, e)))?;
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| StoreError::InvalidId(format!("{:?}: does not decode to 8 bytes", s)))?;
        Ok(Id(u64::from_be_bytes(raw)))
    }

    /// Creation time encoded in the identifier.
    pub fn timestamp(self) -> DateTime<Utc> {
        let ms = ((self.0 >> TIME_SHIFT) & TIME_MASK) as i64 + EPOCH_MS;
        Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
    }

    pub fn version(self) -> u8 {
        (self.0 & 0xF) as u8
    }

    pub fn random_bits(self) -> u16 {
        ((self.0 >> RANDOM_SHIFT) & 0xFFFF) as u16
    }
}

fn millis_since_epoch(time: DateTime<Utc>) -> u64 {
    (time.timestamp_millis() - EPOCH_MS).max(0) as u64
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Id {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Id::decode(s)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if self.is_zero() {
            serializer.serialize_str("")
        } else {
            serializer.serialize_str(&self.encode())
        }
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Id::ZERO);
        }
        Id::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Mints identifiers that are unique and strictly increasing for the
/// lifetime of the generator.
///
/// Share one generator (behind an `Arc` or a `'static`) between every
/// component that creates rows in the same tables.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: Mutex<u64>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Id {
        let ms = millis_since_epoch(Utc::now()) & TIME_MASK;
        let mut last = self.last.lock();
        let last_ms = (*last >> TIME_SHIFT) & TIME_MASK;

        let id = if *last == 0 || ms > last_ms {
            Id::from_parts(ms, u64::from(rand::random::<u16>()))
        } else {
            // Same millisecond or the clock went backwards: bump the counter,
            // carrying into the timestamp bits if it overflows.
            Id(*last + COUNTER_STEP)
        };

        *last = id.0;
        id
    }

    /// The most recently issued identifier, or zero.
    pub fn last(&self) -> Id {
        Id(*self.last.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_zero_id() {
        assert!(Id::ZERO.is_zero());
        assert!(!Id::from_raw(1).is_zero());
        assert_eq!(Id::ZERO.encode(), "-----------");
        assert_eq!(serde_json::to_string(&Id::ZERO).unwrap(), "\"\"");
        let parsed: Id = serde_json::from_str("\"\"").unwrap();
        assert!(parsed.is_zero());
    }

    #[test]
    fn test_encode_fixed_width() {
        assert_eq!(Id::from_raw(1).encode().len(), ENCODED_LEN);
        assert_eq!(Id::from_raw(u64::MAX).encode().len(), ENCODED_LEN);
        assert_eq!(Id::from_raw(u64::MAX).encode(), "zzzzzzzzzzw");
    }

    #[test]
    fn test_decode_errors() {
        assert!(Id::decode("").is_err());
        assert!(Id::decode("abc").is_err());
        assert!(Id::decode("------------").is_err()); // 12 chars
        assert!(Id::decode("----------=").is_err());
        assert!(Id::decode("-----!-----").is_err());
        // Last character carries 2 unused bits which must be zero.
        assert!(Id::decode("----------z").is_err());

        let err = Id::decode("bad").unwrap_err();
        assert_eq!(err.kind(), crate::engine::jsonl::ErrorKind::Format);
    }

    #[test]
    fn test_generator_monotonic() {
        let gen = IdGenerator::new();
        let mut prev = Id::ZERO;
        for _ in 0..10_000 {
            let id = gen.next();
            assert!(id > prev);
            assert!(id.encode() > prev.encode());
            assert_eq!(id.version(), ID_VERSION as u8);
            prev = id;
        }
        assert_eq!(gen.last(), prev);
    }

    #[test]
    fn test_generator_concurrent_uniqueness() {
        let gen = Arc::new(IdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gen = Arc::clone(&gen);
                thread::spawn(move || (0..2_000).map(|_| gen.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(!id.is_zero());
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 16_000);
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let when = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap();
        let id = Id::at(when);
        assert_eq!(id.timestamp(), when);

        let before_epoch = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(Id::at(before_epoch).timestamp().timestamp_millis(), EPOCH_MS);
    }

    #[test]
    fn test_serde_roundtrip() {
        let id = IdGenerator::new().next();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<Id>("\"nope\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_encoding_preserves_order(a in any::<u64>(), b in any::<u64>()) {
            let (ea, eb) = (Id::from_raw(a).encode(), Id::from_raw(b).encode());
            prop_assert_eq!(a.cmp(&b), ea.as_bytes().cmp(eb.as_bytes()));
        }

        #[test]
        fn prop_decode_inverts_encode(x in any::<u64>()) {
            let id = Id::from_raw(x);
            prop_assert_eq!(Id::decode(&id.encode()).unwrap(), id);
        }
    }
}
