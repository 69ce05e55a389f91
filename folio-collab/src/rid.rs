//! Stream positions for per-document update streams.
//!
//! Every update admitted into a document's stream is stamped with a [`Rid`]
//! by the stream authority (the server). Clients keep the last applied
//! `Rid` as their resume cursor.
//!
//! Ordering is lexicographic on `(timestamp, counter)`:
//! ```text
//! (100, 0) < (100, 1) < (100, 4294967295) < (101, 0)
//! ```
//!
//! The timestamp is an unsigned millisecond count since the Unix epoch and
//! travels as `fixed64`. A peer that writes signed timestamps therefore
//! sorts any negative value above every real timestamp.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of [`Rid::to_key_bytes`] output.
pub const RID_KEY_LEN: usize = 12;

/// Position of an update within one document's stream.
///
/// Field order matters: the derived `Ord` compares `timestamp` first and
/// breaks ties with `counter`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Rid {
    /// Milliseconds since the Unix epoch at admission time.
    pub timestamp: u64,
    /// Disambiguates updates admitted within the same millisecond.
    pub counter: u32,
}

impl Rid {
    /// "No history observed yet."
    pub const ZERO: Rid = Rid { timestamp: 0, counter: 0 };

    pub const fn new(timestamp: u64, counter: u32) -> Self {
        Self { timestamp, counter }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Big-endian encoding whose byte order matches `Rid` order.
    ///
    /// Used as the suffix of storage keys so a forward scan yields
    /// updates in stream order.
    pub fn to_key_bytes(&self) -> [u8; RID_KEY_LEN] {
        let mut out = [0u8; RID_KEY_LEN];
        out[..8].copy_from_slice(&self.timestamp.to_be_bytes());
        out[8..].copy_from_slice(&self.counter.to_be_bytes());
        out
    }

    /// Inverse of [`Rid::to_key_bytes`]. Returns `None` on a short slice.
    pub fn from_key_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RID_KEY_LEN {
            return None;
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[..8]);
        let mut counter = [0u8; 4];
        counter.copy_from_slice(&bytes[8..RID_KEY_LEN]);
        Some(Self {
            timestamp: u64::from_be_bytes(ts),
            counter: u32::from_be_bytes(counter),
        })
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.timestamp, self.counter)
    }
}

/// Total order on stream positions.
pub fn compare(a: &Rid, b: &Rid) -> Ordering {
    a.cmp(b)
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ───────────────────────────────────────────────────────────────────
// Stream authority clock
// ───────────────────────────────────────────────────────────────────

/// Issues strictly increasing `Rid`s for one document stream.
///
/// The wall clock is only a hint: if it stalls or goes backwards the
/// generator keeps counting from the last issued position.
#[derive(Debug, Clone, Default)]
pub struct RidGenerator {
    last: Rid,
}

impl RidGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue a stream whose last admitted update was `head`.
    pub fn resume_from(head: Rid) -> Self {
        Self { last: head }
    }

    /// The most recently issued position (`Rid::ZERO` if none).
    pub fn head(&self) -> Rid {
        self.last
    }

    pub fn next(&mut self) -> Rid {
        self.next_at(now_millis())
    }

    /// Issue the next position given an explicit clock reading.
    pub fn next_at(&mut self, now_ms: u64) -> Rid {
        let next = if now_ms > self.last.timestamp {
            Rid::new(now_ms, 0)
        } else if self.last.counter < u32::MAX {
            Rid::new(self.last.timestamp, self.last.counter + 1)
        } else {
            Rid::new(self.last.timestamp.saturating_add(1), 0)
        };
        self.last = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_sentinel() {
        assert!(Rid::ZERO.is_zero());
        assert!(Rid::default().is_zero());
        assert!(!Rid::new(0, 1).is_zero());
        assert!(!Rid::new(1, 0).is_zero());
    }

    #[test]
    fn test_timestamp_dominates_counter() {
        assert_eq!(compare(&Rid::new(5, 9), &Rid::new(6, 0)), Ordering::Less);
        assert_eq!(compare(&Rid::new(6, 0), &Rid::new(5, u32::MAX)), Ordering::Greater);
    }

    #[test]
    fn test_counter_breaks_ties() {
        assert_eq!(compare(&Rid::new(5, 1), &Rid::new(5, 2)), Ordering::Less);
        assert_eq!(compare(&Rid::new(5, 2), &Rid::new(5, 2)), Ordering::Equal);
    }

    #[test]
    fn test_key_bytes_preserve_order() {
        let rids = [
            Rid::new(0, 0),
            Rid::new(0, 7),
            Rid::new(1, 0),
            Rid::new(255, u32::MAX),
            Rid::new(256, 0),
            Rid::new(u64::MAX, 3),
        ];
        for pair in rids.windows(2) {
            assert!(pair[0].to_key_bytes() < pair[1].to_key_bytes());
            assert_eq!(Rid::from_key_bytes(&pair[1].to_key_bytes()), Some(pair[1]));
        }
        assert_eq!(Rid::from_key_bytes(&[0u8; 11]), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Rid::new(1700000000000, 3).to_string(), "1700000000000.3");
    }

    #[test]
    fn test_generator_uses_clock_when_it_advances() {
        let mut gen = RidGenerator::new();
        assert_eq!(gen.next_at(100), Rid::new(100, 0));
        assert_eq!(gen.next_at(105), Rid::new(105, 0));
        assert_eq!(gen.head(), Rid::new(105, 0));
    }

    #[test]
    fn test_generator_counts_within_same_millisecond() {
        let mut gen = RidGenerator::new();
        assert_eq!(gen.next_at(100), Rid::new(100, 0));
        assert_eq!(gen.next_at(100), Rid::new(100, 1));
        assert_eq!(gen.next_at(100), Rid::new(100, 2));
    }

    #[test]
    fn test_generator_survives_clock_going_backwards() {
        let mut gen = RidGenerator::resume_from(Rid::new(500, 4));
        let next = gen.next_at(10);
        assert_eq!(next, Rid::new(500, 5));
        assert!(next > Rid::new(500, 4));
    }

    #[test]
    fn test_generator_counter_overflow_rolls_timestamp() {
        let mut gen = RidGenerator::resume_from(Rid::new(42, u32::MAX));
        assert_eq!(gen.next_at(42), Rid::new(43, 0));
    }

    #[test]
    fn test_generator_wall_clock() {
        let mut gen = RidGenerator::new();
        let a = gen.next();
        let b = gen.next();
        assert!(a > Rid::ZERO);
        assert!(b > a);
    }
}
