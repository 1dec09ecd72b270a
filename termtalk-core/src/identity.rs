//! Ephemeral room and peer identifiers.
//!
//! Both identifiers come from the OS CSPRNG and nothing else. No MAC
//! addresses, host names, clock sequences or process metadata are mixed in,
//! so an identifier says nothing about the machine that generated it.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::{Rng, RngCore};

use crate::error::ProtocolError;

/// Random bytes behind a room identifier (64 bits).
pub const ROOM_ID_BYTES: usize = 8;

/// Length of a room identifier in hex characters.
pub const ROOM_ID_LEN: usize = ROOM_ID_BYTES * 2;

/// Length of a peer identifier in characters.
pub const PEER_ID_LEN: usize = 6;

/// Alphabet used for peer identifiers.
const PEER_ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// How many times `generate_unique` redraws before giving up.
pub const MAX_GENERATION_ATTEMPTS: usize = 8;

/// Check that the OS randomness source answers.
///
/// Called once at startup. Identifier and key generation afterwards assume
/// the source is available; losing it mid-process is fatal.
pub fn probe_entropy() -> Result<(), ProtocolError> {
    let mut probe = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut probe)
        .map_err(|_| ProtocolError::EntropyUnavailable)
}

/// Opaque, high-entropy room identifier.
///
/// Rendered as 16 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomId([u8; ROOM_ID_BYTES]);

impl RoomId {
    /// Draw a fresh identifier from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; ROOM_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Draw identifiers until `is_taken` rejects none of them.
    ///
    /// Returns `None` after [`MAX_GENERATION_ATTEMPTS`] collisions, which at
    /// 64 bits of entropy means the caller's `is_taken` is broken.
    pub fn generate_unique(mut is_taken: impl FnMut(&RoomId) -> bool) -> Option<Self> {
        (0..MAX_GENERATION_ATTEMPTS)
            .map(|_| Self::generate())
            .find(|id| !is_taken(id))
    }

    /// Raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; ROOM_ID_BYTES] {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoomId({})", self)
    }
}

/// Error returned when parsing a [`RoomId`] from text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("room id must be {ROOM_ID_LEN} hex characters")]
pub struct InvalidRoomId;

impl FromStr for RoomId {
    type Err = InvalidRoomId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != ROOM_ID_LEN {
            return Err(InvalidRoomId);
        }
        let mut bytes = [0u8; ROOM_ID_BYTES];
        hex::decode_to_slice(s.to_ascii_lowercase(), &mut bytes).map_err(|_| InvalidRoomId)?;
        Ok(Self(bytes))
    }
}

/// Short display-only peer identifier.
///
/// Not a credential. Unique within one room, never persisted.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Draw a fresh identifier from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let mut chars = [0u8; PEER_ID_LEN];
        for c in chars.iter_mut() {
            *c = PEER_ALPHABET[rng.gen_range(0..PEER_ALPHABET.len())];
        }
        Self(chars)
    }

    /// Draw identifiers until `is_taken` rejects none of them.
    pub fn generate_unique(mut is_taken: impl FnMut(&PeerId) -> bool) -> Option<Self> {
        (0..MAX_GENERATION_ATTEMPTS)
            .map(|_| Self::generate())
            .find(|id| !is_taken(id))
    }

    /// Identifier as a string slice.
    pub fn as_str(&self) -> &str {
        // Every byte comes from PEER_ALPHABET, which is ASCII.
        std::str::from_utf8(&self.0).unwrap_or("??????")
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_probe_entropy() {
        assert_eq!(probe_entropy(), Ok(()));
    }

    #[test]
    fn test_room_ids_unique_over_many_trials() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(RoomId::generate()));
        }
    }

    #[test]
    fn test_room_id_bits_are_balanced() {
        // Monobit check over 10,000 ids (640,000 bits). A source that is
        // stuck or heavily biased lands far outside this band.
        let ones: u64 = (0..10_000)
            .map(|_| RoomId::generate())
            .map(|id| id.as_bytes().iter().map(|b| b.count_ones() as u64).sum::<u64>())
            .sum();
        let total = 10_000 * ROOM_ID_BYTES as u64 * 8;
        let ratio = ones as f64 / total as f64;
        assert!((0.49..0.51).contains(&ratio), "ones ratio {}", ratio);
    }

    #[test]
    fn test_room_id_distinct_bytes_per_id() {
        // Each id should look random on its own, not just differ from others.
        let low_entropy = (0..10_000)
            .map(|_| RoomId::generate())
            .filter(|id| {
                let distinct: HashSet<_> = id.as_bytes().iter().collect();
                distinct.len() < 3
            })
            .count();
        assert_eq!(low_entropy, 0);
    }

    #[test]
    fn test_room_id_text_roundtrip() {
        let id = RoomId::generate();
        let text = id.to_string();
        assert_eq!(text.len(), ROOM_ID_LEN);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(text.parse::<RoomId>(), Ok(id));
        assert_eq!(text.to_uppercase().parse::<RoomId>(), Ok(id));
    }

    #[test]
    fn test_room_id_parse_rejects_bad_input() {
        assert_eq!("".parse::<RoomId>(), Err(InvalidRoomId));
        assert_eq!("abc".parse::<RoomId>(), Err(InvalidRoomId));
        assert_eq!("zzzzzzzzzzzzzzzz".parse::<RoomId>(), Err(InvalidRoomId));
        assert_eq!("0123456789abcdef0".parse::<RoomId>(), Err(InvalidRoomId));
    }

    #[test]
    fn test_peer_id_shape() {
        for _ in 0..1_000 {
            let id = PeerId::generate();
            assert_eq!(id.as_str().len(), PEER_ID_LEN);
            assert!(id.as_str().bytes().all(|b| PEER_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_generate_unique_skips_taken() {
        let mut calls = 0;
        let id = RoomId::generate_unique(|_| {
            calls += 1;
            calls < 3
        });
        assert!(id.is_some());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_generate_unique_gives_up() {
        assert!(PeerId::generate_unique(|_| true).is_none());
    }
}
