//! ULID-shaped identifier generation.
//!
//! Two families of identifiers exist in the kernel: random ULIDs minted by
//! [`UlidFactory`] for freshly observed entities, and deterministic ULIDs
//! derived from source material so that replays and independent cells agree
//! on the same identifier for the same derivation.

use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::canonical::format_utc;

/// Crockford base32 alphabet (no I, L, O, U).
const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

const RANDOM_BITS: u32 = 80;
const RANDOM_MASK: u128 = (1u128 << RANDOM_BITS) - 1;

/// Factory for monotonic ULIDs.
///
/// Within a single clock tick (millisecond), successive identifiers
/// increment the 80-bit random field, preserving sort order even when the
/// clock does not move.
#[derive(Debug, Default)]
pub struct UlidFactory {
    last_millis: i64,
    last_random: u128,
}

impl UlidFactory {
    pub fn new() -> Self {
        UlidFactory {
            last_millis: -1,
            last_random: 0,
        }
    }

    /// Mint the next identifier for the given instant.
    pub fn next(&mut self, now: DateTime<Utc>) -> String {
        let millis = now.timestamp_millis();
        if millis == self.last_millis {
            // Same tick: monotonic increment of the random field. Wrap is
            // unreachable in practice (2^80 ids per millisecond).
            self.last_random = (self.last_random + 1) & RANDOM_MASK;
        } else {
            self.last_millis = millis;
            let mut bytes = [0u8; 10];
            rand::rngs::OsRng.fill_bytes(&mut bytes);
            self.last_random = random_from_bytes(&bytes);
        }
        encode_ulid(millis, self.last_random)
    }
}

/// Deterministic ULID for derived entities.
///
/// The random field is replaced by the leading 80 bits of SHA-256 over the
/// ordered `(id, timestamp)` pairs, so the same sources always derive the
/// same identifier. Pairs are sorted internally; callers do not need to
/// pre-sort.
pub fn deterministic_ulid(timestamp: DateTime<Utc>, sources: &[(String, DateTime<Utc>)]) -> String {
    let mut pairs: Vec<(String, DateTime<Utc>)> = sources.to_vec();
    pairs.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let hash_input = pairs
        .iter()
        .map(|(id, ts)| format!("{}:{}", id, format_utc(*ts)))
        .collect::<Vec<_>>()
        .join("|");

    let digest = Sha256::digest(hash_input.as_bytes());
    let random = random_from_bytes(&digest[0..10]);
    encode_ulid(timestamp.timestamp_millis(), random)
}

/// True if `candidate` is a well-formed 26-char Crockford ULID.
pub fn is_ulid_shaped(candidate: &str) -> bool {
    candidate.len() == 26 && candidate.bytes().all(|b| CROCKFORD.contains(&b))
}

/// Mint a fresh correlation ID. Correlation IDs group a happens-before
/// chain of audit events and are locked against handshake reuse, so they
/// must be unique per chain rather than derived.
pub fn new_correlation_id() -> String {
    format!("corr-{}", uuid::Uuid::new_v4())
}

/// Mint a fresh trace ID for audit records.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn random_from_bytes(bytes: &[u8]) -> u128 {
    let mut random: u128 = 0;
    for &b in bytes.iter().take(10) {
        random = (random << 8) | u128::from(b);
    }
    random & RANDOM_MASK
}

fn encode_ulid(millis: i64, random: u128) -> String {
    // 48-bit timestamp + 80-bit randomness = 128 bits, encoded as 26
    // base32 characters (130 bits, top two bits zero).
    let value = ((millis as u128) << RANDOM_BITS) | random;
    let mut chars = [0u8; 26];
    let mut rest = value;
    for slot in chars.iter_mut().rev() {
        *slot = CROCKFORD[(rest & 0x1F) as usize];
        rest >>= 5;
    }
    String::from_utf8_lossy(&chars).into_owned()
}
