//! Replay protection via per-federate nonce records.
//!
//! Nonces are scoped to the federate that presented them and carry a TTL
//! (default 300 s). A nonce is available iff it is absent, expired, or
//! present-but-unused for the same federate. Marking a nonce used is
//! irreversible until it expires; the mark is the single commit point of
//! the verification pipeline.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_NONCE_TTL_SECONDS: i64 = 300;

/// One presented nonce, scoped to a federate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceRecord {
    pub nonce: String,
    pub federate_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

impl NonceRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// In-memory nonce store, partitioned by federate.
///
/// Partitioning keeps each federate's replay window independent and lets
/// the sweep run per-federate without cross-talk.
#[derive(Debug)]
pub struct NonceStore {
    records: HashMap<(String, String), NonceRecord>,
    ttl: Duration,
}

impl NonceStore {
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(DEFAULT_NONCE_TTL_SECONDS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        NonceStore {
            records: HashMap::new(),
            ttl,
        }
    }

    /// Whether `nonce` may be accepted from `federate_id` right now.
    pub fn is_nonce_available(&self, federate_id: &str, nonce: &str, now: DateTime<Utc>) -> bool {
        match self
            .records
            .get(&(federate_id.to_string(), nonce.to_string()))
        {
            None => true,
            Some(record) if record.is_expired(now) => true,
            Some(record) => !record.used,
        }
    }

    /// Record a nonce offer without consuming it.
    pub fn offer_nonce(&mut self, federate_id: &str, nonce: &str, now: DateTime<Utc>) {
        let key = (federate_id.to_string(), nonce.to_string());
        self.records.insert(
            key,
            NonceRecord {
                nonce: nonce.to_string(),
                federate_id: federate_id.to_string(),
                created_at: now,
                expires_at: now + self.ttl,
                used: false,
            },
        );
    }

    /// Irreversibly consume a nonce for this federate.
    ///
    /// Returns false when the nonce was already used and has not expired
    /// (a replay); an expired record is re-offered and consumed fresh.
    pub fn mark_nonce_used(&mut self, federate_id: &str, nonce: &str, now: DateTime<Utc>) -> bool {
        let key = (federate_id.to_string(), nonce.to_string());
        match self.records.get_mut(&key) {
            Some(record) if !record.is_expired(now) => {
                if record.used {
                    return false;
                }
                record.used = true;
                true
            }
            _ => {
                self.records.insert(
                    key,
                    NonceRecord {
                        nonce: nonce.to_string(),
                        federate_id: federate_id.to_string(),
                        created_at: now,
                        expires_at: now + self.ttl,
                        used: true,
                    },
                );
                true
            }
        }
    }

    /// Remove expired records. Idempotent; returns the count removed.
    pub fn cleanup_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        before - self.records.len()
    }

    /// Records currently held for one federate (its own partition only).
    pub fn count_for_federate(&self, federate_id: &str) -> usize {
        self.records
            .keys()
            .filter(|(fid, _)| fid == federate_id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for NonceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_fresh_nonce_available() {
        let store = NonceStore::new();
        assert!(store.is_nonce_available("cell-eu-west-01", "n1", t0()));
    }

    #[test]
    fn test_used_nonce_unavailable_until_expiry() {
        let mut store = NonceStore::new();
        assert!(store.mark_nonce_used("cell-eu-west-01", "n1", t0()));
        assert!(!store.is_nonce_available("cell-eu-west-01", "n1", t0()));

        // Replay attempt before expiry is refused.
        assert!(!store.mark_nonce_used("cell-eu-west-01", "n1", t0()));

        // After TTL the nonce is re-offered.
        let later = t0() + Duration::seconds(DEFAULT_NONCE_TTL_SECONDS + 1);
        assert!(store.is_nonce_available("cell-eu-west-01", "n1", later));
        assert!(store.mark_nonce_used("cell-eu-west-01", "n1", later));
    }

    #[test]
    fn test_nonces_scoped_per_federate() {
        let mut store = NonceStore::new();
        store.mark_nonce_used("cell-eu-west-01", "n1", t0());
        // Same nonce string from a different federate is independent.
        assert!(store.is_nonce_available("cell-us-east-02", "n1", t0()));
    }

    #[test]
    fn test_offered_but_unused_stays_available() {
        let mut store = NonceStore::new();
        store.offer_nonce("cell-eu-west-01", "n1", t0());
        assert!(store.is_nonce_available("cell-eu-west-01", "n1", t0()));
        assert!(store.mark_nonce_used("cell-eu-west-01", "n1", t0()));
        assert!(!store.is_nonce_available("cell-eu-west-01", "n1", t0()));
    }

    #[test]
    fn test_cleanup_expired_idempotent() {
        let mut store = NonceStore::new();
        store.mark_nonce_used("cell-eu-west-01", "n1", t0());
        store.mark_nonce_used("cell-eu-west-01", "n2", t0());

        let later = t0() + Duration::seconds(DEFAULT_NONCE_TTL_SECONDS + 1);
        assert_eq!(store.cleanup_expired(later), 2);
        assert_eq!(store.cleanup_expired(later), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_count_for_federate() {
        let mut store = NonceStore::new();
        store.mark_nonce_used("cell-eu-west-01", "n1", t0());
        store.mark_nonce_used("cell-eu-west-01", "n2", t0());
        store.mark_nonce_used("cell-us-east-02", "n1", t0());
        assert_eq!(store.count_for_federate("cell-eu-west-01"), 2);
        assert_eq!(store.count_for_federate("cell-us-east-02"), 1);
    }
}
