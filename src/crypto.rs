//! Cryptographic primitives for the federation handshake.
//!
//! Ed25519 keypairs, message signing, and the five-step integrity
//! pipeline. Private keys live only inside [`FederateKeyPair`] and never
//! cross the audit or serialization boundaries; `key_id` is the stable
//! hash of the base64 public key, so a key identifier can be recomputed by
//! any peer from public material alone.
//!
//! The pipeline's step order matters: nothing mutates until steps 1–4
//! pass, and the nonce commit in step 5 is the single state change of a
//! verification. A multi-threaded host must hold its store lock across
//! the whole pipeline call.

use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD as B64_URL};
use base64::Engine;
use chrono::Duration;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

use crate::canonical::stable_hash;
use crate::clock::Clock;
use crate::messages::{SignatureAlgorithm, SignatureInfo, SignedMessage};
use crate::nonce_store::NonceStore;

/// Maximum clock skew tolerated between peers, in seconds.
pub const DEFAULT_MAX_SKEW_SECONDS: i64 = 300;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("signing requires a private key")]
    NoPrivateKey,

    #[error("message serialization failed: {0}")]
    Message(#[from] crate::messages::MessageError),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Closed taxonomy of verification failures.
///
/// Each value maps to a handshake state transition; see the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationFailureReason {
    InvalidSignature,
    KeyMismatch,
    NonceReuse,
    TimestampOutOfBounds,
    UnknownKeyId,
    SchemaValidationFailed,
    MissingSignature,
}

impl VerificationFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationFailureReason::InvalidSignature => "invalid_signature",
            VerificationFailureReason::KeyMismatch => "key_mismatch",
            VerificationFailureReason::NonceReuse => "nonce_reuse",
            VerificationFailureReason::TimestampOutOfBounds => "timestamp_out_of_bounds",
            VerificationFailureReason::UnknownKeyId => "unknown_key_id",
            VerificationFailureReason::SchemaValidationFailed => "schema_validation_failed",
            VerificationFailureReason::MissingSignature => "missing_signature",
        }
    }

    /// Transient failures are retried with backoff; the rest are terminal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VerificationFailureReason::TimestampOutOfBounds
                | VerificationFailureReason::NonceReuse
        )
    }
}

/// Ed25519 keypair for one federate.
///
/// May be verify-only (built from a peer's public key) or hold the
/// private half for signing. The private half never serializes.
#[derive(Clone)]
pub struct FederateKeyPair {
    signing_key: Option<SigningKey>,
    verifying_key: VerifyingKey,
    key_id: String,
}

impl FederateKeyPair {
    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    /// Deterministic keypair from a 32-byte seed. The seed copy is wiped
    /// after key derivation.
    pub fn from_seed(mut seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Self::from_signing_key(signing_key)
    }

    /// Verify-only keypair from a peer's advertised base64 public key.
    pub fn from_public_key_b64(public_key_b64: &str) -> Result<Self> {
        let bytes = B64
            .decode(public_key_b64)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let array: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes".to_string()))?;
        let verifying_key = VerifyingKey::from_bytes(&array)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(FederateKeyPair {
            signing_key: None,
            key_id: compute_key_id_from_key(&verifying_key),
            verifying_key,
        })
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        FederateKeyPair {
            key_id: compute_key_id_from_key(&verifying_key),
            signing_key: Some(signing_key),
            verifying_key,
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn public_key_b64(&self) -> String {
        B64.encode(self.verifying_key.to_bytes())
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub fn can_sign(&self) -> bool {
        self.signing_key.is_some()
    }

    fn sign_bytes(&self, data: &[u8]) -> Result<Signature> {
        let key = self.signing_key.as_ref().ok_or(CryptoError::NoPrivateKey)?;
        Ok(key.sign(data))
    }
}

impl std::fmt::Debug for FederateKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The private half must never leak through Debug output.
        f.debug_struct("FederateKeyPair")
            .field("key_id", &self.key_id)
            .field("can_sign", &self.can_sign())
            .finish()
    }
}

/// Stable key identifier: hex SHA-256 of the base64 public key.
pub fn compute_key_id(public_key_b64: &str) -> String {
    stable_hash(public_key_b64)
}

fn compute_key_id_from_key(key: &VerifyingKey) -> String {
    compute_key_id(&B64.encode(key.to_bytes()))
}

/// Generate a URL-safe random nonce (32 bytes of OS entropy).
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    B64_URL.encode(bytes)
}

/// Sign a message in place with Ed25519, attaching the signature block.
pub fn sign_message(message: &mut SignedMessage, keypair: &FederateKeyPair) -> Result<()> {
    let bytes = message.canonical_signing_bytes()?;
    let signature = keypair.sign_bytes(&bytes)?;
    message.signature = Some(SignatureInfo {
        alg: SignatureAlgorithm::Ed25519,
        key_id: Some(keypair.key_id().to_string()),
        cert_fingerprint: None,
        sig_b64: B64.encode(signature.to_bytes()),
    });
    Ok(())
}

/// Verify a message's Ed25519 signature against a public key.
pub fn verify_message_signature(
    message: &SignedMessage,
    public_key: &VerifyingKey,
) -> std::result::Result<(), VerificationFailureReason> {
    let signature_info = message
        .signature
        .as_ref()
        .ok_or(VerificationFailureReason::MissingSignature)?;

    let sig_bytes = B64
        .decode(&signature_info.sig_b64)
        .map_err(|_| VerificationFailureReason::InvalidSignature)?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|_| VerificationFailureReason::InvalidSignature)?;

    let canonical = message
        .canonical_signing_bytes()
        .map_err(|_| VerificationFailureReason::SchemaValidationFailed)?;

    public_key
        .verify(&canonical, &signature)
        .map_err(|_| VerificationFailureReason::InvalidSignature)
}

/// Complete integrity verification.
///
/// Steps, each with its own failure reason:
///   1. `signature.key_id == expected_key_id`      → `key_mismatch`
///   2. Ed25519 verify over canonical bytes        → `invalid_signature`
///   3. `|now − timestamp_utc| ≤ max_skew`         → `timestamp_out_of_bounds`
///   4. nonce not previously used by this federate → `nonce_reuse`
///   5. mark nonce used (sole commit point; only after 1–4 pass)
pub fn verify_message_integrity(
    message: &SignedMessage,
    expected_key_id: &str,
    public_key: &VerifyingKey,
    nonce_store: &mut NonceStore,
    clock: &dyn Clock,
    max_skew: Duration,
) -> std::result::Result<(), VerificationFailureReason> {
    let signature_info = message
        .signature
        .as_ref()
        .ok_or(VerificationFailureReason::MissingSignature)?;

    // 1. Key identity.
    match &signature_info.key_id {
        Some(key_id) if key_id == expected_key_id => {}
        Some(_) => return Err(VerificationFailureReason::KeyMismatch),
        None => return Err(VerificationFailureReason::UnknownKeyId),
    }

    // 2. Signature over the canonical region.
    verify_message_signature(message, public_key)?;

    // 3. Timestamp freshness. Future and past skew are bounded alike.
    let now = clock.now();
    let skew = (now - message.timestamp_utc).num_seconds().abs();
    if skew > max_skew.num_seconds() {
        return Err(VerificationFailureReason::TimestampOutOfBounds);
    }

    // 4. Nonce availability for this federate.
    if !nonce_store.is_nonce_available(&message.federate_id, &message.nonce, now) {
        return Err(VerificationFailureReason::NonceReuse);
    }

    // 5. Commit: consume the nonce.
    if !nonce_store.mark_nonce_used(&message.federate_id, &message.nonce, now) {
        return Err(VerificationFailureReason::NonceReuse);
    }

    Ok(())
}

/// Default skew window as a `Duration`.
pub fn default_max_skew() -> Duration {
    Duration::seconds(DEFAULT_MAX_SKEW_SECONDS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::identity_store::FederationRole;
    use crate::messages::{IdentityExchangePayload, MessagePayload};
    use chrono::{TimeZone, Utc};

    fn t0() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap()
    }

    fn test_message(keypair: &FederateKeyPair, nonce: &str) -> SignedMessage {
        let payload = MessagePayload::IdentityExchange(IdentityExchangePayload {
            public_key: keypair.public_key_b64(),
            key_id: keypair.key_id().to_string(),
            certificate_chain: vec![],
            federation_role: FederationRole::Member,
            capabilities: vec!["observe".to_string()],
        });
        let mut msg =
            SignedMessage::new("cell-eu-west-01", nonce, t0(), "corr-1", payload).unwrap();
        sign_message(&mut msg, keypair).unwrap();
        msg
    }

    #[test]
    fn test_key_id_is_stable_hash_of_public_key() {
        let keypair = FederateKeyPair::from_seed([7u8; 32]);
        assert_eq!(
            keypair.key_id(),
            compute_key_id(&keypair.public_key_b64())
        );
    }

    #[test]
    fn test_from_seed_deterministic() {
        let a = FederateKeyPair::from_seed([42u8; 32]);
        let b = FederateKeyPair::from_seed([42u8; 32]);
        assert_eq!(a.public_key_b64(), b.public_key_b64());
        assert_eq!(a.key_id(), b.key_id());
    }

    #[test]
    fn test_verify_only_keypair_cannot_sign() {
        let full = FederateKeyPair::from_seed([1u8; 32]);
        let verify_only =
            FederateKeyPair::from_public_key_b64(&full.public_key_b64()).unwrap();
        assert!(!verify_only.can_sign());
        assert_eq!(verify_only.key_id(), full.key_id());
    }

    #[test]
    fn test_sign_and_verify_round_trip() {
        let keypair = FederateKeyPair::from_seed([3u8; 32]);
        let msg = test_message(&keypair, "nonce-1");
        assert!(verify_message_signature(&msg, keypair.verifying_key()).is_ok());
    }

    #[test]
    fn test_tampered_message_fails_verification() {
        let keypair = FederateKeyPair::from_seed([3u8; 32]);
        let mut msg = test_message(&keypair, "nonce-1");
        msg.federate_id = "cell-eu-west-99".to_string();
        assert_eq!(
            verify_message_signature(&msg, keypair.verifying_key()),
            Err(VerificationFailureReason::InvalidSignature)
        );
    }

    #[test]
    fn test_integrity_pipeline_happy_path() {
        let keypair = FederateKeyPair::from_seed([5u8; 32]);
        let msg = test_message(&keypair, "nonce-1");
        let clock = FixedClock::starting_at(t0());
        let mut nonces = NonceStore::new();

        let result = verify_message_integrity(
            &msg,
            keypair.key_id(),
            keypair.verifying_key(),
            &mut nonces,
            &clock,
            default_max_skew(),
        );
        assert!(result.is_ok());
        // The commit consumed the nonce.
        assert!(!nonces.is_nonce_available("cell-eu-west-01", "nonce-1", clock.now()));
    }

    #[test]
    fn test_integrity_key_mismatch() {
        let keypair = FederateKeyPair::from_seed([5u8; 32]);
        let msg = test_message(&keypair, "nonce-1");
        let clock = FixedClock::starting_at(t0());
        let mut nonces = NonceStore::new();

        let result = verify_message_integrity(
            &msg,
            "0000000000000000000000000000000000000000000000000000000000000000",
            keypair.verifying_key(),
            &mut nonces,
            &clock,
            default_max_skew(),
        );
        assert_eq!(result, Err(VerificationFailureReason::KeyMismatch));
        // No commit happened.
        assert!(nonces.is_nonce_available("cell-eu-west-01", "nonce-1", clock.now()));
    }

    #[test]
    fn test_integrity_timestamp_out_of_bounds() {
        let keypair = FederateKeyPair::from_seed([5u8; 32]);
        let msg = test_message(&keypair, "nonce-1");
        let clock = FixedClock::starting_at(t0() + Duration::seconds(DEFAULT_MAX_SKEW_SECONDS + 1));
        let mut nonces = NonceStore::new();

        let result = verify_message_integrity(
            &msg,
            keypair.key_id(),
            keypair.verifying_key(),
            &mut nonces,
            &clock,
            default_max_skew(),
        );
        assert_eq!(result, Err(VerificationFailureReason::TimestampOutOfBounds));
        assert!(nonces.is_nonce_available("cell-eu-west-01", "nonce-1", clock.now()));
    }

    #[test]
    fn test_integrity_nonce_reuse_detected() {
        let keypair = FederateKeyPair::from_seed([5u8; 32]);
        let msg = test_message(&keypair, "nonce-1");
        let clock = FixedClock::starting_at(t0());
        let mut nonces = NonceStore::new();

        assert!(verify_message_integrity(
            &msg,
            keypair.key_id(),
            keypair.verifying_key(),
            &mut nonces,
            &clock,
            default_max_skew(),
        )
        .is_ok());

        // Byte-identical replay.
        let result = verify_message_integrity(
            &msg,
            keypair.key_id(),
            keypair.verifying_key(),
            &mut nonces,
            &clock,
            default_max_skew(),
        );
        assert_eq!(result, Err(VerificationFailureReason::NonceReuse));
    }

    #[test]
    fn test_transient_classification() {
        assert!(VerificationFailureReason::TimestampOutOfBounds.is_transient());
        assert!(VerificationFailureReason::NonceReuse.is_transient());
        assert!(!VerificationFailureReason::InvalidSignature.is_transient());
        assert!(!VerificationFailureReason::KeyMismatch.is_transient());
    }

    #[test]
    fn test_nonce_generation_unique_and_urlsafe() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_ne!(a, b);
        assert!(!a.contains('+') && !a.contains('/') && !a.contains('='));
    }

    #[test]
    fn test_debug_never_prints_private_key() {
        let keypair = FederateKeyPair::from_seed([9u8; 32]);
        let rendered = format!("{keypair:?}");
        assert!(rendered.contains("key_id"));
        assert!(!rendered.contains("signing_key"));
    }
}
