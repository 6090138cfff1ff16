//! Signed-envelope message model for the federation wire protocol.
//!
//! Every message between cells is a canonical JSON object wrapped with a
//! `signature` block. The signed region is the canonical form of all
//! fields except `signature`. The canonical form is byte-exact across
//! conforming cells, which is what makes the Ed25519 signatures portable.
//!
//! Five payload kinds exist: the three handshake steps, the observation
//! envelope, and the containment-intent envelope. Validation happens on
//! construction; a message that constructs is structurally sound.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::canonical::{canonical_bytes, format_utc, stable_hash};
use crate::identity_store::FederationRole;
use crate::observation::Observation;

pub const MESSAGE_VERSION: &str = "1.0.0";

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("federate_id must not be empty")]
    EmptyFederateId,

    #[error("nonce must not be empty")]
    EmptyNonce,

    #[error("correlation_id must not be empty")]
    EmptyCorrelationId,

    #[error("trust_score {0} outside [0,1]")]
    TrustScoreOutOfRange(f64),

    #[error("msg_type {declared} does not match payload kind {actual}")]
    TypeMismatch {
        declared: &'static str,
        actual: &'static str,
    },

    #[error("signature carries neither key_id nor cert_fingerprint")]
    UnidentifiedSignature,

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MessageError>;

/// Supported signature algorithms. Ed25519 is the default for all
/// cell-to-cell traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    #[serde(rename = "ed25519")]
    Ed25519,
    #[serde(rename = "rsa-pss-sha256")]
    RsaPssSha256,
}

/// Signature block attached to a signed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub alg: SignatureAlgorithm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_fingerprint: Option<String>,
    pub sig_b64: String,
}

impl SignatureInfo {
    pub fn validate(&self) -> Result<()> {
        if self.key_id.is_none() && self.cert_fingerprint.is_none() {
            return Err(MessageError::UnidentifiedSignature);
        }
        Ok(())
    }
}

/// Wire message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    IdentityExchange,
    CapabilityNegotiate,
    TrustEstablish,
    Observation,
    ContainmentIntent,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::IdentityExchange => "identity_exchange",
            MessageType::CapabilityNegotiate => "capability_negotiate",
            MessageType::TrustEstablish => "trust_establish",
            MessageType::Observation => "observation",
            MessageType::ContainmentIntent => "containment_intent",
        }
    }
}

/// First handshake step: the sender advertises its identity material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityExchangePayload {
    pub public_key: String,
    pub key_id: String,
    pub certificate_chain: Vec<String>,
    pub federation_role: FederationRole,
    pub capabilities: Vec<String>,
}

/// Second handshake step: capability and role negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityNegotiatePayload {
    pub capabilities: Vec<String>,
    pub requested_role: FederationRole,
}

/// Third handshake step: trust commitment over the session transcript.
///
/// `transcript_hash` binds this message to the exact prior two payloads;
/// a peer replaying step three against a different transcript fails the
/// hash check before any trust is recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustEstablishPayload {
    pub trust_score: f64,
    pub transcript_hash: String,
}

/// Tagged union of message payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    IdentityExchange(IdentityExchangePayload),
    CapabilityNegotiate(CapabilityNegotiatePayload),
    TrustEstablish(TrustEstablishPayload),
    /// Observation envelope: the observation travels inside the signed
    /// region, so ingest re-verifies exactly what the peer signed.
    Observation { observation: Box<Observation> },
    /// Containment-intent envelope: the frozen intent's canonical JSON.
    ContainmentIntent { intent: Value },
}

impl MessagePayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::IdentityExchange(_) => MessageType::IdentityExchange,
            MessagePayload::CapabilityNegotiate(_) => MessageType::CapabilityNegotiate,
            MessagePayload::TrustEstablish(_) => MessageType::TrustEstablish,
            MessagePayload::Observation { .. } => MessageType::Observation,
            MessagePayload::ContainmentIntent { .. } => MessageType::ContainmentIntent,
        }
    }
}

/// A federation wire message: envelope fields, typed payload, and an
/// optional signature block over the canonical form of everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedMessage {
    pub schema_version: String,
    pub msg_type: MessageType,
    pub msg_version: String,
    pub federate_id: String,
    pub nonce: String,
    pub timestamp_utc: DateTime<Utc>,
    pub correlation_id: String,
    pub payload: MessagePayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureInfo>,
}

impl SignedMessage {
    /// Build and validate an unsigned message.
    pub fn new(
        federate_id: impl Into<String>,
        nonce: impl Into<String>,
        timestamp_utc: DateTime<Utc>,
        correlation_id: impl Into<String>,
        payload: MessagePayload,
    ) -> Result<Self> {
        let msg = SignedMessage {
            schema_version: MESSAGE_VERSION.to_string(),
            msg_type: payload.message_type(),
            msg_version: MESSAGE_VERSION.to_string(),
            federate_id: federate_id.into(),
            nonce: nonce.into(),
            timestamp_utc: timestamp_utc.with_timezone(&Utc),
            correlation_id: correlation_id.into(),
            payload,
            signature: None,
        };
        msg.validate()?;
        Ok(msg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.federate_id.is_empty() {
            return Err(MessageError::EmptyFederateId);
        }
        if self.nonce.is_empty() {
            return Err(MessageError::EmptyNonce);
        }
        if self.correlation_id.is_empty() {
            return Err(MessageError::EmptyCorrelationId);
        }
        let actual = self.payload.message_type();
        if self.msg_type != actual {
            return Err(MessageError::TypeMismatch {
                declared: self.msg_type.as_str(),
                actual: actual.as_str(),
            });
        }
        if let MessagePayload::TrustEstablish(te) = &self.payload {
            if !(0.0..=1.0).contains(&te.trust_score) {
                return Err(MessageError::TrustScoreOutOfRange(te.trust_score));
            }
        }
        if let Some(sig) = &self.signature {
            sig.validate()?;
        }
        Ok(())
    }

    /// The exact object that is signed: every field except `signature`,
    /// with the timestamp rendered in canonical RFC-3339 form.
    pub fn signed_payload(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.remove("signature");
            map.insert(
                "timestamp_utc".to_string(),
                Value::String(format_utc(self.timestamp_utc)),
            );
        }
        Ok(value)
    }

    /// Canonical JSON bytes of the signed region.
    pub fn canonical_signing_bytes(&self) -> Result<Vec<u8>> {
        Ok(canonical_bytes(&self.signed_payload()?))
    }

    /// Stable hash of the canonical signed region.
    pub fn payload_hash(&self) -> Result<String> {
        let bytes = self.canonical_signing_bytes()?;
        Ok(stable_hash(&String::from_utf8_lossy(&bytes)))
    }
}

/// Transcript hash binding the trust-establish step to the prior two
/// handshake payload hashes, in order.
pub fn transcript_hash(identity_payload_hash: &str, capability_payload_hash: &str) -> String {
    stable_hash(&format!(
        "{identity_payload_hash}|{capability_payload_hash}"
    ))
}
