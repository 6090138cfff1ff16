//! Federation handshake: state machine and controller.
//!
//! Four-step, nonce-protected, Ed25519-authenticated handshake between
//! cells. The state machine is deterministic: every transition is a pure
//! function of `(from_state, message_type, verification_outcome, now)`,
//! so identical transcripts against identical clocks produce identical
//! state sequences. Terminal states have no outgoing edges. Correlation
//! IDs are locked against reuse for 24 h after session creation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::audit::{AuditEvent, AuditEventKind, AuditLog};
use crate::clock::{Clock, SharedClock};
use crate::config::{Feature, FeatureFlags};
use crate::crypto::{
    compute_key_id, default_max_skew, verify_message_integrity, FederateKeyPair,
    VerificationFailureReason,
};
use crate::identity_store::{CellStatus, FederateIdentity, FederateIdentityStore};
use crate::messages::{transcript_hash, MessagePayload, MessageType, SignedMessage};
use crate::nonce_store::NonceStore;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("correlation id {0} is not available")]
    CorrelationIdUnavailable(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: HandshakeState,
        to: HandshakeState,
    },
}

pub type Result<T> = std::result::Result<T, HandshakeError>;

/// Handshake protocol states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandshakeState {
    Uninitialized,
    IdentityExchange,
    CapabilityNegotiation,
    TrustEstablishment,
    Confirmed,
    FailedIdentity,
    FailedCapabilities,
    FailedTrust,
}

impl HandshakeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandshakeState::Uninitialized => "UNINITIALIZED",
            HandshakeState::IdentityExchange => "IDENTITY_EXCHANGE",
            HandshakeState::CapabilityNegotiation => "CAPABILITY_NEGOTIATION",
            HandshakeState::TrustEstablishment => "TRUST_ESTABLISHMENT",
            HandshakeState::Confirmed => "CONFIRMED",
            HandshakeState::FailedIdentity => "FAILED_IDENTITY",
            HandshakeState::FailedCapabilities => "FAILED_CAPABILITIES",
            HandshakeState::FailedTrust => "FAILED_TRUST",
        }
    }

    /// Valid outgoing edges. Protocol errors and timeouts may fail any
    /// non-terminal state to `FailedTrust`.
    pub fn valid_transitions(&self) -> &'static [HandshakeState] {
        match self {
            HandshakeState::Uninitialized => &[
                HandshakeState::IdentityExchange,
                HandshakeState::FailedIdentity,
                HandshakeState::FailedTrust,
            ],
            HandshakeState::IdentityExchange => &[
                HandshakeState::CapabilityNegotiation,
                HandshakeState::FailedIdentity,
                HandshakeState::FailedTrust,
            ],
            HandshakeState::CapabilityNegotiation => &[
                HandshakeState::TrustEstablishment,
                HandshakeState::Confirmed,
                HandshakeState::FailedCapabilities,
                HandshakeState::FailedTrust,
            ],
            HandshakeState::TrustEstablishment => &[
                HandshakeState::Confirmed,
                HandshakeState::FailedTrust,
            ],
            HandshakeState::Confirmed
            | HandshakeState::FailedIdentity
            | HandshakeState::FailedCapabilities
            | HandshakeState::FailedTrust => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.valid_transitions().is_empty()
    }
}

/// Handshake timing and retry configuration.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub max_retry_attempts: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub handshake_timeout: Duration,
    pub correlation_id_ttl: Duration,
    pub max_timestamp_skew: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        HandshakeConfig {
            max_retry_attempts: 3,
            base_retry_delay: Duration::seconds(1),
            max_retry_delay: Duration::seconds(10),
            handshake_timeout: Duration::minutes(10),
            correlation_id_ttl: Duration::hours(24),
            max_timestamp_skew: default_max_skew(),
        }
    }
}

/// One handshake session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeSession {
    pub correlation_id: String,
    pub federate_id: String,
    pub state: HandshakeState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// Recorded state transition.
#[derive(Debug, Clone)]
pub struct HandshakeTransition {
    pub from_state: HandshakeState,
    pub to_state: HandshakeState,
    pub timestamp: DateTime<Utc>,
    pub federate_id: String,
    pub correlation_id: String,
    pub message_type: String,
    pub reason_code: String,
}

/// Deterministic handshake state machine with session and correlation
/// lock bookkeeping.
pub struct HandshakeStateMachine {
    sessions: HashMap<String, HandshakeSession>,
    active_by_federate: HashMap<String, String>,
    transitions: Vec<HandshakeTransition>,
    locked_correlation_ids: HashMap<String, DateTime<Utc>>,
    config: HandshakeConfig,
    clock: SharedClock,
}

impl HandshakeStateMachine {
    pub fn new(clock: SharedClock, config: HandshakeConfig) -> Self {
        HandshakeStateMachine {
            sessions: HashMap::new(),
            active_by_federate: HashMap::new(),
            transitions: Vec::new(),
            locked_correlation_ids: HashMap::new(),
            config,
            clock,
        }
    }

    pub fn can_transition(&self, from: HandshakeState, to: HandshakeState) -> bool {
        from.valid_transitions().contains(&to)
    }

    pub fn get_session(&self, correlation_id: &str) -> Option<&HandshakeSession> {
        self.sessions.get(correlation_id)
    }

    pub fn active_correlation_id(&self, federate_id: &str) -> Option<&str> {
        self.active_by_federate.get(federate_id).map(String::as_str)
    }

    /// A correlation ID is available when it has no session and no
    /// unexpired lock.
    pub fn is_correlation_id_available(&self, correlation_id: &str) -> bool {
        if self.sessions.contains_key(correlation_id) {
            return false;
        }
        match self.locked_correlation_ids.get(correlation_id) {
            Some(expiry) => self.clock.now() >= *expiry,
            None => true,
        }
    }

    pub fn lock_correlation_id(&mut self, correlation_id: &str) {
        let expiry = self.clock.now() + self.config.correlation_id_ttl;
        self.locked_correlation_ids
            .insert(correlation_id.to_string(), expiry);
    }

    pub fn cleanup_expired_locks(&mut self) -> usize {
        let now = self.clock.now();
        let before = self.locked_correlation_ids.len();
        self.locked_correlation_ids.retain(|_, expiry| now < *expiry);
        before - self.locked_correlation_ids.len()
    }

    /// Create a session and lock its correlation ID.
    pub fn create_session(
        &mut self,
        federate_id: &str,
        correlation_id: &str,
    ) -> Result<&HandshakeSession> {
        if !self.is_correlation_id_available(correlation_id) {
            return Err(HandshakeError::CorrelationIdUnavailable(
                correlation_id.to_string(),
            ));
        }
        let now = self.clock.now();
        let session = HandshakeSession {
            correlation_id: correlation_id.to_string(),
            federate_id: federate_id.to_string(),
            state: HandshakeState::Uninitialized,
            created_at: now,
            updated_at: now,
            expires_at: now + self.config.handshake_timeout,
            retry_count: 0,
        };
        self.sessions
            .insert(correlation_id.to_string(), session);
        self.active_by_federate
            .insert(federate_id.to_string(), correlation_id.to_string());
        self.lock_correlation_id(correlation_id);
        Ok(&self.sessions[correlation_id])
    }

    /// Transition a session, recording the edge. Refuses invalid edges
    /// and anything out of a terminal state.
    pub fn transition(
        &mut self,
        correlation_id: &str,
        to_state: HandshakeState,
        message_type: &str,
        reason_code: &str,
    ) -> Result<()> {
        let now = self.clock.now();
        let session = self
            .sessions
            .get_mut(correlation_id)
            .ok_or_else(|| HandshakeError::SessionNotFound(correlation_id.to_string()))?;
        let from_state = session.state;
        if !from_state.valid_transitions().contains(&to_state) {
            return Err(HandshakeError::InvalidTransition {
                from: from_state,
                to: to_state,
            });
        }
        session.state = to_state;
        session.updated_at = now;
        self.transitions.push(HandshakeTransition {
            from_state,
            to_state,
            timestamp: now,
            federate_id: session.federate_id.clone(),
            correlation_id: correlation_id.to_string(),
            message_type: message_type.to_string(),
            reason_code: reason_code.to_string(),
        });
        Ok(())
    }

    /// Count a retry. Returns the new count, or `None` when the budget is
    /// exhausted.
    pub fn increment_retry(&mut self, correlation_id: &str) -> Option<u32> {
        let session = self.sessions.get_mut(correlation_id)?;
        if session.retry_count >= self.config.max_retry_attempts {
            return None;
        }
        session.retry_count += 1;
        Some(session.retry_count)
    }

    /// Exponential backoff: `min(base * 2^(n-1), max)`.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return self.config.base_retry_delay;
        }
        let factor = 1i64 << (retry_count - 1).min(30);
        let delay = self.config.base_retry_delay * factor as i32;
        delay.min(self.config.max_retry_delay)
    }

    pub fn is_session_expired(&self, correlation_id: &str) -> bool {
        match self.sessions.get(correlation_id) {
            Some(session) => self.clock.now() >= session.expires_at,
            None => true,
        }
    }

    pub fn cleanup_expired_sessions(&mut self) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| now >= s.expires_at)
            .map(|(id, _)| id.clone())
            .collect();
        for correlation_id in &expired {
            if let Some(session) = self.sessions.remove(correlation_id) {
                if self.active_by_federate.get(&session.federate_id)
                    == Some(&session.correlation_id)
                {
                    self.active_by_federate.remove(&session.federate_id);
                }
            }
        }
        expired.len()
    }

    pub fn transitions_for(&self, correlation_id: &str) -> Vec<&HandshakeTransition> {
        self.transitions
            .iter()
            .filter(|t| t.correlation_id == correlation_id)
            .collect()
    }

    pub fn active_sessions(&self) -> Vec<&HandshakeSession> {
        let now = self.clock.now();
        self.sessions
            .values()
            .filter(|s| !s.state.is_terminal() && now < s.expires_at)
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// State distribution and counters for the statistics surface.
    pub fn statistics(&self) -> HashMap<String, usize> {
        let mut stats: HashMap<String, usize> = HashMap::new();
        stats.insert("total_sessions".to_string(), self.sessions.len());
        stats.insert("active_sessions".to_string(), self.active_sessions().len());
        stats.insert("total_transitions".to_string(), self.transitions.len());
        stats.insert(
            "locked_correlation_ids".to_string(),
            self.locked_correlation_ids.len(),
        );
        for session in self.sessions.values() {
            *stats
                .entry(format!("state_{}", session.state.as_str()))
                .or_default() += 1;
        }
        stats
    }
}

/// Outcome of processing one handshake message.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub accepted: bool,
    pub state: HandshakeState,
    pub reason: Option<String>,
    pub retry_after: Option<Duration>,
}

impl HandshakeOutcome {
    fn accepted(state: HandshakeState) -> Self {
        HandshakeOutcome {
            accepted: true,
            state,
            reason: None,
            retry_after: None,
        }
    }

    fn rejected(state: HandshakeState, reason: &str) -> Self {
        HandshakeOutcome {
            accepted: false,
            state,
            reason: Some(reason.to_string()),
            retry_after: None,
        }
    }
}

/// Borrowed collaborators for one controller call.
pub struct HandshakeDeps<'a> {
    pub identities: &'a mut FederateIdentityStore,
    pub nonces: &'a mut NonceStore,
    pub audit: &'a mut AuditLog,
    pub flags: &'a FeatureFlags,
}

/// Per-session transcript bookkeeping for the trust-establish binding.
#[derive(Debug, Default, Clone)]
struct SessionTranscript {
    identity_payload_hash: Option<String>,
    capability_payload_hash: Option<String>,
}

/// Routes signed handshake messages through verification and the state
/// machine, enforcing protocol order and the failure-to-state mapping.
pub struct HandshakeController {
    machine: HandshakeStateMachine,
    transcripts: HashMap<String, SessionTranscript>,
    config: HandshakeConfig,
    clock: SharedClock,
}

impl HandshakeController {
    pub fn new(clock: SharedClock, config: HandshakeConfig) -> Self {
        HandshakeController {
            machine: HandshakeStateMachine::new(clock.clone(), config.clone()),
            transcripts: HashMap::new(),
            config,
            clock,
        }
    }

    pub fn with_default_config(clock: SharedClock) -> Self {
        Self::new(clock.clone(), HandshakeConfig::default())
    }

    pub fn machine(&self) -> &HandshakeStateMachine {
        &self.machine
    }

    /// Sweep expired sessions and correlation locks; host-loop driven.
    pub fn cleanup_expired_resources(&mut self) -> (usize, usize) {
        let sessions = self.machine.cleanup_expired_sessions();
        let locks = self.machine.cleanup_expired_locks();
        self.transcripts
            .retain(|correlation_id, _| self.machine.get_session(correlation_id).is_some());
        (sessions, locks)
    }

    /// Process one inbound signed handshake message.
    pub fn process_message(
        &mut self,
        message: &SignedMessage,
        deps: &mut HandshakeDeps<'_>,
    ) -> HandshakeOutcome {
        if !deps.flags.enabled(Feature::FederationIdentity) {
            if deps.flags.note_disabled_refusal(Feature::FederationIdentity) {
                let _ = deps.audit.append(AuditEvent::new(
                    AuditEventKind::FeatureDisabled,
                    json!({"feature": Feature::FederationIdentity.as_str()}),
                ));
            }
            return HandshakeOutcome::rejected(HandshakeState::Uninitialized, "feature_disabled");
        }

        let correlation_id = message.correlation_id.clone();

        // Session resolution. The first identity-exchange for a free
        // correlation ID opens a session.
        if self.machine.get_session(&correlation_id).is_none() {
            if message.msg_type != MessageType::IdentityExchange {
                self.audit_verification_failure(message, "no_active_session", deps);
                return HandshakeOutcome::rejected(
                    HandshakeState::Uninitialized,
                    "no_active_session",
                );
            }
            if !self.machine.is_correlation_id_available(&correlation_id) {
                self.audit_verification_failure(message, "correlation_id_reuse", deps);
                return HandshakeOutcome::rejected(
                    HandshakeState::Uninitialized,
                    "correlation_id_reuse",
                );
            }
            if self
                .machine
                .create_session(&message.federate_id, &correlation_id)
                .is_err()
            {
                return HandshakeOutcome::rejected(
                    HandshakeState::Uninitialized,
                    "correlation_id_reuse",
                );
            }
            self.transcripts
                .insert(correlation_id.clone(), SessionTranscript::default());
            let _ = deps.audit.append(
                AuditEvent::new(
                    AuditEventKind::HandshakeStarted,
                    json!({
                        "federate_id": message.federate_id,
                        "correlation_id": correlation_id,
                    }),
                )
                .with_correlation(correlation_id.clone()),
            );
        }

        let session_state = self
            .machine
            .get_session(&correlation_id)
            .map(|s| s.state)
            .unwrap_or(HandshakeState::Uninitialized);

        // Absolute session expiry dominates every other check.
        if self.machine.is_session_expired(&correlation_id) {
            return self.fail(
                &correlation_id,
                message,
                HandshakeState::FailedTrust,
                "timeout",
                deps,
            );
        }

        // Verification runs before protocol-order checks so replayed or
        // forged bytes are reported as such.
        if let Err(reason) = self.verify(message, deps) {
            return self.handle_verification_failure(&correlation_id, message, reason, deps);
        }

        // Terminal sessions accept nothing further.
        if session_state.is_terminal() {
            self.audit_verification_failure(message, "session_terminal", deps);
            return HandshakeOutcome::rejected(session_state, "session_terminal");
        }

        // Strict protocol order.
        let expected = match session_state {
            HandshakeState::Uninitialized => MessageType::IdentityExchange,
            HandshakeState::IdentityExchange => MessageType::CapabilityNegotiate,
            HandshakeState::CapabilityNegotiation | HandshakeState::TrustEstablishment => {
                MessageType::TrustEstablish
            }
            _ => MessageType::IdentityExchange,
        };
        if message.msg_type != expected {
            return self.fail(
                &correlation_id,
                message,
                HandshakeState::FailedTrust,
                "protocol_error",
                deps,
            );
        }

        // Transcript binding for the trust step.
        if let MessagePayload::TrustEstablish(te) = &message.payload {
            let transcript = self.transcripts.entry(correlation_id.clone()).or_default();
            let expected_hash = match (
                &transcript.identity_payload_hash,
                &transcript.capability_payload_hash,
            ) {
                (Some(identity), Some(capability)) => transcript_hash(identity, capability),
                _ => String::new(),
            };
            if te.transcript_hash != expected_hash {
                return self.fail(
                    &correlation_id,
                    message,
                    HandshakeState::FailedTrust,
                    "transcript_mismatch",
                    deps,
                );
            }
        }

        self.accept(&correlation_id, message, session_state, deps)
    }

    /// Verify the message against the advertised (first step) or stored
    /// (later steps) identity material.
    fn verify(
        &self,
        message: &SignedMessage,
        deps: &mut HandshakeDeps<'_>,
    ) -> std::result::Result<(), VerificationFailureReason> {
        match &message.payload {
            MessagePayload::IdentityExchange(payload) => {
                // Self-certifying first message: the advertised key_id
                // must be derivable from the advertised public key.
                if payload.key_id != compute_key_id(&payload.public_key) {
                    return Err(VerificationFailureReason::KeyMismatch);
                }
                let keypair = FederateKeyPair::from_public_key_b64(&payload.public_key)
                    .map_err(|_| VerificationFailureReason::UnknownKeyId)?;
                verify_message_integrity(
                    message,
                    &payload.key_id,
                    keypair.verifying_key(),
                    deps.nonces,
                    self.clock.as_ref(),
                    self.config.max_timestamp_skew,
                )
            }
            _ => {
                let identity = deps
                    .identities
                    .get(&message.federate_id)
                    .ok_or(VerificationFailureReason::UnknownKeyId)?;
                let keypair = FederateKeyPair::from_public_key_b64(&identity.public_key)
                    .map_err(|_| VerificationFailureReason::UnknownKeyId)?;
                let expected_key_id = identity.key_id.clone();
                verify_message_integrity(
                    message,
                    &expected_key_id,
                    keypair.verifying_key(),
                    deps.nonces,
                    self.clock.as_ref(),
                    self.config.max_timestamp_skew,
                )
            }
        }
    }

    fn accept(
        &mut self,
        correlation_id: &str,
        message: &SignedMessage,
        from_state: HandshakeState,
        deps: &mut HandshakeDeps<'_>,
    ) -> HandshakeOutcome {
        let now = self.clock.now();
        let next_state = match message.msg_type {
            MessageType::IdentityExchange => HandshakeState::IdentityExchange,
            MessageType::CapabilityNegotiate => HandshakeState::CapabilityNegotiation,
            MessageType::TrustEstablish => HandshakeState::Confirmed,
            _ => HandshakeState::FailedTrust,
        };

        if self
            .machine
            .transition(
                correlation_id,
                next_state,
                message.msg_type.as_str(),
                "verification_success",
            )
            .is_err()
        {
            return HandshakeOutcome::rejected(from_state, "invalid_state_transition");
        }

        // Side effects per step.
        let payload_hash = message.payload_hash().unwrap_or_default();
        match &message.payload {
            MessagePayload::IdentityExchange(payload) => {
                let identity = FederateIdentity {
                    schema_version: "1.0.0".to_string(),
                    federate_id: message.federate_id.clone(),
                    public_key: payload.public_key.clone(),
                    key_id: payload.key_id.clone(),
                    certificate_chain: payload.certificate_chain.clone(),
                    federation_role: payload.federation_role,
                    capabilities: payload.capabilities.clone(),
                    trust_score: 0.0,
                    status: CellStatus::Inactive,
                    created_at: now,
                    updated_at: now,
                };
                if deps.identities.get(&message.federate_id).is_some() {
                    let _ = deps.identities.replace(identity);
                } else {
                    let _ = deps.identities.register(identity);
                }
                if let Some(transcript) = self.transcripts.get_mut(correlation_id) {
                    transcript.identity_payload_hash = Some(payload_hash);
                }
            }
            MessagePayload::CapabilityNegotiate(payload) => {
                if let Some(existing) = deps.identities.get(&message.federate_id).cloned() {
                    let updated = FederateIdentity {
                        capabilities: payload.capabilities.clone(),
                        federation_role: payload.requested_role,
                        updated_at: now,
                        ..existing
                    };
                    let _ = deps.identities.replace(updated);
                }
                if let Some(transcript) = self.transcripts.get_mut(correlation_id) {
                    transcript.capability_payload_hash = Some(payload_hash);
                }
            }
            MessagePayload::TrustEstablish(payload) => {
                if let Some(existing) = deps.identities.get(&message.federate_id).cloned() {
                    let confirmed = FederateIdentity {
                        trust_score: payload.trust_score,
                        status: CellStatus::Active,
                        updated_at: now,
                        ..existing
                    };
                    let _ = deps.identities.replace(confirmed);
                }
            }
            _ => {}
        }
        let _ = deps.identities.touch_last_seen(&message.federate_id, now);

        let (kind, payload) = if next_state == HandshakeState::Confirmed {
            (
                AuditEventKind::HandshakeConfirmed,
                json!({
                    "federate_id": message.federate_id,
                    "correlation_id": correlation_id,
                    "from_state": from_state.as_str(),
                    "to_state": next_state.as_str(),
                }),
            )
        } else {
            (
                AuditEventKind::HandshakeTransition,
                json!({
                    "federate_id": message.federate_id,
                    "correlation_id": correlation_id,
                    "message_type": message.msg_type.as_str(),
                    "from_state": from_state.as_str(),
                    "to_state": next_state.as_str(),
                }),
            )
        };
        let _ = deps
            .audit
            .append(AuditEvent::new(kind, payload).with_correlation(correlation_id.to_string()));

        HandshakeOutcome::accepted(next_state)
    }

    fn handle_verification_failure(
        &mut self,
        correlation_id: &str,
        message: &SignedMessage,
        reason: VerificationFailureReason,
        deps: &mut HandshakeDeps<'_>,
    ) -> HandshakeOutcome {
        self.audit_verification_failure(message, reason.as_str(), deps);

        let session_state = self
            .machine
            .get_session(correlation_id)
            .map(|s| s.state)
            .unwrap_or(HandshakeState::Uninitialized);

        // Terminal sessions keep their state; the failure is recorded but
        // no edge exists to traverse.
        if session_state.is_terminal() {
            return HandshakeOutcome::rejected(session_state, reason.as_str());
        }

        // Only timestamp skew is worth a retry: the peer can re-send the
        // same step with a fresh clock reading. A consumed nonce can never
        // verify again, so replays fail the handshake outright.
        if reason == VerificationFailureReason::TimestampOutOfBounds {
            if let Some(retry_count) = self.machine.increment_retry(correlation_id) {
                let delay = self.machine.retry_delay(retry_count);
                let mut outcome = HandshakeOutcome::rejected(session_state, reason.as_str());
                outcome.retry_after = Some(delay);
                return outcome;
            }
            return self.fail(
                correlation_id,
                message,
                HandshakeState::FailedTrust,
                "retry_exhausted",
                deps,
            );
        }

        let failure_state = match reason {
            VerificationFailureReason::InvalidSignature
            | VerificationFailureReason::KeyMismatch
            | VerificationFailureReason::UnknownKeyId
            | VerificationFailureReason::MissingSignature => HandshakeState::FailedIdentity,
            _ => HandshakeState::FailedTrust,
        };
        self.fail(correlation_id, message, failure_state, reason.as_str(), deps)
    }

    fn fail(
        &mut self,
        correlation_id: &str,
        message: &SignedMessage,
        failure_state: HandshakeState,
        reason_code: &str,
        deps: &mut HandshakeDeps<'_>,
    ) -> HandshakeOutcome {
        let from_state = self
            .machine
            .get_session(correlation_id)
            .map(|s| s.state)
            .unwrap_or(HandshakeState::Uninitialized);

        let transitioned = self
            .machine
            .transition(
                correlation_id,
                failure_state,
                message.msg_type.as_str(),
                reason_code,
            )
            .is_ok();

        let state = if transitioned { failure_state } else { from_state };
        let _ = deps.audit.append(
            AuditEvent::new(
                AuditEventKind::HandshakeTransition,
                json!({
                    "federate_id": message.federate_id,
                    "correlation_id": correlation_id,
                    "message_type": message.msg_type.as_str(),
                    "from_state": from_state.as_str(),
                    "to_state": state.as_str(),
                    "reason_code": reason_code,
                }),
            )
            .with_correlation(correlation_id.to_string()),
        );
        HandshakeOutcome::rejected(state, reason_code)
    }

    fn audit_verification_failure(
        &self,
        message: &SignedMessage,
        reason: &str,
        deps: &mut HandshakeDeps<'_>,
    ) {
        let _ = deps.audit.append(
            AuditEvent::new(
                AuditEventKind::SignatureVerificationFailure,
                json!({
                    "federate_id": message.federate_id,
                    "message_type": message.msg_type.as_str(),
                    "failure_reason": reason,
                    "key_id": message
                        .signature
                        .as_ref()
                        .and_then(|s| s.key_id.clone()),
                }),
            )
            .with_correlation(message.correlation_id.clone()),
        );
    }
}

/// Build the three handshake messages for one side of a session. Test and
/// simulator helper; real peers produce these over their transport.
pub struct HandshakeInitiator<'a> {
    pub keypair: &'a FederateKeyPair,
    pub federate_id: String,
    pub correlation_id: String,
}

impl<'a> HandshakeInitiator<'a> {
    pub fn identity_exchange(
        &self,
        nonce: &str,
        now: DateTime<Utc>,
        role: crate::identity_store::FederationRole,
        capabilities: Vec<String>,
    ) -> crate::messages::Result<SignedMessage> {
        let payload = MessagePayload::IdentityExchange(crate::messages::IdentityExchangePayload {
            public_key: self.keypair.public_key_b64(),
            key_id: self.keypair.key_id().to_string(),
            certificate_chain: vec![],
            federation_role: role,
            capabilities,
        });
        let mut msg = SignedMessage::new(
            self.federate_id.clone(),
            nonce,
            now,
            self.correlation_id.clone(),
            payload,
        )?;
        let _ = crate::crypto::sign_message(&mut msg, self.keypair);
        Ok(msg)
    }

    pub fn capability_negotiate(
        &self,
        nonce: &str,
        now: DateTime<Utc>,
        role: crate::identity_store::FederationRole,
        capabilities: Vec<String>,
    ) -> crate::messages::Result<SignedMessage> {
        let payload =
            MessagePayload::CapabilityNegotiate(crate::messages::CapabilityNegotiatePayload {
                capabilities,
                requested_role: role,
            });
        let mut msg = SignedMessage::new(
            self.federate_id.clone(),
            nonce,
            now,
            self.correlation_id.clone(),
            payload,
        )?;
        let _ = crate::crypto::sign_message(&mut msg, self.keypair);
        Ok(msg)
    }

    pub fn trust_establish(
        &self,
        nonce: &str,
        now: DateTime<Utc>,
        trust_score: f64,
        transcript: String,
    ) -> crate::messages::Result<SignedMessage> {
        let payload = MessagePayload::TrustEstablish(crate::messages::TrustEstablishPayload {
            trust_score,
            transcript_hash: transcript,
        });
        let mut msg = SignedMessage::new(
            self.federate_id.clone(),
            nonce,
            now,
            self.correlation_id.clone(),
            payload,
        )?;
        let _ = crate::crypto::sign_message(&mut msg, self.keypair);
        Ok(msg)
    }
}
