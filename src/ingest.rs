//! Observation ingest pipeline.
//!
//! Seven ordered steps; the first failure short-circuits with an
//! `observation_rejected` audit record carrying a stable reason code. Only
//! the final commit mutates state.

use chrono::Duration;
use serde_json::json;

use crate::audit::{AuditEvent, AuditEventKind, AuditLog};
use crate::clock::Clock;
use crate::config::{Feature, FeatureFlags};
use crate::crypto::{
    default_max_skew, verify_message_integrity, FederateKeyPair, VerificationFailureReason,
};
use crate::identity_store::{CellStatus, FederateIdentityStore};
use crate::messages::{MessagePayload, SignedMessage};
use crate::nonce_store::NonceStore;
use crate::observation::Observation;
use crate::observation_store::ObservationStore;

/// Stable rejection reasons for the ingest pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestRejection {
    FeatureDisabled,
    FederateNotFound,
    FederateNotConfirmed,
    MissingObservationId,
    MissingSourceFederate,
    FutureTimestamp,
    TimestampTooOld,
    InvalidConfidenceRange,
    PayloadTypeMismatch,
    MissingSignature,
    VerificationFailed(VerificationFailureReason),
    NonceReuse,
    DuplicateObservation,
}

impl IngestRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestRejection::FeatureDisabled => "feature_disabled",
            IngestRejection::FederateNotFound => "federate_not_found",
            IngestRejection::FederateNotConfirmed => "federate_not_confirmed",
            IngestRejection::MissingObservationId => "missing_observation_id",
            IngestRejection::MissingSourceFederate => "missing_source_federate_id",
            IngestRejection::FutureTimestamp => "future_timestamp",
            IngestRejection::TimestampTooOld => "timestamp_too_old",
            IngestRejection::InvalidConfidenceRange => "invalid_confidence_range",
            IngestRejection::PayloadTypeMismatch => "payload_type_mismatch",
            IngestRejection::MissingSignature => "missing_signature",
            IngestRejection::VerificationFailed(reason) => reason.as_str(),
            IngestRejection::NonceReuse => "nonce_reuse",
            IngestRejection::DuplicateObservation => "duplicate_observation",
        }
    }
}

pub type IngestResult = std::result::Result<(), IngestRejection>;

/// Configuration for ingest behavior.
#[derive(Debug, Clone)]
pub struct ObservationIngestConfig {
    pub require_confirmed_federate: bool,
    pub require_signature: bool,
    pub max_observation_age: Duration,
}

impl Default for ObservationIngestConfig {
    fn default() -> Self {
        ObservationIngestConfig {
            require_confirmed_federate: true,
            require_signature: true,
            max_observation_age: Duration::hours(24),
        }
    }
}

/// Borrowed stores and collaborators for one ingest call.
pub struct IngestContext<'a> {
    pub flags: &'a FeatureFlags,
    pub identities: &'a FederateIdentityStore,
    pub store: &'a mut ObservationStore,
    pub nonces: &'a mut NonceStore,
    pub audit: &'a mut AuditLog,
    pub clock: &'a dyn Clock,
}

/// Observation ingest service.
#[derive(Debug, Default)]
pub struct ObservationIngest {
    config: ObservationIngestConfig,
}

impl ObservationIngest {
    pub fn new(config: ObservationIngestConfig) -> Self {
        ObservationIngest { config }
    }

    /// Ingest a signed observation envelope.
    ///
    /// The observation travels inside the message's signed region, so the
    /// integrity pipeline covers exactly the bytes the peer committed to.
    pub fn ingest_envelope(&self, message: &SignedMessage, ctx: &mut IngestContext<'_>) -> IngestResult {
        let observation = match &message.payload {
            MessagePayload::Observation { observation } => observation.as_ref().clone(),
            _ => {
                return self.reject(None, IngestRejection::PayloadTypeMismatch, ctx);
            }
        };
        self.ingest(observation, Some(message), ctx)
    }

    /// Ingest an observation, optionally carried by a signed envelope.
    pub fn ingest(
        &self,
        observation: Observation,
        envelope: Option<&SignedMessage>,
        ctx: &mut IngestContext<'_>,
    ) -> IngestResult {
        // 1. Feature flag.
        if !ctx.flags.enabled(Feature::ObservationIngest) {
            if ctx.flags.note_disabled_refusal(Feature::ObservationIngest) {
                let _ = ctx.audit.append(AuditEvent::new(
                    AuditEventKind::FeatureDisabled,
                    json!({"feature": Feature::ObservationIngest.as_str()}),
                ));
            }
            return Err(IngestRejection::FeatureDisabled);
        }

        // 2. Federate exists and is confirmed (status active).
        if let Err(reason) = self.validate_federate(&observation, ctx) {
            return self.reject(Some(&observation), reason, ctx);
        }

        // 3. Schema validation.
        if let Err(reason) = self.validate_schema(&observation, ctx) {
            return self.reject(Some(&observation), reason, ctx);
        }

        // 4. Signature / integrity pipeline.
        if self.config.require_signature {
            if let Err(reason) = self.verify_signature(&observation, envelope, ctx) {
                return self.reject(Some(&observation), reason, ctx);
            }
        }

        // 5. Envelope-level nonce replay guard.
        if let Some(nonce) = &observation.nonce {
            if ctx.store.is_nonce_used(nonce) {
                return self.reject(Some(&observation), IngestRejection::NonceReuse, ctx);
            }
        }

        // 6. Deduplication by observation_id.
        if ctx.store.contains_observation(&observation.observation_id) {
            return self.reject(Some(&observation), IngestRejection::DuplicateObservation, ctx);
        }

        // 7. Commit.
        if let Some(nonce) = &observation.nonce {
            ctx.store.mark_nonce_used(nonce);
        }
        let accepted_payload = json!({
            "observation_id": observation.observation_id,
            "federate_id": observation.source_federate_id,
            "observation_type": observation.observation_type.as_str(),
            "reason": "ingested_successfully",
            "observation": serde_json::to_value(&observation).unwrap_or(serde_json::Value::Null),
        });
        let correlation = observation.correlation_id.clone();
        ctx.store
            .store_observation(observation)
            .map_err(|_| IngestRejection::DuplicateObservation)?;

        let mut event = AuditEvent::new(AuditEventKind::ObservationAccepted, accepted_payload);
        if let Some(correlation_id) = correlation {
            event = event.with_correlation(correlation_id);
        }
        let _ = ctx.audit.append(event);
        Ok(())
    }

    fn validate_federate(
        &self,
        observation: &Observation,
        ctx: &IngestContext<'_>,
    ) -> IngestResult {
        if !self.config.require_confirmed_federate {
            return Ok(());
        }
        let identity = ctx
            .identities
            .get(&observation.source_federate_id)
            .ok_or(IngestRejection::FederateNotFound)?;
        if identity.status != CellStatus::Active {
            return Err(IngestRejection::FederateNotConfirmed);
        }
        Ok(())
    }

    fn validate_schema(&self, observation: &Observation, ctx: &IngestContext<'_>) -> IngestResult {
        if observation.observation_id.is_empty() {
            return Err(IngestRejection::MissingObservationId);
        }
        if observation.source_federate_id.is_empty() {
            return Err(IngestRejection::MissingSourceFederate);
        }
        if !(0.0..=1.0).contains(&observation.confidence) {
            return Err(IngestRejection::InvalidConfidenceRange);
        }
        if !observation.payload_matches_type() {
            return Err(IngestRejection::PayloadTypeMismatch);
        }
        let now = ctx.clock.now();
        if observation.timestamp_utc > now {
            return Err(IngestRejection::FutureTimestamp);
        }
        if observation.timestamp_utc < now - self.config.max_observation_age {
            return Err(IngestRejection::TimestampTooOld);
        }
        Ok(())
    }

    fn verify_signature(
        &self,
        observation: &Observation,
        envelope: Option<&SignedMessage>,
        ctx: &mut IngestContext<'_>,
    ) -> IngestResult {
        let message = envelope.ok_or(IngestRejection::MissingSignature)?;
        if message.signature.is_none() {
            return Err(IngestRejection::MissingSignature);
        }
        let identity = ctx
            .identities
            .get(&observation.source_federate_id)
            .ok_or(IngestRejection::FederateNotFound)?;
        let keypair = FederateKeyPair::from_public_key_b64(&identity.public_key)
            .map_err(|_| IngestRejection::VerificationFailed(VerificationFailureReason::UnknownKeyId))?;

        verify_message_integrity(
            message,
            &identity.key_id,
            keypair.verifying_key(),
            ctx.nonces,
            ctx.clock,
            default_max_skew(),
        )
        .map_err(IngestRejection::VerificationFailed)
    }

    fn reject(
        &self,
        observation: Option<&Observation>,
        reason: IngestRejection,
        ctx: &mut IngestContext<'_>,
    ) -> IngestResult {
        let mut payload = json!({"reason": reason.as_str()});
        if let Some(obs) = observation {
            payload = json!({
                "reason": reason.as_str(),
                "observation_id": obs.observation_id,
                "federate_id": obs.source_federate_id,
                "observation_type": obs.observation_type.as_str(),
            });
        }
        let mut event = AuditEvent::new(AuditEventKind::ObservationRejected, payload);
        if let Some(correlation) = observation.and_then(|o| o.correlation_id.clone()) {
            event = event.with_correlation(correlation);
        }
        let _ = ctx.audit.append(event);
        Err(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::identity_store::{FederateIdentity, FederationRole};
    use crate::observation::{ObservationPayload, ObservationType, SCHEMA_VERSION};
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap()
    }

    struct Fixture {
        flags: FeatureFlags,
        identities: FederateIdentityStore,
        store: ObservationStore,
        nonces: NonceStore,
        audit: AuditLog,
        clock: Arc<FixedClock>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(FixedClock::starting_at(t0()));
            let flags = FeatureFlags::new();
            flags.set(Feature::ObservationIngest, true);
            let mut identities = FederateIdentityStore::new();
            identities
                .register(FederateIdentity {
                    schema_version: "1.0.0".to_string(),
                    federate_id: "cell-eu-west-01".to_string(),
                    public_key: "cHVibGlj".to_string(),
                    key_id: "k".repeat(64),
                    certificate_chain: vec![],
                    federation_role: FederationRole::Member,
                    capabilities: vec![],
                    trust_score: 0.9,
                    status: CellStatus::Active,
                    created_at: t0(),
                    updated_at: t0(),
                })
                .unwrap();
            Fixture {
                flags,
                identities,
                store: ObservationStore::new(),
                nonces: NonceStore::new(),
                audit: AuditLog::new(clock.clone(), "cell-local-00"),
                clock,
            }
        }

        fn ctx(&mut self) -> IngestContext<'_> {
            IngestContext {
                flags: &self.flags,
                identities: &self.identities,
                store: &mut self.store,
                nonces: &mut self.nonces,
                audit: &mut self.audit,
                clock: self.clock.as_ref(),
            }
        }
    }

    fn unsigned_ingest() -> ObservationIngest {
        ObservationIngest::new(ObservationIngestConfig {
            require_signature: false,
            ..Default::default()
        })
    }

    fn test_observation(id: &str) -> Observation {
        Observation {
            schema_version: SCHEMA_VERSION.to_string(),
            observation_id: id.to_string(),
            source_federate_id: "cell-eu-west-01".to_string(),
            timestamp_utc: t0(),
            correlation_id: Some("corr-1".to_string()),
            nonce: Some(format!("nonce-{id}")),
            observation_type: ObservationType::Custom,
            confidence: 0.7,
            evidence_refs: vec![],
            payload: ObservationPayload::Custom { data: json!({}) },
            signature: None,
        }
    }

    #[test]
    fn test_happy_path_commits_and_audits() {
        let mut fx = Fixture::new();
        let ingest = unsigned_ingest();
        let result = ingest.ingest(test_observation("obs-1"), None, &mut fx.ctx());
        assert!(result.is_ok());
        assert!(fx.store.contains_observation("obs-1"));
        assert_eq!(
            fx.audit.by_kind(AuditEventKind::ObservationAccepted).len(),
            1
        );
    }

    #[test]
    fn test_feature_disabled_single_diagnostic() {
        let mut fx = Fixture::new();
        fx.flags.set(Feature::ObservationIngest, false);
        let ingest = unsigned_ingest();

        let first = ingest.ingest(test_observation("obs-1"), None, &mut fx.ctx());
        let second = ingest.ingest(test_observation("obs-2"), None, &mut fx.ctx());
        assert_eq!(first, Err(IngestRejection::FeatureDisabled));
        assert_eq!(second, Err(IngestRejection::FeatureDisabled));
        // One diagnostic record total, no rejected-observation records.
        assert_eq!(fx.audit.by_kind(AuditEventKind::FeatureDisabled).len(), 1);
        assert!(fx.audit.by_kind(AuditEventKind::ObservationRejected).is_empty());
    }

    #[test]
    fn test_unknown_federate_rejected() {
        let mut fx = Fixture::new();
        let ingest = unsigned_ingest();
        let mut obs = test_observation("obs-1");
        obs.source_federate_id = "cell-zz-zz-99".to_string();
        assert_eq!(
            ingest.ingest(obs, None, &mut fx.ctx()),
            Err(IngestRejection::FederateNotFound)
        );
        assert_eq!(
            fx.audit.by_kind(AuditEventKind::ObservationRejected).len(),
            1
        );
    }

    #[test]
    fn test_unconfirmed_federate_rejected() {
        let mut fx = Fixture::new();
        let mut suspended = fx.identities.get("cell-eu-west-01").unwrap().clone();
        suspended.status = CellStatus::Suspended;
        fx.identities.replace(suspended).unwrap();

        let ingest = unsigned_ingest();
        assert_eq!(
            ingest.ingest(test_observation("obs-1"), None, &mut fx.ctx()),
            Err(IngestRejection::FederateNotConfirmed)
        );
    }

    #[test]
    fn test_schema_rejections() {
        let mut fx = Fixture::new();
        let ingest = unsigned_ingest();

        let mut future = test_observation("obs-future");
        future.timestamp_utc = t0() + chrono::Duration::hours(1);
        assert_eq!(
            ingest.ingest(future, None, &mut fx.ctx()),
            Err(IngestRejection::FutureTimestamp)
        );

        let mut stale = test_observation("obs-stale");
        stale.timestamp_utc = t0() - chrono::Duration::hours(25);
        assert_eq!(
            ingest.ingest(stale, None, &mut fx.ctx()),
            Err(IngestRejection::TimestampTooOld)
        );

        let mut bad_conf = test_observation("obs-conf");
        bad_conf.confidence = 1.3;
        assert_eq!(
            ingest.ingest(bad_conf, None, &mut fx.ctx()),
            Err(IngestRejection::InvalidConfidenceRange)
        );

        let mut empty_id = test_observation("");
        empty_id.observation_id = String::new();
        assert_eq!(
            ingest.ingest(empty_id, None, &mut fx.ctx()),
            Err(IngestRejection::MissingObservationId)
        );
    }

    #[test]
    fn test_duplicate_observation_rejected() {
        let mut fx = Fixture::new();
        let ingest = unsigned_ingest();
        let mut first = test_observation("obs-1");
        first.nonce = Some("nonce-a".to_string());
        assert!(ingest.ingest(first, None, &mut fx.ctx()).is_ok());

        let mut dup = test_observation("obs-1");
        dup.nonce = Some("nonce-b".to_string());
        assert_eq!(
            ingest.ingest(dup, None, &mut fx.ctx()),
            Err(IngestRejection::DuplicateObservation)
        );
    }

    #[test]
    fn test_nonce_replay_rejected() {
        let mut fx = Fixture::new();
        let ingest = unsigned_ingest();
        assert!(ingest
            .ingest(test_observation("obs-1"), None, &mut fx.ctx())
            .is_ok());

        // Different observation, same nonce.
        let mut replay = test_observation("obs-2");
        replay.nonce = Some("nonce-obs-1".to_string());
        assert_eq!(
            ingest.ingest(replay, None, &mut fx.ctx()),
            Err(IngestRejection::NonceReuse)
        );
    }

    #[test]
    fn test_signature_required_by_default() {
        let mut fx = Fixture::new();
        let ingest = ObservationIngest::default();
        assert_eq!(
            ingest.ingest(test_observation("obs-1"), None, &mut fx.ctx()),
            Err(IngestRejection::MissingSignature)
        );
    }
}
