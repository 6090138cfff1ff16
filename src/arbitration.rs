//! Arbitration of belief conflicts with human-in-the-loop resolution.
//!
//! An open arbitration is the only path by which published belief state
//! may change. Resolution requires an approved approval bound to the
//! arbitration; applying a resolution overlays the affected beliefs'
//! metadata through the observation store and transitions the arbitration
//! to `resolved`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::approval::{ActionClass, ApprovalService};
use crate::audit::{AuditEvent, AuditEventKind, AuditLog};
use crate::canonical::{canonical_json, stable_hash};
use crate::clock::{Clock, SharedClock};
use crate::config::{Feature, FeatureFlags};
use crate::observation_store::ObservationStore;

#[derive(Debug, Error)]
pub enum ArbitrationError {
    #[error("arbitration {0} not found")]
    NotFound(String),

    #[error("duplicate arbitration id {0}")]
    DuplicateId(String),

    #[error("arbitration {0} is not open")]
    NotOpen(String),

    #[error("arbitration {0} has no proposed resolution")]
    NoProposedResolution(String),

    #[error("approval for arbitration {0} is not granted")]
    ApprovalNotGranted(String),

    #[error("feature disabled")]
    FeatureDisabled,
}

pub type Result<T> = std::result::Result<T, ArbitrationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrationStatus {
    Open,
    Resolved,
    Rejected,
    Expired,
}

impl ArbitrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArbitrationStatus::Open => "open",
            ArbitrationStatus::Resolved => "resolved",
            ArbitrationStatus::Rejected => "rejected",
            ArbitrationStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    ThreatClassification,
    SystemHealth,
    ConfidenceDispute,
    EvidenceConflict,
    PolicyViolation,
    TrustDispute,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::ThreatClassification => "threat_classification",
            ConflictType::SystemHealth => "system_health",
            ConflictType::ConfidenceDispute => "confidence_dispute",
            ConflictType::EvidenceConflict => "evidence_conflict",
            ConflictType::PolicyViolation => "policy_violation",
            ConflictType::TrustDispute => "trust_dispute",
        }
    }
}

/// One belief's claim inside an arbitration. References the belief by ID
/// only; no back-pointers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrationClaim {
    pub belief_id: String,
    pub claim_type: String,
    pub confidence: f64,
}

/// A detected conflict between beliefs awaiting approved resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arbitration {
    pub schema_version: String,
    pub arbitration_id: String,
    pub created_at_utc: DateTime<Utc>,
    pub status: ArbitrationStatus,
    pub conflict_type: ConflictType,
    pub subject_key: String,
    pub conflict_key: String,
    pub claims: Vec<ArbitrationClaim>,
    pub evidence_refs: Vec<String>,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposed_resolution: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolver_federate_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at_utc: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_applied_at_utc: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
}

/// Deterministic arbitration identifier derived from the conflict key and
/// the creation instant, so replays mint the same ID.
pub fn arbitration_id(conflict_key: &str, created_at: DateTime<Utc>) -> String {
    let stamp = created_at.format("%Y%m%d%H%M%S");
    let digest = stable_hash(conflict_key);
    format!("arb_{stamp}_{}", &digest[..8])
}

/// Filters for arbitration listings.
#[derive(Debug, Default, Clone)]
pub struct ArbitrationFilter {
    pub status: Option<ArbitrationStatus>,
    pub conflict_type: Option<ConflictType>,
    pub correlation_id: Option<String>,
    pub limit: Option<usize>,
}

/// In-memory arbitration store with status and conflict-key access.
#[derive(Debug, Default)]
pub struct ArbitrationStore {
    arbitrations: HashMap<String, Arbitration>,
}

impl ArbitrationStore {
    pub fn new() -> Self {
        ArbitrationStore::default()
    }

    pub fn insert(&mut self, arbitration: Arbitration) -> Result<()> {
        if self.arbitrations.contains_key(&arbitration.arbitration_id) {
            return Err(ArbitrationError::DuplicateId(arbitration.arbitration_id));
        }
        self.arbitrations
            .insert(arbitration.arbitration_id.clone(), arbitration);
        Ok(())
    }

    /// Whole-record replacement.
    pub fn update(&mut self, arbitration: Arbitration) -> Result<()> {
        if !self.arbitrations.contains_key(&arbitration.arbitration_id) {
            return Err(ArbitrationError::NotFound(arbitration.arbitration_id));
        }
        self.arbitrations
            .insert(arbitration.arbitration_id.clone(), arbitration);
        Ok(())
    }

    pub fn get(&self, arbitration_id: &str) -> Option<&Arbitration> {
        self.arbitrations.get(arbitration_id)
    }

    /// Open arbitration for a conflict key, if any. Used to avoid filing
    /// the same conflict twice inside one window.
    pub fn open_for_conflict_key(&self, conflict_key: &str) -> Option<&Arbitration> {
        self.arbitrations
            .values()
            .find(|a| a.conflict_key == conflict_key && a.status == ArbitrationStatus::Open)
    }

    /// Arbitrations matching `filter`, sorted by `(created_at, id)`.
    pub fn list(&self, filter: &ArbitrationFilter) -> Vec<&Arbitration> {
        let mut matching: Vec<&Arbitration> = self
            .arbitrations
            .values()
            .filter(|a| {
                filter.status.map_or(true, |s| a.status == s)
                    && filter.conflict_type.map_or(true, |c| a.conflict_type == c)
                    && filter
                        .correlation_id
                        .as_ref()
                        .map_or(true, |c| &a.correlation_id == c)
            })
            .collect();
        matching.sort_by(|a, b| {
            a.created_at_utc
                .cmp(&b.created_at_utc)
                .then_with(|| a.arbitration_id.cmp(&b.arbitration_id))
        });
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        matching
    }

    pub fn len(&self) -> usize {
        self.arbitrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arbitrations.is_empty()
    }

    pub fn status_counts(&self) -> HashMap<&'static str, usize> {
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for arbitration in self.arbitrations.values() {
            *counts.entry(arbitration.status.as_str()).or_default() += 1;
        }
        counts
    }
}

/// Borrowed collaborators for arbitration operations.
pub struct ArbitrationContext<'a> {
    pub store: &'a mut ArbitrationStore,
    pub observations: &'a mut ObservationStore,
    pub approvals: &'a mut ApprovalService,
    pub audit: &'a mut AuditLog,
    pub flags: &'a FeatureFlags,
}

/// Arbitration lifecycle service.
pub struct ArbitrationService {
    clock: SharedClock,
}

impl ArbitrationService {
    pub fn new(clock: SharedClock) -> Self {
        ArbitrationService { clock }
    }

    /// Store a new arbitration, open an approval request for it, and emit
    /// `arbitration_created`.
    pub fn create(&self, mut arbitration: Arbitration, ctx: &mut ArbitrationContext<'_>) -> Result<String> {
        if !ctx.flags.enabled(Feature::Arbitration) {
            if ctx.flags.note_disabled_refusal(Feature::Arbitration) {
                let _ = ctx.audit.append(AuditEvent::new(
                    AuditEventKind::FeatureDisabled,
                    json!({"feature": Feature::Arbitration.as_str()}),
                ));
            }
            return Err(ArbitrationError::FeatureDisabled);
        }

        // Bind the approval to the claims as they stood at creation.
        let claims_hash = stable_hash(&canonical_json(
            &serde_json::to_value(&arbitration.claims).unwrap_or(Value::Null),
        ));
        let approval_id = ctx.approvals.request(
            ActionClass::A3Irreversible,
            "tenant_default",
            format!("arbitration:{}", arbitration.subject_key),
            claims_hash,
            format!(
                "Human approval required for {} conflict",
                arbitration.conflict_type.as_str()
            ),
            ctx.audit,
        );
        arbitration.approval_id = Some(approval_id.clone());

        let arbitration_id = arbitration.arbitration_id.clone();
        let correlation_id = arbitration.correlation_id.clone();
        let payload = json!({
            "arbitration_id": arbitration_id,
            "conflict_type": arbitration.conflict_type.as_str(),
            "subject_key": arbitration.subject_key,
            "conflict_key": arbitration.conflict_key,
            "num_claims": arbitration.claims.len(),
            "approval_id": approval_id,
        });
        ctx.store.insert(arbitration)?;
        let _ = ctx.audit.append(
            AuditEvent::new(AuditEventKind::ArbitrationCreated, payload)
                .with_correlation(correlation_id),
        );
        Ok(arbitration_id)
    }

    /// Attach a proposed resolution to an open arbitration.
    pub fn propose_resolution(
        &self,
        arbitration_id: &str,
        resolution: Value,
        ctx: &mut ArbitrationContext<'_>,
    ) -> Result<()> {
        if !ctx.flags.enabled(Feature::Arbitration) {
            return Err(ArbitrationError::FeatureDisabled);
        }
        let mut arbitration = ctx
            .store
            .get(arbitration_id)
            .cloned()
            .ok_or_else(|| ArbitrationError::NotFound(arbitration_id.to_string()))?;
        if arbitration.status != ArbitrationStatus::Open {
            return Err(ArbitrationError::NotOpen(arbitration_id.to_string()));
        }
        arbitration.proposed_resolution = Some(resolution.clone());
        let correlation_id = arbitration.correlation_id.clone();
        ctx.store.update(arbitration)?;
        let _ = ctx.audit.append(
            AuditEvent::new(
                AuditEventKind::ArbitrationResolutionProposed,
                json!({
                    "arbitration_id": arbitration_id,
                    "resolution": resolution,
                }),
            )
            .with_correlation(correlation_id),
        );
        Ok(())
    }

    /// Apply a proposed resolution after its approval is granted.
    ///
    /// Preconditions: status open, proposal present, approval approved.
    /// On success the resolution overlays the affected beliefs and the
    /// arbitration becomes `resolved`. Nothing mutates on any failure.
    pub fn apply_resolution(
        &self,
        arbitration_id: &str,
        resolver_federate_id: &str,
        ctx: &mut ArbitrationContext<'_>,
    ) -> Result<()> {
        if !ctx.flags.enabled(Feature::Arbitration) {
            return Err(ArbitrationError::FeatureDisabled);
        }
        let mut arbitration = ctx
            .store
            .get(arbitration_id)
            .cloned()
            .ok_or_else(|| ArbitrationError::NotFound(arbitration_id.to_string()))?;
        if arbitration.status != ArbitrationStatus::Open {
            return Err(ArbitrationError::NotOpen(arbitration_id.to_string()));
        }
        let resolution = arbitration
            .proposed_resolution
            .clone()
            .ok_or_else(|| ArbitrationError::NoProposedResolution(arbitration_id.to_string()))?;
        let approved = arbitration
            .approval_id
            .as_deref()
            .map(|id| ctx.approvals.is_approved(id))
            .unwrap_or(false);
        if !approved {
            return Err(ArbitrationError::ApprovalNotGranted(
                arbitration_id.to_string(),
            ));
        }

        self.apply_to_beliefs(&arbitration, &resolution, ctx.observations);

        let now = self.clock.now();
        arbitration.status = ArbitrationStatus::Resolved;
        arbitration.decision = Some(resolution.clone());
        arbitration.resolver_federate_id = Some(resolver_federate_id.to_string());
        arbitration.resolved_at_utc = Some(now);
        arbitration.resolution_applied_at_utc = Some(now);
        let correlation_id = arbitration.correlation_id.clone();
        ctx.store.update(arbitration)?;

        let _ = ctx.audit.append(
            AuditEvent::new(
                AuditEventKind::ArbitrationResolved,
                json!({
                    "arbitration_id": arbitration_id,
                    "resolver_federate_id": resolver_federate_id,
                    "decision": resolution,
                }),
            )
            .with_correlation(correlation_id),
        );
        Ok(())
    }

    /// Reject an open arbitration with a recorded reason.
    pub fn reject(
        &self,
        arbitration_id: &str,
        resolver_federate_id: &str,
        reason: &str,
        ctx: &mut ArbitrationContext<'_>,
    ) -> Result<()> {
        if !ctx.flags.enabled(Feature::Arbitration) {
            return Err(ArbitrationError::FeatureDisabled);
        }
        let mut arbitration = ctx
            .store
            .get(arbitration_id)
            .cloned()
            .ok_or_else(|| ArbitrationError::NotFound(arbitration_id.to_string()))?;
        if arbitration.status != ArbitrationStatus::Open {
            return Err(ArbitrationError::NotOpen(arbitration_id.to_string()));
        }
        arbitration.status = ArbitrationStatus::Rejected;
        arbitration.resolver_federate_id = Some(resolver_federate_id.to_string());
        arbitration.resolved_at_utc = Some(self.clock.now());
        arbitration
            .metadata
            .insert("rejection_reason".to_string(), json!(reason));
        let correlation_id = arbitration.correlation_id.clone();
        ctx.store.update(arbitration)?;
        let _ = ctx.audit.append(
            AuditEvent::new(
                AuditEventKind::ArbitrationRejected,
                json!({
                    "arbitration_id": arbitration_id,
                    "resolver_federate_id": resolver_federate_id,
                    "reason": reason,
                }),
            )
            .with_correlation(correlation_id),
        );
        Ok(())
    }

    /// Type-specific overlay of the decision onto the claimed beliefs.
    fn apply_to_beliefs(
        &self,
        arbitration: &Arbitration,
        resolution: &Value,
        observations: &mut ObservationStore,
    ) {
        for claim in &arbitration.claims {
            let (entries, confidence_override) = match arbitration.conflict_type {
                ConflictType::ThreatClassification => {
                    let resolved = resolution
                        .get("resolved_threat_type")
                        .cloned()
                        .unwrap_or(Value::Null);
                    (vec![("resolved_threat_type".to_string(), resolved)], None)
                }
                ConflictType::SystemHealth => {
                    let resolved = resolution
                        .get("resolved_health_score")
                        .cloned()
                        .unwrap_or(Value::Null);
                    (vec![("resolved_health_score".to_string(), resolved)], None)
                }
                ConflictType::ConfidenceDispute => {
                    let confidence = resolution.get("confidence").and_then(Value::as_f64);
                    (Vec::new(), confidence)
                }
                _ => (Vec::new(), None),
            };
            let _ = observations.overlay_belief_metadata(
                &claim.belief_id,
                &entries,
                confidence_override,
                &arbitration.arbitration_id,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::observation::{Observation, ObservationPayload, ObservationType, SCHEMA_VERSION};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap()
    }

    struct Fixture {
        store: ArbitrationStore,
        observations: ObservationStore,
        approvals: ApprovalService,
        audit: AuditLog,
        flags: FeatureFlags,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(FixedClock::starting_at(t0()));
            let flags = FeatureFlags::new();
            flags.set(Feature::Arbitration, true);
            let mut observations = ObservationStore::new();
            observations
                .store_observation(Observation {
                    schema_version: SCHEMA_VERSION.to_string(),
                    observation_id: "obs-1".to_string(),
                    source_federate_id: "cell-eu-west-01".to_string(),
                    timestamp_utc: t0(),
                    correlation_id: Some("corr-1".to_string()),
                    nonce: None,
                    observation_type: ObservationType::ThreatIntel,
                    confidence: 0.9,
                    evidence_refs: vec![],
                    payload: ObservationPayload::ThreatIntel {
                        ioc_count: 1,
                        threat_types: vec!["malware".to_string()],
                        confidence_score: 0.9,
                        sources: vec![],
                    },
                    signature: None,
                })
                .unwrap();
            observations
                .store_belief(crate::observation::Belief {
                    schema_version: SCHEMA_VERSION.to_string(),
                    belief_id: "bel-1".to_string(),
                    belief_type: "derived_from_threat_intel".to_string(),
                    confidence: 0.9,
                    source_observations: vec!["obs-1".to_string()],
                    derived_at: t0(),
                    correlation_id: "corr-1".to_string(),
                    evidence_summary: "test".to_string(),
                    conflicts: vec![],
                    metadata: Map::new(),
                })
                .unwrap();
            Fixture {
                store: ArbitrationStore::new(),
                observations,
                approvals: ApprovalService::new(Arc::new(FixedClock::starting_at(t0()))),
                audit: AuditLog::new(Arc::new(FixedClock::starting_at(t0())), "cell-local-00"),
                flags,
            }
        }

        fn ctx(&mut self) -> ArbitrationContext<'_> {
            ArbitrationContext {
                store: &mut self.store,
                observations: &mut self.observations,
                approvals: &mut self.approvals,
                audit: &mut self.audit,
                flags: &self.flags,
            }
        }

        fn arbitration(&self) -> Arbitration {
            Arbitration {
                schema_version: "1.0.0".to_string(),
                arbitration_id: arbitration_id("ck-1", t0()),
                created_at_utc: t0(),
                status: ArbitrationStatus::Open,
                conflict_type: ConflictType::ThreatClassification,
                subject_key: "corr-1".to_string(),
                conflict_key: "ck-1".to_string(),
                claims: vec![ArbitrationClaim {
                    belief_id: "bel-1".to_string(),
                    claim_type: "derived_from_threat_intel".to_string(),
                    confidence: 0.9,
                }],
                evidence_refs: vec![],
                correlation_id: "corr-1".to_string(),
                proposed_resolution: None,
                decision: None,
                approval_id: None,
                resolver_federate_id: None,
                resolved_at_utc: None,
                resolution_applied_at_utc: None,
                metadata: Map::new(),
            }
        }
    }

    #[test]
    fn test_create_assigns_approval_and_audits() {
        let mut fx = Fixture::new();
        let arbitration = fx.arbitration();
        let id = {
            let mut ctx = fx.ctx();
            ArbitrationService::new(Arc::new(FixedClock::starting_at(t0())))
                .create(arbitration, &mut ctx)
                .unwrap()
        };
        let stored = fx.store.get(&id).unwrap();
        assert_eq!(stored.status, ArbitrationStatus::Open);
        assert!(stored.approval_id.is_some());
        assert_eq!(fx.audit.by_kind(AuditEventKind::ArbitrationCreated).len(), 1);
        assert_eq!(fx.audit.by_kind(AuditEventKind::ApprovalRequested).len(), 1);
    }

    #[test]
    fn test_apply_without_approval_fails_without_mutation() {
        let mut fx = Fixture::new();
        let arbitration = fx.arbitration();
        let service = ArbitrationService::new(Arc::new(FixedClock::starting_at(t0())));
        let id = service.create(arbitration, &mut fx.ctx()).unwrap();
        service
            .propose_resolution(
                &id,
                json!({"resolved_threat_type": "malware"}),
                &mut fx.ctx(),
            )
            .unwrap();

        // Approval still pending.
        let result = service.apply_resolution(&id, "cell-eu-west-01", &mut fx.ctx());
        assert!(matches!(result, Err(ArbitrationError::ApprovalNotGranted(_))));

        assert_eq!(fx.store.get(&id).unwrap().status, ArbitrationStatus::Open);
        let belief = fx.observations.get_belief("bel-1").unwrap();
        assert!(!belief.metadata.contains_key("resolved_threat_type"));
        assert!(fx.audit.by_kind(AuditEventKind::ArbitrationResolved).is_empty());
    }

    #[test]
    fn test_apply_after_approval_overlays_beliefs() {
        let mut fx = Fixture::new();
        let arbitration = fx.arbitration();
        let service = ArbitrationService::new(Arc::new(FixedClock::starting_at(t0())));
        let id = service.create(arbitration, &mut fx.ctx()).unwrap();
        service
            .propose_resolution(
                &id,
                json!({"resolved_threat_type": "malware"}),
                &mut fx.ctx(),
            )
            .unwrap();

        let approval_id = fx.store.get(&id).unwrap().approval_id.clone().unwrap();
        {
            let Fixture {
                approvals, audit, ..
            } = &mut fx;
            approvals
                .decide(&approval_id, true, "operator-1", audit)
                .unwrap();
        }

        service
            .apply_resolution(&id, "cell-eu-west-01", &mut fx.ctx())
            .unwrap();

        let stored = fx.store.get(&id).unwrap();
        assert_eq!(stored.status, ArbitrationStatus::Resolved);
        assert_eq!(
            stored.resolver_federate_id.as_deref(),
            Some("cell-eu-west-01")
        );
        assert!(stored.resolved_at_utc.is_some());

        let belief = fx.observations.get_belief("bel-1").unwrap();
        assert_eq!(belief.metadata["resolved_threat_type"], json!("malware"));
        assert_eq!(belief.metadata["arbitration_id"], json!(id));
        assert_eq!(fx.audit.by_kind(AuditEventKind::ArbitrationResolved).len(), 1);
    }

    #[test]
    fn test_propose_requires_open_status() {
        let mut fx = Fixture::new();
        let service = ArbitrationService::new(Arc::new(FixedClock::starting_at(t0())));
        let id = service.create(fx.arbitration(), &mut fx.ctx()).unwrap();
        service
            .reject(&id, "cell-eu-west-01", "stale conflict", &mut fx.ctx())
            .unwrap();

        let result = service.propose_resolution(&id, json!({}), &mut fx.ctx());
        assert!(matches!(result, Err(ArbitrationError::NotOpen(_))));
    }

    #[test]
    fn test_reject_records_reason() {
        let mut fx = Fixture::new();
        let service = ArbitrationService::new(Arc::new(FixedClock::starting_at(t0())));
        let id = service.create(fx.arbitration(), &mut fx.ctx()).unwrap();
        service
            .reject(&id, "cell-eu-west-01", "insufficient evidence", &mut fx.ctx())
            .unwrap();

        let stored = fx.store.get(&id).unwrap();
        assert_eq!(stored.status, ArbitrationStatus::Rejected);
        assert_eq!(
            stored.metadata["rejection_reason"],
            json!("insufficient evidence")
        );
        assert_eq!(fx.audit.by_kind(AuditEventKind::ArbitrationRejected).len(), 1);
    }

    #[test]
    fn test_feature_flag_gates_creation() {
        let mut fx = Fixture::new();
        fx.flags.set(Feature::Arbitration, false);
        let arbitration = fx.arbitration();
        let service = ArbitrationService::new(Arc::new(FixedClock::starting_at(t0())));
        let result = service.create(arbitration, &mut fx.ctx());
        assert!(matches!(result, Err(ArbitrationError::FeatureDisabled)));
        assert!(fx.store.is_empty());
    }

    #[test]
    fn test_confidence_dispute_overwrites_confidence() {
        let mut fx = Fixture::new();
        let mut arbitration = fx.arbitration();
        arbitration.conflict_type = ConflictType::ConfidenceDispute;
        let service = ArbitrationService::new(Arc::new(FixedClock::starting_at(t0())));
        let id = service.create(arbitration, &mut fx.ctx()).unwrap();
        service
            .propose_resolution(&id, json!({"confidence": 0.42}), &mut fx.ctx())
            .unwrap();

        let approval_id = fx.store.get(&id).unwrap().approval_id.clone().unwrap();
        {
            let Fixture {
                approvals, audit, ..
            } = &mut fx;
            approvals
                .decide(&approval_id, true, "operator-1", audit)
                .unwrap();
        }
        service
            .apply_resolution(&id, "cell-eu-west-01", &mut fx.ctx())
            .unwrap();

        let belief = fx.observations.get_belief("bel-1").unwrap();
        assert!((belief.confidence - 0.42).abs() < f64::EPSILON);
    }

    #[test]
    fn test_listing_filters() {
        let mut fx = Fixture::new();
        let service = ArbitrationService::new(Arc::new(FixedClock::starting_at(t0())));
        let mut second = fx.arbitration();
        second.arbitration_id = arbitration_id("ck-2", t0());
        second.conflict_key = "ck-2".to_string();
        second.conflict_type = ConflictType::SystemHealth;
        service.create(fx.arbitration(), &mut fx.ctx()).unwrap();
        service.create(second, &mut fx.ctx()).unwrap();

        let open = fx.store.list(&ArbitrationFilter {
            status: Some(ArbitrationStatus::Open),
            ..Default::default()
        });
        assert_eq!(open.len(), 2);

        let health = fx.store.list(&ArbitrationFilter {
            conflict_type: Some(ConflictType::SystemHealth),
            ..Default::default()
        });
        assert_eq!(health.len(), 1);
    }
}
