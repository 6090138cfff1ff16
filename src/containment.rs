//! Identity containment: recommender, frozen intents, simulated effector,
//! and the TTL ticker.
//!
//! The action loop of the kernel. A closed, ordered rule set turns recent
//! observations into containment recommendations; the intent service
//! freezes a recommendation into a hash-identified intent with an approval
//! bound to that hash; the effector is the only side-effecting component
//! and re-checks the gate, the binding, expiry, and the TTL ceiling before
//! writing an applied record. Containments are time-bounded: the ticker
//! reverts every applied record whose TTL has lapsed.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::approval::{compute_intent_hash, ActionClass, ApprovalService, IntentStore};
use crate::audit::{AuditEvent, AuditEventKind, AuditLog};
use crate::canonical::format_utc;
use crate::clock::{Clock, SharedClock};
use crate::config::{Feature, FeatureFlags};
use crate::gate::{ExecutionContext, ExecutionSafetyGate};
use crate::observation::{Observation, ObservationPayload, ObservationType};
use crate::observation_store::{ObservationFilter, ObservationStore};

/// Ceiling on any containment TTL accepted by the effector.
pub const EFFECTOR_MAX_TTL_SECONDS: u64 = 3600;
/// Default ticker interval.
pub const DEFAULT_TICK_INTERVAL_SECONDS: i64 = 60;

// ============================================================================
// SCOPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    Sessions,
    Login,
    ApiAccess,
    TokenIssuance,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeType::Sessions => "sessions",
            ScopeType::Login => "login",
            ScopeType::ApiAccess => "api_access",
            ScopeType::TokenIssuance => "token_issuance",
        }
    }
}

/// Bounded effect of one containment action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityContainmentScope {
    pub scope_id: String,
    pub scope_type: ScopeType,
    pub severity_level: String,
    pub ttl_seconds: u64,
    pub auto_expire: bool,
    pub requires_approval: bool,
    pub approval_level: ActionClass,
    pub effectors: Vec<String>,
    pub conditions: BTreeMap<String, f64>,
}

pub fn sessions_scope() -> IdentityContainmentScope {
    IdentityContainmentScope {
        scope_id: "scope-sessions-001".to_string(),
        scope_type: ScopeType::Sessions,
        severity_level: "medium".to_string(),
        ttl_seconds: 1800,
        auto_expire: true,
        requires_approval: true,
        approval_level: ActionClass::A2HardContainment,
        effectors: vec!["identity_provider".to_string()],
        conditions: BTreeMap::from([("min_risk_score".to_string(), 0.7)]),
    }
}

pub fn login_scope() -> IdentityContainmentScope {
    IdentityContainmentScope {
        scope_id: "scope-login-001".to_string(),
        scope_type: ScopeType::Login,
        severity_level: "high".to_string(),
        ttl_seconds: 900,
        auto_expire: true,
        requires_approval: true,
        approval_level: ActionClass::A2HardContainment,
        effectors: vec!["identity_provider".to_string()],
        conditions: BTreeMap::from([("min_risk_score".to_string(), 0.8)]),
    }
}

pub fn api_access_scope() -> IdentityContainmentScope {
    IdentityContainmentScope {
        scope_id: "scope-api-access-001".to_string(),
        scope_type: ScopeType::ApiAccess,
        severity_level: "high".to_string(),
        ttl_seconds: 1200,
        auto_expire: true,
        requires_approval: true,
        approval_level: ActionClass::A2HardContainment,
        effectors: vec!["api_gateway".to_string()],
        conditions: BTreeMap::from([("min_risk_score".to_string(), 0.8)]),
    }
}

pub fn token_issuance_scope() -> IdentityContainmentScope {
    IdentityContainmentScope {
        scope_id: "scope-token-issuance-001".to_string(),
        scope_type: ScopeType::TokenIssuance,
        severity_level: "high".to_string(),
        ttl_seconds: 900,
        auto_expire: true,
        requires_approval: true,
        approval_level: ActionClass::A2HardContainment,
        effectors: vec!["token_service".to_string()],
        conditions: BTreeMap::from([("min_risk_score".to_string(), 0.85)]),
    }
}

// ============================================================================
// RECOMMENDER
// ============================================================================

/// The closed, ordered containment rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    ThreatIntelHighConfidence,
    ImpossibleTravel,
    RepeatedAuthFailures,
    SystemCompromiseIndicators,
    AnomalyHighRisk,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::ThreatIntelHighConfidence => "threat_intel_high_confidence",
            RuleKind::ImpossibleTravel => "impossible_travel",
            RuleKind::RepeatedAuthFailures => "repeated_auth_failures",
            RuleKind::SystemCompromiseIndicators => "system_compromise_indicators",
            RuleKind::AnomalyHighRisk => "anomaly_high_risk",
        }
    }
}

/// One deterministic containment rule.
#[derive(Debug, Clone)]
pub struct ContainmentRule {
    pub kind: RuleKind,
    pub scope: IdentityContainmentScope,
    pub ttl_seconds: u64,
    pub risk_level: &'static str,
    pub confidence: f64,
}

fn default_rules() -> Vec<ContainmentRule> {
    vec![
        ContainmentRule {
            kind: RuleKind::ThreatIntelHighConfidence,
            scope: sessions_scope(),
            ttl_seconds: 1800,
            risk_level: "CRITICAL",
            confidence: 0.95,
        },
        ContainmentRule {
            kind: RuleKind::ImpossibleTravel,
            scope: login_scope(),
            ttl_seconds: 900,
            risk_level: "HIGH",
            confidence: 0.85,
        },
        ContainmentRule {
            kind: RuleKind::RepeatedAuthFailures,
            scope: login_scope(),
            ttl_seconds: 600,
            risk_level: "MEDIUM",
            confidence: 0.75,
        },
        ContainmentRule {
            kind: RuleKind::SystemCompromiseIndicators,
            scope: api_access_scope(),
            ttl_seconds: 1200,
            risk_level: "HIGH",
            confidence: 0.8,
        },
        ContainmentRule {
            kind: RuleKind::AnomalyHighRisk,
            scope: token_issuance_scope(),
            ttl_seconds: 900,
            risk_level: "HIGH",
            confidence: 0.8,
        },
    ]
}

/// A recommended containment for one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityContainmentRecommendation {
    pub recommendation_id: String,
    pub subject_id: String,
    pub provider: String,
    pub scope: IdentityContainmentScope,
    pub confidence_score: f64,
    pub risk_level: String,
    pub evidence_refs: Vec<String>,
    pub recommended_by: String,
    pub generated_at_utc: DateTime<Utc>,
    pub expires_at_utc: DateTime<Utc>,
    pub rule_name: String,
}

/// Deterministic recommendation ID:
/// `rec_` + first16(sha256(`subject:provider:scope:now`)).
pub fn recommendation_id(
    subject_id: &str,
    provider: &str,
    scope_type: ScopeType,
    now: DateTime<Utc>,
) -> String {
    let content = format!(
        "{subject_id}:{provider}:{}:{}",
        scope_type.as_str(),
        format_utc(now)
    );
    let digest = Sha256::digest(content.as_bytes());
    format!("rec_{}", &hex::encode(digest)[..16])
}

/// Generates containment recommendations from recent observations.
pub struct IdentityContainmentRecommender {
    rules: Vec<ContainmentRule>,
    max_ttl_seconds: u64,
    clock: SharedClock,
}

impl IdentityContainmentRecommender {
    pub fn new(clock: SharedClock) -> Self {
        IdentityContainmentRecommender {
            rules: default_rules(),
            max_ttl_seconds: EFFECTOR_MAX_TTL_SECONDS,
            clock,
        }
    }

    /// Evaluate the rule set over the last hour of observations, grouped
    /// by subject. One recommendation per (subject, matching rule).
    pub fn recommend(
        &self,
        store: &ObservationStore,
        flags: &FeatureFlags,
        audit: &mut AuditLog,
        correlation_id: Option<&str>,
    ) -> Vec<IdentityContainmentRecommendation> {
        if !flags.enabled(Feature::Containment) {
            if flags.note_disabled_refusal(Feature::Containment) {
                let _ = audit.append(AuditEvent::new(
                    AuditEventKind::FeatureDisabled,
                    json!({"feature": Feature::Containment.as_str()}),
                ));
            }
            return Vec::new();
        }

        let now = self.clock.now();
        let observations: Vec<Observation> = store
            .list_observations(&ObservationFilter {
                since: Some(now - Duration::hours(1)),
                limit: Some(1000),
                ..Default::default()
            })
            .into_iter()
            .cloned()
            .collect();

        // Group by subject; correlation ID stands in when no subject
        // reference is present in the evidence.
        let mut groups: BTreeMap<String, Vec<&Observation>> = BTreeMap::new();
        for obs in &observations {
            let key = obs
                .correlation_id
                .clone()
                .unwrap_or_else(|| "default".to_string());
            groups.entry(key).or_default().push(obs);
        }

        let mut recommendations = Vec::new();
        for (group_key, group) in &groups {
            let (subject_id, provider) = extract_subject(group);
            for rule in &self.rules {
                if !rule_matches(rule.kind, group, now) {
                    continue;
                }
                let rec = IdentityContainmentRecommendation {
                    recommendation_id: recommendation_id(
                        &subject_id,
                        &provider,
                        rule.scope.scope_type,
                        now,
                    ),
                    subject_id: subject_id.clone(),
                    provider: provider.clone(),
                    scope: rule.scope.clone(),
                    confidence_score: rule.confidence,
                    risk_level: rule.risk_level.to_string(),
                    evidence_refs: group.iter().map(|o| o.observation_id.clone()).collect(),
                    recommended_by: "recommender".to_string(),
                    generated_at_utc: now,
                    expires_at_utc: now
                        + Duration::seconds(rule.ttl_seconds.min(self.max_ttl_seconds) as i64),
                    rule_name: rule.kind.as_str().to_string(),
                };
                let _ = audit.append(
                    AuditEvent::new(
                        AuditEventKind::ContainmentRecommended,
                        json!({
                            "recommendation_id": rec.recommendation_id,
                            "subject_id": rec.subject_id,
                            "provider": rec.provider,
                            "scope": rec.scope.scope_type.as_str(),
                            "rule_name": rec.rule_name,
                            "risk_level": rec.risk_level,
                            "confidence": rec.confidence_score,
                            "ttl_seconds": rule.ttl_seconds,
                        }),
                    )
                    .with_correlation(
                        correlation_id
                            .map(str::to_string)
                            .unwrap_or_else(|| group_key.clone()),
                    ),
                );
                recommendations.push(rec);
            }
        }
        recommendations
    }

    /// Recommendations filtered to one `(subject, provider)`.
    pub fn recommend_for_subject(
        &self,
        subject_id: &str,
        provider: &str,
        store: &ObservationStore,
        flags: &FeatureFlags,
        audit: &mut AuditLog,
        correlation_id: Option<&str>,
    ) -> Vec<IdentityContainmentRecommendation> {
        self.recommend(store, flags, audit, correlation_id)
            .into_iter()
            .filter(|rec| rec.subject_id == subject_id && rec.provider == provider)
            .collect()
    }
}

/// Pull `user:<id>:<provider>` or `service:<id>:<provider>` out of
/// evidence refs; unknown subject otherwise.
fn extract_subject(group: &[&Observation]) -> (String, String) {
    for obs in group {
        for reference in &obs.evidence_refs {
            let parts: Vec<&str> = reference.split(':').collect();
            if parts.len() >= 3 && (parts[0] == "user" || parts[0] == "service") {
                return (parts[1].to_string(), parts[2].to_string());
            }
        }
    }
    ("unknown".to_string(), "LOCAL".to_string())
}

fn rule_matches(kind: RuleKind, group: &[&Observation], now: DateTime<Utc>) -> bool {
    match kind {
        RuleKind::ThreatIntelHighConfidence => group.iter().any(|obs| {
            obs.observation_type == ObservationType::ThreatIntel && obs.confidence >= 0.9
        }),
        RuleKind::ImpossibleTravel => group.iter().any(|obs| {
            matches!(
                &obs.payload,
                ObservationPayload::AnomalyDetection {
                    anomaly_type,
                    baseline_deviation,
                    ..
                } if anomaly_type == "impossible_travel" && *baseline_deviation >= 0.8
            )
        }),
        RuleKind::RepeatedAuthFailures => {
            let window_start = now - Duration::minutes(15);
            let mut failures: u64 = 0;
            for obs in group {
                if obs.timestamp_utc < window_start || obs.timestamp_utc > now {
                    continue;
                }
                if let ObservationPayload::TelemetrySummary {
                    event_count,
                    event_types,
                    ..
                } = &obs.payload
                {
                    if event_types.iter().any(|t| t == "auth_failure") {
                        failures += event_count;
                    }
                }
            }
            failures >= 5
        }
        RuleKind::SystemCompromiseIndicators => {
            let mut indicators = 0;
            for obs in group {
                if let ObservationPayload::SystemHealth { service_status, .. } = &obs.payload {
                    indicators += service_status
                        .values()
                        .filter(|s| {
                            matches!(s.as_str(), "compromised" | "suspicious" | "breached")
                        })
                        .count();
                }
            }
            indicators >= 3
        }
        RuleKind::AnomalyHighRisk => group.iter().any(|obs| {
            matches!(
                &obs.payload,
                ObservationPayload::AnomalyDetection {
                    baseline_deviation, ..
                } if *baseline_deviation >= 0.85
            )
        }),
    }
}

// ============================================================================
// INTENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    Apply,
    Revert,
    Modify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Executed,
    Reverted,
    Expired,
    Denied,
}

/// A frozen, hash-identified request for one containment side effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainmentIntent {
    pub schema_version: String,
    pub intent_id: String,
    pub recommendation_id: String,
    pub subject_id: String,
    pub provider: String,
    pub tenant_id: String,
    pub scope: IdentityContainmentScope,
    pub intent_type: IntentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    pub requested_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub idempotency_key: String,
    pub created_at_utc: DateTime<Utc>,
    pub expires_at_utc: DateTime<Utc>,
    pub intent_hash: String,
    pub execution_status: ExecutionStatus,
}

/// Turns recommendations into frozen intents with bound approvals.
pub struct IntentService {
    ids: crate::ids::UlidFactory,
    clock: SharedClock,
}

impl IntentService {
    pub fn new(clock: SharedClock) -> Self {
        IntentService {
            ids: crate::ids::UlidFactory::new(),
            clock,
        }
    }

    /// Freeze a recommendation into an intent: compute the intent hash,
    /// open an approval bound to that hash, store the frozen intent, and
    /// audit. Returns `(intent, approval_id)`.
    pub fn create_intent(
        &mut self,
        recommendation: &IdentityContainmentRecommendation,
        tenant_id: &str,
        requested_by: &str,
        approvals: &mut ApprovalService,
        intents: &mut IntentStore,
        audit: &mut AuditLog,
    ) -> (ContainmentIntent, String) {
        let now = self.clock.now();
        let intent_id = self.ids.next(now);
        let mut intent = ContainmentIntent {
            schema_version: "1.0.0".to_string(),
            intent_id: intent_id.clone(),
            recommendation_id: recommendation.recommendation_id.clone(),
            subject_id: recommendation.subject_id.clone(),
            provider: recommendation.provider.clone(),
            tenant_id: tenant_id.to_string(),
            scope: recommendation.scope.clone(),
            intent_type: IntentType::Apply,
            approval_id: None,
            requested_by: requested_by.to_string(),
            correlation_id: None,
            idempotency_key: format!("icw-{}-{intent_id}", recommendation.recommendation_id),
            created_at_utc: now,
            expires_at_utc: recommendation.expires_at_utc,
            intent_hash: String::new(),
            execution_status: ExecutionStatus::Pending,
        };
        intent.intent_hash = compute_intent_hash(&intent);

        let approval_id = approvals.request(
            recommendation.scope.approval_level,
            tenant_id,
            format!("{}@{}", intent.subject_id, intent.provider),
            intent.intent_hash.clone(),
            format!(
                "Containment recommended by rule {}",
                recommendation.rule_name
            ),
            audit,
        );
        intent.approval_id = Some(approval_id.clone());
        let _ = intents.freeze(&approval_id, intent.clone());

        let _ = audit.append(
            AuditEvent::new(
                AuditEventKind::ContainmentIntentCreated,
                json!({
                    "intent_id": intent.intent_id,
                    "recommendation_id": intent.recommendation_id,
                    "subject_id": intent.subject_id,
                    "provider": intent.provider,
                    "scope": intent.scope.scope_type.as_str(),
                    "approval_id": approval_id,
                    "intent_hash": intent.intent_hash,
                }),
            )
            .with_tenant(tenant_id.to_string()),
        );
        (intent, approval_id)
    }
}

// ============================================================================
// EFFECTOR
// ============================================================================

/// Durable record of an applied containment, keyed by
/// `subject_id:provider:scope_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedRecord {
    pub record_key: String,
    pub subject_id: String,
    pub provider: String,
    pub scope_type: ScopeType,
    pub intent_id: String,
    pub approval_id: String,
    pub applied_at_utc: DateTime<Utc>,
    pub expires_at_utc: DateTime<Utc>,
    pub effector: String,
}

/// Record of a reverted containment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevertedRecord {
    pub record_key: String,
    pub subject_id: String,
    pub provider: String,
    pub scope_type: ScopeType,
    pub intent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    pub reverted_at_utc: DateTime<Utc>,
    pub reason: String,
}

pub fn record_key(subject_id: &str, provider: &str, scope_type: ScopeType) -> String {
    format!("{subject_id}:{provider}:{}", scope_type.as_str())
}

/// Simulated identity-containment effector: the only component that
/// performs side effects, and the holder of applied/reverted state.
pub struct IdentityContainmentEffector {
    max_ttl_seconds: u64,
    applied: HashMap<String, AppliedRecord>,
    reverted: Vec<RevertedRecord>,
    clock: SharedClock,
}

impl IdentityContainmentEffector {
    pub fn new(clock: SharedClock) -> Self {
        IdentityContainmentEffector {
            max_ttl_seconds: EFFECTOR_MAX_TTL_SECONDS,
            applied: HashMap::new(),
            reverted: Vec::new(),
            clock,
        }
    }

    /// Apply a containment intent.
    ///
    /// Preconditions, each audited on failure and returning `None`:
    ///   1. gate ALLOW (re-evaluated here, not trusted from the caller);
    ///   2. approval binding: presented intent hashes to the frozen one;
    ///   3. intent not expired;
    ///   4. scope TTL within the effector ceiling.
    #[allow(clippy::too_many_arguments)]
    pub fn apply(
        &mut self,
        intent: &ContainmentIntent,
        approval_id: &str,
        gate: &ExecutionSafetyGate,
        gate_ctx: &ExecutionContext,
        approvals: &ApprovalService,
        intents: &IntentStore,
        audit: &mut AuditLog,
    ) -> Option<AppliedRecord> {
        let now = self.clock.now();

        // 1. Gate.
        let verdict = gate.evaluate(gate_ctx, audit);
        if !verdict.is_allow() {
            self.deny(intent, approval_id, &verdict.reason, audit);
            return None;
        }

        // 2. Approval decided and hash-bound to this exact intent.
        if !approvals.is_approved(approval_id) {
            self.deny(intent, approval_id, "approval_not_granted", audit);
            return None;
        }
        if approvals.verify_binding(approval_id, &intent.intent_hash).is_err()
            || !intents.verify_intent_binding(approval_id, intent)
        {
            self.deny(intent, approval_id, "binding_mismatch", audit);
            return None;
        }

        // 3. Intent freshness.
        if now >= intent.expires_at_utc {
            self.deny(intent, approval_id, "intent_expired", audit);
            return None;
        }

        // 4. TTL ceiling.
        if intent.scope.ttl_seconds > self.max_ttl_seconds {
            self.deny(intent, approval_id, "ttl_exceeds_effector_max", audit);
            return None;
        }

        let key = record_key(&intent.subject_id, &intent.provider, intent.scope.scope_type);
        let record = AppliedRecord {
            record_key: key.clone(),
            subject_id: intent.subject_id.clone(),
            provider: intent.provider.clone(),
            scope_type: intent.scope.scope_type,
            intent_id: intent.intent_id.clone(),
            approval_id: approval_id.to_string(),
            applied_at_utc: now,
            expires_at_utc: now + Duration::seconds(intent.scope.ttl_seconds as i64),
            effector: intent
                .scope
                .effectors
                .first()
                .cloned()
                .unwrap_or_else(|| "identity_provider".to_string()),
        };
        self.applied.insert(key, record.clone());

        let _ = audit.append(
            AuditEvent::new(
                AuditEventKind::IdentityContainmentApplied,
                json!({
                    "subject_id": record.subject_id,
                    "provider": record.provider,
                    "scope": record.scope_type.as_str(),
                    "intent_id": record.intent_id,
                    "approval_id": record.approval_id,
                    "expires_at_utc": format_utc(record.expires_at_utc),
                }),
            )
            .with_tenant(intent.tenant_id.clone()),
        );
        Some(record)
    }

    /// Revert a containment. Idempotent: when no active applied record
    /// exists a reverted record is still produced with the given reason.
    pub fn revert(
        &mut self,
        intent: &ContainmentIntent,
        reason: &str,
        audit: &mut AuditLog,
    ) -> RevertedRecord {
        let now = self.clock.now();
        let key = record_key(&intent.subject_id, &intent.provider, intent.scope.scope_type);
        let removed = self.applied.remove(&key);

        let record = RevertedRecord {
            record_key: key,
            subject_id: intent.subject_id.clone(),
            provider: intent.provider.clone(),
            scope_type: intent.scope.scope_type,
            intent_id: removed
                .as_ref()
                .map(|r| r.intent_id.clone())
                .unwrap_or_else(|| intent.intent_id.clone()),
            approval_id: removed.map(|r| r.approval_id),
            reverted_at_utc: now,
            reason: reason.to_string(),
        };
        self.reverted.push(record.clone());

        let _ = audit.append(
            AuditEvent::new(
                AuditEventKind::IdentityContainmentReverted,
                json!({
                    "subject_id": record.subject_id,
                    "provider": record.provider,
                    "scope": record.scope_type.as_str(),
                    "intent_id": record.intent_id,
                    "reason": reason,
                }),
            )
            .with_tenant(intent.tenant_id.clone()),
        );
        record
    }

    /// Revert every applied record whose TTL has lapsed. Returns the
    /// reverted records; each one is audited.
    pub fn process_expirations(&mut self, audit: &mut AuditLog) -> Vec<RevertedRecord> {
        let now = self.clock.now();
        let expired_keys: Vec<String> = self
            .applied
            .iter()
            .filter(|(_, record)| record.expires_at_utc <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut reverted = Vec::new();
        for key in expired_keys {
            let Some(record) = self.applied.remove(&key) else {
                continue;
            };
            let revert = RevertedRecord {
                record_key: key,
                subject_id: record.subject_id.clone(),
                provider: record.provider.clone(),
                scope_type: record.scope_type,
                intent_id: record.intent_id.clone(),
                approval_id: Some(record.approval_id.clone()),
                reverted_at_utc: now,
                reason: "expired".to_string(),
            };
            self.reverted.push(revert.clone());
            let _ = audit.append(AuditEvent::new(
                AuditEventKind::IdentityContainmentReverted,
                json!({
                    "subject_id": revert.subject_id,
                    "provider": revert.provider,
                    "scope": revert.scope_type.as_str(),
                    "intent_id": revert.intent_id,
                    "reason": "expired",
                }),
            ));
            reverted.push(revert);
        }
        reverted
    }

    /// Active applied record for `(subject, provider, scope)`.
    pub fn applied_record(
        &self,
        subject_id: &str,
        provider: &str,
        scope_type: ScopeType,
    ) -> Option<&AppliedRecord> {
        self.applied
            .get(&record_key(subject_id, provider, scope_type))
    }

    /// Containment status for `(subject, provider)` across scopes.
    pub fn status_for_subject(&self, subject_id: &str, provider: &str) -> Vec<&AppliedRecord> {
        let mut records: Vec<&AppliedRecord> = self
            .applied
            .values()
            .filter(|r| r.subject_id == subject_id && r.provider == provider)
            .collect();
        records.sort_by(|a, b| a.record_key.cmp(&b.record_key));
        records
    }

    pub fn reverted_records(&self) -> &[RevertedRecord] {
        &self.reverted
    }

    pub fn active_count(&self) -> usize {
        self.applied.len()
    }

    fn deny(
        &self,
        intent: &ContainmentIntent,
        approval_id: &str,
        reason: &str,
        audit: &mut AuditLog,
    ) {
        let _ = audit.append(
            AuditEvent::new(
                AuditEventKind::IdentityContainmentDenied,
                json!({
                    "intent_id": intent.intent_id,
                    "approval_id": approval_id,
                    "subject_id": intent.subject_id,
                    "reason": reason,
                }),
            )
            .with_tenant(intent.tenant_id.clone()),
        );
    }
}

/// Execute a frozen containment by approval ID: looks up the frozen
/// intent and runs it through the effector's full precondition chain.
#[allow(clippy::too_many_arguments)]
pub fn execute_by_approval(
    approval_id: &str,
    effector: &mut IdentityContainmentEffector,
    gate: &ExecutionSafetyGate,
    gate_ctx: &ExecutionContext,
    approvals: &ApprovalService,
    intents: &IntentStore,
    audit: &mut AuditLog,
) -> Option<AppliedRecord> {
    let intent = intents.get_by_approval(approval_id)?.clone();
    effector.apply(&intent, approval_id, gate, gate_ctx, approvals, intents, audit)
}

// ============================================================================
// TICKER
// ============================================================================

/// Tick-driven TTL sweep. The host loop calls [`ContainmentTicker::tick`];
/// the ticker rechecks the gate at system level, runs the effector sweep,
/// and audits a batch summary.
pub struct ContainmentTicker {
    interval: Duration,
    last_tick_utc: Option<DateTime<Utc>>,
    clock: SharedClock,
}

impl ContainmentTicker {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_interval(clock, Duration::seconds(DEFAULT_TICK_INTERVAL_SECONDS))
    }

    pub fn with_interval(clock: SharedClock, interval: Duration) -> Self {
        ContainmentTicker {
            interval,
            last_tick_utc: None,
            clock,
        }
    }

    pub fn should_tick(&self) -> bool {
        match self.last_tick_utc {
            None => true,
            Some(last) => self.clock.now() - last >= self.interval,
        }
    }

    /// Run one tick if due. Returns the number of reverts performed.
    pub fn tick(
        &mut self,
        effector: &mut IdentityContainmentEffector,
        gate: &ExecutionSafetyGate,
        audit: &mut AuditLog,
    ) -> usize {
        if !self.should_tick() {
            return 0;
        }
        let now = self.clock.now();
        self.last_tick_utc = Some(now);

        // System-level gate check before any revert side effects.
        let verdict = gate.evaluate(&ExecutionContext::system("system"), audit);
        if !verdict.is_allow() {
            return 0;
        }

        let reverted = effector.process_expirations(audit);
        let _ = audit.append(AuditEvent::new(
            AuditEventKind::IdentityContainmentExpired,
            json!({
                "tick_timestamp_utc": format_utc(now),
                "expired_count": reverted.len(),
                "tick_interval_seconds": self.interval.num_seconds(),
            }),
        ));
        reverted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::gate::RequiredApproval;
    use crate::observation::SCHEMA_VERSION;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap()
    }

    fn threat_obs(id: &str, confidence: f64, subject_ref: &str) -> Observation {
        Observation {
            schema_version: SCHEMA_VERSION.to_string(),
            observation_id: id.to_string(),
            source_federate_id: "cell-eu-west-01".to_string(),
            timestamp_utc: t0(),
            correlation_id: Some("corr-1".to_string()),
            nonce: None,
            observation_type: ObservationType::ThreatIntel,
            confidence,
            evidence_refs: vec![subject_ref.to_string()],
            payload: ObservationPayload::ThreatIntel {
                ioc_count: 2,
                threat_types: vec!["malware".to_string()],
                confidence_score: confidence,
                sources: vec![],
            },
            signature: None,
        }
    }

    fn gate_ctx(intent: &ContainmentIntent) -> ExecutionContext {
        ExecutionContext {
            tenant_id: Some(intent.tenant_id.clone()),
            action_class: intent.scope.approval_level,
            confidence: 0.95,
            trust_score: 0.9,
            quorum_count: 2,
            aggregate_score: 0.9,
            policy_verified: true,
            required_approval: RequiredApproval::Human,
            correlation_id: intent.correlation_id.clone(),
            principal_id: "operator-1".to_string(),
            intent_hash: Some(intent.intent_hash.clone()),
        }
    }

    struct Fixture {
        clock: Arc<FixedClock>,
        flags: FeatureFlags,
        store: ObservationStore,
        audit: AuditLog,
        approvals: ApprovalService,
        intents: IntentStore,
        gate: ExecutionSafetyGate,
        effector: IdentityContainmentEffector,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(FixedClock::starting_at(t0()));
            let flags = FeatureFlags::new();
            flags.set(Feature::Containment, true);
            Fixture {
                flags,
                store: ObservationStore::new(),
                audit: AuditLog::new(clock.clone(), "cell-local-00"),
                approvals: ApprovalService::new(clock.clone()),
                intents: IntentStore::new(),
                gate: ExecutionSafetyGate::new(),
                effector: IdentityContainmentEffector::new(clock.clone()),
                clock,
            }
        }

        /// Full path: observation -> recommendation -> approved intent.
        fn approved_intent(&mut self) -> (ContainmentIntent, String) {
            self.store
                .store_observation(threat_obs("obs-1", 0.95, "user:johndoe:okta"))
                .unwrap();
            let recommender = IdentityContainmentRecommender::new(self.clock.clone());
            let recs =
                recommender.recommend(&self.store, &self.flags, &mut self.audit, None);
            assert!(!recs.is_empty());

            let mut intent_service = IntentService::new(self.clock.clone());
            let (intent, approval_id) = intent_service.create_intent(
                &recs[0],
                "tenant_default",
                "recommender",
                &mut self.approvals,
                &mut self.intents,
                &mut self.audit,
            );
            self.approvals
                .decide(&approval_id, true, "operator-1", &mut self.audit)
                .unwrap();
            (intent, approval_id)
        }
    }

    #[test]
    fn test_recommender_threat_intel_rule() {
        let mut fx = Fixture::new();
        fx.store
            .store_observation(threat_obs("obs-1", 0.95, "user:johndoe:okta"))
            .unwrap();
        let recommender = IdentityContainmentRecommender::new(fx.clock.clone());
        let recs = recommender.recommend(&fx.store, &fx.flags, &mut fx.audit, None);

        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].rule_name, "threat_intel_high_confidence");
        assert_eq!(recs[0].subject_id, "johndoe");
        assert_eq!(recs[0].provider, "okta");
        assert_eq!(recs[0].scope.scope_type, ScopeType::Sessions);
        assert!(recs[0].recommendation_id.starts_with("rec_"));
        assert_eq!(recs[0].recommendation_id.len(), 20);
    }

    #[test]
    fn test_recommender_below_threshold_silent() {
        let mut fx = Fixture::new();
        fx.store
            .store_observation(threat_obs("obs-1", 0.85, "user:johndoe:okta"))
            .unwrap();
        let recommender = IdentityContainmentRecommender::new(fx.clock.clone());
        let recs = recommender.recommend(&fx.store, &fx.flags, &mut fx.audit, None);
        assert!(recs.is_empty());
    }

    #[test]
    fn test_recommendation_id_deterministic() {
        let a = recommendation_id("johndoe", "okta", ScopeType::Sessions, t0());
        let b = recommendation_id("johndoe", "okta", ScopeType::Sessions, t0());
        assert_eq!(a, b);
        let c = recommendation_id("johndoe", "okta", ScopeType::Login, t0());
        assert_ne!(a, c);
    }

    #[test]
    fn test_intent_freezing_binds_approval_to_hash() {
        let mut fx = Fixture::new();
        let (intent, approval_id) = fx.approved_intent();

        assert_eq!(intent.intent_hash, compute_intent_hash(&intent));
        let approval = fx.approvals.get(&approval_id).unwrap();
        assert_eq!(approval.intent_hash, intent.intent_hash);
        assert_eq!(approval.action_class, ActionClass::A2HardContainment);
        assert!(fx.intents.verify_intent_binding(&approval_id, &intent));
    }

    #[test]
    fn test_effector_apply_happy_path() {
        let mut fx = Fixture::new();
        let (intent, approval_id) = fx.approved_intent();

        let record = fx.effector.apply(
            &intent,
            &approval_id,
            &fx.gate,
            &gate_ctx(&intent),
            &fx.approvals,
            &fx.intents,
            &mut fx.audit,
        );
        let record = record.expect("apply should succeed");
        assert_eq!(record.record_key, "johndoe:okta:sessions");
        assert_eq!(
            record.expires_at_utc,
            t0() + Duration::seconds(intent.scope.ttl_seconds as i64)
        );
        assert_eq!(fx.effector.active_count(), 1);
        assert_eq!(
            fx.audit
                .by_kind(AuditEventKind::IdentityContainmentApplied)
                .len(),
            1
        );
    }

    #[test]
    fn test_effector_denies_without_approval() {
        let mut fx = Fixture::new();
        fx.store
            .store_observation(threat_obs("obs-1", 0.95, "user:johndoe:okta"))
            .unwrap();
        let recommender = IdentityContainmentRecommender::new(fx.clock.clone());
        let recs = recommender.recommend(&fx.store, &fx.flags, &mut fx.audit, None);
        let mut intent_service = IntentService::new(fx.clock.clone());
        let (intent, approval_id) = intent_service.create_intent(
            &recs[0],
            "tenant_default",
            "recommender",
            &mut fx.approvals,
            &mut fx.intents,
            &mut fx.audit,
        );
        // Approval left pending.
        let record = fx.effector.apply(
            &intent,
            &approval_id,
            &fx.gate,
            &gate_ctx(&intent),
            &fx.approvals,
            &fx.intents,
            &mut fx.audit,
        );
        assert!(record.is_none());
        assert_eq!(fx.effector.active_count(), 0);
        let denied = fx.audit.by_kind(AuditEventKind::IdentityContainmentDenied);
        assert_eq!(denied.len(), 1);
    }

    #[test]
    fn test_effector_denies_on_binding_mismatch() {
        let mut fx = Fixture::new();
        let (intent, approval_id) = fx.approved_intent();

        let mut tampered = intent.clone();
        tampered.subject_id = "mallory".to_string();
        tampered.intent_hash = compute_intent_hash(&tampered);

        let record = fx.effector.apply(
            &tampered,
            &approval_id,
            &fx.gate,
            &gate_ctx(&tampered),
            &fx.approvals,
            &fx.intents,
            &mut fx.audit,
        );
        assert!(record.is_none());
    }

    #[test]
    fn test_effector_denies_expired_intent() {
        let mut fx = Fixture::new();
        let (intent, approval_id) = fx.approved_intent();
        fx.clock.advance(Duration::hours(2));

        let record = fx.effector.apply(
            &intent,
            &approval_id,
            &fx.gate,
            &gate_ctx(&intent),
            &fx.approvals,
            &fx.intents,
            &mut fx.audit,
        );
        assert!(record.is_none());
    }

    #[test]
    fn test_effector_denies_ttl_over_ceiling() {
        let mut fx = Fixture::new();
        let (mut intent, approval_id) = fx.approved_intent();
        intent.scope.ttl_seconds = EFFECTOR_MAX_TTL_SECONDS + 1;
        intent.intent_hash = compute_intent_hash(&intent);

        let record = fx.effector.apply(
            &intent,
            &approval_id,
            &fx.gate,
            &gate_ctx(&intent),
            &fx.approvals,
            &fx.intents,
            &mut fx.audit,
        );
        assert!(record.is_none());
    }

    #[test]
    fn test_gate_deny_blocks_effector() {
        let mut fx = Fixture::new();
        let (intent, approval_id) = fx.approved_intent();
        fx.gate.set_global_kill_switch(true, &mut fx.audit);

        let record = fx.effector.apply(
            &intent,
            &approval_id,
            &fx.gate,
            &gate_ctx(&intent),
            &fx.approvals,
            &fx.intents,
            &mut fx.audit,
        );
        assert!(record.is_none());
        assert_eq!(fx.effector.active_count(), 0);
    }

    #[test]
    fn test_revert_idempotent() {
        let mut fx = Fixture::new();
        let (intent, approval_id) = fx.approved_intent();
        fx.effector
            .apply(
                &intent,
                &approval_id,
                &fx.gate,
                &gate_ctx(&intent),
                &fx.approvals,
                &fx.intents,
                &mut fx.audit,
            )
            .unwrap();

        let first = fx.effector.revert(&intent, "operator_request", &mut fx.audit);
        assert_eq!(first.reason, "operator_request");
        assert_eq!(fx.effector.active_count(), 0);

        // No active record; revert still returns a record.
        let second = fx.effector.revert(&intent, "operator_request", &mut fx.audit);
        assert_eq!(second.reason, "operator_request");
        assert_eq!(fx.effector.reverted_records().len(), 2);
    }

    #[test]
    fn test_ttl_expiry_and_tick() {
        let mut fx = Fixture::new();
        let (mut intent, approval_id) = fx.approved_intent();
        intent.scope.ttl_seconds = 60;
        intent.intent_hash = compute_intent_hash(&intent);
        // Re-freeze with the adjusted TTL under a fresh approval.
        let approval_id_2 = fx.approvals.request(
            intent.scope.approval_level,
            "tenant_default",
            "johndoe@okta",
            intent.intent_hash.clone(),
            "adjusted ttl",
            &mut fx.audit,
        );
        fx.approvals
            .decide(&approval_id_2, true, "operator-1", &mut fx.audit)
            .unwrap();
        fx.intents.freeze(&approval_id_2, intent.clone()).unwrap();
        let _ = approval_id;

        fx.effector
            .apply(
                &intent,
                &approval_id_2,
                &fx.gate,
                &gate_ctx(&intent),
                &fx.approvals,
                &fx.intents,
                &mut fx.audit,
            )
            .unwrap();

        let mut ticker = ContainmentTicker::new(fx.clock.clone());
        // First tick at t+0: nothing expired yet.
        assert_eq!(ticker.tick(&mut fx.effector, &fx.gate, &mut fx.audit), 0);

        fx.clock.advance(Duration::seconds(61));
        let reverted = ticker.tick(&mut fx.effector, &fx.gate, &mut fx.audit);
        assert_eq!(reverted, 1);
        assert_eq!(fx.effector.active_count(), 0);

        let records = fx.effector.reverted_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, "expired");
        assert_eq!(records[0].intent_id, intent.intent_id);
    }

    #[test]
    fn test_tick_respects_interval() {
        let mut fx = Fixture::new();
        let mut ticker = ContainmentTicker::new(fx.clock.clone());
        assert!(ticker.should_tick());

        ticker.tick(&mut fx.effector, &fx.gate, &mut fx.audit);
        assert!(!ticker.should_tick());

        fx.clock.advance(Duration::seconds(59));
        assert!(!ticker.should_tick());
        fx.clock.advance(Duration::seconds(1));
        assert!(ticker.should_tick());
    }

    #[test]
    fn test_tick_blocked_by_kill_switch() {
        let mut fx = Fixture::new();
        let (intent, approval_id) = fx.approved_intent();
        fx.effector
            .apply(
                &intent,
                &approval_id,
                &fx.gate,
                &gate_ctx(&intent),
                &fx.approvals,
                &fx.intents,
                &mut fx.audit,
            )
            .unwrap();

        fx.gate.set_global_kill_switch(true, &mut fx.audit);
        fx.clock.advance(Duration::hours(1));

        let mut ticker = ContainmentTicker::new(fx.clock.clone());
        assert_eq!(ticker.tick(&mut fx.effector, &fx.gate, &mut fx.audit), 0);
        // Containment stays applied until the switch clears.
        assert_eq!(fx.effector.active_count(), 1);
    }

    #[test]
    fn test_status_for_subject() {
        let mut fx = Fixture::new();
        let (intent, approval_id) = fx.approved_intent();
        fx.effector
            .apply(
                &intent,
                &approval_id,
                &fx.gate,
                &gate_ctx(&intent),
                &fx.approvals,
                &fx.intents,
                &mut fx.audit,
            )
            .unwrap();

        let status = fx.effector.status_for_subject("johndoe", "okta");
        assert_eq!(status.len(), 1);
        assert!(fx.effector.status_for_subject("janedoe", "okta").is_empty());
        assert!(fx
            .effector
            .applied_record("johndoe", "okta", ScopeType::Sessions)
            .is_some());
    }

    #[test]
    fn test_execute_by_approval_uses_frozen_intent() {
        let mut fx = Fixture::new();
        let (intent, approval_id) = fx.approved_intent();

        let record = execute_by_approval(
            &approval_id,
            &mut fx.effector,
            &fx.gate,
            &gate_ctx(&intent),
            &fx.approvals,
            &fx.intents,
            &mut fx.audit,
        );
        assert!(record.is_some());
        assert_eq!(fx.effector.active_count(), 1);

        // Unknown approval: nothing to execute.
        let missing = execute_by_approval(
            "appr-missing",
            &mut fx.effector,
            &fx.gate,
            &gate_ctx(&intent),
            &fx.approvals,
            &fx.intents,
            &mut fx.audit,
        );
        assert!(missing.is_none());
    }
}
