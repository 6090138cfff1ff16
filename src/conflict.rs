//! Deterministic conflict detection between beliefs.
//!
//! Beliefs are grouped by a conflict key derived from
//! `belief_type:subject_key:hourly_window`; groups of two or more run the
//! predicate checks. A firing group produces exactly one arbitration,
//! with the conflict type chosen by fixed precedence.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::arbitration::{
    arbitration_id, Arbitration, ArbitrationClaim, ArbitrationContext, ArbitrationService,
    ArbitrationStatus, ConflictType,
};
use crate::audit::{AuditEvent, AuditEventKind};
use crate::clock::{Clock, SharedClock};
use crate::config::Feature;
use crate::observation::Belief;

/// Confidence spread beyond which beliefs are in dispute.
const CONFIDENCE_CONFLICT_DELTA: f64 = 0.3;
/// Health-score spread beyond which health beliefs conflict.
const HEALTH_SCORE_CONFLICT_DELTA: f64 = 0.4;

/// One fired predicate within a conflicting group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictPredicate {
    ConfidenceConflict,
    EvidenceConflict,
    ThreatClassificationConflict,
    HealthScoreConflict,
}

impl ConflictPredicate {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPredicate::ConfidenceConflict => "confidence_conflict",
            ConflictPredicate::EvidenceConflict => "evidence_conflict",
            ConflictPredicate::ThreatClassificationConflict => "threat_classification_conflict",
            ConflictPredicate::HealthScoreConflict => "health_score_conflict",
        }
    }
}

/// Deterministic conflict key: first 16 hex chars of SHA-256 over
/// `belief_type:subject_key:window`.
pub fn conflict_key(belief_type: &str, subject_key: &str, derived_at: DateTime<Utc>) -> String {
    let window = derived_at.format("%Y-%m-%d-%H");
    let input = format!("{belief_type}:{subject_key}:{window}");
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Subject key for a belief: explicit subject metadata when present,
/// otherwise the correlation ID.
pub fn subject_key(belief: &Belief) -> String {
    for key in ["subject", "subject_id"] {
        if let Some(value) = belief.metadata.get(key) {
            if let Some(s) = value.as_str() {
                return s.to_string();
            }
            return value.to_string();
        }
    }
    belief.correlation_id.clone()
}

/// Conflict detector over freshly derived beliefs.
pub struct ConflictDetector {
    clock: SharedClock,
}

impl ConflictDetector {
    pub fn new(clock: SharedClock) -> Self {
        ConflictDetector { clock }
    }

    /// Detect conflicts among `beliefs`, file one arbitration per
    /// conflicting group (via the arbitration service, which assigns the
    /// approval), and emit `conflict_detected` for each.
    ///
    /// Returns the IDs of the arbitrations created.
    pub fn detect(
        &self,
        beliefs: &[Belief],
        arbitration_service: &ArbitrationService,
        ctx: &mut ArbitrationContext<'_>,
    ) -> Vec<String> {
        if !ctx.flags.enabled(Feature::ConflictDetection) {
            if ctx.flags.note_disabled_refusal(Feature::ConflictDetection) {
                let _ = ctx.audit.append(AuditEvent::new(
                    AuditEventKind::FeatureDisabled,
                    json!({"feature": Feature::ConflictDetection.as_str()}),
                ));
            }
            return Vec::new();
        }

        let mut groups: BTreeMap<String, Vec<&Belief>> = BTreeMap::new();
        for belief in beliefs {
            let key = conflict_key(&belief.belief_type, &subject_key(belief), belief.derived_at);
            groups.entry(key).or_default().push(belief);
        }

        let mut created = Vec::new();
        for (key, group) in &groups {
            if group.len() < 2 {
                continue;
            }
            // One open arbitration per conflict key per window.
            if ctx.store.open_for_conflict_key(key).is_some() {
                continue;
            }
            let fired = self.evaluate_predicates(group);
            if fired.is_empty() {
                continue;
            }

            let arbitration = self.build_arbitration(key, group, &fired);
            let correlation_id = arbitration.correlation_id.clone();
            let conflict_payload = json!({
                "conflict_key": key,
                "conflict_type": arbitration.conflict_type.as_str(),
                "subject_key": arbitration.subject_key,
                "predicates": fired.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
                "belief_ids": group.iter().map(|b| b.belief_id.as_str()).collect::<Vec<_>>(),
            });

            match arbitration_service.create(arbitration, ctx) {
                Ok(arbitration_id) => {
                    let _ = ctx.audit.append(
                        AuditEvent::new(AuditEventKind::ConflictDetected, conflict_payload)
                            .with_correlation(correlation_id),
                    );
                    created.push(arbitration_id);
                }
                Err(_) => continue,
            }
        }
        created
    }

    fn evaluate_predicates(&self, group: &[&Belief]) -> Vec<ConflictPredicate> {
        let mut fired = Vec::new();

        if has_confidence_conflict(group) {
            fired.push(ConflictPredicate::ConfidenceConflict);
        }
        if has_evidence_conflict(group) {
            fired.push(ConflictPredicate::EvidenceConflict);
        }

        let belief_type = group[0].belief_type.as_str();
        if belief_type.contains("threat_") && has_threat_classification_conflict(group) {
            fired.push(ConflictPredicate::ThreatClassificationConflict);
        }
        if (belief_type.contains("health_") || belief_type.contains("system_health"))
            && has_health_score_conflict(group)
        {
            fired.push(ConflictPredicate::HealthScoreConflict);
        }

        fired
    }

    fn build_arbitration(
        &self,
        key: &str,
        group: &[&Belief],
        fired: &[ConflictPredicate],
    ) -> Arbitration {
        let now = self.clock.now();
        let conflict_type = primary_conflict_type(fired);

        let mut evidence: BTreeSet<String> = BTreeSet::new();
        for belief in group {
            evidence.extend(belief.source_observations.iter().cloned());
        }

        let mut metadata = Map::new();
        metadata.insert(
            "predicates".to_string(),
            json!(fired.iter().map(|p| p.as_str()).collect::<Vec<_>>()),
        );

        Arbitration {
            schema_version: "1.0.0".to_string(),
            arbitration_id: arbitration_id(key, now),
            created_at_utc: now,
            status: ArbitrationStatus::Open,
            conflict_type,
            subject_key: subject_key(group[0]),
            conflict_key: key.to_string(),
            claims: group
                .iter()
                .map(|belief| ArbitrationClaim {
                    belief_id: belief.belief_id.clone(),
                    claim_type: belief.belief_type.clone(),
                    confidence: belief.confidence,
                })
                .collect(),
            evidence_refs: evidence.into_iter().collect(),
            correlation_id: group[0].correlation_id.clone(),
            proposed_resolution: None,
            decision: None,
            approval_id: None,
            resolver_federate_id: None,
            resolved_at_utc: None,
            resolution_applied_at_utc: None,
            metadata,
        }
    }
}

/// Precedence: threat classification > system health > confidence
/// dispute > evidence conflict.
fn primary_conflict_type(fired: &[ConflictPredicate]) -> ConflictType {
    if fired.contains(&ConflictPredicate::ThreatClassificationConflict) {
        ConflictType::ThreatClassification
    } else if fired.contains(&ConflictPredicate::HealthScoreConflict) {
        ConflictType::SystemHealth
    } else if fired.contains(&ConflictPredicate::ConfidenceConflict) {
        ConflictType::ConfidenceDispute
    } else {
        ConflictType::EvidenceConflict
    }
}

fn has_confidence_conflict(group: &[&Belief]) -> bool {
    let max = group.iter().map(|b| b.confidence).fold(f64::MIN, f64::max);
    let min = group.iter().map(|b| b.confidence).fold(f64::MAX, f64::min);
    max - min > CONFIDENCE_CONFLICT_DELTA
}

/// Disjoint source sets across the group indicate independent evidence
/// arriving at the same claim slot.
fn has_evidence_conflict(group: &[&Belief]) -> bool {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for belief in group {
        for source in &belief.source_observations {
            if seen.contains(source.as_str()) {
                return false;
            }
        }
        seen.extend(belief.source_observations.iter().map(String::as_str));
    }
    group.len() > 1
}

fn has_threat_classification_conflict(group: &[&Belief]) -> bool {
    let mut types: BTreeSet<String> = BTreeSet::new();
    for belief in group {
        if let Some(threat_type) = belief.metadata.get("threat_type").and_then(Value::as_str) {
            types.insert(threat_type.to_string());
        }
    }
    types.len() > 1
}

fn has_health_score_conflict(group: &[&Belief]) -> bool {
    let scores: Vec<f64> = group
        .iter()
        .filter_map(|b| b.metadata.get("health_score").and_then(Value::as_f64))
        .collect();
    if scores.len() < 2 {
        return false;
    }
    let max = scores.iter().copied().fold(f64::MIN, f64::max);
    let min = scores.iter().copied().fold(f64::MAX, f64::min);
    (max - min).abs() > HEALTH_SCORE_CONFLICT_DELTA
}
