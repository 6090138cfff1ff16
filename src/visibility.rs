//! Read-only visibility surface over the kernel's stores.
//!
//! Everything here is a pure query: federate listings, observation and
//! belief listings with filters, the merged per-correlation timeline,
//! arbitration lookups, counters, and containment status. Secret material
//! never crosses this boundary: views carry no nonces, no signatures,
//! and no key material beyond the public key identifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::arbitration::{Arbitration, ArbitrationFilter, ArbitrationStore};
use crate::audit::AuditLog;
use crate::containment::IdentityContainmentEffector;
use crate::identity_store::FederateIdentityStore;
use crate::observation::{Belief, Observation};
use crate::observation_store::{BeliefFilter, ObservationFilter, ObservationStore};

/// Public view of a federate identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederateView {
    pub federate_id: String,
    pub key_id: String,
    pub federation_role: String,
    pub capabilities: Vec<String>,
    pub trust_score: f64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Public view of an observation; nonce and signature are withheld.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationView {
    pub observation_id: String,
    pub source_federate_id: String,
    pub timestamp_utc: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub observation_type: String,
    pub confidence: f64,
    pub evidence_refs: Vec<String>,
}

/// One entry in a correlation timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub timestamp_utc: DateTime<Utc>,
    pub entry_kind: String,
    pub entry_id: String,
    pub summary: String,
}

/// Aggregate counters across the kernel's stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelStatistics {
    pub federate_count: usize,
    pub observation_count: usize,
    pub belief_count: usize,
    pub arbitration_count: usize,
    pub arbitration_status_counts: Value,
    pub observation_type_counts: Value,
    pub audit_record_count: usize,
    pub audit_kind_counts: Value,
    pub active_containments: usize,
}

/// Read-only query API. Borrows stores per call; holds nothing.
pub struct VisibilityApi;

impl VisibilityApi {
    /// All federates, redacted for public consumption.
    pub fn list_federates(identities: &FederateIdentityStore) -> Vec<FederateView> {
        identities
            .list()
            .into_iter()
            .map(|identity| FederateView {
                federate_id: identity.federate_id.clone(),
                key_id: identity.key_id.clone(),
                federation_role: identity.federation_role.as_str().to_string(),
                capabilities: identity.capabilities.clone(),
                trust_score: identity.trust_score,
                status: identity.status.as_str().to_string(),
                created_at: identity.created_at,
                last_seen: identities.last_seen(&identity.federate_id),
            })
            .collect()
    }

    /// Observations matching the filter, in `(timestamp, id)` order.
    pub fn list_observations(
        store: &ObservationStore,
        filter: &ObservationFilter,
    ) -> Vec<ObservationView> {
        store
            .list_observations(filter)
            .into_iter()
            .map(observation_view)
            .collect()
    }

    /// Beliefs matching the filter, in `(derived_at, id)` order.
    pub fn list_beliefs<'a>(store: &'a ObservationStore, filter: &BeliefFilter) -> Vec<&'a Belief> {
        store.list_beliefs(filter)
    }

    /// Observations and beliefs for one correlation ID, merged in
    /// timestamp order.
    pub fn timeline(store: &ObservationStore, correlation_id: &str) -> Vec<TimelineEntry> {
        let mut entries: Vec<TimelineEntry> = Vec::new();

        let obs_filter = ObservationFilter {
            correlation_id: Some(correlation_id.to_string()),
            ..Default::default()
        };
        for obs in store.list_observations(&obs_filter) {
            entries.push(TimelineEntry {
                timestamp_utc: obs.timestamp_utc,
                entry_kind: "observation".to_string(),
                entry_id: obs.observation_id.clone(),
                summary: format!(
                    "{} from {}",
                    obs.observation_type.as_str(),
                    obs.source_federate_id
                ),
            });
        }

        let belief_filter = BeliefFilter {
            correlation_id: Some(correlation_id.to_string()),
            ..Default::default()
        };
        for belief in store.list_beliefs(&belief_filter) {
            entries.push(TimelineEntry {
                timestamp_utc: belief.derived_at,
                entry_kind: "belief".to_string(),
                entry_id: belief.belief_id.clone(),
                summary: format!(
                    "{} from {} observations",
                    belief.belief_type,
                    belief.source_observations.len()
                ),
            });
        }

        entries.sort_by(|a, b| {
            a.timestamp_utc
                .cmp(&b.timestamp_utc)
                .then_with(|| a.entry_id.cmp(&b.entry_id))
        });
        entries
    }

    /// Arbitrations matching the filter, in `(created_at, id)` order.
    pub fn list_arbitrations<'a>(
        store: &'a ArbitrationStore,
        filter: &ArbitrationFilter,
    ) -> Vec<&'a Arbitration> {
        store.list(filter)
    }

    pub fn get_arbitration<'a>(
        store: &'a ArbitrationStore,
        arbitration_id: &str,
    ) -> Option<&'a Arbitration> {
        store.get(arbitration_id)
    }

    /// Containment status for one `(subject, provider)` pair.
    pub fn containment_status(
        effector: &IdentityContainmentEffector,
        subject_id: &str,
        provider: &str,
    ) -> Value {
        let applied: Vec<Value> = effector
            .status_for_subject(subject_id, provider)
            .into_iter()
            .map(|record| {
                json!({
                    "scope": record.scope_type.as_str(),
                    "intent_id": record.intent_id,
                    "applied_at_utc": record.applied_at_utc,
                    "expires_at_utc": record.expires_at_utc,
                })
            })
            .collect();
        json!({
            "subject_id": subject_id,
            "provider": provider,
            "contained": !applied.is_empty(),
            "active_scopes": applied,
        })
    }

    /// Aggregate statistics across stores.
    pub fn statistics(
        identities: &FederateIdentityStore,
        observations: &ObservationStore,
        arbitrations: &ArbitrationStore,
        audit: &AuditLog,
        effector: &IdentityContainmentEffector,
    ) -> KernelStatistics {
        KernelStatistics {
            federate_count: identities.len(),
            observation_count: observations.observation_count(),
            belief_count: observations.belief_count(),
            arbitration_count: arbitrations.len(),
            arbitration_status_counts: json!(arbitrations.status_counts()),
            observation_type_counts: json!(observations.observation_type_counts()),
            audit_record_count: audit.len(),
            audit_kind_counts: json!(audit.kind_counts()),
            active_containments: effector.active_count(),
        }
    }
}

fn observation_view(obs: &Observation) -> ObservationView {
    ObservationView {
        observation_id: obs.observation_id.clone(),
        source_federate_id: obs.source_federate_id.clone(),
        timestamp_utc: obs.timestamp_utc,
        correlation_id: obs.correlation_id.clone(),
        observation_type: obs.observation_type.as_str().to_string(),
        confidence: obs.confidence,
        evidence_refs: obs.evidence_refs.clone(),
    }
}
