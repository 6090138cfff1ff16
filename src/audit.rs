//! Append-only audit log and replay reducer.
//!
//! Every externally meaningful state change in the kernel lands here as an
//! [`AuditRecord`]. The log is the cell's observability surface and its
//! replay source: records are ordered by `(recorded_at, audit_id)` with
//! monotonic ULIDs, indexed by event kind and correlation ID, and (when a
//! storage path is configured) flushed to a JSONL file before the append
//! returns, so no side effect outruns its audit trail.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::canonical::stable_hash_value;
use crate::clock::{Clock, SharedClock};
use crate::ids::UlidFactory;
use crate::observation::Observation;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AuditError>;

/// Closed set of audit event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    HandshakeStarted,
    HandshakeTransition,
    HandshakeConfirmed,
    SignatureVerificationFailure,
    ObservationAccepted,
    ObservationRejected,
    BeliefCreated,
    ConflictDetected,
    ArbitrationCreated,
    ArbitrationResolutionProposed,
    ArbitrationResolved,
    ArbitrationRejected,
    ApprovalRequested,
    ApprovalDecided,
    ApprovalExpired,
    GateAllowed,
    GateDenied,
    ContainmentRecommended,
    ContainmentIntentCreated,
    IdentityContainmentApplied,
    IdentityContainmentReverted,
    IdentityContainmentDenied,
    IdentityContainmentExpired,
    KillSwitchChanged,
    FeatureDisabled,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::HandshakeStarted => "handshake_started",
            AuditEventKind::HandshakeTransition => "handshake_transition",
            AuditEventKind::HandshakeConfirmed => "handshake_confirmed",
            AuditEventKind::SignatureVerificationFailure => "signature_verification_failure",
            AuditEventKind::ObservationAccepted => "observation_accepted",
            AuditEventKind::ObservationRejected => "observation_rejected",
            AuditEventKind::BeliefCreated => "belief_created",
            AuditEventKind::ConflictDetected => "conflict_detected",
            AuditEventKind::ArbitrationCreated => "arbitration_created",
            AuditEventKind::ArbitrationResolutionProposed => "arbitration_resolution_proposed",
            AuditEventKind::ArbitrationResolved => "arbitration_resolved",
            AuditEventKind::ArbitrationRejected => "arbitration_rejected",
            AuditEventKind::ApprovalRequested => "approval_requested",
            AuditEventKind::ApprovalDecided => "approval_decided",
            AuditEventKind::ApprovalExpired => "approval_expired",
            AuditEventKind::GateAllowed => "gate_allowed",
            AuditEventKind::GateDenied => "gate_denied",
            AuditEventKind::ContainmentRecommended => "containment_recommended",
            AuditEventKind::ContainmentIntentCreated => "containment_intent_created",
            AuditEventKind::IdentityContainmentApplied => "identity_containment_applied",
            AuditEventKind::IdentityContainmentReverted => "identity_containment_reverted",
            AuditEventKind::IdentityContainmentDenied => "identity_containment_denied",
            AuditEventKind::IdentityContainmentExpired => "identity_containment_expired",
            AuditEventKind::KillSwitchChanged => "kill_switch_changed",
            AuditEventKind::FeatureDisabled => "feature_disabled",
        }
    }
}

/// Payload reference: inline JSON or an external pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ref", rename_all = "snake_case")]
pub enum PayloadRef {
    Inline(Value),
    External(String),
}

/// Hashes carried on each record: the payload's own stable hash plus any
/// upstream hashes the event derives from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditHashes {
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstream_hashes: Vec<String>,
}

/// One append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub schema_version: String,
    pub audit_id: String,
    pub tenant_id: String,
    pub cell_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub event_kind: AuditEventKind,
    pub payload_ref: PayloadRef,
    pub hashes: AuditHashes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Event submitted for appending; the log fills in identity, time, and
/// hashes.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub kind: AuditEventKind,
    pub correlation_id: Option<String>,
    pub tenant_id: Option<String>,
    pub trace_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub upstream_hashes: Vec<String>,
    pub payload: Value,
}

impl AuditEvent {
    pub fn new(kind: AuditEventKind, payload: Value) -> Self {
        AuditEvent {
            kind,
            correlation_id: None,
            tenant_id: None,
            trace_id: None,
            idempotency_key: None,
            upstream_hashes: Vec::new(),
            payload,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Append-only audit log with kind and correlation indexes.
pub struct AuditLog {
    records: Vec<AuditRecord>,
    by_kind: HashMap<AuditEventKind, Vec<usize>>,
    by_correlation: HashMap<String, Vec<usize>>,
    ids: UlidFactory,
    clock: SharedClock,
    cell_id: String,
    default_tenant: String,
    storage_path: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(clock: SharedClock, cell_id: impl Into<String>) -> Self {
        AuditLog {
            records: Vec::new(),
            by_kind: HashMap::new(),
            by_correlation: HashMap::new(),
            ids: UlidFactory::new(),
            clock,
            cell_id: cell_id.into(),
            default_tenant: "tenant_default".to_string(),
            storage_path: None,
        }
    }

    /// Enable JSONL persistence. Each append is written and flushed
    /// before the call returns.
    pub fn with_storage(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    /// Append an event, returning the finished record.
    pub fn append(&mut self, event: AuditEvent) -> Result<&AuditRecord> {
        let now = self.clock.now();
        let record = AuditRecord {
            schema_version: "1.0.0".to_string(),
            audit_id: self.ids.next(now),
            tenant_id: event
                .tenant_id
                .unwrap_or_else(|| self.default_tenant.clone()),
            cell_id: self.cell_id.clone(),
            idempotency_key: event.idempotency_key,
            recorded_at: now,
            event_kind: event.kind,
            hashes: AuditHashes {
                sha256: stable_hash_value(&event.payload),
                upstream_hashes: event.upstream_hashes,
            },
            payload_ref: PayloadRef::Inline(event.payload),
            correlation_id: event.correlation_id,
            trace_id: event.trace_id,
        };

        if let Some(path) = &self.storage_path {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            serde_json::to_writer(&mut file, &record)?;
            file.write_all(b"\n")?;
            file.flush()?;
        }

        let index = self.records.len();
        self.by_kind.entry(record.event_kind).or_default().push(index);
        if let Some(correlation) = &record.correlation_id {
            self.by_correlation
                .entry(correlation.clone())
                .or_default()
                .push(index);
        }
        self.records.push(record);
        Ok(self.records.last().expect("record just pushed"))
    }

    pub fn records(&self) -> &[AuditRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records of one kind, in append order.
    pub fn by_kind(&self, kind: AuditEventKind) -> Vec<&AuditRecord> {
        self.by_kind
            .get(&kind)
            .map(|indexes| indexes.iter().map(|&i| &self.records[i]).collect())
            .unwrap_or_default()
    }

    /// Records for one correlation ID, in causal (append) order.
    pub fn by_correlation(&self, correlation_id: &str) -> Vec<&AuditRecord> {
        self.by_correlation
            .get(correlation_id)
            .map(|indexes| indexes.iter().map(|&i| &self.records[i]).collect())
            .unwrap_or_default()
    }

    /// Kind counts for the statistics surface.
    pub fn kind_counts(&self) -> HashMap<&'static str, usize> {
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for record in &self.records {
            *counts.entry(record.event_kind.as_str()).or_default() += 1;
        }
        counts
    }
}

/// Fold `observation_accepted` records back into the observations they
/// committed. Replaying the log against an empty store reconstructs the
/// same observations the live run stored.
pub fn replay_observations(log: &AuditLog) -> Vec<Observation> {
    let mut observations = Vec::new();
    for record in log.by_kind(AuditEventKind::ObservationAccepted) {
        if let PayloadRef::Inline(payload) = &record.payload_ref {
            if let Some(raw) = payload.get("observation") {
                if let Ok(observation) = serde_json::from_value::<Observation>(raw.clone()) {
                    observations.push(observation);
                }
            }
        }
    }
    observations
}
