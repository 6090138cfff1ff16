//! Approval service and frozen-intent store.
//!
//! An approval binds a human (or quorum) consent to exactly one intent
//! hash. Execution presenting any other hash is denied with
//! `binding_mismatch`. The comparison is constant-time, so the binding
//! check leaks nothing about the frozen hash. Decisions are terminal;
//! expiry is itself a status transition with an audit record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::audit::{AuditEvent, AuditEventKind, AuditLog};
use crate::canonical::{canonical_json, stable_hash};
use crate::clock::{Clock, SharedClock};
use crate::containment::ContainmentIntent;
use crate::ids::UlidFactory;

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval {0} not found")]
    NotFound(String),

    #[error("approval {0} already decided")]
    AlreadyDecided(String),

    #[error("intent hash does not match the approval binding")]
    BindingMismatch,

    #[error("intent already frozen for approval {0}")]
    AlreadyFrozen(String),
}

pub type Result<T> = std::result::Result<T, ApprovalError>;

/// Action risk classes. A0 is observation-only and needs no approval;
/// A3 is irreversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionClass {
    #[serde(rename = "A0_observe")]
    A0Observe,
    #[serde(rename = "A1_soft_containment")]
    A1SoftContainment,
    #[serde(rename = "A2_hard_containment")]
    A2HardContainment,
    #[serde(rename = "A3_irreversible")]
    A3Irreversible,
}

impl ActionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionClass::A0Observe => "A0_observe",
            ActionClass::A1SoftContainment => "A1_soft_containment",
            ActionClass::A2HardContainment => "A2_hard_containment",
            ActionClass::A3Irreversible => "A3_irreversible",
        }
    }

    pub fn requires_approval(&self) -> bool {
        !matches!(self, ActionClass::A0Observe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

/// One approval request, bound to a single intent hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub approval_id: String,
    pub action_class: ActionClass,
    pub tenant_id: String,
    pub subject: String,
    pub intent_hash: String,
    pub principal_id: Option<String>,
    pub status: ApprovalStatus,
    pub rationale: String,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// Approval lifecycle service.
pub struct ApprovalService {
    approvals: HashMap<String, Approval>,
    ids: UlidFactory,
    clock: SharedClock,
}

impl ApprovalService {
    pub fn new(clock: SharedClock) -> Self {
        ApprovalService {
            approvals: HashMap::new(),
            ids: UlidFactory::new(),
            clock,
        }
    }

    /// Open an approval request bound to `intent_hash`.
    pub fn request(
        &mut self,
        action_class: ActionClass,
        tenant_id: impl Into<String>,
        subject: impl Into<String>,
        intent_hash: impl Into<String>,
        rationale: impl Into<String>,
        audit: &mut AuditLog,
    ) -> String {
        let now = self.clock.now();
        let approval = Approval {
            approval_id: self.ids.next(now),
            action_class,
            tenant_id: tenant_id.into(),
            subject: subject.into(),
            intent_hash: intent_hash.into(),
            principal_id: None,
            status: ApprovalStatus::Pending,
            rationale: rationale.into(),
            created_at: now,
            decided_at: None,
        };
        let approval_id = approval.approval_id.clone();
        let _ = audit.append(
            AuditEvent::new(
                AuditEventKind::ApprovalRequested,
                json!({
                    "approval_id": approval_id,
                    "action_type": approval.action_class.as_str(),
                    "subject": approval.subject,
                    "intent_hash": approval.intent_hash,
                }),
            )
            .with_tenant(approval.tenant_id.clone()),
        );
        self.approvals.insert(approval_id.clone(), approval);
        approval_id
    }

    /// Record a decision. Decided approvals are terminal.
    pub fn decide(
        &mut self,
        approval_id: &str,
        approve: bool,
        principal_id: impl Into<String>,
        audit: &mut AuditLog,
    ) -> Result<()> {
        let now = self.clock.now();
        let approval = self
            .approvals
            .get_mut(approval_id)
            .ok_or_else(|| ApprovalError::NotFound(approval_id.to_string()))?;
        if approval.status.is_terminal() {
            return Err(ApprovalError::AlreadyDecided(approval_id.to_string()));
        }
        approval.status = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        approval.principal_id = Some(principal_id.into());
        approval.decided_at = Some(now);
        let _ = audit.append(
            AuditEvent::new(
                AuditEventKind::ApprovalDecided,
                json!({
                    "approval_id": approval_id,
                    "status": approval.status.as_str(),
                    "principal_id": approval.principal_id,
                }),
            )
            .with_tenant(approval.tenant_id.clone()),
        );
        Ok(())
    }

    /// Expire a pending approval. A status transition with its own audit
    /// record, not a deletion; requests persist until explicit expiry.
    pub fn expire(&mut self, approval_id: &str, audit: &mut AuditLog) -> Result<()> {
        let now = self.clock.now();
        let approval = self
            .approvals
            .get_mut(approval_id)
            .ok_or_else(|| ApprovalError::NotFound(approval_id.to_string()))?;
        if approval.status.is_terminal() {
            return Err(ApprovalError::AlreadyDecided(approval_id.to_string()));
        }
        approval.status = ApprovalStatus::Expired;
        approval.decided_at = Some(now);
        let _ = audit.append(
            AuditEvent::new(
                AuditEventKind::ApprovalExpired,
                json!({"approval_id": approval_id}),
            )
            .with_tenant(approval.tenant_id.clone()),
        );
        Ok(())
    }

    pub fn get(&self, approval_id: &str) -> Option<&Approval> {
        self.approvals.get(approval_id)
    }

    pub fn is_approved(&self, approval_id: &str) -> bool {
        self.approvals
            .get(approval_id)
            .map(|a| a.status == ApprovalStatus::Approved)
            .unwrap_or(false)
    }

    /// Constant-time binding check between a presented intent hash and the
    /// hash the approval was opened for.
    pub fn verify_binding(&self, approval_id: &str, intent_hash: &str) -> Result<()> {
        let approval = self
            .approvals
            .get(approval_id)
            .ok_or_else(|| ApprovalError::NotFound(approval_id.to_string()))?;
        let matches: bool = approval
            .intent_hash
            .as_bytes()
            .ct_eq(intent_hash.as_bytes())
            .into();
        if !matches {
            return Err(ApprovalError::BindingMismatch);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.approvals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.approvals.is_empty()
    }

    /// Status distribution for the statistics surface.
    pub fn status_counts(&self) -> HashMap<&'static str, usize> {
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for approval in self.approvals.values() {
            *counts.entry(approval.status.as_str()).or_default() += 1;
        }
        counts
    }
}

/// Deterministic intent hash: canonical JSON of the intent with volatile
/// fields stripped, then stable-hashed. Timestamps and execution state do
/// not participate, so re-presenting the same frozen intent always hashes
/// identically.
pub fn compute_intent_hash(intent: &ContainmentIntent) -> String {
    let mut value = serde_json::to_value(intent).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        for volatile in [
            "created_at_utc",
            "expires_at_utc",
            "execution_status",
            "intent_hash",
            "approval_id",
        ] {
            map.remove(volatile);
        }
    }
    stable_hash(&canonical_json(&value))
}

/// Store of frozen intents keyed by `approval_id`, with secondary indexes
/// by idempotency key, intent ID, and intent hash.
#[derive(Debug, Default)]
pub struct IntentStore {
    frozen: HashMap<String, ContainmentIntent>,
    by_idempotency: HashMap<String, String>,
    by_intent_id: HashMap<String, String>,
    by_hash: HashMap<String, String>,
}

impl IntentStore {
    pub fn new() -> Self {
        IntentStore::default()
    }

    /// Freeze an intent under its approval. The stored copy is the
    /// authoritative version any later execution must hash-match.
    pub fn freeze(&mut self, approval_id: &str, intent: ContainmentIntent) -> Result<()> {
        if self.frozen.contains_key(approval_id) {
            return Err(ApprovalError::AlreadyFrozen(approval_id.to_string()));
        }
        let intent_hash = compute_intent_hash(&intent);
        self.by_idempotency
            .insert(intent.idempotency_key.clone(), approval_id.to_string());
        self.by_intent_id
            .insert(intent.intent_id.clone(), approval_id.to_string());
        self.by_hash.insert(intent_hash, approval_id.to_string());
        self.frozen.insert(approval_id.to_string(), intent);
        Ok(())
    }

    pub fn get_by_approval(&self, approval_id: &str) -> Option<&ContainmentIntent> {
        self.frozen.get(approval_id)
    }

    pub fn get_by_intent_id(&self, intent_id: &str) -> Option<&ContainmentIntent> {
        self.by_intent_id
            .get(intent_id)
            .and_then(|approval_id| self.frozen.get(approval_id))
    }

    pub fn get_by_idempotency_key(&self, key: &str) -> Option<&ContainmentIntent> {
        self.by_idempotency
            .get(key)
            .and_then(|approval_id| self.frozen.get(approval_id))
    }

    pub fn approval_for_hash(&self, intent_hash: &str) -> Option<&str> {
        self.by_hash.get(intent_hash).map(String::as_str)
    }

    /// Verify that a presented intent matches the frozen one under
    /// `approval_id`: same identity, same idempotency key, same hash.
    pub fn verify_intent_binding(&self, approval_id: &str, intent: &ContainmentIntent) -> bool {
        let Some(frozen) = self.frozen.get(approval_id) else {
            return false;
        };
        if frozen.intent_id != intent.intent_id
            || frozen.idempotency_key != intent.idempotency_key
        {
            return false;
        }
        let presented = compute_intent_hash(intent);
        self.by_hash.get(&presented).map(String::as_str) == Some(approval_id)
    }

    pub fn len(&self) -> usize {
        self.frozen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frozen.is_empty()
    }
}
