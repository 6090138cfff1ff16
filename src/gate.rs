//! Execution safety gate: the single authoritative enforcement point for
//! every side effect.
//!
//! The gate evaluates an [`ExecutionContext`] against a fixed rule ladder
//! (first match wins) and returns one of ALLOW, DENY, REQUIRE_QUORUM, or
//! REQUIRE_HUMAN with the rule ID that decided. Precedence: kill switches,
//! then tenant context, then policy verification, then trust floors, then
//! per-class thresholds. The gate fails closed: any panic inside rule
//! evaluation converts to DENY with `gate_internal_error`. Every
//! invocation is audited.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::approval::ActionClass;
use crate::audit::{AuditEvent, AuditEventKind, AuditLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Allow,
    Deny,
    RequireQuorum,
    RequireHuman,
}

impl GateDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateDecision::Allow => "allow",
            GateDecision::Deny => "deny",
            GateDecision::RequireQuorum => "require_quorum",
            GateDecision::RequireHuman => "require_human",
        }
    }
}

/// Approval requirement handed down by policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredApproval {
    None,
    Quorum,
    Human,
}

/// Everything the gate needs to decide one execution.
///
/// Policy decisions arrive as opaque, pre-computed fields; the gate does
/// not interpret policy, it arbitrates.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub tenant_id: Option<String>,
    pub action_class: ActionClass,
    pub confidence: f64,
    pub trust_score: f64,
    pub quorum_count: u32,
    pub aggregate_score: f64,
    pub policy_verified: bool,
    pub required_approval: RequiredApproval,
    pub correlation_id: Option<String>,
    pub principal_id: String,
    pub intent_hash: Option<String>,
}

impl ExecutionContext {
    /// Context for system-maintenance operations (ticker sweeps). A0 so
    /// the threshold ladder lands on SG-501 unless a switch is engaged.
    pub fn system(tenant_id: &str) -> Self {
        ExecutionContext {
            tenant_id: Some(tenant_id.to_string()),
            action_class: ActionClass::A0Observe,
            confidence: 1.0,
            trust_score: 1.0,
            quorum_count: 0,
            aggregate_score: 0.0,
            policy_verified: true,
            required_approval: RequiredApproval::None,
            correlation_id: None,
            principal_id: "system".to_string(),
            intent_hash: None,
        }
    }
}

/// Gate verdict with the deciding rule, a stable reason code, and a
/// human-readable rationale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub decision: GateDecision,
    pub rule_id: String,
    pub reason: String,
    pub rationale: String,
}

impl SafetyVerdict {
    fn new(decision: GateDecision, rule_id: &str, reason: &str, rationale: &str) -> Self {
        SafetyVerdict {
            decision,
            rule_id: rule_id.to_string(),
            reason: reason.to_string(),
            rationale: rationale.to_string(),
        }
    }

    pub fn is_allow(&self) -> bool {
        self.decision == GateDecision::Allow
    }
}

#[derive(Debug, Default)]
struct SwitchState {
    global: bool,
    tenants: HashSet<String>,
}

/// Shared kill-switch surface. Flips are audited by the callers through
/// [`ExecutionSafetyGate::set_global_kill_switch`] and
/// [`ExecutionSafetyGate::set_tenant_kill_switch`].
#[derive(Debug, Default)]
pub struct KillSwitchSurface {
    state: RwLock<SwitchState>,
}

impl KillSwitchSurface {
    pub fn new() -> Self {
        KillSwitchSurface::default()
    }

    pub fn is_global_engaged(&self) -> bool {
        self.state.read().global
    }

    pub fn is_tenant_engaged(&self, tenant_id: &str) -> bool {
        self.state.read().tenants.contains(tenant_id)
    }
}

/// The execution safety gate.
pub struct ExecutionSafetyGate {
    switches: Arc<KillSwitchSurface>,
}

impl ExecutionSafetyGate {
    pub fn new() -> Self {
        ExecutionSafetyGate {
            switches: Arc::new(KillSwitchSurface::new()),
        }
    }

    pub fn with_switches(switches: Arc<KillSwitchSurface>) -> Self {
        ExecutionSafetyGate { switches }
    }

    pub fn switches(&self) -> Arc<KillSwitchSurface> {
        self.switches.clone()
    }

    /// Flip the global kill switch, audited.
    pub fn set_global_kill_switch(&self, engaged: bool, audit: &mut AuditLog) {
        self.switches.state.write().global = engaged;
        let _ = audit.append(AuditEvent::new(
            AuditEventKind::KillSwitchChanged,
            json!({"scope": "global", "engaged": engaged}),
        ));
    }

    /// Flip a tenant kill switch, audited.
    pub fn set_tenant_kill_switch(&self, tenant_id: &str, engaged: bool, audit: &mut AuditLog) {
        {
            let mut state = self.switches.state.write();
            if engaged {
                state.tenants.insert(tenant_id.to_string());
            } else {
                state.tenants.remove(tenant_id);
            }
        }
        let _ = audit.append(AuditEvent::new(
            AuditEventKind::KillSwitchChanged,
            json!({"scope": "tenant", "tenant_id": tenant_id, "engaged": engaged}),
        ));
    }

    /// Evaluate the gate for one execution and audit the verdict.
    pub fn evaluate(&self, ctx: &ExecutionContext, audit: &mut AuditLog) -> SafetyVerdict {
        let verdict = catch_unwind(AssertUnwindSafe(|| self.evaluate_rules(ctx)))
            .unwrap_or_else(|_| {
                SafetyVerdict::new(
                    GateDecision::Deny,
                    "SG-999",
                    "gate_internal_error",
                    "Internal gate fault; failing closed.",
                )
            });

        let kind = if verdict.is_allow() {
            AuditEventKind::GateAllowed
        } else {
            AuditEventKind::GateDenied
        };
        let mut event = AuditEvent::new(
            kind,
            json!({
                "tenant_id": ctx.tenant_id,
                "action_type": ctx.action_class.as_str(),
                "decision": verdict.decision.as_str(),
                "rule_id": verdict.rule_id,
                "reason": verdict.reason,
                "rationale": verdict.rationale,
                "principal_id": ctx.principal_id,
                "intent_hash": ctx.intent_hash,
            }),
        );
        if let Some(tenant) = &ctx.tenant_id {
            event = event.with_tenant(tenant.clone());
        }
        if let Some(correlation) = &ctx.correlation_id {
            event = event.with_correlation(correlation.clone());
        }
        let _ = audit.append(event);
        verdict
    }

    /// The rule ladder. Pure; first match wins.
    fn evaluate_rules(&self, ctx: &ExecutionContext) -> SafetyVerdict {
        // 1. Kill switches outrank everything.
        if self.switches.is_global_engaged() {
            return SafetyVerdict::new(
                GateDecision::Deny,
                "SG-101",
                "global_kill_switch",
                "Global kill switch engaged; only A0 observe permitted.",
            );
        }
        let tenant_id = match &ctx.tenant_id {
            Some(tenant) => tenant,
            None => {
                return SafetyVerdict::new(
                    GateDecision::Deny,
                    "SG-000",
                    "missing_tenant_context",
                    "Missing tenant context; refusing to execute.",
                );
            }
        };
        if self.switches.is_tenant_engaged(tenant_id) {
            return SafetyVerdict::new(
                GateDecision::Deny,
                "SG-102",
                "tenant_kill_switch",
                "Tenant kill switch engaged; only A0 observe permitted.",
            );
        }

        // 2. Policy verification.
        if !ctx.policy_verified {
            return SafetyVerdict::new(
                GateDecision::RequireQuorum,
                "SG-201",
                "policy_unverified",
                "Policy not verified; degrade and require escalation for non-A0.",
            );
        }

        // 3. Trust floors by action class.
        let class = ctx.action_class;
        if ctx.trust_score < 0.35
            && matches!(
                class,
                ActionClass::A2HardContainment | ActionClass::A3Irreversible
            )
        {
            return SafetyVerdict::new(
                GateDecision::RequireHuman,
                "SG-301",
                "trust_below_floor",
                "Trust too low for A2/A3 execution.",
            );
        }
        if ctx.trust_score < 0.50 && class == ActionClass::A2HardContainment {
            return SafetyVerdict::new(
                GateDecision::RequireQuorum,
                "SG-302",
                "trust_below_floor",
                "Trust below floor for local A2; require quorum.",
            );
        }
        if ctx.trust_score < 0.80 && class == ActionClass::A3Irreversible {
            return SafetyVerdict::new(
                GateDecision::RequireHuman,
                "SG-303",
                "trust_below_floor",
                "Trust below floor for local A3; require human approval.",
            );
        }

        // 4. Per-class thresholds.
        match class {
            ActionClass::A1SoftContainment => {
                if ctx.confidence >= 0.80 {
                    SafetyVerdict::new(
                        GateDecision::Allow,
                        "SG-401",
                        "confidence_threshold_met",
                        "A1 soft containment: confidence threshold met.",
                    )
                } else {
                    SafetyVerdict::new(
                        GateDecision::Deny,
                        "SG-402",
                        "confidence_threshold_not_met",
                        "A1 soft containment: confidence threshold not met.",
                    )
                }
            }
            ActionClass::A2HardContainment => {
                if ctx.confidence >= 0.90
                    || (ctx.quorum_count >= 2 && ctx.aggregate_score >= 0.85)
                {
                    SafetyVerdict::new(
                        GateDecision::Allow,
                        "SG-403",
                        "containment_thresholds_met",
                        "A2 hard containment: local or collective thresholds met.",
                    )
                } else {
                    SafetyVerdict::new(
                        GateDecision::RequireQuorum,
                        "SG-404",
                        "containment_thresholds_not_met",
                        "A2 hard containment: thresholds not met, require quorum.",
                    )
                }
            }
            ActionClass::A3Irreversible => {
                let collective = ctx.quorum_count >= 3 && ctx.aggregate_score >= 0.92;
                let human = ctx.required_approval == RequiredApproval::Human;
                if ctx.confidence >= 0.97 && (collective || human) {
                    SafetyVerdict::new(
                        GateDecision::Allow,
                        "SG-405",
                        "irreversible_thresholds_met",
                        "A3 irreversible: all thresholds and approvals met.",
                    )
                } else {
                    SafetyVerdict::new(
                        GateDecision::RequireHuman,
                        "SG-406",
                        "requires_human_approval",
                        "A3 irreversible: requires human approval or higher thresholds.",
                    )
                }
            }
            ActionClass::A0Observe => SafetyVerdict::new(
                GateDecision::Allow,
                "SG-501",
                "observe_allowed",
                "A0 observe: always allowed.",
            ),
        }
    }
}

impl Default for ExecutionSafetyGate {
    fn default() -> Self {
        Self::new()
    }
}
