//! # ADMO Core - Defense-Mesh Coordination and Safety Kernel
//!
//! `admo_core` is the coordination kernel of an autonomous defense mesh:
//! a federation of cooperating cells that authenticate each other, share
//! signed security observations, derive beliefs deterministically, and
//! execute time-bounded identity containment behind a fail-closed gate.
//!
//! ## Core Philosophy
//!
//! **"No side effect without an approval, an audit record, and a TTL."**
//!
//! - Every peer is authenticated by a nonce-protected Ed25519 handshake
//! - Every belief is a deterministic function of its source observations
//! - Every belief conflict needs approved human arbitration to resolve
//! - Every containment is gated, hash-bound to its approval, and reverts
//!   when its TTL lapses
//!
//! ## Subsystems
//!
//! - **Federation identity** ([`handshake`], [`crypto`], [`identity_store`],
//!   [`nonce_store`]) - four-step handshake state machine with replay
//!   protection and correlation-ID locking
//! - **Belief pipeline** ([`ingest`], [`aggregation`], [`conflict`]) -
//!   validated signed ingest, deterministic reduction, conflict keys
//! - **Arbitration** ([`arbitration`], [`approval`]) - human-in-the-loop
//!   resolution; the only sanctioned post-publication belief edit
//! - **Execution** ([`gate`], [`containment`]) - the SG rule ladder,
//!   kill switches, frozen intents, the simulated effector, TTL ticker
//! - **Cross-cutting** ([`clock`], [`canonical`], [`ids`], [`audit`],
//!   [`config`], [`visibility`]) - injected time, canonical JSON, ULIDs,
//!   the append-only audit log, feature flags, read-only queries
//!
//! ## Example
//!
//! ```rust
//! use admo_core::clock::{FixedClock, SharedClock};
//! use admo_core::approval::ActionClass;
//! use admo_core::audit::AuditLog;
//! use admo_core::gate::{ExecutionContext, ExecutionSafetyGate, GateDecision, RequiredApproval};
//! use std::sync::Arc;
//!
//! let clock: SharedClock = Arc::new(FixedClock::new());
//! let mut audit = AuditLog::new(clock, "cell-demo-00-01");
//! let gate = ExecutionSafetyGate::new();
//!
//! let verdict = gate.evaluate(
//!     &ExecutionContext {
//!         tenant_id: Some("tenant_default".to_string()),
//!         action_class: ActionClass::A1SoftContainment,
//!         confidence: 0.85,
//!         trust_score: 0.9,
//!         quorum_count: 0,
//!         aggregate_score: 0.0,
//!         policy_verified: true,
//!         required_approval: RequiredApproval::None,
//!         correlation_id: None,
//!         principal_id: "operator-1".to_string(),
//!         intent_hash: None,
//!     },
//!     &mut audit,
//! );
//! assert_eq!(verdict.decision, GateDecision::Allow);
//! assert_eq!(verdict.rule_id, "SG-401");
//! ```
//!
//! ## Security Model
//!
//! ### Enforced
//!
//! - **Replay** - per-federate nonce records with TTL; one commit point
//! - **Forgery** - Ed25519 over canonical JSON; byte-exact signing region
//! - **Intent substitution** - approvals bind one intent hash, compared
//!   in constant time
//! - **Runaway containment** - TTL ceiling plus tick-driven auto-revert
//! - **Partial failure** - the gate converts internal faults to DENY
//!
//! ### Out of scope
//!
//! - Transport, durable storage, operator UI, and real identity-provider
//!   effectors live behind narrow interfaces in the host
//! - A compromised host process can bypass an in-process gate

pub mod aggregation;
pub mod approval;
pub mod arbitration;
pub mod audit;
pub mod canonical;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod containment;
pub mod crypto;
pub mod gate;
pub mod handshake;
pub mod identity_store;
pub mod ids;
pub mod ingest;
pub mod messages;
pub mod nonce_store;
pub mod observation;
pub mod observation_store;
pub mod visibility;

pub use aggregation::{BeliefAggregationConfig, BeliefAggregator};
pub use approval::{ActionClass, Approval, ApprovalService, ApprovalStatus, IntentStore};
pub use arbitration::{
    Arbitration, ArbitrationService, ArbitrationStatus, ArbitrationStore, ConflictType,
};
pub use audit::{AuditEvent, AuditEventKind, AuditLog, AuditRecord};
pub use canonical::{canonical_json, stable_hash};
pub use clock::{Clock, FixedClock, SharedClock, SystemClock};
pub use config::{Feature, FeatureFlags};
pub use conflict::ConflictDetector;
pub use containment::{
    ContainmentIntent, ContainmentTicker, IdentityContainmentEffector,
    IdentityContainmentRecommender, IntentService,
};
pub use crypto::{FederateKeyPair, VerificationFailureReason};
pub use gate::{ExecutionContext, ExecutionSafetyGate, GateDecision, SafetyVerdict};
pub use handshake::{HandshakeController, HandshakeState, HandshakeStateMachine};
pub use identity_store::{CellStatus, FederateIdentity, FederateIdentityStore, FederationRole};
pub use ingest::{ObservationIngest, ObservationIngestConfig};
pub use messages::{MessagePayload, MessageType, SignedMessage};
pub use nonce_store::NonceStore;
pub use observation::{Belief, Observation, ObservationPayload, ObservationType};
pub use observation_store::ObservationStore;
pub use visibility::VisibilityApi;

/// Version of the kernel crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
