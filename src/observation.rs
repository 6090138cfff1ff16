//! Observation and belief entities.
//!
//! Observations are signed claims about the world submitted by confirmed
//! peers; beliefs are what the deterministic aggregator derives from them.
//! Payloads are a closed tagged union; aggregation reducers dispatch on
//! the tag, never on dynamic structure.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::messages::SignatureInfo;

pub const SCHEMA_VERSION: &str = "1.0.0";

/// The closed set of observation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationType {
    TelemetrySummary,
    ThreatIntel,
    AnomalyDetection,
    SystemHealth,
    NetworkActivity,
    Custom,
}

impl ObservationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationType::TelemetrySummary => "telemetry_summary",
            ObservationType::ThreatIntel => "threat_intel",
            ObservationType::AnomalyDetection => "anomaly_detection",
            ObservationType::SystemHealth => "system_health",
            ObservationType::NetworkActivity => "network_activity",
            ObservationType::Custom => "custom",
        }
    }
}

/// Type-tagged observation payload.
///
/// `BTreeMap` keeps map-valued fields in deterministic order for canonical
/// serialization and replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "payload_type", rename_all = "snake_case")]
pub enum ObservationPayload {
    TelemetrySummary {
        event_count: u64,
        event_types: Vec<String>,
        severity_distribution: BTreeMap<String, u64>,
    },
    ThreatIntel {
        ioc_count: u64,
        threat_types: Vec<String>,
        confidence_score: f64,
        sources: Vec<String>,
    },
    AnomalyDetection {
        anomaly_type: String,
        anomaly_score: f64,
        baseline_deviation: f64,
        affected_entities: Vec<String>,
    },
    SystemHealth {
        cpu_utilization: f64,
        memory_utilization: f64,
        disk_utilization: f64,
        network_latency_ms: f64,
        service_status: BTreeMap<String, String>,
    },
    NetworkActivity {
        connection_count: u64,
        bytes_transferred: u64,
        top_protocols: Vec<String>,
        suspicious_ips: Vec<String>,
    },
    Custom {
        data: Value,
    },
}

impl ObservationPayload {
    pub fn kind(&self) -> ObservationType {
        match self {
            ObservationPayload::TelemetrySummary { .. } => ObservationType::TelemetrySummary,
            ObservationPayload::ThreatIntel { .. } => ObservationType::ThreatIntel,
            ObservationPayload::AnomalyDetection { .. } => ObservationType::AnomalyDetection,
            ObservationPayload::SystemHealth { .. } => ObservationType::SystemHealth,
            ObservationPayload::NetworkActivity { .. } => ObservationType::NetworkActivity,
            ObservationPayload::Custom { .. } => ObservationType::Custom,
        }
    }
}

/// A signed claim from one federate about one slice of telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub schema_version: String,
    pub observation_id: String,
    pub source_federate_id: String,
    pub timestamp_utc: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub observation_type: ObservationType,
    pub confidence: f64,
    pub evidence_refs: Vec<String>,
    pub payload: ObservationPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureInfo>,
}

impl Observation {
    /// Structural consistency between the declared type and the payload tag.
    pub fn payload_matches_type(&self) -> bool {
        self.payload.kind() == self.observation_type
    }
}

/// Evidence-backed claim derived from observations by the aggregator.
///
/// Immutable after publication; arbitration decisions overlay `metadata`
/// through the observation store's sanctioned edit path, tagged with the
/// deciding `arbitration_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Belief {
    pub schema_version: String,
    pub belief_id: String,
    pub belief_type: String,
    pub confidence: f64,
    pub source_observations: Vec<String>,
    pub derived_at: DateTime<Utc>,
    pub correlation_id: String,
    pub evidence_summary: String,
    pub conflicts: Vec<String>,
    pub metadata: Map<String, Value>,
}
