//! Deterministic belief aggregation.
//!
//! A pure reducer from observations to beliefs: identical inputs always
//! yield beliefs with identical IDs, confidences, provenance, and
//! metadata. Grouping is `(observation_type, correlation or
//! "no_correlation", hourly window)` plus a type-specific secondary key,
//! and every reducer is a total function of its group.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Timelike, Utc};
use serde_json::{json, Map, Value};

use crate::audit::{AuditEvent, AuditEventKind, AuditLog};
use crate::canonical::format_utc;
use crate::config::{Feature, FeatureFlags};
use crate::ids::deterministic_ulid;
use crate::observation::{Belief, Observation, ObservationPayload, ObservationType, SCHEMA_VERSION};
use crate::observation_store::{ObservationFilter, ObservationStore};

/// Configuration for aggregation behavior.
#[derive(Debug, Clone)]
pub struct BeliefAggregationConfig {
    pub min_observations_for_belief: usize,
}

impl Default for BeliefAggregationConfig {
    fn default() -> Self {
        BeliefAggregationConfig {
            min_observations_for_belief: 1,
        }
    }
}

/// Deterministic observation-to-belief reducer.
#[derive(Debug, Default)]
pub struct BeliefAggregator {
    config: BeliefAggregationConfig,
}

impl BeliefAggregator {
    pub fn new(config: BeliefAggregationConfig) -> Self {
        BeliefAggregator { config }
    }

    /// Aggregate matching observations from the store into beliefs,
    /// store the beliefs, and emit one `belief_created` record each.
    ///
    /// Returns the newly derived beliefs. Deriving the same groups twice
    /// produces duplicate belief IDs, which the store rejects, so re-runs
    /// are idempotent.
    pub fn run(
        &self,
        filter: &ObservationFilter,
        store: &mut ObservationStore,
        flags: &FeatureFlags,
        audit: &mut AuditLog,
    ) -> Vec<Belief> {
        if !flags.enabled(Feature::BeliefAggregation) {
            if flags.note_disabled_refusal(Feature::BeliefAggregation) {
                let _ = audit.append(AuditEvent::new(
                    AuditEventKind::FeatureDisabled,
                    json!({"feature": Feature::BeliefAggregation.as_str()}),
                ));
            }
            return Vec::new();
        }

        let observations: Vec<Observation> = store
            .list_observations(filter)
            .into_iter()
            .cloned()
            .collect();
        let beliefs = self.aggregate(&observations);

        let mut stored = Vec::new();
        for belief in beliefs {
            if store.store_belief(belief.clone()).is_ok() {
                let mut event = AuditEvent::new(
                    AuditEventKind::BeliefCreated,
                    json!({
                        "belief_id": belief.belief_id,
                        "belief_type": belief.belief_type,
                        "confidence": belief.confidence,
                        "source_count": belief.source_observations.len(),
                    }),
                );
                if belief.correlation_id != "no_correlation" {
                    event = event.with_correlation(belief.correlation_id.clone());
                }
                let _ = audit.append(event);
                stored.push(belief);
            }
        }
        stored
    }

    /// Pure aggregation over a slice of observations.
    pub fn aggregate(&self, observations: &[Observation]) -> Vec<Belief> {
        let mut groups: BTreeMap<String, Vec<&Observation>> = BTreeMap::new();
        for obs in observations {
            groups.entry(group_key(obs)).or_default().push(obs);
        }

        let mut beliefs = Vec::new();
        for group in groups.values() {
            if group.len() < self.config.min_observations_for_belief {
                continue;
            }
            beliefs.push(derive_belief(group));
        }
        beliefs
    }
}

/// Deterministic grouping key for one observation.
fn group_key(obs: &Observation) -> String {
    let mut parts = vec![
        obs.observation_type.as_str().to_string(),
        obs.correlation_id
            .clone()
            .unwrap_or_else(|| "no_correlation".to_string()),
        hourly_window(obs.timestamp_utc),
    ];
    if let Some(secondary) = payload_grouping_key(obs) {
        parts.push(secondary);
    }
    parts.join("|")
}

/// Truncate a timestamp to its hourly aggregation window.
pub fn hourly_window(ts: DateTime<Utc>) -> String {
    let hour = ts
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts);
    format_utc(hour)
}

/// Type-specific secondary grouping key.
fn payload_grouping_key(obs: &Observation) -> Option<String> {
    match &obs.payload {
        ObservationPayload::ThreatIntel { threat_types, .. } => {
            let mut sorted = threat_types.clone();
            sorted.sort();
            Some(sorted.join(","))
        }
        ObservationPayload::AnomalyDetection { anomaly_type, .. } => Some(anomaly_type.clone()),
        ObservationPayload::SystemHealth { service_status, .. } => {
            let healthy = service_status.values().filter(|s| *s == "healthy").count();
            Some(format!("{healthy}/{}", service_status.len()))
        }
        _ => None,
    }
}

fn derive_belief(group: &[&Observation]) -> Belief {
    let obs_type = group[0].observation_type;
    let (confidence, evidence_summary, metadata) = match obs_type {
        ObservationType::TelemetrySummary => reduce_telemetry_summary(group),
        ObservationType::ThreatIntel => reduce_threat_intel(group),
        ObservationType::AnomalyDetection => reduce_anomaly_detection(group),
        ObservationType::SystemHealth => reduce_system_health(group),
        ObservationType::NetworkActivity => reduce_network_activity(group),
        ObservationType::Custom => reduce_custom(group),
    };

    let derived_at = group
        .iter()
        .map(|o| o.timestamp_utc)
        .max()
        .expect("group is non-empty");
    let sources: Vec<(String, DateTime<Utc>)> = group
        .iter()
        .map(|o| (o.observation_id.clone(), o.timestamp_utc))
        .collect();
    let mut source_observations: Vec<String> =
        group.iter().map(|o| o.observation_id.clone()).collect();
    source_observations.sort();

    Belief {
        schema_version: SCHEMA_VERSION.to_string(),
        belief_id: deterministic_ulid(derived_at, &sources),
        belief_type: format!("derived_from_{}", obs_type.as_str()),
        confidence: confidence.clamp(0.0, 1.0),
        source_observations,
        derived_at,
        correlation_id: group[0]
            .correlation_id
            .clone()
            .unwrap_or_else(|| "no_correlation".to_string()),
        evidence_summary,
        conflicts: vec![],
        metadata,
    }
}

fn reduce_telemetry_summary(group: &[&Observation]) -> (f64, String, Map<String, Value>) {
    let mut total_events: u64 = 0;
    let mut severity: BTreeMap<String, u64> = BTreeMap::new();
    let mut confidence_sum = 0.0;

    for obs in group {
        confidence_sum += obs.confidence;
        if let ObservationPayload::TelemetrySummary {
            event_count,
            severity_distribution,
            ..
        } = &obs.payload
        {
            total_events += event_count;
            for (level, count) in severity_distribution {
                *severity.entry(level.clone()).or_default() += count;
            }
        }
    }

    let avg_confidence = confidence_sum / group.len() as f64;
    let summary = format!(
        "Aggregated {total_events} telemetry events from {} observations",
        group.len()
    );
    let mut metadata = Map::new();
    metadata.insert("total_events".to_string(), json!(total_events));
    metadata.insert("observation_count".to_string(), json!(group.len()));
    metadata.insert("severity_distribution".to_string(), json!(severity));
    (avg_confidence, summary, metadata)
}

fn reduce_threat_intel(group: &[&Observation]) -> (f64, String, Map<String, Value>) {
    let mut total_iocs: u64 = 0;
    let mut threat_types: BTreeSet<String> = BTreeSet::new();
    let mut sources: BTreeSet<String> = BTreeSet::new();
    let mut confidence_sum = 0.0;

    for obs in group {
        if let ObservationPayload::ThreatIntel {
            ioc_count,
            threat_types: types,
            confidence_score,
            sources: feed_sources,
        } = &obs.payload
        {
            total_iocs += ioc_count;
            threat_types.extend(types.iter().cloned());
            sources.extend(feed_sources.iter().cloned());
            confidence_sum += confidence_score;
        }
    }

    let avg_confidence = confidence_sum / group.len() as f64;
    let types: Vec<&String> = threat_types.iter().collect();
    let summary = format!(
        "Aggregated {total_iocs} IOCs from {} threat intel observations; threat types {:?}",
        group.len(),
        types
    );
    let mut metadata = Map::new();
    metadata.insert("total_iocs".to_string(), json!(total_iocs));
    metadata.insert("threat_types".to_string(), json!(threat_types));
    metadata.insert("sources".to_string(), json!(sources));
    metadata.insert("observation_count".to_string(), json!(group.len()));
    // A single classification per group makes conflict predicates exact.
    if threat_types.len() == 1 {
        let only = threat_types.iter().next().expect("one element");
        metadata.insert("threat_type".to_string(), json!(only));
    }
    (avg_confidence, summary, metadata)
}

fn reduce_anomaly_detection(group: &[&Observation]) -> (f64, String, Map<String, Value>) {
    let mut score_sum = 0.0;
    let mut deviation_sum = 0.0;
    let mut entities: BTreeSet<String> = BTreeSet::new();

    for obs in group {
        if let ObservationPayload::AnomalyDetection {
            anomaly_score,
            baseline_deviation,
            affected_entities,
            ..
        } = &obs.payload
        {
            score_sum += anomaly_score;
            deviation_sum += baseline_deviation;
            entities.extend(affected_entities.iter().cloned());
        }
    }

    let avg_score = score_sum / group.len() as f64;
    let avg_deviation = deviation_sum / group.len() as f64;
    let summary = format!(
        "Aggregated anomaly detection from {} observations; average score {avg_score:.3}, {} affected entities",
        group.len(),
        entities.len()
    );
    let mut metadata = Map::new();
    metadata.insert("average_anomaly_score".to_string(), json!(avg_score));
    metadata.insert(
        "average_baseline_deviation".to_string(),
        json!(avg_deviation),
    );
    metadata.insert("affected_entities".to_string(), json!(entities));
    metadata.insert("observation_count".to_string(), json!(group.len()));
    (avg_score, summary, metadata)
}

fn reduce_system_health(group: &[&Observation]) -> (f64, String, Map<String, Value>) {
    let mut cpu_sum = 0.0;
    let mut mem_sum = 0.0;
    let mut disk_sum = 0.0;
    let mut latency_sum = 0.0;

    for obs in group {
        if let ObservationPayload::SystemHealth {
            cpu_utilization,
            memory_utilization,
            disk_utilization,
            network_latency_ms,
            ..
        } = &obs.payload
        {
            cpu_sum += cpu_utilization;
            mem_sum += memory_utilization;
            disk_sum += disk_utilization;
            latency_sum += network_latency_ms;
        }
    }

    let n = group.len() as f64;
    let avg_cpu = cpu_sum / n;
    let avg_mem = mem_sum / n;
    let avg_disk = disk_sum / n;
    let avg_latency = latency_sum / n;
    // High score means healthy.
    let health_score = (1.0 - (avg_cpu + avg_mem + avg_disk) / 300.0).max(0.0);

    let summary = format!(
        "System health aggregated from {} observations; CPU {avg_cpu:.1}%, memory {avg_mem:.1}%, disk {avg_disk:.1}%, latency {avg_latency:.1}ms, health score {health_score:.3}",
        group.len()
    );
    let mut metadata = Map::new();
    metadata.insert("average_cpu_utilization".to_string(), json!(avg_cpu));
    metadata.insert("average_memory_utilization".to_string(), json!(avg_mem));
    metadata.insert("average_disk_utilization".to_string(), json!(avg_disk));
    metadata.insert("average_network_latency".to_string(), json!(avg_latency));
    metadata.insert("health_score".to_string(), json!(health_score));
    metadata.insert("observation_count".to_string(), json!(group.len()));
    (health_score, summary, metadata)
}

fn reduce_network_activity(group: &[&Observation]) -> (f64, String, Map<String, Value>) {
    let mut total_connections: u64 = 0;
    let mut total_bytes: u64 = 0;
    let mut protocols: BTreeSet<String> = BTreeSet::new();
    let mut suspicious: BTreeSet<String> = BTreeSet::new();

    for obs in group {
        if let ObservationPayload::NetworkActivity {
            connection_count,
            bytes_transferred,
            top_protocols,
            suspicious_ips,
        } = &obs.payload
        {
            total_connections += connection_count;
            total_bytes += bytes_transferred;
            protocols.extend(top_protocols.iter().cloned());
            suspicious.extend(suspicious_ips.iter().cloned());
        }
    }

    let confidence = (group.len() as f64 / 10.0).min(1.0);
    let summary = format!(
        "Network activity aggregated from {} observations; {total_connections} connections, {total_bytes} bytes, {} suspicious IPs",
        group.len(),
        suspicious.len()
    );
    let mut metadata = Map::new();
    metadata.insert("total_connections".to_string(), json!(total_connections));
    metadata.insert("total_bytes_transferred".to_string(), json!(total_bytes));
    metadata.insert("protocols".to_string(), json!(protocols));
    metadata.insert("suspicious_ip_count".to_string(), json!(suspicious.len()));
    metadata.insert("observation_count".to_string(), json!(group.len()));
    (confidence, summary, metadata)
}

fn reduce_custom(group: &[&Observation]) -> (f64, String, Map<String, Value>) {
    let avg_confidence =
        group.iter().map(|o| o.confidence).sum::<f64>() / group.len() as f64;
    let summary = format!(
        "Custom observations aggregated from {} observations; average confidence {avg_confidence:.3}",
        group.len()
    );
    let mut metadata = Map::new();
    metadata.insert("observation_count".to_string(), json!(group.len()));
    metadata.insert(
        "observation_type".to_string(),
        json!(group[0].observation_type.as_str()),
    );
    (avg_confidence, summary, metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap()
    }

    fn threat_obs(id: &str, threat_type: &str, confidence_score: f64) -> Observation {
        Observation {
            schema_version: SCHEMA_VERSION.to_string(),
            observation_id: id.to_string(),
            source_federate_id: "cell-eu-west-01".to_string(),
            timestamp_utc: t0(),
            correlation_id: Some("corr-1".to_string()),
            nonce: None,
            observation_type: ObservationType::ThreatIntel,
            confidence: confidence_score,
            evidence_refs: vec![format!("evt-{id}")],
            payload: ObservationPayload::ThreatIntel {
                ioc_count: 3,
                threat_types: vec![threat_type.to_string()],
                confidence_score,
                sources: vec!["feed-a".to_string()],
            },
            signature: None,
        }
    }

    fn health_obs(id: &str, cpu: f64) -> Observation {
        Observation {
            schema_version: SCHEMA_VERSION.to_string(),
            observation_id: id.to_string(),
            source_federate_id: "cell-eu-west-01".to_string(),
            timestamp_utc: t0(),
            correlation_id: Some("corr-h".to_string()),
            nonce: None,
            observation_type: ObservationType::SystemHealth,
            confidence: 0.8,
            evidence_refs: vec![],
            payload: ObservationPayload::SystemHealth {
                cpu_utilization: cpu,
                memory_utilization: 40.0,
                disk_utilization: 20.0,
                network_latency_ms: 12.0,
                service_status: BTreeMap::new(),
            },
            signature: None,
        }
    }

    #[test]
    fn test_aggregation_deterministic() {
        let aggregator = BeliefAggregator::default();
        let observations = vec![
            threat_obs("obs-a", "malware", 0.9),
            threat_obs("obs-b", "malware", 0.8),
        ];
        let first = aggregator.aggregate(&observations);
        let second = aggregator.aggregate(&observations);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].belief_id, second[0].belief_id);
        assert_eq!(first[0].confidence, second[0].confidence);
        assert_eq!(first[0].metadata, second[0].metadata);
        assert_eq!(first[0].derived_at, second[0].derived_at);
    }

    #[test]
    fn test_distinct_threat_types_group_separately() {
        let aggregator = BeliefAggregator::default();
        let observations = vec![
            threat_obs("obs-a", "malware", 0.9),
            threat_obs("obs-b", "benign", 0.8),
            threat_obs("obs-c", "suspicious", 0.7),
        ];
        let beliefs = aggregator.aggregate(&observations);
        assert_eq!(beliefs.len(), 3);
        for belief in &beliefs {
            assert_eq!(belief.belief_type, "derived_from_threat_intel");
            assert!(belief.metadata.contains_key("threat_type"));
        }
    }

    #[test]
    fn test_threat_intel_reduction() {
        let aggregator = BeliefAggregator::default();
        let beliefs = aggregator.aggregate(&[
            threat_obs("obs-a", "malware", 0.9),
            threat_obs("obs-b", "malware", 0.7),
        ]);
        let belief = &beliefs[0];
        assert_eq!(belief.metadata["total_iocs"], json!(6));
        assert_eq!(belief.metadata["threat_type"], json!("malware"));
        assert!((belief.confidence - 0.8).abs() < 1e-9);
        assert_eq!(
            belief.source_observations,
            vec!["obs-a".to_string(), "obs-b".to_string()]
        );
    }

    #[test]
    fn test_health_score_formula() {
        let aggregator = BeliefAggregator::default();
        let beliefs = aggregator.aggregate(&[health_obs("obs-h1", 60.0), health_obs("obs-h2", 60.0)]);
        let belief = &beliefs[0];
        // (60 + 40 + 20) / 300 = 0.4 -> health 0.6
        let health = belief.metadata["health_score"].as_f64().unwrap();
        assert!((health - 0.6).abs() < 1e-9);
        assert!((belief.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_health_score_floor_at_zero() {
        let aggregator = BeliefAggregator::default();
        let mut obs = health_obs("obs-h1", 150.0);
        if let ObservationPayload::SystemHealth {
            memory_utilization,
            disk_utilization,
            ..
        } = &mut obs.payload
        {
            *memory_utilization = 150.0;
            *disk_utilization = 150.0;
        }
        let beliefs = aggregator.aggregate(&[obs]);
        assert_eq!(beliefs[0].metadata["health_score"], json!(0.0));
    }

    #[test]
    fn test_derived_at_is_group_max() {
        let aggregator = BeliefAggregator::default();
        let mut late = threat_obs("obs-late", "malware", 0.9);
        late.timestamp_utc = t0() + chrono::Duration::minutes(30);
        let beliefs = aggregator.aggregate(&[threat_obs("obs-early", "malware", 0.8), late]);
        assert_eq!(beliefs.len(), 1);
        assert_eq!(
            beliefs[0].derived_at,
            t0() + chrono::Duration::minutes(30)
        );
    }

    #[test]
    fn test_hourly_window_boundaries() {
        let inside = Utc.with_ymd_and_hms(2023, 1, 1, 12, 59, 59).unwrap();
        let outside = Utc.with_ymd_and_hms(2023, 1, 1, 13, 0, 0).unwrap();
        assert_eq!(hourly_window(t0()), hourly_window(inside));
        assert_ne!(hourly_window(t0()), hourly_window(outside));
    }

    #[test]
    fn test_run_respects_feature_flag() {
        let aggregator = BeliefAggregator::default();
        let mut store = ObservationStore::new();
        store.store_observation(threat_obs("obs-a", "malware", 0.9)).unwrap();
        let flags = FeatureFlags::new();
        let clock = std::sync::Arc::new(crate::clock::FixedClock::starting_at(t0()));
        let mut audit = AuditLog::new(clock, "cell-local-00");

        let beliefs = aggregator.run(&ObservationFilter::default(), &mut store, &flags, &mut audit);
        assert!(beliefs.is_empty());
        assert_eq!(store.belief_count(), 0);
        assert_eq!(audit.by_kind(AuditEventKind::FeatureDisabled).len(), 1);
    }

    #[test]
    fn test_run_stores_and_audits() {
        let aggregator = BeliefAggregator::default();
        let mut store = ObservationStore::new();
        store.store_observation(threat_obs("obs-a", "malware", 0.9)).unwrap();
        store.store_observation(threat_obs("obs-b", "malware", 0.8)).unwrap();
        let flags = FeatureFlags::new();
        flags.set(Feature::BeliefAggregation, true);
        let clock = std::sync::Arc::new(crate::clock::FixedClock::starting_at(t0()));
        let mut audit = AuditLog::new(clock, "cell-local-00");

        let beliefs = aggregator.run(&ObservationFilter::default(), &mut store, &flags, &mut audit);
        assert_eq!(beliefs.len(), 1);
        assert_eq!(store.belief_count(), 1);
        assert_eq!(audit.by_kind(AuditEventKind::BeliefCreated).len(), 1);

        // Re-running the same derivation is idempotent.
        let again = aggregator.run(&ObservationFilter::default(), &mut store, &flags, &mut audit);
        assert!(again.is_empty());
        assert_eq!(store.belief_count(), 1);
    }
}
