//! Observation and belief stores with deterministic listings.
//!
//! The observation store owns every observation and belief in the cell.
//! Cross-store references are by ID only. Listings are total orders keyed
//! by `(timestamp, id)` so replays and independent reads agree. The
//! metadata overlay on beliefs is the single sanctioned post-publication
//! edit and is only reachable through [`ObservationStore::overlay_belief_metadata`].

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::observation::{Belief, Observation, ObservationType};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate id {0}")]
    DuplicateId(String),

    #[error("{0} not found")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Filters for observation listings.
#[derive(Debug, Default, Clone)]
pub struct ObservationFilter {
    pub federate_id: Option<String>,
    pub correlation_id: Option<String>,
    pub observation_type: Option<ObservationType>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Filters for belief listings.
#[derive(Debug, Default, Clone)]
pub struct BeliefFilter {
    pub correlation_id: Option<String>,
    pub belief_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// In-memory store for observations and derived beliefs.
#[derive(Debug, Default)]
pub struct ObservationStore {
    observations: HashMap<String, Observation>,
    beliefs: HashMap<String, Belief>,
    used_nonces: HashSet<String>,
}

impl ObservationStore {
    pub fn new() -> Self {
        ObservationStore::default()
    }

    // ------------------------------------------------------------------
    // Observations
    // ------------------------------------------------------------------

    /// Insert an observation. Fails on duplicate `observation_id`.
    pub fn store_observation(&mut self, observation: Observation) -> Result<()> {
        if self.observations.contains_key(&observation.observation_id) {
            return Err(StoreError::DuplicateId(observation.observation_id));
        }
        self.observations
            .insert(observation.observation_id.clone(), observation);
        Ok(())
    }

    pub fn get_observation(&self, observation_id: &str) -> Option<&Observation> {
        self.observations.get(observation_id)
    }

    pub fn contains_observation(&self, observation_id: &str) -> bool {
        self.observations.contains_key(observation_id)
    }

    /// Observations matching `filter`, sorted by `(timestamp, id)`.
    pub fn list_observations(&self, filter: &ObservationFilter) -> Vec<&Observation> {
        let mut matching: Vec<&Observation> = self
            .observations
            .values()
            .filter(|obs| {
                filter
                    .federate_id
                    .as_ref()
                    .map_or(true, |f| &obs.source_federate_id == f)
                    && filter
                        .correlation_id
                        .as_ref()
                        .map_or(true, |c| obs.correlation_id.as_ref() == Some(c))
                    && filter
                        .observation_type
                        .map_or(true, |t| obs.observation_type == t)
                    && filter.since.map_or(true, |s| obs.timestamp_utc >= s)
            })
            .collect();
        matching.sort_by(|a, b| {
            a.timestamp_utc
                .cmp(&b.timestamp_utc)
                .then_with(|| a.observation_id.cmp(&b.observation_id))
        });
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        matching
    }

    // ------------------------------------------------------------------
    // Nonce guard (observation-envelope replay protection)
    // ------------------------------------------------------------------

    pub fn is_nonce_used(&self, nonce: &str) -> bool {
        self.used_nonces.contains(nonce)
    }

    pub fn mark_nonce_used(&mut self, nonce: &str) {
        self.used_nonces.insert(nonce.to_string());
    }

    // ------------------------------------------------------------------
    // Beliefs
    // ------------------------------------------------------------------

    /// Insert a belief. Fails on duplicate `belief_id`; requires every
    /// source observation to exist (belief provenance invariant).
    pub fn store_belief(&mut self, belief: Belief) -> Result<()> {
        if self.beliefs.contains_key(&belief.belief_id) {
            return Err(StoreError::DuplicateId(belief.belief_id));
        }
        if belief.source_observations.is_empty() {
            return Err(StoreError::NotFound(
                "belief with no source observations".to_string(),
            ));
        }
        for source in &belief.source_observations {
            if !self.observations.contains_key(source) {
                return Err(StoreError::NotFound(format!("source observation {source}")));
            }
        }
        self.beliefs.insert(belief.belief_id.clone(), belief);
        Ok(())
    }

    pub fn get_belief(&self, belief_id: &str) -> Option<&Belief> {
        self.beliefs.get(belief_id)
    }

    /// Beliefs matching `filter`, sorted by `(derived_at, id)`.
    pub fn list_beliefs(&self, filter: &BeliefFilter) -> Vec<&Belief> {
        let mut matching: Vec<&Belief> = self
            .beliefs
            .values()
            .filter(|belief| {
                filter
                    .correlation_id
                    .as_ref()
                    .map_or(true, |c| &belief.correlation_id == c)
                    && filter
                        .belief_type
                        .as_ref()
                        .map_or(true, |t| &belief.belief_type == t)
                    && filter.since.map_or(true, |s| belief.derived_at >= s)
            })
            .collect();
        matching.sort_by(|a, b| {
            a.derived_at
                .cmp(&b.derived_at)
                .then_with(|| a.belief_id.cmp(&b.belief_id))
        });
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        matching
    }

    /// Overlay belief metadata with an arbitration decision.
    ///
    /// Belief identity does not change; the record is replaced with the
    /// merged metadata, an optional confidence overwrite, and the deciding
    /// `arbitration_id` tag. This is the only post-publication edit path.
    pub fn overlay_belief_metadata(
        &mut self,
        belief_id: &str,
        entries: &[(String, Value)],
        confidence_override: Option<f64>,
        arbitration_id: &str,
    ) -> Result<()> {
        let belief = self
            .beliefs
            .get_mut(belief_id)
            .ok_or_else(|| StoreError::NotFound(format!("belief {belief_id}")))?;

        for (key, value) in entries {
            belief.metadata.insert(key.clone(), value.clone());
        }
        if let Some(confidence) = confidence_override {
            belief.confidence = confidence.clamp(0.0, 1.0);
        }
        belief.metadata.insert(
            "arbitration_id".to_string(),
            Value::String(arbitration_id.to_string()),
        );
        if !belief.conflicts.contains(&arbitration_id.to_string()) {
            belief.conflicts.push(arbitration_id.to_string());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance and statistics
    // ------------------------------------------------------------------

    /// Drop observations older than `max_age`. Beliefs referencing removed
    /// observations are kept; provenance checks apply at insert time only.
    pub fn cleanup_expired(&mut self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let cutoff = now - max_age;
        let before = self.observations.len();
        self.observations
            .retain(|_, obs| obs.timestamp_utc >= cutoff);
        before - self.observations.len()
    }

    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    pub fn belief_count(&self) -> usize {
        self.beliefs.len()
    }

    /// Observation counts by type for the statistics surface.
    pub fn observation_type_counts(&self) -> HashMap<&'static str, usize> {
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for obs in self.observations.values() {
            *counts.entry(obs.observation_type.as_str()).or_default() += 1;
        }
        counts
    }
}
