//! Feature-flag registry for the V2 subsystems.
//!
//! Every V2 behavior defaults to off and is individually togglable. The
//! registry is an injected dependency, never global state; services receive
//! a shared handle and consult it at each public entry point. A disabled
//! subsystem refuses with `feature_disabled` and emits a single diagnostic
//! audit record on the first refusal.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

/// The individually gated V2 subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    FederationIdentity,
    ObservationIngest,
    BeliefAggregation,
    ConflictDetection,
    Arbitration,
    Containment,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::FederationIdentity => "federation_identity",
            Feature::ObservationIngest => "observation_ingest",
            Feature::BeliefAggregation => "belief_aggregation",
            Feature::ConflictDetection => "conflict_detection",
            Feature::Arbitration => "arbitration",
            Feature::Containment => "containment",
        }
    }

    pub fn all() -> [Feature; 6] {
        [
            Feature::FederationIdentity,
            Feature::ObservationIngest,
            Feature::BeliefAggregation,
            Feature::ConflictDetection,
            Feature::Arbitration,
            Feature::Containment,
        ]
    }
}

#[derive(Debug, Default)]
struct FlagState {
    enabled: HashSet<Feature>,
    diagnosed: HashSet<Feature>,
}

/// Injected feature-flag registry. All flags default to off.
#[derive(Debug, Default)]
pub struct FeatureFlags {
    state: RwLock<FlagState>,
}

impl FeatureFlags {
    /// New registry with every feature disabled.
    pub fn new() -> Self {
        FeatureFlags::default()
    }

    /// New registry with every feature enabled (test and demo convenience).
    pub fn all_enabled() -> Self {
        let flags = FeatureFlags::new();
        for feature in Feature::all() {
            flags.set(feature, true);
        }
        flags
    }

    pub fn enabled(&self, feature: Feature) -> bool {
        self.state.read().enabled.contains(&feature)
    }

    pub fn set(&self, feature: Feature, on: bool) {
        let mut state = self.state.write();
        if on {
            state.enabled.insert(feature);
        } else {
            state.enabled.remove(&feature);
        }
        // Re-arm the first-refusal diagnostic when a feature is re-enabled.
        if on {
            state.diagnosed.remove(&feature);
        }
    }

    /// Record a refusal for a disabled feature.
    ///
    /// Returns true exactly once per disabled period; callers emit their
    /// single diagnostic audit record when this returns true.
    pub fn note_disabled_refusal(&self, feature: Feature) -> bool {
        let mut state = self.state.write();
        if state.enabled.contains(&feature) {
            return false;
        }
        state.diagnosed.insert(feature)
    }
}

/// Shared registry handle.
pub type SharedFlags = Arc<FeatureFlags>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_off() {
        let flags = FeatureFlags::new();
        for feature in Feature::all() {
            assert!(!flags.enabled(feature), "{} should default off", feature.as_str());
        }
    }

    #[test]
    fn test_individual_toggle() {
        let flags = FeatureFlags::new();
        flags.set(Feature::ObservationIngest, true);
        assert!(flags.enabled(Feature::ObservationIngest));
        assert!(!flags.enabled(Feature::BeliefAggregation));

        flags.set(Feature::ObservationIngest, false);
        assert!(!flags.enabled(Feature::ObservationIngest));
    }

    #[test]
    fn test_first_refusal_diagnostic_once() {
        let flags = FeatureFlags::new();
        assert!(flags.note_disabled_refusal(Feature::Arbitration));
        assert!(!flags.note_disabled_refusal(Feature::Arbitration));
        assert!(!flags.note_disabled_refusal(Feature::Arbitration));
    }

    #[test]
    fn test_diagnostic_rearms_after_reenable() {
        let flags = FeatureFlags::new();
        assert!(flags.note_disabled_refusal(Feature::Containment));

        flags.set(Feature::Containment, true);
        assert!(!flags.note_disabled_refusal(Feature::Containment));

        flags.set(Feature::Containment, false);
        assert!(flags.note_disabled_refusal(Feature::Containment));
    }
}
