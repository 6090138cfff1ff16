//! Federate identity records and their store.
//!
//! Identity records are immutable once published: every change is a
//! whole-record replacement, and the frequently touched `last_seen`
//! timestamp lives in a separate mutable index so replacement never races
//! with liveness tracking.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityStoreError {
    #[error("federate {0} already registered")]
    DuplicateId(String),

    #[error("federate {0} not found")]
    NotFound(String),

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
}

pub type Result<T> = std::result::Result<T, IdentityStoreError>;

/// Role a cell plays inside the federation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FederationRole {
    Member,
    Coordinator,
    Observer,
}

impl FederationRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            FederationRole::Member => "member",
            FederationRole::Coordinator => "coordinator",
            FederationRole::Observer => "observer",
        }
    }
}

/// Lifecycle status of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    Active,
    Inactive,
    Suspended,
    Decommissioned,
}

impl CellStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellStatus::Active => "active",
            CellStatus::Inactive => "inactive",
            CellStatus::Suspended => "suspended",
            CellStatus::Decommissioned => "decommissioned",
        }
    }
}

/// Identity record of one cell in the mesh.
///
/// `federate_id` follows `cell-<region>-<cluster>-<node>`. The public key
/// is raw Ed25519 base64; `key_id` is the stable hash of that base64
/// string. Records never mutate in place; replacement produces a new
/// record with a fresh `updated_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederateIdentity {
    pub schema_version: String,
    pub federate_id: String,
    pub public_key: String,
    pub key_id: String,
    pub certificate_chain: Vec<String>,
    pub federation_role: FederationRole,
    pub capabilities: Vec<String>,
    pub trust_score: f64,
    pub status: CellStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FederateIdentity {
    /// Validate structural constraints on a candidate record.
    pub fn validate(&self) -> Result<()> {
        validate_federate_id(&self.federate_id)?;
        if self.public_key.is_empty() {
            return Err(IdentityStoreError::InvalidIdentity(
                "public_key must not be empty".to_string(),
            ));
        }
        if self.key_id.is_empty() {
            return Err(IdentityStoreError::InvalidIdentity(
                "key_id must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.trust_score) {
            return Err(IdentityStoreError::InvalidIdentity(format!(
                "trust_score {} outside [0,1]",
                self.trust_score
            )));
        }
        Ok(())
    }
}

/// Check the `cell-<region>-<cluster>-<node>` identifier format.
pub fn validate_federate_id(federate_id: &str) -> Result<()> {
    let parts: Vec<&str> = federate_id.split('-').collect();
    if parts.len() < 4 || parts[0] != "cell" || parts.iter().any(|p| p.is_empty()) {
        return Err(IdentityStoreError::InvalidIdentity(format!(
            "federate_id {federate_id:?} must match cell-<region>-<cluster>-<node>"
        )));
    }
    Ok(())
}

/// In-memory federate identity store.
///
/// Primary map by `federate_id`, with the mutable `last_seen` index kept
/// apart from the immutable records.
#[derive(Debug, Default)]
pub struct FederateIdentityStore {
    identities: HashMap<String, FederateIdentity>,
    last_seen: HashMap<String, DateTime<Utc>>,
}

impl FederateIdentityStore {
    pub fn new() -> Self {
        FederateIdentityStore::default()
    }

    /// Register a new identity. Fails on duplicate `federate_id`.
    pub fn register(&mut self, identity: FederateIdentity) -> Result<()> {
        identity.validate()?;
        if self.identities.contains_key(&identity.federate_id) {
            return Err(IdentityStoreError::DuplicateId(identity.federate_id));
        }
        self.identities
            .insert(identity.federate_id.clone(), identity);
        Ok(())
    }

    /// Replace an existing identity record wholesale.
    pub fn replace(&mut self, identity: FederateIdentity) -> Result<()> {
        identity.validate()?;
        if !self.identities.contains_key(&identity.federate_id) {
            return Err(IdentityStoreError::NotFound(identity.federate_id));
        }
        self.identities
            .insert(identity.federate_id.clone(), identity);
        Ok(())
    }

    /// Explicit removal; the only way an identity is destroyed.
    pub fn remove(&mut self, federate_id: &str) -> Result<FederateIdentity> {
        self.last_seen.remove(federate_id);
        self.identities
            .remove(federate_id)
            .ok_or_else(|| IdentityStoreError::NotFound(federate_id.to_string()))
    }

    pub fn get(&self, federate_id: &str) -> Option<&FederateIdentity> {
        self.identities.get(federate_id)
    }

    /// Update the liveness index without touching the identity record.
    pub fn touch_last_seen(&mut self, federate_id: &str, now: DateTime<Utc>) -> Result<()> {
        if !self.identities.contains_key(federate_id) {
            return Err(IdentityStoreError::NotFound(federate_id.to_string()));
        }
        self.last_seen.insert(federate_id.to_string(), now);
        Ok(())
    }

    pub fn last_seen(&self, federate_id: &str) -> Option<DateTime<Utc>> {
        self.last_seen.get(federate_id).copied()
    }

    /// All identities, sorted by `(created_at, federate_id)`.
    pub fn list(&self) -> Vec<&FederateIdentity> {
        let mut all: Vec<&FederateIdentity> = self.identities.values().collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.federate_id.cmp(&b.federate_id))
        });
        all
    }

    pub fn list_by_status(&self, status: CellStatus) -> Vec<&FederateIdentity> {
        self.list()
            .into_iter()
            .filter(|i| i.status == status)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Status distribution for the statistics surface.
    pub fn status_counts(&self) -> HashMap<&'static str, usize> {
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for identity in self.identities.values() {
            *counts.entry(identity.status.as_str()).or_default() += 1;
        }
        counts
    }
}
