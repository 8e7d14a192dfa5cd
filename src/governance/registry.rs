// SPDX-License-Identifier: MIT
//
// Copyright (c) 2025 Noderr Protocol Foundation

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ed25519_dalek::VerifyingKey;
use serde::{Serialize, Deserialize};
use tracing::{info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::governance::types::{Amount, ChainId, VerifierId};

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown chain: {0}")]
    UnknownChain(ChainId),

    #[error("Chain already registered: {0}")]
    DuplicateChain(ChainId),

    #[error("The hub chain {0} cannot be removed or replaced")]
    HubImmutable(ChainId),

    #[error("Security level {0} outside 1-4")]
    InvalidSecurityLevel(u8),

    #[error("Unknown verifier: {0}")]
    UnknownVerifier(VerifierId),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Attestation requirements for messages addressed to a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Level 1-4; each level demands another quarter of the enabled verifier set
    pub level: u8,
    /// Verifiers whose attestations count
    pub verifiers: BTreeSet<VerifierId>,
}

impl SecurityConfig {
    pub fn new(level: u8, verifiers: impl IntoIterator<Item = VerifierId>) -> Result<Self, RegistryError> {
        if !(1..=4).contains(&level) {
            return Err(RegistryError::InvalidSecurityLevel(level));
        }
        Ok(Self {
            level,
            verifiers: verifiers.into_iter().collect(),
        })
    }

    /// Minimum number of distinct valid attestations, `None` when no verifier is enabled.
    ///
    /// `ceil(enabled * level / 4)`, at least one. Level 4 demands every enabled verifier.
    pub fn required_attestations(&self) -> Option<usize> {
        let enabled = self.verifiers.len();
        if enabled == 0 {
            return None;
        }
        let level = usize::from(self.level.clamp(1, 4));
        Some(((enabled * level + 3) / 4).max(1))
    }

    pub fn accepts(&self, verifier: &str) -> bool {
        self.verifiers.contains(verifier)
    }
}

/// A participating chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainRecord {
    pub id: ChainId,
    pub name: String,
    pub is_hub: bool,
    pub security: SecurityConfig,
    /// Last supply reported by the chain
    pub local_supply: Option<Amount>,
    /// When the chain last answered a supply audit
    pub last_audit_at: Option<DateTime<Utc>>,
}

impl ChainRecord {
    pub fn new(id: ChainId, name: impl Into<String>, is_hub: bool, security: SecurityConfig) -> Self {
        Self {
            id,
            name: name.into(),
            is_hub,
            security,
            local_supply: None,
            last_audit_at: None,
        }
    }
}

/// Bounded catalog of participating chains and known verifiers.
///
/// Every per-chain computation in the engine iterates `chain_ids()`, never a numeric range.
#[derive(Debug)]
pub struct ChainRegistry {
    chains: DashMap<ChainId, ChainRecord>,
    verifiers: DashMap<VerifierId, VerifyingKey>,
    hub: ChainId,
}

impl ChainRegistry {
    /// Create a registry holding only the hub
    pub fn new(hub: ChainRecord) -> Self {
        let hub_id = hub.id;
        let chains = DashMap::new();
        chains.insert(hub_id, ChainRecord { is_hub: true, ..hub });
        Self {
            chains,
            verifiers: DashMap::new(),
            hub: hub_id,
        }
    }

    /// Build the registry from a validated configuration
    pub fn from_config(config: &EngineConfig) -> Result<Self, RegistryError> {
        config.validate()?;

        let hub_config = config
            .hub()
            .ok_or_else(|| ConfigError::Invalid("no hub chain configured".into()))?;
        let registry = Self::new(ChainRecord::new(
            hub_config.id,
            hub_config.name.clone(),
            true,
            SecurityConfig::new(hub_config.security_level, hub_config.verifiers.iter().cloned())?,
        ));

        for verifier in &config.verifiers {
            registry.register_verifier(verifier.id.clone(), verifier.verifying_key()?);
        }

        for chain in config.chains.iter().filter(|c| !c.hub) {
            registry.register(ChainRecord::new(
                chain.id,
                chain.name.clone(),
                false,
                SecurityConfig::new(chain.security_level, chain.verifiers.iter().cloned())?,
            ))?;
        }

        info!(
            "Chain registry initialised with {} chains (hub {})",
            registry.len(),
            registry.hub_id()
        );
        Ok(registry)
    }

    pub fn hub_id(&self) -> ChainId {
        self.hub
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn is_registered(&self, chain_id: ChainId) -> bool {
        self.chains.contains_key(&chain_id)
    }

    /// Snapshot of one chain record
    pub fn get(&self, chain_id: ChainId) -> Option<ChainRecord> {
        self.chains.get(&chain_id).map(|r| r.clone())
    }

    /// Registered chain ids in ascending order
    pub fn chain_ids(&self) -> Vec<ChainId> {
        let mut ids: Vec<ChainId> = self.chains.iter().map(|r| *r.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of all records in ascending id order
    pub fn records(&self) -> Vec<ChainRecord> {
        let mut records: Vec<ChainRecord> = self.chains.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Register a satellite chain
    pub fn register(&self, record: ChainRecord) -> Result<(), RegistryError> {
        use dashmap::mapref::entry::Entry;

        if record.is_hub || record.id == self.hub {
            return Err(RegistryError::HubImmutable(self.hub));
        }
        for verifier in &record.security.verifiers {
            if !self.verifiers.contains_key(verifier) {
                return Err(RegistryError::UnknownVerifier(verifier.clone()));
            }
        }

        match self.chains.entry(record.id) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateChain(record.id)),
            Entry::Vacant(slot) => {
                info!("Registered chain {} ({})", record.id, record.name);
                slot.insert(record);
                Ok(())
            }
        }
    }

    /// Remove a satellite chain
    pub fn deregister(&self, chain_id: ChainId) -> Result<ChainRecord, RegistryError> {
        if chain_id == self.hub {
            return Err(RegistryError::HubImmutable(self.hub));
        }
        let (_, record) = self
            .chains
            .remove(&chain_id)
            .ok_or(RegistryError::UnknownChain(chain_id))?;
        warn!("Deregistered chain {} ({})", chain_id, record.name);
        Ok(record)
    }

    pub fn register_verifier(&self, id: VerifierId, key: VerifyingKey) {
        self.verifiers.insert(id, key);
    }

    pub fn verifier_key(&self, id: &str) -> Option<VerifyingKey> {
        self.verifiers.get(id).map(|k| *k)
    }

    pub fn security(&self, chain_id: ChainId) -> Result<SecurityConfig, RegistryError> {
        self.chains
            .get(&chain_id)
            .map(|r| r.security.clone())
            .ok_or(RegistryError::UnknownChain(chain_id))
    }

    /// Replace the security configuration of a chain
    pub fn set_security(&self, chain_id: ChainId, security: SecurityConfig) -> Result<(), RegistryError> {
        if !(1..=4).contains(&security.level) {
            return Err(RegistryError::InvalidSecurityLevel(security.level));
        }
        for verifier in &security.verifiers {
            if !self.verifiers.contains_key(verifier) {
                return Err(RegistryError::UnknownVerifier(verifier.clone()));
            }
        }
        let mut record = self
            .chains
            .get_mut(&chain_id)
            .ok_or(RegistryError::UnknownChain(chain_id))?;
        if security.verifiers.is_empty() {
            warn!("All verifiers disabled for chain {}; inbound messages will be rejected", chain_id);
        }
        record.security = security;
        Ok(())
    }

    /// Store a supply figure reported by a chain
    pub fn record_supply(&self, chain_id: ChainId, supply: Amount, at: DateTime<Utc>) -> Result<(), RegistryError> {
        let mut record = self
            .chains
            .get_mut(&chain_id)
            .ok_or(RegistryError::UnknownChain(chain_id))?;
        record.local_supply = Some(supply);
        record.last_audit_at = Some(at);
        Ok(())
    }
}
