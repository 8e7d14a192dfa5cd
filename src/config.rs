// SPDX-License-Identifier: MIT
//
// Copyright (c) 2025 Noderr Protocol Foundation
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

//! Engine configuration, layered from an optional file and `OMNIGOV__*` environment
//! variables.

use std::collections::HashSet;
use std::path::Path;

use chrono::Duration;
use ed25519_dalek::VerifyingKey;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::warn;

use crate::governance::types::{Amount, ChainId, VerifierId, VoterId};
use crate::redis::RedisConfig;
use crate::telemetry::TelemetryConfig;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Upper bound for any configured period, ten years
pub const MAX_PERIOD_SECS: u64 = 10 * 365 * 24 * 3600;

/// A participating chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub id: ChainId,
    pub name: String,
    /// Chain of record for proposal finality; exactly one chain is the hub
    #[serde(default)]
    pub hub: bool,
    /// Security level 1-4
    pub security_level: u8,
    /// Verifiers whose attestations are accepted for messages addressed to this chain
    #[serde(default)]
    pub verifiers: Vec<VerifierId>,
}

/// A known verifier and its ed25519 public key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    pub id: VerifierId,
    /// Hex-encoded 32-byte ed25519 public key
    pub public_key: String,
}

impl VerifierConfig {
    pub fn verifying_key(&self) -> Result<VerifyingKey, ConfigError> {
        let bytes = hex::decode(self.public_key.trim_start_matches("0x"))
            .map_err(|e| ConfigError::Invalid(format!("verifier {}: bad hex key: {}", self.id, e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            ConfigError::Invalid(format!("verifier {}: public key must be 32 bytes", self.id))
        })?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| ConfigError::Invalid(format!("verifier {}: {}", self.id, e)))
    }
}

/// Proposal and voting parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Delay between creation and the start of voting
    pub voting_delay_secs: u64,
    /// Length of the voting window
    pub voting_period_secs: u64,
    /// Mandatory delay between queueing and execution
    pub execution_delay_secs: u64,
    /// Window after the delay in which execution must complete
    pub execution_timeout_secs: u64,
    /// Minimum turnout captured into each new proposal
    pub quorum_votes: u64,
    /// Minimum voting power needed to create a proposal
    pub proposal_threshold: u64,
    /// Execution attempts allowed before the proposal is left to expire
    pub max_execution_attempts: u32,
    /// Queue succeeded proposals automatically on tick
    pub auto_queue: bool,
    /// Identities allowed to cancel any proposal
    pub guardians: Vec<VoterId>,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            voting_delay_secs: 60,
            voting_period_secs: 3 * 24 * 3600,
            execution_delay_secs: 2 * 24 * 3600,
            execution_timeout_secs: 14 * 24 * 3600,
            quorum_votes: 1_000_000,
            proposal_threshold: 0,
            max_execution_attempts: 3,
            auto_queue: true,
            guardians: Vec::new(),
        }
    }
}

impl GovernanceConfig {
    pub fn voting_delay(&self) -> Duration {
        secs(self.voting_delay_secs)
    }

    pub fn voting_period(&self) -> Duration {
        secs(self.voting_period_secs)
    }

    pub fn execution_delay(&self) -> Duration {
        secs(self.execution_delay_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        secs(self.execution_timeout_secs)
    }

    pub fn quorum(&self) -> Amount {
        Amount::from(self.quorum_votes)
    }

    pub fn threshold(&self) -> Amount {
        Amount::from(self.proposal_threshold)
    }
}

/// Message relay parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How long admitted fingerprints are remembered
    pub fingerprint_retention_secs: u64,
    /// Send attempts for an outbound message before it is dropped
    pub max_send_retries: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            fingerprint_retention_secs: 30 * 24 * 3600,
            max_send_retries: 5,
        }
    }
}

impl RelayConfig {
    pub fn retention(&self) -> Duration {
        secs(self.fingerprint_retention_secs)
    }
}

/// Two-phase execution parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Time allowed for every target chain to acknowledge Prepared
    pub prepare_timeout_secs: u64,
    /// Time allowed for Committed acks after each commit round
    pub commit_timeout_secs: u64,
    /// Commit directives re-sent to a chain before it is marked Failed
    pub max_commit_retries: u32,
    /// How long finished records of settled proposals are kept
    pub record_retention_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            prepare_timeout_secs: 600,
            commit_timeout_secs: 600,
            max_commit_retries: 3,
            record_retention_secs: 30 * 24 * 3600,
        }
    }
}

impl ExecutionConfig {
    pub fn prepare_timeout(&self) -> Duration {
        secs(self.prepare_timeout_secs)
    }

    pub fn commit_timeout(&self) -> Duration {
        secs(self.commit_timeout_secs)
    }

    pub fn record_retention(&self) -> Duration {
        secs(self.record_retention_secs)
    }
}

/// Supply audit parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Deadline for supply responses after an audit starts
    pub response_timeout_secs: u64,
    /// Start an audit on this interval when set
    pub interval_secs: Option<u64>,
    /// Identities authorized to reconcile mismatched audits
    pub operators: Vec<VoterId>,
    /// Settled audits kept in history; pending and mismatched ones are never dropped
    pub history_limit: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: 300,
            interval_secs: None,
            operators: Vec::new(),
            history_limit: 256,
        }
    }
}

impl AuditConfig {
    pub fn response_timeout(&self) -> Duration {
        secs(self.response_timeout_secs)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval_secs.map(secs)
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Chain this engine instance runs on
    pub local_chain: ChainId,
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub verifiers: Vec<VerifierConfig>,
    #[serde(default)]
    pub governance: GovernanceConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

impl EngineConfig {
    /// Load from an optional file, then `OMNIGOV__*` environment overrides, then validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("OMNIGOV")
                .prefix_separator("__")
                .separator("__"),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// The same configuration seen from another chain
    pub fn for_chain(&self, chain_id: ChainId) -> Self {
        Self {
            local_chain: chain_id,
            ..self.clone()
        }
    }

    pub fn hub(&self) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.hub)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chains.is_empty() {
            return Err(ConfigError::Invalid("at least one chain must be configured".into()));
        }

        let mut ids = HashSet::new();
        for chain in &self.chains {
            if !ids.insert(chain.id) {
                return Err(ConfigError::Invalid(format!("duplicate chain id {}", chain.id)));
            }
        }

        let hubs = self.chains.iter().filter(|c| c.hub).count();
        if hubs != 1 {
            return Err(ConfigError::Invalid(format!("exactly one hub chain required, found {}", hubs)));
        }

        if !ids.contains(&self.local_chain) {
            return Err(ConfigError::Invalid(format!(
                "local chain {} is not in the chain list",
                self.local_chain
            )));
        }

        let mut verifier_ids = HashSet::new();
        for verifier in &self.verifiers {
            if !verifier_ids.insert(verifier.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate verifier {}", verifier.id)));
            }
            verifier.verifying_key()?;
        }

        for chain in &self.chains {
            if !(1..=4).contains(&chain.security_level) {
                return Err(ConfigError::Invalid(format!(
                    "chain {}: security level {} outside 1-4",
                    chain.id, chain.security_level
                )));
            }
            for verifier in &chain.verifiers {
                if !verifier_ids.contains(verifier.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "chain {}: unknown verifier {}",
                        chain.id, verifier
                    )));
                }
            }
            if chain.verifiers.is_empty() {
                warn!("Chain {} has no enabled verifiers and will reject every inbound message", chain.id);
            }
        }

        let gov = &self.governance;
        if gov.quorum_votes == 0 {
            return Err(ConfigError::Invalid("governance.quorum_votes must be positive".into()));
        }
        if gov.voting_period_secs == 0 {
            return Err(ConfigError::Invalid("governance.voting_period_secs must be positive".into()));
        }
        if gov.max_execution_attempts == 0 {
            return Err(ConfigError::Invalid("governance.max_execution_attempts must be at least 1".into()));
        }

        let periods = [
            ("governance.voting_delay_secs", gov.voting_delay_secs),
            ("governance.voting_period_secs", gov.voting_period_secs),
            ("governance.execution_delay_secs", gov.execution_delay_secs),
            ("governance.execution_timeout_secs", gov.execution_timeout_secs),
            ("relay.fingerprint_retention_secs", self.relay.fingerprint_retention_secs),
            ("execution.prepare_timeout_secs", self.execution.prepare_timeout_secs),
            ("execution.commit_timeout_secs", self.execution.commit_timeout_secs),
            ("execution.record_retention_secs", self.execution.record_retention_secs),
            ("audit.response_timeout_secs", self.audit.response_timeout_secs),
            ("audit.interval_secs", self.audit.interval_secs.unwrap_or(0)),
        ];
        for (name, value) in periods {
            if value > MAX_PERIOD_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{} ({}) exceeds the maximum of {} seconds",
                    name, value, MAX_PERIOD_SECS
                )));
            }
        }

        let window = gov.voting_delay_secs.saturating_add(gov.voting_period_secs);
        if self.relay.fingerprint_retention_secs < window {
            return Err(ConfigError::Invalid(format!(
                "relay.fingerprint_retention_secs ({}) must cover the voting window ({})",
                self.relay.fingerprint_retention_secs, window
            )));
        }

        if self.execution.prepare_timeout_secs == 0 || self.execution.commit_timeout_secs == 0 {
            return Err(ConfigError::Invalid("execution timeouts must be positive".into()));
        }
        if self.audit.history_limit == 0 {
            return Err(ConfigError::Invalid("audit.history_limit must be at least 1".into()));
        }
        if self.audit.response_timeout_secs == 0 {
            return Err(ConfigError::Invalid("audit.response_timeout_secs must be positive".into()));
        }

        Ok(())
    }
}

/// Seconds to a duration, capped at [`MAX_PERIOD_SECS`]
fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value.min(MAX_PERIOD_SECS)).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
local_chain = 1

[[chains]]
id = 1
name = "hub"
hub = true
security_level = 2
verifiers = ["verifier-a", "verifier-b"]

[[chains]]
id = 10
name = "satellite"
security_level = 1
verifiers = ["verifier-a"]

[[verifiers]]
id = "verifier-a"
public_key = "18f0be3417b8e7b462ffb4c174129b427c6fe04ff84b7def8003d3f6ce7e5836"

[[verifiers]]
id = "verifier-b"
public_key = "48ed03f41eeeb5c1ecd325b9aaf195e0720afb0bb3128a8a892d9d8f5557b10d"

[governance]
quorum_votes = 1000000
voting_period_secs = 3600
guardians = ["guardian"]
"#;

    fn sample() -> EngineConfig {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        EngineConfig::load(Some(file.path())).unwrap()
    }

    #[test]
    fn test_load_from_toml_with_defaults() {
        let config = sample();
        assert_eq!(config.local_chain, 1);
        assert_eq!(config.chains.len(), 2);
        assert_eq!(config.hub().map(|c| c.id), Some(1));
        assert_eq!(config.governance.quorum(), 1_000_000);
        assert_eq!(config.governance.guardians, vec!["guardian".to_string()]);
        // Untouched sections fall back to defaults
        assert_eq!(config.execution.max_commit_retries, 3);
        assert_eq!(config.relay.max_send_retries, 5);
    }

    #[test]
    fn test_rejects_two_hubs() {
        let mut config = sample();
        config.chains[1].hub = true;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_out_of_range_security_level() {
        let mut config = sample();
        config.chains[0].security_level = 5;
        assert!(config.validate().is_err());
        config.chains[0].security_level = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_verifier() {
        let mut config = sample();
        config.chains[1].verifiers.push("verifier-z".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_short_fingerprint_retention() {
        let mut config = sample();
        config.relay.fingerprint_retention_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_periods_beyond_ten_years() {
        let mut config = sample();
        config.governance.voting_period_secs = 1_000_000_000_000_000;
        config.relay.fingerprint_retention_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = sample();
        config.governance.execution_timeout_secs = MAX_PERIOD_SECS + 1;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.audit.interval_secs = Some(u64::MAX);
        assert!(config.validate().is_err());
        assert_eq!(config.audit.interval(), Some(Duration::seconds(MAX_PERIOD_SECS as i64)));
    }

    #[test]
    fn test_chain_without_verifiers_is_allowed() {
        let mut config = sample();
        config.chains[1].verifiers.clear();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_for_chain_only_changes_local_chain() {
        let config = sample();
        let satellite = config.for_chain(10);
        assert_eq!(satellite.local_chain, 10);
        assert_eq!(satellite.chains.len(), config.chains.len());
        assert!(satellite.validate().is_ok());
    }
}
