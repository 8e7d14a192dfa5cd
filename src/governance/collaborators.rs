// SPDX-License-Identifier: MIT
//
// Copyright (c) 2025 Noderr Protocol Foundation

//! External collaborators the engine calls into: identity and voting power, chain-local
//! supply, action execution and time.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

use crate::governance::types::{Amount, ProposalAction, ProposalId, VoterId};

/// Wallet / identity collaborator.
///
/// Trusted for weight figures; the engine still enforces one vote per voter and chain.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Voting power of `voter` at the proposal snapshot
    async fn voting_power(&self, voter: &str, snapshot: DateTime<Utc>) -> Result<Amount, String>;

    /// Identity of the account operating this engine
    async fn account_identity(&self) -> Result<VoterId, String>;
}

/// Chain-local token supply
#[async_trait]
pub trait SupplySource: Send + Sync {
    /// Supply recorded on this chain
    async fn local_supply(&self) -> Result<Amount, String>;

    /// Protocol-wide expected total, only meaningful on the hub
    async fn expected_total_supply(&self) -> Result<Amount, String>;
}

/// Applies proposal actions on the local chain in two phases
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Check the actions can be applied and reserve what they need
    async fn prepare(&self, proposal_id: &str, actions: &[ProposalAction]) -> Result<(), String>;

    /// Apply prepared actions
    async fn commit(&self, proposal_id: &str) -> Result<(), String>;

    /// Release a preparation
    async fn abort(&self, proposal_id: &str) -> Result<(), String>;
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock moved by hand, for tests and simulation
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write();
        *now = *now + by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.write() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Identity provider backed by a power table. Power changes can be scheduled so the
/// figure depends on the snapshot asked about.
#[derive(Debug, Default)]
pub struct StaticIdentityProvider {
    account: VoterId,
    powers: RwLock<HashMap<VoterId, Amount>>,
    changes: RwLock<HashMap<VoterId, BTreeMap<DateTime<Utc>, Amount>>>,
}

impl StaticIdentityProvider {
    pub fn new(account: impl Into<VoterId>) -> Self {
        Self {
            account: account.into(),
            powers: RwLock::new(HashMap::new()),
            changes: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_power(self, voter: impl Into<VoterId>, power: Amount) -> Self {
        self.set_power(voter, power);
        self
    }

    /// Power held at every point in time; clears scheduled changes
    pub fn set_power(&self, voter: impl Into<VoterId>, power: Amount) {
        let voter = voter.into();
        self.changes.write().remove(&voter);
        self.powers.write().insert(voter, power);
    }

    /// Power held from `from` onwards
    pub fn set_power_from(&self, voter: impl Into<VoterId>, power: Amount, from: DateTime<Utc>) {
        self.changes.write().entry(voter.into()).or_default().insert(from, power);
    }

    fn power_at(&self, voter: &str, at: DateTime<Utc>) -> Amount {
        let scheduled = self
            .changes
            .read()
            .get(voter)
            .and_then(|changes| changes.range(..=at).next_back().map(|(_, power)| *power));
        scheduled.unwrap_or_else(|| self.powers.read().get(voter).copied().unwrap_or(0))
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn voting_power(&self, voter: &str, snapshot: DateTime<Utc>) -> Result<Amount, String> {
        Ok(self.power_at(voter, snapshot))
    }

    async fn account_identity(&self) -> Result<VoterId, String> {
        Ok(self.account.clone())
    }
}

/// Supply source holding fixed figures
#[derive(Debug, Default)]
pub struct StaticSupplySource {
    local: RwLock<Amount>,
    expected_total: RwLock<Amount>,
}

impl StaticSupplySource {
    pub fn new(local: Amount, expected_total: Amount) -> Self {
        Self {
            local: RwLock::new(local),
            expected_total: RwLock::new(expected_total),
        }
    }

    pub fn set_local(&self, supply: Amount) {
        *self.local.write() = supply;
    }

    pub fn set_expected_total(&self, supply: Amount) {
        *self.expected_total.write() = supply;
    }
}

#[async_trait]
impl SupplySource for StaticSupplySource {
    async fn local_supply(&self) -> Result<Amount, String> {
        Ok(*self.local.read())
    }

    async fn expected_total_supply(&self) -> Result<Amount, String> {
        Ok(*self.expected_total.read())
    }
}

/// Executor that records what it was asked to do. Preparation fails while `fail_prepare`
/// is set.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    prepared: RwLock<HashMap<ProposalId, Vec<ProposalAction>>>,
    committed: RwLock<Vec<ProposalId>>,
    aborted: RwLock<Vec<ProposalId>>,
    fail_prepare: RwLock<Option<String>>,
    fail_commit: RwLock<Option<String>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_prepare(&self, reason: impl Into<String>) {
        *self.fail_prepare.write() = Some(reason.into());
    }

    pub fn fail_commit(&self, reason: impl Into<String>) {
        *self.fail_commit.write() = Some(reason.into());
    }

    pub fn clear_failures(&self) {
        *self.fail_prepare.write() = None;
        *self.fail_commit.write() = None;
    }

    pub fn is_prepared(&self, proposal_id: &str) -> bool {
        self.prepared.read().contains_key(proposal_id)
    }

    pub fn committed(&self) -> Vec<ProposalId> {
        self.committed.read().clone()
    }

    pub fn aborted(&self) -> Vec<ProposalId> {
        self.aborted.read().clone()
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn prepare(&self, proposal_id: &str, actions: &[ProposalAction]) -> Result<(), String> {
        if let Some(reason) = self.fail_prepare.read().clone() {
            return Err(reason);
        }
        self.prepared.write().insert(proposal_id.to_string(), actions.to_vec());
        Ok(())
    }

    async fn commit(&self, proposal_id: &str) -> Result<(), String> {
        if let Some(reason) = self.fail_commit.read().clone() {
            return Err(reason);
        }
        if self.prepared.write().remove(proposal_id).is_none() {
            return Err(format!("proposal {} was not prepared", proposal_id));
        }
        self.committed.write().push(proposal_id.to_string());
        Ok(())
    }

    async fn abort(&self, proposal_id: &str) -> Result<(), String> {
        self.prepared.write().remove(proposal_id);
        self.aborted.write().push(proposal_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::seconds(30));
        assert_eq!(clock.now(), start + Duration::seconds(30));
    }

    #[test]
    fn test_static_supply_source_updates() {
        let supply = StaticSupplySource::new(40, 100);
        supply.set_local(60);
        assert_eq!(tokio_test::block_on(supply.local_supply()).unwrap(), 60);
        assert_eq!(tokio_test::block_on(supply.expected_total_supply()).unwrap(), 100);
    }

    #[tokio::test]
    async fn test_static_identity_defaults_to_zero_power() {
        let identity = StaticIdentityProvider::new("me").with_power("alice", 500);
        assert_eq!(identity.voting_power("alice", Utc::now()).await.unwrap(), 500);
        assert_eq!(identity.voting_power("bob", Utc::now()).await.unwrap(), 0);
        assert_eq!(identity.account_identity().await.unwrap(), "me");
    }

    #[tokio::test]
    async fn test_scheduled_power_depends_on_snapshot() {
        let start = Utc::now();
        let identity = StaticIdentityProvider::new("me").with_power("bob", 10);
        identity.set_power_from("bob", 500, start + Duration::minutes(5));

        assert_eq!(identity.voting_power("bob", start).await.unwrap(), 10);
        assert_eq!(identity.voting_power("bob", start + Duration::minutes(5)).await.unwrap(), 500);

        identity.set_power("bob", 20);
        assert_eq!(identity.voting_power("bob", start + Duration::hours(1)).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_recording_executor_requires_prepare_before_commit() {
        let executor = RecordingExecutor::new();
        assert!(executor.commit("p-1").await.is_err());

        executor.prepare("p-1", &[ProposalAction::new(10, b"fee=5".to_vec())]).await.unwrap();
        assert!(executor.is_prepared("p-1"));
        executor.commit("p-1").await.unwrap();
        assert_eq!(executor.committed(), vec!["p-1".to_string()]);
    }
}
