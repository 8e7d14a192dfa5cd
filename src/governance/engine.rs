// SPDX-License-Identifier: MIT
//
// Copyright (c) 2025 Noderr Protocol Foundation

//! Engine facade: wires the registry, relay, aggregator, lifecycle, coordinator and auditor
//! for one chain and drives their deadlines from a single scheduler tick.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::governance::audit::{AuditError, SupplyAudit, SupplyAuditor, SupplyReporter};
use crate::governance::collaborators::{ActionExecutor, Clock, IdentityProvider, SupplySource, SystemClock};
use crate::governance::execution::{ExecutionCoordinator, ExecutionError, ExecutionParticipant};
use crate::governance::finality::ExecutionRecord;
use crate::governance::lifecycle::{ProposalError, ProposalLifecycle};
use crate::governance::message::{CrossChainMessage, MessageError, MessageKind, VoteRelayPayload};
use crate::governance::registry::{ChainRegistry, RegistryError};
use crate::governance::relay::{AdmissionResult, MessageRelay};
use crate::governance::transport::{DeliveryHandle, Outbox, RetryStats, Transport};
use crate::governance::types::{
    Amount, ChainId, Proposal, ProposalDraft, ProposalId, ProposalState, SupportType, Tally,
};
use crate::governance::vote_tracker::{ChainVoteStats, VoteAggregator, VoteError, VoteReceipt};
use crate::storage::{FingerprintStore, MemoryFingerprintStore, StoreError};
use crate::telemetry::TelemetryReporter;

/// Engine-level error
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error(transparent)]
    Proposal(#[from] ProposalError),

    #[error(transparent)]
    Vote(#[from] VoteError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("Identity provider error: {0}")]
    Identity(String),

    #[error("Operation only available on the hub; this engine runs on chain {0}")]
    NotHub(ChainId),

    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),
}

/// Result of casting a vote through the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteSubmission {
    /// Recorded directly on the hub
    Recorded(VoteReceipt),
    /// Forwarded to the hub; `None` when the send is waiting in the retry buffer
    Relayed(Option<DeliveryHandle>),
}

/// What one scheduler pass did
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub state_changes: Vec<(ProposalId, ProposalState)>,
    pub queued: Vec<ProposalId>,
    pub executions_started: Vec<ProposalId>,
    pub executions_timed_out: Vec<ProposalId>,
    pub expired: Vec<ProposalId>,
    pub audits_finalized: Vec<String>,
    pub audit_started: Option<String>,
    pub fingerprints_pruned: usize,
    pub executions_pruned: usize,
    pub retries: RetryStats,
}

/// Builder for [`GovernanceEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    transport: Option<Arc<dyn Transport>>,
    identity: Option<Arc<dyn IdentityProvider>>,
    supply: Option<Arc<dyn SupplySource>>,
    executor: Option<Arc<dyn ActionExecutor>>,
    store: Option<Arc<dyn FingerprintStore>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn supply_source(mut self, supply: Arc<dyn SupplySource>) -> Self {
        self.supply = Some(supply);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Defaults to an in-memory store, or Redis when configured with the `distributed` feature
    pub fn fingerprint_store(mut self, store: Arc<dyn FingerprintStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to the system clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub async fn build(self) -> Result<GovernanceEngine, EngineError> {
        let config = self.config;
        config.validate()?;

        let transport = self.transport.ok_or(EngineError::MissingCollaborator("transport"))?;
        let identity = self.identity.ok_or(EngineError::MissingCollaborator("identity provider"))?;
        let supply = self.supply.ok_or(EngineError::MissingCollaborator("supply source"))?;
        let executor = self.executor.ok_or(EngineError::MissingCollaborator("action executor"))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = match self.store {
            Some(store) => store,
            None => default_store(&config).await?,
        };

        let local_chain = config.local_chain;
        let registry = Arc::new(ChainRegistry::from_config(&config)?);
        let telemetry = Arc::new(TelemetryReporter::new(local_chain));

        let relay = Arc::new(MessageRelay::new(
            local_chain,
            registry.clone(),
            store,
            telemetry.clone(),
            config.relay.retention(),
        ));
        let outbox = Arc::new(Outbox::new(
            local_chain,
            transport,
            registry.clone(),
            telemetry.clone(),
            config.relay.max_send_retries,
        ));
        let votes = Arc::new(VoteAggregator::new(
            local_chain,
            registry.clone(),
            identity.clone(),
            telemetry.clone(),
        ));
        let lifecycle = Arc::new(ProposalLifecycle::new(
            local_chain,
            registry.clone(),
            identity.clone(),
            votes.clone(),
            telemetry.clone(),
            config.governance.clone(),
        ));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            lifecycle.clone(),
            registry.clone(),
            outbox.clone(),
            telemetry.clone(),
            config.execution.clone(),
            config.governance.max_execution_attempts,
        ));
        let participant = Arc::new(ExecutionParticipant::new(
            local_chain,
            registry.clone(),
            executor,
            outbox.clone(),
            telemetry.clone(),
        ));
        let auditor = Arc::new(SupplyAuditor::new(
            registry.clone(),
            supply.clone(),
            outbox.clone(),
            telemetry.clone(),
            config.audit.clone(),
        ));
        let reporter = Arc::new(SupplyReporter::new(registry.clone(), supply, outbox.clone()));

        // Every chain can be an execution target, including the hub
        relay.register_handler(MessageKind::ExecutionDirective, participant.clone());
        if registry.hub_id() == local_chain {
            relay.register_handler(MessageKind::VoteRelay, votes.clone());
            relay.register_handler(MessageKind::ExecutionAck, coordinator.clone());
            relay.register_handler(MessageKind::SupplyResponse, auditor.clone());
        } else {
            relay.register_handler(MessageKind::SupplyRequest, reporter.clone());
        }

        info!(
            "Governance engine ready on chain {} ({}), {} chains registered",
            local_chain,
            if registry.hub_id() == local_chain { "hub" } else { "satellite" },
            registry.len()
        );

        Ok(GovernanceEngine {
            config,
            clock,
            identity,
            registry,
            relay,
            outbox,
            votes,
            lifecycle,
            coordinator,
            participant,
            auditor,
            last_periodic_audit: Mutex::new(None),
        })
    }
}

#[cfg(feature = "distributed")]
async fn default_store(config: &EngineConfig) -> Result<Arc<dyn FingerprintStore>, EngineError> {
    if let Some(redis) = &config.redis {
        let store = crate::redis::RedisFingerprintStore::connect(
            redis.clone(),
            config.relay.fingerprint_retention_secs,
        )
        .await?;
        return Ok(Arc::new(store));
    }
    Ok(Arc::new(MemoryFingerprintStore::new()))
}

#[cfg(not(feature = "distributed"))]
async fn default_store(config: &EngineConfig) -> Result<Arc<dyn FingerprintStore>, EngineError> {
    if config.redis.is_some() {
        warn!("Redis configured but the `distributed` feature is disabled; using in-memory fingerprints");
    }
    Ok(Arc::new(MemoryFingerprintStore::new()))
}

/// One chain's governance engine
pub struct GovernanceEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    identity: Arc<dyn IdentityProvider>,
    registry: Arc<ChainRegistry>,
    relay: Arc<MessageRelay>,
    outbox: Arc<Outbox>,
    votes: Arc<VoteAggregator>,
    lifecycle: Arc<ProposalLifecycle>,
    coordinator: Arc<ExecutionCoordinator>,
    participant: Arc<ExecutionParticipant>,
    auditor: Arc<SupplyAuditor>,
    last_periodic_audit: Mutex<Option<DateTime<Utc>>>,
}

impl GovernanceEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            transport: None,
            identity: None,
            supply: None,
            executor: None,
            store: None,
            clock: None,
        }
    }

    pub fn local_chain(&self) -> ChainId {
        self.config.local_chain
    }

    pub fn is_hub(&self) -> bool {
        self.registry.hub_id() == self.config.local_chain
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ChainRegistry> {
        &self.registry
    }

    pub fn participant(&self) -> &Arc<ExecutionParticipant> {
        &self.participant
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn require_hub(&self) -> Result<(), EngineError> {
        if self.is_hub() {
            Ok(())
        } else {
            Err(EngineError::NotHub(self.config.local_chain))
        }
    }

    /// Inbound entry point for every cross-chain message
    pub async fn submit(&self, message: CrossChainMessage) -> AdmissionResult {
        self.relay.submit(message, self.clock.now()).await
    }

    /// Create a proposal on the hub
    pub async fn propose(&self, proposer: &str, draft: ProposalDraft) -> Result<Proposal, EngineError> {
        self.require_hub()?;
        Ok(self.lifecycle.propose(proposer, draft, self.clock.now()).await?)
    }

    /// Cast a vote against the proposal snapshot `snapshot_at`. On the hub it is recorded;
    /// on a satellite the voter's power at the snapshot is checked and the vote is relayed.
    pub async fn cast_vote(
        &self,
        proposal_id: &str,
        snapshot_at: DateTime<Utc>,
        voter: &str,
        support: SupportType,
        weight: Amount,
        reason: Option<String>,
    ) -> Result<VoteSubmission, EngineError> {
        let now = self.clock.now();
        if self.is_hub() {
            self.votes.check_snapshot(proposal_id, snapshot_at)?;
            let receipt = self
                .votes
                .record_local_vote(proposal_id, voter, support, weight, reason, now)
                .await?;
            return Ok(VoteSubmission::Recorded(receipt));
        }

        if weight == 0 {
            return Err(VoteError::ZeroWeight.into());
        }
        let power = self
            .identity
            .voting_power(voter, snapshot_at)
            .await
            .map_err(EngineError::Identity)?;
        if weight > power {
            return Err(VoteError::WeightExceedsPower { weight, power }.into());
        }

        let payload = VoteRelayPayload {
            proposal_id: proposal_id.to_string(),
            snapshot_at,
            voter: voter.to_string(),
            support,
            weight,
            reason,
        };
        let handle = self
            .outbox
            .post(MessageKind::VoteRelay, self.registry.hub_id(), &payload)
            .await?;
        debug!("Relayed vote of {} on {} to the hub", voter, proposal_id);
        Ok(VoteSubmission::Relayed(handle))
    }

    /// Vote with the full power the operating account held at the snapshot
    pub async fn cast_account_vote(
        &self,
        proposal_id: &str,
        snapshot_at: DateTime<Utc>,
        support: SupportType,
        reason: Option<String>,
    ) -> Result<VoteSubmission, EngineError> {
        let voter = self.identity.account_identity().await.map_err(EngineError::Identity)?;
        let power = self
            .identity
            .voting_power(&voter, snapshot_at)
            .await
            .map_err(EngineError::Identity)?;
        self.cast_vote(proposal_id, snapshot_at, &voter, support, power, reason).await
    }

    pub async fn queue(&self, proposal_id: &str) -> Result<Proposal, EngineError> {
        self.require_hub()?;
        Ok(self.lifecycle.queue(proposal_id, self.clock.now())?)
    }

    /// Cancel a proposal, aborting an execution that has not decided to commit
    pub async fn cancel(&self, proposal_id: &str, caller: &str) -> Result<Proposal, EngineError> {
        self.require_hub()?;
        let now = self.clock.now();
        let proposal = self
            .lifecycle
            .get(proposal_id)
            .ok_or_else(|| ProposalError::ProposalNotFound(proposal_id.to_string()))?;
        if proposal.proposer != caller && !self.lifecycle.is_guardian(caller) {
            return Err(ProposalError::Unauthorized(caller.to_string()).into());
        }

        if proposal.state == ProposalState::Queued {
            self.coordinator.abort_if_uncommitted(proposal_id, now).await?;
        }
        Ok(self.lifecycle.cancel(proposal_id, caller, now)?)
    }

    /// Start an execution attempt now instead of waiting for the scheduler
    pub async fn execute(&self, proposal_id: &str) -> Result<ExecutionRecord, EngineError> {
        self.require_hub()?;
        Ok(self.coordinator.begin(proposal_id, self.clock.now()).await?)
    }

    pub fn get_proposal(&self, proposal_id: &str) -> Option<Proposal> {
        self.lifecycle.get(proposal_id)
    }

    pub fn get_tally(&self, proposal_id: &str) -> Result<Tally, EngineError> {
        self.lifecycle
            .get(proposal_id)
            .map(|p| p.tally)
            .ok_or_else(|| ProposalError::ProposalNotFound(proposal_id.to_string()).into())
    }

    pub fn chain_breakdown(&self, proposal_id: &str) -> Result<Vec<ChainVoteStats>, EngineError> {
        Ok(self.votes.chain_breakdown(proposal_id)?)
    }

    pub fn get_execution_status(&self, proposal_id: &str) -> Option<ExecutionRecord> {
        self.coordinator.get(proposal_id)
    }

    pub async fn initiate_audit(&self) -> Result<String, EngineError> {
        self.require_hub()?;
        Ok(self.auditor.initiate_audit(self.clock.now()).await?)
    }

    pub fn finalize_audit(&self, audit_id: &str) -> Result<SupplyAudit, EngineError> {
        Ok(self.auditor.finalize_audit(audit_id, self.clock.now())?)
    }

    pub fn reconcile(&self, audit_id: &str, operator: &str, note: &str) -> Result<SupplyAudit, EngineError> {
        Ok(self.auditor.reconcile(audit_id, operator, note, self.clock.now())?)
    }

    pub fn get_latest_audit(&self) -> Option<SupplyAudit> {
        self.auditor.latest_audit()
    }

    pub fn audit_history(&self, limit: usize) -> Vec<SupplyAudit> {
        self.auditor.history(limit)
    }

    /// Outbound messages waiting for a retry
    pub fn pending_sends(&self) -> usize {
        self.outbox.pending_retries()
    }

    /// Run every deadline-driven step once
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        if self.is_hub() {
            report.state_changes = self.lifecycle.refresh_all(now);

            if self.config.governance.auto_queue {
                for proposal_id in self.lifecycle.ids_in_state(ProposalState::Succeeded) {
                    match self.lifecycle.queue(&proposal_id, now) {
                        Ok(_) => report.queued.push(proposal_id),
                        Err(e) => warn!("Could not queue proposal {}: {}", proposal_id, e),
                    }
                }
            }

            for proposal in self.lifecycle.executable(now) {
                if !self.coordinator.can_attempt(&proposal.id) {
                    continue;
                }
                match self.coordinator.begin(&proposal.id, now).await {
                    Ok(_) => report.executions_started.push(proposal.id),
                    Err(e) => warn!("Could not start execution of {}: {}", proposal.id, e),
                }
            }

            report.executions_timed_out = self.coordinator.check_timeouts(now).await;
            report.expired = self.expire_overdue(now).await;
            report.executions_pruned = self.coordinator.prune_finished(now);

            for audit_id in self.auditor.due_audits(now) {
                match self.auditor.finalize_audit(&audit_id, now) {
                    Ok(_) => report.audits_finalized.push(audit_id),
                    Err(e) => warn!("Could not finalize audit {}: {}", audit_id, e),
                }
            }
            report.audit_started = self.start_periodic_audit(now).await;
        }

        match self.relay.prune(now).await {
            Ok(pruned) => report.fingerprints_pruned = pruned,
            Err(e) => error!("Fingerprint pruning failed: {}", e),
        }
        report.retries = self.outbox.process_retries().await;
        report
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Vec<ProposalId> {
        let mut expired = Vec::new();
        for proposal_id in self.lifecycle.overdue(now) {
            if let Some(record) = self.coordinator.get(&proposal_id) {
                if record.commit_decided() && !record.is_finished() {
                    debug!("Proposal {} past its window but committing; not expiring", proposal_id);
                    continue;
                }
            }
            if let Err(e) = self.coordinator.abort_if_uncommitted(&proposal_id, now).await {
                warn!("Could not abort execution of {} before expiry: {}", proposal_id, e);
                continue;
            }
            match self.lifecycle.expire(&proposal_id, now) {
                Ok(()) => expired.push(proposal_id),
                Err(e) => warn!("Could not expire proposal {}: {}", proposal_id, e),
            }
        }
        expired
    }

    async fn start_periodic_audit(&self, now: DateTime<Utc>) -> Option<String> {
        let interval = self.config.audit.interval()?;
        let last = *self.last_periodic_audit.lock();
        if last.map(|at| now - at < interval).unwrap_or(false) {
            return None;
        }
        match self.auditor.initiate_audit(now).await {
            Ok(audit_id) => {
                *self.last_periodic_audit.lock() = Some(now);
                Some(audit_id)
            }
            Err(e) => {
                error!("Periodic supply audit failed to start: {}", e);
                None
            }
        }
    }

    /// Run [`tick`](Self::tick) on an interval using the engine clock
    pub fn spawn_scheduler(self: &Arc<Self>, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let report = engine.tick(engine.clock.now()).await;
                if !report.state_changes.is_empty() || !report.expired.is_empty() {
                    debug!("Scheduler tick: {:?}", report);
                }
            }
        })
    }
}
