// SPDX-License-Identifier: MIT
//
// Copyright (c) 2025 Noderr Protocol Foundation

//! Atomic multi-chain execution: the hub-side two-phase coordinator and the participant
//! that answers its directives on every target chain.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;
use crate::governance::collaborators::ActionExecutor;
use crate::governance::finality::{ChainExecutionStatus, ExecutionOutcome, ExecutionPhase, ExecutionRecord};
use crate::governance::lifecycle::{ProposalError, ProposalLifecycle};
use crate::governance::message::{
    AckStatus, AdmittedMessage, DirectivePhase, ExecutionAckPayload, ExecutionDirectivePayload, MessageKind,
};
use crate::governance::registry::ChainRegistry;
use crate::governance::relay::{DispatchError, MessageHandler};
use crate::governance::transport::Outbox;
use crate::governance::types::{ChainId, ProposalId, ProposalState};
use crate::telemetry::TelemetryReporter;
use crate::telemetry_data;

/// Execution error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Proposal not found: {0}")]
    ProposalNotFound(ProposalId),

    #[error("Proposal {proposal_id} is {state}, not queued")]
    NotQueued { proposal_id: ProposalId, state: ProposalState },

    #[error("Proposal {0} is still in its execution delay")]
    NotDue(ProposalId),

    #[error("Execution window for proposal {0} has closed")]
    WindowClosed(ProposalId),

    #[error("Execution of proposal {0} already in progress")]
    AlreadyInProgress(ProposalId),

    #[error("Proposal {proposal_id} used all {attempts} execution attempts")]
    AttemptsExhausted { proposal_id: ProposalId, attempts: u32 },

    #[error("Execution of proposal {0} needs manual reconciliation")]
    NeedsReconciliation(ProposalId),

    #[error("No execution on record for proposal {0}")]
    UnknownExecution(ProposalId),

    #[error("Chain {chain_id} is not a target of proposal {proposal_id}")]
    NotATarget { proposal_id: ProposalId, chain_id: ChainId },

    #[error("Out-of-order ack from chain {chain_id} on proposal {proposal_id}: chain is {status}")]
    OutOfOrderAck {
        proposal_id: ProposalId,
        chain_id: ChainId,
        status: String,
    },

    #[error("Commit already decided for proposal {0}")]
    CommitInProgress(ProposalId),

    #[error("Directive from chain {0}, which is not the hub")]
    UnexpectedSource(ChainId),

    #[error("Malformed execution message: {0}")]
    Decode(String),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] ProposalError),
}

/// A directive waiting to be sent, built under a record lock and sent after it is released
type Directive = (ChainId, ExecutionDirectivePayload);

fn directive(proposal_id: &str, attempt: u32, phase: DirectivePhase) -> ExecutionDirectivePayload {
    ExecutionDirectivePayload {
        proposal_id: proposal_id.to_string(),
        attempt,
        phase,
        actions: Vec::new(),
    }
}

/// Drives prepare, commit or abort across every target chain of a queued proposal.
///
/// No directive is sent while a record is locked; state changes are computed first, then
/// the resulting directives are dispatched.
pub struct ExecutionCoordinator {
    lifecycle: Arc<ProposalLifecycle>,
    registry: Arc<ChainRegistry>,
    outbox: Arc<Outbox>,
    telemetry: Arc<TelemetryReporter>,
    config: ExecutionConfig,
    /// Execution attempts allowed per proposal
    max_attempts: u32,
    records: DashMap<ProposalId, ExecutionRecord>,
}

impl ExecutionCoordinator {
    pub fn new(
        lifecycle: Arc<ProposalLifecycle>,
        registry: Arc<ChainRegistry>,
        outbox: Arc<Outbox>,
        telemetry: Arc<TelemetryReporter>,
        config: ExecutionConfig,
        max_attempts: u32,
    ) -> Self {
        Self {
            lifecycle,
            registry,
            outbox,
            telemetry,
            config,
            max_attempts,
            records: DashMap::new(),
        }
    }

    /// Latest execution record of a proposal
    pub fn get(&self, proposal_id: &str) -> Option<ExecutionRecord> {
        self.records.get(proposal_id).map(|r| r.clone())
    }

    /// Whether a new attempt may be started for a proposal
    pub fn can_attempt(&self, proposal_id: &str) -> bool {
        match self.records.get(proposal_id) {
            None => true,
            Some(record) => {
                record.is_finished()
                    && record.outcome == ExecutionOutcome::Aborted
                    && !record.needs_reconciliation
                    && record.attempt < self.max_attempts
            }
        }
    }

    /// Start an execution attempt: send Prepare directives to every target chain
    pub async fn begin(&self, proposal_id: &str, now: DateTime<Utc>) -> Result<ExecutionRecord, ExecutionError> {
        use dashmap::mapref::entry::Entry;

        let proposal = self
            .lifecycle
            .get(proposal_id)
            .ok_or_else(|| ExecutionError::ProposalNotFound(proposal_id.to_string()))?;
        if proposal.state != ProposalState::Queued {
            return Err(ExecutionError::NotQueued {
                proposal_id: proposal_id.to_string(),
                state: proposal.state,
            });
        }
        if !proposal.eta.map(|eta| now >= eta).unwrap_or(false) {
            return Err(ExecutionError::NotDue(proposal_id.to_string()));
        }
        if proposal.execution_deadline.map(|d| now >= d).unwrap_or(true) {
            return Err(ExecutionError::WindowClosed(proposal_id.to_string()));
        }

        let targets = proposal.target_chains();
        let (record, directives) = {
            let attempt = match self.records.get(proposal_id) {
                None => 1,
                Some(previous) => {
                    if !previous.is_finished() || previous.outcome == ExecutionOutcome::Success {
                        return Err(ExecutionError::AlreadyInProgress(proposal_id.to_string()));
                    }
                    if previous.needs_reconciliation {
                        return Err(ExecutionError::NeedsReconciliation(proposal_id.to_string()));
                    }
                    if previous.attempt >= self.max_attempts {
                        return Err(ExecutionError::AttemptsExhausted {
                            proposal_id: proposal_id.to_string(),
                            attempts: previous.attempt,
                        });
                    }
                    previous.attempt + 1
                }
            };

            let mut record = ExecutionRecord::new(
                proposal_id.to_string(),
                attempt,
                targets.iter().copied(),
                now,
                now + self.config.prepare_timeout(),
            );

            let unregistered: Vec<ChainId> = targets
                .iter()
                .copied()
                .filter(|c| !self.registry.is_registered(*c))
                .collect();
            let directives = if unregistered.is_empty() {
                targets
                    .iter()
                    .map(|chain_id| {
                        let mut payload = directive(proposal_id, attempt, DirectivePhase::Prepare);
                        payload.actions = proposal.actions_for(*chain_id);
                        (*chain_id, payload)
                    })
                    .collect()
            } else {
                for chain_id in unregistered {
                    record.set_status(
                        chain_id,
                        ChainExecutionStatus::Failed {
                            reason: "chain not registered".into(),
                        },
                        now,
                    );
                }
                // Nothing was prepared yet, so nothing needs an Abort
                record.finish(ExecutionOutcome::Aborted, now);
                Vec::new()
            };

            match self.records.entry(proposal_id.to_string()) {
                Entry::Occupied(mut slot) => {
                    // Another caller may have started an attempt since the check above
                    if slot.get().attempt >= attempt {
                        return Err(ExecutionError::AlreadyInProgress(proposal_id.to_string()));
                    }
                    slot.insert(record.clone());
                }
                Entry::Vacant(slot) => {
                    slot.insert(record.clone());
                }
            }
            (record, directives)
        };

        info!(
            "Execution attempt {} of proposal {} started on chains {:?}",
            record.attempt, proposal_id, targets
        );
        self.telemetry.report_custom(
            "execution_started",
            telemetry_data! {
                "proposal_id" => proposal_id,
                "attempt" => record.attempt,
                "targets" => targets,
                "outcome" => record.outcome.to_string(),
            },
        );
        self.dispatch(directives).await;
        Ok(record)
    }

    /// Apply an execution ack from a target chain
    pub async fn on_ack(&self, message: &AdmittedMessage, now: DateTime<Utc>) -> Result<(), ExecutionError> {
        let ack: ExecutionAckPayload = message
            .decode(MessageKind::ExecutionAck)
            .map_err(|e| ExecutionError::Decode(e.to_string()))?;
        let chain_id = message.source_chain();

        let (directives, succeeded) = {
            let mut record = self
                .records
                .get_mut(&ack.proposal_id)
                .ok_or_else(|| ExecutionError::UnknownExecution(ack.proposal_id.clone()))?;

            if ack.attempt != record.attempt {
                debug!(
                    "Stale {} ack from chain {} for attempt {} of {} (current {})",
                    ack.status, chain_id, ack.attempt, ack.proposal_id, record.attempt
                );
                // A chain still holding an old preparation must release it
                let release = if ack.status == AckStatus::Prepared {
                    vec![(chain_id, directive(&ack.proposal_id, ack.attempt, DirectivePhase::Abort))]
                } else {
                    Vec::new()
                };
                (release, false)
            } else {
                let current = record.status(chain_id).cloned().ok_or_else(|| ExecutionError::NotATarget {
                    proposal_id: ack.proposal_id.clone(),
                    chain_id,
                })?;
                debug!("{} ack from chain {} for {} (chain was {})", ack.status, chain_id, ack.proposal_id, current);
                self.apply_ack(&mut record, chain_id, current, ack.status, now)?
            }
        };

        self.dispatch(directives).await;
        if succeeded {
            self.complete(&ack.proposal_id, now);
        }
        Ok(())
    }

    fn apply_ack(
        &self,
        record: &mut ExecutionRecord,
        chain_id: ChainId,
        current: ChainExecutionStatus,
        status: AckStatus,
        now: DateTime<Utc>,
    ) -> Result<(Vec<Directive>, bool), ExecutionError> {
        use ChainExecutionStatus as S;

        let mut directives = Vec::new();
        let mut succeeded = false;

        match status {
            AckStatus::Prepared => match current {
                S::Pending if record.phase == ExecutionPhase::Preparing => {
                    record.set_status(chain_id, S::Prepared, now);
                    if record.all_prepared() {
                        directives = self.decide_commit(record, now);
                    }
                }
                S::Prepared | S::Committed => {}
                _ => {
                    // Prepared after the attempt was aborted
                    record.set_status(chain_id, S::Aborted, now);
                    directives.push((chain_id, directive(&record.proposal_id, record.attempt, DirectivePhase::Abort)));
                }
            },
            AckStatus::PrepareFailed { reason } => {
                if record.phase == ExecutionPhase::Preparing && matches!(current, S::Pending | S::Prepared) {
                    record.set_status(chain_id, S::Failed { reason: reason.clone() }, now);
                    directives = self.decide_abort(record, &format!("chain {} failed to prepare: {}", chain_id, reason), now);
                } else {
                    debug!("Ignoring prepare failure from chain {} on {}: {}", chain_id, record.proposal_id, reason);
                }
            }
            AckStatus::Committed => match current {
                S::Prepared if record.commit_decided() => {
                    record.set_status(chain_id, S::Committed, now);
                    succeeded = self.settle(record, now);
                }
                S::Failed { .. } if record.commit_decided() => {
                    warn!("Chain {} committed {} after being marked failed", chain_id, record.proposal_id);
                    record.set_status(chain_id, S::Committed, now);
                    succeeded = self.settle(record, now);
                }
                S::Committed => {}
                other => {
                    return Err(ExecutionError::OutOfOrderAck {
                        proposal_id: record.proposal_id.clone(),
                        chain_id,
                        status: other.to_string(),
                    });
                }
            },
            AckStatus::CommitFailed { reason } => {
                if current == S::Prepared && record.commit_decided() {
                    directives = self.commit_failure(record, chain_id, &reason, now);
                    succeeded = self.settle(record, now);
                } else {
                    debug!("Ignoring commit failure from chain {} on {}: {}", chain_id, record.proposal_id, reason);
                }
            }
            AckStatus::Aborted => {
                if !record.commit_decided() && matches!(current, S::Pending | S::Prepared) {
                    record.set_status(chain_id, S::Aborted, now);
                }
            }
        }

        Ok((directives, succeeded))
    }

    /// Forget finished records of settled proposals once the retention period has passed.
    /// Records awaiting reconciliation are kept.
    pub fn prune_finished(&self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = now.checked_sub_signed(self.config.record_retention()) else {
            return 0;
        };
        let stale: Vec<ProposalId> = self
            .records
            .iter()
            .filter(|r| r.is_finished() && !r.needs_reconciliation)
            .filter(|r| r.finished_at.map(|at| at <= cutoff).unwrap_or(false))
            .map(|r| r.proposal_id.clone())
            .collect();

        let mut pruned = 0;
        for proposal_id in stale {
            let settled = self
                .lifecycle
                .state(&proposal_id)
                .map(|state| state.is_terminal())
                .unwrap_or(true);
            if settled && self.records.remove(&proposal_id).is_some() {
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!("Pruned {} finished execution records", pruned);
        }
        pruned
    }

    /// Enforce prepare and commit deadlines and drop deregistered chains
    pub async fn check_timeouts(&self, now: DateTime<Utc>) -> Vec<ProposalId> {
        let open: Vec<ProposalId> = self
            .records
            .iter()
            .filter(|r| !r.is_finished())
            .map(|r| r.proposal_id.clone())
            .collect();

        let mut changed = Vec::new();
        for proposal_id in open {
            let (directives, succeeded) = {
                let Some(mut record) = self.records.get_mut(&proposal_id) else {
                    continue;
                };
                if record.is_finished() {
                    continue;
                }
                let before = record.clone();
                let result = self.expire_record(&mut record, now);
                if *record != before {
                    changed.push(proposal_id.clone());
                }
                result
            };
            self.dispatch(directives).await;
            if succeeded {
                self.complete(&proposal_id, now);
            }
        }
        changed
    }

    fn expire_record(&self, record: &mut ExecutionRecord, now: DateTime<Utc>) -> (Vec<Directive>, bool) {
        use ChainExecutionStatus as S;

        let gone: Vec<ChainId> = record
            .chains_where(|s| matches!(s, S::Pending | S::Prepared))
            .into_iter()
            .filter(|c| !self.registry.is_registered(*c))
            .collect();
        for chain_id in &gone {
            warn!("Chain {} left the registry during execution of {}", chain_id, record.proposal_id);
            record.set_status(*chain_id, S::Failed { reason: "chain deregistered".into() }, now);
            if record.commit_decided() {
                record.needs_reconciliation = true;
            }
        }

        match record.phase {
            ExecutionPhase::Preparing => {
                if !gone.is_empty() {
                    return (self.decide_abort(record, "target chain deregistered", now), false);
                }
                if now >= record.prepare_deadline {
                    for chain_id in record.chains_where(|s| *s == S::Pending) {
                        record.set_status(chain_id, S::Failed { reason: "prepare timed out".into() }, now);
                    }
                    return (self.decide_abort(record, "prepare deadline passed", now), false);
                }
                (Vec::new(), false)
            }
            ExecutionPhase::Committing => {
                let mut directives = Vec::new();
                if record.commit_deadline.map(|d| now >= d).unwrap_or(false) {
                    for chain_id in record.chains_where(|s| *s == S::Prepared) {
                        directives.extend(self.commit_failure(record, chain_id, "commit timed out", now));
                    }
                    record.commit_deadline = Some(now + self.config.commit_timeout());
                }
                let succeeded = self.settle(record, now);
                (directives, succeeded)
            }
            ExecutionPhase::Finished => (Vec::new(), false),
        }
    }

    /// Abort an attempt that has not decided to commit. Returns whether anything was aborted.
    pub async fn abort_if_uncommitted(&self, proposal_id: &str, now: DateTime<Utc>) -> Result<bool, ExecutionError> {
        let directives = {
            let Some(mut record) = self.records.get_mut(proposal_id) else {
                return Ok(false);
            };
            if record.commit_decided() {
                return Err(ExecutionError::CommitInProgress(proposal_id.to_string()));
            }
            if record.is_finished() {
                return Ok(false);
            }
            self.decide_abort(&mut record, "proposal cancelled", now)
        };
        self.dispatch(directives).await;
        Ok(true)
    }

    fn decide_commit(&self, record: &mut ExecutionRecord, now: DateTime<Utc>) -> Vec<Directive> {
        record.phase = ExecutionPhase::Committing;
        record.commit_deadline = Some(now + self.config.commit_timeout());
        for chain in record.chains.values_mut() {
            chain.commit_attempts = 1;
        }

        info!("All chains prepared {}; committing attempt {}", record.proposal_id, record.attempt);
        self.telemetry.report_custom(
            "execution_commit_decided",
            telemetry_data! {
                "proposal_id" => record.proposal_id,
                "attempt" => record.attempt,
            },
        );
        record
            .chains
            .keys()
            .map(|chain_id| (*chain_id, directive(&record.proposal_id, record.attempt, DirectivePhase::Commit)))
            .collect()
    }

    /// Abort every chain that prepared or may still be preparing
    fn decide_abort(&self, record: &mut ExecutionRecord, reason: &str, now: DateTime<Utc>) -> Vec<Directive> {
        let targets = record.chains_where(|s| {
            matches!(s, ChainExecutionStatus::Prepared | ChainExecutionStatus::Pending)
        });
        for chain_id in &targets {
            record.set_status(*chain_id, ChainExecutionStatus::Aborted, now);
        }
        record.diagnostics.push(reason.to_string());
        record.finish(ExecutionOutcome::Aborted, now);

        warn!(
            "Aborting attempt {} of {}: {}; abort sent to {:?}",
            record.attempt, record.proposal_id, reason, targets
        );
        self.telemetry.report_custom(
            "execution_aborted",
            telemetry_data! {
                "proposal_id" => record.proposal_id,
                "attempt" => record.attempt,
                "reason" => reason,
                "aborted_chains" => targets,
            },
        );
        targets
            .into_iter()
            .map(|chain_id| (chain_id, directive(&record.proposal_id, record.attempt, DirectivePhase::Abort)))
            .collect()
    }

    /// A prepared chain did not commit: resend Commit, or give up on it once retries run out
    fn commit_failure(
        &self,
        record: &mut ExecutionRecord,
        chain_id: ChainId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Vec<Directive> {
        let attempts = record.chains.get(&chain_id).map(|c| c.commit_attempts).unwrap_or(0);
        if attempts < self.config.max_commit_retries {
            if let Some(chain) = record.chains.get_mut(&chain_id) {
                chain.commit_attempts += 1;
                chain.updated_at = now;
            }
            warn!(
                "Chain {} did not commit {} ({}); retry {}",
                chain_id, record.proposal_id, reason, attempts
            );
            return vec![(chain_id, directive(&record.proposal_id, record.attempt, DirectivePhase::Commit))];
        }

        error!(
            "Chain {} failed to commit {} after {} attempts: {}; manual reconciliation required",
            chain_id, record.proposal_id, attempts, reason
        );
        record.set_status(chain_id, ChainExecutionStatus::Failed { reason: reason.to_string() }, now);
        record.needs_reconciliation = true;
        self.telemetry.report_custom(
            "execution_needs_reconciliation",
            telemetry_data! {
                "proposal_id" => record.proposal_id,
                "attempt" => record.attempt,
                "chain_id" => chain_id,
                "reason" => reason,
            },
        );
        Vec::new()
    }

    /// Finish a committing record once every chain has answered; true on fresh success
    fn settle(&self, record: &mut ExecutionRecord, now: DateTime<Utc>) -> bool {
        if record.all_committed() {
            if record.outcome == ExecutionOutcome::Success {
                return false;
            }
            record.needs_reconciliation = false;
            record.finish(ExecutionOutcome::Success, now);
            return true;
        }

        let answered = record.chains.values().all(|c| {
            matches!(c.status, ChainExecutionStatus::Committed | ChainExecutionStatus::Failed { .. })
        });
        if record.commit_decided() && answered && !record.is_finished() {
            record.finish(ExecutionOutcome::Aborted, now);
        }
        false
    }

    fn complete(&self, proposal_id: &str, now: DateTime<Utc>) {
        info!("Proposal {} committed on every target chain", proposal_id);
        self.telemetry.report_custom(
            "execution_succeeded",
            telemetry_data! { "proposal_id" => proposal_id },
        );
        if let Err(e) = self.lifecycle.mark_executed(proposal_id, now) {
            error!("Proposal {} committed everywhere but could not be marked executed: {}", proposal_id, e);
        }
    }

    /// Fan directives out to their chains concurrently
    async fn dispatch(&self, directives: Vec<Directive>) {
        let sends = directives.into_iter().map(|(chain_id, payload)| async move {
            match self.outbox.post(MessageKind::ExecutionDirective, chain_id, &payload).await {
                Ok(Some(_)) => debug!("Sent {} for {} to chain {}", payload.phase, payload.proposal_id, chain_id),
                Ok(None) => warn!("{} for {} to chain {} waiting for retry", payload.phase, payload.proposal_id, chain_id),
                Err(e) => error!("Failed to encode {} directive for {}: {}", payload.phase, payload.proposal_id, e),
            }
        });
        join_all(sends).await;
    }
}

#[async_trait]
impl MessageHandler for ExecutionCoordinator {
    async fn handle(&self, message: &AdmittedMessage, now: DateTime<Utc>) -> Result<(), DispatchError> {
        self.on_ack(message, now)
            .await
            .map_err(|e| DispatchError::Refused(e.to_string()))
    }
}

/// Local state of a proposal on a participating chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    Prepared,
    Committed,
    Aborted,
}

/// Answers execution directives from the hub on a target chain
pub struct ExecutionParticipant {
    local_chain: ChainId,
    registry: Arc<ChainRegistry>,
    executor: Arc<dyn ActionExecutor>,
    outbox: Arc<Outbox>,
    telemetry: Arc<TelemetryReporter>,
    /// Latest attempt seen per proposal and its local state
    entries: DashMap<ProposalId, (u32, ParticipantState)>,
}

impl ExecutionParticipant {
    pub fn new(
        local_chain: ChainId,
        registry: Arc<ChainRegistry>,
        executor: Arc<dyn ActionExecutor>,
        outbox: Arc<Outbox>,
        telemetry: Arc<TelemetryReporter>,
    ) -> Self {
        Self {
            local_chain,
            registry,
            executor,
            outbox,
            telemetry,
            entries: DashMap::new(),
        }
    }

    pub fn state(&self, proposal_id: &str) -> Option<ParticipantState> {
        self.entries.get(proposal_id).map(|e| e.1)
    }

    /// Apply a directive and send the ack back to the coordinator
    pub async fn handle_directive(&self, message: &AdmittedMessage) -> Result<AckStatus, ExecutionError> {
        let coordinator = message.source_chain();
        if coordinator != self.registry.hub_id() {
            return Err(ExecutionError::UnexpectedSource(coordinator));
        }
        let directive: ExecutionDirectivePayload = message
            .decode(MessageKind::ExecutionDirective)
            .map_err(|e| ExecutionError::Decode(e.to_string()))?;

        let status = self.apply(&directive).await;
        info!(
            "Chain {} answered {} of {} (attempt {}): {}",
            self.local_chain, directive.phase, directive.proposal_id, directive.attempt, status
        );
        self.telemetry.report_custom(
            "execution_directive_handled",
            telemetry_data! {
                "proposal_id" => directive.proposal_id,
                "attempt" => directive.attempt,
                "phase" => directive.phase.to_string(),
                "status" => status.to_string(),
            },
        );

        let ack = ExecutionAckPayload {
            proposal_id: directive.proposal_id.clone(),
            attempt: directive.attempt,
            status: status.clone(),
        };
        if let Err(e) = self.outbox.post(MessageKind::ExecutionAck, coordinator, &ack).await {
            error!("Failed to encode ack for {}: {}", directive.proposal_id, e);
        }
        Ok(status)
    }

    async fn apply(&self, directive: &ExecutionDirectivePayload) -> AckStatus {
        let id = &directive.proposal_id;
        let attempt = directive.attempt;
        let entry = self.entries.get(id).map(|e| *e);

        match directive.phase {
            DirectivePhase::Prepare => {
                match entry {
                    Some((_, ParticipantState::Committed)) => {
                        return AckStatus::PrepareFailed {
                            reason: "proposal already executed".into(),
                        };
                    }
                    Some((a, ParticipantState::Prepared)) if a == attempt => return AckStatus::Prepared,
                    Some((_, ParticipantState::Prepared)) => {
                        // Leftover preparation from an earlier attempt
                        if let Err(e) = self.executor.abort(id).await {
                            warn!("Failed to release earlier preparation of {}: {}", id, e);
                        }
                    }
                    _ => {}
                }

                if let Some(action) = directive.actions.iter().find(|a| a.target_chain != self.local_chain) {
                    return AckStatus::PrepareFailed {
                        reason: format!("action addressed to chain {}", action.target_chain),
                    };
                }
                match self.executor.prepare(id, &directive.actions).await {
                    Ok(()) => {
                        self.entries.insert(id.clone(), (attempt, ParticipantState::Prepared));
                        AckStatus::Prepared
                    }
                    Err(reason) => {
                        self.entries.remove(id);
                        AckStatus::PrepareFailed { reason }
                    }
                }
            }
            DirectivePhase::Commit => match entry {
                Some((_, ParticipantState::Committed)) => AckStatus::Committed,
                Some((a, ParticipantState::Prepared)) if a == attempt => match self.executor.commit(id).await {
                    Ok(()) => {
                        self.entries.insert(id.clone(), (attempt, ParticipantState::Committed));
                        AckStatus::Committed
                    }
                    Err(reason) => AckStatus::CommitFailed { reason },
                },
                _ => AckStatus::CommitFailed {
                    reason: "not prepared for this attempt".into(),
                },
            },
            DirectivePhase::Abort => match entry {
                Some((_, ParticipantState::Committed)) => {
                    error!("Abort received for {} after it was committed on chain {}", id, self.local_chain);
                    AckStatus::Committed
                }
                Some((a, ParticipantState::Prepared)) if a == attempt => {
                    if let Err(e) = self.executor.abort(id).await {
                        warn!("Executor failed to release {}: {}", id, e);
                    }
                    self.entries.insert(id.clone(), (attempt, ParticipantState::Aborted));
                    AckStatus::Aborted
                }
                _ => AckStatus::Aborted,
            },
        }
    }
}

#[async_trait]
impl MessageHandler for ExecutionParticipant {
    async fn handle(&self, message: &AdmittedMessage, _now: DateTime<Utc>) -> Result<(), DispatchError> {
        self.handle_directive(message)
            .await
            .map(|_| ())
            .map_err(|e| DispatchError::Refused(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GovernanceConfig;
    use crate::governance::collaborators::{IdentityProvider, RecordingExecutor, StaticIdentityProvider};
    use crate::governance::message::CrossChainMessage;
    use crate::governance::registry::{ChainRecord, SecurityConfig};
    use crate::governance::transport::MockTransport;
    use crate::governance::types::{ProposalAction, ProposalDraft, SupportType};
    use crate::governance::vote_tracker::VoteAggregator;
    use chrono::Duration;

    const HUB: ChainId = 1;

    struct Fixture {
        registry: Arc<ChainRegistry>,
        lifecycle: Arc<ProposalLifecycle>,
        transport: Arc<MockTransport>,
        coordinator: ExecutionCoordinator,
        proposal_id: ProposalId,
        now: DateTime<Utc>,
    }

    /// Hub 1 with satellites 2 and 3, and a queued proposal targeting all three
    async fn fixture(max_attempts: u32) -> Fixture {
        let open = || SecurityConfig::new(1, Vec::<String>::new()).unwrap();
        let registry = ChainRegistry::new(ChainRecord::new(HUB, "hub", true, open()));
        registry.register(ChainRecord::new(2, "two", false, open())).unwrap();
        registry.register(ChainRecord::new(3, "three", false, open())).unwrap();
        let registry = Arc::new(registry);

        let identity: Arc<dyn IdentityProvider> =
            Arc::new(StaticIdentityProvider::new("operator").with_power("alice", 10));
        let telemetry = Arc::new(TelemetryReporter::new(HUB));
        let votes = Arc::new(VoteAggregator::new(HUB, registry.clone(), identity.clone(), telemetry.clone()));
        let governance = GovernanceConfig {
            voting_delay_secs: 0,
            voting_period_secs: 60,
            execution_delay_secs: 0,
            execution_timeout_secs: 86_400,
            quorum_votes: 1,
            ..GovernanceConfig::default()
        };
        let lifecycle = Arc::new(ProposalLifecycle::new(
            HUB,
            registry.clone(),
            identity,
            votes.clone(),
            telemetry.clone(),
            governance,
        ));

        let now = Utc::now();
        let draft = ProposalDraft {
            title: "Fee change".into(),
            description: String::new(),
            actions: vec![
                ProposalAction::new(1, b"fee=5".to_vec()),
                ProposalAction::new(2, b"fee=5".to_vec()),
                ProposalAction::new(3, b"fee=5".to_vec()),
            ],
        };
        let proposal_id = lifecycle.propose("alice", draft, now).await.unwrap().id;
        votes.record_local_vote(&proposal_id, "alice", SupportType::For, 10, None, now).await.unwrap();
        let closed = now + Duration::seconds(60);
        lifecycle.refresh(&proposal_id, closed).unwrap();
        lifecycle.queue(&proposal_id, closed).unwrap();

        let transport = Arc::new(MockTransport::new());
        let outbox = Arc::new(Outbox::new(HUB, transport.clone(), registry.clone(), telemetry.clone(), 3));
        let coordinator = ExecutionCoordinator::new(
            lifecycle.clone(),
            registry.clone(),
            outbox,
            telemetry,
            ExecutionConfig {
                prepare_timeout_secs: 60,
                commit_timeout_secs: 60,
                max_commit_retries: 2,
                record_retention_secs: 3600,
            },
            max_attempts,
        );
        Fixture {
            registry,
            lifecycle,
            transport,
            coordinator,
            proposal_id,
            now: closed,
        }
    }

    fn ack(chain_id: ChainId, proposal_id: &str, attempt: u32, status: AckStatus) -> AdmittedMessage {
        let payload = ExecutionAckPayload {
            proposal_id: proposal_id.to_string(),
            attempt,
            status,
        };
        let message = CrossChainMessage::with_payload(MessageKind::ExecutionAck, chain_id, HUB, 0, &payload).unwrap();
        AdmittedMessage {
            fingerprint: message.fingerprint(),
            message,
            admitted_at: Utc::now(),
            attested_by: Vec::new(),
        }
    }

    /// Directives sent since the last call, as (chain, phase)
    fn sent(transport: &MockTransport) -> Vec<(ChainId, DirectivePhase)> {
        transport
            .take()
            .into_iter()
            .filter(|m| m.kind == MessageKind::ExecutionDirective)
            .map(|m| {
                let payload: ExecutionDirectivePayload = m.decode(MessageKind::ExecutionDirective).unwrap();
                (m.dest_chain, payload.phase)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_all_chains_prepare_and_commit() {
        let f = fixture(3).await;
        let id = f.proposal_id.clone();
        let record = f.coordinator.begin(&id, f.now).await.unwrap();
        assert_eq!(record.attempt, 1);
        assert_eq!(
            sent(&f.transport),
            vec![(1, DirectivePhase::Prepare), (2, DirectivePhase::Prepare), (3, DirectivePhase::Prepare)]
        );

        for chain in [1, 2, 3] {
            f.coordinator.on_ack(&ack(chain, &id, 1, AckStatus::Prepared), f.now).await.unwrap();
        }
        assert_eq!(
            sent(&f.transport),
            vec![(1, DirectivePhase::Commit), (2, DirectivePhase::Commit), (3, DirectivePhase::Commit)]
        );

        for chain in [1, 2, 3] {
            f.coordinator.on_ack(&ack(chain, &id, 1, AckStatus::Committed), f.now).await.unwrap();
        }
        let record = f.coordinator.get(&id).unwrap();
        assert_eq!(record.outcome, ExecutionOutcome::Success);
        assert!(record.all_committed());
        assert_eq!(f.lifecycle.state(&id), Some(ProposalState::Executed));
    }

    #[tokio::test]
    async fn test_finished_records_pruned_after_retention() {
        let f = fixture(3).await;
        let id = f.proposal_id.clone();
        f.coordinator.begin(&id, f.now).await.unwrap();
        for chain in [1, 2, 3] {
            f.coordinator.on_ack(&ack(chain, &id, 1, AckStatus::Prepared), f.now).await.unwrap();
        }
        for chain in [1, 2, 3] {
            f.coordinator.on_ack(&ack(chain, &id, 1, AckStatus::Committed), f.now).await.unwrap();
        }
        assert_eq!(f.lifecycle.state(&id), Some(ProposalState::Executed));

        assert_eq!(f.coordinator.prune_finished(f.now + Duration::seconds(3599)), 0);
        assert!(f.coordinator.get(&id).is_some());
        assert_eq!(f.coordinator.prune_finished(f.now + Duration::seconds(3600)), 1);
        assert!(f.coordinator.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_aborted_record_of_queued_proposal_is_kept() {
        let f = fixture(3).await;
        let id = f.proposal_id.clone();
        f.coordinator.begin(&id, f.now).await.unwrap();
        f.coordinator
            .on_ack(&ack(2, &id, 1, AckStatus::PrepareFailed { reason: "paused".into() }), f.now)
            .await
            .unwrap();
        assert_eq!(f.coordinator.get(&id).map(|r| r.outcome), Some(ExecutionOutcome::Aborted));

        // The attempt count still limits retries while the proposal is queued
        assert_eq!(f.coordinator.prune_finished(f.now + Duration::days(1)), 0);
        assert_eq!(f.coordinator.get(&id).map(|r| r.attempt), Some(1));
    }

    #[tokio::test]
    async fn test_prepare_failure_aborts_prepared_chains() {
        let f = fixture(3).await;
        let id = f.proposal_id.clone();
        f.coordinator.begin(&id, f.now).await.unwrap();
        sent(&f.transport);

        f.coordinator.on_ack(&ack(1, &id, 1, AckStatus::Prepared), f.now).await.unwrap();
        f.coordinator.on_ack(&ack(3, &id, 1, AckStatus::Prepared), f.now).await.unwrap();
        f.coordinator
            .on_ack(&ack(2, &id, 1, AckStatus::PrepareFailed { reason: "insufficient funds".into() }), f.now)
            .await
            .unwrap();

        assert_eq!(sent(&f.transport), vec![(1, DirectivePhase::Abort), (3, DirectivePhase::Abort)]);
        let record = f.coordinator.get(&id).unwrap();
        assert_eq!(record.outcome, ExecutionOutcome::Aborted);
        assert_eq!(
            record.status(2),
            Some(&ChainExecutionStatus::Failed { reason: "insufficient funds".into() })
        );
        assert_eq!(record.status(1), Some(&ChainExecutionStatus::Aborted));
        // The proposal stays queued for another attempt
        assert_eq!(f.lifecycle.state(&id), Some(ProposalState::Queued));
        assert!(f.coordinator.can_attempt(&id));
    }

    #[tokio::test]
    async fn test_commit_ack_before_prepared_is_rejected() {
        let f = fixture(3).await;
        let id = f.proposal_id.clone();
        f.coordinator.begin(&id, f.now).await.unwrap();

        let result = f.coordinator.on_ack(&ack(2, &id, 1, AckStatus::Committed), f.now).await;
        assert!(matches!(result, Err(ExecutionError::OutOfOrderAck { chain_id: 2, .. })));
        assert_eq!(f.coordinator.get(&id).unwrap().status(2), Some(&ChainExecutionStatus::Pending));
    }

    #[tokio::test]
    async fn test_prepare_timeout_aborts() {
        let f = fixture(3).await;
        let id = f.proposal_id.clone();
        f.coordinator.begin(&id, f.now).await.unwrap();
        f.coordinator.on_ack(&ack(1, &id, 1, AckStatus::Prepared), f.now).await.unwrap();
        sent(&f.transport);

        assert!(f.coordinator.check_timeouts(f.now + Duration::seconds(59)).await.is_empty());
        assert_eq!(f.coordinator.check_timeouts(f.now + Duration::seconds(60)).await, vec![id.clone()]);

        let record = f.coordinator.get(&id).unwrap();
        assert_eq!(record.outcome, ExecutionOutcome::Aborted);
        assert_eq!(
            record.status(2),
            Some(&ChainExecutionStatus::Failed { reason: "prepare timed out".into() })
        );
        assert_eq!(sent(&f.transport), vec![(1, DirectivePhase::Abort)]);
    }

    #[tokio::test]
    async fn test_commit_failure_retries_then_needs_reconciliation() {
        let f = fixture(3).await;
        let id = f.proposal_id.clone();
        f.coordinator.begin(&id, f.now).await.unwrap();
        for chain in [1, 2, 3] {
            f.coordinator.on_ack(&ack(chain, &id, 1, AckStatus::Prepared), f.now).await.unwrap();
        }
        f.coordinator.on_ack(&ack(1, &id, 1, AckStatus::Committed), f.now).await.unwrap();
        f.coordinator.on_ack(&ack(2, &id, 1, AckStatus::Committed), f.now).await.unwrap();
        sent(&f.transport);

        let failed = || ack(3, &id, 1, AckStatus::CommitFailed { reason: "paused".into() });
        f.coordinator.on_ack(&failed(), f.now).await.unwrap();
        assert_eq!(sent(&f.transport), vec![(3, DirectivePhase::Commit)]);

        f.coordinator.on_ack(&failed(), f.now).await.unwrap();
        assert!(sent(&f.transport).is_empty());

        let record = f.coordinator.get(&id).unwrap();
        assert!(record.needs_reconciliation);
        assert_eq!(record.outcome, ExecutionOutcome::Aborted);
        assert!(!f.coordinator.can_attempt(&id));
        assert_eq!(
            f.coordinator.begin(&id, f.now).await.unwrap_err(),
            ExecutionError::NeedsReconciliation(id.clone())
        );
        assert_eq!(f.lifecycle.state(&id), Some(ProposalState::Queued));
    }

    #[tokio::test]
    async fn test_commit_timeout_resends_commit() {
        let f = fixture(3).await;
        let id = f.proposal_id.clone();
        f.coordinator.begin(&id, f.now).await.unwrap();
        for chain in [1, 2, 3] {
            f.coordinator.on_ack(&ack(chain, &id, 1, AckStatus::Prepared), f.now).await.unwrap();
        }
        f.coordinator.on_ack(&ack(1, &id, 1, AckStatus::Committed), f.now).await.unwrap();
        sent(&f.transport);

        f.coordinator.check_timeouts(f.now + Duration::seconds(60)).await;
        assert_eq!(sent(&f.transport), vec![(2, DirectivePhase::Commit), (3, DirectivePhase::Commit)]);

        f.coordinator.on_ack(&ack(2, &id, 1, AckStatus::Committed), f.now).await.unwrap();
        f.coordinator.on_ack(&ack(3, &id, 1, AckStatus::Committed), f.now).await.unwrap();
        assert_eq!(f.coordinator.get(&id).unwrap().outcome, ExecutionOutcome::Success);
    }

    #[tokio::test]
    async fn test_cancel_aborts_only_before_commit() {
        let f = fixture(3).await;
        let id = f.proposal_id.clone();
        f.coordinator.begin(&id, f.now).await.unwrap();
        f.coordinator.on_ack(&ack(1, &id, 1, AckStatus::Prepared), f.now).await.unwrap();
        sent(&f.transport);

        assert!(f.coordinator.abort_if_uncommitted(&id, f.now).await.unwrap());
        assert_eq!(
            sent(&f.transport),
            vec![(1, DirectivePhase::Abort), (2, DirectivePhase::Abort), (3, DirectivePhase::Abort)]
        );

        // Second attempt reaches commit; cancellation is refused from then on
        f.coordinator.begin(&id, f.now).await.unwrap();
        for chain in [1, 2, 3] {
            f.coordinator.on_ack(&ack(chain, &id, 2, AckStatus::Prepared), f.now).await.unwrap();
        }
        assert_eq!(
            f.coordinator.abort_if_uncommitted(&id, f.now).await,
            Err(ExecutionError::CommitInProgress(id.clone()))
        );
    }

    #[tokio::test]
    async fn test_late_prepared_after_abort_gets_abort() {
        let f = fixture(3).await;
        let id = f.proposal_id.clone();
        f.coordinator.begin(&id, f.now).await.unwrap();
        f.coordinator
            .on_ack(&ack(2, &id, 1, AckStatus::PrepareFailed { reason: "no".into() }), f.now)
            .await
            .unwrap();
        sent(&f.transport);

        f.coordinator.on_ack(&ack(3, &id, 1, AckStatus::Prepared), f.now).await.unwrap();
        assert_eq!(sent(&f.transport), vec![(3, DirectivePhase::Abort)]);
    }

    #[tokio::test]
    async fn test_retry_uses_new_attempt_and_ignores_stale_acks() {
        let f = fixture(2).await;
        let id = f.proposal_id.clone();
        f.coordinator.begin(&id, f.now).await.unwrap();
        f.coordinator
            .on_ack(&ack(1, &id, 1, AckStatus::PrepareFailed { reason: "busy".into() }), f.now)
            .await
            .unwrap();

        let second = f.coordinator.begin(&id, f.now).await.unwrap();
        assert_eq!(second.attempt, 2);
        sent(&f.transport);

        // A stale Prepared for attempt 1 is told to abort and does not count
        f.coordinator.on_ack(&ack(3, &id, 1, AckStatus::Prepared), f.now).await.unwrap();
        assert_eq!(sent(&f.transport), vec![(3, DirectivePhase::Abort)]);
        assert_eq!(f.coordinator.get(&id).unwrap().status(3), Some(&ChainExecutionStatus::Pending));

        f.coordinator
            .on_ack(&ack(1, &id, 2, AckStatus::PrepareFailed { reason: "busy".into() }), f.now)
            .await
            .unwrap();
        assert!(matches!(
            f.coordinator.begin(&id, f.now).await,
            Err(ExecutionError::AttemptsExhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_deregistered_chain_fails_execution() {
        let f = fixture(3).await;
        let id = f.proposal_id.clone();
        f.coordinator.begin(&id, f.now).await.unwrap();
        f.coordinator.on_ack(&ack(1, &id, 1, AckStatus::Prepared), f.now).await.unwrap();

        f.registry.deregister(3).unwrap();
        f.coordinator.check_timeouts(f.now).await;
        let record = f.coordinator.get(&id).unwrap();
        assert_eq!(record.outcome, ExecutionOutcome::Aborted);
        assert_eq!(
            record.status(3),
            Some(&ChainExecutionStatus::Failed { reason: "chain deregistered".into() })
        );
    }

    #[tokio::test]
    async fn test_begin_requires_queued_proposal_past_eta() {
        let f = fixture(3).await;
        assert!(matches!(
            f.coordinator.begin("missing", f.now).await,
            Err(ExecutionError::ProposalNotFound(_))
        ));
        f.coordinator.begin(&f.proposal_id, f.now).await.unwrap();
        assert_eq!(
            f.coordinator.begin(&f.proposal_id, f.now).await.unwrap_err(),
            ExecutionError::AlreadyInProgress(f.proposal_id.clone())
        );
    }

    fn participant(transport: Arc<MockTransport>, executor: Arc<RecordingExecutor>) -> ExecutionParticipant {
        let open = || SecurityConfig::new(1, Vec::<String>::new()).unwrap();
        let registry = ChainRegistry::new(ChainRecord::new(HUB, "hub", true, open()));
        registry.register(ChainRecord::new(2, "two", false, open())).unwrap();
        let registry = Arc::new(registry);
        let telemetry = Arc::new(TelemetryReporter::new(2));
        let outbox = Arc::new(Outbox::new(2, transport, registry.clone(), telemetry.clone(), 3));
        ExecutionParticipant::new(2, registry, executor, outbox, telemetry)
    }

    fn directive_from(source: ChainId, attempt: u32, phase: DirectivePhase) -> AdmittedMessage {
        let payload = ExecutionDirectivePayload {
            proposal_id: "p-1".into(),
            attempt,
            phase,
            actions: if phase == DirectivePhase::Prepare {
                vec![ProposalAction::new(2, b"fee=5".to_vec())]
            } else {
                Vec::new()
            },
        };
        let message =
            CrossChainMessage::with_payload(MessageKind::ExecutionDirective, source, 2, attempt as u64, &payload).unwrap();
        AdmittedMessage {
            fingerprint: message.fingerprint(),
            message,
            admitted_at: Utc::now(),
            attested_by: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_participant_prepares_commits_and_acks() {
        let transport = Arc::new(MockTransport::new());
        let executor = Arc::new(RecordingExecutor::new());
        let participant = participant(transport.clone(), executor.clone());

        let status = participant.handle_directive(&directive_from(HUB, 1, DirectivePhase::Prepare)).await.unwrap();
        assert_eq!(status, AckStatus::Prepared);
        assert!(executor.is_prepared("p-1"));

        let status = participant.handle_directive(&directive_from(HUB, 1, DirectivePhase::Commit)).await.unwrap();
        assert_eq!(status, AckStatus::Committed);
        assert_eq!(participant.state("p-1"), Some(ParticipantState::Committed));

        // Never executes twice
        let status = participant.handle_directive(&directive_from(HUB, 2, DirectivePhase::Prepare)).await.unwrap();
        assert!(matches!(status, AckStatus::PrepareFailed { .. }));

        let acks: Vec<ExecutionAckPayload> = transport
            .sent()
            .iter()
            .map(|m| m.decode(MessageKind::ExecutionAck).unwrap())
            .collect();
        assert_eq!(acks.len(), 3);
        assert!(transport.sent().iter().all(|m| m.dest_chain == HUB && m.source_chain == 2));
    }

    #[tokio::test]
    async fn test_participant_refuses_commit_without_prepare() {
        let transport = Arc::new(MockTransport::new());
        let executor = Arc::new(RecordingExecutor::new());
        let participant = participant(transport, executor.clone());

        let status = participant.handle_directive(&directive_from(HUB, 1, DirectivePhase::Commit)).await.unwrap();
        assert!(matches!(status, AckStatus::CommitFailed { .. }));
        assert!(executor.committed().is_empty());
    }

    #[tokio::test]
    async fn test_participant_aborts_and_reports_prepare_failure() {
        let transport = Arc::new(MockTransport::new());
        let executor = Arc::new(RecordingExecutor::new());
        let participant = participant(transport, executor.clone());

        participant.handle_directive(&directive_from(HUB, 1, DirectivePhase::Prepare)).await.unwrap();
        let status = participant.handle_directive(&directive_from(HUB, 1, DirectivePhase::Abort)).await.unwrap();
        assert_eq!(status, AckStatus::Aborted);
        assert!(!executor.is_prepared("p-1"));

        executor.fail_prepare("paused");
        let status = participant.handle_directive(&directive_from(HUB, 2, DirectivePhase::Prepare)).await.unwrap();
        assert_eq!(status, AckStatus::PrepareFailed { reason: "paused".into() });
    }

    #[tokio::test]
    async fn test_participant_only_obeys_the_hub() {
        let participant = participant(Arc::new(MockTransport::new()), Arc::new(RecordingExecutor::new()));
        let result = participant.handle_directive(&directive_from(2, 1, DirectivePhase::Prepare)).await;
        assert_eq!(result, Err(ExecutionError::UnexpectedSource(2)));
    }
}
