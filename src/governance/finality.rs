// SPDX-License-Identifier: MIT
//
// Copyright (c) 2025 Noderr Protocol Foundation

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::governance::types::{ChainId, ProposalId};

/// Status of one target chain within an execution attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainExecutionStatus {
    /// Prepare directive sent, no answer yet
    Pending,
    /// Chain confirmed it can apply its actions
    Prepared,
    /// Chain applied its actions
    Committed,
    /// Chain was told to release its preparation
    Aborted,
    /// Chain failed to prepare or commit, or stopped answering
    Failed { reason: String },
}

impl ChainExecutionStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, ChainExecutionStatus::Failed { .. })
    }
}

impl std::fmt::Display for ChainExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainExecutionStatus::Pending => write!(f, "pending"),
            ChainExecutionStatus::Prepared => write!(f, "prepared"),
            ChainExecutionStatus::Committed => write!(f, "committed"),
            ChainExecutionStatus::Aborted => write!(f, "aborted"),
            ChainExecutionStatus::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Coordinator phase of an execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionPhase {
    /// Waiting for Prepared acks
    Preparing,
    /// Commit decided, waiting for Committed acks
    Committing,
    /// No further directives will be issued
    Finished,
}

impl std::fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionPhase::Preparing => write!(f, "preparing"),
            ExecutionPhase::Committing => write!(f, "committing"),
            ExecutionPhase::Finished => write!(f, "finished"),
        }
    }
}

/// Overall atomic outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    InProgress,
    /// Every target chain committed
    Success,
    /// At least one target chain did not commit
    Aborted,
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionOutcome::InProgress => write!(f, "in_progress"),
            ExecutionOutcome::Success => write!(f, "success"),
            ExecutionOutcome::Aborted => write!(f, "aborted"),
        }
    }
}

/// Per-chain progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainExecution {
    pub status: ChainExecutionStatus,
    /// Commit directives sent so far
    pub commit_attempts: u32,
    pub updated_at: DateTime<Utc>,
}

/// State of one execution attempt for a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub proposal_id: ProposalId,
    /// 1-based attempt number
    pub attempt: u32,
    pub chains: BTreeMap<ChainId, ChainExecution>,
    pub phase: ExecutionPhase,
    pub outcome: ExecutionOutcome,
    /// A chain failed after commit was decided; operator action required
    pub needs_reconciliation: bool,
    pub started_at: DateTime<Utc>,
    pub prepare_deadline: DateTime<Utc>,
    /// Set when commit is decided, moved forward on every commit round
    pub commit_deadline: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Human-readable trail of failures
    pub diagnostics: Vec<String>,
}

impl ExecutionRecord {
    pub fn new(
        proposal_id: ProposalId,
        attempt: u32,
        targets: impl IntoIterator<Item = ChainId>,
        started_at: DateTime<Utc>,
        prepare_deadline: DateTime<Utc>,
    ) -> Self {
        let chains = targets
            .into_iter()
            .map(|chain_id| {
                (
                    chain_id,
                    ChainExecution {
                        status: ChainExecutionStatus::Pending,
                        commit_attempts: 0,
                        updated_at: started_at,
                    },
                )
            })
            .collect();
        Self {
            proposal_id,
            attempt,
            chains,
            phase: ExecutionPhase::Preparing,
            outcome: ExecutionOutcome::InProgress,
            needs_reconciliation: false,
            started_at,
            prepare_deadline,
            commit_deadline: None,
            finished_at: None,
            diagnostics: Vec::new(),
        }
    }

    pub fn status(&self, chain_id: ChainId) -> Option<&ChainExecutionStatus> {
        self.chains.get(&chain_id).map(|c| &c.status)
    }

    pub fn set_status(&mut self, chain_id: ChainId, status: ChainExecutionStatus, now: DateTime<Utc>) {
        if let ChainExecutionStatus::Failed { reason } = &status {
            self.diagnostics.push(format!("chain {}: {}", chain_id, reason));
        }
        if let Some(chain) = self.chains.get_mut(&chain_id) {
            chain.status = status;
            chain.updated_at = now;
        }
    }

    /// Chains whose status matches `predicate`, ascending
    pub fn chains_where<F>(&self, predicate: F) -> Vec<ChainId>
    where
        F: Fn(&ChainExecutionStatus) -> bool,
    {
        self.chains
            .iter()
            .filter(|(_, c)| predicate(&c.status))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn all_prepared(&self) -> bool {
        self.chains.values().all(|c| c.status == ChainExecutionStatus::Prepared)
    }

    pub fn all_committed(&self) -> bool {
        !self.chains.is_empty() && self.chains.values().all(|c| c.status == ChainExecutionStatus::Committed)
    }

    /// Commit was decided for this attempt
    pub fn commit_decided(&self) -> bool {
        self.commit_deadline.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.phase == ExecutionPhase::Finished
    }

    pub(crate) fn finish(&mut self, outcome: ExecutionOutcome, now: DateTime<Utc>) {
        self.phase = ExecutionPhase::Finished;
        self.outcome = outcome;
        self.finished_at = Some(now);
    }
}
