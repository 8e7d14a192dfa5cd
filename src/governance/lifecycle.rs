// SPDX-License-Identifier: MIT
//
// Copyright (c) 2025 Noderr Protocol Foundation

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::GovernanceConfig;
use crate::governance::collaborators::IdentityProvider;
use crate::governance::registry::ChainRegistry;
use crate::governance::types::{
    Amount, ChainId, Proposal, ProposalDraft, ProposalId, ProposalState, VoterId,
};
use crate::governance::vote_tracker::{VoteAggregator, VoteError};
use crate::telemetry::TelemetryReporter;
use crate::telemetry_data;

/// Proposal lifecycle error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProposalError {
    #[error("Proposal not found: {0}")]
    ProposalNotFound(ProposalId),

    #[error("Proposal {proposal_id} cannot move from {from} to {to}")]
    InvalidTransition {
        proposal_id: ProposalId,
        from: ProposalState,
        to: ProposalState,
    },

    #[error("Proposer power {power} below threshold {threshold}")]
    BelowThreshold { power: Amount, threshold: Amount },

    #[error("Proposal has no actions")]
    NoActions,

    #[error("Unknown target chain: {0}")]
    UnknownTargetChain(ChainId),

    #[error("{0} is not allowed to cancel this proposal")]
    Unauthorized(VoterId),

    #[error("Proposal {0} is not yet due")]
    NotDue(ProposalId),

    #[error("{0} is outside the representable time range")]
    TimeOverflow(&'static str),

    #[error("Vote error: {0}")]
    Vote(#[from] VoteError),

    #[error("Identity provider error: {0}")]
    Identity(String),
}

/// Owns proposal state. Tallies come from the [`VoteAggregator`]; `Executed` is driven by
/// the execution coordinator.
pub struct ProposalLifecycle {
    local_chain: ChainId,
    registry: Arc<ChainRegistry>,
    identity: Arc<dyn IdentityProvider>,
    votes: Arc<VoteAggregator>,
    telemetry: Arc<TelemetryReporter>,
    config: GovernanceConfig,
    proposals: DashMap<ProposalId, Proposal>,
}

impl ProposalLifecycle {
    pub fn new(
        local_chain: ChainId,
        registry: Arc<ChainRegistry>,
        identity: Arc<dyn IdentityProvider>,
        votes: Arc<VoteAggregator>,
        telemetry: Arc<TelemetryReporter>,
        config: GovernanceConfig,
    ) -> Self {
        Self {
            local_chain,
            registry,
            identity,
            votes,
            telemetry,
            config,
            proposals: DashMap::new(),
        }
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    /// Create a proposal. The quorum is captured now and never changes afterwards.
    pub async fn propose(
        &self,
        proposer: &str,
        draft: ProposalDraft,
        now: DateTime<Utc>,
    ) -> Result<Proposal, ProposalError> {
        if draft.actions.is_empty() {
            return Err(ProposalError::NoActions);
        }
        if let Some(action) = draft
            .actions
            .iter()
            .find(|a| !self.registry.is_registered(a.target_chain))
        {
            return Err(ProposalError::UnknownTargetChain(action.target_chain));
        }

        let threshold = self.config.threshold();
        if threshold > 0 {
            let power = self
                .identity
                .voting_power(proposer, now)
                .await
                .map_err(ProposalError::Identity)?;
            if power < threshold {
                return Err(ProposalError::BelowThreshold { power, threshold });
            }
        }

        let voting_starts_at = now
            .checked_add_signed(self.config.voting_delay())
            .ok_or(ProposalError::TimeOverflow("voting start"))?;
        let voting_ends_at = voting_starts_at
            .checked_add_signed(self.config.voting_period())
            .ok_or(ProposalError::TimeOverflow("voting start"))?;
        let proposal = Proposal {
            id: Proposal::new_id(),
            proposer: proposer.to_string(),
            origin_chain: self.local_chain,
            title: draft.title,
            description: draft.description,
            actions: draft.actions,
            state: ProposalState::Pending,
            tally: Default::default(),
            quorum: self.config.quorum(),
            created_at: now,
            snapshot_at: now,
            voting_starts_at,
            voting_ends_at,
            eta: None,
            execution_deadline: None,
            cancelled_by: None,
            updated_at: now,
        };

        self.votes.register_proposal(&proposal);
        self.proposals.insert(proposal.id.clone(), proposal.clone());

        info!(
            "Proposal {} created by {} targeting chains {:?}",
            proposal.id,
            proposer,
            proposal.target_chains()
        );
        self.telemetry.report_custom(
            "proposal_created",
            telemetry_data! {
                "proposal_id" => proposal.id,
                "proposer" => proposer,
                "quorum" => proposal.quorum.to_string(),
                "voting_starts_at" => proposal.voting_starts_at,
                "voting_ends_at" => proposal.voting_ends_at,
            },
        );

        // A zero voting delay opens voting immediately
        self.refresh(&proposal.id, now)?;
        self.get(&proposal.id)
            .ok_or_else(|| ProposalError::ProposalNotFound(proposal.id.clone()))
    }

    /// Snapshot of a proposal with its current tally
    pub fn get(&self, proposal_id: &str) -> Option<Proposal> {
        let mut proposal = self.proposals.get(proposal_id).map(|p| p.clone())?;
        if matches!(proposal.state, ProposalState::Pending | ProposalState::Active) {
            if let Ok(tally) = self.votes.get_tally(proposal_id) {
                proposal.tally = tally;
            }
        }
        Some(proposal)
    }

    pub fn state(&self, proposal_id: &str) -> Option<ProposalState> {
        self.proposals.get(proposal_id).map(|p| p.state)
    }

    /// Ids of proposals currently in `state`
    pub fn ids_in_state(&self, state: ProposalState) -> Vec<ProposalId> {
        self.proposals
            .iter()
            .filter(|p| p.state == state)
            .map(|p| p.id.clone())
            .collect()
    }

    /// Apply time-driven transitions: open voting, then close it and decide the outcome
    pub fn refresh(&self, proposal_id: &str, now: DateTime<Utc>) -> Result<ProposalState, ProposalError> {
        let mut proposal = self
            .proposals
            .get_mut(proposal_id)
            .ok_or_else(|| ProposalError::ProposalNotFound(proposal_id.to_string()))?;

        if proposal.state == ProposalState::Pending && now >= proposal.voting_starts_at {
            self.votes.set_state(proposal_id, ProposalState::Active)?;
            self.transition(&mut proposal, ProposalState::Active, now)?;
        }

        if proposal.state == ProposalState::Active && now >= proposal.voting_ends_at {
            let quorum = proposal.quorum;
            let (tally, outcome) = self.votes.close_ballot(proposal_id, |tally| {
                if tally.passes(quorum) {
                    ProposalState::Succeeded
                } else {
                    ProposalState::Defeated
                }
            })?;
            proposal.tally = tally;
            info!(
                "Voting closed on {}: for {} / against {} / abstain {} (quorum {})",
                proposal_id, tally.for_votes, tally.against_votes, tally.abstain_votes, quorum
            );
            self.transition(&mut proposal, outcome, now)?;
        }

        Ok(proposal.state)
    }

    /// Refresh every open proposal; returns the ones whose state changed
    pub fn refresh_all(&self, now: DateTime<Utc>) -> Vec<(ProposalId, ProposalState)> {
        let open: Vec<(ProposalId, ProposalState)> = self
            .proposals
            .iter()
            .filter(|p| matches!(p.state, ProposalState::Pending | ProposalState::Active))
            .map(|p| (p.id.clone(), p.state))
            .collect();

        let mut changed = Vec::new();
        for (id, before) in open {
            match self.refresh(&id, now) {
                Ok(after) if after != before => changed.push((id, after)),
                Ok(_) => {}
                Err(e) => warn!("Failed to refresh proposal {}: {}", id, e),
            }
        }
        changed
    }

    /// Queue a succeeded proposal behind the execution delay
    pub fn queue(&self, proposal_id: &str, now: DateTime<Utc>) -> Result<Proposal, ProposalError> {
        let mut proposal = self
            .proposals
            .get_mut(proposal_id)
            .ok_or_else(|| ProposalError::ProposalNotFound(proposal_id.to_string()))?;

        let eta = now
            .checked_add_signed(self.config.execution_delay())
            .ok_or(ProposalError::TimeOverflow("execution eta"))?;
        let deadline = eta
            .checked_add_signed(self.config.execution_timeout())
            .ok_or(ProposalError::TimeOverflow("execution deadline"))?;
        self.transition(&mut proposal, ProposalState::Queued, now)?;
        proposal.eta = Some(eta);
        proposal.execution_deadline = Some(deadline);
        debug!("Proposal {} queued, executable from {}", proposal_id, eta);
        Ok(proposal.clone())
    }

    /// Cancel a proposal. Only the proposer or a guardian may do so.
    pub fn cancel(&self, proposal_id: &str, caller: &str, now: DateTime<Utc>) -> Result<Proposal, ProposalError> {
        let mut proposal = self
            .proposals
            .get_mut(proposal_id)
            .ok_or_else(|| ProposalError::ProposalNotFound(proposal_id.to_string()))?;

        if proposal.proposer != caller && !self.is_guardian(caller) {
            warn!("{} tried to cancel proposal {} without authority", caller, proposal_id);
            return Err(ProposalError::Unauthorized(caller.to_string()));
        }

        let was_open = matches!(proposal.state, ProposalState::Pending | ProposalState::Active);
        self.transition(&mut proposal, ProposalState::Cancelled, now)?;
        proposal.cancelled_by = Some(caller.to_string());
        if was_open {
            if let Ok(tally) = self.votes.get_tally(proposal_id) {
                proposal.tally = tally;
            }
        }
        self.votes.set_state(proposal_id, ProposalState::Cancelled)?;
        Ok(proposal.clone())
    }

    /// Record overall execution success
    pub fn mark_executed(&self, proposal_id: &str, now: DateTime<Utc>) -> Result<(), ProposalError> {
        let mut proposal = self
            .proposals
            .get_mut(proposal_id)
            .ok_or_else(|| ProposalError::ProposalNotFound(proposal_id.to_string()))?;
        self.transition(&mut proposal, ProposalState::Executed, now)
    }

    /// Expire a queued proposal whose execution window has passed
    pub fn expire(&self, proposal_id: &str, now: DateTime<Utc>) -> Result<(), ProposalError> {
        let mut proposal = self
            .proposals
            .get_mut(proposal_id)
            .ok_or_else(|| ProposalError::ProposalNotFound(proposal_id.to_string()))?;

        match proposal.execution_deadline {
            Some(deadline) if now >= deadline => {}
            _ => return Err(ProposalError::NotDue(proposal_id.to_string())),
        }
        self.transition(&mut proposal, ProposalState::Expired, now)
    }

    /// Queued proposals past their delay and inside their execution window
    pub fn executable(&self, now: DateTime<Utc>) -> Vec<Proposal> {
        self.proposals
            .iter()
            .filter(|p| p.state == ProposalState::Queued)
            .filter(|p| p.eta.map(|eta| now >= eta).unwrap_or(false))
            .filter(|p| p.execution_deadline.map(|d| now < d).unwrap_or(false))
            .map(|p| p.clone())
            .collect()
    }

    /// Queued proposals whose execution window has passed
    pub fn overdue(&self, now: DateTime<Utc>) -> Vec<ProposalId> {
        self.proposals
            .iter()
            .filter(|p| p.state == ProposalState::Queued)
            .filter(|p| p.execution_deadline.map(|d| now >= d).unwrap_or(false))
            .map(|p| p.id.clone())
            .collect()
    }

    pub fn is_guardian(&self, identity: &str) -> bool {
        self.config.guardians.iter().any(|g| g == identity)
    }

    fn transition(&self, proposal: &mut Proposal, to: ProposalState, now: DateTime<Utc>) -> Result<(), ProposalError> {
        let from = proposal.state;
        if !from.can_transition_to(to) {
            return Err(ProposalError::InvalidTransition {
                proposal_id: proposal.id.clone(),
                from,
                to,
            });
        }
        proposal.state = to;
        proposal.updated_at = now;

        info!("Proposal {} moved from {} to {}", proposal.id, from, to);
        self.telemetry.report_custom(
            "proposal_state_changed",
            telemetry_data! {
                "proposal_id" => proposal.id,
                "from" => from.to_string(),
                "to" => to.to_string(),
            },
        );
        Ok(())
    }
}
