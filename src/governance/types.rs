// SPDX-License-Identifier: MIT
//
// Copyright (c) 2025 Noderr Protocol Foundation

use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Identifier of a participating chain
pub type ChainId = u64;

/// Identifier of a proposal (UUID string, globally unique)
pub type ProposalId = String;

/// Identity of a voter or proposer
pub type VoterId = String;

/// Identifier of an attestation verifier
pub type VerifierId = String;

/// Voting weight and token amounts
pub type Amount = u128;

/// Support value of a vote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SupportType {
    /// Vote against the proposal
    Against,
    /// Vote in favor of the proposal
    For,
    /// Counted towards quorum only
    Abstain,
}

impl SupportType {
    /// Stable byte used when fingerprinting a vote
    pub fn as_byte(&self) -> u8 {
        match self {
            SupportType::Against => 0,
            SupportType::For => 1,
            SupportType::Abstain => 2,
        }
    }
}

impl std::fmt::Display for SupportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupportType::Against => write!(f, "against"),
            SupportType::For => write!(f, "for"),
            SupportType::Abstain => write!(f, "abstain"),
        }
    }
}

/// Running vote totals for a proposal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub for_votes: Amount,
    pub against_votes: Amount,
    pub abstain_votes: Amount,
}

impl Tally {
    /// Total turnout (for + against + abstain)
    pub fn turnout(&self) -> Amount {
        self.for_votes
            .saturating_add(self.against_votes)
            .saturating_add(self.abstain_votes)
    }

    /// Add weight to the bucket for `support`
    pub fn add(&mut self, support: SupportType, weight: Amount) {
        let bucket = match support {
            SupportType::For => &mut self.for_votes,
            SupportType::Against => &mut self.against_votes,
            SupportType::Abstain => &mut self.abstain_votes,
        };
        *bucket = bucket.saturating_add(weight);
    }

    /// Whether this tally passes against a quorum
    pub fn passes(&self, quorum: Amount) -> bool {
        self.for_votes > self.against_votes && self.turnout() >= quorum
    }
}

/// Lifecycle state of a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposalState {
    /// Voting window has not opened yet
    Pending,
    /// Voting window is open
    Active,
    /// Window closed, proposal passed
    Succeeded,
    /// Window closed, proposal failed or missed quorum
    Defeated,
    /// Waiting for the execution delay or being executed
    Queued,
    /// Every target chain committed
    Executed,
    /// Execution did not complete within the execution window
    Expired,
    /// Cancelled by the proposer or a guardian
    Cancelled,
}

impl ProposalState {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalState::Defeated
                | ProposalState::Executed
                | ProposalState::Expired
                | ProposalState::Cancelled
        )
    }

    /// Whether the lifecycle permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: ProposalState) -> bool {
        use ProposalState::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Cancelled)
                | (Active, Succeeded)
                | (Active, Defeated)
                | (Active, Cancelled)
                | (Succeeded, Queued)
                | (Queued, Executed)
                | (Queued, Expired)
                | (Queued, Cancelled)
        )
    }
}

impl std::fmt::Display for ProposalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProposalState::Pending => "pending",
            ProposalState::Active => "active",
            ProposalState::Succeeded => "succeeded",
            ProposalState::Defeated => "defeated",
            ProposalState::Queued => "queued",
            ProposalState::Executed => "executed",
            ProposalState::Expired => "expired",
            ProposalState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One action of a proposal, applied on a single target chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalAction {
    /// Chain the action applies to
    pub target_chain: ChainId,
    /// Opaque payload interpreted by the target chain's executor
    pub payload: Vec<u8>,
}

impl ProposalAction {
    pub fn new(target_chain: ChainId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            target_chain,
            payload: payload.into(),
        }
    }
}

/// Input for creating a proposal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalDraft {
    pub title: String,
    pub description: String,
    pub actions: Vec<ProposalAction>,
}

/// A governance proposal spanning one or more chains
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    /// Unique proposal identifier
    pub id: ProposalId,
    /// Who submitted the proposal
    pub proposer: VoterId,
    /// Chain the proposal was submitted on
    pub origin_chain: ChainId,
    pub title: String,
    pub description: String,
    /// Ordered target actions
    pub actions: Vec<ProposalAction>,
    pub state: ProposalState,
    /// Vote totals, frozen once the voting window closes
    pub tally: Tally,
    /// Quorum captured at creation
    pub quorum: Amount,
    pub created_at: DateTime<Utc>,
    /// Voting power snapshot time
    pub snapshot_at: DateTime<Utc>,
    pub voting_starts_at: DateTime<Utc>,
    pub voting_ends_at: DateTime<Utc>,
    /// Earliest execution time, set when queued
    pub eta: Option<DateTime<Utc>>,
    /// Execution must complete before this, set when queued
    pub execution_deadline: Option<DateTime<Utc>>,
    pub cancelled_by: Option<VoterId>,
    pub updated_at: DateTime<Utc>,
}

impl Proposal {
    /// Distinct target chains in first-appearance order
    pub fn target_chains(&self) -> Vec<ChainId> {
        let mut chains: Vec<ChainId> = Vec::new();
        for action in &self.actions {
            if !chains.contains(&action.target_chain) {
                chains.push(action.target_chain);
            }
        }
        chains
    }

    /// Actions addressed to one chain, in proposal order
    pub fn actions_for(&self, chain_id: ChainId) -> Vec<ProposalAction> {
        self.actions
            .iter()
            .filter(|a| a.target_chain == chain_id)
            .cloned()
            .collect()
    }

    pub(crate) fn new_id() -> ProposalId {
        Uuid::new_v4().to_string()
    }
}

/// A vote recorded for a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub proposal_id: ProposalId,
    pub voter: VoterId,
    /// Chain whose voting power backs this vote
    pub origin_chain: ChainId,
    pub support: SupportType,
    pub weight: Amount,
    pub reason: Option<String>,
    /// Deterministic duplicate-suppression hash
    pub fingerprint: String,
    pub recorded_at: DateTime<Utc>,
}

impl Vote {
    pub fn new(
        proposal_id: &str,
        voter: &str,
        origin_chain: ChainId,
        support: SupportType,
        weight: Amount,
        reason: Option<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            fingerprint: vote_fingerprint(origin_chain, proposal_id, voter, support, weight),
            proposal_id: proposal_id.to_string(),
            voter: voter.to_string(),
            origin_chain,
            support,
            weight,
            reason,
            recorded_at,
        }
    }
}

/// Fingerprint of a vote: SHA-256 over origin chain, proposal, voter, support and weight.
///
/// Variable-length fields are length-prefixed so distinct inputs never collide by
/// concatenation.
pub fn vote_fingerprint(
    origin_chain: ChainId,
    proposal_id: &str,
    voter: &str,
    support: SupportType,
    weight: Amount,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(origin_chain.to_be_bytes());
    hasher.update((proposal_id.len() as u64).to_be_bytes());
    hasher.update(proposal_id.as_bytes());
    hasher.update((voter.len() as u64).to_be_bytes());
    hasher.update(voter.as_bytes());
    hasher.update([support.as_byte()]);
    hasher.update(weight.to_be_bytes());
    hex::encode(hasher.finalize())
}
