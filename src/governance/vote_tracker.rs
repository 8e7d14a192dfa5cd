// SPDX-License-Identifier: MIT
//
// Copyright (c) 2025 Noderr Protocol Foundation

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Serialize, Deserialize};
use tracing::{debug, info, warn};

use crate::governance::collaborators::IdentityProvider;
use crate::governance::message::{AdmittedMessage, MessageKind, VoteRelayPayload};
use crate::governance::registry::ChainRegistry;
use crate::governance::relay::{DispatchError, MessageHandler};
use crate::governance::types::{
    Amount, ChainId, Proposal, ProposalId, ProposalState, SupportType, Tally, Vote, VoterId,
};
use crate::telemetry::TelemetryReporter;
use crate::telemetry_data;

/// Vote recording error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoteError {
    #[error("Proposal not found: {0}")]
    ProposalNotFound(ProposalId),

    #[error("Proposal {proposal_id} is {state}, not active")]
    ProposalNotActive { proposal_id: ProposalId, state: ProposalState },

    #[error("Voting window for proposal {0} has closed")]
    VotingClosed(ProposalId),

    #[error("{voter} already voted on {proposal_id} from chain {origin_chain}")]
    AlreadyVoted {
        proposal_id: ProposalId,
        voter: VoterId,
        origin_chain: ChainId,
    },

    #[error("Weight {weight} exceeds voting power {power}")]
    WeightExceedsPower { weight: Amount, power: Amount },

    #[error("Vote weight must be positive")]
    ZeroWeight,

    #[error("Vote on {proposal_id} checked power at {actual}, proposal snapshot is {expected}")]
    SnapshotMismatch {
        proposal_id: ProposalId,
        expected: DateTime<Utc>,
        actual: DateTime<Utc>,
    },

    #[error("Unknown chain: {0}")]
    UnknownChain(ChainId),

    #[error("Malformed vote: {0}")]
    Decode(String),

    #[error("Identity provider error: {0}")]
    Identity(String),
}

/// Result of a successful vote submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteReceipt {
    /// The vote changed the tally
    Recorded(Vote),
    /// Identical vote already on record; nothing changed
    Duplicate { fingerprint: String },
}

/// Per-proposal voting state
#[derive(Debug, Clone)]
struct Ballot {
    snapshot_at: DateTime<Utc>,
    voting_starts_at: DateTime<Utc>,
    voting_ends_at: DateTime<Utc>,
    /// Mirrors the proposal state owned by the lifecycle
    state: ProposalState,
    votes: HashMap<(VoterId, ChainId), Vote>,
    tally: Tally,
    by_chain: BTreeMap<ChainId, Tally>,
}

impl Ballot {
    /// The voting window decides, so a `Pending` ballot whose start time has passed accepts
    /// votes before the lifecycle next refreshes it
    fn check_open(&self, proposal_id: &str, now: DateTime<Utc>) -> Result<(), VoteError> {
        match self.state {
            ProposalState::Pending | ProposalState::Active => {
                if now < self.voting_starts_at {
                    Err(VoteError::ProposalNotActive {
                        proposal_id: proposal_id.to_string(),
                        state: ProposalState::Pending,
                    })
                } else if now >= self.voting_ends_at {
                    Err(VoteError::VotingClosed(proposal_id.to_string()))
                } else {
                    Ok(())
                }
            }
            state => Err(VoteError::ProposalNotActive {
                proposal_id: proposal_id.to_string(),
                state,
            }),
        }
    }
}

/// Tally and vote counts for one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVoteStats {
    pub chain_id: ChainId,
    pub tally: Tally,
    pub voters: usize,
}

/// Merges local and relayed votes into one tally per proposal.
///
/// Each `(voter, origin chain)` pair counts once; every mutation happens under the
/// proposal's own map entry, so proposals never contend with each other.
pub struct VoteAggregator {
    local_chain: ChainId,
    registry: Arc<ChainRegistry>,
    identity: Arc<dyn IdentityProvider>,
    telemetry: Arc<TelemetryReporter>,
    ballots: DashMap<ProposalId, Ballot>,
}

impl VoteAggregator {
    pub fn new(
        local_chain: ChainId,
        registry: Arc<ChainRegistry>,
        identity: Arc<dyn IdentityProvider>,
        telemetry: Arc<TelemetryReporter>,
    ) -> Self {
        Self {
            local_chain,
            registry,
            identity,
            telemetry,
            ballots: DashMap::new(),
        }
    }

    /// Open a ballot for a new proposal
    pub fn register_proposal(&self, proposal: &Proposal) {
        self.ballots.entry(proposal.id.clone()).or_insert_with(|| Ballot {
            snapshot_at: proposal.snapshot_at,
            voting_starts_at: proposal.voting_starts_at,
            voting_ends_at: proposal.voting_ends_at,
            state: proposal.state,
            votes: HashMap::new(),
            tally: Tally::default(),
            by_chain: BTreeMap::new(),
        });
    }

    /// Mirror a lifecycle transition
    pub fn set_state(&self, proposal_id: &str, state: ProposalState) -> Result<(), VoteError> {
        let mut ballot = self
            .ballots
            .get_mut(proposal_id)
            .ok_or_else(|| VoteError::ProposalNotFound(proposal_id.to_string()))?;
        ballot.state = state;
        Ok(())
    }

    /// Record a vote cast on this chain, checking the voter's power at the snapshot
    pub async fn record_local_vote(
        &self,
        proposal_id: &str,
        voter: &str,
        support: SupportType,
        weight: Amount,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<VoteReceipt, VoteError> {
        let snapshot_at = {
            let ballot = self
                .ballots
                .get(proposal_id)
                .ok_or_else(|| VoteError::ProposalNotFound(proposal_id.to_string()))?;
            ballot.check_open(proposal_id, now)?;
            ballot.snapshot_at
        };

        if weight == 0 {
            return Err(VoteError::ZeroWeight);
        }
        let power = self
            .identity
            .voting_power(voter, snapshot_at)
            .await
            .map_err(VoteError::Identity)?;
        if weight > power {
            return Err(VoteError::WeightExceedsPower { weight, power });
        }

        let vote = Vote::new(proposal_id, voter, self.local_chain, support, weight, reason, now);
        self.apply(vote, now)
    }

    /// Snapshot time voting power is measured at for `proposal_id`
    pub fn snapshot_at(&self, proposal_id: &str) -> Result<DateTime<Utc>, VoteError> {
        self.ballots
            .get(proposal_id)
            .map(|ballot| ballot.snapshot_at)
            .ok_or_else(|| VoteError::ProposalNotFound(proposal_id.to_string()))
    }

    /// Fail unless `snapshot_at` is the proposal's snapshot
    pub fn check_snapshot(&self, proposal_id: &str, snapshot_at: DateTime<Utc>) -> Result<(), VoteError> {
        let expected = self.snapshot_at(proposal_id)?;
        if expected != snapshot_at {
            return Err(VoteError::SnapshotMismatch {
                proposal_id: proposal_id.to_string(),
                expected,
                actual: snapshot_at,
            });
        }
        Ok(())
    }

    /// Record a vote relayed from another chain. The origin chain checked the weight against
    /// the snapshot named in the payload, which must be this proposal's snapshot.
    pub fn record_remote_vote(&self, message: &AdmittedMessage, now: DateTime<Utc>) -> Result<VoteReceipt, VoteError> {
        let payload: VoteRelayPayload = message
            .decode(MessageKind::VoteRelay)
            .map_err(|e| VoteError::Decode(e.to_string()))?;
        if payload.weight == 0 {
            return Err(VoteError::ZeroWeight);
        }
        self.check_snapshot(&payload.proposal_id, payload.snapshot_at)?;

        let vote = Vote::new(
            &payload.proposal_id,
            &payload.voter,
            message.source_chain(),
            payload.support,
            payload.weight,
            payload.reason,
            now,
        );
        self.apply(vote, now)
    }

    fn apply(&self, vote: Vote, now: DateTime<Utc>) -> Result<VoteReceipt, VoteError> {
        if !self.registry.is_registered(vote.origin_chain) {
            return Err(VoteError::UnknownChain(vote.origin_chain));
        }

        let mut ballot = self
            .ballots
            .get_mut(&vote.proposal_id)
            .ok_or_else(|| VoteError::ProposalNotFound(vote.proposal_id.clone()))?;
        ballot.check_open(&vote.proposal_id, now)?;

        let key = (vote.voter.clone(), vote.origin_chain);
        if let Some(existing) = ballot.votes.get(&key) {
            if existing.fingerprint == vote.fingerprint {
                debug!("Duplicate vote {} on proposal {}", vote.fingerprint, vote.proposal_id);
                return Ok(VoteReceipt::Duplicate {
                    fingerprint: vote.fingerprint,
                });
            }
            return Err(VoteError::AlreadyVoted {
                proposal_id: vote.proposal_id.clone(),
                voter: vote.voter.clone(),
                origin_chain: vote.origin_chain,
            });
        }

        ballot.tally.add(vote.support, vote.weight);
        ballot
            .by_chain
            .entry(vote.origin_chain)
            .or_default()
            .add(vote.support, vote.weight);
        ballot.votes.insert(key, vote.clone());
        drop(ballot);

        info!(
            "Recorded {} vote of {} from {} on chain {} for proposal {}",
            vote.support, vote.weight, vote.voter, vote.origin_chain, vote.proposal_id
        );
        self.telemetry.report_custom(
            "vote_recorded",
            telemetry_data! {
                "proposal_id" => vote.proposal_id,
                "voter" => vote.voter,
                "origin_chain" => vote.origin_chain,
                "support" => vote.support.to_string(),
                "weight" => vote.weight.to_string(),
            },
        );
        Ok(VoteReceipt::Recorded(vote))
    }

    /// Current totals for a proposal
    pub fn get_tally(&self, proposal_id: &str) -> Result<Tally, VoteError> {
        self.ballots
            .get(proposal_id)
            .map(|b| b.tally)
            .ok_or_else(|| VoteError::ProposalNotFound(proposal_id.to_string()))
    }

    /// Per-chain contribution, limited to registered chains
    pub fn chain_breakdown(&self, proposal_id: &str) -> Result<Vec<ChainVoteStats>, VoteError> {
        let ballot = self
            .ballots
            .get(proposal_id)
            .ok_or_else(|| VoteError::ProposalNotFound(proposal_id.to_string()))?;

        let stats = self
            .registry
            .chain_ids()
            .into_iter()
            .map(|chain_id| ChainVoteStats {
                chain_id,
                tally: ballot.by_chain.get(&chain_id).copied().unwrap_or_default(),
                voters: ballot.votes.keys().filter(|(_, c)| *c == chain_id).count(),
            })
            .collect();
        Ok(stats)
    }

    pub fn has_voted(&self, proposal_id: &str, voter: &str, origin_chain: ChainId) -> bool {
        self.ballots
            .get(proposal_id)
            .map(|b| b.votes.contains_key(&(voter.to_string(), origin_chain)))
            .unwrap_or(false)
    }

    /// Votes on record for a proposal, oldest first
    pub fn votes(&self, proposal_id: &str) -> Vec<Vote> {
        let mut votes: Vec<Vote> = self
            .ballots
            .get(proposal_id)
            .map(|b| b.votes.values().cloned().collect())
            .unwrap_or_default();
        votes.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then_with(|| a.fingerprint.cmp(&b.fingerprint)));
        votes
    }

    /// Freeze the tally and let `decide` pick the closing state, atomically with respect to
    /// concurrent votes
    pub fn close_ballot<F>(&self, proposal_id: &str, decide: F) -> Result<(Tally, ProposalState), VoteError>
    where
        F: FnOnce(&Tally) -> ProposalState,
    {
        let mut ballot = self
            .ballots
            .get_mut(proposal_id)
            .ok_or_else(|| VoteError::ProposalNotFound(proposal_id.to_string()))?;
        let state = decide(&ballot.tally);
        ballot.state = state;
        Ok((ballot.tally, state))
    }
}

#[async_trait]
impl MessageHandler for VoteAggregator {
    async fn handle(&self, message: &AdmittedMessage, now: DateTime<Utc>) -> Result<(), DispatchError> {
        match self.record_remote_vote(message, now) {
            Ok(_) => Ok(()),
            Err(e @ VoteError::ProposalNotFound(_))
            | Err(e @ VoteError::ProposalNotActive { state: ProposalState::Pending, .. }) => {
                debug!("Deferring remote vote {}: {}", message.fingerprint, e);
                Err(DispatchError::Retriable(e.to_string()))
            }
            Err(e) => {
                warn!("Rejected remote vote {}: {}", message.fingerprint, e);
                Err(DispatchError::Refused(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::collaborators::StaticIdentityProvider;
    use crate::governance::message::CrossChainMessage;
    use crate::governance::registry::{ChainRecord, SecurityConfig};
    use chrono::Duration;

    const HUB: ChainId = 1;
    const SAT_A: ChainId = 10;
    const SAT_B: ChainId = 137;

    fn registry() -> Arc<ChainRegistry> {
        let open = || SecurityConfig::new(1, Vec::<String>::new()).unwrap();
        let registry = ChainRegistry::new(ChainRecord::new(HUB, "hub", true, open()));
        registry.register(ChainRecord::new(SAT_A, "a", false, open())).unwrap();
        registry.register(ChainRecord::new(SAT_B, "b", false, open())).unwrap();
        Arc::new(registry)
    }

    fn aggregator() -> VoteAggregator {
        let identity = StaticIdentityProvider::new("hub-operator")
            .with_power("alice", 700_000)
            .with_power("bob", 200_000)
            .with_power("carol", 50_000);
        VoteAggregator::new(HUB, registry(), Arc::new(identity), Arc::new(TelemetryReporter::new(HUB)))
    }

    fn proposal(now: DateTime<Utc>) -> Proposal {
        Proposal {
            id: "p-1".into(),
            proposer: "alice".into(),
            origin_chain: HUB,
            title: "Fee change".into(),
            description: String::new(),
            actions: Vec::new(),
            state: ProposalState::Active,
            tally: Tally::default(),
            quorum: 1_000_000,
            created_at: now,
            snapshot_at: now,
            voting_starts_at: now,
            voting_ends_at: now + Duration::hours(1),
            eta: None,
            execution_deadline: None,
            cancelled_by: None,
            updated_at: now,
        }
    }

    fn relayed(source: ChainId, voter: &str, support: SupportType, weight: Amount, now: DateTime<Utc>) -> AdmittedMessage {
        let payload = VoteRelayPayload {
            proposal_id: "p-1".into(),
            snapshot_at: now,
            voter: voter.into(),
            support,
            weight,
            reason: None,
        };
        let message = CrossChainMessage::with_payload(MessageKind::VoteRelay, source, HUB, 1, &payload).unwrap();
        AdmittedMessage {
            fingerprint: message.fingerprint(),
            message,
            admitted_at: now,
            attested_by: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_tally_sums_distinct_voter_chain_pairs() {
        let now = Utc::now();
        let aggregator = aggregator();
        aggregator.register_proposal(&proposal(now));

        aggregator.record_local_vote("p-1", "alice", SupportType::For, 700_000, None, now).await.unwrap();
        aggregator.record_local_vote("p-1", "bob", SupportType::Against, 200_000, None, now).await.unwrap();
        aggregator.record_local_vote("p-1", "carol", SupportType::Abstain, 50_000, None, now).await.unwrap();
        // Same voter on another chain contributes independently
        aggregator.record_remote_vote(&relayed(SAT_A, "alice", SupportType::For, 100_000, now), now).unwrap();

        let tally = aggregator.get_tally("p-1").unwrap();
        assert_eq!(tally.for_votes, 800_000);
        assert_eq!(tally.against_votes, 200_000);
        assert_eq!(tally.abstain_votes, 50_000);
        assert_eq!(tally.turnout(), 1_050_000);
    }

    #[tokio::test]
    async fn test_identical_remote_vote_applies_once() {
        let now = Utc::now();
        let aggregator = aggregator();
        aggregator.register_proposal(&proposal(now));

        let message = relayed(SAT_A, "dave", SupportType::For, 100_000, now);
        assert!(matches!(aggregator.record_remote_vote(&message, now), Ok(VoteReceipt::Recorded(_))));
        assert!(matches!(aggregator.record_remote_vote(&message, now), Ok(VoteReceipt::Duplicate { .. })));
        assert_eq!(aggregator.get_tally("p-1").unwrap().for_votes, 100_000);
    }

    #[tokio::test]
    async fn test_conflicting_second_vote_is_rejected() {
        let now = Utc::now();
        let aggregator = aggregator();
        aggregator.register_proposal(&proposal(now));

        aggregator.record_remote_vote(&relayed(SAT_A, "dave", SupportType::For, 100, now), now).unwrap();
        let result = aggregator.record_remote_vote(&relayed(SAT_A, "dave", SupportType::Against, 100, now), now);
        assert!(matches!(result, Err(VoteError::AlreadyVoted { origin_chain: SAT_A, .. })));
        assert_eq!(aggregator.get_tally("p-1").unwrap().turnout(), 100);
    }

    #[tokio::test]
    async fn test_tally_is_order_independent() {
        let now = Utc::now();
        let votes = vec![
            relayed(SAT_A, "a", SupportType::For, 5, now),
            relayed(SAT_B, "b", SupportType::Against, 7, now),
            relayed(SAT_A, "c", SupportType::Abstain, 11, now),
            relayed(SAT_B, "a", SupportType::For, 13, now),
        ];

        let forward = aggregator();
        forward.register_proposal(&proposal(now));
        for vote in &votes {
            forward.record_remote_vote(vote, now).unwrap();
        }

        let backward = aggregator();
        backward.register_proposal(&proposal(now));
        for vote in votes.iter().rev() {
            backward.record_remote_vote(vote, now).unwrap();
            // Redelivery in the middle of the sequence changes nothing
            backward.record_remote_vote(vote, now).unwrap();
        }

        assert_eq!(forward.get_tally("p-1").unwrap(), backward.get_tally("p-1").unwrap());
    }

    #[tokio::test]
    async fn test_weight_above_power_is_rejected() {
        let now = Utc::now();
        let aggregator = aggregator();
        aggregator.register_proposal(&proposal(now));

        let result = aggregator.record_local_vote("p-1", "bob", SupportType::For, 200_001, None, now).await;
        assert_eq!(result, Err(VoteError::WeightExceedsPower { weight: 200_001, power: 200_000 }));
        let result = aggregator.record_local_vote("p-1", "nobody", SupportType::For, 1, None, now).await;
        assert!(matches!(result, Err(VoteError::WeightExceedsPower { power: 0, .. })));
        assert_eq!(aggregator.get_tally("p-1").unwrap().turnout(), 0);
    }

    #[tokio::test]
    async fn test_votes_outside_active_window_are_rejected() {
        let now = Utc::now();
        let aggregator = aggregator();
        let mut pending = proposal(now);
        pending.state = ProposalState::Pending;
        pending.voting_starts_at = now + Duration::minutes(5);
        aggregator.register_proposal(&pending);

        let early = aggregator.record_local_vote("p-1", "alice", SupportType::For, 1, None, now).await;
        assert!(matches!(early, Err(VoteError::ProposalNotActive { state: ProposalState::Pending, .. })));

        let late = aggregator
            .record_local_vote("p-1", "alice", SupportType::For, 1, None, now + Duration::hours(2))
            .await;
        assert_eq!(late, Err(VoteError::VotingClosed("p-1".into())));

        aggregator.set_state("p-1", ProposalState::Cancelled).unwrap();
        let cancelled = aggregator
            .record_local_vote("p-1", "alice", SupportType::For, 1, None, now + Duration::minutes(10))
            .await;
        assert!(matches!(cancelled, Err(VoteError::ProposalNotActive { state: ProposalState::Cancelled, .. })));
    }

    #[tokio::test]
    async fn test_remote_vote_against_other_snapshot_is_rejected() {
        let now = Utc::now();
        let aggregator = aggregator();
        aggregator.register_proposal(&proposal(now));

        let later = now + Duration::minutes(10);
        let result = aggregator.record_remote_vote(&relayed(SAT_A, "dave", SupportType::For, 100, later), later);
        assert_eq!(
            result,
            Err(VoteError::SnapshotMismatch {
                proposal_id: "p-1".into(),
                expected: now,
                actual: later,
            })
        );
        assert_eq!(aggregator.get_tally("p-1").unwrap().turnout(), 0);
        assert_eq!(aggregator.snapshot_at("p-1"), Ok(now));
    }

    #[tokio::test]
    async fn test_pending_ballot_opens_with_its_window() {
        let now = Utc::now();
        let aggregator = aggregator();
        let mut pending = proposal(now);
        pending.state = ProposalState::Pending;
        pending.voting_starts_at = now + Duration::minutes(5);
        aggregator.register_proposal(&pending);

        // No lifecycle refresh has run yet
        let inside = now + Duration::minutes(6);
        let result = aggregator.record_local_vote("p-1", "alice", SupportType::For, 1, None, inside).await;
        assert!(matches!(result, Ok(VoteReceipt::Recorded(_))));
    }

    #[tokio::test]
    async fn test_unregistered_origin_chain_is_rejected() {
        let now = Utc::now();
        let aggregator = aggregator();
        aggregator.register_proposal(&proposal(now));
        let result = aggregator.record_remote_vote(&relayed(999, "eve", SupportType::For, 1, now), now);
        assert_eq!(result, Err(VoteError::UnknownChain(999)));
    }

    #[tokio::test]
    async fn test_chain_breakdown_covers_registered_chains() {
        let now = Utc::now();
        let aggregator = aggregator();
        aggregator.register_proposal(&proposal(now));
        aggregator.record_local_vote("p-1", "alice", SupportType::For, 10, None, now).await.unwrap();
        aggregator.record_remote_vote(&relayed(SAT_B, "x", SupportType::Against, 4, now), now).unwrap();

        let breakdown = aggregator.chain_breakdown("p-1").unwrap();
        let chains: Vec<ChainId> = breakdown.iter().map(|s| s.chain_id).collect();
        assert_eq!(chains, vec![HUB, SAT_A, SAT_B]);
        assert_eq!(breakdown[0].tally.for_votes, 10);
        assert_eq!(breakdown[1].voters, 0);
        assert_eq!(breakdown[2].tally.against_votes, 4);
    }

    #[tokio::test]
    async fn test_close_ballot_freezes_votes() {
        let now = Utc::now();
        let aggregator = aggregator();
        aggregator.register_proposal(&proposal(now));
        aggregator.record_local_vote("p-1", "alice", SupportType::For, 10, None, now).await.unwrap();

        let (tally, state) = aggregator
            .close_ballot("p-1", |t| if t.passes(5) { ProposalState::Succeeded } else { ProposalState::Defeated })
            .unwrap();
        assert_eq!(tally.for_votes, 10);
        assert_eq!(state, ProposalState::Succeeded);

        let result = aggregator.record_local_vote("p-1", "bob", SupportType::For, 1, None, now).await;
        assert!(matches!(result, Err(VoteError::ProposalNotActive { state: ProposalState::Succeeded, .. })));
    }
}
