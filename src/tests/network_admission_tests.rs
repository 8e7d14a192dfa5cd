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

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::SigningKey;

use crate::governance::finality::ExecutionOutcome;
use crate::governance::message::{
    CrossChainMessage, DirectivePhase, ExecutionDirectivePayload, MessageKind, VoteRelayPayload,
};
use crate::governance::relay::{AdmissionResult, DispatchOutcome};
use crate::governance::engine::{EngineError, VoteSubmission};
use crate::governance::types::{Proposal, ProposalAction, ProposalDraft, SupportType};
use crate::governance::vote_tracker::VoteError;
use crate::simulation::network::{simulator_signing_key, LocalNetwork};
use crate::simulation::scenarios::{reference_config, Simulation, HUB_CHAIN, SATELLITE_A, SATELLITE_B};

fn vote_message(proposal: &Proposal, nonce: u64) -> CrossChainMessage {
    vote_message_at(proposal, proposal.snapshot_at, nonce)
}

fn vote_message_at(proposal: &Proposal, snapshot_at: DateTime<Utc>, nonce: u64) -> CrossChainMessage {
    let payload = VoteRelayPayload {
        proposal_id: proposal.id.clone(),
        snapshot_at,
        voter: "bob".to_string(),
        support: SupportType::For,
        weight: 200_000,
        reason: None,
    };
    CrossChainMessage::with_payload(MessageKind::VoteRelay, SATELLITE_A, HUB_CHAIN, nonce, &payload)
        .unwrap()
        .attested("verifier-a", &simulator_signing_key("verifier-a"))
}

async fn open_proposal(sim: &Simulation) -> Proposal {
    let hub = sim.hub();
    hub.identity.set_power("alice", 1);
    let draft = ProposalDraft {
        title: "Pause bridge".to_string(),
        description: "Pause the bridge on satellite A".to_string(),
        actions: vec![ProposalAction::new(SATELLITE_A, b"pause".to_vec())],
    };
    hub.engine.propose("alice", draft).await.unwrap()
}

#[tokio::test]
async fn test_redelivered_message_is_counted_once() {
    let sim = Simulation::new(reference_config()).await.unwrap();
    let proposal = open_proposal(&sim).await;
    let hub = sim.hub();

    let message = vote_message(&proposal, 7);
    let first = hub.engine.submit(message.clone()).await;
    assert!(matches!(
        first,
        AdmissionResult::Admitted {
            outcome: DispatchOutcome::Delivered,
            ..
        }
    ));

    let second = hub.engine.submit(message).await;
    assert_eq!(second.reason_code(), Some("DUPLICATE_FINGERPRINT"));
    assert_eq!(hub.engine.get_tally(&proposal.id).unwrap().for_votes, 200_000);
}

#[tokio::test]
async fn test_forged_and_unknown_messages_are_rejected() {
    let sim = Simulation::new(reference_config()).await.unwrap();
    let proposal = open_proposal(&sim).await;
    let hub = sim.hub();

    // Right verifier name, wrong key
    let forged = CrossChainMessage::with_payload(
        MessageKind::VoteRelay,
        SATELLITE_A,
        HUB_CHAIN,
        1,
        &VoteRelayPayload {
            proposal_id: proposal.id.clone(),
            snapshot_at: proposal.snapshot_at,
            voter: "mallory".to_string(),
            support: SupportType::For,
            weight: 1_000_000,
            reason: None,
        },
    )
    .unwrap()
    .attested("verifier-a", &SigningKey::from_bytes(&[7u8; 32]));
    assert_eq!(
        hub.engine.submit(forged).await.reason_code(),
        Some("INSUFFICIENT_ATTESTATIONS")
    );

    let mut unknown_source = vote_message(&proposal, 2);
    unknown_source.source_chain = 999;
    assert_eq!(hub.engine.submit(unknown_source).await.reason_code(), Some("UNKNOWN_CHAIN"));

    let satellite = sim.chain(SATELLITE_B).unwrap();
    assert_eq!(
        satellite.engine.submit(vote_message(&proposal, 3)).await.reason_code(),
        Some("WRONG_DESTINATION")
    );
    assert_eq!(hub.engine.get_tally(&proposal.id).unwrap().turnout(), 0);
}

#[tokio::test]
async fn test_power_gained_after_snapshot_cannot_vote_remotely() {
    let sim = Simulation::new(reference_config()).await.unwrap();
    let proposal = open_proposal(&sim).await;
    let hub = sim.hub();
    let sat_a = sim.chain(SATELLITE_A).unwrap();

    // Bob holds nothing at the snapshot and acquires power a minute later
    sat_a.identity.set_power("bob", 0);
    sat_a
        .identity
        .set_power_from("bob", 200_000, proposal.snapshot_at + Duration::seconds(60));
    sim.advance(Duration::seconds(120)).await;

    let result = sat_a
        .engine
        .cast_vote(&proposal.id, proposal.snapshot_at, "bob", SupportType::For, 200_000, None)
        .await;
    assert!(matches!(
        result,
        Err(EngineError::Vote(VoteError::WeightExceedsPower { power: 0, .. }))
    ));

    // Naming a later snapshot is refused by the hub
    let now = hub.engine.now();
    let relayed = sat_a
        .engine
        .cast_vote(&proposal.id, now, "bob", SupportType::For, 200_000, None)
        .await
        .unwrap();
    assert!(matches!(relayed, VoteSubmission::Relayed(Some(_))));
    sim.settle().await;
    let to_hub: Vec<_> = sim
        .network
        .log()
        .into_iter()
        .filter(|d| d.dest_chain == HUB_CHAIN)
        .collect();
    assert_eq!(to_hub.len(), 1);
    assert!(matches!(
        to_hub[0].result,
        AdmissionResult::Admitted {
            outcome: DispatchOutcome::Refused(_),
            ..
        }
    ));

    let forged = vote_message_at(&proposal, now, 9);
    assert!(matches!(
        hub.engine.submit(forged).await,
        AdmissionResult::Admitted {
            outcome: DispatchOutcome::Refused(_),
            ..
        }
    ));
    assert_eq!(hub.engine.get_tally(&proposal.id).unwrap().turnout(), 0);
}

#[tokio::test]
async fn test_high_security_chain_needs_more_attestations() {
    // Only verifier-a signs: enough for level 1 and 2 chains, not for level 4 with three verifiers
    let sim = Simulation::with_network(reference_config(), LocalNetwork::with_signers(["verifier-a"]))
        .await
        .unwrap();
    let hub = sim.hub();
    hub.identity.set_power("alice", 1_000_000);
    let draft = ProposalDraft {
        title: "Rotate keys".to_string(),
        description: "Rotate relayer keys".to_string(),
        actions: vec![
            ProposalAction::new(SATELLITE_A, b"rotate".to_vec()),
            ProposalAction::new(SATELLITE_B, b"rotate".to_vec()),
        ],
    };
    let proposal = hub.engine.propose("alice", draft).await.unwrap();
    hub.engine
        .cast_vote(&proposal.id, proposal.snapshot_at, "alice", SupportType::For, 1_000_000, None)
        .await
        .unwrap();
    sim.advance(Duration::seconds(3600)).await;
    sim.advance(Duration::seconds(600)).await;

    let rejected: Vec<_> = sim
        .network
        .log()
        .into_iter()
        .filter(|d| d.dest_chain == SATELLITE_B)
        .collect();
    assert!(!rejected.is_empty());
    assert!(rejected
        .iter()
        .all(|d| d.result.reason_code() == Some("INSUFFICIENT_ATTESTATIONS")));
    assert!(sim.chain(SATELLITE_A).unwrap().executor.is_prepared(&proposal.id));

    sim.advance(Duration::seconds(300)).await;
    let record = hub.engine.get_execution_status(&proposal.id).unwrap();
    assert_eq!(record.outcome, ExecutionOutcome::Aborted);
    assert!(sim.chain(SATELLITE_A).unwrap().executor.aborted().contains(&proposal.id));
}

#[tokio::test]
async fn test_satellite_obeys_only_the_hub() {
    let sim = Simulation::new(reference_config()).await.unwrap();
    let satellite = sim.chain(SATELLITE_B).unwrap();

    let directive = ExecutionDirectivePayload {
        proposal_id: "p-rogue".to_string(),
        attempt: 1,
        phase: DirectivePhase::Prepare,
        actions: vec![ProposalAction::new(SATELLITE_B, b"drain".to_vec())],
    };
    let mut message =
        CrossChainMessage::with_payload(MessageKind::ExecutionDirective, SATELLITE_A, SATELLITE_B, 1, &directive)
            .unwrap();
    for verifier in ["verifier-a", "verifier-b", "verifier-c"] {
        message.attest(verifier, &simulator_signing_key(verifier));
    }

    let result = satellite.engine.submit(message).await;
    assert!(matches!(
        result,
        AdmissionResult::Admitted {
            outcome: DispatchOutcome::Refused(_),
            ..
        }
    ));
    assert!(!satellite.executor.is_prepared("p-rogue"));
}
