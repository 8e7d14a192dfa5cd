// SPDX-License-Identifier: MIT
//
// Copyright (c) 2025 Noderr Protocol Foundation

//! Cross-chain message envelope, attestations and typed payloads.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey};
use serde::de::DeserializeOwned;
use serde::{Serialize, Deserialize};
use sha2::{Digest, Sha256};

use crate::governance::types::{Amount, ChainId, ProposalAction, ProposalId, SupportType, VerifierId, VoterId};

/// Domain separator mixed into every message digest
const MESSAGE_DOMAIN: &[u8] = b"omnigov/message/v1";

/// Errors while encoding or decoding message payloads
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Failed to encode payload: {0}")]
    Encode(String),

    #[error("Failed to decode payload: {0}")]
    Decode(String),

    #[error("Expected a {expected} message, got {actual}")]
    WrongKind { expected: MessageKind, actual: MessageKind },
}

/// Message types relayed between chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// A vote cast on a remote chain
    VoteRelay,
    /// Ask a chain for its local supply
    SupplyRequest,
    /// A chain's local supply
    SupplyResponse,
    /// Prepare, commit or abort a proposal's actions
    ExecutionDirective,
    /// Result of an execution directive
    ExecutionAck,
}

impl MessageKind {
    fn as_byte(&self) -> u8 {
        match self {
            MessageKind::VoteRelay => 1,
            MessageKind::SupplyRequest => 2,
            MessageKind::SupplyResponse => 3,
            MessageKind::ExecutionDirective => 4,
            MessageKind::ExecutionAck => 5,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::VoteRelay => write!(f, "vote-relay"),
            MessageKind::SupplyRequest => write!(f, "supply-request"),
            MessageKind::SupplyResponse => write!(f, "supply-response"),
            MessageKind::ExecutionDirective => write!(f, "execution-directive"),
            MessageKind::ExecutionAck => write!(f, "execution-ack"),
        }
    }
}

/// A verifier's signature over a message digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub verifier: VerifierId,
    /// ed25519 signature bytes
    pub signature: Vec<u8>,
}

/// Envelope exchanged between chains
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossChainMessage {
    pub kind: MessageKind,
    pub source_chain: ChainId,
    pub dest_chain: ChainId,
    /// Per-source sequence number, distinguishes otherwise identical messages
    pub nonce: u64,
    pub payload: Vec<u8>,
    pub attestations: Vec<Attestation>,
}

impl CrossChainMessage {
    pub fn new(kind: MessageKind, source_chain: ChainId, dest_chain: ChainId, nonce: u64, payload: Vec<u8>) -> Self {
        Self {
            kind,
            source_chain,
            dest_chain,
            nonce,
            payload,
            attestations: Vec::new(),
        }
    }

    /// Build a message with a JSON-encoded payload
    pub fn with_payload<T: Serialize>(
        kind: MessageKind,
        source_chain: ChainId,
        dest_chain: ChainId,
        nonce: u64,
        payload: &T,
    ) -> Result<Self, MessageError> {
        let bytes = serde_json::to_vec(payload).map_err(|e| MessageError::Encode(e.to_string()))?;
        Ok(Self::new(kind, source_chain, dest_chain, nonce, bytes))
    }

    /// Digest signed by verifiers. Attestations are not part of it.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(MESSAGE_DOMAIN);
        hasher.update([self.kind.as_byte()]);
        hasher.update(self.source_chain.to_be_bytes());
        hasher.update(self.dest_chain.to_be_bytes());
        hasher.update(self.nonce.to_be_bytes());
        hasher.update((self.payload.len() as u64).to_be_bytes());
        hasher.update(&self.payload);
        hasher.finalize().into()
    }

    /// Hex fingerprint used for duplicate suppression
    pub fn fingerprint(&self) -> String {
        hex::encode(self.digest())
    }

    /// Add a verifier attestation
    pub fn attest(&mut self, verifier: impl Into<VerifierId>, key: &SigningKey) {
        let signature = key.sign(&self.digest());
        self.attestations.push(Attestation {
            verifier: verifier.into(),
            signature: signature.to_bytes().to_vec(),
        });
    }

    /// Builder form of [`attest`](Self::attest)
    pub fn attested(mut self, verifier: impl Into<VerifierId>, key: &SigningKey) -> Self {
        self.attest(verifier, key);
        self
    }

    /// Decode the payload, checking the message kind first
    pub fn decode<T: DeserializeOwned>(&self, expected: MessageKind) -> Result<T, MessageError> {
        if self.kind != expected {
            return Err(MessageError::WrongKind { expected, actual: self.kind });
        }
        serde_json::from_slice(&self.payload).map_err(|e| MessageError::Decode(e.to_string()))
    }
}

/// A message that passed admission control
#[derive(Debug, Clone)]
pub struct AdmittedMessage {
    pub message: CrossChainMessage,
    pub fingerprint: String,
    pub admitted_at: DateTime<Utc>,
    /// Verifiers whose attestations were counted
    pub attested_by: Vec<VerifierId>,
}

impl AdmittedMessage {
    pub fn kind(&self) -> MessageKind {
        self.message.kind
    }

    pub fn source_chain(&self) -> ChainId {
        self.message.source_chain
    }

    pub fn decode<T: DeserializeOwned>(&self, expected: MessageKind) -> Result<T, MessageError> {
        self.message.decode(expected)
    }
}

/// A vote cast on the source chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRelayPayload {
    pub proposal_id: ProposalId,
    /// Snapshot the voter's power was checked against
    pub snapshot_at: DateTime<Utc>,
    pub voter: VoterId,
    pub support: SupportType,
    pub weight: Amount,
    pub reason: Option<String>,
}

/// Request for a chain's local supply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyRequestPayload {
    pub audit_id: String,
    pub requested_at: DateTime<Utc>,
}

/// A chain's local supply for an audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyResponsePayload {
    pub audit_id: String,
    pub supply: Amount,
    pub reported_at: DateTime<Utc>,
}

/// Phase requested by an execution directive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirectivePhase {
    Prepare,
    Commit,
    Abort,
}

impl std::fmt::Display for DirectivePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectivePhase::Prepare => write!(f, "prepare"),
            DirectivePhase::Commit => write!(f, "commit"),
            DirectivePhase::Abort => write!(f, "abort"),
        }
    }
}

/// Instruction from the coordinator to a target chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionDirectivePayload {
    pub proposal_id: ProposalId,
    /// Execution attempt the directive belongs to
    pub attempt: u32,
    pub phase: DirectivePhase,
    /// Actions for the receiving chain; empty for commit and abort
    pub actions: Vec<ProposalAction>,
}

/// Outcome reported by a target chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    Prepared,
    PrepareFailed { reason: String },
    Committed,
    CommitFailed { reason: String },
    Aborted,
}

impl std::fmt::Display for AckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AckStatus::Prepared => write!(f, "prepared"),
            AckStatus::PrepareFailed { reason } => write!(f, "prepare failed: {}", reason),
            AckStatus::Committed => write!(f, "committed"),
            AckStatus::CommitFailed { reason } => write!(f, "commit failed: {}", reason),
            AckStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Acknowledgement of an execution directive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionAckPayload {
    pub proposal_id: ProposalId,
    pub attempt: u32,
    pub status: AckStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ed25519_dalek::{Signature, Verifier};

    fn vote_message(nonce: u64) -> CrossChainMessage {
        let payload = VoteRelayPayload {
            proposal_id: "p-1".into(),
            snapshot_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            voter: "alice".into(),
            support: SupportType::For,
            weight: 100_000,
            reason: None,
        };
        CrossChainMessage::with_payload(MessageKind::VoteRelay, 10, 1, nonce, &payload).unwrap()
    }

    #[test]
    fn test_fingerprint_ignores_attestations() {
        let key = SigningKey::from_bytes(&[7; 32]);
        let plain = vote_message(1);
        let attested = plain.clone().attested("v1", &key);
        assert_eq!(plain.fingerprint(), attested.fingerprint());
        assert_ne!(plain.fingerprint(), vote_message(2).fingerprint());
    }

    #[test]
    fn test_attestation_verifies_over_digest() {
        let key = SigningKey::from_bytes(&[7; 32]);
        let message = vote_message(1).attested("v1", &key);
        let attestation = &message.attestations[0];
        let signature = Signature::from_slice(&attestation.signature).unwrap();
        assert!(key.verifying_key().verify(&message.digest(), &signature).is_ok());
    }

    #[test]
    fn test_decode_checks_kind() {
        let message = vote_message(1);
        let payload: VoteRelayPayload = message.decode(MessageKind::VoteRelay).unwrap();
        assert_eq!(payload.weight, 100_000);

        let wrong = message.decode::<SupplyResponsePayload>(MessageKind::SupplyResponse);
        assert!(matches!(wrong, Err(MessageError::WrongKind { .. })));
    }

    #[test]
    fn test_large_amounts_survive_encoding() {
        let payload = SupplyResponsePayload {
            audit_id: "a".into(),
            supply: u128::MAX,
            reported_at: Utc::now(),
        };
        let message = CrossChainMessage::with_payload(MessageKind::SupplyResponse, 10, 1, 0, &payload).unwrap();
        let decoded: SupplyResponsePayload = message.decode(MessageKind::SupplyResponse).unwrap();
        assert_eq!(decoded.supply, u128::MAX);
    }
}
