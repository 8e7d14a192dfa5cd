// SPDX-License-Identifier: MIT
//
// Copyright (c) 2025 Noderr Protocol Foundation

//! Cross-chain governance: attested message relay, vote aggregation, proposal lifecycle,
//! two-phase execution and supply audits

pub mod types;
pub mod registry;
pub mod message;
pub mod transport;
pub mod collaborators;
pub mod relay;
pub mod vote_tracker;
pub mod lifecycle;
pub mod finality;
pub mod execution;
pub mod audit;
pub mod engine;

pub use types::{
    Amount,
    ChainId,
    Proposal,
    ProposalAction,
    ProposalDraft,
    ProposalId,
    ProposalState,
    SupportType,
    Tally,
    Vote,
    VoterId,
};
pub use registry::{ChainRecord, ChainRegistry, RegistryError, SecurityConfig};
pub use message::{
    AckStatus,
    AdmittedMessage,
    Attestation,
    CrossChainMessage,
    MessageError,
    MessageKind,
};
pub use transport::{DeliveryHandle, MockTransport, Outbox, Transport, TransportError};
pub use collaborators::{
    ActionExecutor,
    Clock,
    IdentityProvider,
    ManualClock,
    RecordingExecutor,
    StaticIdentityProvider,
    StaticSupplySource,
    SupplySource,
    SystemClock,
};
pub use relay::{AdmissionError, AdmissionResult, DispatchError, DispatchOutcome, MessageHandler, MessageRelay};
pub use vote_tracker::{ChainVoteStats, VoteAggregator, VoteError, VoteReceipt};
pub use lifecycle::{ProposalError, ProposalLifecycle};
pub use finality::{ChainExecutionStatus, ExecutionOutcome, ExecutionPhase, ExecutionRecord};
pub use execution::{ExecutionCoordinator, ExecutionError, ExecutionParticipant, ParticipantState};
pub use audit::{AuditError, AuditStatus, ChainSupplyStatus, SupplyAudit, SupplyAuditor, SupplyReporter};
pub use engine::{EngineBuilder, EngineError, GovernanceEngine, TickReport, VoteSubmission};
