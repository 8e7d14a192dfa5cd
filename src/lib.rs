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

//! Cross-chain governance coordination engine.
//!
//! A hub chain owns proposals and tallies; satellite chains relay votes, execute directives
//! and report supply. Every cross-chain message passes the [`governance::MessageRelay`]
//! attestation gate before any component sees it.

pub mod config;
pub mod redis;
pub mod storage;
pub mod telemetry;
pub mod governance;
pub mod simulation;

#[cfg(test)]
mod tests;

// Re-export common types
pub use config::{ConfigError, EngineConfig};
pub use storage::{FingerprintStore, MemoryFingerprintStore, StoreError};
pub use telemetry::TelemetryReporter;
pub use governance::{
    AdmissionResult, CrossChainMessage, EngineError, GovernanceEngine, MessageKind, Proposal, ProposalState,
    SupplyAudit, Tally, VoteSubmission,
};
pub use simulation::{LocalNetwork, Simulation};
