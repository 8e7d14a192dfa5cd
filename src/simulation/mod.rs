// SPDX-License-Identifier: MIT
//
// Copyright (c) 2025 Noderr Protocol Foundation

//! In-process multi-chain simulation

pub mod network;
pub mod scenarios;

pub use network::{simulator_signing_key, simulator_verifiers, DeliveryRecord, LocalNetwork, SIMULATOR_VERIFIERS};
pub use scenarios::{reference_config, run_reference_scenarios, ScenarioReport, SimulatedChain, Simulation};
