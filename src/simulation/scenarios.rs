// SPDX-License-Identifier: MIT
//
// Copyright (c) 2025 Noderr Protocol Foundation

//! Multi-chain harness over [`LocalNetwork`] and the reference scenarios run by
//! `omnigov-sim simulate`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::{
    AuditConfig, ChainConfig, ConfigError, EngineConfig, ExecutionConfig, GovernanceConfig, RelayConfig,
};
use crate::governance::audit::AuditStatus;
use crate::governance::collaborators::{
    Clock, ManualClock, RecordingExecutor, StaticIdentityProvider, StaticSupplySource,
};
use crate::governance::engine::{EngineError, GovernanceEngine, TickReport};
use crate::governance::finality::ExecutionOutcome;
use crate::governance::types::{ChainId, ProposalAction, ProposalDraft, ProposalState, SupportType};
use crate::simulation::network::{simulator_verifiers, LocalNetwork};

pub const HUB_CHAIN: ChainId = 1;
pub const SATELLITE_A: ChainId = 10;
pub const SATELLITE_B: ChainId = 137;

/// Three-chain configuration signed by the simulator verifiers
pub fn reference_config() -> EngineConfig {
    let chain = |id: ChainId, name: &str, hub: bool, security_level: u8, verifiers: &[&str]| ChainConfig {
        id,
        name: name.to_string(),
        hub,
        security_level,
        verifiers: verifiers.iter().map(|v| v.to_string()).collect(),
    };

    EngineConfig {
        local_chain: HUB_CHAIN,
        chains: vec![
            chain(HUB_CHAIN, "Hub", true, 2, &["verifier-a", "verifier-b"]),
            chain(SATELLITE_A, "Satellite A", false, 1, &["verifier-a", "verifier-b"]),
            chain(SATELLITE_B, "Satellite B", false, 4, &["verifier-a", "verifier-b", "verifier-c"]),
        ],
        verifiers: simulator_verifiers(),
        governance: GovernanceConfig {
            voting_delay_secs: 0,
            voting_period_secs: 3600,
            execution_delay_secs: 600,
            execution_timeout_secs: 86_400,
            quorum_votes: 1_000_000,
            proposal_threshold: 0,
            max_execution_attempts: 3,
            auto_queue: true,
            guardians: vec!["guardian".into()],
        },
        relay: RelayConfig::default(),
        execution: ExecutionConfig {
            prepare_timeout_secs: 300,
            commit_timeout_secs: 300,
            max_commit_retries: 3,
            ..ExecutionConfig::default()
        },
        audit: AuditConfig {
            response_timeout_secs: 120,
            interval_secs: None,
            operators: vec!["operator".into()],
            ..AuditConfig::default()
        },
        telemetry: Default::default(),
        redis: None,
    }
}

/// One chain in a simulation and its collaborators
#[derive(Clone)]
pub struct SimulatedChain {
    pub engine: Arc<GovernanceEngine>,
    pub identity: Arc<StaticIdentityProvider>,
    pub supply: Arc<StaticSupplySource>,
    pub executor: Arc<RecordingExecutor>,
}

/// Engines for every configured chain sharing one network and one clock
pub struct Simulation {
    pub network: Arc<LocalNetwork>,
    pub clock: Arc<ManualClock>,
    chains: BTreeMap<ChainId, SimulatedChain>,
    hub: SimulatedChain,
}

impl Simulation {
    pub async fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_network(config, LocalNetwork::new()).await
    }

    pub async fn with_network(config: EngineConfig, network: LocalNetwork) -> Result<Self, EngineError> {
        config.validate()?;
        let network = Arc::new(network);
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let mut chains = BTreeMap::new();
        for chain in &config.chains {
            let identity = Arc::new(StaticIdentityProvider::new(format!("operator-{}", chain.id)));
            let supply = Arc::new(StaticSupplySource::new(0, 0));
            let executor = Arc::new(RecordingExecutor::new());
            let engine = GovernanceEngine::builder(config.for_chain(chain.id))
                .transport(network.clone())
                .identity(identity.clone())
                .supply_source(supply.clone())
                .executor(executor.clone())
                .clock(clock.clone())
                .build()
                .await?;
            let engine = Arc::new(engine);
            network.attach(&engine);
            chains.insert(
                chain.id,
                SimulatedChain {
                    engine,
                    identity,
                    supply,
                    executor,
                },
            );
        }

        let hub_id = config
            .hub()
            .map(|c| c.id)
            .ok_or_else(|| ConfigError::Invalid("no hub chain configured".into()))?;
        let hub = chains
            .get(&hub_id)
            .cloned()
            .ok_or_else(|| ConfigError::Invalid(format!("hub chain {} not built", hub_id)))?;

        Ok(Self {
            network,
            clock,
            chains,
            hub,
        })
    }

    pub fn hub(&self) -> &SimulatedChain {
        &self.hub
    }

    pub fn chain(&self, chain_id: ChainId) -> Option<&SimulatedChain> {
        self.chains.get(&chain_id)
    }

    /// Deliver everything in flight
    pub async fn settle(&self) -> usize {
        self.network.deliver_all().await
    }

    /// Tick every engine at the current simulated time, then settle. Returns the hub's report.
    pub async fn tick(&self) -> TickReport {
        let now = self.clock.now();
        for (chain_id, chain) in &self.chains {
            if *chain_id != self.hub.engine.local_chain() {
                chain.engine.tick(now).await;
            }
        }
        let report = self.hub.engine.tick(now).await;
        self.settle().await;
        report
    }

    /// Move the clock forward and tick
    pub async fn advance(&self, by: Duration) -> TickReport {
        self.clock.advance(by);
        self.tick().await
    }
}

/// Outcome of a reference scenario
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: &'static str,
    pub passed: bool,
    pub details: Vec<String>,
}

fn draft(title: &str, targets: &[ChainId]) -> ProposalDraft {
    ProposalDraft {
        title: title.to_string(),
        description: format!("{} on chains {:?}", title, targets),
        actions: targets
            .iter()
            .map(|chain| ProposalAction::new(*chain, format!("set-param:{}", title).into_bytes()))
            .collect(),
    }
}

fn chain_of(sim: &Simulation, chain_id: ChainId) -> Result<&SimulatedChain, EngineError> {
    sim.chain(chain_id)
        .ok_or_else(|| ConfigError::Invalid(format!("chain {} missing from simulation", chain_id)).into())
}

/// Votes from three chains are merged; 950k turnout misses a 1M quorum, 1.05M meets it
pub async fn quorum_scenario() -> Result<ScenarioReport, EngineError> {
    let sim = Simulation::new(reference_config()).await?;
    let hub = sim.hub();
    let sat_a = chain_of(&sim, SATELLITE_A)?;
    let sat_b = chain_of(&sim, SATELLITE_B)?;
    hub.identity.set_power("alice", 700_000);
    sat_a.identity.set_power("bob", 200_000);
    sat_b.identity.set_power("carol", 50_000);
    sat_b.identity.set_power("dave", 100_000);

    let mut details = Vec::new();
    let mut outcomes = Vec::new();
    for (title, extra_voter) in [("below-quorum", false), ("quorum-met", true)] {
        let proposal = hub.engine.propose("alice", draft(title, &[SATELLITE_A])).await?;
        hub.engine
            .cast_vote(&proposal.id, proposal.snapshot_at, "alice", SupportType::For, 700_000, None)
            .await?;
        sat_a
            .engine
            .cast_vote(&proposal.id, proposal.snapshot_at, "bob", SupportType::Against, 200_000, None)
            .await?;
        sat_b
            .engine
            .cast_vote(&proposal.id, proposal.snapshot_at, "carol", SupportType::Abstain, 50_000, None)
            .await?;
        if extra_voter {
            sat_b
                .engine
                .cast_vote(&proposal.id, proposal.snapshot_at, "dave", SupportType::For, 100_000, None)
                .await?;
        }
        sim.settle().await;

        let tally = hub.engine.get_tally(&proposal.id)?;
        sim.advance(Duration::seconds(3600)).await;
        let state = hub.engine.get_proposal(&proposal.id).map(|p| p.state);
        details.push(format!(
            "{}: for {} against {} abstain {} -> {:?}",
            title, tally.for_votes, tally.against_votes, tally.abstain_votes, state
        ));
        outcomes.push(state);
    }

    let passed = outcomes.first() == Some(&Some(ProposalState::Defeated))
        && outcomes.get(1) == Some(&Some(ProposalState::Queued));
    Ok(ScenarioReport {
        name: "quorum",
        passed,
        details,
    })
}

/// A chain failing to prepare aborts the whole rollout; the retry after it recovers commits everywhere
pub async fn rollout_scenario() -> Result<ScenarioReport, EngineError> {
    let sim = Simulation::new(reference_config()).await?;
    let hub = sim.hub();
    let sat_a = chain_of(&sim, SATELLITE_A)?;
    let sat_b = chain_of(&sim, SATELLITE_B)?;
    hub.identity.set_power("alice", 1_000_000);

    let proposal = hub
        .engine
        .propose("alice", draft("rollout", &[HUB_CHAIN, SATELLITE_A, SATELLITE_B]))
        .await?;
    hub.engine
        .cast_vote(&proposal.id, proposal.snapshot_at, "alice", SupportType::For, 1_000_000, None)
        .await?;
    sim.advance(Duration::seconds(3600)).await;

    let mut details = Vec::new();
    sat_b.executor.fail_prepare("insufficient liquidity");
    sim.advance(Duration::seconds(600)).await;

    let first = hub.engine.get_execution_status(&proposal.id);
    let first_aborted = first
        .as_ref()
        .map(|r| r.outcome == ExecutionOutcome::Aborted && r.attempt == 1)
        .unwrap_or(false);
    let released = hub.executor.aborted().contains(&proposal.id) && sat_a.executor.aborted().contains(&proposal.id);
    let nothing_committed = [hub, sat_a, sat_b].iter().all(|c| c.executor.committed().is_empty());
    if let Some(record) = &first {
        details.push(format!(
            "attempt {}: {} ({})",
            record.attempt,
            record.outcome,
            record.diagnostics.join("; ")
        ));
    }

    sat_b.executor.clear_failures();
    sim.advance(Duration::seconds(1)).await;
    let second = hub.engine.get_execution_status(&proposal.id);
    let second_succeeded = second
        .as_ref()
        .map(|r| r.outcome == ExecutionOutcome::Success && r.attempt == 2)
        .unwrap_or(false);
    let committed_everywhere = [hub, sat_a, sat_b]
        .iter()
        .all(|c| c.executor.committed() == vec![proposal.id.clone()]);
    let state = hub.engine.get_proposal(&proposal.id).map(|p| p.state);
    if let Some(record) = &second {
        details.push(format!("attempt {}: {}", record.attempt, record.outcome));
    }
    details.push(format!("proposal {:?}", state));

    Ok(ScenarioReport {
        name: "atomic-rollout",
        passed: first_aborted
            && released
            && nothing_committed
            && second_succeeded
            && committed_everywhere
            && state == Some(ProposalState::Executed),
        details,
    })
}

/// A 1,000 token shortfall is reported, reconciled by an operator and verified once fixed
pub async fn audit_scenario() -> Result<ScenarioReport, EngineError> {
    let sim = Simulation::new(reference_config()).await?;
    let hub = sim.hub();
    let sat_a = chain_of(&sim, SATELLITE_A)?;
    let sat_b = chain_of(&sim, SATELLITE_B)?;
    hub.supply.set_expected_total(100_000_000);
    sat_a.supply.set_local(50_000_000);
    sat_b.supply.set_local(49_999_000);

    let mut details = Vec::new();
    let first = hub.engine.initiate_audit().await?;
    sim.settle().await;
    let mismatched = hub.engine.get_latest_audit();
    if let Some(audit) = &mismatched {
        details.push(format!("audit {}: {} ({})", audit.id, audit.status, audit.diagnostic));
    }
    let reconciled = hub.engine.reconcile(&first, "operator", "bridge refund in flight")?;

    sat_b.supply.set_local(50_000_000);
    hub.engine.initiate_audit().await?;
    sim.settle().await;
    let verified = hub.engine.get_latest_audit();
    if let Some(audit) = &verified {
        details.push(format!("audit {}: {} ({})", audit.id, audit.status, audit.diagnostic));
    }

    info!("Audit scenario finished with {} audits on record", hub.engine.audit_history(10).len());
    Ok(ScenarioReport {
        name: "supply-audit",
        passed: mismatched.map(|a| a.status) == Some(AuditStatus::Mismatched)
            && reconciled.status == AuditStatus::Reconciled
            && verified.map(|a| a.status) == Some(AuditStatus::Verified),
        details,
    })
}

/// Run every reference scenario
pub async fn run_reference_scenarios() -> Result<Vec<ScenarioReport>, EngineError> {
    Ok(vec![
        quorum_scenario().await?,
        rollout_scenario().await?,
        audit_scenario().await?,
    ])
}
