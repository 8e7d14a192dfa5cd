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

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use omnigov_core::config::EngineConfig;
use omnigov_core::governance::registry::ChainRegistry;
use omnigov_core::simulation::run_reference_scenarios;
use omnigov_core::telemetry::{init_tracing, TelemetryConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate an engine configuration
    Validate {
        /// Configuration file (TOML or JSON)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Run the reference scenarios on an in-process network
    Simulate {
        /// Print reports as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => validate(config),
        Commands::Simulate { json } => simulate(json).await,
    }
}

/// Print the chains and attestation thresholds of a configuration
fn validate(path: PathBuf) -> anyhow::Result<()> {
    let config = EngineConfig::load(Some(path.as_path()))
        .with_context(|| format!("loading {}", path.display()))?;
    init_tracing(&config.telemetry);

    let registry = ChainRegistry::from_config(&config)?;
    info!("{} is valid; local chain {}", path.display(), config.local_chain);
    for record in registry.records() {
        let required = registry
            .security(record.id)?
            .required_attestations()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "none (inbound disabled)".to_string());
        println!(
            "chain {:>6} {:<20} {} level {} attestations required: {}",
            record.id,
            record.name,
            if record.is_hub { "hub      " } else { "satellite" },
            record.security.level,
            required
        );
    }
    Ok(())
}

async fn simulate(json: bool) -> anyhow::Result<()> {
    init_tracing(&TelemetryConfig::default());
    #[cfg(feature = "telemetry")]
    omnigov_core::telemetry::install_prometheus(&TelemetryConfig::default())?;

    let reports = run_reference_scenarios().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!("[{}] {}", if report.passed { "pass" } else { "FAIL" }, report.name);
            for line in &report.details {
                println!("    {}", line);
            }
        }
    }

    let failed: Vec<&str> = reports.iter().filter(|r| !r.passed).map(|r| r.name).collect();
    if !failed.is_empty() {
        error!("Scenarios failed: {:?}", failed);
        bail!("{} scenario(s) failed", failed.len());
    }
    Ok(())
}
