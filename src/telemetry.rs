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

use std::collections::HashMap;

use metrics::{counter, describe_counter};
use serde::{Serialize, Deserialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Fallback log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Listen address for the Prometheus exporter (requires the `telemetry` feature)
    pub prometheus_listen: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            prometheus_listen: None,
        }
    }
}

/// Install the global tracing subscriber. Safe to call more than once.
pub fn init_tracing(config: &TelemetryConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Install the Prometheus exporter if configured
#[cfg(feature = "telemetry")]
pub fn install_prometheus(config: &TelemetryConfig) -> anyhow::Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    if let Some(listen) = &config.prometheus_listen {
        let addr: std::net::SocketAddr = listen.parse()?;
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Prometheus exporter listening on {}", addr);
    }
    Ok(())
}

/// Structured event sink shared by the governance components
#[derive(Debug, Clone)]
pub struct TelemetryReporter {
    /// Chain this engine runs on, attached to every event
    chain_id: u64,
}

impl TelemetryReporter {
    pub fn new(chain_id: u64) -> Self {
        describe_counter!("omnigov_events_total", "Governance events by type");
        Self { chain_id }
    }

    /// Report a named event with arbitrary structured data
    pub fn report_custom(&self, event: &str, data: HashMap<String, serde_json::Value>) {
        let payload = serde_json::Value::Object(data.into_iter().collect());
        info!(
            target: "omnigov::telemetry",
            chain_id = self.chain_id,
            event = event,
            data = %payload,
        );
        counter!("omnigov_events_total", 1, "event" => event.to_string());
    }
}

/// Build a telemetry data map from `key => value` pairs
#[macro_export]
macro_rules! telemetry_data {
    ($($key:expr => $value:expr),* $(,)?) => {{
        let mut data = ::std::collections::HashMap::new();
        $(
            data.insert(
                ($key).to_string(),
                ::serde_json::to_value(&$value).unwrap_or(::serde_json::Value::Null),
            );
        )*
        data
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_custom_accepts_structured_data() {
        let reporter = TelemetryReporter::new(1);
        let data = crate::telemetry_data! {
            "proposal_id" => "p-1",
            "weight" => 42u64,
        };
        assert_eq!(data.len(), 2);
        assert_eq!(data["weight"], serde_json::json!(42));
        reporter.report_custom("vote_recorded", data);
    }

    #[test]
    fn test_init_tracing_is_reentrant() {
        let config = TelemetryConfig::default();
        init_tracing(&config);
        init_tracing(&config);
    }
}
