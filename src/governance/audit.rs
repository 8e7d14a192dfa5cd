// SPDX-License-Identifier: MIT
//
// Copyright (c) 2025 Noderr Protocol Foundation

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Serialize, Deserialize};
use tracing::{debug, error, info, warn};

use crate::config::AuditConfig;
use crate::governance::collaborators::SupplySource;
use crate::governance::message::{AdmittedMessage, MessageKind, SupplyRequestPayload, SupplyResponsePayload};
use crate::governance::registry::ChainRegistry;
use crate::governance::relay::{DispatchError, MessageHandler};
use crate::governance::transport::Outbox;
use crate::governance::types::{Amount, ChainId, VoterId};
use crate::telemetry::TelemetryReporter;
use crate::telemetry_data;

/// Supply audit error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("Audit not found: {0}")]
    AuditNotFound(String),

    #[error("Audit {0} is already finalized")]
    AuditClosed(String),

    #[error("Chain {chain_id} is not part of audit {audit_id}")]
    NotParticipant { audit_id: String, chain_id: ChainId },

    #[error("Chain {chain_id} already reported for audit {audit_id}")]
    AlreadyReported { audit_id: String, chain_id: ChainId },

    #[error("Response deadline of audit {0} has passed")]
    DeadlinePassed(String),

    #[error("Audit {0} is still waiting for responses")]
    NotDue(String),

    #[error("Audit {audit_id} is {status}; only mismatched audits can be reconciled")]
    NotMismatched { audit_id: String, status: AuditStatus },

    #[error("{0} is not an audit operator")]
    Unauthorized(VoterId),

    #[error("Request from chain {0}, which is not the hub")]
    UnexpectedSource(ChainId),

    #[error("Supply source error: {0}")]
    Supply(String),

    #[error("Malformed supply message: {0}")]
    Decode(String),
}

/// Audit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditStatus {
    /// Waiting for supply responses
    Pending,
    /// Every chain answered and the sum matches
    Verified,
    /// The sum differs or a chain is unverified
    Mismatched,
    /// An operator acknowledged the mismatch
    Reconciled,
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditStatus::Pending => write!(f, "pending"),
            AuditStatus::Verified => write!(f, "verified"),
            AuditStatus::Mismatched => write!(f, "mismatched"),
            AuditStatus::Reconciled => write!(f, "reconciled"),
        }
    }
}

/// What an audit knows about one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainSupplyStatus {
    Awaiting,
    Reported { supply: Amount, reported_at: DateTime<Utc> },
    Unverified { reason: String },
}

/// One run of the cross-chain supply check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyAudit {
    pub id: String,
    pub started_at: DateTime<Utc>,
    /// Responses after this are refused
    pub deadline: DateTime<Utc>,
    /// Protocol-wide total captured from the hub at initiation
    pub expected_total: Amount,
    /// Sum of reported supplies, set on finalization
    pub observed_total: Amount,
    pub status: AuditStatus,
    pub chains: BTreeMap<ChainId, ChainSupplyStatus>,
    pub diagnostic: String,
    pub finalized_at: Option<DateTime<Utc>>,
    pub reconciled_by: Option<VoterId>,
    pub reconciliation_note: Option<String>,
}

impl SupplyAudit {
    pub fn all_reported(&self) -> bool {
        self.chains
            .values()
            .all(|s| matches!(s, ChainSupplyStatus::Reported { .. }))
    }

    pub fn unverified(&self) -> Vec<ChainId> {
        self.chains
            .iter()
            .filter(|(_, s)| matches!(s, ChainSupplyStatus::Unverified { .. }))
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Checks that supply recorded on every registered chain sums to the hub's expected total.
///
/// Drift is reported, never corrected: reconciliation is an operator acknowledgement.
pub struct SupplyAuditor {
    registry: Arc<ChainRegistry>,
    supply: Arc<dyn SupplySource>,
    outbox: Arc<Outbox>,
    telemetry: Arc<TelemetryReporter>,
    config: AuditConfig,
    audits: DashMap<String, SupplyAudit>,
    /// Audit ids in initiation order
    order: RwLock<Vec<String>>,
}

impl SupplyAuditor {
    pub fn new(
        registry: Arc<ChainRegistry>,
        supply: Arc<dyn SupplySource>,
        outbox: Arc<Outbox>,
        telemetry: Arc<TelemetryReporter>,
        config: AuditConfig,
    ) -> Self {
        Self {
            registry,
            supply,
            outbox,
            telemetry,
            config,
            audits: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Snapshot the expected total and ask every registered chain for its supply
    pub async fn initiate_audit(&self, now: DateTime<Utc>) -> Result<String, AuditError> {
        let expected_total = self.supply.expected_total_supply().await.map_err(AuditError::Supply)?;
        let hub_supply = self.supply.local_supply().await.map_err(AuditError::Supply)?;
        let hub = self.registry.hub_id();

        let id = uuid::Uuid::new_v4().to_string();
        let mut chains: BTreeMap<ChainId, ChainSupplyStatus> = self
            .registry
            .chain_ids()
            .into_iter()
            .map(|chain_id| (chain_id, ChainSupplyStatus::Awaiting))
            .collect();
        chains.insert(
            hub,
            ChainSupplyStatus::Reported {
                supply: hub_supply,
                reported_at: now,
            },
        );
        if let Err(e) = self.registry.record_supply(hub, hub_supply, now) {
            warn!("Could not record hub supply: {}", e);
        }

        let satellites: Vec<ChainId> = chains.keys().copied().filter(|c| *c != hub).collect();
        let audit = SupplyAudit {
            id: id.clone(),
            started_at: now,
            deadline: now + self.config.response_timeout(),
            expected_total,
            observed_total: 0,
            status: AuditStatus::Pending,
            chains,
            diagnostic: String::new(),
            finalized_at: None,
            reconciled_by: None,
            reconciliation_note: None,
        };
        self.audits.insert(id.clone(), audit);
        self.order.write().push(id.clone());
        self.prune_history();

        info!(
            "Supply audit {} started: expected {} across chains {:?}",
            id, expected_total, self.registry.chain_ids()
        );
        self.telemetry.report_custom(
            "supply_audit_started",
            telemetry_data! {
                "audit_id" => id,
                "expected_total" => expected_total.to_string(),
                "chains" => satellites,
            },
        );

        let request = SupplyRequestPayload {
            audit_id: id.clone(),
            requested_at: now,
        };
        for chain_id in satellites {
            match self.outbox.post(MessageKind::SupplyRequest, chain_id, &request).await {
                Ok(Some(_)) => debug!("Requested supply from chain {} for audit {}", chain_id, id),
                Ok(None) => warn!("Supply request to chain {} for audit {} waiting for retry", chain_id, id),
                Err(e) => error!("Failed to encode supply request for audit {}: {}", id, e),
            }
        }
        Ok(id)
    }

    /// Store a chain's reported supply. Returns true once every chain has answered.
    pub fn record_supply_response(&self, message: &AdmittedMessage, now: DateTime<Utc>) -> Result<bool, AuditError> {
        let response: SupplyResponsePayload = message
            .decode(MessageKind::SupplyResponse)
            .map_err(|e| AuditError::Decode(e.to_string()))?;
        let chain_id = message.source_chain();

        let mut audit = self
            .audits
            .get_mut(&response.audit_id)
            .ok_or_else(|| AuditError::AuditNotFound(response.audit_id.clone()))?;
        if audit.status != AuditStatus::Pending {
            return Err(AuditError::AuditClosed(response.audit_id));
        }
        if now > audit.deadline {
            return Err(AuditError::DeadlinePassed(response.audit_id));
        }
        match audit.chains.get(&chain_id) {
            None => {
                return Err(AuditError::NotParticipant {
                    audit_id: response.audit_id,
                    chain_id,
                })
            }
            Some(ChainSupplyStatus::Awaiting) => {}
            Some(_) => {
                return Err(AuditError::AlreadyReported {
                    audit_id: response.audit_id,
                    chain_id,
                })
            }
        }

        audit.chains.insert(
            chain_id,
            ChainSupplyStatus::Reported {
                supply: response.supply,
                reported_at: now,
            },
        );
        let complete = audit.all_reported();
        drop(audit);

        if let Err(e) = self.registry.record_supply(chain_id, response.supply, now) {
            warn!("Supply reported by chain {} that left the registry: {}", chain_id, e);
        }
        debug!("Chain {} reported supply {} for audit {}", chain_id, response.supply, response.audit_id);
        Ok(complete)
    }

    /// Compare the observed sum against the expected total
    pub fn finalize_audit(&self, audit_id: &str, now: DateTime<Utc>) -> Result<SupplyAudit, AuditError> {
        let mut audit = self
            .audits
            .get_mut(audit_id)
            .ok_or_else(|| AuditError::AuditNotFound(audit_id.to_string()))?;
        if audit.status != AuditStatus::Pending {
            return Err(AuditError::AuditClosed(audit_id.to_string()));
        }
        if !audit.all_reported() && now < audit.deadline {
            return Err(AuditError::NotDue(audit_id.to_string()));
        }

        let mut observed: Amount = 0;
        for (chain_id, status) in audit.chains.iter_mut() {
            if !self.registry.is_registered(*chain_id) {
                *status = ChainSupplyStatus::Unverified {
                    reason: "chain deregistered".into(),
                };
                continue;
            }
            match status {
                ChainSupplyStatus::Reported { supply, .. } => observed = observed.saturating_add(*supply),
                ChainSupplyStatus::Awaiting => {
                    *status = ChainSupplyStatus::Unverified {
                        reason: "no response before deadline".into(),
                    }
                }
                ChainSupplyStatus::Unverified { .. } => {}
            }
        }
        audit.observed_total = observed;
        audit.finalized_at = Some(now);

        let unverified = audit.unverified();
        if !unverified.is_empty() {
            audit.status = AuditStatus::Mismatched;
            audit.diagnostic = format!(
                "unverified chains {:?}; observed {} of expected {}",
                unverified, observed, audit.expected_total
            );
        } else if observed == audit.expected_total {
            audit.status = AuditStatus::Verified;
            audit.diagnostic = format!("observed {} matches expected", observed);
        } else {
            audit.status = AuditStatus::Mismatched;
            let (direction, drift) = if observed > audit.expected_total {
                ("excess", observed - audit.expected_total)
            } else {
                ("shortfall", audit.expected_total - observed)
            };
            audit.diagnostic = format!(
                "observed {} vs expected {}: {} of {}",
                observed, audit.expected_total, direction, drift
            );
        }

        if audit.status == AuditStatus::Verified {
            info!("Supply audit {} verified: {}", audit.id, audit.diagnostic);
        } else {
            warn!("Supply audit {} mismatched: {}", audit.id, audit.diagnostic);
        }
        self.telemetry.report_custom(
            "supply_audit_finalized",
            telemetry_data! {
                "audit_id" => audit.id,
                "status" => audit.status.to_string(),
                "expected_total" => audit.expected_total.to_string(),
                "observed_total" => observed.to_string(),
                "unverified" => unverified,
            },
        );
        Ok(audit.clone())
    }

    /// Pending audits that have every response or passed their deadline
    pub fn due_audits(&self, now: DateTime<Utc>) -> Vec<String> {
        self.audits
            .iter()
            .filter(|a| a.status == AuditStatus::Pending)
            .filter(|a| a.all_reported() || now >= a.deadline)
            .map(|a| a.id.clone())
            .collect()
    }

    /// Operator acknowledgement of a mismatched audit. Supply itself is not touched.
    pub fn reconcile(
        &self,
        audit_id: &str,
        operator: &str,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<SupplyAudit, AuditError> {
        if !self.config.operators.iter().any(|o| o == operator) {
            warn!("{} tried to reconcile audit {} without authority", operator, audit_id);
            return Err(AuditError::Unauthorized(operator.to_string()));
        }
        let mut audit = self
            .audits
            .get_mut(audit_id)
            .ok_or_else(|| AuditError::AuditNotFound(audit_id.to_string()))?;
        if audit.status != AuditStatus::Mismatched {
            return Err(AuditError::NotMismatched {
                audit_id: audit_id.to_string(),
                status: audit.status,
            });
        }

        audit.status = AuditStatus::Reconciled;
        audit.reconciled_by = Some(operator.to_string());
        audit.reconciliation_note = Some(note.to_string());

        info!("Supply audit {} reconciled by {} at {}: {}", audit_id, operator, now, note);
        self.telemetry.report_custom(
            "supply_audit_reconciled",
            telemetry_data! {
                "audit_id" => audit_id,
                "operator" => operator,
                "note" => note,
            },
        );
        Ok(audit.clone())
    }

    pub fn get(&self, audit_id: &str) -> Option<SupplyAudit> {
        self.audits.get(audit_id).map(|a| a.clone())
    }

    /// Most recently initiated audit
    pub fn latest_audit(&self) -> Option<SupplyAudit> {
        let id = self.order.read().last().cloned()?;
        self.get(&id)
    }

    /// Drop the oldest settled audits beyond the history limit
    fn prune_history(&self) -> usize {
        let mut order = self.order.write();
        let excess = order.len().saturating_sub(self.config.history_limit.max(1));
        if excess == 0 {
            return 0;
        }

        let settled: Vec<String> = order
            .iter()
            .filter(|id| {
                self.audits
                    .get(id.as_str())
                    .map(|a| matches!(a.status, AuditStatus::Verified | AuditStatus::Reconciled))
                    .unwrap_or(true)
            })
            .take(excess)
            .cloned()
            .collect();
        order.retain(|id| !settled.contains(id));
        for id in &settled {
            self.audits.remove(id);
        }
        debug!("Pruned {} settled supply audits", settled.len());
        settled.len()
    }

    /// Up to `limit` audits, newest first
    pub fn history(&self, limit: usize) -> Vec<SupplyAudit> {
        self.order
            .read()
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| self.get(id))
            .collect()
    }
}

#[async_trait]
impl MessageHandler for SupplyAuditor {
    async fn handle(&self, message: &AdmittedMessage, now: DateTime<Utc>) -> Result<(), DispatchError> {
        match self.record_supply_response(message, now) {
            Ok(true) => {
                if let Ok(response) = message.decode::<SupplyResponsePayload>(MessageKind::SupplyResponse) {
                    if let Err(e) = self.finalize_audit(&response.audit_id, now) {
                        debug!("Audit {} not finalized on last response: {}", response.audit_id, e);
                    }
                }
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                warn!("Refused supply response {}: {}", message.fingerprint, e);
                Err(DispatchError::Refused(e.to_string()))
            }
        }
    }
}

/// Answers supply requests from the hub on a satellite chain
pub struct SupplyReporter {
    registry: Arc<ChainRegistry>,
    supply: Arc<dyn SupplySource>,
    outbox: Arc<Outbox>,
}

impl SupplyReporter {
    pub fn new(registry: Arc<ChainRegistry>, supply: Arc<dyn SupplySource>, outbox: Arc<Outbox>) -> Self {
        Self { registry, supply, outbox }
    }

    /// Report local supply for the requested audit
    pub async fn answer(&self, message: &AdmittedMessage, now: DateTime<Utc>) -> Result<Amount, AuditError> {
        let hub = message.source_chain();
        if hub != self.registry.hub_id() {
            return Err(AuditError::UnexpectedSource(hub));
        }
        let request: SupplyRequestPayload = message
            .decode(MessageKind::SupplyRequest)
            .map_err(|e| AuditError::Decode(e.to_string()))?;
        let supply = self.supply.local_supply().await.map_err(AuditError::Supply)?;

        let response = SupplyResponsePayload {
            audit_id: request.audit_id.clone(),
            supply,
            reported_at: now,
        };
        match self.outbox.post(MessageKind::SupplyResponse, hub, &response).await {
            Ok(_) => debug!("Reported supply {} for audit {}", supply, request.audit_id),
            Err(e) => error!("Failed to encode supply response for audit {}: {}", request.audit_id, e),
        }
        Ok(supply)
    }
}

#[async_trait]
impl MessageHandler for SupplyReporter {
    async fn handle(&self, message: &AdmittedMessage, now: DateTime<Utc>) -> Result<(), DispatchError> {
        self.answer(message, now)
            .await
            .map(|_| ())
            .map_err(|e| DispatchError::Refused(e.to_string()))
    }
}
