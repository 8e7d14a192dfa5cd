// SPDX-License-Identifier: MIT
//
// Copyright (c) 2025 Noderr Protocol Foundation

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ed25519_dalek::{Signature, Verifier};
use metrics::counter;
use tracing::{debug, error, info, warn};

use crate::governance::message::{AdmittedMessage, CrossChainMessage, MessageKind};
use crate::governance::registry::{ChainRegistry, SecurityConfig};
use crate::governance::types::{ChainId, VerifierId};
use crate::storage::{FingerprintStore, StoreError};
use crate::telemetry::TelemetryReporter;
use crate::telemetry_data;

/// Why a message was not admitted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("Insufficient attestations: {have} valid, {required} required")]
    InsufficientAttestations { have: usize, required: usize },

    #[error("No verifiers enabled for chain {0}")]
    NoVerifiersEnabled(ChainId),

    #[error("Unknown chain: {0}")]
    UnknownChain(ChainId),

    #[error("Message addressed to chain {actual}, this is chain {expected}")]
    WrongDestination { expected: ChainId, actual: ChainId },

    #[error("Fingerprint store unavailable: {0}")]
    Store(String),
}

impl AdmissionError {
    /// Stable reason code reported to submitters
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::InsufficientAttestations { .. } | AdmissionError::NoVerifiersEnabled(_) => {
                "INSUFFICIENT_ATTESTATIONS"
            }
            AdmissionError::UnknownChain(_) => "UNKNOWN_CHAIN",
            AdmissionError::WrongDestination { .. } => "WRONG_DESTINATION",
            AdmissionError::Store(_) => "STORE_UNAVAILABLE",
        }
    }
}

impl From<StoreError> for AdmissionError {
    fn from(e: StoreError) -> Self {
        AdmissionError::Store(e.to_string())
    }
}

/// Error returned by a message handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The handler cannot take the message yet; it may be delivered again
    #[error("Not ready: {0}")]
    Retriable(String),

    /// The handler refused the message for good
    #[error("Refused: {0}")]
    Refused(String),
}

/// What happened to an admitted message after dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler accepted the message
    Delivered,
    /// No handler registered for the message kind
    Unrouted,
    /// Handler refused the message; it stays admitted
    Refused(String),
    /// Handler was not ready; the fingerprint was released so the message can be redelivered
    Deferred(String),
}

/// Result of [`MessageRelay::submit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionResult {
    Admitted { fingerprint: String, outcome: DispatchOutcome },
    Duplicate { fingerprint: String },
    Rejected(AdmissionError),
}

impl AdmissionResult {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionResult::Admitted { .. })
    }

    /// Reason code for anything other than a fresh admission
    pub fn reason_code(&self) -> Option<&'static str> {
        match self {
            AdmissionResult::Admitted { .. } => None,
            AdmissionResult::Duplicate { .. } => Some("DUPLICATE_FINGERPRINT"),
            AdmissionResult::Rejected(e) => Some(e.code()),
        }
    }
}

/// Downstream consumer of admitted messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &AdmittedMessage, now: DateTime<Utc>) -> Result<(), DispatchError>;
}

/// Admission control for inbound cross-chain messages.
///
/// The single dispatch point: components only ever see messages that passed the
/// destination chain's attestation threshold and were not admitted before.
pub struct MessageRelay {
    local_chain: ChainId,
    registry: Arc<ChainRegistry>,
    store: Arc<dyn FingerprintStore>,
    routes: DashMap<MessageKind, Arc<dyn MessageHandler>>,
    telemetry: Arc<TelemetryReporter>,
    /// How long admitted fingerprints are kept
    retention: Duration,
}

impl MessageRelay {
    pub fn new(
        local_chain: ChainId,
        registry: Arc<ChainRegistry>,
        store: Arc<dyn FingerprintStore>,
        telemetry: Arc<TelemetryReporter>,
        retention: Duration,
    ) -> Self {
        Self {
            local_chain,
            registry,
            store,
            routes: DashMap::new(),
            telemetry,
            retention,
        }
    }

    pub fn local_chain(&self) -> ChainId {
        self.local_chain
    }

    /// Route admitted messages of `kind` to `handler`, replacing any previous route
    pub fn register_handler(&self, kind: MessageKind, handler: Arc<dyn MessageHandler>) {
        debug!("Routing {} messages", kind);
        self.routes.insert(kind, handler);
    }

    /// Check a message against the local chain's attestation requirements and dispatch it
    pub async fn submit(&self, message: CrossChainMessage, now: DateTime<Utc>) -> AdmissionResult {
        let fingerprint = message.fingerprint();

        let attested_by = match self.check(&message) {
            Ok(verifiers) => verifiers,
            Err(e) => return self.reject(&message, &fingerprint, e),
        };

        match self.store.insert_if_absent(&fingerprint, now).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Duplicate {} message {} from chain {}", message.kind, fingerprint, message.source_chain);
                counter!("omnigov_messages_duplicate_total", 1, "kind" => message.kind.to_string());
                return AdmissionResult::Duplicate { fingerprint };
            }
            Err(e) => {
                error!("Fingerprint store failed for {}: {}", fingerprint, e);
                return self.reject(&message, &fingerprint, e.into());
            }
        }

        info!(
            "Admitted {} message {} from chain {} ({} attestations)",
            message.kind,
            fingerprint,
            message.source_chain,
            attested_by.len()
        );
        counter!("omnigov_messages_admitted_total", 1, "kind" => message.kind.to_string());

        let admitted = AdmittedMessage {
            message,
            fingerprint: fingerprint.clone(),
            admitted_at: now,
            attested_by,
        };
        let outcome = self.dispatch(&admitted, now).await;
        AdmissionResult::Admitted { fingerprint, outcome }
    }

    /// Drop fingerprints older than the retention window
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self.store.prune_before(now - self.retention).await?;
        if removed > 0 {
            debug!("Pruned {} admitted fingerprints", removed);
        }
        Ok(removed)
    }

    /// Destination, registration and attestation checks; returns the counted verifiers
    fn check(&self, message: &CrossChainMessage) -> Result<Vec<VerifierId>, AdmissionError> {
        if message.dest_chain != self.local_chain {
            return Err(AdmissionError::WrongDestination {
                expected: self.local_chain,
                actual: message.dest_chain,
            });
        }
        if !self.registry.is_registered(message.source_chain) {
            return Err(AdmissionError::UnknownChain(message.source_chain));
        }
        let security = self
            .registry
            .security(message.dest_chain)
            .map_err(|_| AdmissionError::UnknownChain(message.dest_chain))?;

        let required = security
            .required_attestations()
            .ok_or(AdmissionError::NoVerifiersEnabled(message.dest_chain))?;

        let valid = self.valid_attestations(message, &security);
        if valid.len() < required {
            return Err(AdmissionError::InsufficientAttestations {
                have: valid.len(),
                required,
            });
        }
        Ok(valid)
    }

    /// Distinct enabled verifiers whose signatures verify over the message digest
    fn valid_attestations(&self, message: &CrossChainMessage, security: &SecurityConfig) -> Vec<VerifierId> {
        let digest = message.digest();
        let mut seen = HashSet::new();
        let mut valid = Vec::new();

        for attestation in &message.attestations {
            if !security.accepts(&attestation.verifier) || seen.contains(&attestation.verifier) {
                continue;
            }
            let Some(key) = self.registry.verifier_key(&attestation.verifier) else {
                continue;
            };
            let verified = Signature::from_slice(&attestation.signature)
                .map(|signature| key.verify(&digest, &signature).is_ok())
                .unwrap_or(false);
            if verified {
                seen.insert(attestation.verifier.clone());
                valid.push(attestation.verifier.clone());
            } else {
                warn!("Invalid attestation from {} on message from chain {}", attestation.verifier, message.source_chain);
            }
        }
        valid
    }

    fn reject(&self, message: &CrossChainMessage, fingerprint: &str, error: AdmissionError) -> AdmissionResult {
        warn!(
            "Rejected {} message {} from chain {}: {}",
            message.kind, fingerprint, message.source_chain, error
        );
        counter!("omnigov_messages_rejected_total", 1, "code" => error.code());
        self.telemetry.report_custom(
            "message_rejected",
            telemetry_data! {
                "fingerprint" => fingerprint,
                "kind" => message.kind.to_string(),
                "source_chain" => message.source_chain,
                "code" => error.code(),
            },
        );
        AdmissionResult::Rejected(error)
    }

    async fn dispatch(&self, admitted: &AdmittedMessage, now: DateTime<Utc>) -> DispatchOutcome {
        let handler = match self.routes.get(&admitted.kind()) {
            Some(route) => Arc::clone(route.value()),
            None => {
                warn!("No handler for {} message {}", admitted.kind(), admitted.fingerprint);
                return DispatchOutcome::Unrouted;
            }
        };

        match handler.handle(admitted, now).await {
            Ok(()) => DispatchOutcome::Delivered,
            Err(DispatchError::Refused(reason)) => {
                warn!("Handler refused {} message {}: {}", admitted.kind(), admitted.fingerprint, reason);
                DispatchOutcome::Refused(reason)
            }
            Err(DispatchError::Retriable(reason)) => {
                // Released so a redelivery is not mistaken for a duplicate
                if let Err(e) = self.store.release(&admitted.fingerprint).await {
                    error!("Failed to release fingerprint {}: {}", admitted.fingerprint, e);
                }
                debug!("Deferred {} message {}: {}", admitted.kind(), admitted.fingerprint, reason);
                DispatchOutcome::Deferred(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crate::governance::message::{SupplyRequestPayload, VoteRelayPayload};
    use crate::governance::registry::ChainRecord;
    use crate::governance::types::SupportType;
    use crate::storage::MemoryFingerprintStore;
    use ed25519_dalek::SigningKey;
    use parking_lot::Mutex;

    const HUB: ChainId = 1;
    const SAT: ChainId = 10;

    fn signer(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    /// Hub at `level` with `verifiers` enabled; verifier `vN` signs with seed N
    fn relay(level: u8, verifiers: &[&str]) -> MessageRelay {
        let security = SecurityConfig::new(level, verifiers.iter().map(|v| v.to_string())).unwrap();
        let registry = ChainRegistry::new(ChainRecord::new(HUB, "hub", true, security));
        for seed in 1..=4u8 {
            registry.register_verifier(format!("v{}", seed), signer(seed).verifying_key());
        }
        registry
            .register(ChainRecord::new(SAT, "sat", false, SecurityConfig::new(1, vec!["v1".to_string()]).unwrap()))
            .unwrap();
        MessageRelay::new(
            HUB,
            Arc::new(registry),
            Arc::new(MemoryFingerprintStore::new()),
            Arc::new(TelemetryReporter::new(HUB)),
            Duration::days(30),
        )
    }

    fn vote(nonce: u64) -> CrossChainMessage {
        let payload = VoteRelayPayload {
            proposal_id: "p-1".into(),
            snapshot_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            voter: "alice".into(),
            support: SupportType::For,
            weight: 100,
            reason: None,
        };
        CrossChainMessage::with_payload(MessageKind::VoteRelay, SAT, HUB, nonce, &payload).unwrap()
    }

    struct CountingHandler {
        seen: Mutex<Vec<String>>,
        result: Mutex<Result<(), DispatchError>>,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                result: Mutex::new(Ok(())),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, message: &AdmittedMessage, _now: DateTime<Utc>) -> Result<(), DispatchError> {
            self.seen.lock().push(message.fingerprint.clone());
            self.result.lock().clone()
        }
    }

    #[tokio::test]
    async fn test_level_one_admits_single_signature() {
        let relay = relay(1, &["v1"]);
        let handler = CountingHandler::new();
        relay.register_handler(MessageKind::VoteRelay, handler.clone());

        let result = relay.submit(vote(1).attested("v1", &signer(1)), Utc::now()).await;
        assert!(result.is_admitted());
        assert!(matches!(
            result,
            AdmissionResult::Admitted { outcome: DispatchOutcome::Delivered, .. }
        ));
        assert_eq!(handler.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_level_four_rejects_single_signature() {
        let relay = relay(4, &["v1", "v2"]);
        let result = relay.submit(vote(1).attested("v1", &signer(1)), Utc::now()).await;
        assert_eq!(
            result,
            AdmissionResult::Rejected(AdmissionError::InsufficientAttestations { have: 1, required: 2 })
        );
        assert_eq!(result.reason_code(), Some("INSUFFICIENT_ATTESTATIONS"));

        let both = vote(1).attested("v1", &signer(1)).attested("v2", &signer(2));
        assert!(relay.submit(both, Utc::now()).await.is_admitted());
    }

    #[tokio::test]
    async fn test_repeated_verifier_counts_once() {
        let relay = relay(4, &["v1", "v2"]);
        let message = vote(1).attested("v1", &signer(1)).attested("v1", &signer(1));
        let result = relay.submit(message, Utc::now()).await;
        assert_eq!(result.reason_code(), Some("INSUFFICIENT_ATTESTATIONS"));
    }

    #[tokio::test]
    async fn test_forged_and_disabled_attestations_do_not_count() {
        let relay = relay(1, &["v1"]);
        // v1's name with v2's key
        let forged = vote(1).attested("v1", &signer(2));
        assert_eq!(relay.submit(forged, Utc::now()).await.reason_code(), Some("INSUFFICIENT_ATTESTATIONS"));

        // v3 is known but not enabled for the hub
        let disabled = vote(2).attested("v3", &signer(3));
        assert_eq!(relay.submit(disabled, Utc::now()).await.reason_code(), Some("INSUFFICIENT_ATTESTATIONS"));
    }

    #[tokio::test]
    async fn test_no_enabled_verifiers_fails_closed() {
        let relay = relay(1, &[]);
        let result = relay.submit(vote(1).attested("v1", &signer(1)), Utc::now()).await;
        assert_eq!(result, AdmissionResult::Rejected(AdmissionError::NoVerifiersEnabled(HUB)));
        assert_eq!(result.reason_code(), Some("INSUFFICIENT_ATTESTATIONS"));
    }

    #[tokio::test]
    async fn test_unknown_source_and_wrong_destination() {
        let relay = relay(1, &["v1"]);
        let unknown = CrossChainMessage::with_payload(
            MessageKind::SupplyRequest,
            77,
            HUB,
            1,
            &SupplyRequestPayload { audit_id: "a".into(), requested_at: Utc::now() },
        )
        .unwrap()
        .attested("v1", &signer(1));
        assert_eq!(relay.submit(unknown, Utc::now()).await.reason_code(), Some("UNKNOWN_CHAIN"));

        let mut misrouted = vote(1);
        misrouted.dest_chain = SAT;
        let misrouted = misrouted.attested("v1", &signer(1));
        assert_eq!(relay.submit(misrouted, Utc::now()).await.reason_code(), Some("WRONG_DESTINATION"));
    }

    #[tokio::test]
    async fn test_redelivery_is_duplicate_and_dispatched_once() {
        let relay = relay(1, &["v1"]);
        let handler = CountingHandler::new();
        relay.register_handler(MessageKind::VoteRelay, handler.clone());

        let message = vote(1).attested("v1", &signer(1));
        assert!(relay.submit(message.clone(), Utc::now()).await.is_admitted());
        let again = relay.submit(message, Utc::now()).await;
        assert!(matches!(again, AdmissionResult::Duplicate { .. }));
        assert_eq!(again.reason_code(), Some("DUPLICATE_FINGERPRINT"));
        assert_eq!(handler.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_deferred_message_can_be_redelivered() {
        let relay = relay(1, &["v1"]);
        let handler = CountingHandler::new();
        *handler.result.lock() = Err(DispatchError::Retriable("proposal not known yet".into()));
        relay.register_handler(MessageKind::VoteRelay, handler.clone());

        let message = vote(1).attested("v1", &signer(1));
        let first = relay.submit(message.clone(), Utc::now()).await;
        assert!(matches!(
            first,
            AdmissionResult::Admitted { outcome: DispatchOutcome::Deferred(_), .. }
        ));

        *handler.result.lock() = Ok(());
        let second = relay.submit(message, Utc::now()).await;
        assert!(matches!(
            second,
            AdmissionResult::Admitted { outcome: DispatchOutcome::Delivered, .. }
        ));
        assert_eq!(handler.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_refused_message_stays_admitted() {
        let relay = relay(1, &["v1"]);
        let handler = CountingHandler::new();
        *handler.result.lock() = Err(DispatchError::Refused("proposal closed".into()));
        relay.register_handler(MessageKind::VoteRelay, handler.clone());

        let message = vote(1).attested("v1", &signer(1));
        relay.submit(message.clone(), Utc::now()).await;
        assert!(matches!(relay.submit(message, Utc::now()).await, AdmissionResult::Duplicate { .. }));
    }

    #[tokio::test]
    async fn test_unrouted_kind_is_still_admitted() {
        let relay = relay(1, &["v1"]);
        let result = relay.submit(vote(1).attested("v1", &signer(1)), Utc::now()).await;
        assert!(matches!(
            result,
            AdmissionResult::Admitted { outcome: DispatchOutcome::Unrouted, .. }
        ));
    }

    #[tokio::test]
    async fn test_prune_honours_retention() {
        let relay = relay(1, &["v1"]);
        let old = Utc::now() - Duration::days(40);
        relay.submit(vote(1).attested("v1", &signer(1)), old).await;
        relay.submit(vote(2).attested("v1", &signer(1)), Utc::now()).await;
        assert_eq!(relay.prune(Utc::now()).await.unwrap(), 1);
    }
}
