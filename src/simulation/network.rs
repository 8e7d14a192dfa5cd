// SPDX-License-Identifier: MIT
//
// Copyright (c) 2025 Noderr Protocol Foundation

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::VerifierConfig;
use crate::governance::engine::GovernanceEngine;
use crate::governance::message::{CrossChainMessage, MessageKind};
use crate::governance::relay::AdmissionResult;
use crate::governance::transport::{DeliveryHandle, Transport, TransportError};
use crate::governance::types::{ChainId, VerifierId};

/// Verifiers the simulator signs with
pub const SIMULATOR_VERIFIERS: [&str; 4] = ["verifier-a", "verifier-b", "verifier-c", "verifier-d"];

/// Upper bound on deliveries in one `deliver_all` call
const MAX_DELIVERIES: usize = 10_000;

/// Deterministic development key for a simulator verifier
pub fn simulator_signing_key(verifier: &str) -> SigningKey {
    let seed: [u8; 32] = Sha256::digest(format!("omnigov-sim-verifier:{}", verifier).as_bytes()).into();
    SigningKey::from_bytes(&seed)
}

/// Verifier directory entries matching [`simulator_signing_key`]
pub fn simulator_verifiers() -> Vec<VerifierConfig> {
    SIMULATOR_VERIFIERS
        .iter()
        .map(|id| VerifierConfig {
            id: id.to_string(),
            public_key: hex::encode(simulator_signing_key(id).verifying_key().to_bytes()),
        })
        .collect()
}

/// One delivery attempt made by the network
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub kind: MessageKind,
    pub source_chain: ChainId,
    pub dest_chain: ChainId,
    pub fingerprint: String,
    pub result: AdmissionResult,
}

/// In-process network connecting engines on different chains.
///
/// Sent messages are attested by the configured verifiers and queued; `deliver_all` hands
/// them to the destination engine's relay in send order.
pub struct LocalNetwork {
    engines: RwLock<HashMap<ChainId, Weak<GovernanceEngine>>>,
    signers: Vec<(VerifierId, SigningKey)>,
    queue: Mutex<VecDeque<CrossChainMessage>>,
    partitioned: RwLock<HashSet<ChainId>>,
    log: Mutex<Vec<DeliveryRecord>>,
}

impl LocalNetwork {
    /// Network attesting with every simulator verifier
    pub fn new() -> Self {
        Self::with_signers(SIMULATOR_VERIFIERS.iter().copied())
    }

    /// Network attesting only with the given simulator verifiers
    pub fn with_signers<'a>(verifiers: impl IntoIterator<Item = &'a str>) -> Self {
        let signers = verifiers
            .into_iter()
            .map(|id| (id.to_string(), simulator_signing_key(id)))
            .collect();
        Self {
            engines: RwLock::new(HashMap::new()),
            signers,
            queue: Mutex::new(VecDeque::new()),
            partitioned: RwLock::new(HashSet::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Route messages for the engine's chain to it
    pub fn attach(&self, engine: &Arc<GovernanceEngine>) {
        self.engines.write().insert(engine.local_chain(), Arc::downgrade(engine));
    }

    /// Make a chain unreachable for new sends
    pub fn partition(&self, chain_id: ChainId) {
        self.partitioned.write().insert(chain_id);
    }

    pub fn heal(&self, chain_id: ChainId) {
        self.partitioned.write().remove(&chain_id);
    }

    /// Messages waiting for delivery
    pub fn in_flight(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drop every queued message
    pub fn discard_in_flight(&self) -> usize {
        let mut queue = self.queue.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    /// Every delivery attempted so far
    pub fn log(&self) -> Vec<DeliveryRecord> {
        self.log.lock().clone()
    }

    /// Deliver queued messages, including those sent while delivering, until the queue is empty
    pub async fn deliver_all(&self) -> usize {
        let mut delivered = 0;
        while delivered < MAX_DELIVERIES {
            let Some(message) = self.queue.lock().pop_front() else {
                return delivered;
            };
            let dest = message.dest_chain;
            let engine = self.engines.read().get(&dest).and_then(Weak::upgrade);
            let Some(engine) = engine else {
                warn!("No engine attached for chain {}; dropping message", dest);
                continue;
            };

            let kind = message.kind;
            let source_chain = message.source_chain;
            let fingerprint = message.fingerprint();
            let result = engine.submit(message).await;
            debug!("Delivered {} {} -> {}: {:?}", kind, source_chain, dest, result);
            self.log.lock().push(DeliveryRecord {
                kind,
                source_chain,
                dest_chain: dest,
                fingerprint,
                result,
            });
            delivered += 1;
        }
        warn!("Delivery limit of {} reached with {} messages queued", MAX_DELIVERIES, self.in_flight());
        delivered
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn send(&self, mut message: CrossChainMessage) -> Result<DeliveryHandle, TransportError> {
        if self.partitioned.read().contains(&message.dest_chain) {
            return Err(TransportError::Unreachable(message.dest_chain));
        }
        for (verifier, key) in &self.signers {
            message.attest(verifier.clone(), key);
        }
        let handle = DeliveryHandle {
            id: uuid::Uuid::new_v4().to_string(),
            dest_chain: message.dest_chain,
            fingerprint: message.fingerprint(),
        };
        self.queue.lock().push_back(message);
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulator_keys_match_directory() {
        let verifiers = simulator_verifiers();
        assert_eq!(verifiers.len(), 4);
        assert_eq!(
            verifiers[0].public_key,
            "18f0be3417b8e7b462ffb4c174129b427c6fe04ff84b7def8003d3f6ce7e5836"
        );
        for verifier in &verifiers {
            assert!(verifier.verifying_key().is_ok());
        }
    }

    #[tokio::test]
    async fn test_partitioned_chain_is_unreachable() {
        let network = LocalNetwork::new();
        network.partition(10);
        let message = CrossChainMessage::new(MessageKind::SupplyRequest, 1, 10, 0, Vec::new());
        assert!(matches!(
            network.send(message.clone()).await,
            Err(TransportError::Unreachable(10))
        ));

        network.heal(10);
        let handle = network.send(message).await.unwrap();
        assert_eq!(handle.dest_chain, 10);
        assert_eq!(network.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_messages_without_engine_are_dropped() {
        let network = LocalNetwork::new();
        network
            .send(CrossChainMessage::new(MessageKind::SupplyRequest, 1, 10, 0, Vec::new()))
            .await
            .unwrap();
        assert_eq!(network.deliver_all().await, 0);
        assert_eq!(network.in_flight(), 0);
        assert!(network.log().is_empty());
    }
}
