// SPDX-License-Identifier: MIT
//
// Copyright (c) 2025 Noderr Protocol Foundation

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use tracing::{debug, error, warn};

use crate::governance::message::{CrossChainMessage, MessageError, MessageKind};
use crate::governance::registry::ChainRegistry;
use crate::governance::types::ChainId;
use crate::telemetry::TelemetryReporter;
use crate::telemetry_data;

/// Error returned by a transport
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Chain unreachable: {0}")]
    Unreachable(ChainId),

    #[error("Transport rejected message: {0}")]
    Rejected(String),

    #[error("Internal transport error: {0}")]
    Internal(String),
}

/// Receipt for a dispatched message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryHandle {
    pub id: String,
    pub dest_chain: ChainId,
    pub fingerprint: String,
}

/// Outbound delivery collaborator.
///
/// `send` only dispatches; responses arrive later through the relay.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: CrossChainMessage) -> Result<DeliveryHandle, TransportError>;
}

/// Retry counters from one pass over the retry buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub sent: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// Outbound side of the relay: stamps source and nonce, sends, and keeps a bounded retry
/// buffer for failed sends.
pub struct Outbox {
    local_chain: ChainId,
    transport: Arc<dyn Transport>,
    registry: Arc<ChainRegistry>,
    telemetry: Arc<TelemetryReporter>,
    nonce: AtomicU64,
    /// Failed sends keyed by fingerprint, with their retry count
    retry_buffer: Mutex<HashMap<String, (CrossChainMessage, u32)>>,
    max_retries: u32,
}

impl Outbox {
    pub fn new(
        local_chain: ChainId,
        transport: Arc<dyn Transport>,
        registry: Arc<ChainRegistry>,
        telemetry: Arc<TelemetryReporter>,
        max_retries: u32,
    ) -> Self {
        // Seed nonces from the clock so a restarted engine does not reuse them
        let seed = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0).saturating_mul(1000);
        Self {
            local_chain,
            transport,
            registry,
            telemetry,
            nonce: AtomicU64::new(seed),
            retry_buffer: Mutex::new(HashMap::new()),
            max_retries,
        }
    }

    pub fn local_chain(&self) -> ChainId {
        self.local_chain
    }

    fn next_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::Relaxed)
    }

    /// Build a message from this chain to `dest_chain`
    pub fn compose<T: Serialize>(
        &self,
        kind: MessageKind,
        dest_chain: ChainId,
        payload: &T,
    ) -> Result<CrossChainMessage, MessageError> {
        CrossChainMessage::with_payload(kind, self.local_chain, dest_chain, self.next_nonce(), payload)
    }

    /// Send a message, buffering it for retry if the transport fails
    pub async fn send(&self, message: CrossChainMessage) -> Result<DeliveryHandle, TransportError> {
        if !self.registry.is_registered(message.dest_chain) {
            warn!("Not sending {} to unregistered chain {}", message.kind, message.dest_chain);
            return Err(TransportError::Unreachable(message.dest_chain));
        }

        match self.transport.send(message.clone()).await {
            Ok(handle) => {
                debug!("Sent {} to chain {} ({})", message.kind, message.dest_chain, handle.id);
                Ok(handle)
            }
            Err(e) => {
                warn!("Failed to send {} to chain {}: {}; queued for retry", message.kind, message.dest_chain, e);
                self.retry_buffer
                    .lock()
                    .insert(message.fingerprint(), (message, 0));
                Err(e)
            }
        }
    }

    /// Compose and send; `Ok(None)` means the message is waiting in the retry buffer
    pub async fn post<T: Serialize>(
        &self,
        kind: MessageKind,
        dest_chain: ChainId,
        payload: &T,
    ) -> Result<Option<DeliveryHandle>, MessageError> {
        let message = self.compose(kind, dest_chain, payload)?;
        Ok(self.send(message).await.ok())
    }

    pub fn pending_retries(&self) -> usize {
        self.retry_buffer.lock().len()
    }

    /// Retry every buffered message once
    pub async fn process_retries(&self) -> RetryStats {
        let pending: Vec<(String, CrossChainMessage, u32)> = self
            .retry_buffer
            .lock()
            .drain()
            .map(|(fingerprint, (message, count))| (fingerprint, message, count))
            .collect();

        let mut stats = RetryStats::default();
        for (fingerprint, message, count) in pending {
            if count >= self.max_retries || !self.registry.is_registered(message.dest_chain) {
                error!(
                    "Giving up on {} message {} to chain {} after {} retries",
                    message.kind, fingerprint, message.dest_chain, count
                );
                self.telemetry.report_custom(
                    "outbound_dropped",
                    telemetry_data! {
                        "fingerprint" => fingerprint,
                        "kind" => message.kind,
                        "dest_chain" => message.dest_chain,
                        "retries" => count,
                    },
                );
                stats.dropped += 1;
                continue;
            }

            match self.transport.send(message.clone()).await {
                Ok(_) => {
                    debug!("Retry succeeded for message {} to chain {}", fingerprint, message.dest_chain);
                    stats.sent += 1;
                }
                Err(e) => {
                    warn!(
                        "Retry {} failed for message {} to chain {}: {}",
                        count + 1, fingerprint, message.dest_chain, e
                    );
                    self.retry_buffer.lock().insert(fingerprint, (message, count + 1));
                    stats.requeued += 1;
                }
            }
        }
        stats
    }
}

/// Transport that records messages instead of delivering them.
///
/// Chains listed with [`fail_chain`](Self::fail_chain) return `Unreachable`.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<CrossChainMessage>>,
    failing: Mutex<HashSet<ChainId>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_chain(&self, chain_id: ChainId) {
        self.failing.lock().insert(chain_id);
    }

    pub fn heal_chain(&self, chain_id: ChainId) {
        self.failing.lock().remove(&chain_id);
    }

    /// Everything sent so far
    pub fn sent(&self) -> Vec<CrossChainMessage> {
        self.sent.lock().clone()
    }

    /// Remove and return everything sent so far
    pub fn take(&self) -> Vec<CrossChainMessage> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: CrossChainMessage) -> Result<DeliveryHandle, TransportError> {
        if self.failing.lock().contains(&message.dest_chain) {
            return Err(TransportError::Unreachable(message.dest_chain));
        }
        let handle = DeliveryHandle {
            id: uuid::Uuid::new_v4().to_string(),
            dest_chain: message.dest_chain,
            fingerprint: message.fingerprint(),
        };
        self.sent.lock().push(message);
        Ok(handle)
    }
}
