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

//! Persistent set of admitted message fingerprints used for replay suppression.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during fingerprint storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Set of admitted fingerprints.
///
/// `insert_if_absent` is the only admission primitive: it must be atomic per fingerprint so
/// two concurrent deliveries of the same message cannot both be admitted.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// Record a fingerprint; returns `false` if it was already present
    async fn insert_if_absent(&self, fingerprint: &str, admitted_at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Whether a fingerprint is currently recorded
    async fn contains(&self, fingerprint: &str) -> Result<bool, StoreError>;

    /// Forget a fingerprint so the message can be redelivered
    async fn release(&self, fingerprint: &str) -> Result<(), StoreError>;

    /// Drop fingerprints admitted before `cutoff`; returns how many were removed
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// In-memory fingerprint store
#[derive(Debug, Default)]
pub struct MemoryFingerprintStore {
    admitted: DashMap<String, DateTime<Utc>>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.admitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty()
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    async fn insert_if_absent(&self, fingerprint: &str, admitted_at: DateTime<Utc>) -> Result<bool, StoreError> {
        use dashmap::mapref::entry::Entry;

        match self.admitted.entry(fingerprint.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(admitted_at);
                Ok(true)
            }
        }
    }

    async fn contains(&self, fingerprint: &str) -> Result<bool, StoreError> {
        Ok(self.admitted.contains_key(fingerprint))
    }

    async fn release(&self, fingerprint: &str) -> Result<(), StoreError> {
        self.admitted.remove(fingerprint);
        Ok(())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let before = self.admitted.len();
        self.admitted.retain(|_, admitted_at| *admitted_at >= cutoff);
        let removed = before.saturating_sub(self.admitted.len());
        if removed > 0 {
            debug!("Pruned {} fingerprints admitted before {}", removed, cutoff);
        }
        Ok(removed)
    }
}
