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

use std::time::Duration;

use serde::{Serialize, Deserialize};

/// Redis client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Key prefix for namespacing
    pub key_prefix: String,

    /// Connection timeout in seconds
    pub connection_timeout_sec: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "omnigov".to_string(),
            connection_timeout_sec: 5,
        }
    }
}

impl RedisConfig {
    /// Generate a full Redis key with prefix
    pub fn full_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_sec)
    }
}

#[cfg(feature = "distributed")]
pub use store::RedisFingerprintStore;

#[cfg(feature = "distributed")]
mod store {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use redis::aio::MultiplexedConnection;
    use tracing::{debug, info};

    use super::RedisConfig;
    use crate::storage::{FingerprintStore, StoreError};

    /// Fingerprint store shared by every relay instance pointed at the same Redis.
    ///
    /// Entries expire on their own after the retention window, so `prune_before` is a no-op.
    #[derive(Clone)]
    pub struct RedisFingerprintStore {
        config: RedisConfig,
        connection: MultiplexedConnection,
        retention_secs: u64,
    }

    impl RedisFingerprintStore {
        /// Connect to Redis
        pub async fn connect(config: RedisConfig, retention_secs: u64) -> Result<Self, StoreError> {
            let client = redis::Client::open(config.url.clone())
                .map_err(|e| StoreError::ConnectionError(e.to_string()))?;

            let connection = tokio::time::timeout(
                config.connection_timeout(),
                client.get_multiplexed_tokio_connection(),
            )
            .await
            .map_err(|_| StoreError::ConnectionError(format!("timed out connecting to {}", config.url)))?
            .map_err(|e| StoreError::ConnectionError(e.to_string()))?;

            info!("Fingerprint store connected to Redis at {}", config.url);
            Ok(Self {
                config,
                connection,
                retention_secs: retention_secs.max(1),
            })
        }

        fn key(&self, fingerprint: &str) -> String {
            self.config.full_key(&format!("fingerprints:{}", fingerprint))
        }
    }

    #[async_trait]
    impl FingerprintStore for RedisFingerprintStore {
        async fn insert_if_absent(&self, fingerprint: &str, admitted_at: DateTime<Utc>) -> Result<bool, StoreError> {
            let mut conn = self.connection.clone();
            let reply: Option<String> = redis::cmd("SET")
                .arg(self.key(fingerprint))
                .arg(admitted_at.timestamp())
                .arg("NX")
                .arg("EX")
                .arg(self.retention_secs)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            Ok(reply.is_some())
        }

        async fn contains(&self, fingerprint: &str) -> Result<bool, StoreError> {
            let mut conn = self.connection.clone();
            redis::cmd("EXISTS")
                .arg(self.key(fingerprint))
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))
        }

        async fn release(&self, fingerprint: &str) -> Result<(), StoreError> {
            let mut conn = self.connection.clone();
            let removed: i64 = redis::cmd("DEL")
                .arg(self.key(fingerprint))
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            debug!("Released fingerprint {} ({} key removed)", fingerprint, removed);
            Ok(())
        }

        async fn prune_before(&self, _cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_key_prefix() {
        let config = RedisConfig::default();
        assert_eq!(config.full_key("fingerprints:ab"), "omnigov:fingerprints:ab");

        let bare = RedisConfig { key_prefix: String::new(), ..RedisConfig::default() };
        assert_eq!(bare.full_key("x"), "x");
    }
}
