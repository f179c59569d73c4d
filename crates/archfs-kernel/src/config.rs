// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel configuration and the context passed to the manager

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::DriverRegistry;
use crate::error::{FsError, FsResult};
use crate::keys::KeyManagerRegistry;
use crate::pool::{IoBufferPool, MemoryBufferPool, TempFileBufferPool};
use crate::types::SyncOptions;

/// Default minimum delay between failed key verifications.
pub const DEFAULT_MIN_RETRY_DELAY_MS: u64 = 3_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub pool: PoolConfig,
    pub sync: SyncConfig,
    pub keys: KeyConfig,
    pub envelope: EnvelopeConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    #[default]
    Memory,
    TempFile,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub kind: PoolKind,
    /// Directory for temp-file buffers; the system temp dir when unset.
    pub dir: Option<PathBuf>,
}

impl PoolConfig {
    pub fn build(&self) -> Arc<dyn IoBufferPool> {
        match self.kind {
            PoolKind::Memory => Arc::new(MemoryBufferPool::new()),
            PoolKind::TempFile => Arc::new(TempFileBufferPool::new(self.dir.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long an unmount waits for other threads to close their streams.
    pub wait_close_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            wait_close_timeout_ms: 5_000,
        }
    }
}

impl SyncConfig {
    pub fn umount_options(&self) -> SyncOptions {
        SyncOptions::umount(Duration::from_millis(self.wait_close_timeout_ms))
    }

    /// Options for the sync a controller runs before retrying an operation.
    pub fn retry_options(&self) -> SyncOptions {
        SyncOptions::waiting(Duration::from_millis(self.wait_close_timeout_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    pub min_retry_delay_ms: u64,
    pub prompt_timeout_ms: u64,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            min_retry_delay_ms: DEFAULT_MIN_RETRY_DELAY_MS,
            prompt_timeout_ms: 60_000,
        }
    }
}

impl KeyConfig {
    pub fn min_retry_delay(&self) -> Duration {
        Duration::from_millis(self.min_retry_delay_ms)
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_millis(self.prompt_timeout_ms)
    }
}

/// Encrypted envelope settings, read by envelope drivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    /// Envelopes up to this size are authenticated fully on mount, larger
    /// ones lazily per read.
    pub authentication_threshold: u64,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            authentication_threshold: 512 * 1024,
        }
    }
}

impl EnvelopeConfig {
    /// Whether an envelope of `payload_len` bytes is authenticated as a whole
    /// before any entry is exposed.
    pub fn authenticates_eagerly(&self, payload_len: u64) -> bool {
        payload_len <= self.authentication_threshold
    }
}

impl KernelConfig {
    pub fn from_toml_str(text: &str) -> FsResult<Self> {
        toml::from_str(text).map_err(|err| FsError::Config(err.to_string()))
    }

    pub fn load(path: &Path) -> FsResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded kernel configuration");
        Ok(config)
    }

    pub fn to_toml_string(&self) -> FsResult<String> {
        toml::to_string_pretty(self).map_err(|err| FsError::Config(err.to_string()))
    }
}

/// Everything the kernel needs, passed explicitly to the manager.
#[derive(Debug, Clone)]
pub struct FsContext {
    pub config: KernelConfig,
    pub drivers: DriverRegistry,
    pub pool: Arc<dyn IoBufferPool>,
    pub keys: KeyManagerRegistry,
}

impl FsContext {
    pub fn new(config: KernelConfig, drivers: DriverRegistry) -> Self {
        let pool = config.pool.build();
        Self {
            config,
            drivers,
            pool,
            keys: KeyManagerRegistry::new(),
        }
    }

    pub fn with_keys(mut self, keys: KeyManagerRegistry) -> Self {
        self.keys = keys;
        self
    }
}
