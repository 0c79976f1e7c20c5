use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Checksum computed over each on-disk record, verified on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumAlgorithm {
    None,
    #[default]
    Crc32,
}

/// Settings governing segment files and the in-memory caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFileSettings {
    /// Fsync after every flush batch. Disabling trades durability for throughput.
    #[serde(default = "default_force_sync")]
    pub force_sync: bool,
    #[serde(default)]
    pub compress_logs: bool,
    /// Entries per segment before rotation.
    #[serde(default = "default_rotate_interval")]
    pub rotate_interval: u64,
    /// Segment byte size triggering rotation; 0 disables size-based rotation.
    #[serde(default)]
    pub max_size: u64,
    /// Bytes preallocated when a segment is created; 0 disables preallocation.
    #[serde(default)]
    pub overallocate_size: u64,
    #[serde(default = "default_latest_cache_bytes")]
    pub latest_logs_cache_size_threshold: u64,
    #[serde(default = "default_commit_cache_bytes")]
    pub commit_logs_cache_size_threshold: u64,
    #[serde(default)]
    pub checksum: ChecksumAlgorithm,
}

impl Default for LogFileSettings {
    fn default() -> Self {
        Self {
            force_sync: default_force_sync(),
            compress_logs: false,
            rotate_interval: default_rotate_interval(),
            max_size: 0,
            overallocate_size: 0,
            latest_logs_cache_size_threshold: default_latest_cache_bytes(),
            commit_logs_cache_size_threshold: default_commit_cache_bytes(),
            checksum: ChecksumAlgorithm::default(),
        }
    }
}

impl LogFileSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.rotate_interval == 0 {
            return Err(SettingsError::ZeroRotateInterval);
        }
        Ok(())
    }
}

/// Settings governing the writer thread's flush batching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushSettings {
    /// Appends fsynced together before durability is acknowledged.
    #[serde(default = "default_max_flush_batch_size")]
    pub max_flush_batch_size: u64,
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            max_flush_batch_size: default_max_flush_batch_size(),
        }
    }
}

impl FlushSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_flush_batch_size == 0 {
            return Err(SettingsError::ZeroFlushBatchSize);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("rotate_interval must be greater than zero")]
    ZeroRotateInterval,
    #[error("max_flush_batch_size must be greater than zero")]
    ZeroFlushBatchSize,
}

fn default_force_sync() -> bool {
    true
}

fn default_rotate_interval() -> u64 {
    100_000
}

fn default_max_flush_batch_size() -> u64 {
    1_000
}

fn default_latest_cache_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_commit_cache_bytes() -> u64 {
    128 * 1024 * 1024
}
