//! Configuration for the memory engine, disk engine, and façade.

use std::time::Duration;

use crate::filename::{default_filename_callback, FilenameCallback};
use crate::item::StorageType;

/// How an evicted memory-engine value is destroyed.
///
/// `Inline` destroys synchronously in the calling thread, `Background` hands
/// the value to the shared release-worker pool, `Dedicated` hands it to a
/// caller-owned channel instead (there is no single blessed "main thread"
/// outside of UI frameworks).
#[derive(Clone, Default)]
pub enum ReleasePolicy {
    Inline,
    #[default]
    Background,
    Dedicated(tokio::sync::mpsc::UnboundedSender<Box<dyn std::any::Any + Send>>),
}

/// Limits and behavior for the in-process memory tier.
#[derive(Clone)]
pub struct MemoryConfig {
    pub count_limit: u64,
    pub cost_limit: u64,
    pub age_limit: Option<Duration>,
    pub auto_trim_interval: Duration,
    pub release_policy: ReleasePolicy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            count_limit: u64::MAX,
            cost_limit: u64::MAX,
            age_limit: None,
            auto_trim_interval: Duration::from_secs(5),
            release_policy: ReleasePolicy::default(),
        }
    }
}

/// Limits and behavior for the persistent disk tier.
#[derive(Clone)]
pub struct DiskConfig {
    pub storage_type: StorageType,
    pub inline_threshold: u64,
    pub count_limit: u64,
    pub cost_limit: u64,
    pub age_limit: Option<Duration>,
    pub auto_trim_interval: Duration,
    pub error_logs_enabled: bool,
    pub filename_callback: FilenameCallback,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Mixed,
            inline_threshold: 20 * 1024,
            count_limit: u64::MAX,
            cost_limit: u64::MAX,
            age_limit: None,
            auto_trim_interval: Duration::from_secs(60),
            error_logs_enabled: true,
            filename_callback: default_filename_callback(),
        }
    }
}

/// Top-level façade configuration: a memory config, a disk config, the
/// archive/unarchive callbacks that convert between caller objects and
/// bytes, and the free-disk-space floor the façade polls for on its own
/// trim tick. This is a façade concern, not something either engine knows
/// about.
pub struct CacheConfig<T> {
    pub memory: MemoryConfig,
    pub disk: DiskConfig,
    pub free_disk_space_limit: u64,
    pub archive: Box<dyn Fn(&T) -> crate::error::Result<Vec<u8>> + Send + Sync>,
    pub unarchive: Box<dyn Fn(&[u8]) -> crate::error::Result<T> + Send + Sync>,
}
