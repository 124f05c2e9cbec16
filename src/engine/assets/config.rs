// Asset cache configuration

use super::AssetError;
use std::path::{Path, PathBuf};

/// Default limit on asset name length in bytes (exclusive)
pub const DEFAULT_MAX_NAME_LEN: usize = 256;

/// Default number of cache slots
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Default size of the load ring buffer
pub const DEFAULT_QUEUE_CAPACITY: usize = 512;

/// What `get_image` does when the load queue has no room for a new request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueFullPolicy {
    /// Hand out the handle anyway; the asset stays `Queued` forever
    #[default]
    Drop,
    /// Undo the new record and return `AssetError::QueueFull` so the caller can retry
    Reject,
}

/// Sizing and behaviour of an `AssetCache`
#[derive(Debug, Clone)]
pub struct AssetConfig {
    /// Names must be strictly shorter than this many bytes
    pub max_name_len: usize,

    /// Number of slots in the name table
    pub cache_capacity: usize,

    /// Ring buffer size; at most `queue_capacity - 1` requests wait at once
    pub queue_capacity: usize,

    /// Behaviour when the ring buffer is full
    pub queue_full_policy: QueueFullPolicy,

    /// Directory image names are resolved against
    pub asset_root: PathBuf,
}

impl AssetConfig {
    /// Create a configuration with default sizes rooted at `asset_root`
    pub fn new<P: AsRef<Path>>(asset_root: P) -> Self {
        Self {
            asset_root: asset_root.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn with_max_name_len(mut self, max_name_len: usize) -> Self {
        self.max_name_len = max_name_len;
        self
    }

    pub fn with_cache_capacity(mut self, cache_capacity: usize) -> Self {
        self.cache_capacity = cache_capacity;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_queue_full_policy(mut self, policy: QueueFullPolicy) -> Self {
        self.queue_full_policy = policy;
        self
    }

    /// Reject sizes the cache cannot work with
    pub fn validate(&self) -> Result<(), AssetError> {
        if self.max_name_len == 0 {
            return Err(AssetError::InvalidConfig(
                "max_name_len must be at least 1".to_string(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(AssetError::InvalidConfig(
                "cache_capacity must be at least 1".to_string(),
            ));
        }
        // One ring slot always stays empty
        if self.queue_capacity < 2 {
            return Err(AssetError::InvalidConfig(
                "queue_capacity must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            max_name_len: DEFAULT_MAX_NAME_LEN,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            queue_full_policy: QueueFullPolicy::default(),
            asset_root: PathBuf::from("."),
        }
    }
}
