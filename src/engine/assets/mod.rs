// Asset management system
//
// Name-keyed image cache with reference counting, loaded in the background
// by a dedicated thread and handed to the renderer as deferred textures.

mod cache;
mod config;
mod handle;
mod loader;
mod queue;

pub use cache::AssetCache;
pub use config::AssetConfig;
pub use handle::{AssetState, ImageHandle};
pub use loader::AssetLoader;

// Re-export for future use
#[allow(unused_imports)]
pub use cache::{CacheStats, ImageInfo};
#[allow(unused_imports)]
pub use config::{
    QueueFullPolicy, DEFAULT_CACHE_CAPACITY, DEFAULT_MAX_NAME_LEN, DEFAULT_QUEUE_CAPACITY,
};
#[allow(unused_imports)]
pub use handle::{AssetHandle, AssetKind, ImageAsset};
#[allow(unused_imports)]
pub use loader::{load_entire_file, DecodedImage, FileDecoder, ImageDecoder, IMAGE_EXTENSIONS};
#[allow(unused_imports)]
pub use queue::{LoadQueue, LoadRequest, WakeSignal};

use crate::engine::renderer::texture::TextureError;

/// Asset loading errors
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("Asset name too long: {len} bytes (limit {max})")]
    NameTooLong { len: usize, max: usize },

    #[error("Asset cache full ({capacity} entries)")]
    CacheFull { capacity: usize },

    #[error("Load queue full")]
    QueueFull,

    #[error("Stale asset handle")]
    StaleHandle,

    #[error("Invalid asset type: expected {expected:?}, got {actual:?}")]
    WrongKind { expected: AssetKind, actual: AssetKind },

    #[error("Asset not found: {0}")]
    NotFound(String),

    #[error("Failed to decode asset: {0}")]
    Decode(String),

    #[error("Invalid asset configuration: {0}")]
    InvalidConfig(String),

    #[error("Texture error: {0}")]
    Texture(#[from] TextureError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
