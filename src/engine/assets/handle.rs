// Type-safe, generation-checked asset handles

use std::marker::PhantomData;

/// Kind of asset stored in a cache record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AssetKind {
    #[default]
    None,
    Image,
}

/// Load state of an asset
///
/// Moves forward only: `None -> Queued -> Loaded | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AssetState {
    #[default]
    None,
    Queued,
    Loaded,
    Failed,
}

impl AssetState {
    /// Loading has finished, successfully or not
    pub fn is_terminal(&self) -> bool {
        matches!(self, AssetState::Loaded | AssetState::Failed)
    }
}

/// Handle to a cached asset
///
/// Points at a cache slot plus the generation of the record it was issued
/// for. Once the record is released the generation moves on and the handle
/// goes stale instead of aliasing whatever is loaded into the slot next.
/// The `T` parameter ensures handles can only be used with the correct asset type.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct AssetHandle<T> {
    pub(crate) index: u32,
    pub(crate) generation: u32,
    _phantom: PhantomData<T>,
}

impl<T> AssetHandle<T> {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _phantom: PhantomData,
        }
    }

    /// Cache slot this handle refers to
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the record this handle was issued for
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

// Handles are plain indices whatever the marker type
impl<T> Clone for AssetHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AssetHandle<T> {}

// Marker types for different asset types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageAsset;

/// Convenience type alias
pub type ImageHandle = AssetHandle<ImageAsset>;
