// Texture records with deferred GPU creation and destruction
//
// Any thread may request a texture or its destruction. The actual GPU calls
// happen only in `drain_creates` / `drain_destroys`, which the thread owning
// the graphics context runs once per frame.

use log::{debug, error, warn};
use parking_lot::Mutex;
use std::mem;
use std::num::NonZeroU32;

/// Default maximum number of live texture records
pub const DEFAULT_TEXTURE_CAPACITY: usize = 1024;

/// Bytes per RGBA8 pixel
const BYTES_PER_PIXEL: usize = 4;

/// Texture management errors
#[derive(Debug, thiserror::Error)]
pub enum TextureError {
    #[error("Texture table full ({capacity} textures)")]
    TableFull { capacity: usize },

    #[error("Pixel buffer size mismatch: expected {expected} bytes, got {actual}")]
    PixelSizeMismatch { expected: usize, actual: usize },

    #[error("Texture too large: {width}x{height}")]
    TooLarge { width: u32, height: u32 },

    #[error("Stale texture reference")]
    StaleRef,

    #[error("GPU backend error: {0}")]
    Backend(String),
}

/// Identifier of a texture object owned by the graphics backend
///
/// Never zero; a texture that has not been created yet has no id at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuTextureId(NonZeroU32);

impl GpuTextureId {
    /// Wrap a raw backend id, `None` for zero
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Get the raw id
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// Generation-checked reference to a texture record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureRef {
    index: u32,
    generation: u32,
}

impl TextureRef {
    /// Slot index in the texture table
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when this reference was handed out
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Observable lifecycle of a texture record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureStatus {
    /// Waiting for the next `drain_creates`
    PendingCreate,
    /// Has a GPU id, safe to draw
    Ready,
    /// The backend refused to create it; it will never be drawn
    Failed,
}

/// A texture that can be drawn this frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyTexture {
    pub id: GpuTextureId,
    pub width: u32,
    pub height: u32,
}

/// The graphics-context side of texture management
///
/// Implementations are only ever called from the thread that drains the
/// pending lists.
pub trait TextureBackend {
    /// Upload RGBA8 pixels and return the new texture id
    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<GpuTextureId, TextureError>;

    /// Release a texture previously returned by `create_texture`
    fn destroy_texture(&mut self, id: GpuTextureId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum RecordState {
    #[default]
    Free,
    PendingCreate,
    Created,
    Failed,
}

#[derive(Debug, Default)]
struct TextureRecord {
    width: u32,
    height: u32,
    /// Owned until uploaded or destroyed
    pixels: Option<Vec<u8>>,
    gpu: Option<GpuTextureId>,
    generation: u32,
    state: RecordState,
    destroy_requested: bool,
    /// Free list link
    next_free: Option<u32>,
}

#[derive(Debug, Default)]
struct TextureTable {
    records: Vec<TextureRecord>,
    free_head: Option<u32>,
    pending_create: Vec<TextureRef>,
    pending_destroy: Vec<TextureRef>,
}

impl TextureTable {
    fn record(&self, texture: TextureRef) -> Option<&TextureRecord> {
        self.records
            .get(texture.index as usize)
            .filter(|r| r.generation == texture.generation && r.state != RecordState::Free)
    }

    fn record_mut(&mut self, texture: TextureRef) -> Option<&mut TextureRecord> {
        self.records
            .get_mut(texture.index as usize)
            .filter(|r| r.generation == texture.generation && r.state != RecordState::Free)
    }

    /// Take a slot from the free list, or grow the table up to `capacity`
    fn allocate(&mut self, capacity: usize) -> Result<u32, TextureError> {
        if let Some(index) = self.free_head {
            self.free_head = self.records[index as usize].next_free.take();
            return Ok(index);
        }

        if self.records.len() >= capacity {
            return Err(TextureError::TableFull { capacity });
        }

        self.records.push(TextureRecord::default());
        Ok((self.records.len() - 1) as u32)
    }

    /// Return a slot to the free list, handing back its GPU id if it had one
    fn release(&mut self, index: u32) -> Option<GpuTextureId> {
        let record = &mut self.records[index as usize];
        let gpu = record.gpu.take();
        record.pixels = None;
        record.width = 0;
        record.height = 0;
        record.state = RecordState::Free;
        record.destroy_requested = false;
        record.generation = record.generation.wrapping_add(1);
        record.next_free = self.free_head;
        self.free_head = Some(index);
        gpu
    }

    fn live_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.state != RecordState::Free)
            .count()
    }
}

/// Fixed-capacity texture table shared between the loader and render threads
pub struct TextureManager {
    capacity: usize,
    table: Mutex<TextureTable>,
}

impl TextureManager {
    /// Create a texture manager holding at most `capacity` live textures
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            table: Mutex::new(TextureTable {
                records: Vec::with_capacity(capacity),
                pending_create: Vec::with_capacity(capacity),
                pending_destroy: Vec::with_capacity(capacity),
                ..Default::default()
            }),
        }
    }

    /// Maximum number of live textures
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy RGBA8 pixels into a new record and queue it for GPU creation
    ///
    /// The returned reference has no GPU id until the next `drain_creates`.
    pub fn request_texture(
        &self,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<TextureRef, TextureError> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(BYTES_PER_PIXEL))
            .ok_or(TextureError::TooLarge { width, height })?;
        if pixels.len() != expected {
            return Err(TextureError::PixelSizeMismatch {
                expected,
                actual: pixels.len(),
            });
        }

        // Copy outside the lock
        let pixels = pixels.to_vec();

        let mut table = self.table.lock();
        let index = table.allocate(self.capacity)?;

        let record = &mut table.records[index as usize];
        record.width = width;
        record.height = height;
        record.pixels = Some(pixels);
        record.gpu = None;
        record.state = RecordState::PendingCreate;

        let texture = TextureRef {
            index,
            generation: record.generation,
        };
        table.pending_create.push(texture);

        debug!("Texture {} ({}x{}) queued for creation", index, width, height);
        Ok(texture)
    }

    /// Queue a texture for destruction at the end of the frame
    ///
    /// The reference stays valid (and drawable, if created) until
    /// `drain_destroys` runs. Requesting the same texture twice is a no-op.
    pub fn request_destroy(&self, texture: TextureRef) -> Result<(), TextureError> {
        let mut table = self.table.lock();
        let record = table.record_mut(texture).ok_or(TextureError::StaleRef)?;

        if record.destroy_requested {
            return Ok(());
        }
        record.destroy_requested = true;

        // Never upload something that is about to be freed
        if record.state == RecordState::PendingCreate {
            table.pending_create.retain(|t| *t != texture);
        }

        debug_assert!(table.pending_destroy.len() < self.capacity);
        table.pending_destroy.push(texture);

        debug!("Texture {} queued for destruction", texture.index);
        Ok(())
    }

    /// Create every pending texture on the GPU
    ///
    /// Must run on the graphics-context thread before any draw that may
    /// reference a texture requested since the last frame. Returns the
    /// number of textures created.
    pub fn drain_creates(&self, backend: &mut dyn TextureBackend) -> usize {
        let uploads: Vec<(TextureRef, u32, u32, Vec<u8>)> = {
            let mut table = self.table.lock();
            let pending = mem::take(&mut table.pending_create);
            pending
                .into_iter()
                .filter_map(|texture| {
                    let record = table.record_mut(texture)?;
                    if record.state != RecordState::PendingCreate {
                        return None;
                    }
                    let pixels = record.pixels.take()?;
                    Some((texture, record.width, record.height, pixels))
                })
                .collect()
        };

        if uploads.is_empty() {
            return 0;
        }

        let results: Vec<_> = uploads
            .into_iter()
            .map(|(texture, width, height, pixels)| {
                (texture, backend.create_texture(width, height, &pixels))
            })
            .collect();

        let mut created = 0;
        let mut orphans = Vec::new();
        {
            let mut table = self.table.lock();
            for (texture, result) in results {
                match (table.record_mut(texture), result) {
                    (Some(record), Ok(id)) => {
                        record.gpu = Some(id);
                        record.state = RecordState::Created;
                        created += 1;
                    }
                    (Some(record), Err(e)) => {
                        error!("Failed to create texture {}: {}", texture.index, e);
                        record.state = RecordState::Failed;
                    }
                    (None, Ok(id)) => orphans.push(id),
                    (None, Err(_)) => {}
                }
            }
        }

        for id in orphans {
            warn!("Texture {} freed during upload, destroying", id.get());
            backend.destroy_texture(id);
        }

        debug!("Created {} textures", created);
        created
    }

    /// Destroy every texture queued for destruction and recycle its slot
    ///
    /// Must run on the graphics-context thread after all draws of the frame.
    /// Returns the number of records returned to the free list.
    pub fn drain_destroys(&self, backend: &mut dyn TextureBackend) -> usize {
        let (freed, gpu_ids) = {
            let mut table = self.table.lock();
            let pending = mem::take(&mut table.pending_destroy);
            let mut freed = 0;
            let mut gpu_ids = Vec::with_capacity(pending.len());
            for texture in pending {
                if table.record(texture).is_none() {
                    continue;
                }
                if let Some(id) = table.release(texture.index) {
                    gpu_ids.push(id);
                }
                freed += 1;
            }
            (freed, gpu_ids)
        };

        for id in gpu_ids {
            backend.destroy_texture(id);
        }

        if freed > 0 {
            debug!("Destroyed {} textures", freed);
        }
        freed
    }

    /// Destroy every texture regardless of pending state
    ///
    /// Used at teardown, after the last frame.
    pub fn free_all(&self, backend: &mut dyn TextureBackend) {
        let gpu_ids: Vec<GpuTextureId> = {
            let mut table = self.table.lock();
            table.pending_create.clear();
            table.pending_destroy.clear();
            let live: Vec<u32> = table
                .records
                .iter()
                .enumerate()
                .filter(|(_, r)| r.state != RecordState::Free)
                .map(|(i, _)| i as u32)
                .collect();
            live.into_iter()
                .filter_map(|index| table.release(index))
                .collect()
        };

        for id in gpu_ids {
            backend.destroy_texture(id);
        }
    }

    /// GPU id of a texture, `None` if not created yet or stale
    pub fn gpu_handle(&self, texture: TextureRef) -> Option<GpuTextureId> {
        self.table.lock().record(texture).and_then(|r| r.gpu)
    }

    /// Everything a draw call needs, if the texture is drawable right now
    pub fn ready(&self, texture: TextureRef) -> Option<ReadyTexture> {
        let table = self.table.lock();
        let record = table.record(texture)?;
        record.gpu.map(|id| ReadyTexture {
            id,
            width: record.width,
            height: record.height,
        })
    }

    /// Dimensions of a live texture
    pub fn size(&self, texture: TextureRef) -> Option<(u32, u32)> {
        self.table
            .lock()
            .record(texture)
            .map(|r| (r.width, r.height))
    }

    /// Lifecycle status of a live texture, `None` if stale
    pub fn status(&self, texture: TextureRef) -> Option<TextureStatus> {
        self.table.lock().record(texture).map(|r| match r.state {
            RecordState::Created => TextureStatus::Ready,
            RecordState::Failed => TextureStatus::Failed,
            _ => TextureStatus::PendingCreate,
        })
    }

    /// Get statistics about the texture table
    pub fn stats(&self) -> TextureStats {
        let table = self.table.lock();
        let live = table.live_count();
        TextureStats {
            live,
            free: table.records.len() - live,
            pending_create: table.pending_create.len(),
            pending_destroy: table.pending_destroy.len(),
        }
    }
}

impl Default for TextureManager {
    fn default() -> Self {
        Self::new(DEFAULT_TEXTURE_CAPACITY)
    }
}

/// Statistics about the texture table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureStats {
    pub live: usize,
    pub free: usize,
    pub pending_create: usize,
    pub pending_destroy: usize,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashSet;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum BackendEvent {
        Created(GpuTextureId),
        Destroyed(GpuTextureId),
    }

    /// Backend that hands out sequential ids and records every call
    #[derive(Debug, Default)]
    pub struct RecordingBackend {
        next_id: u32,
        pub events: Vec<BackendEvent>,
        pub live: HashSet<GpuTextureId>,
        pub fail_creates: bool,
    }

    impl RecordingBackend {
        /// Backend whose every create fails
        pub fn failing() -> Self {
            Self {
                fail_creates: true,
                ..Default::default()
            }
        }
    }

    impl TextureBackend for RecordingBackend {
        fn create_texture(
            &mut self,
            _width: u32,
            _height: u32,
            _pixels: &[u8],
        ) -> Result<GpuTextureId, TextureError> {
            if self.fail_creates {
                return Err(TextureError::Backend("out of memory".to_string()));
            }
            self.next_id += 1;
            let id = GpuTextureId::new(self.next_id).expect("ids start at 1");
            self.live.insert(id);
            self.events.push(BackendEvent::Created(id));
            Ok(id)
        }

        fn destroy_texture(&mut self, id: GpuTextureId) {
            assert!(self.live.remove(&id), "double destroy of {:?}", id);
            self.events.push(BackendEvent::Destroyed(id));
        }
    }
}
