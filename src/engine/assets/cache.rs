// Name-keyed, reference-counted image cache with background loading
//
// The name table is a fixed-size open-addressing hash table. A slot that has
// been bound to a name keeps that name forever; releasing an asset only
// clears the record stored in it. Lookups therefore never have to deal with
// tombstones, and a full table stays full.

use super::config::{AssetConfig, QueueFullPolicy};
use super::handle::{AssetHandle, AssetKind, AssetState, ImageHandle};
use super::loader::{FileDecoder, ImageDecoder, LoaderThread, AssetLoader};
use super::queue::{LoadQueue, LoadRequest};
use super::AssetError;
use crate::core::hash;
use crate::engine::renderer::texture::{TextureManager, TextureRef};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Snapshot of an image asset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub state: AssetState,
    /// Set once loaded; may still be waiting for GPU creation
    pub texture: Option<TextureRef>,
}

#[derive(Debug, Clone)]
struct AssetRecord {
    kind: AssetKind,
    state: AssetState,
    ref_count: i32,
    width: u32,
    height: u32,
    texture: Option<TextureRef>,
}

impl AssetRecord {
    fn new(kind: AssetKind) -> Self {
        Self {
            kind,
            state: AssetState::None,
            ref_count: 1,
            width: 0,
            height: 0,
            texture: None,
        }
    }
}

#[derive(Debug, Default)]
struct CacheEntry {
    /// `None` until the slot is first bound to a name
    name: Option<String>,
    record: Option<AssetRecord>,
    generation: u32,
}

#[derive(Debug)]
struct NameTable {
    entries: Vec<CacheEntry>,
    occupied: usize,
}

impl NameTable {
    fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| CacheEntry::default()).collect(),
            occupied: 0,
        }
    }

    /// Linear probe from the name's bucket
    ///
    /// Returns the slot bound to `name`, binding the first never-used slot if
    /// the name is new. `None` when every slot is bound to another name.
    fn lookup_or_bind(&mut self, name: &str) -> Option<usize> {
        let len = self.entries.len();
        let start = hash::bucket(name, len);
        let mut index = start;

        loop {
            let entry = &mut self.entries[index];
            match &entry.name {
                Some(bound) if bound == name => return Some(index),
                Some(_) => {}
                None => {
                    entry.name = Some(name.to_string());
                    self.occupied += 1;
                    return Some(index);
                }
            }

            index = (index + 1) % len;
            if index == start {
                return None;
            }
        }
    }

    fn record<T>(&self, handle: AssetHandle<T>) -> Option<&AssetRecord> {
        self.entries
            .get(handle.index as usize)
            .filter(|e| e.generation == handle.generation)
            .and_then(|e| e.record.as_ref())
    }

    fn entry_mut<T>(&mut self, handle: AssetHandle<T>) -> Option<&mut CacheEntry> {
        self.entries
            .get_mut(handle.index as usize)
            .filter(|e| e.generation == handle.generation && e.record.is_some())
    }

    fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.record.is_some()).count()
    }
}

/// Result of a load, published by the loader thread
#[derive(Debug, Clone, Copy)]
pub(crate) enum LoadOutcome {
    Loaded {
        width: u32,
        height: u32,
        texture: TextureRef,
    },
    Failed,
}

/// State shared between the cache owner and the loader thread
pub(crate) struct CacheShared {
    table: Mutex<NameTable>,
    /// Signalled whenever a record reaches a terminal state or is freed
    terminal: Condvar,
    pub(crate) queue: LoadQueue,
    pub(crate) textures: Arc<TextureManager>,
}

impl CacheShared {
    /// The record a request was issued for still exists
    pub(crate) fn is_live(&self, request: &LoadRequest) -> bool {
        let handle: ImageHandle = AssetHandle::new(request.index, request.generation);
        self.table.lock().record(handle).is_some()
    }

    /// Record the result of a load and wake anyone waiting on it
    pub(crate) fn publish(&self, request: &LoadRequest, outcome: LoadOutcome) {
        let handle: ImageHandle = AssetHandle::new(request.index, request.generation);
        let orphan = {
            let mut table = self.table.lock();
            match table.entry_mut(handle).and_then(|e| e.record.as_mut()) {
                Some(record) if !record.state.is_terminal() => {
                    match outcome {
                        LoadOutcome::Loaded {
                            width,
                            height,
                            texture,
                        } => {
                            record.width = width;
                            record.height = height;
                            record.texture = Some(texture);
                            record.state = AssetState::Loaded;
                            debug!("Loaded '{}' ({}x{})", request.name, width, height);
                        }
                        LoadOutcome::Failed => {
                            record.state = AssetState::Failed;
                        }
                    }
                    None
                }
                // Released mid-load: nobody will ever release this texture
                _ => match outcome {
                    LoadOutcome::Loaded { texture, .. } => Some(texture),
                    LoadOutcome::Failed => None,
                },
            }
        };
        self.terminal.notify_all();

        if let Some(texture) = orphan {
            debug!("'{}' was released while loading, dropping its texture", request.name);
            if let Err(e) = self.textures.request_destroy(texture) {
                warn!("Could not release texture for '{}': {}", request.name, e);
            }
        }
    }
}

/// Asynchronous image cache
///
/// `get_image` never blocks on I/O: misses are queued for a dedicated loader
/// thread, which decodes the file and requests a GPU texture from the
/// `TextureManager`. The render thread observes progress through
/// `state`/`image` and draws nothing until the texture is ready.
pub struct AssetCache {
    config: AssetConfig,
    shared: Arc<CacheShared>,
    loader: LoaderThread,
}

impl AssetCache {
    /// Create a cache that decodes files under `config.asset_root`
    pub fn new(config: AssetConfig, textures: Arc<TextureManager>) -> Result<Self, AssetError> {
        let decoder = FileDecoder::new(AssetLoader::new(&config.asset_root));
        Self::with_decoder(config, textures, decoder)
    }

    /// Create a cache with a custom decoder
    pub fn with_decoder<D: ImageDecoder + 'static>(
        config: AssetConfig,
        textures: Arc<TextureManager>,
        decoder: D,
    ) -> Result<Self, AssetError> {
        config.validate()?;

        let shared = Arc::new(CacheShared {
            table: Mutex::new(NameTable::new(config.cache_capacity)),
            terminal: Condvar::new(),
            queue: LoadQueue::new(config.queue_capacity),
            textures,
        });
        let loader = LoaderThread::spawn(Arc::clone(&shared), Box::new(decoder))?;

        info!(
            "Asset cache ready: {} slots, {} queue slots",
            config.cache_capacity, config.queue_capacity
        );

        Ok(Self {
            config,
            shared,
            loader,
        })
    }

    /// Get a handle to an image, queueing a load on first use
    ///
    /// Every successful call adds a reference that must be given back with
    /// `release`. The handle is returned whatever the load state, including
    /// images that are still loading or failed to load.
    pub fn get_image(&self, name: &str) -> Result<ImageHandle, AssetError> {
        if name.len() >= self.config.max_name_len {
            return Err(AssetError::NameTooLong {
                len: name.len(),
                max: self.config.max_name_len,
            });
        }

        let mut table = self.shared.table.lock();
        let index = table
            .lookup_or_bind(name)
            .ok_or(AssetError::CacheFull {
                capacity: self.config.cache_capacity,
            })?;

        let entry = &mut table.entries[index];
        let handle = ImageHandle::new(index as u32, entry.generation);

        if let Some(record) = entry.record.as_mut() {
            if record.kind != AssetKind::Image {
                return Err(AssetError::WrongKind {
                    expected: AssetKind::Image,
                    actual: record.kind,
                });
            }
            record.ref_count += 1;
            return Ok(handle);
        }

        let mut record = AssetRecord::new(AssetKind::Image);
        record.state = AssetState::Queued;
        entry.record = Some(record);

        let request = LoadRequest {
            index: index as u32,
            generation: entry.generation,
            name: name.to_string(),
        };
        if self.shared.queue.enqueue(request).is_err() {
            match self.config.queue_full_policy {
                QueueFullPolicy::Drop => {
                    warn!("Load queue full, '{}' will never load", name);
                }
                QueueFullPolicy::Reject => {
                    entry.record = None;
                    entry.generation = entry.generation.wrapping_add(1);
                    return Err(AssetError::QueueFull);
                }
            }
        } else {
            debug!("Queued '{}'", name);
        }

        Ok(handle)
    }

    /// Give back a reference obtained from `get_image`
    ///
    /// The last release frees the record and queues its texture for
    /// destruction at the end of the frame. The handle is stale afterwards.
    pub fn release<T>(&self, handle: AssetHandle<T>) -> Result<(), AssetError> {
        let texture = {
            let mut table = self.shared.table.lock();
            let entry = table.entry_mut(handle).ok_or(AssetError::StaleHandle)?;
            let Some(record) = entry.record.as_mut() else {
                return Err(AssetError::StaleHandle);
            };

            record.ref_count -= 1;
            if record.ref_count > 0 {
                return Ok(());
            }

            let texture = entry.record.take().and_then(|r| r.texture);
            entry.generation = entry.generation.wrapping_add(1);
            if let Some(name) = &entry.name {
                debug!("Freed '{}'", name);
            }
            texture
        };
        // Waiters on this handle must see it go stale
        self.shared.terminal.notify_all();

        if let Some(texture) = texture {
            self.shared.textures.request_destroy(texture)?;
        }
        Ok(())
    }

    /// Block until the asset has loaded or failed
    ///
    /// Expensive; the frame loop should poll `state` instead. An asset whose
    /// load request was dropped never reaches a terminal state.
    pub fn wait_for_terminal<T>(&self, handle: AssetHandle<T>) -> Result<AssetState, AssetError> {
        let mut table = self.shared.table.lock();
        loop {
            let state = table.record(handle).ok_or(AssetError::StaleHandle)?.state;
            if state.is_terminal() {
                return Ok(state);
            }
            self.shared.terminal.wait(&mut table);
        }
    }

    /// Like `wait_for_terminal`, giving up after `timeout` with `Ok(None)`
    pub fn wait_for_terminal_timeout<T>(
        &self,
        handle: AssetHandle<T>,
        timeout: Duration,
    ) -> Result<Option<AssetState>, AssetError> {
        let deadline = Instant::now() + timeout;
        let mut table = self.shared.table.lock();
        loop {
            let state = table.record(handle).ok_or(AssetError::StaleHandle)?.state;
            if state.is_terminal() {
                return Ok(Some(state));
            }
            if self
                .shared
                .terminal
                .wait_until(&mut table, deadline)
                .timed_out()
            {
                return Ok(None);
            }
        }
    }

    /// Current load state, `None` for a stale handle
    pub fn state<T>(&self, handle: AssetHandle<T>) -> Option<AssetState> {
        self.shared.table.lock().record(handle).map(|r| r.state)
    }

    /// Current reference count, `None` for a stale handle
    pub fn ref_count<T>(&self, handle: AssetHandle<T>) -> Option<i32> {
        self.shared.table.lock().record(handle).map(|r| r.ref_count)
    }

    /// Snapshot of an image, `None` for a stale handle
    pub fn image(&self, handle: ImageHandle) -> Option<ImageInfo> {
        self.shared.table.lock().record(handle).map(|r| ImageInfo {
            width: r.width,
            height: r.height,
            state: r.state,
            texture: r.texture,
        })
    }

    /// Texture of a loaded image
    pub fn texture(&self, handle: ImageHandle) -> Option<TextureRef> {
        self.image(handle).and_then(|info| info.texture)
    }

    /// Get statistics about the cache
    pub fn stats(&self) -> CacheStats {
        let table = self.shared.table.lock();
        CacheStats {
            capacity: table.entries.len(),
            occupied_entries: table.occupied,
            live_assets: table.live_count(),
            pending_loads: self.shared.queue.len(),
        }
    }

    /// The configuration the cache was built with
    pub fn config(&self) -> &AssetConfig {
        &self.config
    }

    /// The texture manager loaded images are uploaded through
    pub fn textures(&self) -> &Arc<TextureManager> {
        &self.shared.textures
    }
}

impl Drop for AssetCache {
    fn drop(&mut self) {
        self.loader.shutdown();

        let textures: Vec<TextureRef> = {
            let mut table = self.shared.table.lock();
            table
                .entries
                .iter_mut()
                .filter_map(|e| e.record.take().and_then(|r| r.texture))
                .collect()
        };
        for texture in textures {
            if let Err(e) = self.shared.textures.request_destroy(texture) {
                warn!("Could not release texture at shutdown: {}", e);
            }
        }
    }
}

/// Statistics about the asset cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub capacity: usize,
    /// Slots bound to a name; never decreases
    pub occupied_entries: usize,
    /// Slots currently holding a record
    pub live_assets: usize,
    /// Requests waiting in the load queue
    pub pending_loads: usize,
}

#[cfg(test)]
mod tests {
    use super::super::loader::testing::{gated, PickyDecoder, SolidDecoder};
    use super::*;
    use crate::engine::renderer::texture::testing::RecordingBackend;
    use std::thread;

    const WAIT: Duration = Duration::from_secs(5);

    fn cache_with<D: ImageDecoder + 'static>(config: AssetConfig, decoder: D) -> AssetCache {
        AssetCache::with_decoder(config, Arc::new(TextureManager::new(1024)), decoder).unwrap()
    }

    #[test]
    fn test_first_get_creates_queued_record() {
        let (decoder, started, gate) = gated();
        let cache = cache_with(AssetConfig::default(), decoder);

        let handle = cache.get_image("player.png").unwrap();
        assert_eq!(cache.ref_count(handle), Some(1));
        assert_eq!(cache.state(handle), Some(AssetState::Queued));

        let stats = cache.stats();
        assert_eq!(stats.occupied_entries, 1);
        assert_eq!(stats.live_assets, 1);

        assert_eq!(started.recv_timeout(WAIT).unwrap(), "player.png");
        gate.send(()).unwrap();
        assert_eq!(cache.wait_for_terminal(handle).unwrap(), AssetState::Loaded);
    }

    #[test]
    fn test_repeat_gets_share_one_record() {
        let cache = cache_with(AssetConfig::default(), SolidDecoder);

        let a = cache.get_image("tiles.png").unwrap();
        let b = cache.get_image("tiles.png").unwrap();
        let c = cache.get_image("tiles.png").unwrap();

        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(cache.ref_count(a), Some(3));
        assert_eq!(cache.stats().live_assets, 1);
    }

    #[test]
    fn test_ref_counting_and_fresh_record_after_release() {
        let cache = cache_with(AssetConfig::default(), SolidDecoder);

        let handle = cache.get_image("hero.png").unwrap();
        for _ in 0..4 {
            cache.get_image("hero.png").unwrap();
        }
        cache.release(handle).unwrap();
        cache.release(handle).unwrap();
        assert_eq!(cache.ref_count(handle), Some(3));

        assert_eq!(cache.wait_for_terminal(handle).unwrap(), AssetState::Loaded);

        for _ in 0..3 {
            cache.release(handle).unwrap();
        }
        assert_eq!(cache.state(handle), None, "Record should be freed");
        assert!(matches!(cache.release(handle), Err(AssetError::StaleHandle)));
        assert_eq!(cache.stats().live_assets, 0);
        assert_eq!(cache.stats().occupied_entries, 1, "Slot keeps its name");

        let fresh = cache.get_image("hero.png").unwrap();
        assert_eq!(fresh.index(), handle.index());
        assert_ne!(fresh.generation(), handle.generation());
        assert_eq!(cache.ref_count(fresh), Some(1));
        assert!(matches!(
            cache.state(fresh),
            Some(AssetState::Queued) | Some(AssetState::Loaded)
        ));
        assert_eq!(cache.wait_for_terminal(fresh).unwrap(), AssetState::Loaded);
    }

    #[test]
    fn test_release_queues_texture_destruction() {
        let cache = cache_with(AssetConfig::default(), SolidDecoder);
        let mut backend = RecordingBackend::default();

        let handle = cache.get_image("coin.png").unwrap();
        assert_eq!(cache.wait_for_terminal(handle).unwrap(), AssetState::Loaded);

        let info = cache.image(handle).unwrap();
        assert_eq!((info.width, info.height), (1, 1));
        let texture = info.texture.unwrap();

        let textures = Arc::clone(cache.textures());
        textures.drain_creates(&mut backend);
        assert!(textures.gpu_handle(texture).is_some());

        cache.release(handle).unwrap();
        assert_eq!(textures.stats().pending_destroy, 1);
        // Still drawable until the end of the frame
        assert!(textures.gpu_handle(texture).is_some());

        textures.drain_destroys(&mut backend);
        assert_eq!(textures.gpu_handle(texture), None);
        assert!(backend.live.is_empty());
    }

    #[test]
    fn test_decode_failure_marks_failed() {
        let cache = cache_with(AssetConfig::default(), PickyDecoder);

        let missing = cache.get_image("missing.png").unwrap();
        assert_eq!(cache.wait_for_terminal(missing).unwrap(), AssetState::Failed);
        assert_eq!(cache.texture(missing), None);
        assert_eq!(cache.textures().stats().pending_create, 0);

        // Failed assets are still handed out and counted
        let again = cache.get_image("missing.png").unwrap();
        assert_eq!(again, missing);
        assert_eq!(cache.ref_count(missing), Some(2));
        assert_eq!(cache.state(missing), Some(AssetState::Failed));
    }

    #[test]
    fn test_texture_table_full_marks_failed() {
        let textures = Arc::new(TextureManager::new(1));
        let cache =
            AssetCache::with_decoder(AssetConfig::default(), textures, SolidDecoder).unwrap();

        let first = cache.get_image("a.png").unwrap();
        let second = cache.get_image("b.png").unwrap();
        assert_eq!(cache.wait_for_terminal(first).unwrap(), AssetState::Loaded);
        assert_eq!(cache.wait_for_terminal(second).unwrap(), AssetState::Failed);
    }

    #[test]
    fn test_name_too_long() {
        let cache = cache_with(AssetConfig::default().with_max_name_len(8), SolidDecoder);

        assert!(cache.get_image("1234567").is_ok());
        let err = cache.get_image("12345678").unwrap_err();
        assert!(matches!(err, AssetError::NameTooLong { len: 8, max: 8 }));
    }

    #[test]
    fn test_cache_full_is_terminal() {
        let cache = cache_with(AssetConfig::default().with_cache_capacity(4), SolidDecoder);

        let handles: Vec<_> = (0..4)
            .map(|i| cache.get_image(&format!("{}.png", i)).unwrap())
            .collect();
        assert!(matches!(
            cache.get_image("overflow.png"),
            Err(AssetError::CacheFull { capacity: 4 })
        ));

        // Known names still resolve in a full table
        assert_eq!(cache.get_image("2.png").unwrap(), handles[2]);

        // Releasing does not free the slot for a different name
        for handle in &handles {
            cache.wait_for_terminal(*handle).unwrap();
            while cache.release(*handle).is_ok() {}
        }
        assert!(matches!(
            cache.get_image("overflow.png"),
            Err(AssetError::CacheFull { .. })
        ));
        assert_eq!(cache.stats().occupied_entries, 4);
    }

    #[test]
    fn test_probing_wraps_around() {
        let cache = cache_with(AssetConfig::default().with_cache_capacity(3), SolidDecoder);

        let names = ["x.png", "y.png", "z.png"];
        let handles: Vec<_> = names.iter().map(|n| cache.get_image(n).unwrap()).collect();

        let mut slots: Vec<u32> = handles.iter().map(|h| h.index()).collect();
        slots.sort();
        assert_eq!(slots, vec![0, 1, 2], "Every slot should be used once");

        for (name, handle) in names.iter().zip(&handles) {
            assert_eq!(cache.get_image(name).unwrap(), *handle);
        }
    }

    #[test]
    fn test_queue_full_drop_leaves_asset_queued() {
        let (decoder, started, gate) = gated();
        let config = AssetConfig::default().with_queue_capacity(4);
        let cache = cache_with(config, decoder);

        // Park the loader inside the first decode so the queue stays put
        let first = cache.get_image("first.png").unwrap();
        assert_eq!(started.recv_timeout(WAIT).unwrap(), "first.png");
        assert_eq!(cache.stats().pending_loads, 0);

        let accepted: Vec<_> = (0..3)
            .map(|i| cache.get_image(&format!("q{}.png", i)).unwrap())
            .collect();
        assert_eq!(cache.stats().pending_loads, 3);

        assert_eq!(cache.config().queue_full_policy, QueueFullPolicy::Drop);
        let dropped = cache.get_image("dropped.png").unwrap();
        assert_eq!(cache.state(dropped), Some(AssetState::Queued));
        assert_eq!(cache.stats().pending_loads, 3, "Fourth request must not fit");

        for _ in 0..4 {
            gate.send(()).unwrap();
        }
        assert_eq!(cache.wait_for_terminal(first).unwrap(), AssetState::Loaded);
        for handle in &accepted {
            assert_eq!(cache.wait_for_terminal(*handle).unwrap(), AssetState::Loaded);
        }

        assert_eq!(cache.stats().pending_loads, 0);
        assert_eq!(cache.state(dropped), Some(AssetState::Queued));
        assert_eq!(
            cache
                .wait_for_terminal_timeout(dropped, Duration::from_millis(50))
                .unwrap(),
            None
        );
        drop(gate);
    }

    #[test]
    fn test_queue_full_reject_rolls_back() {
        let (decoder, started, gate) = gated();
        let config = AssetConfig::default()
            .with_queue_capacity(2)
            .with_queue_full_policy(QueueFullPolicy::Reject);
        let cache = cache_with(config, decoder);

        let first = cache.get_image("first.png").unwrap();
        assert_eq!(started.recv_timeout(WAIT).unwrap(), "first.png");
        let second = cache.get_image("second.png").unwrap();

        assert!(matches!(
            cache.get_image("third.png"),
            Err(AssetError::QueueFull)
        ));
        assert_eq!(cache.stats().live_assets, 2);

        // Existing records are unaffected by a full queue
        assert_eq!(cache.get_image("second.png").unwrap(), second);

        gate.send(()).unwrap();
        gate.send(()).unwrap();
        assert_eq!(cache.wait_for_terminal(first).unwrap(), AssetState::Loaded);
        assert_eq!(cache.wait_for_terminal(second).unwrap(), AssetState::Loaded);
        assert_eq!(started.recv_timeout(WAIT).unwrap(), "second.png");

        // Room again: the retry succeeds
        let third = cache.get_image("third.png").unwrap();
        assert_eq!(started.recv_timeout(WAIT).unwrap(), "third.png");
        gate.send(()).unwrap();
        assert_eq!(cache.wait_for_terminal(third).unwrap(), AssetState::Loaded);
    }

    #[test]
    fn test_release_while_loading_drops_texture() {
        let (decoder, started, gate) = gated();
        let cache = cache_with(AssetConfig::default(), decoder);
        let mut backend = RecordingBackend::default();

        let handle = cache.get_image("ghost.png").unwrap();
        assert_eq!(started.recv_timeout(WAIT).unwrap(), "ghost.png");
        cache.release(handle).unwrap();
        gate.send(()).unwrap();

        // Use a second load as a barrier: the loader handles requests in order
        let marker = cache.get_image("marker.png").unwrap();
        started.recv_timeout(WAIT).unwrap();
        gate.send(()).unwrap();
        assert_eq!(cache.wait_for_terminal(marker).unwrap(), AssetState::Loaded);

        let textures = cache.textures();
        assert_eq!(textures.stats().pending_destroy, 1);
        textures.drain_creates(&mut backend);
        textures.drain_destroys(&mut backend);
        assert_eq!(textures.stats().live, 1, "Only the marker texture survives");
    }

    #[test]
    fn test_wait_for_stale_handle() {
        let cache = cache_with(AssetConfig::default(), SolidDecoder);
        let handle = cache.get_image("gone.png").unwrap();
        cache.release(handle).unwrap();
        assert!(matches!(
            cache.wait_for_terminal(handle),
            Err(AssetError::StaleHandle)
        ));
    }

    #[test]
    fn test_released_while_queued_is_never_decoded() {
        let (decoder, started, gate) = gated();
        let cache = cache_with(AssetConfig::default(), decoder);

        let first = cache.get_image("first.png").unwrap();
        assert_eq!(started.recv_timeout(WAIT).unwrap(), "first.png");

        // Queue, free and re-request while the loader is parked
        let stale = cache.get_image("second.png").unwrap();
        cache.release(stale).unwrap();
        let fresh = cache.get_image("second.png").unwrap();
        assert_eq!(fresh.index(), stale.index());
        assert_ne!(fresh.generation(), stale.generation());
        assert_eq!(cache.stats().pending_loads, 2);

        gate.send(()).unwrap();
        assert_eq!(cache.wait_for_terminal(first).unwrap(), AssetState::Loaded);

        // Only the fresh request reaches the decoder
        assert_eq!(started.recv_timeout(WAIT).unwrap(), "second.png");
        gate.send(()).unwrap();
        assert_eq!(
            cache.wait_for_terminal_timeout(fresh, WAIT).unwrap(),
            Some(AssetState::Loaded)
        );
        assert!(started.try_recv().is_err());
        assert_eq!(cache.textures().stats().live, 2);
        assert_eq!(cache.textures().stats().pending_destroy, 0);
    }

    #[test]
    fn test_shutdown_leaves_backlog_queued() {
        let (decoder, started, gate) = gated();
        let mut cache = cache_with(AssetConfig::default(), decoder);

        let first = cache.get_image("first.png").unwrap();
        assert_eq!(started.recv_timeout(WAIT).unwrap(), "first.png");

        let backlog: Vec<_> = (0..5)
            .map(|i| cache.get_image(&format!("backlog{}.png", i)).unwrap())
            .collect();
        assert_eq!(cache.stats().pending_loads, 5);

        // Stop while the loader is mid-decode, then let that decode finish
        cache.shared.queue.shutdown();
        gate.send(()).unwrap();

        let begin = Instant::now();
        cache.loader.shutdown();
        assert!(begin.elapsed() < WAIT, "Join must not wait on the backlog");

        assert_eq!(cache.state(first), Some(AssetState::Loaded));
        for handle in &backlog {
            assert_eq!(cache.state(*handle), Some(AssetState::Queued));
        }
        assert_eq!(cache.stats().pending_loads, 5);
        assert!(started.try_recv().is_err(), "No decode after shutdown");

        drop(cache);
        assert!(started.try_recv().is_err());
    }

    #[test]
    fn test_drop_with_backlog_returns_promptly() {
        let (decoder, started, gate) = gated();
        let cache = cache_with(AssetConfig::default(), decoder);

        cache.get_image("first.png").unwrap();
        assert_eq!(started.recv_timeout(WAIT).unwrap(), "first.png");
        for i in 0..20 {
            cache.get_image(&format!("backlog{}.png", i)).unwrap();
        }

        // Release the parked decode once drop has flagged shutdown; any
        // further decode would sit out the full gate timeout
        let shared = Arc::clone(&cache.shared);
        let opener = thread::spawn(move || {
            while !shared.queue.is_shut_down() {
                thread::yield_now();
            }
            gate.send(()).unwrap();
            gate
        });
        let begin = Instant::now();
        drop(cache);
        let elapsed = begin.elapsed();
        drop(opener.join().unwrap());

        assert!(elapsed < WAIT, "Drop took {:?}", elapsed);
        assert!(started.try_recv().is_err(), "No decode after shutdown");
    }

    #[test]
    fn test_many_threads_share_records() {
        let cache = Arc::new(cache_with(AssetConfig::default(), SolidDecoder));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    (0..50)
                        .map(|i| cache.get_image(&format!("shared_{}.png", i)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<Vec<ImageHandle>> =
            workers.into_iter().map(|w| w.join().unwrap()).collect();

        for i in 0..50 {
            let handle = results[0][i];
            assert!(results.iter().all(|r| r[i] == handle));
            assert_eq!(cache.ref_count(handle), Some(4));
        }
        assert_eq!(cache.stats().live_assets, 50);
    }

    #[test]
    fn test_thousand_images_load_and_release() {
        let textures = Arc::new(TextureManager::new(1024));
        let config = AssetConfig::default()
            .with_cache_capacity(1024)
            .with_queue_capacity(512)
            .with_queue_full_policy(QueueFullPolicy::Reject);
        let cache = AssetCache::with_decoder(config, Arc::clone(&textures), SolidDecoder).unwrap();
        let mut backend = RecordingBackend::default();

        let handles: Vec<ImageHandle> = (0..1000)
            .map(|i| {
                let name = format!("sprites/{:04}.png", i);
                // The loader drains concurrently; back off while it catches up
                loop {
                    match cache.get_image(&name) {
                        Ok(handle) => break handle,
                        Err(AssetError::QueueFull) => thread::yield_now(),
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
            })
            .collect();

        for handle in &handles {
            assert_eq!(cache.wait_for_terminal(*handle).unwrap(), AssetState::Loaded);
        }
        assert_eq!(cache.stats().live_assets, 1000);
        assert_eq!(textures.drain_creates(&mut backend), 1000);

        for handle in &handles {
            cache.release(*handle).unwrap();
            assert_eq!(cache.ref_count(*handle), None);
        }
        assert_eq!(textures.stats().pending_destroy, 1000);

        assert_eq!(textures.drain_destroys(&mut backend), 1000);
        assert_eq!(textures.stats().pending_destroy, 0);
        assert!(backend.live.is_empty());
    }

    #[test]
    fn test_drop_releases_live_textures() {
        let textures = Arc::new(TextureManager::new(16));
        let mut backend = RecordingBackend::default();
        {
            let cache = AssetCache::with_decoder(
                AssetConfig::default(),
                Arc::clone(&textures),
                SolidDecoder,
            )
            .unwrap();
            let handle = cache.get_image("keep.png").unwrap();
            cache.wait_for_terminal(handle).unwrap();
            textures.drain_creates(&mut backend);
        }

        assert_eq!(textures.stats().pending_destroy, 1);
        textures.drain_destroys(&mut backend);
        assert!(backend.live.is_empty());
    }
}
