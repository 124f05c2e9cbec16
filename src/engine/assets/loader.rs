// Asset file access, image decoding and the background loader thread

use super::cache::{CacheShared, LoadOutcome};
use super::queue::LoadRequest;
use super::AssetError;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// File extensions the image codec understands
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Read a whole file into memory
pub fn load_entire_file<P: AsRef<Path>>(path: P) -> std::io::Result<Vec<u8>> {
    std::fs::read(path)
}

/// Resolves asset names to files under a base directory
#[derive(Debug, Clone)]
pub struct AssetLoader {
    base_path: PathBuf,
}

impl AssetLoader {
    /// Create a new asset loader with the given base path
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Get the full path for an asset name
    pub fn resolve_path(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    /// Load asset bytes from disk
    pub fn load_bytes(&self, name: &str) -> Result<Vec<u8>, AssetError> {
        let path = self.resolve_path(name);

        if !path.is_file() {
            return Err(AssetError::NotFound(path.to_string_lossy().to_string()));
        }

        Ok(load_entire_file(&path)?)
    }

    /// Check if an asset exists
    pub fn exists(&self, name: &str) -> bool {
        self.resolve_path(name).is_file()
    }

    /// List the image files directly inside the base path
    pub fn list_images(&self) -> Result<Vec<String>, AssetError> {
        if !self.base_path.is_dir() {
            return Ok(Vec::new());
        }

        let mut images = Vec::new();
        for entry in std::fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let is_image = path
                .extension()
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_string_lossy().to_lowercase().as_str()))
                .unwrap_or(false);
            if let (true, Some(name)) = (is_image, path.file_name()) {
                images.push(name.to_string_lossy().to_string());
            }
        }
        images.sort();

        Ok(images)
    }

    /// Get the base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

/// Decoded RGBA8 image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Turns an asset name into pixels; runs on the loader thread
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, name: &str) -> Result<DecodedImage, AssetError>;
}

/// Decodes PNG/JPEG files from disk with the `image` crate
#[derive(Debug, Clone)]
pub struct FileDecoder {
    loader: AssetLoader,
}

impl FileDecoder {
    pub fn new(loader: AssetLoader) -> Self {
        Self { loader }
    }
}

impl ImageDecoder for FileDecoder {
    fn decode(&self, name: &str) -> Result<DecodedImage, AssetError> {
        let bytes = self.loader.load_bytes(name)?;
        let rgba = image::load_from_memory(&bytes)
            .map_err(|e| AssetError::Decode(format!("{}: {}", name, e)))?
            .to_rgba8();
        let (width, height) = rgba.dimensions();

        Ok(DecodedImage {
            width,
            height,
            pixels: rgba.into_raw(),
        })
    }
}

/// The single background thread that services the load queue
pub(crate) struct LoaderThread {
    shared: Arc<CacheShared>,
    handle: Option<JoinHandle<()>>,
}

impl LoaderThread {
    pub(crate) fn spawn(
        shared: Arc<CacheShared>,
        decoder: Box<dyn ImageDecoder>,
    ) -> Result<Self, AssetError> {
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("asset-loader".to_string())
            .spawn(move || run(&worker, decoder.as_ref()))?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit
    ///
    /// Requests still in the queue are left unprocessed.
    pub(crate) fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shared.queue.shutdown();
            if handle.join().is_err() {
                error!("Asset loader thread panicked");
            }
        }
    }
}

impl Drop for LoaderThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &CacheShared, decoder: &dyn ImageDecoder) {
    info!("Asset loader started");

    while shared.queue.wait_for_work() {
        // Shutdown leaves the backlog queued
        while !shared.queue.is_shut_down() {
            let Some(request) = shared.queue.dequeue() else {
                break;
            };
            load(shared, decoder, request);
        }
    }

    let abandoned = shared.queue.len();
    if abandoned > 0 {
        info!("Asset loader stopped with {} requests still queued", abandoned);
    } else {
        info!("Asset loader stopped");
    }
}

fn load(shared: &CacheShared, decoder: &dyn ImageDecoder, request: LoadRequest) {
    if !shared.is_live(&request) {
        debug!("Skipping '{}': released before loading", request.name);
        return;
    }

    let outcome = match decoder.decode(&request.name) {
        Ok(image) => {
            match shared
                .textures
                .request_texture(image.width, image.height, &image.pixels)
            {
                Ok(texture) => LoadOutcome::Loaded {
                    width: image.width,
                    height: image.height,
                    texture,
                },
                Err(e) => {
                    warn!("No texture for '{}': {}", request.name, e);
                    LoadOutcome::Failed
                }
            }
        }
        Err(e) => {
            warn!("Failed to load '{}': {}", request.name, e);
            LoadOutcome::Failed
        }
    };

    shared.publish(&request, outcome);
}
