use anyhow::Result;
use glam::Vec2;
use log::{info, warn};
use std::sync::Arc;
use winit::{
    event::{Event, WindowEvent},
    event_loop::EventLoop,
    window::WindowBuilder,
};

mod core;
mod engine;

use engine::assets::{AssetCache, AssetConfig, AssetLoader, AssetState, ImageHandle};
use engine::renderer::{
    DrawCmd, DrawList, Renderer, SpriteRect, TextureManager, DEFAULT_TEXTURE_CAPACITY,
    VIRTUAL_HEIGHT, VIRTUAL_WIDTH,
};

/// Sprites per row in the demo grid
const GRID_COLUMNS: usize = 8;

fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("Starting Rusted Sprites...");

    // Image names from the command line, or every image in the working directory
    let config = AssetConfig::default();
    let mut names: Vec<String> = std::env::args().skip(1).collect();
    if names.is_empty() {
        names = AssetLoader::new(&config.asset_root).list_images()?;
    }
    if names.is_empty() {
        warn!("No images given and none found in {}", config.asset_root.display());
    }

    // Create event loop and window
    let event_loop = EventLoop::new()?;
    let window = Arc::new(
        WindowBuilder::new()
            .with_title("Rusted Sprites")
            .with_inner_size(winit::dpi::LogicalSize::new(1280, 720))
            .with_resizable(true)
            .build(&event_loop)?,
    );

    info!("Window created successfully");

    let textures = Arc::new(TextureManager::new(DEFAULT_TEXTURE_CAPACITY));
    let mut renderer = pollster::block_on(Renderer::new(window.clone(), Arc::clone(&textures)))?;
    let mut cache = Some(AssetCache::new(config, textures)?);

    // Loading starts here; drawing picks images up as they become ready
    let mut handles: Vec<ImageHandle> = Vec::with_capacity(names.len());
    if let Some(cache) = &cache {
        for name in &names {
            match cache.get_image(name) {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!("Skipping '{}': {}", name, e),
            }
        }
    }

    let mut draws = DrawList::default();
    let mut reported_loaded = false;

    // Main event loop
    event_loop
        .run(move |event, elwt| match event {
            Event::WindowEvent {
                event: WindowEvent::CloseRequested,
                ..
            } => {
                info!("Close requested, shutting down...");
                // Stop the loader and queue its textures for release before
                // the renderer frees whatever is left
                drop(cache.take());
                renderer.shutdown();
                elwt.exit();
            }
            Event::WindowEvent {
                event: WindowEvent::Resized(physical_size),
                ..
            } => {
                renderer.resize(physical_size);
            }
            Event::WindowEvent {
                event: WindowEvent::RedrawRequested,
                ..
            } => {
                let Some(cache) = &cache else {
                    return;
                };

                draws.clear();
                let mut loaded = 0;
                for (i, handle) in handles.iter().enumerate() {
                    let Some(image) = cache.image(*handle) else {
                        continue;
                    };
                    if image.state.is_terminal() {
                        loaded += 1;
                    }
                    if image.state != AssetState::Loaded {
                        continue;
                    }
                    if let Some(texture) = image.texture {
                        draws.push(DrawCmd::new(
                            texture,
                            SpriteRect::full(image.width, image.height),
                            grid_position(i, handles.len()),
                        ));
                    }
                }

                if let Err(e) = renderer.render(&draws) {
                    warn!("Frame failed: {}", e);
                }

                if !reported_loaded && loaded == handles.len() {
                    let stats = renderer.textures().stats();
                    info!(
                        "All {} images finished loading: {} textures on the GPU, {} pending, {} sprites skipped",
                        loaded,
                        renderer.gpu_textures().texture_count(),
                        stats.pending_create,
                        renderer.skipped_sprites()
                    );
                    reported_loaded = true;
                }
            }
            Event::AboutToWait => {
                // Request redraw on next frame
                window.request_redraw();
            }
            _ => {}
        })
        .map_err(|e| anyhow::anyhow!("Event loop error: {}", e))?;

    Ok(())
}

/// Center of grid cell `index` in virtual screen space
fn grid_position(index: usize, count: usize) -> Vec2 {
    let columns = count.clamp(1, GRID_COLUMNS);
    let rows = count.div_ceil(columns).max(1);
    let cell = Vec2::new(
        VIRTUAL_WIDTH as f32 / columns as f32,
        VIRTUAL_HEIGHT as f32 / rows as f32,
    );
    let column = (index % columns) as f32;
    let row = (index / columns) as f32;

    Vec2::new((column + 0.5) * cell.x, (row + 0.5) * cell.y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_single_image_is_centered() {
        let p = grid_position(0, 1);
        assert_relative_eq!(p.x, VIRTUAL_WIDTH as f32 / 2.0);
        assert_relative_eq!(p.y, VIRTUAL_HEIGHT as f32 / 2.0);
    }

    #[test]
    fn test_grid_wraps_rows() {
        let first = grid_position(0, 16);
        let ninth = grid_position(8, 16);
        assert_relative_eq!(first.x, ninth.x);
        assert!(ninth.y > first.y);
    }
}
