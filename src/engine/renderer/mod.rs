// Rendering system using wgpu

mod batch;
mod gpu;
mod sprite;
pub mod texture;
mod vertex;
mod viewport;

pub use batch::{DrawCmd, DrawList, SpriteRect};
pub use texture::{TextureManager, DEFAULT_TEXTURE_CAPACITY};
pub use viewport::{VIRTUAL_HEIGHT, VIRTUAL_WIDTH};

// Re-export for future use
#[allow(unused_imports)]
pub use batch::{BatchRange, SpriteBatch, MAX_DRAW_CMDS};
#[allow(unused_imports)]
pub use gpu::{GpuTexture, WgpuTextures};
#[allow(unused_imports)]
pub use sprite::SpriteRenderer;
#[allow(unused_imports)]
pub use texture::{
    GpuTextureId, ReadyTexture, TextureBackend, TextureError, TextureRef, TextureStats,
    TextureStatus,
};
#[allow(unused_imports)]
pub use vertex::Vertex;
#[allow(unused_imports)]
pub use viewport::{Viewport, ViewportUniform};

use anyhow::Result;
use log::{info, warn};
use std::sync::Arc;
use winit::window::Window;

/// Main renderer responsible for initializing wgpu and coordinating rendering
///
/// Owns the graphics context, so it is the only place the texture manager's
/// pending lists are drained.
pub struct Renderer {
    surface: wgpu::Surface<'static>,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    config: wgpu::SurfaceConfiguration,
    sprite_renderer: SpriteRenderer,
    gpu_textures: WgpuTextures,
    textures: Arc<TextureManager>,
    batch: SpriteBatch,
    viewport: Viewport,
}

impl Renderer {
    /// Create a new renderer for the given window
    pub async fn new(window: Arc<Window>, textures: Arc<TextureManager>) -> Result<Self> {
        let size = window.inner_size();

        // Create wgpu instance
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        // Create surface
        let surface = instance.create_surface(window.clone())?;

        // Request adapter
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| anyhow::anyhow!("Failed to find suitable GPU adapter"))?;

        info!("Using GPU: {}", adapter.get_info().name);

        // Request device and queue
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Main Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await?;
        let device = Arc::new(device);
        let queue = Arc::new(queue);

        // Configure surface
        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or_else(|| anyhow::anyhow!("Surface reports no supported formats"))?;

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: surface_caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };

        surface.configure(&device, &config);

        let viewport = Viewport::new(config.width, config.height);
        let gpu_textures = WgpuTextures::new(Arc::clone(&device), Arc::clone(&queue));
        let sprite_renderer = SpriteRenderer::new(
            &device,
            surface_format,
            gpu_textures.bind_group_layout(),
            &viewport,
        );

        info!(
            "Renderer initialized with {}x{} resolution ({}x{} virtual)",
            size.width, size.height, VIRTUAL_WIDTH, VIRTUAL_HEIGHT
        );

        Ok(Self {
            surface,
            device,
            queue,
            config,
            sprite_renderer,
            gpu_textures,
            textures,
            batch: SpriteBatch::new(),
            viewport,
        })
    }

    /// Resize the renderer
    pub fn resize(&mut self, new_size: winit::dpi::PhysicalSize<u32>) {
        if new_size.width > 0 && new_size.height > 0 {
            self.config.width = new_size.width;
            self.config.height = new_size.height;
            self.surface.configure(&self.device, &self.config);
            self.viewport.resize(new_size.width, new_size.height);
            self.sprite_renderer
                .update_viewport(&self.queue, &self.viewport);
            info!("Renderer resized to {}x{}", new_size.width, new_size.height);
        }
    }

    /// Render a frame
    ///
    /// Creates textures requested since the last frame, draws every command
    /// whose texture is ready, then destroys textures whose release was
    /// requested. Destruction runs even when the frame could not be drawn.
    pub fn render(&mut self, draws: &DrawList) -> Result<()> {
        self.textures.drain_creates(&mut self.gpu_textures);

        let result = self.draw(draws);

        self.textures.drain_destroys(&mut self.gpu_textures);
        result
    }

    fn draw(&mut self, draws: &DrawList) -> Result<()> {
        self.batch.build(draws, &self.textures);
        self.sprite_renderer
            .prepare(&self.device, &self.queue, &self.batch);

        let output = match self.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                warn!("Surface lost, reconfiguring");
                self.surface.configure(&self.device, &self.config);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Render Encoder"),
            });

        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Main Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            // Letterbox: only the virtual screen region is drawn into
            let vp = &self.viewport;
            render_pass.set_viewport(
                vp.x as f32,
                vp.y as f32,
                vp.width as f32,
                vp.height as f32,
                0.0,
                1.0,
            );
            render_pass.set_scissor_rect(vp.x, vp.y, vp.width, vp.height);

            self.sprite_renderer
                .render(&mut render_pass, &self.batch, &self.gpu_textures);
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();

        Ok(())
    }

    /// Destroy every GPU texture, pending or not
    ///
    /// Call after the last frame, once nothing will request textures anymore.
    pub fn shutdown(&mut self) {
        self.textures.free_all(&mut self.gpu_textures);
        info!("Renderer released all textures");
    }

    /// Get a reference to the texture manager shared with the asset cache
    pub fn textures(&self) -> &Arc<TextureManager> {
        &self.textures
    }

    /// Textures currently alive on the GPU
    pub fn gpu_textures(&self) -> &WgpuTextures {
        &self.gpu_textures
    }

    /// Sprites dropped from the last frame because their texture was not ready
    pub fn skipped_sprites(&self) -> usize {
        self.batch.skipped()
    }
}
