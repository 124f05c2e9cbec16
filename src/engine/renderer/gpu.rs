// wgpu implementation of the texture backend

use super::texture::{GpuTextureId, TextureBackend, TextureError};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

/// A texture living on the GPU, ready to be bound for drawing
pub struct GpuTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub sampler: wgpu::Sampler,
    pub bind_group: wgpu::BindGroup,
    pub width: u32,
    pub height: u32,
}

impl GpuTexture {
    /// Upload tightly packed RGBA8 pixels
    pub fn from_rgba(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        layout: &wgpu::BindGroupLayout,
        width: u32,
        height: u32,
        pixels: &[u8],
        label: Option<&str>,
    ) -> Self {
        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label,
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            pixels,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(height),
            },
            size,
        );

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        // Pixel art: no filtering
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label,
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
            ],
        });

        Self {
            texture,
            view,
            sampler,
            bind_group,
            width,
            height,
        }
    }
}

/// Owns every GPU texture created from the pending-create list
pub struct WgpuTextures {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    bind_group_layout: wgpu::BindGroupLayout,
    textures: HashMap<GpuTextureId, GpuTexture>,
    next_id: u32,
}

impl WgpuTextures {
    /// Create the backend and the bind group layout shared by all sprite textures
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Texture Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        Self {
            device,
            queue,
            bind_group_layout,
            textures: HashMap::new(),
            next_id: 0,
        }
    }

    /// Layout the sprite pipeline binds textures with
    pub fn bind_group_layout(&self) -> &wgpu::BindGroupLayout {
        &self.bind_group_layout
    }

    /// Look up a created texture
    pub fn get(&self, id: GpuTextureId) -> Option<&GpuTexture> {
        self.textures.get(&id)
    }

    /// Number of textures currently on the GPU
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }
}

impl TextureBackend for WgpuTextures {
    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<GpuTextureId, TextureError> {
        let limit = self.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > limit || height > limit {
            return Err(TextureError::Backend(format!(
                "unsupported texture size {}x{} (limit {})",
                width, height, limit
            )));
        }

        self.next_id = self.next_id.wrapping_add(1).max(1);
        let id = GpuTextureId::new(self.next_id)
            .ok_or_else(|| TextureError::Backend("texture id space exhausted".to_string()))?;

        let label = format!("Sprite Texture {}", id.get());
        let texture = GpuTexture::from_rgba(
            &self.device,
            &self.queue,
            &self.bind_group_layout,
            width,
            height,
            pixels,
            Some(&label),
        );
        self.textures.insert(id, texture);

        debug!("Uploaded {} ({}x{})", label, width, height);
        Ok(id)
    }

    fn destroy_texture(&mut self, id: GpuTextureId) {
        // Dropping defers the release until in-flight submissions finish
        if self.textures.remove(&id).is_some() {
            debug!("Released Sprite Texture {}", id.get());
        }
    }
}
