// Per-frame draw list and texture-batched sprite geometry

use super::texture::{GpuTextureId, TextureManager, TextureRef};
use super::vertex::Vertex;
use glam::Vec2;
use log::warn;

/// Maximum sprites drawn in one frame
pub const MAX_DRAW_CMDS: usize = 1024;

/// Two triangles per sprite, no index buffer
pub const VERTICES_PER_SPRITE: u32 = 6;

/// Source rectangle inside a texture, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SpriteRect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl SpriteRect {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// The whole of a `width` x `height` texture
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0.0, 0.0, width as f32, height as f32)
    }

    pub fn size(&self) -> Vec2 {
        Vec2::new(self.w, self.h)
    }
}

/// One sprite to draw this frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawCmd {
    pub texture: TextureRef,
    pub src: SpriteRect,
    /// Center in virtual screen space
    pub position: Vec2,
    /// Rotation in radians
    pub rotation: f32,
}

impl DrawCmd {
    pub fn new(texture: TextureRef, src: SpriteRect, position: Vec2) -> Self {
        Self {
            texture,
            src,
            position,
            rotation: 0.0,
        }
    }

    pub fn with_rotation(mut self, rotation: f32) -> Self {
        self.rotation = rotation;
        self
    }
}

/// Bounded list of draw commands, filled by the game and consumed by the renderer
#[derive(Debug)]
pub struct DrawList {
    cmds: Vec<DrawCmd>,
    capacity: usize,
    overflowed: bool,
}

impl DrawList {
    pub fn new(capacity: usize) -> Self {
        Self {
            cmds: Vec::with_capacity(capacity),
            capacity,
            overflowed: false,
        }
    }

    /// Append a command; `false` once the list is full
    pub fn push(&mut self, cmd: DrawCmd) -> bool {
        if self.cmds.len() >= self.capacity {
            if !self.overflowed {
                warn!("Draw list full ({} commands), dropping sprites", self.capacity);
                self.overflowed = true;
            }
            return false;
        }
        self.cmds.push(cmd);
        true
    }

    pub fn clear(&mut self) {
        self.cmds.clear();
        self.overflowed = false;
    }

    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DrawCmd> {
        self.cmds.iter()
    }
}

impl Default for DrawList {
    fn default() -> Self {
        Self::new(MAX_DRAW_CMDS)
    }
}

/// Run of vertices sharing one texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRange {
    pub texture: GpuTextureId,
    pub offset: u32,
    pub count: u32,
}

/// Vertices and texture ranges for one frame
#[derive(Debug, Default)]
pub struct SpriteBatch {
    vertices: Vec<Vertex>,
    ranges: Vec<BatchRange>,
    skipped: usize,
}

impl SpriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a draw list
    ///
    /// Commands whose texture has no GPU id yet (still pending, failed or
    /// released) are skipped. Consecutive commands on the same texture share
    /// one range.
    pub fn build(&mut self, draws: &DrawList, textures: &TextureManager) {
        self.vertices.clear();
        self.ranges.clear();
        self.skipped = 0;

        for cmd in draws.iter() {
            let Some(texture) = textures.ready(cmd.texture) else {
                self.skipped += 1;
                continue;
            };

            let offset = self.vertices.len() as u32;
            let inv_size = Vec2::new(1.0 / texture.width as f32, 1.0 / texture.height as f32);
            let uv_min = Vec2::new(cmd.src.x, cmd.src.y) * inv_size;
            let uv_max = Vec2::new(cmd.src.x + cmd.src.w, cmd.src.y + cmd.src.h) * inv_size;

            let size = cmd.src.size();
            let rotation = Vec2::from_angle(cmd.rotation);
            let corner = |x: f32, y: f32| cmd.position + rotation.rotate(Vec2::new(x, y) * size);

            let top_left = Vertex::new(corner(-0.5, -0.5), uv_min);
            let top_right = Vertex::new(corner(0.5, -0.5), Vec2::new(uv_max.x, uv_min.y));
            let bottom_right = Vertex::new(corner(0.5, 0.5), uv_max);
            let bottom_left = Vertex::new(corner(-0.5, 0.5), Vec2::new(uv_min.x, uv_max.y));

            self.vertices.extend_from_slice(&[
                top_left,
                top_right,
                bottom_right,
                top_left,
                bottom_right,
                bottom_left,
            ]);

            match self.ranges.last_mut() {
                Some(range) if range.texture == texture.id => range.count += VERTICES_PER_SPRITE,
                _ => self.ranges.push(BatchRange {
                    texture: texture.id,
                    offset,
                    count: VERTICES_PER_SPRITE,
                }),
            }
        }
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn ranges(&self) -> &[BatchRange] {
        &self.ranges
    }

    /// Commands dropped by the last build because their texture was not ready
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::super::texture::testing::RecordingBackend;
    use super::*;
    use approx::assert_relative_eq;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    const PIXEL: [u8; 4] = [0, 0, 0, 255];

    fn ready_texture(
        textures: &TextureManager,
        backend: &mut RecordingBackend,
        width: u32,
        height: u32,
    ) -> TextureRef {
        let pixels = vec![0u8; (width * height * 4) as usize];
        let tex = textures.request_texture(width, height, &pixels).unwrap();
        textures.drain_creates(backend);
        tex
    }

    #[test]
    fn test_draw_list_bounded() {
        let textures = TextureManager::new(1);
        let tex = textures.request_texture(1, 1, &PIXEL).unwrap();
        let cmd = DrawCmd::new(tex, SpriteRect::full(1, 1), Vec2::ZERO);

        let mut draws = DrawList::new(2);
        assert!(draws.push(cmd));
        assert!(draws.push(cmd));
        assert!(!draws.push(cmd));
        assert_eq!(draws.len(), 2);

        draws.clear();
        assert!(draws.is_empty());
        assert!(draws.push(cmd));
    }

    #[test]
    fn test_consecutive_commands_merge() {
        let textures = TextureManager::new(4);
        let mut backend = RecordingBackend::default();
        let a = ready_texture(&textures, &mut backend, 1, 1);
        let b = ready_texture(&textures, &mut backend, 1, 1);

        let mut draws = DrawList::default();
        for tex in [a, a, b, a] {
            draws.push(DrawCmd::new(tex, SpriteRect::full(1, 1), Vec2::ZERO));
        }

        let mut batch = SpriteBatch::new();
        batch.build(&draws, &textures);

        let a_id = textures.gpu_handle(a).unwrap();
        let b_id = textures.gpu_handle(b).unwrap();
        assert_eq!(
            batch.ranges(),
            &[
                BatchRange { texture: a_id, offset: 0, count: 12 },
                BatchRange { texture: b_id, offset: 12, count: 6 },
                BatchRange { texture: a_id, offset: 18, count: 6 },
            ]
        );
        assert_eq!(batch.vertices().len(), 24);
        assert_eq!(batch.skipped(), 0);
    }

    #[test]
    fn test_unready_textures_are_skipped() {
        let textures = TextureManager::new(4);
        let mut backend = RecordingBackend::default();
        let ready = ready_texture(&textures, &mut backend, 1, 1);
        let pending = textures.request_texture(1, 1, &PIXEL).unwrap();

        let mut draws = DrawList::default();
        draws.push(DrawCmd::new(ready, SpriteRect::full(1, 1), Vec2::ZERO));
        draws.push(DrawCmd::new(pending, SpriteRect::full(1, 1), Vec2::ZERO));
        draws.push(DrawCmd::new(ready, SpriteRect::full(1, 1), Vec2::ZERO));

        let mut batch = SpriteBatch::new();
        batch.build(&draws, &textures);

        assert_eq!(batch.skipped(), 1);
        // The skipped command does not split the run
        assert_eq!(batch.ranges().len(), 1);
        assert_eq!(batch.ranges()[0].count, 12);
    }

    #[test]
    fn test_quad_geometry_and_uvs() {
        let textures = TextureManager::new(4);
        let mut backend = RecordingBackend::default();
        let sheet = ready_texture(&textures, &mut backend, 64, 32);

        let mut draws = DrawList::default();
        draws.push(DrawCmd::new(
            sheet,
            SpriteRect::new(16.0, 0.0, 16.0, 16.0),
            Vec2::new(100.0, 50.0),
        ));

        let mut batch = SpriteBatch::new();
        batch.build(&draws, &textures);
        let v = batch.vertices();

        assert_eq!(v[0].position, [92.0, 42.0]);
        assert_eq!(v[2].position, [108.0, 58.0]);
        assert_eq!(v[5].position, [92.0, 58.0]);
        assert_eq!(v[0], v[3]);
        assert_eq!(v[2], v[4]);

        assert_relative_eq!(v[0].tex_coords[0], 0.25);
        assert_relative_eq!(v[0].tex_coords[1], 0.0);
        assert_relative_eq!(v[2].tex_coords[0], 0.5);
        assert_relative_eq!(v[2].tex_coords[1], 0.5);
    }

    #[test]
    fn test_rotation_about_center() {
        let textures = TextureManager::new(4);
        let mut backend = RecordingBackend::default();
        let tex = ready_texture(&textures, &mut backend, 2, 2);

        let mut draws = DrawList::default();
        draws.push(
            DrawCmd::new(tex, SpriteRect::full(2, 2), Vec2::new(10.0, 10.0))
                .with_rotation(std::f32::consts::FRAC_PI_2),
        );

        let mut batch = SpriteBatch::new();
        batch.build(&draws, &textures);

        // (-1, -1) rotated a quarter turn lands on (1, -1)
        let top_left = batch.vertices()[0].position;
        assert_relative_eq!(top_left[0], 11.0, epsilon = 1e-5);
        assert_relative_eq!(top_left[1], 9.0, epsilon = 1e-5);
    }

    #[test]
    fn test_frames_never_draw_destroyed_textures() {
        const WORKERS: usize = 4;
        const PER_WORKER: usize = 50;

        let textures = Arc::new(TextureManager::new(WORKERS * PER_WORKER));
        let visible: Arc<Mutex<Vec<TextureRef>>> = Arc::new(Mutex::new(Vec::new()));
        let finished = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..WORKERS)
            .map(|_| {
                let textures = Arc::clone(&textures);
                let visible = Arc::clone(&visible);
                let finished = Arc::clone(&finished);
                thread::spawn(move || {
                    for _ in 0..PER_WORKER {
                        let tex = textures.request_texture(1, 1, &PIXEL).unwrap();
                        visible.lock().push(tex);
                        thread::yield_now();

                        visible.lock().retain(|t| *t != tex);
                        textures.request_destroy(tex).unwrap();
                    }
                    finished.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        let mut backend = RecordingBackend::default();
        let mut draws = DrawList::new(WORKERS * PER_WORKER);
        let mut batch = SpriteBatch::new();

        loop {
            let last_frame = finished.load(Ordering::SeqCst) == WORKERS;

            textures.drain_creates(&mut backend);

            draws.clear();
            for tex in visible.lock().iter() {
                draws.push(DrawCmd::new(*tex, SpriteRect::full(1, 1), Vec2::ZERO));
            }
            // A worker may request destruction right here; the record stays
            // drawable until this frame's drain_destroys
            batch.build(&draws, &textures);
            for range in batch.ranges() {
                assert!(
                    backend.live.contains(&range.texture),
                    "drew destroyed texture {:?}",
                    range.texture
                );
            }

            textures.drain_destroys(&mut backend);

            if last_frame {
                break;
            }
            thread::yield_now();
        }

        for worker in workers {
            worker.join().unwrap();
        }

        assert!(backend.live.is_empty(), "every texture was destroyed");
        assert_eq!(textures.stats().live, 0);
    }
}
