// Letterboxed virtual-resolution viewport

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2};

/// Width sprites are laid out in, independent of the window
pub const VIRTUAL_WIDTH: u32 = 1920 >> 2;

/// Height sprites are laid out in, independent of the window
pub const VIRTUAL_HEIGHT: u32 = 1080 >> 2;

/// Region of the window the virtual screen is drawn into
///
/// Keeps the virtual aspect ratio and centers it, leaving black bars on the
/// remaining sides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    /// Fit the virtual screen into a window
    pub fn new(window_width: u32, window_height: u32) -> Self {
        let aspect = VIRTUAL_WIDTH as f32 / VIRTUAL_HEIGHT as f32;

        let mut width = window_width;
        let mut height = (width as f32 / aspect + 0.5) as u32;
        if height > window_height {
            height = window_height;
            width = (height as f32 * aspect + 0.5) as u32;
        }
        // Rounding can overshoot by a pixel on odd sizes
        width = width.min(window_width).max(1);
        height = height.min(window_height).max(1);

        Self {
            x: (window_width.saturating_sub(width)) / 2,
            y: (window_height.saturating_sub(height)) / 2,
            width,
            height,
        }
    }

    /// Recompute for a new window size
    pub fn resize(&mut self, window_width: u32, window_height: u32) {
        *self = Self::new(window_width, window_height);
    }

    /// Window pixels per virtual pixel
    pub fn scale(&self) -> Vec2 {
        Vec2::new(
            self.width as f32 / VIRTUAL_WIDTH as f32,
            self.height as f32 / VIRTUAL_HEIGHT as f32,
        )
    }

    /// Projection from virtual screen space (origin top-left, y down) to clip space
    pub fn projection(&self) -> Mat4 {
        Mat4::orthographic_rh(
            0.0,
            VIRTUAL_WIDTH as f32,
            VIRTUAL_HEIGHT as f32,
            0.0,
            -1.0,
            1.0,
        )
    }

    /// Convert a window position (e.g. the cursor) to virtual screen space
    pub fn screen_to_viewport(&self, screen: Vec2) -> Vec2 {
        let offset = Vec2::new(self.x as f32, self.y as f32);
        (screen - offset) / self.scale()
    }

    /// Whether a window position falls inside the drawn region
    pub fn contains_screen(&self, screen: Vec2) -> bool {
        screen.x >= self.x as f32
            && screen.y >= self.y as f32
            && screen.x < (self.x + self.width) as f32
            && screen.y < (self.y + self.height) as f32
    }
}

/// Projection uniform for GPU
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ViewportUniform {
    pub projection: [[f32; 4]; 4],
}

impl ViewportUniform {
    pub fn new(viewport: &Viewport) -> Self {
        Self {
            projection: viewport.projection().to_cols_array_2d(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec4;

    #[test]
    fn test_exact_fit() {
        let viewport = Viewport::new(1920, 1080);
        assert_eq!((viewport.x, viewport.y), (0, 0));
        assert_eq!((viewport.width, viewport.height), (1920, 1080));
        assert_relative_eq!(viewport.scale().x, 4.0);
        assert_relative_eq!(viewport.scale().y, 4.0);
    }

    #[test]
    fn test_pillarbox_on_wide_window() {
        let viewport = Viewport::new(2000, 540);
        assert_eq!((viewport.width, viewport.height), (960, 540));
        assert_eq!((viewport.x, viewport.y), (520, 0));
    }

    #[test]
    fn test_letterbox_on_tall_window() {
        let viewport = Viewport::new(960, 1000);
        assert_eq!((viewport.width, viewport.height), (960, 540));
        assert_eq!((viewport.x, viewport.y), (0, 230));
    }

    #[test]
    fn test_screen_to_viewport() {
        let viewport = Viewport::new(960, 1000);
        let p = viewport.screen_to_viewport(Vec2::new(480.0, 230.0 + 270.0));
        assert_relative_eq!(p.x, 240.0);
        assert_relative_eq!(p.y, 135.0);

        assert!(viewport.contains_screen(Vec2::new(10.0, 300.0)));
        assert!(!viewport.contains_screen(Vec2::new(10.0, 100.0)));
    }

    #[test]
    fn test_projection_maps_corners() {
        let projection = Viewport::new(1280, 720).projection();

        let top_left = projection * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(top_left.x, -1.0);
        assert_relative_eq!(top_left.y, 1.0);

        let bottom_right =
            projection * Vec4::new(VIRTUAL_WIDTH as f32, VIRTUAL_HEIGHT as f32, 0.0, 1.0);
        assert_relative_eq!(bottom_right.x, 1.0);
        assert_relative_eq!(bottom_right.y, -1.0);
    }

    #[test]
    fn test_degenerate_window() {
        let viewport = Viewport::new(0, 0);
        assert_eq!((viewport.width, viewport.height), (1, 1));
    }
}
