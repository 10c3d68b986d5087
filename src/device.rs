use anyhow::Result;
use glam::{Mat4, Vec3};
use image::RgbaImage;
use smallvec::SmallVec;

use crate::camera3d::Viewport;
use crate::light::LightId;
use crate::mesh::MeshBuffer;
use crate::scene::ShaderId;

mod headless;
#[cfg(feature = "gpu")]
mod wgpu_device;

pub use headless::{DeviceCommand, HeadlessDevice};
#[cfg(feature = "gpu")]
pub use wgpu_device::WgpuDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u32);

/// Graphics backend identity. Only used to pick matrix conventions and cube-face order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    OpenGl,
    Direct3D11,
    Wgpu,
}

impl Backend {
    /// Texture row 0 is the top of the image.
    pub fn texture_origin_top_left(self) -> bool {
        !matches!(self, Backend::OpenGl)
    }

    /// Clip-space depth runs 0..1 instead of -1..1.
    pub fn depth_zero_to_one(self) -> bool {
        !matches!(self, Backend::OpenGl)
    }

    /// Full-screen blits sample with V flipped.
    pub fn blit_flips_v(self) -> bool {
        !self.texture_origin_top_left()
    }

    pub fn orthographic(self, left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32) -> Mat4 {
        if self.depth_zero_to_one() {
            Mat4::orthographic_rh(left, right, bottom, top, near, far)
        } else {
            Mat4::orthographic_rh_gl(left, right, bottom, top, near, far)
        }
    }

    pub fn perspective(self, fov_y_radians: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
        if self.depth_zero_to_one() {
            Mat4::perspective_rh(fov_y_radians, aspect.max(0.0001), near, far)
        } else {
            Mat4::perspective_rh_gl(fov_y_radians, aspect.max(0.0001), near, far)
        }
    }

    /// Remaps clip space into texture-sampling space.
    pub fn shadow_bias_matrix(self) -> Mat4 {
        let y_scale = if self.texture_origin_top_left() { -0.5 } else { 0.5 };
        let (z_scale, z_offset) = if self.depth_zero_to_one() { (1.0, 0.0) } else { (0.5, 0.5) };
        Mat4::from_translation(Vec3::new(0.5, 0.5, z_offset)) * Mat4::from_scale(Vec3::new(0.5, y_scale, z_scale))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetFormat {
    Rgba8,
    R32Float,
    Depth32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetDimension {
    D2,
    Array(u32),
    Cube,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTargetDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub dimension: TargetDimension,
    pub format: TargetFormat,
}

impl RenderTargetDesc {
    pub fn new_2d(label: &'static str, size: u32, format: TargetFormat) -> Self {
        Self { label, width: size, height: size, dimension: TargetDimension::D2, format }
    }

    pub fn new_array(label: &'static str, size: u32, layers: u32, format: TargetFormat) -> Self {
        Self { label, width: size, height: size, dimension: TargetDimension::Array(layers), format }
    }

    pub fn new_cube(label: &'static str, size: u32, format: TargetFormat) -> Self {
        Self { label, width: size, height: size, dimension: TargetDimension::Cube, format }
    }

    pub fn layer_count(&self) -> u32 {
        match self.dimension {
            TargetDimension::D2 => 1,
            TargetDimension::Array(layers) => layers.max(1),
            TargetDimension::Cube => 6,
        }
    }
}

/// Cube-map face in +X, -X, +Y, -Y, +Z, -Z order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CubeFace {
    PositiveX,
    NegativeX,
    PositiveY,
    NegativeY,
    PositiveZ,
    NegativeZ,
}

impl CubeFace {
    pub const ALL: [CubeFace; 6] = [
        CubeFace::PositiveX,
        CubeFace::NegativeX,
        CubeFace::PositiveY,
        CubeFace::NegativeY,
        CubeFace::PositiveZ,
        CubeFace::NegativeZ,
    ];

    pub fn index(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderTargetBinding {
    #[default]
    Screen,
    Texture(TextureHandle),
    Layer { texture: TextureHandle, layer: u32 },
    CubeFace { texture: TextureHandle, face: CubeFace },
}

impl RenderTargetBinding {
    pub fn texture(self) -> Option<TextureHandle> {
        match self {
            RenderTargetBinding::Screen => None,
            RenderTargetBinding::Texture(texture)
            | RenderTargetBinding::Layer { texture, .. }
            | RenderTargetBinding::CubeFace { texture, .. } => Some(texture),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClearValue {
    pub color: Option<[f32; 4]>,
    pub depth: Option<f32>,
}

impl ClearValue {
    pub const NONE: ClearValue = ClearValue { color: None, depth: None };
    pub const DEPTH_WHITE: ClearValue = ClearValue { color: Some([1.0; 4]), depth: Some(1.0) };
    pub const BLACK: ClearValue = ClearValue { color: Some([0.0, 0.0, 0.0, 0.0]), depth: Some(1.0) };
    pub const DEPTH: ClearValue = ClearValue { color: None, depth: Some(1.0) };

    pub fn is_none(&self) -> bool {
        self.color.is_none() && self.depth.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CullMode {
    #[default]
    Back,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub cull: CullMode,
}

impl Default for DrawState {
    fn default() -> Self {
        Self { depth_test: true, depth_write: true, cull: CullMode::Back }
    }
}

impl DrawState {
    /// Lightmap accumulation: every texel of the unwrapped triangle must be written.
    pub const UNWRAP: DrawState = DrawState { depth_test: false, depth_write: false, cull: CullMode::None };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureBinding {
    pub slot: u32,
    pub texture: TextureHandle,
}

#[derive(Debug, Clone, Copy)]
pub enum DrawGeometry<'a> {
    Mesh(&'a MeshBuffer),
    FullscreenQuad { flip_v: bool },
}

#[derive(Debug, Clone)]
pub struct DrawCall<'a> {
    pub shader: ShaderId,
    pub geometry: DrawGeometry<'a>,
    pub world: Mat4,
    pub textures: SmallVec<[TextureBinding; 4]>,
    pub state: DrawState,
    /// Light whose parameters the shader reads, if any.
    pub light: Option<LightId>,
}

impl<'a> DrawCall<'a> {
    pub fn mesh(shader: ShaderId, mesh: &'a MeshBuffer, world: Mat4) -> Self {
        Self {
            shader,
            geometry: DrawGeometry::Mesh(mesh),
            world,
            textures: SmallVec::new(),
            state: DrawState::default(),
            light: None,
        }
    }

    pub fn fullscreen(shader: ShaderId, flip_v: bool) -> Self {
        Self {
            shader,
            geometry: DrawGeometry::FullscreenQuad { flip_v },
            world: Mat4::IDENTITY,
            textures: SmallVec::new(),
            state: DrawState { depth_test: false, depth_write: false, cull: CullMode::None },
            light: None,
        }
    }

    pub fn with_texture(mut self, slot: u32, texture: TextureHandle) -> Self {
        self.textures.push(TextureBinding { slot, texture });
        self
    }

    pub fn with_state(mut self, state: DrawState) -> Self {
        self.state = state;
        self
    }

    pub fn with_light(mut self, light: LightId) -> Self {
        self.light = Some(light);
        self
    }
}

/// Low-level device the pipeline drives. Allocation failures surface as `Err` so callers can skip
/// the affected unit of work.
pub trait GraphicsDevice {
    fn backend(&self) -> Backend;
    fn create_render_target(&mut self, desc: &RenderTargetDesc) -> Result<TextureHandle>;
    fn release_texture(&mut self, texture: TextureHandle);
    fn bind_target(&mut self, binding: RenderTargetBinding, clear: ClearValue) -> Result<()>;
    fn current_target(&self) -> RenderTargetBinding;
    fn set_viewport(&mut self, viewport: Viewport);
    fn set_transforms(&mut self, projection: Mat4, view: Mat4);
    fn draw(&mut self, call: &DrawCall<'_>) -> Result<()>;
    fn read_target(&mut self, texture: TextureHandle) -> Result<RgbaImage>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn gl_bias_maps_clip_cube_to_unit_cube() {
        let bias = Backend::OpenGl.shadow_bias_matrix();
        let lo = bias * Vec4::new(-1.0, -1.0, -1.0, 1.0);
        let hi = bias * Vec4::new(1.0, 1.0, 1.0, 1.0);
        assert!((lo.truncate() - Vec3::ZERO).length() < 1e-6);
        assert!((hi.truncate() - Vec3::ONE).length() < 1e-6);
    }

    #[test]
    fn top_left_backends_flip_v_and_keep_depth() {
        let bias = Backend::Direct3D11.shadow_bias_matrix();
        let top = bias * Vec4::new(0.0, 1.0, 0.25, 1.0);
        assert!(top.y.abs() < 1e-6, "clip +Y lands on texture row 0");
        assert!((top.z - 0.25).abs() < 1e-6);
        assert!(!Backend::Wgpu.blit_flips_v());
        assert!(Backend::OpenGl.blit_flips_v());
    }
}
