use anyhow::{anyhow, bail, Result};
use glam::Mat4;
use image::{Rgba, RgbaImage};
use smallvec::SmallVec;
use std::collections::BTreeMap;

use super::{
    Backend, ClearValue, DrawCall, DrawGeometry, GraphicsDevice, RenderTargetBinding, RenderTargetDesc,
    TargetFormat, TextureBinding, TextureHandle,
};
use crate::camera3d::Viewport;
use crate::light::LightId;
use crate::scene::ShaderId;

/// What the headless device saw, in submission order.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    Create { texture: TextureHandle, desc: RenderTargetDesc },
    Release { texture: TextureHandle },
    Bind { binding: RenderTargetBinding, clear: ClearValue },
    Draw {
        target: RenderTargetBinding,
        shader: ShaderId,
        triangles: usize,
        light: Option<LightId>,
        fullscreen: bool,
        textures: SmallVec<[TextureBinding; 4]>,
    },
}

#[derive(Debug, Clone)]
struct HeadlessTexture {
    desc: RenderTargetDesc,
    fill: [u8; 4],
}

/// CPU-only device that records commands and tracks render-target contents as a flat color.
/// Used by tests and the dry-run bake tool.
#[derive(Debug)]
pub struct HeadlessDevice {
    backend: Backend,
    textures: BTreeMap<TextureHandle, HeadlessTexture>,
    next_handle: u32,
    target_limit: Option<usize>,
    current: RenderTargetBinding,
    viewport: Viewport,
    projection: Mat4,
    view: Mat4,
    commands: Vec<DeviceCommand>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new(Backend::Wgpu)
    }
}

impl HeadlessDevice {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            textures: BTreeMap::new(),
            next_handle: 1,
            target_limit: None,
            current: RenderTargetBinding::Screen,
            viewport: Viewport::new(1.0, 1.0),
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            commands: Vec::new(),
        }
    }

    /// Caps the number of live render targets; further allocations fail.
    pub fn with_target_limit(mut self, limit: usize) -> Self {
        self.target_limit = Some(limit);
        self
    }

    pub fn set_target_limit(&mut self, limit: Option<usize>) {
        self.target_limit = limit;
    }

    pub fn commands(&self) -> &[DeviceCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<DeviceCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn texture_desc(&self, texture: TextureHandle) -> Option<&RenderTargetDesc> {
        self.textures.get(&texture).map(|tex| &tex.desc)
    }

    pub fn transforms(&self) -> (Mat4, Mat4) {
        (self.projection, self.view)
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Draw commands whose target lives in `texture`.
    pub fn draws_into(&self, texture: TextureHandle) -> usize {
        self.commands
            .iter()
            .filter(|cmd| matches!(cmd, DeviceCommand::Draw { target, .. } if target.texture() == Some(texture)))
            .count()
    }

    pub fn draws_with_shader(&self, shader: ShaderId) -> usize {
        self.commands
            .iter()
            .filter(|cmd| matches!(cmd, DeviceCommand::Draw { shader: s, .. } if *s == shader))
            .count()
    }

    /// Texture bound to `slot` by each draw with `shader`, in submission order.
    pub fn sampled_in_slot(&self, shader: ShaderId, slot: u32) -> Vec<Option<TextureHandle>> {
        self.commands
            .iter()
            .filter_map(|cmd| match cmd {
                DeviceCommand::Draw { shader: s, textures, .. } if *s == shader => {
                    Some(textures.iter().find(|binding| binding.slot == slot).map(|binding| binding.texture))
                }
                _ => None,
            })
            .collect()
    }
}

fn to_rgba8(color: [f32; 4]) -> [u8; 4] {
    color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
}

impl GraphicsDevice for HeadlessDevice {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn create_render_target(&mut self, desc: &RenderTargetDesc) -> Result<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            bail!("Render target '{}' has zero size", desc.label);
        }
        if let Some(limit) = self.target_limit {
            if self.textures.len() >= limit {
                bail!("Render target limit {limit} reached while creating '{}'", desc.label);
            }
        }
        let texture = TextureHandle(self.next_handle);
        self.next_handle += 1;
        self.textures.insert(texture, HeadlessTexture { desc: desc.clone(), fill: [0, 0, 0, 0] });
        self.commands.push(DeviceCommand::Create { texture, desc: desc.clone() });
        Ok(texture)
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        if self.textures.remove(&texture).is_some() {
            self.commands.push(DeviceCommand::Release { texture });
        }
        if self.current.texture() == Some(texture) {
            self.current = RenderTargetBinding::Screen;
        }
    }

    fn bind_target(&mut self, binding: RenderTargetBinding, clear: ClearValue) -> Result<()> {
        if let Some(texture) = binding.texture() {
            let entry =
                self.textures.get_mut(&texture).ok_or_else(|| anyhow!("Unknown render target {texture:?}"))?;
            if let Some(color) = clear.color {
                entry.fill = to_rgba8(color);
            }
        }
        self.current = binding;
        self.commands.push(DeviceCommand::Bind { binding, clear });
        Ok(())
    }

    fn current_target(&self) -> RenderTargetBinding {
        self.current
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    fn set_transforms(&mut self, projection: Mat4, view: Mat4) {
        self.projection = projection;
        self.view = view;
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<()> {
        for binding in &call.textures {
            if !self.textures.contains_key(&binding.texture) {
                bail!("Draw samples released texture {:?}", binding.texture);
            }
        }
        let (triangles, fullscreen) = match call.geometry {
            DrawGeometry::Mesh(mesh) => (mesh.indices.triangle_count(), false),
            DrawGeometry::FullscreenQuad { .. } => (2, true),
        };
        if let Some(target) = self.current.texture() {
            let source = call.textures.first().and_then(|binding| self.textures.get(&binding.texture)).map(|t| t.fill);
            if let Some(entry) = self.textures.get_mut(&target) {
                // Color targets take on the sampled color; mesh draws mark coverage.
                if entry.desc.format == TargetFormat::Rgba8 {
                    entry.fill = match (fullscreen, source) {
                        (true, Some(fill)) => fill,
                        _ => [255, 255, 255, 255],
                    };
                }
            }
        }
        self.commands.push(DeviceCommand::Draw {
            target: self.current,
            shader: call.shader,
            triangles,
            light: call.light,
            fullscreen,
            textures: call.textures.clone(),
        });
        Ok(())
    }

    fn read_target(&mut self, texture: TextureHandle) -> Result<RgbaImage> {
        let entry = self.textures.get(&texture).ok_or_else(|| anyhow!("Unknown render target {texture:?}"))?;
        Ok(RgbaImage::from_pixel(entry.desc.width, entry.desc.height, Rgba(entry.fill)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{MeshBuffer, VertexAttributes};

    #[test]
    fn limit_rejects_extra_targets() {
        let mut device = HeadlessDevice::default().with_target_limit(1);
        let desc = RenderTargetDesc::new_2d("test", 4, TargetFormat::Rgba8);
        let first = device.create_render_target(&desc).expect("first target");
        assert!(device.create_render_target(&desc).is_err());
        device.release_texture(first);
        assert!(device.create_render_target(&desc).is_ok());
    }

    #[test]
    fn clear_and_blit_flow_into_readback() {
        let mut device = HeadlessDevice::default();
        let desc = RenderTargetDesc::new_2d("src", 2, TargetFormat::Rgba8);
        let src = device.create_render_target(&desc).expect("src");
        let dst = device.create_render_target(&desc).expect("dst");
        device.bind_target(RenderTargetBinding::Texture(src), ClearValue { color: Some([1.0, 0.0, 0.0, 1.0]), depth: None }).expect("bind src");
        device.bind_target(RenderTargetBinding::Texture(dst), ClearValue::BLACK).expect("bind dst");
        device.draw(&DrawCall::fullscreen(ShaderId(0), false).with_texture(0, src)).expect("blit");
        let image = device.read_target(dst).expect("read back");
        assert_eq!(image.get_pixel(1, 1).0, [255, 0, 0, 255]);

        let plane = MeshBuffer::plane(1.0, VertexAttributes::STANDARD);
        device.draw(&DrawCall::mesh(ShaderId(1), &plane, Mat4::IDENTITY)).expect("mesh draw");
        assert_eq!(device.draws_into(dst), 2);
        assert_eq!(device.draws_with_shader(ShaderId(1)), 1);
    }
}
