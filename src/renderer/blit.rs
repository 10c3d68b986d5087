use anyhow::Result;
use glam::Mat4;

use crate::camera3d::Viewport;
use crate::device::{DrawCall, GraphicsDevice, TextureHandle};
use crate::scene::ShaderId;

/// Puts the device in 2D mode for a `width` × `height` target. The quad is emitted in clip space so
/// both transforms are identity.
pub fn begin_2d(device: &mut dyn GraphicsDevice, width: u32, height: u32) {
    device.set_viewport(Viewport::new(width as f32, height as f32));
    device.set_transforms(Mat4::IDENTITY, Mat4::IDENTITY);
}

/// Draws a full-screen quad into the bound target, sampling `textures` at slots 0.. in order.
pub fn render_buffer_to_target(
    device: &mut dyn GraphicsDevice,
    shader: ShaderId,
    textures: &[TextureHandle],
    width: u32,
    height: u32,
) -> Result<()> {
    begin_2d(device, width, height);
    let mut call = DrawCall::fullscreen(shader, device.backend().blit_flips_v());
    for (slot, texture) in textures.iter().enumerate() {
        call = call.with_texture(slot as u32, *texture);
    }
    device.draw(&call)
}
