use glam::{Mat4, Vec3};
use smallvec::SmallVec;
use std::collections::HashMap;

use super::MAX_SHADOW_CASCADES;
use crate::device::TextureHandle;
use crate::light::LightId;

/// Cascaded (or single) directional shadow published for the rest of the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowFrame {
    pub depth_texture: TextureHandle,
    pub light_direction: Vec3,
    pub matrices: SmallVec<[Mat4; MAX_SHADOW_CASCADES]>,
    pub distances: SmallVec<[f32; MAX_SHADOW_CASCADES]>,
}

/// Depth target of one bounded light, plus its biased matrix when the light uses a 2D map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightShadow {
    pub depth_texture: TextureHandle,
    pub matrix: Option<Mat4>,
}

/// Explicit per-frame context shared by the stages of a chain.
#[derive(Debug)]
pub struct FrameState {
    /// Lets Baked lights take part in shadow and light passes.
    pub bake_mode: bool,
    pub bake_lightmap_mode: bool,
    pub bake_bounce: u32,
    current_light: Option<LightId>,
    shadow: Option<ShadowFrame>,
    light_shadows: HashMap<LightId, LightShadow>,
    shadow_bias: f32,
}

pub const DEFAULT_SHADOW_BIAS: f32 = 0.0005;

impl Default for FrameState {
    fn default() -> Self {
        Self {
            bake_mode: false,
            bake_lightmap_mode: false,
            bake_bounce: 0,
            current_light: None,
            shadow: None,
            light_shadows: HashMap::new(),
            shadow_bias: DEFAULT_SHADOW_BIAS,
        }
    }
}

impl FrameState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bake() -> Self {
        Self { bake_mode: true, bake_lightmap_mode: true, ..Self::default() }
    }

    /// Drops everything published by the previous frame. Bake flags and bias persist.
    pub fn begin_frame(&mut self) {
        self.current_light = None;
        self.shadow = None;
        self.light_shadows.clear();
    }

    pub fn set_current_light(&mut self, light: Option<LightId>) {
        self.current_light = light;
    }

    pub fn current_light(&self) -> Option<LightId> {
        self.current_light
    }

    pub fn publish_shadow(&mut self, shadow: ShadowFrame) {
        self.shadow = Some(shadow);
    }

    pub fn clear_shadow(&mut self) {
        self.shadow = None;
    }

    pub fn shadow(&self) -> Option<&ShadowFrame> {
        self.shadow.as_ref()
    }

    pub fn shadow_matrices(&self) -> &[Mat4] {
        self.shadow.as_ref().map(|s| s.matrices.as_slice()).unwrap_or(&[])
    }

    pub fn shadow_distances(&self) -> &[f32] {
        self.shadow.as_ref().map(|s| s.distances.as_slice()).unwrap_or(&[])
    }

    pub fn shadow_depth_texture(&self) -> Option<TextureHandle> {
        self.shadow.as_ref().map(|s| s.depth_texture)
    }

    pub fn set_light_shadow(&mut self, light: LightId, shadow: LightShadow) {
        self.light_shadows.insert(light, shadow);
    }

    pub fn light_shadow(&self, light: LightId) -> Option<&LightShadow> {
        self.light_shadows.get(&light)
    }

    pub fn shadow_bias(&self) -> f32 {
        self.shadow_bias
    }

    /// Sets the bias and returns the previous value.
    pub fn set_shadow_bias(&mut self, bias: f32) -> f32 {
        std::mem::replace(&mut self.shadow_bias, bias)
    }

    pub fn shadow_uniform(&self) -> ShadowUniform {
        let mut uniform = ShadowUniform::zeroed_identity();
        if let Some(shadow) = self.shadow.as_ref() {
            for (dst, src) in uniform.matrices.iter_mut().zip(shadow.matrices.iter()) {
                *dst = src.to_cols_array_2d();
            }
            for (dst, src) in uniform.distances.iter_mut().zip(shadow.distances.iter()) {
                *dst = *src;
            }
            uniform.params[1] = shadow.matrices.len() as f32;
            uniform.light_direction = shadow.light_direction.extend(0.0).to_array();
        }
        uniform.params[0] = self.shadow_bias;
        uniform
    }
}

/// GPU layout of the shadow data consumed by shading code.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ShadowUniform {
    pub matrices: [[[f32; 4]; 4]; MAX_SHADOW_CASCADES],
    pub distances: [f32; 4],
    pub light_direction: [f32; 4],
    /// bias, cascade count, unused, unused
    pub params: [f32; 4],
}

impl ShadowUniform {
    fn zeroed_identity() -> Self {
        Self {
            matrices: [Mat4::IDENTITY.to_cols_array_2d(); MAX_SHADOW_CASCADES],
            distances: [0.0; 4],
            light_direction: [0.0; 4],
            params: [0.0; 4],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn begin_frame_clears_published_state_but_keeps_flags() {
        let mut frame = FrameState::bake();
        frame.set_current_light(Some(LightId::new()));
        frame.publish_shadow(ShadowFrame {
            depth_texture: TextureHandle(3),
            light_direction: Vec3::NEG_Y,
            matrices: smallvec![Mat4::IDENTITY, Mat4::IDENTITY],
            distances: smallvec![10.0, 50.0],
        });
        assert_eq!(frame.shadow_distances(), &[10.0, 50.0]);
        frame.begin_frame();
        assert!(frame.current_light().is_none());
        assert!(frame.shadow_matrices().is_empty());
        assert!(frame.bake_mode);
    }

    #[test]
    fn uniform_packs_matrices_and_bias() {
        let mut frame = FrameState::new();
        let previous = frame.set_shadow_bias(0.0004);
        assert!((previous - DEFAULT_SHADOW_BIAS).abs() < f32::EPSILON);
        frame.publish_shadow(ShadowFrame {
            depth_texture: TextureHandle(1),
            light_direction: Vec3::NEG_Z,
            matrices: smallvec![Mat4::from_scale(Vec3::splat(2.0))],
            distances: smallvec![42.0],
        });
        let uniform = frame.shadow_uniform();
        assert_eq!(uniform.matrices[0][0][0], 2.0);
        assert_eq!(uniform.distances[0], 42.0);
        assert_eq!(uniform.params[1], 1.0);
        assert!((uniform.params[0] - 0.0004).abs() < f32::EPSILON);
        assert_eq!(uniform.as_bytes().len(), std::mem::size_of::<ShadowUniform>());
    }
}
