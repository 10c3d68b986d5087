use anyhow::Result;

use super::stage::{draw_visible, RenderStage, StageContext, StageFlow, StageInput, StageKind};
use crate::config::ShadowConfig;
use crate::device::{ClearValue, DrawCall};
use crate::light::{Light, LightKind};
use crate::scene::{shader_names, ShaderId, ShaderLibrary, VisibleMesh};

/// Texture slot the per-light shaders read the light's depth target from.
pub const LIGHT_SHADOW_SLOT: u32 = 3;
/// Texture slot material shaders read the cascade array from.
pub const CASCADE_SHADOW_SLOT: u32 = 4;

#[derive(Debug, Clone, Copy)]
struct LightShaders {
    plain: ShaderId,
    shadowed: ShaderId,
}

/// Forward lit stage: draws every non-deferred material, then adds one full-screen pass per
/// point, spot and area light, sampling that light's cached depth target when it has one.
pub struct LightingStage {
    point: LightShaders,
    spot: LightShaders,
    area: LightShaders,
    max_lights: usize,
    light_passes: u32,
}

impl LightingStage {
    pub fn new(config: &ShadowConfig, shaders: &ShaderLibrary) -> Result<Self> {
        Ok(Self {
            point: LightShaders {
                plain: shaders.require(shader_names::POINT_LIGHT)?,
                shadowed: shaders.require(shader_names::POINT_LIGHT_SHADOW)?,
            },
            spot: LightShaders {
                plain: shaders.require(shader_names::SPOT_LIGHT)?,
                shadowed: shaders.require(shader_names::SPOT_LIGHT_SHADOW)?,
            },
            area: LightShaders {
                plain: shaders.require(shader_names::AREA_LIGHT)?,
                shadowed: shaders.require(shader_names::AREA_LIGHT_SHADOW)?,
            },
            max_lights: config.max_lights,
            light_passes: 0,
        })
    }

    pub fn light_passes(&self) -> u32 {
        self.light_passes
    }

    fn shaders_for(&self, light: &Light) -> Option<LightShaders> {
        match light.kind {
            LightKind::Point { .. } => Some(self.point),
            LightKind::Spot { .. } => Some(self.spot),
            LightKind::Area { .. } => Some(self.area),
            LightKind::Directional { .. } => None,
        }
    }

    fn render_lights(&mut self, ctx: &mut StageContext<'_>, input: &StageInput<'_>) -> Result<()> {
        let flip_v = ctx.device.backend().blit_flips_v();
        let frame_bounce = ctx.frame.bake_bounce;
        let baking_lightmap = ctx.frame.bake_mode && ctx.frame.bake_lightmap_mode;
        let total_bounce = total_bounce(input);
        for light in input.scene.lights.iter().take(self.max_lights) {
            if !light.participates(ctx.frame.bake_mode) {
                continue;
            }
            if baking_lightmap && !contributes_at_bounce(frame_bounce, total_bounce, light.bake_bounce) {
                log::trace!("[pipeline] Light {:?} has no contribution at bounce {frame_bounce}", light.id);
                continue;
            }
            let Some(shaders) = self.shaders_for(light) else {
                continue;
            };
            let depth = if light.cast_shadow { ctx.shadow_cache.depth_texture(light.id) } else { None };
            let mut call = match depth {
                Some(texture) => DrawCall::fullscreen(shaders.shadowed, flip_v).with_texture(LIGHT_SHADOW_SLOT, texture),
                None => DrawCall::fullscreen(shaders.plain, flip_v),
            }
            .with_light(light.id);
            if let Some(cascades) = ctx.frame.shadow_depth_texture() {
                call = call.with_texture(CASCADE_SHADOW_SLOT, cascades);
            }
            ctx.frame.set_current_light(Some(light.id));
            ctx.device.draw(&call)?;
            ctx.frame.set_current_light(None);
            self.light_passes += 1;
        }
        Ok(())
    }
}

/// Bounce count of the scene's main directional light, 1 without one.
fn total_bounce(input: &StageInput<'_>) -> u32 {
    input
        .scene
        .shadow_light()
        .filter(|light| matches!(light.kind, LightKind::Directional { .. }))
        .map_or(1, |light| light.bake_bounce)
}

/// A light only lights the last `light_bounce` of the scene's `total_bounce` passes.
pub fn contributes_at_bounce(pass: u32, total_bounce: u32, light_bounce: u32) -> bool {
    pass >= total_bounce.saturating_sub(light_bounce)
}

impl RenderStage for LightingStage {
    fn kind(&self) -> StageKind {
        StageKind::Lighting
    }

    fn render(&mut self, ctx: &mut StageContext<'_>, input: &StageInput<'_>) -> Result<StageFlow> {
        let Some(camera) = input.camera else {
            return Ok(StageFlow::Stop);
        };
        self.light_passes = 0;
        let backend = ctx.device.backend();
        ctx.device.bind_target(input.target, ClearValue::BLACK)?;
        ctx.device.set_viewport(input.viewport);
        ctx.device.set_transforms(
            backend.perspective(camera.fov_y_radians, input.viewport.aspect(), camera.near, camera.far),
            camera.view_matrix(),
        );
        draw_visible(self, ctx, input)?;
        self.render_lights(ctx, input)?;
        Ok(StageFlow::Forward)
    }

    fn draw_mesh(&mut self, ctx: &mut StageContext<'_>, _input: &StageInput<'_>, mesh: &VisibleMesh) -> Result<()> {
        let Some(material) = mesh.material.as_deref() else {
            return Ok(());
        };
        let mut call = DrawCall::mesh(material.shader.id, &mesh.mesh, mesh.world);
        for (slot, texture) in material.textures.iter().enumerate() {
            if let Some(texture) = texture {
                call = call.with_texture(slot as u32, *texture);
            }
        }
        if let Some(cascades) = ctx.frame.shadow_depth_texture() {
            call = call.with_texture(CASCADE_SHADOW_SLOT, cascades);
        }
        ctx.device.draw(&call)
    }
}
