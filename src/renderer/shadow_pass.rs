use anyhow::Result;
use glam::Vec3;

use super::bounded::{area_light_bound, BoundedShadowProjector};
use super::cascade::{CascadeSettings, FrustumSplitComputer, ShadowCascades};
use super::cube::{face_projection, face_view};
use super::frame::{LightShadow, ShadowFrame};
use super::shadow_cache::DepthTargetKind;
use super::stage::{draw_visible, RenderStage, StageContext, StageFlow, StageInput, StageKind};
use super::MAX_SHADOW_CASCADES;
use crate::camera3d::{Camera3D, Viewport};
use crate::config::ShadowConfig;
use crate::device::{
    ClearValue, CubeFace, DrawCall, GraphicsDevice, RenderTargetBinding, RenderTargetDesc, TargetFormat,
    TextureHandle,
};
use crate::light::{Light, LightId, LightKind, RenderLightClass};
use crate::mesh::Aabb;
use crate::scene::{shader_names, Material, ShaderId, ShaderInfo, ShaderLibrary, VisibleMesh};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowPassMetrics {
    pub cascades: u32,
    pub casters_drawn: u32,
    pub lights_rendered: u32,
    pub lights_cached: u32,
    pub lights_skipped: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DepthPassKind {
    Depth,
    Distance,
}

#[derive(Debug, Clone, Copy)]
struct PassState {
    kind: DepthPassKind,
    cull: Option<Aabb>,
    light: Option<LightId>,
}

impl Default for PassState {
    fn default() -> Self {
        Self { kind: DepthPassKind::Depth, cull: None, light: None }
    }
}

#[derive(Debug, Clone, Copy)]
struct DepthArray {
    texture: TextureHandle,
    layers: u32,
    resolution: u32,
}

/// Realtime shadow stage: cascaded directional depth followed by per-light depth for area, spot and
/// point lights. Depth targets for bounded lights come from the shared [`ShadowDepthCache`].
///
/// [`ShadowDepthCache`]: super::ShadowDepthCache
pub struct ShadowRenderStage {
    computer: FrustumSplitComputer,
    near_offset: f32,
    radius_step: f32,
    max_lights: usize,
    depth_write: ShaderId,
    depth_write_skin: ShaderId,
    distance_write: ShaderId,
    distance_write_skin: ShaderId,
    depth_array: Option<DepthArray>,
    cascades: ShadowCascades,
    pass: PassState,
    metrics: ShadowPassMetrics,
}

impl ShadowRenderStage {
    pub fn new(config: &ShadowConfig, shaders: &ShaderLibrary) -> Result<Self> {
        Ok(Self {
            computer: FrustumSplitComputer::new(CascadeSettings::from(config)),
            near_offset: config.near_offset,
            radius_step: config.radius_step,
            max_lights: config.max_lights,
            depth_write: shaders.require(shader_names::SHADOW_DEPTH_WRITE)?,
            depth_write_skin: shaders.require(shader_names::SHADOW_DEPTH_WRITE_SKIN)?,
            distance_write: shaders.require(shader_names::SHADOW_DISTANCE_WRITE)?,
            distance_write_skin: shaders.require(shader_names::SHADOW_DISTANCE_WRITE_SKIN)?,
            depth_array: None,
            cascades: ShadowCascades::default(),
            pass: PassState::default(),
            metrics: ShadowPassMetrics::default(),
        })
    }

    pub fn metrics(&self) -> ShadowPassMetrics {
        self.metrics
    }

    pub fn cascades(&self) -> &ShadowCascades {
        &self.cascades
    }

    pub fn depth_array(&self) -> Option<TextureHandle> {
        self.depth_array.map(|array| array.texture)
    }

    fn ensure_depth_array(&mut self, device: &mut dyn GraphicsDevice, layers: u32) -> Result<TextureHandle> {
        let resolution = self.computer.settings().resolution;
        if let Some(array) = self.depth_array {
            if array.layers == layers && array.resolution == resolution {
                return Ok(array.texture);
            }
            device.release_texture(array.texture);
            self.depth_array = None;
        }
        let desc = RenderTargetDesc::new_array("shadow_cascades", resolution, layers, TargetFormat::R32Float);
        let texture = device.create_render_target(&desc)?;
        self.depth_array = Some(DepthArray { texture, layers, resolution });
        Ok(texture)
    }

    fn render_cascades(
        &mut self,
        ctx: &mut StageContext<'_>,
        input: &StageInput<'_>,
        camera: &Camera3D,
        light: &Light,
    ) -> Result<()> {
        let LightKind::Directional { direction } = light.kind else {
            return Ok(());
        };
        let backend = ctx.device.backend();
        let cascades = self.computer.compute(camera, direction, input.viewport.aspect(), backend);
        let layers = self.computer.settings().layer_count() as u32;
        let texture = match self.ensure_depth_array(ctx.device, layers) {
            Ok(texture) => texture,
            Err(err) => {
                log::warn!("[shadow] Skipping cascaded shadows this frame: {err:#}");
                return Ok(());
            }
        };
        let resolution = self.computer.settings().resolution;
        for (layer, split) in cascades.splits.iter().enumerate().rev() {
            ctx.device.bind_target(RenderTargetBinding::Layer { texture, layer: layer as u32 }, ClearValue::DEPTH_WHITE)?;
            ctx.device.set_viewport(Viewport::square(resolution));
            ctx.device.set_transforms(split.projection, split.view);
            self.pass = PassState { kind: DepthPassKind::Depth, cull: Some(split.bounds), light: Some(light.id) };
            if light.cast_shadow {
                draw_visible(self, ctx, input)?;
            }
            self.metrics.cascades += 1;
        }
        ctx.frame.publish_shadow(ShadowFrame {
            depth_texture: texture,
            light_direction: cascades.light_direction,
            matrices: cascades.matrices(MAX_SHADOW_CASCADES),
            distances: cascades.distances(MAX_SHADOW_CASCADES),
        });
        self.cascades = cascades;
        Ok(())
    }

    fn render_lights(&mut self, ctx: &mut StageContext<'_>, input: &StageInput<'_>, camera: &Camera3D) -> Result<()> {
        ctx.shadow_cache.clear_dynamic();
        let bake_mode = ctx.frame.bake_mode;
        for light in input.scene.lights.iter().take(self.max_lights) {
            if !light.enabled || !light.visible {
                continue;
            }
            if light.class == RenderLightClass::Baked && !bake_mode {
                continue;
            }
            if !light.cast_shadow {
                continue;
            }
            match light.kind {
                LightKind::Area { .. } => self.render_area_light(ctx, input, light)?,
                LightKind::Point { .. } | LightKind::Spot { .. } => self.render_cube_light(ctx, input, camera, light)?,
                LightKind::Directional { .. } => {}
            }
        }
        Ok(())
    }

    fn render_area_light(&mut self, ctx: &mut StageContext<'_>, input: &StageInput<'_>, light: &Light) -> Result<()> {
        let (Some(bound), Some(position)) = (area_light_bound(light), light.position()) else {
            return Ok(());
        };
        let slot = match ctx.shadow_cache.get_or_create(ctx.device, light, DepthTargetKind::Texture2D) {
            Ok(slot) => slot,
            Err(err) => {
                log::warn!("[shadow] No depth target for area light {:?}: {err:#}", light.id);
                self.metrics.lights_skipped += 1;
                return Ok(());
            }
        };
        let projector = BoundedShadowProjector::new(self.near_offset, self.radius_step, ctx.device.backend());
        let shadow = projector.area(position, light.direction().unwrap_or(Vec3::NEG_Z), &bound);
        ctx.frame.set_light_shadow(light.id, LightShadow { depth_texture: slot.texture, matrix: Some(shadow.shadow_matrix) });
        if !slot.needs_render && !light.dynamic_shadow {
            self.metrics.lights_cached += 1;
            return Ok(());
        }
        let size = ctx.shadow_cache.size();
        ctx.device.bind_target(RenderTargetBinding::Texture(slot.texture), ClearValue::DEPTH_WHITE)?;
        ctx.device.set_viewport(Viewport::square(size));
        ctx.device.set_transforms(shadow.projection, shadow.view);
        ctx.frame.set_current_light(Some(light.id));
        self.pass = PassState { kind: DepthPassKind::Depth, cull: Some(shadow.bounds), light: Some(light.id) };
        draw_visible(self, ctx, input)?;
        ctx.shadow_cache.mark_rendered(light.id);
        self.metrics.lights_rendered += 1;
        Ok(())
    }

    fn render_cube_light(
        &mut self,
        ctx: &mut StageContext<'_>,
        input: &StageInput<'_>,
        camera: &Camera3D,
        light: &Light,
    ) -> Result<()> {
        let (Some(position), Some(radius)) = (light.position(), light.radius()) else {
            return Ok(());
        };
        let slot = match ctx.shadow_cache.get_or_create(ctx.device, light, DepthTargetKind::Cube) {
            Ok(slot) => slot,
            Err(err) => {
                log::warn!("[shadow] No cube depth target for light {:?}: {err:#}", light.id);
                self.metrics.lights_skipped += 1;
                return Ok(());
            }
        };
        ctx.frame.set_light_shadow(light.id, LightShadow { depth_texture: slot.texture, matrix: None });
        if !slot.needs_render && !light.dynamic_shadow {
            self.metrics.lights_cached += 1;
            return Ok(());
        }
        let backend = ctx.device.backend();
        let size = ctx.shadow_cache.size();
        let projection = face_projection(backend, camera.near, radius, camera.far);
        let reach = if radius > camera.near { radius } else { camera.far };
        let cull = Aabb::new(position - Vec3::splat(reach), position + Vec3::splat(reach));
        ctx.frame.set_current_light(Some(light.id));
        for face in CubeFace::ALL {
            ctx.device.bind_target(RenderTargetBinding::CubeFace { texture: slot.texture, face }, ClearValue::DEPTH_WHITE)?;
            ctx.device.set_viewport(Viewport::square(size));
            ctx.device.set_transforms(projection, face_view(position, face, backend));
            self.pass = PassState { kind: DepthPassKind::Distance, cull: Some(cull), light: Some(light.id) };
            draw_visible(self, ctx, input)?;
        }
        ctx.shadow_cache.mark_rendered(light.id);
        self.metrics.lights_rendered += 1;
        Ok(())
    }

    fn depth_shader(&self, material: &Material, skinned: bool) -> ShaderId {
        match self.pass.kind {
            DepthPassKind::Depth => material.shader.depth_write.unwrap_or(if skinned {
                self.depth_write_skin
            } else {
                self.depth_write
            }),
            DepthPassKind::Distance => material.shader.distance_write.unwrap_or(if skinned {
                self.distance_write_skin
            } else {
                self.distance_write
            }),
        }
    }
}

impl RenderStage for ShadowRenderStage {
    fn kind(&self) -> StageKind {
        StageKind::Shadow
    }

    fn can_render_material(&self, _material: &Material) -> bool {
        true
    }

    fn can_render_shader(&self, _shader: &ShaderInfo) -> bool {
        true
    }

    fn render(&mut self, ctx: &mut StageContext<'_>, input: &StageInput<'_>) -> Result<StageFlow> {
        let Some(camera) = input.camera else {
            return Ok(StageFlow::Stop);
        };
        self.metrics = ShadowPassMetrics::default();
        ctx.frame.begin_frame();

        let bake_mode = ctx.frame.bake_mode;
        if let Some(light) = input.scene.shadow_light().filter(|light| light.participates(bake_mode)) {
            self.render_cascades(ctx, input, camera, light)?;
        } else {
            ctx.frame.clear_shadow();
        }
        self.render_lights(ctx, input, camera)?;

        ctx.frame.set_current_light(None);
        if ctx.device.current_target() != input.target {
            ctx.device.bind_target(input.target, ClearValue::NONE)?;
        }
        ctx.device.set_viewport(input.viewport);
        Ok(StageFlow::Forward)
    }

    fn draw_mesh(&mut self, ctx: &mut StageContext<'_>, _input: &StageInput<'_>, mesh: &VisibleMesh) -> Result<()> {
        let Some(material) = mesh.material.as_deref() else {
            return Ok(());
        };
        if !material.shader.draws_depth_shadow {
            return Ok(());
        }
        if let Some(cull) = self.pass.cull {
            if !cull.intersects(&mesh.world_bounds()) {
                return Ok(());
            }
        }
        let shader = self.depth_shader(material, mesh.is_skinned());
        let mut call = DrawCall::mesh(shader, &mesh.mesh, mesh.world);
        if let Some(light) = self.pass.light {
            call = call.with_light(light);
        }
        ctx.device.draw(&call)?;
        self.metrics.casters_drawn += 1;
        Ok(())
    }

    fn release(&mut self, device: &mut dyn GraphicsDevice) {
        if let Some(array) = self.depth_array.take() {
            device.release_texture(array.texture);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCommand, HeadlessDevice};
    use crate::mesh::{MeshBuffer, VertexAttributes};
    use crate::renderer::{FrameState, ShadowDepthCache};
    use crate::scene::SceneView;
    use glam::Mat4;
    use std::sync::Arc;

    fn caster(library: &mut ShaderLibrary) -> VisibleMesh {
        let shader = library.register("Lit", |_| {});
        let mesh = Arc::new(MeshBuffer::plane(20.0, VertexAttributes::STANDARD));
        VisibleMesh::new(mesh, Some(Arc::new(Material::new("ground", shader))), Mat4::from_translation(Vec3::new(0.0, 0.0, 10.0)))
    }

    #[test]
    fn cascades_render_far_to_near_and_publish_frame() {
        let mut library = ShaderLibrary::with_builtins();
        let meshes = vec![caster(&mut library)];
        let lights = vec![Light::directional(Vec3::new(0.3, -1.0, 0.2))];
        let mut stage = ShadowRenderStage::new(&ShadowConfig::default(), &library).expect("stage");
        let camera = Camera3D::new(Vec3::new(0.0, 2.0, 0.0), Vec3::new(0.0, 2.0, 10.0), 1.0, 1.0, 300.0);

        let mut device = HeadlessDevice::default();
        let mut frame = FrameState::new();
        let mut cache = ShadowDepthCache::new(64);
        let mut ctx = StageContext { device: &mut device, frame: &mut frame, shadow_cache: &mut cache, bake: None };
        let input = StageInput::new(RenderTargetBinding::Screen, Some(&camera), SceneView::new(&meshes, &lights), Viewport::new(640.0, 480.0));
        assert_eq!(stage.render(&mut ctx, &input).expect("render"), StageFlow::Forward);

        assert_eq!(frame.shadow_matrices().len(), 3);
        assert_eq!(stage.metrics().cascades, 3);
        let layers: Vec<u32> = device
            .commands()
            .iter()
            .filter_map(|cmd| match cmd {
                DeviceCommand::Bind { binding: RenderTargetBinding::Layer { layer, .. }, .. } => Some(*layer),
                _ => None,
            })
            .collect();
        assert_eq!(layers, vec![2, 1, 0]);
        assert_eq!(device.current_target(), RenderTargetBinding::Screen);
        assert!(device.draws_with_shader(library.require(shader_names::SHADOW_DEPTH_WRITE).expect("id")) > 0);
    }

    #[test]
    fn point_light_renders_six_faces_once_while_static() {
        let mut library = ShaderLibrary::with_builtins();
        let meshes = vec![caster(&mut library)];
        let lights = vec![Light::point(Vec3::new(0.0, 3.0, 10.0), 15.0)];
        let mut stage = ShadowRenderStage::new(&ShadowConfig::default(), &library).expect("stage");
        let camera = Camera3D::new(Vec3::ZERO, Vec3::Z, 1.0, 0.5, 100.0);
        let distance = library.require(shader_names::SHADOW_DISTANCE_WRITE).expect("id");

        let mut device = HeadlessDevice::default();
        let mut frame = FrameState::new();
        let mut cache = ShadowDepthCache::new(64);
        for _ in 0..2 {
            let mut ctx = StageContext { device: &mut device, frame: &mut frame, shadow_cache: &mut cache, bake: None };
            let input = StageInput::new(RenderTargetBinding::Screen, Some(&camera), SceneView::new(&meshes, &lights), Viewport::new(64.0, 64.0));
            stage.render(&mut ctx, &input).expect("render");
        }
        assert_eq!(stage.metrics().lights_cached, 1);
        assert_eq!(device.draws_with_shader(distance), 6);
        assert!(frame.light_shadow(lights[0].id).is_some());
        assert!(frame.current_light().is_none());
    }
}
