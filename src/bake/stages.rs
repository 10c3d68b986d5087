use anyhow::Result;
use glam::Mat4;
use smallvec::smallvec;
use std::sync::Arc;

use crate::camera3d::{Camera3D, Viewport};
use crate::config::ShadowConfig;
use crate::device::{
    ClearValue, CubeFace, DrawCall, DrawState, GraphicsDevice, RenderTargetBinding, RenderTargetDesc, TargetFormat,
    TextureHandle,
};
use crate::light::{Light, LightKind, LightType};
use crate::renderer::bounded::BoundedShadowProjector;
use crate::renderer::cube::{face_projection, face_view};
use crate::renderer::lighting_pass::{CASCADE_SHADOW_SLOT, LIGHT_SHADOW_SLOT};
use crate::renderer::{
    draw_visible, LightShadow, RenderStage, ShadowFrame, StageContext, StageFlow, StageInput, StageKind,
    MAX_SHADOW_CASCADES,
};
use crate::scene::{shader_names, Material, ShaderId, ShaderInfo, ShaderLibrary, VisibleMesh, NORMAL_MAP_SLOT};

const POINT_BAKE_NEAR: f32 = 0.05;

#[derive(Debug, Clone, Copy)]
struct DepthWriters {
    plain: ShaderId,
    skinned: ShaderId,
}

impl DepthWriters {
    fn pick(&self, material: &Material, skinned: bool, override_id: Option<ShaderId>) -> Option<ShaderId> {
        if !material.shader.draws_depth_shadow {
            return None;
        }
        Some(override_id.unwrap_or(if skinned { self.skinned } else { self.plain }))
    }
}

fn ensure_target(
    slot: &mut Option<TextureHandle>,
    device: &mut dyn GraphicsDevice,
    desc: &RenderTargetDesc,
) -> Result<TextureHandle> {
    if let Some(texture) = *slot {
        return Ok(texture);
    }
    let texture = device.create_render_target(desc)?;
    *slot = Some(texture);
    Ok(texture)
}

/// Depth for directional, area and spot lights while baking. Directional lights get a bounded
/// orthographic map around the entry; area and spot lights a perspective map.
pub struct BakeShadowStage {
    size: u32,
    near_offset: f32,
    radius_step: f32,
    writers: DepthWriters,
    texture: Option<TextureHandle>,
}

impl BakeShadowStage {
    pub fn new(size: u32, config: &ShadowConfig, shaders: &ShaderLibrary) -> Result<Self> {
        Ok(Self {
            size: size.max(1),
            near_offset: config.near_offset,
            radius_step: config.radius_step,
            writers: DepthWriters {
                plain: shaders.require(shader_names::SHADOW_DEPTH_WRITE)?,
                skinned: shaders.require(shader_names::SHADOW_DEPTH_WRITE_SKIN)?,
            },
            texture: None,
        })
    }
}

impl RenderStage for BakeShadowStage {
    fn kind(&self) -> StageKind {
        StageKind::BakeShadow
    }

    fn can_render_material(&self, _material: &Material) -> bool {
        true
    }

    fn can_render_shader(&self, _shader: &ShaderInfo) -> bool {
        true
    }

    fn render(&mut self, ctx: &mut StageContext<'_>, input: &StageInput<'_>) -> Result<StageFlow> {
        if input.camera.is_none() {
            return Ok(StageFlow::Stop);
        }
        let Some(bake) = ctx.bake else {
            return Ok(StageFlow::Forward);
        };
        let light = bake.light;
        if light.light_type() == LightType::Directional {
            ctx.frame.clear_shadow();
        }
        if !light.cast_shadow || light.light_type() == LightType::Point {
            return Ok(StageFlow::Forward);
        }
        let projector = BoundedShadowProjector::new(self.near_offset, self.radius_step, ctx.device.backend());
        let Some(shadow) = projector.project(light, &bake.bound) else {
            return Ok(StageFlow::Forward);
        };
        let desc = RenderTargetDesc::new_2d("bake_shadow", self.size, TargetFormat::R32Float);
        let texture = match ensure_target(&mut self.texture, ctx.device, &desc) {
            Ok(texture) => texture,
            Err(err) => {
                log::warn!("[bake] Baking {:?} without shadows: {err:#}", light.id);
                return Ok(StageFlow::Forward);
            }
        };
        ctx.device.bind_target(RenderTargetBinding::Texture(texture), ClearValue::DEPTH_WHITE)?;
        ctx.device.set_viewport(Viewport::square(self.size));
        ctx.device.set_transforms(shadow.projection, shadow.view);
        draw_visible(self, ctx, input)?;

        match light.kind {
            LightKind::Directional { direction } => {
                let matrices = smallvec![shadow.shadow_matrix; MAX_SHADOW_CASCADES];
                ctx.frame.publish_shadow(ShadowFrame {
                    depth_texture: texture,
                    light_direction: direction,
                    matrices,
                    distances: smallvec![shadow.eye.distance(shadow.center) * 2.0; MAX_SHADOW_CASCADES],
                });
            }
            _ => ctx.frame.set_light_shadow(light.id, LightShadow { depth_texture: texture, matrix: Some(shadow.shadow_matrix) }),
        }
        Ok(StageFlow::Forward)
    }

    fn draw_mesh(&mut self, ctx: &mut StageContext<'_>, _input: &StageInput<'_>, mesh: &VisibleMesh) -> Result<()> {
        let Some(material) = mesh.material.as_deref() else {
            return Ok(());
        };
        let Some(shader) = self.writers.pick(material, mesh.is_skinned(), material.shader.depth_write) else {
            return Ok(());
        };
        ctx.device.draw(&DrawCall::mesh(shader, &mesh.mesh, mesh.world))
    }

    fn release(&mut self, device: &mut dyn GraphicsDevice) {
        if let Some(texture) = self.texture.take() {
            device.release_texture(texture);
        }
    }
}

/// Distance cube for point and spot lights while baking.
pub struct PointShadowBakeStage {
    size: u32,
    writers: DepthWriters,
    texture: Option<TextureHandle>,
}

impl PointShadowBakeStage {
    pub fn new(size: u32, shaders: &ShaderLibrary) -> Result<Self> {
        Ok(Self {
            size: size.max(1),
            writers: DepthWriters {
                plain: shaders.require(shader_names::SHADOW_DISTANCE_WRITE)?,
                skinned: shaders.require(shader_names::SHADOW_DISTANCE_WRITE_SKIN)?,
            },
            texture: None,
        })
    }
}

impl RenderStage for PointShadowBakeStage {
    fn kind(&self) -> StageKind {
        StageKind::BakePointShadow
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
        let Some(bake) = ctx.bake else {
            return Ok(StageFlow::Forward);
        };
        let light = bake.light;
        let (Some(position), Some(radius)) = (light.position(), light.radius()) else {
            return Ok(StageFlow::Forward);
        };
        if !light.cast_shadow || !matches!(light.kind, LightKind::Point { .. } | LightKind::Spot { .. }) {
            return Ok(StageFlow::Forward);
        }
        let desc = RenderTargetDesc::new_cube("bake_point_shadow", self.size, TargetFormat::R32Float);
        let texture = match ensure_target(&mut self.texture, ctx.device, &desc) {
            Ok(texture) => texture,
            Err(err) => {
                log::warn!("[bake] Baking {:?} without shadows: {err:#}", light.id);
                return Ok(StageFlow::Forward);
            }
        };
        let backend = ctx.device.backend();
        let projection = face_projection(backend, POINT_BAKE_NEAR, radius, camera.far);
        for face in CubeFace::ALL {
            ctx.device.bind_target(RenderTargetBinding::CubeFace { texture, face }, ClearValue::DEPTH_WHITE)?;
            ctx.device.set_viewport(Viewport::square(self.size));
            ctx.device.set_transforms(projection, face_view(position, face, backend));
            draw_visible(self, ctx, input)?;
        }
        ctx.frame.set_light_shadow(light.id, LightShadow { depth_texture: texture, matrix: None });
        Ok(StageFlow::Forward)
    }

    fn draw_mesh(&mut self, ctx: &mut StageContext<'_>, _input: &StageInput<'_>, mesh: &VisibleMesh) -> Result<()> {
        let Some(material) = mesh.material.as_deref() else {
            return Ok(());
        };
        let Some(shader) = self.writers.pick(material, mesh.is_skinned(), material.shader.distance_write) else {
            return Ok(());
        };
        ctx.device.draw(&DrawCall::mesh(shader, &mesh.mesh, mesh.world))
    }

    fn release(&mut self, device: &mut dyn GraphicsDevice) {
        if let Some(texture) = self.texture.take() {
            device.release_texture(texture);
        }
    }
}

/// Shader variants of one accumulation stage.
#[derive(Debug, Clone, Copy)]
struct AccumulationShaders {
    lightmap: ShaderId,
    uv0: ShaderId,
    lightmap_normal: ShaderId,
    uv0_normal: ShaderId,
}

impl AccumulationShaders {
    fn pick(&self, uv0: bool, normal: bool) -> ShaderId {
        match (uv0, normal) {
            (false, false) => self.lightmap,
            (true, false) => self.uv0,
            (false, true) => self.lightmap_normal,
            (true, true) => self.uv0_normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccumulationTarget {
    Direct,
    Point,
}

/// Where the accumulation shader reads this light's depth from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShadowSource {
    Cascades,
    LightDepth,
}

/// Draws each atlas slot's triangles of the entry being baked into that slot's accumulation target.
fn accumulate(
    ctx: &mut StageContext<'_>,
    mesh: &VisibleMesh,
    shaders: &AccumulationShaders,
    target: AccumulationTarget,
    shadow: ShadowSource,
    clear: ClearValue,
) -> Result<()> {
    let Some(bake) = ctx.bake else {
        return Ok(());
    };
    if !Arc::ptr_eq(&mesh.mesh, bake.render_mesh) {
        return Ok(());
    }
    if !bake.bake_in_uv0 && !mesh.mesh.has_lightmap_channel() {
        log::debug!("[bake] Mesh has no lightmap channel; skipping");
        return Ok(());
    }
    let normal_map = bake.normal_map.filter(|_| bake.detail_normal && mesh.mesh.has_tangents());
    let shader = shaders.pick(bake.bake_in_uv0, normal_map.is_some());
    let shadow_texture = match shadow {
        _ if !bake.light.cast_shadow => None,
        ShadowSource::Cascades => ctx.frame.shadow_depth_texture().map(|texture| (CASCADE_SHADOW_SLOT, texture)),
        ShadowSource::LightDepth => ctx.frame.light_shadow(bake.light.id).map(|s| (LIGHT_SHADOW_SLOT, s.depth_texture)),
    };
    for binding in bake.slots {
        let texture = match target {
            AccumulationTarget::Direct => binding.direct,
            AccumulationTarget::Point => binding.point,
        };
        ctx.device.bind_target(RenderTargetBinding::Texture(texture), clear)?;
        ctx.device.set_viewport(Viewport::square(bake.bake_size));
        let mut call = DrawCall::mesh(shader, binding.sub_mesh, mesh.world)
            .with_state(DrawState::UNWRAP)
            .with_light(bake.light.id);
        if let Some(normal_map) = normal_map {
            call = call.with_texture(NORMAL_MAP_SLOT as u32, normal_map);
        }
        if let Some((slot, texture)) = shadow_texture {
            call = call.with_texture(slot, texture);
        }
        ctx.device.draw(&call)?;
    }
    Ok(())
}

fn bake_light_of<'a>(ctx: &StageContext<'a>, wanted: &[LightType]) -> Option<&'a Light> {
    ctx.bake.map(|bake| bake.light).filter(|light| wanted.contains(&light.light_type()))
}

fn set_camera_transforms(ctx: &mut StageContext<'_>, camera: &Camera3D, viewport: Viewport) {
    let backend = ctx.device.backend();
    let projection: Mat4 = backend.perspective(camera.fov_y_radians, viewport.aspect(), camera.near, camera.far);
    ctx.device.set_transforms(projection, camera.view_matrix());
}

/// Accumulates directional light into the direct-light atlas targets. The bake shadow bias replaces
/// the frame bias for the duration of the pass.
pub struct DirectionalLightBakeStage {
    shaders: AccumulationShaders,
    shadow_bias: f32,
}

impl DirectionalLightBakeStage {
    pub fn new(shadow_bias: f32, shaders: &ShaderLibrary) -> Result<Self> {
        Ok(Self {
            shaders: AccumulationShaders {
                lightmap: shaders.require(shader_names::BAKE_DIRECTIONAL)?,
                uv0: shaders.require(shader_names::BAKE_DIRECTIONAL_UV0)?,
                lightmap_normal: shaders.require(shader_names::BAKE_DIRECTIONAL_NORMAL)?,
                uv0_normal: shaders.require(shader_names::BAKE_DIRECTIONAL_UV0_NORMAL)?,
            },
            shadow_bias,
        })
    }
}

impl RenderStage for DirectionalLightBakeStage {
    fn kind(&self) -> StageKind {
        StageKind::BakeDirectional
    }

    fn can_render_material(&self, material: &Material) -> bool {
        material.shader.opaque
    }

    fn can_render_shader(&self, shader: &ShaderInfo) -> bool {
        shader.opaque
    }

    fn render(&mut self, ctx: &mut StageContext<'_>, input: &StageInput<'_>) -> Result<StageFlow> {
        let Some(camera) = input.camera else {
            return Ok(StageFlow::Stop);
        };
        let Some(light) = bake_light_of(ctx, &[LightType::Directional]) else {
            return Ok(StageFlow::Forward);
        };
        set_camera_transforms(ctx, camera, input.viewport);
        let previous_bias = ctx.frame.set_shadow_bias(self.shadow_bias);
        ctx.frame.set_current_light(Some(light.id));
        let drawn = draw_visible(self, ctx, input);
        ctx.frame.set_current_light(None);
        ctx.frame.set_shadow_bias(previous_bias);
        drawn?;
        Ok(StageFlow::Forward)
    }

    fn draw_mesh(&mut self, ctx: &mut StageContext<'_>, _input: &StageInput<'_>, mesh: &VisibleMesh) -> Result<()> {
        accumulate(ctx, mesh, &self.shaders, AccumulationTarget::Direct, ShadowSource::Cascades, ClearValue::NONE)
    }
}

/// Accumulates area light into the point/area atlas targets.
pub struct AreaLightBakeStage {
    shaders: AccumulationShaders,
}

impl AreaLightBakeStage {
    pub fn new(shaders: &ShaderLibrary) -> Result<Self> {
        Ok(Self {
            shaders: AccumulationShaders {
                lightmap: shaders.require(shader_names::BAKE_AREA)?,
                uv0: shaders.require(shader_names::BAKE_AREA_UV0)?,
                lightmap_normal: shaders.require(shader_names::BAKE_AREA_NORMAL)?,
                uv0_normal: shaders.require(shader_names::BAKE_AREA_UV0_NORMAL)?,
            },
        })
    }
}

impl RenderStage for AreaLightBakeStage {
    fn kind(&self) -> StageKind {
        StageKind::BakeArea
    }

    fn can_render_material(&self, material: &Material) -> bool {
        material.shader.opaque
    }

    fn can_render_shader(&self, shader: &ShaderInfo) -> bool {
        shader.opaque
    }

    fn render(&mut self, ctx: &mut StageContext<'_>, input: &StageInput<'_>) -> Result<StageFlow> {
        let Some(camera) = input.camera else {
            return Ok(StageFlow::Stop);
        };
        let Some(light) = bake_light_of(ctx, &[LightType::Area]) else {
            return Ok(StageFlow::Forward);
        };
        set_camera_transforms(ctx, camera, input.viewport);
        ctx.frame.set_current_light(Some(light.id));
        let drawn = draw_visible(self, ctx, input);
        ctx.frame.set_current_light(None);
        drawn?;
        Ok(StageFlow::Forward)
    }

    fn draw_mesh(&mut self, ctx: &mut StageContext<'_>, _input: &StageInput<'_>, mesh: &VisibleMesh) -> Result<()> {
        accumulate(ctx, mesh, &self.shaders, AccumulationTarget::Point, ShadowSource::LightDepth, ClearValue::DEPTH)
    }
}

/// Accumulates point and spot light into the point/area atlas targets.
pub struct PointLightBakeStage {
    shaders: AccumulationShaders,
}

impl PointLightBakeStage {
    pub fn new(shaders: &ShaderLibrary) -> Result<Self> {
        let point = shaders.require(shader_names::BAKE_POINT)?;
        Ok(Self { shaders: AccumulationShaders { lightmap: point, uv0: point, lightmap_normal: point, uv0_normal: point } })
    }
}

impl RenderStage for PointLightBakeStage {
    fn kind(&self) -> StageKind {
        StageKind::BakePoint
    }

    fn can_render_material(&self, material: &Material) -> bool {
        material.shader.opaque
    }

    fn can_render_shader(&self, shader: &ShaderInfo) -> bool {
        shader.opaque
    }

    fn render(&mut self, ctx: &mut StageContext<'_>, input: &StageInput<'_>) -> Result<StageFlow> {
        let Some(camera) = input.camera else {
            return Ok(StageFlow::Stop);
        };
        let Some(light) = bake_light_of(ctx, &[LightType::Point, LightType::Spot]) else {
            return Ok(StageFlow::Forward);
        };
        set_camera_transforms(ctx, camera, input.viewport);
        ctx.frame.set_current_light(Some(light.id));
        let drawn = draw_visible(self, ctx, input);
        ctx.frame.set_current_light(None);
        drawn?;
        Ok(StageFlow::Forward)
    }

    fn draw_mesh(&mut self, ctx: &mut StageContext<'_>, _input: &StageInput<'_>, mesh: &VisibleMesh) -> Result<()> {
        accumulate(ctx, mesh, &self.shaders, AccumulationTarget::Point, ShadowSource::LightDepth, ClearValue::NONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bake::{AtlasBinding, BakePass};
    use glam::Vec3;
    use crate::device::{HeadlessDevice, RenderTargetDesc};
    use crate::mesh::{MeshBuffer, VertexAttributes};
    use crate::renderer::{FrameState, ShadowDepthCache};
    use crate::scene::SceneView;

    #[test]
    fn directional_accumulation_draws_only_the_current_entry() {
        let mut library = ShaderLibrary::with_builtins();
        let lit = library.register("Lit", |_| {});
        let glass = library.register("Glass", |info| info.opaque = false);
        let cube = Arc::new(MeshBuffer::cube(1.0, 0));
        let other = Arc::new(MeshBuffer::cube(2.0, 0));
        let meshes = vec![
            VisibleMesh::new(Arc::clone(&cube), Some(Arc::new(Material::new("a", Arc::clone(&lit)))), Mat4::IDENTITY),
            VisibleMesh::new(Arc::clone(&other), Some(Arc::new(Material::new("b", lit))), Mat4::IDENTITY),
            VisibleMesh::new(Arc::clone(&cube), Some(Arc::new(Material::new("c", glass))), Mat4::IDENTITY),
        ];
        let light = Light::directional(Vec3::new(0.2, -1.0, 0.3));
        let lights = vec![light.clone()];

        let mut device = HeadlessDevice::default();
        let direct = device.create_render_target(&RenderTargetDesc::new_2d("direct", 16, TargetFormat::Rgba8)).expect("direct");
        let point = device.create_render_target(&RenderTargetDesc::new_2d("point", 16, TargetFormat::Rgba8)).expect("point");
        let slots = [AtlasBinding { slot: 0, sub_mesh: &cube, direct, point }];
        let pass = BakePass {
            light: &light,
            bound: cube.bounds(),
            render_mesh: &cube,
            normal_map: None,
            slots: &slots,
            bake_in_uv0: false,
            detail_normal: false,
            bake_size: 16,
        };

        let config = ShadowConfig::default();
        let mut shadow = BakeShadowStage::new(64, &config, &library).expect("shadow");
        let mut directional = DirectionalLightBakeStage::new(0.0004, &library).expect("accumulate");
        let camera = Camera3D::new(Vec3::splat(2.0), Vec3::ZERO, 1.0, 0.1, 50.0);
        let mut frame = FrameState::bake();
        let mut cache = ShadowDepthCache::new(16);
        let mut ctx = StageContext { device: &mut device, frame: &mut frame, shadow_cache: &mut cache, bake: Some(&pass) };
        let input = StageInput::new(RenderTargetBinding::Texture(direct), Some(&camera), SceneView::new(&meshes, &lights), Viewport::square(16));
        shadow.render(&mut ctx, &input).expect("shadow");
        directional.render(&mut ctx, &input).expect("accumulate");

        let bake_shader = library.require(shader_names::BAKE_DIRECTIONAL).expect("id");
        assert_eq!(device.draws_with_shader(bake_shader), 1);
        assert_eq!(device.draws_into(point), 0);
        assert!(frame.shadow_depth_texture().is_some());
        assert!((frame.shadow_bias() - crate::renderer::frame::DEFAULT_SHADOW_BIAS).abs() < f32::EPSILON);
    }
}
