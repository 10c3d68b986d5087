use glam::{Mat4, Vec3};
use kestrel_lightbake::camera3d::{Camera3D, Viewport};
use kestrel_lightbake::config::ShadowConfig;
use kestrel_lightbake::device::{DeviceCommand, HeadlessDevice, RenderTargetBinding};
use kestrel_lightbake::light::{Light, RenderLightClass};
use kestrel_lightbake::mesh::{MeshBuffer, VertexAttributes};
use kestrel_lightbake::renderer::{
    FrameState, LightingStage, PipelineChain, RenderStage, ShadowDepthCache, ShadowRenderStage, StageContext, StageInput,
    StageKind,
};
use kestrel_lightbake::scene::{Material, SceneView, ShaderLibrary, VisibleMesh};
use std::sync::Arc;

fn scene_meshes(library: &mut ShaderLibrary) -> Vec<VisibleMesh> {
    let lit = library.register("Lit", |_| {});
    let material = Arc::new(Material::new("ground", lit));
    vec![
        VisibleMesh::new(Arc::new(MeshBuffer::plane(20.0, VertexAttributes::STANDARD)), Some(Arc::clone(&material)), Mat4::IDENTITY),
        VisibleMesh::new(Arc::new(MeshBuffer::cube(1.0, 0)), Some(material), Mat4::from_translation(Vec3::new(0.0, 0.5, 0.0))),
    ]
}

fn forward_stages(config: &ShadowConfig, library: &ShaderLibrary) -> Vec<Box<dyn RenderStage>> {
    vec![
        Box::new(ShadowRenderStage::new(config, library).expect("shadow")),
        Box::new(LightingStage::new(config, library).expect("lighting")),
    ]
}

fn camera() -> Camera3D {
    Camera3D::new(Vec3::new(0.0, 6.0, 12.0), Vec3::ZERO, 60.0f32.to_radians(), 0.1, 200.0)
}

#[test]
fn baked_lights_never_reach_the_depth_cache_outside_bake_mode() {
    let mut library = ShaderLibrary::with_builtins();
    let meshes = scene_meshes(&mut library);
    let baked_point = Light::point(Vec3::new(2.0, 3.0, 0.0), 8.0).with_class(RenderLightClass::Baked);
    let baked_spot = Light::spot(Vec3::new(0.0, 5.0, 0.0), Vec3::NEG_Y, 10.0, 0.7).with_class(RenderLightClass::Baked);
    let mixed_point = Light::point(Vec3::new(-2.0, 3.0, 0.0), 8.0).with_class(RenderLightClass::Mixed);
    let lights = vec![baked_point.clone(), baked_spot.clone(), mixed_point.clone()];

    let mut stage = ShadowRenderStage::new(&ShadowConfig::default(), &library).expect("stage");
    let mut device = HeadlessDevice::default();
    let mut frame = FrameState::new();
    let mut cache = ShadowDepthCache::new(64);
    let camera = camera();
    for _ in 0..3 {
        let mut ctx = StageContext { device: &mut device, frame: &mut frame, shadow_cache: &mut cache, bake: None };
        let input = StageInput::new(RenderTargetBinding::Screen, Some(&camera), SceneView::new(&meshes, &lights), Viewport::new(64.0, 64.0));
        stage.render(&mut ctx, &input).expect("render");
    }

    assert!(cache.entry(baked_point.id).is_none());
    assert!(cache.entry(baked_spot.id).is_none());
    assert!(cache.entry(mixed_point.id).is_some());
    assert_eq!(cache.len(), 1);
    assert!(frame.light_shadow(baked_point.id).is_none());
}

#[test]
fn exhausted_device_skips_the_light_and_keeps_rendering() {
    let mut library = ShaderLibrary::with_builtins();
    let meshes = scene_meshes(&mut library);
    let sun = Light::directional(Vec3::new(0.3, -1.0, 0.2));
    let first = Light::point(Vec3::new(2.0, 3.0, 0.0), 8.0);
    let second = Light::point(Vec3::new(-2.0, 3.0, 0.0), 8.0);
    let lights = vec![sun, first.clone(), second.clone()];

    let mut stage = ShadowRenderStage::new(&ShadowConfig::default(), &library).expect("stage");
    // cascade array + one cube target
    let mut device = HeadlessDevice::default().with_target_limit(2);
    let mut frame = FrameState::new();
    let mut cache = ShadowDepthCache::new(64);
    let camera = camera();
    let mut ctx = StageContext { device: &mut device, frame: &mut frame, shadow_cache: &mut cache, bake: None };
    let input = StageInput::new(RenderTargetBinding::Screen, Some(&camera), SceneView::new(&meshes, &lights), Viewport::new(64.0, 64.0));
    stage.render(&mut ctx, &input).expect("render survives exhaustion");

    let metrics = stage.metrics();
    assert_eq!(metrics.cascades, 3);
    assert_eq!(metrics.lights_rendered, 1);
    assert_eq!(metrics.lights_skipped, 1);
    assert!(cache.entry(first.id).is_some());
    assert!(cache.entry(second.id).is_none());
    assert!(frame.shadow().is_some());
    assert_eq!(device.live_textures(), 2);
}

#[test]
fn cached_static_lights_render_once() {
    let mut library = ShaderLibrary::with_builtins();
    let meshes = scene_meshes(&mut library);
    let lights = vec![Light::point(Vec3::new(0.0, 3.0, 0.0), 8.0), Light::point(Vec3::ONE, 6.0).with_dynamic_shadow(true)];

    let mut stage = ShadowRenderStage::new(&ShadowConfig::default(), &library).expect("stage");
    let mut device = HeadlessDevice::default();
    let mut frame = FrameState::new();
    let mut cache = ShadowDepthCache::new(64);
    let camera = camera();
    let mut rendered = Vec::new();
    for _ in 0..2 {
        let mut ctx = StageContext { device: &mut device, frame: &mut frame, shadow_cache: &mut cache, bake: None };
        let input = StageInput::new(RenderTargetBinding::Screen, Some(&camera), SceneView::new(&meshes, &lights), Viewport::new(64.0, 64.0));
        stage.render(&mut ctx, &input).expect("render");
        rendered.push((stage.metrics().lights_rendered, stage.metrics().lights_cached));
    }
    assert_eq!(rendered, vec![(2, 0), (1, 1)]);
}

#[test]
fn chain_runs_shadow_before_lighting_and_returns_to_the_screen() {
    let mut library = ShaderLibrary::with_builtins();
    let meshes = scene_meshes(&mut library);
    let lights = vec![Light::directional(Vec3::new(0.3, -1.0, 0.2)), Light::point(Vec3::new(0.0, 3.0, 0.0), 8.0)];
    let config = ShadowConfig::default();
    let mut chain = PipelineChain::from_stages(forward_stages(&config, &library));
    assert_eq!(chain.order(), vec![StageKind::Shadow, StageKind::Lighting]);

    let mut device = HeadlessDevice::default();
    let mut frame = FrameState::new();
    let mut cache = ShadowDepthCache::new(64);
    let camera = camera();
    let mut ctx = StageContext { device: &mut device, frame: &mut frame, shadow_cache: &mut cache, bake: None };
    let input = StageInput::new(RenderTargetBinding::Screen, Some(&camera), SceneView::new(&meshes, &lights), Viewport::new(64.0, 64.0));
    let report = chain.render(&mut ctx, &input).expect("chain");

    assert_eq!(report.executed.as_slice(), &[StageKind::Shadow, StageKind::Lighting]);
    assert!(!report.stopped_early);
    let first_screen_draw = device
        .commands()
        .iter()
        .position(|cmd| matches!(cmd, DeviceCommand::Draw { target: RenderTargetBinding::Screen, .. }))
        .expect("lighting draws to the screen");
    let last_depth_draw = device
        .commands()
        .iter()
        .rposition(|cmd| matches!(cmd, DeviceCommand::Draw { target, .. } if *target != RenderTargetBinding::Screen))
        .expect("shadow draws into depth targets");
    assert!(last_depth_draw < first_screen_draw);
}

#[test]
fn chain_without_camera_stops_at_the_first_stage() {
    let library = ShaderLibrary::with_builtins();
    let config = ShadowConfig::default();
    let mut chain = PipelineChain::from_stages(forward_stages(&config, &library));
    let mut device = HeadlessDevice::default();
    let mut frame = FrameState::new();
    let mut cache = ShadowDepthCache::new(64);
    let mut ctx = StageContext { device: &mut device, frame: &mut frame, shadow_cache: &mut cache, bake: None };
    let input = StageInput::new(RenderTargetBinding::Screen, None, SceneView::new(&[], &[]), Viewport::new(64.0, 64.0));
    let report = chain.render(&mut ctx, &input).expect("chain");
    assert_eq!(report.executed.as_slice(), &[StageKind::Shadow]);
    assert!(report.stopped_early);
    assert!(device.commands().is_empty());
}
