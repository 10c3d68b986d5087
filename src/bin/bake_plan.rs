use anyhow::{Context, Result};
use glam::{Mat4, Quat, Vec2, Vec3};
use kestrel_lightbake::bake::{BakeJob, BakeState, LightBakeOrchestrator};
use kestrel_lightbake::cli::CliOverrides;
use kestrel_lightbake::config::PipelineConfig;
use kestrel_lightbake::device::HeadlessDevice;
use kestrel_lightbake::light::{Light, RenderLightClass};
use kestrel_lightbake::mesh::{MeshBuffer, VertexAttributes};
use kestrel_lightbake::scene::{Material, SceneNode, ShaderLibrary};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::Arc;

const DEFAULT_CONFIG_PATH: &str = "config/lightbake.json";
/// Upper bound on orchestrator ticks; a session needs entries + 2.
const MAX_TICKS: usize = 1 << 20;

#[derive(Debug, Deserialize)]
struct SceneFile {
    #[serde(default)]
    target: Option<String>,
    root: NodeFile,
}

#[derive(Debug, Deserialize)]
struct NodeFile {
    name: String,
    #[serde(default)]
    translation: Vec3,
    #[serde(default = "default_static")]
    is_static: bool,
    #[serde(default)]
    meshes: Vec<MeshFile>,
    #[serde(default)]
    lights: Vec<LightFile>,
    #[serde(default)]
    children: Vec<NodeFile>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
enum MeshFile {
    Cube { size: f32, #[serde(default)] atlas: i32 },
    Plane { size: f32, #[serde(default)] lightmap: bool },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LightShape {
    Directional { direction: Vec3 },
    Point { position: Vec3, radius: f32 },
    Spot { position: Vec3, direction: Vec3, radius: f32, outer_angle: f32 },
    Area { position: Vec3, #[serde(default)] rotation: Option<Quat>, half_extents: Vec2, radius: f32 },
}

#[derive(Debug, Deserialize)]
struct LightFile {
    #[serde(flatten)]
    shape: LightShape,
    #[serde(default = "default_class")]
    class: RenderLightClass,
    #[serde(default)]
    bake_bounce: Option<u32>,
    #[serde(default)]
    color: Option<Vec3>,
}

fn default_static() -> bool {
    true
}

fn default_class() -> RenderLightClass {
    RenderLightClass::Baked
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:?}");
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = CliOverrides::parse_from_env()?;
    let config_path = cli.config_path().cloned().unwrap_or_else(|| DEFAULT_CONFIG_PATH.into());
    let scene_path = cli.scene_path().cloned();
    let mut config = PipelineConfig::load_or_default(&config_path);
    let overrides = cli.into_config_overrides();
    config.apply_overrides(&overrides);

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log.filter.as_str())).init();
    if !overrides.is_empty() {
        log::info!("[config] CLI overrides applied: {}", overrides.applied_fields().join(", "));
    }

    let Some(scene_path) = scene_path else {
        print_usage();
        return Ok(());
    };
    let mut shaders = ShaderLibrary::with_builtins();
    let scene = load_scene(&scene_path)?;
    let root = build_node(&scene.root, Mat4::IDENTITY, &mut shaders);
    let job = BakeJob::collect(&root, scene.target.as_deref(), &config.bake)?;

    let mut device = HeadlessDevice::default();
    let mut orchestrator = LightBakeOrchestrator::new(config.bake.clone(), &config.shadow, &shaders)?;
    orchestrator.start(&mut device, job);
    for _ in 0..MAX_TICKS {
        if orchestrator.state() == BakeState::Done {
            break;
        }
        let progress = orchestrator.update(&mut device)?;
        log::debug!("[bake] {:?} {}/{}", orchestrator.state(), progress.position, progress.total);
    }
    println!("{}", serde_json::to_string_pretty(orchestrator.summary())?);
    Ok(())
}

fn print_usage() {
    eprintln!(
        "Bake Plan

Usage:
  bake_plan --scene <scene.json> [--config <config.json>] [--output <folder>]
            [--size <pixels>] [--uv0 on|off] [--cascades <2|3>]

Bakes every static mesh of the scene against its baked and mixed lights and
writes one PNG lightmap per atlas slot.
"
    );
}

fn load_scene(path: &Path) -> Result<SceneFile> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read scene file {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse scene file {}", path.display()))
}

fn build_node(file: &NodeFile, parent: Mat4, shaders: &mut ShaderLibrary) -> SceneNode {
    let world = parent * Mat4::from_translation(file.translation);
    let material = Arc::new(Material::new(format!("{}_material", file.name), shaders.register("Lit", |_| {})));
    let mut node = SceneNode::new(file.name.clone()).with_world(world).with_static(file.is_static);
    for mesh in &file.meshes {
        let buffer = match *mesh {
            MeshFile::Cube { size, atlas } => MeshBuffer::cube(size, atlas),
            MeshFile::Plane { size, lightmap: true } => MeshBuffer::plane(size, VertexAttributes::TWO_TEXCOORDS),
            MeshFile::Plane { size, lightmap: false } => MeshBuffer::plane(size, VertexAttributes::STANDARD),
        };
        node = node.with_renderable(Arc::new(buffer), Some(Arc::clone(&material)));
    }
    for light in &file.lights {
        node = node.with_light(build_light(light));
    }
    for child in &file.children {
        node = node.with_child(build_node(child, world, shaders));
    }
    node
}

fn build_light(file: &LightFile) -> Light {
    let mut light = match file.shape {
        LightShape::Directional { direction } => Light::directional(direction),
        LightShape::Point { position, radius } => Light::point(position, radius),
        LightShape::Spot { position, direction, radius, outer_angle } => {
            Light::spot(position, direction, radius, outer_angle)
        }
        LightShape::Area { position, rotation, half_extents, radius } => {
            Light::area(position, rotation.unwrap_or(Quat::IDENTITY), half_extents, radius)
        }
    }
    .with_class(file.class);
    if let Some(bounce) = file.bake_bounce {
        light.bake_bounce = bounce;
    }
    if let Some(color) = file.color {
        light.color = color;
    }
    light
}
