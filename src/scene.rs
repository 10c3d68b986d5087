use anyhow::{anyhow, Result};
use glam::Mat4;
use std::collections::HashMap;
use std::sync::Arc;

use crate::device::TextureHandle;
use crate::light::{Light, LightId, LightKind};
use crate::mesh::{Aabb, MeshBuffer};

pub const MATERIAL_TEXTURE_SLOTS: usize = 4;
/// Texture slot holding the detail normal map.
pub const NORMAL_MAP_SLOT: usize = 1;

/// Names of the shaders the pipeline resolves at stage construction.
pub mod shader_names {
    pub const SHADOW_DEPTH_WRITE: &str = "ShadowDepthWrite";
    pub const SHADOW_DEPTH_WRITE_SKIN: &str = "ShadowDepthWriteSkinMesh";
    pub const SHADOW_DISTANCE_WRITE: &str = "ShadowLightDistanceWrite";
    pub const SHADOW_DISTANCE_WRITE_SKIN: &str = "ShadowLightDistanceWriteSkinMesh";
    pub const TEXTURE_COLOR: &str = "TextureColor";
    pub const POINT_LIGHT: &str = "PointLight";
    pub const POINT_LIGHT_SHADOW: &str = "PointLightShadow";
    pub const SPOT_LIGHT: &str = "SpotLight";
    pub const SPOT_LIGHT_SHADOW: &str = "SpotLightShadow";
    pub const AREA_LIGHT: &str = "AreaLight";
    pub const AREA_LIGHT_SHADOW: &str = "AreaLightShadow";
    pub const BAKE_DIRECTIONAL: &str = "BakeDirectionalLight";
    pub const BAKE_DIRECTIONAL_UV0: &str = "BakeDirectionalLightUV0";
    pub const BAKE_DIRECTIONAL_NORMAL: &str = "BakeDirectionalLightNormal";
    pub const BAKE_DIRECTIONAL_UV0_NORMAL: &str = "BakeDirectionalLightUV0Normal";
    pub const BAKE_AREA: &str = "BakeAreaLight";
    pub const BAKE_AREA_UV0: &str = "BakeAreaLightUV0";
    pub const BAKE_AREA_NORMAL: &str = "BakeAreaLightNormal";
    pub const BAKE_AREA_UV0_NORMAL: &str = "BakeAreaLightUV0Normal";
    pub const BAKE_POINT: &str = "BakePointLight";
    pub const BAKE_FINAL: &str = "BakeFinal";
    pub const BAKE_FINAL_NO_DIRECTION_LIGHT: &str = "BakeFinalNoDirectionLight";

    pub const BUILTIN: &[&str] = &[
        SHADOW_DEPTH_WRITE,
        SHADOW_DEPTH_WRITE_SKIN,
        SHADOW_DISTANCE_WRITE,
        SHADOW_DISTANCE_WRITE_SKIN,
        TEXTURE_COLOR,
        POINT_LIGHT,
        POINT_LIGHT_SHADOW,
        SPOT_LIGHT,
        SPOT_LIGHT_SHADOW,
        AREA_LIGHT,
        AREA_LIGHT_SHADOW,
        BAKE_DIRECTIONAL,
        BAKE_DIRECTIONAL_UV0,
        BAKE_DIRECTIONAL_NORMAL,
        BAKE_DIRECTIONAL_UV0_NORMAL,
        BAKE_AREA,
        BAKE_AREA_UV0,
        BAKE_AREA_NORMAL,
        BAKE_AREA_UV0_NORMAL,
        BAKE_POINT,
        BAKE_FINAL,
        BAKE_FINAL_NO_DIRECTION_LIGHT,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderId(pub u32);

/// Capabilities of a shader as seen by the pipeline stages.
#[derive(Debug, Clone)]
pub struct ShaderInfo {
    pub id: ShaderId,
    pub name: String,
    pub deferred: bool,
    pub opaque: bool,
    pub draws_depth_shadow: bool,
    /// Replacement shader for directional/area depth passes.
    pub depth_write: Option<ShaderId>,
    /// Replacement shader for point-light distance passes.
    pub distance_write: Option<ShaderId>,
}

impl ShaderInfo {
    pub fn new(id: ShaderId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            deferred: false,
            opaque: true,
            draws_depth_shadow: true,
            depth_write: None,
            distance_write: None,
        }
    }
}

/// Name to shader lookup handed to stages at construction.
#[derive(Debug, Default)]
pub struct ShaderLibrary {
    shaders: Vec<Arc<ShaderInfo>>,
    by_name: HashMap<String, ShaderId>,
}

impl ShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut library = Self::new();
        for name in shader_names::BUILTIN {
            library.register(name, |_| {});
        }
        library
    }

    /// Registers `name` (or returns the existing entry) and lets the caller adjust its capabilities.
    pub fn register(&mut self, name: &str, configure: impl FnOnce(&mut ShaderInfo)) -> Arc<ShaderInfo> {
        if let Some(id) = self.by_name.get(name).copied() {
            let slot = &mut self.shaders[id.0 as usize];
            configure(Arc::make_mut(slot));
            return Arc::clone(slot);
        }
        let id = ShaderId(self.shaders.len() as u32);
        let mut info = ShaderInfo::new(id, name);
        configure(&mut info);
        let info = Arc::new(info);
        self.shaders.push(Arc::clone(&info));
        self.by_name.insert(name.to_string(), id);
        info
    }

    pub fn id(&self, name: &str) -> Option<ShaderId> {
        self.by_name.get(name).copied()
    }

    /// Id of a shader a stage cannot work without.
    pub fn require(&self, name: &str) -> Result<ShaderId> {
        self.id(name).ok_or_else(|| anyhow!("Shader '{name}' is not registered"))
    }

    pub fn get(&self, name: &str) -> Option<Arc<ShaderInfo>> {
        self.id(name).and_then(|id| self.info(id))
    }

    pub fn info(&self, id: ShaderId) -> Option<Arc<ShaderInfo>> {
        self.shaders.get(id.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Material {
    pub name: String,
    pub shader: Arc<ShaderInfo>,
    pub textures: [Option<TextureHandle>; MATERIAL_TEXTURE_SLOTS],
}

impl Material {
    pub fn new(name: impl Into<String>, shader: Arc<ShaderInfo>) -> Self {
        Self { name: name.into(), shader, textures: [None; MATERIAL_TEXTURE_SLOTS] }
    }

    pub fn with_texture(mut self, slot: usize, texture: TextureHandle) -> Self {
        if let Some(dst) = self.textures.get_mut(slot) {
            *dst = Some(texture);
        }
        self
    }

    pub fn normal_map(&self) -> Option<TextureHandle> {
        self.textures[NORMAL_MAP_SLOT]
    }
}

/// One culled mesh-buffer as supplied by the scene graph.
#[derive(Debug, Clone)]
pub struct VisibleMesh {
    pub mesh: Arc<MeshBuffer>,
    pub material: Option<Arc<Material>>,
    pub world: Mat4,
    pub is_static: bool,
}

impl VisibleMesh {
    pub fn new(mesh: Arc<MeshBuffer>, material: Option<Arc<Material>>, world: Mat4) -> Self {
        Self { mesh, material, world, is_static: true }
    }

    pub fn is_skinned(&self) -> bool {
        self.mesh.is_skinned()
    }

    pub fn world_bounds(&self) -> Aabb {
        self.mesh.bounds().transformed(&self.world)
    }
}

/// Per-frame view of the scene: visible geometry, lights in culling order, and the light picked to
/// drive cascaded shadows.
#[derive(Debug, Clone, Copy)]
pub struct SceneView<'a> {
    pub meshes: &'a [VisibleMesh],
    pub lights: &'a [Light],
    pub main_shadow_light: Option<LightId>,
}

impl<'a> SceneView<'a> {
    pub fn new(meshes: &'a [VisibleMesh], lights: &'a [Light]) -> Self {
        Self { meshes, lights, main_shadow_light: None }
    }

    pub fn with_main_shadow_light(mut self, id: LightId) -> Self {
        self.main_shadow_light = Some(id);
        self
    }

    pub fn light(&self, id: LightId) -> Option<&'a Light> {
        self.lights.iter().find(|light| light.id == id)
    }

    /// The designated main light, else the first directional light.
    pub fn shadow_light(&self) -> Option<&'a Light> {
        self.main_shadow_light
            .and_then(|id| self.light(id))
            .or_else(|| self.lights.iter().find(|light| matches!(light.kind, LightKind::Directional { .. })))
    }
}

/// Mesh-buffer and material attached to a scene node.
#[derive(Debug, Clone)]
pub struct Renderable {
    pub mesh: Arc<MeshBuffer>,
    pub material: Option<Arc<Material>>,
}

/// Minimal scene-graph node: world-space transform, static flag, geometry and lights, children.
#[derive(Debug, Clone)]
pub struct SceneNode {
    pub name: String,
    pub world: Mat4,
    pub is_static: bool,
    pub renderables: Vec<Renderable>,
    pub lights: Vec<Light>,
    pub children: Vec<SceneNode>,
}

impl SceneNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            world: Mat4::IDENTITY,
            is_static: true,
            renderables: Vec::new(),
            lights: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_world(mut self, world: Mat4) -> Self {
        self.world = world;
        self
    }

    pub fn with_static(mut self, is_static: bool) -> Self {
        self.is_static = is_static;
        self
    }

    pub fn with_renderable(mut self, mesh: Arc<MeshBuffer>, material: Option<Arc<Material>>) -> Self {
        self.renderables.push(Renderable { mesh, material });
        self
    }

    pub fn with_light(mut self, light: Light) -> Self {
        self.lights.push(light);
        self
    }

    pub fn with_child(mut self, child: SceneNode) -> Self {
        self.children.push(child);
        self
    }

    /// Depth-first search by name, including `self`.
    pub fn find(&self, name: &str) -> Option<&SceneNode> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(name))
    }

    /// Visits `self` and every descendant depth-first.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a SceneNode)) {
        f(self);
        for child in &self.children {
            child.visit(f);
        }
    }

    pub fn visible_meshes(&self) -> Vec<VisibleMesh> {
        let mut meshes = Vec::new();
        self.visit(&mut |node| {
            for renderable in &node.renderables {
                let mut mesh = VisibleMesh::new(Arc::clone(&renderable.mesh), renderable.material.clone(), node.world);
                mesh.is_static = node.is_static;
                meshes.push(mesh);
            }
        });
        meshes
    }

    pub fn collect_lights(&self) -> Vec<Light> {
        let mut lights = Vec::new();
        self.visit(&mut |node| lights.extend(node.lights.iter().cloned()));
        lights
    }
}
