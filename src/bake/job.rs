use anyhow::{anyhow, Result};
use glam::Mat4;
use std::sync::Arc;

use crate::config::BakeConfig;
use crate::device::TextureHandle;
use crate::light::Light;
use crate::mesh::{Aabb, MeshBuffer};
use crate::scene::{Material, SceneNode, VisibleMesh};

/// One static mesh-buffer to bake.
#[derive(Debug, Clone)]
pub struct BakeEntry {
    pub mesh: Arc<MeshBuffer>,
    pub material: Arc<Material>,
    pub world: Mat4,
    pub normal_map: Option<TextureHandle>,
}

impl BakeEntry {
    pub fn new(mesh: Arc<MeshBuffer>, material: Arc<Material>, world: Mat4) -> Self {
        let normal_map = material.normal_map();
        Self { mesh, material, world, normal_map }
    }

    pub fn world_bounds(&self) -> Aabb {
        self.mesh.bounds().transformed(&self.world)
    }

    pub fn as_visible(&self) -> VisibleMesh {
        VisibleMesh::new(Arc::clone(&self.mesh), Some(Arc::clone(&self.material)), self.world)
    }
}

/// Ordered entries and lights of one bake session, with a forward-only cursor.
#[derive(Debug, Clone, Default)]
pub struct BakeJob {
    entries: Vec<BakeEntry>,
    lights: Vec<Light>,
    cursor: usize,
}

impl BakeJob {
    pub fn new(entries: Vec<BakeEntry>, lights: Vec<Light>) -> Self {
        Self { entries, lights, cursor: 0 }
    }

    /// Gathers static, unskinned geometry and enabled baked/mixed lights under `target` (or the whole
    /// tree when `target` is `None` or `bake_all` is set).
    pub fn collect(root: &SceneNode, target: Option<&str>, config: &BakeConfig) -> Result<Self> {
        let subtree = match target {
            Some(name) if !config.bake_all => root.find(name).ok_or_else(|| anyhow!("Bake target '{name}' not found"))?,
            _ => root,
        };
        let mut entries = Vec::new();
        let mut lights = Vec::new();
        subtree.visit(&mut |node| {
            lights.extend(
                node.lights.iter().filter(|light| light.enabled && light.visible && light.class.contributes_to_bake()).cloned(),
            );
            if !node.is_static {
                return;
            }
            for renderable in &node.renderables {
                let mesh = &renderable.mesh;
                if mesh.is_skinned() || mesh.vertices.is_empty() || mesh.indices.is_empty() {
                    continue;
                }
                let Some(material) = renderable.material.as_ref() else {
                    continue;
                };
                entries.push(BakeEntry::new(Arc::clone(mesh), Arc::clone(material), node.world));
            }
        });
        log::debug!("[bake] Collected {} entries and {} lights under '{}'", entries.len(), lights.len(), subtree.name);
        Ok(Self::new(entries, lights))
    }

    pub fn entries(&self) -> &[BakeEntry] {
        &self.entries
    }

    pub fn lights(&self) -> &[Light] {
        &self.lights
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn current(&self) -> Option<&BakeEntry> {
        self.entries.get(self.cursor)
    }

    pub fn advance(&mut self) {
        if self.cursor < self.entries.len() {
            self.cursor += 1;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.entries.len()
    }
}
