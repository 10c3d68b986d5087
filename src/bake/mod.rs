//! Incremental lightmap baking.
//!
//! A [`BakeJob`] lists the static mesh-buffers and baked/mixed lights under a target node. The
//! [`LightBakeOrchestrator`] consumes one entry per `update` call, splitting the entry's triangles by
//! lightmap atlas slot and running a private shadow → accumulation chain per light. When the job is
//! exhausted it composites each atlas slot and writes one image per slot.

pub mod atlas;
pub mod job;
pub mod orchestrator;
pub mod stages;

use std::sync::Arc;

use crate::device::TextureHandle;
use crate::light::Light;
use crate::mesh::{Aabb, MeshBuffer};

pub use atlas::{partition_by_atlas, whole_mesh, AtlasPartition};
pub use job::{BakeEntry, BakeJob};
pub use orchestrator::{bake_camera, BakeProgress, BakeState, BakeSummary, EntryReport, LightBakeOrchestrator};
pub use stages::{
    AreaLightBakeStage, BakeShadowStage, DirectionalLightBakeStage, PointLightBakeStage, PointShadowBakeStage,
};

/// Number of lightmap atlas textures a bake can write.
pub const MAX_LIGHTMAP_ATLAS: usize = 8;

/// Accumulation targets and triangles of one atlas slot for the entry being baked.
#[derive(Debug, Clone, Copy)]
pub struct AtlasBinding<'a> {
    pub slot: usize,
    pub sub_mesh: &'a MeshBuffer,
    /// Directional light accumulation.
    pub direct: TextureHandle,
    /// Point, spot and area light accumulation.
    pub point: TextureHandle,
}

/// Everything the bake stages need for one light of one entry.
#[derive(Debug, Clone, Copy)]
pub struct BakePass<'a> {
    pub light: &'a Light,
    /// World bounds of the entry being baked.
    pub bound: Aabb,
    /// Identity of the entry's mesh among the casters handed to the chain.
    pub render_mesh: &'a Arc<MeshBuffer>,
    pub normal_map: Option<TextureHandle>,
    pub slots: &'a [AtlasBinding<'a>],
    pub bake_in_uv0: bool,
    pub detail_normal: bool,
    pub bake_size: u32,
}
