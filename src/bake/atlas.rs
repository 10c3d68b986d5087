use super::MAX_LIGHTMAP_ATLAS;
use crate::mesh::MeshBuffer;

/// Triangles of one mesh-buffer grouped by lightmap atlas slot. Sub-meshes share the source vertices.
#[derive(Debug, Clone)]
pub struct AtlasPartition {
    slots: [Option<MeshBuffer>; MAX_LIGHTMAP_ATLAS],
    dropped: usize,
}

impl Default for AtlasPartition {
    fn default() -> Self {
        Self { slots: std::array::from_fn(|_| None), dropped: 0 }
    }
}

impl AtlasPartition {
    pub fn slot(&self, slot: usize) -> Option<&MeshBuffer> {
        self.slots.get(slot).and_then(|mesh| mesh.as_ref())
    }

    /// Non-empty slots in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &MeshBuffer)> + '_ {
        self.slots.iter().enumerate().filter_map(|(slot, mesh)| mesh.as_ref().map(|mesh| (slot, mesh)))
    }

    /// Number of slots that need an accumulation target.
    pub fn target_count(&self) -> usize {
        self.slots.iter().filter(|mesh| mesh.is_some()).count()
    }

    pub fn triangle_count(&self) -> usize {
        self.iter().map(|(_, mesh)| mesh.indices.triangle_count()).sum()
    }

    /// Triangles whose atlas index was outside `0..atlas_count`.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn is_empty(&self) -> bool {
        self.target_count() == 0
    }
}

/// Splits `mesh` by the atlas index stored on each triangle's first vertex. Meshes without a
/// lightmap channel produce an empty partition.
pub fn partition_by_atlas(mesh: &MeshBuffer, atlas_count: usize) -> AtlasPartition {
    let mut partition = AtlasPartition::default();
    if !mesh.has_lightmap_channel() {
        return partition;
    }
    let atlas_count = atlas_count.min(MAX_LIGHTMAP_ATLAS);
    for triangle in mesh.indices.triangles() {
        let Some(vertex) = mesh.vertices.get(triangle[0] as usize) else {
            partition.dropped += 1;
            continue;
        };
        let index = vertex.atlas_index();
        if index < 0 || index as usize >= atlas_count {
            partition.dropped += 1;
            continue;
        }
        partition.slots[index as usize].get_or_insert_with(|| mesh.share_vertices()).indices.push_triangle(triangle);
    }
    partition
}

/// Treats the whole buffer as atlas slot 0, for baking into the primary UV channel.
pub fn whole_mesh(mesh: &MeshBuffer) -> AtlasPartition {
    let mut partition = AtlasPartition::default();
    if !mesh.indices.is_empty() {
        partition.slots[0] = Some(mesh.clone());
    }
    partition
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{IndexBuffer, MeshVertex, VertexAttributes};
    use glam::{Vec2, Vec3, Vec4};

    fn vertex(atlas: i32) -> MeshVertex {
        MeshVertex::new(Vec3::ZERO, Vec3::Y, Vec4::X, Vec2::ZERO).with_lightmap(Vec2::ZERO, atlas)
    }

    #[test]
    fn out_of_range_indices_are_dropped() {
        let vertices = vec![vertex(0), vertex(0), vertex(0), vertex(5), vertex(5), vertex(5), vertex(-1), vertex(-1), vertex(-1)];
        let indices = IndexBuffer::U32(vec![0, 1, 2, 3, 4, 5, 6, 7, 8]);
        let mesh = MeshBuffer::new(vertices, indices, VertexAttributes::TWO_TEXCOORDS);
        let partition = partition_by_atlas(&mesh, 4);
        assert_eq!(partition.target_count(), 1);
        assert_eq!(partition.triangle_count(), 1);
        assert_eq!(partition.dropped(), 2);
        assert!(partition.slot(5).is_none());
    }

    #[test]
    fn meshes_without_lightmap_channel_are_empty() {
        let mesh = MeshBuffer::plane(1.0, VertexAttributes::STANDARD);
        assert!(partition_by_atlas(&mesh, MAX_LIGHTMAP_ATLAS).is_empty());
        let whole = whole_mesh(&mesh);
        assert_eq!(whole.triangle_count(), mesh.indices.triangle_count());
        assert!(whole.slot(0).is_some());
    }
}
