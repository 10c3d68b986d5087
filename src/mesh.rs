use bitflags::bitflags;
use glam::{Mat4, Vec2, Vec3, Vec4};
use std::sync::Arc;

bitflags! {
    /// Vertex channels a mesh-buffer actually carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VertexAttributes: u32 {
        const NORMAL = 1 << 0;
        const TEXCOORD0 = 1 << 1;
        /// Dedicated lightmap channel: `uv` in xy, atlas index in z.
        const LIGHTMAP = 1 << 2;
        const TANGENT = 1 << 3;
        const SKIN = 1 << 4;
    }
}

impl VertexAttributes {
    pub const STANDARD: Self = Self::NORMAL.union(Self::TEXCOORD0);
    pub const TANGENTS: Self = Self::STANDARD.union(Self::TANGENT);
    pub const TWO_TEXCOORDS: Self = Self::STANDARD.union(Self::LIGHTMAP);
    pub const TWO_TEXCOORDS_TANGENTS: Self = Self::TWO_TEXCOORDS.union(Self::TANGENT);
}

#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tangent: [f32; 4],
    pub uv: [f32; 2],
    pub lightmap: [f32; 3],
    pub joints: [u16; 4],
    pub weights: [f32; 4],
}

impl MeshVertex {
    pub fn new(position: Vec3, normal: Vec3, tangent: Vec4, uv: Vec2) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            tangent: tangent.to_array(),
            uv: uv.to_array(),
            lightmap: [0.0; 3],
            joints: [0; 4],
            weights: [0.0; 4],
        }
    }

    pub fn with_lightmap(mut self, uv: Vec2, atlas_index: i32) -> Self {
        self.lightmap = [uv.x, uv.y, atlas_index as f32];
        self
    }

    pub fn with_skin(mut self, joints: [u16; 4], weights: [f32; 4]) -> Self {
        self.joints = joints;
        self.weights = weights;
        self
    }

    pub fn atlas_index(&self) -> i32 {
        self.lightmap[2].round() as i32
    }

    #[cfg(feature = "gpu")]
    pub fn layout<'a>() -> wgpu::VertexBufferLayout<'a> {
        use std::mem;
        const ATTRIBUTES: [wgpu::VertexAttribute; 7] = wgpu::vertex_attr_array![
            0 => Float32x3,
            1 => Float32x3,
            2 => Float32x4,
            3 => Float32x2,
            4 => Float32x3,
            5 => Uint16x4,
            6 => Float32x4,
        ];
        wgpu::VertexBufferLayout {
            array_stride: mem::size_of::<MeshVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &ATTRIBUTES,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexBuffer {
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl IndexBuffer {
    pub fn len(&self) -> usize {
        match self {
            IndexBuffer::U16(indices) => indices.len(),
            IndexBuffer::U32(indices) => indices.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn triangle_count(&self) -> usize {
        self.len() / 3
    }

    pub fn get(&self, index: usize) -> Option<u32> {
        match self {
            IndexBuffer::U16(indices) => indices.get(index).map(|&i| i as u32),
            IndexBuffer::U32(indices) => indices.get(index).copied(),
        }
    }

    pub fn triangle(&self, triangle: usize) -> Option<[u32; 3]> {
        let base = triangle * 3;
        Some([self.get(base)?, self.get(base + 1)?, self.get(base + 2)?])
    }

    pub fn triangles(&self) -> impl Iterator<Item = [u32; 3]> + '_ {
        (0..self.triangle_count()).filter_map(move |tri| self.triangle(tri))
    }

    /// Empty buffer with the same index width.
    pub fn empty_like(&self) -> Self {
        match self {
            IndexBuffer::U16(_) => IndexBuffer::U16(Vec::new()),
            IndexBuffer::U32(_) => IndexBuffer::U32(Vec::new()),
        }
    }

    /// Appends one triangle. Indices come from a buffer of the same width, so they always fit.
    pub fn push_triangle(&mut self, triangle: [u32; 3]) {
        match self {
            IndexBuffer::U16(indices) => indices.extend(triangle.iter().map(|&i| i as u16)),
            IndexBuffer::U32(indices) => indices.extend_from_slice(&triangle),
        }
    }
}

/// Vertex/index data for one drawable segment. Vertex storage is shared so sub-meshes cut from a
/// buffer reference the same vertices.
#[derive(Clone, Debug)]
pub struct MeshBuffer {
    pub vertices: Arc<[MeshVertex]>,
    pub indices: IndexBuffer,
    pub attributes: VertexAttributes,
}

impl MeshBuffer {
    pub fn new(vertices: Vec<MeshVertex>, indices: IndexBuffer, attributes: VertexAttributes) -> Self {
        Self { vertices: vertices.into(), indices, attributes }
    }

    /// Sub-mesh sharing this buffer's vertices with an empty index list.
    pub fn share_vertices(&self) -> Self {
        Self { vertices: Arc::clone(&self.vertices), indices: self.indices.empty_like(), attributes: self.attributes }
    }

    pub fn has_lightmap_channel(&self) -> bool {
        self.attributes.contains(VertexAttributes::LIGHTMAP)
    }

    pub fn has_tangents(&self) -> bool {
        self.attributes.contains(VertexAttributes::TANGENT)
    }

    pub fn is_skinned(&self) -> bool {
        self.attributes.contains(VertexAttributes::SKIN)
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::from_points(self.vertices.iter().map(|v| Vec3::from_array(v.position)))
    }

    /// Unit-UV cube with tangents; every vertex carries `atlas_index` on its lightmap channel.
    pub fn cube(size: f32, atlas_index: i32) -> Self {
        let hs = size * 0.5;
        let positions = [
            Vec3::new(-hs, -hs, -hs),
            Vec3::new(hs, -hs, -hs),
            Vec3::new(hs, hs, -hs),
            Vec3::new(-hs, hs, -hs),
            Vec3::new(-hs, -hs, hs),
            Vec3::new(hs, -hs, hs),
            Vec3::new(hs, hs, hs),
            Vec3::new(-hs, hs, hs),
        ];
        let uv_quad = [Vec2::new(0.0, 0.0), Vec2::new(1.0, 0.0), Vec2::new(1.0, 1.0), Vec2::new(0.0, 1.0)];
        let mut vertices = Vec::with_capacity(24);
        let mut write_face = |indices: [usize; 4], normal: Vec3| {
            for (i, &index) in indices.iter().enumerate() {
                vertices.push(
                    MeshVertex::new(positions[index], normal, Vec4::new(1.0, 0.0, 0.0, 1.0), uv_quad[i])
                        .with_lightmap(uv_quad[i], atlas_index),
                );
            }
        };
        write_face([0, 3, 2, 1], Vec3::NEG_Z);
        write_face([4, 5, 6, 7], Vec3::Z);
        write_face([0, 4, 7, 3], Vec3::NEG_X);
        write_face([1, 2, 6, 5], Vec3::X);
        write_face([3, 7, 6, 2], Vec3::Y);
        write_face([0, 1, 5, 4], Vec3::NEG_Y);

        let mut indices: Vec<u16> = Vec::with_capacity(36);
        for face in 0..6u16 {
            let base = face * 4;
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        compute_tangents(&mut vertices, &indices);
        Self::new(vertices, IndexBuffer::U16(indices), VertexAttributes::TWO_TEXCOORDS_TANGENTS)
    }

    /// Single quad on the XZ plane facing +Y.
    pub fn plane(size: f32, attributes: VertexAttributes) -> Self {
        let hs = size * 0.5;
        let corners = [
            (Vec3::new(-hs, 0.0, -hs), Vec2::new(0.0, 0.0)),
            (Vec3::new(-hs, 0.0, hs), Vec2::new(0.0, 1.0)),
            (Vec3::new(hs, 0.0, hs), Vec2::new(1.0, 1.0)),
            (Vec3::new(hs, 0.0, -hs), Vec2::new(1.0, 0.0)),
        ];
        let vertices = corners
            .iter()
            .map(|&(pos, uv)| MeshVertex::new(pos, Vec3::Y, Vec4::new(1.0, 0.0, 0.0, 1.0), uv))
            .collect();
        Self::new(vertices, IndexBuffer::U16(vec![0, 1, 2, 0, 2, 3]), attributes)
    }
}

fn compute_tangents(vertices: &mut [MeshVertex], indices: &[u16]) {
    if vertices.is_empty() || indices.is_empty() {
        return;
    }
    let mut tan1 = vec![Vec3::ZERO; vertices.len()];
    let mut tan2 = vec![Vec3::ZERO; vertices.len()];

    for tri in indices.chunks_exact(3) {
        let (i0, i1, i2) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
        if i0 >= vertices.len() || i1 >= vertices.len() || i2 >= vertices.len() {
            continue;
        }
        let v0 = Vec3::from_array(vertices[i0].position);
        let delta_pos1 = Vec3::from_array(vertices[i1].position) - v0;
        let delta_pos2 = Vec3::from_array(vertices[i2].position) - v0;
        let uv0 = Vec2::from_array(vertices[i0].uv);
        let delta_uv1 = Vec2::from_array(vertices[i1].uv) - uv0;
        let delta_uv2 = Vec2::from_array(vertices[i2].uv) - uv0;

        let denom = delta_uv1.x * delta_uv2.y - delta_uv1.y * delta_uv2.x;
        if denom.abs() < 1e-8 {
            continue;
        }
        let r = 1.0 / denom;
        let sdir = (delta_pos1 * delta_uv2.y - delta_pos2 * delta_uv1.y) * r;
        let tdir = (delta_pos2 * delta_uv1.x - delta_pos1 * delta_uv2.x) * r;
        for i in [i0, i1, i2] {
            tan1[i] += sdir;
            tan2[i] += tdir;
        }
    }

    for (i, vertex) in vertices.iter_mut().enumerate() {
        let normal = Vec3::from_array(vertex.normal);
        let t1 = tan1[i];
        if t1.length_squared() > 0.0 {
            let tangent = (t1 - normal * normal.dot(t1)).normalize_or_zero();
            let w = if normal.cross(t1).dot(tan2[i]) < 0.0 { -1.0 } else { 1.0 };
            vertex.tangent = [tangent.x, tangent.y, tangent.z, w];
        } else {
            vertex.tangent = [1.0, 0.0, 0.0, 1.0];
        }
    }
}

/// Axis-aligned box. An empty box has `min > max`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Aabb {
    pub const EMPTY: Aabb = Aabb { min: Vec3::splat(f32::INFINITY), max: Vec3::splat(f32::NEG_INFINITY) };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut aabb = Self::EMPTY;
        for point in points {
            aabb.add_point(point);
        }
        aabb
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn add_point(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn merge(&mut self, other: &Aabb) {
        if other.is_empty() {
            return;
        }
        self.add_point(other.min);
        self.add_point(other.max);
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn extent(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    pub fn transformed(&self, transform: &Mat4) -> Aabb {
        if self.is_empty() {
            return *self;
        }
        Aabb::from_points(self.corners().into_iter().map(|corner| transform.transform_point3(corner)))
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.min.cmple(other.max).all()
            && other.min.cmple(self.max).all()
    }
}
