use glam::{Mat4, Vec3, Vec4};
use smallvec::SmallVec;

use super::{MAX_SHADOW_CASCADES, MIN_SHADOW_CASCADES};
use crate::camera3d::Camera3D;
use crate::config::{ShadowConfig, ShadowMode};
use crate::device::Backend;
use crate::mesh::Aabb;

#[derive(Debug, Clone, PartialEq)]
pub struct CascadeSettings {
    pub mode: ShadowMode,
    pub count: usize,
    pub lambda: f32,
    pub shadow_far: f32,
    pub near_offset: f32,
    pub resolution: u32,
    pub fov_padding: f32,
    pub split_padding: f32,
    pub radius_step: f32,
    pub single_near_offset: f32,
    pub single_far: f32,
}

impl Default for CascadeSettings {
    fn default() -> Self {
        Self::from(&ShadowConfig::default())
    }
}

impl From<&ShadowConfig> for CascadeSettings {
    fn from(config: &ShadowConfig) -> Self {
        Self {
            mode: config.mode,
            count: config.effective_cascade_count(),
            lambda: config.split_lambda.clamp(0.0, 1.0),
            shadow_far: config.shadow_far,
            near_offset: config.near_offset,
            resolution: config.resolution.max(1),
            fov_padding: config.fov_padding,
            split_padding: config.split_padding.max(1.0),
            radius_step: config.radius_step,
            single_near_offset: config.single_near_offset,
            single_far: config.single_far,
        }
    }
}

impl CascadeSettings {
    /// Number of depth-array layers the mode renders into.
    pub fn layer_count(&self) -> usize {
        match self.mode {
            ShadowMode::Cascaded => self.count.clamp(MIN_SHADOW_CASCADES, MAX_SHADOW_CASCADES),
            ShadowMode::Single => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CascadeSplit {
    pub near: f32,
    pub far: f32,
    pub fov: f32,
    pub ratio: f32,
    pub corners: [Vec3; 8],
    pub center: Vec3,
    pub radius: f32,
    pub eye: Vec3,
    pub projection: Mat4,
    pub view: Mat4,
    /// bias × projection × view
    pub shadow_matrix: Mat4,
    /// World-space box used to cull casters for this split.
    pub bounds: Aabb,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShadowCascades {
    pub light_direction: Vec3,
    pub splits: SmallVec<[CascadeSplit; MAX_SHADOW_CASCADES]>,
}

impl ShadowCascades {
    pub fn len(&self) -> usize {
        self.splits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }

    /// Biased matrices, one per split. A single split fills every slot up to `slots`.
    pub fn matrices(&self, slots: usize) -> SmallVec<[Mat4; MAX_SHADOW_CASCADES]> {
        match self.splits.as_slice() {
            [only] => (0..slots.max(1)).map(|_| only.shadow_matrix).collect(),
            splits => splits.iter().map(|split| split.shadow_matrix).collect(),
        }
    }

    pub fn distances(&self, slots: usize) -> SmallVec<[f32; MAX_SHADOW_CASCADES]> {
        match self.splits.as_slice() {
            [only] => (0..slots.max(1)).map(|_| only.far).collect(),
            splits => splits.iter().map(|split| split.far).collect(),
        }
    }
}

/// Fits orthographic shadow frusta around slices of the camera frustum.
#[derive(Debug, Clone, Default)]
pub struct FrustumSplitComputer {
    settings: CascadeSettings,
}

impl FrustumSplitComputer {
    pub fn new(settings: CascadeSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CascadeSettings {
        &self.settings
    }

    pub fn compute(&self, camera: &Camera3D, light_direction: Vec3, aspect: f32, backend: Backend) -> ShadowCascades {
        let light_direction = light_direction.normalize_or_zero();
        let s = &self.settings;
        let far = s.shadow_far.min(camera.far).max(camera.near);
        let fov = camera.fov_y_radians + s.fov_padding;
        let mut splits = SmallVec::new();
        match s.mode {
            ShadowMode::Cascaded => {
                for (near, split_far) in split_distances(camera.near, far, s.count, s.lambda, s.split_padding) {
                    let corners = frustum_corners(camera, near, split_far, fov, 1.0);
                    splits.push(self.fit_split(near, split_far, fov, 1.0, corners, light_direction, s.near_offset, 0.0, backend));
                }
            }
            ShadowMode::Single => {
                let ratio = aspect.max(0.0001);
                let corners = frustum_corners(camera, camera.near, far, fov, ratio);
                let mut split =
                    self.fit_split(camera.near, far, fov, ratio, corners, light_direction, s.single_near_offset, s.single_far, backend);
                split.bounds.add_point(split.center - light_direction * split.radius * 2.0);
                splits.push(split);
            }
        }
        ShadowCascades { light_direction, splits }
    }

    #[allow(clippy::too_many_arguments)]
    fn fit_split(
        &self,
        near: f32,
        far: f32,
        fov: f32,
        ratio: f32,
        corners: [Vec3; 8],
        light_direction: Vec3,
        near_offset: f32,
        extra_far: f32,
        backend: Backend,
    ) -> CascadeSplit {
        let (center, radius) = bounding_sphere(&corners, self.settings.radius_step);
        let eye = center - light_direction * near_offset;
        let view = Mat4::look_at_rh(eye, center, light_up(light_direction));
        let projection = backend.orthographic(-radius, radius, -radius, radius, -near_offset, near_offset + 2.0 * radius + extra_far);
        let projection = snap_to_texel(projection, view, self.settings.resolution);
        let shadow_matrix = backend.shadow_bias_matrix() * projection * view;
        let mut bounds = Aabb::new(center - Vec3::splat(radius), center + Vec3::splat(radius));
        bounds.add_point(eye);
        CascadeSplit { near, far, fov, ratio, corners, center, radius, eye, projection, view, shadow_matrix, bounds }
    }
}

/// Up vector for a shadow camera looking along `direction`.
pub(crate) fn light_up(direction: Vec3) -> Vec3 {
    let mut up = Vec3::Y;
    if up.dot(direction).abs() > 0.95 {
        up = Vec3::X;
    }
    up
}

/// Near/far pairs blending logarithmic and uniform spacing by `lambda`. Each far bound except the
/// last is the next near bound padded by `padding`.
pub fn split_distances(near: f32, far: f32, count: usize, lambda: f32, padding: f32) -> SmallVec<[(f32, f32); MAX_SHADOW_CASCADES]> {
    let count = count.clamp(MIN_SHADOW_CASCADES, MAX_SHADOW_CASCADES);
    let near = near.max(1e-4);
    let far = far.max(near);
    let ratio = far / near;
    let mut nears: SmallVec<[f32; MAX_SHADOW_CASCADES]> = SmallVec::new();
    nears.push(near);
    for i in 1..count {
        let si = i as f32 / count as f32;
        let log_split = near * ratio.powf(si);
        let uniform_split = near + (far - near) * si;
        nears.push(lambda * log_split + (1.0 - lambda) * uniform_split);
    }
    (0..count)
        .map(|i| {
            let split_far = if i + 1 < count { nears[i + 1] * padding } else { far };
            (nears[i], split_far)
        })
        .collect()
}

/// Near-plane corners (0..4) then far-plane corners (4..8) of a camera slice.
pub fn frustum_corners(camera: &Camera3D, near: f32, far: f32, fov: f32, ratio: f32) -> [Vec3; 8] {
    let forward = camera.forward();
    let right = camera.right();
    let up = camera.true_up();
    let half_tan = (fov * 0.5).tan();
    let mut corners = [Vec3::ZERO; 8];
    for (plane, distance) in [near, far].into_iter().enumerate() {
        let center = camera.position + forward * distance;
        let half_height = half_tan * distance;
        let half_width = half_height * ratio;
        let base = plane * 4;
        corners[base] = center - up * half_height - right * half_width;
        corners[base + 1] = center + up * half_height - right * half_width;
        corners[base + 2] = center + up * half_height + right * half_width;
        corners[base + 3] = center - up * half_height + right * half_width;
    }
    corners
}

/// Average of the corners and the farthest corner distance rounded up to `step`.
pub fn bounding_sphere(corners: &[Vec3; 8], step: f32) -> (Vec3, f32) {
    let center = corners.iter().copied().sum::<Vec3>() / corners.len() as f32;
    let radius = corners.iter().map(|corner| corner.distance(center)).fold(0.0f32, f32::max);
    let radius = if step > 0.0 { (radius / step).ceil() * step } else { radius };
    (center, radius)
}

/// Shifts the projection so the world origin lands on a texel boundary of a `size`-texel map.
pub fn snap_to_texel(projection: Mat4, view: Mat4, size: u32) -> Mat4 {
    let half = size.max(1) as f32 * 0.5;
    let origin = (projection * view) * Vec4::new(0.0, 0.0, 0.0, 1.0);
    let origin = glam::Vec2::new(origin.x, origin.y) * half;
    let rounded = origin.round();
    let offset = (rounded - origin) / half;
    let mut snapped = projection;
    snapped.w_axis.x += offset.x;
    snapped.w_axis.y += offset.y;
    snapped
}
