use glam::{Mat4, Vec3};

use super::cascade::light_up;
use crate::device::Backend;
use crate::light::{Light, LightKind};
use crate::mesh::Aabb;

/// Near offset used for area lights: the eye sits just behind the emitting surface.
pub const AREA_NEAR_OFFSET: f32 = 0.1;
const MIN_AREA_FOV: f32 = 10.0 * std::f32::consts::PI / 180.0;
const MAX_AREA_FOV: f32 = 170.0 * std::f32::consts::PI / 180.0;
const MIN_PERSPECTIVE_NEAR: f32 = 0.05;

/// One projection/view pair for a bounded light.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundedShadow {
    pub eye: Vec3,
    pub center: Vec3,
    pub projection: Mat4,
    pub view: Mat4,
    /// bias × projection × view
    pub shadow_matrix: Mat4,
    /// Caster culling box.
    pub bounds: Aabb,
}

#[derive(Debug, Clone, Copy)]
pub struct BoundedShadowProjector {
    pub near_offset: f32,
    pub radius_step: f32,
    pub backend: Backend,
}

impl BoundedShadowProjector {
    pub fn new(near_offset: f32, radius_step: f32, backend: Backend) -> Self {
        Self { near_offset, radius_step, backend }
    }

    /// Projection for `light` fitted to `bound`. Point lights have no single projection and yield `None`.
    pub fn project(&self, light: &Light, bound: &Aabb) -> Option<BoundedShadow> {
        match light.kind {
            LightKind::Directional { direction } => Some(self.directional(direction, bound)),
            LightKind::Area { position, .. } => {
                let facing = light.direction().unwrap_or(Vec3::NEG_Z);
                Some(self.area(position, facing, bound))
            }
            LightKind::Spot { position, direction, radius, outer_angle, .. } => {
                Some(self.spot(position, direction, radius, outer_angle))
            }
            LightKind::Point { .. } => None,
        }
    }

    /// Orthographic box around the bound's sphere, seen from behind the center along `direction`.
    pub fn directional(&self, direction: Vec3, bound: &Aabb) -> BoundedShadow {
        let direction = direction.normalize_or_zero();
        let center = bound.center();
        let radius = self.rounded_radius(bound.extent().length());
        let eye = center - direction * self.near_offset;
        let view = Mat4::look_at_rh(eye, center, light_up(direction));
        let projection =
            self.backend.orthographic(-radius, radius, -radius, radius, -self.near_offset, self.near_offset + 2.0 * radius);
        let mut bounds = Aabb::new(center - Vec3::splat(radius), center + Vec3::splat(radius));
        bounds.add_point(eye);
        self.finish(eye, center, projection, view, bounds)
    }

    /// Perspective frustum from just behind the area light toward the bound center, wide enough to
    /// enclose the bound's sphere.
    pub fn area(&self, position: Vec3, facing: Vec3, bound: &Aabb) -> BoundedShadow {
        let facing = facing.normalize_or_zero();
        let eye = position - facing * AREA_NEAR_OFFSET;
        let center = bound.center();
        let radius = bound.extent().length().max(1e-3);
        let distance = eye.distance(center).max(1e-3);
        let fov = (2.0 * (radius / distance).min(0.999).asin()).clamp(MIN_AREA_FOV, MAX_AREA_FOV);
        let near = (distance - radius).max(MIN_PERSPECTIVE_NEAR);
        let far = (distance + radius).max(near + MIN_PERSPECTIVE_NEAR);
        let look = non_zero_or(center - eye, facing);
        let view = Mat4::look_at_rh(eye, center, light_up(look));
        let projection = self.backend.perspective(fov, 1.0, near, far);
        let mut bounds = *bound;
        bounds.add_point(eye);
        self.finish(eye, center, projection, view, bounds)
    }

    /// Cone frustum of a spot light.
    pub fn spot(&self, position: Vec3, direction: Vec3, radius: f32, outer_angle: f32) -> BoundedShadow {
        let direction = non_zero_or(direction, Vec3::NEG_Y);
        let far = radius.max(MIN_PERSPECTIVE_NEAR * 2.0);
        let fov = (2.0 * outer_angle).clamp(MIN_AREA_FOV, MAX_AREA_FOV);
        let center = position + direction * far;
        let view = Mat4::look_at_rh(position, center, light_up(direction));
        let projection = self.backend.perspective(fov, 1.0, MIN_PERSPECTIVE_NEAR, far);
        let bounds = Aabb::new(position - Vec3::splat(far), position + Vec3::splat(far));
        self.finish(position, center, projection, view, bounds)
    }

    fn rounded_radius(&self, radius: f32) -> f32 {
        if self.radius_step > 0.0 {
            ((radius / self.radius_step).ceil() * self.radius_step).max(self.radius_step)
        } else {
            radius
        }
    }

    fn finish(&self, eye: Vec3, center: Vec3, projection: Mat4, view: Mat4, bounds: Aabb) -> BoundedShadow {
        let shadow_matrix = self.backend.shadow_bias_matrix() * projection * view;
        BoundedShadow { eye, center, projection, view, shadow_matrix, bounds }
    }
}

fn non_zero_or(v: Vec3, fallback: Vec3) -> Vec3 {
    let n = v.normalize_or_zero();
    if n == Vec3::ZERO {
        fallback
    } else {
        n
    }
}

/// World bound used for realtime area-light shadows: a cube of half size `radius / 2` in front of the light.
pub fn area_light_bound(light: &Light) -> Option<Aabb> {
    let LightKind::Area { position, radius, .. } = light.kind else {
        return None;
    };
    let facing = light.direction().unwrap_or(Vec3::NEG_Z);
    let half = radius * 0.5;
    let center = position + facing * half;
    Some(Aabb::new(center - Vec3::splat(half), center + Vec3::splat(half)))
}
