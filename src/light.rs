use glam::{Quat, Vec2, Vec3};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct LightId(pub Uuid);

impl LightId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LightId {
    fn default() -> Self {
        Self::new()
    }
}

/// Which lighting path a light contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderLightClass {
    #[default]
    Realtime,
    Baked,
    Mixed,
}

impl RenderLightClass {
    pub fn contributes_to_bake(self) -> bool {
        matches!(self, RenderLightClass::Baked | RenderLightClass::Mixed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LightKind {
    Directional { direction: Vec3 },
    Point { position: Vec3, radius: f32 },
    Spot { position: Vec3, direction: Vec3, radius: f32, inner_angle: f32, outer_angle: f32 },
    Area { position: Vec3, rotation: Quat, half_extents: Vec2, radius: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightType {
    Directional,
    Point,
    Spot,
    Area,
}

#[derive(Debug, Clone)]
pub struct Light {
    pub id: LightId,
    pub kind: LightKind,
    pub color: Vec3,
    pub intensity: f32,
    pub cast_shadow: bool,
    /// Depth target is re-rendered every frame instead of cached.
    pub dynamic_shadow: bool,
    pub class: RenderLightClass,
    pub bake_bounce: u32,
    pub enabled: bool,
    pub visible: bool,
}

impl Light {
    pub fn new(kind: LightKind) -> Self {
        Self {
            id: LightId::new(),
            kind,
            color: Vec3::ONE,
            intensity: 1.0,
            cast_shadow: true,
            dynamic_shadow: false,
            class: RenderLightClass::Realtime,
            bake_bounce: 1,
            enabled: true,
            visible: true,
        }
    }

    pub fn directional(direction: Vec3) -> Self {
        Self::new(LightKind::Directional { direction: direction.normalize_or_zero() })
    }

    pub fn point(position: Vec3, radius: f32) -> Self {
        Self::new(LightKind::Point { position, radius })
    }

    pub fn spot(position: Vec3, direction: Vec3, radius: f32, outer_angle: f32) -> Self {
        Self::new(LightKind::Spot {
            position,
            direction: direction.normalize_or_zero(),
            radius,
            inner_angle: outer_angle * 0.8,
            outer_angle,
        })
    }

    pub fn area(position: Vec3, rotation: Quat, half_extents: Vec2, radius: f32) -> Self {
        Self::new(LightKind::Area { position, rotation, half_extents, radius })
    }

    pub fn with_class(mut self, class: RenderLightClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_dynamic_shadow(mut self, dynamic: bool) -> Self {
        self.dynamic_shadow = dynamic;
        self
    }

    pub fn with_cast_shadow(mut self, cast: bool) -> Self {
        self.cast_shadow = cast;
        self
    }

    pub fn light_type(&self) -> LightType {
        match self.kind {
            LightKind::Directional { .. } => LightType::Directional,
            LightKind::Point { .. } => LightType::Point,
            LightKind::Spot { .. } => LightType::Spot,
            LightKind::Area { .. } => LightType::Area,
        }
    }

    pub fn position(&self) -> Option<Vec3> {
        match self.kind {
            LightKind::Directional { .. } => None,
            LightKind::Point { position, .. }
            | LightKind::Spot { position, .. }
            | LightKind::Area { position, .. } => Some(position),
        }
    }

    /// Facing direction. Area lights face along their local -Z.
    pub fn direction(&self) -> Option<Vec3> {
        match self.kind {
            LightKind::Directional { direction } | LightKind::Spot { direction, .. } => Some(direction),
            LightKind::Area { rotation, .. } => Some(rotation * Vec3::NEG_Z),
            LightKind::Point { .. } => None,
        }
    }

    pub fn radius(&self) -> Option<f32> {
        match self.kind {
            LightKind::Directional { .. } => None,
            LightKind::Point { radius, .. } | LightKind::Spot { radius, .. } | LightKind::Area { radius, .. } => {
                Some(radius)
            }
        }
    }

    /// Whether the light takes part in realtime passes under the given bake-mode flag.
    pub fn participates(&self, bake_mode: bool) -> bool {
        self.enabled && self.visible && (bake_mode || self.class != RenderLightClass::Baked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baked_lights_only_participate_in_bake_mode() {
        let light = Light::point(Vec3::ZERO, 5.0).with_class(RenderLightClass::Baked);
        assert!(!light.participates(false));
        assert!(light.participates(true));
        let mixed = Light::point(Vec3::ZERO, 5.0).with_class(RenderLightClass::Mixed);
        assert!(mixed.participates(false));
        assert!(mixed.class.contributes_to_bake());
    }

    #[test]
    fn area_faces_local_negative_z() {
        let light = Light::area(Vec3::ZERO, Quat::from_rotation_y(std::f32::consts::PI), Vec2::ONE, 10.0);
        let dir = light.direction().expect("area light has a direction");
        assert!((dir - Vec3::Z).length() < 1e-5);
        assert_eq!(light.light_type(), LightType::Area);
    }
}
