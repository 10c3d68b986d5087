use glam::{Mat4, Vec3};

use crate::device::{Backend, CubeFace};

const FACE_LOOK_DISTANCE: f32 = 100.0;

/// Look direction and up vector of a cube face. OpenGL samples the Z faces mirrored, so they swap.
pub fn face_basis(face: CubeFace, backend: Backend) -> (Vec3, Vec3) {
    let face = match (backend, face) {
        (Backend::OpenGl, CubeFace::PositiveZ) => CubeFace::NegativeZ,
        (Backend::OpenGl, CubeFace::NegativeZ) => CubeFace::PositiveZ,
        (_, face) => face,
    };
    match face {
        CubeFace::PositiveX => (Vec3::X, Vec3::Y),
        CubeFace::NegativeX => (Vec3::NEG_X, Vec3::Y),
        CubeFace::PositiveY => (Vec3::Y, Vec3::NEG_Z),
        CubeFace::NegativeY => (Vec3::NEG_Y, Vec3::Z),
        CubeFace::PositiveZ => (Vec3::Z, Vec3::Y),
        CubeFace::NegativeZ => (Vec3::NEG_Z, Vec3::Y),
    }
}

pub fn face_view(position: Vec3, face: CubeFace, backend: Backend) -> Mat4 {
    let (direction, up) = face_basis(face, backend);
    Mat4::look_at_rh(position, position + direction * FACE_LOOK_DISTANCE, up)
}

/// 90° square projection shared by all six faces. Falls back to `camera_far` when the light radius
/// does not reach past the near plane.
pub fn face_projection(backend: Backend, near: f32, radius: f32, camera_far: f32) -> Mat4 {
    let far = if radius > near { radius } else { camera_far.max(near + 0.01) };
    backend.perspective(std::f32::consts::FRAC_PI_2, 1.0, near, far)
}
