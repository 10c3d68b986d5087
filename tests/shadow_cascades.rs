use glam::{Mat4, Vec3, Vec4};
use kestrel_lightbake::camera3d::Camera3D;
use kestrel_lightbake::config::ShadowConfig;
use kestrel_lightbake::device::Backend;
use kestrel_lightbake::renderer::cascade::{bounding_sphere, frustum_corners, snap_to_texel, split_distances};
use kestrel_lightbake::renderer::{CascadeSettings, FrustumSplitComputer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn forward_camera(near: f32, far: f32) -> Camera3D {
    Camera3D::new(Vec3::ZERO, Vec3::Z, 60.0f32.to_radians(), near, far)
}

fn computer(count: u32, lambda: f32) -> FrustumSplitComputer {
    let config = ShadowConfig { cascade_count: count, split_lambda: lambda, ..ShadowConfig::default() };
    FrustumSplitComputer::new(CascadeSettings::from(&config))
}

#[test]
fn three_splits_cover_the_camera_range() {
    let cascades = computer(3, 0.9).compute(&forward_camera(1.0, 300.0), Vec3::new(0.2, -1.0, 0.3), 1.0, Backend::Wgpu);
    assert_eq!(cascades.len(), 3);
    let splits = &cascades.splits;
    assert_eq!(splits[0].near, 1.0);
    assert_eq!(splits[2].far, 300.0);
    for pair in splits.windows(2) {
        assert!(pair[1].near > pair[0].near);
        assert!(pair[1].far > pair[0].far);
    }
    // log/uniform blend with lambda 0.9
    assert!((splits[1].near - 16.09).abs() < 0.05, "near[1] = {}", splits[1].near);
    assert!((splits[2].near - 60.37).abs() < 0.05, "near[2] = {}", splits[2].near);
}

#[test]
fn splits_are_contiguous_for_random_cameras() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let padding = ShadowConfig::default().split_padding;
    for _ in 0..200 {
        let near = rng.gen_range(0.05..5.0);
        let far = near + rng.gen_range(1.0..2000.0);
        let count = rng.gen_range(2..=3);
        let lambda = rng.gen_range(0.0..=1.0);
        let splits = split_distances(near, far, count, lambda, padding);
        assert_eq!(splits.len(), count);
        assert_eq!(splits[0].0, near);
        assert_eq!(splits[count - 1].1, far);
        for i in 0..count - 1 {
            let gap = splits[i].1 - splits[i + 1].0;
            assert!(gap >= 0.0, "split {i} leaves a hole: {splits:?}");
            assert!(gap <= splits[i + 1].0 * (padding - 1.0) + 1e-3, "split {i} overlaps too far: {splits:?}");
        }
    }
}

#[test]
fn shadow_far_caps_the_last_split() {
    let config = ShadowConfig { shadow_far: 80.0, ..ShadowConfig::default() };
    let cascades = FrustumSplitComputer::new(CascadeSettings::from(&config)).compute(
        &forward_camera(0.5, 1000.0),
        Vec3::NEG_Y,
        1.0,
        Backend::OpenGl,
    );
    assert_eq!(cascades.splits.last().map(|split| split.far), Some(80.0));
}

#[test]
fn texel_snap_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..100 {
        let eye = Vec3::new(rng.gen_range(-50.0..50.0), rng.gen_range(10.0..60.0), rng.gen_range(-50.0..50.0));
        let target = eye + Vec3::new(rng.gen_range(-1.0..1.0), -1.0, rng.gen_range(-1.0..1.0));
        let view = Mat4::look_at_rh(eye, target, Vec3::X);
        let radius = rng.gen_range(20.0..120.0);
        let projection = Backend::Wgpu.orthographic(-radius, radius, -radius, radius, -50.0, 50.0 + 2.0 * radius);
        let size = [256u32, 1024, 2048][rng.gen_range(0..3)];

        let once = snap_to_texel(projection, view, size);
        let twice = snap_to_texel(once, view, size);
        assert!(once.abs_diff_eq(twice, 1e-4), "{once:?} vs {twice:?}");

        let origin = (once * view) * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let texel = glam::Vec2::new(origin.x, origin.y) * (size as f32 * 0.5);
        assert!((texel - texel.round()).abs().max_element() < 1e-2);
    }
}

#[test]
fn bounding_sphere_holds_every_corner() {
    let mut rng = StdRng::seed_from_u64(7);
    let step = ShadowConfig::default().radius_step;
    for _ in 0..100 {
        let position = Vec3::new(rng.gen_range(-50.0..50.0), rng.gen_range(-50.0..50.0), rng.gen_range(-50.0..50.0));
        let look = Vec3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-0.8..0.8), rng.gen_range(0.1..1.0));
        let fov = rng.gen_range(20.0f32..100.0).to_radians();
        let camera = Camera3D::new(position, position + look, fov, 0.1, 500.0);
        let near = rng.gen_range(0.1..50.0);
        let far = near + rng.gen_range(1.0..300.0);
        let corners = frustum_corners(&camera, near, far, fov, rng.gen_range(0.5..2.5));
        let (center, radius) = bounding_sphere(&corners, step);
        for corner in &corners {
            assert!(corner.distance(center) <= radius + 1e-3);
        }
        let snapped = radius / step;
        assert!((snapped - snapped.round()).abs() < 1e-3);
    }
}

#[test]
fn cascade_matrices_map_the_split_into_texture_space() {
    let camera = forward_camera(1.0, 300.0);
    let cascades = computer(3, 0.9).compute(&camera, Vec3::new(0.4, -1.0, 0.1), 1.0, Backend::Wgpu);
    for split in &cascades.splits {
        let clip = split.shadow_matrix * split.center.extend(1.0);
        let uv = clip.truncate() / clip.w;
        assert!((0.0..=1.0).contains(&uv.x) && (0.0..=1.0).contains(&uv.y), "center maps to {uv:?}");
        assert!((0.0..=1.0).contains(&uv.z));
        assert!(split.bounds.min.cmple(split.center - Vec3::splat(split.radius - 1e-3)).all());
    }
}
