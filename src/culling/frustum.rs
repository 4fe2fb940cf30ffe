// View-space frustum planes and the sphere visibility test
//
// Planes come from the projection matrix alone (Gribb-Hartmann): the
// four side planes are w-row +/- x-row and w-row +/- y-row, normalized
// so plane distances are in world units. Near/far are tested separately
// against view-space depth. This module is the reference semantics for
// the compute shader's visibility test.

use glam::{Mat4, Vec3, Vec4, Vec4Swizzles};

/// Extract the four normalized side planes (left, right, bottom, top)
/// from a projection matrix, as (normal.xyz, d) in view space.
pub fn frustum_planes(projection: &Mat4) -> [[f32; 4]; 4] {
    let x = projection.row(0);
    let y = projection.row(1);
    let w = projection.row(3);

    [
        normalize_plane(w + x),
        normalize_plane(w - x),
        normalize_plane(w + y),
        normalize_plane(w - y),
    ]
}

fn normalize_plane(plane: Vec4) -> [f32; 4] {
    (plane / plane.xyz().length()).to_array()
}

/// Test a view-space bounding sphere against the side planes and the
/// near/far depth range. The camera looks down -Z in view space.
pub fn sphere_visible(
    planes: &[[f32; 4]; 4],
    z_near: f32,
    z_far: f32,
    center: Vec3,
    radius: f32,
) -> bool {
    for plane in planes {
        let distance = Vec3::from_slice(&plane[..3]).dot(center) + plane[3];
        if distance < -radius {
            return false;
        }
    }

    let depth = -center.z;
    depth + radius >= z_near && depth - radius <= z_far
}

#[cfg(test)]
mod tests {
    use super::*;

    fn projection() -> Mat4 {
        Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 0.1, 100.0)
    }

    #[test]
    fn planes_are_normalized() {
        for plane in frustum_planes(&projection()) {
            let length = Vec3::from_slice(&plane[..3]).length();
            assert!((length - 1.0).abs() < 1e-5, "plane length {length}");
        }
    }

    #[test]
    fn sphere_ahead_of_camera_is_visible() {
        let planes = frustum_planes(&projection());
        assert!(sphere_visible(
            &planes,
            0.1,
            100.0,
            Vec3::new(0.0, 0.0, -10.0),
            1.0
        ));
    }

    #[test]
    fn sphere_behind_camera_is_culled() {
        let planes = frustum_planes(&projection());
        assert!(!sphere_visible(
            &planes,
            0.1,
            100.0,
            Vec3::new(0.0, 0.0, 10.0),
            1.0
        ));
    }

    #[test]
    fn sphere_far_to_the_side_is_culled() {
        let planes = frustum_planes(&projection());
        assert!(!sphere_visible(
            &planes,
            0.1,
            100.0,
            Vec3::new(-500.0, 0.0, -10.0),
            1.0
        ));
    }

    #[test]
    fn sphere_straddling_a_side_plane_is_kept() {
        let planes = frustum_planes(&projection());
        // center just outside the left plane, radius reaching back in
        let outside = Vec3::new(-12.0, 0.0, -10.0);
        assert!(!sphere_visible(&planes, 0.1, 100.0, outside, 0.5));
        assert!(sphere_visible(&planes, 0.1, 100.0, outside, 8.0));
    }

    #[test]
    fn sphere_beyond_far_plane_is_culled() {
        let planes = frustum_planes(&projection());
        assert!(!sphere_visible(
            &planes,
            0.1,
            100.0,
            Vec3::new(0.0, 0.0, -150.0),
            1.0
        ));
        // but a large enough radius reaches back inside
        assert!(sphere_visible(
            &planes,
            0.1,
            100.0,
            Vec3::new(0.0, 0.0, -150.0),
            60.0
        ));
    }
}
