// SPDX-License-Identifier: CEPL-1.0
//! Math shim over `glam`. Right-handed world, Vulkan clip space (depth 0..1).
//! The Y flip is done by the renderer with a negative-height viewport, so the
//! projections here are the plain `_rh` variants.

pub use glam::{Mat4, Quat, Vec2, Vec3, Vec4};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::IDENTITY
        }
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    /// Scale, then rotate, then translate.
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// Apply `delta` on top of the current rotation (world space).
    pub fn rotate(&mut self, delta: Quat) {
        self.rotation = (delta * self.rotation).normalize();
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::NEG_Z
    }

    pub fn lerp(&self, other: &Self, t: f32) -> Self {
        Self {
            position: self.position.lerp(other.position, t),
            rotation: self.rotation.slerp(other.rotation, t),
            scale: self.scale.lerp(other.scale, t),
        }
    }
}

pub fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    Mat4::perspective_rh(fov_y, aspect.max(f32::EPSILON), near, far)
}

pub fn orthographic(half_extent: f32, near: f32, far: f32) -> Mat4 {
    Mat4::orthographic_rh(
        -half_extent,
        half_extent,
        -half_extent,
        half_extent,
        near,
        far,
    )
}

/// View matrix looking from `eye` along `dir`; picks a stable up vector when
/// `dir` is (anti)parallel to +Y.
pub fn look_to(eye: Vec3, dir: Vec3) -> Mat4 {
    let dir = dir.normalize_or(Vec3::NEG_Z);
    let up = if dir.cross(Vec3::Y).length_squared() < 1e-6 {
        Vec3::Z
    } else {
        Vec3::Y
    };
    Mat4::look_to_rh(eye, dir, up)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_applies_scale_rotation_translation_in_order() {
        let t = Transform::from_position(Vec3::new(1.0, 2.0, 3.0))
            .with_rotation(Quat::from_rotation_y(std::f32::consts::FRAC_PI_2))
            .with_scale(Vec3::splat(2.0));
        let p = t.matrix().transform_point3(Vec3::X);
        // x scaled to 2, rotated 90° about Y onto -Z, then translated.
        assert!((p - Vec3::new(1.0, 2.0, 1.0)).length() < 1e-5, "{p:?}");
    }

    #[test]
    fn rotate_composes_on_the_left() {
        let mut t = Transform::IDENTITY;
        t.rotate(Quat::from_rotation_y(std::f32::consts::FRAC_PI_2));
        t.rotate(Quat::from_rotation_y(std::f32::consts::FRAC_PI_2));
        assert!((t.forward() - Vec3::Z).length() < 1e-5);
    }

    #[test]
    fn lerp_endpoints() {
        let a = Transform::IDENTITY;
        let b = Transform::from_position(Vec3::splat(4.0));
        assert_eq!(a.lerp(&b, 0.0).position, a.position);
        assert_eq!(a.lerp(&b, 1.0).position, b.position);
        assert_eq!(a.lerp(&b, 0.5).position, Vec3::splat(2.0));
    }

    #[test]
    fn look_to_straight_down_is_finite() {
        let m = look_to(Vec3::new(0.0, 10.0, 0.0), Vec3::NEG_Y);
        assert!(m.is_finite());
    }
}
