// SPDX-License-Identifier: CEPL-1.0
use crate::gpu::{GpuLight, SHADOW_SLOTS};
use umbra_math::{look_to, orthographic, perspective, Mat4, Vec3};

pub const MAX_SHADOW_VIEWS: usize = SHADOW_SLOTS;

const SHADOW_NEAR: f32 = 0.05;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LightType {
    Directional,
    Spot,
    Point,
}

impl LightType {
    /// Sub-renders the shadow pass performs for this light. Point lights use
    /// four horizontal 90° views packed into quadrants of one depth image
    /// rather than six cube faces.
    pub fn shadow_views(self) -> u32 {
        match self {
            LightType::Point => SHADOW_SLOTS as u32,
            LightType::Directional | LightType::Spot => 1,
        }
    }

    fn gpu_tag(self) -> f32 {
        match self {
            LightType::Directional => 0.0,
            LightType::Spot => 1.0,
            LightType::Point => 2.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Light {
    pub kind: LightType,
    pub position: Vec3,
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    pub range: f32,
    /// Half-angles in radians.
    pub inner_cone: f32,
    pub outer_cone: f32,
}

/// Light-space view-projection matrices for one shadow pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShadowViews {
    pub kind: LightType,
    pub matrices: [Mat4; MAX_SHADOW_VIEWS],
}

impl ShadowViews {
    pub fn count(&self) -> usize {
        self.kind.shadow_views() as usize
    }

    pub fn active(&self) -> &[Mat4] {
        &self.matrices[..self.count()]
    }
}

impl Light {
    pub fn directional(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            kind: LightType::Directional,
            position: Vec3::ZERO,
            direction: direction.normalize_or(Vec3::NEG_Y),
            color,
            intensity,
            range: f32::MAX,
            inner_cone: 0.0,
            outer_cone: 0.0,
        }
    }

    pub fn point(position: Vec3, color: Vec3, intensity: f32, range: f32) -> Self {
        Self {
            kind: LightType::Point,
            position,
            direction: Vec3::NEG_Y,
            color,
            intensity,
            range,
            inner_cone: 0.0,
            outer_cone: 0.0,
        }
    }

    pub fn spot(
        position: Vec3,
        direction: Vec3,
        color: Vec3,
        intensity: f32,
        range: f32,
        inner_cone: f32,
        outer_cone: f32,
    ) -> Self {
        Self {
            kind: LightType::Spot,
            position,
            direction: direction.normalize_or(Vec3::NEG_Y),
            color,
            intensity,
            range,
            inner_cone: inner_cone.min(outer_cone),
            outer_cone,
        }
    }

    pub fn to_gpu(&self) -> GpuLight {
        GpuLight {
            position: self.position.extend(self.kind.gpu_tag()).to_array(),
            direction: self.direction.extend(self.range).to_array(),
            color: self.color.extend(self.intensity).to_array(),
            cone: [self.inner_cone.cos(), self.outer_cone.cos(), 0.0, 0.0],
        }
    }

    /// `scene_radius` bounds the region a directional light has to cover;
    /// it is centred on the world origin.
    pub fn shadow_views(&self, scene_radius: f32) -> ShadowViews {
        let mut matrices = [Mat4::IDENTITY; MAX_SHADOW_VIEWS];
        match self.kind {
            LightType::Directional => {
                let radius = scene_radius.max(1.0);
                let eye = -self.direction * radius * 2.0;
                let proj = orthographic(radius, SHADOW_NEAR, radius * 4.0);
                matrices[0] = proj * look_to(eye, self.direction);
            }
            LightType::Spot => {
                let fov = (self.outer_cone * 2.0).clamp(0.1, std::f32::consts::PI - 0.1);
                let proj = perspective(fov, 1.0, SHADOW_NEAR, self.range.max(SHADOW_NEAR * 2.0));
                matrices[0] = proj * look_to(self.position, self.direction);
            }
            LightType::Point => {
                let proj = perspective(
                    std::f32::consts::FRAC_PI_2,
                    1.0,
                    SHADOW_NEAR,
                    self.range.max(SHADOW_NEAR * 2.0),
                );
                for (m, dir) in matrices.iter_mut().zip(point_view_directions()) {
                    *m = proj * look_to(self.position, dir);
                }
            }
        }
        ShadowViews {
            kind: self.kind,
            matrices,
        }
    }
}

/// View directions of the point-light quadrants, in render-index order.
pub fn point_view_directions() -> [Vec3; MAX_SHADOW_VIEWS] {
    [Vec3::X, Vec3::NEG_X, Vec3::Z, Vec3::NEG_Z]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_light_has_four_views_others_one() {
        assert_eq!(LightType::Point.shadow_views(), 4);
        assert_eq!(LightType::Spot.shadow_views(), 1);
        assert_eq!(LightType::Directional.shadow_views(), 1);
    }

    #[test]
    fn point_views_look_along_their_axis() {
        let light = Light::point(Vec3::new(0.0, 2.0, 0.0), Vec3::ONE, 1.0, 20.0);
        let views = light.shadow_views(10.0);
        assert_eq!(views.active().len(), 4);
        for (m, dir) in views.matrices.iter().zip(point_view_directions()) {
            let p = m.project_point3(light.position + dir * 5.0);
            assert!(p.x.abs() < 1e-4 && p.y.abs() < 1e-4, "{dir:?} -> {p:?}");
            assert!((0.0..=1.0).contains(&p.z));
        }
    }

    #[test]
    fn directional_view_keeps_origin_in_clip_volume() {
        let light = Light::directional(Vec3::new(-1.0, -2.0, -0.5), Vec3::ONE, 1.0);
        let m = light.shadow_views(15.0).matrices[0];
        let p = m.project_point3(Vec3::ZERO);
        assert!(p.x.abs() <= 1.0 && p.y.abs() <= 1.0 && (0.0..=1.0).contains(&p.z));
    }

    #[test]
    fn gpu_encoding_tags_kind_and_cones() {
        let s = Light::spot(Vec3::ZERO, Vec3::NEG_Y, Vec3::ONE, 2.0, 10.0, 0.2, 0.4);
        let g = s.to_gpu();
        assert_eq!(g.position[3], 1.0);
        assert_eq!(g.color[3], 2.0);
        assert!(g.cone[0] > g.cone[1]);
    }
}
