// SPDX-License-Identifier: CEPL-1.0
use crate::gpu::{LightUniform, ModelUniform, MAX_LIGHTS};
use crate::light::{Light, ShadowViews};
use crate::mesh::Model;
use umbra_math::{perspective, Mat4, Quat, Transform, Vec3};

#[derive(Clone, Copy, Debug)]
pub struct Camera {
    pub transform: Transform,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            transform: Transform::IDENTITY,
            fov_y: 60f32.to_radians(),
            near: 0.1,
            far: 200.0,
        }
    }
}

impl Camera {
    pub fn look_at(eye: Vec3, target: Vec3) -> Self {
        let view = Mat4::look_at_rh(eye, target, Vec3::Y);
        let rotation = Quat::from_mat4(&view.inverse());
        Self {
            transform: Transform::from_position(eye).with_rotation(rotation),
            ..Self::default()
        }
    }

    pub fn view(&self) -> Mat4 {
        self.transform.matrix().inverse()
    }

    pub fn projection(&self, aspect: f32) -> Mat4 {
        perspective(self.fov_y, aspect, self.near, self.far)
    }

    pub fn model_uniform(&self, model: &Mat4, aspect: f32) -> ModelUniform {
        ModelUniform {
            model: model.to_cols_array_2d(),
            view: self.view().to_cols_array_2d(),
            proj: self.projection(aspect).to_cols_array_2d(),
            camera_position: self.transform.position.extend(1.0).to_array(),
        }
    }
}

/// Everything one frame draws. `shadow_caster` indexes into `lights`.
#[derive(Debug, Default)]
pub struct Scene {
    pub camera: Camera,
    pub lights: Vec<Light>,
    pub models: Vec<Model>,
    pub shadow_caster: Option<usize>,
    pub ambient: Vec3,
    /// Radius around the origin a directional shadow has to cover.
    pub shadow_radius: f32,
}

impl Scene {
    pub fn shadow_light(&self) -> Option<&Light> {
        self.shadow_caster
            .filter(|&i| i < MAX_LIGHTS)
            .and_then(|i| self.lights.get(i))
    }

    pub fn shadow_views(&self) -> Option<ShadowViews> {
        self.shadow_light()
            .map(|l| l.shadow_views(self.shadow_radius.max(1.0)))
    }

    /// Pack lights into the uniform block; lights past `MAX_LIGHTS` are
    /// dropped.
    pub fn light_uniform(&self) -> LightUniform {
        let mut u = LightUniform {
            ambient: self.ambient.extend(0.0).to_array(),
            ..LightUniform::default()
        };
        for (dst, light) in u.lights.iter_mut().zip(&self.lights) {
            *dst = light.to_gpu();
        }
        u.light_count = self.lights.len().min(MAX_LIGHTS) as u32;
        if let (Some(index), Some(views)) = (self.shadow_caster, self.shadow_views()) {
            u.shadow_light = index as i32;
            u.shadow_views = views.count() as u32;
            for (dst, m) in u.light_space.iter_mut().zip(views.active()) {
                *dst = m.to_cols_array_2d();
            }
        }
        u
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_look_at_points_forward_at_target() {
        let cam = Camera::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
        let p = cam.view().transform_point3(Vec3::ZERO);
        assert!((p - Vec3::new(0.0, 0.0, -5.0)).length() < 1e-4, "{p:?}");
    }

    #[test]
    fn light_uniform_truncates_and_reports_caster() {
        let mut scene = Scene {
            shadow_radius: 10.0,
            ..Scene::default()
        };
        for i in 0..(MAX_LIGHTS + 3) {
            scene.lights.push(Light::point(
                Vec3::new(i as f32, 3.0, 0.0),
                Vec3::ONE,
                1.0,
                10.0,
            ));
        }
        scene.shadow_caster = Some(2);
        let u = scene.light_uniform();
        assert_eq!(u.light_count as usize, MAX_LIGHTS);
        assert_eq!(u.shadow_light, 2);
        assert_eq!(u.shadow_views, 4);
    }

    #[test]
    fn out_of_range_caster_is_ignored() {
        let scene = Scene {
            lights: vec![Light::directional(Vec3::NEG_Y, Vec3::ONE, 1.0)],
            shadow_caster: Some(5),
            ..Scene::default()
        };
        assert!(scene.shadow_light().is_none());
        assert_eq!(scene.light_uniform().shadow_light, -1);
    }
}
