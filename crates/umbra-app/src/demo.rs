// SPDX-License-Identifier: CEPL-1.0
//! Procedural demo scene: a floor, a ring of cubes and one shadow caster.

use anyhow::Result;
use clap::ValueEnum;
use serde::Deserialize;
use std::sync::Arc;
use umbra_math::{Quat, Transform, Vec3};
use umbra_render::primitives::{checker_texture, cube, flat_normal_map, plane};
use umbra_render::{Camera, Light, Material, Model, Scene, TextureSlot};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LightChoice {
    #[default]
    Directional,
    Spot,
    Point,
}

const CUBES: usize = 6;
const RING_RADIUS: f32 = 3.0;

pub fn shadow_light(choice: LightChoice) -> Light {
    match choice {
        LightChoice::Directional => {
            Light::directional(Vec3::new(-0.4, -1.0, -0.3), Vec3::new(1.0, 0.96, 0.9), 2.5)
        }
        LightChoice::Spot => Light::spot(
            Vec3::new(5.0, 7.0, 5.0),
            Vec3::new(-5.0, -7.0, -5.0),
            Vec3::new(1.0, 0.9, 0.8),
            120.0,
            25.0,
            20f32.to_radians(),
            32f32.to_radians(),
        ),
        // sits inside the ring so all four views catch a cube
        LightChoice::Point => Light::point(Vec3::new(0.0, 1.5, 0.0), Vec3::ONE, 30.0, 15.0),
    }
}

pub fn build_scene(choice: LightChoice) -> Result<Scene> {
    let floor_tex = Arc::new(checker_texture(
        "floor-checker",
        256,
        32,
        [200, 200, 200, 255],
        [90, 90, 100, 255],
    )?);
    let cube_tex = Arc::new(checker_texture(
        "cube-checker",
        64,
        8,
        [230, 120, 60, 255],
        [250, 220, 180, 255],
    )?);
    let normal_map = Arc::new(flat_normal_map("flat-normal", 4)?);

    let floor_mat = Arc::new(
        Material::new("floor")
            .with_texture(TextureSlot::Albedo, floor_tex)
            .with_texture(TextureSlot::Normal, Arc::clone(&normal_map)),
    );
    let mut cube_mat = Material::new("cube").with_texture(TextureSlot::Albedo, cube_tex);
    cube_mat.shininess = 64.0;
    cube_mat.roughness = 0.3;
    let cube_mat = Arc::new(cube_mat);

    let floor_mesh = Arc::new(plane("floor", 8.0, floor_mat)?);
    let cube_mesh = Arc::new(cube("cube", cube_mat)?);

    let mut floor = Model::new("floor", vec![floor_mesh], Transform::IDENTITY);
    floor.casts_shadow = false;

    let mut models = vec![floor];
    for i in 0..CUBES {
        let angle = i as f32 / CUBES as f32 * std::f32::consts::TAU;
        let position = Vec3::new(
            angle.cos() * RING_RADIUS,
            0.5 + (i % 2) as f32 * 0.75,
            angle.sin() * RING_RADIUS,
        );
        let transform =
            Transform::from_position(position).with_rotation(Quat::from_rotation_y(angle));
        models.push(Model::new(
            format!("cube-{i}"),
            vec![Arc::clone(&cube_mesh)],
            transform,
        ));
    }

    let fill = Light::point(Vec3::new(-4.0, 3.0, 4.0), Vec3::new(0.4, 0.5, 1.0), 6.0, 10.0);

    Ok(Scene {
        camera: Camera::look_at(Vec3::new(7.0, 6.0, 9.0), Vec3::ZERO),
        lights: vec![shadow_light(choice), fill],
        models,
        shadow_caster: Some(0),
        ambient: Vec3::splat(0.06),
        shadow_radius: 9.0,
    })
}

/// Spin every cube in place; the floor stays put.
pub fn animate(scene: &mut Scene, dt: f32) {
    let delta = Quat::from_rotation_y(dt * 0.8);
    for model in scene.models.iter_mut().filter(|m| m.casts_shadow) {
        model.transform.rotate(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_has_floor_cubes_and_a_caster() {
        let scene = build_scene(LightChoice::Point).unwrap();
        assert_eq!(scene.models.len(), CUBES + 1);
        assert!(!scene.models[0].casts_shadow);
        assert_eq!(scene.models.iter().filter(|m| m.casts_shadow).count(), CUBES);
        assert_eq!(scene.shadow_views().unwrap().count(), 4);
    }

    #[test]
    fn cubes_share_one_mesh() {
        let scene = build_scene(LightChoice::Directional).unwrap();
        let first = scene.models[1].meshes[0].id();
        assert!(scene.models[1..].iter().all(|m| m.meshes[0].id() == first));
        assert_eq!(scene.shadow_views().unwrap().count(), 1);
    }

    #[test]
    fn animate_leaves_floor_alone() {
        let mut scene = build_scene(LightChoice::Spot).unwrap();
        let floor = scene.models[0].transform;
        let cube = scene.models[1].transform;
        animate(&mut scene, 0.5);
        assert_eq!(scene.models[0].transform, floor);
        assert_ne!(scene.models[1].transform.rotation, cube.rotation);
    }
}
