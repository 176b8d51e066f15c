// SPDX-License-Identifier: CEPL-1.0
//! Procedural stand-ins for the asset loader: enough geometry and texture
//! data to exercise every GPU path without a model file.

use crate::gpu::Vertex;
use crate::material::Material;
use crate::mesh::Mesh;
use crate::texture::Texture;
use anyhow::Result;
use std::sync::Arc;
use umbra_math::Vec3;

pub fn checker_texture(
    name: &str,
    size: u32,
    cell: u32,
    a: [u8; 4],
    b: [u8; 4],
) -> Result<Texture> {
    let cell = cell.max(1);
    let mut pixels = Vec::with_capacity(size as usize * size as usize * 4);
    for y in 0..size {
        for x in 0..size {
            let odd = ((x / cell) + (y / cell)) % 2 == 1;
            pixels.extend_from_slice(if odd { &b } else { &a });
        }
    }
    Texture::from_rgba8(name, size, size, pixels, true)
}

/// Flat tangent-space normal map (all texels point along +Z).
pub fn flat_normal_map(name: &str, size: u32) -> Result<Texture> {
    let texel = [128u8, 128, 255, 255];
    let pixels = texel.repeat(size as usize * size as usize);
    Texture::from_rgba8(name, size, size, pixels, false)
}

fn quad(vertices: &mut Vec<Vertex>, indices: &mut Vec<u32>, corners: [Vec3; 4], normal: Vec3) {
    let base = vertices.len() as u32;
    let tangent = (corners[1] - corners[0]).normalize_or(Vec3::X);
    let uvs = [[0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]];
    for (p, uv) in corners.into_iter().zip(uvs) {
        vertices.push(Vertex {
            position: p.to_array(),
            normal: normal.to_array(),
            uv,
            tangent: tangent.to_array(),
        });
    }
    indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
}

/// Axis-aligned cube of edge 1 centred on the origin, CCW outward faces.
pub fn cube(name: &str, material: Arc<Material>) -> Result<Mesh> {
    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    let h = 0.5;
    let faces = [
        (Vec3::X, Vec3::NEG_Z, Vec3::Y),
        (Vec3::NEG_X, Vec3::Z, Vec3::Y),
        (Vec3::Y, Vec3::X, Vec3::NEG_Z),
        (Vec3::NEG_Y, Vec3::X, Vec3::Z),
        (Vec3::Z, Vec3::X, Vec3::Y),
        (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
    ];
    for (n, right, up) in faces {
        let c = n * h;
        let r = right * h;
        let u = up * h;
        quad(
            &mut vertices,
            &mut indices,
            [c - r - u, c + r - u, c + r + u, c - r + u],
            n,
        );
    }
    Mesh::new(name, vertices, indices, material)
}

/// Ground plane in XZ facing +Y.
pub fn plane(name: &str, half_size: f32, material: Arc<Material>) -> Result<Mesh> {
    let mut vertices = Vec::with_capacity(4);
    let mut indices = Vec::with_capacity(6);
    let s = half_size;
    quad(
        &mut vertices,
        &mut indices,
        [
            Vec3::new(-s, 0.0, s),
            Vec3::new(s, 0.0, s),
            Vec3::new(s, 0.0, -s),
            Vec3::new(-s, 0.0, -s),
        ],
        Vec3::Y,
    );
    Mesh::new(name, vertices, indices, material)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_faces_wind_outward() {
        let mesh = cube("c", Arc::new(Material::new("m"))).unwrap();
        assert_eq!(mesh.vertices().len(), 24);
        assert_eq!(mesh.indices().len(), 36);
        for tri in mesh.indices().chunks(3) {
            let p = |i: u32| Vec3::from_array(mesh.vertices()[i as usize].position);
            let n = Vec3::from_array(mesh.vertices()[tri[0] as usize].normal);
            let face = (p(tri[1]) - p(tri[0])).cross(p(tri[2]) - p(tri[0]));
            assert!(face.dot(n) > 0.0);
        }
    }

    #[test]
    fn plane_faces_up() {
        let mesh = plane("p", 5.0, Arc::new(Material::new("m"))).unwrap();
        let v = mesh.vertices();
        let face = (Vec3::from_array(v[1].position) - Vec3::from_array(v[0].position))
            .cross(Vec3::from_array(v[2].position) - Vec3::from_array(v[0].position));
        assert!(face.y > 0.0);
    }

    #[test]
    fn checker_alternates() {
        let t = checker_texture("c", 4, 2, [0; 4], [255; 4]).unwrap();
        assert_eq!(&t.pixels()[0..4], &[0; 4]);
        assert_eq!(&t.pixels()[8..12], &[255; 4]);
    }
}
