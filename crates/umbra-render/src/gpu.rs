// SPDX-License-Identifier: CEPL-1.0
//! Byte layouts shared with the shaders. Uniform blocks follow std140: every
//! member below is a vec4/mat4 (or padded to one) so `#[repr(C)]` matches.

use bytemuck::{Pod, Zeroable};
use std::mem::{offset_of, size_of};

pub const MAX_LIGHTS: usize = 16;
pub const SHADOW_SLOTS: usize = 4;

pub type Mat4Cols = [[f32; 4]; 4];

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub tangent: [f32; 3],
}

impl Vertex {
    pub const STRIDE: u32 = size_of::<Vertex>() as u32;
    /// Byte offsets of position, normal, uv, tangent (locations 0..=3).
    pub const OFFSETS: [u32; 4] = [
        offset_of!(Vertex, position) as u32,
        offset_of!(Vertex, normal) as u32,
        offset_of!(Vertex, uv) as u32,
        offset_of!(Vertex, tangent) as u32,
    ];
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MaterialUniform {
    /// rgb albedo, a = alpha
    pub albedo: [f32; 4],
    /// rgb emissive, a unused
    pub emissive: [f32; 4],
    /// x = roughness, y = shininess, z/w unused
    pub params: [f32; 4],
    /// `TextureSlots` bits for the slots holding a real texture.
    pub texture_slots: u32,
    pub _pad: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ModelUniform {
    pub model: Mat4Cols,
    pub view: Mat4Cols,
    pub proj: Mat4Cols,
    pub camera_position: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GpuLight {
    /// xyz position, w = light type (0 directional, 1 spot, 2 point)
    pub position: [f32; 4],
    /// xyz direction, w = range
    pub direction: [f32; 4],
    /// rgb color, w = intensity
    pub color: [f32; 4],
    /// x = cos(inner cone), y = cos(outer cone)
    pub cone: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct LightUniform {
    pub lights: [GpuLight; MAX_LIGHTS],
    pub light_space: [Mat4Cols; SHADOW_SLOTS],
    /// rgb ambient term
    pub ambient: [f32; 4],
    pub light_count: u32,
    /// Index into `lights` of the shadow caster, -1 for none.
    pub shadow_light: i32,
    /// Number of valid `light_space` matrices (1 or 4).
    pub shadow_views: u32,
    pub _pad: u32,
}

impl Default for LightUniform {
    fn default() -> Self {
        Self {
            shadow_light: -1,
            ..Zeroable::zeroed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout() {
        assert_eq!(Vertex::STRIDE, 44);
        assert_eq!(Vertex::OFFSETS, [0, 12, 24, 32]);
    }

    #[test]
    fn uniform_sizes_are_vec4_multiples() {
        assert_eq!(size_of::<MaterialUniform>(), 64);
        assert_eq!(size_of::<ModelUniform>(), 208);
        assert_eq!(size_of::<GpuLight>(), 64);
        assert_eq!(size_of::<LightUniform>(), 64 * MAX_LIGHTS + 64 * SHADOW_SLOTS + 32);
        for s in [
            size_of::<MaterialUniform>(),
            size_of::<ModelUniform>(),
            size_of::<LightUniform>(),
        ] {
            assert_eq!(s % 16, 0);
        }
    }

    #[test]
    fn light_uniform_std140_offsets() {
        assert_eq!(offset_of!(LightUniform, light_space), 1024);
        assert_eq!(offset_of!(LightUniform, ambient), 1280);
        assert_eq!(offset_of!(LightUniform, light_count), 1296);
        assert_eq!(offset_of!(LightUniform, shadow_light), 1300);
    }

    #[test]
    fn default_light_uniform_has_no_caster() {
        let u = LightUniform::default();
        assert_eq!(u.shadow_light, -1);
        assert_eq!(u.light_count, 0);
    }
}
