// SPDX-License-Identifier: CEPL-1.0
use crate::gpu::MaterialUniform;
use crate::texture::Texture;
use bitflags::bitflags;
use std::sync::Arc;
use umbra_core::ResourceId;
use umbra_math::Vec3;

/// Texture slots of a material, in descriptor array order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureSlot {
    Albedo = 0,
    Emissive = 1,
    Roughness = 2,
    Alpha = 3,
    Normal = 4,
}

impl TextureSlot {
    pub const COUNT: usize = 5;
    pub const ALL: [TextureSlot; Self::COUNT] = [
        TextureSlot::Albedo,
        TextureSlot::Emissive,
        TextureSlot::Roughness,
        TextureSlot::Alpha,
        TextureSlot::Normal,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn flag(self) -> TextureSlots {
        TextureSlots::from_bits_truncate(1 << self.index())
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TextureSlots: u32 {
        const ALBEDO = 1 << 0;
        const EMISSIVE = 1 << 1;
        const ROUGHNESS = 1 << 2;
        const ALPHA = 1 << 3;
        const NORMAL = 1 << 4;
    }
}

#[derive(Debug)]
pub struct Material {
    id: ResourceId,
    pub name: String,
    pub albedo: Vec3,
    pub emissive: Vec3,
    pub roughness: f32,
    pub shininess: f32,
    pub alpha: f32,
    textures: [Option<Arc<Texture>>; TextureSlot::COUNT],
}

impl Material {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::next(),
            name: name.into(),
            albedo: Vec3::ONE,
            emissive: Vec3::ZERO,
            roughness: 0.5,
            shininess: 32.0,
            alpha: 1.0,
            textures: Default::default(),
        }
    }

    pub fn with_albedo(mut self, albedo: Vec3) -> Self {
        self.albedo = albedo;
        self
    }

    pub fn with_emissive(mut self, emissive: Vec3) -> Self {
        self.emissive = emissive;
        self
    }

    pub fn with_texture(mut self, slot: TextureSlot, texture: Arc<Texture>) -> Self {
        self.set_texture(slot, texture);
        self
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn set_texture(&mut self, slot: TextureSlot, texture: Arc<Texture>) {
        self.textures[slot.index()] = Some(texture);
    }

    pub fn texture(&self, slot: TextureSlot) -> Option<&Arc<Texture>> {
        self.textures[slot.index()].as_ref()
    }

    /// Bound textures with their slot; unset slots are skipped.
    pub fn textures(&self) -> impl Iterator<Item = (TextureSlot, &Arc<Texture>)> {
        TextureSlot::ALL
            .into_iter()
            .filter_map(|slot| self.texture(slot).map(|t| (slot, t)))
    }

    pub fn bound_slots(&self) -> TextureSlots {
        self.textures()
            .fold(TextureSlots::empty(), |acc, (slot, _)| acc | slot.flag())
    }

    pub fn uniform(&self) -> MaterialUniform {
        MaterialUniform {
            albedo: self.albedo.extend(self.alpha).to_array(),
            emissive: self.emissive.extend(0.0).to_array(),
            params: [self.roughness, self.shininess, 0.0, 0.0],
            texture_slots: self.bound_slots().bits(),
            _pad: [0; 3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_flags_follow_array_order() {
        assert_eq!(TextureSlot::Albedo.flag(), TextureSlots::ALBEDO);
        assert_eq!(TextureSlot::Normal.flag(), TextureSlots::NORMAL);
        for (i, slot) in TextureSlot::ALL.iter().enumerate() {
            assert_eq!(slot.index(), i);
        }
    }

    #[test]
    fn uniform_packs_params_and_bound_slots() {
        let normal = Arc::new(Texture::solid("n", [128, 128, 255, 255], false));
        let mut m = Material::new("m").with_albedo(Vec3::new(0.5, 0.25, 1.0));
        m.alpha = 0.75;
        m.roughness = 0.9;
        m.set_texture(TextureSlot::Normal, normal);

        let u = m.uniform();
        assert_eq!(u.albedo, [0.5, 0.25, 1.0, 0.75]);
        assert_eq!(u.params[0], 0.9);
        assert_eq!(u.texture_slots, TextureSlots::NORMAL.bits());
        assert_eq!(m.textures().count(), 1);
    }
}
