// SPDX-License-Identifier: CEPL-1.0
use anyhow::{ensure, Result};
use umbra_core::ResourceId;

/// Decoded RGBA8 image as handed over by the asset loader.
#[derive(Debug)]
pub struct Texture {
    id: ResourceId,
    name: String,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    contains_color_data: bool,
}

impl Texture {
    /// `contains_color_data` selects an sRGB GPU format; set it to false for
    /// normal/roughness/alpha maps so they are sampled linearly.
    pub fn from_rgba8(
        name: impl Into<String>,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
        contains_color_data: bool,
    ) -> Result<Self> {
        let name = name.into();
        ensure!(width > 0 && height > 0, "texture '{name}' has zero extent");
        let expected = width as usize * height as usize * 4;
        ensure!(
            pixels.len() == expected,
            "texture '{name}': {} bytes for {width}x{height} RGBA8 (expected {expected})",
            pixels.len()
        );
        Ok(Self {
            id: ResourceId::next(),
            name,
            width,
            height,
            pixels,
            contains_color_data,
        })
    }

    pub fn solid(name: impl Into<String>, rgba: [u8; 4], contains_color_data: bool) -> Self {
        Self {
            id: ResourceId::next(),
            name: name.into(),
            width: 1,
            height: 1,
            pixels: rgba.to_vec(),
            contains_color_data,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn contains_color_data(&self) -> bool {
        self.contains_color_data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_pixel_buffer() {
        assert!(Texture::from_rgba8("bad", 2, 2, vec![0; 15], true).is_err());
        assert!(Texture::from_rgba8("empty", 0, 4, vec![], true).is_err());
    }

    #[test]
    fn each_texture_gets_its_own_id() {
        let a = Texture::solid("a", [255; 4], true);
        let b = Texture::solid("b", [255; 4], true);
        assert_ne!(a.id(), b.id());
    }
}
