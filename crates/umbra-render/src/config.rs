// SPDX-License-Identifier: CEPL-1.0
use serde::Deserialize;
use std::path::PathBuf;

pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub clear_color: [f32; 4],
    pub vsync: bool,
    pub max_frames_in_flight: usize,
    pub shadow_map_size: u32,
    /// Descriptor pool capacity for materials. Fixed once the pool exists.
    pub max_materials: u32,
    /// Descriptor pool capacity for model instances (each takes one set per
    /// frame in flight).
    pub max_models: u32,
    /// Directory searched for `<name>.spv` before the built-in shaders.
    pub shader_dir: PathBuf,
    pub validation: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.02, 0.02, 0.04, 1.0],
            vsync: true,
            max_frames_in_flight: 3,
            shadow_map_size: 2048,
            max_materials: 256,
            max_models: 1024,
            shader_dir: PathBuf::from("shaders"),
            validation: cfg!(debug_assertions),
        }
    }
}

impl RendererConfig {
    pub fn frames_in_flight(&self) -> usize {
        self.max_frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT)
    }

    /// Shadow map edge, even so the point-light quadrants split exactly.
    pub fn shadow_extent(&self) -> u32 {
        self.shadow_map_size.max(64) & !1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_in_flight_is_clamped() {
        let mut cfg = RendererConfig::default();
        cfg.max_frames_in_flight = 0;
        assert_eq!(cfg.frames_in_flight(), 1);
        cfg.max_frames_in_flight = 9;
        assert_eq!(cfg.frames_in_flight(), MAX_FRAMES_IN_FLIGHT);
    }

    #[test]
    fn shadow_extent_is_even_and_bounded() {
        let mut cfg = RendererConfig::default();
        cfg.shadow_map_size = 1025;
        assert_eq!(cfg.shadow_extent(), 1024);
        cfg.shadow_map_size = 3;
        assert_eq!(cfg.shadow_extent(), 64);
    }
}
