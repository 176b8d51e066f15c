// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

mod config;
pub mod gpu;
mod light;
mod material;
mod mesh;
pub mod primitives;
mod scene;
mod texture;

pub use config::RendererConfig;
pub use light::{Light, LightType, ShadowViews, MAX_SHADOW_VIEWS};
pub use material::{Material, TextureSlot, TextureSlots};
pub use mesh::{Mesh, Model};
pub use scene::{Camera, Scene};
pub use texture::Texture;
pub use umbra_core::ResourceId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect(&self) -> f32 {
        self.width.max(1) as f32 / self.height.max(1) as f32
    }
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        config: &RendererConfig,
    ) -> Result<Self>
    where
        Self: Sized;

    /// Register every resource the scene references. Must run before the
    /// first `render` that draws them; repeated calls are cheap no-ops for
    /// resources already resident.
    fn upload(&mut self, scene: &Scene) -> Result<()>;

    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self, scene: &Scene) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    fn set_vsync(&mut self, _on: bool) {}
    fn request_shadow_resize(&mut self, _size: u32) {}
}
