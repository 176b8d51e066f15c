// SPDX-License-Identifier: CEPL-1.0
//! Window provider. The renderer only needs raw handles and the current
//! framebuffer size; everything else stays on the winit side.

pub use winit;

use umbra_render::RenderSize;
use winit::dpi::PhysicalSize;
use winit::window::Window;

pub fn framebuffer_size(window: &Window) -> RenderSize {
    to_render_size(window.inner_size())
}

pub fn to_render_size(size: PhysicalSize<u32>) -> RenderSize {
    RenderSize {
        width: size.width,
        height: size.height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_window_is_empty() {
        assert!(to_render_size(PhysicalSize::new(0, 720)).is_empty());
        assert!(!to_render_size(PhysicalSize::new(1280, 720)).is_empty());
    }
}
