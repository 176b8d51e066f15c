// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend: device, presentation, resource upload, the GPU record
//! registry and the main + shadow passes.

pub mod device;
pub mod error;
pub mod frame;
pub mod handles;
pub mod pipeline;
pub mod records;
pub mod registry;
mod renderer;
pub mod shadows;
pub mod swapchain;
pub mod upload;

pub use error::VkError;
pub use registry::{PoolKind, ResourceKind};
pub use renderer::VkRenderer;
