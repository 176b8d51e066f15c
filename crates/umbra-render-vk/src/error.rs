// SPDX-License-Identifier: CEPL-1.0
use crate::registry::{PoolKind, ResourceKind};
use ash::vk;
use thiserror::Error;
use umbra_core::ResourceId;

/// Failures the renderer cannot recover from. Out-of-date/suboptimal
/// presentation never shows up here; it is handled by recreation.
#[derive(Debug, Error)]
pub enum VkError {
    #[error("Vulkan call failed: {0}")]
    Vk(#[from] vk::Result),

    #[error("no suitable physical device (needs graphics + present queues, VK_KHR_swapchain and VK_KHR_maintenance1)")]
    NoSuitableDevice,

    #[error("required instance layer {0} is not available")]
    MissingLayer(String),

    #[error("no memory type in bits {type_bits:#x} has {props:?}")]
    NoMemoryType {
        type_bits: u32,
        props: vk::MemoryPropertyFlags,
    },

    #[error("unsupported image layout transition {old:?} -> {new:?}")]
    UnsupportedTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("format {0:?} does not support linear blit filtering")]
    LinearBlitUnsupported(vk::Format),

    #[error("{0:?} descriptor pool exhausted")]
    PoolExhausted(PoolKind),

    #[error("no {kind:?} record for resource {id}")]
    RecordNotFound { kind: ResourceKind, id: ResourceId },

    #[error("texture {texture} is still bound by material {material}")]
    TextureInUse {
        texture: ResourceId,
        material: ResourceId,
    },

    #[error("light record has not been created")]
    LightNotCreated,

    #[error("{op} is not valid while {phase}")]
    InvalidPhase { op: &'static str, phase: &'static str },

    #[error("frame slot {slot} out of range ({frames} frames in flight)")]
    SlotOutOfRange { slot: usize, frames: usize },

    #[error("shader {name}: {reason}")]
    Shader { name: String, reason: String },
}
