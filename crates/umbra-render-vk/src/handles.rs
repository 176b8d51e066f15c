// SPDX-License-Identifier: CEPL-1.0
//! Owning wrappers for device objects. Each one keeps the device alive and
//! releases its object on drop, so records and passes never destroy by hand.

use crate::device::DeviceContext;
use anyhow::{ensure, Result};
use ash::vk;
use std::ptr::NonNull;
use std::sync::Arc;

macro_rules! owned_handle {
    ($(#[$meta:meta])* $name:ident, $raw:ty, $destroy:ident) => {
        $(#[$meta])*
        pub struct $name {
            ctx: Arc<DeviceContext>,
            raw: $raw,
        }

        impl $name {
            pub(crate) fn new(ctx: &Arc<DeviceContext>, raw: $raw) -> Self {
                Self {
                    ctx: Arc::clone(ctx),
                    raw,
                }
            }

            pub fn raw(&self) -> $raw {
                self.raw
            }

            #[allow(dead_code)]
            pub(crate) fn ctx(&self) -> &Arc<DeviceContext> {
                &self.ctx
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                unsafe { self.ctx.device().$destroy(self.raw, None) };
            }
        }
    };
}

owned_handle!(OwnedImageView, vk::ImageView, destroy_image_view);
owned_handle!(OwnedSampler, vk::Sampler, destroy_sampler);
owned_handle!(OwnedRenderPass, vk::RenderPass, destroy_render_pass);
owned_handle!(OwnedFramebuffer, vk::Framebuffer, destroy_framebuffer);
owned_handle!(OwnedSemaphore, vk::Semaphore, destroy_semaphore);
owned_handle!(OwnedFence, vk::Fence, destroy_fence);
owned_handle!(OwnedShaderModule, vk::ShaderModule, destroy_shader_module);
owned_handle!(OwnedPipelineLayout, vk::PipelineLayout, destroy_pipeline_layout);
owned_handle!(OwnedPipeline, vk::Pipeline, destroy_pipeline);
owned_handle!(
    OwnedSetLayout,
    vk::DescriptorSetLayout,
    destroy_descriptor_set_layout
);
owned_handle!(
    /// Destroying the pool implicitly frees any sets still allocated from it.
    OwnedDescriptorPool,
    vk::DescriptorPool,
    destroy_descriptor_pool
);

pub struct OwnedBuffer {
    ctx: Arc<DeviceContext>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
}

impl OwnedBuffer {
    pub(crate) fn new(
        ctx: &Arc<DeviceContext>,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        size: vk::DeviceSize,
    ) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            buffer,
            memory,
            size,
        }
    }

    pub fn raw(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Map, copy `bytes` at `offset`, unmap. Memory must be host visible + coherent.
    pub fn fill(&self, offset: vk::DeviceSize, bytes: &[u8]) -> Result<()> {
        ensure!(
            offset + bytes.len() as vk::DeviceSize <= self.size,
            "write of {} bytes at {offset} overflows buffer of {} bytes",
            bytes.len(),
            self.size
        );
        unsafe {
            let d = self.ctx.device();
            let ptr = d.map_memory(
                self.memory,
                offset,
                bytes.len() as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
            d.unmap_memory(self.memory);
        }
        Ok(())
    }
}

impl Drop for OwnedBuffer {
    fn drop(&mut self) {
        unsafe {
            let d = self.ctx.device();
            d.destroy_buffer(self.buffer, None);
            d.free_memory(self.memory, None);
        }
    }
}

/// Host-visible buffer mapped once for its whole lifetime.
pub struct MappedBuffer {
    buffer: OwnedBuffer,
    ptr: NonNull<u8>,
}

impl MappedBuffer {
    pub(crate) fn new(buffer: OwnedBuffer) -> Result<Self> {
        let raw = unsafe {
            buffer.ctx.device().map_memory(
                buffer.memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )?
        };
        let ptr = NonNull::new(raw.cast::<u8>())
            .ok_or_else(|| anyhow::anyhow!("map_memory returned null"))?;
        Ok(Self { buffer, ptr })
    }

    pub fn raw(&self) -> vk::Buffer {
        self.buffer.raw()
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        ensure!(
            offset + bytes.len() <= self.buffer.size() as usize,
            "write of {} bytes at {offset} overflows mapped buffer of {} bytes",
            bytes.len(),
            self.buffer.size()
        );
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(offset),
                bytes.len(),
            );
        }
        Ok(())
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        // unmap before the inner buffer frees its memory
        unsafe { self.buffer.ctx.device().unmap_memory(self.buffer.memory) };
    }
}

pub struct OwnedImage {
    ctx: Arc<DeviceContext>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    format: vk::Format,
    extent: vk::Extent2D,
    mip_levels: u32,
}

impl OwnedImage {
    pub(crate) fn new(
        ctx: &Arc<DeviceContext>,
        image: vk::Image,
        memory: vk::DeviceMemory,
        format: vk::Format,
        extent: vk::Extent2D,
        mip_levels: u32,
    ) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            image,
            memory,
            format,
            extent,
            mip_levels,
        }
    }

    pub fn raw(&self) -> vk::Image {
        self.image
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }
}

impl Drop for OwnedImage {
    fn drop(&mut self) {
        unsafe {
            let d = self.ctx.device();
            d.destroy_image(self.image, None);
            d.free_memory(self.memory, None);
        }
    }
}

/// Descriptor sets handed back to their pool on drop. The pool must have
/// been created with FREE_DESCRIPTOR_SET.
pub struct DescriptorSets {
    ctx: Arc<DeviceContext>,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
}

impl DescriptorSets {
    pub(crate) fn new(
        ctx: &Arc<DeviceContext>,
        pool: vk::DescriptorPool,
        sets: Vec<vk::DescriptorSet>,
    ) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            pool,
            sets,
        }
    }

    pub fn get(&self, index: usize) -> vk::DescriptorSet {
        self.sets[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = vk::DescriptorSet> + '_ {
        self.sets.iter().copied()
    }
}

impl Drop for DescriptorSets {
    fn drop(&mut self) {
        if !self.sets.is_empty() {
            unsafe {
                self.ctx
                    .device()
                    .free_descriptor_sets(self.pool, &self.sets)
                    .ok();
            }
        }
    }
}
