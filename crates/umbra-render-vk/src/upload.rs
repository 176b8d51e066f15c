// SPDX-License-Identifier: CEPL-1.0
//! Buffer/image creation and the blocking CPU -> GPU transfer path.
//! Every transfer records a one-shot command buffer and waits for the
//! graphics queue to go idle before returning.

use crate::device::DeviceContext;
use crate::error::VkError;
use crate::handles::{OwnedBuffer, OwnedImage, OwnedImageView};
use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

/// `floor(log2(max(w, h))) + 1`
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    u32::BITS - width.max(height).max(1).leading_zeros()
}

/// Extent of every level, base first; each dimension halves down to 1.
pub fn mip_extents(width: u32, height: u32) -> Vec<(u32, u32)> {
    let levels = mip_level_count(width, height);
    let (mut w, mut h) = (width.max(1), height.max(1));
    let mut out = Vec::with_capacity(levels as usize);
    for _ in 0..levels {
        out.push((w, h));
        w = (w / 2).max(1);
        h = (h / 2).max(1);
    }
    out
}

/// Color data is stored sRGB, data maps (normals, roughness) linear.
pub fn texture_format(contains_color_data: bool) -> vk::Format {
    if contains_color_data {
        vk::Format::R8G8B8A8_SRGB
    } else {
        vk::Format::R8G8B8A8_UNORM
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Barrier masks for the two transitions texture upload needs.
pub fn transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<TransitionMasks, VkError> {
    use vk::ImageLayout as L;
    match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => Ok(TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }),
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => Ok(TransitionMasks {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        }),
        _ => Err(VkError::UnsupportedTransition { old, new }),
    }
}

fn color_range(base_mip_level: u32, level_count: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level,
        level_count,
        base_array_layer: 0,
        layer_count: 1,
    }
}

pub fn create_buffer(
    ctx: &Arc<DeviceContext>,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    props: vk::MemoryPropertyFlags,
) -> Result<OwnedBuffer> {
    let d = ctx.device();
    let bci = vk::BufferCreateInfo {
        s_type: vk::StructureType::BUFFER_CREATE_INFO,
        size,
        usage,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        ..Default::default()
    };
    unsafe {
        let buffer = d.create_buffer(&bci, None).context("create_buffer")?;
        let req = d.get_buffer_memory_requirements(buffer);
        let memory_type_index = match ctx.find_memory_type(req.memory_type_bits, props) {
            Ok(i) => i,
            Err(e) => {
                d.destroy_buffer(buffer, None);
                return Err(e.into());
            }
        };
        let mai = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index,
            ..Default::default()
        };
        let memory = back_with_memory(
            || d.allocate_memory(&mai, None),
            |m| d.bind_buffer_memory(buffer, m, 0),
            || d.destroy_buffer(buffer, None),
            |m| d.free_memory(m, None),
        )
        .context("back buffer with memory")?;
        Ok(OwnedBuffer::new(ctx, buffer, memory, size))
    }
}

/// Allocate and bind memory for a freshly created handle. On failure the
/// handle is destroyed and any allocated memory freed before returning.
fn back_with_memory<M: Copy, E>(
    allocate: impl FnOnce() -> Result<M, E>,
    bind: impl FnOnce(M) -> Result<(), E>,
    destroy: impl FnOnce(),
    free: impl FnOnce(M),
) -> Result<M, E> {
    let memory = match allocate() {
        Ok(m) => m,
        Err(e) => {
            destroy();
            return Err(e);
        }
    };
    if let Err(e) = bind(memory) {
        destroy();
        free(memory);
        return Err(e);
    }
    Ok(memory)
}

/// Host-visible staging buffer already holding `bytes`.
pub fn create_staging(ctx: &Arc<DeviceContext>, bytes: &[u8]) -> Result<OwnedBuffer> {
    let staging = create_buffer(
        ctx,
        bytes.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    staging.fill(0, bytes)?;
    Ok(staging)
}

#[allow(clippy::too_many_arguments)]
pub fn create_image(
    ctx: &Arc<DeviceContext>,
    width: u32,
    height: u32,
    mip_levels: u32,
    samples: vk::SampleCountFlags,
    format: vk::Format,
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
    props: vk::MemoryPropertyFlags,
) -> Result<OwnedImage> {
    let d = ctx.device();
    let ici = vk::ImageCreateInfo {
        s_type: vk::StructureType::IMAGE_CREATE_INFO,
        image_type: vk::ImageType::TYPE_2D,
        format,
        extent: vk::Extent3D {
            width,
            height,
            depth: 1,
        },
        mip_levels,
        array_layers: 1,
        samples,
        tiling,
        usage,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        ..Default::default()
    };
    unsafe {
        let image = d.create_image(&ici, None).context("create_image")?;
        let req = d.get_image_memory_requirements(image);
        let memory_type_index = match ctx.find_memory_type(req.memory_type_bits, props) {
            Ok(i) => i,
            Err(e) => {
                d.destroy_image(image, None);
                return Err(e.into());
            }
        };
        let mai = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index,
            ..Default::default()
        };
        let memory = back_with_memory(
            || d.allocate_memory(&mai, None),
            |m| d.bind_image_memory(image, m, 0),
            || d.destroy_image(image, None),
            |m| d.free_memory(m, None),
        )
        .context("back image with memory")?;
        Ok(OwnedImage::new(
            ctx,
            image,
            memory,
            format,
            vk::Extent2D { width, height },
            mip_levels,
        ))
    }
}

pub fn create_image_view(
    ctx: &Arc<DeviceContext>,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
) -> Result<OwnedImageView> {
    let ci = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image,
        view_type: vk::ImageViewType::TYPE_2D,
        format,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    };
    let view = unsafe { ctx.device().create_image_view(&ci, None) }.context("create_image_view")?;
    Ok(OwnedImageView::new(ctx, view))
}

pub fn copy_buffer(
    ctx: &DeviceContext,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) -> Result<()> {
    ctx.one_shot(|d, cmd| unsafe {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        d.cmd_copy_buffer(cmd, src, dst, &[region]);
    })
    .context("copy_buffer")
}

pub fn copy_buffer_to_image(
    ctx: &DeviceContext,
    buffer: vk::Buffer,
    image: vk::Image,
    width: u32,
    height: u32,
) -> Result<()> {
    ctx.one_shot(|d, cmd| unsafe {
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
        };
        d.cmd_copy_buffer_to_image(
            cmd,
            buffer,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    })
    .context("copy_buffer_to_image")
}

pub fn transition_image_layout(
    ctx: &DeviceContext,
    image: vk::Image,
    _format: vk::Format,
    mip_levels: u32,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let masks = transition_masks(old, new)?;
    ctx.one_shot(|d, cmd| unsafe {
        let barrier = vk::ImageMemoryBarrier {
            s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
            src_access_mask: masks.src_access,
            dst_access_mask: masks.dst_access,
            old_layout: old,
            new_layout: new,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image,
            subresource_range: color_range(0, mip_levels),
            ..Default::default()
        };
        d.cmd_pipeline_barrier(
            cmd,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    })
    .with_context(|| format!("transition {old:?} -> {new:?}"))
}

/// Fill levels 1.. by successive LINEAR blits. Expects every level in
/// TRANSFER_DST_OPTIMAL and leaves every level in SHADER_READ_ONLY_OPTIMAL.
pub fn generate_mipmaps(
    ctx: &DeviceContext,
    image: vk::Image,
    format: vk::Format,
    width: u32,
    height: u32,
    mip_levels: u32,
) -> Result<()> {
    let features = ctx.format_properties(format).optimal_tiling_features;
    if !features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR) {
        return Err(VkError::LinearBlitUnsupported(format).into());
    }

    let extents = mip_extents(width, height);
    ctx.one_shot(|d, cmd| unsafe {
        let barrier = |level: u32,
                       old: vk::ImageLayout,
                       new: vk::ImageLayout,
                       src_access: vk::AccessFlags,
                       dst_access: vk::AccessFlags| vk::ImageMemoryBarrier {
            s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
            src_access_mask: src_access,
            dst_access_mask: dst_access,
            old_layout: old,
            new_layout: new,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image,
            subresource_range: color_range(level, 1),
            ..Default::default()
        };

        for level in 1..mip_levels {
            let (sw, sh) = extents[level as usize - 1];
            let (dw, dh) = extents[level as usize];

            // previous level becomes the blit source
            let to_src = barrier(
                level - 1,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::TRANSFER_READ,
            );
            d.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_src],
            );

            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level - 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                src_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: sw as i32,
                        y: sh as i32,
                        z: 1,
                    },
                ],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                dst_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: dw as i32,
                        y: dh as i32,
                        z: 1,
                    },
                ],
            };
            d.cmd_blit_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );

            let done = barrier(
                level - 1,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::TRANSFER_READ,
                vk::AccessFlags::SHADER_READ,
            );
            d.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[done],
            );
        }

        // last level was only ever written
        let last = barrier(
            mip_levels - 1,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
        );
        d.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[last],
        );
    })
    .context("generate_mipmaps")
}

pub struct UploadedImage {
    pub image: OwnedImage,
    pub view: OwnedImageView,
}

/// The one seam records use to move data onto the GPU.
pub trait Upload {
    /// Device-local buffer with `usage | TRANSFER_DST` holding `bytes`.
    fn upload_buffer(&self, bytes: &[u8], usage: vk::BufferUsageFlags) -> Result<OwnedBuffer>;

    /// Sampled, fully mipmapped image in SHADER_READ_ONLY_OPTIMAL.
    fn upload_texture(
        &self,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: vk::Format,
    ) -> Result<UploadedImage>;
}

/// Synchronous uploader: each call blocks until the queue is idle.
pub struct BlockingUploader {
    ctx: Arc<DeviceContext>,
}

impl BlockingUploader {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self { ctx }
    }
}

impl Upload for BlockingUploader {
    fn upload_buffer(&self, bytes: &[u8], usage: vk::BufferUsageFlags) -> Result<OwnedBuffer> {
        let staging = create_staging(&self.ctx, bytes)?;
        let dst = create_buffer(
            &self.ctx,
            bytes.len() as vk::DeviceSize,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        copy_buffer(&self.ctx, staging.raw(), dst.raw(), staging.size())?;
        Ok(dst)
    }

    fn upload_texture(
        &self,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: vk::Format,
    ) -> Result<UploadedImage> {
        let mip_levels = mip_level_count(width, height);
        // fail before any allocation when the chain cannot be blitted
        if mip_levels > 1
            && !self
                .ctx
                .format_properties(format)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
        {
            return Err(VkError::LinearBlitUnsupported(format).into());
        }

        let staging = create_staging(&self.ctx, pixels)?;
        let image = create_image(
            &self.ctx,
            width,
            height,
            mip_levels,
            vk::SampleCountFlags::TYPE_1,
            format,
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        // STRICT ORDER: all levels to TRANSFER_DST, copy level 0, then either
        // the blit chain or a plain transition leaves everything sampled-ready.
        transition_image_layout(
            &self.ctx,
            image.raw(),
            format,
            mip_levels,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        copy_buffer_to_image(&self.ctx, staging.raw(), image.raw(), width, height)?;
        if mip_levels > 1 {
            generate_mipmaps(&self.ctx, image.raw(), format, width, height, mip_levels)?;
        } else {
            transition_image_layout(
                &self.ctx,
                image.raw(),
                format,
                mip_levels,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )?;
        }

        let view = create_image_view(
            &self.ctx,
            image.raw(),
            format,
            vk::ImageAspectFlags::COLOR,
            mip_levels,
        )?;
        Ok(UploadedImage { image, view })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_count_matches_log2_rule() {
        assert_eq!(mip_level_count(256, 256), 9);
        assert_eq!(mip_level_count(255, 255), 8);
        assert_eq!(mip_level_count(512, 64), 10);
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(0, 0), 1);
    }

    #[test]
    fn square_chain_halves_to_one() {
        let chain = mip_extents(256, 256);
        assert_eq!(chain.len(), 9);
        assert_eq!(chain[0], (256, 256));
        assert_eq!(chain[1], (128, 128));
        assert_eq!(chain[8], (1, 1));
    }

    #[test]
    fn non_square_chain_clamps_short_side() {
        let chain = mip_extents(8, 2);
        assert_eq!(chain, vec![(8, 2), (4, 1), (2, 1), (1, 1)]);
    }

    #[test]
    fn single_texel_has_one_level() {
        assert_eq!(mip_extents(1, 1), vec![(1, 1)]);
    }

    #[test]
    fn color_textures_are_srgb() {
        assert_eq!(texture_format(true), vk::Format::R8G8B8A8_SRGB);
        assert_eq!(texture_format(false), vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn upload_transitions_are_supported() {
        let to_dst = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_dst.src_access, vk::AccessFlags::empty());
        assert_eq!(to_dst.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_dst.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(to_dst.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let to_read = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_read.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_read.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(to_read.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn other_transitions_are_rejected() {
        let pairs = [
            (
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
            (
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
            (
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ),
        ];
        for (old, new) in pairs {
            match transition_masks(old, new) {
                Err(VkError::UnsupportedTransition { old: o, new: n }) => {
                    assert_eq!((o, n), (old, new));
                }
                other => panic!("expected rejection for {old:?} -> {new:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn failed_backing_releases_everything_it_made() {
        use std::cell::RefCell;

        let log = RefCell::new(Vec::new());
        let oom = vk::Result::ERROR_OUT_OF_DEVICE_MEMORY;

        let r = back_with_memory(
            || Err::<u64, _>(oom),
            |_| Ok(()),
            || log.borrow_mut().push("destroy"),
            |_| log.borrow_mut().push("free"),
        );
        assert_eq!(r, Err(oom));
        assert_eq!(*log.borrow(), vec!["destroy"]);

        log.borrow_mut().clear();
        let r = back_with_memory(
            || Ok(7u64),
            |_| Err(oom),
            || log.borrow_mut().push("destroy"),
            |m| log.borrow_mut().push(if m == 7 { "free" } else { "free other" }),
        );
        assert_eq!(r, Err(oom));
        assert_eq!(*log.borrow(), vec!["destroy", "free"]);

        log.borrow_mut().clear();
        let r = back_with_memory(
            || Ok::<_, vk::Result>(7u64),
            |_| Ok(()),
            || log.borrow_mut().push("destroy"),
            |_| log.borrow_mut().push("free"),
        );
        assert_eq!(r, Ok(7));
        assert!(log.borrow().is_empty());
    }
}
