// SPDX-License-Identifier: CEPL-1.0
//! Swap chain plus everything sized by it: image views, depth target,
//! main render pass and framebuffers.

use crate::device::DeviceContext;
use crate::frame::create_semaphore;
use crate::handles::{OwnedFramebuffer, OwnedImage, OwnedImageView, OwnedRenderPass, OwnedSemaphore};
use crate::upload::{create_image, create_image_view};
use anyhow::{Context, Result};
use ash::khr::swapchain;
use ash::vk;
use std::sync::Arc;
use tracing::info;
use umbra_render::RenderSize;

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    [vk::Format::B8G8R8A8_SRGB, vk::Format::R8G8B8A8_SRGB]
        .into_iter()
        .find_map(|want| {
            formats.iter().copied().find(|f| {
                f.format == want && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .or_else(|| formats.first().copied())
        .unwrap_or(vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        })
}

/// vsync on: FIFO (always available). Off: MAILBOX, then IMMEDIATE, then FIFO.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 means no maximum).
pub fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    if caps.max_image_count == 0 {
        caps.min_image_count + 1
    } else {
        (caps.min_image_count + 1).min(caps.max_image_count)
    }
}

pub enum Acquired {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

struct DepthTarget {
    view: OwnedImageView,
    _image: OwnedImage,
}

pub struct Presentation {
    ctx: Arc<DeviceContext>,
    loader: swapchain::Device,
    swapchain: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    depth_format: vk::Format,
    framebuffers: Vec<OwnedFramebuffer>,
    render_pass: OwnedRenderPass,
    depth: DepthTarget,
    views: Vec<OwnedImageView>,
    /// Indexed by swap image, not by frame slot.
    render_finished: Vec<OwnedSemaphore>,
}

impl Presentation {
    pub fn new(ctx: &Arc<DeviceContext>, size: RenderSize, vsync: bool) -> Result<Self> {
        let loader = swapchain::Device::new(ctx.instance(), ctx.device());
        let depth_format = ctx.depth_format();
        let chain = create_swapchain(ctx, &loader, size, vsync, vk::SwapchainKHR::null())?;
        let render_pass = create_main_render_pass(ctx, chain.format.format, depth_format)?;
        let depth = create_depth_target(ctx, chain.extent, depth_format)?;
        let views = create_views(ctx, &loader, chain.swapchain, chain.format.format)?;
        let framebuffers = create_framebuffers(ctx, &render_pass, &views, &depth, chain.extent)?;
        let render_finished = (0..views.len())
            .map(|_| create_semaphore(ctx))
            .collect::<Result<_>>()?;

        Ok(Self {
            ctx: Arc::clone(ctx),
            loader,
            swapchain: chain.swapchain,
            format: chain.format,
            extent: chain.extent,
            depth_format,
            framebuffers,
            render_pass,
            depth,
            views,
            render_finished,
        })
    }

    // STRICT ORDER (recreate):
    // - device idle before anything sized by the old chain goes away
    // - framebuffers, views before the old swapchain
    // - render pass rebuilt only when the surface format changed
    /// Returns `true` when the color format changed, meaning pipelines built
    /// against the old render pass must be rebuilt too.
    pub fn recreate(&mut self, size: RenderSize, vsync: bool) -> Result<bool> {
        self.ctx.wait_idle()?;
        self.framebuffers.clear();
        self.views.clear();

        let old = self.swapchain;
        let chain = create_swapchain(&self.ctx, &self.loader, size, vsync, old)?;
        unsafe { self.loader.destroy_swapchain(old, None) };
        self.swapchain = chain.swapchain;

        let format_changed = chain.format.format != self.format.format;
        if format_changed {
            self.render_pass =
                create_main_render_pass(&self.ctx, chain.format.format, self.depth_format)?;
        }
        self.format = chain.format;
        self.extent = chain.extent;
        self.depth = create_depth_target(&self.ctx, chain.extent, self.depth_format)?;
        self.views = create_views(&self.ctx, &self.loader, chain.swapchain, chain.format.format)?;
        self.framebuffers = create_framebuffers(
            &self.ctx,
            &self.render_pass,
            &self.views,
            &self.depth,
            chain.extent,
        )?;
        if self.render_finished.len() != self.views.len() {
            self.render_finished = (0..self.views.len())
                .map(|_| create_semaphore(&self.ctx))
                .collect::<Result<_>>()?;
        }
        Ok(format_changed)
    }

    pub fn acquire(&self, signal: vk::Semaphore) -> Result<Acquired> {
        match unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, signal, vk::Fence::null())
        } {
            Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
            Err(e) => Err(e).context("acquire_next_image"),
        }
    }

    /// `Ok(true)` when the chain should be recreated (out of date or suboptimal).
    pub fn present(&self, image_index: u32) -> Result<bool> {
        let wait = self.render_finished(image_index);
        let info = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &self.swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        match unsafe { self.loader.queue_present(self.ctx.present_queue(), &info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e).context("queue_present"),
        }
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass.raw()
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers[image_index as usize].raw()
    }

    pub fn render_finished(&self, image_index: u32) -> vk::Semaphore {
        self.render_finished[image_index as usize].raw()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn image_count(&self) -> usize {
        self.views.len()
    }
}

impl Drop for Presentation {
    fn drop(&mut self) {
        // views of swap images must go before the swapchain itself
        self.framebuffers.clear();
        self.views.clear();
        unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
    }
}

struct Chain {
    swapchain: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
}

fn create_swapchain(
    ctx: &DeviceContext,
    loader: &swapchain::Device,
    size: RenderSize,
    vsync: bool,
    old_swapchain: vk::SwapchainKHR,
) -> Result<Chain> {
    let surf = ctx.surface_loader();
    let (caps, formats, modes) = unsafe {
        (
            surf.get_physical_device_surface_capabilities(ctx.phys(), ctx.surface())?,
            surf.get_physical_device_surface_formats(ctx.phys(), ctx.surface())?,
            surf.get_physical_device_surface_present_modes(ctx.phys(), ctx.surface())?,
        )
    };

    let format = choose_surface_format(&formats);
    let present_mode = choose_present_mode(&modes, vsync);
    let extent = extent_from_caps(&caps, size);
    let min_image_count = image_count(&caps);

    let pre_transform = if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    };

    let families = ctx.families();
    let family_indices = families.unique();
    let (sharing_mode, family_count) = if family_indices.len() > 1 {
        (vk::SharingMode::CONCURRENT, family_indices.len() as u32)
    } else {
        (vk::SharingMode::EXCLUSIVE, 0)
    };

    let ci = vk::SwapchainCreateInfoKHR {
        s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
        surface: ctx.surface(),
        min_image_count,
        image_format: format.format,
        image_color_space: format.color_space,
        image_extent: extent,
        image_array_layers: 1,
        image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        image_sharing_mode: sharing_mode,
        queue_family_index_count: family_count,
        p_queue_family_indices: family_indices.as_ptr(),
        pre_transform,
        composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
        present_mode,
        clipped: vk::TRUE,
        old_swapchain,
        ..Default::default()
    };
    let swapchain = unsafe { loader.create_swapchain(&ci, None) }.context("create_swapchain")?;

    info!(
        "swapchain ready: {}x{}, {:?} / {:?}, {:?}, min images {}",
        extent.width,
        extent.height,
        format.format,
        format.color_space,
        present_mode,
        min_image_count
    );
    Ok(Chain {
        swapchain,
        format,
        extent,
    })
}

fn create_views(
    ctx: &Arc<DeviceContext>,
    loader: &swapchain::Device,
    swapchain: vk::SwapchainKHR,
    format: vk::Format,
) -> Result<Vec<OwnedImageView>> {
    let images = unsafe { loader.get_swapchain_images(swapchain) }.context("get_swapchain_images")?;
    images
        .into_iter()
        .map(|image| create_image_view(ctx, image, format, vk::ImageAspectFlags::COLOR, 1))
        .collect()
}

fn create_depth_target(
    ctx: &Arc<DeviceContext>,
    extent: vk::Extent2D,
    format: vk::Format,
) -> Result<DepthTarget> {
    let image = create_image(
        ctx,
        extent.width,
        extent.height,
        1,
        vk::SampleCountFlags::TYPE_1,
        format,
        vk::ImageTiling::OPTIMAL,
        vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .context("depth image")?;
    let view = create_image_view(ctx, image.raw(), format, vk::ImageAspectFlags::DEPTH, 1)?;
    Ok(DepthTarget {
        view,
        _image: image,
    })
}

fn create_main_render_pass(
    ctx: &Arc<DeviceContext>,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> Result<OwnedRenderPass> {
    let attachments = [
        vk::AttachmentDescription {
            format: color_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            ..Default::default()
        },
        vk::AttachmentDescription {
            format: depth_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..Default::default()
        },
    ];
    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &color_ref,
        p_depth_stencil_attachment: &depth_ref,
        ..Default::default()
    };
    // acquire -> first color/depth write
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ..Default::default()
    };
    let ci = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: attachments.len() as u32,
        p_attachments: attachments.as_ptr(),
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    let pass = unsafe { ctx.device().create_render_pass(&ci, None) }.context("main render pass")?;
    Ok(OwnedRenderPass::new(ctx, pass))
}

fn create_framebuffers(
    ctx: &Arc<DeviceContext>,
    render_pass: &OwnedRenderPass,
    views: &[OwnedImageView],
    depth: &DepthTarget,
    extent: vk::Extent2D,
) -> Result<Vec<OwnedFramebuffer>> {
    views
        .iter()
        .map(|view| {
            let attachments = [view.raw(), depth.view.raw()];
            let ci = vk::FramebufferCreateInfo {
                s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                render_pass: render_pass.raw(),
                attachment_count: attachments.len() as u32,
                p_attachments: attachments.as_ptr(),
                width: extent.width,
                height: extent.height,
                layers: 1,
                ..Default::default()
            };
            let fb = unsafe { ctx.device().create_framebuffer(&ci, None) }
                .context("create_framebuffer")?;
            Ok(OwnedFramebuffer::new(ctx, fb))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 16,
                height: 16,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2048,
            },
            ..Default::default()
        }
    }

    #[test]
    fn image_count_is_min_plus_one_within_max() {
        assert_eq!(image_count(&caps(2, 8)), 3);
        assert_eq!(image_count(&caps(3, 3)), 3);
        assert_eq!(image_count(&caps(2, 0)), 3);
    }

    #[test]
    fn free_size_surface_clamps_request() {
        let c = caps(2, 0);
        let e = extent_from_caps(
            &c,
            RenderSize {
                width: 8000,
                height: 4,
            },
        );
        assert_eq!((e.width, e.height), (4096, 16));

        let e = extent_from_caps(
            &c,
            RenderSize {
                width: 800,
                height: 600,
            },
        );
        assert_eq!((e.width, e.height), (800, 600));
    }

    #[test]
    fn fixed_surface_extent_wins() {
        let mut c = caps(2, 0);
        c.current_extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        let e = extent_from_caps(
            &c,
            RenderSize {
                width: 10,
                height: 10,
            },
        );
        assert_eq!((e.width, e.height), (1280, 720));
    }

    #[test]
    fn present_mode_follows_vsync() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(choose_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn surface_format_prefers_srgb() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            choose_surface_format(&formats).format,
            vk::Format::B8G8R8A8_SRGB
        );
        assert_eq!(
            choose_surface_format(&formats[..1]).format,
            vk::Format::B8G8R8A8_UNORM
        );
    }
}
