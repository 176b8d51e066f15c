// SPDX-License-Identifier: CEPL-1.0
//! Depth-only shadow pass. One square depth image; directional and spot
//! lights render it whole, point lights render four 90° views into its
//! quadrants.

use crate::device::DeviceContext;
use crate::error::VkError;
use crate::handles::{
    MappedBuffer, OwnedDescriptorPool, OwnedFramebuffer, OwnedImage, OwnedImageView,
    OwnedRenderPass, OwnedSampler, OwnedSetLayout,
};
use crate::pipeline::{create_shadow_pipeline, GraphicsPipeline};
use crate::records::VkBackend;
use crate::registry::{PerFrameUniform, Registry};
use crate::upload::{create_buffer, create_image, create_image_view};
use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use umbra_render::gpu::Mat4Cols;
use umbra_render::{LightType, Model, ShadowViews, MAX_SHADOW_VIEWS};

const MATRIX_SIZE: u64 = std::mem::size_of::<Mat4Cols>() as u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShadowRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Region of the shadow map written by sub-render `render_index`.
pub fn shadow_viewport(kind: LightType, render_index: u32, size: u32) -> ShadowRect {
    match kind {
        LightType::Point => {
            let half = size / 2;
            ShadowRect {
                x: (render_index % 2) * half,
                y: (render_index / 2) * half,
                width: half,
                height: half,
            }
        }
        LightType::Directional | LightType::Spot => ShadowRect {
            x: 0,
            y: 0,
            width: size,
            height: size,
        },
    }
}

/// One light matrix, padded to the device's dynamic-offset alignment.
pub fn matrix_stride(min_alignment: u64) -> u64 {
    let align = min_alignment.max(1);
    MATRIX_SIZE.div_ceil(align) * align
}

/// Dynamic offset of the matrix for `(slot, render_index)`.
pub fn matrix_offset(slot: usize, render_index: u32, stride: u64) -> u32 {
    ((slot as u64 * MAX_SHADOW_VIEWS as u64 + render_index as u64) * stride) as u32
}

/// Edge length of the shadow map plus a resize waiting for the frame to end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShadowExtent {
    current: u32,
    pending: Option<u32>,
}

impl ShadowExtent {
    pub const MIN: u32 = 64;

    pub fn new(size: u32) -> Self {
        Self {
            current: Self::normalize(size),
            pending: None,
        }
    }

    /// Even, so the four point-light quadrants split exactly.
    pub fn normalize(size: u32) -> u32 {
        size.max(Self::MIN) & !1
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn pending(&self) -> Option<u32> {
        self.pending
    }

    /// A request for the current size cancels any earlier one.
    pub fn request(&mut self, size: u32) {
        let size = Self::normalize(size);
        self.pending = (size != self.current).then_some(size);
    }

    /// The size to rebuild at, at most once per request. Held back while a
    /// frame is recording.
    pub fn take(&mut self, recording: bool) -> Option<u32> {
        if recording {
            return None;
        }
        let size = self.pending.take()?;
        self.current = size;
        Some(size)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShadowPhase {
    Idle,
    FrameBegun,
}

impl ShadowPhase {
    fn name(self) -> &'static str {
        match self {
            ShadowPhase::Idle => "shadow pass idle",
            ShadowPhase::FrameBegun => "shadow pass recording",
        }
    }
}

struct ShadowTarget {
    framebuffer: OwnedFramebuffer,
    view: OwnedImageView,
    _image: OwnedImage,
}

pub struct ShadowPass {
    ctx: Arc<DeviceContext>,
    extent: ShadowExtent,
    depth_format: vk::Format,
    target: ShadowTarget,
    pipeline: GraphicsPipeline,
    render_pass: OwnedRenderPass,
    matrices: MappedBuffer,
    stride: u64,
    /// Freed with `pool`.
    set: vk::DescriptorSet,
    _pool: OwnedDescriptorPool,
    _set_layout: OwnedSetLayout,
    sampler: OwnedSampler,
    phase: ShadowPhase,
    render_index: u32,
    kind: LightType,
    cmd: vk::CommandBuffer,
    slot: usize,
}

impl ShadowPass {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        shader_dir: &Path,
        model_layout: vk::DescriptorSetLayout,
        frames: usize,
        size: u32,
    ) -> Result<Self> {
        let d = ctx.device();
        let depth_format = ctx.depth_format();
        let extent = ShadowExtent::new(size);
        let size = extent.current();
        let render_pass = create_shadow_render_pass(ctx, depth_format)?;
        let target = create_target(ctx, &render_pass, depth_format, size)?;
        let sampler = create_shadow_sampler(ctx)?;

        let stride = matrix_stride(ctx.limits().min_uniform_buffer_offset_alignment);
        let buffer = create_buffer(
            ctx,
            stride * (frames * MAX_SHADOW_VIEWS) as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .context("shadow matrix buffer")?;
        let matrices = MappedBuffer::new(buffer)?;

        let binding = vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::VERTEX,
            ..Default::default()
        };
        let lci = vk::DescriptorSetLayoutCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
            binding_count: 1,
            p_bindings: &binding,
            ..Default::default()
        };
        let set_layout = OwnedSetLayout::new(
            ctx,
            unsafe { d.create_descriptor_set_layout(&lci, None) }
                .context("shadow set layout")?,
        );

        let pool_size = vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            descriptor_count: 1,
        };
        let pci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: 1,
            pool_size_count: 1,
            p_pool_sizes: &pool_size,
            ..Default::default()
        };
        let pool = OwnedDescriptorPool::new(
            ctx,
            unsafe { d.create_descriptor_pool(&pci, None) }.context("shadow descriptor pool")?,
        );
        let layouts = [set_layout.raw()];
        let ai = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: pool.raw(),
            descriptor_set_count: 1,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        let set = unsafe { d.allocate_descriptor_sets(&ai) }.context("shadow descriptor set")?[0];
        let info = vk::DescriptorBufferInfo {
            buffer: matrices.raw(),
            offset: 0,
            range: MATRIX_SIZE,
        };
        let write = vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: set,
            dst_binding: 0,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            p_buffer_info: &info,
            ..Default::default()
        };
        unsafe { d.update_descriptor_sets(&[write], &[]) };

        let pipeline = create_shadow_pipeline(
            ctx,
            shader_dir,
            render_pass.raw(),
            &[model_layout, set_layout.raw()],
        )?;

        info!("shadow map ready: {size}x{size} {depth_format:?}");
        Ok(Self {
            ctx: Arc::clone(ctx),
            extent,
            depth_format,
            target,
            pipeline,
            render_pass,
            matrices,
            stride,
            set,
            _pool: pool,
            _set_layout: set_layout,
            sampler,
            phase: ShadowPhase::Idle,
            render_index: 0,
            kind: LightType::Directional,
            cmd: vk::CommandBuffer::null(),
            slot: 0,
        })
    }

    pub fn view(&self) -> vk::ImageView {
        self.target.view.raw()
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler.raw()
    }

    /// Store the light matrices for `slot`. The slot's fence must have been waited.
    pub fn write_matrices(&self, slot: usize, views: &ShadowViews) -> Result<()> {
        for (i, m) in views.matrices.iter().enumerate() {
            let offset = matrix_offset(slot, i as u32, self.stride) as usize;
            self.matrices
                .write(offset, bytemuck::bytes_of(&m.to_cols_array_2d()))?;
        }
        Ok(())
    }

    /// Begin the depth pass into `cmd`. The whole map is cleared to 1.0.
    pub fn begin_render(&mut self, cmd: vk::CommandBuffer, slot: usize, kind: LightType) -> Result<()> {
        self.require("begin_render", ShadowPhase::Idle)?;
        self.cmd = cmd;
        self.slot = slot;
        self.kind = kind;
        self.render_index = 0;

        let clear = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        };
        let begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: self.render_pass.raw(),
            framebuffer: self.target.framebuffer.raw(),
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: self.extent.current(),
                    height: self.extent.current(),
                },
            },
            clear_value_count: 1,
            p_clear_values: &clear,
            ..Default::default()
        };
        unsafe {
            let d = self.ctx.device();
            d.cmd_begin_render_pass(cmd, &begin, vk::SubpassContents::INLINE);
            d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.raw());
        }
        self.phase = ShadowPhase::FrameBegun;
        self.set_region();
        Ok(())
    }

    /// Move on to the next point-light quadrant inside the same render pass.
    pub fn next_render(&mut self, kind: LightType) -> Result<()> {
        self.require("next_render", ShadowPhase::FrameBegun)?;
        if self.render_index + 1 >= kind.shadow_views() {
            return Err(VkError::InvalidPhase {
                op: "next_render",
                phase: "every shadow view already rendered",
            }
            .into());
        }
        self.kind = kind;
        self.render_index += 1;
        self.set_region();
        Ok(())
    }

    pub fn draw_model(&self, registry: &Registry<VkBackend>, model: &Model) -> Result<()> {
        self.require("draw_model", ShadowPhase::FrameBegun)?;
        let model_set = registry.model(model.id())?.binding(self.slot);
        let offset = matrix_offset(self.slot, self.render_index, self.stride);
        let d = self.ctx.device();
        unsafe {
            d.cmd_bind_descriptor_sets(
                self.cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout(),
                0,
                &[model_set, self.set],
                &[offset],
            );
        }
        for mesh in &model.meshes {
            let record = registry.mesh(mesh.id())?;
            unsafe {
                d.cmd_bind_vertex_buffers(self.cmd, 0, &[record.vertex_buffer()], &[0]);
                d.cmd_bind_index_buffer(self.cmd, record.index_buffer(), 0, vk::IndexType::UINT32);
                d.cmd_draw_indexed(self.cmd, record.index_count(), 1, 0, 0, 0);
            }
        }
        Ok(())
    }

    pub fn end_render(&mut self) -> Result<()> {
        self.require("end_render", ShadowPhase::FrameBegun)?;
        unsafe { self.ctx.device().cmd_end_render_pass(self.cmd) };
        self.render_index = 0;
        self.phase = ShadowPhase::Idle;
        Ok(())
    }

    /// Takes effect at the end of the frame that is being recorded.
    pub fn request_resize(&mut self, size: u32) {
        self.extent.request(size);
    }

    /// Rebuild the map if a resize is pending. Returns `true` when the view
    /// changed and descriptor sets sampling it must be rewritten.
    pub fn apply_pending_resize(&mut self) -> Result<bool> {
        let old = self.extent.current();
        let Some(size) = self.extent.take(self.phase != ShadowPhase::Idle) else {
            return Ok(false);
        };
        // the old framebuffer may still be in use by frames in flight
        self.ctx.wait_idle()?;
        self.target = create_target(&self.ctx, &self.render_pass, self.depth_format, size)?;
        info!("shadow map resized {old} -> {size}");
        Ok(true)
    }

    fn require(&self, op: &'static str, phase: ShadowPhase) -> Result<(), VkError> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(VkError::InvalidPhase {
                op,
                phase: self.phase.name(),
            })
        }
    }

    fn set_region(&self) {
        let r = shadow_viewport(self.kind, self.render_index, self.extent.current());
        // negative height: same Y-up convention as the main pass
        let viewport = vk::Viewport {
            x: r.x as f32,
            y: (r.y + r.height) as f32,
            width: r.width as f32,
            height: -(r.height as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: r.x as i32,
                y: r.y as i32,
            },
            extent: vk::Extent2D {
                width: r.width,
                height: r.height,
            },
        };
        unsafe {
            let d = self.ctx.device();
            d.cmd_set_viewport(self.cmd, 0, &[viewport]);
            d.cmd_set_scissor(self.cmd, 0, &[scissor]);
        }
    }
}

fn create_shadow_render_pass(
    ctx: &Arc<DeviceContext>,
    depth_format: vk::Format,
) -> Result<OwnedRenderPass> {
    let attachment = vk::AttachmentDescription {
        format: depth_format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ..Default::default()
    };
    let depth_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        p_depth_stencil_attachment: &depth_ref,
        ..Default::default()
    };
    let dependencies = [
        // previous frame's sampling -> this frame's depth writes
        vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            dst_stage_mask: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            src_access_mask: vk::AccessFlags::SHADER_READ,
            dst_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        },
        // depth writes -> main pass sampling
        vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            src_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::SHADER_READ,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        },
    ];
    let ci = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &attachment,
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: dependencies.len() as u32,
        p_dependencies: dependencies.as_ptr(),
        ..Default::default()
    };
    let pass =
        unsafe { ctx.device().create_render_pass(&ci, None) }.context("shadow render pass")?;
    Ok(OwnedRenderPass::new(ctx, pass))
}

fn create_target(
    ctx: &Arc<DeviceContext>,
    render_pass: &OwnedRenderPass,
    format: vk::Format,
    size: u32,
) -> Result<ShadowTarget> {
    let image = create_image(
        ctx,
        size,
        size,
        1,
        vk::SampleCountFlags::TYPE_1,
        format,
        vk::ImageTiling::OPTIMAL,
        vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .context("shadow image")?;
    let view = create_image_view(ctx, image.raw(), format, vk::ImageAspectFlags::DEPTH, 1)?;
    let attachment = view.raw();
    let ci = vk::FramebufferCreateInfo {
        s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
        render_pass: render_pass.raw(),
        attachment_count: 1,
        p_attachments: &attachment,
        width: size,
        height: size,
        layers: 1,
        ..Default::default()
    };
    let fb = unsafe { ctx.device().create_framebuffer(&ci, None) }.context("shadow framebuffer")?;
    Ok(ShadowTarget {
        framebuffer: OwnedFramebuffer::new(ctx, fb),
        view,
        _image: image,
    })
}

fn create_shadow_sampler(ctx: &Arc<DeviceContext>) -> Result<OwnedSampler> {
    // outside the map reads as depth 1.0, i.e. lit
    let ci = vk::SamplerCreateInfo {
        s_type: vk::StructureType::SAMPLER_CREATE_INFO,
        mag_filter: vk::Filter::NEAREST,
        min_filter: vk::Filter::NEAREST,
        mipmap_mode: vk::SamplerMipmapMode::NEAREST,
        address_mode_u: vk::SamplerAddressMode::CLAMP_TO_BORDER,
        address_mode_v: vk::SamplerAddressMode::CLAMP_TO_BORDER,
        address_mode_w: vk::SamplerAddressMode::CLAMP_TO_BORDER,
        border_color: vk::BorderColor::FLOAT_OPAQUE_WHITE,
        max_lod: 1.0,
        ..Default::default()
    };
    let sampler =
        unsafe { ctx.device().create_sampler(&ci, None) }.context("shadow sampler")?;
    Ok(OwnedSampler::new(ctx, sampler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_light_splits_into_quadrants() {
        let rects: Vec<_> = (0..4)
            .map(|i| shadow_viewport(LightType::Point, i, 1024))
            .map(|r| (r.x, r.y, r.width, r.height))
            .collect();
        assert_eq!(
            rects,
            vec![
                (0, 0, 512, 512),
                (512, 0, 512, 512),
                (0, 512, 512, 512),
                (512, 512, 512, 512),
            ]
        );
    }

    #[test]
    fn directional_and_spot_use_whole_map() {
        for kind in [LightType::Directional, LightType::Spot] {
            assert_eq!(
                shadow_viewport(kind, 0, 2048),
                ShadowRect {
                    x: 0,
                    y: 0,
                    width: 2048,
                    height: 2048
                }
            );
        }
    }

    #[test]
    fn stride_respects_alignment() {
        assert_eq!(matrix_stride(0), 64);
        assert_eq!(matrix_stride(16), 64);
        assert_eq!(matrix_stride(256), 256);
        assert_eq!(matrix_stride(48), 96);
    }

    #[test]
    fn offsets_never_overlap_across_slots() {
        let stride = matrix_stride(256);
        assert_eq!(matrix_offset(0, 0, stride), 0);
        assert_eq!(matrix_offset(0, 3, stride), 768);
        assert_eq!(matrix_offset(1, 0, stride), 1024);
        assert_eq!(matrix_offset(2, 1, stride), (2 * 4 + 1) * 256);
    }

    #[test]
    fn resize_requests_are_normalized() {
        let mut extent = ShadowExtent::new(1025);
        assert_eq!(extent.current(), 1024);

        extent.request(1024);
        assert_eq!(extent.pending(), None);
        extent.request(10);
        assert_eq!(extent.pending(), Some(ShadowExtent::MIN));
        extent.request(2049);
        assert_eq!(extent.pending(), Some(2048));

        // asking for the current size again drops the queued rebuild
        extent.request(1024);
        assert_eq!(extent.pending(), None);
        assert_eq!(extent.take(false), None);
    }

    #[test]
    fn resize_waits_for_recording_to_finish_and_applies_once() {
        let mut extent = ShadowExtent::new(2048);
        extent.request(512);

        assert_eq!(extent.take(true), None);
        assert_eq!(extent.current(), 2048);
        assert_eq!(extent.pending(), Some(512));

        assert_eq!(extent.take(false), Some(512));
        assert_eq!(extent.current(), 512);
        assert_eq!(extent.take(false), None);

        // rebuilding back to the original size lands on the same extent
        extent.request(2048);
        assert_eq!(extent.take(false), Some(2048));
        assert_eq!(extent, ShadowExtent::new(2048));
    }
}
