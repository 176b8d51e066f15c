// SPDX-License-Identifier: CEPL-1.0
//! The Vulkan `Renderer`: owns the device, presentation, registry and both
//! passes, and drives the per-frame acquire / record / submit / present loop.

use crate::device::DeviceContext;
use crate::frame::{FramePhase, FrameRing, FrameSlot, VkFence};
use crate::pipeline::{create_main_pipeline, GraphicsPipeline};
use crate::records::VkBackend;
use crate::registry::{PerFrameUniform, PoolKind, Registry, ResourceKind};
use crate::shadows::ShadowPass;
use crate::swapchain::{Acquired, Presentation};
use crate::upload::BlockingUploader;
use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use tracing::{debug, info, warn};
use umbra_render::{
    Camera, LightType, Model, RenderSize, Renderer, RendererConfig, ResourceId, Scene,
};

const ACTIVE: &[FramePhase] = &[FramePhase::FrameAcquired, FramePhase::RenderPassActive];

// Field order is drop order: everything holding descriptor sets or pipelines
// goes before the swapchain, the device context goes last.
pub struct VkRenderer {
    registry: Registry<VkBackend>,
    shadows: ShadowPass,
    pipeline: GraphicsPipeline,
    presentation: Presentation,
    slots: Vec<FrameSlot>,
    ring: FrameRing<VkFence>,
    ctx: Arc<DeviceContext>,

    config: RendererConfig,
    clear: [f32; 4],
    phase: FramePhase,
    image_index: u32,
    size: RenderSize,
    resize_pending: bool,
    paused: bool,
    vsync: bool,
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.wait_idle() {
            warn!("wait_idle on shutdown failed: {e:#}");
        }
    }
}

fn build_main_pipeline(
    ctx: &Arc<DeviceContext>,
    config: &RendererConfig,
    presentation: &Presentation,
    registry: &Registry<VkBackend>,
) -> Result<GraphicsPipeline> {
    let layout = |kind| {
        registry
            .pool(kind)
            .map(|p| p.layout())
            .with_context(|| format!("{kind:?} pool missing"))
    };
    create_main_pipeline(
        ctx,
        &config.shader_dir,
        presentation.render_pass(),
        &[
            layout(PoolKind::Model)?,
            layout(PoolKind::Material)?,
            layout(PoolKind::Light)?,
        ],
    )
}

impl VkRenderer {
    pub fn frames_in_flight(&self) -> usize {
        self.ring.slots()
    }

    pub fn registry(&self) -> &Registry<VkBackend> {
        &self.registry
    }

    /// Wait for the current slot, acquire a swap image and open its command
    /// buffer. `Ok(false)` means the swapchain was out of date and has been
    /// rebuilt; the caller skips this frame.
    pub fn begin_render(&mut self) -> Result<bool> {
        self.phase.require("begin_render", &[FramePhase::Idle])?;
        self.ring.wait_current()?;

        let slot = &self.slots[self.ring.current()];
        let (image_available, cmd) = (slot.image_available.raw(), slot.cmd);
        match self.presentation.acquire(image_available)? {
            Acquired::OutOfDate => {
                debug!("acquire: swapchain out of date");
                self.recreate_swapchain()?;
                return Ok(false);
            }
            Acquired::Image { index, suboptimal } => {
                self.image_index = index;
                self.resize_pending |= suboptimal;
            }
        }

        // only reset once work is guaranteed to be submitted with this fence
        self.ring.reset_current()?;
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe {
            let d = self.ctx.device();
            d.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("reset_command_buffer")?;
            d.begin_command_buffer(cmd, &begin)
                .context("begin_command_buffer")?;
        }
        self.phase = FramePhase::FrameAcquired;
        Ok(true)
    }

    fn begin_main_pass(&mut self) -> Result<()> {
        if self.phase == FramePhase::RenderPassActive {
            return Ok(());
        }
        let slot = self.ring.current();
        let cmd = self.slots[slot].cmd;
        let extent = self.presentation.extent();
        let light_set = self.registry.light()?.binding(slot);

        let clears = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: self.presentation.render_pass(),
            framebuffer: self.presentation.framebuffer(self.image_index),
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            clear_value_count: clears.len() as u32,
            p_clear_values: clears.as_ptr(),
            ..Default::default()
        };
        // negative height flips to Y-up; needs maintenance1
        let viewport = vk::Viewport {
            x: 0.0,
            y: extent.height as f32,
            width: extent.width as f32,
            height: -(extent.height as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        unsafe {
            let d = self.ctx.device();
            d.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
            d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.raw());
            d.cmd_set_viewport(cmd, 0, &[viewport]);
            d.cmd_set_scissor(cmd, 0, &[scissor]);
            d.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout(),
                2,
                &[light_set],
                &[],
            );
        }
        self.phase = FramePhase::RenderPassActive;
        Ok(())
    }

    /// Record `model` into the main pass, starting the pass if needed.
    pub fn draw_model(&mut self, model: &Model, camera: &Camera) -> Result<()> {
        self.phase.require("draw_model", ACTIVE)?;
        let slot = self.ring.current();
        self.registry
            .write_model_uniform(model.id(), slot, &self.model_uniform(model, camera))?;
        self.begin_main_pass()?;

        let cmd = self.slots[slot].cmd;
        let model_set = self.registry.model(model.id())?.binding(slot);
        let d = self.ctx.device();
        for mesh in &model.meshes {
            let record = self.registry.mesh(mesh.id())?;
            let material = self.registry.material(mesh.material().id())?;
            unsafe {
                d.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline.layout(),
                    0,
                    &[model_set, material.set()],
                    &[],
                );
                d.cmd_bind_vertex_buffers(cmd, 0, &[record.vertex_buffer()], &[0]);
                d.cmd_bind_index_buffer(cmd, record.index_buffer(), 0, vk::IndexType::UINT32);
                d.cmd_draw_indexed(cmd, record.index_count(), 1, 0, 0, 0);
            }
        }
        Ok(())
    }

    /// Close the frame: submit, present, advance to the next slot and apply
    /// any deferred swapchain or shadow map rebuild.
    pub fn end_render(&mut self) -> Result<()> {
        self.phase.require("end_render", ACTIVE)?;
        self.begin_main_pass()?;

        let slot = self.ring.current();
        let cmd = self.slots[slot].cmd;
        unsafe {
            let d = self.ctx.device();
            d.cmd_end_render_pass(cmd);
            d.end_command_buffer(cmd).context("end_command_buffer")?;
        }

        let wait = self.slots[slot].image_available.raw();
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let signal = self.presentation.render_finished(self.image_index);
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &signal,
            ..Default::default()
        };
        unsafe {
            self.ctx.device().queue_submit(
                self.ctx.graphics_queue(),
                std::slice::from_ref(&submit),
                self.ring.fence().raw(),
            )
        }
        .context("queue_submit")?;
        self.phase = FramePhase::Submitted;

        let stale = self.presentation.present(self.image_index)?;
        self.phase = FramePhase::Presented;

        self.ring.advance();
        self.phase = FramePhase::Idle;

        if stale || self.resize_pending {
            self.recreate_swapchain()?;
        }
        if self.shadows.apply_pending_resize()? {
            self.registry.light()?.bind_shadow_map(
                &self.ctx,
                self.shadows.view(),
                self.shadows.sampler(),
            );
        }
        Ok(())
    }

    /// Drop a GPU record once no frame in flight can still be reading it.
    pub fn release(&mut self, kind: ResourceKind, id: ResourceId) -> Result<bool> {
        self.phase.require("release", &[FramePhase::Idle])?;
        self.ring.wait_all()?;
        Ok(self.registry.destroy(kind, id)?)
    }

    fn model_uniform(&self, model: &Model, camera: &Camera) -> umbra_render::gpu::ModelUniform {
        let extent = self.presentation.extent();
        let aspect = RenderSize {
            width: extent.width,
            height: extent.height,
        }
        .aspect();
        camera.model_uniform(&model.transform.matrix(), aspect)
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        self.resize_pending = false;
        if self.size.is_empty() {
            self.paused = true;
            return Ok(());
        }
        let format_changed = self.presentation.recreate(self.size, self.vsync)?;
        if format_changed {
            self.pipeline =
                build_main_pipeline(&self.ctx, &self.config, &self.presentation, &self.registry)?;
        }
        let e = self.presentation.extent();
        info!(
            "swapchain recreated: {}x{} ({} images, vsync {})",
            e.width,
            e.height,
            self.presentation.image_count(),
            self.vsync
        );
        Ok(())
    }

    /// Depth pass for the scene's shadow caster. Runs every frame, with no
    /// draws when nothing casts, so the map always ends up readable.
    fn record_shadows(&mut self, scene: &Scene) -> Result<()> {
        let slot = self.ring.current();
        let cmd = self.slots[slot].cmd;
        let views = scene.shadow_views();
        let kind = views.map_or(LightType::Directional, |v| v.kind);

        if let Some(views) = &views {
            self.shadows.write_matrices(slot, views)?;
        }
        self.shadows.begin_render(cmd, slot, kind)?;
        if let Some(views) = &views {
            for view in 0..views.count() {
                if view > 0 {
                    self.shadows.next_render(kind)?;
                }
                for model in scene.models.iter().filter(|m| m.casts_shadow) {
                    self.shadows.draw_model(&self.registry, model)?;
                }
            }
        }
        self.shadows.end_render()
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        config: &RendererConfig,
    ) -> Result<Self> {
        let ctx = DeviceContext::new(window, display, config.validation)?;
        let presentation = Presentation::new(&ctx, size, config.vsync)?;

        let uploader = Box::new(BlockingUploader::new(Arc::clone(&ctx)));
        let backend = VkBackend::new(Arc::clone(&ctx), uploader, config)?;
        let mut registry = Registry::new(backend);
        for kind in PoolKind::ALL {
            registry.create_pool(kind)?;
        }
        let model_layout = registry
            .pool(PoolKind::Model)
            .map(|p| p.layout())
            .context("model pool missing")?;

        let frames = config.frames_in_flight();
        let shadows = ShadowPass::new(
            &ctx,
            &config.shader_dir,
            model_layout,
            frames,
            config.shadow_extent(),
        )?;
        let pipeline = build_main_pipeline(&ctx, config, &presentation, &registry)?;
        registry
            .create_light()?
            .bind_shadow_map(&ctx, shadows.view(), shadows.sampler());

        let slots = FrameSlot::create_all(&ctx, frames)?;
        let fences = (0..frames)
            .map(|_| VkFence::new(&ctx))
            .collect::<Result<Vec<_>>>()?;

        let e = presentation.extent();
        info!(
            "Vulkan renderer ready ({}x{}, fmt {:?}, {} frames in flight)",
            e.width,
            e.height,
            presentation.format(),
            frames
        );

        Ok(Self {
            registry,
            shadows,
            pipeline,
            presentation,
            slots,
            ring: FrameRing::new(fences),
            ctx,
            config: config.clone(),
            clear: config.clear_color,
            phase: FramePhase::Idle,
            image_index: 0,
            size,
            resize_pending: false,
            paused: size.is_empty(),
            vsync: config.vsync,
        })
    }

    fn upload(&mut self, scene: &Scene) -> Result<()> {
        for model in &scene.models {
            for mesh in &model.meshes {
                self.registry.create_material(mesh.material())?;
                self.registry.create_mesh(mesh)?;
            }
            self.registry.create_model(model)?;
        }
        Ok(())
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        if size == self.size && !self.paused {
            return Ok(());
        }
        self.size = size;
        self.paused = size.is_empty();
        if !self.paused {
            self.resize_pending = true;
        }
        Ok(())
    }

    fn render(&mut self, scene: &Scene) -> Result<()> {
        if self.paused {
            return Ok(());
        }
        if !self.begin_render()? {
            return Ok(());
        }
        let slot = self.ring.current();
        self.registry
            .write_light_uniform(slot, &scene.light_uniform())?;
        // the shadow pass reads the model sets too
        for model in &scene.models {
            let uniform = self.model_uniform(model, &scene.camera);
            self.registry
                .write_model_uniform(model.id(), slot, &uniform)?;
        }
        self.record_shadows(scene)?;
        for model in &scene.models {
            self.draw_model(model, &scene.camera)?;
        }
        self.end_render()
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear = rgba;
    }

    fn set_vsync(&mut self, on: bool) {
        if self.vsync != on {
            self.vsync = on;
            self.resize_pending = true;
        }
    }

    fn request_shadow_resize(&mut self, size: u32) {
        self.shadows.request_resize(size);
    }
}
