// SPDX-License-Identifier: CEPL-1.0
//! Shader loading and the two graphics pipelines (lit main pass, depth-only
//! shadow pass).

use crate::device::DeviceContext;
use crate::error::VkError;
use crate::handles::{OwnedPipeline, OwnedPipelineLayout, OwnedShaderModule};
use anyhow::{anyhow, Context, Result};
use ash::util::read_spv;
use ash::vk;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use umbra_render::gpu::Vertex;

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Clone, Copy, Debug)]
pub struct ShaderSource {
    pub name: &'static str,
    pub embedded: &'static [u8],
}

pub const MAIN_VERT: ShaderSource = ShaderSource {
    name: "main.vert",
    embedded: include_bytes!(concat!(env!("OUT_DIR"), "/main.vert.spv")),
};
pub const MAIN_FRAG: ShaderSource = ShaderSource {
    name: "main.frag",
    embedded: include_bytes!(concat!(env!("OUT_DIR"), "/main.frag.spv")),
};
pub const SHADOW_VERT: ShaderSource = ShaderSource {
    name: "shadow.vert",
    embedded: include_bytes!(concat!(env!("OUT_DIR"), "/shadow.vert.spv")),
};

fn parse_spirv(name: &str, bytes: &[u8]) -> Result<Vec<u32>, VkError> {
    let words = read_spv(&mut Cursor::new(bytes)).map_err(|e| VkError::Shader {
        name: name.to_owned(),
        reason: e.to_string(),
    })?;
    if words.first() != Some(&SPIRV_MAGIC) {
        return Err(VkError::Shader {
            name: name.to_owned(),
            reason: "missing SPIR-V magic number".to_owned(),
        });
    }
    Ok(words)
}

/// `<dir>/<name>.spv` when present, otherwise the copy built into the binary.
pub fn load_spirv(dir: &Path, shader: &ShaderSource) -> Result<Vec<u32>> {
    let path = dir.join(format!("{}.spv", shader.name));
    if path.is_file() {
        let bytes = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        debug!("shader {} loaded from {}", shader.name, path.display());
        return Ok(parse_spirv(shader.name, &bytes)?);
    }
    Ok(parse_spirv(shader.name, shader.embedded)?)
}

fn create_module(ctx: &Arc<DeviceContext>, code: &[u32]) -> Result<OwnedShaderModule> {
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: code.as_ptr(),
        code_size: code.len() * 4,
        ..Default::default()
    };
    let module = unsafe { ctx.device().create_shader_module(&ci, None) }
        .context("create_shader_module")?;
    Ok(OwnedShaderModule::new(ctx, module))
}

pub struct GraphicsPipeline {
    pipeline: OwnedPipeline,
    layout: OwnedPipelineLayout,
}

impl GraphicsPipeline {
    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline.raw()
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout.raw()
    }
}

struct PipelineDesc<'a> {
    vertex: ShaderSource,
    fragment: Option<ShaderSource>,
    set_layouts: &'a [vk::DescriptorSetLayout],
    render_pass: vk::RenderPass,
    /// Only position is fed to depth-only passes.
    position_only: bool,
    cull_mode: vk::CullModeFlags,
    depth_bias: bool,
}

/// Lit pass. Sets: 0 model, 1 material, 2 light.
pub fn create_main_pipeline(
    ctx: &Arc<DeviceContext>,
    shader_dir: &Path,
    render_pass: vk::RenderPass,
    set_layouts: &[vk::DescriptorSetLayout; 3],
) -> Result<GraphicsPipeline> {
    let p = build(
        ctx,
        shader_dir,
        PipelineDesc {
            vertex: MAIN_VERT,
            fragment: Some(MAIN_FRAG),
            set_layouts,
            render_pass,
            position_only: false,
            cull_mode: vk::CullModeFlags::BACK,
            depth_bias: false,
        },
    )
    .context("main pipeline")?;
    info!("main pipeline ready");
    Ok(p)
}

/// Depth-only pass. Sets: 0 model, 1 light matrix (dynamic offset).
pub fn create_shadow_pipeline(
    ctx: &Arc<DeviceContext>,
    shader_dir: &Path,
    render_pass: vk::RenderPass,
    set_layouts: &[vk::DescriptorSetLayout; 2],
) -> Result<GraphicsPipeline> {
    build(
        ctx,
        shader_dir,
        PipelineDesc {
            vertex: SHADOW_VERT,
            fragment: None,
            set_layouts,
            render_pass,
            position_only: true,
            cull_mode: vk::CullModeFlags::NONE,
            depth_bias: true,
        },
    )
    .context("shadow pipeline")
}

fn build(ctx: &Arc<DeviceContext>, dir: &Path, desc: PipelineDesc<'_>) -> Result<GraphicsPipeline> {
    let d = ctx.device();

    // modules only need to outlive pipeline creation
    let vs = create_module(ctx, &load_spirv(dir, &desc.vertex)?)?;
    let fs = match desc.fragment {
        Some(src) => Some(create_module(ctx, &load_spirv(dir, &src)?)?),
        None => None,
    };
    let entry = c"main";

    let mut stages = vec![vk::PipelineShaderStageCreateInfo {
        s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
        stage: vk::ShaderStageFlags::VERTEX,
        module: vs.raw(),
        p_name: entry.as_ptr(),
        ..Default::default()
    }];
    if let Some(fs) = &fs {
        stages.push(vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: fs.raw(),
            p_name: entry.as_ptr(),
            ..Default::default()
        });
    }

    let vb = vk::VertexInputBindingDescription {
        binding: 0,
        stride: Vertex::STRIDE,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    let formats = [
        vk::Format::R32G32B32_SFLOAT,
        vk::Format::R32G32B32_SFLOAT,
        vk::Format::R32G32_SFLOAT,
        vk::Format::R32G32B32_SFLOAT,
    ];
    let attributes: Vec<_> = formats
        .iter()
        .zip(Vertex::OFFSETS)
        .enumerate()
        .take(if desc.position_only { 1 } else { formats.len() })
        .map(|(location, (&format, offset))| vk::VertexInputAttributeDescription {
            location: location as u32,
            binding: 0,
            format,
            offset,
        })
        .collect();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: 1,
        p_vertex_binding_descriptions: &vb,
        vertex_attribute_description_count: attributes.len() as u32,
        p_vertex_attribute_descriptions: attributes.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };
    let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
        dynamic_state_count: dyn_states.len() as u32,
        p_dynamic_states: dyn_states.as_ptr(),
        ..Default::default()
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: desc.cull_mode,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        depth_bias_enable: if desc.depth_bias { vk::TRUE } else { vk::FALSE },
        depth_bias_constant_factor: 1.25,
        depth_bias_slope_factor: 1.75,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
        depth_test_enable: vk::TRUE,
        depth_write_enable: vk::TRUE,
        depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
        ..Default::default()
    };
    let color_blend_att = vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::RGBA,
        blend_enable: vk::FALSE,
        ..Default::default()
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: u32::from(fs.is_some()),
        p_attachments: &color_blend_att,
        ..Default::default()
    };

    let layout_info = vk::PipelineLayoutCreateInfo {
        s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
        set_layout_count: desc.set_layouts.len() as u32,
        p_set_layouts: desc.set_layouts.as_ptr(),
        ..Default::default()
    };
    let layout = unsafe { d.create_pipeline_layout(&layout_info, None) }
        .context("create_pipeline_layout")?;
    let layout = OwnedPipelineLayout::new(ctx, layout);

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_depth_stencil_state: &depth_stencil,
        p_color_blend_state: &color_blend,
        p_dynamic_state: &dynamic_state,
        layout: layout.raw(),
        render_pass: desc.render_pass,
        subpass: 0,
        ..Default::default()
    };
    let pipelines = unsafe {
        d.create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&pipeline_info),
            None,
        )
    }
    .map_err(|(_, err)| anyhow!("create_graphics_pipelines failed: {err:?}"))?;

    Ok(GraphicsPipeline {
        pipeline: OwnedPipeline::new(ctx, pipelines[0]),
        layout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("umbra-shaders-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn embedded_shaders_are_spirv() {
        for shader in [MAIN_VERT, MAIN_FRAG, SHADOW_VERT] {
            let words = parse_spirv(shader.name, shader.embedded).unwrap();
            assert_eq!(words[0], SPIRV_MAGIC, "{}", shader.name);
        }
    }

    #[test]
    fn missing_override_falls_back_to_embedded() {
        let dir = scratch_dir("fallback");
        let words = load_spirv(&dir, &SHADOW_VERT).unwrap();
        assert_eq!(words.len() * 4, SHADOW_VERT.embedded.len());
    }

    #[test]
    fn override_file_wins() {
        let dir = scratch_dir("override");
        let words: [u32; 5] = [SPIRV_MAGIC, 0x0001_0000, 0, 8, 0];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        fs::write(dir.join("main.frag.spv"), bytes).unwrap();

        let loaded = load_spirv(&dir, &MAIN_FRAG).unwrap();
        assert_eq!(loaded, words);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn garbage_is_a_shader_error() {
        let err = parse_spirv("bad", &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, VkError::Shader { .. }));
        let err = parse_spirv("bad", &[0, 0, 0, 0]).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }
}
