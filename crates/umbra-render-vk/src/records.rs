// SPDX-License-Identifier: CEPL-1.0
//! Vulkan-side records: what a texture, material, mesh, model instance or the
//! scene light look like once resident.

use crate::device::DeviceContext;
use crate::error::VkError;
use crate::handles::{
    DescriptorSets, MappedBuffer, OwnedBuffer, OwnedDescriptorPool, OwnedImage, OwnedImageView,
    OwnedSampler, OwnedSetLayout,
};
use crate::registry::{GpuBackend, PerFrameUniform, PoolKind};
use crate::upload::{self, texture_format, Upload};
use anyhow::{Context, Result};
use ash::vk;
use std::mem::size_of;
use std::sync::Arc;
use umbra_render::gpu::{LightUniform, MaterialUniform, ModelUniform};
use umbra_render::{Material, Mesh, Model, RendererConfig, Texture, TextureSlot};

/// Layout bindings of each pool kind's descriptor set.
pub fn pool_bindings(kind: PoolKind) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
    let binding = |binding, descriptor_type, descriptor_count, stage_flags| {
        vk::DescriptorSetLayoutBinding {
            binding,
            descriptor_type,
            descriptor_count,
            stage_flags,
            ..Default::default()
        }
    };
    let ubo = vk::DescriptorType::UNIFORM_BUFFER;
    let cis = vk::DescriptorType::COMBINED_IMAGE_SAMPLER;
    let frag = vk::ShaderStageFlags::FRAGMENT;
    match kind {
        PoolKind::Material => vec![
            binding(0, ubo, 1, frag),
            binding(1, cis, TextureSlot::COUNT as u32, frag),
        ],
        PoolKind::Model => vec![binding(
            0,
            ubo,
            1,
            vk::ShaderStageFlags::VERTEX | frag,
        )],
        PoolKind::Light => vec![binding(0, ubo, 1, frag), binding(1, cis, 1, frag)],
    }
}

/// Descriptor totals for a pool that can hold `max_sets` sets of `kind`.
pub fn pool_sizes(kind: PoolKind, max_sets: u32) -> Vec<vk::DescriptorPoolSize> {
    pool_bindings(kind)
        .into_iter()
        .map(|b| vk::DescriptorPoolSize {
            ty: b.descriptor_type,
            descriptor_count: b.descriptor_count * max_sets,
        })
        .collect()
}

pub struct PoolRecord {
    kind: PoolKind,
    // pool before layout: sets die with the pool
    pool: OwnedDescriptorPool,
    layout: OwnedSetLayout,
}

impl PoolRecord {
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout.raw()
    }

    fn allocate(&self, ctx: &Arc<DeviceContext>, count: usize) -> Result<DescriptorSets> {
        let layouts = vec![self.layout.raw(); count];
        let ai = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: self.pool.raw(),
            descriptor_set_count: layouts.len() as u32,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        match unsafe { ctx.device().allocate_descriptor_sets(&ai) } {
            Ok(sets) => Ok(DescriptorSets::new(ctx, self.pool.raw(), sets)),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                Err(VkError::PoolExhausted(self.kind).into())
            }
            Err(e) => Err(VkError::from(e)).context("allocate_descriptor_sets"),
        }
    }
}

pub struct TextureRecord {
    view: OwnedImageView,
    image: OwnedImage,
}

impl TextureRecord {
    pub fn view(&self) -> vk::ImageView {
        self.view.raw()
    }

    pub fn format(&self) -> vk::Format {
        self.image.format()
    }

    pub fn mip_levels(&self) -> u32 {
        self.image.mip_levels()
    }
}

pub struct MaterialRecord {
    sets: DescriptorSets,
    _uniform: OwnedBuffer,
}

impl MaterialRecord {
    pub fn set(&self) -> vk::DescriptorSet {
        self.sets.get(0)
    }
}

pub struct MeshRecord {
    vertices: OwnedBuffer,
    indices: OwnedBuffer,
    index_count: u32,
}

impl MeshRecord {
    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.vertices.raw()
    }

    pub fn index_buffer(&self) -> vk::Buffer {
        self.indices.raw()
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}

/// One persistently mapped uniform buffer and one descriptor set per frame
/// slot. Used for model instances and the scene light.
pub struct FrameUniformRecord {
    sets: DescriptorSets,
    buffers: Vec<MappedBuffer>,
}

impl PerFrameUniform for FrameUniformRecord {
    type Binding = vk::DescriptorSet;

    fn frames(&self) -> usize {
        self.buffers.len()
    }

    fn write(&self, slot: usize, bytes: &[u8]) -> Result<()> {
        self.buffers[slot].write(0, bytes)
    }

    fn binding(&self, slot: usize) -> vk::DescriptorSet {
        self.sets.get(slot)
    }
}

pub type ModelRecord = FrameUniformRecord;

pub struct LightRecord {
    frames: FrameUniformRecord,
}

impl LightRecord {
    /// Point binding 1 of every slot's set at the shadow map. Needed after
    /// creation and after every shadow map rebuild; the device must be idle.
    pub fn bind_shadow_map(&self, ctx: &DeviceContext, view: vk::ImageView, sampler: vk::Sampler) {
        let info = vk::DescriptorImageInfo {
            sampler,
            image_view: view,
            image_layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        };
        let writes: Vec<_> = self
            .frames
            .sets
            .iter()
            .map(|set| vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: set,
                dst_binding: 1,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                p_image_info: &info,
                ..Default::default()
            })
            .collect();
        unsafe { ctx.device().update_descriptor_sets(&writes, &[]) };
    }
}

impl PerFrameUniform for LightRecord {
    type Binding = vk::DescriptorSet;

    fn frames(&self) -> usize {
        self.frames.frames()
    }

    fn write(&self, slot: usize, bytes: &[u8]) -> Result<()> {
        self.frames.write(slot, bytes)
    }

    fn binding(&self, slot: usize) -> vk::DescriptorSet {
        self.frames.binding(slot)
    }
}

pub struct VkBackend {
    ctx: Arc<DeviceContext>,
    uploader: Box<dyn Upload>,
    frames: usize,
    max_materials: u32,
    max_models: u32,
    /// Bound to material slots that have no texture.
    placeholder: TextureRecord,
    sampler: OwnedSampler,
}

impl VkBackend {
    pub fn new(
        ctx: Arc<DeviceContext>,
        uploader: Box<dyn Upload>,
        config: &RendererConfig,
    ) -> Result<Self> {
        let white = Texture::solid("placeholder", [255, 255, 255, 255], false);
        let placeholder = upload_texture(uploader.as_ref(), &white)?;
        let sampler = create_texture_sampler(&ctx)?;
        Ok(Self {
            ctx,
            uploader,
            frames: config.frames_in_flight(),
            max_materials: config.max_materials.max(1),
            max_models: config.max_models.max(1),
            placeholder,
            sampler,
        })
    }

    fn capacity(&self, kind: PoolKind) -> u32 {
        let frames = self.frames as u32;
        match kind {
            PoolKind::Material => self.max_materials,
            PoolKind::Model => self.max_models * frames,
            PoolKind::Light => frames,
        }
    }

    fn frame_uniforms(&self, pool: &PoolRecord, size: usize) -> Result<FrameUniformRecord> {
        let sets = pool.allocate(&self.ctx, self.frames)?;
        let mut buffers = Vec::with_capacity(self.frames);
        for _ in 0..self.frames {
            let buffer = upload::create_buffer(
                &self.ctx,
                size as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            buffers.push(MappedBuffer::new(buffer)?);
        }

        let infos: Vec<_> = buffers
            .iter()
            .map(|b| vk::DescriptorBufferInfo {
                buffer: b.raw(),
                offset: 0,
                range: size as vk::DeviceSize,
            })
            .collect();
        let writes: Vec<_> = sets
            .iter()
            .zip(&infos)
            .map(|(set, info)| vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: set,
                dst_binding: 0,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: info,
                ..Default::default()
            })
            .collect();
        unsafe { self.ctx.device().update_descriptor_sets(&writes, &[]) };
        Ok(FrameUniformRecord { sets, buffers })
    }
}

impl GpuBackend for VkBackend {
    type Pool = PoolRecord;
    type Texture = TextureRecord;
    type Material = MaterialRecord;
    type Mesh = MeshRecord;
    type Model = ModelRecord;
    type Light = LightRecord;

    fn create_pool(&self, kind: PoolKind) -> Result<PoolRecord> {
        let d = self.ctx.device();
        let bindings = pool_bindings(kind);
        let lci = vk::DescriptorSetLayoutCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
            binding_count: bindings.len() as u32,
            p_bindings: bindings.as_ptr(),
            ..Default::default()
        };
        let layout = unsafe { d.create_descriptor_set_layout(&lci, None) }
            .with_context(|| format!("{kind:?} descriptor set layout"))?;
        let layout = OwnedSetLayout::new(&self.ctx, layout);

        let capacity = self.capacity(kind);
        let sizes = pool_sizes(kind, capacity);
        let pci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            flags: vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
            max_sets: capacity,
            pool_size_count: sizes.len() as u32,
            p_pool_sizes: sizes.as_ptr(),
            ..Default::default()
        };
        let pool = unsafe { d.create_descriptor_pool(&pci, None) }
            .with_context(|| format!("{kind:?} descriptor pool"))?;
        Ok(PoolRecord {
            kind,
            pool: OwnedDescriptorPool::new(&self.ctx, pool),
            layout,
        })
    }

    fn create_texture(&self, texture: &Texture) -> Result<TextureRecord> {
        upload_texture(self.uploader.as_ref(), texture)
            .with_context(|| format!("upload texture '{}'", texture.name()))
    }

    fn create_material(
        &self,
        pool: &PoolRecord,
        material: &Material,
        textures: [Option<&TextureRecord>; TextureSlot::COUNT],
    ) -> Result<MaterialRecord> {
        let uniform: MaterialUniform = material.uniform();
        let buffer = self
            .uploader
            .upload_buffer(
                bytemuck::bytes_of(&uniform),
                vk::BufferUsageFlags::UNIFORM_BUFFER,
            )
            .with_context(|| format!("material '{}' uniform", material.name))?;
        let sets = pool.allocate(&self.ctx, 1)?;

        let buffer_info = vk::DescriptorBufferInfo {
            buffer: buffer.raw(),
            offset: 0,
            range: size_of::<MaterialUniform>() as vk::DeviceSize,
        };
        let image_infos = textures.map(|t| vk::DescriptorImageInfo {
            sampler: self.sampler.raw(),
            image_view: t.unwrap_or(&self.placeholder).view(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        });
        let writes = [
            vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: sets.get(0),
                dst_binding: 0,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: &buffer_info,
                ..Default::default()
            },
            vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: sets.get(0),
                dst_binding: 1,
                dst_array_element: 0,
                descriptor_count: image_infos.len() as u32,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                p_image_info: image_infos.as_ptr(),
                ..Default::default()
            },
        ];
        unsafe { self.ctx.device().update_descriptor_sets(&writes, &[]) };
        Ok(MaterialRecord {
            sets,
            _uniform: buffer,
        })
    }

    fn create_mesh(&self, mesh: &Mesh) -> Result<MeshRecord> {
        let vertices = self
            .uploader
            .upload_buffer(
                bytemuck::cast_slice(mesh.vertices()),
                vk::BufferUsageFlags::VERTEX_BUFFER,
            )
            .with_context(|| format!("mesh '{}' vertices", mesh.name()))?;
        let indices = self
            .uploader
            .upload_buffer(
                bytemuck::cast_slice(mesh.indices()),
                vk::BufferUsageFlags::INDEX_BUFFER,
            )
            .with_context(|| format!("mesh '{}' indices", mesh.name()))?;
        Ok(MeshRecord {
            vertices,
            indices,
            index_count: mesh.indices().len() as u32,
        })
    }

    fn create_model(&self, pool: &PoolRecord, model: &Model) -> Result<ModelRecord> {
        self.frame_uniforms(pool, size_of::<ModelUniform>())
            .with_context(|| format!("model '{}' uniforms", model.name))
    }

    fn create_light(&self, pool: &PoolRecord) -> Result<LightRecord> {
        let frames = self
            .frame_uniforms(pool, size_of::<LightUniform>())
            .context("light uniforms")?;
        Ok(LightRecord { frames })
    }
}

fn upload_texture(uploader: &dyn Upload, texture: &Texture) -> Result<TextureRecord> {
    let uploaded = uploader.upload_texture(
        texture.pixels(),
        texture.width(),
        texture.height(),
        texture_format(texture.contains_color_data()),
    )?;
    Ok(TextureRecord {
        view: uploaded.view,
        image: uploaded.image,
    })
}

fn create_texture_sampler(ctx: &Arc<DeviceContext>) -> Result<OwnedSampler> {
    let ci = vk::SamplerCreateInfo {
        s_type: vk::StructureType::SAMPLER_CREATE_INFO,
        mag_filter: vk::Filter::LINEAR,
        min_filter: vk::Filter::LINEAR,
        mipmap_mode: vk::SamplerMipmapMode::LINEAR,
        address_mode_u: vk::SamplerAddressMode::REPEAT,
        address_mode_v: vk::SamplerAddressMode::REPEAT,
        address_mode_w: vk::SamplerAddressMode::REPEAT,
        min_lod: 0.0,
        max_lod: vk::LOD_CLAMP_NONE,
        ..Default::default()
    };
    let sampler = unsafe { ctx.device().create_sampler(&ci, None) }.context("create_sampler")?;
    Ok(OwnedSampler::new(ctx, sampler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn material_layout_has_uniform_and_texture_array() {
        let b = pool_bindings(PoolKind::Material);
        assert_eq!(b.len(), 2);
        assert_eq!(b[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(b[1].binding, 1);
        assert_eq!(
            b[1].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(b[1].descriptor_count, TextureSlot::COUNT as u32);
    }

    #[test]
    fn model_uniform_is_visible_to_both_stages() {
        let b = pool_bindings(PoolKind::Model);
        assert_eq!(b.len(), 1);
        assert!(b[0].stage_flags.contains(vk::ShaderStageFlags::VERTEX));
        assert!(b[0].stage_flags.contains(vk::ShaderStageFlags::FRAGMENT));
    }

    #[test]
    fn light_layout_carries_shadow_sampler() {
        let b = pool_bindings(PoolKind::Light);
        assert_eq!(b[1].binding, 1);
        assert_eq!(b[1].descriptor_count, 1);
        assert_eq!(
            b[1].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
    }

    #[test]
    fn pool_sizes_scale_with_capacity() {
        let sizes = pool_sizes(PoolKind::Material, 10);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].descriptor_count, 10);
        assert_eq!(sizes[1].descriptor_count, 50);

        let sizes = pool_sizes(PoolKind::Model, 6);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 6);
    }
}
