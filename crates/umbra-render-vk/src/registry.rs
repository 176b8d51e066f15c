// SPDX-License-Identifier: CEPL-1.0
//! Bookkeeping for GPU-resident records, keyed by the CPU resource's id.
//! The registry decides *whether* to create or destroy; the backend decides
//! *how*. That split keeps the idempotency and per-kind rules testable
//! without a device.

use crate::error::VkError;
use anyhow::Result;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::debug;
use umbra_core::ResourceId;
use umbra_render::gpu::{LightUniform, ModelUniform};
use umbra_render::{Material, Mesh, Model, Texture, TextureSlot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Texture,
    Material,
    Mesh,
    Model,
    Light,
}

/// Kinds that own descriptor sets and therefore need a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Material,
    Model,
    Light,
}

impl PoolKind {
    pub const ALL: [PoolKind; 3] = [PoolKind::Material, PoolKind::Model, PoolKind::Light];
}

/// A record holding one uniform buffer and one binding per frame slot.
pub trait PerFrameUniform {
    type Binding: Copy;

    fn frames(&self) -> usize;
    fn write(&self, slot: usize, bytes: &[u8]) -> Result<()>;
    fn binding(&self, slot: usize) -> Self::Binding;
}

/// How records are actually built. Every call here allocates GPU objects;
/// the registry guarantees each is made at most once per id.
pub trait GpuBackend {
    type Pool;
    type Texture;
    type Material;
    type Mesh;
    type Model: PerFrameUniform;
    type Light: PerFrameUniform;

    fn create_pool(&self, kind: PoolKind) -> Result<Self::Pool>;
    fn create_texture(&self, texture: &Texture) -> Result<Self::Texture>;
    fn create_material(
        &self,
        pool: &Self::Pool,
        material: &Material,
        textures: [Option<&Self::Texture>; TextureSlot::COUNT],
    ) -> Result<Self::Material>;
    fn create_mesh(&self, mesh: &Mesh) -> Result<Self::Mesh>;
    fn create_model(&self, pool: &Self::Pool, model: &Model) -> Result<Self::Model>;
    fn create_light(&self, pool: &Self::Pool) -> Result<Self::Light>;
}

// Field order is drop order: records before the pools their sets came
// from, pools before the backend's shared objects.
pub struct Registry<B: GpuBackend> {
    textures: HashMap<ResourceId, B::Texture>,
    materials: HashMap<ResourceId, B::Material>,
    // material id -> texture ids written into its descriptor set
    material_textures: HashMap<ResourceId, Vec<ResourceId>>,
    meshes: HashMap<ResourceId, B::Mesh>,
    models: HashMap<ResourceId, B::Model>,
    light: Option<B::Light>,
    pools: HashMap<PoolKind, B::Pool>,
    backend: B,
}

impl<B: GpuBackend> Registry<B> {
    pub fn new(backend: B) -> Self {
        Self {
            textures: HashMap::new(),
            materials: HashMap::new(),
            material_textures: HashMap::new(),
            meshes: HashMap::new(),
            models: HashMap::new(),
            light: None,
            pools: HashMap::new(),
            backend,
        }
    }

    pub fn create_pool(&mut self, kind: PoolKind) -> Result<&B::Pool> {
        match self.pools.entry(kind) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let pool = self.backend.create_pool(kind)?;
                debug!("created {kind:?} descriptor pool");
                Ok(e.insert(pool))
            }
        }
    }

    pub fn create_texture(&mut self, texture: &Texture) -> Result<&B::Texture> {
        match self.textures.entry(texture.id()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let record = self.backend.create_texture(texture)?;
                debug!(
                    "texture {} '{}' resident ({}x{})",
                    texture.id(),
                    texture.name(),
                    texture.width(),
                    texture.height()
                );
                Ok(e.insert(record))
            }
        }
    }

    /// Also makes every texture the material samples resident.
    pub fn create_material(&mut self, material: &Material) -> Result<&B::Material> {
        let id = material.id();
        if self.materials.contains_key(&id) {
            return Ok(&self.materials[&id]);
        }
        for (_, texture) in material.textures() {
            self.create_texture(texture)?;
        }
        self.create_pool(PoolKind::Material)?;

        let Self {
            textures,
            materials,
            material_textures,
            pools,
            backend,
            ..
        } = self;
        let mut bound: [Option<&B::Texture>; TextureSlot::COUNT] = [None; TextureSlot::COUNT];
        for (slot, texture) in material.textures() {
            bound[slot.index()] = textures.get(&texture.id());
        }
        let record = backend.create_material(&pools[&PoolKind::Material], material, bound)?;
        debug!("material {id} '{}' resident", material.name);
        material_textures.insert(id, material.textures().map(|(_, t)| t.id()).collect());
        Ok(materials.entry(id).or_insert(record))
    }

    pub fn create_mesh(&mut self, mesh: &Mesh) -> Result<&B::Mesh> {
        match self.meshes.entry(mesh.id()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let record = self.backend.create_mesh(mesh)?;
                debug!(
                    "mesh {} '{}' resident ({} indices)",
                    mesh.id(),
                    mesh.name(),
                    mesh.indices().len()
                );
                Ok(e.insert(record))
            }
        }
    }

    pub fn create_model(&mut self, model: &Model) -> Result<&B::Model> {
        let id = model.id();
        if self.models.contains_key(&id) {
            return Ok(&self.models[&id]);
        }
        self.create_pool(PoolKind::Model)?;
        let record = self
            .backend
            .create_model(&self.pools[&PoolKind::Model], model)?;
        debug!("model {id} '{}' resident", model.name);
        Ok(self.models.entry(id).or_insert(record))
    }

    pub fn create_light(&mut self) -> Result<&B::Light> {
        if self.light.is_none() {
            self.create_pool(PoolKind::Light)?;
            let record = self.backend.create_light(&self.pools[&PoolKind::Light])?;
            debug!("light record resident");
            self.light = Some(record);
        }
        self.light.as_ref().ok_or_else(|| VkError::LightNotCreated.into())
    }

    /// Remove one record of `kind`. `false` when there was nothing to remove.
    /// The light record ignores `id`. A texture still bound by a resident
    /// material is refused; destroy the material first.
    pub fn destroy(&mut self, kind: ResourceKind, id: ResourceId) -> Result<bool, VkError> {
        let removed = match kind {
            ResourceKind::Texture => {
                if let Some(material) = self.material_binding(id) {
                    return Err(VkError::TextureInUse { texture: id, material });
                }
                self.textures.remove(&id).is_some()
            }
            ResourceKind::Material => {
                self.material_textures.remove(&id);
                self.materials.remove(&id).is_some()
            }
            ResourceKind::Mesh => self.meshes.remove(&id).is_some(),
            ResourceKind::Model => self.models.remove(&id).is_some(),
            ResourceKind::Light => self.light.take().is_some(),
        };
        if removed {
            debug!("destroyed {kind:?} {id}");
        }
        Ok(removed)
    }

    /// A resident material sampling texture `id`, if any.
    pub fn material_binding(&self, id: ResourceId) -> Option<ResourceId> {
        self.material_textures
            .iter()
            .find(|(_, textures)| textures.contains(&id))
            .map(|(material, _)| *material)
    }

    pub fn check_pool(&self, kind: PoolKind) -> bool {
        self.pools.contains_key(&kind)
    }

    pub fn check_data(&self, kind: ResourceKind, id: ResourceId) -> bool {
        match kind {
            ResourceKind::Texture => self.textures.contains_key(&id),
            ResourceKind::Material => self.materials.contains_key(&id),
            ResourceKind::Mesh => self.meshes.contains_key(&id),
            ResourceKind::Model => self.models.contains_key(&id),
            ResourceKind::Light => self.light.is_some(),
        }
    }

    pub fn pool(&self, kind: PoolKind) -> Option<&B::Pool> {
        self.pools.get(&kind)
    }

    pub fn texture(&self, id: ResourceId) -> Result<&B::Texture, VkError> {
        self.textures.get(&id).ok_or(VkError::RecordNotFound {
            kind: ResourceKind::Texture,
            id,
        })
    }

    pub fn material(&self, id: ResourceId) -> Result<&B::Material, VkError> {
        self.materials.get(&id).ok_or(VkError::RecordNotFound {
            kind: ResourceKind::Material,
            id,
        })
    }

    pub fn mesh(&self, id: ResourceId) -> Result<&B::Mesh, VkError> {
        self.meshes.get(&id).ok_or(VkError::RecordNotFound {
            kind: ResourceKind::Mesh,
            id,
        })
    }

    pub fn model(&self, id: ResourceId) -> Result<&B::Model, VkError> {
        self.models.get(&id).ok_or(VkError::RecordNotFound {
            kind: ResourceKind::Model,
            id,
        })
    }

    pub fn light(&self) -> Result<&B::Light, VkError> {
        self.light.as_ref().ok_or(VkError::LightNotCreated)
    }

    pub fn write_model_uniform(
        &self,
        id: ResourceId,
        slot: usize,
        uniform: &ModelUniform,
    ) -> Result<()> {
        let record = self.model(id)?;
        check_slot(record, slot)?;
        record.write(slot, bytemuck::bytes_of(uniform))
    }

    pub fn write_light_uniform(&self, slot: usize, uniform: &LightUniform) -> Result<()> {
        let record = self.light()?;
        check_slot(record, slot)?;
        record.write(slot, bytemuck::bytes_of(uniform))
    }
}

fn check_slot<U: PerFrameUniform>(record: &U, slot: usize) -> Result<(), VkError> {
    if slot < record.frames() {
        Ok(())
    } else {
        Err(VkError::SlotOutOfRange {
            slot,
            frames: record.frames(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::sync::Arc;
    use umbra_math::Transform;
    use umbra_render::primitives;

    #[derive(Default)]
    struct Log {
        pools: Cell<u32>,
        textures: Cell<u32>,
        materials: Cell<u32>,
        meshes: Cell<u32>,
        models: Cell<u32>,
        lights: Cell<u32>,
        dropped: RefCell<Vec<(ResourceKind, Option<ResourceId>)>>,
    }

    fn bump(c: &Cell<u32>) -> u32 {
        c.set(c.get() + 1);
        c.get()
    }

    struct Tracked {
        kind: ResourceKind,
        id: Option<ResourceId>,
        log: Rc<Log>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.log.dropped.borrow_mut().push((self.kind, self.id));
        }
    }

    struct MockPool {
        kind: PoolKind,
        serial: u32,
    }

    struct MockMaterial {
        _tracked: Tracked,
        textures: [Option<ResourceId>; TextureSlot::COUNT],
    }

    struct MockUniform {
        _tracked: Tracked,
        slots: Vec<RefCell<Vec<u8>>>,
    }

    impl PerFrameUniform for MockUniform {
        type Binding = usize;

        fn frames(&self) -> usize {
            self.slots.len()
        }

        fn write(&self, slot: usize, bytes: &[u8]) -> Result<()> {
            *self.slots[slot].borrow_mut() = bytes.to_vec();
            Ok(())
        }

        fn binding(&self, slot: usize) -> usize {
            slot
        }
    }

    struct MockBackend {
        log: Rc<Log>,
        frames: usize,
    }

    impl MockBackend {
        fn track(&self, kind: ResourceKind, id: Option<ResourceId>) -> Tracked {
            Tracked {
                kind,
                id,
                log: Rc::clone(&self.log),
            }
        }

        fn uniform(&self, kind: ResourceKind, id: Option<ResourceId>) -> MockUniform {
            MockUniform {
                _tracked: self.track(kind, id),
                slots: (0..self.frames).map(|_| RefCell::new(Vec::new())).collect(),
            }
        }
    }

    impl GpuBackend for MockBackend {
        type Pool = MockPool;
        type Texture = Tracked;
        type Material = MockMaterial;
        type Mesh = Tracked;
        type Model = MockUniform;
        type Light = MockUniform;

        fn create_pool(&self, kind: PoolKind) -> Result<MockPool> {
            Ok(MockPool {
                kind,
                serial: bump(&self.log.pools),
            })
        }

        fn create_texture(&self, texture: &Texture) -> Result<Tracked> {
            bump(&self.log.textures);
            Ok(self.track(ResourceKind::Texture, Some(texture.id())))
        }

        fn create_material(
            &self,
            pool: &MockPool,
            material: &Material,
            textures: [Option<&Tracked>; TextureSlot::COUNT],
        ) -> Result<MockMaterial> {
            assert_eq!(pool.kind, PoolKind::Material);
            bump(&self.log.materials);
            Ok(MockMaterial {
                _tracked: self.track(ResourceKind::Material, Some(material.id())),
                textures: textures.map(|t| t.and_then(|t| t.id)),
            })
        }

        fn create_mesh(&self, mesh: &Mesh) -> Result<Tracked> {
            bump(&self.log.meshes);
            Ok(self.track(ResourceKind::Mesh, Some(mesh.id())))
        }

        fn create_model(&self, pool: &MockPool, model: &Model) -> Result<MockUniform> {
            assert_eq!(pool.kind, PoolKind::Model);
            bump(&self.log.models);
            Ok(self.uniform(ResourceKind::Model, Some(model.id())))
        }

        fn create_light(&self, pool: &MockPool) -> Result<MockUniform> {
            assert_eq!(pool.kind, PoolKind::Light);
            bump(&self.log.lights);
            Ok(self.uniform(ResourceKind::Light, None))
        }
    }

    fn registry(frames: usize) -> (Registry<MockBackend>, Rc<Log>) {
        let log = Rc::new(Log::default());
        let backend = MockBackend {
            log: Rc::clone(&log),
            frames,
        };
        (Registry::new(backend), log)
    }

    fn textured_material() -> (Material, Arc<Texture>) {
        let albedo = Arc::new(Texture::solid("albedo", [200, 40, 40, 255], true));
        let material = Material::new("painted").with_texture(TextureSlot::Albedo, albedo.clone());
        (material, albedo)
    }

    fn model() -> Model {
        let material = Arc::new(Material::new("plain"));
        let mesh = primitives::cube("cube", material).unwrap();
        Model::new("box", vec![Arc::new(mesh)], Transform::IDENTITY)
    }

    #[test]
    fn create_pool_is_idempotent() {
        let (mut reg, log) = registry(2);
        assert!(!reg.check_pool(PoolKind::Model));
        let first = reg.create_pool(PoolKind::Model).unwrap().serial;
        let second = reg.create_pool(PoolKind::Model).unwrap().serial;
        assert_eq!(first, second);
        assert_eq!(log.pools.get(), 1);
        assert!(reg.check_pool(PoolKind::Model));
        assert!(!reg.check_pool(PoolKind::Material));
    }

    #[test]
    fn second_create_returns_existing_record() {
        let (mut reg, log) = registry(2);
        let (material, _) = textured_material();
        reg.create_material(&material).unwrap();
        reg.create_material(&material).unwrap();
        assert_eq!(log.materials.get(), 1);
        assert_eq!(log.textures.get(), 1);
        assert_eq!(log.pools.get(), 1);

        let m = model();
        reg.create_mesh(&m.meshes[0]).unwrap();
        reg.create_mesh(&m.meshes[0]).unwrap();
        reg.create_model(&m).unwrap();
        reg.create_model(&m).unwrap();
        reg.create_light().unwrap();
        reg.create_light().unwrap();
        assert_eq!(log.meshes.get(), 1);
        assert_eq!(log.models.get(), 1);
        assert_eq!(log.lights.get(), 1);
        assert!(log.dropped.borrow().is_empty());
    }

    #[test]
    fn material_creation_makes_its_textures_resident() {
        let (mut reg, _log) = registry(1);
        let (material, albedo) = textured_material();
        let record = reg.create_material(&material).unwrap();
        assert_eq!(
            record.textures[TextureSlot::Albedo.index()],
            Some(albedo.id())
        );
        assert_eq!(record.textures[TextureSlot::Normal.index()], None);
        assert!(reg.check_data(ResourceKind::Texture, albedo.id()));
    }

    #[test]
    fn shared_texture_is_uploaded_once() {
        let (mut reg, log) = registry(1);
        let (a, albedo) = textured_material();
        let b = Material::new("other").with_texture(TextureSlot::Emissive, albedo);
        reg.create_material(&a).unwrap();
        reg.create_material(&b).unwrap();
        assert_eq!(log.textures.get(), 1);
        assert_eq!(log.materials.get(), 2);
    }

    #[test]
    fn destroy_targets_only_its_kind() {
        let (mut reg, log) = registry(1);
        let m = model();
        let mesh = m.meshes[0].clone();
        reg.create_mesh(&mesh).unwrap();
        reg.create_model(&m).unwrap();

        // model id is not a mesh id
        assert!(!reg.destroy(ResourceKind::Mesh, m.id()).unwrap());
        assert!(reg.check_data(ResourceKind::Model, m.id()));

        assert!(reg.destroy(ResourceKind::Model, m.id()).unwrap());
        assert!(!reg.check_data(ResourceKind::Model, m.id()));
        assert!(reg.check_data(ResourceKind::Mesh, mesh.id()));
        assert_eq!(
            *log.dropped.borrow(),
            vec![(ResourceKind::Model, Some(m.id()))]
        );

        // second destroy is a no-op
        assert!(!reg.destroy(ResourceKind::Model, m.id()).unwrap());
        assert_eq!(log.dropped.borrow().len(), 1);
    }

    #[test]
    fn lookup_after_destroy_is_not_found() {
        let (mut reg, _log) = registry(1);
        let m = model();
        reg.create_model(&m).unwrap();
        reg.destroy(ResourceKind::Model, m.id()).unwrap();
        match reg.model(m.id()) {
            Err(VkError::RecordNotFound { kind, id }) => {
                assert_eq!(kind, ResourceKind::Model);
                assert_eq!(id, m.id());
            }
            Ok(_) => panic!("model should be gone"),
            Err(other) => panic!("unexpected error: {other}"),
        }
        assert!(matches!(reg.light(), Err(VkError::LightNotCreated)));
    }

    #[test]
    fn texture_lookup_after_destroy_is_not_found() {
        let (mut reg, log) = registry(1);
        let albedo = Texture::solid("loose", [10, 20, 30, 255], false);
        reg.create_texture(&albedo).unwrap();
        assert!(reg.destroy(ResourceKind::Texture, albedo.id()).unwrap());
        assert!(matches!(
            reg.texture(albedo.id()),
            Err(VkError::RecordNotFound { kind: ResourceKind::Texture, id }) if id == albedo.id()
        ));

        // a fresh create after destroy uploads again
        reg.create_texture(&albedo).unwrap();
        assert_eq!(log.textures.get(), 2);
    }

    #[test]
    fn texture_bound_by_a_material_cannot_be_destroyed() {
        let (mut reg, log) = registry(1);
        let (material, albedo) = textured_material();
        reg.create_material(&material).unwrap();

        match reg.destroy(ResourceKind::Texture, albedo.id()) {
            Err(VkError::TextureInUse { texture, material: by }) => {
                assert_eq!(texture, albedo.id());
                assert_eq!(by, material.id());
            }
            other => panic!("expected TextureInUse, got {other:?}"),
        }
        assert!(reg.check_data(ResourceKind::Texture, albedo.id()));
        assert!(log.dropped.borrow().is_empty());

        // once the material is gone the texture is free to go
        assert!(reg.destroy(ResourceKind::Material, material.id()).unwrap());
        assert_eq!(reg.material_binding(albedo.id()), None);
        assert!(reg.destroy(ResourceKind::Texture, albedo.id()).unwrap());
        assert_eq!(
            *log.dropped.borrow(),
            vec![
                (ResourceKind::Material, Some(material.id())),
                (ResourceKind::Texture, Some(albedo.id())),
            ]
        );
    }

    #[test]
    fn shared_texture_stays_while_any_material_binds_it() {
        let (mut reg, _log) = registry(1);
        let (a, albedo) = textured_material();
        let b = Material::new("other").with_texture(TextureSlot::Emissive, albedo.clone());
        reg.create_material(&a).unwrap();
        reg.create_material(&b).unwrap();

        reg.destroy(ResourceKind::Material, a.id()).unwrap();
        assert_eq!(reg.material_binding(albedo.id()), Some(b.id()));
        assert!(reg.destroy(ResourceKind::Texture, albedo.id()).is_err());
    }

    #[test]
    fn uniform_writes_touch_one_slot_only() {
        let (mut reg, _log) = registry(3);
        let m = model();
        reg.create_model(&m).unwrap();
        reg.create_light().unwrap();

        let mut uniform = ModelUniform::default();
        uniform.camera_position = [1.0, 2.0, 3.0, 1.0];
        reg.write_model_uniform(m.id(), 1, &uniform).unwrap();

        let record = reg.model(m.id()).unwrap();
        assert!(record.slots[0].borrow().is_empty());
        assert_eq!(&*record.slots[1].borrow(), bytemuck::bytes_of(&uniform));
        assert!(record.slots[2].borrow().is_empty());

        let light = LightUniform::default();
        reg.write_light_uniform(2, &light).unwrap();
        let record = reg.light().unwrap();
        assert!(record.slots[0].borrow().is_empty());
        assert!(record.slots[1].borrow().is_empty());
        assert_eq!(record.slots[2].borrow().len(), std::mem::size_of::<LightUniform>());
    }

    #[test]
    fn out_of_range_slot_is_rejected() {
        let (mut reg, _log) = registry(2);
        let m = model();
        reg.create_model(&m).unwrap();
        let err = reg
            .write_model_uniform(m.id(), 2, &ModelUniform::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VkError>(),
            Some(VkError::SlotOutOfRange { slot: 2, frames: 2 })
        ));
    }

    #[test]
    fn light_destroy_ignores_id() {
        let (mut reg, log) = registry(1);
        reg.create_light().unwrap();
        assert!(reg.destroy(ResourceKind::Light, ResourceId::next()).unwrap());
        assert!(!reg.check_data(ResourceKind::Light, ResourceId::next()));
        assert_eq!(*log.dropped.borrow(), vec![(ResourceKind::Light, None)]);
    }
}
