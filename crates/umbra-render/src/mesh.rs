// SPDX-License-Identifier: CEPL-1.0
use crate::gpu::Vertex;
use crate::material::Material;
use anyhow::{ensure, Result};
use std::sync::Arc;
use umbra_core::ResourceId;
use umbra_math::Transform;

#[derive(Debug)]
pub struct Mesh {
    id: ResourceId,
    name: String,
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    material: Arc<Material>,
}

impl Mesh {
    pub fn new(
        name: impl Into<String>,
        vertices: Vec<Vertex>,
        indices: Vec<u32>,
        material: Arc<Material>,
    ) -> Result<Self> {
        let name = name.into();
        ensure!(!vertices.is_empty(), "mesh '{name}' has no vertices");
        ensure!(
            !indices.is_empty() && indices.len() % 3 == 0,
            "mesh '{name}': index count {} is not a non-zero multiple of 3",
            indices.len()
        );
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            anyhow::bail!(
                "mesh '{name}': index {bad} out of range for {} vertices",
                vertices.len()
            );
        }
        Ok(Self {
            id: ResourceId::next(),
            name,
            vertices,
            indices,
            material,
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn material(&self) -> &Arc<Material> {
        &self.material
    }
}

/// A placed instance: shared meshes plus its own transform. Each model owns
/// a per-frame transform uniform on the GPU.
#[derive(Debug)]
pub struct Model {
    id: ResourceId,
    pub name: String,
    pub meshes: Vec<Arc<Mesh>>,
    pub transform: Transform,
    pub casts_shadow: bool,
}

impl Model {
    pub fn new(name: impl Into<String>, meshes: Vec<Arc<Mesh>>, transform: Transform) -> Self {
        Self {
            id: ResourceId::next(),
            name: name.into(),
            meshes,
            transform,
            casts_shadow: true,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tri() -> Vec<Vertex> {
        vec![Vertex::default(); 3]
    }

    #[test]
    fn rejects_out_of_range_indices() {
        let m = Arc::new(Material::new("m"));
        assert!(Mesh::new("ok", tri(), vec![0, 1, 2], m.clone()).is_ok());
        assert!(Mesh::new("oob", tri(), vec![0, 1, 3], m.clone()).is_err());
        assert!(Mesh::new("partial", tri(), vec![0, 1], m).is_err());
    }
}
