use serde::{Deserialize, Serialize};
use ultraviolet::Vec3;

use crate::backend::WrappedGpuPointer;
use crate::render::shader_types::GeometryAttributes;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Material {
    pub name: String,
    pub diffuse: Vec3,
    /// Name of the diffuse texture. Textures are not loaded, only flagged to the shader.
    pub diffuse_texture: Option<String>,
    pub roughness: f32,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            diffuse: Vec3::one(),
            diffuse_texture: None,
            roughness: 1.0,
        }
    }
}

impl Material {
    pub fn new(name: &str, diffuse: Vec3) -> Self {
        Self {
            name: name.to_string(),
            diffuse,
            ..Default::default()
        }
    }

    pub(crate) fn geometry_attributes(
        &self,
        vertices: WrappedGpuPointer,
        vertex_count: u32,
        indices: WrappedGpuPointer,
        index_count: u32,
    ) -> GeometryAttributes {
        GeometryAttributes {
            diffuse: [self.diffuse.x, self.diffuse.y, self.diffuse.z, 1.0],
            roughness: self.roughness,
            has_texture: self.diffuse_texture.is_some() as u32,
            vertex_count,
            index_count,
            vertices,
            indices,
        }
    }
}
