//! Layouts shared between the host and the ray tracing programs.
//!
//! Constant buffers use std140 (`crevice`). Everything the programs read through raw
//! buffer views or root arguments is plain `#[repr(C)]` data (`bytemuck`).

use bytemuck::{Pod, Zeroable};
use crevice::std140::AsStd140;
use ultraviolet::{Mat4, Vec3};

use crate::backend::{GpuDescriptorHandle, WrappedGpuPointer};

#[derive(AsStd140, Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub view: Mat4,
    pub proj: Mat4,
    pub view_inv: Mat4,
    pub proj_inv: Mat4,
    pub position: Vec3,
    pub z_near: f32,
    pub z_far: f32,
}

#[derive(AsStd140, Debug, Clone, Copy, PartialEq)]
pub struct Scene {
    pub environment_color: Vec3,
    pub light_count: u32,
}

/// Decodes a std140 constant buffer that was written with `as_std140`.
pub fn read_std140<T: AsStd140>(bytes: &[u8]) -> Option<T> {
    let size = std::mem::size_of::<T::Output>();
    let bytes = bytes.get(..size)?;
    Some(T::from_std140(bytemuck::pod_read_unaligned(bytes)))
}

pub const LIGHT_KIND_DIRECTIONAL: u32 = 0;
pub const LIGHT_KIND_POINT: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightData {
    /// Direction the light travels for directional lights, position for point lights.
    pub vector: [f32; 3],
    pub kind: u32,
    pub color: [f32; 3],
    pub intensity: f32,
}

/// Per-geometry data reached through the hit record's descriptor table.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GeometryAttributes {
    pub diffuse: [f32; 4],
    pub roughness: f32,
    pub has_texture: u32,
    pub vertex_count: u32,
    pub index_count: u32,
    pub vertices: WrappedGpuPointer,
    pub indices: WrappedGpuPointer,
}

/// Local root arguments of a hit group record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct HitGroupRecordData {
    pub descriptor_table: u64,
}

impl HitGroupRecordData {
    pub fn new(descriptor_table: GpuDescriptorHandle) -> Self {
        Self {
            descriptor_table: descriptor_table.0,
        }
    }
}

/// Global root arguments of a frame's dispatch.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GlobalRootArguments {
    pub scene: WrappedGpuPointer,
    pub camera_constants: u64,
    pub scene_constants: u64,
    /// Zero when the scene has no lights.
    pub lights: u64,
    /// GPU descriptor handle of the RGBA8 output buffer.
    pub output: u64,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crevice::std140::Std140;

    #[test]
    fn pod_layouts_have_no_padding() {
        assert_eq!(std::mem::size_of::<LightData>(), 32);
        assert_eq!(std::mem::size_of::<GeometryAttributes>(), 48);
        assert_eq!(std::mem::size_of::<HitGroupRecordData>(), 8);
        assert_eq!(std::mem::size_of::<GlobalRootArguments>(), 48);
    }

    #[test]
    fn std140_scene_constants_read_back() {
        let scene = Scene {
            environment_color: Vec3::new(0.1, 0.2, 0.3),
            light_count: 4,
        };
        let std140 = scene.as_std140();
        let decoded: Scene = read_std140(std140.as_bytes()).unwrap();
        assert_eq!(decoded, scene);
    }

    #[test]
    fn std140_read_rejects_short_buffers() {
        assert!(read_std140::<Scene>(&[0u8; 4]).is_none());
    }
}
