//! Immutable triangle meshes and their bottom level acceleration structures.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::{
    AccelerationStructureInputs, BufferDesc, GpuDescriptorHandle, HeapType, IndexFormat,
    ResourceState, TriangleGeometryDesc, WrappedGpuPointer,
};
use crate::descriptor::BufferDescriptor;
use crate::error::{DeviceResultExt, RenderError, Result};
use crate::session::RenderSession;

use super::{Material, Vertex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryId(u64);

impl GeometryId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

pub struct GeometryDesc {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Option<Vec<u32>>,
    pub material: Option<Arc<Material>>,
}

/// A triangle mesh with its BLAS. Built once, never modified afterwards.
pub struct Geometry {
    id: GeometryId,
    name: String,
    material: Arc<Material>,
    vertex_count: u32,
    index_count: u32,
    geometry_desc: TriangleGeometryDesc,
    build_fence: u64,

    blas: BufferDescriptor,
    attributes: BufferDescriptor,
    vertices: BufferDescriptor,
    indices: Option<BufferDescriptor>,
}

fn invalid(name: &str, reason: impl Into<String>) -> RenderError {
    RenderError::InvalidGeometry {
        name: name.to_owned(),
        reason: reason.into(),
    }
}

fn validate(desc: &GeometryDesc) -> Result<Arc<Material>> {
    let vertex_count = desc.vertices.len();
    if vertex_count == 0 {
        return Err(invalid(&desc.name, "no vertices"));
    }
    if vertex_count > u32::MAX as usize {
        return Err(invalid(&desc.name, "too many vertices"));
    }
    match &desc.indices {
        Some(indices) => {
            if indices.is_empty() {
                return Err(invalid(&desc.name, "index list is empty"));
            }
            if indices.len() % 3 != 0 {
                return Err(invalid(
                    &desc.name,
                    format!("{} indices do not form triangles", indices.len()),
                ));
            }
            if let Some(index) = indices.iter().find(|&&index| index as usize >= vertex_count) {
                return Err(invalid(
                    &desc.name,
                    format!("index {} is out of range for {} vertices", index, vertex_count),
                ));
            }
        }
        None => {
            if vertex_count % 3 != 0 {
                return Err(invalid(
                    &desc.name,
                    format!("{} vertices do not form triangles", vertex_count),
                ));
            }
        }
    }
    desc.material
        .clone()
        .ok_or_else(|| invalid(&desc.name, "no material"))
}

impl Geometry {
    /// Uploads the mesh and builds its BLAS. The build is submitted before this returns.
    pub fn new(session: &RenderSession, desc: GeometryDesc) -> Result<Arc<Self>> {
        let material = validate(&desc)?;
        let context = session.context();
        let descriptors = session.descriptors();
        let name = desc.name;
        let vertex_count = desc.vertices.len() as u32;

        let vertices = descriptors.allocate_raw_buffer_view(context.upload_labeled(
            &format!("{} vertices", name),
            bytemuck::cast_slice(&desc.vertices),
            false,
        )?)?;
        let indices = match &desc.indices {
            Some(indices) => Some(descriptors.allocate_raw_buffer_view(context.upload_labeled(
                &format!("{} indices", name),
                bytemuck::cast_slice(indices),
                false,
            )?)?),
            None => None,
        };
        let index_count = desc.indices.as_ref().map_or(0, |indices| indices.len() as u32);

        let attributes = material.geometry_attributes(
            vertices.wrapped_pointer(),
            vertex_count,
            indices
                .as_ref()
                .map_or(WrappedGpuPointer::NULL, |indices| indices.wrapped_pointer()),
            index_count,
        );
        let attributes = descriptors.allocate_raw_buffer_view(context.upload_labeled(
            &format!("{} attributes", name),
            bytemuck::bytes_of(&attributes),
            false,
        )?)?;

        let geometry_desc = TriangleGeometryDesc {
            vertex_buffer: vertices.gpu_virtual_address(),
            vertex_stride: Vertex::stride(),
            vertex_count,
            vertex_format: Vertex::POSITION_FORMAT,
            index_buffer: indices.as_ref().map(|indices| indices.gpu_virtual_address()),
            index_count,
            index_format: IndexFormat::Uint32,
            opaque: true,
        };
        let inputs = AccelerationStructureInputs::BottomLevel {
            geometries: vec![geometry_desc.clone()],
        };
        let prebuild = context
            .with_backend(|backend| backend.prebuild_info(&inputs))
            .during("GetRaytracingAccelerationStructurePrebuildInfo")?;

        let scratch = context.create_buffer(&BufferDesc {
            label: format!("{} BLAS scratch", name),
            size: prebuild.scratch_size,
            heap: HeapType::Default,
            initial_state: ResourceState::UnorderedAccess,
        })?;
        let blas = descriptors.allocate_acceleration_structure_buffer(prebuild.result_size)?;

        let mut command_list = context.create_command_list_allocator_pair()?;
        command_list
            .build_acceleration_structure(inputs, blas.buffer(), &scratch)
            .uav_barrier(blas.buffer());
        let build_fence = context.execute_command_list(command_list.close())?;
        // Retired once the build completes.
        drop(scratch);

        log::debug!(
            "Built BLAS for `{}`: {} triangles, {} bytes",
            name,
            geometry_desc.primitive_count(),
            prebuild.result_size
        );

        Ok(Arc::new(Self {
            id: GeometryId::next(),
            name,
            material,
            vertex_count,
            index_count,
            geometry_desc,
            build_fence,
            blas,
            attributes,
            vertices,
            indices,
        }))
    }

    pub fn id(&self) -> GeometryId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn material(&self) -> &Arc<Material> {
        &self.material
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn primitive_count(&self) -> u32 {
        self.geometry_desc.primitive_count()
    }

    pub fn blas_pointer(&self) -> WrappedGpuPointer {
        self.blas.wrapped_pointer()
    }

    /// The raw triangle description, for batching several geometries into one BLAS.
    pub fn geometry_desc(&self) -> &TriangleGeometryDesc {
        &self.geometry_desc
    }

    /// GPU handle of the geometry's attribute table, placed in its hit group record.
    pub fn descriptor_table(&self) -> GpuDescriptorHandle {
        self.attributes.gpu_handle()
    }

    /// Fence value at which the BLAS build completes.
    pub fn build_fence(&self) -> u64 {
        self.build_fence
    }

    pub fn vertex_buffer(&self) -> &BufferDescriptor {
        &self.vertices
    }

    pub fn index_buffer(&self) -> Option<&BufferDescriptor> {
        self.indices.as_ref()
    }
}

impl std::fmt::Debug for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Geometry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("vertex_count", &self.vertex_count)
            .field("index_count", &self.index_count)
            .field("blas", &self.blas_pointer())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FallbackBackend, FallbackOptions};

    fn session() -> RenderSession {
        RenderSession::new(
            Box::new(FallbackBackend::new(FallbackOptions::default())),
            64,
        )
        .unwrap()
    }

    fn desc(vertices: usize, indices: Option<Vec<u32>>) -> GeometryDesc {
        GeometryDesc {
            name: "test".into(),
            vertices: (0..vertices)
                .map(|i| Vertex::from_position([i as f32, (i % 2) as f32, -1.0]))
                .collect(),
            indices,
            material: Some(Arc::new(Material::default())),
        }
    }

    fn reason(result: Result<Arc<Geometry>>) -> String {
        match result {
            Err(RenderError::InvalidGeometry { reason, .. }) => reason,
            other => panic!("expected an invalid geometry error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn malformed_meshes_are_rejected() {
        let session = session();
        assert_eq!(reason(Geometry::new(&session, desc(0, None))), "no vertices");
        assert!(reason(Geometry::new(&session, desc(4, None))).contains("do not form triangles"));
        assert!(reason(Geometry::new(&session, desc(3, Some(vec![0, 1])))).contains("indices"));
        assert!(reason(Geometry::new(&session, desc(3, Some(vec![0, 1, 3])))).contains("out of range"));

        let mut missing_material = desc(3, None);
        missing_material.material = None;
        assert_eq!(reason(Geometry::new(&session, missing_material)), "no material");
    }

    #[test]
    fn rejected_meshes_do_not_leak_descriptors() {
        let session = session();
        let before = session.descriptors().free_count();
        assert!(Geometry::new(&session, desc(3, Some(vec![0, 1, 7]))).is_err());
        assert_eq!(session.descriptors().free_count(), before);
    }

    #[test]
    fn indexed_geometry_describes_its_buffers() {
        let session = session();
        let geometry = Geometry::new(&session, desc(4, Some(vec![0, 1, 2, 2, 1, 3]))).unwrap();
        let raw = geometry.geometry_desc();
        assert_eq!(raw.vertex_count, 4);
        assert_eq!(raw.vertex_stride, 48);
        assert_eq!(raw.index_count, 6);
        assert_eq!(geometry.primitive_count(), 2);
        assert_eq!(
            raw.index_buffer,
            geometry.index_buffer().map(|b| b.gpu_virtual_address())
        );
        assert!(!geometry.descriptor_table().is_null());
        assert!(geometry.build_fence() > 0);
    }

    #[test]
    fn blas_pointers_are_distinct_and_non_null() {
        let session = session();
        let a = Geometry::new(&session, desc(3, None)).unwrap();
        let b = Geometry::new(&session, desc(3, None)).unwrap();
        assert!(!a.blas_pointer().is_null());
        assert!(!b.blas_pointer().is_null());
        assert_ne!(a.blas_pointer(), b.blas_pointer());
        assert_ne!(a.id(), b.id());
    }
}
