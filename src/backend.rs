//! The device interface shared by the hardware raytracing path and the emulated fallback.
//!
//! Everything above this layer talks to a `Box<dyn RaytracingBackend>` that is chosen once
//! at startup. Commands are recorded into plain [`Command`] values and only translated into
//! device work on submission, so both backends see exactly the same stream.

pub mod fallback;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, RenderError};

pub use fallback::{FallbackBackend, FallbackOptions};

pub type GpuVirtualAddress = u64;

/// Width of an opaque shader identifier, in bytes.
pub const SHADER_IDENTIFIER_SIZE: usize = 32;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Ray tracing emulated on the CPU. Always available.
    Fallback,
    /// Vulkan ray tracing pipeline and acceleration structure extensions.
    Hardware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandAllocatorId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineId(pub(crate) u64);

/// A pointer that ray tracing shaders can dereference without binding a descriptor table.
///
/// On the hardware path this is a plain device address. The fallback encodes the
/// descriptor heap slot in the upper 32 bits and a byte offset in the lower 32 bits.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct WrappedGpuPointer(pub u64);

impl WrappedGpuPointer {
    pub const NULL: WrappedGpuPointer = WrappedGpuPointer(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuDescriptorHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GpuDescriptorHandle(pub u64);

impl GpuDescriptorHandle {
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapType {
    /// Device local, not CPU visible.
    Default,
    /// CPU writable, GPU readable. Written once at creation.
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    GenericRead,
    UnorderedAccess,
    AccelerationStructure,
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub heap: HeapType,
    pub initial_state: ResourceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendLimits {
    pub shader_identifier_size: u32,
    pub shader_record_alignment: u32,
    pub shader_table_alignment: u32,
    pub max_shader_record_stride: u32,
    pub constant_buffer_alignment: u32,
}

impl Default for BackendLimits {
    fn default() -> Self {
        Self {
            shader_identifier_size: SHADER_IDENTIFIER_SIZE as u32,
            shader_record_alignment: 32,
            shader_table_alignment: 64,
            max_shader_record_stride: 4096,
            constant_buffer_alignment: 256,
        }
    }
}

/// Start and stride of a shader visible descriptor heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    pub capacity: u32,
    pub cpu_start: CpuDescriptorHandle,
    pub gpu_start: GpuDescriptorHandle,
    pub stride: u32,
}

impl DescriptorHeapDesc {
    pub fn cpu_handle(&self, index: u32) -> CpuDescriptorHandle {
        CpuDescriptorHandle(self.cpu_start.0 + index as u64 * self.stride as u64)
    }

    pub fn gpu_handle(&self, index: u32) -> GpuDescriptorHandle {
        GpuDescriptorHandle(self.gpu_start.0 + index as u64 * self.stride as u64)
    }

    /// Inverse of [`Self::gpu_handle`]. A heap with a zero stride maps no handle.
    pub fn index_of(&self, handle: GpuDescriptorHandle) -> Option<u32> {
        let offset = handle.0.checked_sub(self.gpu_start.0)?;
        let stride = self.stride as u64;
        if offset.checked_rem(stride)? != 0 {
            return None;
        }
        let index = offset / stride;
        (index < self.capacity as u64).then_some(index as u32)
    }
}

/// A raw (byte addressed) view over part of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferView {
    pub resource: ResourceId,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint32,
}

/// Raw description of one triangle geometry, as consumed by a BLAS build.
#[derive(Debug, Clone, PartialEq)]
pub struct TriangleGeometryDesc {
    pub vertex_buffer: GpuVirtualAddress,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub vertex_format: VertexFormat,
    pub index_buffer: Option<GpuVirtualAddress>,
    pub index_count: u32,
    pub index_format: IndexFormat,
    pub opaque: bool,
}

impl TriangleGeometryDesc {
    pub fn primitive_count(&self) -> u32 {
        match self.index_buffer {
            Some(_) => self.index_count / 3,
            None => self.vertex_count / 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AccelerationStructureInputs {
    BottomLevel {
        geometries: Vec<TriangleGeometryDesc>,
    },
    TopLevel {
        instance_count: u32,
        instance_descs: GpuVirtualAddress,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrebuildInfo {
    pub result_size: u64,
    pub scratch_size: u64,
}

/// One TLAS instance, laid out exactly as the GPU consumes it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceDesc {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [[f32; 4]; 3],
    /// `instance_id:24 | mask:8`
    pub instance_id_and_mask: u32,
    /// `hit_group_contribution:24 | flags:8`
    pub contribution_and_flags: u32,
    pub acceleration_structure: u64,
}

impl InstanceDesc {
    pub const IDENTITY_TRANSFORM: [[f32; 4]; 3] = [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
    ];

    pub fn new(
        transform: [[f32; 4]; 3],
        instance_id: u32,
        mask: u8,
        hit_group_contribution: u32,
        flags: u8,
        acceleration_structure: WrappedGpuPointer,
    ) -> Self {
        Self {
            transform,
            instance_id_and_mask: (instance_id & 0x00FF_FFFF) | ((mask as u32) << 24),
            contribution_and_flags: (hit_group_contribution & 0x00FF_FFFF)
                | ((flags as u32) << 24),
            acceleration_structure: acceleration_structure.0,
        }
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id_and_mask & 0x00FF_FFFF
    }

    pub fn mask(&self) -> u8 {
        (self.instance_id_and_mask >> 24) as u8
    }

    pub fn hit_group_contribution(&self) -> u32 {
        self.contribution_and_flags & 0x00FF_FFFF
    }

    pub fn flags(&self) -> u8 {
        (self.contribution_and_flags >> 24) as u8
    }

    pub fn acceleration_structure(&self) -> WrappedGpuPointer {
        WrappedGpuPointer(self.acceleration_structure)
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct ShaderIdentifier(pub [u8; SHADER_IDENTIFIER_SIZE]);

/// A strided range of shader records inside a shader table buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableRegion {
    pub start: GpuVirtualAddress,
    pub size: u64,
    pub stride: u64,
}

impl TableRegion {
    pub fn record_count(&self) -> u64 {
        if self.stride == 0 {
            0
        } else {
            self.size / self.stride
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRaysDesc {
    pub ray_generation: TableRegion,
    pub miss: TableRegion,
    pub hit_group: TableRegion,
    pub width: u32,
    pub height: u32,
    /// Bytes for the global root signature, see `RootSignatureDesc::global_arguments_size`.
    pub root_arguments: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BuildAccelerationStructure {
        inputs: AccelerationStructureInputs,
        dest: ResourceId,
        scratch: ResourceId,
    },
    /// Makes writes to `resource` (or to every UAV, when `None`) visible to later commands.
    UavBarrier { resource: Option<ResourceId> },
    SetPipeline(PipelineId),
    DispatchRays(DispatchRaysDesc),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RootSignatureDesc {
    pub global_arguments_size: u32,
    pub local_arguments_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitGroupDesc {
    pub name: String,
    pub closest_hit: String,
    pub any_hit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDesc {
    pub label: String,
    /// Compiled shader library. SPIR-V on the hardware path, ignored by the fallback.
    pub library: Vec<u8>,
    pub ray_generation: String,
    pub miss: Vec<String>,
    pub hit_groups: Vec<HitGroupDesc>,
    pub max_recursion_depth: u32,
    pub root_signature: RootSignatureDesc,
}

impl PipelineDesc {
    /// Every export a shader table can refer to: ray generation, misses, then hit groups.
    pub fn export_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.ray_generation.as_str())
            .chain(self.miss.iter().map(String::as_str))
            .chain(self.hit_groups.iter().map(|group| group.name.as_str()))
    }
}

/// Identifiers of a created pipeline, in the order of [`PipelineDesc::export_names`].
#[derive(Debug, Clone)]
pub struct CreatedPipeline {
    pub id: PipelineId,
    pub identifiers: Vec<(String, ShaderIdentifier)>,
}

/// The operations a raytracing device must provide.
///
/// Methods take `&mut self` where the device mutates state, even when the underlying API
/// would allow shared access, since the context serializes all access anyway.
pub trait RaytracingBackend: Send {
    fn kind(&self) -> BackendKind;
    fn limits(&self) -> BackendLimits;

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<ResourceId, DeviceError>;
    fn destroy_buffer(&mut self, resource: ResourceId);
    /// Maps an upload-heap buffer, copies `data` at `offset` and unmaps it.
    fn write_buffer(
        &mut self,
        resource: ResourceId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError>;
    /// Reads back buffer contents. Callers must wait for any GPU writes first.
    fn read_buffer(
        &mut self,
        resource: ResourceId,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, DeviceError>;
    fn gpu_virtual_address(&self, resource: ResourceId) -> Result<GpuVirtualAddress, DeviceError>;

    fn create_descriptor_heap(&mut self, capacity: u32)
        -> Result<DescriptorHeapDesc, DeviceError>;
    fn write_buffer_view(&mut self, index: u32, view: &BufferView) -> Result<(), DeviceError>;
    fn wrap_pointer(
        &self,
        index: u32,
        resource: ResourceId,
    ) -> Result<WrappedGpuPointer, DeviceError>;

    fn prebuild_info(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> Result<PrebuildInfo, DeviceError>;

    fn create_command_allocator(&mut self) -> Result<CommandAllocatorId, DeviceError>;
    fn destroy_command_allocator(&mut self, allocator: CommandAllocatorId);
    /// Records `commands` with `allocator` and submits them to the direct queue.
    /// The queue's fence is signaled to `signal` once the work completes.
    fn submit(
        &mut self,
        allocator: CommandAllocatorId,
        commands: &[Command],
        signal: u64,
    ) -> Result<(), DeviceError>;
    fn completed_fence_value(&mut self) -> Result<u64, DeviceError>;
    fn wait_for_fence(&mut self, value: u64) -> Result<(), DeviceError>;

    /// Serializes the root signature and creates the raytracing state object.
    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<CreatedPipeline, DeviceError>;
    fn destroy_pipeline(&mut self, pipeline: PipelineId);
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct BackendOptions {
    pub fallback: FallbackOptions,
}

/// Creates the backend selected at startup.
pub fn create(
    kind: BackendKind,
    options: &BackendOptions,
) -> Result<Box<dyn RaytracingBackend>, RenderError> {
    log::info!("Creating {:?} raytracing backend", kind);
    match kind {
        BackendKind::Fallback => Ok(Box::new(FallbackBackend::new(options.fallback.clone()))),
        BackendKind::Hardware => {
            let backend = crate::vulkan::HardwareBackend::new().map_err(|source| {
                RenderError::Device {
                    operation: "CreateDevice",
                    source,
                }
            })?;
            Ok(Box::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_desc_is_64_bytes() {
        assert_eq!(std::mem::size_of::<InstanceDesc>(), 64);
    }

    #[test]
    fn instance_desc_packs_bitfields() {
        let desc = InstanceDesc::new(
            InstanceDesc::IDENTITY_TRANSFORM,
            0x12_3456,
            0x01,
            7,
            0x04,
            WrappedGpuPointer(0xABCD),
        );
        assert_eq!(desc.instance_id(), 0x12_3456);
        assert_eq!(desc.mask(), 1);
        assert_eq!(desc.hit_group_contribution(), 7);
        assert_eq!(desc.flags(), 4);
        assert_eq!(desc.acceleration_structure(), WrappedGpuPointer(0xABCD));
    }

    #[test]
    fn instance_id_is_truncated_to_24_bits() {
        let desc = InstanceDesc::new(
            InstanceDesc::IDENTITY_TRANSFORM,
            0xFF00_0001,
            0xFF,
            0,
            0,
            WrappedGpuPointer::NULL,
        );
        assert_eq!(desc.instance_id(), 1);
        assert_eq!(desc.mask(), 0xFF);
    }

    #[test]
    fn descriptor_heap_handles_round_trip() {
        let heap = DescriptorHeapDesc {
            capacity: 16,
            cpu_start: CpuDescriptorHandle(0x1000),
            gpu_start: GpuDescriptorHandle(0x8000),
            stride: 32,
        };
        assert_eq!(heap.gpu_handle(3), GpuDescriptorHandle(0x8000 + 96));
        assert_eq!(heap.cpu_handle(3), CpuDescriptorHandle(0x1000 + 96));
        assert_eq!(heap.index_of(heap.gpu_handle(3)), Some(3));
        assert_eq!(heap.index_of(GpuDescriptorHandle(0x8000 + 95)), None);
        assert_eq!(heap.index_of(heap.gpu_handle(16)), None);
        assert_eq!(heap.index_of(GpuDescriptorHandle(0x10)), None);
    }

    #[test]
    fn zero_stride_heap_maps_no_handle() {
        let heap = DescriptorHeapDesc {
            capacity: 4,
            cpu_start: CpuDescriptorHandle(0),
            gpu_start: GpuDescriptorHandle(0x100),
            stride: 0,
        };
        assert_eq!(heap.index_of(GpuDescriptorHandle(0x100)), None);
        assert_eq!(heap.index_of(GpuDescriptorHandle(0x120)), None);
    }

    #[test]
    fn primitive_count_depends_on_indexing() {
        let mut desc = TriangleGeometryDesc {
            vertex_buffer: 0x100,
            vertex_stride: 48,
            vertex_count: 9,
            vertex_format: VertexFormat::Float3,
            index_buffer: None,
            index_count: 0,
            index_format: IndexFormat::Uint32,
            opaque: true,
        };
        assert_eq!(desc.primitive_count(), 3);
        desc.index_buffer = Some(0x200);
        desc.index_count = 6;
        assert_eq!(desc.primitive_count(), 2);
    }
}
