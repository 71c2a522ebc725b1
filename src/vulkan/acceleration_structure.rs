use ash::vk;

use crate::backend::{
    AccelerationStructureInputs, IndexFormat, PrebuildInfo, TriangleGeometryDesc, VertexFormat,
};
use crate::error::DeviceError;
use crate::utility::aligned_size_u64;

use super::{buffer::Buffer, context::Context};

/// Wraps the whole of `buffer` in a generic acceleration structure object, so either level
/// can later be built into it.
pub fn create_over_buffer(
    context: &Context,
    buffer: &Buffer,
) -> Result<vk::AccelerationStructureKHR, DeviceError> {
    let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
        .buffer(buffer.inner)
        .size(buffer.size)
        .ty(vk::AccelerationStructureTypeKHR::GENERIC);

    Ok(unsafe {
        context
            .context_raytracing
            .acceleration_structure
            .create_acceleration_structure(&create_info, None)
    }?)
}

pub fn device_address(
    context: &Context,
    structure: vk::AccelerationStructureKHR,
) -> vk::DeviceAddress {
    let info =
        vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(structure);

    unsafe {
        context
            .context_raytracing
            .acceleration_structure
            .get_acceleration_structure_device_address(&info)
    }
}

/// Geometry descriptions and ranges of one build, owned so the build info can point at them.
pub struct BuildGeometry {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub geometries: Vec<vk::AccelerationStructureGeometryKHR>,
    pub ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
}

impl BuildGeometry {
    pub fn new(inputs: &AccelerationStructureInputs) -> Self {
        match inputs {
            AccelerationStructureInputs::BottomLevel { geometries } => Self {
                ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                geometries: geometries.iter().map(triangles).collect(),
                ranges: geometries
                    .iter()
                    .map(|geometry| {
                        vk::AccelerationStructureBuildRangeInfoKHR::builder()
                            .primitive_count(geometry.primitive_count())
                            .build()
                    })
                    .collect(),
            },
            AccelerationStructureInputs::TopLevel {
                instance_count,
                instance_descs,
            } => {
                let instances = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: *instance_descs,
                    })
                    .build();
                let geometry = vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
                    .build();
                Self {
                    ty: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                    geometries: vec![geometry],
                    ranges: vec![vk::AccelerationStructureBuildRangeInfoKHR::builder()
                        .primitive_count(*instance_count)
                        .build()],
                }
            }
        }
    }

    pub fn primitive_counts(&self) -> Vec<u32> {
        self.ranges.iter().map(|range| range.primitive_count).collect()
    }

    pub fn build_info(
        &self,
        dst: vk::AccelerationStructureKHR,
        scratch: vk::DeviceAddress,
    ) -> vk::AccelerationStructureBuildGeometryInfoKHR {
        vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(self.ty)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&self.geometries)
            .dst_acceleration_structure(dst)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch,
            })
            .build()
    }
}

fn triangles(desc: &TriangleGeometryDesc) -> vk::AccelerationStructureGeometryKHR {
    let vertex_format = match desc.vertex_format {
        VertexFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
    };
    let (index_type, index_data) = match (desc.index_buffer, desc.index_format) {
        (Some(address), IndexFormat::Uint32) => (vk::IndexType::UINT32, address),
        (None, _) => (vk::IndexType::NONE_KHR, 0),
    };

    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
        .vertex_format(vertex_format)
        .vertex_data(vk::DeviceOrHostAddressConstKHR {
            device_address: desc.vertex_buffer,
        })
        .vertex_stride(desc.vertex_stride)
        .max_vertex(desc.vertex_count.saturating_sub(1))
        .index_type(index_type)
        .index_data(vk::DeviceOrHostAddressConstKHR {
            device_address: index_data,
        })
        .build();

    let flags = if desc.opaque {
        vk::GeometryFlagsKHR::OPAQUE
    } else {
        vk::GeometryFlagsKHR::empty()
    };

    vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
        .flags(flags)
        .build()
}

// See https://github.com/SaschaWillems/Vulkan/blob/a467d941599a2cef5bd0eff696999bca8d75ee23/base/VulkanRaytracingSample.cpp#L149
pub fn prebuild_info(context: &Context, inputs: &AccelerationStructureInputs) -> PrebuildInfo {
    let geometry = BuildGeometry::new(inputs);
    let build_info = geometry.build_info(vk::AccelerationStructureKHR::null(), 0);

    let sizes = unsafe {
        context
            .context_raytracing
            .acceleration_structure
            .get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &geometry.primitive_counts(),
            )
    };

    let scratch_alignment = context
        .acceleration_structure_properties()
        .min_acceleration_structure_scratch_offset_alignment as u64;

    PrebuildInfo {
        result_size: aligned_size_u64(sizes.acceleration_structure_size, 256),
        scratch_size: aligned_size_u64(sizes.build_scratch_size, scratch_alignment.max(256)),
    }
}
