use ash::vk;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator},
    MemoryLocation,
};

use crate::backend::{BufferDesc, HeapType, ResourceState};
use crate::error::DeviceError;

use super::context::Context;

/// Placement alignment for every buffer, large enough for acceleration structures,
/// shader tables and constant buffers alike.
pub const MIN_BUFFER_ALIGNMENT: u64 = 256;

pub struct Buffer {
    pub inner: vk::Buffer,
    pub label: String,
    pub size: vk::DeviceSize,
    pub heap: HeapType,
    pub state: ResourceState,
    pub device_address: vk::DeviceAddress,
    /// Created over the whole buffer for buffers in the acceleration structure state.
    pub acceleration_structure: Option<vk::AccelerationStructureKHR>,
    allocation: Option<Allocation>,
}

fn usage_for(desc: &BufferDesc) -> vk::BufferUsageFlags {
    let common = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST;
    match (desc.heap, desc.initial_state) {
        (_, ResourceState::AccelerationStructure) => {
            common | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
        }
        (HeapType::Upload, _) => {
            common
                | vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
        }
        (HeapType::Default, _) => common,
    }
}

impl Buffer {
    pub fn new(
        context: &Context,
        allocator: &mut Allocator,
        desc: &BufferDesc,
    ) -> Result<Self, DeviceError> {
        if desc.size == 0 {
            return Err(DeviceError::Validation(format!(
                "buffer `{}` has zero size",
                desc.label
            )));
        }
        let location = match desc.heap {
            HeapType::Upload => MemoryLocation::CpuToGpu,
            HeapType::Default => MemoryLocation::GpuOnly,
        };
        Self::with_location(context, allocator, desc, usage_for(desc), location)
    }

    /// A host readable copy target used for readback of device local buffers.
    pub fn readback(
        context: &Context,
        allocator: &mut Allocator,
        size: vk::DeviceSize,
    ) -> Result<Self, DeviceError> {
        let desc = BufferDesc {
            label: "readback".into(),
            size,
            heap: HeapType::Default,
            initial_state: ResourceState::UnorderedAccess,
        };
        Self::with_location(
            context,
            allocator,
            &desc,
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuToCpu,
        )
    }

    fn with_location(
        context: &Context,
        allocator: &mut Allocator,
        desc: &BufferDesc,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self, DeviceError> {
        let device = &context.device;

        let create_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&create_info, None) }?;

        let mut requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        requirements.alignment = requirements.alignment.max(MIN_BUFFER_ALIGNMENT);

        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name: &desc.label,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err.into());
            }
        };

        if let Err(err) =
            unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
        {
            unsafe { device.destroy_buffer(buffer, None) };
            allocator.free(allocation)?;
            return Err(err.into());
        }

        let device_address = {
            let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
            unsafe { device.get_buffer_device_address(&info) }
        };

        let mut created = Self {
            inner: buffer,
            label: desc.label.clone(),
            size: desc.size,
            heap: desc.heap,
            state: desc.initial_state,
            device_address,
            acceleration_structure: None,
            allocation: Some(allocation),
        };

        if desc.initial_state == ResourceState::AccelerationStructure {
            match super::acceleration_structure::create_over_buffer(context, &created) {
                Ok(structure) => created.acceleration_structure = Some(structure),
                Err(err) => {
                    created.destroy(context, allocator);
                    return Err(err);
                }
            }
        }

        Ok(created)
    }

    pub fn mapped_slice(&self) -> Option<&[u8]> {
        let slice = self.allocation.as_ref()?.mapped_slice()?;
        slice.get(..self.size as usize)
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let label = &self.label;
        let size = self.size;
        let mapped = self
            .allocation
            .as_mut()
            .and_then(Allocation::mapped_slice_mut)
            .ok_or_else(|| DeviceError::Validation(format!("`{}` is not CPU visible", label)))?;
        let end = offset as usize + data.len();
        if end as u64 > size {
            return Err(DeviceError::Validation(format!(
                "write of {} bytes at {} overflows `{}`",
                data.len(),
                offset,
                label
            )));
        }
        mapped[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    /// The address shaders and instance descriptions refer to this buffer by.
    pub fn shader_address(&self, context: &Context) -> vk::DeviceAddress {
        match self.acceleration_structure {
            Some(structure) => {
                super::acceleration_structure::device_address(context, structure)
            }
            None => self.device_address,
        }
    }

    pub fn destroy(mut self, context: &Context, allocator: &mut Allocator) {
        if let Some(structure) = self.acceleration_structure.take() {
            unsafe {
                context
                    .context_raytracing
                    .acceleration_structure
                    .destroy_acceleration_structure(structure, None)
            };
        }
        unsafe { context.device.destroy_buffer(self.inner, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(err) = allocator.free(allocation) {
                log::error!("Could not free memory of `{}`: {}", self.label, err);
            }
        }
    }
}
