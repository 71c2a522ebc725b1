//! Emulated device memory: buffers, their virtual address ranges and the descriptor heap.

use std::collections::{BTreeMap, HashMap};

use crate::backend::{
    BufferDesc, BufferView, CpuDescriptorHandle, DescriptorHeapDesc, GpuDescriptorHandle,
    GpuVirtualAddress, HeapType, ResourceId, ResourceState, WrappedGpuPointer,
};
use crate::error::DeviceError;
use crate::utility::aligned_size_u64;

use super::BuiltStructure;

/// First virtual address handed out. Keeps small integers from ever looking valid.
const ADDRESS_SPACE_START: GpuVirtualAddress = 0x1_0000_0000;
const ADDRESS_ALIGNMENT: u64 = 256;
/// Size of one emulated descriptor, the heap stride.
const DESCRIPTOR_SIZE: u32 = 32;
const HEAP_CPU_START: u64 = 0x10_0000;
const HEAP_GPU_START: u64 = 0x7F00_0000_0000;

pub(super) struct EmulatedBuffer {
    pub label: String,
    pub heap: HeapType,
    pub state: ResourceState,
    pub address: GpuVirtualAddress,
    pub data: Vec<u8>,
    /// Set once a build command has written an acceleration structure here.
    pub structure: Option<BuiltStructure>,
}

impl EmulatedBuffer {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

pub(super) struct EmulatedHeap {
    pub desc: DescriptorHeapDesc,
    slots: Vec<Option<BufferView>>,
}

pub(super) struct EmulatedMemory {
    next_id: u64,
    next_address: GpuVirtualAddress,
    buffers: HashMap<ResourceId, EmulatedBuffer>,
    addresses: BTreeMap<GpuVirtualAddress, ResourceId>,
    heap: Option<EmulatedHeap>,
}

impl EmulatedMemory {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            next_address: ADDRESS_SPACE_START,
            buffers: HashMap::new(),
            addresses: BTreeMap::new(),
            heap: None,
        }
    }

    pub fn create_buffer(&mut self, desc: &BufferDesc) -> Result<ResourceId, DeviceError> {
        if desc.size == 0 {
            return Err(DeviceError::Validation(format!(
                "buffer `{}` has zero size",
                desc.label
            )));
        }
        match (desc.heap, desc.initial_state) {
            (HeapType::Upload, ResourceState::GenericRead) | (HeapType::Default, _) => {}
            (HeapType::Upload, state) => {
                return Err(DeviceError::Validation(format!(
                    "upload heap buffer `{}` must start in GenericRead, not {:?}",
                    desc.label, state
                )))
            }
        }

        let id = ResourceId(self.next_id);
        self.next_id += 1;
        let address = self.next_address;
        self.next_address += aligned_size_u64(desc.size, ADDRESS_ALIGNMENT);

        self.buffers.insert(
            id,
            EmulatedBuffer {
                label: desc.label.clone(),
                heap: desc.heap,
                state: desc.initial_state,
                address,
                data: vec![0; desc.size as usize],
                structure: None,
            },
        );
        self.addresses.insert(address, id);
        Ok(id)
    }

    pub fn destroy_buffer(&mut self, resource: ResourceId) -> Option<EmulatedBuffer> {
        let buffer = self.buffers.remove(&resource)?;
        self.addresses.remove(&buffer.address);
        Some(buffer)
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer(&self, resource: ResourceId) -> Result<&EmulatedBuffer, DeviceError> {
        self.buffers
            .get(&resource)
            .ok_or(DeviceError::UnknownResource(resource))
    }

    pub fn buffer_mut(&mut self, resource: ResourceId) -> Result<&mut EmulatedBuffer, DeviceError> {
        self.buffers
            .get_mut(&resource)
            .ok_or(DeviceError::UnknownResource(resource))
    }

    /// Finds the buffer containing `address` and the offset into it.
    pub fn resolve_address(
        &self,
        address: GpuVirtualAddress,
    ) -> Result<(ResourceId, u64), DeviceError> {
        let (&start, &resource) = self
            .addresses
            .range(..=address)
            .next_back()
            .ok_or(DeviceError::InvalidAddress(address))?;
        let buffer = self.buffer(resource)?;
        let offset = address - start;
        if offset >= buffer.size() {
            return Err(DeviceError::InvalidAddress(address));
        }
        Ok((resource, offset))
    }

    pub fn read_range(
        &self,
        resource: ResourceId,
        offset: u64,
        len: u64,
    ) -> Result<&[u8], DeviceError> {
        let buffer = self.buffer(resource)?;
        let end = offset.checked_add(len).filter(|&end| end <= buffer.size());
        match end {
            Some(end) => Ok(&buffer.data[offset as usize..end as usize]),
            None => Err(DeviceError::Validation(format!(
                "read of {} bytes at offset {} is outside buffer `{}` ({} bytes)",
                len,
                offset,
                buffer.label,
                buffer.size()
            ))),
        }
    }

    pub fn read(&self, address: GpuVirtualAddress, len: u64) -> Result<&[u8], DeviceError> {
        let (resource, offset) = self.resolve_address(address)?;
        self.read_range(resource, offset, len)
    }

    pub fn create_heap(&mut self, capacity: u32) -> Result<DescriptorHeapDesc, DeviceError> {
        if self.heap.is_some() {
            return Err(DeviceError::Validation(
                "the shader visible descriptor heap was already created".into(),
            ));
        }
        if capacity == 0 {
            return Err(DeviceError::Validation(
                "descriptor heap capacity must be at least 1".into(),
            ));
        }
        let desc = DescriptorHeapDesc {
            capacity,
            cpu_start: CpuDescriptorHandle(HEAP_CPU_START),
            gpu_start: GpuDescriptorHandle(HEAP_GPU_START),
            stride: DESCRIPTOR_SIZE,
        };
        self.heap = Some(EmulatedHeap {
            desc,
            slots: vec![None; capacity as usize],
        });
        Ok(desc)
    }

    fn heap(&self) -> Result<&EmulatedHeap, DeviceError> {
        self.heap
            .as_ref()
            .ok_or_else(|| DeviceError::Validation("no descriptor heap was created".into()))
    }

    pub fn write_view(&mut self, index: u32, view: &BufferView) -> Result<(), DeviceError> {
        let buffer = self.buffer(view.resource)?;
        if view.offset + view.size > buffer.size() {
            return Err(DeviceError::Validation(format!(
                "view [{}, {}) exceeds buffer `{}`",
                view.offset,
                view.offset + view.size,
                buffer.label
            )));
        }
        let heap = self
            .heap
            .as_mut()
            .ok_or_else(|| DeviceError::Validation("no descriptor heap was created".into()))?;
        let slot = heap.slots.get_mut(index as usize).ok_or_else(|| {
            DeviceError::Validation(format!("descriptor index {} is outside the heap", index))
        })?;
        *slot = Some(*view);
        Ok(())
    }

    pub fn view(&self, index: u32) -> Result<BufferView, DeviceError> {
        self.heap()?
            .slots
            .get(index as usize)
            .copied()
            .flatten()
            .ok_or_else(|| DeviceError::Validation(format!("descriptor {} is empty", index)))
    }

    pub fn view_for_handle(&self, handle: GpuDescriptorHandle) -> Result<BufferView, DeviceError> {
        let index = self.heap()?.desc.index_of(handle).ok_or_else(|| {
            DeviceError::Validation(format!(
                "{:#x} is not a descriptor handle of this heap",
                handle.0
            ))
        })?;
        self.view(index)
    }

    /// Wrapped pointers are `heap index << 32 | byte offset`.
    pub fn wrap(&self, index: u32, resource: ResourceId) -> Result<WrappedGpuPointer, DeviceError> {
        let view = self.view(index)?;
        if view.resource != resource {
            return Err(DeviceError::Validation(format!(
                "descriptor {} does not describe {:?}",
                index, resource
            )));
        }
        Ok(WrappedGpuPointer((index as u64) << 32))
    }

    fn wrapped_view(&self, pointer: WrappedGpuPointer) -> Result<(BufferView, u64), DeviceError> {
        if pointer.is_null() {
            return Err(DeviceError::InvalidAddress(0));
        }
        let index = (pointer.0 >> 32) as u32;
        let offset = pointer.0 & 0xFFFF_FFFF;
        let view = self.view(index)?;
        if offset >= view.size {
            return Err(DeviceError::InvalidAddress(pointer.0));
        }
        Ok((view, offset))
    }

    pub fn resolve_wrapped(
        &self,
        pointer: WrappedGpuPointer,
    ) -> Result<(ResourceId, u64), DeviceError> {
        let (view, offset) = self.wrapped_view(pointer)?;
        Ok((view.resource, view.offset + offset))
    }

    /// Reads through a wrapped pointer, bounded by the descriptor's view.
    pub fn read_wrapped(
        &self,
        pointer: WrappedGpuPointer,
        offset: u64,
        len: u64,
    ) -> Result<&[u8], DeviceError> {
        let (view, base) = self.wrapped_view(pointer)?;
        let start = base + offset;
        if start + len > view.size {
            return Err(DeviceError::InvalidAddress(pointer.0 + offset));
        }
        self.read_range(view.resource, view.offset + start, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_desc(size: u64, heap: HeapType) -> BufferDesc {
        BufferDesc {
            label: "test".into(),
            size,
            heap,
            initial_state: ResourceState::GenericRead,
        }
    }

    #[test]
    fn addresses_are_aligned_and_resolve_back() {
        let mut memory = EmulatedMemory::new();
        let a = memory.create_buffer(&buffer_desc(10, HeapType::Upload)).unwrap();
        let b = memory.create_buffer(&buffer_desc(300, HeapType::Upload)).unwrap();
        let a_address = memory.buffer(a).unwrap().address;
        let b_address = memory.buffer(b).unwrap().address;
        assert_eq!(a_address % ADDRESS_ALIGNMENT, 0);
        assert_eq!(b_address % ADDRESS_ALIGNMENT, 0);
        assert_eq!(memory.resolve_address(b_address + 299).unwrap(), (b, 299));
        assert_eq!(memory.resolve_address(a_address + 3).unwrap(), (a, 3));
        // Padding between allocations belongs to no one.
        assert!(memory.resolve_address(a_address + 10).is_err());
    }

    #[test]
    fn destroyed_buffers_stop_resolving() {
        let mut memory = EmulatedMemory::new();
        let a = memory.create_buffer(&buffer_desc(16, HeapType::Upload)).unwrap();
        let address = memory.buffer(a).unwrap().address;
        assert!(memory.destroy_buffer(a).is_some());
        assert!(memory.resolve_address(address).is_err());
        assert!(matches!(
            memory.buffer(a),
            Err(DeviceError::UnknownResource(_))
        ));
    }

    #[test]
    fn wrapped_pointers_go_through_the_heap() {
        let mut memory = EmulatedMemory::new();
        memory.create_heap(4).unwrap();
        let a = memory.create_buffer(&buffer_desc(64, HeapType::Upload)).unwrap();
        memory
            .write_view(
                2,
                &BufferView {
                    resource: a,
                    offset: 16,
                    size: 32,
                },
            )
            .unwrap();
        let pointer = memory.wrap(2, a).unwrap();
        assert_eq!(pointer, WrappedGpuPointer(2 << 32));
        assert_eq!(memory.resolve_wrapped(pointer).unwrap(), (a, 16));
        assert!(memory.resolve_wrapped(WrappedGpuPointer((2 << 32) | 32)).is_err());
        assert!(memory.read_wrapped(pointer, 24, 8).is_ok());
        // Inside the buffer but past the end of the view.
        assert!(memory.read_wrapped(pointer, 24, 16).is_err());
    }

    #[test]
    fn upload_buffers_must_be_generic_read() {
        let mut memory = EmulatedMemory::new();
        let mut desc = buffer_desc(16, HeapType::Upload);
        desc.initial_state = ResourceState::UnorderedAccess;
        assert!(memory.create_buffer(&desc).is_err());
        assert!(memory.create_buffer(&buffer_desc(0, HeapType::Default)).is_err());
    }
}
