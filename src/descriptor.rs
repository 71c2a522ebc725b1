//! Shader visible descriptor slots and the buffers bound to them.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::backend::{
    BufferDesc, BufferView, CpuDescriptorHandle, DescriptorHeapDesc, GpuDescriptorHandle,
    GpuVirtualAddress, HeapType, RaytracingBackend, ResourceId, ResourceState,
    WrappedGpuPointer,
};
use crate::context::{Context, Retire};
use crate::deferred::DeferredBuffer;
use crate::error::{DeviceError, DeviceResultExt, RenderError, Result};

/// Slot 0 is never handed out, so a zero handle or wrapped pointer always means "none".
const NULL_DESCRIPTOR_INDEX: u32 = 0;

/// One slot of the descriptor heap. Not `Clone`: a slot has exactly one owner.
#[derive(Debug, PartialEq, Eq)]
pub struct Descriptor {
    index: u32,
    cpu_handle: CpuDescriptorHandle,
    gpu_handle: GpuDescriptorHandle,
}

impl Descriptor {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn cpu_handle(&self) -> CpuDescriptorHandle {
        self.cpu_handle
    }

    pub fn gpu_handle(&self) -> GpuDescriptorHandle {
        self.gpu_handle
    }
}

/// Fixed capacity FIFO allocator over the shader visible heap.
pub struct DescriptorAllocator {
    context: Arc<Context>,
    heap: DescriptorHeapDesc,
    free: Mutex<VecDeque<u32>>,
}

impl DescriptorAllocator {
    pub fn new(context: Arc<Context>, capacity: u32) -> Result<Arc<Self>> {
        let heap = context
            .with_backend(|backend| backend.create_descriptor_heap(capacity))
            .and_then(|heap| match heap.stride {
                0 => Err(DeviceError::Validation(
                    "descriptor heap reports a zero handle stride".into(),
                )),
                _ => Ok(heap),
            })
            .during("CreateDescriptorHeap")?;
        log::debug!(
            "Descriptor heap with {} slots, stride {}",
            heap.capacity,
            heap.stride
        );
        let free = (0..heap.capacity)
            .filter(|&index| index != NULL_DESCRIPTOR_INDEX)
            .collect();
        Ok(Arc::new(Self {
            context,
            heap,
            free: Mutex::new(free),
        }))
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn heap(&self) -> &DescriptorHeapDesc {
        &self.heap
    }

    pub fn capacity(&self) -> u32 {
        self.heap.capacity
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Free slots in the order they will be handed out.
    pub fn free_indices(&self) -> Vec<u32> {
        self.free.lock().iter().copied().collect()
    }

    pub fn allocate_descriptor(&self) -> Result<Descriptor> {
        let index = self
            .free
            .lock()
            .pop_front()
            .ok_or(RenderError::DescriptorHeapExhausted {
                capacity: self.heap.capacity,
            })?;
        log::trace!("Allocated descriptor {}", index);
        Ok(Descriptor {
            index,
            cpu_handle: self.heap.cpu_handle(index),
            gpu_handle: self.heap.gpu_handle(index),
        })
    }

    /// Returns the slot to the back of the free list. The caller guarantees no queued
    /// GPU work still reads it.
    pub fn delete_descriptor(&self, descriptor: Descriptor) {
        debug_assert_eq!(descriptor.gpu_handle, self.heap.gpu_handle(descriptor.index));
        log::trace!("Freed descriptor {}", descriptor.index);
        self.free.lock().push_back(descriptor.index);
    }

    /// A device local buffer in the unordered access state, bound as a raw view.
    pub fn allocate_raw_uav_buffer(self: &Arc<Self>, size: u64) -> Result<BufferDescriptor> {
        self.allocate_default_buffer("raw uav", size, ResourceState::UnorderedAccess)
    }

    /// A buffer to hold an acceleration structure, bound as a raw view.
    pub fn allocate_acceleration_structure_buffer(
        self: &Arc<Self>,
        size: u64,
    ) -> Result<BufferDescriptor> {
        self.allocate_default_buffer(
            "acceleration structure",
            size,
            ResourceState::AccelerationStructure,
        )
    }

    fn allocate_default_buffer(
        self: &Arc<Self>,
        label: &str,
        size: u64,
        state: ResourceState,
    ) -> Result<BufferDescriptor> {
        let descriptor = self.allocate_descriptor()?;
        let buffer = self.context.create_buffer(&BufferDesc {
            label: format!("{} #{}", label, descriptor.index),
            size,
            heap: HeapType::Default,
            initial_state: state,
        });
        match buffer {
            Ok(buffer) => self.bind(descriptor, buffer),
            Err(err) => {
                self.delete_descriptor(descriptor);
                Err(err)
            }
        }
    }

    /// Binds a raw view over an existing buffer, such as uploaded vertices.
    pub fn allocate_raw_buffer_view(
        self: &Arc<Self>,
        buffer: DeferredBuffer,
    ) -> Result<BufferDescriptor> {
        let descriptor = self.allocate_descriptor()?;
        self.bind(descriptor, buffer)
    }

    fn bind(
        self: &Arc<Self>,
        descriptor: Descriptor,
        buffer: DeferredBuffer,
    ) -> Result<BufferDescriptor> {
        let view = BufferView {
            resource: buffer.resource(),
            offset: 0,
            size: buffer.size(),
        };
        let pointer = self
            .context
            .with_backend(|backend| {
                backend.write_buffer_view(descriptor.index, &view)?;
                backend.wrap_pointer(descriptor.index, view.resource)
            })
            .during("CreateUnorderedAccessView");
        match pointer {
            Ok(pointer) => Ok(BufferDescriptor {
                descriptor,
                buffer,
                pointer,
                allocator: Arc::downgrade(self),
            }),
            Err(err) => {
                self.delete_descriptor(descriptor);
                Err(err)
            }
        }
    }
}

struct RetiredDescriptor {
    descriptor: Descriptor,
    allocator: Weak<DescriptorAllocator>,
}

impl Retire for RetiredDescriptor {
    fn retire(self: Box<Self>, _backend: &mut dyn RaytracingBackend) {
        if let Some(allocator) = self.allocator.upgrade() {
            allocator.delete_descriptor(self.descriptor);
        }
    }
}

/// A buffer bound to a descriptor slot, with the wrapped pointer shaders use to reach it.
///
/// Dropping it returns the slot to the free list and destroys the buffer, both once the
/// GPU has finished everything submitted so far.
pub struct BufferDescriptor {
    descriptor: Descriptor,
    buffer: DeferredBuffer,
    pointer: WrappedGpuPointer,
    allocator: Weak<DescriptorAllocator>,
}

impl BufferDescriptor {
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn index(&self) -> u32 {
        self.descriptor.index
    }

    pub fn gpu_handle(&self) -> GpuDescriptorHandle {
        self.descriptor.gpu_handle
    }

    pub fn wrapped_pointer(&self) -> WrappedGpuPointer {
        self.pointer
    }

    pub fn buffer(&self) -> &DeferredBuffer {
        &self.buffer
    }

    pub fn resource(&self) -> ResourceId {
        self.buffer.resource()
    }

    pub fn size(&self) -> u64 {
        self.buffer.size()
    }

    pub fn gpu_virtual_address(&self) -> GpuVirtualAddress {
        self.buffer.gpu_virtual_address()
    }
}

impl std::fmt::Debug for BufferDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferDescriptor")
            .field("index", &self.descriptor.index)
            .field("pointer", &self.pointer)
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl Drop for BufferDescriptor {
    fn drop(&mut self) {
        let descriptor = Descriptor {
            index: self.descriptor.index,
            cpu_handle: self.descriptor.cpu_handle,
            gpu_handle: self.descriptor.gpu_handle,
        };
        self.buffer.context().defer_retire(Box::new(RetiredDescriptor {
            descriptor,
            allocator: self.allocator.clone(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FallbackBackend, FallbackOptions};

    fn allocator(capacity: u32) -> Arc<DescriptorAllocator> {
        let context = Context::new(Box::new(FallbackBackend::new(FallbackOptions {
            latency: 0,
        })));
        DescriptorAllocator::new(context, capacity).unwrap()
    }

    #[test]
    fn slot_zero_is_reserved() {
        let allocator = allocator(4);
        assert_eq!(allocator.free_indices(), vec![1, 2, 3]);
        let descriptor = allocator.allocate_descriptor().unwrap();
        assert_eq!(descriptor.index(), 1);
        assert!(!descriptor.gpu_handle().is_null());
    }

    #[test]
    fn handles_follow_the_heap_stride() {
        let allocator = allocator(8);
        let a = allocator.allocate_descriptor().unwrap();
        let b = allocator.allocate_descriptor().unwrap();
        let stride = allocator.heap().stride as u64;
        assert_eq!(b.gpu_handle().0 - a.gpu_handle().0, stride);
        assert_eq!(b.cpu_handle().0 - a.cpu_handle().0, stride);
    }

    #[test]
    fn freed_slots_are_reused_last() {
        let allocator = allocator(4);
        let first = allocator.allocate_descriptor().unwrap();
        allocator.delete_descriptor(first);
        assert_eq!(allocator.free_indices(), vec![2, 3, 1]);
        assert_eq!(allocator.allocate_descriptor().unwrap().index(), 2);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let allocator = allocator(3);
        let _a = allocator.allocate_descriptor().unwrap();
        let _b = allocator.allocate_descriptor().unwrap();
        assert!(matches!(
            allocator.allocate_descriptor(),
            Err(RenderError::DescriptorHeapExhausted { capacity: 3 })
        ));
    }

    #[test]
    fn buffer_descriptors_use_the_requested_state() {
        let allocator = allocator(8);
        let uav = allocator.allocate_raw_uav_buffer(64).unwrap();
        let blas = allocator.allocate_acceleration_structure_buffer(256).unwrap();
        assert_eq!(uav.buffer().state(), ResourceState::UnorderedAccess);
        assert_eq!(blas.buffer().state(), ResourceState::AccelerationStructure);
        assert_ne!(uav.wrapped_pointer(), blas.wrapped_pointer());
        assert!(!uav.wrapped_pointer().is_null());
    }

    #[test]
    fn dropping_a_buffer_descriptor_returns_its_slot() {
        let allocator = allocator(4);
        let before = allocator.free_count();
        let buffer = allocator.allocate_raw_uav_buffer(64).unwrap();
        assert_eq!(allocator.free_count(), before - 1);
        drop(buffer);
        // Nothing was submitted, so the entries retire at fence 0.
        allocator.context().clear_deferred_deletion_queue().unwrap();
        assert_eq!(allocator.free_count(), before);
    }

    #[test]
    fn failed_buffer_creation_keeps_the_slot() {
        let allocator = allocator(4);
        let before = allocator.free_indices();
        assert!(allocator.allocate_raw_uav_buffer(0).is_err());
        let mut after = allocator.free_indices();
        after.sort_unstable();
        assert_eq!(after, before);
    }
}
