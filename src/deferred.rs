use std::sync::Arc;

use crate::backend::{BufferDesc, GpuVirtualAddress, HeapType, RaytracingBackend, ResourceId, ResourceState};
use crate::context::{Context, Retire};

/// Owns a device buffer. Dropping it hands the buffer to the context's deletion queue
/// instead of destroying it right away.
pub struct DeferredBuffer {
    context: Arc<Context>,
    resource: ResourceId,
    desc: BufferDesc,
    address: GpuVirtualAddress,
}

pub(crate) struct RetiredBuffer {
    resource: ResourceId,
    label: String,
}

impl Retire for RetiredBuffer {
    fn retire(self: Box<Self>, backend: &mut dyn RaytracingBackend) {
        log::trace!("Destroying buffer `{}`", self.label);
        backend.destroy_buffer(self.resource);
    }
}

impl DeferredBuffer {
    pub(crate) fn new(
        context: Arc<Context>,
        resource: ResourceId,
        desc: BufferDesc,
        address: GpuVirtualAddress,
    ) -> Self {
        Self {
            context,
            resource,
            desc,
            address,
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    pub fn size(&self) -> u64 {
        self.desc.size
    }

    pub fn label(&self) -> &str {
        &self.desc.label
    }

    pub fn heap(&self) -> HeapType {
        self.desc.heap
    }

    pub fn state(&self) -> ResourceState {
        self.desc.initial_state
    }

    pub fn gpu_virtual_address(&self) -> GpuVirtualAddress {
        self.address
    }
}

impl std::fmt::Debug for DeferredBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredBuffer")
            .field("label", &self.desc.label)
            .field("resource", &self.resource)
            .field("size", &self.desc.size)
            .finish()
    }
}

impl Drop for DeferredBuffer {
    fn drop(&mut self) {
        self.context.defer_retire(Box::new(RetiredBuffer {
            resource: self.resource,
            label: std::mem::take(&mut self.desc.label),
        }));
    }
}
