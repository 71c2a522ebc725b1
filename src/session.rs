use std::sync::Arc;

use crate::backend::{self, RaytracingBackend};
use crate::config_loader::Config;
use crate::context::Context;
use crate::descriptor::DescriptorAllocator;
use crate::error::Result;

/// The device wide objects every renderer component needs: the execution context and the
/// shader visible descriptor allocator.
pub struct RenderSession {
    descriptors: Arc<DescriptorAllocator>,
    context: Arc<Context>,
}

impl RenderSession {
    pub fn new(backend: Box<dyn RaytracingBackend>, descriptor_heap_capacity: u32) -> Result<Self> {
        let context = Context::new(backend);
        let descriptors = DescriptorAllocator::new(context.clone(), descriptor_heap_capacity)?;
        Ok(Self {
            descriptors,
            context,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let backend = backend::create(config.backend, &config.backend_options)?;
        Self::new(backend, config.descriptor_heap_capacity)
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn descriptors(&self) -> &Arc<DescriptorAllocator> {
        &self.descriptors
    }

    /// End of frame housekeeping: frees everything whose fence has completed.
    pub fn end_frame(&self) -> Result<usize> {
        self.context.clear_deferred_deletion_queue()
    }
}
