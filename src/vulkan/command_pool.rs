use ash::vk;

use crate::error::DeviceError;

use super::context::Context;

/// Backs one command allocator. Every command buffer allocated from the pool is freed with
/// it, so a pool may only be destroyed once its last submission has retired.
pub struct CommandPool {
    pub inner: vk::CommandPool,
}

impl CommandPool {
    pub fn new(context: &Context) -> Result<Self, DeviceError> {
        let create_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(context.queue_family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let inner = unsafe { context.device.create_command_pool(&create_info, None) }?;
        Ok(Self { inner })
    }

    /// Allocates a primary command buffer and begins one time recording.
    pub fn begin(&self, context: &Context) -> Result<vk::CommandBuffer, DeviceError> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.inner)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer = unsafe { context.device.allocate_command_buffers(&allocate_info) }?[0];

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            context
                .device
                .begin_command_buffer(command_buffer, &begin_info)
        }?;

        Ok(command_buffer)
    }

    pub fn destroy(self, context: &Context) {
        unsafe { context.device.destroy_command_pool(self.inner, None) };
    }
}
