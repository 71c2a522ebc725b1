use ash::vk;

use crate::error::DeviceError;

use super::context::Context;

/// A bindless array of storage buffers standing in for a shader visible descriptor heap.
///
/// Slot `i` is binding 0, array element `i`. Slots can be rewritten while a command buffer
/// that binds the set is pending, as long as that command buffer never reads them.
pub struct DescriptorHeap {
    pub layout: vk::DescriptorSetLayout,
    pub set: vk::DescriptorSet,
    pub capacity: u32,
    pool: vk::DescriptorPool,
}

impl DescriptorHeap {
    pub fn new(context: &Context, capacity: u32) -> Result<Self, DeviceError> {
        let device = &context.device;

        let binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(capacity)
            .stage_flags(vk::ShaderStageFlags::ALL);
        let binding_flags = [vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::PARTIALLY_BOUND];
        let mut binding_flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&binding_flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(std::slice::from_ref(&binding))
            .push_next(&mut binding_flags_info);
        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }?;

        let pool_size = vk::DescriptorPoolSize::builder()
            .ty(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(capacity);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(std::slice::from_ref(&pool_size));
        let pool = match unsafe { device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(err) => {
                unsafe { device.destroy_descriptor_set_layout(layout, None) };
                return Err(err.into());
            }
        };

        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(std::slice::from_ref(&layout));
        let set = match unsafe { device.allocate_descriptor_sets(&allocate_info) } {
            Ok(sets) => sets[0],
            Err(err) => {
                unsafe {
                    device.destroy_descriptor_pool(pool, None);
                    device.destroy_descriptor_set_layout(layout, None);
                }
                return Err(err.into());
            }
        };

        Ok(Self {
            layout,
            set,
            capacity,
            pool,
        })
    }

    pub fn write_storage_buffer(
        &self,
        context: &Context,
        index: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        let info = vk::DescriptorBufferInfo::builder()
            .buffer(buffer)
            .offset(offset)
            .range(range);
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(0)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(std::slice::from_ref(&info));

        unsafe {
            context
                .device
                .update_descriptor_sets(std::slice::from_ref(&write), &[])
        };
    }

    pub fn destroy(self, context: &Context) {
        unsafe {
            context.device.destroy_descriptor_pool(self.pool, None);
            context
                .device
                .destroy_descriptor_set_layout(self.layout, None);
        }
    }
}
