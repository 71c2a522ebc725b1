//! Hardware ray tracing on top of the Vulkan ray tracing pipeline extensions.

pub mod acceleration_structure;
pub mod buffer;
pub mod command_buffer;
pub mod command_pool;
pub mod context;
pub mod descriptor_set;
pub mod pipeline;
pub mod shader_create_info;

use std::collections::HashMap;
use std::mem::ManuallyDrop;

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};

use crate::backend::{
    AccelerationStructureInputs, BackendKind, BackendLimits, BufferDesc, BufferView, Command,
    CommandAllocatorId, CpuDescriptorHandle, CreatedPipeline, DescriptorHeapDesc,
    GpuDescriptorHandle, GpuVirtualAddress, PipelineDesc, PipelineId, PrebuildInfo,
    RaytracingBackend, ResourceId, WrappedGpuPointer,
};
use crate::error::DeviceError;

use self::{
    buffer::Buffer, command_buffer::CommandRecorder, command_pool::CommandPool,
    context::Context, descriptor_set::DescriptorHeap, pipeline::RayTracingPipeline,
};

fn device_error(err: vk::Result) -> DeviceError {
    match err {
        vk::Result::ERROR_DEVICE_LOST => DeviceError::DeviceLost(err.to_string()),
        err => DeviceError::Vulkan(err),
    }
}

/// Buffers live in gpu-allocator memory, the descriptor heap is a bindless storage buffer
/// array and the queue fence is a timeline semaphore.
pub struct HardwareBackend {
    allocator: ManuallyDrop<Allocator>,
    buffers: HashMap<ResourceId, Buffer>,
    heap: Option<DescriptorHeap>,
    command_pools: HashMap<CommandAllocatorId, CommandPool>,
    pipelines: HashMap<PipelineId, RayTracingPipeline>,
    readback_pool: CommandPool,
    timeline: vk::Semaphore,
    last_submitted: u64,
    next_id: u64,
    context: Context,
}

impl HardwareBackend {
    pub fn new() -> Result<Self, DeviceError> {
        let context = Context::new()?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: context.instance.clone(),
            device: context.device.clone(),
            physical_device: context.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;

        let timeline = {
            let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
                .semaphore_type(vk::SemaphoreType::TIMELINE)
                .initial_value(0);
            let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
            unsafe { context.device.create_semaphore(&create_info, None) }?
        };

        let readback_pool = match CommandPool::new(&context) {
            Ok(pool) => pool,
            Err(err) => {
                unsafe { context.device.destroy_semaphore(timeline, None) };
                return Err(err);
            }
        };

        Ok(Self {
            allocator: ManuallyDrop::new(allocator),
            buffers: HashMap::new(),
            heap: None,
            command_pools: HashMap::new(),
            pipelines: HashMap::new(),
            readback_pool,
            timeline,
            last_submitted: 0,
            next_id: 1,
            context,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.context.physical_device_name
    }

    fn next_object_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer(&self, resource: ResourceId) -> Result<&Buffer, DeviceError> {
        self.buffers
            .get(&resource)
            .ok_or(DeviceError::UnknownResource(resource))
    }

    fn submit_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        signal: Option<u64>,
    ) -> Result<(), DeviceError> {
        unsafe { self.context.device.end_command_buffer(command_buffer) }?;

        let command_buffer_info =
            vk::CommandBufferSubmitInfo::builder().command_buffer(command_buffer);
        let signal_infos: Vec<_> = signal
            .into_iter()
            .map(|value| {
                vk::SemaphoreSubmitInfo::builder()
                    .semaphore(self.timeline)
                    .value(value)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .build()
            })
            .collect();
        let submit_info = vk::SubmitInfo2::builder()
            .command_buffer_infos(std::slice::from_ref(&command_buffer_info))
            .signal_semaphore_infos(&signal_infos);

        unsafe {
            self.context.synchronisation2_loader.queue_submit2(
                self.context.queue,
                std::slice::from_ref(&submit_info),
                vk::Fence::null(),
            )
        }
        .map_err(device_error)
    }

    /// Copies a device local buffer into a host readable one and waits for the copy.
    fn read_device_local(
        &mut self,
        resource: ResourceId,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, DeviceError> {
        let source = self.buffer(resource)?.inner;
        let readback = Buffer::readback(&self.context, &mut self.allocator, len.max(1))?;
        let copied = self.copy_to_readback(source, &readback, offset, len);
        readback.destroy(&self.context, &mut self.allocator);
        copied
    }

    fn copy_to_readback(
        &self,
        source: vk::Buffer,
        readback: &Buffer,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, DeviceError> {
        let command_buffer = self.readback_pool.begin(&self.context)?;
        CommandRecorder::new(
            &self.context,
            &self.buffers,
            &self.pipelines,
            None,
            command_buffer,
        )
        .transfer_barrier();
        let region = vk::BufferCopy {
            src_offset: offset,
            dst_offset: 0,
            size: len,
        };
        unsafe {
            self.context.device.cmd_copy_buffer(
                command_buffer,
                source,
                readback.inner,
                std::slice::from_ref(&region),
            )
        };
        self.submit_command_buffer(command_buffer, None)?;
        unsafe { self.context.device.queue_wait_idle(self.context.queue) }
            .map_err(device_error)?;
        unsafe {
            self.context
                .device
                .reset_command_pool(self.readback_pool.inner, vk::CommandPoolResetFlags::empty())
        }?;

        readback
            .mapped_slice()
            .map(|bytes| bytes[..len as usize].to_vec())
            .ok_or_else(|| DeviceError::Validation("readback buffer is not mapped".into()))
    }
}

impl RaytracingBackend for HardwareBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Hardware
    }

    fn limits(&self) -> BackendLimits {
        let properties = self.context.pipeline_properties();
        BackendLimits {
            shader_identifier_size: properties.shader_group_handle_size,
            shader_record_alignment: properties.shader_group_handle_alignment,
            shader_table_alignment: properties.shader_group_base_alignment,
            max_shader_record_stride: properties.max_shader_group_stride,
            constant_buffer_alignment: (self
                .context
                .device_limits
                .min_uniform_buffer_offset_alignment as u32)
                .max(256),
        }
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<ResourceId, DeviceError> {
        let buffer = Buffer::new(&self.context, &mut self.allocator, desc)?;
        let id = ResourceId(self.next_object_id());
        log::trace!("Created buffer `{}` ({} bytes) as {:?}", desc.label, desc.size, id);
        self.buffers.insert(id, buffer);
        Ok(id)
    }

    fn destroy_buffer(&mut self, resource: ResourceId) {
        match self.buffers.remove(&resource) {
            Some(buffer) => buffer.destroy(&self.context, &mut self.allocator),
            None => log::warn!("Destroying unknown buffer {:?}", resource),
        }
    }

    fn write_buffer(
        &mut self,
        resource: ResourceId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        self.buffers
            .get_mut(&resource)
            .ok_or(DeviceError::UnknownResource(resource))?
            .write(offset, data)
    }

    fn read_buffer(
        &mut self,
        resource: ResourceId,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, DeviceError> {
        let buffer = self.buffer(resource)?;
        if offset + len > buffer.size {
            return Err(DeviceError::Validation(format!(
                "read of {} bytes at {} overflows `{}`",
                len, offset, buffer.label
            )));
        }
        if let Some(bytes) = buffer.mapped_slice() {
            return Ok(bytes[offset as usize..(offset + len) as usize].to_vec());
        }
        self.read_device_local(resource, offset, len)
    }

    fn gpu_virtual_address(&self, resource: ResourceId) -> Result<GpuVirtualAddress, DeviceError> {
        Ok(self.buffer(resource)?.shader_address(&self.context))
    }

    fn create_descriptor_heap(
        &mut self,
        capacity: u32,
    ) -> Result<DescriptorHeapDesc, DeviceError> {
        if self.heap.is_some() {
            return Err(DeviceError::Validation(
                "the descriptor heap was already created".into(),
            ));
        }
        if capacity == 0 {
            return Err(DeviceError::Validation(
                "descriptor heap capacity must be at least 1".into(),
            ));
        }
        self.heap = Some(DescriptorHeap::new(&self.context, capacity)?);
        Ok(DescriptorHeapDesc {
            capacity,
            cpu_start: CpuDescriptorHandle(0),
            gpu_start: GpuDescriptorHandle(0),
            stride: 1,
        })
    }

    fn write_buffer_view(&mut self, index: u32, view: &BufferView) -> Result<(), DeviceError> {
        let heap = self
            .heap
            .as_ref()
            .ok_or_else(|| DeviceError::Validation("no descriptor heap has been created".into()))?;
        if index >= heap.capacity {
            return Err(DeviceError::Validation(format!(
                "descriptor slot {} is outside the heap",
                index
            )));
        }
        let buffer = self
            .buffers
            .get(&view.resource)
            .ok_or(DeviceError::UnknownResource(view.resource))?;
        if view.offset + view.size > buffer.size {
            return Err(DeviceError::Validation(format!(
                "view of {} bytes at {} overflows `{}`",
                view.size, view.offset, buffer.label
            )));
        }
        heap.write_storage_buffer(&self.context, index, buffer.inner, view.offset, view.size);
        Ok(())
    }

    fn wrap_pointer(
        &self,
        index: u32,
        resource: ResourceId,
    ) -> Result<WrappedGpuPointer, DeviceError> {
        let capacity = self.heap.as_ref().map_or(0, |heap| heap.capacity);
        if index >= capacity {
            return Err(DeviceError::Validation(format!(
                "descriptor slot {} is outside the heap",
                index
            )));
        }
        Ok(WrappedGpuPointer(self.gpu_virtual_address(resource)?))
    }

    fn prebuild_info(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> Result<PrebuildInfo, DeviceError> {
        Ok(acceleration_structure::prebuild_info(&self.context, inputs))
    }

    fn create_command_allocator(&mut self) -> Result<CommandAllocatorId, DeviceError> {
        let pool = CommandPool::new(&self.context)?;
        let id = CommandAllocatorId(self.next_object_id());
        self.command_pools.insert(id, pool);
        Ok(id)
    }

    fn destroy_command_allocator(&mut self, allocator: CommandAllocatorId) {
        if let Some(pool) = self.command_pools.remove(&allocator) {
            pool.destroy(&self.context);
        }
    }

    fn submit(
        &mut self,
        allocator: CommandAllocatorId,
        commands: &[Command],
        signal: u64,
    ) -> Result<(), DeviceError> {
        let pool = self.command_pools.get(&allocator).ok_or_else(|| {
            DeviceError::Validation(format!("unknown command allocator {:?}", allocator))
        })?;
        if signal <= self.last_submitted {
            return Err(DeviceError::Validation(format!(
                "fence value {} does not advance past {}",
                signal, self.last_submitted
            )));
        }

        let command_buffer = pool.begin(&self.context)?;
        let mut recorder = CommandRecorder::new(
            &self.context,
            &self.buffers,
            &self.pipelines,
            self.heap.as_ref(),
            command_buffer,
        );
        for command in commands {
            recorder.record(command)?;
        }

        self.submit_command_buffer(command_buffer, Some(signal))?;
        self.last_submitted = signal;
        log::trace!("Submitted {} commands signaling {}", commands.len(), signal);
        Ok(())
    }

    fn completed_fence_value(&mut self) -> Result<u64, DeviceError> {
        unsafe { self.context.device.get_semaphore_counter_value(self.timeline) }
            .map_err(device_error)
    }

    fn wait_for_fence(&mut self, value: u64) -> Result<(), DeviceError> {
        if value > self.last_submitted {
            return Err(DeviceError::Validation(format!(
                "waiting for fence value {} that was never signaled",
                value
            )));
        }
        let semaphores = [self.timeline];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.context.device.wait_semaphores(&wait_info, u64::MAX) }.map_err(device_error)
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<CreatedPipeline, DeviceError> {
        let heap_layout = self
            .heap
            .as_ref()
            .ok_or_else(|| {
                DeviceError::Validation("create the descriptor heap before any pipeline".into())
            })?
            .layout;
        let max_push_constants = self.context.device_limits.max_push_constants_size;
        if desc.root_signature.global_arguments_size > max_push_constants {
            return Err(DeviceError::Unsupported(format!(
                "{} bytes of root arguments exceed the {} byte push constant limit",
                desc.root_signature.global_arguments_size, max_push_constants
            )));
        }

        let pipeline = RayTracingPipeline::new(&self.context, heap_layout, desc)?;
        let identifiers = desc
            .export_names()
            .map(str::to_owned)
            .zip(pipeline.identifiers.iter().copied())
            .collect();

        let id = PipelineId(self.next_object_id());
        log::debug!(
            "Created ray tracing pipeline `{}` with {} shader groups",
            desc.label,
            pipeline.identifiers.len()
        );
        self.pipelines.insert(id, pipeline);
        Ok(CreatedPipeline { id, identifiers })
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        if let Some(pipeline) = self.pipelines.remove(&pipeline) {
            pipeline.destroy(&self.context);
        }
    }
}

impl Drop for HardwareBackend {
    fn drop(&mut self) {
        if let Err(err) = unsafe { self.context.device.device_wait_idle() } {
            log::error!("Could not wait for the device to idle: {}", err);
        }

        for (_, pipeline) in self.pipelines.drain() {
            pipeline.destroy(&self.context);
        }
        for (_, pool) in self.command_pools.drain() {
            pool.destroy(&self.context);
        }
        for (_, buffer) in self.buffers.drain() {
            buffer.destroy(&self.context, &mut self.allocator);
        }
        if let Some(heap) = self.heap.take() {
            heap.destroy(&self.context);
        }
        unsafe {
            self.context
                .device
                .destroy_command_pool(self.readback_pool.inner, None);
            self.context.device.destroy_semaphore(self.timeline, None);
            ManuallyDrop::drop(&mut self.allocator);
        }
    }
}
