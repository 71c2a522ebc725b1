use std::collections::HashMap;

use ash::vk;

use crate::backend::{Command, DispatchRaysDesc, PipelineId, ResourceId, TableRegion};
use crate::error::DeviceError;

use super::{
    acceleration_structure::BuildGeometry, buffer::Buffer, context::Context,
    descriptor_set::DescriptorHeap, pipeline::RayTracingPipeline, pipeline::ROOT_ARGUMENT_STAGES,
};

const RAY_TRACING_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR.as_raw()
        | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR.as_raw(),
);

const RAY_TRACING_WRITES: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw(),
);

const RAY_TRACING_READS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR.as_raw()
        | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_READ.as_raw(),
);

/// Translates recorded [`Command`]s into Vulkan commands on one command buffer.
pub struct CommandRecorder<'a> {
    pub context: &'a Context,
    pub buffers: &'a HashMap<ResourceId, Buffer>,
    pub pipelines: &'a HashMap<PipelineId, RayTracingPipeline>,
    pub heap: Option<&'a DescriptorHeap>,
    pub command_buffer: vk::CommandBuffer,
    current_pipeline: Option<&'a RayTracingPipeline>,
}

impl<'a> CommandRecorder<'a> {
    pub fn new(
        context: &'a Context,
        buffers: &'a HashMap<ResourceId, Buffer>,
        pipelines: &'a HashMap<PipelineId, RayTracingPipeline>,
        heap: Option<&'a DescriptorHeap>,
        command_buffer: vk::CommandBuffer,
    ) -> Self {
        Self {
            context,
            buffers,
            pipelines,
            heap,
            command_buffer,
            current_pipeline: None,
        }
    }

    fn buffer(&self, resource: ResourceId) -> Result<&'a Buffer, DeviceError> {
        self.buffers
            .get(&resource)
            .ok_or(DeviceError::UnknownResource(resource))
    }

    pub fn record(&mut self, command: &Command) -> Result<(), DeviceError> {
        match command {
            Command::BuildAccelerationStructure {
                inputs,
                dest,
                scratch,
            } => {
                let dest = self.buffer(*dest)?;
                let scratch = self.buffer(*scratch)?;
                let structure = dest.acceleration_structure.ok_or_else(|| {
                    DeviceError::Validation(format!(
                        "`{}` is not in the acceleration structure state",
                        dest.label
                    ))
                })?;

                let geometry = BuildGeometry::new(inputs);
                let build_info = geometry.build_info(structure, scratch.device_address);
                unsafe {
                    self.context
                        .context_raytracing
                        .acceleration_structure
                        .cmd_build_acceleration_structures(
                            self.command_buffer,
                            std::slice::from_ref(&build_info),
                            &[geometry.ranges.as_slice()],
                        )
                };
            }
            Command::UavBarrier { resource } => self.uav_barrier(*resource)?,
            Command::SetPipeline(id) => {
                let pipeline = self.pipelines.get(id).ok_or_else(|| {
                    DeviceError::Validation(format!("unknown pipeline {:?}", id))
                })?;
                let heap = self.heap.ok_or_else(|| {
                    DeviceError::Validation("no descriptor heap has been created".into())
                })?;
                unsafe {
                    self.context.device.cmd_bind_pipeline(
                        self.command_buffer,
                        vk::PipelineBindPoint::RAY_TRACING_KHR,
                        pipeline.inner,
                    );
                    self.context.device.cmd_bind_descriptor_sets(
                        self.command_buffer,
                        vk::PipelineBindPoint::RAY_TRACING_KHR,
                        pipeline.layout,
                        0,
                        std::slice::from_ref(&heap.set),
                        &[],
                    );
                }
                self.current_pipeline = Some(pipeline);
            }
            Command::DispatchRays(desc) => self.dispatch_rays(desc)?,
        }
        Ok(())
    }

    fn uav_barrier(&self, resource: Option<ResourceId>) -> Result<(), DeviceError> {
        let memory_barriers: Vec<_>;
        let buffer_memory_barriers: Vec<_>;
        match resource {
            Some(resource) => {
                let buffer = self.buffer(resource)?;
                memory_barriers = Vec::new();
                buffer_memory_barriers = vec![vk::BufferMemoryBarrier2::builder()
                    .src_stage_mask(RAY_TRACING_STAGES)
                    .src_access_mask(RAY_TRACING_WRITES)
                    .dst_stage_mask(RAY_TRACING_STAGES)
                    .dst_access_mask(RAY_TRACING_READS)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(buffer.inner)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .build()];
            }
            None => {
                memory_barriers = vec![vk::MemoryBarrier2::builder()
                    .src_stage_mask(RAY_TRACING_STAGES)
                    .src_access_mask(RAY_TRACING_WRITES)
                    .dst_stage_mask(RAY_TRACING_STAGES)
                    .dst_access_mask(RAY_TRACING_READS)
                    .build()];
                buffer_memory_barriers = Vec::new();
            }
        }

        unsafe {
            self.context.synchronisation2_loader.cmd_pipeline_barrier2(
                self.command_buffer,
                &vk::DependencyInfo::builder()
                    .memory_barriers(&memory_barriers)
                    .buffer_memory_barriers(&buffer_memory_barriers),
            );
        };
        Ok(())
    }

    fn dispatch_rays(&self, desc: &DispatchRaysDesc) -> Result<(), DeviceError> {
        let pipeline = self.current_pipeline.ok_or_else(|| {
            DeviceError::Validation("DispatchRays without a pipeline set".into())
        })?;
        if desc.root_arguments.len() != pipeline.push_constant_size as usize {
            return Err(DeviceError::Validation(format!(
                "pipeline `{}` expects {} bytes of root arguments, got {}",
                pipeline.label,
                pipeline.push_constant_size,
                desc.root_arguments.len()
            )));
        }

        unsafe {
            if !desc.root_arguments.is_empty() {
                self.context.device.cmd_push_constants(
                    self.command_buffer,
                    pipeline.layout,
                    ROOT_ARGUMENT_STAGES,
                    0,
                    &desc.root_arguments,
                );
            }
            self.context
                .context_raytracing
                .ray_tracing_pipeline
                .cmd_trace_rays(
                    self.command_buffer,
                    &strided_region(&desc.ray_generation),
                    &strided_region(&desc.miss),
                    &strided_region(&desc.hit_group),
                    &vk::StridedDeviceAddressRegionKHR::default(),
                    desc.width,
                    desc.height,
                    1,
                );
        }
        Ok(())
    }

    /// Makes every earlier device write visible to a following copy.
    pub fn transfer_barrier(&self) {
        let barrier = vk::MemoryBarrier2::builder()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::TRANSFER)
            .dst_access_mask(vk::AccessFlags2::TRANSFER_READ)
            .build();
        unsafe {
            self.context.synchronisation2_loader.cmd_pipeline_barrier2(
                self.command_buffer,
                &vk::DependencyInfo::builder().memory_barriers(std::slice::from_ref(&barrier)),
            );
        };
    }
}

fn strided_region(region: &TableRegion) -> vk::StridedDeviceAddressRegionKHR {
    vk::StridedDeviceAddressRegionKHR {
        device_address: region.start,
        stride: region.stride,
        size: region.size,
    }
}
