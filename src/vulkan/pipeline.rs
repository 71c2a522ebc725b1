use ash::vk;

use crate::backend::{PipelineDesc, ShaderIdentifier, SHADER_IDENTIFIER_SIZE};
use crate::error::DeviceError;

use super::{context::Context, shader_create_info::ShaderLibrary};

/// Stages that see the global root arguments, pushed as constants.
pub const ROOT_ARGUMENT_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
        | vk::ShaderStageFlags::MISS_KHR.as_raw()
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::ANY_HIT_KHR.as_raw(),
);

pub struct RayTracingPipeline {
    pub inner: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub label: String,
    pub push_constant_size: u32,
    pub identifiers: Vec<ShaderIdentifier>,
}

impl RayTracingPipeline {
    pub fn new(
        context: &Context,
        heap_layout: vk::DescriptorSetLayout,
        desc: &PipelineDesc,
    ) -> Result<Self, DeviceError> {
        let properties = context.pipeline_properties();
        if properties.shader_group_handle_size as usize != SHADER_IDENTIFIER_SIZE {
            return Err(DeviceError::Unsupported(format!(
                "shader group handles are {} bytes",
                properties.shader_group_handle_size
            )));
        }
        if desc.max_recursion_depth == 0
            || desc.max_recursion_depth > properties.max_ray_recursion_depth
        {
            return Err(DeviceError::Validation(format!(
                "recursion depth {} is outside 1..={}",
                desc.max_recursion_depth, properties.max_ray_recursion_depth
            )));
        }

        let mut library = ShaderLibrary::new(context, &desc.library)?;
        let mut groups = Vec::new();

        let general = |stage: u32| {
            vk::RayTracingShaderGroupCreateInfoKHR::builder()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(stage)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
                .build()
        };

        let ray_generation =
            library.add_entry(&desc.ray_generation, vk::ShaderStageFlags::RAYGEN_KHR)?;
        groups.push(general(ray_generation));

        for miss in &desc.miss {
            let stage = library.add_entry(miss, vk::ShaderStageFlags::MISS_KHR)?;
            groups.push(general(stage));
        }

        for hit_group in &desc.hit_groups {
            let closest_hit =
                library.add_entry(&hit_group.closest_hit, vk::ShaderStageFlags::CLOSEST_HIT_KHR)?;
            let any_hit = match &hit_group.any_hit {
                Some(name) => library.add_entry(name, vk::ShaderStageFlags::ANY_HIT_KHR)?,
                None => vk::SHADER_UNUSED_KHR,
            };
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::builder()
                    .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(closest_hit)
                    .any_hit_shader(any_hit)
                    .intersection_shader(vk::SHADER_UNUSED_KHR)
                    .build(),
            );
        }

        let push_constant_size = desc.root_signature.global_arguments_size;
        let layout = {
            let push_constant_range = vk::PushConstantRange::builder()
                .stage_flags(ROOT_ARGUMENT_STAGES)
                .offset(0)
                .size(push_constant_size);
            let mut create_info = vk::PipelineLayoutCreateInfo::builder()
                .set_layouts(std::slice::from_ref(&heap_layout));
            if push_constant_size > 0 {
                create_info =
                    create_info.push_constant_ranges(std::slice::from_ref(&push_constant_range));
            }
            unsafe { context.device.create_pipeline_layout(&create_info, None) }?
        };

        let stages = library.stages();
        let create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
            .layout(layout)
            .build();

        let pipeline = match unsafe {
            context
                .context_raytracing
                .ray_tracing_pipeline
                .create_ray_tracing_pipelines(
                    vk::DeferredOperationKHR::null(),
                    vk::PipelineCache::null(),
                    std::slice::from_ref(&create_info),
                    None,
                )
        } {
            Ok(pipelines) => pipelines[0],
            Err(err) => {
                unsafe { context.device.destroy_pipeline_layout(layout, None) };
                return Err(err.into());
            }
        };

        let handles = match unsafe {
            context
                .context_raytracing
                .ray_tracing_pipeline
                .get_ray_tracing_shader_group_handles(
                    pipeline,
                    0,
                    groups.len() as u32,
                    groups.len() * SHADER_IDENTIFIER_SIZE,
                )
        } {
            Ok(handles) => handles,
            Err(err) => {
                unsafe {
                    context.device.destroy_pipeline(pipeline, None);
                    context.device.destroy_pipeline_layout(layout, None);
                }
                return Err(err.into());
            }
        };

        let identifiers = handles
            .chunks_exact(SHADER_IDENTIFIER_SIZE)
            .map(bytemuck::pod_read_unaligned)
            .collect();

        Ok(Self {
            inner: pipeline,
            layout,
            label: desc.label.clone(),
            push_constant_size,
            identifiers,
        })
    }

    pub fn destroy(self, context: &Context) {
        unsafe {
            context.device.destroy_pipeline(self.inner, None);
            context.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}
