use std::ffi::CStr;

use ash::{
    extensions::khr::{AccelerationStructure, RayTracingPipeline, Synchronization2},
    vk::{self, ApplicationInfo, DeviceCreateInfo, DeviceQueueCreateInfo, InstanceCreateInfo},
};

use crate::error::DeviceError;

/// A headless Vulkan 1.3 device with the ray tracing extensions loaded.
pub struct Context {
    _entry: ash::Entry,
    pub instance: ash::Instance,

    pub context_raytracing: ContextRaytracing,
    pub synchronisation2_loader: Synchronization2,

    pub physical_device: vk::PhysicalDevice,
    pub physical_device_name: String,
    pub device_limits: vk::PhysicalDeviceLimits,
    pub queue_family_index: u32,

    pub device: ash::Device,
    pub queue: vk::Queue,
}

pub struct ContextRaytracing {
    pub ray_tracing_pipeline: RayTracingPipeline,
    pub physical_device_ray_tracing_pipeline_properties_khr:
        vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,

    pub acceleration_structure: AccelerationStructure,
    pub physical_device_acceleration_structure_properties_khr:
        vk::PhysicalDeviceAccelerationStructurePropertiesKHR,
}

fn required_device_extensions() -> [&'static CStr; 5] {
    [
        Synchronization2::name(),
        AccelerationStructure::name(),
        RayTracingPipeline::name(),
        ash::extensions::khr::DeferredHostOperations::name(),
        ash::extensions::khr::BufferDeviceAddress::name(),
    ]
}

impl Context {
    pub fn new() -> Result<Self, DeviceError> {
        let entry = unsafe { ash::Entry::load() }?;

        let instance = {
            let app_info = ApplicationInfo::builder().api_version(vk::API_VERSION_1_3);
            let create_info = InstanceCreateInfo::builder().application_info(&app_info);
            unsafe { entry.create_instance(&create_info, None) }?
        };

        let (physical_device, queue_family_index) = match find_physical_device(&instance) {
            Ok(Some(found)) => found,
            Ok(None) => {
                unsafe { instance.destroy_instance(None) };
                return Err(DeviceError::Unsupported(
                    "no physical device exposes the ray tracing pipeline extensions".into(),
                ));
            }
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                return Err(err);
            }
        };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let physical_device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let device = match create_logical_device(&instance, physical_device, queue_family_index)
        {
            Ok(device) => device,
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                return Err(err);
            }
        };

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let synchronisation2_loader = Synchronization2::new(&instance, &device);

        let ray_tracing_pipeline = RayTracingPipeline::new(&instance, &device);
        let physical_device_ray_tracing_pipeline_properties_khr =
            unsafe { RayTracingPipeline::get_properties(&instance, physical_device) };

        let acceleration_structure = AccelerationStructure::new(&instance, &device);
        let physical_device_acceleration_structure_properties_khr =
            unsafe { AccelerationStructure::get_properties(&instance, physical_device) };

        let context_raytracing = ContextRaytracing {
            ray_tracing_pipeline,
            physical_device_ray_tracing_pipeline_properties_khr,
            acceleration_structure,
            physical_device_acceleration_structure_properties_khr,
        };

        log::info!("Using {} for hardware ray tracing", physical_device_name);

        Ok(Self {
            _entry: entry,
            instance,

            context_raytracing,
            synchronisation2_loader,

            physical_device,
            physical_device_name,
            device_limits: properties.limits,
            queue_family_index,

            device,
            queue,
        })
    }

    pub fn pipeline_properties(&self) -> &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR {
        &self
            .context_raytracing
            .physical_device_ray_tracing_pipeline_properties_khr
    }

    pub fn acceleration_structure_properties(
        &self,
    ) -> &vk::PhysicalDeviceAccelerationStructurePropertiesKHR {
        &self
            .context_raytracing
            .physical_device_acceleration_structure_properties_khr
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe { self.device.destroy_device(None) };

        unsafe { self.instance.destroy_instance(None) };
    }
}

fn find_physical_device(
    instance: &ash::Instance,
) -> Result<Option<(vk::PhysicalDevice, u32)>, DeviceError> {
    let physical_devices = unsafe { instance.enumerate_physical_devices() }?;

    let mut candidates = Vec::new();
    for pd in physical_devices {
        let extension_properties = unsafe { instance.enumerate_device_extension_properties(pd) }?;
        let supported = |required: &CStr| {
            extension_properties
                .iter()
                .any(|property| unsafe { CStr::from_ptr(property.extension_name.as_ptr()) } == required)
        };
        if !required_device_extensions().into_iter().all(supported) {
            continue;
        }

        let queue_family = unsafe { instance.get_physical_device_queue_family_properties(pd) }
            .iter()
            .position(|info| info.queue_flags.contains(vk::QueueFlags::COMPUTE));
        if let Some(index) = queue_family {
            candidates.push((pd, index as u32));
        }
    }

    Ok(candidates.into_iter().min_by_key(|(pd, _)| {
        let device_type = unsafe { instance.get_physical_device_properties(*pd) }.device_type;

        match device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 0,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
            vk::PhysicalDeviceType::CPU => 3,
            vk::PhysicalDeviceType::OTHER => 4,
            _ => 5,
        }
    }))
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
) -> Result<ash::Device, DeviceError> {
    let device_extensions = required_device_extensions().map(CStr::as_ptr);

    let queue_priorities = [1.0];
    let queue_create_info = DeviceQueueCreateInfo::builder()
        .queue_family_index(queue_family_index)
        .queue_priorities(&queue_priorities);

    let mut physical_device_vulkan12_features = vk::PhysicalDeviceVulkan12Features {
        buffer_device_address: vk::TRUE,
        timeline_semaphore: vk::TRUE,
        runtime_descriptor_array: vk::TRUE,
        descriptor_binding_partially_bound: vk::TRUE,
        descriptor_binding_storage_buffer_update_after_bind: vk::TRUE,
        shader_storage_buffer_array_non_uniform_indexing: vk::TRUE,
        ..vk::PhysicalDeviceVulkan12Features::default()
    };

    let mut physical_device_vulkan13_features = vk::PhysicalDeviceVulkan13Features {
        synchronization2: vk::TRUE,
        ..vk::PhysicalDeviceVulkan13Features::default()
    };

    let mut enabled_ray_tracing_pipeline_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR {
            ray_tracing_pipeline: vk::TRUE,
            ..vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default()
        };

    let mut enabled_acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR {
            acceleration_structure: vk::TRUE,
            ..vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
        };

    let create_info = DeviceCreateInfo::builder()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&device_extensions)
        .push_next(&mut physical_device_vulkan12_features)
        .push_next(&mut physical_device_vulkan13_features)
        .push_next(&mut enabled_ray_tracing_pipeline_features)
        .push_next(&mut enabled_acceleration_structure_features);

    Ok(unsafe { instance.create_device(physical_device, &create_info, None) }?)
}
