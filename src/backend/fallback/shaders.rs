//! The emulated ray tracing programs: ray generation, miss and closest hit.
//!
//! Records are fetched from the shader tables exactly the way a device would, so a
//! mis-built table shows up here as a lost device instead of a wrong image.

use bytemuck::pod_read_unaligned;
use crevice::std140::AsStd140;
use ultraviolet::{Vec3, Vec4};

use crate::backend::{
    DispatchRaysDesc, GpuDescriptorHandle, GpuVirtualAddress, ResourceId, ResourceState,
    ShaderIdentifier, TableRegion, SHADER_IDENTIFIER_SIZE,
};
use crate::error::DeviceError;
use crate::render::shader_types::{
    self, GeometryAttributes, GlobalRootArguments, HitGroupRecordData, LightData,
    LIGHT_KIND_POINT,
};
use crate::scene::Vertex;

use super::bvh::{Ray, TriangleHit};
use super::memory::EmulatedMemory;
use super::{BottomLevel, BuiltStructure, FallbackPipeline, ResolvedInstance, ShaderRole};

const AMBIENT: f32 = 0.1;
const T_MIN: f32 = 1e-3;
/// Rays are traced with every instance mask bit set.
const RAY_MASK: u8 = 0xFF;

/// Pixels produced by one dispatch, to be written into `resource` at `offset`.
pub(super) struct DispatchOutput {
    pub resource: ResourceId,
    pub offset: u64,
    pub pixels: Vec<u32>,
}

struct InstanceHit<'a> {
    instance: &'a ResolvedInstance,
    blas: &'a BottomLevel,
    hit: TriangleHit,
}

struct Frame<'a> {
    memory: &'a EmulatedMemory,
    pipeline: &'a FallbackPipeline,
    hit_groups: TableRegion,
    instances: Vec<(&'a ResolvedInstance, &'a BottomLevel)>,
    lights: Vec<LightData>,
    environment: Vec3,
}

fn read_std140<T: AsStd140>(
    memory: &EmulatedMemory,
    address: GpuVirtualAddress,
) -> Result<T, DeviceError> {
    let size = std::mem::size_of::<T::Output>() as u64;
    shader_types::read_std140(memory.read(address, size)?).ok_or(DeviceError::InvalidAddress(address))
}

fn read_identifier(
    memory: &EmulatedMemory,
    address: GpuVirtualAddress,
) -> Result<ShaderIdentifier, DeviceError> {
    let bytes = memory.read(address, SHADER_IDENTIFIER_SIZE as u64)?;
    Ok(pod_read_unaligned(bytes))
}

fn expect_role(
    pipeline: &FallbackPipeline,
    identifier: &ShaderIdentifier,
    role: ShaderRole,
) -> Result<(), DeviceError> {
    match pipeline.roles.get(identifier) {
        Some(found) if *found == role => Ok(()),
        Some(found) => Err(DeviceError::Validation(format!(
            "shader record holds a {:?} identifier where a {:?} was expected",
            found, role
        ))),
        None => Err(DeviceError::Validation(format!(
            "shader record identifier does not belong to pipeline `{}`",
            pipeline.label
        ))),
    }
}

pub(super) fn dispatch_rays(
    memory: &EmulatedMemory,
    pipeline: &FallbackPipeline,
    desc: &DispatchRaysDesc,
) -> Result<DispatchOutput, DeviceError> {
    let arguments_size = std::mem::size_of::<GlobalRootArguments>();
    let arguments: GlobalRootArguments = desc
        .root_arguments
        .get(..arguments_size)
        .map(pod_read_unaligned)
        .ok_or_else(|| DeviceError::Validation("root arguments are too short".into()))?;

    let ray_generation = read_identifier(memory, desc.ray_generation.start)?;
    expect_role(pipeline, &ray_generation, ShaderRole::RayGeneration)?;
    let miss = read_identifier(memory, desc.miss.start)?;
    expect_role(pipeline, &miss, ShaderRole::Miss)?;

    let camera: shader_types::Camera = read_std140(memory, arguments.camera_constants)?;
    let scene: shader_types::Scene = read_std140(memory, arguments.scene_constants)?;

    let lights: Vec<LightData> = if arguments.lights != 0 && scene.light_count > 0 {
        let size = std::mem::size_of::<LightData>() as u64;
        memory
            .read(arguments.lights, size * scene.light_count as u64)?
            .chunks_exact(size as usize)
            .map(pod_read_unaligned)
            .collect()
    } else {
        Vec::new()
    };

    let (tlas, _) = memory.resolve_wrapped(arguments.scene)?;
    let instances = match &memory.buffer(tlas)?.structure {
        Some(BuiltStructure::Top(top)) => top
            .instances
            .iter()
            .map(|instance| match &memory.buffer(instance.blas)?.structure {
                Some(BuiltStructure::Bottom(blas)) => Ok((instance, blas)),
                _ => Err(DeviceError::Validation(format!(
                    "instance {} lost its bottom level structure",
                    instance.desc.instance_id()
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => {
            return Err(DeviceError::Validation(
                "scene pointer does not reference a built top level structure".into(),
            ))
        }
    };

    let output_view = memory.view_for_handle(GpuDescriptorHandle(arguments.output))?;
    let output_buffer = memory.buffer(output_view.resource)?;
    if output_buffer.state != ResourceState::UnorderedAccess {
        return Err(DeviceError::Validation(format!(
            "output `{}` is not in the unordered access state",
            output_buffer.label
        )));
    }
    let pixel_count = desc.width as u64 * desc.height as u64;
    if pixel_count * 4 > output_view.size {
        return Err(DeviceError::Validation(format!(
            "output `{}` holds {} bytes, dispatch writes {}",
            output_buffer.label,
            output_view.size,
            pixel_count * 4
        )));
    }

    let frame = Frame {
        memory,
        pipeline,
        hit_groups: desc.hit_group,
        instances,
        lights,
        environment: scene.environment_color,
    };

    let origin = camera.view_inv * Vec4::new(0.0, 0.0, 0.0, 1.0);
    let mut pixels = Vec::with_capacity(pixel_count as usize);
    for y in 0..desc.height {
        for x in 0..desc.width {
            // Row 0 is the top of the image.
            let ndc_x = (x as f32 + 0.5) / desc.width as f32 * 2.0 - 1.0;
            let ndc_y = (y as f32 + 0.5) / desc.height as f32 * 2.0 - 1.0;
            let target = camera.proj_inv * Vec4::new(ndc_x, ndc_y, 0.5, 1.0);
            let direction = (target.xyz() / target.w).normalized();
            let direction = (camera.view_inv * Vec4::new(direction.x, direction.y, direction.z, 0.0))
                .xyz()
                .normalized();
            let ray = Ray {
                origin: origin.xyz(),
                direction,
            };
            let color = frame.trace_ray(&ray, T_MIN, camera.z_far)?;
            pixels.push(pack_rgba8(color));
        }
    }

    Ok(DispatchOutput {
        resource: output_view.resource,
        offset: output_view.offset,
        pixels,
    })
}

impl<'a> Frame<'a> {
    fn trace_ray(&self, ray: &Ray, t_min: f32, t_max: f32) -> Result<Vec3, DeviceError> {
        match self.closest_instance_hit(ray, t_min, t_max) {
            Some(hit) => self.closest_hit(ray, &hit),
            None => Ok(self.environment),
        }
    }

    fn closest_instance_hit(&self, ray: &Ray, t_min: f32, t_max: f32) -> Option<InstanceHit<'a>> {
        let mut closest: Option<InstanceHit<'a>> = None;
        for &(instance, blas) in &self.instances {
            if instance.desc.mask() & RAY_MASK == 0 {
                continue;
            }
            let object_ray = Ray {
                origin: instance.world_to_object.transform_point3(ray.origin),
                direction: instance.world_to_object.transform_vec3(ray.direction),
            };
            let limit = closest.as_ref().map_or(t_max, |c| c.hit.t);
            if let Some(hit) = blas.bvh.intersect(&blas.triangles, &object_ray, t_min, limit) {
                closest = Some(InstanceHit {
                    instance,
                    blas,
                    hit,
                });
            }
        }
        closest
    }

    fn closest_hit(&self, ray: &Ray, hit: &InstanceHit) -> Result<Vec3, DeviceError> {
        let index = hit.instance.desc.hit_group_contribution() as u64;
        if index >= self.hit_groups.record_count() {
            return Err(DeviceError::Validation(format!(
                "hit group record {} is outside a table of {} records",
                index,
                self.hit_groups.record_count()
            )));
        }
        let record = self.hit_groups.start + index * self.hit_groups.stride;
        let identifier = read_identifier(self.memory, record)?;
        expect_role(self.pipeline, &identifier, ShaderRole::HitGroup)?;
        let local: HitGroupRecordData = pod_read_unaligned(self.memory.read(
            record + SHADER_IDENTIFIER_SIZE as u64,
            std::mem::size_of::<HitGroupRecordData>() as u64,
        )?);

        let table = self
            .memory
            .view_for_handle(GpuDescriptorHandle(local.descriptor_table))?;
        let attributes: GeometryAttributes = pod_read_unaligned(self.memory.read_range(
            table.resource,
            table.offset,
            std::mem::size_of::<GeometryAttributes>() as u64,
        )?);

        let normal = self.shading_normal(&attributes, hit)?;
        let normal = if normal.dot(ray.direction) > 0.0 {
            -normal
        } else {
            normal
        };
        let position = ray.origin + ray.direction * hit.hit.t;
        let diffuse = Vec3::new(
            attributes.diffuse[0],
            attributes.diffuse[1],
            attributes.diffuse[2],
        );

        if self.lights.is_empty() {
            return Ok(diffuse);
        }
        let mut radiance = Vec3::broadcast(AMBIENT);
        for light in &self.lights {
            let color = Vec3::from(light.color) * light.intensity;
            let (to_light, attenuation) = if light.kind == LIGHT_KIND_POINT {
                let offset = Vec3::from(light.vector) - position;
                let distance_squared = offset.mag_sq().max(1e-6);
                (offset.normalized(), 1.0 / distance_squared)
            } else {
                (-Vec3::from(light.vector).normalized(), 1.0)
            };
            radiance += color * normal.dot(to_light).max(0.0) * attenuation;
        }
        Ok(diffuse * radiance)
    }

    /// Interpolated vertex normal, or the face normal when the mesh has none.
    fn shading_normal(
        &self,
        attributes: &GeometryAttributes,
        hit: &InstanceHit,
    ) -> Result<Vec3, DeviceError> {
        let primitive = hit.hit.primitive;
        let mut indices = [primitive * 3, primitive * 3 + 1, primitive * 3 + 2];
        if attributes.index_count > 0 {
            let bytes = self
                .memory
                .read_wrapped(attributes.indices, primitive as u64 * 12, 12)?;
            for (index, chunk) in indices.iter_mut().zip(bytes.chunks_exact(4)) {
                *index = pod_read_unaligned(chunk);
            }
        }

        let vertex_size = std::mem::size_of::<Vertex>() as u64;
        let [u, v] = hit.hit.barycentrics;
        let weights = [1.0 - u - v, u, v];
        let mut normal = Vec3::zero();
        for (index, weight) in indices.iter().zip(weights) {
            let vertex: Vertex = pod_read_unaligned(self.memory.read_wrapped(
                attributes.vertices,
                *index as u64 * vertex_size,
                vertex_size,
            )?);
            normal += Vec3::from(vertex.normal) * weight;
        }

        let object_normal = if normal.mag_sq() > 1e-12 {
            normal
        } else {
            hit.blas.triangles[primitive as usize].normal()
        };
        let world_normal = hit.instance.object_to_world.transform_vec3(object_normal);
        Ok(world_normal.normalized())
    }
}

fn pack_rgba8(color: Vec3) -> u32 {
    let channel = |value: f32| (value.clamp(0.0, 1.0) * 255.0).round() as u32;
    channel(color.x) | channel(color.y) << 8 | channel(color.z) << 16 | 0xFF << 24
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_channels_in_rgba_order() {
        let pixel = pack_rgba8(Vec3::new(1.0, 0.0, 0.5));
        assert_eq!(pixel.to_le_bytes(), [255, 0, 128, 255]);
    }

    #[test]
    fn out_of_range_colors_are_clamped() {
        let pixel = pack_rgba8(Vec3::new(2.0, -1.0, 0.0));
        assert_eq!(pixel.to_le_bytes(), [255, 0, 0, 255]);
    }
}
