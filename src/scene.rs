mod geometry;
mod light;
mod material;
mod vertex;

pub use geometry::*;
pub use light::*;
pub use material::*;
pub use vertex::*;

use std::sync::Arc;

use crate::backend::{
    AccelerationStructureInputs, BufferDesc, HeapType, InstanceDesc, PipelineId, ResourceState,
    WrappedGpuPointer,
};
use crate::context::Context;
use crate::deferred::DeferredBuffer;
use crate::descriptor::{BufferDescriptor, DescriptorAllocator};
use crate::error::{DeviceResultExt, Result};
use crate::pipeline::PipelineState;
use crate::render::shader_types::{self, LightData};
use crate::session::RenderSession;
use crate::shader_table::{ShaderTable, ShaderTableBuilder};

/// Only instance mask bit the renderer traces against.
const INSTANCE_MASK: u8 = 1;

struct TopLevel {
    structure: BufferDescriptor,
    /// The build reads the instances from here, keep it until the structure is replaced.
    instances: DeferredBuffer,
    instance_count: u32,
}

struct HitGroupTable {
    table: ShaderTable,
    pipeline: PipelineId,
    hit_group: String,
    membership_version: u64,
}

/// The geometry and lights being rendered, plus the TLAS over them.
///
/// The TLAS is rebuilt lazily: membership changes only mark the scene dirty and the next
/// call to [`Scene::top_level_acceleration_structure`] does the build.
pub struct Scene {
    context: Arc<Context>,
    descriptors: Arc<DescriptorAllocator>,

    geometries: Vec<Arc<Geometry>>,
    lights: Vec<Light>,
    environment: EnvironmentMap,

    dirty: bool,
    membership_version: u64,
    rebuild_count: u64,
    tlas: Option<TopLevel>,
    hit_table: Option<HitGroupTable>,
}

impl Scene {
    pub fn new(session: &RenderSession) -> Self {
        Self {
            context: session.context().clone(),
            descriptors: session.descriptors().clone(),
            geometries: Vec::new(),
            lights: Vec::new(),
            environment: EnvironmentMap::default(),
            dirty: true,
            membership_version: 0,
            rebuild_count: 0,
            tlas: None,
            hit_table: None,
        }
    }

    pub fn add_geometry(&mut self, geometry: Arc<Geometry>) {
        self.geometries.push(geometry);
        self.mark_dirty();
    }

    pub fn remove_geometry(&mut self, id: GeometryId) -> Option<Arc<Geometry>> {
        let position = self.geometries.iter().position(|g| g.id() == id)?;
        let removed = self.geometries.remove(position);
        self.mark_dirty();
        Some(removed)
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.membership_version += 1;
    }

    pub fn geometries(&self) -> &[Arc<Geometry>] {
        &self.geometries
    }

    pub fn geometry_count(&self) -> usize {
        self.geometries.len()
    }

    pub fn add_light(&mut self, light: Light) {
        self.lights.push(light);
    }

    pub fn lights(&self) -> &[Light] {
        &self.lights
    }

    pub fn set_environment_map(&mut self, environment: EnvironmentMap) {
        self.environment = environment;
    }

    pub fn environment(&self) -> &EnvironmentMap {
        &self.environment
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Number of TLAS builds so far.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuild_count
    }

    pub fn instance_count(&self) -> Option<u32> {
        self.tlas.as_ref().map(|tlas| tlas.instance_count)
    }

    /// The instance descriptions the current TLAS was built from.
    pub fn instance_buffer(&self) -> Option<&DeferredBuffer> {
        self.tlas.as_ref().map(|tlas| &tlas.instances)
    }

    /// One instance per geometry, in membership order, with an identity transform.
    pub fn instance_descs(&self) -> Vec<InstanceDesc> {
        self.geometries
            .iter()
            .enumerate()
            .map(|(index, geometry)| {
                InstanceDesc::new(
                    InstanceDesc::IDENTITY_TRANSFORM,
                    index as u32,
                    INSTANCE_MASK,
                    index as u32,
                    0,
                    geometry.blas_pointer(),
                )
            })
            .collect()
    }

    /// The TLAS matching the current membership, building it first if the scene is dirty.
    pub fn top_level_acceleration_structure(&mut self) -> Result<WrappedGpuPointer> {
        if !self.dirty {
            if let Some(tlas) = &self.tlas {
                return Ok(tlas.structure.wrapped_pointer());
            }
        }

        let instances = self.instance_descs();
        let instance_count = instances.len() as u32;
        let instance_buffer =
            self.context
                .upload_labeled("scene instances", bytemuck::cast_slice(&instances), false)?;
        let inputs = AccelerationStructureInputs::TopLevel {
            instance_count,
            instance_descs: instance_buffer.gpu_virtual_address(),
        };
        let prebuild = self
            .context
            .with_backend(|backend| backend.prebuild_info(&inputs))
            .during("GetRaytracingAccelerationStructurePrebuildInfo")?;

        let scratch = self.context.create_buffer(&BufferDesc {
            label: "TLAS scratch".into(),
            size: prebuild.scratch_size,
            heap: HeapType::Default,
            initial_state: ResourceState::UnorderedAccess,
        })?;
        let structure = self
            .descriptors
            .allocate_acceleration_structure_buffer(prebuild.result_size)?;

        let mut command_list = self.context.create_command_list_allocator_pair()?;
        command_list
            .build_acceleration_structure(inputs, structure.buffer(), &scratch)
            .uav_barrier(structure.buffer());
        let fence = self.context.execute_command_list(command_list.close())?;
        drop(scratch);

        let pointer = structure.wrapped_pointer();
        self.tlas = Some(TopLevel {
            structure,
            instances: instance_buffer,
            instance_count,
        });
        self.dirty = false;
        self.rebuild_count += 1;
        log::debug!(
            "Rebuilt TLAS over {} instances at fence {}",
            instance_count,
            fence
        );
        Ok(pointer)
    }

    /// One hit group record per geometry, in membership order. Rebuilt when membership or
    /// the pipeline changed since the last build.
    pub fn hit_group_table(
        &mut self,
        pipeline: &PipelineState,
        hit_group: &str,
    ) -> Result<&ShaderTable> {
        let current = match self.hit_table.take() {
            Some(table)
                if table.membership_version == self.membership_version
                    && table.pipeline == pipeline.id()
                    && table.hit_group == hit_group =>
            {
                table
            }
            _ => {
                let identifier = pipeline.shader_identifier(hit_group)?;
                let mut builder = ShaderTableBuilder::new("hit groups");
                for geometry in &self.geometries {
                    builder.add_hit_group_record(identifier, geometry.descriptor_table())?;
                }
                HitGroupTable {
                    table: builder.build(&self.context)?,
                    pipeline: pipeline.id(),
                    hit_group: hit_group.to_owned(),
                    membership_version: self.membership_version,
                }
            }
        };
        Ok(&self.hit_table.insert(current).table)
    }

    pub fn scene_constants(&self) -> shader_types::Scene {
        shader_types::Scene {
            environment_color: self.environment.color,
            light_count: self.lights.len() as u32,
        }
    }

    pub fn light_data(&self) -> Vec<LightData> {
        self.lights.iter().map(Light::to_shader).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FallbackBackend, FallbackOptions};
    use crate::pipeline::{primary_ray_pipeline, HIT_GROUP_EXPORT};

    fn session() -> RenderSession {
        RenderSession::new(
            Box::new(FallbackBackend::new(FallbackOptions::default())),
            64,
        )
        .unwrap()
    }

    fn triangle(session: &RenderSession, z: f32) -> Arc<Geometry> {
        Geometry::new(
            session,
            GeometryDesc {
                name: "triangle".into(),
                vertices: vec![
                    Vertex::from_position([0.0, 0.0, z]),
                    Vertex::from_position([1.0, 0.0, z]),
                    Vertex::from_position([0.0, 1.0, z]),
                ],
                indices: Some(vec![0, 1, 2]),
                material: Some(Arc::new(Material::default())),
            },
        )
        .unwrap()
    }

    #[test]
    fn repeated_reads_reuse_the_tlas() {
        let session = session();
        let mut scene = Scene::new(&session);
        for i in 0..3 {
            scene.add_geometry(triangle(&session, -(i as f32) - 1.0));
        }
        assert!(scene.is_dirty());

        let first = scene.top_level_acceleration_structure().unwrap();
        assert_eq!(scene.rebuild_count(), 1);
        assert!(!scene.is_dirty());
        assert_eq!(scene.instance_count(), Some(3));

        let submissions = session.context().submission_count();
        let second = scene.top_level_acceleration_structure().unwrap();
        assert_eq!(first, second);
        assert_eq!(session.context().submission_count(), submissions);
        assert_eq!(scene.rebuild_count(), 1);
    }

    #[test]
    fn removing_geometry_marks_the_scene_dirty() {
        let session = session();
        let mut scene = Scene::new(&session);
        let a = triangle(&session, -1.0);
        scene.add_geometry(a.clone());
        scene.add_geometry(triangle(&session, -2.0));
        scene.top_level_acceleration_structure().unwrap();

        assert!(scene.remove_geometry(a.id()).is_some());
        assert!(scene.is_dirty());
        assert!(scene.remove_geometry(a.id()).is_none());
        scene.top_level_acceleration_structure().unwrap();
        assert_eq!(scene.rebuild_count(), 2);
        assert_eq!(scene.instance_count(), Some(1));
    }

    #[test]
    fn instances_reference_their_geometry() {
        let session = session();
        let mut scene = Scene::new(&session);
        let a = triangle(&session, -1.0);
        let b = triangle(&session, -2.0);
        scene.add_geometry(a.clone());
        scene.add_geometry(b.clone());
        let instances = scene.instance_descs();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[1].instance_id(), 1);
        assert_eq!(instances[1].hit_group_contribution(), 1);
        assert_eq!(instances[1].mask(), 1);
        assert_eq!(instances[1].flags(), 0);
        assert_eq!(instances[0].acceleration_structure(), a.blas_pointer());
        assert_eq!(instances[1].acceleration_structure(), b.blas_pointer());
        assert_eq!(instances[0].transform, InstanceDesc::IDENTITY_TRANSFORM);
    }

    #[test]
    fn hit_table_follows_membership() {
        let session = session();
        let pipeline = PipelineState::new(session.context(), &primary_ray_pipeline(Vec::new())).unwrap();
        let mut scene = Scene::new(&session);
        scene.add_geometry(triangle(&session, -1.0));
        scene.add_geometry(triangle(&session, -2.0));

        let first = scene.hit_group_table(&pipeline, HIT_GROUP_EXPORT).unwrap().region();
        assert_eq!(first.record_count(), 2);
        let again = scene.hit_group_table(&pipeline, HIT_GROUP_EXPORT).unwrap().region();
        assert_eq!(first, again);

        scene.add_geometry(triangle(&session, -3.0));
        let table = scene.hit_group_table(&pipeline, HIT_GROUP_EXPORT).unwrap();
        assert_eq!(table.record_count(), 3);
    }

    #[test]
    fn unknown_hit_groups_are_reported() {
        let session = session();
        let pipeline = PipelineState::new(session.context(), &primary_ray_pipeline(Vec::new())).unwrap();
        let mut scene = Scene::new(&session);
        assert!(scene.hit_group_table(&pipeline, "Shadow").is_err());
    }
}
