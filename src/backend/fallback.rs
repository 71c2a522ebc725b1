//! A raytracing device emulated on the CPU.
//!
//! Memory, the descriptor heap and virtual addresses are plain host allocations.
//! Submissions are validated when they are made and executed when they retire, which
//! happens once more than [`FallbackOptions::latency`] submissions are queued or when
//! the caller waits on the fence. That keeps the asynchronous behaviour of a real queue
//! observable: a resource destroyed while a queued submission still uses it loses the
//! device.

mod bvh;
mod memory;
mod shaders;

use std::collections::{HashMap, HashSet, VecDeque};

use bytemuck::pod_read_unaligned;
use serde::{Deserialize, Serialize};
use ultraviolet::{Mat4, Vec3, Vec4};

use crate::backend::{
    AccelerationStructureInputs, BackendKind, BackendLimits, BufferDesc, BufferView, Command,
    CommandAllocatorId, CreatedPipeline, DescriptorHeapDesc, DispatchRaysDesc,
    GpuDescriptorHandle, GpuVirtualAddress, HeapType, IndexFormat, InstanceDesc, PipelineDesc,
    PipelineId, PrebuildInfo, RaytracingBackend, ResourceId, ResourceState, RootSignatureDesc,
    ShaderIdentifier, TriangleGeometryDesc, WrappedGpuPointer, SHADER_IDENTIFIER_SIZE,
};
use crate::error::DeviceError;
use crate::render::shader_types::GlobalRootArguments;
use crate::utility::aligned_size_u64;

use self::bvh::{Bvh, Triangle};
use self::memory::EmulatedMemory;

const STRUCTURE_ALIGNMENT: u64 = 256;
const STRUCTURE_HEADER_SIZE: u64 = 64;
const BLAS_BYTES_PER_PRIMITIVE: u64 = 64;
const BLAS_SCRATCH_PER_PRIMITIVE: u64 = 32;
const TLAS_BYTES_PER_INSTANCE: u64 = 128;
const TLAS_SCRATCH_PER_INSTANCE: u64 = 64;
const MIN_SCRATCH_SIZE: u64 = 256;
const MAX_RECURSION_DEPTH: u32 = 31;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct FallbackOptions {
    /// How many submissions stay in flight before the oldest one retires.
    /// Zero completes every submission immediately.
    pub latency: u32,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self { latency: 1 }
    }
}

enum BuiltStructure {
    Bottom(BottomLevel),
    Top(TopLevel),
}

struct BottomLevel {
    triangles: Vec<Triangle>,
    bvh: Bvh,
}

struct TopLevel {
    instances: Vec<ResolvedInstance>,
}

struct ResolvedInstance {
    desc: InstanceDesc,
    blas: ResourceId,
    object_to_world: Mat4,
    world_to_object: Mat4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShaderRole {
    RayGeneration,
    Miss,
    HitGroup,
}

struct FallbackPipeline {
    label: String,
    root_signature: RootSignatureDesc,
    roles: HashMap<ShaderIdentifier, ShaderRole>,
}

struct Submission {
    signal: u64,
    allocator: CommandAllocatorId,
    commands: Vec<Command>,
    referenced: HashSet<ResourceId>,
}

impl Submission {
    fn uses_pipeline(&self, pipeline: PipelineId) -> bool {
        self.commands
            .iter()
            .any(|command| matches!(command, Command::SetPipeline(id) if *id == pipeline))
    }
}

pub struct FallbackBackend {
    options: FallbackOptions,
    memory: EmulatedMemory,
    next_object_id: u64,
    allocators: HashSet<CommandAllocatorId>,
    pipelines: HashMap<PipelineId, FallbackPipeline>,
    queue: VecDeque<Submission>,
    last_submitted: u64,
    completed: u64,
    device_lost: Option<String>,
}

/// Sizes reported for an emulated build. Generous enough to hold the BVH it stands for.
fn prebuild_sizes(inputs: &AccelerationStructureInputs) -> PrebuildInfo {
    let (result, scratch) = match inputs {
        AccelerationStructureInputs::BottomLevel { geometries } => {
            let primitives: u64 = geometries
                .iter()
                .map(|geometry| geometry.primitive_count() as u64)
                .sum();
            (
                STRUCTURE_HEADER_SIZE + primitives * BLAS_BYTES_PER_PRIMITIVE,
                (primitives * BLAS_SCRATCH_PER_PRIMITIVE).max(MIN_SCRATCH_SIZE),
            )
        }
        AccelerationStructureInputs::TopLevel { instance_count, .. } => {
            let instances = *instance_count as u64;
            (
                STRUCTURE_HEADER_SIZE + instances * TLAS_BYTES_PER_INSTANCE,
                (instances * TLAS_SCRATCH_PER_INSTANCE).max(MIN_SCRATCH_SIZE),
            )
        }
    };
    PrebuildInfo {
        result_size: aligned_size_u64(result, STRUCTURE_ALIGNMENT),
        scratch_size: aligned_size_u64(scratch, STRUCTURE_ALIGNMENT),
    }
}

/// Row-major 3x4 instance transform to a column-major matrix.
fn instance_transform(rows: &[[f32; 4]; 3]) -> Mat4 {
    Mat4::new(
        Vec4::new(rows[0][0], rows[1][0], rows[2][0], 0.0),
        Vec4::new(rows[0][1], rows[1][1], rows[2][1], 0.0),
        Vec4::new(rows[0][2], rows[1][2], rows[2][2], 0.0),
        Vec4::new(rows[0][3], rows[1][3], rows[2][3], 1.0),
    )
}

fn emulated_identifier(pipeline: PipelineId, export: usize) -> ShaderIdentifier {
    let mut bytes = [0u8; SHADER_IDENTIFIER_SIZE];
    bytes[..4].copy_from_slice(b"EMSI");
    bytes[4..12].copy_from_slice(&pipeline.0.to_le_bytes());
    bytes[12..16].copy_from_slice(&(export as u32).to_le_bytes());
    ShaderIdentifier(bytes)
}

impl FallbackBackend {
    pub fn new(options: FallbackOptions) -> Self {
        log::debug!(
            "Emulated raytracing device with a queue latency of {}",
            options.latency
        );
        Self {
            options,
            memory: EmulatedMemory::new(),
            next_object_id: 1,
            allocators: HashSet::new(),
            pipelines: HashMap::new(),
            queue: VecDeque::new(),
            last_submitted: 0,
            completed: 0,
            device_lost: None,
        }
    }

    /// Number of submissions that have not retired yet.
    pub fn pending_submissions(&self) -> usize {
        self.queue.len()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.memory.buffer_count()
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost.is_some()
    }

    fn next_object_id(&mut self) -> u64 {
        let id = self.next_object_id;
        self.next_object_id += 1;
        id
    }

    fn check_device(&self) -> Result<(), DeviceError> {
        match &self.device_lost {
            Some(reason) => Err(DeviceError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    fn lose_device(&mut self, reason: String) {
        log::error!("Emulated device lost: {}", reason);
        if self.device_lost.is_none() {
            self.device_lost = Some(reason);
        }
    }

    fn require_state(
        &self,
        resource: ResourceId,
        heap: HeapType,
        state: ResourceState,
        min_size: u64,
    ) -> Result<(), DeviceError> {
        let buffer = self.memory.buffer(resource)?;
        if buffer.heap != heap || buffer.state != state {
            return Err(DeviceError::Validation(format!(
                "`{}` is a {:?} buffer in {:?}, expected a {:?} buffer in {:?}",
                buffer.label, buffer.heap, buffer.state, heap, state
            )));
        }
        if buffer.size() < min_size {
            return Err(DeviceError::Validation(format!(
                "`{}` holds {} bytes, {} are required",
                buffer.label,
                buffer.size(),
                min_size
            )));
        }
        Ok(())
    }

    fn validate_triangles(
        &self,
        geometry: &TriangleGeometryDesc,
        referenced: &mut HashSet<ResourceId>,
    ) -> Result<(), DeviceError> {
        if geometry.vertex_count == 0 {
            return Err(DeviceError::Validation("triangle geometry has no vertices".into()));
        }
        if geometry.vertex_stride < 12 {
            return Err(DeviceError::Validation(format!(
                "vertex stride {} is smaller than a position",
                geometry.vertex_stride
            )));
        }
        let vertex_bytes = (geometry.vertex_count as u64 - 1) * geometry.vertex_stride + 12;
        self.memory.read(geometry.vertex_buffer, vertex_bytes)?;
        referenced.insert(self.memory.resolve_address(geometry.vertex_buffer)?.0);

        if let Some(index_buffer) = geometry.index_buffer {
            let IndexFormat::Uint32 = geometry.index_format;
            self.memory.read(index_buffer, geometry.index_count as u64 * 4)?;
            referenced.insert(self.memory.resolve_address(index_buffer)?.0);
        }
        Ok(())
    }

    fn validate_table(
        &self,
        name: &str,
        start: GpuVirtualAddress,
        size: u64,
        referenced: &mut HashSet<ResourceId>,
    ) -> Result<(), DeviceError> {
        if size == 0 {
            return Ok(());
        }
        self.memory.read(start, size).map_err(|err| {
            DeviceError::Validation(format!("{} shader table is not readable: {}", name, err))
        })?;
        referenced.insert(self.memory.resolve_address(start)?.0);
        Ok(())
    }

    fn validate_dispatch(
        &self,
        pipeline: PipelineId,
        desc: &DispatchRaysDesc,
        referenced: &mut HashSet<ResourceId>,
    ) -> Result<(), DeviceError> {
        let state = self
            .pipelines
            .get(&pipeline)
            .ok_or_else(|| DeviceError::Validation(format!("unknown pipeline {:?}", pipeline)))?;
        if desc.width == 0 || desc.height == 0 {
            return Err(DeviceError::Validation(format!(
                "dispatch of {}x{} rays",
                desc.width, desc.height
            )));
        }
        if desc.root_arguments.len() < state.root_signature.global_arguments_size as usize {
            return Err(DeviceError::Validation(format!(
                "pipeline `{}` expects {} bytes of root arguments, got {}",
                state.label,
                state.root_signature.global_arguments_size,
                desc.root_arguments.len()
            )));
        }
        if desc.ray_generation.size < SHADER_IDENTIFIER_SIZE as u64 {
            return Err(DeviceError::Validation("ray generation record is missing".into()));
        }
        if desc.miss.record_count() == 0 {
            return Err(DeviceError::Validation("miss shader table is empty".into()));
        }
        self.validate_table("ray generation", desc.ray_generation.start, desc.ray_generation.size, referenced)?;
        self.validate_table("miss", desc.miss.start, desc.miss.size, referenced)?;
        self.validate_table("hit group", desc.hit_group.start, desc.hit_group.size, referenced)?;
        self.collect_root_arguments(desc, referenced)
    }

    /// The buffers the emulated programs reach through the global root arguments.
    fn collect_root_arguments(
        &self,
        desc: &DispatchRaysDesc,
        referenced: &mut HashSet<ResourceId>,
    ) -> Result<(), DeviceError> {
        let arguments: GlobalRootArguments = desc
            .root_arguments
            .get(..std::mem::size_of::<GlobalRootArguments>())
            .map(pod_read_unaligned)
            .ok_or_else(|| DeviceError::Validation("root arguments are too short".into()))?;

        let (tlas, _) = self.memory.resolve_wrapped(arguments.scene)?;
        referenced.insert(tlas);
        if let Some(BuiltStructure::Top(top)) = &self.memory.buffer(tlas)?.structure {
            referenced.extend(top.instances.iter().map(|instance| instance.blas));
        }
        referenced.insert(self.memory.resolve_address(arguments.camera_constants)?.0);
        referenced.insert(self.memory.resolve_address(arguments.scene_constants)?.0);
        if arguments.lights != 0 {
            referenced.insert(self.memory.resolve_address(arguments.lights)?.0);
        }
        let output = self
            .memory
            .view_for_handle(GpuDescriptorHandle(arguments.output))?;
        referenced.insert(output.resource);
        Ok(())
    }

    /// Checks a command stream before it is queued and collects the buffers it touches.
    fn validate(&self, commands: &[Command]) -> Result<HashSet<ResourceId>, DeviceError> {
        let mut referenced = HashSet::new();
        let mut pipeline = None;
        for command in commands {
            match command {
                Command::BuildAccelerationStructure {
                    inputs,
                    dest,
                    scratch,
                } => {
                    let sizes = prebuild_sizes(inputs);
                    self.require_state(
                        *dest,
                        HeapType::Default,
                        ResourceState::AccelerationStructure,
                        sizes.result_size,
                    )?;
                    self.require_state(
                        *scratch,
                        HeapType::Default,
                        ResourceState::UnorderedAccess,
                        sizes.scratch_size,
                    )?;
                    referenced.insert(*dest);
                    referenced.insert(*scratch);
                    match inputs {
                        AccelerationStructureInputs::BottomLevel { geometries } => {
                            if geometries.is_empty() {
                                return Err(DeviceError::Validation(
                                    "bottom level build without geometries".into(),
                                ));
                            }
                            for geometry in geometries {
                                self.validate_triangles(geometry, &mut referenced)?;
                            }
                        }
                        AccelerationStructureInputs::TopLevel {
                            instance_count,
                            instance_descs,
                        } => {
                            if *instance_count > 0 {
                                let size = std::mem::size_of::<InstanceDesc>();
                                let bytes = self
                                    .memory
                                    .read(*instance_descs, *instance_count as u64 * size as u64)?;
                                for chunk in bytes.chunks_exact(size) {
                                    let desc: InstanceDesc = pod_read_unaligned(chunk);
                                    let (blas, _) =
                                        self.memory.resolve_wrapped(desc.acceleration_structure())?;
                                    referenced.insert(blas);
                                }
                                referenced.insert(self.memory.resolve_address(*instance_descs)?.0);
                            }
                        }
                    }
                }
                Command::UavBarrier { resource } => {
                    if let Some(resource) = resource {
                        self.memory.buffer(*resource)?;
                        referenced.insert(*resource);
                    }
                }
                Command::SetPipeline(id) => {
                    if !self.pipelines.contains_key(id) {
                        return Err(DeviceError::Validation(format!("unknown pipeline {:?}", id)));
                    }
                    pipeline = Some(*id);
                }
                Command::DispatchRays(desc) => {
                    let pipeline = pipeline.ok_or_else(|| {
                        DeviceError::Validation("DispatchRays without a pipeline set".into())
                    })?;
                    self.validate_dispatch(pipeline, desc, &mut referenced)?;
                }
            }
        }
        Ok(referenced)
    }

    fn read_triangles(
        &self,
        geometry: &TriangleGeometryDesc,
        triangles: &mut Vec<Triangle>,
    ) -> Result<(), DeviceError> {
        let position = |index: u32| -> Result<Vec3, DeviceError> {
            if index >= geometry.vertex_count {
                return Err(DeviceError::Validation(format!(
                    "index {} is out of range for {} vertices",
                    index, geometry.vertex_count
                )));
            }
            let address = geometry.vertex_buffer + index as u64 * geometry.vertex_stride;
            let position: [f32; 3] = pod_read_unaligned(self.memory.read(address, 12)?);
            Ok(Vec3::from(position))
        };

        let indices: Vec<u32> = match geometry.index_buffer {
            Some(address) => self
                .memory
                .read(address, geometry.index_count as u64 * 4)?
                .chunks_exact(4)
                .map(pod_read_unaligned)
                .collect(),
            None => (0..geometry.vertex_count).collect(),
        };
        for corners in indices.chunks_exact(3) {
            triangles.push(Triangle {
                vertices: [
                    position(corners[0])?,
                    position(corners[1])?,
                    position(corners[2])?,
                ],
            });
        }
        Ok(())
    }

    fn build_structure(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> Result<BuiltStructure, DeviceError> {
        match inputs {
            AccelerationStructureInputs::BottomLevel { geometries } => {
                let mut triangles = Vec::new();
                for geometry in geometries {
                    self.read_triangles(geometry, &mut triangles)?;
                }
                let bvh = Bvh::build(&triangles);
                log::trace!(
                    "Emulated BLAS over {} triangles, {} nodes",
                    triangles.len(),
                    bvh.node_count()
                );
                Ok(BuiltStructure::Bottom(BottomLevel { triangles, bvh }))
            }
            AccelerationStructureInputs::TopLevel {
                instance_count,
                instance_descs,
            } => {
                let mut instances = Vec::with_capacity(*instance_count as usize);
                if *instance_count > 0 {
                    let size = std::mem::size_of::<InstanceDesc>();
                    let bytes = self
                        .memory
                        .read(*instance_descs, (*instance_count as usize * size) as u64)?;
                    for (index, chunk) in bytes.chunks_exact(size).enumerate() {
                        let desc: InstanceDesc = pod_read_unaligned(chunk);
                        let (blas, _) = self.memory.resolve_wrapped(desc.acceleration_structure())?;
                        if !matches!(
                            self.memory.buffer(blas)?.structure,
                            Some(BuiltStructure::Bottom(_))
                        ) {
                            return Err(DeviceError::Validation(format!(
                                "instance {} does not reference a built bottom level structure",
                                index
                            )));
                        }
                        let object_to_world = instance_transform(&desc.transform);
                        instances.push(ResolvedInstance {
                            desc,
                            blas,
                            object_to_world,
                            world_to_object: object_to_world.inversed(),
                        });
                    }
                }
                log::trace!("Emulated TLAS over {} instances", instances.len());
                Ok(BuiltStructure::Top(TopLevel { instances }))
            }
        }
    }

    fn execute(&mut self, commands: &[Command]) -> Result<(), DeviceError> {
        let mut pipeline = None;
        for command in commands {
            match command {
                Command::BuildAccelerationStructure { inputs, dest, .. } => {
                    let structure = self.build_structure(inputs)?;
                    self.memory.buffer_mut(*dest)?.structure = Some(structure);
                }
                // Commands execute strictly in order.
                Command::UavBarrier { .. } => {}
                Command::SetPipeline(id) => pipeline = Some(*id),
                Command::DispatchRays(desc) => {
                    let state = pipeline
                        .and_then(|id| self.pipelines.get(&id))
                        .ok_or_else(|| DeviceError::Validation("pipeline vanished".into()))?;
                    let output = shaders::dispatch_rays(&self.memory, state, desc)?;
                    let buffer = self.memory.buffer_mut(output.resource)?;
                    let start = output.offset as usize;
                    let bytes: &[u8] = bytemuck::cast_slice(&output.pixels);
                    buffer.data[start..start + bytes.len()].copy_from_slice(bytes);
                }
            }
        }
        Ok(())
    }

    fn retire_oldest(&mut self) {
        let Some(submission) = self.queue.pop_front() else {
            return;
        };
        if self.device_lost.is_none() {
            if let Err(err) = self.execute(&submission.commands) {
                self.lose_device(format!(
                    "submission signaling {} failed: {}",
                    submission.signal, err
                ));
            }
        }
        self.completed = submission.signal;
    }

    fn retire_excess(&mut self) {
        while self.queue.len() > self.options.latency as usize {
            self.retire_oldest();
        }
    }
}

impl RaytracingBackend for FallbackBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fallback
    }

    fn limits(&self) -> BackendLimits {
        BackendLimits::default()
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<ResourceId, DeviceError> {
        let id = self.memory.create_buffer(desc)?;
        log::trace!("Created buffer `{}` ({} bytes) as {:?}", desc.label, desc.size, id);
        Ok(id)
    }

    fn destroy_buffer(&mut self, resource: ResourceId) {
        if let Some(submission) = self
            .queue
            .iter()
            .find(|submission| submission.referenced.contains(&resource))
        {
            let signal = submission.signal;
            self.lose_device(format!(
                "{:?} destroyed while submission signaling {} still uses it",
                resource, signal
            ));
        }
        if self.memory.destroy_buffer(resource).is_none() {
            log::warn!("Destroying unknown buffer {:?}", resource);
        }
    }

    fn write_buffer(
        &mut self,
        resource: ResourceId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let buffer = self.memory.buffer_mut(resource)?;
        if buffer.heap != HeapType::Upload {
            return Err(DeviceError::Validation(format!(
                "`{}` is not CPU visible",
                buffer.label
            )));
        }
        let end = offset as usize + data.len();
        if end > buffer.data.len() {
            return Err(DeviceError::Validation(format!(
                "write of {} bytes at {} overflows `{}`",
                data.len(),
                offset,
                buffer.label
            )));
        }
        buffer.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(
        &mut self,
        resource: ResourceId,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, DeviceError> {
        if self
            .queue
            .iter()
            .any(|submission| submission.referenced.contains(&resource))
        {
            return Err(DeviceError::Validation(format!(
                "{:?} read back while a submission still uses it",
                resource
            )));
        }
        Ok(self.memory.read_range(resource, offset, len)?.to_vec())
    }

    fn gpu_virtual_address(&self, resource: ResourceId) -> Result<GpuVirtualAddress, DeviceError> {
        Ok(self.memory.buffer(resource)?.address)
    }

    fn create_descriptor_heap(
        &mut self,
        capacity: u32,
    ) -> Result<DescriptorHeapDesc, DeviceError> {
        self.memory.create_heap(capacity)
    }

    fn write_buffer_view(&mut self, index: u32, view: &BufferView) -> Result<(), DeviceError> {
        self.memory.write_view(index, view)
    }

    fn wrap_pointer(
        &self,
        index: u32,
        resource: ResourceId,
    ) -> Result<WrappedGpuPointer, DeviceError> {
        self.memory.wrap(index, resource)
    }

    fn prebuild_info(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> Result<PrebuildInfo, DeviceError> {
        Ok(prebuild_sizes(inputs))
    }

    fn create_command_allocator(&mut self) -> Result<CommandAllocatorId, DeviceError> {
        self.check_device()?;
        let id = CommandAllocatorId(self.next_object_id());
        self.allocators.insert(id);
        Ok(id)
    }

    fn destroy_command_allocator(&mut self, allocator: CommandAllocatorId) {
        if self
            .queue
            .iter()
            .any(|submission| submission.allocator == allocator)
        {
            self.lose_device(format!("{:?} destroyed while in flight", allocator));
        }
        self.allocators.remove(&allocator);
    }

    fn submit(
        &mut self,
        allocator: CommandAllocatorId,
        commands: &[Command],
        signal: u64,
    ) -> Result<(), DeviceError> {
        self.check_device()?;
        if !self.allocators.contains(&allocator) {
            return Err(DeviceError::Validation(format!(
                "unknown command allocator {:?}",
                allocator
            )));
        }
        if self
            .queue
            .iter()
            .any(|submission| submission.allocator == allocator)
        {
            return Err(DeviceError::Validation(format!(
                "{:?} is still in flight",
                allocator
            )));
        }
        if signal <= self.last_submitted {
            return Err(DeviceError::Validation(format!(
                "fence value {} does not advance past {}",
                signal, self.last_submitted
            )));
        }
        let referenced = self.validate(commands)?;
        self.queue.push_back(Submission {
            signal,
            allocator,
            commands: commands.to_vec(),
            referenced,
        });
        self.last_submitted = signal;
        self.retire_excess();
        Ok(())
    }

    fn completed_fence_value(&mut self) -> Result<u64, DeviceError> {
        Ok(self.completed)
    }

    fn wait_for_fence(&mut self, value: u64) -> Result<(), DeviceError> {
        if value > self.last_submitted {
            return Err(DeviceError::Validation(format!(
                "waiting for fence value {} that was never signaled",
                value
            )));
        }
        while self.completed < value {
            self.retire_oldest();
        }
        self.check_device()
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<CreatedPipeline, DeviceError> {
        self.check_device()?;
        if desc.ray_generation.is_empty() {
            return Err(DeviceError::Validation(format!(
                "pipeline `{}` has no ray generation shader",
                desc.label
            )));
        }
        if desc.miss.is_empty() {
            return Err(DeviceError::Validation(format!(
                "pipeline `{}` has no miss shader",
                desc.label
            )));
        }
        if !(1..=MAX_RECURSION_DEPTH).contains(&desc.max_recursion_depth) {
            return Err(DeviceError::Validation(format!(
                "recursion depth {} is outside 1..={}",
                desc.max_recursion_depth, MAX_RECURSION_DEPTH
            )));
        }
        if let Some(group) = desc.hit_groups.iter().find(|g| g.closest_hit.is_empty()) {
            return Err(DeviceError::Validation(format!(
                "hit group `{}` has no closest hit shader",
                group.name
            )));
        }

        let id = PipelineId(self.next_object_id());
        let mut seen = HashSet::new();
        let mut identifiers = Vec::new();
        let mut roles = HashMap::new();
        let miss_end = 1 + desc.miss.len();
        for (index, name) in desc.export_names().enumerate() {
            if !seen.insert(name) {
                return Err(DeviceError::Validation(format!(
                    "export `{}` is defined twice",
                    name
                )));
            }
            let role = match index {
                0 => ShaderRole::RayGeneration,
                i if i < miss_end => ShaderRole::Miss,
                _ => ShaderRole::HitGroup,
            };
            let identifier = emulated_identifier(id, index);
            roles.insert(identifier, role);
            identifiers.push((name.to_owned(), identifier));
        }

        self.pipelines.insert(
            id,
            FallbackPipeline {
                label: desc.label.clone(),
                root_signature: desc.root_signature,
                roles,
            },
        );
        log::debug!(
            "Created emulated pipeline `{}` with {} exports",
            desc.label,
            identifiers.len()
        );
        Ok(CreatedPipeline { id, identifiers })
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        if self.queue.iter().any(|s| s.uses_pipeline(pipeline)) {
            self.lose_device(format!("{:?} destroyed while in flight", pipeline));
        }
        self.pipelines.remove(&pipeline);
    }
}
