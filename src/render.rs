pub mod shader_types;

use std::sync::Arc;

use crevice::std140::{AsStd140, Std140};
use serde::{Deserialize, Serialize};

use crate::backend::{DispatchRaysDesc, PipelineDesc};
use crate::camera::Camera;
use crate::context::Context;
use crate::descriptor::{BufferDescriptor, DescriptorAllocator};
use crate::error::{RenderError, Result};
use crate::pipeline::PipelineState;
use crate::scene::Scene;
use crate::session::RenderSession;
use crate::shader_table::{ShaderTable, ShaderTableBuilder};

use self::shader_types::GlobalRootArguments;

const BYTES_PER_PIXEL: u64 = 4;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
        }
    }
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Splits a packed output pixel into `[r, g, b, a]`.
pub fn unpack_rgba8(pixel: u32) -> [u8; 4] {
    pixel.to_le_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub frame: u64,
    /// Fence value that completes the frame's dispatch.
    pub fence: u64,
    pub tlas_rebuilt: bool,
    pub geometry_count: usize,
    pub hit_group_records: u64,
    /// Objects freed by the end of frame sweep.
    pub retired: usize,
}

/// Traces one primary ray per pixel into an RGBA8 output buffer.
pub struct Renderer {
    context: Arc<Context>,
    descriptors: Arc<DescriptorAllocator>,
    hit_group: String,
    ray_generation: ShaderTable,
    miss: ShaderTable,
    output: BufferDescriptor,
    viewport: Viewport,
    frame: u64,
    last_fence: u64,
    pipeline: PipelineState,
}

impl Renderer {
    pub fn new(
        session: &RenderSession,
        pipeline_desc: &PipelineDesc,
        viewport: Viewport,
    ) -> Result<Self> {
        let context = session.context().clone();
        let descriptors = session.descriptors().clone();
        let hit_group = pipeline_desc
            .hit_groups
            .first()
            .map(|group| group.name.clone())
            .ok_or_else(|| RenderError::MissingShaderExport("<hit group>".into()))?;

        let pipeline = PipelineState::new(&context, pipeline_desc)?;

        let mut ray_generation = ShaderTableBuilder::new("ray generation");
        ray_generation.add_record(pipeline.shader_identifier(&pipeline_desc.ray_generation)?, &[]);
        let ray_generation = ray_generation.build(&context)?;

        let mut miss = ShaderTableBuilder::new("miss");
        for name in &pipeline_desc.miss {
            miss.add_record(pipeline.shader_identifier(name)?, &[]);
        }
        let miss = miss.build(&context)?;

        let output = Self::allocate_output(&descriptors, viewport)?;
        log::info!(
            "Renderer ready: {}x{} on the {:?} backend",
            viewport.width,
            viewport.height,
            context.kind()
        );

        Ok(Self {
            context,
            descriptors,
            hit_group,
            ray_generation,
            miss,
            output,
            viewport,
            frame: 0,
            last_fence: 0,
            pipeline,
        })
    }

    fn allocate_output(
        descriptors: &Arc<DescriptorAllocator>,
        viewport: Viewport,
    ) -> Result<BufferDescriptor> {
        if viewport.is_empty() {
            return Err(RenderError::EmptyViewport {
                width: viewport.width,
                height: viewport.height,
            });
        }
        descriptors.allocate_raw_uav_buffer(viewport.pixel_count() * BYTES_PER_PIXEL)
    }

    pub fn pipeline(&self) -> &PipelineState {
        &self.pipeline
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn output(&self) -> &BufferDescriptor {
        &self.output
    }

    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    /// Replaces the output buffer. The old one is retired after in flight frames.
    pub fn resize(&mut self, viewport: Viewport) -> Result<()> {
        if viewport == self.viewport {
            return Ok(());
        }
        self.output = Self::allocate_output(&self.descriptors, viewport)?;
        self.viewport = viewport;
        log::debug!("Resized output to {}x{}", viewport.width, viewport.height);
        Ok(())
    }

    pub fn render(&mut self, scene: &mut Scene, camera: &Camera) -> Result<FrameStats> {
        let camera_constants = self.context.upload_labeled(
            "camera constants",
            camera.constants().as_std140().as_bytes(),
            true,
        )?;
        let scene_constants = self.context.upload_labeled(
            "scene constants",
            scene.scene_constants().as_std140().as_bytes(),
            true,
        )?;
        let light_data = scene.light_data();
        let lights = if light_data.is_empty() {
            None
        } else {
            Some(self.context.upload_labeled(
                "lights",
                bytemuck::cast_slice(&light_data),
                false,
            )?)
        };

        let rebuilds = scene.rebuild_count();
        let tlas = scene.top_level_acceleration_structure()?;
        let tlas_rebuilt = scene.rebuild_count() != rebuilds;
        let hit_table = scene.hit_group_table(&self.pipeline, &self.hit_group)?;
        let hit_group = hit_table.region();
        let hit_group_records = hit_table.record_count();

        let arguments = GlobalRootArguments {
            scene: tlas,
            camera_constants: camera_constants.gpu_virtual_address(),
            scene_constants: scene_constants.gpu_virtual_address(),
            lights: lights.as_ref().map_or(0, |lights| lights.gpu_virtual_address()),
            output: self.output.gpu_handle().0,
            width: self.viewport.width,
            height: self.viewport.height,
        };

        let mut command_list = self.context.create_command_list_allocator_pair()?;
        command_list
            .set_pipeline(&self.pipeline)
            .dispatch_rays(DispatchRaysDesc {
                ray_generation: self.ray_generation.region(),
                miss: self.miss.region(),
                hit_group,
                width: self.viewport.width,
                height: self.viewport.height,
                root_arguments: bytemuck::bytes_of(&arguments).to_vec(),
            })
            .uav_barrier(self.output.buffer());
        let fence = self.context.execute_command_list(command_list.close())?;
        self.last_fence = fence;

        // Per frame constants retire with this frame's fence.
        drop(camera_constants);
        drop(scene_constants);
        drop(lights);
        let retired = self.context.clear_deferred_deletion_queue()?;

        self.frame += 1;
        Ok(FrameStats {
            frame: self.frame,
            fence,
            tlas_rebuilt,
            geometry_count: scene.geometry_count(),
            hit_group_records,
            retired,
        })
    }

    /// Waits for the last frame and reads back its packed RGBA8 pixels, row by row.
    pub fn read_output(&self) -> Result<Vec<u32>> {
        if self.last_fence > 0 {
            self.context.wait_for_fence(self.last_fence)?;
        }
        let bytes = self.context.read_buffer(
            self.output.buffer(),
            0,
            self.viewport.pixel_count() * BYTES_PER_PIXEL,
        )?;
        Ok(bytes
            .chunks_exact(BYTES_PER_PIXEL as usize)
            .map(|pixel| u32::from_le_bytes([pixel[0], pixel[1], pixel[2], pixel[3]]))
            .collect())
    }
}
