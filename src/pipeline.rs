use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{
    HitGroupDesc, PipelineDesc, PipelineId, RaytracingBackend, RootSignatureDesc,
    ShaderIdentifier,
};
use crate::context::{Context, Retire};
use crate::error::{DeviceResultExt, RenderError, Result};
use crate::render::shader_types::{GlobalRootArguments, HitGroupRecordData};

pub const RAY_GENERATION_EXPORT: &str = "RayGen";
pub const MISS_EXPORT: &str = "Miss";
pub const HIT_GROUP_EXPORT: &str = "HitGroup";
pub const CLOSEST_HIT_EXPORT: &str = "ClosestHit";

/// The primary visibility pipeline: one ray generation, one miss and one triangle hit
/// group whose records carry a descriptor table.
pub fn primary_ray_pipeline(library: Vec<u8>) -> PipelineDesc {
    PipelineDesc {
        label: "primary rays".into(),
        library,
        ray_generation: RAY_GENERATION_EXPORT.into(),
        miss: vec![MISS_EXPORT.into()],
        hit_groups: vec![HitGroupDesc {
            name: HIT_GROUP_EXPORT.into(),
            closest_hit: CLOSEST_HIT_EXPORT.into(),
            any_hit: None,
        }],
        max_recursion_depth: 1,
        root_signature: RootSignatureDesc {
            global_arguments_size: std::mem::size_of::<GlobalRootArguments>() as u32,
            local_arguments_size: std::mem::size_of::<HitGroupRecordData>() as u32,
        },
    }
}

/// A created raytracing state object and the identifiers of its exports.
pub struct PipelineState {
    context: Arc<Context>,
    id: PipelineId,
    label: String,
    root_signature: RootSignatureDesc,
    identifiers: HashMap<String, ShaderIdentifier>,
}

struct RetiredPipeline(PipelineId);

impl Retire for RetiredPipeline {
    fn retire(self: Box<Self>, backend: &mut dyn RaytracingBackend) {
        backend.destroy_pipeline(self.0);
    }
}

impl PipelineState {
    pub fn new(context: &Arc<Context>, desc: &PipelineDesc) -> Result<Self> {
        let created = context
            .with_backend(|backend| backend.create_pipeline(desc))
            .during("CreateStateObject")?;
        log::debug!(
            "Pipeline `{}` exports {:?}",
            desc.label,
            created.identifiers.iter().map(|(name, _)| name).collect::<Vec<_>>()
        );
        Ok(Self {
            context: context.clone(),
            id: created.id,
            label: desc.label.clone(),
            root_signature: desc.root_signature,
            identifiers: created.identifiers.into_iter().collect(),
        })
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn root_signature(&self) -> RootSignatureDesc {
        self.root_signature
    }

    pub fn shader_identifier(&self, export: &str) -> Result<ShaderIdentifier> {
        self.identifiers
            .get(export)
            .copied()
            .ok_or_else(|| RenderError::MissingShaderExport(export.to_owned()))
    }
}

impl Drop for PipelineState {
    fn drop(&mut self) {
        self.context.defer_retire(Box::new(RetiredPipeline(self.id)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FallbackBackend, FallbackOptions};

    #[test]
    fn exports_resolve_to_identifiers() {
        let context = Context::new(Box::new(FallbackBackend::new(FallbackOptions::default())));
        let pipeline = PipelineState::new(&context, &primary_ray_pipeline(Vec::new())).unwrap();
        let ray_gen = pipeline.shader_identifier(RAY_GENERATION_EXPORT).unwrap();
        let hit = pipeline.shader_identifier(HIT_GROUP_EXPORT).unwrap();
        assert_ne!(ray_gen, hit);
        assert!(matches!(
            pipeline.shader_identifier("Shadow"),
            Err(RenderError::MissingShaderExport(name)) if name == "Shadow"
        ));
    }
}
