//! Shader tables: fixed stride arrays of shader records.
//!
//! A record is the shader identifier copied from the pipeline followed by that record's
//! local root arguments. Every record in a table shares the stride of the largest one.

use std::sync::Arc;

use crate::backend::{
    BackendLimits, GpuDescriptorHandle, ShaderIdentifier, TableRegion, SHADER_IDENTIFIER_SIZE,
};
use crate::context::Context;
use crate::deferred::DeferredBuffer;
use crate::error::{RenderError, Result};
use crate::render::shader_types::HitGroupRecordData;
use crate::utility::aligned_size_u64;

struct ShaderRecord {
    identifier: ShaderIdentifier,
    payload: Vec<u8>,
}

pub struct ShaderTableBuilder {
    label: String,
    records: Vec<ShaderRecord>,
}

impl ShaderTableBuilder {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            records: Vec::new(),
        }
    }

    pub fn add_record(&mut self, identifier: ShaderIdentifier, payload: &[u8]) -> &mut Self {
        self.records.push(ShaderRecord {
            identifier,
            payload: payload.to_vec(),
        });
        self
    }

    /// A hit group record whose local root argument is a descriptor table.
    pub fn add_hit_group_record(
        &mut self,
        identifier: ShaderIdentifier,
        descriptor_table: GpuDescriptorHandle,
    ) -> Result<&mut Self> {
        if descriptor_table.is_null() {
            return Err(RenderError::InvalidShaderTable {
                label: self.label.clone(),
                reason: format!("record {} has a null descriptor table", self.records.len()),
            });
        }
        let payload = HitGroupRecordData::new(descriptor_table);
        Ok(self.add_record(identifier, bytemuck::bytes_of(&payload)))
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn stride(&self, limits: &BackendLimits) -> u64 {
        let max_payload = self
            .records
            .iter()
            .map(|record| record.payload.len())
            .max()
            .unwrap_or(0);
        aligned_size_u64(
            (SHADER_IDENTIFIER_SIZE + max_payload) as u64,
            limits.shader_record_alignment as u64,
        )
    }

    /// Lays out the records and uploads them as one buffer.
    pub fn build(self, context: &Arc<Context>) -> Result<ShaderTable> {
        let limits = context.limits();
        let stride = self.stride(&limits);
        if stride > limits.max_shader_record_stride as u64 {
            return Err(RenderError::InvalidShaderTable {
                label: self.label,
                reason: format!(
                    "record stride {} exceeds the device limit of {}",
                    stride, limits.max_shader_record_stride
                ),
            });
        }

        let mut data = vec![0u8; stride as usize * self.records.len()];
        for (record, bytes) in self.records.iter().zip(data.chunks_exact_mut(stride as usize)) {
            bytes[..SHADER_IDENTIFIER_SIZE].copy_from_slice(&record.identifier.0);
            bytes[SHADER_IDENTIFIER_SIZE..SHADER_IDENTIFIER_SIZE + record.payload.len()]
                .copy_from_slice(&record.payload);
        }

        let buffer = context.upload_labeled(&self.label, &data, false)?;
        if buffer.gpu_virtual_address() % limits.shader_table_alignment as u64 != 0 {
            return Err(RenderError::InvalidShaderTable {
                label: self.label,
                reason: format!(
                    "table start {:#x} is not aligned to {}",
                    buffer.gpu_virtual_address(),
                    limits.shader_table_alignment
                ),
            });
        }
        log::trace!(
            "Shader table `{}`: {} records, stride {}",
            self.label,
            self.records.len(),
            stride
        );
        Ok(ShaderTable {
            buffer,
            stride,
            record_count: self.records.len() as u64,
        })
    }
}

pub struct ShaderTable {
    buffer: DeferredBuffer,
    stride: u64,
    record_count: u64,
}

impl ShaderTable {
    pub fn region(&self) -> TableRegion {
        TableRegion {
            start: self.buffer.gpu_virtual_address(),
            size: self.stride * self.record_count,
            stride: self.stride,
        }
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn buffer(&self) -> &DeferredBuffer {
        &self.buffer
    }

    /// Raw bytes of record `index`, read back from the table buffer.
    pub fn read_record(&self, index: u64) -> Result<Vec<u8>> {
        if index >= self.record_count {
            return Err(RenderError::InvalidShaderTable {
                label: self.buffer.label().to_owned(),
                reason: format!("record {} of {}", index, self.record_count),
            });
        }
        self.buffer
            .context()
            .read_buffer(&self.buffer, index * self.stride, self.stride)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FallbackBackend, FallbackOptions};

    fn context() -> Arc<Context> {
        Context::new(Box::new(FallbackBackend::new(FallbackOptions::default())))
    }

    fn identifier(byte: u8) -> ShaderIdentifier {
        ShaderIdentifier([byte; SHADER_IDENTIFIER_SIZE])
    }

    #[test]
    fn stride_covers_identifier_and_largest_payload() {
        let mut builder = ShaderTableBuilder::new("test");
        builder
            .add_record(identifier(1), &[])
            .add_record(identifier(2), &[7; 40]);
        // 32 + 40 rounded up to the 32 byte record alignment.
        assert_eq!(builder.stride(&BackendLimits::default()), 96);
    }

    #[test]
    fn records_are_laid_out_at_the_stride() {
        let context = context();
        let mut builder = ShaderTableBuilder::new("hit groups");
        builder
            .add_hit_group_record(identifier(3), GpuDescriptorHandle(0x40))
            .unwrap()
            .add_hit_group_record(identifier(4), GpuDescriptorHandle(0x60))
            .unwrap();
        let table = builder.build(&context).unwrap();
        assert_eq!(table.record_count(), 2);
        assert_eq!(table.stride(), 64);
        assert_eq!(table.region().size, 128);

        let second = table.read_record(1).unwrap();
        assert_eq!(&second[..SHADER_IDENTIFIER_SIZE], &[4; SHADER_IDENTIFIER_SIZE]);
        assert_eq!(
            &second[SHADER_IDENTIFIER_SIZE..SHADER_IDENTIFIER_SIZE + 8],
            &0x60u64.to_le_bytes()
        );
        assert!(table.read_record(2).is_err());
    }

    #[test]
    fn null_descriptor_tables_are_rejected() {
        let mut builder = ShaderTableBuilder::new("hit groups");
        assert!(matches!(
            builder.add_hit_group_record(identifier(1), GpuDescriptorHandle(0)),
            Err(RenderError::InvalidShaderTable { .. })
        ));
    }

    #[test]
    fn oversized_records_are_rejected() {
        let context = context();
        let mut builder = ShaderTableBuilder::new("huge");
        builder.add_record(identifier(1), &vec![0; 5000]);
        assert!(builder.build(&context).is_err());
    }

    #[test]
    fn empty_tables_have_an_empty_region() {
        let context = context();
        let table = ShaderTableBuilder::new("empty").build(&context).unwrap();
        assert_eq!(table.record_count(), 0);
        assert_eq!(table.region().size, 0);
        assert_eq!(table.region().record_count(), 0);
    }
}
