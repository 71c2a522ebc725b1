use std::{ffi::CString, io::Cursor};

use ash::vk;

use crate::error::DeviceError;

use super::context::Context;

/// A SPIR-V library holding every entry point of a ray tracing pipeline.
pub struct ShaderLibrary<'a> {
    context: &'a Context,
    shader_module: vk::ShaderModule,
    entries: Vec<(CString, vk::ShaderStageFlags)>,
}

impl<'a> ShaderLibrary<'a> {
    pub fn new(context: &'a Context, bytes: &[u8]) -> Result<Self, DeviceError> {
        let mut spv_file = Cursor::new(bytes);

        let shader_code = ash::util::read_spv(&mut spv_file)
            .map_err(|err| DeviceError::Validation(format!("invalid SPIR-V library: {}", err)))?;

        let shader_module = {
            let create_info = vk::ShaderModuleCreateInfo::builder().code(&shader_code);
            unsafe { context.device.create_shader_module(&create_info, None) }?
        };

        Ok(Self {
            context,
            shader_module,
            entries: Vec::new(),
        })
    }

    /// Registers an entry point and returns the index of its stage.
    pub fn add_entry(
        &mut self,
        name: &str,
        stage: vk::ShaderStageFlags,
    ) -> Result<u32, DeviceError> {
        let name = CString::new(name).map_err(|_| {
            DeviceError::Validation(format!("entry point `{}` contains a nul byte", name))
        })?;
        self.entries.push((name, stage));
        Ok(self.entries.len() as u32 - 1)
    }

    /// Stage infos in registration order. They borrow the entry names, so keep `self` alive
    /// until the pipeline is created.
    pub fn stages(&self) -> Vec<vk::PipelineShaderStageCreateInfo> {
        self.entries
            .iter()
            .map(|(name, stage)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .module(self.shader_module)
                    .name(name)
                    .stage(*stage)
                    .build()
            })
            .collect()
    }
}

impl<'a> Drop for ShaderLibrary<'a> {
    fn drop(&mut self) {
        unsafe {
            self.context
                .device
                .destroy_shader_module(self.shader_module, None);
        }
    }
}
