use ash::vk;
use thiserror::Error;

use crate::backend::ResourceId;

/// A failure reported by a raytracing device.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),
    #[error("could not load the vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),
    #[error("gpu memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),
    #[error("unknown resource {0:?}")]
    UnknownResource(ResourceId),
    #[error("no resource is mapped at gpu address {0:#x}")]
    InvalidAddress(u64),
    #[error("{0}")]
    Validation(String),
    #[error("device does not support raytracing: {0}")]
    Unsupported(String),
    #[error("device lost: {0}")]
    DeviceLost(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not access config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("{operation} failed: {source}")]
    Device {
        operation: &'static str,
        #[source]
        source: DeviceError,
    },
    #[error("descriptor heap exhausted, all {capacity} slots are in use")]
    DescriptorHeapExhausted { capacity: u32 },
    #[error("invalid geometry `{name}`: {reason}")]
    InvalidGeometry { name: String, reason: String },
    #[error("pipeline has no shader export named `{0}`")]
    MissingShaderExport(String),
    #[error("cannot render into a {width}x{height} viewport")]
    EmptyViewport { width: u32, height: u32 },
    #[error("invalid shader table `{label}`: {reason}")]
    InvalidShaderTable { label: String, reason: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = RenderError> = std::result::Result<T, E>;

/// Attaches the name of the failing operation to a device error.
pub trait DeviceResultExt<T> {
    fn during(self, operation: &'static str) -> Result<T>;
}

impl<T> DeviceResultExt<T> for std::result::Result<T, DeviceError> {
    fn during(self, operation: &'static str) -> Result<T> {
        self.map_err(|source| {
            log::error!("{} failed: {}", operation, source);
            RenderError::Device { operation, source }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_errors_name_the_failing_operation() {
        let failed: std::result::Result<(), _> =
            Err(DeviceError::Validation("bad stride".into()));
        let error = failed.during("CreateDescriptorHeap").unwrap_err();
        assert!(matches!(
            error,
            RenderError::Device {
                operation: "CreateDescriptorHeap",
                source: DeviceError::Validation(_),
            }
        ));
        assert_eq!(error.to_string(), "CreateDescriptorHeap failed: bad stride");
    }

    #[test]
    fn config_errors_convert_transparently() {
        let parse = serde_json::from_str::<u32>("{").unwrap_err();
        let error = RenderError::from(ConfigError::from(parse));
        assert!(error.to_string().starts_with("malformed config: "));
    }
}
