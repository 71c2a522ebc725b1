//! A small real-time ray tracing renderer.
//!
//! The renderer records its work against [`backend::RaytracingBackend`], which is either the
//! Vulkan ray tracing pipeline ([`vulkan::HardwareBackend`]) or a CPU emulation
//! ([`backend::FallbackBackend`]). Object lifetimes are tied to the queue fence through the
//! deferred deletion queue of [`context::Context`].

pub mod backend;
pub mod camera;
pub mod command_list;
pub mod config_loader;
pub mod context;
pub mod deferred;
pub mod descriptor;
pub mod error;
pub mod pipeline;
pub mod render;
pub mod scene;
pub mod session;
pub mod shader_table;
pub mod utility;
pub mod vulkan;

pub use backend::{BackendKind, RaytracingBackend};
pub use camera::{Camera, CameraSettings};
pub use context::Context;
pub use error::{RenderError, Result};
pub use render::{Renderer, Viewport};
pub use scene::{Geometry, GeometryDesc, Light, Material, Scene, Vertex};
pub use session::RenderSession;
