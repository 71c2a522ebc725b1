#![allow(dead_code)]

use std::sync::Arc;

use rt_renderer::{
    backend::{FallbackBackend, FallbackOptions},
    Geometry, GeometryDesc, Material, RenderSession, Vertex,
};
use ultraviolet::Vec3;

pub fn session_with_latency(latency: u32) -> RenderSession {
    RenderSession::new(Box::new(FallbackBackend::new(FallbackOptions { latency })), 256)
        .unwrap()
}

pub fn session() -> RenderSession {
    session_with_latency(FallbackOptions::default().latency)
}

/// The triangle (-1,-1) (1,-1) (0,1) in the plane `z`, facing +z.
pub fn triangle(session: &RenderSession, name: &str, z: f32, diffuse: Vec3) -> Arc<Geometry> {
    let normal = [0.0, 0.0, 1.0];
    Geometry::new(
        session,
        GeometryDesc {
            name: name.into(),
            vertices: vec![
                Vertex::new([-1.0, -1.0, z], normal, [0.0, 0.0]),
                Vertex::new([1.0, -1.0, z], normal, [1.0, 0.0]),
                Vertex::new([0.0, 1.0, z], normal, [0.5, 1.0]),
            ],
            indices: None,
            material: Some(Arc::new(Material::new(name, diffuse))),
        },
    )
    .unwrap()
}
