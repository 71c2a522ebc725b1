use bytemuck::{Pod, Zeroable};

use crate::backend::VertexFormat;

#[derive(Clone, Debug, Copy, PartialEq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub tangent: [f32; 4],
}

impl Vertex {
    /// Format of [`Vertex::position`] as the acceleration structure build reads it.
    pub const POSITION_FORMAT: VertexFormat = VertexFormat::Float3;

    pub const fn stride() -> u64 {
        std::mem::size_of::<Self>() as u64
    }

    pub fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            uv,
            tangent: [1.0, 0.0, 0.0, 1.0],
        }
    }

    /// A vertex with only a position. Shading falls back to the face normal.
    pub fn from_position(position: [f32; 3]) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_comes_first() {
        assert_eq!(std::mem::offset_of!(Vertex, position), 0);
        assert_eq!(Vertex::stride(), 48);
    }
}
