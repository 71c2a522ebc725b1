use serde::{Deserialize, Serialize};
use ultraviolet::Vec3;

use crate::render::shader_types::{LightData, LIGHT_KIND_DIRECTIONAL, LIGHT_KIND_POINT};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum Light {
    Directional {
        /// Direction the light travels in.
        direction: Vec3,
        color: Vec3,
        intensity: f32,
    },
    Point {
        position: Vec3,
        color: Vec3,
        intensity: f32,
    },
}

impl Light {
    pub fn to_shader(&self) -> LightData {
        match *self {
            Light::Directional {
                direction,
                color,
                intensity,
            } => LightData {
                vector: direction.normalized().into(),
                kind: LIGHT_KIND_DIRECTIONAL,
                color: color.into(),
                intensity,
            },
            Light::Point {
                position,
                color,
                intensity,
            } => LightData {
                vector: position.into(),
                kind: LIGHT_KIND_POINT,
                color: color.into(),
                intensity,
            },
        }
    }
}

/// Color returned for rays that leave the scene.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EnvironmentMap {
    pub color: Vec3,
    /// Name of an environment texture. Only the constant color is used when tracing.
    pub texture: Option<String>,
}

impl Default for EnvironmentMap {
    fn default() -> Self {
        Self {
            color: Vec3::new(0.1, 0.1, 0.15),
            texture: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directional_lights_are_normalized() {
        let light = Light::Directional {
            direction: Vec3::new(0.0, -4.0, 0.0),
            color: Vec3::one(),
            intensity: 2.0,
        };
        let data = light.to_shader();
        assert_eq!(data.vector, [0.0, -1.0, 0.0]);
        assert_eq!(data.kind, LIGHT_KIND_DIRECTIONAL);
        assert_eq!(data.intensity, 2.0);
    }
}
