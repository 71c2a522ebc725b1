//! Bounding volume hierarchy used by the emulated bottom-level acceleration structures.

use ultraviolet::Vec3;

/// Maximum primitives per leaf node before splitting.
const LEAF_MAX_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Aabb = Aabb {
        min: Vec3::new(f32::INFINITY, f32::INFINITY, f32::INFINITY),
        max: Vec3::new(f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY),
    };

    pub fn grow(&mut self, point: Vec3) {
        self.min = self.min.min_by_component(point);
        self.max = self.max.max_by_component(point);
    }

    pub fn surrounding(a: &Aabb, b: &Aabb) -> Aabb {
        Aabb {
            min: a.min.min_by_component(b.min),
            max: a.max.max_by_component(b.max),
        }
    }

    pub fn centroid(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn longest_axis(&self) -> usize {
        let extent = self.max - self.min;
        if extent.x >= extent.y && extent.x >= extent.z {
            0
        } else if extent.y >= extent.z {
            1
        } else {
            2
        }
    }

    /// Slab test.
    pub fn hit(&self, ray: &Ray, mut t_min: f32, mut t_max: f32) -> bool {
        for axis in 0..3 {
            let inv_d = 1.0 / component(ray.direction, axis);
            let mut t0 = (component(self.min, axis) - component(ray.origin, axis)) * inv_d;
            let mut t1 = (component(self.max, axis) - component(ray.origin, axis)) * inv_d;
            if inv_d < 0.0 {
                std::mem::swap(&mut t0, &mut t1);
            }
            t_min = if t0 > t_min { t0 } else { t_min };
            t_max = if t1 < t_max { t1 } else { t_max };
            if t_max < t_min {
                return false;
            }
        }
        true
    }
}

fn component(v: Vec3, axis: usize) -> f32 {
    match axis {
        0 => v.x,
        1 => v.y,
        _ => v.z,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangle {
    pub vertices: [Vec3; 3],
}

impl Triangle {
    pub fn bounds(&self) -> Aabb {
        let mut bounds = Aabb::EMPTY;
        for vertex in self.vertices {
            bounds.grow(vertex);
        }
        bounds
    }

    pub fn normal(&self) -> Vec3 {
        let [v0, v1, v2] = self.vertices;
        (v1 - v0).cross(v2 - v0).normalized()
    }

    /// Möller-Trumbore. Returns the distance and barycentrics of the hit.
    pub fn intersect(&self, ray: &Ray, t_min: f32, t_max: f32) -> Option<(f32, f32, f32)> {
        let [v0, v1, v2] = self.vertices;
        let edge1 = v1 - v0;
        let edge2 = v2 - v0;
        let p = ray.direction.cross(edge2);
        let det = edge1.dot(p);
        if det.abs() < 1e-8 {
            return None;
        }
        let inv_det = 1.0 / det;
        let s = ray.origin - v0;
        let u = s.dot(p) * inv_det;
        if !(0.0..=1.0).contains(&u) {
            return None;
        }
        let q = s.cross(edge1);
        let v = ray.direction.dot(q) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }
        let t = edge2.dot(q) * inv_det;
        (t > t_min && t < t_max).then_some((t, u, v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangleHit {
    pub t: f32,
    pub primitive: u32,
    pub barycentrics: [f32; 2],
}

#[derive(Debug, Clone)]
enum BvhNode {
    Branch {
        bounds: Aabb,
        left: usize,
        right: usize,
    },
    Leaf {
        bounds: Aabb,
        first: usize,
        count: usize,
    },
}

impl BvhNode {
    fn bounds(&self) -> &Aabb {
        match self {
            BvhNode::Branch { bounds, .. } | BvhNode::Leaf { bounds, .. } => bounds,
        }
    }
}

/// Flattened median-split BVH over a triangle list.
#[derive(Debug, Clone)]
pub struct Bvh {
    nodes: Vec<BvhNode>,
    primitives: Vec<u32>,
}

impl Bvh {
    pub fn build(triangles: &[Triangle]) -> Self {
        let mut bvh = Bvh {
            nodes: Vec::with_capacity(triangles.len().max(1) * 2),
            primitives: (0..triangles.len() as u32).collect(),
        };
        if !triangles.is_empty() {
            let mut primitives = std::mem::take(&mut bvh.primitives);
            bvh.build_node(triangles, &mut primitives, 0);
            bvh.primitives = primitives;
        }
        bvh
    }

    fn build_node(&mut self, triangles: &[Triangle], primitives: &mut [u32], first: usize) -> usize {
        let bounds = primitives
            .iter()
            .map(|&p| triangles[p as usize].bounds())
            .fold(Aabb::EMPTY, |acc, b| Aabb::surrounding(&acc, &b));

        let node_index = self.nodes.len();
        if primitives.len() <= LEAF_MAX_SIZE {
            self.nodes.push(BvhNode::Leaf {
                bounds,
                first,
                count: primitives.len(),
            });
            return node_index;
        }

        let centroid_bounds = primitives.iter().fold(Aabb::EMPTY, |mut acc, &p| {
            acc.grow(triangles[p as usize].bounds().centroid());
            acc
        });
        let axis = centroid_bounds.longest_axis();
        primitives.sort_unstable_by(|&a, &b| {
            let a = component(triangles[a as usize].bounds().centroid(), axis);
            let b = component(triangles[b as usize].bounds().centroid(), axis);
            a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
        });

        // Placeholder, patched once both children exist.
        self.nodes.push(BvhNode::Leaf {
            bounds,
            first,
            count: 0,
        });
        let mid = primitives.len() / 2;
        let (left_primitives, right_primitives) = primitives.split_at_mut(mid);
        let left = self.build_node(triangles, left_primitives, first);
        let right = self.build_node(triangles, right_primitives, first + mid);
        self.nodes[node_index] = BvhNode::Branch {
            bounds,
            left,
            right,
        };
        node_index
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn intersect(
        &self,
        triangles: &[Triangle],
        ray: &Ray,
        t_min: f32,
        t_max: f32,
    ) -> Option<TriangleHit> {
        let mut closest: Option<TriangleHit> = None;
        let mut stack = Vec::with_capacity(64);
        if !self.nodes.is_empty() {
            stack.push(0usize);
        }

        while let Some(index) = stack.pop() {
            let limit = closest.map_or(t_max, |hit| hit.t);
            let node = &self.nodes[index];
            if !node.bounds().hit(ray, t_min, limit) {
                continue;
            }
            match node {
                BvhNode::Branch { left, right, .. } => {
                    stack.push(*right);
                    stack.push(*left);
                }
                BvhNode::Leaf { first, count, .. } => {
                    for &primitive in &self.primitives[*first..*first + *count] {
                        let limit = closest.map_or(t_max, |hit| hit.t);
                        if let Some((t, u, v)) =
                            triangles[primitive as usize].intersect(ray, t_min, limit)
                        {
                            closest = Some(TriangleHit {
                                t,
                                primitive,
                                barycentrics: [u, v],
                            });
                        }
                    }
                }
            }
        }
        closest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_strip(count: usize) -> Vec<Triangle> {
        (0..count)
            .map(|i| {
                let x = i as f32 * 2.0;
                Triangle {
                    vertices: [
                        Vec3::new(x, 0.0, -1.0),
                        Vec3::new(x + 1.0, 0.0, -1.0),
                        Vec3::new(x, 1.0, -1.0),
                    ],
                }
            })
            .collect()
    }

    #[test]
    fn empty_bvh_never_hits() {
        let bvh = Bvh::build(&[]);
        assert_eq!(bvh.node_count(), 0);
        let ray = Ray {
            origin: Vec3::zero(),
            direction: Vec3::new(0.0, 0.0, -1.0),
        };
        assert!(bvh.intersect(&[], &ray, 0.0, f32::INFINITY).is_none());
    }

    #[test]
    fn single_triangle_is_a_leaf_and_hits() {
        let triangles = quad_strip(1);
        let bvh = Bvh::build(&triangles);
        assert_eq!(bvh.node_count(), 1);

        let ray = Ray {
            origin: Vec3::new(0.25, 0.25, 0.0),
            direction: Vec3::new(0.0, 0.0, -1.0),
        };
        let hit = bvh.intersect(&triangles, &ray, 0.0, f32::INFINITY).unwrap();
        assert_eq!(hit.primitive, 0);
        assert!((hit.t - 1.0).abs() < 1e-5);
    }

    #[test]
    fn traversal_finds_the_right_primitive_in_a_deep_tree() {
        let triangles = quad_strip(32);
        let bvh = Bvh::build(&triangles);
        assert!(bvh.node_count() > 1);

        let ray = Ray {
            origin: Vec3::new(2.0 * 17.0 + 0.25, 0.25, 5.0),
            direction: Vec3::new(0.0, 0.0, -1.0),
        };
        let hit = bvh.intersect(&triangles, &ray, 0.0, f32::INFINITY).unwrap();
        assert_eq!(hit.primitive, 17);
    }

    #[test]
    fn ray_between_triangles_misses() {
        let triangles = quad_strip(8);
        let bvh = Bvh::build(&triangles);
        let ray = Ray {
            origin: Vec3::new(1.5, 0.5, 5.0),
            direction: Vec3::new(0.0, 0.0, -1.0),
        };
        assert!(bvh.intersect(&triangles, &ray, 0.0, f32::INFINITY).is_none());
    }

    #[test]
    fn closest_of_overlapping_triangles_wins() {
        let near = Triangle {
            vertices: [
                Vec3::new(-1.0, -1.0, -1.0),
                Vec3::new(1.0, -1.0, -1.0),
                Vec3::new(0.0, 1.0, -1.0),
            ],
        };
        let far = Triangle {
            vertices: [
                Vec3::new(-1.0, -1.0, -3.0),
                Vec3::new(1.0, -1.0, -3.0),
                Vec3::new(0.0, 1.0, -3.0),
            ],
        };
        let triangles = [far, near];
        let bvh = Bvh::build(&triangles);
        let ray = Ray {
            origin: Vec3::zero(),
            direction: Vec3::new(0.0, 0.0, -1.0),
        };
        let hit = bvh.intersect(&triangles, &ray, 0.0, f32::INFINITY).unwrap();
        assert_eq!(hit.primitive, 1);
    }
}
