use glam::{Vec3, Vec4};

use crate::*;

/// Software model of the fixed function node intersection hardware for the node layout of this
/// module.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareIntersectionUnit;

pub fn intersect_ray_aabb_cpu(
  origin: Vec3,
  inverse_direction: Vec3,
  t_min: f32,
  t_max: f32,
  box_min: Vec3,
  box_max: Vec3,
) -> Option<f32> {
  let t0 = (box_min - origin) * inverse_direction;
  let t1 = (box_max - origin) * inverse_direction;

  let t_near = t0.min(t1);
  let t_far = t0.max(t1);
  let t_near_max = t_near.max_element();
  let t_far_min = t_far.min_element();

  (t_near_max <= t_far_min && t_min < t_far_min && t_near_max < t_max).then_some(t_near_max)
}

/// Returns `(t, ccw, u, v)`, `t` is infinite when the ray misses the triangle. `ccw` is one when
/// the triangle winds counter clockwise seen from the ray origin.
pub fn intersect_ray_triangle_cpu(
  origin: Vec3,
  direction: Vec3,
  v0: Vec3,
  v1: Vec3,
  v2: Vec3,
) -> Vec4 {
  let miss = Vec4::new(f32::INFINITY, 0., 0., 0.);
  let e1 = v1 - v0;
  let e2 = v2 - v0;
  let normal = e1.cross(e2);
  let b = normal.dot(direction);
  if b == 0. || !b.is_finite() {
    return miss;
  }

  let w0 = origin - v0;
  let t = -normal.dot(w0) / b;

  let p = origin + t * direction;
  let uu = e1.dot(e1);
  let uv = e1.dot(e2);
  let vv = e2.dot(e2);
  let w = p - v0;
  let wu = w.dot(e1);
  let wv = w.dot(e2);
  let inverse_d = 1. / (uv * uv - uu * vv);
  let u = (uv * wv - vv * wu) * inverse_d;
  #[allow(clippy::manual_range_contains)]
  if u < 0. || u > 1. {
    return miss;
  }
  let v = (uv * wu - uu * wv) * inverse_d;
  if v < 0. || (u + v) > 1. {
    return miss;
  }

  let ccw = if b < 0. { 1. } else { 0. };
  Vec4::new(t, ccw, u, v)
}

impl RayIntersectionUnit for HardwareIntersectionUnit {
  fn intersect_box_node(
    &self,
    memory: &GlobalMemory,
    node_address: u64,
    ray: &NodeRay,
  ) -> Result<[u32; 4], InterpError> {
    let node: BoxNode = read_node(memory, node_address)?;
    let origin = Vec3::from_array(ray.origin);
    let inverse_direction = Vec3::from_array(ray.inverse_direction);

    let mut hits: SmallVec<[(f32, u32); 4]> = SmallVec::new();
    for (child, bounds) in node.children.iter().zip(node.bounds.iter()) {
      if *child == BVH_INVALID_NODE {
        continue;
      }
      let min = Vec3::new(bounds[0], bounds[1], bounds[2]);
      let max = Vec3::new(bounds[3], bounds[4], bounds[5]);
      let hit = intersect_ray_aabb_cpu(origin, inverse_direction, ray.tmin, ray.tmax, min, max);
      if let Some(t) = hit {
        hits.push((t, *child));
      }
    }
    hits.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut children = [BVH_INVALID_NODE; 4];
    for (slot, (_, child)) in children.iter_mut().zip(hits) {
      *slot = child;
    }
    Ok(children)
  }

  fn intersect_triangle_node(
    &self,
    memory: &GlobalMemory,
    node_address: u64,
    ray: &NodeRay,
  ) -> Result<[f32; 4], InterpError> {
    let node: TriangleNode = read_node(memory, node_address)?;
    let [v0, v1, v2] = node.vertices.map(Vec3::from_array);
    let hit = intersect_ray_triangle_cpu(
      Vec3::from_array(ray.origin),
      Vec3::from_array(ray.direction),
      v0,
      v1,
      v2,
    );
    Ok(hit.to_array())
  }
}
