use bitflags::bitflags;
use glam::{Vec3, Vec4Swizzles};

use crate::*;

bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct AnyHitBehavior: u32 {
    const ACCEPT_HIT = 1;
    const END_SEARCH = 2;
  }
}

#[derive(Debug, Clone, Copy)]
pub struct ReferenceRay {
  pub origin: Vec3,
  pub direction: Vec3,
  pub tmin: f32,
  pub tmax: f32,
  pub flags: TraverseFlags,
  pub cull_mask: u8,
}

impl ReferenceRay {
  pub fn new(origin: Vec3, direction: Vec3, tmin: f32, tmax: f32) -> Self {
    Self {
      origin,
      direction,
      tmin,
      tmax,
      flags: TraverseFlags::empty(),
      cull_mask: 0xff,
    }
  }

  pub fn with_flags(mut self, flags: TraverseFlags) -> Self {
    self.flags = flags;
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceHit {
  pub primitive_id: u32,
  pub geometry_index: u32,
  /// address of the instance node the leaf was reached through, zero for none
  pub instance_address: u64,
  pub node_address: u64,
  /// sbt offset of the instance, zero outside instances
  pub instance_sbt_offset: u32,
  pub distance: f32,
  pub hit_kind: u32,
  pub barycentrics: [f32; 2],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraversalCounters {
  pub box_visits: u32,
  pub triangle_visits: u32,
  pub triangle_hits: u32,
  pub aabb_visits: u32,
  pub instance_visits: u32,
}

/// Recursive host traversal over acceleration structure memory, the oracle the compiled state
/// machine is checked against.
///
/// Procedural leaves report the entry distance of their box.
pub struct ReferenceTraversal<'a> {
  memory: &'a GlobalMemory,
  unit: HardwareIntersectionUnit,
}

struct WalkState<'a> {
  tmax: f32,
  closest: Option<ReferenceHit>,
  counters: TraversalCounters,
  any_hit: &'a mut dyn FnMut(&ReferenceHit) -> AnyHitBehavior,
}

#[derive(Clone, Copy)]
struct LevelRay {
  origin: Vec3,
  direction: Vec3,
  flags: TraverseFlags,
  instance_address: u64,
  sbt_offset_and_flags: u32,
}

impl<'a> ReferenceTraversal<'a> {
  pub fn new(memory: &'a GlobalMemory) -> Self {
    Self {
      memory,
      unit: HardwareIntersectionUnit,
    }
  }

  /// Returns the closest accepted hit. Non opaque candidates are handed to `any_hit`.
  pub fn traverse(
    &self,
    accel: u64,
    ray: &ReferenceRay,
    any_hit: &mut dyn FnMut(&ReferenceHit) -> AnyHitBehavior,
  ) -> Result<(Option<ReferenceHit>, TraversalCounters), InterpError> {
    let mut state = WalkState {
      tmax: ray.tmax,
      closest: None,
      counters: TraversalCounters::default(),
      any_hit,
    };
    if accel == 0 {
      return Ok((None, state.counters));
    }
    let level = LevelRay {
      origin: ray.origin,
      direction: ray.direction,
      flags: ray.flags,
      instance_address: 0,
      sbt_offset_and_flags: 0,
    };
    let base = self.bvh_base(accel)?;
    self.walk(base, BVH_ROOT_NODE, ray, level, &mut state)?;
    Ok((state.closest, state.counters))
  }

  /// Every leaf a ray reaches with nothing ever accepted, each one exactly once.
  pub fn visit_leaves(
    &self,
    accel: u64,
    ray: &ReferenceRay,
  ) -> Result<(Vec<ReferenceHit>, TraversalCounters), InterpError> {
    let mut leaves = Vec::new();
    let ray = ray.with_flags(ray.flags | TraverseFlags::FORCE_NON_OPAQUE);
    let (_, counters) = self.traverse(accel, &ray, &mut |hit| {
      leaves.push(*hit);
      AnyHitBehavior::empty()
    })?;
    Ok((leaves, counters))
  }

  fn bvh_base(&self, accel: u64) -> Result<u64, InterpError> {
    let header: AccelerationStructureHeader = read_node(self.memory, accel)?;
    Ok(accel + header.bvh_offset as u64)
  }

  /// returns true when the search ended
  fn walk(
    &self,
    base: u64,
    node: u32,
    ray: &ReferenceRay,
    level: LevelRay,
    state: &mut WalkState,
  ) -> Result<bool, InterpError> {
    let address = base + bvh_node_offset(node) as u64;
    match bvh_node_type(node) {
      BVH_NODE_BOX => {
        state.counters.box_visits += 1;
        let node_ray = NodeRay {
          tmin: ray.tmin,
          tmax: state.tmax,
          origin: level.origin.to_array(),
          direction: level.direction.to_array(),
          inverse_direction: level.direction.recip().to_array(),
        };
        let children = self.unit.intersect_box_node(self.memory, address, &node_ray)?;
        for child in children {
          if child != BVH_INVALID_NODE && self.walk(base, child, ray, level, state)? {
            return Ok(true);
          }
        }
        Ok(false)
      }
      BVH_NODE_INSTANCE => {
        let instance: InstanceNode = read_node(self.memory, address)?;
        if (instance.custom_index_and_mask >> 24) & ray.cull_mask as u32 == 0 {
          return Ok(false);
        }
        state.counters.instance_visits += 1;
        let rows = instance.world_to_object.map(glam::Vec4::from_array);
        let transform = |v: Vec3, w: f32| {
          let [x, y, z] = rows.map(|row| row.xyz().dot(v) + w * row.w);
          Vec3::new(x, y, z)
        };
        let instance_flags =
          GeometryInstanceFlags::from_bits_truncate(instance.sbt_offset_and_flags >> 24);
        let level = LevelRay {
          origin: transform(ray.origin, 1.),
          direction: transform(ray.direction, 0.),
          flags: ray.flags.apply_geometry_instance_flag_cpu(instance_flags),
          instance_address: address,
          sbt_offset_and_flags: instance.sbt_offset_and_flags,
        };
        let base = self.bvh_base(instance.blas)?;
        self.walk(base, BVH_ROOT_NODE, ray, level, state)
      }
      BVH_NODE_AABB => {
        if level.flags.contains(TraverseFlags::SKIP_AABBS) {
          return Ok(false);
        }
        state.counters.aabb_visits += 1;
        let aabb: AabbNode = read_node(self.memory, address)?;
        let (pass, is_opaque) = level
          .flags
          .cull_geometry_cpu(aabb.geometry_id_and_flags & GEOMETRY_OPAQUE != 0);
        if !pass {
          return Ok(false);
        }
        let entry = intersect_ray_aabb_cpu(
          level.origin,
          level.direction.recip(),
          ray.tmin,
          state.tmax,
          Vec3::from_array(aabb.min),
          Vec3::from_array(aabb.max),
        );
        let Some(distance) = entry else {
          return Ok(false);
        };
        let hit = ReferenceHit {
          primitive_id: aabb.primitive_id,
          geometry_index: aabb.geometry_id_and_flags & GEOMETRY_INDEX_MASK,
          instance_address: level.instance_address,
          node_address: address,
          instance_sbt_offset: level.sbt_offset_and_flags & 0xffffff,
          distance: distance.max(ray.tmin),
          hit_kind: 0,
          barycentrics: [0.; 2],
        };
        Ok(Self::candidate(hit, is_opaque, level, state))
      }
      _ => {
        if level.flags.contains(TraverseFlags::SKIP_TRIANGLES) {
          return Ok(false);
        }
        state.counters.triangle_visits += 1;
        let triangle: TriangleNode = read_node(self.memory, address)?;
        let [v0, v1, v2] = triangle.vertices.map(Vec3::from_array);
        let result = intersect_ray_triangle_cpu(level.origin, level.direction, v0, v1, v2);
        let distance = result.x;
        if !(distance >= ray.tmin && distance < state.tmax) {
          return Ok(false);
        }
        let is_front = level.flags.is_front_facing_cpu(result.y > 0.5);
        let (pass, is_opaque) = level
          .flags
          .cull_geometry_cpu(triangle.geometry_id_and_flags & GEOMETRY_OPAQUE != 0);
        if !pass || !level.flags.cull_triangle_cpu(is_front) {
          return Ok(false);
        }
        state.counters.triangle_hits += 1;
        let hit = ReferenceHit {
          primitive_id: triangle.primitive_id,
          geometry_index: triangle.geometry_id_and_flags & GEOMETRY_INDEX_MASK,
          instance_address: level.instance_address,
          node_address: address,
          instance_sbt_offset: level.sbt_offset_and_flags & 0xffffff,
          distance,
          hit_kind: if is_front {
            HIT_KIND_FRONT_FACING_TRIANGLE
          } else {
            HIT_KIND_BACK_FACING_TRIANGLE
          },
          barycentrics: [result.z, result.w],
        };
        Ok(Self::candidate(hit, is_opaque, level, state))
      }
    }
  }

  fn candidate(hit: ReferenceHit, is_opaque: bool, level: LevelRay, state: &mut WalkState) -> bool {
    let mut behavior = if is_opaque {
      AnyHitBehavior::ACCEPT_HIT
    } else {
      (state.any_hit)(&hit)
    };
    if behavior.contains(AnyHitBehavior::ACCEPT_HIT) {
      state.tmax = hit.distance;
      state.closest = Some(hit);
      if level
        .flags
        .contains(TraverseFlags::ACCEPT_FIRST_HIT_AND_END_SEARCH)
      {
        behavior |= AnyHitBehavior::END_SEARCH;
      }
    }
    behavior.contains(AnyHitBehavior::END_SEARCH)
  }
}
