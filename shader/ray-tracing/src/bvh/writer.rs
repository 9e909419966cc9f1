use glam::{Affine3A, Vec3};

use crate::*;

/// An explicit tree, the writer does not build hierarchies by itself.
#[derive(Debug, Clone)]
pub enum BvhNodeDesc {
  /// box children, groups of more than four are split into nested boxes
  Box(Vec<BvhNodeDesc>),
  Triangle(TriangleDesc),
  Aabb(AabbDesc),
  Instance(InstanceDesc),
}

#[derive(Debug, Clone, Copy)]
pub struct TriangleDesc {
  pub vertices: [Vec3; 3],
  pub geometry_index: u32,
  pub primitive_id: u32,
  pub opaque: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct AabbDesc {
  pub min: Vec3,
  pub max: Vec3,
  pub geometry_index: u32,
  pub primitive_id: u32,
  pub opaque: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct InstanceDesc {
  pub blas: AccelerationStructureHandle,
  pub object_to_world: Affine3A,
  pub custom_index: u32,
  pub mask: u8,
  pub sbt_offset: u32,
  pub flags: GeometryInstanceFlags,
  pub instance_id: u32,
}

impl InstanceDesc {
  pub fn new(blas: AccelerationStructureHandle, object_to_world: Affine3A) -> Self {
    Self {
      blas,
      object_to_world,
      custom_index: 0,
      mask: 0xff,
      sbt_offset: 0,
      flags: GeometryInstanceFlags::empty(),
      instance_id: 0,
    }
  }
}

/// An acceleration structure written to memory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelerationStructureHandle {
  pub address: u64,
  pub min: Vec3,
  pub max: Vec3,
}

impl TriangleDesc {
  pub fn new(vertices: [Vec3; 3], primitive_id: u32) -> Self {
    Self {
      vertices,
      geometry_index: 0,
      primitive_id,
      opaque: true,
    }
  }

  pub fn with_geometry(mut self, geometry_index: u32, opaque: bool) -> Self {
    self.geometry_index = geometry_index;
    self.opaque = opaque;
    self
  }
}

impl AabbDesc {
  pub fn new(min: Vec3, max: Vec3, primitive_id: u32) -> Self {
    Self {
      min,
      max,
      geometry_index: 0,
      primitive_id,
      opaque: true,
    }
  }

  pub fn with_geometry(mut self, geometry_index: u32, opaque: bool) -> Self {
    self.geometry_index = geometry_index;
    self.opaque = opaque;
    self
  }
}

fn geometry_id_and_flags(geometry_index: u32, opaque: bool) -> u32 {
  let opaque = if opaque { GEOMETRY_OPAQUE } else { 0 };
  (geometry_index & GEOMETRY_INDEX_MASK) | opaque
}

fn matrix_rows(transform: &Affine3A) -> [[f32; 4]; 3] {
  let m = transform.matrix3;
  let t = transform.translation;
  [
    [m.x_axis.x, m.y_axis.x, m.z_axis.x, t.x],
    [m.x_axis.y, m.y_axis.y, m.z_axis.y, t.y],
    [m.x_axis.z, m.y_axis.z, m.z_axis.z, t.z],
  ]
}

fn transformed_bounds(transform: &Affine3A, min: Vec3, max: Vec3) -> (Vec3, Vec3) {
  let mut out_min = Vec3::splat(f32::INFINITY);
  let mut out_max = Vec3::splat(f32::NEG_INFINITY);
  for corner in 0..8 {
    let p = Vec3::new(
      if corner & 1 == 0 { min.x } else { max.x },
      if corner & 2 == 0 { min.y } else { max.y },
      if corner & 4 == 0 { min.z } else { max.z },
    );
    let p = transform.transform_point3(p);
    out_min = out_min.min(p);
    out_max = out_max.max(p);
  }
  (out_min, out_max)
}

impl BvhNodeDesc {
  /// world space bounds of the subtree
  pub fn bounds(&self) -> (Vec3, Vec3) {
    match self {
      BvhNodeDesc::Box(children) => children.iter().map(BvhNodeDesc::bounds).fold(
        (Vec3::splat(f32::INFINITY), Vec3::splat(f32::NEG_INFINITY)),
        |(min, max), (c_min, c_max)| (min.min(c_min), max.max(c_max)),
      ),
      BvhNodeDesc::Triangle(triangle) => {
        let [a, b, c] = triangle.vertices;
        (a.min(b).min(c), a.max(b).max(c))
      }
      BvhNodeDesc::Aabb(aabb) => (aabb.min, aabb.max),
      BvhNodeDesc::Instance(instance) => {
        transformed_bounds(&instance.object_to_world, instance.blas.min, instance.blas.max)
      }
    }
  }

  /// groups of more than four box children become nested boxes
  fn normalized(&self) -> BvhNodeDesc {
    match self {
      BvhNodeDesc::Box(children) => {
        let mut children: Vec<BvhNodeDesc> = children.iter().map(BvhNodeDesc::normalized).collect();
        while children.len() > 4 {
          let chunk = children.len().div_ceil(4);
          children = children
            .chunks(chunk)
            .map(|group| BvhNodeDesc::Box(group.to_vec()).normalized())
            .collect();
        }
        BvhNodeDesc::Box(children)
      }
      other => other.clone(),
    }
  }

  pub fn depth(&self) -> usize {
    match self {
      BvhNodeDesc::Box(children) => 1 + children.iter().map(BvhNodeDesc::depth).max().unwrap_or(0),
      _ => 1,
    }
  }
}

/// Serializes explicit trees into acceleration structure memory.
#[derive(Default)]
pub struct AccelerationStructureWriter {
  nodes: Vec<u8>,
  instance_count: u32,
}

impl AccelerationStructureWriter {
  fn reserve(&mut self, size: usize) -> u32 {
    let offset = self.nodes.len();
    self.nodes.resize(offset + size, 0);
    offset as u32
  }

  fn place<T: bytemuck::Pod>(&mut self, offset: u32, node: &T) {
    let bytes = bytemuck::bytes_of(node);
    let offset = offset as usize;
    self.nodes[offset..offset + bytes.len()].copy_from_slice(bytes);
  }

  fn emit(&mut self, desc: &BvhNodeDesc) -> u32 {
    match desc {
      BvhNodeDesc::Box(children) => {
        let offset = self.reserve(BOX_NODE_SIZE);
        let mut node = BoxNode {
          children: [BVH_INVALID_NODE; 4],
          bounds: [[0.; 6]; 4],
        };
        for (i, child) in children.iter().take(4).enumerate() {
          let (min, max) = child.bounds();
          node.children[i] = self.emit(child);
          node.bounds[i] = [min.x, min.y, min.z, max.x, max.y, max.z];
        }
        self.place(offset, &node);
        bvh_node_id(offset, BVH_NODE_BOX)
      }
      BvhNodeDesc::Triangle(triangle) => {
        let offset = self.reserve(TRIANGLE_NODE_SIZE);
        let node = TriangleNode {
          vertices: triangle.vertices.map(|v| v.to_array()),
          geometry_id_and_flags: geometry_id_and_flags(triangle.geometry_index, triangle.opaque),
          primitive_id: triangle.primitive_id,
          padding: 0,
        };
        self.place(offset, &node);
        bvh_node_id(offset, BVH_NODE_TRIANGLE)
      }
      BvhNodeDesc::Aabb(aabb) => {
        let offset = self.reserve(AABB_NODE_SIZE);
        let node = AabbNode {
          min: aabb.min.to_array(),
          max: aabb.max.to_array(),
          geometry_id_and_flags: geometry_id_and_flags(aabb.geometry_index, aabb.opaque),
          primitive_id: aabb.primitive_id,
        };
        self.place(offset, &node);
        bvh_node_id(offset, BVH_NODE_AABB)
      }
      BvhNodeDesc::Instance(instance) => {
        let offset = self.reserve(INSTANCE_NODE_SIZE);
        let node = InstanceNode {
          blas: instance.blas.address,
          custom_index_and_mask: (instance.custom_index & 0xffffff)
            | ((instance.mask as u32) << 24),
          sbt_offset_and_flags: (instance.sbt_offset & 0xffffff) | (instance.flags.bits() << 24),
          world_to_object: matrix_rows(&instance.object_to_world.inverse()),
          object_to_world: matrix_rows(&instance.object_to_world),
          instance_id: instance.instance_id,
          padding: [0; 3],
        };
        self.instance_count += 1;
        self.place(offset, &node);
        bvh_node_id(offset, BVH_NODE_INSTANCE)
      }
    }
  }

  /// Writes `root` into `memory`. A root that is not a box gets wrapped into one.
  pub fn write(root: &BvhNodeDesc, memory: &mut GlobalMemory) -> AccelerationStructureHandle {
    let root = match root {
      BvhNodeDesc::Box(_) => root.normalized(),
      leaf => BvhNodeDesc::Box(vec![leaf.clone()]),
    };

    let mut writer = Self::default();
    let root_id = writer.emit(&root);
    debug_assert_eq!(root_id, BVH_ROOT_NODE);

    let header_size = std::mem::size_of::<AccelerationStructureHeader>();
    let header = AccelerationStructureHeader {
      bvh_offset: header_size as u32,
      instance_count: writer.instance_count,
      node_bytes: writer.nodes.len() as u32,
      padding: 0,
    };
    let mut bytes = bytemuck::bytes_of(&header).to_vec();
    bytes.extend_from_slice(&writer.nodes);
    let address = memory.allocate(bytes, 64);

    let (min, max) = root.bounds();
    trace!(
      "wrote acceleration structure at {address:#x}: {} node bytes, {} instances",
      header.node_bytes,
      header.instance_count
    );
    AccelerationStructureHandle { address, min, max }
  }
}
