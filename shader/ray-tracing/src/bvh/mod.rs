//! Memory format of acceleration structures as the traversal reads them.
//!
//! An acceleration structure starts with a [`AccelerationStructureHeader`] followed by the node
//! data. Node ids are the byte offset of the node from the BVH base with the node type in the
//! low three bits, the root is always the box node at offset zero.

use bytemuck::{Pod, Zeroable};

use crate::*;

mod unit;
pub use unit::*;
mod writer;
pub use writer::*;
mod reference;
pub use reference::*;

pub const BVH_NODE_TYPE_MASK: u32 = 7;
pub const BVH_NODE_TRIANGLE: u32 = 0;
pub const BVH_NODE_BOX: u32 = 5;
pub const BVH_NODE_INSTANCE: u32 = 6;
pub const BVH_NODE_AABB: u32 = 7;

pub const BVH_ROOT_NODE: u32 = BVH_NODE_BOX;
pub const BVH_INVALID_NODE: u32 = u32::MAX;
/// traversal is done, never a real node as it is checked before decoding
pub const BVH_TERMINAL_NODE: u32 = u32::MAX - 1;
/// `top_stack` while no instance is entered
pub const BVH_STACK_NONE: u32 = u32::MAX;
pub const BVH_NO_INSTANCE_ROOT: u32 = u32::MAX;

pub const BOX_NODE_SIZE: usize = 112;
pub const TRIANGLE_NODE_SIZE: usize = 48;
pub const AABB_NODE_SIZE: usize = 32;
pub const INSTANCE_NODE_SIZE: usize = 128;

pub const TRIANGLE_GEOMETRY_OFFSET: u64 = 36;
pub const TRIANGLE_PRIMITIVE_ID_OFFSET: u64 = 40;
pub const AABB_GEOMETRY_OFFSET: u64 = 24;
pub const AABB_PRIMITIVE_ID_OFFSET: u64 = 28;

pub const INSTANCE_BLAS_OFFSET: u64 = 0;
pub const INSTANCE_CUSTOM_INDEX_OFFSET: u64 = 8;
pub const INSTANCE_SBT_OFFSET_AND_FLAGS_OFFSET: u64 = 12;
pub const INSTANCE_WORLD_TO_OBJECT_OFFSET: u64 = 16;
pub const INSTANCE_OBJECT_TO_WORLD_OFFSET: u64 = 64;
pub const INSTANCE_ID_OFFSET: u64 = 112;

/// low 28 bits of `geometry_id_and_flags`
pub const GEOMETRY_INDEX_MASK: u32 = 0xfffffff;
pub const GEOMETRY_OPAQUE: u32 = 1 << 28;

pub fn bvh_node_type(id: u32) -> u32 {
  id & BVH_NODE_TYPE_MASK
}

pub fn bvh_node_offset(id: u32) -> u32 {
  id & !BVH_NODE_TYPE_MASK
}

pub fn bvh_node_id(offset: u32, ty: u32) -> u32 {
  debug_assert!(offset % 8 == 0);
  offset | ty
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct AccelerationStructureHeader {
  /// offset of the root box node from the header
  pub bvh_offset: u32,
  pub instance_count: u32,
  pub node_bytes: u32,
  pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BoxNode {
  pub children: [u32; 4],
  /// per child `min.xyz, max.xyz`
  pub bounds: [[f32; 6]; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct TriangleNode {
  pub vertices: [[f32; 3]; 3],
  pub geometry_id_and_flags: u32,
  pub primitive_id: u32,
  pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct AabbNode {
  pub min: [f32; 3],
  pub max: [f32; 3],
  pub geometry_id_and_flags: u32,
  pub primitive_id: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct InstanceNode {
  /// address of the bottom level acceleration structure header
  pub blas: u64,
  /// custom index in the low 24 bits, visibility mask in the high 8
  pub custom_index_and_mask: u32,
  /// sbt offset in the low 24 bits, [`GeometryInstanceFlags`] in the high 8
  pub sbt_offset_and_flags: u32,
  pub world_to_object: [[f32; 4]; 3],
  pub object_to_world: [[f32; 4]; 3],
  pub instance_id: u32,
  pub padding: [u32; 3],
}

pub(crate) fn read_node<T: Pod>(memory: &GlobalMemory, address: u64) -> Result<T, InterpError> {
  let bytes = memory.read(address, std::mem::size_of::<T>())?;
  Ok(bytemuck::pod_read_unaligned(bytes))
}
