use std::ops::BitXor;

use bitflags::bitflags;

use crate::*;

bitflags! {
  /// Flags steering one traversal.
  ///
  /// The low bits are identical to the ray flags handed to `trace_ray`, the flags of an entered
  /// instance are merged in by [`TraverseFlags::apply_geometry_instance_flag_cpu`].
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
  pub struct TraverseFlags: u32 {
    const FORCE_OPAQUE = 0x01;
    const FORCE_NON_OPAQUE = 0x02;
    const ACCEPT_FIRST_HIT_AND_END_SEARCH = 0x04;
    const SKIP_CLOSEST_HIT_SHADER = 0x08;
    const CULL_BACK_FACING_TRIANGLES = 0x10;
    const CULL_FRONT_FACING_TRIANGLES = 0x20;
    const CULL_OPAQUE = 0x40;
    const CULL_NON_OPAQUE = 0x80;
    const SKIP_TRIANGLES = 0x100;
    const SKIP_AABBS = 0x200;

    // not a ray flag, set while inside an instance with flipped facing
    const TRIANGLE_FLIP_FACING = 0x400;
  }
}

bitflags! {
  /// Stored in the high byte of an instance's `sbt_offset_and_flags`.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
  pub struct GeometryInstanceFlags: u32 {
    const TRIANGLE_FACING_CULL_DISABLE = 0x1;
    const TRIANGLE_FLIP_FACING = 0x2;
    const FORCE_OPAQUE = 0x4;
    const FORCE_NO_OPAQUE = 0x8;
  }
}

/// the part of `cull_mask_and_flags` that are ray flags
pub const RAY_FLAGS_MASK: u32 = 0x3ff;

const FORCE_ANY: u32 = TraverseFlags::FORCE_OPAQUE.bits() | TraverseFlags::FORCE_NON_OPAQUE.bits();
const CULL_FACING: u32 = TraverseFlags::CULL_BACK_FACING_TRIANGLES.bits()
  | TraverseFlags::CULL_FRONT_FACING_TRIANGLES.bits();

pub const HIT_KIND_FRONT_FACING_TRIANGLE: u32 = 0xfe;
pub const HIT_KIND_BACK_FACING_TRIANGLE: u32 = 0xff;

impl TraverseFlags {
  pub fn from_ray_flags(ray_flags: u32) -> Self {
    Self::from_bits_truncate(ray_flags & RAY_FLAGS_MASK)
  }

  /// Opacity forced by the ray wins over opacity forced by the instance.
  pub fn apply_geometry_instance_flag_cpu(self, instance: GeometryInstanceFlags) -> Self {
    let mut flags = self;
    if instance.contains(GeometryInstanceFlags::TRIANGLE_FACING_CULL_DISABLE) {
      flags.remove(Self::from_bits_retain(CULL_FACING));
    }
    if instance.contains(GeometryInstanceFlags::TRIANGLE_FLIP_FACING) {
      flags.toggle(Self::TRIANGLE_FLIP_FACING);
    }
    if !self.intersects(Self::from_bits_retain(FORCE_ANY)) {
      if instance.contains(GeometryInstanceFlags::FORCE_OPAQUE) {
        flags.insert(Self::FORCE_OPAQUE);
      } else if instance.contains(GeometryInstanceFlags::FORCE_NO_OPAQUE) {
        flags.insert(Self::FORCE_NON_OPAQUE);
      }
    }
    flags
  }

  pub fn apply_geometry_instance_flag_gpu(
    b: &mut ShaderBuilder,
    traverse_flag: Node,
    instance_flag: Node,
  ) -> Node {
    let cull_disabled = b.test_mask(
      instance_flag,
      GeometryInstanceFlags::TRIANGLE_FACING_CULL_DISABLE.bits(),
    );
    let without_cull = b.iand_imm(traverse_flag, !CULL_FACING);
    let flag = b.bcsel(cull_disabled, without_cull, traverse_flag);

    // instance bit 0x2 lands on 0x400
    let flip = b.iand_imm(instance_flag, GeometryInstanceFlags::TRIANGLE_FLIP_FACING.bits());
    let flip = b.ishl_imm(flip, 9);
    let flag = b.ixor(flag, flip);

    let ray_forced = b.test_mask(traverse_flag, FORCE_ANY);
    let not_forced = b.inot(ray_forced);
    let force_opaque = b.test_mask(instance_flag, GeometryInstanceFlags::FORCE_OPAQUE.bits());
    let force_opaque = b.iand(force_opaque, not_forced);
    let force_non_opaque =
      b.test_mask(instance_flag, GeometryInstanceFlags::FORCE_NO_OPAQUE.bits());
    let force_non_opaque = b.iand(force_non_opaque, not_forced);

    let opaque = b.imm_u32(Self::FORCE_OPAQUE.bits());
    let non_opaque = b.imm_u32(Self::FORCE_NON_OPAQUE.bits());
    let zero = b.imm_u32(0);
    // instance force opaque wins when both are set
    let add = b.bcsel(force_non_opaque, non_opaque, zero);
    let add = b.bcsel(force_opaque, opaque, add);
    b.ior(flag, add)
  }

  /// returns Pass(true)/Fail(false), Opaque(true)/Non-opaque(false)
  pub fn cull_geometry_cpu(self, geometry_opaque: bool) -> (bool, bool) {
    let is_opaque = (geometry_opaque || self.contains(Self::FORCE_OPAQUE))
      && !self.contains(Self::FORCE_NON_OPAQUE);
    let culled = (is_opaque && self.contains(Self::CULL_OPAQUE))
      || (!is_opaque && self.contains(Self::CULL_NON_OPAQUE));
    (!culled, is_opaque)
  }

  /// returns Pass(true)/Fail(false), Opaque(true)/Non-opaque(false)
  pub fn cull_geometry_gpu(
    b: &mut ShaderBuilder,
    traverse_flag: Node,
    geometry_id_and_flags: Node,
  ) -> (Node, Node) {
    let geometry_opaque = b.test_mask(geometry_id_and_flags, GEOMETRY_OPAQUE);
    let force_opaque = b.test_mask(traverse_flag, Self::FORCE_OPAQUE.bits());
    let force_non_opaque = b.test_mask(traverse_flag, Self::FORCE_NON_OPAQUE.bits());
    let cull_opaque = b.test_mask(traverse_flag, Self::CULL_OPAQUE.bits());
    let cull_non_opaque = b.test_mask(traverse_flag, Self::CULL_NON_OPAQUE.bits());

    let opaque = b.ior(geometry_opaque, force_opaque);
    let not_forced_non_opaque = b.inot(force_non_opaque);
    let is_opaque = b.iand(opaque, not_forced_non_opaque);
    let is_non_opaque = b.inot(is_opaque);

    let culled_opaque = b.iand(is_opaque, cull_opaque);
    let culled_non_opaque = b.iand(is_non_opaque, cull_non_opaque);
    let culled = b.ior(culled_opaque, culled_non_opaque);
    (b.inot(culled), is_opaque)
  }

  /// whether a triangle counter clockwise in object space faces the ray after flipping
  pub fn is_front_facing_cpu(self, is_ccw_in_local: bool) -> bool {
    is_ccw_in_local.bitxor(self.contains(Self::TRIANGLE_FLIP_FACING))
  }

  pub fn is_front_facing_gpu(b: &mut ShaderBuilder, traverse_flag: Node, is_ccw: Node) -> Node {
    let flip = b.test_mask(traverse_flag, Self::TRIANGLE_FLIP_FACING.bits());
    b.ixor(is_ccw, flip)
  }

  /// returns Pass(true)/Fail(false)
  pub fn cull_triangle_cpu(self, is_front: bool) -> bool {
    (is_front && !self.contains(Self::CULL_FRONT_FACING_TRIANGLES))
      || (!is_front && !self.contains(Self::CULL_BACK_FACING_TRIANGLES))
  }

  /// returns Pass(true)/Fail(false)
  pub fn cull_triangle_gpu(b: &mut ShaderBuilder, traverse_flag: Node, is_front: Node) -> Node {
    let cull_front = b.test_mask(traverse_flag, Self::CULL_FRONT_FACING_TRIANGLES.bits());
    let cull_back = b.test_mask(traverse_flag, Self::CULL_BACK_FACING_TRIANGLES.bits());
    let is_back = b.inot(is_front);
    let culled_front = b.iand(is_front, cull_front);
    let culled_back = b.iand(is_back, cull_back);
    let culled = b.ior(culled_front, culled_back);
    b.inot(culled)
  }
}
