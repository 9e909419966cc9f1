//! The BVH traversal state machine.
//!
//! One loop iteration decodes one node: box nodes push their hit children, instance nodes move
//! the ray into object space of the bottom level structure, leaves run the candidate logic with
//! the any-hit and intersection programs inlined. The per lane stack keeps its top entries in
//! shared memory and spills the rest to scratch.

use crate::*;

mod flags;
pub use flags::*;

/// state of the state machine, only live while the traversal runs
struct TraversalVars {
  root_bvh_base: VariableId,
  bvh_base: VariableId,
  current: VariableId,
  previous: VariableId,
  stack: VariableId,
  stack_low_watermark: VariableId,
  top_stack: VariableId,
  instance_top: VariableId,
  instance_bottom: VariableId,

  origin: VariableId,
  direction: VariableId,
  inv_dir: VariableId,

  instance_addr: VariableId,
  sbt_offset_and_flags: VariableId,
  traverse_flags: VariableId,
  hit: VariableId,
}

impl TraversalVars {
  fn declare(b: &mut ShaderBuilder) -> Self {
    let mut var = |name: &str, ty: ValueType| b.make_variable(format!("trav.{name}"), ty);
    Self {
      root_bvh_base: var("root_bvh_base", ValueType::U64),
      bvh_base: var("bvh_base", ValueType::U64),
      current: var("current_node", ValueType::U32),
      previous: var("previous_node", ValueType::U32),
      stack: var("stack", ValueType::U32),
      stack_low_watermark: var("stack_low_watermark", ValueType::U32),
      top_stack: var("top_stack", ValueType::U32),
      instance_top: var("instance_top_node", ValueType::U32),
      instance_bottom: var("instance_bottom_node", ValueType::U32),
      origin: var("origin", ValueType::Vec3),
      direction: var("dir", ValueType::Vec3),
      inv_dir: var("inv_dir", ValueType::Vec3),
      instance_addr: var("instance_addr", ValueType::U64),
      sbt_offset_and_flags: var("sbt_offset_and_flags", ValueType::U32),
      traverse_flags: var("traverse_flags", ValueType::U32),
      hit: var("hit", ValueType::Bool),
    }
  }
}

/// Stack storage of the traversal: `capacity` entries per lane in shared memory, the rest in the
/// frame's spill area.
#[derive(Debug, Clone, Copy)]
struct TraversalStack {
  base: u32,
  capacity: u32,
  wave_size: u32,
  spill_base: u32,
}

impl TraversalStack {
  fn local_slot(&self, b: &mut ShaderBuilder, index: Node) -> Node {
    let lane = b.intrinsic(Intrinsic::LocalInvocationIndex, &[]);
    let capacity = b.imm_u32(self.capacity);
    let slot = b.umod(index, capacity);
    let row = b.imul_imm(slot, self.wave_size * 4);
    let lane = b.imul_imm(lane, 4);
    let offset = b.iadd(row, lane);
    b.iadd_imm(offset, self.base)
  }

  fn spill_slot(&self, b: &mut ShaderBuilder, index: Node) -> Node {
    let offset = b.imul_imm(index, 4);
    b.iadd_imm(offset, self.spill_base)
  }

  fn push(&self, b: &mut ShaderBuilder, t: &TraversalVars, node: Node) {
    let stack = b.load_var(t.stack);
    let watermark = b.load_var(t.stack_low_watermark);
    let used = b.isub(stack, watermark);
    let full = b.ieq_imm(used, self.capacity);
    b.if_by(full, |b| {
      let local = self.local_slot(b, watermark);
      let spilled = b.intrinsic(Intrinsic::LoadShared { ty: ValueType::U32 }, &[local]);
      let spill = self.spill_slot(b, watermark);
      b.intrinsic_void(
        Intrinsic::StoreScratch {
          base: ScratchBase::Frame,
        },
        &[spilled, spill],
      );
      let watermark = b.iadd_imm(watermark, 1);
      b.store_var(t.stack_low_watermark, watermark);
    });

    let local = self.local_slot(b, stack);
    b.intrinsic_void(Intrinsic::StoreShared, &[node, local]);
    let stack = b.iadd_imm(stack, 1);
    b.store_var(t.stack, stack);
  }

  /// move spilled entries back until the local part is full or the spill area is empty
  fn refill(&self, b: &mut ShaderBuilder, t: &TraversalVars) {
    b.loop_by(|b| {
      let watermark = b.load_var(t.stack_low_watermark);
      let empty = b.ieq_imm(watermark, 0);
      b.break_if(empty);
      let stack = b.load_var(t.stack);
      let used = b.isub(stack, watermark);
      let full = b.ieq_imm(used, self.capacity);
      b.break_if(full);

      let watermark = b.isub_imm(watermark, 1);
      b.store_var(t.stack_low_watermark, watermark);
      let spill = self.spill_slot(b, watermark);
      let entry = b.intrinsic(
        Intrinsic::LoadScratch {
          ty: ValueType::U32,
          base: ScratchBase::Frame,
        },
        &[spill],
      );
      let local = self.local_slot(b, watermark);
      b.intrinsic_void(Intrinsic::StoreShared, &[entry, local]);
    });
  }

  fn pop(&self, b: &mut ShaderBuilder, t: &TraversalVars) -> Node {
    let stack = b.load_var(t.stack);
    let watermark = b.load_var(t.stack_low_watermark);
    let local_empty = b.ieq(stack, watermark);
    b.if_by(local_empty, |b| self.refill(b, t));

    let stack = b.isub_imm(stack, 1);
    b.store_var(t.stack, stack);
    let local = self.local_slot(b, stack);
    b.intrinsic(Intrinsic::LoadShared { ty: ValueType::U32 }, &[local])
  }
}

/// The inlined programs a traversal may run.
struct TraversalCases {
  any_hit: InlinedDispatch,
  intersection: InlinedDispatch,
  /// monolithic traversals run closest hit and miss in place
  closest_hit: Option<InlinedDispatch>,
  miss: Option<InlinedDispatch>,
}

impl TraversalCases {
  fn prepare(b: &mut ShaderBuilder, cx: &RtLoweringContext) -> Result<Self, RtCompileError> {
    let monolithic = cx.mode == ExecutionMode::Monolithic;
    let any_hit = prepare_inlined_shaders(b, InlineCaseKind::AnyHit, cx)?;
    let intersection = prepare_inlined_shaders(b, InlineCaseKind::Intersection, cx)?;
    let closest_hit = monolithic
      .then(|| prepare_inlined_shaders(b, InlineCaseKind::ClosestHit, cx))
      .transpose()?;
    let miss = monolithic
      .then(|| prepare_inlined_shaders(b, InlineCaseKind::Miss, cx))
      .transpose()?;
    Ok(Self {
      any_hit,
      intersection,
      closest_hit,
      miss,
    })
  }

  fn stack_size(&self) -> u32 {
    [
      Some(&self.any_hit),
      Some(&self.intersection),
      self.closest_hit.as_ref(),
      self.miss.as_ref(),
    ]
    .into_iter()
    .flatten()
    .map(InlinedDispatch::stack_size)
    .max()
    .unwrap_or(0)
  }
}

struct TraversalBuilder<'a> {
  vars: &'a RtVariables,
  t: TraversalVars,
  stack: TraversalStack,
  cases: TraversalCases,
  flags: PipelineFlags,
  mode: ExecutionMode,
  hit_attrib_slots: u32,
  wave_size: u32,
}

impl TraversalBuilder<'_> {
  fn node_address(&self, b: &mut ShaderBuilder, node: Node) -> Node {
    let base = b.load_var(self.t.bvh_base);
    let offset = b.iand_imm(node, !BVH_NODE_TYPE_MASK);
    b.address_offset(base, offset)
  }

  /// operands of the intersection unit after the node address
  fn node_ray(&self, b: &mut ShaderBuilder) -> [Node; 5] {
    [
      b.load_var(self.vars.tmin),
      b.load_var(self.vars.tmax),
      b.load_var(self.t.origin),
      b.load_var(self.t.direction),
      b.load_var(self.t.inv_dir),
    ]
  }

  fn set_ray(&self, b: &mut ShaderBuilder, origin: Node, direction: Node) {
    b.store_var(self.t.origin, origin);
    b.store_var(self.t.direction, direction);
    let inv_dir = b.frcp(direction);
    b.store_var(self.t.inv_dir, inv_dir);
  }

  fn ray_flags(&self, b: &mut ShaderBuilder) -> Node {
    let flags = b.load_var(self.vars.cull_mask_and_flags);
    b.iand_imm(flags, RAY_FLAGS_MASK)
  }

  fn init(&self, b: &mut ShaderBuilder) {
    let t = &self.t;
    let accel = b.load_var(self.vars.accel_struct);
    let zero = b.imm_u64(0);
    let has_accel = b.ine(accel, zero);
    b.if_by(has_accel, |b| {
      let bvh_offset = b.load_global(ValueType::U32, accel);
      let base = b.address_offset(accel, bvh_offset);
      b.store_var(t.root_bvh_base, base);
      b.store_var(t.bvh_base, base);
      b.store_imm(t.current, BVH_ROOT_NODE);
    })
    .else_by(b, |b| {
      b.store_imm(t.root_bvh_base, 0u64);
      b.store_imm(t.bvh_base, 0u64);
      b.store_imm(t.current, BVH_TERMINAL_NODE);
    });

    let origin = b.load_var(self.vars.origin);
    let direction = b.load_var(self.vars.direction);
    self.set_ray(b, origin, direction);

    b.store_imm(t.sbt_offset_and_flags, 0u32);
    b.store_imm(t.instance_addr, 0u64);
    let flags = self.ray_flags(b);
    b.store_var(t.traverse_flags, flags);
    b.store_imm(t.hit, false);

    b.store_imm(t.stack, 0u32);
    b.store_imm(t.stack_low_watermark, 0u32);
    b.store_imm(t.top_stack, BVH_STACK_NONE);
    b.store_imm(t.previous, BVH_INVALID_NODE);
    b.store_imm(t.instance_top, BVH_INVALID_NODE);
    b.store_imm(t.instance_bottom, BVH_NO_INSTANCE_ROOT);
  }

  fn leave_instance(&self, b: &mut ShaderBuilder) {
    let t = &self.t;
    let origin = b.load_var(self.vars.origin);
    let direction = b.load_var(self.vars.direction);
    self.set_ray(b, origin, direction);
    b.copy_var(t.bvh_base, t.root_bvh_base);
    b.copy_var(t.previous, t.instance_top);
    b.store_imm(t.top_stack, BVH_STACK_NONE);
    b.store_imm(t.instance_bottom, BVH_NO_INSTANCE_ROOT);
    b.store_imm(t.instance_addr, 0u64);
    b.store_imm(t.sbt_offset_and_flags, 0u32);
    let flags = self.ray_flags(b);
    b.store_var(t.traverse_flags, flags);
  }

  /// `current` is invalid: finish the instance if its subtree is done, then take the next node
  /// from the stack
  fn pop_state(&self, b: &mut ShaderBuilder) {
    let t = &self.t;
    let bottom = b.load_var(t.instance_bottom);
    let in_instance = b.ine_imm(bottom, BVH_NO_INSTANCE_ROOT);
    let stack = b.load_var(t.stack);
    let top_stack = b.load_var(t.top_stack);
    let subtree_done = b.uge(top_stack, stack);
    let leave = b.iand(in_instance, subtree_done);
    b.if_by(leave, |b| self.leave_instance(b));

    let stack = b.load_var(t.stack);
    let empty = b.ieq_imm(stack, 0);
    b.if_by(empty, |b| b.store_imm(t.current, BVH_TERMINAL_NODE))
      .else_by(b, |b| {
        let node = self.stack.pop(b, t);
        b.store_var(t.current, node);
        b.store_imm(t.previous, BVH_INVALID_NODE);
      });
  }

  fn visit_box(&self, b: &mut ShaderBuilder, node: Node) {
    let address = self.node_address(b, node);
    let [tmin, tmax, origin, direction, inv_dir] = self.node_ray(b);
    let children = b.intrinsic(
      Intrinsic::IntersectBoxNode,
      &[address, tmin, tmax, origin, direction, inv_dir],
    );
    for i in [3, 2, 1] {
      let child = b.extract(children, i);
      let valid = b.ine_imm(child, BVH_INVALID_NODE);
      b.if_by(valid, |b| self.stack.push(b, &self.t, child));
    }
    let first = b.extract(children, 0);
    b.store_var(self.t.current, first);
  }

  fn visit_instance(&self, b: &mut ShaderBuilder, node: Node) {
    let t = &self.t;
    let address = self.node_address(b, node);
    let custom_and_mask = b.load_global_at(ValueType::U32, address, INSTANCE_CUSTOM_INDEX_OFFSET);
    let instance_mask = b.ushr_imm(custom_and_mask, 24);
    let flags = b.load_var(self.vars.cull_mask_and_flags);
    let cull_mask = b.ushr_imm(flags, 24);
    let visible = b.iand(instance_mask, cull_mask);
    let visible = b.ine_imm(visible, 0);

    b.if_by(visible, |b| {
      let stack = b.load_var(t.stack);
      b.store_var(t.top_stack, stack);
      b.store_var(t.instance_top, node);
      b.store_imm(t.instance_bottom, BVH_ROOT_NODE);

      let blas = b.load_global_at(ValueType::U64, address, INSTANCE_BLAS_OFFSET);
      let bvh_offset = b.load_global(ValueType::U32, blas);
      let base = b.address_offset(blas, bvh_offset);
      b.store_var(t.bvh_base, base);
      b.store_var(t.instance_addr, address);

      let sbt_offset_and_flags =
        b.load_global_at(ValueType::U32, address, INSTANCE_SBT_OFFSET_AND_FLAGS_OFFSET);
      b.store_var(t.sbt_offset_and_flags, sbt_offset_and_flags);
      let instance_flags = b.ushr_imm(sbt_offset_and_flags, 24);
      let ray_flags = self.ray_flags(b);
      let flags = TraverseFlags::apply_geometry_instance_flag_gpu(b, ray_flags, instance_flags);
      b.store_var(t.traverse_flags, flags);

      let rows = load_instance_rows(b, address, INSTANCE_WORLD_TO_OBJECT_OFFSET);
      let origin = b.load_var(self.vars.origin);
      let origin = transform_by_rows(b, rows, origin, true);
      let direction = b.load_var(self.vars.direction);
      let direction = transform_by_rows(b, rows, direction, false);
      self.set_ray(b, origin, direction);

      b.store_imm(t.current, BVH_ROOT_NODE);
    });
  }

  /// `sbt_offset + instance sbt offset + sbt_stride * geometry_index`
  fn sbt_index(&self, b: &mut ShaderBuilder, geometry_id_and_flags: Node) -> Node {
    let sbt_offset = b.load_var(self.vars.sbt_offset);
    let instance = b.load_var(self.t.sbt_offset_and_flags);
    let instance = b.iand_imm(instance, 0xffffff);
    let stride = b.load_var(self.vars.sbt_stride);
    let geometry = b.iand_imm(geometry_id_and_flags, GEOMETRY_INDEX_MASK);
    let geometry = b.imul(stride, geometry);
    let index = b.iadd(sbt_offset, instance);
    b.iadd(index, geometry)
  }

  fn fill_inner(
    &self,
    b: &mut ShaderBuilder,
    inner: &RtVariables,
    candidate: &Candidate,
    t: Node,
    hit_kind: Node,
  ) {
    b.store_var(inner.tmax, t);
    b.store_var(inner.primitive_addr, candidate.address);
    b.store_var(inner.primitive_id, candidate.primitive_id);
    b.store_var(inner.geometry_id_and_flags, candidate.geometry_id_and_flags);
    b.copy_var(inner.instance_addr, self.t.instance_addr);
    b.store_var(inner.hit_kind, hit_kind);
  }

  /// the accepted candidate becomes the closest hit so far
  fn commit(
    &self,
    b: &mut ShaderBuilder,
    candidate: &Candidate,
    t: Node,
    hit_kind: Node,
    sbt_index: Node,
  ) {
    let vars = self.vars;
    b.store_var(vars.tmax, t);
    b.store_var(vars.primitive_addr, candidate.address);
    b.store_var(vars.primitive_id, candidate.primitive_id);
    b.store_var(vars.geometry_id_and_flags, candidate.geometry_id_and_flags);
    b.copy_var(vars.instance_addr, self.t.instance_addr);
    b.store_var(vars.hit_kind, hit_kind);
    b.store_var(vars.idx, sbt_index);
    b.store_imm(self.t.hit, true);
  }

  fn visit_triangle(&self, b: &mut ShaderBuilder, node: Node) {
    let vars = self.vars;
    let address = self.node_address(b, node);
    let candidate = Candidate::load(
      b,
      address,
      TRIANGLE_GEOMETRY_OFFSET,
      TRIANGLE_PRIMITIVE_ID_OFFSET,
    );
    let [tmin, tmax, origin, direction, inv_dir] = self.node_ray(b);
    let result = b.intrinsic(
      Intrinsic::IntersectTriangleNode,
      &[candidate.address, tmin, tmax, origin, direction, inv_dir],
    );
    let t = b.extract(result, 0);
    let above_min = b.fge(t, tmin);
    let below_max = b.flt(t, tmax);
    let in_range = b.iand(above_min, below_max);

    let flags = b.load_var(self.t.traverse_flags);
    let half = b.imm_f32(0.5);
    let facing = b.extract(result, 1);
    let is_ccw = b.flt(half, facing);
    let is_front = TraverseFlags::is_front_facing_gpu(b, flags, is_ccw);
    let facing_pass = TraverseFlags::cull_triangle_gpu(b, flags, is_front);
    let (opacity_pass, is_opaque) =
      TraverseFlags::cull_geometry_gpu(b, flags, candidate.geometry_id_and_flags);
    let pass = b.iand(in_range, facing_pass);
    let pass = b.iand(pass, opacity_pass);

    b.if_by(pass, |b| {
      let sbt_index = self.sbt_index(b, candidate.geometry_id_and_flags);
      let front_kind = b.imm_u32(HIT_KIND_FRONT_FACING_TRIANGLE);
      let back_kind = b.imm_u32(HIT_KIND_BACK_FACING_TRIANGLE);
      let hit_kind = b.bcsel(is_front, front_kind, back_kind);

      let barycentrics = [b.extract(result, 2), b.extract(result, 3)];
      let previous = [0, 1].map(|slot| b.intrinsic(Intrinsic::LoadHitAttrib { slot }, &[]));
      for (slot, value) in (0..).zip(barycentrics) {
        b.intrinsic_void(Intrinsic::StoreHitAttrib { slot }, &[value]);
      }

      b.store_imm(vars.ahit_accept, true);
      b.store_imm(vars.ahit_terminate, false);
      b.store_var(vars.opaque, is_opaque);

      let non_opaque = b.inot(is_opaque);
      b.if_by(non_opaque, |b| {
        let inner = vars.create_inner(b);
        self.fill_inner(b, &inner, &candidate, t, hit_kind);
        load_sbt_entry(b, &inner, sbt_index, SbtTable::Hit, SbtField::AnyHitIdx);
        let index = b.load_var(inner.idx);
        let can_have_null = InlineCaseKind::AnyHit.null_possible(self.flags);
        self.cases.any_hit.emit(b, index, can_have_null, &inner);

        let accepted = b.load_var(vars.ahit_accept);
        let rejected = b.inot(accepted);
        b.if_by(rejected, |b| {
          for (slot, value) in (0..).zip(previous) {
            b.intrinsic_void(Intrinsic::StoreHitAttrib { slot }, &[value]);
          }
        });
      });

      let accepted = b.load_var(vars.ahit_accept);
      b.if_by(accepted, |b| {
        self.commit(b, &candidate, t, hit_kind, sbt_index);
        let on_first_hit = b.test_mask(
          flags,
          TraverseFlags::ACCEPT_FIRST_HIT_AND_END_SEARCH.bits(),
        );
        let terminate = b.load_var(vars.ahit_terminate);
        let end = b.ior(on_first_hit, terminate);
        b.break_if(end);
      });
    });
  }

  fn visit_aabb(&self, b: &mut ShaderBuilder, node: Node) {
    let vars = self.vars;
    let address = self.node_address(b, node);
    let candidate = Candidate::load(
      b,
      address,
      AABB_GEOMETRY_OFFSET,
      AABB_PRIMITIVE_ID_OFFSET,
    );
    let flags = b.load_var(self.t.traverse_flags);
    let (pass, is_opaque) =
      TraverseFlags::cull_geometry_gpu(b, flags, candidate.geometry_id_and_flags);

    b.if_by(pass, |b| {
      let sbt_index = self.sbt_index(b, candidate.geometry_id_and_flags);
      let inner = vars.create_inner(b);
      let tmax = b.load_var(vars.tmax);
      let no_kind = b.imm_u32(0);
      self.fill_inner(b, &inner, &candidate, tmax, no_kind);
      b.store_var(vars.opaque, is_opaque);
      load_sbt_entry(b, &inner, sbt_index, SbtTable::Hit, SbtField::IntersectionIdx);

      b.store_imm(vars.ahit_accept, false);
      b.store_imm(vars.ahit_terminate, false);
      b.store_imm(vars.terminated, false);

      let index = b.load_var(inner.idx);
      let can_have_null = InlineCaseKind::Intersection.null_possible(self.flags);
      self.cases.intersection.emit(b, index, can_have_null, &inner);

      let accepted = b.load_var(vars.ahit_accept);
      b.if_by(accepted, |b| {
        let t = b.load_var(inner.tmax);
        let hit_kind = b.load_var(inner.hit_kind);
        self.commit(b, &candidate, t, hit_kind, sbt_index);
        let terminated = b.load_var(vars.terminated);
        b.break_if(terminated);
      });
    });
  }

  fn visit_node(&self, b: &mut ShaderBuilder, node: Node) {
    let ty = b.iand_imm(node, BVH_NODE_TYPE_MASK);
    let is_box = b.ieq_imm(ty, BVH_NODE_BOX);
    b.if_by(is_box, |b| self.visit_box(b, node)).else_by(b, |b| {
      let is_instance = b.ieq_imm(ty, BVH_NODE_INSTANCE);
      b.if_by(is_instance, |b| self.visit_instance(b, node))
        .else_by(b, |b| {
          let is_aabb = b.ieq_imm(ty, BVH_NODE_AABB);
          b.if_by(is_aabb, |b| {
            if !self.flags.contains(PipelineFlags::SKIP_AABBS) {
              self.skip_by_ray_flag(b, TraverseFlags::SKIP_AABBS, |b| self.visit_aabb(b, node));
            }
          })
          .else_by(b, |b| {
            if !self.flags.contains(PipelineFlags::SKIP_TRIANGLES) {
              self.skip_by_ray_flag(b, TraverseFlags::SKIP_TRIANGLES, |b| {
                self.visit_triangle(b, node)
              });
            }
          });
        });
    });
  }

  fn skip_by_ray_flag(
    &self,
    b: &mut ShaderBuilder,
    flag: TraverseFlags,
    visit: impl FnOnce(&mut ShaderBuilder),
  ) {
    let flags = b.load_var(self.t.traverse_flags);
    let skipped = b.test_mask(flags, flag.bits());
    let visited = b.inot(skipped);
    b.if_by(visited, visit);
  }

  fn traverse(&self, b: &mut ShaderBuilder) {
    let t = &self.t;
    b.loop_by(|b| {
      let current = b.load_var(t.current);
      let invalid = b.ieq_imm(current, BVH_INVALID_NODE);
      b.if_by(invalid, |b| self.pop_state(b));

      let current = b.load_var(t.current);
      let done = b.ieq_imm(current, BVH_TERMINAL_NODE);
      b.break_if(done);

      b.store_var(t.previous, current);
      b.store_imm(t.current, BVH_INVALID_NODE);
      self.visit_node(b, current);
    });
  }

  fn exit(&self, b: &mut ShaderBuilder) {
    let vars = self.vars;
    let hit = b.load_var(self.t.hit);
    match self.mode {
      ExecutionMode::Monolithic => {
        b.if_by(hit, |b| {
          let sbt_index = b.load_var(vars.idx);
          load_sbt_entry(b, vars, sbt_index, SbtTable::Hit, SbtField::ClosestHitIdx);
          let flags = b.load_var(vars.cull_mask_and_flags);
          let skip = b.test_mask(flags, TraverseFlags::SKIP_CLOSEST_HIT_SHADER.bits());
          let run = b.inot(skip);
          b.if_by(run, |b| {
            if let Some(closest_hit) = &self.cases.closest_hit {
              let index = b.load_var(vars.idx);
              let can_have_null = InlineCaseKind::ClosestHit.null_possible(self.flags);
              closest_hit.emit(b, index, can_have_null, vars);
            }
          });
        })
        .else_by(b, |b| {
          let miss_index = b.load_var(vars.miss_index);
          load_sbt_entry(b, vars, miss_index, SbtTable::Miss, SbtField::GeneralIdx);
          if let Some(miss) = &self.cases.miss {
            let index = b.load_var(vars.idx);
            let can_have_null = InlineCaseKind::Miss.null_possible(self.flags);
            miss.emit(b, index, can_have_null, vars);
          }
        });
      }
      ExecutionMode::Indirect => {
        b.if_by(hit, |b| {
          for slot in 0..self.hit_attrib_slots {
            let value = b.intrinsic(Intrinsic::LoadHitAttrib { slot }, &[]);
            let offset = hit_attrib_shared_offset(b, slot, self.wave_size);
            b.intrinsic_void(Intrinsic::StoreShared, &[value, offset]);
          }
          let srcs = [
            b.load_var(vars.idx),
            b.load_var(vars.tmax),
            b.load_var(vars.primitive_addr),
            b.load_var(vars.primitive_id),
            b.load_var(vars.instance_addr),
            b.load_var(vars.geometry_id_and_flags),
            b.load_var(vars.hit_kind),
          ];
          b.intrinsic_void(Intrinsic::ExecuteClosestHit, &srcs);
        })
        .else_by(b, |b| {
          let tmax = b.load_var(vars.tmax);
          b.intrinsic_void(Intrinsic::ExecuteMiss, &[tmax]);
        });
      }
    }
  }
}

/// leaf fields shared by triangle and aabb nodes
struct Candidate {
  address: Node,
  geometry_id_and_flags: Node,
  primitive_id: Node,
}

impl Candidate {
  fn load(
    b: &mut ShaderBuilder,
    address: Node,
    geometry_offset: u64,
    primitive_offset: u64,
  ) -> Self {
    Self {
      address,
      geometry_id_and_flags: b.load_global_at(ValueType::U32, address, geometry_offset),
      primitive_id: b.load_global_at(ValueType::U32, address, primitive_offset),
    }
  }
}

/// Emits the complete traversal of the ray described by `vars` at the current position.
///
/// Hit candidates commit into `vars`, the closest hit or miss program runs afterwards: inlined
/// in monolithic mode, through `execute_closest_hit`/`execute_miss` in indirect mode. The spill
/// area of the stack lives in the current frame behind the largest inlined candidate program,
/// `vars.stack_size` grows accordingly.
pub fn build_traversal(
  b: &mut ShaderBuilder,
  vars: &mut RtVariables,
  cx: &RtLoweringContext,
) -> Result<(), RtCompileError> {
  let cases = TraversalCases::prepare(b, cx)?;
  let spill_base = align_up(cx.pipeline.max_candidate_scratch(), 16);
  let spill_size = cx.config.spill_entries() * 4;
  vars.stack_size = vars
    .stack_size
    .max(cases.stack_size())
    .max(spill_base + spill_size);

  let traversal = TraversalBuilder {
    vars,
    t: TraversalVars::declare(b),
    stack: TraversalStack {
      base: cx.config.traversal_stack_base(),
      capacity: cx.config.traversal_stack_entries,
      wave_size: cx.config.wave_size,
      spill_base,
    },
    cases,
    flags: cx.pipeline.flags,
    mode: cx.mode,
    hit_attrib_slots: cx.config.max_hit_attrib_slots,
    wave_size: cx.config.wave_size,
  };

  traversal.init(b);
  traversal.traverse(b);
  traversal.exit(b);

  debug!(
    "built traversal into {}: {} any hit, {} intersection cases, spill at {spill_base}",
    b.shader().name,
    traversal.cases.any_hit.cases.len(),
    traversal.cases.intersection.cases.len(),
  );
  Ok(())
}

/// The stand alone traversal program of indirect execution.
pub fn build_traversal_shader(
  cx: &RtLoweringContext,
) -> Result<(Shader, RtVariables), RtCompileError> {
  let mut shader = Shader::new("traversal", ShaderStage::Traversal);
  let mut vars = RtVariables::declare(&mut shader);
  let (mut b, _) = ShaderBuilder::from_shader(shader);
  build_traversal(&mut b, &mut vars, cx)?;
  let mut shader = b.finish();
  shader.scratch_size = vars.stack_size;
  Ok((shader, vars))
}
