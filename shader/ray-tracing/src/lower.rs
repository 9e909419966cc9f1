use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
  /// every stage is a separate program, the scheduler elects the next one
  Indirect,
  /// one ray generation program with traversal and hit shaders inlined
  Monolithic,
}

pub struct RtLoweringContext<'a> {
  pub pipeline: &'a RayTracingPipelineDescriptor,
  pub config: &'a RtLoweringConfig,
  pub mode: ExecutionMode,
}

pub const RT_PRIORITY_MASK: u64 = 3;

/// tag stored in the low bits of a continuation address
pub fn rt_priority(stage: ShaderStage) -> u64 {
  match stage {
    ShaderStage::RayGen => 0,
    ShaderStage::Traversal => 1,
    ShaderStage::Miss
    | ShaderStage::ClosestHit
    | ShaderStage::AnyHit
    | ShaderStage::Intersection => 2,
    ShaderStage::Callable => 3,
  }
}

/// Push a return address and hand control to the callee chosen by `select_callee`.
fn insert_rt_call(
  b: &mut ShaderBuilder,
  vars: &mut RtVariables,
  stage: ShaderStage,
  call_idx: u32,
  stack_size: u32,
  payload: Node,
  select_callee: impl FnOnce(&mut ShaderBuilder, &RtVariables),
) {
  let size = align_up(stack_size, 16);

  let resume = b.intrinsic(Intrinsic::ResumeShaderAddress { call_idx }, &[]);
  let priority = b.imm_u64(rt_priority(stage));
  let ret_ptr = b.ior(resume, priority);

  let sp = b.load_var(vars.stack_ptr);
  let sp = b.iadd_imm(sp, size);
  b.store_var(vars.stack_ptr, sp);
  b.intrinsic_void(
    Intrinsic::StoreScratch {
      base: ScratchBase::Absolute,
    },
    &[ret_ptr, sp],
  );
  let caller_arg = b.load_var(vars.arg);
  let arg_slot = b.iadd_imm(sp, 8);
  b.intrinsic_void(
    Intrinsic::StoreScratch {
      base: ScratchBase::Absolute,
    },
    &[caller_arg, arg_slot],
  );
  let sp = b.iadd_imm(sp, 16);
  b.store_var(vars.stack_ptr, sp);

  select_callee(b, vars);

  let arg = b.isub_imm(payload, size + 16);
  b.store_var(vars.arg, arg);

  vars.stack_size = vars.stack_size.max(size + 16);
}

/// leave the current invocation so the next program the scheduler picks runs instead
fn suspend(b: &mut ShaderBuilder, vars: &RtVariables) {
  b.store_imm(vars.suspended, true);
  b.do_return();
}

/// Return to the caller and restore its payload offset, ray generation has no caller and ends
/// the lane.
pub fn insert_rt_return(b: &mut ShaderBuilder, vars: &RtVariables, stage: ShaderStage) {
  if stage == ShaderStage::RayGen {
    b.terminate();
    return;
  }
  let sp = b.load_var(vars.stack_ptr);
  let sp = b.isub_imm(sp, 16);
  b.store_var(vars.stack_ptr, sp);
  let ret = b.intrinsic(
    Intrinsic::LoadScratch {
      ty: ValueType::U64,
      base: ScratchBase::Absolute,
    },
    &[sp],
  );
  b.store_var(vars.shader_addr, ret);
  let arg_slot = b.iadd_imm(sp, 8);
  let caller_arg = b.intrinsic(
    Intrinsic::LoadScratch {
      ty: ValueType::U32,
      base: ScratchBase::Absolute,
    },
    &[arg_slot],
  );
  b.store_var(vars.arg, caller_arg);
}

fn row_xyz(b: &mut ShaderBuilder, row: Node) -> (Node, Node) {
  let x = b.extract(row, 0);
  let y = b.extract(row, 1);
  let z = b.extract(row, 2);
  let w = b.extract(row, 3);
  (b.construct(ValueType::Vec3, &[x, y, z]), w)
}

/// `rows * (v, point as w)` for a 3x4 row major matrix
pub fn transform_by_rows(b: &mut ShaderBuilder, rows: [Node; 3], v: Node, point: bool) -> Node {
  let components = rows.map(|row| {
    let (xyz, w) = row_xyz(b, row);
    let d = b.dot3(xyz, v);
    if point {
      b.fadd(d, w)
    } else {
      d
    }
  });
  b.construct(ValueType::Vec3, &components)
}

pub fn load_instance_rows(b: &mut ShaderBuilder, instance: Node, first_row: u64) -> [Node; 3] {
  [0, 1, 2].map(|i| b.load_global_at(ValueType::Vec4, instance, first_row + 16 * i))
}

/// `with_instance(instance)` when the current hit lies in an instance, `fallback` otherwise
fn instance_value(
  b: &mut ShaderBuilder,
  vars: &RtVariables,
  ty: ValueType,
  with_instance: impl FnOnce(&mut ShaderBuilder, Node) -> Node,
  fallback: impl FnOnce(&mut ShaderBuilder) -> Node,
) -> Node {
  let instance = b.load_var(vars.instance_addr);
  let zero = b.imm_u64(0);
  let has_instance = b.ine(instance, zero);
  b.select_branched(
    has_instance,
    ty,
    |b| with_instance(b, instance),
    fallback,
  )
}

fn identity_row(row: u8) -> Value {
  let mut v = [0.; 4];
  v[row as usize % 3] = 1.;
  Value::Vec4(v)
}

/// Accept a procedural hit if it lies in the current interval.
fn insert_report_intersection(b: &mut ShaderBuilder, vars: &RtVariables, t: Node, kind: Node) {
  let tmax = b.load_var(vars.tmax);
  let tmin = b.load_var(vars.tmin);
  let below_max = b.fge(tmax, t);
  let above_min = b.fge(t, tmin);
  let in_range = b.iand(below_max, above_min);
  let terminated = b.load_var(vars.terminated);
  let live = b.inot(terminated);
  let accept = b.iand(in_range, live);
  b.if_by(accept, |b| {
    b.store_imm(vars.ahit_accept, true);
    b.store_var(vars.tmax, t);
    b.store_var(vars.hit_kind, kind);
    let flags = b.load_var(vars.cull_mask_and_flags);
    let on_first_hit = b.test_mask(flags, TraverseFlags::ACCEPT_FIRST_HIT_AND_END_SEARCH.bits());
    let ahit_terminate = b.load_var(vars.ahit_terminate);
    let terminated = b.ior(on_first_hit, ahit_terminate);
    b.store_var(vars.terminated, terminated);
  });
}

/// Lowers the ray tracing intrinsics of `shader` against `vars`.
///
/// Calls become the continuation protocol in indirect mode, `trace_ray` becomes an inlined
/// traversal in monolithic mode. System values read the variables or the instance node.
pub fn lower_rt_instructions(
  shader: Shader,
  vars: &mut RtVariables,
  cx: &RtLoweringContext,
) -> Result<Shader, RtCompileError> {
  let stage = shader.stage;
  let name = shader.name.clone();

  let shader = rewrite_intrinsics(shader, |b, dst, op, srcs| {
    use Intrinsic::*;
    let value = match op {
      TraceRay {
        call_idx,
        stack_size,
      } => {
        match cx.mode {
          ExecutionMode::Indirect => {
            insert_rt_call(b, vars, stage, call_idx, stack_size, srcs[10], |b, vars| {
              b.copy_var(vars.shader_addr, vars.traversal_addr);
            });
            vars.store_trace_args(b, srcs);
            suspend(b, vars);
          }
          ExecutionMode::Monolithic => insert_monolithic_trace(b, vars, cx, srcs)?,
        }
        return Ok(true);
      }
      ExecuteCallable {
        call_idx,
        stack_size,
      } => {
        if cx.mode == ExecutionMode::Monolithic {
          return Err(RtCompileError::MonolithicUnsupported(
            "callable shaders need indirect execution",
          ));
        }
        let index = srcs[0];
        insert_rt_call(b, vars, stage, call_idx, stack_size, srcs[1], |b, vars| {
          load_sbt_entry(b, vars, index, SbtTable::Callable, SbtField::RecursivePtr);
        });
        suspend(b, vars);
        return Ok(true);
      }
      RtResume { stack_size } => {
        let sp = b.load_var(vars.stack_ptr);
        let sp = b.isub_imm(sp, align_up(stack_size, 16));
        b.store_var(vars.stack_ptr, sp);
        return Ok(true);
      }
      RtReturn => {
        insert_rt_return(b, vars, stage);
        return Ok(true);
      }
      RtArgScratchOffset => b.load_var(vars.arg),
      RayTMin => b.load_var(vars.tmin),
      RayTMax => b.load_var(vars.tmax),
      RayWorldOrigin => b.load_var(vars.origin),
      RayWorldDirection => b.load_var(vars.direction),
      RayObjectOrigin | RayObjectDirection => {
        let point = op == RayObjectOrigin;
        let world = b.load_var(if point { vars.origin } else { vars.direction });
        instance_value(
          b,
          vars,
          ValueType::Vec3,
          |b, instance| {
            let rows = load_instance_rows(b, instance, INSTANCE_WORLD_TO_OBJECT_OFFSET);
            transform_by_rows(b, rows, world, point)
          },
          |_| world,
        )
      }
      WorldToObject { row } | ObjectToWorld { row } => {
        let base = if matches!(op, WorldToObject { .. }) {
          INSTANCE_WORLD_TO_OBJECT_OFFSET
        } else {
          INSTANCE_OBJECT_TO_WORLD_OFFSET
        };
        instance_value(
          b,
          vars,
          ValueType::Vec4,
          |b, instance| b.load_global_at(ValueType::Vec4, instance, base + 16 * row as u64),
          |b| b.imm(identity_row(row)),
        )
      }
      InstanceCustomIndex => instance_value(
        b,
        vars,
        ValueType::U32,
        |b, instance| {
          let word = b.load_global_at(ValueType::U32, instance, INSTANCE_CUSTOM_INDEX_OFFSET);
          b.iand_imm(word, 0xffffff)
        },
        |b| b.imm_u32(0),
      ),
      InstanceId => instance_value(
        b,
        vars,
        ValueType::U32,
        |b, instance| b.load_global_at(ValueType::U32, instance, INSTANCE_ID_OFFSET),
        |b| b.imm_u32(0),
      ),
      PrimitiveId => b.load_var(vars.primitive_id),
      GeometryIndex => {
        let geometry = b.load_var(vars.geometry_id_and_flags);
        b.iand_imm(geometry, GEOMETRY_INDEX_MASK)
      }
      RayFlags => {
        let flags = b.load_var(vars.cull_mask_and_flags);
        b.iand_imm(flags, 0xffffff)
      }
      CullMask => {
        let flags = b.load_var(vars.cull_mask_and_flags);
        b.ushr_imm(flags, 24)
      }
      HitKind => b.load_var(vars.hit_kind),
      IntersectionOpaque => b.load_var(vars.opaque),
      ShaderRecordPtr => b.load_var(vars.shader_record_ptr),
      IgnoreIntersection => {
        b.store_imm(vars.ahit_accept, false);
        b.do_return();
        return Ok(true);
      }
      TerminateRay => {
        b.store_imm(vars.ahit_accept, true);
        b.store_imm(vars.ahit_terminate, true);
        b.do_return();
        return Ok(true);
      }
      ReportIntersection => {
        insert_report_intersection(b, vars, srcs[0], srcs[1]);
        b.load_var(vars.ahit_accept)
      }
      ExecuteClosestHit => {
        b.store_var(vars.tmax, srcs[1]);
        b.store_var(vars.primitive_addr, srcs[2]);
        b.store_var(vars.primitive_id, srcs[3]);
        b.store_var(vars.instance_addr, srcs[4]);
        b.store_var(vars.geometry_id_and_flags, srcs[5]);
        b.store_var(vars.hit_kind, srcs[6]);
        load_sbt_entry(b, vars, srcs[0], SbtTable::Hit, SbtField::RecursivePtr);

        let flags = b.load_var(vars.cull_mask_and_flags);
        let mut should_return = b.test_mask(flags, TraverseFlags::SKIP_CLOSEST_HIT_SHADER.bits());
        if !cx.pipeline.flags.contains(PipelineFlags::NO_NULL_CLOSEST_HIT) {
          let addr = b.load_var(vars.shader_addr);
          let zero = b.imm_u64(0);
          let null = b.ieq(addr, zero);
          should_return = b.ior(should_return, null);
        }
        // a hit without a closest hit program returns straight to the tracer
        b.if_by(should_return, |b| insert_rt_return(b, vars, stage));
        return Ok(true);
      }
      ExecuteMiss => {
        b.store_var(vars.tmax, srcs[0]);
        let miss_index = b.load_var(vars.miss_index);
        load_sbt_entry(b, vars, miss_index, SbtTable::Miss, SbtField::RecursivePtr);
        if !cx.pipeline.flags.contains(PipelineFlags::NO_NULL_MISS) {
          let addr = b.load_var(vars.shader_addr);
          let zero = b.imm_u64(0);
          let null = b.ieq(addr, zero);
          b.if_by(null, |b| insert_rt_return(b, vars, stage));
        }
        return Ok(true);
      }
      _ => return Ok(false),
    };
    define(b, dst, value);
    Ok(true)
  })?;

  debug!("lower_rt_instructions: {name} ({:?})", cx.mode);
  Ok(shader)
}

/// Monolithic `trace_ray`: the whole traversal with closest hit and miss runs in place, on a
/// frame right above the caller's.
fn insert_monolithic_trace(
  b: &mut ShaderBuilder,
  vars: &mut RtVariables,
  cx: &RtLoweringContext,
  srcs: &[Node],
) -> Result<(), RtCompileError> {
  let frame = align_up(b.shader().scratch_size, 16);
  vars.store_trace_args(b, srcs);

  let caller_sp = b.load_var(vars.stack_ptr);
  let callee_sp = b.iadd_imm(caller_sp, frame);
  b.store_var(vars.stack_ptr, callee_sp);
  let arg = b.isub_imm(srcs[10], frame);
  b.store_var(vars.arg, arg);

  let outer_stack = vars.stack_size;
  vars.stack_size = 0;
  build_traversal(b, vars, cx)?;
  let inner_stack = vars.stack_size;
  vars.stack_size = outer_stack.max(frame + inner_stack);

  b.store_var(vars.stack_ptr, caller_sp);
  Ok(())
}

/// Late lowering: launch values become arguments and frame scratch is rebased by the stack
/// pointer.
pub fn lower_rt_late(shader: Shader, vars: &RtVariables) -> Shader {
  let shader = infallible(rewrite_intrinsics(shader, |b, dst, op, srcs| {
    Ok(match op {
      Intrinsic::LaunchId | Intrinsic::LaunchSize => {
        let arg = if op == Intrinsic::LaunchId {
          ShaderArg::LaunchId
        } else {
          ShaderArg::LaunchSize
        };
        let value = b.load_arg(arg);
        define(b, dst, value);
        true
      }
      Intrinsic::LoadScratch {
        ty,
        base: ScratchBase::Frame,
      } => {
        let sp = b.load_var(vars.stack_ptr);
        let offset = b.iadd(srcs[0], sp);
        let value = b.intrinsic(
          Intrinsic::LoadScratch {
            ty,
            base: ScratchBase::Absolute,
          },
          &[offset],
        );
        define(b, dst, value);
        true
      }
      Intrinsic::StoreScratch {
        base: ScratchBase::Frame,
      } => {
        let sp = b.load_var(vars.stack_ptr);
        let offset = b.iadd(srcs[1], sp);
        b.intrinsic_void(
          Intrinsic::StoreScratch {
            base: ScratchBase::Absolute,
          },
          &[srcs[0], offset],
        );
        true
      }
      _ => false,
    })
  }));
  debug!("lower_rt_late: {}", shader.name);
  shader
}
