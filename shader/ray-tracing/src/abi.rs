use crate::*;

/// A program lowered to the dispatch ABI.
pub struct LoweredProgram {
  pub shader: Shader,
  pub vars: RtVariables,
  /// scratch bytes the program needs above its stack pointer
  pub stack_size: u32,
}

fn returns_to_caller(stage: ShaderStage) -> bool {
  matches!(
    stage,
    ShaderStage::RayGen | ShaderStage::Miss | ShaderStage::ClosestHit | ShaderStage::Callable
  )
}

/// Wraps a program into the calling convention of the dispatch loop.
///
/// The prologue loads the invocation state from the shader arguments. Programs that are not the
/// entry of ray generation only run on lanes whose continuation is the elected program. A body
/// that finishes without handing control elsewhere returns to its caller. In indirect mode the
/// epilogue writes the state back and elects the next program, in monolithic mode lanes end.
pub fn lower_rt_abi(
  shader: Shader,
  vars: RtVariables,
  is_resume: bool,
  cx: &RtLoweringContext,
) -> Result<LoweredProgram, RtCompileError> {
  let mut vars = vars;
  let stage = shader.stage;
  let shader = lower_rt_instructions(shader, &mut vars, cx)?;

  let mut shader = shader;
  let storage_locals;
  let storage = if stage == ShaderStage::Traversal || cx.mode == ExecutionMode::Monolithic {
    storage_locals = declare_hit_attrib_locals(&mut shader, cx.config.max_hit_attrib_slots);
    HitAttribStorage::Locals(&storage_locals)
  } else {
    HitAttribStorage::Shared {
      wave_size: cx.config.wave_size,
    }
  };
  let shader = lower_hit_attribs(shader, storage, cx.config.max_hit_attrib_slots)?;

  let name = shader.name.clone();
  let (mut b, body) = ShaderBuilder::from_shader(shader);
  vars.init_from_args(&mut b);

  let run_body = |b: &mut ShaderBuilder| {
    b.inlined_by(name.clone(), |b| {
      for instr in body {
        b.emit(instr);
      }
    });
    if returns_to_caller(stage) {
      let suspended = b.load_var(vars.suspended);
      let finished = b.inot(suspended);
      b.if_by(finished, |b| insert_rt_return(b, &vars, stage));
    }
  };

  let guarded = (stage != ShaderStage::RayGen || is_resume) && cx.mode == ExecutionMode::Indirect;
  if guarded {
    let uniform = b.load_arg(ShaderArg::UniformShaderAddr);
    let priority = b.imm_u64(rt_priority(stage));
    let expected = b.ior(uniform, priority);
    let current = b.load_var(vars.shader_addr);
    let elected = b.ieq(expected, current);
    b.if_by(elected, run_body);
  } else {
    run_body(&mut b);
  }

  match cx.mode {
    ExecutionMode::Indirect => {
      vars.store_to_args(&mut b);
      insert_select_next_shader(&mut b, &vars, stage);
    }
    ExecutionMode::Monolithic => b.terminate(),
  }

  let shader = lower_rt_late(b.finish(), &vars);
  let stack_size = vars.stack_size.max(shader.scratch_size);

  validate_shader(&shader).map_err(|source| RtCompileError::InvalidProgram {
    stage: shader.name.clone(),
    source,
  })?;
  trace!("{shader}");
  debug!("lower_rt_abi: {} needs {stack_size} stack bytes", shader.name);

  Ok(LoweredProgram {
    shader,
    vars,
    stack_size,
  })
}
