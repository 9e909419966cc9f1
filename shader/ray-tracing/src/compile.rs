use crate::*;

/// One program of a compiled pipeline.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
  pub name: String,
  pub stage: ShaderStage,
  /// index of the pipeline stage the program was compiled from, `None` for traversal
  pub source_stage: Option<u32>,
  /// call the program resumes after, `None` for entry programs
  pub resume_call_idx: Option<u32>,
  pub shader: Shader,
  pub stack_size: u32,
  pub stack_ptr_var: VariableId,
}

#[derive(Debug)]
pub struct CompiledRayTracingPipeline {
  pub mode: ExecutionMode,
  pub programs: Vec<CompiledProgram>,
  pub group_handles: Vec<GroupHandleIndices>,
  /// program index of the stage each group jumps to through its recursive pointer
  pub group_programs: Vec<Option<usize>>,
  pub traversal_program: Option<usize>,
  pub resume_programs: FastHashMap<u32, usize>,
  /// scratch bytes per lane for the deepest legal call chain
  pub stack_size: u32,
  pub shared_size: u32,
  pub wave_size: u32,
}

impl CompiledRayTracingPipeline {
  pub fn program_by_name(&self, name: &str) -> Option<&CompiledProgram> {
    self.programs.iter().find(|p| p.name == name)
  }

  /// entry program of a pipeline stage
  pub fn stage_program(&self, stage: u32) -> Option<usize> {
    self
      .programs
      .iter()
      .position(|p| p.source_stage == Some(stage) && p.resume_call_idx.is_none())
  }
}

fn traces_rays(shader: &Shader) -> bool {
  shader.count_intrinsics(|op| matches!(op, Intrinsic::TraceRay { .. })) > 0
}

fn intrinsic_allowed(stage: ShaderStage, op: &Intrinsic) -> bool {
  use ShaderStage::*;
  let caller = matches!(stage, RayGen | ClosestHit | Miss | Callable);
  match op {
    Intrinsic::TraceRay { .. } | Intrinsic::ExecuteCallable { .. } => caller,
    Intrinsic::ReportIntersection | Intrinsic::StoreHitAttrib { .. } => stage == Intersection,
    Intrinsic::IgnoreIntersection | Intrinsic::TerminateRay => stage == AnyHit,
    Intrinsic::LoadHitAttrib { .. } => matches!(stage, ClosestHit | AnyHit | Intersection),
    Intrinsic::HitKind | Intrinsic::PrimitiveId | Intrinsic::GeometryIndex => {
      matches!(stage, ClosestHit | AnyHit | Intersection)
    }
    Intrinsic::ExecuteClosestHit
    | Intrinsic::ExecuteMiss
    | Intrinsic::RtResume { .. }
    | Intrinsic::RtReturn
    | Intrinsic::ResumeShaderAddress { .. }
    | Intrinsic::RtArgScratchOffset => false,
    _ => true,
  }
}

fn check_stage_intrinsics(shader: &Shader) -> Result<(), RtCompileError> {
  let mut error = None;
  shader.visit_instructions(|instr| {
    if let Instr::Intrinsic { op, .. } = instr {
      if error.is_none() && !intrinsic_allowed(shader.stage, op) {
        error = Some(RtCompileError::UnsupportedIntrinsic {
          shader: shader.name.clone(),
          stage: shader.stage,
          intrinsic: *op,
        });
      }
    }
  });
  error.map_or(Ok(()), Err)
}

#[derive(Default)]
struct StageStackSizes {
  raygen: u32,
  chit_miss: u32,
  callable: u32,
  traversal: u32,
}

impl StageStackSizes {
  fn record(&mut self, stage: ShaderStage, size: u32) {
    let slot = match stage {
      ShaderStage::RayGen => &mut self.raygen,
      ShaderStage::ClosestHit | ShaderStage::Miss => &mut self.chit_miss,
      ShaderStage::Callable => &mut self.callable,
      _ => &mut self.traversal,
    };
    *slot = (*slot).max(size);
  }

  /// ray generation, then one traversal or hit frame per recursion level, plus two callables
  fn pipeline_stack_size(&self, max_recursion_depth: u32) -> u32 {
    let depth = max_recursion_depth;
    self.raygen
      + depth.min(1) * self.chit_miss.max(self.traversal)
      + depth.saturating_sub(1) * self.chit_miss
      + 2 * self.callable
  }
}

/// Compiles pipeline descriptors into dispatchable programs.
pub struct RayTracingPipelineCompiler {
  config: RtLoweringConfig,
}

impl RayTracingPipelineCompiler {
  pub fn new(config: RtLoweringConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &RtLoweringConfig {
    &self.config
  }

  pub fn compile(
    &self,
    pipeline: &RayTracingPipelineDescriptor,
    mode: ExecutionMode,
  ) -> Result<CompiledRayTracingPipeline, RtCompileError> {
    pipeline.validate()?;
    for shader in &pipeline.stages {
      check_stage_intrinsics(shader)?;
      if pipeline.max_recursion_depth == 0 && traces_rays(shader) {
        return Err(RtCompileError::RecursionDepthZero(shader.name.clone()));
      }
    }

    let cx = RtLoweringContext {
      pipeline,
      config: &self.config,
      mode,
    };
    let mut sizes = StageStackSizes::default();
    let mut programs = Vec::new();
    let mut traversal_program = None;

    match mode {
      ExecutionMode::Indirect => {
        let mut next_call_idx = 1;
        for (index, stage) in pipeline.stages.iter().enumerate() {
          if matches!(
            stage.stage,
            ShaderStage::AnyHit | ShaderStage::Intersection
          ) {
            continue;
          }
          for part in split_call_sites(stage, &mut next_call_idx) {
            let mut shader = lower_rt_io(part.shader);
            let vars = RtVariables::declare(&mut shader);
            let is_resume = part.resume_call_idx.is_some();
            let lowered = lower_rt_abi(shader, vars, is_resume, &cx)?;
            sizes.record(stage.stage, lowered.stack_size);
            programs.push(CompiledProgram::new(lowered, Some(index as u32), part.resume_call_idx));
          }
        }

        let (shader, vars) = build_traversal_shader(&cx)?;
        let lowered = lower_rt_abi(shader, vars, false, &cx)?;
        sizes.record(ShaderStage::Traversal, lowered.stack_size);
        traversal_program = Some(programs.len());
        programs.push(CompiledProgram::new(lowered, None, None));
      }
      ExecutionMode::Monolithic => {
        if pipeline.has_stage(ShaderStage::Callable) {
          return Err(RtCompileError::MonolithicUnsupported(
            "callable shaders need separate programs",
          ));
        }
        if pipeline.max_recursion_depth > 1 {
          return Err(RtCompileError::MonolithicUnsupported(
            "recursive tracing needs separate programs",
          ));
        }
        if !pipeline.stages.iter().any(traces_rays) {
          warn!("monolithic pipeline never traces rays");
        }
        for (index, stage) in pipeline.stages.iter().enumerate() {
          if stage.stage != ShaderStage::RayGen {
            continue;
          }
          let mut shader = lower_rt_io(stage.clone());
          let vars = RtVariables::declare(&mut shader);
          let lowered = lower_rt_abi(shader, vars, false, &cx)?;
          sizes.record(ShaderStage::RayGen, lowered.stack_size);
          programs.push(CompiledProgram::new(lowered, Some(index as u32), None));
        }
      }
    }

    let resume_programs = programs
      .iter()
      .enumerate()
      .filter_map(|(i, p)| p.resume_call_idx.map(|idx| (idx, i)))
      .collect();

    let mut compiled = CompiledRayTracingPipeline {
      mode,
      programs,
      group_handles: pipeline
        .groups
        .iter()
        .map(|g| pipeline.group_handle_indices(g))
        .collect(),
      group_programs: Vec::new(),
      traversal_program,
      resume_programs,
      stack_size: sizes.pipeline_stack_size(pipeline.max_recursion_depth),
      shared_size: self.config.shared_size(),
      wave_size: self.config.wave_size,
    };
    compiled.group_programs = pipeline
      .groups
      .iter()
      .map(|g| {
        pipeline
          .group_recursive_stage(g)
          .and_then(|stage| compiled.stage_program(stage))
      })
      .collect();

    info!(
      "compiled {:?} ray tracing pipeline: {} programs, {} stack bytes per lane",
      mode,
      compiled.programs.len(),
      compiled.stack_size
    );
    Ok(compiled)
  }
}

impl CompiledProgram {
  fn new(lowered: LoweredProgram, source_stage: Option<u32>, resume_call_idx: Option<u32>) -> Self {
    Self {
      name: lowered.shader.name.clone(),
      stage: lowered.shader.stage,
      source_stage,
      resume_call_idx,
      stack_ptr_var: lowered.vars.stack_ptr,
      stack_size: lowered.stack_size,
      shader: lowered.shader,
    }
  }
}
