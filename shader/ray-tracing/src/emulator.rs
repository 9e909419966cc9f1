use crate::*;

/// First address handed out to compiled programs, far away from any memory allocation.
const PROGRAM_BASE_ADDRESS: u64 = 0x7fff_0000_0000;
const PROGRAM_ADDRESS_STRIDE: u64 = 64;

/// One program launch of a wave.
#[derive(Debug, Clone)]
pub struct DispatchTraceEntry {
  pub wave: usize,
  pub address: u64,
  pub program: usize,
  pub name: String,
  pub stage: ShaderStage,
  /// lanes still alive when the program was launched
  pub active: LaneMask,
  /// continuation stack pointer of each launched lane after the program ran
  pub stack_ptrs: Vec<Option<u32>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
  pub waves: usize,
  pub launches: usize,
}

/// Runs compiled pipelines on the wave interpreter the way a device dispatch loop would.
///
/// Every compiled program gets a fake code address. Indirect waves start with ray generation
/// and then keep launching whatever program the previous one elected until every lane has
/// terminated. Monolithic waves run their ray generation program once.
pub struct DispatchEmulator<'a> {
  pipeline: &'a CompiledRayTracingPipeline,
  programs: Vec<Shader>,
  addresses: Vec<u64>,
  by_address: FastHashMap<u64, usize>,
  memory: GlobalMemory,
  config: EmulatorConfig,
  unit: HardwareIntersectionUnit,
  trace: Vec<DispatchTraceEntry>,
}

impl<'a> DispatchEmulator<'a> {
  pub fn new(
    pipeline: &'a CompiledRayTracingPipeline,
    memory: GlobalMemory,
    config: EmulatorConfig,
  ) -> Result<Self, DispatchError> {
    let addresses: Vec<u64> = (0..pipeline.programs.len() as u64)
      .map(|i| PROGRAM_BASE_ADDRESS + i * PROGRAM_ADDRESS_STRIDE)
      .collect();
    let by_address = addresses.iter().enumerate().map(|(i, a)| (*a, i)).collect();

    let programs = pipeline
      .programs
      .iter()
      .map(|program| link_resume_addresses(&program.shader, pipeline, &addresses))
      .collect::<Result<Vec<_>, _>>()?;

    Ok(Self {
      pipeline,
      programs,
      addresses,
      by_address,
      memory,
      config,
      unit: HardwareIntersectionUnit,
      trace: Vec::new(),
    })
  }

  pub fn memory(&self) -> &GlobalMemory {
    &self.memory
  }

  pub fn memory_mut(&mut self) -> &mut GlobalMemory {
    &mut self.memory
  }

  pub fn into_memory(self) -> GlobalMemory {
    self.memory
  }

  pub fn trace(&self) -> &[DispatchTraceEntry] {
    &self.trace
  }

  pub fn clear_trace(&mut self) {
    self.trace.clear();
  }

  pub fn program_address(&self, program: usize) -> Option<u64> {
    self.addresses.get(program).copied()
  }

  /// The handle the application copies into the records of `group`.
  pub fn group_handle(&self, group: u32) -> Option<ShaderGroupHandle> {
    let indices = self.pipeline.group_handles.get(group as usize)?;
    let recursive_shader_ptr = self.pipeline.group_programs[group as usize]
      .map(|p| self.addresses[p] | rt_priority(self.pipeline.programs[p].stage))
      .unwrap_or(0);
    Some(ShaderGroupHandle {
      recursive_shader_ptr,
      general_or_closest_hit_index: indices.general_or_closest_hit,
      any_hit_or_intersection_index: indices.any_hit_or_intersection,
      padding: [0; 4],
    })
  }

  pub fn dispatch(
    &mut self,
    sbt: &ShaderBindingTableBuilder,
    launch_size: [u32; 3],
  ) -> Result<DispatchStats, DispatchError> {
    if !sbt.has_ray_generation() {
      return Err(DispatchError::MissingRayGenRecord(0));
    }
    let descriptor = sbt.write(&mut self.memory, launch_size);
    let raygen_record = self.memory.read_u64(descriptor)?;
    let entry = self.memory.read_u64(raygen_record)? & !RT_PRIORITY_MASK;

    let traversal_addr = self
      .pipeline
      .traversal_program
      .map(|p| self.addresses[p] | rt_priority(ShaderStage::Traversal))
      .unwrap_or(0);

    let wave_size = self.pipeline.wave_size as usize;
    let total = launch_size.iter().map(|s| *s as usize).product::<usize>();
    let mut stats = DispatchStats {
      waves: total.div_ceil(wave_size),
      launches: 0,
    };
    debug!(
      "dispatch {launch_size:?}: {} waves of {wave_size} lanes",
      stats.waves
    );

    for wave in 0..stats.waves {
      let mut state = WaveState::new(
        std::mem::take(&mut self.memory),
        wave_size,
        self.pipeline.stack_size as usize,
        self.pipeline.shared_size as usize,
      );

      let mut alive: LaneMask = 0;
      for (lane, args) in state.args.iter_mut().enumerate() {
        let id = wave * wave_size + lane;
        if id >= total {
          continue;
        }
        alive |= 1 << lane;
        let id = id as u32;
        let launch_id = [
          id % launch_size[0],
          (id / launch_size[0]) % launch_size[1],
          id / (launch_size[0] * launch_size[1]),
        ];
        args.set(ShaderArg::LaunchId, Value::UVec3(launch_id));
        args.set(ShaderArg::LaunchSize, Value::UVec3(launch_size));
        args.set(ShaderArg::SbtDescriptors, descriptor);
        args.set(ShaderArg::TraversalShaderAddr, traversal_addr);
        args.set(ShaderArg::StackPtr, 0u32);
        args.set(ShaderArg::ShaderAddr, entry);
      }

      let result = self.run_wave(wave, entry, alive, &mut state);
      self.memory = std::mem::take(&mut state.global);
      stats.launches += result?;
    }
    Ok(stats)
  }

  /// returns the number of launches
  fn run_wave(
    &mut self,
    wave: usize,
    entry: u64,
    mut alive: LaneMask,
    state: &mut WaveState,
  ) -> Result<usize, DispatchError> {
    let pipeline = self.pipeline;
    let mut address = entry;
    let mut launches = 0;

    while alive != 0 {
      if launches >= self.config.max_launches {
        return Err(DispatchError::LaunchLimit { wave, launches });
      }
      let program = *self
        .by_address
        .get(&address)
        .ok_or(InterpError::UnknownShaderAddress(address))?;
      let compiled = &pipeline.programs[program];
      trace!("wave {wave}: launch {} on lanes {alive:#x}", compiled.name);

      let (outcome, stack_ptrs) = {
        let mut interp = WaveInterpreter::new(&self.programs[program], state, &self.unit)
          .with_loop_limit(self.config.loop_limit);
        let outcome = interp.run(alive)?;
        let stack_ptrs: Vec<Option<u32>> = (0..pipeline.wave_size as usize)
          .map(|lane| {
            (alive & (1 << lane) != 0)
              .then(|| interp.variable_value(compiled.stack_ptr_var, lane))
              .flatten()
              .and_then(|v| v.as_u32().ok())
          })
          .collect();
        (outcome, stack_ptrs)
      };

      if self.config.record_trace {
        self.trace.push(DispatchTraceEntry {
          wave,
          address,
          program,
          name: compiled.name.clone(),
          stage: compiled.stage,
          active: alive,
          stack_ptrs,
        });
      }

      launches += 1;
      alive &= !outcome.terminated;
      if pipeline.mode == ExecutionMode::Monolithic || alive == 0 {
        break;
      }
      let lane = alive.trailing_zeros() as usize;
      address = state.args[lane].u64(ShaderArg::UniformShaderAddr);
    }
    Ok(launches)
  }
}

/// resume addresses are only known once every program has its address
fn link_resume_addresses(
  shader: &Shader,
  pipeline: &CompiledRayTracingPipeline,
  addresses: &[u64],
) -> Result<Shader, DispatchError> {
  let mut shader = shader.clone();
  let mut missing = None;
  shader.visit_instructions_mut(|instr| {
    let call_idx = match instr {
      Instr::Intrinsic {
        dst: Some(dst),
        op: Intrinsic::ResumeShaderAddress { call_idx },
        ..
      } => Some((*dst, *call_idx)),
      _ => None,
    };
    if let Some((dst, call_idx)) = call_idx {
      match pipeline.resume_programs.get(&call_idx) {
        Some(program) => {
          *instr = Instr::Const {
            dst,
            value: Value::U64(addresses[*program]),
          }
        }
        None => missing = Some(Intrinsic::ResumeShaderAddress { call_idx }),
      }
    }
  });
  match missing {
    Some(op) => Err(InterpError::Unlowered(op).into()),
    None => Ok(shader),
  }
}
