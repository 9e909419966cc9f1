use crate::*;

fn ballot(b: &mut ShaderBuilder, cond: Node) -> Node {
  b.intrinsic(Intrinsic::Ballot, &[cond])
}

/// `ballot = candidate` when `candidate` has any lane set
fn prefer(b: &mut ShaderBuilder, ballot: Node, candidate: Node) -> Node {
  let zero = b.imm_u64(0);
  let any = b.ine(candidate, zero);
  b.bcsel(any, candidate, ballot)
}

/// Elects the program the whole wave runs next and publishes its address as
/// [`ShaderArg::UniformShaderAddr`].
///
/// Lanes waiting for a traversal win over the rest, hit and miss programs over traversals and
/// callables over everything, so nested work drains before new work starts. Which priorities
/// are considered depends on what the current program can have produced.
pub fn insert_select_next_shader(b: &mut ShaderBuilder, vars: &RtVariables, stage: ShaderStage) {
  let address = b.load_var(vars.shader_addr);
  let priority = b.iand_imm64(address, RT_PRIORITY_MASK);
  let priority = b.to_u32(priority);

  let all = b.imm_bool(true);
  let mut selected = ballot(b, all);

  if !matches!(stage, ShaderStage::Callable | ShaderStage::Traversal) {
    let traversal = b.ieq_imm(priority, rt_priority(ShaderStage::Traversal) as u32);
    let traversal = ballot(b, traversal);
    selected = prefer(b, selected, traversal);
  }
  if stage != ShaderStage::RayGen {
    let hit_miss = b.ieq_imm(priority, rt_priority(ShaderStage::ClosestHit) as u32);
    let hit_miss = ballot(b, hit_miss);
    selected = prefer(b, selected, hit_miss);
  }
  if stage != ShaderStage::Traversal {
    let callable = b.ieq_imm(priority, rt_priority(ShaderStage::Callable) as u32);
    let callable = ballot(b, callable);
    selected = prefer(b, selected, callable);
  }

  let lane = b.alu(AluOp::FindLsb, &[selected]);
  let next = b.intrinsic(Intrinsic::ReadInvocation, &[address, lane]);
  let next = b.iand_imm64(next, !RT_PRIORITY_MASK);
  b.store_arg(ShaderArg::UniformShaderAddr, next);
}

/// The election of [`insert_select_next_shader`] over the shader addresses of a wave, `None`
/// for lanes that are not active. Returns the elected lane.
pub fn select_next_lane(stage: ShaderStage, lanes: &[Option<u64>]) -> Option<usize> {
  let ballot = |priority: u64| -> u64 {
    lanes
      .iter()
      .enumerate()
      .filter(|(_, addr)| addr.is_some_and(|a| a & RT_PRIORITY_MASK == priority))
      .fold(0, |mask, (lane, _)| mask | 1 << lane)
  };
  let prefer = |selected: u64, candidate: u64| if candidate != 0 { candidate } else { selected };

  let mut selected = lanes
    .iter()
    .enumerate()
    .filter(|(_, addr)| addr.is_some())
    .fold(0u64, |mask, (lane, _)| mask | 1 << lane);

  if !matches!(stage, ShaderStage::Callable | ShaderStage::Traversal) {
    selected = prefer(selected, ballot(rt_priority(ShaderStage::Traversal)));
  }
  if stage != ShaderStage::RayGen {
    selected = prefer(selected, ballot(rt_priority(ShaderStage::ClosestHit)));
  }
  if stage != ShaderStage::Traversal {
    selected = prefer(selected, ballot(rt_priority(ShaderStage::Callable)));
  }

  (selected != 0).then(|| selected.trailing_zeros() as usize)
}

/// untagged address of the program [`select_next_lane`] elects
pub fn select_next_shader_addr(stage: ShaderStage, lanes: &[Option<u64>]) -> Option<u64> {
  let lane = select_next_lane(stage, lanes)?;
  lanes[lane].map(|addr| addr & !RT_PRIORITY_MASK)
}
