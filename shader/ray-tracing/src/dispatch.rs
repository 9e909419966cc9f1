use crate::*;

/// Appends the constant data of `src` to `dst` and rebases every constant load of `src`.
pub fn inline_constants(dst: &mut Shader, src: &mut Shader) {
  if src.constant_data.is_empty() {
    return;
  }
  let base = align_up(dst.constant_data.len() as u32, 64);
  dst.constant_data.resize(base as usize, 0);
  dst.constant_data.extend_from_slice(&src.constant_data);

  if base == 0 {
    return;
  }
  let base_align = 1 << base.trailing_zeros();
  src.visit_instructions_mut(|instr| {
    if let Instr::Intrinsic {
      op: Intrinsic::LoadConstant {
        base: load_base,
        align,
        ..
      },
      ..
    } = instr
    {
      *load_base += base;
      *align = (*align).min(base_align);
    }
  });
}

/// A callee lowered against its own variables, ready to be spliced.
pub struct PreparedCase {
  pub call_idx: u32,
  pub shader: Shader,
  pub vars: RtVariables,
}

fn prepare_case(
  b: &mut ShaderBuilder,
  case: &GroupCase,
  cx: &RtLoweringContext,
) -> Result<PreparedCase, RtCompileError> {
  let stage = cx
    .pipeline
    .stage(case.stage)
    .ok_or(RtCompileError::StageOutOfRange {
      group: 0,
      stage: case.stage,
      count: cx.pipeline.stages.len(),
    })?;
  let mut shader = stage.clone();

  if let Some(any_hit) = case.any_hit {
    let any_hit = cx
      .pipeline
      .stage(any_hit)
      .ok_or(RtCompileError::StageOutOfRange {
        group: 0,
        stage: any_hit,
        count: cx.pipeline.stages.len(),
      })?;
    shader = lower_intersection_shader(shader, any_hit);
  }

  let mut shader = lower_rt_io(shader);
  let mut vars = RtVariables::declare(&mut shader);
  let mut shader = lower_rt_instructions(shader, &mut vars, cx)?;
  inline_constants(b.shader_mut(), &mut shader);

  Ok(PreparedCase {
    call_idx: case.call_idx,
    shader,
    vars,
  })
}

/// Splices the callee as an inlined region with its variables bound onto `vars`.
pub fn insert_rt_case(b: &mut ShaderBuilder, case: &PreparedCase, vars: &RtVariables) {
  b.inline_shader(
    &case.shader,
    &InlineBinding {
      variables: vars.bind_callee(&case.vars),
      params: &[],
    },
  );
}

fn insert_inlined_range(
  b: &mut ShaderBuilder,
  index: Node,
  cases: &[PreparedCase],
  vars: &RtVariables,
  bsearch_threshold: usize,
) {
  if cases.len() >= bsearch_threshold.max(2) {
    let mid = cases.len() / 2;
    let upper = b.uge_imm(index, cases[mid].call_idx);
    b.if_by(upper, |b| {
      insert_inlined_range(b, index, &cases[mid..], vars, bsearch_threshold)
    })
    .else_by(b, |b| {
      insert_inlined_range(b, index, &cases[..mid], vars, bsearch_threshold)
    });
  } else {
    for case in cases {
      let hit = b.ieq_imm(index, case.call_idx);
      b.if_by(hit, |b| insert_rt_case(b, case, vars));
    }
  }
}

/// Every case of one inlined dispatch site, lowered up front so emitting them cannot fail.
pub struct InlinedDispatch {
  pub kind: InlineCaseKind,
  pub cases: Vec<PreparedCase>,
  bsearch_threshold: usize,
  null_check_threshold: usize,
}

/// Collects and lowers the `kind` case of every group.
///
/// Groups sharing a handle index share one case. The cases are sorted by call index.
pub fn prepare_inlined_shaders(
  b: &mut ShaderBuilder,
  kind: InlineCaseKind,
  cx: &RtLoweringContext,
) -> Result<InlinedDispatch, RtCompileError> {
  let mut cases: Vec<GroupCase> = Vec::new();
  for group in &cx.pipeline.groups {
    let Some(case) = kind.group_case(cx.pipeline, group) else {
      continue;
    };
    if cases.iter().any(|c| c.call_idx == case.call_idx) {
      continue;
    }
    cases.push(case);
  }
  cases.sort_by_key(|c| c.call_idx);

  let cases = cases
    .iter()
    .map(|case| prepare_case(b, case, cx))
    .collect::<Result<Vec<_>, _>>()?;

  Ok(InlinedDispatch {
    kind,
    cases,
    bsearch_threshold: cx.config.bsearch_threshold,
    null_check_threshold: cx.config.null_check_threshold,
  })
}

impl InlinedDispatch {
  /// scratch the cases need above the current frame
  pub fn stack_size(&self) -> u32 {
    self
      .cases
      .iter()
      .map(|case| case.shader.scratch_size.max(case.vars.stack_size))
      .max()
      .unwrap_or(0)
  }

  /// Emits `switch (index) { case call_idx: <inlined stage> }`.
  ///
  /// The selection turns into a binary search once there are enough cases, a possibly null
  /// index is tested first when there are more cases than the null check threshold.
  pub fn emit(&self, b: &mut ShaderBuilder, index: Node, can_have_null: bool, vars: &RtVariables) {
    if self.cases.is_empty() {
      return;
    }
    let threshold = self.bsearch_threshold;
    if can_have_null && self.cases.len() >= self.null_check_threshold {
      let non_null = b.ine_imm(index, 0);
      b.if_by(non_null, |b| {
        insert_inlined_range(b, index, &self.cases, vars, threshold)
      });
    } else {
      insert_inlined_range(b, index, &self.cases, vars, threshold);
    }

    trace!(
      "inlined {} {:?} cases into {}",
      self.cases.len(),
      self.kind,
      b.shader().name
    );
  }
}
