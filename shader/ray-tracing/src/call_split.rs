use crate::*;

/// One separately compiled program of a stage.
pub struct ShaderPart {
  pub shader: Shader,
  /// the call site this part continues after, `None` for the stage entry
  pub resume_call_idx: Option<u32>,
}

fn is_call(instr: &Instr) -> bool {
  matches!(
    instr,
    Instr::Intrinsic {
      op: Intrinsic::TraceRay { .. } | Intrinsic::ExecuteCallable { .. },
      ..
    }
  )
}

fn contains_call(block: &[Instr]) -> bool {
  block.iter().any(|instr| match instr {
    Instr::If {
      then_block,
      else_block,
      ..
    } => contains_call(then_block) || contains_call(else_block),
    Instr::Loop { body } | Instr::Inlined { body, .. } => contains_call(body),
    other => is_call(other),
  })
}

/// whether some call sits inside an inlined region
fn region_holds_call(block: &[Instr]) -> bool {
  block.iter().any(|instr| match instr {
    Instr::If {
      then_block,
      else_block,
      ..
    } => region_holds_call(then_block) || region_holds_call(else_block),
    Instr::Loop { body } => region_holds_call(body),
    Instr::Inlined { body, .. } => contains_call(body),
    _ => false,
  })
}

/// visits control flow instructions too, unlike [`visit_block`]
fn walk(block: &[Instr], f: &mut impl FnMut(&Instr)) {
  for instr in block {
    f(instr);
    match instr {
      Instr::If {
        then_block,
        else_block,
        ..
      } => {
        walk(then_block, f);
        walk(else_block, f);
      }
      Instr::Loop { body } | Instr::Inlined { body, .. } => walk(body, f),
      _ => {}
    }
  }
}

/// Child indices leading from the program body to a call. An `if` contributes its own index
/// followed by 0 for the then block or 1 for the else block.
type CallPath = Vec<usize>;

fn collect_call_paths(block: &[Instr], prefix: &mut CallPath, paths: &mut Vec<CallPath>) {
  for (i, instr) in block.iter().enumerate() {
    prefix.push(i);
    match instr {
      Instr::If {
        then_block,
        else_block,
        ..
      } => {
        for (branch, block) in [then_block, else_block].into_iter().enumerate() {
          prefix.push(branch);
          collect_call_paths(block, prefix, paths);
          prefix.pop();
        }
      }
      Instr::Loop { body } | Instr::Inlined { body, .. } => collect_call_paths(body, prefix, paths),
      other if is_call(other) => paths.push(prefix.clone()),
      _ => {}
    }
    prefix.pop();
  }
}

/// Emits the code that runs right after the call at `path`.
///
/// An enclosing `if` collapses into the branch holding the call, an enclosing region is kept
/// so its returns stay local. An enclosing loop first finishes the interrupted iteration, the
/// following iterations run a fresh copy of the whole body.
fn emit_resumed(b: &mut ShaderBuilder, block: &[Instr], path: &[usize]) {
  let Some((&index, rest)) = path.split_first() else {
    return;
  };
  match &block[index] {
    Instr::If {
      then_block,
      else_block,
      ..
    } => {
      if let Some((&branch, rest)) = rest.split_first() {
        let taken = if branch == 0 { then_block } else { else_block };
        emit_resumed(b, taken, rest);
      }
    }
    Instr::Loop { body } => {
      let first = b.make_local_var("resume.first_iteration", Value::Bool(true));
      b.loop_by(|b| {
        let interrupted = b.load_var(first);
        b.store_imm(first, false);
        b.if_by(interrupted, |b| emit_resumed(b, body, rest))
          .else_by(b, |b| {
            for instr in b.fresh_copy(body) {
              b.emit(instr);
            }
          });
      });
    }
    Instr::Inlined { name, body } => b.inlined_by(name.clone(), |b| emit_resumed(b, body, rest)),
    _ => {}
  }
  for instr in &block[index + 1..] {
    b.emit(instr.clone());
  }
}

/// A call always leaves the program, nothing after a top level call is reachable.
fn drop_after_first_call(mut body: Block) -> Block {
  if let Some(position) = body.iter().position(is_call) {
    body.truncate(position + 1);
  }
  body
}

fn empty_copy(shader: &Shader) -> Shader {
  Shader {
    name: shader.name.clone(),
    stage: shader.stage,
    variables: shader.variables.clone(),
    body: Vec::new(),
    node_count: shader.node_count,
    scratch_size: shader.scratch_size,
    constant_data: shader.constant_data.clone(),
    params: shader.params.clone(),
  }
}

/// nodes the resumed code reads without defining them first, these must survive the call
fn resume_inputs(instrumented: &Shader, path: &[usize]) -> Vec<Node> {
  let (mut b, _) = ShaderBuilder::from_shader(empty_copy(instrumented));
  emit_resumed(&mut b, &instrumented.body, path);
  let resumed = drop_after_first_call(b.finish().body);

  let mut defined = FastHashSet::default();
  let mut used = FastHashSet::default();
  walk(&resumed, &mut |instr| {
    if let Some(dst) = instr.dst() {
      defined.insert(dst);
    }
    used.extend(instr.srcs().iter().copied());
  });
  let mut inputs: Vec<Node> = used.difference(&defined).copied().collect();
  inputs.sort();
  inputs
}

enum SpillSlot {
  Node(Node, ValueType, u32),
  Variable(VariableId, ValueType, u32),
}

struct SpillLayout {
  slots: Vec<SpillSlot>,
  size: u32,
}

impl SpillLayout {
  fn new(shader: &Shader, types: &[Option<ValueType>], live: &[Node], base: u32) -> Self {
    let mut offset = base;
    let mut slots = Vec::new();
    for node in live {
      match types.get(node.0 as usize).copied().flatten() {
        Some(ty) => {
          slots.push(SpillSlot::Node(*node, ty, offset));
          offset += align_up(ty.byte_size(), 4);
        }
        None => warn!(
          "{}: %{} lives across a call but has no known type",
          shader.name, node.0
        ),
      }
    }
    for (i, decl) in shader.variables.iter().enumerate() {
      slots.push(SpillSlot::Variable(VariableId(i as u32), decl.ty, offset));
      offset += align_up(decl.ty.byte_size(), 4);
    }
    Self {
      slots,
      size: offset - base,
    }
  }

  fn store(&self, b: &mut ShaderBuilder) {
    let store = |b: &mut ShaderBuilder, value: Node, offset: u32| {
      let address = b.imm_u32(offset);
      b.intrinsic_void(
        Intrinsic::StoreScratch {
          base: ScratchBase::Frame,
        },
        &[value, address],
      );
    };
    for slot in &self.slots {
      match *slot {
        SpillSlot::Node(node, _, offset) => store(b, node, offset),
        SpillSlot::Variable(var, _, offset) => {
          let value = b.load_var(var);
          store(b, value, offset);
        }
      }
    }
  }

  /// reloads define the spilled nodes again so the code after the call reads them unchanged
  fn reload(&self, b: &mut ShaderBuilder) {
    for slot in &self.slots {
      match *slot {
        SpillSlot::Node(node, ty, offset) => {
          let address = b.imm_u32(offset);
          b.emit(Instr::Intrinsic {
            dst: Some(node),
            op: Intrinsic::LoadScratch {
              ty,
              base: ScratchBase::Frame,
            },
            srcs: [address].into_iter().collect(),
          });
        }
        SpillSlot::Variable(var, ty, offset) => {
          let address = b.imm_u32(offset);
          let value = b.intrinsic(
            Intrinsic::LoadScratch {
              ty,
              base: ScratchBase::Frame,
            },
            &[address],
          );
          b.store_var(var, value);
        }
      }
    }
  }
}

fn with_call_site(instr: &Instr, call_idx: u32, stack_size: u32) -> Instr {
  let mut instr = instr.clone();
  if let Instr::Intrinsic { op, .. } = &mut instr {
    match op {
      Intrinsic::TraceRay {
        call_idx: idx,
        stack_size: size,
      }
      | Intrinsic::ExecuteCallable {
        call_idx: idx,
        stack_size: size,
      } => {
        *idx = call_idx;
        *size = stack_size;
      }
      _ => {}
    }
  }
  instr
}

/// Re-emits a program with the spill stores in front of every call and numbered call sites.
struct CallSiteEmitter<'a> {
  layouts: &'a [SpillLayout],
  call_indices: &'a [u32],
  frame: u32,
  /// set before a call inside a region, the region's parent returns as well when it is set
  suspended_in_region: Option<VariableId>,
  next: usize,
}

impl CallSiteEmitter<'_> {
  fn emit(&mut self, b: &mut ShaderBuilder, block: &[Instr], in_region: bool) {
    for instr in block {
      match instr {
        Instr::If {
          cond,
          then_block,
          else_block,
        } => {
          b.if_by(*cond, |b| self.emit(b, then_block, in_region))
            .else_by(b, |b| self.emit(b, else_block, in_region));
        }
        Instr::Loop { body } => b.loop_by(|b| self.emit(b, body, in_region)),
        Instr::Inlined { name, body } => {
          b.inlined_by(name.clone(), |b| self.emit(b, body, true));
          if let (true, Some(flag)) = (contains_call(body), self.suspended_in_region) {
            let suspended = b.load_var(flag);
            b.if_by(suspended, |b| b.do_return());
          }
        }
        call if is_call(call) => {
          let site = self.next;
          self.next += 1;
          self.layouts[site].store(b);
          if let (true, Some(flag)) = (in_region, self.suspended_in_region) {
            b.store_imm(flag, true);
          }
          b.emit(with_call_site(call, self.call_indices[site], self.frame));
        }
        other => b.emit(other.clone()),
      }
    }
  }
}

fn instrument_call_sites(
  shader: &Shader,
  layouts: &[SpillLayout],
  call_indices: &[u32],
  frame: u32,
) -> Shader {
  let mut header = empty_copy(shader);
  header.scratch_size = frame;
  let (mut b, _) = ShaderBuilder::from_shader(header);
  let suspended_in_region = region_holds_call(&shader.body)
    .then(|| b.make_variable("suspended_in_region", ValueType::Bool));
  CallSiteEmitter {
    layouts,
    call_indices,
    frame,
    suspended_in_region,
    next: 0,
  }
  .emit(&mut b, &shader.body, false);
  b.finish()
}

/// Splits `shader` at every call site into the entry program and one resume program per call.
///
/// Calls may sit anywhere in the structured control flow. Each resume program reloads what the
/// code after its call reads and then continues inside the same ifs, loops and regions the call
/// was made from. Values and variables live across a call are spilled to frame scratch right
/// after the program's own scratch. Every part shares the resulting frame size so the call
/// protocol and `rt_resume` agree on it. Call indices are taken from `next_call_idx` in program
/// order.
pub fn split_call_sites(shader: &Shader, next_call_idx: &mut u32) -> Vec<ShaderPart> {
  let mut source_paths = Vec::new();
  collect_call_paths(&shader.body, &mut Vec::new(), &mut source_paths);
  if source_paths.is_empty() {
    return vec![ShaderPart {
      shader: shader.clone(),
      resume_call_idx: None,
    }];
  }

  let call_indices: Vec<u32> = source_paths
    .iter()
    .map(|_| {
      let idx = *next_call_idx;
      *next_call_idx += 1;
      idx
    })
    .collect();

  let types = infer_node_types(shader);
  let spill_base = align_up(shader.scratch_size, 4);

  // spill stores read live values themselves, grow the live sets until they are stable
  let mut live: Vec<Vec<Node>> = vec![Vec::new(); call_indices.len()];
  let (instrumented, layouts, paths, frame) = loop {
    let layouts: Vec<SpillLayout> = live
      .iter()
      .map(|nodes| SpillLayout::new(shader, &types, nodes, spill_base))
      .collect();
    let frame = spill_base + layouts.iter().map(|l| l.size).max().unwrap_or(0);
    let instrumented = instrument_call_sites(shader, &layouts, &call_indices, frame);

    let mut paths = Vec::new();
    collect_call_paths(&instrumented.body, &mut Vec::new(), &mut paths);
    let grown: Vec<Vec<Node>> = paths
      .iter()
      .map(|path| resume_inputs(&instrumented, path))
      .collect();
    if grown == live {
      break (instrumented, layouts, paths, frame);
    }
    live = grown;
  };

  let mut parts = Vec::with_capacity(paths.len() + 1);
  let mut entry = empty_copy(&instrumented);
  entry.body = drop_after_first_call(instrumented.body.clone());
  parts.push(ShaderPart {
    shader: entry,
    resume_call_idx: None,
  });

  for ((path, layout), idx) in paths.iter().zip(&layouts).zip(&call_indices) {
    let mut header = empty_copy(&instrumented);
    header.name = format!("{}.resume{idx}", shader.name);
    let (mut b, _) = ShaderBuilder::from_shader(header);
    b.intrinsic_void(Intrinsic::RtResume { stack_size: frame }, &[]);
    layout.reload(&mut b);
    emit_resumed(&mut b, &instrumented.body, path);
    let mut resumed = b.finish();
    resumed.body = drop_after_first_call(resumed.body);
    parts.push(ShaderPart {
      shader: resumed,
      resume_call_idx: Some(*idx),
    });
  }

  debug!(
    "split {} into {} parts, frame {frame} bytes",
    shader.name,
    parts.len()
  );
  parts
}
