use crate::*;

mod alu;
pub use alu::*;
mod memory;
pub use memory::*;

pub type LaneMask = u64;
pub const MAX_WAVE_SIZE: usize = 64;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum InterpError {
  #[error("alu {op:?} does not accept operands {operands:?}")]
  AluOperands {
    op: AluOp,
    operands: Vec<ValueType>,
  },
  #[error("expected a {expected:?} value, found {found:?}")]
  TypeMismatch {
    expected: ValueType,
    found: ValueType,
  },
  #[error("global access at {addr:#x} ({len} bytes) is not mapped")]
  UnmappedGlobal { addr: u64, len: usize },
  #[error("scratch access at {offset:#x} ({len} bytes) exceeds the lane scratch of {size} bytes")]
  ScratchOutOfBounds { offset: u32, len: usize, size: usize },
  #[error("shared memory access at {offset:#x} ({len} bytes) is out of bounds")]
  SharedOutOfBounds { offset: u32, len: usize },
  #[error("constant load at {offset:#x} is out of bounds")]
  ConstantOutOfBounds { offset: u32 },
  #[error("intrinsic {0:?} must be lowered before execution")]
  Unlowered(Intrinsic),
  #[error("loop exceeded {0} iterations")]
  LoopLimit(u64),
  #[error("integer division by zero")]
  DivisionByZero,
  #[error("shader address {0:#x} does not name a program")]
  UnknownShaderAddress(u64),
  #[error("wave of {0} lanes exceeds the supported width")]
  WaveTooWide(usize),
}

/// The fixed function ray/node intersection unit, the node memory layout is owned by the
/// implementor.
pub trait RayIntersectionUnit {
  fn intersect_box_node(
    &self,
    memory: &GlobalMemory,
    node_address: u64,
    ray: &NodeRay,
  ) -> Result<[u32; 4], InterpError>;

  fn intersect_triangle_node(
    &self,
    memory: &GlobalMemory,
    node_address: u64,
    ray: &NodeRay,
  ) -> Result<[f32; 4], InterpError>;
}

#[derive(Debug, Clone, Copy)]
pub struct NodeRay {
  pub tmin: f32,
  pub tmax: f32,
  pub origin: [f32; 3],
  pub direction: [f32; 3],
  pub inverse_direction: [f32; 3],
}

pub struct NoIntersectionUnit;

impl RayIntersectionUnit for NoIntersectionUnit {
  fn intersect_box_node(
    &self,
    _: &GlobalMemory,
    _: u64,
    _: &NodeRay,
  ) -> Result<[u32; 4], InterpError> {
    Err(InterpError::Unlowered(Intrinsic::IntersectBoxNode))
  }
  fn intersect_triangle_node(
    &self,
    _: &GlobalMemory,
    _: u64,
    _: &NodeRay,
  ) -> Result<[f32; 4], InterpError> {
    Err(InterpError::Unlowered(Intrinsic::IntersectTriangleNode))
  }
}

#[derive(Default)]
struct LoopFrame {
  broken: LaneMask,
  continued: LaneMask,
}

/// Executes one program for a whole wavefront in lockstep.
///
/// Divergence is tracked with lane masks: each block runs with the set of lanes that reach it,
/// `break`/`continue`/`return` park lanes on the innermost loop or region until it completes.
pub struct WaveInterpreter<'a> {
  shader: &'a Shader,
  state: &'a mut WaveState,
  unit: &'a dyn RayIntersectionUnit,
  nodes: Vec<Vec<Value>>,
  vars: Vec<Vec<Value>>,
  loops: Vec<LoopFrame>,
  regions: Vec<LaneMask>,
  terminated: LaneMask,
  loop_limit: u64,
}

pub struct WaveOutcome {
  /// lanes that reached the end of the program
  pub finished: LaneMask,
  /// lanes that executed `terminate`
  pub terminated: LaneMask,
}

impl<'a> WaveInterpreter<'a> {
  pub fn new(
    shader: &'a Shader,
    state: &'a mut WaveState,
    unit: &'a dyn RayIntersectionUnit,
  ) -> Self {
    let lanes = state.lane_count();
    Self {
      shader,
      state,
      unit,
      nodes: vec![vec![Value::U32(0); lanes]; shader.node_count as usize],
      vars: shader
        .variables
        .iter()
        .map(|v| vec![v.ty.zeroed(); lanes])
        .collect(),
      loops: Vec::new(),
      regions: Vec::new(),
      terminated: 0,
      loop_limit: 1 << 20,
    }
  }

  pub fn with_loop_limit(mut self, limit: u64) -> Self {
    self.loop_limit = limit;
    self
  }

  pub fn run(&mut self, active: LaneMask) -> Result<WaveOutcome, InterpError> {
    let lanes = self.state.lane_count();
    if lanes > MAX_WAVE_SIZE {
      return Err(InterpError::WaveTooWide(lanes));
    }
    let all = if lanes == MAX_WAVE_SIZE {
      LaneMask::MAX
    } else {
      (1 << lanes) - 1
    };

    let shader = self.shader;
    self.regions.push(0);
    let fell_through = self.exec_block(&shader.body, active & all)?;
    let returned = self.regions.pop().unwrap_or_default();
    Ok(WaveOutcome {
      finished: (fell_through | returned) & !self.terminated,
      terminated: self.terminated,
    })
  }

  /// read a variable of one lane after the run, useful for inspection in tests
  pub fn variable_value(&self, var: VariableId, lane: usize) -> Option<Value> {
    self.vars.get(var.0 as usize)?.get(lane).copied()
  }

  fn lanes(mask: LaneMask) -> impl Iterator<Item = usize> {
    (0..MAX_WAVE_SIZE).filter(move |l| mask & (1 << l) != 0)
  }

  fn value(&self, node: Node, lane: usize) -> Value {
    self.nodes[node.0 as usize][lane]
  }

  fn set(&mut self, node: Node, lane: usize, value: Value) {
    self.nodes[node.0 as usize][lane] = value;
  }

  fn exec_block(
    &mut self,
    block: &'a [Instr],
    mut active: LaneMask,
  ) -> Result<LaneMask, InterpError> {
    for instr in block {
      if active == 0 {
        break;
      }
      match instr {
        Instr::Const { dst, value } => {
          for lane in Self::lanes(active) {
            self.set(*dst, lane, *value);
          }
        }
        Instr::Alu { dst, op, srcs } => {
          for lane in Self::lanes(active) {
            let operands: SmallVec<[Value; 4]> =
              srcs.iter().map(|s| self.value(*s, lane)).collect();
            let result = eval_alu(*op, &operands)?;
            self.set(*dst, lane, result);
          }
        }
        Instr::LoadVar { dst, var } => {
          for lane in Self::lanes(active) {
            let v = self.vars[var.0 as usize][lane];
            self.set(*dst, lane, v);
          }
        }
        Instr::StoreVar { var, src } => {
          for lane in Self::lanes(active) {
            self.vars[var.0 as usize][lane] = self.value(*src, lane);
          }
        }
        Instr::Intrinsic { dst, op, srcs } => self.exec_intrinsic(*dst, *op, srcs, active)?,
        Instr::If {
          cond,
          then_block,
          else_block,
        } => {
          let mut taken = 0;
          for lane in Self::lanes(active) {
            if self.value(*cond, lane).as_bool()? {
              taken |= 1 << lane;
            }
          }
          let then_active = self.exec_block(then_block, active & taken)?;
          let else_active = self.exec_block(else_block, active & !taken)?;
          active = then_active | else_active;
        }
        Instr::Loop { body } => {
          self.loops.push(LoopFrame::default());
          let mut iteration = active;
          let mut count = 0;
          while iteration != 0 {
            count += 1;
            if count > self.loop_limit {
              return Err(InterpError::LoopLimit(self.loop_limit));
            }
            let fell_through = self.exec_block(body, iteration)?;
            let continued = self
              .loops
              .last_mut()
              .map(|frame| std::mem::take(&mut frame.continued))
              .unwrap_or_default();
            iteration = fell_through | continued;
          }
          active = self.loops.pop().map(|f| f.broken).unwrap_or_default();
        }
        Instr::Inlined { body, .. } => {
          // loops of the caller are not reachable from inside the region
          let outer_loops = std::mem::take(&mut self.loops);
          self.regions.push(0);
          let fell_through = self.exec_block(body, active)?;
          let returned = self.regions.pop().unwrap_or_default();
          self.loops = outer_loops;
          active = fell_through | returned;
        }
        Instr::Break => {
          if let Some(frame) = self.loops.last_mut() {
            frame.broken |= active;
          }
          active = 0;
        }
        Instr::Continue => {
          if let Some(frame) = self.loops.last_mut() {
            frame.continued |= active;
          }
          active = 0;
        }
        Instr::Return => {
          if let Some(region) = self.regions.last_mut() {
            *region |= active;
          }
          active = 0;
        }
        Instr::Terminate => {
          self.terminated |= active;
          active = 0;
        }
      }
    }
    Ok(active)
  }

  fn exec_intrinsic(
    &mut self,
    dst: Option<Node>,
    op: Intrinsic,
    srcs: &[Node],
    active: LaneMask,
  ) -> Result<(), InterpError> {
    // wave wide operations first, they need every lane's operand
    match op {
      Intrinsic::Ballot => {
        let mut ballot = 0u64;
        for lane in Self::lanes(active) {
          if self.value(srcs[0], lane).as_bool()? {
            ballot |= 1 << lane;
          }
        }
        if let Some(dst) = dst {
          for lane in Self::lanes(active) {
            self.set(dst, lane, Value::U64(ballot));
          }
        }
        return Ok(());
      }
      Intrinsic::ReadInvocation => {
        if let Some(dst) = dst {
          for lane in Self::lanes(active) {
            let source = self.value(srcs[1], lane).as_u32()? as usize;
            let v = self.value(srcs[0], source.min(MAX_WAVE_SIZE - 1));
            self.set(dst, lane, v);
          }
        }
        return Ok(());
      }
      _ => {}
    }

    for lane in Self::lanes(active) {
      let operand = |i: usize| self.value(srcs[i], lane);
      let result = match op {
        Intrinsic::LoadScratch {
          ty,
          base: ScratchBase::Absolute,
        } => Some(self.state.read_scratch(lane, ty, operand(0).as_u32()?)?),
        Intrinsic::StoreScratch {
          base: ScratchBase::Absolute,
        } => {
          let (value, offset) = (operand(0), operand(1).as_u32()?);
          self.state.write_scratch(lane, offset, value)?;
          None
        }
        Intrinsic::LoadConstant { ty, base, .. } => {
          let offset = base + operand(0).as_u32()?;
          let start = offset as usize;
          let end = start + ty.byte_size() as usize;
          let bytes = self
            .shader
            .constant_data
            .get(start..end)
            .ok_or(InterpError::ConstantOutOfBounds { offset })?;
          Some(Value::from_bytes(ty, bytes))
        }
        Intrinsic::LoadGlobal { ty } => {
          Some(self.state.global.read_value(ty, operand(0).as_u64()?)?)
        }
        Intrinsic::StoreGlobal => {
          let (value, addr) = (operand(0), operand(1).as_u64()?);
          self.state.global.write_value(addr, value)?;
          None
        }
        Intrinsic::LoadShared { ty } => Some(self.state.read_shared(ty, operand(0).as_u32()?)?),
        Intrinsic::StoreShared => {
          let (value, offset) = (operand(0), operand(1).as_u32()?);
          self.state.write_shared(offset, value)?;
          None
        }
        Intrinsic::LoadArg(arg) => Some(self.state.args[lane].get(arg)),
        Intrinsic::StoreArg(arg) => {
          let value = operand(0);
          self.state.args[lane].set(arg, value);
          None
        }
        Intrinsic::LocalInvocationIndex => Some(Value::U32(lane as u32)),
        Intrinsic::IntersectBoxNode => {
          let ray = self.node_ray(srcs, lane)?;
          let address = operand(0).as_u64()?;
          let children = self.unit.intersect_box_node(&self.state.global, address, &ray)?;
          Some(Value::UVec4(children))
        }
        Intrinsic::IntersectTriangleNode => {
          let ray = self.node_ray(srcs, lane)?;
          let address = operand(0).as_u64()?;
          let hit = self.unit.intersect_triangle_node(&self.state.global, address, &ray)?;
          Some(Value::Vec4(hit))
        }
        other => return Err(InterpError::Unlowered(other)),
      };

      if let (Some(dst), Some(result)) = (dst, result) {
        self.set(dst, lane, result);
      }
    }
    Ok(())
  }

  fn node_ray(&self, srcs: &[Node], lane: usize) -> Result<NodeRay, InterpError> {
    Ok(NodeRay {
      tmin: self.value(srcs[1], lane).as_f32()?,
      tmax: self.value(srcs[2], lane).as_f32()?,
      origin: self.value(srcs[3], lane).as_vec3()?,
      direction: self.value(srcs[4], lane).as_vec3()?,
      inverse_direction: self.value(srcs[5], lane).as_vec3()?,
    })
  }
}
