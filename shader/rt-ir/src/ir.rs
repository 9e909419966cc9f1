use crate::*;

/// handle of a single assignment value inside one [`Shader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node(pub u32);

/// handle of a mutable variable declared by one [`Shader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
  RayGen,
  Miss,
  ClosestHit,
  AnyHit,
  Intersection,
  Callable,
  Traversal,
}

#[derive(Debug, Clone)]
pub struct VariableDecl {
  pub name: String,
  pub ty: ValueType,
}

pub type Block = Vec<Instr>;
pub type Operands = SmallVec<[Node; 4]>;

#[derive(Debug, Clone)]
pub struct Shader {
  pub name: String,
  pub stage: ShaderStage,
  pub variables: Vec<VariableDecl>,
  pub body: Block,
  /// nodes are numbered densely from zero
  pub node_count: u32,
  /// bytes of frame relative scratch the program addresses directly
  pub scratch_size: u32,
  pub constant_data: Vec<u8>,
  /// parameter types, only meaningful for programs that are inlined as functions
  pub params: Vec<ValueType>,
}

impl Shader {
  pub fn new(name: impl Into<String>, stage: ShaderStage) -> Self {
    Self {
      name: name.into(),
      stage,
      variables: Vec::new(),
      body: Vec::new(),
      node_count: 0,
      scratch_size: 0,
      constant_data: Vec::new(),
      params: Vec::new(),
    }
  }

  pub fn declare_variable(&mut self, name: impl Into<String>, ty: ValueType) -> VariableId {
    let id = VariableId(self.variables.len() as u32);
    self.variables.push(VariableDecl {
      name: name.into(),
      ty,
    });
    id
  }

  pub fn variable(&self, id: VariableId) -> Option<&VariableDecl> {
    self.variables.get(id.0 as usize)
  }

  /// visit every non control flow instruction in program order
  pub fn visit_instructions(&self, mut f: impl FnMut(&Instr)) {
    visit_block(&self.body, &mut f)
  }

  pub fn visit_instructions_mut(&mut self, mut f: impl FnMut(&mut Instr)) {
    fn walk(block: &mut [Instr], f: &mut impl FnMut(&mut Instr)) {
      for instr in block {
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
          other => f(other),
        }
      }
    }
    walk(&mut self.body, &mut f)
  }

  pub fn count_intrinsics(&self, filter: impl Fn(&Intrinsic) -> bool) -> usize {
    let mut count = 0;
    self.visit_instructions(|instr| {
      if let Instr::Intrinsic { op, .. } = instr {
        if filter(op) {
          count += 1;
        }
      }
    });
    count
  }
}

/// visit every non control flow instruction of `block` and its nested blocks in program order
pub fn visit_block(block: &[Instr], f: &mut impl FnMut(&Instr)) {
  for instr in block {
    match instr {
      Instr::If {
        then_block,
        else_block,
        ..
      } => {
        visit_block(then_block, f);
        visit_block(else_block, f);
      }
      Instr::Loop { body } | Instr::Inlined { body, .. } => visit_block(body, f),
      other => f(other),
    }
  }
}

#[derive(Debug, Clone)]
pub enum Instr {
  Const {
    dst: Node,
    value: Value,
  },
  Alu {
    dst: Node,
    op: AluOp,
    srcs: Operands,
  },
  LoadVar {
    dst: Node,
    var: VariableId,
  },
  StoreVar {
    var: VariableId,
    src: Node,
  },
  Intrinsic {
    dst: Option<Node>,
    op: Intrinsic,
    srcs: Operands,
  },
  If {
    cond: Node,
    then_block: Block,
    else_block: Block,
  },
  Loop {
    body: Block,
  },
  /// a spliced callee body, `Return` inside it only leaves this region
  Inlined {
    name: String,
    body: Block,
  },
  Break,
  Continue,
  Return,
  /// the lane stops executing for good
  Terminate,
}

impl Instr {
  pub fn dst(&self) -> Option<Node> {
    match self {
      Instr::Const { dst, .. } | Instr::Alu { dst, .. } | Instr::LoadVar { dst, .. } => Some(*dst),
      Instr::Intrinsic { dst, .. } => *dst,
      _ => None,
    }
  }

  pub fn srcs(&self) -> &[Node] {
    match self {
      Instr::Alu { srcs, .. } | Instr::Intrinsic { srcs, .. } => srcs,
      Instr::StoreVar { src, .. } => std::slice::from_ref(src),
      Instr::If { cond, .. } => std::slice::from_ref(cond),
      _ => &[],
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
  Mov,
  IAdd,
  ISub,
  IMul,
  UDiv,
  UMod,
  IAnd,
  IOr,
  IXor,
  INot,
  IShl,
  UShr,
  IEq,
  INe,
  ULt,
  UGe,
  FAdd,
  FSub,
  FMul,
  FDiv,
  FRcp,
  FNeg,
  FAbs,
  FMin,
  FMax,
  FLt,
  FGe,
  Dot3,
  /// `cond ? a : b`
  BCsel,
  ToU64,
  /// keeps the low 32 bits
  ToU32,
  U2F,
  BoolToU32,
  /// index of the lowest set bit, `u32::MAX` when there is none
  FindLsb,
  Construct(ValueType),
  Extract(u8),
}

/// frame relative scratch is rebased by the continuation stack pointer during late lowering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScratchBase {
  Frame,
  Absolute,
}

/// values handed between separately compiled programs by the dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderArg {
  ShaderAddr,
  UniformShaderAddr,
  TraversalShaderAddr,
  StackPtr,
  ShaderRecordPtr,
  PayloadOffset,
  AccelStruct,
  CullMaskAndFlags,
  SbtOffset,
  SbtStride,
  MissIndex,
  RayOrigin,
  RayTMin,
  RayDirection,
  RayTMax,
  PrimitiveAddr,
  PrimitiveId,
  InstanceAddr,
  GeometryIdAndFlags,
  HitKind,
  LaunchId,
  LaunchSize,
  SbtDescriptors,
}

impl ShaderArg {
  pub fn ty(&self) -> ValueType {
    use ShaderArg::*;
    match self {
      ShaderAddr | UniformShaderAddr | TraversalShaderAddr | ShaderRecordPtr | AccelStruct
      | PrimitiveAddr | InstanceAddr | SbtDescriptors => ValueType::U64,
      StackPtr | PayloadOffset | CullMaskAndFlags | SbtOffset | SbtStride | MissIndex
      | PrimitiveId | GeometryIdAndFlags | HitKind => ValueType::U32,
      RayOrigin | RayDirection => ValueType::Vec3,
      RayTMin | RayTMax => ValueType::F32,
      LaunchId | LaunchSize => ValueType::UVec3,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
  /// srcs: accel_struct, ray_flags, cull_mask, sbt_offset, sbt_stride, miss_index,
  /// origin, tmin, direction, tmax, payload
  TraceRay {
    call_idx: u32,
    stack_size: u32,
  },
  /// srcs: sbt_index, payload
  ExecuteCallable {
    call_idx: u32,
    stack_size: u32,
  },
  RtResume {
    stack_size: u32,
  },
  RtReturn,
  LoadPayload {
    ty: ValueType,
    offset: u32,
  },
  StorePayload {
    offset: u32,
  },

  LaunchId,
  LaunchSize,
  RayTMin,
  RayTMax,
  RayWorldOrigin,
  RayWorldDirection,
  RayObjectOrigin,
  RayObjectDirection,
  /// one row of the 3x4 matrix
  WorldToObject {
    row: u8,
  },
  ObjectToWorld {
    row: u8,
  },
  InstanceCustomIndex,
  InstanceId,
  PrimitiveId,
  GeometryIndex,
  RayFlags,
  CullMask,
  HitKind,
  IntersectionOpaque,
  ShaderRecordPtr,
  IgnoreIntersection,
  TerminateRay,
  /// srcs: t, hit_kind. dst: whether the intersection was accepted
  ReportIntersection,
  LoadHitAttrib {
    slot: u32,
  },
  StoreHitAttrib {
    slot: u32,
  },
  /// srcs: sbt_index, tmax, primitive_addr, primitive_id, instance_addr,
  /// geometry_id_and_flags, hit_kind
  ExecuteClosestHit,
  /// srcs: tmax
  ExecuteMiss,
  RtArgScratchOffset,
  ResumeShaderAddress {
    call_idx: u32,
  },

  LoadScratch {
    ty: ValueType,
    base: ScratchBase,
  },
  /// srcs: value, offset
  StoreScratch {
    base: ScratchBase,
  },
  LoadConstant {
    ty: ValueType,
    base: u32,
    align: u32,
  },
  LoadGlobal {
    ty: ValueType,
  },
  /// srcs: value, address
  StoreGlobal,
  LoadShared {
    ty: ValueType,
  },
  /// srcs: value, offset
  StoreShared,
  LoadArg(ShaderArg),
  StoreArg(ShaderArg),
  LoadParam(u32),

  Ballot,
  /// srcs: value, lane
  ReadInvocation,
  LocalInvocationIndex,

  /// srcs: node_address, tmin, tmax, origin, direction, inverse_direction
  /// dst: child node ids sorted front to back, misses are all ones
  IntersectBoxNode,
  /// srcs: node_address, tmin, tmax, origin, direction, inverse_direction
  /// dst: (t, front face as 0/1, barycentric u, barycentric v), t is infinity on miss
  IntersectTriangleNode,
}

impl Intrinsic {
  /// intrinsics that only exist before ray tracing lowering
  pub fn is_ray_tracing(&self) -> bool {
    use Intrinsic::*;
    matches!(
      self,
      TraceRay { .. }
        | ExecuteCallable { .. }
        | RtResume { .. }
        | RtReturn
        | LoadPayload { .. }
        | StorePayload { .. }
        | LaunchId
        | LaunchSize
        | RayTMin
        | RayTMax
        | RayWorldOrigin
        | RayWorldDirection
        | RayObjectOrigin
        | RayObjectDirection
        | WorldToObject { .. }
        | ObjectToWorld { .. }
        | InstanceCustomIndex
        | InstanceId
        | PrimitiveId
        | GeometryIndex
        | RayFlags
        | CullMask
        | HitKind
        | IntersectionOpaque
        | ShaderRecordPtr
        | IgnoreIntersection
        | TerminateRay
        | ReportIntersection
        | LoadHitAttrib { .. }
        | StoreHitAttrib { .. }
        | ExecuteClosestHit
        | ExecuteMiss
        | RtArgScratchOffset
    )
  }
}
