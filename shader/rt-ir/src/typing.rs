use crate::*;

impl AluOp {
  pub fn result_type(&self, operands: &[Option<ValueType>]) -> Option<ValueType> {
    let first = operands.first().copied().flatten();
    match self {
      AluOp::IEq | AluOp::INe | AluOp::ULt | AluOp::UGe | AluOp::FLt | AluOp::FGe => {
        Some(ValueType::Bool)
      }
      AluOp::BCsel => operands.get(1).copied().flatten(),
      AluOp::Dot3 | AluOp::U2F => Some(ValueType::F32),
      AluOp::ToU64 => Some(ValueType::U64),
      AluOp::ToU32 | AluOp::BoolToU32 | AluOp::FindLsb => Some(ValueType::U32),
      AluOp::Construct(ty) => Some(*ty),
      AluOp::Extract(_) => match first? {
        ValueType::UVec3 | ValueType::UVec4 => Some(ValueType::U32),
        _ => Some(ValueType::F32),
      },
      _ => first,
    }
  }
}

impl Intrinsic {
  /// type of the value the intrinsic defines, `None` for side effect only intrinsics
  pub fn result_type(&self, shader: &Shader, operands: &[Option<ValueType>]) -> Option<ValueType> {
    use Intrinsic::*;
    match self {
      LoadPayload { ty, .. }
      | LoadScratch { ty, .. }
      | LoadConstant { ty, .. }
      | LoadGlobal { ty }
      | LoadShared { ty } => Some(*ty),
      LaunchId | LaunchSize => Some(ValueType::UVec3),
      RayTMin | RayTMax | LoadHitAttrib { .. } => Some(ValueType::F32),
      RayWorldOrigin | RayWorldDirection | RayObjectOrigin | RayObjectDirection => {
        Some(ValueType::Vec3)
      }
      WorldToObject { .. } | ObjectToWorld { .. } | IntersectTriangleNode => Some(ValueType::Vec4),
      InstanceCustomIndex | InstanceId | PrimitiveId | GeometryIndex | RayFlags | CullMask
      | HitKind | RtArgScratchOffset | LocalInvocationIndex => Some(ValueType::U32),
      IntersectionOpaque | ReportIntersection => Some(ValueType::Bool),
      ShaderRecordPtr | ResumeShaderAddress { .. } | Ballot => Some(ValueType::U64),
      IntersectBoxNode => Some(ValueType::UVec4),
      LoadArg(arg) => Some(arg.ty()),
      LoadParam(index) => shader.params.get(*index as usize).copied(),
      ReadInvocation => operands.first().copied().flatten(),
      TraceRay { .. }
      | ExecuteCallable { .. }
      | RtResume { .. }
      | RtReturn
      | StorePayload { .. }
      | IgnoreIntersection
      | TerminateRay
      | StoreHitAttrib { .. }
      | ExecuteClosestHit
      | ExecuteMiss
      | StoreScratch { .. }
      | StoreGlobal
      | StoreShared
      | StoreArg(_) => None,
    }
  }
}

/// Type of every node of `shader`, indexed by node id. Nodes that are never defined, or whose
/// type cannot be derived from their operands, are `None`.
pub fn infer_node_types(shader: &Shader) -> Vec<Option<ValueType>> {
  let mut types = vec![None; shader.node_count as usize];
  let lookup = |types: &[Option<ValueType>], srcs: &[Node]| -> SmallVec<[Option<ValueType>; 4]> {
    srcs
      .iter()
      .map(|n| types.get(n.0 as usize).copied().flatten())
      .collect()
  };

  shader.visit_instructions(|instr| {
    let ty = match instr {
      Instr::Const { value, .. } => Some(value.ty()),
      Instr::Alu { op, srcs, .. } => op.result_type(&lookup(&types, srcs)),
      Instr::LoadVar { var, .. } => shader.variable(*var).map(|v| v.ty),
      Instr::Intrinsic { op, srcs, .. } => op.result_type(shader, &lookup(&types, srcs)),
      _ => None,
    };
    if let (Some(dst), Some(ty)) = (instr.dst(), ty) {
      if let Some(slot) = types.get_mut(dst.0 as usize) {
        *slot = Some(ty);
      }
    }
  });
  types
}
