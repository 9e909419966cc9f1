use crate::*;

/// Program variables holding the state of one logical ray tracing invocation.
///
/// Every lowered program declares its own set. Inlined callees declare theirs too and have them
/// bound onto the caller's while splicing, see [`RtVariables::members`].
#[derive(Debug, Clone)]
pub struct RtVariables {
  pub idx: VariableId,
  pub shader_addr: VariableId,
  pub traversal_addr: VariableId,
  pub stack_ptr: VariableId,
  /// frame relative payload offset of the current invocation
  pub arg: VariableId,
  pub shader_record_ptr: VariableId,

  pub origin: VariableId,
  pub direction: VariableId,
  pub tmin: VariableId,
  pub tmax: VariableId,

  pub accel_struct: VariableId,
  pub cull_mask_and_flags: VariableId,
  pub sbt_offset: VariableId,
  pub sbt_stride: VariableId,
  pub miss_index: VariableId,

  pub primitive_addr: VariableId,
  pub primitive_id: VariableId,
  pub geometry_id_and_flags: VariableId,
  pub instance_addr: VariableId,
  pub hit_kind: VariableId,
  pub opaque: VariableId,

  pub ahit_accept: VariableId,
  pub ahit_terminate: VariableId,
  pub terminated: VariableId,

  /// set when the program handed control to another program and must not return itself
  pub suspended: VariableId,

  /// scratch bytes required past the program's own frame, accumulated while lowering
  pub stack_size: u32,
}

impl RtVariables {
  pub fn declare(shader: &mut Shader) -> Self {
    let mut var = |name: &str, ty: ValueType| shader.declare_variable(format!("rt.{name}"), ty);
    Self {
      idx: var("idx", ValueType::U32),
      shader_addr: var("shader_addr", ValueType::U64),
      traversal_addr: var("traversal_addr", ValueType::U64),
      stack_ptr: var("stack_ptr", ValueType::U32),
      arg: var("arg", ValueType::U32),
      shader_record_ptr: var("shader_record_ptr", ValueType::U64),
      origin: var("origin", ValueType::Vec3),
      direction: var("direction", ValueType::Vec3),
      tmin: var("tmin", ValueType::F32),
      tmax: var("tmax", ValueType::F32),
      accel_struct: var("accel_struct", ValueType::U64),
      cull_mask_and_flags: var("cull_mask_and_flags", ValueType::U32),
      sbt_offset: var("sbt_offset", ValueType::U32),
      sbt_stride: var("sbt_stride", ValueType::U32),
      miss_index: var("miss_index", ValueType::U32),
      primitive_addr: var("primitive_addr", ValueType::U64),
      primitive_id: var("primitive_id", ValueType::U32),
      geometry_id_and_flags: var("geometry_id_and_flags", ValueType::U32),
      instance_addr: var("instance_addr", ValueType::U64),
      hit_kind: var("hit_kind", ValueType::U32),
      opaque: var("opaque", ValueType::Bool),
      ahit_accept: var("ahit_accept", ValueType::Bool),
      ahit_terminate: var("ahit_terminate", ValueType::Bool),
      terminated: var("terminated", ValueType::Bool),
      suspended: var("suspended", ValueType::Bool),
      stack_size: 0,
    }
  }

  /// Fresh storage for the fields a candidate may only commit once it is accepted, everything
  /// else stays shared with `self`.
  pub fn create_inner(&self, b: &mut ShaderBuilder) -> Self {
    let mut inner = self.clone();
    let mut var = |name: &str, ty: ValueType| b.make_variable(format!("inner.{name}"), ty);
    inner.idx = var("idx", ValueType::U32);
    inner.shader_record_ptr = var("shader_record_ptr", ValueType::U64);
    inner.primitive_addr = var("primitive_addr", ValueType::U64);
    inner.primitive_id = var("primitive_id", ValueType::U32);
    inner.geometry_id_and_flags = var("geometry_id_and_flags", ValueType::U32);
    inner.tmax = var("tmax", ValueType::F32);
    inner.instance_addr = var("instance_addr", ValueType::U64);
    inner.hit_kind = var("hit_kind", ValueType::U32);
    inner.stack_size = 0;
    inner
  }

  /// every variable in a fixed order, two sets can be bound member by member
  pub fn members(&self) -> [VariableId; 25] {
    [
      self.idx,
      self.shader_addr,
      self.traversal_addr,
      self.stack_ptr,
      self.arg,
      self.shader_record_ptr,
      self.origin,
      self.direction,
      self.tmin,
      self.tmax,
      self.accel_struct,
      self.cull_mask_and_flags,
      self.sbt_offset,
      self.sbt_stride,
      self.miss_index,
      self.primitive_addr,
      self.primitive_id,
      self.geometry_id_and_flags,
      self.instance_addr,
      self.hit_kind,
      self.opaque,
      self.ahit_accept,
      self.ahit_terminate,
      self.terminated,
      self.suspended,
    ]
  }

  /// binding of a callee's set onto this one for [`ShaderBuilder::inline_shader`]
  pub fn bind_callee(&self, callee: &RtVariables) -> FastHashMap<VariableId, VariableId> {
    callee
      .members()
      .into_iter()
      .zip(self.members())
      .collect()
  }

  /// variables carried between separately compiled programs
  pub fn arg_bindings(&self) -> [(VariableId, ShaderArg); 19] {
    [
      (self.shader_addr, ShaderArg::ShaderAddr),
      (self.traversal_addr, ShaderArg::TraversalShaderAddr),
      (self.stack_ptr, ShaderArg::StackPtr),
      (self.arg, ShaderArg::PayloadOffset),
      (self.shader_record_ptr, ShaderArg::ShaderRecordPtr),
      (self.accel_struct, ShaderArg::AccelStruct),
      (self.cull_mask_and_flags, ShaderArg::CullMaskAndFlags),
      (self.sbt_offset, ShaderArg::SbtOffset),
      (self.sbt_stride, ShaderArg::SbtStride),
      (self.miss_index, ShaderArg::MissIndex),
      (self.origin, ShaderArg::RayOrigin),
      (self.tmin, ShaderArg::RayTMin),
      (self.direction, ShaderArg::RayDirection),
      (self.tmax, ShaderArg::RayTMax),
      (self.primitive_addr, ShaderArg::PrimitiveAddr),
      (self.primitive_id, ShaderArg::PrimitiveId),
      (self.instance_addr, ShaderArg::InstanceAddr),
      (self.geometry_id_and_flags, ShaderArg::GeometryIdAndFlags),
      (self.hit_kind, ShaderArg::HitKind),
    ]
  }

  pub fn init_from_args(&self, b: &mut ShaderBuilder) {
    for (var, arg) in self.arg_bindings() {
      let value = b.load_arg(arg);
      b.store_var(var, value);
    }
    b.store_imm(self.idx, 0u32);
    b.store_imm(self.opaque, false);
    b.store_imm(self.ahit_accept, false);
    b.store_imm(self.ahit_terminate, false);
    b.store_imm(self.terminated, false);
    b.store_imm(self.suspended, false);
  }

  pub fn store_to_args(&self, b: &mut ShaderBuilder) {
    for (var, arg) in self.arg_bindings() {
      let value = b.load_var(var);
      b.store_arg(arg, value);
    }
  }

  /// stores every trace_ray operand, `srcs` in [`Intrinsic::TraceRay`] order
  pub fn store_trace_args(&self, b: &mut ShaderBuilder, srcs: &[Node]) {
    let cull_mask = b.ishl_imm(srcs[2], 24);
    let cull_mask_and_flags = b.ior(cull_mask, srcs[1]);
    b.store_var(self.accel_struct, srcs[0]);
    b.store_var(self.cull_mask_and_flags, cull_mask_and_flags);
    let sbt_offset = b.iand_imm(srcs[3], 0xf);
    b.store_var(self.sbt_offset, sbt_offset);
    let sbt_stride = b.iand_imm(srcs[4], 0xf);
    b.store_var(self.sbt_stride, sbt_stride);
    let miss_index = b.iand_imm(srcs[5], 0xffff);
    b.store_var(self.miss_index, miss_index);
    b.store_var(self.origin, srcs[6]);
    b.store_var(self.tmin, srcs[7]);
    b.store_var(self.direction, srcs[8]);
    b.store_var(self.tmax, srcs[9]);
  }
}
