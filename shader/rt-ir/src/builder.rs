use crate::*;

/// Incrementally assembles a [`Shader`].
///
/// Control flow is built with closure scopes in the same way shader source reads:
/// `b.if_by(cond, |b| ...).else_by(b, |b| ...)`, `b.loop_by(|b| ...)`. Instructions are always
/// appended to the innermost open scope.
pub struct ShaderBuilder {
  shader: Shader,
  scopes: Vec<Block>,
}

pub struct ElseEmitter(());

impl ElseEmitter {
  pub fn else_by(self, builder: &mut ShaderBuilder, logic: impl FnOnce(&mut ShaderBuilder)) {
    builder.push_block();
    logic(builder);
    let block = builder.pop_block();
    if let Some(Instr::If { else_block, .. }) = builder.current_block().last_mut() {
      *else_block = block;
    }
  }
}

impl ShaderBuilder {
  pub fn new(name: impl Into<String>, stage: ShaderStage) -> Self {
    Self::from_shader(Shader::new(name, stage)).0
  }

  /// continue building on top of an existing program. The program body is handed back so the
  /// caller can re-emit it (typically through [`rewrite_instructions`]).
  pub fn from_shader(mut shader: Shader) -> (Self, Block) {
    let body = std::mem::take(&mut shader.body);
    (
      Self {
        shader,
        scopes: vec![Vec::new()],
      },
      body,
    )
  }

  pub fn finish(mut self) -> Shader {
    while self.scopes.len() > 1 {
      log::warn!("shader {} finished with unclosed scope", self.shader.name);
      let block = self.pop_block();
      self.current_block().extend(block);
    }
    self.shader.body = self.scopes.pop().unwrap_or_default();
    self.shader
  }

  pub fn shader(&self) -> &Shader {
    &self.shader
  }

  pub fn shader_mut(&mut self) -> &mut Shader {
    &mut self.shader
  }

  pub fn stage(&self) -> ShaderStage {
    self.shader.stage
  }

  pub(crate) fn current_block(&mut self) -> &mut Block {
    if self.scopes.is_empty() {
      self.scopes.push(Vec::new());
    }
    let last = self.scopes.len() - 1;
    &mut self.scopes[last]
  }

  pub fn push_block(&mut self) {
    self.scopes.push(Vec::new());
  }

  pub fn pop_block(&mut self) -> Block {
    if self.scopes.len() <= 1 {
      return Vec::new();
    }
    self.scopes.pop().unwrap_or_default()
  }

  pub fn emit(&mut self, instr: Instr) {
    self.current_block().push(instr);
  }

  pub fn new_node(&mut self) -> Node {
    let node = Node(self.shader.node_count);
    self.shader.node_count += 1;
    node
  }

  /// reserve `count` consecutive node ids and return the first one
  pub fn reserve_nodes(&mut self, count: u32) -> u32 {
    let first = self.shader.node_count;
    self.shader.node_count += count;
    first
  }

  pub fn make_variable(&mut self, name: impl Into<String>, ty: ValueType) -> VariableId {
    self.shader.declare_variable(name, ty)
  }

  /// a fresh variable initialized with `init`
  pub fn make_local_var(&mut self, name: impl Into<String>, init: Value) -> VariableId {
    let var = self.make_variable(name, init.ty());
    let value = self.imm(init);
    self.store_var(var, value);
    var
  }

  pub fn variable_type(&self, var: VariableId) -> Option<ValueType> {
    self.shader.variable(var).map(|v| v.ty)
  }

  // values

  pub fn imm(&mut self, value: impl Into<Value>) -> Node {
    let dst = self.new_node();
    self.emit(Instr::Const {
      dst,
      value: value.into(),
    });
    dst
  }

  pub fn imm_u32(&mut self, v: u32) -> Node {
    self.imm(v)
  }
  pub fn imm_u64(&mut self, v: u64) -> Node {
    self.imm(v)
  }
  pub fn imm_f32(&mut self, v: f32) -> Node {
    self.imm(v)
  }
  pub fn imm_bool(&mut self, v: bool) -> Node {
    self.imm(v)
  }
  pub fn zeroed(&mut self, ty: ValueType) -> Node {
    self.imm(ty.zeroed())
  }

  pub fn alu(&mut self, op: AluOp, srcs: &[Node]) -> Node {
    let dst = self.new_node();
    self.emit(Instr::Alu {
      dst,
      op,
      srcs: srcs.iter().copied().collect(),
    });
    dst
  }

  /// define `dst` as a copy of `src`, used when a lowered instruction keeps its result handle
  pub fn mov_to(&mut self, dst: Node, src: Node) {
    self.emit(Instr::Alu {
      dst,
      op: AluOp::Mov,
      srcs: smallvec![src],
    });
  }

  pub fn load_var(&mut self, var: VariableId) -> Node {
    let dst = self.new_node();
    self.emit(Instr::LoadVar { dst, var });
    dst
  }

  pub fn store_var(&mut self, var: VariableId, src: Node) {
    self.emit(Instr::StoreVar { var, src });
  }

  pub fn store_imm(&mut self, var: VariableId, value: impl Into<Value>) {
    let v = self.imm(value);
    self.store_var(var, v);
  }

  pub fn copy_var(&mut self, dst: VariableId, src: VariableId) {
    let v = self.load_var(src);
    self.store_var(dst, v);
  }

  pub fn intrinsic(&mut self, op: Intrinsic, srcs: &[Node]) -> Node {
    let dst = self.new_node();
    self.emit(Instr::Intrinsic {
      dst: Some(dst),
      op,
      srcs: srcs.iter().copied().collect(),
    });
    dst
  }

  pub fn intrinsic_void(&mut self, op: Intrinsic, srcs: &[Node]) {
    self.emit(Instr::Intrinsic {
      dst: None,
      op,
      srcs: srcs.iter().copied().collect(),
    });
  }

  // control flow

  pub fn if_by(&mut self, cond: Node, logic: impl FnOnce(&mut Self)) -> ElseEmitter {
    self.push_block();
    logic(self);
    let then_block = self.pop_block();
    self.emit(Instr::If {
      cond,
      then_block,
      else_block: Vec::new(),
    });
    ElseEmitter(())
  }

  pub fn loop_by(&mut self, logic: impl FnOnce(&mut Self)) {
    self.push_block();
    logic(self);
    let body = self.pop_block();
    self.emit(Instr::Loop { body });
  }

  pub fn inlined_by(&mut self, name: impl Into<String>, logic: impl FnOnce(&mut Self)) {
    self.push_block();
    logic(self);
    let body = self.pop_block();
    self.emit(Instr::Inlined {
      name: name.into(),
      body,
    });
  }

  pub fn do_break(&mut self) {
    self.emit(Instr::Break);
  }
  pub fn do_continue(&mut self) {
    self.emit(Instr::Continue);
  }
  pub fn do_return(&mut self) {
    self.emit(Instr::Return);
  }
  pub fn terminate(&mut self) {
    self.emit(Instr::Terminate);
  }

  pub fn break_if(&mut self, cond: Node) {
    self.if_by(cond, |b| b.do_break());
  }

  /// `cond ? then : otherwise` where both sides need control flow to compute
  pub fn select_branched(
    &mut self,
    cond: Node,
    ty: ValueType,
    then: impl FnOnce(&mut Self) -> Node,
    otherwise: impl FnOnce(&mut Self) -> Node,
  ) -> Node {
    let result = self.make_variable("select", ty);
    self
      .if_by(cond, |b| {
        let v = then(b);
        b.store_var(result, v);
      })
      .else_by(self, |b| {
        let v = otherwise(b);
        b.store_var(result, v);
      });
    self.load_var(result)
  }
}

macro_rules! binary_alu {
  ($($name: ident => $op: ident),* $(,)?) => {
    impl ShaderBuilder {
      $(
        pub fn $name(&mut self, a: Node, b: Node) -> Node {
          self.alu(AluOp::$op, &[a, b])
        }
      )*
    }
  };
}

binary_alu! {
  iadd => IAdd,
  isub => ISub,
  imul => IMul,
  udiv => UDiv,
  umod => UMod,
  iand => IAnd,
  ior => IOr,
  ixor => IXor,
  ishl => IShl,
  ushr => UShr,
  ieq => IEq,
  ine => INe,
  ult => ULt,
  uge => UGe,
  fadd => FAdd,
  fsub => FSub,
  fmul => FMul,
  fdiv => FDiv,
  fmin => FMin,
  fmax => FMax,
  flt => FLt,
  fge => FGe,
  dot3 => Dot3,
}

impl ShaderBuilder {
  pub fn inot(&mut self, a: Node) -> Node {
    self.alu(AluOp::INot, &[a])
  }
  pub fn frcp(&mut self, a: Node) -> Node {
    self.alu(AluOp::FRcp, &[a])
  }
  pub fn to_u64(&mut self, a: Node) -> Node {
    self.alu(AluOp::ToU64, &[a])
  }
  pub fn to_u32(&mut self, a: Node) -> Node {
    self.alu(AluOp::ToU32, &[a])
  }
  pub fn bcsel(&mut self, cond: Node, a: Node, b: Node) -> Node {
    self.alu(AluOp::BCsel, &[cond, a, b])
  }
  pub fn extract(&mut self, v: Node, channel: u8) -> Node {
    self.alu(AluOp::Extract(channel), &[v])
  }
  pub fn construct(&mut self, ty: ValueType, parts: &[Node]) -> Node {
    self.alu(AluOp::Construct(ty), parts)
  }

  pub fn iadd_imm(&mut self, a: Node, v: u32) -> Node {
    let imm = self.imm_u32(v);
    self.iadd(a, imm)
  }
  pub fn iadd_imm64(&mut self, a: Node, v: u64) -> Node {
    let imm = self.imm_u64(v);
    self.iadd(a, imm)
  }
  pub fn isub_imm(&mut self, a: Node, v: u32) -> Node {
    let imm = self.imm_u32(v);
    self.isub(a, imm)
  }
  pub fn iand_imm(&mut self, a: Node, v: u32) -> Node {
    let imm = self.imm_u32(v);
    self.iand(a, imm)
  }
  pub fn iand_imm64(&mut self, a: Node, v: u64) -> Node {
    let imm = self.imm_u64(v);
    self.iand(a, imm)
  }
  pub fn ushr_imm(&mut self, a: Node, v: u32) -> Node {
    let imm = self.imm_u32(v);
    self.ushr(a, imm)
  }
  pub fn ishl_imm(&mut self, a: Node, v: u32) -> Node {
    let imm = self.imm_u32(v);
    self.ishl(a, imm)
  }
  pub fn imul_imm(&mut self, a: Node, v: u32) -> Node {
    let imm = self.imm_u32(v);
    self.imul(a, imm)
  }
  pub fn ieq_imm(&mut self, a: Node, v: u32) -> Node {
    let imm = self.imm_u32(v);
    self.ieq(a, imm)
  }
  pub fn ine_imm(&mut self, a: Node, v: u32) -> Node {
    let imm = self.imm_u32(v);
    self.ine(a, imm)
  }
  pub fn uge_imm(&mut self, a: Node, v: u32) -> Node {
    let imm = self.imm_u32(v);
    self.uge(a, imm)
  }
  /// `a & mask != 0`
  pub fn test_mask(&mut self, a: Node, mask: u32) -> Node {
    let masked = self.iand_imm(a, mask);
    self.ine_imm(masked, 0)
  }

  /// `address + offset` where address is 64 bit and offset 32 bit
  pub fn address_offset(&mut self, address: Node, offset: Node) -> Node {
    let wide = self.to_u64(offset);
    self.iadd(address, wide)
  }

  pub fn load_global(&mut self, ty: ValueType, address: Node) -> Node {
    self.intrinsic(Intrinsic::LoadGlobal { ty }, &[address])
  }

  pub fn load_global_at(&mut self, ty: ValueType, address: Node, offset: u64) -> Node {
    let address = self.iadd_imm64(address, offset);
    self.load_global(ty, address)
  }

  pub fn load_arg(&mut self, arg: ShaderArg) -> Node {
    self.intrinsic(Intrinsic::LoadArg(arg), &[])
  }

  pub fn store_arg(&mut self, arg: ShaderArg, value: Node) {
    self.intrinsic_void(Intrinsic::StoreArg(arg), &[value])
  }

  /// Emits a switch over `selector` as a chain of equality tests.
  pub fn switch_by(&mut self, selector: Node) -> SwitchBuilder<'_> {
    SwitchBuilder {
      builder: self,
      selector,
      cases: Vec::new(),
    }
  }
}

type CaseLogic<'a> = Box<dyn FnOnce(&mut ShaderBuilder) + 'a>;

pub struct SwitchBuilder<'a> {
  builder: &'a mut ShaderBuilder,
  selector: Node,
  cases: Vec<(u32, CaseLogic<'a>)>,
}

impl<'a> SwitchBuilder<'a> {
  pub fn case(mut self, value: u32, logic: impl FnOnce(&mut ShaderBuilder) + 'a) -> Self {
    self.cases.push((value, Box::new(logic)));
    self
  }

  pub fn end_with_default(self, default: impl FnOnce(&mut ShaderBuilder) + 'a) {
    fn emit<'a>(
      b: &mut ShaderBuilder,
      selector: Node,
      mut cases: std::vec::IntoIter<(u32, CaseLogic<'a>)>,
      default: CaseLogic<'a>,
    ) {
      match cases.next() {
        Some((value, logic)) => {
          let hit = b.ieq_imm(selector, value);
          b.if_by(hit, logic)
            .else_by(b, |b| emit(b, selector, cases, default));
        }
        None => default(b),
      }
    }
    emit(
      self.builder,
      self.selector,
      self.cases.into_iter(),
      Box::new(default),
    );
  }

  pub fn end(self) {
    self.end_with_default(|_| {})
  }
}
