use crate::*;

/// how callee storage is bound while splicing it into a caller
#[derive(Default)]
pub struct InlineBinding<'a> {
  /// callee variable to caller variable. unmapped callee variables get fresh caller copies
  pub variables: FastHashMap<VariableId, VariableId>,
  /// values for the callee's `LoadParam`
  pub params: &'a [Node],
}

impl ShaderBuilder {
  /// Splice `callee` at the current position as an [`Instr::Inlined`] region.
  ///
  /// Callee nodes are renumbered past the caller's, callee returns stay local to the region.
  /// Constant data and scratch sizes are not merged here.
  pub fn inline_shader(&mut self, callee: &Shader, binding: &InlineBinding) {
    let node_base = self.reserve_nodes(callee.node_count);

    let variables: Vec<VariableId> = callee
      .variables
      .iter()
      .enumerate()
      .map(|(i, decl)| {
        let id = VariableId(i as u32);
        match binding.variables.get(&id) {
          Some(mapped) => *mapped,
          None => self.make_variable(format!("{}.{}", callee.name, decl.name), decl.ty),
        }
      })
      .collect();

    let remap = InlineRemap {
      nodes: NodeRemap::Offset(node_base),
      variables: &variables,
      params: binding.params,
    };
    let body = remap.block(&callee.body);
    self.emit(Instr::Inlined {
      name: callee.name.clone(),
      body,
    });
  }

  /// A copy of `block` of the program being built in which every node the block defines is
  /// replaced by a fresh one. Nodes defined outside the block keep their handles.
  pub fn fresh_copy(&mut self, block: &[Instr]) -> Block {
    let mut table = FastHashMap::default();
    visit_block(block, &mut |instr| {
      if let Some(dst) = instr.dst() {
        table.insert(dst, self.new_node());
      }
    });
    let remap = InlineRemap {
      nodes: NodeRemap::Table(&table),
      variables: &[],
      params: &[],
    };
    remap.block(block)
  }
}

enum NodeRemap<'a> {
  Offset(u32),
  Table(&'a FastHashMap<Node, Node>),
}

struct InlineRemap<'a> {
  nodes: NodeRemap<'a>,
  variables: &'a [VariableId],
  params: &'a [Node],
}

impl InlineRemap<'_> {
  fn node(&self, n: Node) -> Node {
    match self.nodes {
      NodeRemap::Offset(base) => Node(n.0 + base),
      NodeRemap::Table(table) => table.get(&n).copied().unwrap_or(n),
    }
  }

  fn var(&self, v: VariableId) -> VariableId {
    self.variables.get(v.0 as usize).copied().unwrap_or(v)
  }

  fn block(&self, block: &[Instr]) -> Block {
    block.iter().map(|instr| self.instr(instr)).collect()
  }

  fn instr(&self, instr: &Instr) -> Instr {
    match instr {
      Instr::Const { dst, value } => Instr::Const {
        dst: self.node(*dst),
        value: *value,
      },
      Instr::Alu { dst, op, srcs } => Instr::Alu {
        dst: self.node(*dst),
        op: *op,
        srcs: srcs.iter().map(|n| self.node(*n)).collect(),
      },
      Instr::LoadVar { dst, var } => Instr::LoadVar {
        dst: self.node(*dst),
        var: self.var(*var),
      },
      Instr::StoreVar { var, src } => Instr::StoreVar {
        var: self.var(*var),
        src: self.node(*src),
      },
      Instr::Intrinsic {
        dst: Some(dst),
        op: Intrinsic::LoadParam(index),
        ..
      } if (*index as usize) < self.params.len() => Instr::Alu {
        dst: self.node(*dst),
        op: AluOp::Mov,
        srcs: smallvec![self.params[*index as usize]],
      },
      Instr::Intrinsic { dst, op, srcs } => Instr::Intrinsic {
        dst: dst.map(|n| self.node(n)),
        op: *op,
        srcs: srcs.iter().map(|n| self.node(*n)).collect(),
      },
      Instr::If {
        cond,
        then_block,
        else_block,
      } => Instr::If {
        cond: self.node(*cond),
        then_block: self.block(then_block),
        else_block: self.block(else_block),
      },
      Instr::Loop { body } => Instr::Loop {
        body: self.block(body),
      },
      Instr::Inlined { name, body } => Instr::Inlined {
        name: name.clone(),
        body: self.block(body),
      },
      Instr::Break => Instr::Break,
      Instr::Continue => Instr::Continue,
      Instr::Return => Instr::Return,
      Instr::Terminate => Instr::Terminate,
    }
  }
}
