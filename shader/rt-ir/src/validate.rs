use crate::*;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IrError {
  #[error("{shader}: node %{node} is out of the node range ({count})")]
  NodeOutOfRange { shader: String, node: u32, count: u32 },
  #[error("{shader}: node %{node} is defined more than once")]
  NodeRedefined { shader: String, node: u32 },
  #[error("{shader}: node %{node} is used but never defined")]
  UndefinedNode { shader: String, node: u32 },
  #[error("{shader}: variable {var} is not declared")]
  UnknownVariable { shader: String, var: u32 },
  #[error("{shader}: `{keyword}` outside of a loop")]
  JumpOutsideLoop {
    shader: String,
    keyword: &'static str,
  },
}

/// Structural checks every program handed between passes must satisfy.
pub fn validate_shader(shader: &Shader) -> Result<(), IrError> {
  let mut cx = ValidateCtx {
    shader,
    defined: vec![false; shader.node_count as usize],
    used: Vec::new(),
  };
  cx.block(&shader.body, 0)?;

  for node in cx.used {
    if !cx.defined[node.0 as usize] {
      return Err(IrError::UndefinedNode {
        shader: shader.name.clone(),
        node: node.0,
      });
    }
  }
  Ok(())
}

struct ValidateCtx<'a> {
  shader: &'a Shader,
  defined: Vec<bool>,
  used: Vec<Node>,
}

impl ValidateCtx<'_> {
  fn check_node(&self, node: Node) -> Result<(), IrError> {
    if node.0 >= self.shader.node_count {
      return Err(IrError::NodeOutOfRange {
        shader: self.shader.name.clone(),
        node: node.0,
        count: self.shader.node_count,
      });
    }
    Ok(())
  }

  fn check_var(&self, var: VariableId) -> Result<(), IrError> {
    if self.shader.variable(var).is_none() {
      return Err(IrError::UnknownVariable {
        shader: self.shader.name.clone(),
        var: var.0,
      });
    }
    Ok(())
  }

  fn block(&mut self, block: &[Instr], loop_depth: u32) -> Result<(), IrError> {
    for instr in block {
      for src in instr.srcs() {
        self.check_node(*src)?;
        self.used.push(*src);
      }
      if let Some(dst) = instr.dst() {
        self.check_node(dst)?;
        let slot = &mut self.defined[dst.0 as usize];
        if *slot {
          return Err(IrError::NodeRedefined {
            shader: self.shader.name.clone(),
            node: dst.0,
          });
        }
        *slot = true;
      }

      match instr {
        Instr::LoadVar { var, .. } | Instr::StoreVar { var, .. } => self.check_var(*var)?,
        Instr::If {
          then_block,
          else_block,
          ..
        } => {
          self.block(then_block, loop_depth)?;
          self.block(else_block, loop_depth)?;
        }
        Instr::Loop { body } => self.block(body, loop_depth + 1)?,
        // jumps never cross a region boundary
        Instr::Inlined { body, .. } => self.block(body, 0)?,
        Instr::Break | Instr::Continue if loop_depth == 0 => {
          return Err(IrError::JumpOutsideLoop {
            shader: self.shader.name.clone(),
            keyword: if matches!(instr, Instr::Break) {
              "break"
            } else {
              "continue"
            },
          });
        }
        _ => {}
      }
    }
    Ok(())
  }
}
