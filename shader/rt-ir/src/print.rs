use crate::*;

impl Display for Node {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "%{}", self.0)
  }
}

impl Display for Shader {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(
      f,
      "shader {} ({:?}) nodes: {} scratch: {} constants: {}",
      self.name,
      self.stage,
      self.node_count,
      self.scratch_size,
      self.constant_data.len()
    )?;
    for (i, var) in self.variables.iter().enumerate() {
      writeln!(f, "  var ${i} {}: {:?}", var.name, var.ty)?;
    }
    print_block(self, &self.body, 1, f)
  }
}

fn join(nodes: &[Node]) -> String {
  nodes
    .iter()
    .map(|n| n.to_string())
    .collect::<Vec<_>>()
    .join(", ")
}

fn print_block(
  shader: &Shader,
  block: &[Instr],
  depth: usize,
  f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
  let pad = "  ".repeat(depth);
  let var_name = |var: &VariableId| {
    shader
      .variable(*var)
      .map(|v| v.name.as_str())
      .unwrap_or("?")
      .to_string()
  };

  for instr in block {
    match instr {
      Instr::Const { dst, value } => writeln!(f, "{pad}{dst} = {value}")?,
      Instr::Alu { dst, op, srcs } => writeln!(f, "{pad}{dst} = {op:?}({})", join(srcs))?,
      Instr::LoadVar { dst, var } => {
        writeln!(f, "{pad}{dst} = load ${}({})", var.0, var_name(var))?
      }
      Instr::StoreVar { var, src } => {
        writeln!(f, "{pad}store ${}({}) <- {src}", var.0, var_name(var))?
      }
      Instr::Intrinsic { dst, op, srcs } => match dst {
        Some(dst) => writeln!(f, "{pad}{dst} = @{op:?}({})", join(srcs))?,
        None => writeln!(f, "{pad}@{op:?}({})", join(srcs))?,
      },
      Instr::If {
        cond,
        then_block,
        else_block,
      } => {
        writeln!(f, "{pad}if {cond} {{")?;
        print_block(shader, then_block, depth + 1, f)?;
        if !else_block.is_empty() {
          writeln!(f, "{pad}}} else {{")?;
          print_block(shader, else_block, depth + 1, f)?;
        }
        writeln!(f, "{pad}}}")?;
      }
      Instr::Loop { body } => {
        writeln!(f, "{pad}loop {{")?;
        print_block(shader, body, depth + 1, f)?;
        writeln!(f, "{pad}}}")?;
      }
      Instr::Inlined { name, body } => {
        writeln!(f, "{pad}inlined {name} {{")?;
        print_block(shader, body, depth + 1, f)?;
        writeln!(f, "{pad}}}")?;
      }
      Instr::Break => writeln!(f, "{pad}break")?,
      Instr::Continue => writeln!(f, "{pad}continue")?,
      Instr::Return => writeln!(f, "{pad}return")?,
      Instr::Terminate => writeln!(f, "{pad}terminate")?,
    }
  }
  Ok(())
}
