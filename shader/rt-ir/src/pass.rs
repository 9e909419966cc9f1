use crate::*;

/// Re-emits every instruction of `shader` through a builder.
///
/// `lower` is called for each non control flow instruction with the builder positioned where
/// the instruction would go. It returns `true` when it emitted a replacement and the
/// original should be dropped. Instructions emitted by `lower` are not visited again.
pub fn rewrite_instructions<E>(
  shader: Shader,
  mut lower: impl FnMut(&mut ShaderBuilder, &Instr) -> Result<bool, E>,
) -> Result<Shader, E> {
  let (mut builder, body) = ShaderBuilder::from_shader(shader);
  rewrite_block(&mut builder, body, &mut lower)?;
  Ok(builder.finish())
}

fn rewrite_block<E>(
  b: &mut ShaderBuilder,
  block: Block,
  lower: &mut impl FnMut(&mut ShaderBuilder, &Instr) -> Result<bool, E>,
) -> Result<(), E> {
  for instr in block {
    match instr {
      Instr::If {
        cond,
        then_block,
        else_block,
      } => {
        b.push_block();
        rewrite_block(b, then_block, lower)?;
        let then_block = b.pop_block();
        b.push_block();
        rewrite_block(b, else_block, lower)?;
        let else_block = b.pop_block();
        b.emit(Instr::If {
          cond,
          then_block,
          else_block,
        });
      }
      Instr::Loop { body } => {
        b.push_block();
        rewrite_block(b, body, lower)?;
        let body = b.pop_block();
        b.emit(Instr::Loop { body });
      }
      Instr::Inlined { name, body } => {
        b.push_block();
        rewrite_block(b, body, lower)?;
        let body = b.pop_block();
        b.emit(Instr::Inlined { name, body });
      }
      other => {
        if !lower(b, &other)? {
          b.emit(other);
        }
      }
    }
  }
  Ok(())
}

/// [`rewrite_instructions`] that only ever looks at intrinsics
pub fn rewrite_intrinsics<E>(
  shader: Shader,
  mut lower: impl FnMut(&mut ShaderBuilder, Option<Node>, Intrinsic, &[Node]) -> Result<bool, E>,
) -> Result<Shader, E> {
  rewrite_instructions(shader, |b, instr| match instr {
    Instr::Intrinsic { dst, op, srcs } => lower(b, *dst, *op, srcs),
    _ => Ok(false),
  })
}
