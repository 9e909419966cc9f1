use std::convert::Infallible;

use crate::*;

pub(crate) fn infallible<T>(result: Result<T, Infallible>) -> T {
  match result {
    Ok(v) => v,
    Err(never) => match never {},
  }
}

/// give a lowered value the handle the replaced instruction defined
pub(crate) fn define(b: &mut ShaderBuilder, dst: Option<Node>, value: Node) {
  if let Some(dst) = dst {
    b.mov_to(dst, value);
  }
}

/// Payload accesses become frame relative scratch accesses at the incoming payload offset.
pub fn lower_rt_io(shader: Shader) -> Shader {
  let shader = infallible(rewrite_intrinsics(shader, |b, dst, op, srcs| {
    Ok(match op {
      Intrinsic::LoadPayload { ty, offset } => {
        let arg = b.intrinsic(Intrinsic::RtArgScratchOffset, &[]);
        let address = b.iadd_imm(arg, offset);
        let value = b.intrinsic(
          Intrinsic::LoadScratch {
            ty,
            base: ScratchBase::Frame,
          },
          &[address],
        );
        define(b, dst, value);
        true
      }
      Intrinsic::StorePayload { offset } => {
        let arg = b.intrinsic(Intrinsic::RtArgScratchOffset, &[]);
        let address = b.iadd_imm(arg, offset);
        b.intrinsic_void(
          Intrinsic::StoreScratch {
            base: ScratchBase::Frame,
          },
          &[srcs[0], address],
        );
        true
      }
      _ => false,
    })
  }));
  debug!("lower_rt_io: {}", shader.name);
  shader
}

/// Where a program keeps the hit attributes.
pub enum HitAttribStorage<'a> {
  /// program variables, one per slot
  Locals(&'a [VariableId]),
  /// the wave's shared hit attribute area
  Shared { wave_size: u32 },
}

pub fn declare_hit_attrib_locals(shader: &mut Shader, slots: u32) -> Vec<VariableId> {
  (0..slots)
    .map(|slot| shader.declare_variable(format!("hit_attrib.{slot}"), ValueType::F32))
    .collect()
}

/// shared offset of one lane's hit attribute slot
pub fn hit_attrib_shared_offset(b: &mut ShaderBuilder, slot: u32, wave_size: u32) -> Node {
  let lane = b.intrinsic(Intrinsic::LocalInvocationIndex, &[]);
  let index = b.iadd_imm(lane, slot * wave_size);
  b.imul_imm(index, 4)
}

pub fn lower_hit_attribs(
  shader: Shader,
  storage: HitAttribStorage,
  slot_limit: u32,
) -> Result<Shader, RtCompileError> {
  let name = shader.name.clone();
  let check = |slot: u32| {
    if slot >= slot_limit {
      Err(RtCompileError::HitAttribSlotOutOfRange {
        shader: name.clone(),
        slot,
        limit: slot_limit,
      })
    } else {
      Ok(())
    }
  };

  let shader = rewrite_intrinsics(shader, |b, dst, op, srcs| {
    Ok(match (op, &storage) {
      (Intrinsic::LoadHitAttrib { slot }, HitAttribStorage::Locals(locals)) => {
        check(slot)?;
        let value = b.load_var(locals[slot as usize]);
        define(b, dst, value);
        true
      }
      (Intrinsic::StoreHitAttrib { slot }, HitAttribStorage::Locals(locals)) => {
        check(slot)?;
        b.store_var(locals[slot as usize], srcs[0]);
        true
      }
      (Intrinsic::LoadHitAttrib { slot }, HitAttribStorage::Shared { wave_size }) => {
        check(slot)?;
        let offset = hit_attrib_shared_offset(b, slot, *wave_size);
        let value = b.intrinsic(Intrinsic::LoadShared { ty: ValueType::F32 }, &[offset]);
        define(b, dst, value);
        true
      }
      (Intrinsic::StoreHitAttrib { slot }, HitAttribStorage::Shared { wave_size }) => {
        check(slot)?;
        let offset = hit_attrib_shared_offset(b, slot, *wave_size);
        b.intrinsic_void(Intrinsic::StoreShared, &[srcs[0], offset]);
        true
      }
      _ => false,
    })
  })?;
  debug!("lower_hit_attribs: {}", shader.name);
  Ok(shader)
}
