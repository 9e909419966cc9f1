use crate::*;

fn map_float(v: &Value, f: impl Fn(f32) -> f32) -> Option<Value> {
  Some(match v {
    Value::F32(a) => Value::F32(f(*a)),
    Value::Vec2(a) => Value::Vec2(a.map(f)),
    Value::Vec3(a) => Value::Vec3(a.map(f)),
    Value::Vec4(a) => Value::Vec4(a.map(f)),
    _ => return None,
  })
}

fn zip_float(a: &Value, b: &Value, f: impl Fn(f32, f32) -> f32) -> Option<Value> {
  fn zip<const N: usize>(a: &[f32; N], b: &[f32; N], f: impl Fn(f32, f32) -> f32) -> [f32; N] {
    std::array::from_fn(|i| f(a[i], b[i]))
  }
  Some(match (a, b) {
    (Value::F32(a), Value::F32(b)) => Value::F32(f(*a, *b)),
    (Value::Vec2(a), Value::Vec2(b)) => Value::Vec2(zip(a, b, f)),
    (Value::Vec3(a), Value::Vec3(b)) => Value::Vec3(zip(a, b, f)),
    (Value::Vec4(a), Value::Vec4(b)) => Value::Vec4(zip(a, b, f)),
    // vector by scalar
    (Value::Vec3(a), Value::F32(b)) => Value::Vec3(a.map(|x| f(x, *b))),
    _ => return None,
  })
}

fn zip_int(
  a: &Value,
  b: &Value,
  f32_: impl Fn(u32, u32) -> Option<u32>,
  f64_: impl Fn(u64, u64) -> Option<u64>,
) -> Option<Result<Value, InterpError>> {
  Some(match (a, b) {
    (Value::U32(a), Value::U32(b)) => f32_(*a, *b)
      .map(Value::U32)
      .ok_or(InterpError::DivisionByZero),
    (Value::U64(a), Value::U64(b)) => f64_(*a, *b)
      .map(Value::U64)
      .ok_or(InterpError::DivisionByZero),
    _ => return None,
  })
}

fn compare_uint(a: &Value, b: &Value, f: impl Fn(u64, u64) -> bool) -> Option<Value> {
  match (a, b) {
    (Value::U32(a), Value::U32(b)) => Some(Value::Bool(f(*a as u64, *b as u64))),
    (Value::U64(a), Value::U64(b)) => Some(Value::Bool(f(*a, *b))),
    _ => None,
  }
}

fn float_component(v: &Value, channel: usize) -> Option<Value> {
  match v {
    Value::Vec2(a) => a.get(channel).map(|x| Value::F32(*x)),
    Value::Vec3(a) => a.get(channel).map(|x| Value::F32(*x)),
    Value::Vec4(a) => a.get(channel).map(|x| Value::F32(*x)),
    Value::UVec3(a) => a.get(channel).map(|x| Value::U32(*x)),
    Value::UVec4(a) => a.get(channel).map(|x| Value::U32(*x)),
    _ => None,
  }
}

fn construct(ty: ValueType, parts: &[Value]) -> Option<Value> {
  if parts.len() != ty.component_count() {
    return None;
  }
  let floats = || -> Option<Vec<f32>> { parts.iter().map(|p| p.as_f32().ok()).collect() };
  let uints = || -> Option<Vec<u32>> { parts.iter().map(|p| p.as_u32().ok()).collect() };
  Some(match ty {
    ValueType::Vec2 => Value::Vec2(floats()?.try_into().ok()?),
    ValueType::Vec3 => Value::Vec3(floats()?.try_into().ok()?),
    ValueType::Vec4 => Value::Vec4(floats()?.try_into().ok()?),
    ValueType::UVec3 => Value::UVec3(uints()?.try_into().ok()?),
    ValueType::UVec4 => Value::UVec4(uints()?.try_into().ok()?),
    _ => return None,
  })
}

pub fn eval_alu(op: AluOp, srcs: &[Value]) -> Result<Value, InterpError> {
  use Value::*;
  let mismatch = || InterpError::AluOperands {
    op,
    operands: srcs.iter().map(Value::ty).collect(),
  };

  let result = match (op, srcs) {
    (AluOp::Mov, [a]) => Some(*a),

    (AluOp::IAdd, [a, b]) => zip_int(
      a,
      b,
      |a, b| Some(a.wrapping_add(b)),
      |a, b| Some(a.wrapping_add(b)),
    )
    .transpose()?,
    (AluOp::ISub, [a, b]) => zip_int(
      a,
      b,
      |a, b| Some(a.wrapping_sub(b)),
      |a, b| Some(a.wrapping_sub(b)),
    )
    .transpose()?,
    (AluOp::IMul, [a, b]) => zip_int(
      a,
      b,
      |a, b| Some(a.wrapping_mul(b)),
      |a, b| Some(a.wrapping_mul(b)),
    )
    .transpose()?,
    (AluOp::UDiv, [a, b]) => {
      zip_int(a, b, |a, b| a.checked_div(b), |a, b| a.checked_div(b)).transpose()?
    }
    (AluOp::UMod, [a, b]) => {
      zip_int(a, b, |a, b| a.checked_rem(b), |a, b| a.checked_rem(b)).transpose()?
    }

    (AluOp::IAnd, [Bool(a), Bool(b)]) => Some(Bool(*a && *b)),
    (AluOp::IOr, [Bool(a), Bool(b)]) => Some(Bool(*a || *b)),
    (AluOp::IXor, [Bool(a), Bool(b)]) => Some(Bool(*a != *b)),
    (AluOp::IAnd, [a, b]) => zip_int(a, b, |a, b| Some(a & b), |a, b| Some(a & b)).transpose()?,
    (AluOp::IOr, [a, b]) => zip_int(a, b, |a, b| Some(a | b), |a, b| Some(a | b)).transpose()?,
    (AluOp::IXor, [a, b]) => zip_int(a, b, |a, b| Some(a ^ b), |a, b| Some(a ^ b)).transpose()?,
    (AluOp::INot, [Bool(a)]) => Some(Bool(!a)),
    (AluOp::INot, [U32(a)]) => Some(U32(!a)),
    (AluOp::INot, [U64(a)]) => Some(U64(!a)),

    (AluOp::IShl, [U32(a), U32(s)]) => Some(U32(a.wrapping_shl(*s))),
    (AluOp::IShl, [U64(a), U32(s)]) => Some(U64(a.wrapping_shl(*s))),
    (AluOp::UShr, [U32(a), U32(s)]) => Some(U32(a.wrapping_shr(*s))),
    (AluOp::UShr, [U64(a), U32(s)]) => Some(U64(a.wrapping_shr(*s))),

    (AluOp::IEq, [a, b]) if a.ty() == b.ty() => Some(Bool(a == b)),
    (AluOp::INe, [a, b]) if a.ty() == b.ty() => Some(Bool(a != b)),
    (AluOp::ULt, [a, b]) => compare_uint(a, b, |a, b| a < b),
    (AluOp::UGe, [a, b]) => compare_uint(a, b, |a, b| a >= b),

    (AluOp::FAdd, [a, b]) => zip_float(a, b, |a, b| a + b),
    (AluOp::FSub, [a, b]) => zip_float(a, b, |a, b| a - b),
    (AluOp::FMul, [a, b]) => zip_float(a, b, |a, b| a * b),
    (AluOp::FDiv, [a, b]) => zip_float(a, b, |a, b| a / b),
    (AluOp::FMin, [a, b]) => zip_float(a, b, f32::min),
    (AluOp::FMax, [a, b]) => zip_float(a, b, f32::max),
    (AluOp::FRcp, [a]) => map_float(a, |a| 1. / a),
    (AluOp::FNeg, [a]) => map_float(a, |a| -a),
    (AluOp::FAbs, [a]) => map_float(a, f32::abs),
    (AluOp::FLt, [F32(a), F32(b)]) => Some(Bool(a < b)),
    (AluOp::FGe, [F32(a), F32(b)]) => Some(Bool(a >= b)),
    (AluOp::Dot3, [Vec3(a), Vec3(b)]) => Some(F32(a[0] * b[0] + a[1] * b[1] + a[2] * b[2])),

    (AluOp::BCsel, [Bool(c), a, b]) if a.ty() == b.ty() => Some(if *c { *a } else { *b }),

    (AluOp::ToU64, [U32(a)]) => Some(U64(*a as u64)),
    (AluOp::ToU64, [U64(a)]) => Some(U64(*a)),
    (AluOp::ToU32, [U64(a)]) => Some(U32(*a as u32)),
    (AluOp::ToU32, [U32(a)]) => Some(U32(*a)),
    (AluOp::U2F, [U32(a)]) => Some(F32(*a as f32)),
    (AluOp::BoolToU32, [Bool(a)]) => Some(U32(*a as u32)),
    (AluOp::FindLsb, [U32(a)]) => Some(U32(if *a == 0 { u32::MAX } else { a.trailing_zeros() })),
    (AluOp::FindLsb, [U64(a)]) => Some(U32(if *a == 0 { u32::MAX } else { a.trailing_zeros() })),

    (AluOp::Construct(ty), parts) => construct(ty, parts),
    (AluOp::Extract(channel), [v]) => float_component(v, channel as usize),

    _ => None,
  };

  result.ok_or_else(mismatch)
}
