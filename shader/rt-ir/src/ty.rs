use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
  Bool,
  U32,
  U64,
  F32,
  Vec2,
  Vec3,
  Vec4,
  UVec3,
  UVec4,
}

impl ValueType {
  /// size in bytes when the value lives in memory. bool is stored as a u32.
  pub fn byte_size(&self) -> u32 {
    match self {
      ValueType::Bool | ValueType::U32 | ValueType::F32 => 4,
      ValueType::U64 | ValueType::Vec2 => 8,
      ValueType::Vec3 | ValueType::UVec3 => 12,
      ValueType::Vec4 | ValueType::UVec4 => 16,
    }
  }

  pub fn zeroed(&self) -> Value {
    match self {
      ValueType::Bool => Value::Bool(false),
      ValueType::U32 => Value::U32(0),
      ValueType::U64 => Value::U64(0),
      ValueType::F32 => Value::F32(0.),
      ValueType::Vec2 => Value::Vec2([0.; 2]),
      ValueType::Vec3 => Value::Vec3([0.; 3]),
      ValueType::Vec4 => Value::Vec4([0.; 4]),
      ValueType::UVec3 => Value::UVec3([0; 3]),
      ValueType::UVec4 => Value::UVec4([0; 4]),
    }
  }

  pub fn component_count(&self) -> usize {
    match self {
      ValueType::Vec2 => 2,
      ValueType::Vec3 | ValueType::UVec3 => 3,
      ValueType::Vec4 | ValueType::UVec4 => 4,
      _ => 1,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
  Bool(bool),
  U32(u32),
  U64(u64),
  F32(f32),
  Vec2([f32; 2]),
  Vec3([f32; 3]),
  Vec4([f32; 4]),
  UVec3([u32; 3]),
  UVec4([u32; 4]),
}

impl Value {
  pub fn ty(&self) -> ValueType {
    match self {
      Value::Bool(_) => ValueType::Bool,
      Value::U32(_) => ValueType::U32,
      Value::U64(_) => ValueType::U64,
      Value::F32(_) => ValueType::F32,
      Value::Vec2(_) => ValueType::Vec2,
      Value::Vec3(_) => ValueType::Vec3,
      Value::Vec4(_) => ValueType::Vec4,
      Value::UVec3(_) => ValueType::UVec3,
      Value::UVec4(_) => ValueType::UVec4,
    }
  }

  fn mismatch(&self, expected: ValueType) -> InterpError {
    InterpError::TypeMismatch {
      expected,
      found: self.ty(),
    }
  }

  pub fn as_bool(&self) -> Result<bool, InterpError> {
    match self {
      Value::Bool(v) => Ok(*v),
      _ => Err(self.mismatch(ValueType::Bool)),
    }
  }

  pub fn as_u32(&self) -> Result<u32, InterpError> {
    match self {
      Value::U32(v) => Ok(*v),
      _ => Err(self.mismatch(ValueType::U32)),
    }
  }

  pub fn as_u64(&self) -> Result<u64, InterpError> {
    match self {
      Value::U64(v) => Ok(*v),
      _ => Err(self.mismatch(ValueType::U64)),
    }
  }

  pub fn as_f32(&self) -> Result<f32, InterpError> {
    match self {
      Value::F32(v) => Ok(*v),
      _ => Err(self.mismatch(ValueType::F32)),
    }
  }

  pub fn as_vec2(&self) -> Result<[f32; 2], InterpError> {
    match self {
      Value::Vec2(v) => Ok(*v),
      _ => Err(self.mismatch(ValueType::Vec2)),
    }
  }

  pub fn as_vec3(&self) -> Result<[f32; 3], InterpError> {
    match self {
      Value::Vec3(v) => Ok(*v),
      _ => Err(self.mismatch(ValueType::Vec3)),
    }
  }

  pub fn as_vec4(&self) -> Result<[f32; 4], InterpError> {
    match self {
      Value::Vec4(v) => Ok(*v),
      _ => Err(self.mismatch(ValueType::Vec4)),
    }
  }

  pub fn as_uvec4(&self) -> Result<[u32; 4], InterpError> {
    match self {
      Value::UVec4(v) => Ok(*v),
      _ => Err(self.mismatch(ValueType::UVec4)),
    }
  }

  /// little endian memory image of this value
  pub fn to_bytes(&self) -> Vec<u8> {
    match self {
      Value::Bool(v) => (*v as u32).to_le_bytes().to_vec(),
      Value::U32(v) => v.to_le_bytes().to_vec(),
      Value::U64(v) => v.to_le_bytes().to_vec(),
      Value::F32(v) => v.to_le_bytes().to_vec(),
      Value::Vec2(v) => bytemuck::cast_slice::<_, u8>(v.as_slice()).to_vec(),
      Value::Vec3(v) => bytemuck::cast_slice::<_, u8>(v.as_slice()).to_vec(),
      Value::Vec4(v) => bytemuck::cast_slice::<_, u8>(v.as_slice()).to_vec(),
      Value::UVec3(v) => bytemuck::cast_slice::<_, u8>(v.as_slice()).to_vec(),
      Value::UVec4(v) => bytemuck::cast_slice::<_, u8>(v.as_slice()).to_vec(),
    }
  }

  /// `bytes` must hold at least `ty.byte_size()` bytes.
  pub fn from_bytes(ty: ValueType, bytes: &[u8]) -> Value {
    let bytes = &bytes[..ty.byte_size() as usize];
    match ty {
      ValueType::Bool => Value::Bool(bytemuck::pod_read_unaligned::<u32>(bytes) != 0),
      ValueType::U32 => Value::U32(bytemuck::pod_read_unaligned(bytes)),
      ValueType::U64 => Value::U64(bytemuck::pod_read_unaligned(bytes)),
      ValueType::F32 => Value::F32(bytemuck::pod_read_unaligned(bytes)),
      ValueType::Vec2 => Value::Vec2(bytemuck::pod_read_unaligned(bytes)),
      ValueType::Vec3 => Value::Vec3(bytemuck::pod_read_unaligned(bytes)),
      ValueType::Vec4 => Value::Vec4(bytemuck::pod_read_unaligned(bytes)),
      ValueType::UVec3 => Value::UVec3(bytemuck::pod_read_unaligned(bytes)),
      ValueType::UVec4 => Value::UVec4(bytemuck::pod_read_unaligned(bytes)),
    }
  }
}

impl From<bool> for Value {
  fn from(v: bool) -> Self {
    Value::Bool(v)
  }
}
impl From<u32> for Value {
  fn from(v: u32) -> Self {
    Value::U32(v)
  }
}
impl From<u64> for Value {
  fn from(v: u64) -> Self {
    Value::U64(v)
  }
}
impl From<f32> for Value {
  fn from(v: f32) -> Self {
    Value::F32(v)
  }
}
impl From<[f32; 3]> for Value {
  fn from(v: [f32; 3]) -> Self {
    Value::Vec3(v)
  }
}

impl Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::Bool(v) => write!(f, "{v}"),
      Value::U32(v) => write!(f, "{v:#x}u32"),
      Value::U64(v) => write!(f, "{v:#x}u64"),
      Value::F32(v) => write!(f, "{v:?}f"),
      Value::Vec2(v) => write!(f, "vec2{v:?}"),
      Value::Vec3(v) => write!(f, "vec3{v:?}"),
      Value::Vec4(v) => write!(f, "vec4{v:?}"),
      Value::UVec3(v) => write!(f, "uvec3{v:?}"),
      Value::UVec4(v) => write!(f, "uvec4{v:?}"),
    }
  }
}
