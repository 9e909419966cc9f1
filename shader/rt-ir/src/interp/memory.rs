use std::collections::BTreeMap;

use crate::*;

/// Sparse byte addressed device memory. Address zero is never mapped so it can serve as the
/// null handle.
#[derive(Debug, Clone, Default)]
pub struct GlobalMemory {
  regions: BTreeMap<u64, Vec<u8>>,
}

const FIRST_ALLOCATION: u64 = 0x1_0000;

impl GlobalMemory {
  /// place `bytes` after every existing region at `align`, returns the base address
  pub fn allocate(&mut self, bytes: Vec<u8>, align: u64) -> u64 {
    let end = self
      .regions
      .iter()
      .next_back()
      .map(|(base, data)| base + data.len() as u64)
      .unwrap_or(FIRST_ALLOCATION);
    let align = align.max(1);
    // keep a gap so overruns fault instead of silently reading the next region
    let base = (end + 256).div_ceil(align) * align;
    self.regions.insert(base, bytes);
    base
  }

  pub fn allocate_zeroed(&mut self, size: usize, align: u64) -> u64 {
    self.allocate(vec![0; size], align)
  }

  pub fn region(&self, base: u64) -> Option<&[u8]> {
    self.regions.get(&base).map(|v| v.as_slice())
  }

  fn locate(&self, addr: u64, len: usize) -> Result<(u64, usize), InterpError> {
    let fault = InterpError::UnmappedGlobal { addr, len };
    let (base, data) = self.regions.range(..=addr).next_back().ok_or(fault.clone())?;
    let start = (addr - base) as usize;
    if start + len > data.len() {
      return Err(fault);
    }
    Ok((*base, start))
  }

  pub fn read(&self, addr: u64, len: usize) -> Result<&[u8], InterpError> {
    let (base, start) = self.locate(addr, len)?;
    Ok(&self.regions[&base][start..start + len])
  }

  pub fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), InterpError> {
    let (base, start) = self.locate(addr, bytes.len())?;
    if let Some(data) = self.regions.get_mut(&base) {
      data[start..start + bytes.len()].copy_from_slice(bytes);
    }
    Ok(())
  }

  pub fn read_value(&self, ty: ValueType, addr: u64) -> Result<Value, InterpError> {
    let bytes = self.read(addr, ty.byte_size() as usize)?;
    Ok(Value::from_bytes(ty, bytes))
  }

  pub fn write_value(&mut self, addr: u64, value: Value) -> Result<(), InterpError> {
    self.write(addr, &value.to_bytes())
  }

  pub fn read_u32(&self, addr: u64) -> Result<u32, InterpError> {
    self.read_value(ValueType::U32, addr)?.as_u32()
  }

  pub fn read_u64(&self, addr: u64) -> Result<u64, InterpError> {
    self.read_value(ValueType::U64, addr)?.as_u64()
  }

  pub fn read_f32(&self, addr: u64) -> Result<f32, InterpError> {
    self.read_value(ValueType::F32, addr)?.as_f32()
  }

  pub fn read_vec3(&self, addr: u64) -> Result<[f32; 3], InterpError> {
    self.read_value(ValueType::Vec3, addr)?.as_vec3()
  }
}

/// per lane values passed between separately compiled programs
#[derive(Debug, Clone, Default)]
pub struct ShaderArgs {
  values: FastHashMap<ShaderArg, Value>,
}

impl ShaderArgs {
  /// unset arguments read as zero like an uninitialized register would
  pub fn get(&self, arg: ShaderArg) -> Value {
    self
      .values
      .get(&arg)
      .copied()
      .unwrap_or_else(|| arg.ty().zeroed())
  }

  pub fn set(&mut self, arg: ShaderArg, value: impl Into<Value>) {
    self.values.insert(arg, value.into());
  }

  pub fn u32(&self, arg: ShaderArg) -> u32 {
    self.get(arg).as_u32().unwrap_or_default()
  }

  pub fn u64(&self, arg: ShaderArg) -> u64 {
    self.get(arg).as_u64().unwrap_or_default()
  }
}

/// memory visible to one wavefront while it runs
pub struct WaveState {
  pub global: GlobalMemory,
  pub shared: Vec<u8>,
  pub scratch: Vec<Vec<u8>>,
  pub args: Vec<ShaderArgs>,
}

impl WaveState {
  pub fn new(global: GlobalMemory, lanes: usize, scratch_size: usize, shared_size: usize) -> Self {
    Self {
      global,
      shared: vec![0; shared_size],
      scratch: vec![vec![0; scratch_size]; lanes],
      args: vec![ShaderArgs::default(); lanes],
    }
  }

  pub fn lane_count(&self) -> usize {
    self.args.len()
  }

  pub(crate) fn read_scratch(
    &self,
    lane: usize,
    ty: ValueType,
    offset: u32,
  ) -> Result<Value, InterpError> {
    let scratch = &self.scratch[lane];
    let len = ty.byte_size() as usize;
    let start = offset as usize;
    if start + len > scratch.len() {
      return Err(InterpError::ScratchOutOfBounds {
        offset,
        len,
        size: scratch.len(),
      });
    }
    Ok(Value::from_bytes(ty, &scratch[start..start + len]))
  }

  pub(crate) fn write_scratch(
    &mut self,
    lane: usize,
    offset: u32,
    value: Value,
  ) -> Result<(), InterpError> {
    let scratch = &mut self.scratch[lane];
    let bytes = value.to_bytes();
    let start = offset as usize;
    if start + bytes.len() > scratch.len() {
      return Err(InterpError::ScratchOutOfBounds {
        offset,
        len: bytes.len(),
        size: scratch.len(),
      });
    }
    scratch[start..start + bytes.len()].copy_from_slice(&bytes);
    Ok(())
  }

  pub(crate) fn read_shared(&self, ty: ValueType, offset: u32) -> Result<Value, InterpError> {
    let len = ty.byte_size() as usize;
    let start = offset as usize;
    if start + len > self.shared.len() {
      return Err(InterpError::SharedOutOfBounds { offset, len });
    }
    Ok(Value::from_bytes(ty, &self.shared[start..start + len]))
  }

  pub(crate) fn write_shared(&mut self, offset: u32, value: Value) -> Result<(), InterpError> {
    let bytes = value.to_bytes();
    let start = offset as usize;
    if start + bytes.len() > self.shared.len() {
      return Err(InterpError::SharedOutOfBounds {
        offset,
        len: bytes.len(),
      });
    }
    self.shared[start..start + bytes.len()].copy_from_slice(&bytes);
    Ok(())
  }
}
