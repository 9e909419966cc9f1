use bytemuck::{Pod, Zeroable};

use crate::*;

pub const SBT_HANDLE_SIZE: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbtTable {
  RayGen,
  Miss,
  Hit,
  Callable,
}

impl SbtTable {
  /// offset of the table address inside [`SbtDescriptor`]
  pub fn descriptor_offset(&self) -> u64 {
    match self {
      SbtTable::RayGen => 0,
      SbtTable::Miss => 16,
      SbtTable::Hit => 40,
      SbtTable::Callable => 64,
    }
  }

  /// ray generation has no stride, its record size is used instead
  pub fn stride_offset(&self) -> u64 {
    match self {
      SbtTable::RayGen => 8,
      other => other.descriptor_offset() + 16,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbtField {
  RecursivePtr,
  GeneralIdx,
  ClosestHitIdx,
  IntersectionIdx,
  AnyHitIdx,
}

impl SbtField {
  pub fn offset(&self) -> u64 {
    match self {
      SbtField::RecursivePtr => 0,
      SbtField::GeneralIdx | SbtField::ClosestHitIdx => 8,
      SbtField::IntersectionIdx | SbtField::AnyHitIdx => 12,
    }
  }
}

/// Reads one field of the `index`th record of `table`.
///
/// A recursive pointer lands in `shader_addr`, handle indices land in `idx`. The inline record
/// following the handle becomes the shader record pointer. The index is not range checked.
pub fn load_sbt_entry(
  b: &mut ShaderBuilder,
  vars: &RtVariables,
  index: Node,
  table: SbtTable,
  field: SbtField,
) {
  let descriptors = b.load_arg(ShaderArg::SbtDescriptors);
  let base = b.load_global_at(ValueType::U64, descriptors, table.descriptor_offset());
  let stride = b.load_global_at(ValueType::U32, descriptors, table.stride_offset());
  let row = b.imul(index, stride);
  let entry = b.address_offset(base, row);

  match field {
    SbtField::RecursivePtr => {
      let addr = b.load_global_at(ValueType::U64, entry, field.offset());
      b.store_var(vars.shader_addr, addr);
    }
    _ => {
      let idx = b.load_global_at(ValueType::U32, entry, field.offset());
      b.store_var(vars.idx, idx);
    }
  }

  let record = b.iadd_imm64(entry, SBT_HANDLE_SIZE as u64);
  b.store_var(vars.shader_record_ptr, record);
}

/// Opaque group handle as it is copied into shader binding table records.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ShaderGroupHandle {
  /// compiled program address tagged with its priority, zero for no program
  pub recursive_shader_ptr: u64,
  pub general_or_closest_hit_index: u32,
  pub any_hit_or_intersection_index: u32,
  pub padding: [u32; 4],
}

/// Table addresses handed to shaders through [`ShaderArg::SbtDescriptors`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SbtDescriptor {
  pub raygen_address: u64,
  pub raygen_size: u64,
  pub miss_address: u64,
  pub miss_size: u64,
  pub miss_stride: u64,
  pub hit_address: u64,
  pub hit_size: u64,
  pub hit_stride: u64,
  pub callable_address: u64,
  pub callable_size: u64,
  pub callable_stride: u64,
  pub launch_size: [u32; 3],
  pub padding: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ShaderRecord {
  pub handle: ShaderGroupHandle,
  pub inline_data: Vec<u8>,
}

impl ShaderRecord {
  pub fn new(handle: ShaderGroupHandle) -> Self {
    Self {
      handle,
      inline_data: Vec::new(),
    }
  }

  pub fn with_inline_data(mut self, data: &[u8]) -> Self {
    self.inline_data = data.to_vec();
    self
  }
}

/// Host side layout of the four record tables.
///
/// Hit records are addressed by `record_index * ray_type_count + ray_ty_idx`, which matches
/// tracing with `sbt_stride = ray_type_count` and instances whose sbt offset is
/// `record_index * ray_type_count`.
pub struct ShaderBindingTableBuilder {
  ray_type_count: u32,
  ray_generation: Option<ShaderRecord>,
  ray_miss: Vec<Option<ShaderRecord>>,
  ray_hit: Vec<Option<ShaderRecord>>,
  callable: Vec<Option<ShaderRecord>>,
}

fn place(rows: &mut Vec<Option<ShaderRecord>>, index: usize, record: ShaderRecord) {
  if rows.len() <= index {
    rows.resize(index + 1, None);
  }
  rows[index] = Some(record);
}

impl ShaderBindingTableBuilder {
  pub fn new(ray_type_count: u32) -> Self {
    Self {
      ray_type_count: ray_type_count.max(1),
      ray_generation: None,
      ray_miss: Vec::new(),
      ray_hit: Vec::new(),
      callable: Vec::new(),
    }
  }

  pub fn config_ray_generation(&mut self, s: ShaderRecord) -> &mut Self {
    self.ray_generation = Some(s);
    self
  }

  pub fn config_missing(&mut self, ray_ty_idx: u32, s: ShaderRecord) -> &mut Self {
    place(&mut self.ray_miss, ray_ty_idx as usize, s);
    self
  }

  pub fn config_hit_group(
    &mut self,
    record_index: u32,
    ray_ty_idx: u32,
    hit_group: ShaderRecord,
  ) -> &mut Self {
    let row = record_index * self.ray_type_count + ray_ty_idx;
    place(&mut self.ray_hit, row as usize, hit_group);
    self
  }

  pub fn config_callable(&mut self, index: u32, s: ShaderRecord) -> &mut Self {
    place(&mut self.callable, index as usize, s);
    self
  }

  pub fn has_ray_generation(&self) -> bool {
    self.ray_generation.is_some()
  }

  /// Uploads the tables and the descriptor, returns the descriptor address.
  pub fn write(&self, memory: &mut GlobalMemory, launch_size: [u32; 3]) -> u64 {
    fn upload(memory: &mut GlobalMemory, rows: &[Option<ShaderRecord>]) -> (u64, u64, u64) {
      if rows.is_empty() {
        return (0, 0, 0);
      }
      let inline = rows
        .iter()
        .flatten()
        .map(|r| r.inline_data.len() as u32)
        .max()
        .unwrap_or(0);
      let stride = align_up(SBT_HANDLE_SIZE + inline, SBT_HANDLE_SIZE) as usize;
      let mut data = vec![0u8; stride * rows.len()];
      for (row, record) in rows.iter().enumerate() {
        if let Some(record) = record {
          let start = row * stride;
          let handle = bytemuck::bytes_of(&record.handle);
          data[start..start + handle.len()].copy_from_slice(handle);
          let inline_start = start + SBT_HANDLE_SIZE as usize;
          data[inline_start..inline_start + record.inline_data.len()]
            .copy_from_slice(&record.inline_data);
        }
      }
      let size = data.len() as u64;
      let address = memory.allocate(data, 64);
      (address, size, stride as u64)
    }

    let raygen = upload(memory, std::slice::from_ref(&self.ray_generation));
    let miss = upload(memory, &self.ray_miss);
    let hit = upload(memory, &self.ray_hit);
    let callable = upload(memory, &self.callable);

    let descriptor = SbtDescriptor {
      raygen_address: raygen.0,
      raygen_size: raygen.2,
      miss_address: miss.0,
      miss_size: miss.1,
      miss_stride: miss.2,
      hit_address: hit.0,
      hit_size: hit.1,
      hit_stride: hit.2,
      callable_address: callable.0,
      callable_size: callable.1,
      callable_stride: callable.2,
      launch_size,
      padding: 0,
    };
    let address = memory.allocate(bytemuck::bytes_of(&descriptor).to_vec(), 64);
    debug!(
      "uploaded shader binding table: {} miss, {} hit, {} callable rows",
      self.ray_miss.len(),
      self.ray_hit.len(),
      self.callable.len()
    );
    address
  }
}
