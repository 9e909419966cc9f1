/// Tuning constants of the lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtLoweringConfig {
  pub wave_size: u32,
  /// entries of the per lane traversal stack kept in shared memory
  pub traversal_stack_entries: u32,
  /// case count from which inlined dispatch switches to binary search
  pub bsearch_threshold: usize,
  /// case count from which a possibly null index gets an explicit `!= 0` guard
  pub null_check_threshold: usize,
  /// sizes the traversal spill area, three spilled entries per level
  pub max_bvh_depth: u32,
  pub max_hit_attrib_slots: u32,
}

impl Default for RtLoweringConfig {
  fn default() -> Self {
    Self {
      wave_size: 32,
      traversal_stack_entries: 16,
      bsearch_threshold: 16,
      null_check_threshold: 3,
      max_bvh_depth: 64,
      max_hit_attrib_slots: 8,
    }
  }
}

impl RtLoweringConfig {
  pub fn with_wave_size(mut self, wave_size: u32) -> Self {
    self.wave_size = wave_size;
    self
  }

  pub fn with_traversal_stack_entries(mut self, entries: u32) -> Self {
    self.traversal_stack_entries = entries.max(1);
    self
  }

  pub fn with_bsearch_threshold(mut self, threshold: usize) -> Self {
    self.bsearch_threshold = threshold;
    self
  }

  pub fn with_null_check_threshold(mut self, threshold: usize) -> Self {
    self.null_check_threshold = threshold;
    self
  }

  pub fn with_max_bvh_depth(mut self, depth: u32) -> Self {
    self.max_bvh_depth = depth;
    self
  }

  pub fn with_max_hit_attrib_slots(mut self, slots: u32) -> Self {
    self.max_hit_attrib_slots = slots;
    self
  }

  /// bytes of shared memory holding hit attributes for a whole wave
  pub fn hit_attrib_shared_size(&self) -> u32 {
    self.max_hit_attrib_slots * self.wave_size * 4
  }

  /// shared offset of the traversal stacks, they follow the hit attributes
  pub fn traversal_stack_base(&self) -> u32 {
    self.hit_attrib_shared_size()
  }

  pub fn shared_size(&self) -> u32 {
    self.traversal_stack_base() + self.traversal_stack_entries * self.wave_size * 4
  }

  pub fn spill_entries(&self) -> u32 {
    self.max_bvh_depth * 3
  }
}

/// Limits of the software dispatch loop.
#[derive(Debug, Clone, Copy)]
pub struct EmulatorConfig {
  /// program launches allowed per wave before the dispatch is considered stuck
  pub max_launches: usize,
  pub loop_limit: u64,
  pub record_trace: bool,
}

impl Default for EmulatorConfig {
  fn default() -> Self {
    Self {
      max_launches: 4096,
      loop_limit: 1 << 20,
      record_trace: true,
    }
  }
}

impl EmulatorConfig {
  pub fn with_max_launches(mut self, launches: usize) -> Self {
    self.max_launches = launches;
    self
  }

  pub fn with_loop_limit(mut self, limit: u64) -> Self {
    self.loop_limit = limit;
    self
  }

  pub fn with_trace(mut self, record: bool) -> Self {
    self.record_trace = record;
    self
  }
}
