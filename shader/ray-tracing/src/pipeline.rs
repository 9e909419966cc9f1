use crate::*;

bitflags::bitflags! {
  /// pipeline creation flags that let the lowering drop null checks and candidate kinds
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
  pub struct PipelineFlags: u32 {
    const NO_NULL_ANY_HIT = 1 << 0;
    const NO_NULL_CLOSEST_HIT = 1 << 1;
    const NO_NULL_MISS = 1 << 2;
    const NO_NULL_INTERSECTION = 1 << 3;
    const SKIP_TRIANGLES = 1 << 4;
    const SKIP_AABBS = 1 << 5;
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderGroup {
  General {
    general: u32,
  },
  TrianglesHitGroup {
    closest_hit: Option<u32>,
    any_hit: Option<u32>,
  },
  ProceduralHitGroup {
    closest_hit: Option<u32>,
    any_hit: Option<u32>,
    intersection: u32,
  },
}

/// The two handle indices a group writes into its shader binding table record, zero means no
/// shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupHandleIndices {
  /// general index, or closest hit index for hit groups
  pub general_or_closest_hit: u32,
  /// any hit index for triangle groups, intersection index for procedural groups
  pub any_hit_or_intersection: u32,
}

pub struct RayTracingPipelineDescriptor {
  pub stages: Vec<Shader>,
  pub groups: Vec<ShaderGroup>,
  pub max_recursion_depth: u32,
  pub flags: PipelineFlags,
}

impl Default for RayTracingPipelineDescriptor {
  fn default() -> Self {
    Self {
      stages: Vec::new(),
      groups: Vec::new(),
      max_recursion_depth: 1,
      flags: PipelineFlags::empty(),
    }
  }
}

impl RayTracingPipelineDescriptor {
  pub fn with_max_recursion_depth(mut self, max_recursion_depth: u32) -> Self {
    self.max_recursion_depth = max_recursion_depth;
    self
  }

  pub fn with_flags(mut self, flags: PipelineFlags) -> Self {
    self.flags = flags;
    self
  }

  pub fn register_stage(&mut self, shader: Shader) -> u32 {
    self.stages.push(shader);
    self.stages.len() as u32 - 1
  }

  pub fn register_group(&mut self, group: ShaderGroup) -> u32 {
    self.groups.push(group);
    self.groups.len() as u32 - 1
  }

  /// registers the stage and a general group for it, returns the group index
  pub fn register_general(&mut self, shader: Shader) -> u32 {
    let general = self.register_stage(shader);
    self.register_group(ShaderGroup::General { general })
  }

  pub fn stage(&self, index: u32) -> Option<&Shader> {
    self.stages.get(index as usize)
  }

  fn stage_kind(&self, index: u32) -> Option<ShaderStage> {
    self.stage(index).map(|s| s.stage)
  }

  pub fn validate(&self) -> Result<(), RtCompileError> {
    if self.max_recursion_depth > 31 {
      return Err(RtCompileError::RecursionDepthTooLarge(
        self.max_recursion_depth,
      ));
    }
    if !self.stages.iter().any(|s| s.stage == ShaderStage::RayGen) {
      return Err(RtCompileError::MissingRayGen);
    }

    for (group_index, group) in self.groups.iter().enumerate() {
      let check = |stage: u32, expected: ShaderStage| -> Result<(), RtCompileError> {
        let found = self
          .stage_kind(stage)
          .ok_or(RtCompileError::StageOutOfRange {
            group: group_index,
            stage,
            count: self.stages.len(),
          })?;
        if found != expected {
          return Err(RtCompileError::StageKindMismatch {
            group: group_index,
            stage,
            expected,
            found,
          });
        }
        Ok(())
      };

      match *group {
        ShaderGroup::General { general } => {
          let found = self
            .stage_kind(general)
            .ok_or(RtCompileError::StageOutOfRange {
              group: group_index,
              stage: general,
              count: self.stages.len(),
            })?;
          if !matches!(
            found,
            ShaderStage::RayGen | ShaderStage::Miss | ShaderStage::Callable
          ) {
            return Err(RtCompileError::InvalidGeneralStage {
              group: group_index,
              found,
            });
          }
        }
        ShaderGroup::TrianglesHitGroup {
          closest_hit,
          any_hit,
        } => {
          if let Some(chit) = closest_hit {
            check(chit, ShaderStage::ClosestHit)?;
          }
          if let Some(ahit) = any_hit {
            check(ahit, ShaderStage::AnyHit)?;
          }
        }
        ShaderGroup::ProceduralHitGroup {
          closest_hit,
          any_hit,
          intersection,
        } => {
          if let Some(chit) = closest_hit {
            check(chit, ShaderStage::ClosestHit)?;
          }
          if let Some(ahit) = any_hit {
            check(ahit, ShaderStage::AnyHit)?;
          }
          check(intersection, ShaderStage::Intersection)?;
        }
      }
    }
    Ok(())
  }

  pub fn has_stage(&self, stage: ShaderStage) -> bool {
    self.stages.iter().any(|s| s.stage == stage)
  }

  /// handle index of a single stage
  pub fn stage_handle_index(stage: Option<u32>) -> u32 {
    stage.map(|s| s + 1).unwrap_or(0)
  }

  /// every (intersection, any hit) pair gets its own index as the pair is inlined as one case
  pub fn intersection_handle_index(&self, intersection: u32, any_hit: Option<u32>) -> u32 {
    let any_hit = Self::stage_handle_index(any_hit);
    1 + intersection + any_hit * self.stages.len() as u32
  }

  pub fn group_handle_indices(&self, group: &ShaderGroup) -> GroupHandleIndices {
    match *group {
      ShaderGroup::General { general } => GroupHandleIndices {
        general_or_closest_hit: Self::stage_handle_index(Some(general)),
        any_hit_or_intersection: 0,
      },
      ShaderGroup::TrianglesHitGroup {
        closest_hit,
        any_hit,
      } => GroupHandleIndices {
        general_or_closest_hit: Self::stage_handle_index(closest_hit),
        any_hit_or_intersection: Self::stage_handle_index(any_hit),
      },
      ShaderGroup::ProceduralHitGroup {
        closest_hit,
        any_hit,
        intersection,
      } => GroupHandleIndices {
        general_or_closest_hit: Self::stage_handle_index(closest_hit),
        any_hit_or_intersection: self.intersection_handle_index(intersection, any_hit),
      },
    }
  }

  /// stage whose compiled program a group's record jumps to through the recursive pointer
  pub fn group_recursive_stage(&self, group: &ShaderGroup) -> Option<u32> {
    match *group {
      ShaderGroup::General { general } => Some(general),
      ShaderGroup::TrianglesHitGroup { closest_hit, .. }
      | ShaderGroup::ProceduralHitGroup { closest_hit, .. } => closest_hit,
    }
  }

  /// largest scratch an inlined any-hit or fused intersection case needs
  pub fn max_candidate_scratch(&self) -> u32 {
    let scratch = |stage: Option<u32>| {
      stage
        .and_then(|s| self.stage(s))
        .map(|s| s.scratch_size)
        .unwrap_or(0)
    };
    self
      .groups
      .iter()
      .map(|group| match *group {
        ShaderGroup::TrianglesHitGroup { any_hit, .. } => scratch(any_hit),
        ShaderGroup::ProceduralHitGroup {
          any_hit,
          intersection,
          ..
        } => align_up(scratch(Some(intersection)), 16) + scratch(any_hit),
        ShaderGroup::General { .. } => 0,
      })
      .max()
      .unwrap_or(0)
  }
}

/// Which stage of a group is inlined at a dispatch site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineCaseKind {
  AnyHit,
  Intersection,
  ClosestHit,
  Miss,
}

/// One group contributing a case to an inlined dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCase {
  pub call_idx: u32,
  pub stage: u32,
  /// any hit fused into an intersection case
  pub any_hit: Option<u32>,
}

impl InlineCaseKind {
  pub fn group_case(
    &self,
    pipeline: &RayTracingPipelineDescriptor,
    group: &ShaderGroup,
  ) -> Option<GroupCase> {
    match (self, *group) {
      (
        InlineCaseKind::AnyHit,
        ShaderGroup::TrianglesHitGroup {
          any_hit: Some(stage),
          ..
        },
      ) => Some(GroupCase {
        call_idx: RayTracingPipelineDescriptor::stage_handle_index(Some(stage)),
        stage,
        any_hit: None,
      }),
      (
        InlineCaseKind::Intersection,
        ShaderGroup::ProceduralHitGroup {
          any_hit,
          intersection,
          ..
        },
      ) => Some(GroupCase {
        call_idx: pipeline.intersection_handle_index(intersection, any_hit),
        stage: intersection,
        any_hit,
      }),
      (
        InlineCaseKind::ClosestHit,
        ShaderGroup::TrianglesHitGroup {
          closest_hit: Some(stage),
          ..
        }
        | ShaderGroup::ProceduralHitGroup {
          closest_hit: Some(stage),
          ..
        },
      ) => Some(GroupCase {
        call_idx: RayTracingPipelineDescriptor::stage_handle_index(Some(stage)),
        stage,
        any_hit: None,
      }),
      (InlineCaseKind::Miss, ShaderGroup::General { general })
        if pipeline.stage_kind(general) == Some(ShaderStage::Miss) =>
      {
        Some(GroupCase {
          call_idx: RayTracingPipelineDescriptor::stage_handle_index(Some(general)),
          stage: general,
          any_hit: None,
        })
      }
      _ => None,
    }
  }

  /// null indices can reach this dispatch unless the pipeline promises otherwise
  pub fn null_possible(&self, flags: PipelineFlags) -> bool {
    let no_null = match self {
      InlineCaseKind::AnyHit => PipelineFlags::NO_NULL_ANY_HIT,
      InlineCaseKind::Intersection => PipelineFlags::NO_NULL_INTERSECTION,
      InlineCaseKind::ClosestHit => PipelineFlags::NO_NULL_CLOSEST_HIT,
      InlineCaseKind::Miss => PipelineFlags::NO_NULL_MISS,
    };
    !flags.contains(no_null)
  }
}
