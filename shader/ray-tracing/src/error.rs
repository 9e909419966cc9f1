use crate::*;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RtCompileError {
  #[error("group {group} references stage {stage}, the pipeline has {count} stages")]
  StageOutOfRange { group: usize, stage: u32, count: usize },
  #[error("group {group} expects a {expected:?} stage at {stage}, found {found:?}")]
  StageKindMismatch {
    group: usize,
    stage: u32,
    expected: ShaderStage,
    found: ShaderStage,
  },
  #[error("general group {group} references a {found:?} stage")]
  InvalidGeneralStage { group: usize, found: ShaderStage },
  #[error("max recursion depth {0} exceeds the supported 31")]
  RecursionDepthTooLarge(u32),
  #[error("stage {0} traces rays but the max recursion depth is zero")]
  RecursionDepthZero(String),
  #[error("monolithic compilation is not possible: {0}")]
  MonolithicUnsupported(&'static str),
  #[error("{shader}: {intrinsic:?} is not allowed in a {stage:?} stage")]
  UnsupportedIntrinsic {
    shader: String,
    stage: ShaderStage,
    intrinsic: Intrinsic,
  },
  #[error("the pipeline has no ray generation stage")]
  MissingRayGen,
  #[error("{shader}: hit attribute slot {slot} exceeds the {limit} available slots")]
  HitAttribSlotOutOfRange { shader: String, slot: u32, limit: u32 },
  #[error("stage {stage} is invalid")]
  InvalidProgram {
    stage: String,
    #[source]
    source: IrError,
  },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
  #[error(transparent)]
  Interp(#[from] InterpError),
  #[error("wave {wave} did not finish after {launches} launches")]
  LaunchLimit { wave: usize, launches: usize },
  #[error("ray generation index {0} has no row in the shader binding table")]
  MissingRayGenRecord(u32),
}
