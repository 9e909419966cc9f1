//! A small structured shader IR used as the input and output of the ray tracing lowering.
//!
//! Programs are trees of structured control flow over single assignment value nodes and
//! program scoped variables. The instruction set only covers what ray tracing lowering needs:
//! scalar/vector alu, the ray tracing system values, scratch/shared/global/constant memory,
//! shader arguments and a few wave operations. A SIMT interpreter is provided so lowered
//! programs can be executed and tested without a device.

use std::fmt::{self, Display};
use std::hash::BuildHasherDefault;

use rustc_hash::FxHasher;
use smallvec::{smallvec, SmallVec};

mod ty;
pub use ty::*;
mod ir;
pub use ir::*;
mod builder;
pub use builder::*;
mod pass;
pub use pass::*;
mod inline;
pub use inline::*;
mod typing;
pub use typing::*;
mod validate;
pub use validate::*;
mod print;
mod interp;
pub use interp::*;

pub type FastHashMap<K, V> = hashbrown::HashMap<K, V, BuildHasherDefault<FxHasher>>;
pub type FastHashSet<K> = hashbrown::HashSet<K, BuildHasherDefault<FxHasher>>;

pub fn align_up(value: u32, align: u32) -> u32 {
  debug_assert!(align.is_power_of_two());
  (value + align - 1) & !(align - 1)
}
