//! Lowers ray tracing pipelines written against the `rendiation-rt-ir` shader IR into programs a
//! SIMT processor can run without native call/return support.
//!
//! Recursive shader calls become continuations on an explicit scratch stack, the BVH traversal is
//! emitted as a state machine that inlines any-hit and intersection shaders, and every compiled
//! program ends by electing the next program the whole wave runs.

use log::*;
use rendiation_rt_ir::*;
use smallvec::SmallVec;

mod config;
pub use config::*;
mod error;
pub use error::*;
mod pipeline;
pub use pipeline::*;
mod sbt;
pub use sbt::*;
mod vars;
pub use vars::*;
mod io;
pub use io::*;
mod lower;
pub use lower::*;
mod call_split;
pub use call_split::*;
mod dispatch;
pub use dispatch::*;
mod intersection;
pub use intersection::*;
mod traversal;
pub use traversal::*;
mod bvh;
pub use bvh::*;
mod scheduler;
pub use scheduler::*;
mod abi;
pub use abi::*;
mod compile;
pub use compile::*;
mod emulator;
pub use emulator::*;

#[cfg(test)]
mod test;
