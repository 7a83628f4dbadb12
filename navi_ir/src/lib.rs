// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shader IR substrate for the Navi geometry-pipeline lowering passes.
//!
//! This crate provides the small SSA instruction set the lowering passes
//! consume and produce: typed scalar values, structured control flow,
//! subgroup operations, shared-memory and buffer access, and the hardware
//! export/message pseudo-operations. It also carries the *abstract* I/O
//! operations (`store_output`, `emit_vertex`, ...) that the lowering
//! passes rewrite away; a fully lowered function contains none of them.
//!
//! Values are single-assignment but behave as per-lane registers: the
//! structured control-flow markers decide *when* an instruction executes,
//! not how long its result lives, so a value defined under one predicate
//! may be consumed under a later one, the way a VGPR survives divergence
//! on real hardware.
//!
//! With the `interp` feature enabled, the [`interp`] module executes a
//! lowered function over a full workgroup on the CPU. Note that while this
//! is useful for testing and debugging, it is not a performance simulator.

// LINEBENDER LINT SET - lib.rs - v2
// See https://linebender.org/wiki/canonical-lints/
// These lints aren't included in Cargo.toml because they
// shouldn't apply to examples and tests
#![warn(unused_crate_dependencies)]
#![warn(clippy::print_stdout, clippy::print_stderr)]
// Targeting e.g. 32-bit means structs containing usize can give false positives for 64-bit.
#![cfg_attr(target_pointer_width = "64", warn(clippy::trivially_copy_pass_by_ref))]
// END LINEBENDER LINT SET
#![allow(
    clippy::cast_possible_truncation,
    reason = "Bit widths are part of the hardware contract and checked where it matters."
)]

mod builder;
mod instr;
mod shader;
mod types;

pub mod math;
pub mod passes;

#[cfg(feature = "interp")]
pub mod interp;

pub use builder::FunctionBuilder;
pub use instr::{
    AluOp, BarrierKind, BufferSlot, CounterSlot, ExportTarget, Imm, Instr, IoSpace, MemScope,
    MemWidth, Op, ShaderArg, Slot,
};
pub use shader::{Function, GsInfo, MeshInfo, Shader, ShaderInfo, Stage};
pub use types::{ScalarType, ValueId, VarId};
