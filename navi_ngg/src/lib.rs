// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! NGG primitive-pipeline lowering.
//!
//! Rewrites a vertex, tessellation-evaluation, geometry or mesh shader
//! into the concrete per-invocation/per-wave/per-workgroup protocol the
//! NGG hardware executes: LDS staging, culling, workgroup repacking and
//! compaction, streamout allocation, and the final position/parameter/
//! primitive exports. The input and output programs live in the
//! [`navi_ir`] substrate; after lowering, no abstract I/O operation
//! remains.
//!
//! Entry points: [`lower_nogs`], [`lower_gs`], [`lower_mesh`]. All
//! failures are compile-time configuration or consistency errors; there
//! is no runtime error path in the generated code.

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

use navi_ir::Stage;
use thiserror::Error;

pub mod compact;
pub mod cull;
pub mod export;
pub mod layout;
pub mod options;
pub mod outputs;
pub mod repack;
pub mod streamout;

mod gs;
mod mesh;
mod nogs;

pub use gs::{gs_lds_size, lower_gs};
pub use mesh::{lower_mesh, mesh_lds_size};
pub use nogs::{lower_nogs, nogs_lds_size};
pub use options::{
    GfxLevel, MeshOptions, NggOptions, ParamMap, ParamMap16, WaveSize, XfbBuffer, XfbInfo,
    XfbOutput,
};

/// Hardware limit on NGG workgroup size.
pub const MAX_WORKGROUP_SIZE: u32 = 256;

/// Errors of the lowering passes.
///
/// Every variant is fatal to the compilation: either the configuration
/// reached a path it does not support (a driver-logic bug or a hardware
/// gap) or the input shader is malformed in a way upstream validation
/// should have rejected. Degenerate numeric cases are never errors; they
/// have defined fallback code paths.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The option combination is not supported by this pass.
    #[error("unsupported configuration: {0}")]
    Unsupported(&'static str),
    /// A geometry or mesh shader never declared its output counts.
    #[error("stream {0} is missing set_vertex_and_primitive_count")]
    MissingVertexPrimCount(u8),
    #[error("workgroup of {size} invocations exceeds the hardware limit of {max}")]
    WorkgroupTooLarge { size: u32, max: u32 },
    #[error("shared-memory plan of {required} bytes exceeds the {budget}-byte budget")]
    LdsBudgetExceeded { required: u32, budget: u32 },
    #[error("stage {0:?} is not valid for this pass")]
    WrongStage(Stage),
}
