// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared harness for the NGG lowering integration tests: small input
//! shaders, launch-parameter plumbing, and export-trace helpers.

use navi_ir::interp::{Device, LaunchParams, RunResult};
use navi_ir::{
    interp, FunctionBuilder, IoSpace, Op, ScalarType, Shader, ShaderArg, ShaderInfo, Slot, Stage,
};
use navi_ngg::NggOptions;

/// Packs a primitive's vertex indices the way the hardware delivers them
/// in the `PackedPrimitive` argument.
pub fn pack_input_prim(v: &[u32]) -> u32 {
    let mut packed = 0;
    for (i, &idx) in v.iter().enumerate() {
        packed |= idx << (10 * i as u32);
    }
    packed
}

/// Stores one scalar component into an output slot.
pub fn store_scalar(b: &mut FunctionBuilder, slot: Slot, comp: u8, value: navi_ir::ValueId) {
    let mut comps = [None; 4];
    comps[comp as usize] = Some(value);
    b.push_void(Op::StoreOutput {
        slot,
        space: IoSpace::S32,
        per_primitive: false,
        index: None,
        ty: ScalarType::F32,
        comps,
    });
}

/// A vertex shader that reads its clip-space position from the four
/// per-lane `User` arguments and writes `VAR0.x = vertex_id`.
pub fn position_from_args_vs() -> Shader {
    let mut b = FunctionBuilder::new();
    let x = b.load_arg(ShaderArg::User(0), ScalarType::F32);
    let y = b.load_arg(ShaderArg::User(1), ScalarType::F32);
    let z = b.load_arg(ShaderArg::User(2), ScalarType::F32);
    let w = b.load_arg(ShaderArg::User(3), ScalarType::F32);
    b.push_void(Op::StoreOutput {
        slot: Slot::POS,
        space: IoSpace::S32,
        per_primitive: false,
        index: None,
        ty: ScalarType::F32,
        comps: [Some(x), Some(y), Some(z), Some(w)],
    });
    let vid = b.load_arg(ShaderArg::VertexId, ScalarType::U32);
    let color = b.u2f(vid);
    store_scalar(&mut b, Slot::var(0), 0, color);
    let mut info = ShaderInfo::new(Stage::Vertex, 64);
    info.outputs_written = Slot::POS.bit() | Slot::var(0).bit();
    Shader {
        info,
        function: b.finish(),
    }
}

/// Standard launch for a no-GS workgroup: binds the counts, runtime
/// flags, identity viewport, per-lane vertex positions and packed
/// primitives.
pub struct NogsLaunch {
    pub params: LaunchParams,
}

impl NogsLaunch {
    pub fn new(options: &NggOptions, vtx_count: u32, prims: &[u32]) -> Self {
        let lds = navi_ngg::nogs_lds_size(options).unwrap();
        let mut params = LaunchParams::new(
            options.wave_size.lanes(),
            options.num_waves(),
            lds.max(4),
        );
        params.arg(
            ShaderArg::WorkgroupInfo,
            vtx_count | ((prims.len() as u32) << 12),
        );
        params.arg(ShaderArg::RuntimeFlags, 0);
        params.arg_f32(ShaderArg::ViewportScaleX, 1.0);
        params.arg_f32(ShaderArg::ViewportScaleY, 1.0);
        params.arg_f32(ShaderArg::ViewportTranslateX, 0.0);
        params.arg_f32(ShaderArg::ViewportTranslateY, 0.0);
        params.arg_f32(ShaderArg::SmallPrimPrecision, 0.0);
        params.arg_f32(ShaderArg::HalfLineWidthX, 0.0);
        params.arg_f32(ShaderArg::HalfLineWidthY, 0.0);
        params.arg(ShaderArg::ViewIndex, 0);
        params.arg(ShaderArg::OrderedId, 1);
        params.arg_per_lane(ShaderArg::PackedPrimitive, prims.to_vec());
        for c in 0..4 {
            params.arg_per_lane(ShaderArg::User(c), Vec::new());
        }
        params.arg_per_lane(
            ShaderArg::VertexId,
            (0..options.workgroup_size).collect::<Vec<_>>(),
        );
        params.arg_per_lane(
            ShaderArg::InstanceId,
            vec![0; options.workgroup_size as usize],
        );
        params.arg_per_lane(
            ShaderArg::PrimitiveId,
            (100..100 + options.workgroup_size).collect::<Vec<_>>(),
        );
        Self { params }
    }

    /// Per-lane clip-space positions for the vertex threads.
    pub fn positions(&mut self, positions: &[[f32; 4]]) -> &mut Self {
        for c in 0..4_u8 {
            let vals: Vec<u32> = positions
                .iter()
                .map(|p| p[c as usize].to_bits())
                .collect();
            self.params
                .arg_per_lane(ShaderArg::User(c), vals);
        }
        self
    }

    pub fn flags(&mut self, flags: u32) -> &mut Self {
        self.params.arg(ShaderArg::RuntimeFlags, flags);
        self
    }

    pub fn run(&self, shader: &Shader, device: &mut Device) -> RunResult {
        interp::run_workgroup(&shader.function, &self.params, device)
    }
}

/// Asserts that `exports` contains exactly one done-flagged export per
/// distinct exporting invocation.
pub fn assert_single_done_per_invocation(result: &RunResult) {
    let mut seen = std::collections::HashSet::new();
    for e in result.exports.iter().filter(|e| e.done) {
        assert!(
            seen.insert(e.invocation),
            "invocation {} issued two done exports",
            e.invocation
        );
    }
}
