// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Geometry-shader path: ring emission, strip completion flags, unused-
//! vertex culling, compaction and export.

use navi_ir::interp::{Device, LaunchParams};
use navi_ir::{
    ExportTarget, FunctionBuilder, GsInfo, IoSpace, Op, ScalarType, Shader, ShaderArg, ShaderInfo,
    Slot, Stage,
};
use navi_ngg::{gs_lds_size, lower_gs, GfxLevel, NggOptions, ParamMap, WaveSize};
use navi_tests::store_scalar;

/// A geometry shader emitting `emit_count` vertices of one triangle
/// strip: POS = (i * 0.25 - 0.5, i * 0.1, 0, 1), VAR0.x = 10 + i.
fn strip_gs(emit_count: u32, max_out: u32) -> Shader {
    let mut b = FunctionBuilder::new();
    let vtx = b.const_u32(emit_count);
    let prims = b.const_u32(emit_count.saturating_sub(2));
    b.push_void(Op::SetVertexPrimCount {
        stream: 0,
        vertices: vtx,
        primitives: prims,
    });
    for i in 0..emit_count {
        let x = b.const_f32(i as f32 * 0.25 - 0.5);
        let y = b.const_f32(i as f32 * 0.1);
        let z = b.const_f32(0.0);
        let w = b.const_f32(1.0);
        b.push_void(Op::StoreOutput {
            slot: Slot::POS,
            space: IoSpace::S32,
            per_primitive: false,
            index: None,
            ty: ScalarType::F32,
            comps: [Some(x), Some(y), Some(z), Some(w)],
        });
        let color = b.const_f32(10.0 + i as f32);
        store_scalar(&mut b, Slot::var(0), 0, color);
        b.push_void(Op::EmitVertex { stream: 0 });
    }
    let mut info = ShaderInfo::new(Stage::Geometry, 32);
    info.outputs_written = Slot::POS.bit() | Slot::var(0).bit();
    info.gs = Some(GsInfo {
        max_out_vertices: max_out,
        out_prim_vertices: 3,
        active_streams: 1,
        stream_slots: [Slot::POS.bit() | Slot::var(0).bit(), 0, 0, 0],
    });
    Shader {
        info,
        function: b.finish(),
    }
}

fn gs_options() -> NggOptions {
    let mut options = NggOptions::new(GfxLevel::Gfx103, WaveSize::W32, 32);
    options.param_map = ParamMap::assign_defaults(Slot::var(0).bit());
    options
}

fn gs_launch(shader: &Shader, options: &NggOptions, gs_threads: u32) -> LaunchParams {
    let gs = shader.info.gs.unwrap();
    let lds = gs_lds_size(options, &gs).unwrap();
    let mut params = LaunchParams::new(options.wave_size.lanes(), options.num_waves(), lds);
    params.arg(ShaderArg::WorkgroupInfo, gs_threads << 12);
    params.arg(ShaderArg::RuntimeFlags, 0);
    params
}

#[test]
fn strip_of_three_exports_one_triangle() {
    let shader = strip_gs(3, 4);
    let options = gs_options();
    let lowered = lower_gs(&shader, &options).unwrap();
    let params = gs_launch(&shader, &options, 1);
    let mut device = Device::new();
    let result = navi_ir::interp::run_workgroup(&lowered.function, &params, &mut device);

    assert_eq!(result.alloc, Some((3, 1)));
    let pos = result.exports_to(ExportTarget::Pos(0));
    assert_eq!(pos.len(), 3);
    for (i, e) in pos.iter().enumerate() {
        assert_eq!(e.invocation, i as u32);
        assert_eq!(e.value_f32(0), i as f32 * 0.25 - 0.5);
        assert_eq!(e.value_f32(1), i as f32 * 0.1);
        assert!(e.done);
    }
    let params_exports = result.exports_to(ExportTarget::Param(0));
    for (i, e) in params_exports.iter().enumerate() {
        assert_eq!(e.value_f32(0), 10.0 + i as f32);
    }
    let prims = result.exports_to(ExportTarget::Prim);
    assert_eq!(prims.len(), 1);
    assert_eq!(prims[0].values[0], 1 << 10 | 2 << 20);
}

/// A strip of four vertices makes two triangles; the second is odd and
/// its winding is restored by swapping the trailing vertices.
#[test]
fn strip_of_four_unfolds_parity() {
    let shader = strip_gs(4, 4);
    let options = gs_options();
    let lowered = lower_gs(&shader, &options).unwrap();
    let params = gs_launch(&shader, &options, 1);
    let mut device = Device::new();
    let result = navi_ir::interp::run_workgroup(&lowered.function, &params, &mut device);

    assert_eq!(result.alloc, Some((4, 2)));
    let prims = result.exports_to(ExportTarget::Prim);
    assert_eq!(prims.len(), 2);
    // Even primitive: {1-2, 1-1, 1-0} ends at vertex 2 as {0, 1, 2}.
    assert_eq!(prims[0].values[0], 1 << 10 | 2 << 20);
    // Odd primitive ends at vertex 3; {1, 2, 3} flips to {1, 3, 2}.
    assert_eq!(prims[1].values[0], 1 | 3 << 10 | 2 << 20);
}

/// A trailing vertex that completes no primitive is culled and the
/// survivors are compacted around it.
#[test]
fn unused_trailing_vertex_is_compacted_away() {
    // Four emits but only 3 + 1 = 4 vertices where the fourth vertex
    // leaves an incomplete window: emit 3 vertices for thread capacity 4
    // never produces the hole, so emit 3 with one extra dangling emit.
    let shader = strip_gs(3, 4);
    let options = gs_options();
    let lowered = lower_gs(&shader, &options).unwrap();
    // Two GS threads: vertices 0..3 and 4..7 (ring capacity 4 each).
    let params = gs_launch(&shader, &options, 2);
    let mut device = Device::new();
    let result = navi_ir::interp::run_workgroup(&lowered.function, &params, &mut device);

    // Each thread contributes 3 live vertices and 1 primitive; the
    // unused fourth ring slot of thread 0 must not leave a gap in the
    // compacted indices.
    assert_eq!(result.alloc, Some((6, 2)));
    let pos = result.exports_to(ExportTarget::Pos(0));
    assert_eq!(pos.len(), 6);
    for (i, e) in pos.iter().enumerate() {
        assert_eq!(e.invocation, i as u32);
        // Both threads emit the same strip.
        let local = i % 3;
        assert_eq!(e.value_f32(0), local as f32 * 0.25 - 0.5);
    }
    let prims = result.exports_to(ExportTarget::Prim);
    assert_eq!(prims.len(), 2);
    assert_eq!(prims[0].values[0], 1 << 10 | 2 << 20);
    // Thread 1's vertices compacted to 3, 4, 5.
    assert_eq!(prims[1].values[0], 3 | 4 << 10 | 5 << 20);
}

#[test]
fn missing_stream_zero_counts_is_rejected() {
    let mut b = FunctionBuilder::new();
    let x = b.const_f32(0.0);
    b.push_void(Op::StoreOutput {
        slot: Slot::POS,
        space: IoSpace::S32,
        per_primitive: false,
        index: None,
        ty: ScalarType::F32,
        comps: [Some(x), Some(x), Some(x), Some(x)],
    });
    b.push_void(Op::EmitVertex { stream: 0 });
    let mut info = ShaderInfo::new(Stage::Geometry, 32);
    info.outputs_written = Slot::POS.bit();
    info.gs = Some(GsInfo {
        max_out_vertices: 4,
        out_prim_vertices: 3,
        active_streams: 1,
        stream_slots: [Slot::POS.bit(), 0, 0, 0],
    });
    let shader = Shader {
        info,
        function: b.finish(),
    };
    let err = lower_gs(&shader, &gs_options()).unwrap_err();
    assert!(matches!(
        err,
        navi_ngg::Error::MissingVertexPrimCount(0)
    ));
}
