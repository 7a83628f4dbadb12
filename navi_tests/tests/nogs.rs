// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end scenarios of the vertex/tess-eval path: lower, execute,
//! and check the export trace.

use navi_ir::interp::{Device, ExportRecord};
use navi_ir::{
    ExportTarget, FunctionBuilder, IoSpace, Op, ScalarType, Shader, ShaderInfo, Slot, Stage,
};
use navi_ngg::options::runtime_flags;
use navi_ngg::{lower_nogs, GfxLevel, NggOptions, ParamMap, ParamMap16, WaveSize};
use navi_tests::{pack_input_prim, position_from_args_vs, store_scalar, NogsLaunch};

fn base_options() -> NggOptions {
    let mut options = NggOptions::new(GfxLevel::Gfx10, WaveSize::W64, 64);
    options.param_map = ParamMap::assign_defaults(Slot::var(0).bit());
    options
}

fn pos_exports(exports: &[ExportRecord]) -> Vec<&ExportRecord> {
    exports
        .iter()
        .filter(|e| e.target == ExportTarget::Pos(0))
        .collect()
}

/// Workgroup of one triangle, one wave, no culling: one position export
/// per vertex lane with the written values and the (0, 0, 0, 1) channel
/// defaults, one primitive export packing {0, 1, 2}.
#[test]
fn single_triangle_plain() {
    let shader = position_from_args_vs();
    let options = base_options();
    let lowered = lower_nogs(&shader, &options).unwrap();

    let tri = [
        [-0.5, -0.5, 0.0, 1.0],
        [0.5, -0.5, 0.0, 1.0],
        [0.0, 0.5, 0.0, 1.0],
    ];
    let mut launch = NogsLaunch::new(&options, 3, &[pack_input_prim(&[0, 1, 2])]);
    launch.positions(&tri);
    let mut device = Device::new();
    let result = launch.run(&lowered, &mut device);

    assert_eq!(result.alloc, Some((3, 1)));

    let pos = pos_exports(&result.exports);
    assert_eq!(pos.len(), 3);
    for (i, e) in pos.iter().enumerate() {
        assert_eq!(e.invocation, i as u32);
        assert_eq!(e.mask, 0xF);
        assert!(e.done);
        assert_eq!(e.value_f32(0), tri[i][0]);
        assert_eq!(e.value_f32(1), tri[i][1]);
        assert_eq!(e.value_f32(2), 0.0);
        assert_eq!(e.value_f32(3), 1.0);
    }

    let prims = result.exports_to(ExportTarget::Prim);
    assert_eq!(prims.len(), 1);
    assert_eq!(prims[0].values[0], 1 << 10 | 2 << 20);
    assert_eq!(prims[0].values[0] >> 31, 0);

    // Parameter round trip: VAR0.x carries the vertex id, the other
    // channels default to zero.
    let params = result.exports_to(ExportTarget::Param(0));
    assert_eq!(params.len(), 3);
    for (i, e) in params.iter().enumerate() {
        assert_eq!(e.value_f32(0), i as f32);
        assert_eq!(e.values[1], 0.0_f32.to_bits());
    }
    navi_tests::assert_single_done_per_invocation(&result);
}

/// Unwritten position channels take the (0, 0, 0, 1) default.
#[test]
fn position_channel_defaults() {
    let mut b = FunctionBuilder::new();
    let x = b.const_f32(0.25);
    b.push_void(Op::StoreOutput {
        slot: Slot::POS,
        space: IoSpace::S32,
        per_primitive: false,
        index: None,
        ty: ScalarType::F32,
        comps: [Some(x), None, None, None],
    });
    let mut info = ShaderInfo::new(Stage::Vertex, 64);
    info.outputs_written = Slot::POS.bit();
    let shader = Shader {
        info,
        function: b.finish(),
    };
    let mut options = base_options();
    options.param_map = ParamMap::empty();
    let lowered = lower_nogs(&shader, &options).unwrap();

    let launch = NogsLaunch::new(&options, 1, &[pack_input_prim(&[0, 0, 0])]);
    let mut device = Device::new();
    let result = launch.run(&lowered, &mut device);
    let pos = pos_exports(&result.exports);
    assert_eq!(pos.len(), 1);
    assert_eq!(pos[0].value_f32(0), 0.25);
    assert_eq!(pos[0].value_f32(1), 0.0);
    assert_eq!(pos[0].value_f32(2), 0.0);
    assert_eq!(pos[0].value_f32(3), 1.0);
}

/// A shader whose position is a function of the vertex id, so compaction
/// is observable: x = vid - 4, y = vid^2 / 100.
fn vs_from_vertex_id() -> Shader {
    let mut b = FunctionBuilder::new();
    let vid = b.load_arg(navi_ir::ShaderArg::VertexId, ScalarType::U32);
    let vf = b.u2f(vid);
    let four = b.const_f32(4.0);
    let x = b.fsub(vf, four);
    let sq = b.imul(vid, vid);
    let sqf = b.u2f(sq);
    let scale = b.const_f32(0.01);
    let y = b.fmul(sqf, scale);
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
    store_scalar(&mut b, Slot::var(0), 0, vf);
    let mut info = ShaderInfo::new(Stage::Vertex, 64);
    info.outputs_written = Slot::POS.bit() | Slot::var(0).bit();
    Shader {
        info,
        function: b.finish(),
    }
}

fn culling_options() -> NggOptions {
    let mut options = base_options();
    options.can_cull = true;
    options
}

/// Deferred culling with survivors: vertices 0..3 form a triangle left
/// of the frustum, 3..6 a visible one. The surviving vertices compact to
/// 0..3 and the primitive is rebuilt with the new indices.
#[test]
fn culling_compacts_survivors() {
    let shader = vs_from_vertex_id();
    let options = culling_options();
    let lowered = lower_nogs(&shader, &options).unwrap();

    let prims = [pack_input_prim(&[0, 1, 2]), pack_input_prim(&[3, 4, 5])];
    let mut launch = NogsLaunch::new(&options, 6, &prims);
    launch.flags(runtime_flags::CULL_ENABLE);
    let mut device = Device::new();
    let result = launch.run(&lowered, &mut device);

    assert_eq!(result.alloc, Some((3, 1)));
    let pos = pos_exports(&result.exports);
    assert_eq!(pos.len(), 3);
    for (i, e) in pos.iter().enumerate() {
        let vid = (i + 3) as f32;
        assert_eq!(e.invocation, i as u32);
        assert_eq!(e.value_f32(0), vid - 4.0);
        assert_eq!(e.value_f32(1), vid * vid / 100.0);
    }
    let params = result.exports_to(ExportTarget::Param(0));
    for (i, e) in params.iter().enumerate() {
        assert_eq!(e.value_f32(0), (i + 3) as f32);
    }
    let prims = result.exports_to(ExportTarget::Prim);
    assert_eq!(prims.len(), 1);
    assert_eq!(prims[0].values[0], 1 << 10 | 2 << 20);
}

/// The same shader with the cull toggle clear exports everything; the
/// compiled culling branch must be dormant.
#[test]
fn cull_toggle_off_exports_everything() {
    let shader = vs_from_vertex_id();
    let options = culling_options();
    let lowered = lower_nogs(&shader, &options).unwrap();

    let prims = [pack_input_prim(&[0, 1, 2]), pack_input_prim(&[3, 4, 5])];
    let launch = NogsLaunch::new(&options, 6, &prims);
    let mut device = Device::new();
    let result = launch.run(&lowered, &mut device);
    assert_eq!(result.alloc, Some((6, 2)));
    assert_eq!(pos_exports(&result.exports).len(), 6);
    assert_eq!(result.exports_to(ExportTarget::Prim).len(), 2);
}

/// Everything culled on the generation with the zero-allocation hang:
/// the workgroup still allocates one slot and issues a degenerate null
/// primitive plus one position.
#[test]
fn fully_culled_workgroup_issues_dummy_export() {
    let shader = vs_from_vertex_id();
    let options = culling_options();
    assert!(options.gfx_level.needs_zero_prim_workaround());
    let lowered = lower_nogs(&shader, &options).unwrap();

    let mut launch = NogsLaunch::new(&options, 3, &[pack_input_prim(&[0, 1, 2])]);
    launch.flags(runtime_flags::CULL_ENABLE);
    let mut device = Device::new();
    let result = launch.run(&lowered, &mut device);

    assert_eq!(result.alloc, Some((1, 1)));
    let prims = result.exports_to(ExportTarget::Prim);
    assert_eq!(prims.len(), 1);
    assert_eq!(prims[0].values[0] >> 31, 1, "null primitive bit");
    let pos = pos_exports(&result.exports);
    assert_eq!(pos.len(), 1);
    assert_eq!(pos[0].value_f32(3), 1.0);
    assert!(pos[0].done);
}

/// On a generation without the hang, a fully culled workgroup allocates
/// zero and exports nothing.
#[test]
fn fully_culled_workgroup_gfx103() {
    let shader = vs_from_vertex_id();
    let mut options = culling_options();
    options.gfx_level = GfxLevel::Gfx103;
    let lowered = lower_nogs(&shader, &options).unwrap();

    let mut launch = NogsLaunch::new(&options, 3, &[pack_input_prim(&[0, 1, 2])]);
    launch.flags(runtime_flags::CULL_ENABLE);
    let mut device = Device::new();
    let result = launch.run(&lowered, &mut device);
    assert_eq!(result.alloc, Some((0, 0)));
    assert!(result.exports.is_empty());
}

/// Per-vertex edge flags are folded into the primitive export: the edge
/// bit survives only where the vertex wrote a nonzero flag.
#[test]
fn edge_flags_mask_the_primitive_export() {
    let mut b = FunctionBuilder::new();
    let x = b.const_f32(0.0);
    let w = b.const_f32(1.0);
    b.push_void(Op::StoreOutput {
        slot: Slot::POS,
        space: IoSpace::S32,
        per_primitive: false,
        index: None,
        ty: ScalarType::F32,
        comps: [Some(x), Some(x), Some(x), Some(w)],
    });
    let vid = b.load_arg(navi_ir::ShaderArg::VertexId, ScalarType::U32);
    let one = b.const_u32(1);
    let flag = b.iand(vid, one);
    let mut comps = [None; 4];
    comps[0] = Some(flag);
    b.push_void(Op::StoreOutput {
        slot: Slot::EDGE,
        space: IoSpace::S32,
        per_primitive: false,
        index: None,
        ty: ScalarType::U32,
        comps,
    });
    let mut info = ShaderInfo::new(Stage::Vertex, 64);
    info.outputs_written = Slot::POS.bit() | Slot::EDGE.bit();
    let shader = Shader {
        info,
        function: b.finish(),
    };

    let mut options = base_options();
    options.param_map = ParamMap::empty();
    options.has_edge_flags = true;
    let lowered = lower_nogs(&shader, &options).unwrap();

    // All three edge bits arrive set; only vertex 1 keeps its flag.
    let all_edges = pack_input_prim(&[0, 1, 2]) | 1 << 9 | 1 << 19 | 1 << 29;
    let launch = NogsLaunch::new(&options, 3, &[all_edges]);
    let mut device = Device::new();
    let result = launch.run(&lowered, &mut device);
    let prims = result.exports_to(ExportTarget::Prim);
    assert_eq!(prims.len(), 1);
    assert_eq!(prims[0].values[0], pack_input_prim(&[0, 1, 2]) | 1 << 19);
}

/// The primitive id travels through LDS from the primitive thread to its
/// provoking vertex and is exported as a parameter.
#[test]
fn primitive_id_reaches_the_provoking_vertex() {
    let shader = position_from_args_vs();
    let mut options = base_options();
    options.export_primitive_id = true;
    options.param_map =
        ParamMap::assign_defaults(Slot::var(0).bit() | Slot::PRIM_ID.bit());
    let prim_id_param = options.param_map.get(Slot::PRIM_ID).unwrap();
    let lowered = lower_nogs(&shader, &options).unwrap();

    let tri = [
        [-0.5, -0.5, 0.0, 1.0],
        [0.5, -0.5, 0.0, 1.0],
        [0.0, 0.5, 0.0, 1.0],
    ];
    let mut launch = NogsLaunch::new(&options, 3, &[pack_input_prim(&[0, 1, 2])]);
    launch.positions(&tri);
    let mut device = Device::new();
    let result = launch.run(&lowered, &mut device);

    let ids = result.exports_to(ExportTarget::Param(prim_id_param));
    assert_eq!(ids.len(), 3);
    // The launch binds primitive id 100 for the lane carrying the
    // primitive; vertex 0 is the provoking vertex.
    assert_eq!(ids[0].invocation, 0);
    assert_eq!(ids[0].values[0], 100);
}

/// 16-bit varyings live in their own low/high sub-tables and export
/// packed two-to-a-dword.
#[test]
fn sixteen_bit_pair_packs_into_one_export() {
    let mut b = FunctionBuilder::new();
    let x = b.const_f32(0.0);
    let w = b.const_f32(1.0);
    b.push_void(Op::StoreOutput {
        slot: Slot::POS,
        space: IoSpace::S32,
        per_primitive: false,
        index: None,
        ty: ScalarType::F32,
        comps: [Some(x), Some(x), Some(x), Some(w)],
    });
    let lo_f = b.const_f32(1.5);
    let lo = b.f32_to_16(lo_f);
    let hi_f = b.const_f32(-2.0);
    let hi = b.f32_to_16(hi_f);
    let mut comps = [None; 4];
    comps[0] = Some(lo);
    b.push_void(Op::StoreOutput {
        slot: Slot(2),
        space: IoSpace::Lo16,
        per_primitive: false,
        index: None,
        ty: ScalarType::F16,
        comps,
    });
    comps[0] = Some(hi);
    b.push_void(Op::StoreOutput {
        slot: Slot(2),
        space: IoSpace::Hi16,
        per_primitive: false,
        index: None,
        ty: ScalarType::F16,
        comps,
    });
    let mut info = ShaderInfo::new(Stage::Vertex, 64);
    info.outputs_written = Slot::POS.bit();
    info.outputs_written_16bit_lo = 1 << 2;
    info.outputs_written_16bit_hi = 1 << 2;
    let shader = Shader {
        info,
        function: b.finish(),
    };

    let mut options = base_options();
    options.param_map = ParamMap::empty();
    let mut map16 = ParamMap16::empty();
    map16.set(2, 0);
    options.param_map_16 = map16;
    let lowered = lower_nogs(&shader, &options).unwrap();

    let launch = NogsLaunch::new(&options, 1, &[pack_input_prim(&[0, 0, 0])]);
    let mut device = Device::new();
    let result = launch.run(&lowered, &mut device);
    let params = result.exports_to(ExportTarget::Param(0));
    assert_eq!(params.len(), 1);
    let expected =
        u32::from(navi_ir::math::f32_to_f16(1.5)) | (u32::from(navi_ir::math::f32_to_f16(-2.0)) << 16);
    assert_eq!(params[0].values[0], expected);
}
