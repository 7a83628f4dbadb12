// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Mesh-shader path: planned output storage, count broadcast, export
//! rows, per-primitive culling flags, and the idle-wave barrier protocol
//! for workgroup-size mismatches.

use navi_ir::interp::{Device, LaunchParams};
use navi_ir::{
    BarrierKind, ExportTarget, FunctionBuilder, IoSpace, MeshInfo, Op, ScalarType, Shader,
    ShaderArg, ShaderInfo, Slot, Stage, ValueId,
};
use navi_ngg::{lower_mesh, mesh_lds_size, GfxLevel, MeshOptions, ParamMap, WaveSize};

fn store_indexed(
    b: &mut FunctionBuilder,
    slot: Slot,
    per_primitive: bool,
    index: ValueId,
    comps: [Option<ValueId>; 4],
) {
    b.push_void(Op::StoreOutput {
        slot,
        space: IoSpace::S32,
        per_primitive,
        index: Some(index),
        ty: ScalarType::F32,
        comps,
    });
}

/// One triangle from three lanes: POS = (lane * 0.25 - 0.5, lane * 0.1,
/// 0, 1), VAR0.x = lane * 2, indices {0, 1, 2}.
fn simple_mesh(cull_second_prim: bool) -> Shader {
    let mut b = FunctionBuilder::new();
    let lane = b.lane_id();
    let three = b.const_u32(3);
    let is_vtx = b.ult(lane, three);
    b.if_(is_vtx);
    {
        let lf = b.u2f(lane);
        let quarter = b.const_f32(0.25);
        let sx = b.fmul(lf, quarter);
        let half = b.const_f32(0.5);
        let x = b.fsub(sx, half);
        let tenth = b.const_f32(0.1);
        let y = b.fmul(lf, tenth);
        let z = b.const_f32(0.0);
        let w = b.const_f32(1.0);
        store_indexed(&mut b, Slot::POS, false, lane, [Some(x), Some(y), Some(z), Some(w)]);
        let two = b.const_f32(2.0);
        let color = b.fmul(lf, two);
        store_indexed(&mut b, Slot::var(0), false, lane, [Some(color), None, None, None]);
    }
    b.end_if();
    let num_prims = b.const_u32(if cull_second_prim { 2 } else { 1 });
    let one = b.const_u32(1);
    let is_prim = b.ult(lane, num_prims);
    b.if_(is_prim);
    {
        let zero = b.const_u32(0);
        let two = b.const_u32(2);
        store_indexed(
            &mut b,
            Slot::PRIM_INDICES,
            true,
            lane,
            [Some(zero), Some(one), Some(two), None],
        );
        if cull_second_prim {
            let culled = b.ieq(lane, one);
            let flag = b.b2u(culled);
            store_indexed(&mut b, Slot::CULL_PRIMITIVE, true, lane, [Some(flag), None, None, None]);
        }
    }
    b.end_if();
    let vtx = b.const_u32(3);
    let prim = b.const_u32(if cull_second_prim { 2 } else { 1 });
    b.push_void(Op::SetVertexPrimCount {
        stream: 0,
        vertices: vtx,
        primitives: prim,
    });
    let mut info = ShaderInfo::new(Stage::Mesh, 32);
    info.outputs_written = Slot::POS.bit() | Slot::var(0).bit();
    info.mesh = Some(MeshInfo {
        max_vertices: 3,
        max_primitives: 2,
        prim_vertices: 3,
        api_workgroup_size: 32,
        cross_invocation_outputs: 0,
    });
    Shader {
        info,
        function: b.finish(),
    }
}

fn mesh_options() -> MeshOptions {
    let mut options = MeshOptions::new(GfxLevel::Gfx103, WaveSize::W32, 32);
    options.param_map = ParamMap::assign_defaults(Slot::var(0).bit());
    options
}

fn mesh_launch(shader: &Shader, options: &MeshOptions) -> LaunchParams {
    let info = shader.info.mesh.unwrap();
    let mut vtx_written = 0;
    let mut prim_written = 0;
    for instr in shader.function.instrs() {
        if let Op::StoreOutput {
            slot,
            per_primitive,
            ..
        } = &instr.op
        {
            if *per_primitive {
                prim_written |= slot.bit();
            } else {
                vtx_written |= slot.bit();
            }
        }
    }
    let lds = mesh_lds_size(options, &info, vtx_written, prim_written).unwrap();
    let mut params = LaunchParams::new(options.wave_size.lanes(), options.num_waves(), lds);
    params.arg(ShaderArg::WorkgroupIndex, 0);
    params
}

#[test]
fn simple_mesh_exports_its_triangle() {
    let shader = simple_mesh(false);
    let options = mesh_options();
    let lowered = lower_mesh(&shader, &options).unwrap();
    let params = mesh_launch(&shader, &options);
    let mut device = Device::new();
    let result = navi_ir::interp::run_workgroup(&lowered.function, &params, &mut device);

    assert_eq!(result.alloc, Some((3, 1)));
    let pos = result.exports_to(ExportTarget::Pos(0));
    assert_eq!(pos.len(), 3);
    for (i, e) in pos.iter().enumerate() {
        assert_eq!(e.invocation, i as u32);
        assert_eq!(e.value_f32(0), i as f32 * 0.25 - 0.5);
        assert_eq!(e.value_f32(1), i as f32 * 0.1);
        assert_eq!(e.value_f32(3), 1.0);
        assert!(e.done);
    }
    let colors = result.exports_to(ExportTarget::Param(0));
    for (i, e) in colors.iter().enumerate() {
        assert_eq!(e.value_f32(0), i as f32 * 2.0);
    }
    let prims = result.exports_to(ExportTarget::Prim);
    assert_eq!(prims.len(), 1);
    assert_eq!(prims[0].values[0], 1 << 10 | 2 << 20);
}

#[test]
fn cull_primitive_output_raises_the_null_bit() {
    let shader = simple_mesh(true);
    let options = mesh_options();
    let lowered = lower_mesh(&shader, &options).unwrap();
    let params = mesh_launch(&shader, &options);
    let mut device = Device::new();
    let result = navi_ir::interp::run_workgroup(&lowered.function, &params, &mut device);

    assert_eq!(result.alloc, Some((3, 2)));
    let prims = result.exports_to(ExportTarget::Prim);
    assert_eq!(prims.len(), 2);
    assert_eq!(prims[0].values[0] >> 31, 0);
    assert_eq!(prims[1].values[0] >> 31, 1, "culled primitive must be null");
}

/// A mesh shader relying on cross-invocation output reads through a
/// barrier: lane i writes VAR0[i], then reads VAR0[(i + 1) % 32] into
/// VAR1[i].
fn exchange_mesh(api_size: u32) -> Shader {
    let mut b = FunctionBuilder::new();
    let lane = b.lane_id();
    let lf = b.u2f(lane);
    let two = b.const_f32(2.0);
    let v = b.fmul(lf, two);
    store_indexed(&mut b, Slot::var(0), false, lane, [Some(v), None, None, None]);
    let zero_f = b.const_f32(0.0);
    let one_f = b.const_f32(1.0);
    store_indexed(
        &mut b,
        Slot::POS,
        false,
        lane,
        [Some(zero_f), Some(zero_f), Some(zero_f), Some(one_f)],
    );
    b.barrier(BarrierKind::WORKGROUP);
    let one = b.const_u32(1);
    let next = b.iadd(lane, one);
    let mask = b.const_u32(api_size - 1);
    let wrapped = b.iand(next, mask);
    let neighbor = b.push(
        Op::LoadOutput {
            slot: Slot::var(0),
            space: IoSpace::S32,
            per_primitive: false,
            index: Some(wrapped),
            ty: ScalarType::F32,
            comp: 0,
        },
        ScalarType::F32,
    );
    store_indexed(&mut b, Slot::var(1), false, lane, [Some(neighbor), None, None, None]);
    let zero = b.const_u32(0);
    let first = b.ieq(lane, zero);
    b.if_(first);
    {
        let two_u = b.const_u32(2);
        store_indexed(
            &mut b,
            Slot::PRIM_INDICES,
            true,
            zero,
            [Some(zero), Some(one), Some(two_u), None],
        );
    }
    b.end_if();
    let vtx = b.const_u32(api_size);
    let prim = b.const_u32(1);
    b.push_void(Op::SetVertexPrimCount {
        stream: 0,
        vertices: vtx,
        primitives: prim,
    });
    let mut info = ShaderInfo::new(Stage::Mesh, api_size);
    info.outputs_written = Slot::POS.bit() | Slot::var(0).bit() | Slot::var(1).bit();
    info.mesh = Some(MeshInfo {
        max_vertices: api_size,
        max_primitives: 1,
        prim_vertices: 3,
        api_workgroup_size: api_size,
        cross_invocation_outputs: Slot::var(0).bit(),
    });
    Shader {
        info,
        function: b.finish(),
    }
}

/// The hardware launches 64 invocations for an API workgroup of 32; the
/// idle wave must absorb the body barrier without deadlocking.
#[test]
fn idle_waves_pair_with_body_barriers() {
    let shader = exchange_mesh(32);
    let mut options = MeshOptions::new(GfxLevel::Gfx103, WaveSize::W32, 64);
    options.param_map = ParamMap::assign_defaults(Slot::var(0).bit() | Slot::var(1).bit());
    let lowered = lower_mesh(&shader, &options).unwrap();
    let params = mesh_launch(&shader, &options);
    let mut device = Device::new();
    let result = navi_ir::interp::run_workgroup(&lowered.function, &params, &mut device);

    assert_eq!(result.alloc, Some((32, 1)));
    let var1_param = options.param_map.get(Slot::var(1)).unwrap();
    let exchanged = result.exports_to(ExportTarget::Param(var1_param));
    assert_eq!(exchanged.len(), 32);
    for (i, e) in exchanged.iter().enumerate() {
        let neighbor = (i + 1) % 32;
        assert_eq!(e.value_f32(0), neighbor as f32 * 2.0);
    }
}
