// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The geometry-shader orchestrator.
//!
//! The GS body runs for one thread per input primitive and emits up to
//! `max_out_vertices` vertices into an LDS ring addressed through a
//! bank-conflict-avoiding swizzle. Output primitives are strips: every
//! vertex past the first `out_prim_vertices - 1` of a strip completes a
//! primitive, recorded in a per-vertex flag byte. The finale derives
//! primitive and vertex liveness from those flags (optionally re-culling
//! each primitive from the ring), repacks both populations, compacts
//! vertices through source/new-index bytes in the ring, and exports.
//!
//! Output stores must dominate the `emit_vertex` that consumes them;
//! stream 0 is the rasterized stream, and streamout is supported on
//! stream 0 only.

use navi_ir::passes::{append_function, Rewrite};
use navi_ir::{
    BarrierKind, FunctionBuilder, GsInfo, IoSpace, MemWidth, Op, ScalarType, Shader, ShaderArg,
    ShaderInfo, Slot, Stage, ValueId, VarId,
};

use crate::cull::{cull_primitive, CullSettings};
use crate::export::{
    export_parameters, export_position, export_primitive, pack_primitive,
    store_parameters_attr_ring, ExportConfig,
};
use crate::layout::{GsLayout, GS_FLAG_PRIM_COMPLETE, GS_FLAG_PRIM_ODD, GS_VTX_NEW_INDEX, GS_VTX_SOURCE};
use crate::options::NggOptions;
use crate::outputs::OutputTable;
use crate::repack::{repack_invocations, RepackConfig};
use crate::streamout::{emit_allocation, emit_prim_writes, emit_query_accumulation};
use crate::{Error, MAX_WORKGROUP_SIZE};

/// Lowers a geometry shader to the NGG hardware protocol.
pub fn lower_gs(shader: &Shader, options: &NggOptions) -> Result<Shader, Error> {
    if shader.info.stage != Stage::Geometry {
        return Err(Error::WrongStage(shader.info.stage));
    }
    let Some(gs) = shader.info.gs else {
        return Err(Error::WrongStage(shader.info.stage));
    };
    if options.workgroup_size > MAX_WORKGROUP_SIZE {
        return Err(Error::WorkgroupTooLarge {
            size: options.workgroup_size,
            max: MAX_WORKGROUP_SIZE,
        });
    }
    if shader.info.outputs_written_16bit_lo != 0 || shader.info.outputs_written_16bit_hi != 0 {
        return Err(Error::Unsupported("16-bit outputs in the geometry stage"));
    }
    if let Some(xfb) = &options.xfb {
        if xfb.outputs.iter().any(|o| o.stream != 0) {
            return Err(Error::Unsupported("streamout on a nonzero GS stream"));
        }
    }
    // The launch parameters come from stream 0's declared counts; a body
    // that never sets them is malformed input that validation should
    // have rejected.
    let has_counts = shader.function.instrs().iter().any(
        |i| matches!(i.op, Op::SetVertexPrimCount { stream: 0, .. }),
    );
    if !has_counts {
        return Err(Error::MissingVertexPrimCount(0));
    }

    let layout = GsLayout::plan(options, gs.stream_slots[0], gs.max_out_vertices)?;
    let mut b = FunctionBuilder::new();

    let lane = b.lane_id();
    let wave = b.wave_id();
    let wave_lanes = b.const_u32(options.wave_size.lanes());
    let scaled = b.imul(wave, wave_lanes);
    let tid = b.iadd(scaled, lane);
    let info = b.load_arg(ShaderArg::WorkgroupInfo, ScalarType::U32);
    let gs_thread_count = b.ubfe_imm(info, 12, 9);
    let is_gs = b.ult(tid, gs_thread_count);
    let zero = b.const_u32(0);

    // The liveness protocol reads flag bytes of never-emitted slots, so
    // they must start cleared.
    {
        let addr = layout.vertex_addr(&mut b, tid);
        let flag_base = b.const_u32(layout.num_out_dwords * 4 + GS_VTX_FLAG_OFF);
        let addr = b.iadd(addr, flag_base);
        b.lds_store(addr, zero, MemWidth::B8);
    }
    b.barrier(BarrierKind::WORKGROUP);

    // Shader body with emit interception.
    let mut counts: [Option<(ValueId, ValueId)>; 4] = [None; 4];
    b.if_(is_gs);
    let body_counts = append_gs_body(&mut b, shader, &gs, &layout, tid)?;
    for (s, c) in body_counts.iter().enumerate() {
        counts[s] = *c;
    }
    if options.has_gen_prim_query {
        for (s, c) in counts.iter().enumerate() {
            if let Some((_, prims)) = c {
                let _ = b.atomic_add(navi_ir::CounterSlot::GeneratedPrims(s as u8), *prims);
            }
        }
    }
    b.end_if();
    b.barrier(BarrierKind::WORKGROUP);

    let repack_cfg = |scratch| RepackConfig {
        gfx_level: options.gfx_level,
        wave_size: options.wave_size,
        num_waves: options.num_waves(),
        scratch,
    };

    // A thread per output-vertex slot; its flag byte tells whether a
    // primitive ends here.
    let own_flag = load_flag(&mut b, &layout, tid);
    let complete_bit = b.const_u32(GS_FLAG_PRIM_COMPLETE);
    let pre_cull_end = {
        let m = b.iand(own_flag, complete_bit);
        b.ine(m, zero)
    };

    // Streamout captures every generated primitive, before any culling.
    if let Some(xfb) = &options.xfb {
        let rep_so = repack_invocations(&mut b, pre_cull_end, &repack_cfg(layout.repack_prim));
        let mut gen = [None; 4];
        gen[0] = Some(rep_so.total);
        let state = emit_allocation(&mut b, xfb, layout.so_broadcast, gen, gs.out_prim_vertices);
        emit_query_accumulation(
            &mut b,
            [None; 4],
            state.emit,
            false,
            options.has_pipeline_stats_query,
        );
        b.if_(pre_cull_end);
        {
            let indices = prim_vertex_indices(&mut b, &gs, tid, own_flag);
            let mut fetch =
                |b: &mut FunctionBuilder, v: u32, _k: usize, out: &crate::options::XfbOutput| {
                    let raw = load_ring_component(b, &layout, indices[v as usize], out.slot, out.comp);
                    if out.is_16bit {
                        b.f16_to_32(raw)
                    } else {
                        raw
                    }
                };
            emit_prim_writes(
                &mut b,
                xfb,
                &state,
                0,
                rep_so.index,
                gs.out_prim_vertices,
                &mut fetch,
            );
        }
        b.end_if();
        b.barrier(BarrierKind::RELEASE_DEVICE);
    }

    // Optional deferred culling: re-walk each complete primitive's
    // vertices from the ring and clear the complete bit of rejects.
    if options.can_cull {
        b.if_(pre_cull_end);
        {
            let indices = prim_vertex_indices(&mut b, &gs, tid, own_flag);
            let mut positions = Vec::new();
            for &idx in &indices {
                let mut pos = [zero; 4];
                for (c, p) in pos.iter_mut().enumerate() {
                    *p = load_ring_component(&mut b, &layout, idx, Slot::POS, c as u8);
                }
                positions.push(pos);
            }
            let settings = CullSettings::from_args(&mut b);
            let initial = b.const_bool(true);
            let accept = cull_primitive(&mut b, &settings, &positions, initial, None);
            let rejected = b.bnot(accept);
            b.if_(rejected);
            {
                let keep = b.inot(complete_bit);
                let cleared = b.iand(own_flag, keep);
                store_flag(&mut b, &layout, tid, cleared);
            }
            b.end_if();
        }
        b.end_if();
        b.barrier(BarrierKind::WORKGROUP);
    }

    // Liveness. A vertex is live when any primitive completing at it or
    // at the following `out_prim_vertices - 1` slots of the same source
    // thread survived.
    let post_flag = load_flag(&mut b, &layout, tid);
    let prim_live = {
        let m = b.iand(post_flag, complete_bit);
        b.ine(m, zero)
    };
    let max_out = b.const_u32(gs.max_out_vertices);
    let own_thread = b.udiv(tid, max_out);
    let wg_size = b.const_u32(options.workgroup_size);
    let mut vtx_live = b.const_bool(false);
    for k in 0..gs.out_prim_vertices {
        let kc = b.const_u32(k);
        let idx = b.iadd(tid, kc);
        let in_ring = b.ult(idx, wg_size);
        let thread = b.udiv(idx, max_out);
        let same = b.ieq(thread, own_thread);
        let ok = b.band(in_ring, same);
        let safe = b.select(ok, idx, tid);
        let flag = load_flag(&mut b, &layout, safe);
        let used = {
            let m = b.iand(flag, complete_bit);
            let c = b.ine(m, zero);
            b.band(ok, c)
        };
        vtx_live = b.bor(vtx_live, used);
    }

    let rep_v = repack_invocations(&mut b, vtx_live, &repack_cfg(layout.repack_vtx));
    let rep_p = repack_invocations(&mut b, prim_live, &repack_cfg(layout.repack_prim));

    // Vertex compaction, phase one: publish the new index at the old
    // slot, the old index at the new slot.
    b.if_(vtx_live);
    {
        let own = layout.vertex_addr(&mut b, tid);
        let tail = b.const_u32(layout.num_out_dwords * 4);
        let new_off = b.const_u32(GS_VTX_NEW_INDEX);
        let own_tail = b.iadd(own, tail);
        let addr = b.iadd(own_tail, new_off);
        b.lds_store(addr, rep_v.index, MemWidth::B8);

        let target = layout.vertex_addr(&mut b, rep_v.index);
        let target_tail = b.iadd(target, tail);
        let src_off = b.const_u32(GS_VTX_SOURCE);
        let addr = b.iadd(target_tail, src_off);
        b.lds_store(addr, tid, MemWidth::B8);
    }
    b.end_if();
    b.barrier(BarrierKind::WORKGROUP);

    // Primitive rebuild with compacted vertex indices, staged at the
    // primitive's compacted slot.
    b.if_(prim_live);
    {
        let indices = prim_vertex_indices(&mut b, &gs, tid, post_flag);
        let mut new_indices = Vec::new();
        for &idx in &indices {
            let entry = layout.vertex_addr(&mut b, idx);
            let tail = b.const_u32(layout.num_out_dwords * 4 + GS_VTX_NEW_INDEX);
            let addr = b.iadd(entry, tail);
            new_indices.push(b.lds_load(addr, MemWidth::B8));
        }
        let packed = pack_primitive(&mut b, &new_indices, None, None);
        let four = b.const_u32(4);
        let row = b.imul(rep_p.index, four);
        let base = b.const_u32(layout.prim_data.offset);
        let addr = b.iadd(base, row);
        b.lds_store(addr, packed, MemWidth::B32);
    }
    b.end_if();
    b.barrier(BarrierKind::WORKGROUP);

    // Allocation and exports.
    let elected = b.ieq(tid, zero);
    if options.gfx_level.needs_zero_prim_workaround() {
        let empty = b.ieq(rep_p.total, zero);
        let one = b.const_u32(1);
        let alloc_v = b.select(empty, one, rep_v.total);
        let alloc_p = b.select(empty, one, rep_p.total);
        b.if_(elected);
        b.alloc_export_space(alloc_v, alloc_p);
        b.end_if();
        let dummy = b.band(elected, empty);
        b.if_(dummy);
        {
            let sh = b.const_u32(31);
            let null = b.ishl(one, sh);
            export_primitive(&mut b, null);
            let zf = b.const_f32(0.0);
            let of = b.const_f32(1.0);
            b.export(
                navi_ir::ExportTarget::Pos(0),
                [Some(zf), Some(zf), Some(zf), Some(of)],
                0xF,
                true,
            );
        }
        b.end_if();
    } else {
        b.if_(elected);
        b.alloc_export_space(rep_v.total, rep_p.total);
        b.end_if();
    }

    let vtx_exporter = b.ult(tid, rep_v.total);
    b.if_(vtx_exporter);
    {
        let own = layout.vertex_addr(&mut b, tid);
        let tail = b.const_u32(layout.num_out_dwords * 4 + GS_VTX_SOURCE);
        let addr = b.iadd(own, tail);
        let source = b.lds_load(addr, MemWidth::B8);
        let mut table = OutputTable::new();
        for s in 0..Slot::COUNT as u8 {
            let slot = Slot(s);
            if gs.stream_slots[0] & slot.bit() == 0 {
                continue;
            }
            for c in 0..4_u8 {
                let v = load_ring_component(&mut b, &layout, source, slot, c);
                table.record(IoSpace::S32, slot, c, v, ScalarType::U32);
            }
        }
        let config = ExportConfig {
            gfx_level: options.gfx_level,
            clip_cull_mask: options.clip_cull_mask,
            force_vrs: options.force_vrs,
            multiview: options.multiview,
            no_param_export: (options.param_map.is_empty() && options.param_map_16.is_empty())
                || options.gfx_level.has_attr_ring(),
        };
        if options.gfx_level.has_attr_ring() {
            // Ring stores go first; the done export's device release
            // publishes them.
            store_parameters_attr_ring(&mut b, &options.param_map, &table, tid);
            export_position(&mut b, &config, &table, true);
        } else {
            export_position(&mut b, &config, &table, true);
            export_parameters(&mut b, &options.param_map, &options.param_map_16, &table);
        }
    }
    b.end_if();

    let prim_exporter = b.ult(tid, rep_p.total);
    b.if_(prim_exporter);
    {
        let four = b.const_u32(4);
        let row = b.imul(tid, four);
        let base = b.const_u32(layout.prim_data.offset);
        let addr = b.iadd(base, row);
        let packed = b.lds_load(addr, MemWidth::B32);
        export_primitive(&mut b, packed);
    }
    b.end_if();

    let mut out_info = ShaderInfo::new(Stage::Geometry, options.workgroup_size);
    out_info.outputs_written = shader.info.outputs_written;
    Ok(Shader {
        info: out_info,
        function: b.finish(),
    })
}

/// Required LDS bytes for the given options and GS metadata.
pub fn gs_lds_size(options: &NggOptions, gs: &GsInfo) -> Result<u32, Error> {
    Ok(GsLayout::plan(options, gs.stream_slots[0], gs.max_out_vertices)?.total)
}

const GS_VTX_FLAG_OFF: u32 = crate::layout::GS_VTX_FLAG;

fn flag_addr(b: &mut FunctionBuilder, layout: &GsLayout, vtx_idx: ValueId) -> ValueId {
    let entry = layout.vertex_addr(b, vtx_idx);
    let off = b.const_u32(layout.num_out_dwords * 4 + GS_VTX_FLAG_OFF);
    b.iadd(entry, off)
}

fn load_flag(b: &mut FunctionBuilder, layout: &GsLayout, vtx_idx: ValueId) -> ValueId {
    let addr = flag_addr(b, layout, vtx_idx);
    b.lds_load(addr, MemWidth::B8)
}

fn store_flag(b: &mut FunctionBuilder, layout: &GsLayout, vtx_idx: ValueId, flag: ValueId) {
    let addr = flag_addr(b, layout, vtx_idx);
    b.lds_store(addr, flag, MemWidth::B8);
}

fn load_ring_component(
    b: &mut FunctionBuilder,
    layout: &GsLayout,
    vtx_idx: ValueId,
    slot: Slot,
    comp: u8,
) -> ValueId {
    match layout.out_offset(slot, comp) {
        Some(off) => {
            let entry = layout.vertex_addr(b, vtx_idx);
            let off = b.const_u32(off);
            let addr = b.iadd(entry, off);
            b.lds_load(addr, MemWidth::B32)
        }
        None => b.const_u32(0),
    }
}

/// The ring indices of the vertices forming the primitive that completes
/// at `end_idx`, in rasterization order (strip parity unfolded via the
/// odd flag).
fn prim_vertex_indices(
    b: &mut FunctionBuilder,
    gs: &GsInfo,
    end_idx: ValueId,
    flag: ValueId,
) -> Vec<ValueId> {
    let pv = gs.out_prim_vertices;
    let mut indices = Vec::with_capacity(pv as usize);
    for j in 0..pv {
        let back = b.const_u32(pv - 1 - j);
        indices.push(b.isub(end_idx, back));
    }
    if pv == 3 {
        // Odd strip primitives flip their winding; swap the last two
        // vertices to restore it.
        let odd_bit = b.const_u32(GS_FLAG_PRIM_ODD);
        let m = b.iand(flag, odd_bit);
        let zero = b.const_u32(0);
        let odd = b.ine(m, zero);
        let a = indices[1];
        let c = indices[2];
        indices[1] = b.select(odd, c, a);
        indices[2] = b.select(odd, a, c);
    }
    indices
}

/// Walks the GS body, intercepting the stream intrinsics. Returns the
/// per-stream `(vertices, primitives)` declared counts.
fn append_gs_body(
    b: &mut FunctionBuilder,
    shader: &Shader,
    gs: &GsInfo,
    layout: &GsLayout,
    tid: ValueId,
) -> Result<[Option<(ValueId, ValueId)>; 4], Error> {
    // Per-stream emit state lives in registers: emits may sit inside
    // runtime control flow.
    let mut emit_vars: [Option<(VarId, VarId)>; 4] = [None; 4];
    for s in 0..4 {
        if gs.active_streams & (1 << s) != 0 {
            let emitted = b.declare_var(ScalarType::U32);
            let in_prim = b.declare_var(ScalarType::U32);
            let zero = b.const_u32(0);
            b.var_store(emitted, zero);
            b.var_store(in_prim, zero);
            emit_vars[s] = Some((emitted, in_prim));
        }
    }

    let mut table = OutputTable::new();
    let mut counts: [Option<(ValueId, ValueId)>; 4] = [None; 4];
    let mut bad: Option<Error> = None;

    append_function(b, &shader.function, |b, instr, map| match &instr.op {
        Op::StoreOutput {
            index: None,
            per_primitive: false,
            ..
        } => {
            table.record_store(&instr.op, map);
            Rewrite::Drop
        }
        Op::EmitVertex { stream } => {
            let s = *stream as usize;
            let Some((emitted_var, in_prim_var)) = emit_vars[s] else {
                return Rewrite::Drop;
            };
            let emitted = b.var_load(emitted_var);
            let max_out = b.const_u32(gs.max_out_vertices);
            let fits = b.ult(emitted, max_out);
            b.if_(fits);
            {
                if s == 0 {
                    // Ring store of the current output table.
                    let scaled = b.imul(tid, max_out);
                    let out_idx = b.iadd(scaled, emitted);
                    for slot_i in 0..Slot::COUNT as u8 {
                        let slot = Slot(slot_i);
                        if gs.stream_slots[0] & slot.bit() == 0 {
                            continue;
                        }
                        for c in 0..4_u8 {
                            let Some(off) = layout.out_offset(slot, c) else {
                                continue;
                            };
                            let value = match table.get(IoSpace::S32, slot, c) {
                                Some(v) => v.value,
                                None => b.const_u32(0),
                            };
                            let entry = layout.vertex_addr(b, out_idx);
                            let off = b.const_u32(off);
                            let addr = b.iadd(entry, off);
                            b.lds_store(addr, value, MemWidth::B32);
                        }
                    }
                    // Primitive flag: complete when this vertex closes a
                    // strip window, with the parity bit for winding.
                    let in_prim = b.var_load(in_prim_var);
                    let window = b.const_u32(gs.out_prim_vertices - 1);
                    let complete = b.uge(in_prim, window);
                    let parity = {
                        let base = b.isub(in_prim, window);
                        let one = b.const_u32(1);
                        b.iand(base, one)
                    };
                    let flag_set = {
                        let one = b.const_u32(GS_FLAG_PRIM_COMPLETE);
                        let sh = b.const_u32(1);
                        let odd = b.ishl(parity, sh);
                        b.ior(one, odd)
                    };
                    let zero = b.const_u32(0);
                    let flag = b.select(complete, flag_set, zero);
                    store_flag(b, layout, out_idx, flag);
                }
                let one = b.const_u32(1);
                let next = b.iadd(emitted, one);
                b.var_store(emitted_var, next);
                let in_prim = b.var_load(in_prim_var);
                let next_ip = b.iadd(in_prim, one);
                b.var_store(in_prim_var, next_ip);
            }
            b.end_if();
            table.clear();
            Rewrite::Replaced(None)
        }
        Op::EndPrimitive { stream } => {
            let s = *stream as usize;
            if let Some((_, in_prim_var)) = emit_vars[s] {
                let zero = b.const_u32(0);
                b.var_store(in_prim_var, zero);
            }
            Rewrite::Replaced(None)
        }
        Op::SetVertexPrimCount {
            stream,
            vertices,
            primitives,
        } => {
            counts[*stream as usize] = Some((map.get(*vertices), map.get(*primitives)));
            Rewrite::Drop
        }
        op if op.is_abstract() => {
            if bad.is_none() {
                bad = Some(Error::Unsupported(
                    "arrayed or per-primitive I/O in a geometry-shader body",
                ));
            }
            Rewrite::Drop
        }
        _ => Rewrite::Keep,
    });

    match bad {
        Some(e) => Err(e),
        None => Ok(counts),
    }
}
