// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The vertex/tess-eval (no-GS) orchestrator.
//!
//! Sequences the components for a plain vertex or tessellation-evaluation
//! shader running as the NGG primitive stage. Three concrete paths:
//!
//! - passthrough: primitives exported exactly as delivered, no LDS;
//! - standard: export everything, with optional edge flags, primitive-id
//!   transport and streamout;
//! - deferred culling: a position-only clone of the body feeds the
//!   culler, surviving vertices and primitives are repacked and
//!   compacted, and the full body re-runs for surviving invocations with
//!   repacked inputs.
//!
//! Culling is a runtime toggle: a `can_cull` compilation carries both the
//! culling branch and the export-everything branch, selected per draw by
//! the `CULL_ENABLE` flag.

use std::collections::HashMap;

use navi_ir::passes::output_subset;
use navi_ir::{
    BarrierKind, FunctionBuilder, IoSpace, MemWidth, Op, ScalarType, Shader, ShaderArg,
    ShaderInfo, Slot, Stage, ValueId,
};

use crate::compact::{
    gather_adopted, load_clip_neg_mask, load_exporter_index, load_vertex_accepted,
    load_vertex_position, mark_vertex_accepted, scatter_to_exporter, store_vertex_record,
    RepackableArgs,
};
use crate::cull::{cull_primitive, CullSettings};
use crate::export::{
    export_parameters, export_position, export_primitive, pack_primitive,
    store_parameters_attr_ring, ExportConfig,
};
use crate::layout::NogsLayout;
use crate::options::{runtime_flags, NggOptions};
use crate::outputs::{append_aggregating, OutputTable};
use crate::repack::{repack_invocations, RepackConfig};
use crate::streamout::{emit_allocation, emit_prim_writes, emit_query_accumulation};
use crate::{Error, MAX_WORKGROUP_SIZE};

/// Values every path needs, computed once in the prologue.
struct Prologue {
    tid: ValueId,
    wg_vtx_count: ValueId,
    wg_prim_count: ValueId,
    is_vtx: ValueId,
    is_prim: ValueId,
}

fn emit_prologue(b: &mut FunctionBuilder, options: &NggOptions) -> Prologue {
    let lane = b.lane_id();
    let wave = b.wave_id();
    let wave_lanes = b.const_u32(options.wave_size.lanes());
    let scaled = b.imul(wave, wave_lanes);
    let tid = b.iadd(scaled, lane);
    let info = b.load_arg(ShaderArg::WorkgroupInfo, ScalarType::U32);
    let wg_vtx_count = b.ubfe_imm(info, 0, 9);
    let wg_prim_count = b.ubfe_imm(info, 12, 9);
    let is_vtx = b.ult(tid, wg_vtx_count);
    let is_prim = b.ult(tid, wg_prim_count);
    Prologue {
        tid,
        wg_vtx_count,
        wg_prim_count,
        is_vtx,
        is_prim,
    }
}

/// Lowers a vertex or tess-eval shader to the NGG hardware protocol.
pub fn lower_nogs(shader: &Shader, options: &NggOptions) -> Result<Shader, Error> {
    match shader.info.stage {
        Stage::Vertex | Stage::TessEval => {}
        other => return Err(Error::WrongStage(other)),
    }
    if options.workgroup_size > MAX_WORKGROUP_SIZE {
        return Err(Error::WorkgroupTooLarge {
            size: options.workgroup_size,
            max: MAX_WORKGROUP_SIZE,
        });
    }
    if options.can_cull {
        if options.prim_vertices == 1 {
            return Err(Error::Unsupported("point-primitive culling"));
        }
        if options.xfb.is_some() {
            return Err(Error::Unsupported("streamout with deferred culling"));
        }
        if options.has_edge_flags {
            return Err(Error::Unsupported("edge flags with deferred culling"));
        }
        if options.passthrough {
            return Err(Error::Unsupported("passthrough with deferred culling"));
        }
    }
    if options.passthrough
        && (options.xfb.is_some()
            || options.has_edge_flags
            || options.export_primitive_id
            || options.has_gen_prim_query
            || options.has_pipeline_stats_query)
    {
        return Err(Error::Unsupported(
            "passthrough excludes streamout, edge flags, primitive id and queries",
        ));
    }

    let layout = NogsLayout::plan(options)?;
    let mut b = FunctionBuilder::new();
    let pro = emit_prologue(&mut b, options);

    if options.passthrough {
        emit_passthrough(&mut b, shader, options, &pro)?;
    } else if options.can_cull {
        let flags = b.load_arg(ShaderArg::RuntimeFlags, ScalarType::U32);
        let bit = b.const_u32(runtime_flags::CULL_ENABLE);
        let masked = b.iand(flags, bit);
        let zero = b.const_u32(0);
        let cull_enabled = b.ine(masked, zero);
        b.if_(cull_enabled);
        emit_culling_branch(&mut b, shader, options, &layout, &pro)?;
        b.else_();
        emit_standard_branch(&mut b, shader, options, &layout, &pro)?;
        b.end_if();
    } else {
        emit_standard_branch(&mut b, shader, options, &layout, &pro)?;
    }

    let mut info = ShaderInfo::new(shader.info.stage, options.workgroup_size);
    info.outputs_written = shader.info.outputs_written;
    Ok(Shader {
        info,
        function: b.finish(),
    })
}

/// Required LDS bytes for the given options; what the driver allocates.
pub fn nogs_lds_size(options: &NggOptions) -> Result<u32, Error> {
    Ok(NogsLayout::plan(options)?.total)
}

fn export_config(options: &NggOptions) -> ExportConfig {
    ExportConfig {
        gfx_level: options.gfx_level,
        clip_cull_mask: options.clip_cull_mask,
        force_vrs: options.force_vrs,
        multiview: options.multiview,
        no_param_export: (options.param_map.is_empty() && options.param_map_16.is_empty())
            || options.gfx_level.has_attr_ring(),
    }
}

fn emit_passthrough(
    b: &mut FunctionBuilder,
    shader: &Shader,
    options: &NggOptions,
    pro: &Prologue,
) -> Result<(), Error> {
    b.if_(pro.is_prim);
    {
        let packed = b.load_arg(ShaderArg::PackedPrimitive, ScalarType::U32);
        export_primitive(b, packed);
    }
    b.end_if();
    b.if_(pro.is_vtx);
    {
        let mut table = OutputTable::new();
        append_aggregating(b, &shader.function, &HashMap::new(), &mut table)?;
        emit_vertex_exports(b, options, &table, pro.tid);
    }
    b.end_if();
    Ok(())
}

/// Position plus parameters, in the order the hardware needs: attribute-
/// ring stores precede the done export (which carries the device release
/// making them visible to the rasterizer), parameter exports follow it.
fn emit_vertex_exports(
    b: &mut FunctionBuilder,
    options: &NggOptions,
    table: &OutputTable,
    vertex_index: ValueId,
) {
    let config = export_config(options);
    if options.gfx_level.has_attr_ring() {
        store_parameters_attr_ring(b, &options.param_map, table, vertex_index);
        export_position(b, &config, table, true);
    } else {
        export_position(b, &config, table, true);
        export_parameters(b, &options.param_map, &options.param_map_16, table);
    }
}

/// The export-everything path: no repacking, primitives leave as
/// delivered (modulo edge flags), counts come straight from the launch.
fn emit_standard_branch(
    b: &mut FunctionBuilder,
    shader: &Shader,
    options: &NggOptions,
    layout: &NogsLayout,
    pro: &Prologue,
) -> Result<(), Error> {
    let zero = b.const_u32(0);
    let elected = b.ieq(pro.tid, zero);
    b.if_(elected);
    b.alloc_export_space(pro.wg_vtx_count, pro.wg_prim_count);
    b.end_if();

    // Shader body, for vertex threads.
    let mut table = OutputTable::new();
    b.if_(pro.is_vtx);
    append_aggregating(b, &shader.function, &HashMap::new(), &mut table)?;
    if options.has_edge_flags {
        let flag = table
            .get(IoSpace::S32, Slot::EDGE, 0)
            .map(|v| v.value)
            .unwrap_or(zero);
        let one = b.const_u32(1);
        let clamped = b.umin(flag, one);
        let base = b.const_u32(layout.edge_flags.offset);
        let addr = b.iadd(base, pro.tid);
        b.lds_store(addr, clamped, MemWidth::B8);
    }
    if let Some(xfb) = &options.xfb {
        // Stage the captured components so primitive threads can write
        // any of their vertices.
        for (k, out) in xfb.outputs.iter().enumerate() {
            let space = if out.is_16bit { IoSpace::Lo16 } else { IoSpace::S32 };
            let raw = table
                .get(space, out.slot, out.comp)
                .map(|v| v.value)
                .unwrap_or(zero);
            let value = if out.is_16bit { b.f16_to_32(raw) } else { raw };
            let stride = b.const_u32(layout.xfb_stride * 4);
            let row = b.imul(pro.tid, stride);
            let base = b.const_u32(layout.xfb_stage.offset + k as u32 * 4);
            let addr = b.iadd(base, row);
            b.lds_store(addr, value, MemWidth::B32);
        }
    }
    b.end_if();

    // Primitive-id transport: the primitive thread deposits its id at the
    // provoking vertex's slot.
    if options.export_primitive_id {
        b.if_(pro.is_prim);
        {
            let packed = b.load_arg(ShaderArg::PackedPrimitive, ScalarType::U32);
            let provoking = emit_provoking_vertex(b, options, packed);
            let prim_id = b.load_arg(ShaderArg::PrimitiveId, ScalarType::U32);
            let four = b.const_u32(4);
            let row = b.imul(provoking, four);
            let base = b.const_u32(layout.prim_id.offset);
            let addr = b.iadd(base, row);
            b.lds_store(addr, prim_id, MemWidth::B32);
        }
        b.end_if();
    }

    let needs_exchange =
        options.export_primitive_id || options.has_edge_flags || options.xfb.is_some();
    if needs_exchange {
        b.barrier(BarrierKind::WORKGROUP);
    }

    // Streamout allocation and the per-primitive buffer writes.
    if let Some(xfb) = &options.xfb {
        let mut gen = [None; 4];
        gen[0] = Some(pro.wg_prim_count);
        let state = emit_allocation(b, xfb, layout.so_broadcast, gen, options.prim_vertices);
        emit_query_accumulation(
            b,
            gen,
            state.emit,
            options.has_gen_prim_query,
            options.has_pipeline_stats_query,
        );
        b.if_(pro.is_prim);
        {
            let packed = b.load_arg(ShaderArg::PackedPrimitive, ScalarType::U32);
            let mut fetch = |b: &mut FunctionBuilder, v: u32, k: usize, _out: &crate::options::XfbOutput| {
                let vtx = b.ubfe_imm(packed, 10 * v, 9);
                let stride = b.const_u32(layout.xfb_stride * 4);
                let row = b.imul(vtx, stride);
                let base = b.const_u32(layout.xfb_stage.offset + k as u32 * 4);
                let addr = b.iadd(base, row);
                b.lds_load(addr, MemWidth::B32)
            };
            emit_prim_writes(b, xfb, &state, 0, pro.tid, options.prim_vertices, &mut fetch);
        }
        b.end_if();
        // Buffer writes must be visible before rasterization can start.
        b.barrier(BarrierKind::RELEASE_DEVICE);
    } else {
        let mut gen = [None; 4];
        gen[0] = Some(pro.wg_prim_count);
        emit_query_accumulation(
            b,
            gen,
            [None; 4],
            options.has_gen_prim_query,
            options.has_pipeline_stats_query,
        );
    }

    // Primitive export.
    b.if_(pro.is_prim);
    {
        let mut packed = b.load_arg(ShaderArg::PackedPrimitive, ScalarType::U32);
        if options.has_edge_flags {
            // Clear the edge bit of every vertex whose flag is zero.
            let mut cleared = b.const_u32(0);
            for v in 0..options.prim_vertices {
                let idx = b.ubfe_imm(packed, 10 * v, 9);
                let base = b.const_u32(layout.edge_flags.offset);
                let addr = b.iadd(base, idx);
                let flag = b.lds_load(addr, MemWidth::B8);
                let one = b.const_u32(1);
                let off = b.isub(one, flag);
                let sh = b.const_u32(10 * v + 9);
                let bit = b.ishl(off, sh);
                cleared = b.ior(cleared, bit);
            }
            let keep = b.inot(cleared);
            packed = b.iand(packed, keep);
        }
        export_primitive(b, packed);
    }
    b.end_if();

    // Vertex exports.
    b.if_(pro.is_vtx);
    {
        let mut table = table;
        if options.export_primitive_id {
            let four = b.const_u32(4);
            let row = b.imul(pro.tid, four);
            let base = b.const_u32(layout.prim_id.offset);
            let addr = b.iadd(base, row);
            let prim_id = b.lds_load(addr, MemWidth::B32);
            table.record(IoSpace::S32, Slot::PRIM_ID, 0, prim_id, ScalarType::U32);
        }
        emit_vertex_exports(b, options, &table, pro.tid);
    }
    b.end_if();
    Ok(())
}

fn emit_provoking_vertex(
    b: &mut FunctionBuilder,
    options: &NggOptions,
    packed: ValueId,
) -> ValueId {
    let first = b.ubfe_imm(packed, 0, 9);
    if options.prim_vertices == 1 {
        return first;
    }
    let flags = b.load_arg(ShaderArg::RuntimeFlags, ScalarType::U32);
    let bit = b.const_u32(runtime_flags::PROVOKING_LAST);
    let masked = b.iand(flags, bit);
    let zero = b.const_u32(0);
    let last_convention = b.ine(masked, zero);
    let last = b.ubfe_imm(packed, 10 * (options.prim_vertices - 1), 9);
    b.select(last_convention, last, first)
}

/// The deferred-culling path.
fn emit_culling_branch(
    b: &mut FunctionBuilder,
    shader: &Shader,
    options: &NggOptions,
    layout: &NogsLayout,
    pro: &Prologue,
) -> Result<(), Error> {
    let clip_mask = options.clip_cull_mask;
    // The position-computing portion of the body: position stores plus,
    // when distance culling participates, the clip/cull distance stores.
    let pos_clone = output_subset(&shader.function, |op| match op {
        Op::StoreOutput { slot, .. } => {
            *slot == Slot::POS
                || (clip_mask != 0 && (*slot == Slot::CLIP_DIST0 || *slot == Slot::CLIP_DIST1))
        }
        _ => false,
    });
    if pos_clone
        .instrs()
        .iter()
        .any(|i| matches!(i.op, Op::Barrier(k) if k.workgroup_exec))
    {
        return Err(Error::Unsupported("barrier inside position computation"));
    }

    let zero = b.const_u32(0);
    let zero_f = b.const_f32(0.0);
    let one_f = b.const_f32(1.0);

    // Vertex phase: run the clone, stage the record. The position and
    // repackable arguments stay live in registers for the scatter phase.
    b.if_(pro.is_vtx);
    let (position, rel_patch, repack_args) = {
        let mut pos_table = OutputTable::new();
        append_aggregating(b, &pos_clone, &HashMap::new(), &mut pos_table)?;
        let position = [
            pos_table
                .get(IoSpace::S32, Slot::POS, 0)
                .map(|v| v.value)
                .unwrap_or(zero_f),
            pos_table
                .get(IoSpace::S32, Slot::POS, 1)
                .map(|v| v.value)
                .unwrap_or(zero_f),
            pos_table
                .get(IoSpace::S32, Slot::POS, 2)
                .map(|v| v.value)
                .unwrap_or(zero_f),
            pos_table
                .get(IoSpace::S32, Slot::POS, 3)
                .map(|v| v.value)
                .unwrap_or(one_f),
        ];
        let neg_mask = emit_clip_neg_mask(b, options, &pos_table);
        let args = RepackableArgs::load(b, shader.info.stage);
        let rel_patch = (shader.info.stage == Stage::TessEval)
            .then(|| b.load_arg(ShaderArg::TessRelPatchId, ScalarType::U32));
        store_vertex_record(b, layout, pro.tid, position, neg_mask, rel_patch, &args);
        (position, rel_patch, args)
    };
    b.end_if();
    b.barrier(BarrierKind::WORKGROUP);

    // Primitive phase: cull, marking referenced vertices of survivors.
    let packed_in = b.load_arg(ShaderArg::PackedPrimitive, ScalarType::U32);
    let mut vtx_indices = Vec::new();
    for v in 0..options.prim_vertices {
        vtx_indices.push(b.ubfe_imm(packed_in, 10 * v, 9));
    }
    let mut prim_accept = b.const_bool(false);
    b.if_(pro.is_prim);
    {
        let mut positions = Vec::new();
        for &idx in &vtx_indices {
            positions.push(load_vertex_position(b, layout, idx));
        }
        // Null input primitives stay dead.
        let null_bit = b.ubfe_imm(packed_in, 31, 1);
        let mut initial = b.ieq(null_bit, zero);
        if clip_mask != 0 {
            // A distance plane rejecting all vertices rejects the
            // primitive.
            let mut all_neg = load_clip_neg_mask(b, layout, vtx_indices[0]);
            for &idx in &vtx_indices[1..] {
                let m = load_clip_neg_mask(b, layout, idx);
                all_neg = b.iand(all_neg, m);
            }
            let rejected = b.ine(all_neg, zero);
            let keep = b.bnot(rejected);
            initial = b.band(initial, keep);
        }
        let settings = CullSettings::from_args(b);
        let indices = vtx_indices.clone();
        let accepted = cull_primitive(
            b,
            &settings,
            &positions,
            initial,
            Some(&mut |b: &mut FunctionBuilder| {
                for &idx in &indices {
                    mark_vertex_accepted(b, layout, idx);
                }
            }),
        );
        prim_accept = accepted;
    }
    b.end_if();
    b.barrier(BarrierKind::WORKGROUP);

    // Repack both populations.
    let vtx_accepted = load_vertex_accepted(b, layout, pro.tid);
    let vtx_live = b.band(pro.is_vtx, vtx_accepted);
    let prim_live = b.band(pro.is_prim, prim_accept);
    let repack_cfg = |scratch| RepackConfig {
        gfx_level: options.gfx_level,
        wave_size: options.wave_size,
        num_waves: options.num_waves(),
        scratch,
    };
    let rep_v = repack_invocations(b, vtx_live, &repack_cfg(layout.repack_vtx));
    let rep_p = repack_invocations(b, prim_live, &repack_cfg(layout.repack_prim));

    // Compaction phase one: survivors scatter.
    b.if_(vtx_live);
    scatter_to_exporter(
        b,
        layout,
        pro.tid,
        rep_v.index,
        position,
        rel_patch,
        &repack_args,
    );
    b.end_if();
    b.barrier(BarrierKind::WORKGROUP);

    // Primitive rebuild with compacted indices, staged at the
    // primitive's own compacted slot.
    b.if_(prim_live);
    {
        let mut new_indices = Vec::new();
        for &idx in &vtx_indices {
            new_indices.push(load_exporter_index(b, layout, idx));
        }
        let packed_new = pack_primitive(b, &new_indices, None, None);
        let four = b.const_u32(4);
        let row = b.imul(rep_p.index, four);
        let base = b.const_u32(layout.prim_data.offset);
        let addr = b.iadd(base, row);
        b.lds_store(addr, packed_new, MemWidth::B32);
        if options.export_primitive_id {
            let provoking_old = emit_provoking_vertex(b, options, packed_in);
            let provoking_new = load_exporter_index(b, layout, provoking_old);
            let prim_id = b.load_arg(ShaderArg::PrimitiveId, ScalarType::U32);
            let row = b.imul(provoking_new, four);
            let base = b.const_u32(layout.prim_id.offset);
            let addr = b.iadd(base, row);
            b.lds_store(addr, prim_id, MemWidth::B32);
        }
    }
    b.end_if();
    b.barrier(BarrierKind::WORKGROUP);

    emit_query_accumulation(
        b,
        [Some(rep_p.total), None, None, None],
        [None; 4],
        options.has_gen_prim_query,
        options.has_pipeline_stats_query,
    );

    // Export-space allocation, with the zero-primitive hang workaround.
    let elected = b.ieq(pro.tid, zero);
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
            // One degenerate null primitive and one position so the
            // workgroup still owns valid export space.
            let sh = b.const_u32(31);
            let null = b.ishl(one, sh);
            export_primitive(b, null);
            b.export(
                navi_ir::ExportTarget::Pos(0),
                [Some(zero_f), Some(zero_f), Some(zero_f), Some(one_f)],
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

    // Compaction phase two: exporters adopt and the full body re-runs
    // with repacked inputs.
    let es_survived = b.ult(pro.tid, rep_v.total);
    b.if_(es_survived);
    {
        let adopted = gather_adopted(b, layout, pro.tid);
        let mut subst = HashMap::new();
        for &(arg, dword) in RepackableArgs::subst_entries(shader.info.stage) {
            subst.insert(arg, adopted.args[dword]);
        }
        if shader.info.stage == Stage::TessEval {
            subst.insert(ShaderArg::TessRelPatchId, adopted.rel_patch_id);
        }
        let mut table = OutputTable::new();
        append_aggregating(b, &shader.function, &subst, &mut table)?;
        if options.export_primitive_id {
            let four = b.const_u32(4);
            let row = b.imul(pro.tid, four);
            let base = b.const_u32(layout.prim_id.offset);
            let addr = b.iadd(base, row);
            let prim_id = b.lds_load(addr, MemWidth::B32);
            table.record(IoSpace::S32, Slot::PRIM_ID, 0, prim_id, ScalarType::U32);
        }
        emit_vertex_exports(b, options, &table, pro.tid);
    }
    b.end_if();

    let prim_survived = b.ult(pro.tid, rep_p.total);
    b.if_(prim_survived);
    {
        let four = b.const_u32(4);
        let row = b.imul(pro.tid, four);
        let base = b.const_u32(layout.prim_data.offset);
        let addr = b.iadd(base, row);
        let packed = b.lds_load(addr, MemWidth::B32);
        export_primitive(b, packed);
    }
    b.end_if();
    Ok(())
}

fn emit_clip_neg_mask(
    b: &mut FunctionBuilder,
    options: &NggOptions,
    table: &OutputTable,
) -> ValueId {
    let mut mask = b.const_u32(0);
    if options.clip_cull_mask == 0 {
        return mask;
    }
    let zero_f = b.const_f32(0.0);
    for plane in 0..8_u32 {
        if options.clip_cull_mask & (1 << plane) == 0 {
            continue;
        }
        let slot = if plane < 4 { Slot::CLIP_DIST0 } else { Slot::CLIP_DIST1 };
        let Some(dist) = table.get(IoSpace::S32, slot, (plane % 4) as u8) else {
            continue;
        };
        let neg = b.flt(dist.value, zero_f);
        let bit = b.b2u(neg);
        let sh = b.const_u32(plane);
        let shifted = b.ishl(bit, sh);
        mask = b.ior(mask, shifted);
    }
    mask
}
