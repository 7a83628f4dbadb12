// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The mesh-shader orchestrator.
//!
//! Output storage is planned statically (LDS, scratch ring, or plain
//! registers; see [`MeshLayout`]) and the body's output loads and stores
//! are rewritten against that plan. When the hardware launches a larger
//! workgroup than the API declared, the surplus waves idle through a
//! barrier loop so every body barrier still rendezvouses the full
//! workgroup. The finale broadcasts the declared counts, allocates
//! export space, and walks the export rows.

use navi_ir::passes::{append_function, Rewrite};
use navi_ir::{
    BarrierKind, BufferSlot, FunctionBuilder, IoSpace, MemWidth, MeshInfo, Op, ScalarType, Shader,
    ShaderArg, ShaderInfo, Slot, Stage, ValueId, VarId,
};

use crate::export::{
    export_parameters, export_position, export_primitive, store_parameters_attr_ring, ExportConfig,
};
use crate::layout::{MeshLayout, MeshOutStorage};
use crate::options::MeshOptions;
use crate::outputs::OutputTable;
use crate::{Error, MAX_WORKGROUP_SIZE};

/// Lowers a mesh shader to the NGG hardware protocol.
pub fn lower_mesh(shader: &Shader, options: &MeshOptions) -> Result<Shader, Error> {
    if shader.info.stage != Stage::Mesh {
        return Err(Error::WrongStage(shader.info.stage));
    }
    let Some(info) = shader.info.mesh else {
        return Err(Error::WrongStage(shader.info.stage));
    };
    if options.workgroup_size > MAX_WORKGROUP_SIZE {
        return Err(Error::WorkgroupTooLarge {
            size: options.workgroup_size,
            max: MAX_WORKGROUP_SIZE,
        });
    }

    // Output masks come from the body itself.
    let mut vtx_written = 0_u64;
    let mut prim_written = 0_u64;
    let mut has_counts = false;
    for instr in shader.function.instrs() {
        match &instr.op {
            Op::StoreOutput {
                slot,
                space,
                per_primitive,
                ..
            } => {
                if *space != IoSpace::S32 {
                    return Err(Error::Unsupported("16-bit mesh outputs"));
                }
                if *per_primitive {
                    prim_written |= slot.bit();
                } else {
                    vtx_written |= slot.bit();
                }
            }
            Op::SetVertexPrimCount { .. } => has_counts = true,
            Op::EmitVertex { .. } | Op::EndPrimitive { .. } => {
                return Err(Error::Unsupported("stream intrinsics in a mesh shader"))
            }
            _ => {}
        }
    }
    if !has_counts {
        return Err(Error::MissingVertexPrimCount(0));
    }
    if !options.gfx_level.has_attr_ring() {
        let allowed = Slot::PRIM_INDICES.bit() | Slot::CULL_PRIMITIVE.bit();
        if prim_written & !allowed != 0 {
            return Err(Error::Unsupported(
                "per-primitive varyings need the attribute ring",
            ));
        }
    }

    let layout = MeshLayout::plan(options, &info, vtx_written, prim_written)?;
    let mut b = FunctionBuilder::new();

    let lane = b.lane_id();
    let wave = b.wave_id();
    let wave_lanes = b.const_u32(options.wave_size.lanes());
    let scaled = b.imul(wave, wave_lanes);
    let tid = b.iadd(scaled, lane);
    let zero = b.const_u32(0);
    let wg_size = options.workgroup_size;

    // Registers for lane-local slots.
    let mut vars: Vec<(Slot, bool, [VarId; 4])> = Vec::new();
    for plan in &layout.slots {
        if plan.storage == MeshOutStorage::Variable {
            let v = [
                b.declare_var(ScalarType::U32),
                b.declare_var(ScalarType::U32),
                b.declare_var(ScalarType::U32),
                b.declare_var(ScalarType::U32),
            ];
            vars.push((plan.slot, plan.per_primitive, v));
        }
    }

    // Zero-init of the packed connectivity, cull flags and counts; the
    // read-modify-write index stores and the liveness checks rely on it.
    let reps = info.max_primitives.div_ceil(wg_size);
    for r in 0..reps {
        let base = b.const_u32(r * wg_size);
        let idx = b.iadd(tid, base);
        let max_prim = b.const_u32(info.max_primitives);
        let ok = b.ult(idx, max_prim);
        b.if_(ok);
        {
            let four = b.const_u32(4);
            let row = b.imul(idx, four);
            let ib = b.const_u32(layout.indices.offset);
            let addr = b.iadd(ib, row);
            b.lds_store(addr, zero, MemWidth::B32);
            let cb = b.const_u32(layout.cull_flags.offset);
            let addr = b.iadd(cb, idx);
            b.lds_store(addr, zero, MemWidth::B8);
        }
        b.end_if();
    }

    let has_barrier = shader
        .function
        .instrs()
        .iter()
        .any(|i| matches!(i.op, Op::Barrier(k) if k.workgroup_exec));
    let mismatch = info.api_workgroup_size < wg_size;
    let num_waves = options.num_waves();
    let num_api_waves = info.api_workgroup_size.div_ceil(options.wave_size.lanes());
    let needs_idle_loop = mismatch && has_barrier && num_waves > 1;

    if needs_idle_loop {
        let elected = b.ieq(tid, zero);
        b.if_(elected);
        {
            let addr = b.const_u32(layout.active_waves.offset);
            let n = b.const_u32(num_api_waves);
            b.lds_store(addr, n, MemWidth::B32);
        }
        b.end_if();
    }
    b.barrier(BarrierKind::WORKGROUP);

    let api_size = b.const_u32(info.api_workgroup_size);
    let api_active = b.ult(tid, api_size);

    if needs_idle_loop {
        // Active waves run the body, then announce completion; idle waves
        // absorb one barrier per body barrier until the countdown hits
        // zero. The trailing barrier of the active branch is the loop's
        // final rendezvous.
        let naw = b.const_u32(num_api_waves);
        let wave_active = b.ult(wave, naw);
        b.if_(wave_active);
        {
            b.if_(api_active);
            append_mesh_body(&mut b, shader, &layout, tid, &vars)?;
            b.end_if();
            let is_first_lane = b.ieq(lane, zero);
            b.if_(is_first_lane);
            {
                let addr = b.const_u32(layout.active_waves.offset);
                let minus_one = b.const_u32(u32::MAX);
                let _ = b.lds_atomic_add(addr, minus_one);
            }
            b.end_if();
            b.barrier(BarrierKind::WORKGROUP);
        }
        b.else_();
        {
            b.loop_();
            b.barrier(BarrierKind::WORKGROUP);
            let addr = b.const_u32(layout.active_waves.offset);
            let remaining = b.lds_load(addr, MemWidth::B32);
            let done = b.ieq(remaining, zero);
            b.break_if(done);
            b.end_loop();
        }
        b.end_if();
    } else {
        b.if_(api_active);
        append_mesh_body(&mut b, shader, &layout, tid, &vars)?;
        b.end_if();
        b.barrier(BarrierKind::WORKGROUP);
    }

    // Finale: counts, allocation, export rows.
    let counts_addr = b.const_u32(layout.counts.offset);
    let packed_counts = b.lds_load(counts_addr, MemWidth::B32);
    let vtx_count = b.ubfe_imm(packed_counts, 0, 16);
    let prim_count = b.ubfe_imm(packed_counts, 16, 16);
    let elected = b.ieq(tid, zero);
    b.if_(elected);
    b.alloc_export_space(vtx_count, prim_count);
    if options.has_pipeline_stats_query {
        let _ = b.atomic_add(navi_ir::CounterSlot::GeneratedPrims(0), prim_count);
    }
    b.end_if();

    let config = ExportConfig {
        gfx_level: options.gfx_level,
        clip_cull_mask: options.clip_cull_mask,
        force_vrs: options.force_vrs,
        multiview: options.multiview,
        no_param_export: options.param_map.is_empty() || options.gfx_level.has_attr_ring(),
    };

    // Vertex rows.
    let vtx_rows = info.max_vertices.div_ceil(wg_size);
    for r in 0..vtx_rows {
        let base = b.const_u32(r * wg_size);
        let idx = b.iadd(tid, base);
        let active = b.ult(idx, vtx_count);
        b.if_(active);
        {
            let mut table = OutputTable::new();
            for plan in layout.slots.iter().filter(|p| !p.per_primitive) {
                for c in 0..4_u8 {
                    let value =
                        load_planned(&mut b, &layout, plan.storage, plan.offset, idx, c, false);
                    let value = match value {
                        Some(v) => v,
                        None => var_get(&mut b, &vars, plan.slot, false, c),
                    };
                    table.record(IoSpace::S32, plan.slot, c, value, ScalarType::U32);
                }
            }
            if options.gfx_level.has_attr_ring() {
                // Ring stores go first; the done export's device release
                // publishes them.
                store_parameters_attr_ring(&mut b, &options.param_map, &table, idx);
                export_position(&mut b, &config, &table, r == vtx_rows - 1);
            } else {
                export_position(&mut b, &config, &table, r == vtx_rows - 1);
                let no_16bit = crate::options::ParamMap16::empty();
                export_parameters(&mut b, &options.param_map, &no_16bit, &table);
            }
        }
        b.end_if();
    }

    // Primitive rows.
    let prim_rows = info.max_primitives.div_ceil(wg_size);
    for r in 0..prim_rows {
        let base = b.const_u32(r * wg_size);
        let idx = b.iadd(tid, base);
        let active = b.ult(idx, prim_count);
        b.if_(active);
        {
            let four = b.const_u32(4);
            let row = b.imul(idx, four);
            let ib = b.const_u32(layout.indices.offset);
            let addr = b.iadd(ib, row);
            let mut packed = b.lds_load(addr, MemWidth::B32);
            // The per-primitive cull flag raises the null bit.
            let cb = b.const_u32(layout.cull_flags.offset);
            let addr = b.iadd(cb, idx);
            let cull = b.lds_load(addr, MemWidth::B8);
            let culled = b.ine(cull, zero);
            let one = b.const_u32(1);
            let sh = b.const_u32(31);
            let null_bit = b.ishl(one, sh);
            let with_null = b.ior(packed, null_bit);
            packed = b.select(culled, with_null, packed);
            export_primitive(&mut b, packed);
        }
        b.end_if();
    }

    let mut out_info = ShaderInfo::new(Stage::Mesh, wg_size);
    out_info.outputs_written = vtx_written;
    Ok(Shader {
        info: out_info,
        function: b.finish(),
    })
}

/// Required LDS bytes for the given options and mesh metadata.
pub fn mesh_lds_size(
    options: &MeshOptions,
    info: &MeshInfo,
    vtx_written: u64,
    prim_written: u64,
) -> Result<u32, Error> {
    Ok(MeshLayout::plan(options, info, vtx_written, prim_written)?.total)
}

fn var_get(
    b: &mut FunctionBuilder,
    vars: &[(Slot, bool, [VarId; 4])],
    slot: Slot,
    per_primitive: bool,
    comp: u8,
) -> ValueId {
    match vars
        .iter()
        .find(|(s, p, _)| *s == slot && *p == per_primitive)
    {
        Some((_, _, v)) => b.var_load(v[comp as usize]),
        None => b.const_u32(0),
    }
}

/// Address (LDS) or byte offset (scratch) of one planned component.
fn load_planned(
    b: &mut FunctionBuilder,
    layout: &MeshLayout,
    storage: MeshOutStorage,
    entry_offset: u32,
    index: ValueId,
    comp: u8,
    per_primitive: bool,
) -> Option<ValueId> {
    match storage {
        MeshOutStorage::Lds => {
            let (region, stride) = if per_primitive {
                (layout.lds_prim, layout.lds_prim_stride)
            } else {
                (layout.lds_vtx, layout.lds_vtx_stride)
            };
            let stride = b.const_u32(stride);
            let row = b.imul(index, stride);
            let base = b.const_u32(region.offset + entry_offset + u32::from(comp) * 4);
            let addr = b.iadd(base, row);
            Some(b.lds_load(addr, MemWidth::B32))
        }
        MeshOutStorage::Scratch => {
            let addr = scratch_addr(b, layout, entry_offset, index, comp, per_primitive);
            Some(b.buffer_load(BufferSlot::ScratchRing, addr))
        }
        MeshOutStorage::Variable => None,
    }
}

fn scratch_addr(
    b: &mut FunctionBuilder,
    layout: &MeshLayout,
    entry_offset: u32,
    index: ValueId,
    comp: u8,
    per_primitive: bool,
) -> ValueId {
    let wg_index = b.load_arg(ShaderArg::WorkgroupIndex, ScalarType::U32);
    let wg_stride = b.const_u32(layout.scratch_wg_stride);
    let wg_base = b.imul(wg_index, wg_stride);
    let (region_off, stride) = if per_primitive {
        (layout.scratch_prim_offset, layout.scratch_prim_stride)
    } else {
        (layout.scratch_vtx_offset, layout.scratch_vtx_stride)
    };
    let stride = b.const_u32(stride);
    let row = b.imul(index, stride);
    let fixed = b.const_u32(region_off + entry_offset + u32::from(comp) * 4);
    let a = b.iadd(wg_base, row);
    b.iadd(a, fixed)
}

/// Walks the mesh body, rewriting output access against the storage plan.
fn append_mesh_body(
    b: &mut FunctionBuilder,
    shader: &Shader,
    layout: &MeshLayout,
    tid: ValueId,
    vars: &[(Slot, bool, [VarId; 4])],
) -> Result<(), Error> {
    let mut bad: Option<Error> = None;
    append_function(b, &shader.function, |b, instr, map| match &instr.op {
        Op::StoreOutput {
            slot,
            per_primitive,
            index,
            comps,
            ..
        } => {
            let idx = match index {
                Some(v) => map.get(*v),
                None => tid,
            };
            if *slot == Slot::PRIM_INDICES {
                // Packed 9-bit fields, read-modify-write so components
                // may arrive in separate stores.
                let four = b.const_u32(4);
                let row = b.imul(idx, four);
                let ib = b.const_u32(layout.indices.offset);
                let addr = b.iadd(ib, row);
                let mut packed = b.lds_load(addr, MemWidth::B32);
                for (c, v) in comps.iter().enumerate().take(3) {
                    let Some(v) = v else { continue };
                    let v = map.get(*v);
                    let field_mask = b.const_u32(!(0x3FF << (10 * c as u32)));
                    let cleared = b.iand(packed, field_mask);
                    let sh = b.const_u32(10 * c as u32);
                    let shifted = b.ishl(v, sh);
                    packed = b.ior(cleared, shifted);
                }
                b.lds_store(addr, packed, MemWidth::B32);
                return Rewrite::Replaced(None);
            }
            if *slot == Slot::CULL_PRIMITIVE {
                if let Some(v) = comps[0] {
                    let v = map.get(v);
                    let cb = b.const_u32(layout.cull_flags.offset);
                    let addr = b.iadd(cb, idx);
                    b.lds_store(addr, v, MemWidth::B8);
                }
                return Rewrite::Replaced(None);
            }
            let Some(plan) = layout.find(*slot, *per_primitive) else {
                return Rewrite::Drop;
            };
            for (c, v) in comps.iter().enumerate() {
                let Some(v) = v else { continue };
                let v = map.get(*v);
                match plan.storage {
                    MeshOutStorage::Lds => {
                        let (region, stride) = if *per_primitive {
                            (layout.lds_prim, layout.lds_prim_stride)
                        } else {
                            (layout.lds_vtx, layout.lds_vtx_stride)
                        };
                        let stride = b.const_u32(stride);
                        let row = b.imul(idx, stride);
                        let base =
                            b.const_u32(region.offset + plan.offset + c as u32 * 4);
                        let addr = b.iadd(base, row);
                        b.lds_store(addr, v, MemWidth::B32);
                    }
                    MeshOutStorage::Scratch => {
                        let addr =
                            scratch_addr(b, layout, plan.offset, idx, c as u8, *per_primitive);
                        b.buffer_store(BufferSlot::ScratchRing, addr, v);
                    }
                    MeshOutStorage::Variable => {
                        if let Some((_, _, regs)) = vars
                            .iter()
                            .find(|(s, p, _)| s == slot && p == per_primitive)
                        {
                            b.var_store(regs[c], v);
                        }
                    }
                }
            }
            Rewrite::Replaced(None)
        }
        Op::LoadOutput {
            slot,
            per_primitive,
            index,
            comp,
            ..
        } => {
            let idx = match index {
                Some(v) => map.get(*v),
                None => tid,
            };
            let value = match layout.find(*slot, *per_primitive) {
                Some(plan) => load_planned(
                    b,
                    layout,
                    plan.storage,
                    plan.offset,
                    idx,
                    *comp,
                    *per_primitive,
                )
                .unwrap_or_else(|| var_get(b, vars, *slot, *per_primitive, *comp)),
                None => b.const_u32(0),
            };
            Rewrite::Replaced(Some(value))
        }
        Op::SetVertexPrimCount {
            vertices,
            primitives,
            ..
        } => {
            // Taken from the first invocation; broadcast through LDS for
            // the finale.
            let v = map.get(*vertices);
            let p = map.get(*primitives);
            let zero = b.const_u32(0);
            let first = b.ieq(tid, zero);
            b.if_(first);
            {
                let sixteen = b.const_u32(16);
                let hi = b.ishl(p, sixteen);
                let packed = b.ior(v, hi);
                let addr = b.const_u32(layout.counts.offset);
                b.lds_store(addr, packed, MemWidth::B32);
            }
            b.end_if();
            Rewrite::Replaced(None)
        }
        op if op.is_abstract() => {
            if bad.is_none() {
                bad = Some(Error::Unsupported("stream intrinsics in a mesh shader"));
            }
            Rewrite::Drop
        }
        _ => Rewrite::Keep,
    });
    match bad {
        Some(e) => Err(e),
        None => Ok(())
    }
}
