// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Two-phase vertex compaction over the LDS vertex records of the
//! deferred-culling path.
//!
//! Compaction is not a permutation: several dead invocations collapse at
//! once, so data moves store-then-gather through LDS. A surviving vertex
//! writes its record to the slot of its *compacted* index and its
//! compacted index byte into its *own* (pre-compaction) slot; after a
//! barrier, exporter thread `e` reads slot `e` as its adopted record, and
//! primitive threads translate each referenced vertex through that
//! slot's index byte.

use navi_ir::{FunctionBuilder, MemWidth, ScalarType, ShaderArg, Stage, ValueId};

use crate::layout::{
    NogsLayout, VTX_ACCEPTED, VTX_ARG0, VTX_ARG1, VTX_ARG2, VTX_CLIP_NEG_MASK, VTX_EXPORTER,
    VTX_POS, VTX_RECORD_STRIDE, VTX_REL_PATCH_ID,
};

/// The repackable shader inputs a surviving invocation must reload after
/// adopting another invocation's vertex.
#[derive(Clone, Debug)]
pub struct RepackableArgs {
    pub values: [ValueId; 3],
}

impl RepackableArgs {
    /// Loads the stage's repackable arguments from the ABI.
    pub fn load(b: &mut FunctionBuilder, stage: Stage) -> Self {
        let values = match stage {
            Stage::Vertex => {
                let a = b.load_arg(ShaderArg::VertexId, ScalarType::U32);
                let c = b.load_arg(ShaderArg::InstanceId, ScalarType::U32);
                let zero = b.const_u32(0);
                [a, c, zero]
            }
            Stage::TessEval => {
                let u = b.load_arg(ShaderArg::TessCoordU, ScalarType::F32);
                let v = b.load_arg(ShaderArg::TessCoordV, ScalarType::F32);
                let p = b.load_arg(ShaderArg::TessPatchId, ScalarType::U32);
                [u, v, p]
            }
            _ => panic!("repackable args exist only for vertex/tess-eval"),
        };
        Self { values }
    }

    /// Which argument load each reloaded record dword substitutes.
    pub fn subst_entries(stage: Stage) -> &'static [(ShaderArg, usize)] {
        match stage {
            Stage::Vertex => &[(ShaderArg::VertexId, 0), (ShaderArg::InstanceId, 1)],
            Stage::TessEval => &[
                (ShaderArg::TessCoordU, 0),
                (ShaderArg::TessCoordV, 1),
                (ShaderArg::TessPatchId, 2),
            ],
            _ => unreachable!(),
        }
    }
}

/// Byte address of invocation `index`'s vertex record.
pub fn record_addr(b: &mut FunctionBuilder, layout: &NogsLayout, index: ValueId) -> ValueId {
    let stride = b.const_u32(VTX_RECORD_STRIDE);
    let scaled = b.imul(index, stride);
    let base = b.const_u32(layout.vertex_records.offset);
    b.iadd(base, scaled)
}

fn field(b: &mut FunctionBuilder, record: ValueId, offset: u32) -> ValueId {
    let off = b.const_u32(offset);
    b.iadd(record, off)
}

/// Pre-culling: stage this invocation's clip-space position, clip-distance
/// negativity mask and repackable arguments into its own record, and clear
/// the accepted flag.
pub fn store_vertex_record(
    b: &mut FunctionBuilder,
    layout: &NogsLayout,
    index: ValueId,
    position: [ValueId; 4],
    clip_neg_mask: ValueId,
    rel_patch_id: Option<ValueId>,
    args: &RepackableArgs,
) {
    let record = record_addr(b, layout, index);
    for (c, v) in position.iter().enumerate() {
        let addr = field(b, record, VTX_POS + c as u32 * 4);
        b.lds_store(addr, *v, MemWidth::B32);
    }
    let zero = b.const_u32(0);
    let accepted = field(b, record, VTX_ACCEPTED);
    b.lds_store(accepted, zero, MemWidth::B8);
    let neg_mask = field(b, record, VTX_CLIP_NEG_MASK);
    b.lds_store(neg_mask, clip_neg_mask, MemWidth::B8);
    if let Some(rel) = rel_patch_id {
        let addr = field(b, record, VTX_REL_PATCH_ID);
        b.lds_store(addr, rel, MemWidth::B8);
    }
    for (i, offset) in [VTX_ARG0, VTX_ARG1, VTX_ARG2].into_iter().enumerate() {
        let addr = field(b, record, offset);
        b.lds_store(addr, args.values[i], MemWidth::B32);
    }
}

/// Loads the staged clip-space position of vertex `index`.
pub fn load_vertex_position(
    b: &mut FunctionBuilder,
    layout: &NogsLayout,
    index: ValueId,
) -> [ValueId; 4] {
    let record = record_addr(b, layout, index);
    let mut pos = [record; 4];
    for (c, p) in pos.iter_mut().enumerate() {
        let addr = field(b, record, VTX_POS + c as u32 * 4);
        *p = b.lds_load(addr, MemWidth::B32);
    }
    pos
}

/// Phase one of compaction, run by surviving vertex invocations: store
/// the vertex data (still live in registers from the position phase)
/// into the exporter's slot and publish the compacted index in the
/// original slot.
///
/// The data must come from registers rather than a reload of the own
/// record: another survivor may be overwriting that record as its own
/// exporter slot concurrently.
pub fn scatter_to_exporter(
    b: &mut FunctionBuilder,
    layout: &NogsLayout,
    own_index: ValueId,
    compacted_index: ValueId,
    position: [ValueId; 4],
    rel_patch_id: Option<ValueId>,
    args: &RepackableArgs,
) {
    let own = record_addr(b, layout, own_index);
    let target = record_addr(b, layout, compacted_index);
    for (c, v) in position.iter().enumerate() {
        let dst = field(b, target, VTX_POS + c as u32 * 4);
        b.lds_store(dst, *v, MemWidth::B32);
    }
    for (i, offset) in [VTX_ARG0, VTX_ARG1, VTX_ARG2].into_iter().enumerate() {
        let dst = field(b, target, offset);
        b.lds_store(dst, args.values[i], MemWidth::B32);
    }
    if let Some(rel) = rel_patch_id {
        let dst = field(b, target, VTX_REL_PATCH_ID);
        b.lds_store(dst, rel, MemWidth::B8);
    }

    let exporter = field(b, own, VTX_EXPORTER);
    b.lds_store(exporter, compacted_index, MemWidth::B8);
}

/// Phase two, run by exporter invocations (`tid < total_live`): adopt the
/// record now sitting in the invocation's own slot.
pub struct AdoptedVertex {
    pub position: [ValueId; 4],
    pub args: [ValueId; 3],
    pub rel_patch_id: ValueId,
}

pub fn gather_adopted(
    b: &mut FunctionBuilder,
    layout: &NogsLayout,
    own_index: ValueId,
) -> AdoptedVertex {
    let record = record_addr(b, layout, own_index);
    let mut position = [record; 4];
    for (c, p) in position.iter_mut().enumerate() {
        let addr = field(b, record, VTX_POS + c as u32 * 4);
        *p = b.lds_load(addr, MemWidth::B32);
    }
    let mut args = [record; 3];
    for (i, offset) in [VTX_ARG0, VTX_ARG1, VTX_ARG2].into_iter().enumerate() {
        let addr = field(b, record, offset);
        args[i] = b.lds_load(addr, MemWidth::B32);
    }
    let rel_addr = field(b, record, VTX_REL_PATCH_ID);
    let rel_patch_id = b.lds_load(rel_addr, MemWidth::B8);
    AdoptedVertex {
        position,
        args,
        rel_patch_id,
    }
}

/// Reads the compacted index of (pre-compaction) vertex `index`, written
/// there by [`scatter_to_exporter`].
pub fn load_exporter_index(
    b: &mut FunctionBuilder,
    layout: &NogsLayout,
    index: ValueId,
) -> ValueId {
    let record = record_addr(b, layout, index);
    let addr = field(b, record, VTX_EXPORTER);
    b.lds_load(addr, MemWidth::B8)
}

/// Marks vertex `index` as referenced by an accepted primitive.
pub fn mark_vertex_accepted(b: &mut FunctionBuilder, layout: &NogsLayout, index: ValueId) {
    let record = record_addr(b, layout, index);
    let addr = field(b, record, VTX_ACCEPTED);
    let one = b.const_u32(1);
    b.lds_store(addr, one, MemWidth::B8);
}

/// Reads back this vertex's accepted flag.
pub fn load_vertex_accepted(
    b: &mut FunctionBuilder,
    layout: &NogsLayout,
    index: ValueId,
) -> ValueId {
    let record = record_addr(b, layout, index);
    let addr = field(b, record, VTX_ACCEPTED);
    let flag = b.lds_load(addr, MemWidth::B8);
    let zero = b.const_u32(0);
    b.ine(flag, zero)
}

/// Reads the staged clip-distance negativity mask of vertex `index`.
pub fn load_clip_neg_mask(
    b: &mut FunctionBuilder,
    layout: &NogsLayout,
    index: ValueId,
) -> ValueId {
    let record = record_addr(b, layout, index);
    let addr = field(b, record, VTX_CLIP_NEG_MASK);
    b.lds_load(addr, MemWidth::B8)
}
