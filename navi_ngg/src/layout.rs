// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! LDS arena layout planning.
//!
//! All shared-memory region offsets are computed once, up front, into an
//! immutable layout descriptor per stage; every component addresses LDS
//! through that descriptor. Regions are only allocated for the features a
//! given compilation actually enables.

use navi_ir::{FunctionBuilder, MeshInfo, Slot, ValueId};
use static_assertions::const_assert_eq;

use crate::options::{MeshOptions, NggOptions};
use crate::Error;

/// Per-workgroup shared-memory budget in bytes.
pub const LDS_BUDGET: u32 = 32 * 1024;

/// One byte range of the LDS arena.
#[derive(Copy, Clone, Default, Debug)]
pub struct LdsRange {
    pub offset: u32,
    pub size: u32,
}

/// Sequential arena allocator for layout planning.
#[derive(Default)]
struct Arena {
    cursor: u32,
}

impl Arena {
    fn alloc(&mut self, size: u32, alignment: u32) -> LdsRange {
        let offset = align_up(self.cursor, alignment);
        self.cursor = offset + size;
        LdsRange { offset, size }
    }
}

pub(crate) const fn align_up(len: u32, alignment: u32) -> u32 {
    len + (len.wrapping_neg() & (alignment - 1))
}

// Vertex-record field offsets of the deferred-culling path. The record
// holds the clip-space position, the protocol flag bytes, and the
// repackable shader-argument slots a surviving invocation reloads after
// compaction.
pub(crate) const VTX_POS: u32 = 0;
pub(crate) const VTX_ACCEPTED: u32 = 16;
pub(crate) const VTX_EXPORTER: u32 = 17;
pub(crate) const VTX_CLIP_NEG_MASK: u32 = 18;
pub(crate) const VTX_REL_PATCH_ID: u32 = 19;
pub(crate) const VTX_ARG0: u32 = 20;
pub(crate) const VTX_ARG1: u32 = 24;
pub(crate) const VTX_ARG2: u32 = 28;
pub(crate) const VTX_RECORD_STRIDE: u32 = 32;
const_assert_eq!(VTX_RECORD_STRIDE % 4, 0);
const_assert_eq!(VTX_ARG2 + 4, VTX_RECORD_STRIDE);

/// Bytes of the cross-wave repack count array: one byte per wave, at most
/// 8 waves per workgroup, always two dwords so the prefix load is
/// branchless.
pub const REPACK_SCRATCH_SIZE: u32 = 8;

/// Streamout broadcast block: 4 per-buffer base offsets then 4 per-stream
/// clamped emit counts.
pub const SO_BROADCAST_SIZE: u32 = 32;

/// LDS plan of the vertex/tess-eval (no-GS) path.
#[derive(Clone, Default, Debug)]
pub struct NogsLayout {
    /// Per-invocation vertex records; present when culling is built.
    pub vertex_records: LdsRange,
    pub repack_vtx: LdsRange,
    pub repack_prim: LdsRange,
    /// Compacted packed-primitive staging, one dword per invocation.
    pub prim_data: LdsRange,
    /// Per-vertex primitive id transport, one dword per invocation.
    pub prim_id: LdsRange,
    /// Per-vertex edge flag, one byte per invocation.
    pub edge_flags: LdsRange,
    /// Per-vertex staged streamout components.
    pub xfb_stage: LdsRange,
    /// Dwords captured per vertex in `xfb_stage`.
    pub xfb_stride: u32,
    pub so_broadcast: LdsRange,
    pub total: u32,
}

impl NogsLayout {
    pub fn plan(options: &NggOptions) -> Result<Self, Error> {
        let wg = options.workgroup_size;
        let mut arena = Arena::default();
        let mut layout = Self::default();
        if options.can_cull {
            layout.vertex_records = arena.alloc(wg * VTX_RECORD_STRIDE, 4);
            layout.repack_vtx = arena.alloc(REPACK_SCRATCH_SIZE, 4);
            layout.repack_prim = arena.alloc(REPACK_SCRATCH_SIZE, 4);
            layout.prim_data = arena.alloc(wg * 4, 4);
        }
        if options.export_primitive_id {
            layout.prim_id = arena.alloc(wg * 4, 4);
        }
        if options.has_edge_flags {
            layout.edge_flags = arena.alloc(wg, 4);
        }
        if let Some(xfb) = &options.xfb {
            layout.xfb_stride = xfb.outputs.len() as u32;
            layout.xfb_stage = arena.alloc(wg * layout.xfb_stride * 4, 4);
            layout.so_broadcast = arena.alloc(SO_BROADCAST_SIZE, 4);
        }
        layout.total = align_up(arena.cursor, 4);
        if layout.total > LDS_BUDGET {
            return Err(Error::LdsBudgetExceeded {
                required: layout.total,
                budget: LDS_BUDGET,
            });
        }
        log::debug!("no-GS LDS plan: {} bytes", layout.total);
        Ok(layout)
    }
}

/// LDS plan of the geometry-shader path.
///
/// The output-vertex ring is addressed through a bank-conflict-avoiding
/// swizzle of the vertex index; see [`GsLayout::vertex_addr`].
#[derive(Clone, Debug)]
pub struct GsLayout {
    pub vertex_ring: LdsRange,
    /// Bytes per ring entry: the stream-0 output dwords followed by the
    /// primitive-flag, new-index and source-index bytes.
    pub vertex_stride: u32,
    /// Dword offset within an entry of each written (slot, component);
    /// `u8::MAX` when the pair is not stored.
    pub out_dword: [[u8; 4]; Slot::COUNT],
    pub num_out_dwords: u32,
    pub repack_vtx: LdsRange,
    pub repack_prim: LdsRange,
    pub prim_data: LdsRange,
    pub so_broadcast: LdsRange,
    pub swizzle_mask: u32,
    pub total: u32,
}

// Byte offsets within a ring entry, relative to the end of the output
// dwords.
pub(crate) const GS_VTX_FLAG: u32 = 0;
pub(crate) const GS_VTX_NEW_INDEX: u32 = 1;
pub(crate) const GS_VTX_SOURCE: u32 = 2;
const GS_VTX_TAIL: u32 = 4;

/// Primitive-flag bits of a ring entry.
pub(crate) const GS_FLAG_PRIM_COMPLETE: u32 = 1 << 0;
pub(crate) const GS_FLAG_PRIM_ODD: u32 = 1 << 1;

impl GsLayout {
    pub fn plan(options: &NggOptions, stream0_slots: u64, max_out_vertices: u32) -> Result<Self, Error> {
        let wg = options.workgroup_size;
        let mut out_dword = [[u8::MAX; 4]; Slot::COUNT];
        let mut num_out_dwords = 0_u32;
        for s in 0..Slot::COUNT as u8 {
            if stream0_slots & Slot(s).bit() != 0 {
                for c in 0..4 {
                    out_dword[s as usize][c] = num_out_dwords as u8;
                    num_out_dwords += 1;
                }
            }
        }
        let vertex_stride = align_up(num_out_dwords * 4 + GS_VTX_TAIL, 4);
        let mut arena = Arena::default();
        let vertex_ring = arena.alloc(wg * vertex_stride, 4);
        let repack_vtx = arena.alloc(REPACK_SCRATCH_SIZE, 4);
        let repack_prim = arena.alloc(REPACK_SCRATCH_SIZE, 4);
        let prim_data = arena.alloc(wg * 4, 4);
        let so_broadcast = arena.alloc(SO_BROADCAST_SIZE, 4);
        let total = align_up(arena.cursor, 4);
        if total > LDS_BUDGET {
            return Err(Error::LdsBudgetExceeded {
                required: total,
                budget: LDS_BUDGET,
            });
        }
        log::debug!("GS LDS plan: {total} bytes, {num_out_dwords} output dwords per vertex");
        Ok(Self {
            vertex_ring,
            vertex_stride,
            out_dword,
            num_out_dwords,
            repack_vtx,
            repack_prim,
            prim_data,
            so_broadcast,
            swizzle_mask: (max_out_vertices.next_power_of_two() - 1) & 31,
            total,
        })
    }

    /// Ring address of an output vertex, with the index swizzle applied.
    pub fn vertex_addr(&self, b: &mut FunctionBuilder, vtx_idx: ValueId) -> ValueId {
        let five = b.const_u32(5);
        let shifted = b.ushr(vtx_idx, five);
        let mask = b.const_u32(self.swizzle_mask);
        let masked = b.iand(shifted, mask);
        let swizzled = b.ixor(vtx_idx, masked);
        let stride = b.const_u32(self.vertex_stride);
        let scaled = b.imul(swizzled, stride);
        let base = b.const_u32(self.vertex_ring.offset);
        b.iadd(base, scaled)
    }

    /// Dword offset within a ring entry of a (slot, component), if stored.
    pub fn out_offset(&self, slot: Slot, comp: u8) -> Option<u32> {
        let d = self.out_dword[slot.index()][comp as usize];
        (d != u8::MAX).then(|| u32::from(d) * 4)
    }
}

/// Where a mesh-shader output slot lives.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MeshOutStorage {
    /// Shared memory; required for anything with cross-invocation
    /// visibility.
    Lds,
    /// Spilled to the device scratch ring when the LDS budget is
    /// exceeded.
    Scratch,
    /// Plain per-invocation values; only legal when no other invocation
    /// ever observes the slot.
    Variable,
}

/// Placement of one output slot.
#[derive(Copy, Clone, Debug)]
pub struct MeshSlotPlan {
    pub slot: Slot,
    pub per_primitive: bool,
    pub storage: MeshOutStorage,
    /// Byte offset of this slot within a per-item entry of its storage.
    pub offset: u32,
}

/// The mesh-shader output memory plan.
#[derive(Clone, Debug)]
pub struct MeshLayout {
    pub slots: Vec<MeshSlotPlan>,
    pub lds_vtx: LdsRange,
    pub lds_vtx_stride: u32,
    pub lds_prim: LdsRange,
    pub lds_prim_stride: u32,
    pub scratch_vtx_offset: u32,
    pub scratch_vtx_stride: u32,
    pub scratch_prim_offset: u32,
    pub scratch_prim_stride: u32,
    /// Bytes of scratch ring per workgroup.
    pub scratch_wg_stride: u32,
    /// Packed primitive connectivity, one dword per primitive.
    pub indices: LdsRange,
    /// Per-primitive culling flag, one byte per primitive.
    pub cull_flags: LdsRange,
    /// Broadcast dword of the final vertex/primitive counts.
    pub counts: LdsRange,
    /// Countdown of waves still executing the API shader body.
    pub active_waves: LdsRange,
    pub total: u32,
}

const SLOT_BYTES: u32 = 16;

impl MeshLayout {
    /// Plans storage for every declared output, iteratively spilling
    /// vertex varyings to the scratch ring until the plan fits the LDS
    /// budget.
    pub fn plan(
        options: &MeshOptions,
        info: &MeshInfo,
        outputs_written: u64,
        per_prim_written: u64,
    ) -> Result<Self, Error> {
        let lane_local = info.cross_invocation_outputs == 0
            && info.max_vertices <= options.workgroup_size
            && info.max_primitives <= options.workgroup_size
            && info.api_workgroup_size == options.workgroup_size;
        let mut slots = Vec::new();
        for s in 0..Slot::COUNT as u8 {
            let slot = Slot(s);
            if slot == Slot::PRIM_INDICES || slot == Slot::CULL_PRIMITIVE {
                // Connectivity and the cull flag have dedicated packed
                // regions.
                continue;
            }
            if outputs_written & slot.bit() != 0 {
                slots.push(MeshSlotPlan {
                    slot,
                    per_primitive: false,
                    storage: if lane_local {
                        MeshOutStorage::Variable
                    } else {
                        MeshOutStorage::Lds
                    },
                    offset: 0,
                });
            }
            if per_prim_written & slot.bit() != 0 {
                slots.push(MeshSlotPlan {
                    slot,
                    per_primitive: true,
                    storage: if lane_local {
                        MeshOutStorage::Variable
                    } else {
                        MeshOutStorage::Lds
                    },
                    offset: 0,
                });
            }
        }

        let fixed = |lds_vtx_slots: u32, lds_prim_slots: u32| {
            info.max_vertices * lds_vtx_slots * SLOT_BYTES
                + info.max_primitives * lds_prim_slots * SLOT_BYTES
                + info.max_primitives * 4 // indices
                + align_up(info.max_primitives, 4) // cull flags
                + 8 // counts + active waves
        };
        // Spill vertex varyings (highest slot first) until the plan fits.
        // Special slots stay resident: the export loops read them.
        loop {
            let lds_vtx_slots = slots
                .iter()
                .filter(|p| !p.per_primitive && p.storage == MeshOutStorage::Lds)
                .count() as u32;
            let lds_prim_slots = slots
                .iter()
                .filter(|p| p.per_primitive && p.storage == MeshOutStorage::Lds)
                .count() as u32;
            if fixed(lds_vtx_slots, lds_prim_slots) <= LDS_BUDGET {
                break;
            }
            let victim = slots
                .iter_mut()
                .rev()
                .find(|p| {
                    !p.per_primitive
                        && p.storage == MeshOutStorage::Lds
                        && p.slot.0 >= Slot::VAR0.0
                });
            match victim {
                Some(p) => {
                    log::warn!(
                        "mesh output {:?} spilled to the scratch ring to fit LDS",
                        p.slot
                    );
                    p.storage = MeshOutStorage::Scratch;
                }
                None => {
                    return Err(Error::LdsBudgetExceeded {
                        required: fixed(lds_vtx_slots, lds_prim_slots),
                        budget: LDS_BUDGET,
                    })
                }
            }
        }

        // Assign entry offsets per storage class.
        let mut lds_vtx_stride = 0;
        let mut lds_prim_stride = 0;
        let mut scratch_vtx_stride = 0;
        let mut scratch_prim_stride = 0;
        for p in &mut slots {
            let stride = match (p.storage, p.per_primitive) {
                (MeshOutStorage::Lds, false) => &mut lds_vtx_stride,
                (MeshOutStorage::Lds, true) => &mut lds_prim_stride,
                (MeshOutStorage::Scratch, false) => &mut scratch_vtx_stride,
                (MeshOutStorage::Scratch, true) => &mut scratch_prim_stride,
                (MeshOutStorage::Variable, _) => continue,
            };
            p.offset = *stride;
            *stride += SLOT_BYTES;
        }

        let mut arena = Arena::default();
        let lds_vtx = arena.alloc(info.max_vertices * lds_vtx_stride, 4);
        let lds_prim = arena.alloc(info.max_primitives * lds_prim_stride, 4);
        let indices = arena.alloc(info.max_primitives * 4, 4);
        let cull_flags = arena.alloc(info.max_primitives, 4);
        let counts = arena.alloc(4, 4);
        let active_waves = arena.alloc(4, 4);
        let total = align_up(arena.cursor, 4);

        let scratch_vtx_offset = 0;
        let scratch_prim_offset = info.max_vertices * scratch_vtx_stride;
        let scratch_wg_stride =
            scratch_prim_offset + info.max_primitives * scratch_prim_stride;

        log::debug!(
            "mesh output plan: {total} LDS bytes, {scratch_wg_stride} scratch bytes per workgroup"
        );
        Ok(Self {
            slots,
            lds_vtx,
            lds_vtx_stride,
            lds_prim,
            lds_prim_stride,
            scratch_vtx_offset,
            scratch_vtx_stride,
            scratch_prim_offset,
            scratch_prim_stride,
            scratch_wg_stride,
            indices,
            cull_flags,
            counts,
            active_waves,
            total,
        })
    }

    pub fn find(&self, slot: Slot, per_primitive: bool) -> Option<&MeshSlotPlan> {
        self.slots
            .iter()
            .find(|p| p.slot == slot && p.per_primitive == per_primitive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{GfxLevel, NggOptions, WaveSize, XfbBuffer, XfbInfo, XfbOutput};
    use navi_ir::{MeshInfo, Slot};

    #[test]
    fn nogs_plan_is_empty_without_features() {
        let options = NggOptions::new(GfxLevel::Gfx10, WaveSize::W32, 64);
        let layout = NogsLayout::plan(&options).unwrap();
        assert_eq!(layout.total, 0);
    }

    #[test]
    fn nogs_plan_regions_are_disjoint() {
        let mut options = NggOptions::new(GfxLevel::Gfx10, WaveSize::W32, 128);
        options.can_cull = true;
        options.export_primitive_id = true;
        options.has_edge_flags = true;
        options.xfb = Some(XfbInfo {
            buffers: [Some(XfbBuffer { stride: 16, stream: 0 }), None, None, None],
            outputs: vec![XfbOutput {
                buffer: 0,
                offset: 0,
                slot: Slot::var(0),
                comp: 0,
                stream: 0,
                is_16bit: false,
            }],
        });
        let layout = NogsLayout::plan(&options).unwrap();
        let regions = [
            layout.vertex_records,
            layout.repack_vtx,
            layout.repack_prim,
            layout.prim_data,
            layout.prim_id,
            layout.edge_flags,
            layout.xfb_stage,
            layout.so_broadcast,
        ];
        for (i, a) in regions.iter().enumerate() {
            for b in &regions[i + 1..] {
                assert!(
                    a.offset + a.size <= b.offset || b.offset + b.size <= a.offset,
                    "overlapping LDS regions"
                );
            }
        }
        assert!(layout.total <= LDS_BUDGET);
    }

    #[test]
    fn mesh_plan_spills_when_over_budget() {
        let options = crate::options::MeshOptions::new(GfxLevel::Gfx11, WaveSize::W32, 128);
        let info = MeshInfo {
            max_vertices: 256,
            max_primitives: 256,
            prim_vertices: 3,
            api_workgroup_size: 128,
            cross_invocation_outputs: u64::MAX,
        };
        // 40 vertex varyings at 16 KiB per slot cannot fit 32 KiB.
        let mut written = Slot::POS.bit();
        for v in 0..40 {
            written |= Slot::var(v).bit();
        }
        let layout = MeshLayout::plan(&options, &info, written, 0).unwrap();
        assert!(layout.total <= LDS_BUDGET);
        assert!(layout
            .slots
            .iter()
            .any(|p| p.storage == MeshOutStorage::Scratch));
        // Position can never spill; the export loop reads it.
        assert_eq!(
            layout.find(Slot::POS, false).unwrap().storage,
            MeshOutStorage::Lds
        );
    }
}
