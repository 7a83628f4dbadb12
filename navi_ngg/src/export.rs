// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Export building: position, parameter and primitive exports, plus the
//! attribute-ring parameter stores that replace parameter exports on
//! GFX11.

use navi_ir::{
    BarrierKind, BufferSlot, ExportTarget, FunctionBuilder, IoSpace, ScalarType, ShaderArg, Slot,
    ValueId,
};

use crate::options::{GfxLevel, ParamMap, ParamMap16};
use crate::outputs::OutputTable;

/// Bit position of one field within the packed misc position export.
#[derive(Copy, Clone, Debug)]
pub struct ChanBits {
    pub chan: u8,
    pub shift: u8,
}

/// Per-generation layout of the second position export, the 4-channel
/// vector packing point size, edge flag, viewport index, layer index and
/// VRS rate.
///
/// These mirror the hardware SPI layouts and must be reproduced
/// bit-for-bit; they are a lookup table rather than derived so the
/// generation differences stay visible in one place.
#[derive(Copy, Clone, Debug)]
pub struct MiscVecLayout {
    /// Raw float, not a bitfield.
    pub point_size: Option<ChanBits>,
    pub edge_flag: Option<ChanBits>,
    pub layer: Option<ChanBits>,
    pub viewport: Option<ChanBits>,
    pub vrs_rate: Option<ChanBits>,
}

pub const fn misc_vec_layout(gfx_level: GfxLevel) -> MiscVecLayout {
    const PSIZE: Option<ChanBits> = Some(ChanBits { chan: 0, shift: 0 });
    const EDGE: Option<ChanBits> = Some(ChanBits { chan: 1, shift: 0 });
    const LAYER: Option<ChanBits> = Some(ChanBits { chan: 2, shift: 0 });
    const VIEWPORT: Option<ChanBits> = Some(ChanBits { chan: 2, shift: 16 });
    const VRS: Option<ChanBits> = Some(ChanBits { chan: 3, shift: 2 });
    match gfx_level {
        GfxLevel::Gfx9 | GfxLevel::Gfx10 => MiscVecLayout {
            point_size: PSIZE,
            edge_flag: EDGE,
            layer: LAYER,
            viewport: VIEWPORT,
            vrs_rate: None,
        },
        GfxLevel::Gfx103 => MiscVecLayout {
            point_size: PSIZE,
            edge_flag: EDGE,
            layer: LAYER,
            viewport: VIEWPORT,
            vrs_rate: VRS,
        },
        // Edge flags ride the primitive export on GFX11.
        GfxLevel::Gfx11 => MiscVecLayout {
            point_size: PSIZE,
            edge_flag: None,
            layer: LAYER,
            viewport: VIEWPORT,
            vrs_rate: VRS,
        },
    }
}

/// Forced coarse 2x2 VRS rate bits.
const FORCE_VRS_RATE_2X2: u32 = 0x5;

/// Configuration of one position-export sequence.
#[derive(Clone, Debug)]
pub struct ExportConfig {
    pub gfx_level: GfxLevel,
    pub clip_cull_mask: u8,
    pub force_vrs: bool,
    pub multiview: bool,
    /// No parameter exports follow this sequence; on generations where
    /// rasterization can race the shader's buffer writes this inserts a
    /// device release before the final export.
    pub no_param_export: bool,
}

/// Emits the position export sequence for the vertex described by
/// `table`.
///
/// Always exports POS0, defaulting unwritten channels to (0, 0, 0, 1):
/// applications omit components and hardware compatibility requires the
/// implicit default. When `done` is set, the last export emitted carries
/// the done flag; the hardware requires exactly one done export per
/// participating invocation.
pub fn export_position(
    b: &mut FunctionBuilder,
    config: &ExportConfig,
    table: &OutputTable,
    done: bool,
) {
    let layout = misc_vec_layout(config.gfx_level);

    let mut pos = [None; 4];
    for c in 0..4_u8 {
        pos[c as usize] = table.get(IoSpace::S32, Slot::POS, c).map(|v| v.value);
    }
    let zero = b.const_f32(0.0);
    let one = b.const_f32(1.0);
    let pos = [
        Some(pos[0].unwrap_or(zero)),
        Some(pos[1].unwrap_or(zero)),
        Some(pos[2].unwrap_or(zero)),
        Some(pos[3].unwrap_or(one)),
    ];

    // The misc vector: built channel-wise from the per-generation table.
    let point_size = table.get(IoSpace::S32, Slot::PSIZE, 0).map(|v| v.value);
    let edge_flag = table.get(IoSpace::S32, Slot::EDGE, 0).map(|v| v.value);
    let viewport = table.get(IoSpace::S32, Slot::VIEWPORT, 0).map(|v| v.value);
    let layer = if config.multiview {
        Some(b.load_arg(ShaderArg::ViewIndex, ScalarType::U32))
    } else {
        table.get(IoSpace::S32, Slot::LAYER, 0).map(|v| v.value)
    };
    let vrs_rate = if config.force_vrs && layout.vrs_rate.is_some() {
        Some(b.const_u32(FORCE_VRS_RATE_2X2))
    } else {
        None
    };

    let mut misc = [None; 4];
    let mut misc_mask = 0_u8;
    let mut pack = |b: &mut FunctionBuilder,
                    misc: &mut [Option<ValueId>; 4],
                    bits: ChanBits,
                    value: ValueId| {
        let shifted = if bits.shift != 0 {
            let sh = b.const_u32(u32::from(bits.shift));
            b.ishl(value, sh)
        } else {
            value
        };
        misc[bits.chan as usize] = Some(match misc[bits.chan as usize] {
            Some(prev) => b.ior(prev, shifted),
            None => shifted,
        });
        misc_mask |= 1 << bits.chan;
    };
    if let (Some(bits), Some(v)) = (layout.point_size, point_size) {
        // Point size is transported as a raw float.
        pack(b, &mut misc, bits, v);
    }
    if let (Some(bits), Some(v)) = (layout.edge_flag, edge_flag) {
        let one_u = b.const_u32(1);
        let clamped = b.umin(v, one_u);
        pack(b, &mut misc, bits, clamped);
    }
    if let (Some(bits), Some(v)) = (layout.layer, layer) {
        pack(b, &mut misc, bits, v);
    }
    if let (Some(bits), Some(v)) = (layout.viewport, viewport) {
        pack(b, &mut misc, bits, v);
    }
    if let (Some(bits), Some(v)) = (layout.vrs_rate, vrs_rate) {
        pack(b, &mut misc, bits, v);
    }

    // Clip/cull distance exports, 4 components at a time, only for
    // enabled planes.
    let mut dist_exports: Vec<([Option<ValueId>; 4], u8)> = Vec::new();
    for half in 0..2_u8 {
        let mask = (config.clip_cull_mask >> (half * 4)) & 0xF;
        if mask == 0 {
            continue;
        }
        let slot = if half == 0 {
            Slot::CLIP_DIST0
        } else {
            Slot::CLIP_DIST1
        };
        let mut chans = [None; 4];
        for c in 0..4_u8 {
            if mask & (1 << c) != 0 {
                chans[c as usize] =
                    Some(table.get(IoSpace::S32, slot, c).map(|v| v.value).unwrap_or(zero));
            }
        }
        dist_exports.push((chans, mask));
    }

    // Order: POS0, misc, distances; the done flag lands on whichever is
    // last.
    let mut sequence: Vec<(ExportTarget, [Option<ValueId>; 4], u8)> =
        vec![(ExportTarget::Pos(0), pos, 0xF)];
    let mut next_pos = 1_u8;
    if misc_mask != 0 {
        sequence.push((ExportTarget::Pos(next_pos), misc, misc_mask));
        next_pos += 1;
    }
    for (chans, mask) in dist_exports {
        sequence.push((ExportTarget::Pos(next_pos), chans, mask));
        next_pos += 1;
    }

    let last = sequence.len() - 1;
    for (i, (target, values, mask)) in sequence.into_iter().enumerate() {
        let is_last = i == last;
        if is_last && done && config.no_param_export && config.gfx_level.needs_pre_raster_release()
        {
            b.barrier(BarrierKind::RELEASE_DEVICE);
        }
        b.export(target, values, mask, is_last && done);
    }
}

/// Emits one parameter export per parameter index mapped by `param_map`,
/// deduplicating aliased indices (first slot wins, a documented legacy
/// behavior) and skipping slots with an all-zero write mask. Unwritten
/// components default to zero.
///
/// 16-bit slot pairs mapped by `param_map_16` export with the low half
/// in bits \[15:0\] and the high half in \[31:16\] of each channel.
pub fn export_parameters(
    b: &mut FunctionBuilder,
    param_map: &ParamMap,
    param_map_16: &ParamMap16,
    table: &OutputTable,
) {
    let zero = b.const_f32(0.0);
    let mut seen = [false; 32];
    for (slot, index) in param_map.iter() {
        if seen[index as usize] {
            continue;
        }
        if table.write_mask(IoSpace::S32, slot) == 0 {
            continue;
        }
        seen[index as usize] = true;
        let mut chans = [None; 4];
        for c in 0..4_u8 {
            chans[c as usize] = Some(
                table
                    .get(IoSpace::S32, slot, c)
                    .map(|v| v.value)
                    .unwrap_or(zero),
            );
        }
        b.export(ExportTarget::Param(index), chans, 0xF, false);
    }
    let zero_u = b.const_u32(0);
    for (pair, index) in param_map_16.iter() {
        if seen[index as usize] {
            continue;
        }
        let slot = Slot(pair);
        let mask = table.write_mask(IoSpace::Lo16, slot) | table.write_mask(IoSpace::Hi16, slot);
        if mask == 0 {
            continue;
        }
        seen[index as usize] = true;
        let mut chans = [None; 4];
        for c in 0..4_u8 {
            let lo = table
                .get(IoSpace::Lo16, slot, c)
                .map(|v| v.value)
                .unwrap_or(zero_u);
            let hi = table
                .get(IoSpace::Hi16, slot, c)
                .map(|v| v.value)
                .unwrap_or(zero_u);
            let sixteen = b.const_u32(16);
            let hi_shifted = b.ishl(hi, sixteen);
            chans[c as usize] = Some(b.ior(lo, hi_shifted));
        }
        b.export(ExportTarget::Param(index), chans, 0xF, false);
    }
}

/// Byte stride of one parameter row of the attribute ring.
pub const ATTR_RING_ROW_STRIDE: u32 = 16 * 1024;

/// GFX11: parameter outputs are buffer stores to the attribute ring
/// instead of exports. `vertex_index` is the compacted (export) vertex
/// index of this invocation.
pub fn store_parameters_attr_ring(
    b: &mut FunctionBuilder,
    param_map: &ParamMap,
    table: &OutputTable,
    vertex_index: ValueId,
) {
    let base = b.load_arg(ShaderArg::AttrRingBase, ScalarType::U32);
    let mut seen = [false; 32];
    for (slot, index) in param_map.iter() {
        if seen[index as usize] || table.write_mask(IoSpace::S32, slot) == 0 {
            continue;
        }
        seen[index as usize] = true;
        for c in 0..4_u8 {
            let Some(v) = table.get(IoSpace::S32, slot, c) else {
                continue;
            };
            let row = b.const_u32(u32::from(index) * ATTR_RING_ROW_STRIDE + u32::from(c) * 4);
            let sixteen = b.const_u32(16);
            let scaled = b.imul(vertex_index, sixteen);
            let off0 = b.iadd(base, row);
            let offset = b.iadd(off0, scaled);
            b.buffer_store(BufferSlot::AttrRing, offset, v.value);
        }
    }
}

/// Packs up to 3 vertex indices (9 bits each at bits 0, 10, 20) and the
/// per-vertex edge-flag bits (9, 19, 29) into the primitive export
/// payload. `null_flag`, when set, raises bit 31 marking a null
/// primitive.
pub fn pack_primitive(
    b: &mut FunctionBuilder,
    indices: &[ValueId],
    edge_flags: Option<&[ValueId]>,
    null_flag: Option<ValueId>,
) -> ValueId {
    let mut packed = b.const_u32(0);
    for (i, &idx) in indices.iter().enumerate() {
        let sh = b.const_u32(i as u32 * 10);
        let shifted = b.ishl(idx, sh);
        packed = b.ior(packed, shifted);
    }
    if let Some(edges) = edge_flags {
        for (i, &e) in edges.iter().enumerate() {
            let sh = b.const_u32(i as u32 * 10 + 9);
            let shifted = b.ishl(e, sh);
            packed = b.ior(packed, shifted);
        }
    }
    if let Some(null) = null_flag {
        let b2 = b.b2u(null);
        let sh = b.const_u32(31);
        let bit = b.ishl(b2, sh);
        packed = b.ior(packed, bit);
    }
    packed
}

/// The single primitive-connectivity export.
pub fn export_primitive(b: &mut FunctionBuilder, packed: ValueId) {
    b.export(ExportTarget::Prim, [Some(packed), None, None, None], 0x1, false);
}
