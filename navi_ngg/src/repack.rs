// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Workgroup-wide invocation repacking.
//!
//! Given a per-invocation liveness bit, computes the workgroup's total
//! live count and a dense compacted index for every live invocation,
//! ordered consistently with (wave, lane) order. Within a wave this is a
//! ballot plus bit counts; across waves, each wave publishes its count as
//! one byte of a packed LDS array and every lane computes an exclusive
//! prefix sum over the packed bytes.

use navi_ir::{BarrierKind, FunctionBuilder, MemWidth, ValueId};

use crate::layout::LdsRange;
use crate::options::{GfxLevel, WaveSize};

/// Static configuration of one repack operation.
#[derive(Copy, Clone, Debug)]
pub struct RepackConfig {
    pub gfx_level: GfxLevel,
    pub wave_size: WaveSize,
    pub num_waves: u32,
    /// The two-dword per-wave count array; see
    /// [`REPACK_SCRATCH_SIZE`](crate::layout::REPACK_SCRATCH_SIZE).
    pub scratch: LdsRange,
}

/// The repack result: both values are uniform-or-per-lane SSA values.
/// `index` is well-defined only for live lanes.
#[derive(Copy, Clone, Debug)]
pub struct RepackResult {
    pub total: ValueId,
    pub index: ValueId,
}

/// Emits the repack protocol for `live`.
///
/// The single-wave fast path needs no LDS and no barrier. The multi-wave
/// path costs one workgroup barrier; callers own any barrier needed
/// before the scratch range can be reused.
pub fn repack_invocations(
    b: &mut FunctionBuilder,
    live: ValueId,
    config: &RepackConfig,
) -> RepackResult {
    let ballot = b.ballot(live);
    let local_count = b.bit_count64(ballot);
    let local_prefix = b.masked_bit_count(ballot);

    if config.num_waves == 1 {
        return RepackResult {
            total: local_count,
            index: local_prefix,
        };
    }

    debug_assert!(config.num_waves <= 8);
    debug_assert!(config.scratch.size >= 8);

    // Wave-count publish: one byte per wave.
    let lane = b.lane_id();
    let wave = b.wave_id();
    let zero = b.const_u32(0);
    let is_first_lane = b.ieq(lane, zero);
    b.if_(is_first_lane);
    {
        let base = b.const_u32(config.scratch.offset);
        let addr = b.iadd(base, wave);
        b.lds_store(addr, local_count, MemWidth::B8);
    }
    b.end_if();
    b.barrier(BarrierKind::WORKGROUP);

    // Every wave loads the whole packed array (two dwords; bytes past
    // `num_waves` are junk and masked off below) and lane N computes the
    // sum of the wave counts below N.
    let d0 = {
        let a = b.const_u32(config.scratch.offset);
        b.lds_load(a, MemWidth::B32)
    };
    let d1 = {
        let a = b.const_u32(config.scratch.offset + 4);
        b.lds_load(a, MemWidth::B32)
    };

    let four = b.const_u32(4);
    let i0 = b.umin(lane, four);
    let i1 = {
        let clamped = b.umax(lane, four);
        let rebased = b.isub(clamped, four);
        b.umin(rebased, four)
    };
    let byte_mask = |b: &mut FunctionBuilder, i: ValueId| {
        // (1 << 8i) - 1, with the i == 4 case selecting all bytes since
        // the shift would wrap.
        let eight = b.const_u32(8);
        let bits = b.imul(i, eight);
        let one = b.const_u32(1);
        let shifted = b.ishl(one, bits);
        let partial = b.isub(shifted, one);
        let all = b.const_u32(u32::MAX);
        let is_all = b.ieq(i, four);
        b.select(is_all, all, partial)
    };
    let mask0 = byte_mask(b, i0);
    let mask1 = byte_mask(b, i1);

    let sum = if config.gfx_level.has_packed_dot_prefix() {
        // dot4(packed, per-byte 0/1 weights) accumulated over both
        // dwords.
        let ones = b.const_u32(0x0101_0101);
        let w0 = b.iand(mask0, ones);
        let w1 = b.iand(mask1, ones);
        let acc = b.dot_u8(d0, w0, zero);
        b.dot_u8(d1, w1, acc)
    } else {
        // Sum-of-absolute-differences against zero sums the masked
        // bytes; same exclusive prefix, different instruction.
        let m0 = b.iand(d0, mask0);
        let m1 = b.iand(d1, mask1);
        let acc = b.sad_u8(m0, zero, zero);
        b.sad_u8(m1, zero, acc)
    };

    // Lane N holds the prefix for wave N; lane `num_waves` holds the
    // workgroup total.
    let wave_base = b.read_lane(sum, wave);
    let num_waves = b.const_u32(config.num_waves);
    let total = b.read_lane(sum, num_waves);
    let index = b.iadd(wave_base, local_prefix);
    RepackResult { total, index }
}
