// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Streamout (transform feedback) coordination.
//!
//! One elected invocation per workgroup claims space in every bound
//! transform-feedback buffer with a device-ordered atomic add, clamps the
//! workgroup's emit counts to the remaining capacity (compensating the
//! global counter on overflow so it never overcounts), and broadcasts the
//! per-buffer base offsets and per-stream emit counts through LDS. Every
//! thread then writes its primitive's vertices itself.

use navi_ir::{
    BarrierKind, BufferSlot, CounterSlot, FunctionBuilder, MemWidth, ScalarType, ShaderArg,
    ValueId,
};

use crate::layout::LdsRange;
use crate::options::XfbInfo;

/// Per-buffer base offsets and per-stream clamped primitive emit counts,
/// as loaded back by every invocation after the broadcast barrier.
#[derive(Clone, Debug)]
pub struct StreamoutState {
    pub base: [Option<ValueId>; 4],
    pub emit: [Option<ValueId>; 4],
}

/// Emits the once-per-workgroup allocation protocol.
///
/// `gen_prims[s]` is stream `s`'s unclamped generated-primitive count
/// (uniform); `prim_vertices` the vertices captured per primitive.
/// Streams with no value generate nothing. The workgroup barrier that
/// publishes the broadcast block is included.
pub fn emit_allocation(
    b: &mut FunctionBuilder,
    xfb: &XfbInfo,
    broadcast: LdsRange,
    gen_prims: [Option<ValueId>; 4],
    prim_vertices: u32,
) -> StreamoutState {
    let lane = b.lane_id();
    let wave = b.wave_id();
    let zero = b.const_u32(0);
    let lane0 = b.ieq(lane, zero);
    let wave0 = b.ieq(wave, zero);
    let elected = b.band(lane0, wave0);
    b.if_(elected);
    {
        let token = b.load_arg(ShaderArg::OrderedId, ScalarType::U32);
        // Per-buffer allocation, overflow clamp and compensation.
        let mut clamped: [Option<ValueId>; 4] = [None; 4];
        for buf in 0..4 {
            let Some(desc) = xfb.buffers[buf] else {
                continue;
            };
            let Some(gen) = gen_prims[desc.stream as usize] else {
                continue;
            };
            let stride = xfb.prim_stride(buf, prim_vertices);
            let stride_c = b.const_u32(stride);
            let size = b.load_arg(ShaderArg::XfbBufferSize(buf as u8), ScalarType::U32);
            // An application may compile in streamout but bind no buffer;
            // a zero-size buffer must not move the global counter.
            let bound = b.ugt(size, zero);
            let raw_increment = b.imul(gen, stride_c);
            let increment = b.select(bound, raw_increment, zero);
            let base = b.ordered_atomic_add(CounterSlot::XfbOffset(buf as u8), token, increment);

            // Primitives that still fit: floor((size - base) / stride),
            // zero when the buffer is already past capacity.
            let space = b.isub(size, base);
            let fit_raw = b.udiv(space, stride_c);
            let in_range = b.uge(size, base);
            let fit = b.select(in_range, fit_raw, zero);
            let emit = b.umin(gen, fit);
            let emit = b.select(bound, emit, zero);

            // Give back what will not be written so the counter reflects
            // only actual writes.
            let written = b.imul(emit, stride_c);
            let excess = b.isub(increment, written);
            let has_excess = b.ugt(excess, zero);
            b.if_(has_excess);
            {
                let neg = b.isub(zero, excess);
                let _ = b.atomic_add(CounterSlot::XfbOffset(buf as u8), neg);
            }
            b.end_if();

            clamped[buf] = Some(emit);
            let addr = b.const_u32(broadcast.offset + buf as u32 * 4);
            b.lds_store(addr, base, MemWidth::B32);
        }
        // Per-stream emit count: the minimum over the stream's buffers.
        for stream in 0..4_u8 {
            let Some(gen) = gen_prims[stream as usize] else {
                continue;
            };
            let mut emit = gen;
            for buf in 0..4 {
                if xfb.buffers[buf].map(|d| d.stream) == Some(stream) {
                    if let Some(c) = clamped[buf] {
                        emit = b.umin(emit, c);
                    }
                }
            }
            let addr = b.const_u32(broadcast.offset + 16 + u32::from(stream) * 4);
            b.lds_store(addr, emit, MemWidth::B32);
        }
    }
    b.end_if();
    b.barrier(BarrierKind::WORKGROUP);

    let mut state = StreamoutState {
        base: [None; 4],
        emit: [None; 4],
    };
    for buf in 0..4 {
        if xfb.buffers[buf].is_some() {
            let addr = b.const_u32(broadcast.offset + buf as u32 * 4);
            state.base[buf] = Some(b.lds_load(addr, MemWidth::B32));
        }
    }
    for stream in 0..4 {
        if gen_prims[stream].is_some() {
            let addr = b.const_u32(broadcast.offset + 16 + stream as u32 * 4);
            state.emit[stream] = Some(b.lds_load(addr, MemWidth::B32));
        }
    }
    state
}

/// Emits this thread's buffer writes for one primitive.
///
/// `prim_seq` is the thread's primitive sequence number within `stream`;
/// threads with `prim_seq >= emit[stream]` write nothing. `fetch`
/// produces the captured component for vertex `v` of the primitive given
/// the output's index in `xfb.outputs`, already widened to 32 bits
/// (16-bit varyings are not allowed to land in a transform-feedback
/// buffer unwidened).
pub fn emit_prim_writes(
    b: &mut FunctionBuilder,
    xfb: &XfbInfo,
    state: &StreamoutState,
    stream: u8,
    prim_seq: ValueId,
    prim_vertices: u32,
    fetch: &mut dyn FnMut(&mut FunctionBuilder, u32, usize, &crate::options::XfbOutput) -> ValueId,
) {
    let Some(emit) = state.emit[stream as usize] else {
        return;
    };
    let in_budget = b.ult(prim_seq, emit);
    b.if_(in_budget);
    for v in 0..prim_vertices {
        for (k, out) in xfb
            .outputs
            .iter()
            .enumerate()
            .filter(|(_, o)| o.stream == stream)
        {
            let Some(desc) = xfb.buffers[out.buffer as usize] else {
                continue;
            };
            let Some(base) = state.base[out.buffer as usize] else {
                continue;
            };
            let value = fetch(b, v, k, out);
            // base + (prim_seq * verts + v) * stride + component offset
            let verts = b.const_u32(prim_vertices);
            let scaled_prim = b.imul(prim_seq, verts);
            let vc = b.const_u32(v);
            let vertex_slot = b.iadd(scaled_prim, vc);
            let stride = b.const_u32(desc.stride);
            let byte = b.imul(vertex_slot, stride);
            let off = b.const_u32(out.offset);
            let byte = b.iadd(byte, off);
            let addr = b.iadd(base, byte);
            b.buffer_store(BufferSlot::Xfb(out.buffer), addr, value);
        }
    }
    b.end_if();
}

/// Accumulates the primitive-query counters; called by the elected
/// invocation alongside (or instead of) buffer allocation.
pub fn emit_query_accumulation(
    b: &mut FunctionBuilder,
    gen_prims: [Option<ValueId>; 4],
    written_prims: [Option<ValueId>; 4],
    has_gen_query: bool,
    has_stats_query: bool,
) {
    if !has_gen_query && !has_stats_query {
        return;
    }
    let lane = b.lane_id();
    let wave = b.wave_id();
    let zero = b.const_u32(0);
    let lane0 = b.ieq(lane, zero);
    let wave0 = b.ieq(wave, zero);
    let elected = b.band(lane0, wave0);
    b.if_(elected);
    for stream in 0..4_u8 {
        if has_gen_query {
            if let Some(gen) = gen_prims[stream as usize] {
                let _ = b.atomic_add(CounterSlot::GeneratedPrims(stream), gen);
            }
        }
        if has_stats_query {
            if let Some(written) = written_prims[stream as usize] {
                let _ = b.atomic_add(CounterSlot::WrittenPrims(stream), written);
            }
        }
    }
    b.end_if();
}
