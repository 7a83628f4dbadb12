// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Workgroup repack properties: the compacted indices of the live lanes
//! form exactly `0..total`, in original invocation order, for any
//! liveness vector, workgroup shape and hardware generation.

use navi_ir::interp::{run_workgroup, Device, LaunchParams};
use navi_ir::{BufferSlot, Function, FunctionBuilder, ScalarType, ShaderArg};
use navi_ngg::layout::LdsRange;
use navi_ngg::repack::{repack_invocations, RepackConfig};
use navi_ngg::{GfxLevel, WaveSize};

const DEAD: u32 = u32::MAX;

/// Each lane stores `(total, index-or-DEAD)` at `tid * 8`.
fn repack_program(config: &RepackConfig) -> Function {
    let mut b = FunctionBuilder::new();
    let lane = b.lane_id();
    let wave = b.wave_id();
    let lanes = b.const_u32(config.wave_size.lanes());
    let scaled = b.imul(wave, lanes);
    let tid = b.iadd(scaled, lane);
    let raw = b.load_arg(ShaderArg::User(0), ScalarType::U32);
    let zero = b.const_u32(0);
    let live = b.ine(raw, zero);
    let result = repack_invocations(&mut b, live, config);
    let dead = b.const_u32(DEAD);
    let index = b.select(live, result.index, dead);
    let eight = b.const_u32(8);
    let off = b.imul(tid, eight);
    b.buffer_store(BufferSlot::Xfb(0), off, result.total);
    let four = b.const_u32(4);
    let off = b.iadd(off, four);
    b.buffer_store(BufferSlot::Xfb(0), off, index);
    b.finish()
}

fn check(gfx_level: GfxLevel, wave_size: WaveSize, num_waves: u32, liveness: &[bool]) {
    let wg = wave_size.lanes() * num_waves;
    assert_eq!(liveness.len(), wg as usize);
    let config = RepackConfig {
        gfx_level,
        wave_size,
        num_waves,
        scratch: LdsRange { offset: 0, size: 8 },
    };
    let program = repack_program(&config);
    let mut params = LaunchParams::new(wave_size.lanes(), num_waves, 8);
    params.arg_per_lane(
        ShaderArg::User(0),
        liveness.iter().map(|&l| u32::from(l)).collect(),
    );
    let mut device = Device::new();
    device.bind_buffer(BufferSlot::Xfb(0), wg as usize * 8);
    run_workgroup(&program, &params, &mut device);

    let words: Vec<u32> = device
        .buffer(BufferSlot::Xfb(0))
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    let expected_total = liveness.iter().filter(|&&l| l).count() as u32;
    let mut expected_index = 0;
    for (i, &live) in liveness.iter().enumerate() {
        let total = words[i * 2];
        let index = words[i * 2 + 1];
        assert_eq!(total, expected_total, "total at lane {i}");
        if live {
            // Dense, stable, one per live lane.
            assert_eq!(index, expected_index, "index at lane {i}");
            expected_index += 1;
        } else {
            assert_eq!(index, DEAD, "dead lane {i} got an index");
        }
    }
    assert_eq!(expected_index, expected_total);
}

fn patterns(wg: u32) -> Vec<Vec<bool>> {
    let n = wg as usize;
    let mut rng = 0x1234_5678_u32;
    let mut random = || {
        // xorshift32
        rng ^= rng << 13;
        rng ^= rng >> 17;
        rng ^= rng << 5;
        rng
    };
    let mut out = vec![
        vec![true; n],
        vec![false; n],
        (0..n).map(|i| i % 2 == 0).collect(),
        (0..n).map(|i| i % 7 == 3).collect(),
        (0..n).map(|i| i < n / 3).collect(),
        (0..n).map(|i| i >= n - 1).collect(),
    ];
    for _ in 0..4 {
        out.push((0..n).map(|_| random() & 1 == 1).collect());
    }
    out
}

#[test]
fn single_wave_fast_path() {
    for wave_size in [WaveSize::W32, WaveSize::W64] {
        for liveness in patterns(wave_size.lanes()) {
            check(GfxLevel::Gfx10, wave_size, 1, &liveness);
        }
    }
}

#[test]
fn multi_wave_sad_prefix() {
    for num_waves in [2, 4, 8] {
        for liveness in patterns(32 * num_waves) {
            check(GfxLevel::Gfx10, WaveSize::W32, num_waves, &liveness);
        }
    }
}

#[test]
fn multi_wave_dot_prefix() {
    for num_waves in [2, 4, 8] {
        for liveness in patterns(32 * num_waves) {
            check(GfxLevel::Gfx103, WaveSize::W32, num_waves, &liveness);
        }
    }
}

#[test]
fn multi_wave_wave64() {
    for num_waves in [2, 4] {
        for liveness in patterns(64 * num_waves) {
            check(GfxLevel::Gfx10, WaveSize::W64, num_waves, &liveness);
            check(GfxLevel::Gfx11, WaveSize::W64, num_waves, &liveness);
        }
    }
}
