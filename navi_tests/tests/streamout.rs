// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Streamout: ordered offset allocation across workgroups, overflow
//! clamping with counter compensation, and the actual buffer writes.

use navi_ir::interp::Device;
use navi_ir::{BufferSlot, CounterSlot, ExportTarget, ShaderArg, Slot};
use navi_ngg::{lower_nogs, GfxLevel, NggOptions, WaveSize, XfbBuffer, XfbInfo, XfbOutput};
use navi_tests::{pack_input_prim, NogsLaunch};

const STRIDE: u32 = 4;
const PRIM_STRIDE: u32 = 3 * STRIDE;

fn xfb_options() -> NggOptions {
    let mut options = NggOptions::new(GfxLevel::Gfx10, WaveSize::W64, 64);
    options.xfb = Some(XfbInfo {
        buffers: [
            Some(XfbBuffer {
                stride: STRIDE,
                stream: 0,
            }),
            None,
            None,
            None,
        ],
        outputs: vec![XfbOutput {
            buffer: 0,
            offset: 0,
            slot: Slot::var(0),
            comp: 0,
            stream: 0,
            is_16bit: false,
        }],
    });
    options.has_gen_prim_query = true;
    options.has_pipeline_stats_query = true;
    options
}

/// Launches one workgroup of two triangles over six vertices.
fn launch_workgroup(
    lowered: &navi_ir::Shader,
    options: &NggOptions,
    device: &mut Device,
    token: u32,
    buffer_size: u32,
) {
    let prims = [pack_input_prim(&[0, 1, 2]), pack_input_prim(&[3, 4, 5])];
    let mut launch = NogsLaunch::new(options, 6, &prims);
    launch.params.arg(ShaderArg::OrderedId, token);
    launch.params.arg(ShaderArg::XfbBufferSize(0), buffer_size);
    for b in 1..4 {
        launch.params.arg(ShaderArg::XfbBufferSize(b), 0);
    }
    let result = launch.run(lowered, device);
    // Rasterization is unaffected by streamout.
    assert_eq!(result.exports_to(ExportTarget::Prim).len(), 2);
}

#[test]
fn offsets_are_monotonic_and_overflow_safe() {
    let shader = navi_tests::position_from_args_vs();
    let options = xfb_options();
    let lowered = lower_nogs(&shader, &options).unwrap();

    // Capacity for 5 primitives; 4 workgroups demand 8.
    let buffer_size = 5 * PRIM_STRIDE;
    let mut device = Device::new();
    device.bind_buffer(BufferSlot::Xfb(0), buffer_size as usize);

    let mut last_offset = 0;
    for token in 1..=4 {
        launch_workgroup(&lowered, &options, &mut device, token, buffer_size);
        let offset = device.counter(CounterSlot::XfbOffset(0));
        assert!(offset >= last_offset, "offset went backwards");
        assert!(offset <= buffer_size, "offset overcounted past capacity");
        last_offset = offset;
    }

    // Exactly the capacity was claimed, never more; writes sum to
    // floor(size / prim_stride) once demand exceeds capacity.
    assert_eq!(device.counter(CounterSlot::XfbOffset(0)), buffer_size);
    assert_eq!(device.counter(CounterSlot::WrittenPrims(0)), 5);
    assert_eq!(device.counter(CounterSlot::GeneratedPrims(0)), 8);

    // Captured data: VAR0.x = vertex id, three vertices per primitive,
    // per-workgroup vertex ids restarting at 0. Workgroups 1 and 2 wrote
    // two primitives each, workgroup 3 the first of its two.
    let words: Vec<f32> = device
        .buffer(BufferSlot::Xfb(0))
        .chunks_exact(4)
        .map(|c| f32::from_bits(u32::from_le_bytes(c.try_into().unwrap())))
        .collect();
    let expected = [
        0.0, 1.0, 2.0, 3.0, 4.0, 5.0, // workgroup 1
        0.0, 1.0, 2.0, 3.0, 4.0, 5.0, // workgroup 2
        0.0, 1.0, 2.0, // workgroup 3, clamped to one primitive
    ];
    assert_eq!(words, expected);
}

#[test]
fn unbound_buffer_does_not_move_the_counter() {
    let shader = navi_tests::position_from_args_vs();
    let options = xfb_options();
    let lowered = lower_nogs(&shader, &options).unwrap();

    let mut device = Device::new();
    device.bind_buffer(BufferSlot::Xfb(0), 0);
    // Size 0 means "compiled-in streamout, nothing bound at draw time".
    launch_workgroup(&lowered, &options, &mut device, 1, 0);
    assert_eq!(device.counter(CounterSlot::XfbOffset(0)), 0);
    assert_eq!(device.counter(CounterSlot::WrittenPrims(0)), 0);
    assert_eq!(device.counter(CounterSlot::GeneratedPrims(0)), 2);
}

#[test]
fn out_of_order_tokens_are_detected() {
    let shader = navi_tests::position_from_args_vs();
    let options = xfb_options();
    let lowered = lower_nogs(&shader, &options).unwrap();
    let buffer_size = 8 * PRIM_STRIDE;
    let mut device = Device::new();
    device.bind_buffer(BufferSlot::Xfb(0), buffer_size as usize);
    launch_workgroup(&lowered, &options, &mut device, 2, buffer_size);
    let replay = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        launch_workgroup(&lowered, &options, &mut device, 1, buffer_size);
    }));
    assert!(replay.is_err(), "stale order token must be rejected");
}
