// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIMT interpreter for lowered functions.
//!
//! Executes a function over one workgroup: all lanes of a wave run in
//! lockstep under an active-mask stack, waves are scheduled at workgroup-
//! barrier granularity, and LDS, streamout buffers, global counters and
//! the export stream are modeled concretely. Note that while this is
//! useful for testing and debugging, it is not a timing or occupancy
//! simulator; it produces one valid race-free execution.
//!
//! Panics in this module indicate either a lowering bug (an abstract
//! operation survived, an out-of-bounds LDS access, barriers that never
//! converge) or a malformed launch; they are deliberate, this is test
//! infrastructure.

use std::collections::HashMap;

use crate::instr::{
    AluOp, BufferSlot, CounterSlot, ExportTarget, Imm, MemWidth, Op, ShaderArg,
};
use crate::math::{f16_to_f32, f32_to_f16};
use crate::shader::Function;
use crate::types::ValueId;

/// Device-global state shared by every workgroup of a dispatch.
#[derive(Default)]
pub struct Device {
    counters: HashMap<CounterSlot, u32>,
    buffers: HashMap<BufferSlot, Vec<u8>>,
    last_token: HashMap<CounterSlot, u32>,
}

impl Device {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a buffer of `size` bytes, zero-filled.
    pub fn bind_buffer(&mut self, slot: BufferSlot, size: usize) {
        self.buffers.insert(slot, vec![0; size]);
    }

    pub fn buffer(&self, slot: BufferSlot) -> &[u8] {
        self.buffers
            .get(&slot)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn counter(&self, slot: CounterSlot) -> u32 {
        self.counters.get(&slot).copied().unwrap_or(0)
    }

    pub fn set_counter(&mut self, slot: CounterSlot, value: u32) {
        self.counters.insert(slot, value);
    }

    fn atomic_add(&mut self, slot: CounterSlot, value: u32) -> u32 {
        let c = self.counters.entry(slot).or_insert(0);
        let old = *c;
        *c = c.wrapping_add(value);
        old
    }

    fn ordered_add(&mut self, slot: CounterSlot, token: u32, value: u32) -> u32 {
        if let Some(&last) = self.last_token.get(&slot) {
            assert!(
                token > last,
                "ordered atomic add replayed out of dispatch order: token {token} after {last}"
            );
        }
        self.last_token.insert(slot, token);
        self.atomic_add(slot, value)
    }
}

/// A shader-argument binding: uniform across the workgroup or one value
/// per lane. Floating-point arguments are bound as their bit patterns.
#[derive(Clone, Debug)]
pub enum ArgValue {
    Uniform(u32),
    PerLane(Vec<u32>),
}

/// One workgroup launch.
#[derive(Clone, Default, Debug)]
pub struct LaunchParams {
    /// 32 or 64.
    pub wave_size: u32,
    pub num_waves: u32,
    /// LDS bytes to allocate, from the lowering's layout plan.
    pub lds_size: u32,
    pub args: HashMap<ShaderArg, ArgValue>,
}

impl LaunchParams {
    pub fn new(wave_size: u32, num_waves: u32, lds_size: u32) -> Self {
        assert!(wave_size == 32 || wave_size == 64);
        Self {
            wave_size,
            num_waves,
            lds_size,
            args: HashMap::new(),
        }
    }

    pub fn arg(&mut self, arg: ShaderArg, value: u32) -> &mut Self {
        self.args.insert(arg, ArgValue::Uniform(value));
        self
    }

    pub fn arg_f32(&mut self, arg: ShaderArg, value: f32) -> &mut Self {
        self.arg(arg, value.to_bits())
    }

    pub fn arg_per_lane(&mut self, arg: ShaderArg, values: Vec<u32>) -> &mut Self {
        self.args.insert(arg, ArgValue::PerLane(values));
        self
    }
}

/// One recorded export.
#[derive(Clone, Debug)]
pub struct ExportRecord {
    /// Workgroup-linear invocation index of the exporting lane.
    pub invocation: u32,
    pub target: ExportTarget,
    pub mask: u8,
    pub done: bool,
    pub row: u32,
    /// Raw channel bits; unwritten channels are zero.
    pub values: [u32; 4],
}

impl ExportRecord {
    pub fn value_f32(&self, chan: usize) -> f32 {
        f32::from_bits(self.values[chan])
    }
}

/// Result of executing one workgroup.
pub struct RunResult {
    pub exports: Vec<ExportRecord>,
    /// The `(vertices, primitives)` of the export-space allocation
    /// message, if one was sent.
    pub alloc: Option<(u32, u32)>,
    /// Final LDS contents.
    pub lds: Vec<u8>,
}

impl RunResult {
    /// Exports to the given target, in execution order.
    pub fn exports_to(&self, target: ExportTarget) -> Vec<&ExportRecord> {
        self.exports.iter().filter(|e| e.target == target).collect()
    }
}

/// Executes `f` for one workgroup against `device`.
pub fn run_workgroup(f: &Function, params: &LaunchParams, device: &mut Device) -> RunResult {
    assert!(
        !f.has_abstract_ops(),
        "abstract I/O operation survived lowering"
    );
    let mut shared = SharedState {
        lds: vec![0; params.lds_size as usize],
        exports: Vec::new(),
        alloc: None,
    };
    let mut waves: Vec<WaveState> = (0..params.num_waves)
        .map(|w| WaveState::new(f, w, params.wave_size))
        .collect();
    // Waves run until they suspend at a workgroup barrier; a barrier is
    // an anonymous rendezvous (the hardware counts arriving waves, it
    // does not compare program counters), so waves may legitimately wait
    // at different instructions, as the mesh idle-wave loop does. Waves
    // that terminated stop participating: a barrier releases once every
    // still-running wave has arrived.
    let mut rounds = 0_u32;
    loop {
        let mut all_done = true;
        for wave in &mut waves {
            if wave.done {
                continue;
            }
            match wave.run(f, params, &mut shared, device) {
                StepResult::Done => {}
                StepResult::Barrier => all_done = false,
            }
        }
        if all_done {
            break;
        }
        rounds += 1;
        assert!(rounds < 1_000_000, "workgroup barriers never converge");
    }
    RunResult {
        exports: shared.exports,
        alloc: shared.alloc,
        lds: shared.lds,
    }
}

struct SharedState {
    lds: Vec<u8>,
    exports: Vec<ExportRecord>,
    alloc: Option<(u32, u32)>,
}

enum StepResult {
    Done,
    Barrier,
}

enum Frame {
    If { outer: u64, else_mask: u64 },
    Loop { outer: u64, start: usize, broken: u64 },
}

struct WaveState {
    wave_id: u32,
    lanes: u32,
    ip: usize,
    exec: u64,
    full: u64,
    frames: Vec<Frame>,
    values: Vec<Vec<u64>>,
    vars: Vec<Vec<u64>>,
    done: bool,
}

impl WaveState {
    fn new(f: &Function, wave_id: u32, lanes: u32) -> Self {
        let full = if lanes == 64 {
            u64::MAX
        } else {
            (1u64 << lanes) - 1
        };
        Self {
            wave_id,
            lanes,
            ip: 0,
            exec: full,
            full,
            frames: Vec::new(),
            values: vec![Vec::new(); f.num_values()],
            vars: f
                .var_types()
                .iter()
                .map(|_| vec![0; lanes as usize])
                .collect(),
            done: false,
        }
    }

    fn breaks(&self) -> u64 {
        self.frames
            .iter()
            .map(|fr| match fr {
                Frame::Loop { broken, .. } => *broken,
                Frame::If { .. } => 0,
            })
            .fold(0, |a, b| a | b)
    }

    fn val(&self, v: ValueId, lane: usize) -> u64 {
        let slot = &self.values[v.index()];
        assert!(!slot.is_empty(), "value read before definition");
        slot[lane]
    }

    fn set(&mut self, v: ValueId, per_lane: Vec<u64>) {
        self.values[v.index()] = per_lane;
    }

    fn uniform(&mut self, v: ValueId, value: u64) {
        self.values[v.index()] = vec![value; self.lanes as usize];
    }

    fn run(
        &mut self,
        f: &Function,
        params: &LaunchParams,
        shared: &mut SharedState,
        device: &mut Device,
    ) -> StepResult {
        let instrs = f.instrs();
        let n_lanes = self.lanes as usize;
        while self.ip < instrs.len() {
            let instr = &instrs[self.ip];
            let result = instr.result;
            match &instr.op {
                Op::Const(imm) => {
                    let bits = match *imm {
                        Imm::F32(v) => u64::from(v.to_bits()),
                        Imm::U32(v) => u64::from(v),
                        Imm::I32(v) => u64::from(v as u32),
                        Imm::U64(v) => v,
                        Imm::F16(v) => u64::from(v),
                        Imm::Bool(v) => u64::from(v),
                    };
                    self.uniform(result.unwrap(), bits);
                }
                Op::Undef => self.uniform(result.unwrap(), 0),
                Op::Nop => {}
                Op::Alu { op, args } => {
                    let vals: Vec<u64> = (0..n_lanes)
                        .map(|lane| {
                            let a = args.first().map(|&v| self.val(v, lane)).unwrap_or(0);
                            let b = args.get(1).map(|&v| self.val(v, lane)).unwrap_or(0);
                            let c = args.get(2).map(|&v| self.val(v, lane)).unwrap_or(0);
                            eval_alu(*op, a, b, c)
                        })
                        .collect();
                    self.set(result.unwrap(), vals);
                }
                Op::Select {
                    cond,
                    if_true,
                    if_false,
                } => {
                    let vals: Vec<u64> = (0..n_lanes)
                        .map(|lane| {
                            if self.val(*cond, lane) != 0 {
                                self.val(*if_true, lane)
                            } else {
                                self.val(*if_false, lane)
                            }
                        })
                        .collect();
                    self.set(result.unwrap(), vals);
                }
                Op::LaneId => {
                    let vals: Vec<u64> = (0..n_lanes as u64).collect();
                    self.set(result.unwrap(), vals);
                }
                Op::WaveId => self.uniform(result.unwrap(), u64::from(self.wave_id)),
                Op::Ballot { pred } => {
                    let mut mask = 0u64;
                    for lane in 0..n_lanes {
                        if self.exec & (1 << lane) != 0 && self.val(*pred, lane) != 0 {
                            mask |= 1 << lane;
                        }
                    }
                    self.uniform(result.unwrap(), mask);
                }
                Op::MaskedBitCount { mask } => {
                    let vals: Vec<u64> = (0..n_lanes)
                        .map(|lane| {
                            let m = self.val(*mask, lane);
                            u64::from((m & ((1u64 << lane) - 1)).count_ones())
                        })
                        .collect();
                    self.set(result.unwrap(), vals);
                }
                Op::ReadFirstLane { value } => {
                    let first = self.exec.trailing_zeros().min(self.lanes - 1) as usize;
                    let v = self.val(*value, first);
                    self.uniform(result.unwrap(), v);
                }
                Op::ReadLane { value, lane } => {
                    let first = self.exec.trailing_zeros().min(self.lanes - 1) as usize;
                    let which = (self.val(*lane, first) as usize).min(n_lanes - 1);
                    let v = self.val(*value, which);
                    self.uniform(result.unwrap(), v);
                }
                Op::LoadArg { arg } => {
                    let binding = params
                        .args
                        .get(arg)
                        .unwrap_or_else(|| panic!("shader argument {arg:?} not bound"));
                    let vals: Vec<u64> = (0..n_lanes)
                        .map(|lane| {
                            let invocation =
                                self.wave_id as usize * n_lanes + lane;
                            match binding {
                                ArgValue::Uniform(v) => u64::from(*v),
                                ArgValue::PerLane(vs) => {
                                    u64::from(vs.get(invocation).copied().unwrap_or(0))
                                }
                            }
                        })
                        .collect();
                    self.set(result.unwrap(), vals);
                }
                Op::VarLoad { var } => {
                    let vals = self.vars[var.index()].clone();
                    self.set(result.unwrap(), vals);
                }
                Op::VarStore { var, value } => {
                    for lane in 0..n_lanes {
                        if self.exec & (1 << lane) != 0 {
                            self.vars[var.index()][lane] = self.val(*value, lane);
                        }
                    }
                }
                Op::LdsLoad { addr, width } => {
                    let vals: Vec<u64> = (0..n_lanes)
                        .map(|lane| {
                            if self.exec & (1 << lane) != 0 {
                                u64::from(lds_read(
                                    &shared.lds,
                                    self.val(*addr, lane) as u32,
                                    *width,
                                ))
                            } else {
                                0
                            }
                        })
                        .collect();
                    self.set(result.unwrap(), vals);
                }
                Op::LdsStore { addr, value, width } => {
                    for lane in 0..n_lanes {
                        if self.exec & (1 << lane) != 0 {
                            lds_write(
                                &mut shared.lds,
                                self.val(*addr, lane) as u32,
                                self.val(*value, lane) as u32,
                                *width,
                            );
                        }
                    }
                }
                Op::LdsAtomicAdd { addr, value } => {
                    let mut vals = vec![0u64; n_lanes];
                    for lane in 0..n_lanes {
                        if self.exec & (1 << lane) != 0 {
                            let a = self.val(*addr, lane) as u32;
                            let old = lds_read(&shared.lds, a, MemWidth::B32);
                            lds_write(
                                &mut shared.lds,
                                a,
                                old.wrapping_add(self.val(*value, lane) as u32),
                                MemWidth::B32,
                            );
                            vals[lane] = u64::from(old);
                        }
                    }
                    self.set(result.unwrap(), vals);
                }
                Op::BufferLoad { buffer, offset } => {
                    let vals: Vec<u64> = (0..n_lanes)
                        .map(|lane| {
                            if self.exec & (1 << lane) != 0 {
                                let buf = device
                                    .buffers
                                    .get(buffer)
                                    .unwrap_or_else(|| panic!("buffer {buffer:?} not bound"));
                                let off = self.val(*offset, lane) as usize;
                                u64::from(*bytemuck::from_bytes::<u32>(&buf[off..off + 4]))
                            } else {
                                0
                            }
                        })
                        .collect();
                    self.set(result.unwrap(), vals);
                }
                Op::BufferStore {
                    buffer,
                    offset,
                    value,
                } => {
                    for lane in 0..n_lanes {
                        if self.exec & (1 << lane) != 0 {
                            let off = self.val(*offset, lane) as usize;
                            let value = self.val(*value, lane) as u32;
                            let buf = device
                                .buffers
                                .get_mut(buffer)
                                .unwrap_or_else(|| panic!("buffer {buffer:?} not bound"));
                            assert!(
                                off + 4 <= buf.len(),
                                "out-of-bounds store to {buffer:?} at byte {off}"
                            );
                            buf[off..off + 4].copy_from_slice(bytemuck::bytes_of(&value));
                        }
                    }
                }
                Op::OrderedAtomicAdd {
                    counter,
                    token,
                    value,
                } => {
                    let mut vals = vec![0u64; n_lanes];
                    for lane in 0..n_lanes {
                        if self.exec & (1 << lane) != 0 {
                            vals[lane] = u64::from(device.ordered_add(
                                *counter,
                                self.val(*token, lane) as u32,
                                self.val(*value, lane) as u32,
                            ));
                        }
                    }
                    self.set(result.unwrap(), vals);
                }
                Op::AtomicAdd { counter, value } => {
                    let mut vals = vec![0u64; n_lanes];
                    for lane in 0..n_lanes {
                        if self.exec & (1 << lane) != 0 {
                            vals[lane] = u64::from(
                                device.atomic_add(*counter, self.val(*value, lane) as u32),
                            );
                        }
                    }
                    self.set(result.unwrap(), vals);
                }
                Op::Barrier(kind) => {
                    // A barrier in a fully inactive region is scalar-
                    // skipped, matching the hardware's uniform branches;
                    // with any lane active the wave arrives. Memory-only
                    // barriers are ordering constraints and the
                    // interpreter is already sequentially consistent.
                    if kind.workgroup_exec && self.exec != 0 {
                        self.ip += 1;
                        return StepResult::Barrier;
                    }
                }
                Op::If { cond } => {
                    let mut taken = 0u64;
                    for lane in 0..n_lanes {
                        if self.exec & (1 << lane) != 0 && self.val(*cond, lane) != 0 {
                            taken |= 1 << lane;
                        }
                    }
                    self.frames.push(Frame::If {
                        outer: self.exec,
                        else_mask: self.exec & !taken,
                    });
                    self.exec = taken;
                }
                Op::Else => {
                    let breaks = self.breaks();
                    match self.frames.last() {
                        Some(Frame::If { else_mask, .. }) => {
                            self.exec = *else_mask & !breaks;
                        }
                        _ => panic!("else outside if region"),
                    }
                }
                Op::EndIf => {
                    let breaks = self.breaks();
                    match self.frames.pop() {
                        Some(Frame::If { outer, .. }) => self.exec = outer & !breaks,
                        _ => panic!("end_if outside if region"),
                    }
                }
                Op::Loop => {
                    self.frames.push(Frame::Loop {
                        outer: self.exec,
                        start: self.ip + 1,
                        broken: 0,
                    });
                }
                Op::BreakIf { cond } => {
                    let mut broke = 0u64;
                    for lane in 0..n_lanes {
                        if self.exec & (1 << lane) != 0 && self.val(*cond, lane) != 0 {
                            broke |= 1 << lane;
                        }
                    }
                    for fr in self.frames.iter_mut().rev() {
                        if let Frame::Loop { broken, .. } = fr {
                            *broken |= broke;
                            break;
                        }
                    }
                    self.exec &= !broke;
                }
                Op::EndLoop => match self.frames.last() {
                    Some(Frame::Loop { outer, start, .. }) => {
                        if self.exec != 0 {
                            self.ip = *start;
                            continue;
                        }
                        let outer = *outer;
                        let _ = start;
                        self.frames.pop();
                        self.exec = outer & !self.breaks();
                    }
                    _ => panic!("end_loop outside loop region"),
                },
                Op::Export {
                    target,
                    mask,
                    done,
                    row,
                    values,
                } => {
                    for lane in 0..n_lanes {
                        if self.exec & (1 << lane) == 0 {
                            continue;
                        }
                        let mut chans = [0u32; 4];
                        for (c, v) in values.iter().enumerate() {
                            if let Some(v) = v {
                                chans[c] = self.val(*v, lane) as u32;
                            }
                        }
                        let row = row.map(|r| self.val(r, lane) as u32).unwrap_or(0);
                        shared.exports.push(ExportRecord {
                            invocation: self.wave_id * self.lanes + lane as u32,
                            target: *target,
                            mask: *mask,
                            done: *done,
                            row,
                            values: chans,
                        });
                    }
                }
                Op::AllocExportSpace {
                    vertices,
                    primitives,
                } => {
                    if self.exec != 0 {
                        let first = self.exec.trailing_zeros() as usize;
                        let v = self.val(*vertices, first) as u32;
                        let p = self.val(*primitives, first) as u32;
                        assert!(
                            shared.alloc.is_none(),
                            "export space allocated more than once"
                        );
                        shared.alloc = Some((v, p));
                    }
                }
                op if op.is_abstract() => {
                    panic!("abstract operation {op:?} reached the interpreter")
                }
                op => panic!("unhandled operation {op:?}"),
            }
            self.ip += 1;
        }
        assert!(self.frames.is_empty(), "function ended inside a region");
        self.done = true;
        StepResult::Done
    }
}

fn lds_read(lds: &[u8], addr: u32, width: MemWidth) -> u32 {
    let a = addr as usize;
    assert!(
        a + width.bytes() as usize <= lds.len(),
        "out-of-bounds LDS read at byte {a}"
    );
    match width {
        MemWidth::B8 => u32::from(lds[a]),
        MemWidth::B16 => {
            assert_eq!(a % 2, 0, "misaligned 16-bit LDS read");
            u32::from(*bytemuck::from_bytes::<u16>(&lds[a..a + 2]))
        }
        MemWidth::B32 => {
            assert_eq!(a % 4, 0, "misaligned 32-bit LDS read");
            *bytemuck::from_bytes::<u32>(&lds[a..a + 4])
        }
    }
}

fn lds_write(lds: &mut [u8], addr: u32, value: u32, width: MemWidth) {
    let a = addr as usize;
    assert!(
        a + width.bytes() as usize <= lds.len(),
        "out-of-bounds LDS write at byte {a}"
    );
    match width {
        MemWidth::B8 => lds[a] = value as u8,
        MemWidth::B16 => {
            assert_eq!(a % 2, 0, "misaligned 16-bit LDS write");
            lds[a..a + 2].copy_from_slice(bytemuck::bytes_of(&(value as u16)));
        }
        MemWidth::B32 => {
            assert_eq!(a % 4, 0, "misaligned 32-bit LDS write");
            lds[a..a + 4].copy_from_slice(bytemuck::bytes_of(&value));
        }
    }
}

fn round_ties_even(x: f32) -> f32 {
    let f = x.floor();
    let d = x - f;
    if d > 0.5 {
        f + 1.0
    } else if d < 0.5 {
        f
    } else if (f as i64) % 2 == 0 {
        f
    } else {
        f + 1.0
    }
}

fn eval_alu(op: AluOp, a: u64, b: u64, c: u64) -> u64 {
    let fa = f32::from_bits(a as u32);
    let fb = f32::from_bits(b as u32);
    let ua = a as u32;
    let ub = b as u32;
    let uc = c as u32;
    let f = |v: f32| u64::from(v.to_bits());
    let bl = |v: bool| u64::from(v);
    match op {
        AluOp::FAdd => f(fa + fb),
        AluOp::FSub => f(fa - fb),
        AluOp::FMul => f(fa * fb),
        AluOp::FDiv => f(fa / fb),
        AluOp::FMin => f(fa.min(fb)),
        AluOp::FMax => f(fa.max(fb)),
        AluOp::FNeg => f(-fa),
        AluOp::FAbs => f(fa.abs()),
        AluOp::FFloor => f(fa.floor()),
        AluOp::FRound => f(round_ties_even(fa)),
        AluOp::FLt => bl(fa < fb),
        AluOp::FLe => bl(fa <= fb),
        AluOp::FGt => bl(fa > fb),
        AluOp::FGe => bl(fa >= fb),
        AluOp::FEq => bl(fa == fb),
        AluOp::IAdd => u64::from(ua.wrapping_add(ub)),
        AluOp::ISub => u64::from(ua.wrapping_sub(ub)),
        AluOp::IMul => u64::from(ua.wrapping_mul(ub)),
        AluOp::UMin => u64::from(ua.min(ub)),
        AluOp::UMax => u64::from(ua.max(ub)),
        AluOp::UDiv => u64::from(if ub == 0 { 0 } else { ua / ub }),
        AluOp::IAnd => u64::from(ua & ub),
        AluOp::IOr => u64::from(ua | ub),
        AluOp::IXor => u64::from(ua ^ ub),
        AluOp::INot => u64::from(!ua),
        AluOp::IShl => u64::from(ua.wrapping_shl(ub)),
        AluOp::UShr => u64::from(ua.wrapping_shr(ub)),
        AluOp::ULt => bl(ua < ub),
        AluOp::ULe => bl(ua <= ub),
        AluOp::UGt => bl(ua > ub),
        AluOp::UGe => bl(ua >= ub),
        AluOp::IEq => bl(ua == ub),
        AluOp::INe => bl(ua != ub),
        AluOp::U2F => f(ua as f32),
        AluOp::I2F => f(ua as i32 as f32),
        AluOp::F2U => u64::from(fa as u32),
        AluOp::F2I => u64::from(fa as i32 as u32),
        AluOp::F16To32 => f(f16_to_f32(ua as u16)),
        AluOp::F32To16 => u64::from(f32_to_f16(fa)),
        AluOp::B2U => u64::from(ua & 1),
        AluOp::BAnd => bl(a != 0 && b != 0),
        AluOp::BOr => bl(a != 0 || b != 0),
        AluOp::BNot => bl(a == 0),
        AluOp::Ubfe => {
            let offset = ub & 31;
            let count = uc.min(32);
            let mask = if count >= 32 { u32::MAX } else { (1 << count) - 1 };
            u64::from((ua >> offset) & mask)
        }
        AluOp::SadU8 => {
            let mut acc = uc;
            for i in 0..4 {
                let ba = (ua >> (8 * i)) & 0xFF;
                let bb = (ub >> (8 * i)) & 0xFF;
                acc = acc.wrapping_add(ba.abs_diff(bb));
            }
            u64::from(acc)
        }
        AluOp::DotU8 => {
            let mut acc = uc;
            for i in 0..4 {
                let ba = (ua >> (8 * i)) & 0xFF;
                let bb = (ub >> (8 * i)) & 0xFF;
                acc = acc.wrapping_add(ba * bb);
            }
            u64::from(acc)
        }
        AluOp::BitCount64 => u64::from(a.count_ones()),
    }
}

#[cfg(test)]
mod tests {
    use super::{run_workgroup, Device, LaunchParams};
    use crate::builder::FunctionBuilder;
    use crate::instr::{BarrierKind, ExportTarget, MemWidth};

    /// Every lane exports its masked-bit-count prefix; one wave.
    #[test]
    fn ballot_prefix_sums() {
        let mut b = FunctionBuilder::new();
        let lane = b.lane_id();
        let three = b.const_u32(3);
        let odd = b.iand(lane, three);
        let zero = b.const_u32(0);
        let pred = b.ieq(odd, zero);
        let mask = b.ballot(pred);
        let count = b.bit_count64(mask);
        let prefix = b.masked_bit_count(mask);
        let cf = b.u2f(count);
        let pf = b.u2f(prefix);
        b.export(ExportTarget::Param(0), [Some(cf), Some(pf), None, None], 0x3, true);
        let f = b.finish();

        let mut device = Device::new();
        let result = run_workgroup(&f, &LaunchParams::new(32, 1, 0), &mut device);
        assert_eq!(result.exports.len(), 32);
        for (lane, e) in result.exports.iter().enumerate() {
            assert_eq!(e.value_f32(0), 8.0);
            assert_eq!(e.value_f32(1), (lane / 4) as f32);
        }
    }

    /// Cross-wave LDS communication through a workgroup barrier.
    #[test]
    fn barrier_orders_lds_exchange() {
        let mut b = FunctionBuilder::new();
        let lane = b.lane_id();
        let wave = b.wave_id();
        let zero = b.const_u32(0);
        let is_first = b.ieq(lane, zero);
        b.if_(is_first);
        {
            let four = b.const_u32(4);
            let addr = b.imul(wave, four);
            let hundred = b.const_u32(100);
            let val = b.iadd(wave, hundred);
            b.lds_store(addr, val, MemWidth::B32);
        }
        b.end_if();
        b.barrier(BarrierKind::WORKGROUP);
        // Every lane of wave 0 reads wave 1's slot.
        let addr = b.const_u32(4);
        let other = b.lds_load(addr, MemWidth::B32);
        let of = b.u2f(other);
        b.export(ExportTarget::Param(0), [Some(of), None, None, None], 0x1, true);
        let f = b.finish();

        let mut device = Device::new();
        let result = run_workgroup(&f, &LaunchParams::new(32, 2, 8), &mut device);
        assert!(result.exports.iter().all(|e| e.value_f32(0) == 101.0));
    }

    /// Divergent loop: each lane iterates `lane % 3 + 1` times.
    #[test]
    fn divergent_loop_reconverges() {
        let mut b = FunctionBuilder::new();
        let counter = b.declare_var(crate::ScalarType::U32);
        let zero = b.const_u32(0);
        b.var_store(counter, zero);
        let lane = b.lane_id();
        let three = b.const_u32(3);
        let one = b.const_u32(1);
        let rem = b.iand(lane, three);
        let trips = b.iadd(rem, one);
        b.loop_();
        {
            let cur = b.var_load(counter);
            let next = b.iadd(cur, one);
            b.var_store(counter, next);
            let done = b.uge(next, trips);
            b.break_if(done);
        }
        b.end_loop();
        let total = b.var_load(counter);
        let tf = b.u2f(total);
        b.export(ExportTarget::Param(0), [Some(tf), None, None, None], 0x1, true);
        let f = b.finish();

        let mut device = Device::new();
        let result = run_workgroup(&f, &LaunchParams::new(32, 1, 0), &mut device);
        for (lane, e) in result.exports.iter().enumerate() {
            assert_eq!(e.value_f32(0), ((lane & 3) + 1) as f32);
        }
    }
}
