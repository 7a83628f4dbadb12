// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The instruction set.

use smallvec::SmallVec;

use crate::types::{ScalarType, ValueId, VarId};

/// Scalar ALU operations.
///
/// Comparison ops produce `Bool`; conversions produce the type their name
/// says. `SadU8` and `DotU8` are the packed-byte accumulating ops used by
/// the cross-wave repack prefix sum: `sad_u8(a, b, acc)` adds the four
/// byte-wise absolute differences of `a` and `b` to `acc`, `dot_u8` the
/// four byte-wise products. Shift amounts are taken modulo 32.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AluOp {
    FAdd,
    FSub,
    FMul,
    FDiv,
    FMin,
    FMax,
    FNeg,
    FAbs,
    FFloor,
    FRound,
    FLt,
    FLe,
    FGt,
    FGe,
    FEq,
    IAdd,
    ISub,
    IMul,
    UMin,
    UMax,
    UDiv,
    IAnd,
    IOr,
    IXor,
    INot,
    IShl,
    UShr,
    ULt,
    ULe,
    UGt,
    UGe,
    IEq,
    INe,
    U2F,
    I2F,
    F2U,
    F2I,
    F16To32,
    F32To16,
    B2U,
    BAnd,
    BOr,
    BNot,
    /// `ubfe(value, offset, count)`.
    Ubfe,
    SadU8,
    DotU8,
    /// Population count of a `U64` ballot mask, producing `U32`.
    BitCount64,
}

/// Immediate constants.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Imm {
    F32(f32),
    U32(u32),
    I32(i32),
    U64(u64),
    /// Raw binary16 bits.
    F16(u16),
    Bool(bool),
}

impl Imm {
    pub const fn ty(self) -> ScalarType {
        match self {
            Self::F32(_) => ScalarType::F32,
            Self::U32(_) => ScalarType::U32,
            Self::I32(_) => ScalarType::I32,
            Self::U64(_) => ScalarType::U64,
            Self::F16(_) => ScalarType::F16,
            Self::Bool(_) => ScalarType::Bool,
        }
    }
}

/// Width of an LDS access.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MemWidth {
    B8,
    B16,
    B32,
}

impl MemWidth {
    pub const fn bytes(self) -> u32 {
        match self {
            Self::B8 => 1,
            Self::B16 => 2,
            Self::B32 => 4,
        }
    }
}

/// Memory scope of a barrier.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MemScope {
    Workgroup,
    Device,
}

/// A barrier operation: an optional workgroup execution rendezvous plus a
/// memory-ordering component.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BarrierKind {
    /// Whether all invocations of the workgroup must arrive before any
    /// proceeds. Without this the barrier only orders this invocation's
    /// own memory operations.
    pub workgroup_exec: bool,
    pub mem_scope: MemScope,
    /// `true` for acquire-release, `false` for release-only.
    pub acquire: bool,
}

impl BarrierKind {
    /// Full workgroup rendezvous with acquire-release visibility of LDS.
    /// Every cross-invocation LDS read-after-write goes through one of
    /// these.
    pub const WORKGROUP: Self = Self {
        workgroup_exec: true,
        mem_scope: MemScope::Workgroup,
        acquire: true,
    };

    /// Release this invocation's buffer writes to device scope without
    /// waiting on anyone. Used before the final export so fixed-function
    /// consumers observe the writes.
    pub const RELEASE_DEVICE: Self = Self {
        workgroup_exec: false,
        mem_scope: MemScope::Device,
        acquire: false,
    };
}

/// Device-memory buffers addressable by the lowered code.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum BufferSlot {
    /// Transform-feedback buffer 0..3.
    Xfb(u8),
    /// The hardware attribute ring (GFX11 parameter output).
    AttrRing,
    /// Mesh-shader output scratch ring.
    ScratchRing,
}

/// Device-global atomic counters.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum CounterSlot {
    /// Write offset of transform-feedback buffer 0..3, in bytes.
    XfbOffset(u8),
    /// Primitives-generated query counter per stream.
    GeneratedPrims(u8),
    /// Primitives-written (transform-feedbacked) query counter per stream.
    WrittenPrims(u8),
}

/// Export destinations.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ExportTarget {
    /// Position export 0..3.
    Pos(u8),
    /// Parameter export 0..31.
    Param(u8),
    /// Primitive connectivity export.
    Prim,
}

/// Driver-ABI shader arguments, read-only hardware-placed inputs.
///
/// Scalar-register arguments are uniform across the workgroup; the
/// per-vertex identity arguments (`VertexId`, `InstanceId`, tess coords,
/// `PackedPrimitive`, `PrimitiveId`) are per-lane.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ShaderArg {
    VertexId,
    InstanceId,
    /// Input primitive id of the primitive carried by this lane.
    PrimitiveId,
    TessCoordU,
    TessCoordV,
    TessPatchId,
    TessRelPatchId,
    /// Packed input-primitive connectivity: vertex indices at bits
    /// \[8:0\], \[18:10\], \[28:20\], null-primitive flag at bit 31.
    PackedPrimitive,
    /// Packed workgroup launch counts: vertices at \[8:0\], primitives at
    /// \[20:12\].
    WorkgroupInfo,
    WorkgroupIndex,
    /// Runtime toggles; bit assignments live with the lowering options.
    RuntimeFlags,
    ViewportScaleX,
    ViewportScaleY,
    ViewportTranslateX,
    ViewportTranslateY,
    /// Rasterizer sub-pixel precision epsilon for small-primitive culling.
    SmallPrimPrecision,
    /// Half line width in NDC units, per axis.
    HalfLineWidthX,
    HalfLineWidthY,
    ViewIndex,
    /// Strictly increasing per-draw dispatch order token for the ordered
    /// streamout offset allocation.
    OrderedId,
    /// Size in bytes of the bound transform-feedback buffer, 0 if unbound.
    XfbBufferSize(u8),
    /// Byte offset of this draw's region of the attribute ring.
    AttrRingBase,
    /// Driver-defined auxiliary user data.
    User(u8),
}

/// Output slot of the abstract I/O operations, a semantic location in
/// 0..64.
///
/// The named constants cover the slots the lowering treats specially;
/// generic varyings start at [`Slot::VAR0`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Slot(pub u8);

impl Slot {
    pub const POS: Self = Self(0);
    pub const PSIZE: Self = Self(1);
    pub const EDGE: Self = Self(2);
    pub const CLIP_DIST0: Self = Self(3);
    pub const CLIP_DIST1: Self = Self(4);
    pub const LAYER: Self = Self(5);
    pub const VIEWPORT: Self = Self(6);
    pub const PRIM_ID: Self = Self(7);
    /// Mesh-shader per-primitive culling flag.
    pub const CULL_PRIMITIVE: Self = Self(8);
    /// Mesh-shader primitive connectivity (up to 3 vertex indices).
    pub const PRIM_INDICES: Self = Self(9);
    pub const VAR0: Self = Self(16);

    pub const COUNT: usize = 64;

    pub const fn var(n: u8) -> Self {
        Self(Self::VAR0.0 + n)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn bit(self) -> u64 {
        1 << self.0
    }
}

/// Which sub-table of the output table a store addresses.
///
/// 16-bit outputs live in separate low/high half-dword tables indexed
/// 0..16, distinct from the 32-bit table, because the hardware transports
/// 16-bit varyings packed two-to-a-dword.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum IoSpace {
    S32,
    Lo16,
    Hi16,
}

/// One instruction: an operation plus its (optional) SSA result.
#[derive(Clone, Debug)]
pub struct Instr {
    pub op: Op,
    pub result: Option<ValueId>,
}

/// The operation set.
///
/// Everything up to `SetVertexPrimCount` is a hardware-primitive op that
/// may appear in lowered code; the abstract tail group must be consumed
/// by a lowering pass.
#[derive(Clone, Debug)]
pub enum Op {
    Const(Imm),
    /// A value with no defined contents, e.g. the compacted index of a
    /// dead invocation.
    Undef,
    /// Placeholder left behind when a pass deletes an instruction;
    /// stripped by [`FunctionBuilder::finish`](crate::FunctionBuilder).
    Nop,
    Alu {
        op: AluOp,
        args: SmallVec<[ValueId; 3]>,
    },
    Select {
        cond: ValueId,
        if_true: ValueId,
        if_false: ValueId,
    },
    LaneId,
    WaveId,
    /// Per-wave bitmask of active lanes where `pred` holds.
    Ballot {
        pred: ValueId,
    },
    /// Count of set bits of `mask` at lane positions below the executing
    /// lane.
    MaskedBitCount {
        mask: ValueId,
    },
    ReadFirstLane {
        value: ValueId,
    },
    ReadLane {
        value: ValueId,
        lane: ValueId,
    },
    LoadArg {
        arg: ShaderArg,
    },
    VarLoad {
        var: VarId,
    },
    VarStore {
        var: VarId,
        value: ValueId,
    },
    LdsLoad {
        addr: ValueId,
        width: MemWidth,
    },
    LdsStore {
        addr: ValueId,
        value: ValueId,
        width: MemWidth,
    },
    LdsAtomicAdd {
        addr: ValueId,
        value: ValueId,
    },
    BufferLoad {
        buffer: BufferSlot,
        offset: ValueId,
    },
    BufferStore {
        buffer: BufferSlot,
        offset: ValueId,
        value: ValueId,
    },
    /// Device-ordered atomic add: adds are serialized by the strictly
    /// increasing `token`, so concurrent workgroups append in dispatch
    /// order rather than completion order.
    OrderedAtomicAdd {
        counter: CounterSlot,
        token: ValueId,
        value: ValueId,
    },
    AtomicAdd {
        counter: CounterSlot,
        value: ValueId,
    },
    Barrier(BarrierKind),
    If {
        cond: ValueId,
    },
    Else,
    EndIf,
    Loop,
    BreakIf {
        cond: ValueId,
    },
    EndLoop,
    Export {
        target: ExportTarget,
        /// Channel write mask, bits 0..4.
        mask: u8,
        /// The final export of this invocation. Exactly one export per
        /// participating invocation carries this.
        done: bool,
        /// Export row for multi-row mesh exports; `None` for row 0.
        row: Option<ValueId>,
        values: [Option<ValueId>; 4],
    },
    /// The export-space allocation message carrying the workgroup's final
    /// vertex and primitive counts.
    AllocExportSpace {
        vertices: ValueId,
        primitives: ValueId,
    },

    // Abstract operations, rewritten away by lowering.
    StoreOutput {
        slot: Slot,
        space: IoSpace,
        per_primitive: bool,
        /// Arrayed index for mesh per-vertex/per-primitive stores; `None`
        /// addresses the current invocation's output.
        index: Option<ValueId>,
        ty: ScalarType,
        /// One entry per component; `None` components are not written.
        comps: [Option<ValueId>; 4],
    },
    LoadOutput {
        slot: Slot,
        space: IoSpace,
        per_primitive: bool,
        index: Option<ValueId>,
        ty: ScalarType,
        comp: u8,
    },
    EmitVertex {
        stream: u8,
    },
    EndPrimitive {
        stream: u8,
    },
    SetVertexPrimCount {
        stream: u8,
        vertices: ValueId,
        primitives: ValueId,
    },
}

impl Op {
    /// Whether this op has an effect beyond its SSA result, i.e. must be
    /// kept by dead-code elimination even when the result is unused.
    pub fn has_side_effect(&self) -> bool {
        match self {
            Op::VarStore { .. }
            | Op::LdsStore { .. }
            | Op::LdsAtomicAdd { .. }
            | Op::BufferStore { .. }
            | Op::OrderedAtomicAdd { .. }
            | Op::AtomicAdd { .. }
            | Op::Barrier(_)
            | Op::If { .. }
            | Op::Else
            | Op::EndIf
            | Op::Loop
            | Op::BreakIf { .. }
            | Op::EndLoop
            | Op::Export { .. }
            | Op::AllocExportSpace { .. }
            | Op::StoreOutput { .. }
            | Op::EmitVertex { .. }
            | Op::EndPrimitive { .. }
            | Op::SetVertexPrimCount { .. } => true,
            Op::Const(_)
            | Op::Undef
            | Op::Nop
            | Op::Alu { .. }
            | Op::Select { .. }
            | Op::LaneId
            | Op::WaveId
            | Op::Ballot { .. }
            | Op::MaskedBitCount { .. }
            | Op::ReadFirstLane { .. }
            | Op::ReadLane { .. }
            | Op::LoadArg { .. }
            | Op::VarLoad { .. }
            | Op::LdsLoad { .. }
            | Op::BufferLoad { .. }
            | Op::LoadOutput { .. } => false,
        }
    }

    /// Visits every SSA operand.
    pub fn visit_operands(&self, mut f: impl FnMut(ValueId)) {
        match self {
            Op::Const(_)
            | Op::Undef
            | Op::Nop
            | Op::LaneId
            | Op::WaveId
            | Op::LoadArg { .. }
            | Op::VarLoad { .. }
            | Op::Barrier(_)
            | Op::Else
            | Op::EndIf
            | Op::Loop
            | Op::EndLoop
            | Op::EmitVertex { .. }
            | Op::EndPrimitive { .. } => {}
            Op::Alu { args, .. } => {
                for &a in args {
                    f(a);
                }
            }
            Op::Select {
                cond,
                if_true,
                if_false,
            } => {
                f(*cond);
                f(*if_true);
                f(*if_false);
            }
            Op::Ballot { pred } => f(*pred),
            Op::MaskedBitCount { mask } => f(*mask),
            Op::ReadFirstLane { value } => f(*value),
            Op::ReadLane { value, lane } => {
                f(*value);
                f(*lane);
            }
            Op::VarStore { value, .. } => f(*value),
            Op::LdsLoad { addr, .. } => f(*addr),
            Op::LdsStore { addr, value, .. } => {
                f(*addr);
                f(*value);
            }
            Op::LdsAtomicAdd { addr, value } => {
                f(*addr);
                f(*value);
            }
            Op::BufferLoad { offset, .. } => f(*offset),
            Op::BufferStore { offset, value, .. } => {
                f(*offset);
                f(*value);
            }
            Op::OrderedAtomicAdd { token, value, .. } => {
                f(*token);
                f(*value);
            }
            Op::AtomicAdd { value, .. } => f(*value),
            Op::If { cond } | Op::BreakIf { cond } => f(*cond),
            Op::Export { row, values, .. } => {
                if let Some(r) = row {
                    f(*r);
                }
                for v in values.iter().flatten() {
                    f(*v);
                }
            }
            Op::AllocExportSpace {
                vertices,
                primitives,
            } => {
                f(*vertices);
                f(*primitives);
            }
            Op::StoreOutput { index, comps, .. } => {
                if let Some(i) = index {
                    f(*i);
                }
                for v in comps.iter().flatten() {
                    f(*v);
                }
            }
            Op::LoadOutput { index, .. } => {
                if let Some(i) = index {
                    f(*i);
                }
            }
            Op::SetVertexPrimCount {
                vertices,
                primitives,
                ..
            } => {
                f(*vertices);
                f(*primitives);
            }
        }
    }

    /// Rewrites every SSA operand in place.
    pub fn map_operands(&mut self, mut f: impl FnMut(ValueId) -> ValueId) {
        match self {
            Op::Const(_)
            | Op::Undef
            | Op::Nop
            | Op::LaneId
            | Op::WaveId
            | Op::LoadArg { .. }
            | Op::VarLoad { .. }
            | Op::Barrier(_)
            | Op::Else
            | Op::EndIf
            | Op::Loop
            | Op::EndLoop
            | Op::EmitVertex { .. }
            | Op::EndPrimitive { .. } => {}
            Op::Alu { args, .. } => {
                for a in args {
                    *a = f(*a);
                }
            }
            Op::Select {
                cond,
                if_true,
                if_false,
            } => {
                *cond = f(*cond);
                *if_true = f(*if_true);
                *if_false = f(*if_false);
            }
            Op::Ballot { pred } => *pred = f(*pred),
            Op::MaskedBitCount { mask } => *mask = f(*mask),
            Op::ReadFirstLane { value } => *value = f(*value),
            Op::ReadLane { value, lane } => {
                *value = f(*value);
                *lane = f(*lane);
            }
            Op::VarStore { value, .. } => *value = f(*value),
            Op::LdsLoad { addr, .. } => *addr = f(*addr),
            Op::LdsStore { addr, value, .. } => {
                *addr = f(*addr);
                *value = f(*value);
            }
            Op::LdsAtomicAdd { addr, value } => {
                *addr = f(*addr);
                *value = f(*value);
            }
            Op::BufferLoad { offset, .. } => *offset = f(*offset),
            Op::BufferStore { offset, value, .. } => {
                *offset = f(*offset);
                *value = f(*value);
            }
            Op::OrderedAtomicAdd { token, value, .. } => {
                *token = f(*token);
                *value = f(*value);
            }
            Op::AtomicAdd { value, .. } => *value = f(*value),
            Op::If { cond } | Op::BreakIf { cond } => *cond = f(*cond),
            Op::Export { row, values, .. } => {
                if let Some(r) = row {
                    *r = f(*r);
                }
                for v in values.iter_mut().flatten() {
                    *v = f(*v);
                }
            }
            Op::AllocExportSpace {
                vertices,
                primitives,
            } => {
                *vertices = f(*vertices);
                *primitives = f(*primitives);
            }
            Op::StoreOutput { index, comps, .. } => {
                if let Some(i) = index {
                    *i = f(*i);
                }
                for v in comps.iter_mut().flatten() {
                    *v = f(*v);
                }
            }
            Op::LoadOutput { index, .. } => {
                if let Some(i) = index {
                    *i = f(*i);
                }
            }
            Op::SetVertexPrimCount {
                vertices,
                primitives,
                ..
            } => {
                *vertices = f(*vertices);
                *primitives = f(*primitives);
            }
        }
    }

    /// Whether this is one of the abstract I/O operations that must not
    /// survive lowering.
    pub fn is_abstract(&self) -> bool {
        matches!(
            self,
            Op::StoreOutput { .. }
                | Op::LoadOutput { .. }
                | Op::EmitVertex { .. }
                | Op::EndPrimitive { .. }
                | Op::SetVertexPrimCount { .. }
        )
    }
}
