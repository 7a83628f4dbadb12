// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use smallvec::smallvec;

use crate::instr::{
    AluOp, BarrierKind, BufferSlot, CounterSlot, ExportTarget, Imm, Instr, MemWidth, Op, ShaderArg,
};
use crate::shader::Function;
use crate::types::{ScalarType, ValueId, VarId};

/// Append-oriented builder for a [`Function`].
///
/// Control flow is structured: [`Self::if_`]/[`Self::else_`]/[`Self::end_if`]
/// and [`Self::loop_`]/[`Self::break_if`]/[`Self::end_loop`] must nest;
/// [`Self::finish`] asserts that every region was closed.
pub struct FunctionBuilder {
    instrs: Vec<Instr>,
    value_types: Vec<ScalarType>,
    var_types: Vec<ScalarType>,
    if_depth: u32,
    loop_depth: u32,
}

impl Default for FunctionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionBuilder {
    pub fn new() -> Self {
        Self {
            instrs: Vec::new(),
            value_types: Vec::new(),
            var_types: Vec::new(),
            if_depth: 0,
            loop_depth: 0,
        }
    }

    /// Appends an instruction producing a value of type `ty`.
    pub fn push(&mut self, op: Op, ty: ScalarType) -> ValueId {
        let id = ValueId::from_index(self.value_types.len());
        self.value_types.push(ty);
        self.instrs.push(Instr {
            op,
            result: Some(id),
        });
        id
    }

    /// Appends an instruction with no result.
    pub fn push_void(&mut self, op: Op) {
        self.instrs.push(Instr { op, result: None });
    }

    pub fn value_type(&self, value: ValueId) -> ScalarType {
        self.value_types[value.index()]
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    pub fn instrs_mut(&mut self) -> &mut [Instr] {
        &mut self.instrs
    }

    pub fn num_instrs(&self) -> usize {
        self.instrs.len()
    }

    /// Replaces the instruction at `index` with a [`Op::Nop`], deleting it
    /// from the stream once [`Self::finish`] runs.
    pub fn delete_instr(&mut self, index: usize) {
        self.instrs[index].op = Op::Nop;
        self.instrs[index].result = None;
    }

    pub fn finish(mut self) -> Function {
        assert_eq!(self.if_depth, 0, "unclosed if region");
        assert_eq!(self.loop_depth, 0, "unclosed loop region");
        self.instrs.retain(|i| !matches!(i.op, Op::Nop));
        Function {
            instrs: self.instrs,
            value_types: self.value_types,
            var_types: self.var_types,
        }
    }

    // Constants.

    pub fn const_f32(&mut self, v: f32) -> ValueId {
        self.push(Op::Const(Imm::F32(v)), ScalarType::F32)
    }

    pub fn const_u32(&mut self, v: u32) -> ValueId {
        self.push(Op::Const(Imm::U32(v)), ScalarType::U32)
    }

    pub fn const_i32(&mut self, v: i32) -> ValueId {
        self.push(Op::Const(Imm::I32(v)), ScalarType::I32)
    }

    pub fn const_u64(&mut self, v: u64) -> ValueId {
        self.push(Op::Const(Imm::U64(v)), ScalarType::U64)
    }

    pub fn const_bool(&mut self, v: bool) -> ValueId {
        self.push(Op::Const(Imm::Bool(v)), ScalarType::Bool)
    }

    pub fn undef(&mut self, ty: ScalarType) -> ValueId {
        self.push(Op::Undef, ty)
    }

    // ALU.

    fn alu1(&mut self, op: AluOp, a: ValueId, ty: ScalarType) -> ValueId {
        self.push(
            Op::Alu {
                op,
                args: smallvec![a],
            },
            ty,
        )
    }

    fn alu2(&mut self, op: AluOp, a: ValueId, b: ValueId, ty: ScalarType) -> ValueId {
        self.push(
            Op::Alu {
                op,
                args: smallvec![a, b],
            },
            ty,
        )
    }

    fn alu3(&mut self, op: AluOp, a: ValueId, b: ValueId, c: ValueId, ty: ScalarType) -> ValueId {
        self.push(
            Op::Alu {
                op,
                args: smallvec![a, b, c],
            },
            ty,
        )
    }

    pub fn fadd(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::FAdd, a, b, ScalarType::F32)
    }

    pub fn fsub(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::FSub, a, b, ScalarType::F32)
    }

    pub fn fmul(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::FMul, a, b, ScalarType::F32)
    }

    pub fn fdiv(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::FDiv, a, b, ScalarType::F32)
    }

    pub fn fmin(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::FMin, a, b, ScalarType::F32)
    }

    pub fn fmax(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::FMax, a, b, ScalarType::F32)
    }

    pub fn fneg(&mut self, a: ValueId) -> ValueId {
        self.alu1(AluOp::FNeg, a, ScalarType::F32)
    }

    pub fn fabs(&mut self, a: ValueId) -> ValueId {
        self.alu1(AluOp::FAbs, a, ScalarType::F32)
    }

    pub fn ffloor(&mut self, a: ValueId) -> ValueId {
        self.alu1(AluOp::FFloor, a, ScalarType::F32)
    }

    pub fn fround(&mut self, a: ValueId) -> ValueId {
        self.alu1(AluOp::FRound, a, ScalarType::F32)
    }

    pub fn flt(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::FLt, a, b, ScalarType::Bool)
    }

    pub fn fle(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::FLe, a, b, ScalarType::Bool)
    }

    pub fn fgt(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::FGt, a, b, ScalarType::Bool)
    }

    pub fn fge(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::FGe, a, b, ScalarType::Bool)
    }

    pub fn feq(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::FEq, a, b, ScalarType::Bool)
    }

    pub fn iadd(&mut self, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.value_type(a);
        self.alu2(AluOp::IAdd, a, b, ty)
    }

    pub fn isub(&mut self, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.value_type(a);
        self.alu2(AluOp::ISub, a, b, ty)
    }

    pub fn imul(&mut self, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.value_type(a);
        self.alu2(AluOp::IMul, a, b, ty)
    }

    pub fn umin(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::UMin, a, b, ScalarType::U32)
    }

    pub fn umax(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::UMax, a, b, ScalarType::U32)
    }

    pub fn udiv(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::UDiv, a, b, ScalarType::U32)
    }

    pub fn iand(&mut self, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.value_type(a);
        self.alu2(AluOp::IAnd, a, b, ty)
    }

    pub fn ior(&mut self, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.value_type(a);
        self.alu2(AluOp::IOr, a, b, ty)
    }

    pub fn ixor(&mut self, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.value_type(a);
        self.alu2(AluOp::IXor, a, b, ty)
    }

    pub fn inot(&mut self, a: ValueId) -> ValueId {
        let ty = self.value_type(a);
        self.alu1(AluOp::INot, a, ty)
    }

    pub fn ishl(&mut self, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.value_type(a);
        self.alu2(AluOp::IShl, a, b, ty)
    }

    pub fn ushr(&mut self, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.value_type(a);
        self.alu2(AluOp::UShr, a, b, ty)
    }

    pub fn ult(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::ULt, a, b, ScalarType::Bool)
    }

    pub fn ule(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::ULe, a, b, ScalarType::Bool)
    }

    pub fn ugt(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::UGt, a, b, ScalarType::Bool)
    }

    pub fn uge(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::UGe, a, b, ScalarType::Bool)
    }

    pub fn ieq(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::IEq, a, b, ScalarType::Bool)
    }

    pub fn ine(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::INe, a, b, ScalarType::Bool)
    }

    pub fn u2f(&mut self, a: ValueId) -> ValueId {
        self.alu1(AluOp::U2F, a, ScalarType::F32)
    }

    pub fn i2f(&mut self, a: ValueId) -> ValueId {
        self.alu1(AluOp::I2F, a, ScalarType::F32)
    }

    pub fn f2u(&mut self, a: ValueId) -> ValueId {
        self.alu1(AluOp::F2U, a, ScalarType::U32)
    }

    pub fn f2i(&mut self, a: ValueId) -> ValueId {
        self.alu1(AluOp::F2I, a, ScalarType::I32)
    }

    pub fn f16_to_32(&mut self, a: ValueId) -> ValueId {
        self.alu1(AluOp::F16To32, a, ScalarType::F32)
    }

    pub fn f32_to_16(&mut self, a: ValueId) -> ValueId {
        self.alu1(AluOp::F32To16, a, ScalarType::F16)
    }

    pub fn b2u(&mut self, a: ValueId) -> ValueId {
        self.alu1(AluOp::B2U, a, ScalarType::U32)
    }

    pub fn band(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::BAnd, a, b, ScalarType::Bool)
    }

    pub fn bor(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.alu2(AluOp::BOr, a, b, ScalarType::Bool)
    }

    pub fn bnot(&mut self, a: ValueId) -> ValueId {
        self.alu1(AluOp::BNot, a, ScalarType::Bool)
    }

    pub fn ubfe(&mut self, value: ValueId, offset: ValueId, count: ValueId) -> ValueId {
        self.alu3(AluOp::Ubfe, value, offset, count, ScalarType::U32)
    }

    /// `ubfe` with immediate offset/count, the common case.
    pub fn ubfe_imm(&mut self, value: ValueId, offset: u32, count: u32) -> ValueId {
        let offset = self.const_u32(offset);
        let count = self.const_u32(count);
        self.ubfe(value, offset, count)
    }

    pub fn sad_u8(&mut self, a: ValueId, b: ValueId, acc: ValueId) -> ValueId {
        self.alu3(AluOp::SadU8, a, b, acc, ScalarType::U32)
    }

    pub fn dot_u8(&mut self, a: ValueId, b: ValueId, acc: ValueId) -> ValueId {
        self.alu3(AluOp::DotU8, a, b, acc, ScalarType::U32)
    }

    pub fn bit_count64(&mut self, mask: ValueId) -> ValueId {
        self.alu1(AluOp::BitCount64, mask, ScalarType::U32)
    }

    pub fn select(&mut self, cond: ValueId, if_true: ValueId, if_false: ValueId) -> ValueId {
        let ty = self.value_type(if_true);
        self.push(
            Op::Select {
                cond,
                if_true,
                if_false,
            },
            ty,
        )
    }

    // Subgroup ops.

    pub fn lane_id(&mut self) -> ValueId {
        self.push(Op::LaneId, ScalarType::U32)
    }

    pub fn wave_id(&mut self) -> ValueId {
        self.push(Op::WaveId, ScalarType::U32)
    }

    pub fn ballot(&mut self, pred: ValueId) -> ValueId {
        self.push(Op::Ballot { pred }, ScalarType::U64)
    }

    pub fn masked_bit_count(&mut self, mask: ValueId) -> ValueId {
        self.push(Op::MaskedBitCount { mask }, ScalarType::U32)
    }

    pub fn read_first_lane(&mut self, value: ValueId) -> ValueId {
        let ty = self.value_type(value);
        self.push(Op::ReadFirstLane { value }, ty)
    }

    pub fn read_lane(&mut self, value: ValueId, lane: ValueId) -> ValueId {
        let ty = self.value_type(value);
        self.push(Op::ReadLane { value, lane }, ty)
    }

    // Arguments and registers.

    pub fn load_arg(&mut self, arg: ShaderArg, ty: ScalarType) -> ValueId {
        self.push(Op::LoadArg { arg }, ty)
    }

    pub fn declare_var(&mut self, ty: ScalarType) -> VarId {
        let id = VarId(self.var_types.len() as u32);
        self.var_types.push(ty);
        id
    }

    pub fn var_load(&mut self, var: VarId) -> ValueId {
        let ty = self.var_types[var.index()];
        self.push(Op::VarLoad { var }, ty)
    }

    pub fn var_store(&mut self, var: VarId, value: ValueId) {
        self.push_void(Op::VarStore { var, value });
    }

    // Memory.

    pub fn lds_load(&mut self, addr: ValueId, width: MemWidth) -> ValueId {
        self.push(Op::LdsLoad { addr, width }, ScalarType::U32)
    }

    pub fn lds_store(&mut self, addr: ValueId, value: ValueId, width: MemWidth) {
        self.push_void(Op::LdsStore { addr, value, width });
    }

    pub fn lds_atomic_add(&mut self, addr: ValueId, value: ValueId) -> ValueId {
        self.push(Op::LdsAtomicAdd { addr, value }, ScalarType::U32)
    }

    pub fn buffer_load(&mut self, buffer: BufferSlot, offset: ValueId) -> ValueId {
        self.push(Op::BufferLoad { buffer, offset }, ScalarType::U32)
    }

    pub fn buffer_store(&mut self, buffer: BufferSlot, offset: ValueId, value: ValueId) {
        self.push_void(Op::BufferStore {
            buffer,
            offset,
            value,
        });
    }

    pub fn ordered_atomic_add(
        &mut self,
        counter: CounterSlot,
        token: ValueId,
        value: ValueId,
    ) -> ValueId {
        self.push(
            Op::OrderedAtomicAdd {
                counter,
                token,
                value,
            },
            ScalarType::U32,
        )
    }

    pub fn atomic_add(&mut self, counter: CounterSlot, value: ValueId) -> ValueId {
        self.push(Op::AtomicAdd { counter, value }, ScalarType::U32)
    }

    pub fn barrier(&mut self, kind: BarrierKind) {
        self.push_void(Op::Barrier(kind));
    }

    // Control flow.

    pub fn if_(&mut self, cond: ValueId) {
        self.if_depth += 1;
        self.push_void(Op::If { cond });
    }

    pub fn else_(&mut self) {
        assert!(self.if_depth > 0, "else outside if region");
        self.push_void(Op::Else);
    }

    pub fn end_if(&mut self) {
        assert!(self.if_depth > 0, "unbalanced end_if");
        self.if_depth -= 1;
        self.push_void(Op::EndIf);
    }

    pub fn loop_(&mut self) {
        self.loop_depth += 1;
        self.push_void(Op::Loop);
    }

    pub fn break_if(&mut self, cond: ValueId) {
        assert!(self.loop_depth > 0, "break outside loop region");
        self.push_void(Op::BreakIf { cond });
    }

    pub fn end_loop(&mut self) {
        assert!(self.loop_depth > 0, "unbalanced end_loop");
        self.loop_depth -= 1;
        self.push_void(Op::EndLoop);
    }

    // Exports.

    pub fn export(
        &mut self,
        target: ExportTarget,
        values: [Option<ValueId>; 4],
        mask: u8,
        done: bool,
    ) {
        self.push_void(Op::Export {
            target,
            mask,
            done,
            row: None,
            values,
        });
    }

    pub fn export_row(
        &mut self,
        target: ExportTarget,
        values: [Option<ValueId>; 4],
        mask: u8,
        done: bool,
        row: ValueId,
    ) {
        self.push_void(Op::Export {
            target,
            mask,
            done,
            row: Some(row),
            values,
        });
    }

    pub fn alloc_export_space(&mut self, vertices: ValueId, primitives: ValueId) {
        self.push_void(Op::AllocExportSpace {
            vertices,
            primitives,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::FunctionBuilder;
    use crate::instr::Op;

    #[test]
    fn nops_are_stripped() {
        let mut b = FunctionBuilder::new();
        let x = b.const_u32(1);
        let y = b.const_u32(2);
        let _ = b.iadd(x, y);
        b.delete_instr(1);
        let f = b.finish();
        assert_eq!(f.instrs().len(), 2);
        assert!(!f.instrs().iter().any(|i| matches!(i.op, Op::Nop)));
    }

    #[test]
    #[should_panic(expected = "unclosed if region")]
    fn unclosed_if_panics() {
        let mut b = FunctionBuilder::new();
        let c = b.const_bool(true);
        b.if_(c);
        let _ = b.finish();
    }
}
