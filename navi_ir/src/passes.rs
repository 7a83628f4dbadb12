// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Function-level transforms used by the lowering passes: cloning with
//! value remapping, and the output-subset extraction (clone + dead-code
//! elimination) behind the deferred-culling position shader.

use crate::builder::FunctionBuilder;
use crate::instr::{Instr, Op};
use crate::shader::Function;
use crate::types::{ValueId, VarId};

/// Mapping from source-function values to destination-function values,
/// built up as instructions are cloned in order.
pub struct ValueMap {
    values: Vec<Option<ValueId>>,
    vars: Vec<Option<VarId>>,
}

impl ValueMap {
    pub fn new(src: &Function) -> Self {
        Self {
            values: vec![None; src.num_values()],
            vars: vec![None; src.num_vars()],
        }
    }

    pub fn get(&self, src: ValueId) -> ValueId {
        self.values[src.index()]
            .expect("operand of a cloned instruction was not itself cloned")
    }

    pub fn set(&mut self, src: ValueId, dst: ValueId) {
        self.values[src.index()] = Some(dst);
    }

    fn var(&mut self, dst: &mut FunctionBuilder, src_fn: &Function, var: VarId) -> VarId {
        if let Some(v) = self.vars[var.index()] {
            return v;
        }
        let v = dst.declare_var(src_fn.var_types()[var.index()]);
        self.vars[var.index()] = Some(v);
        v
    }
}

/// Outcome of a [`append_function`] rewrite hook for one instruction.
pub enum Rewrite {
    /// Clone the instruction unchanged (operands remapped).
    Keep,
    /// Drop the instruction; it must have no result, or its result must
    /// never be used by a kept instruction.
    Drop,
    /// The hook emitted replacement code itself; map the source result to
    /// the given value.
    Replaced(Option<ValueId>),
}

/// Appends a clone of `src` to `dst`, remapping every value.
///
/// `rewrite` is consulted for each instruction before the default clone;
/// it is how callers substitute argument loads and intercept the abstract
/// I/O operations.
pub fn append_function(
    dst: &mut FunctionBuilder,
    src: &Function,
    mut rewrite: impl FnMut(&mut FunctionBuilder, &Instr, &ValueMap) -> Rewrite,
) -> ValueMap {
    let mut map = ValueMap::new(src);
    for instr in src.instrs() {
        match rewrite(dst, instr, &map) {
            Rewrite::Drop => continue,
            Rewrite::Replaced(result) => {
                if let (Some(src_res), Some(dst_res)) = (instr.result, result) {
                    map.set(src_res, dst_res);
                }
                continue;
            }
            Rewrite::Keep => {}
        }
        clone_instr(dst, src, instr, &mut map);
    }
    map
}

fn clone_instr(dst: &mut FunctionBuilder, src_fn: &Function, instr: &Instr, map: &mut ValueMap) {
    // Control flow goes through the builder methods so its region
    // bookkeeping stays correct.
    match &instr.op {
        Op::If { cond } => {
            let cond = map.get(*cond);
            dst.if_(cond);
            return;
        }
        Op::Else => {
            dst.else_();
            return;
        }
        Op::EndIf => {
            dst.end_if();
            return;
        }
        Op::Loop => {
            dst.loop_();
            return;
        }
        Op::BreakIf { cond } => {
            let cond = map.get(*cond);
            dst.break_if(cond);
            return;
        }
        Op::EndLoop => {
            dst.end_loop();
            return;
        }
        Op::VarLoad { var } => {
            let var = map.var(dst, src_fn, *var);
            let result = dst.var_load(var);
            if let Some(src_res) = instr.result {
                map.set(src_res, result);
            }
            return;
        }
        Op::VarStore { var, value } => {
            let value = map.get(*value);
            let var = map.var(dst, src_fn, *var);
            dst.var_store(var, value);
            return;
        }
        _ => {}
    }
    let mut op = instr.op.clone();
    op.map_operands(|v| map.get(v));
    match instr.result {
        Some(src_res) => {
            let ty = src_fn.value_type(src_res);
            let dst_res = dst.push(op, ty);
            map.set(src_res, dst_res);
        }
        None => dst.push_void(op),
    }
}

/// Clones `src` keeping only the output stores selected by `keep`, then
/// eliminates everything that no longer contributes to a kept store.
///
/// Control-flow structure is preserved; register stores survive if any
/// load of the same register survives. The result is the
/// "position-computing portion" clone the deferred-culling path executes.
pub fn output_subset(src: &Function, keep: impl Fn(&Op) -> bool) -> Function {
    let instrs = src.instrs();
    let mut live = vec![false; instrs.len()];
    let mut value_def = vec![usize::MAX; src.num_values()];
    for (i, instr) in instrs.iter().enumerate() {
        if let Some(r) = instr.result {
            value_def[r.index()] = i;
        }
    }

    // Seed: kept stores and the control-flow skeleton.
    for (i, instr) in instrs.iter().enumerate() {
        match &instr.op {
            Op::StoreOutput { .. } => live[i] = keep(&instr.op),
            Op::If { .. }
            | Op::Else
            | Op::EndIf
            | Op::Loop
            | Op::BreakIf { .. }
            | Op::EndLoop => live[i] = true,
            _ => {}
        }
    }

    // Propagate liveness to operands; register stores become live when a
    // load of the register is. Iterate to a fixed point (register chains
    // can run forward).
    let num_vars = src.num_vars();
    loop {
        let mut changed = false;
        let mut live_vars = vec![false; num_vars];
        for (i, instr) in instrs.iter().enumerate() {
            if live[i] {
                if let Op::VarLoad { var } = instr.op {
                    live_vars[var.index()] = true;
                }
            }
        }
        for (i, instr) in instrs.iter().enumerate() {
            if !live[i] {
                if let Op::VarStore { var, .. } = instr.op {
                    if live_vars[var.index()] {
                        live[i] = true;
                        changed = true;
                    }
                }
            }
        }
        for i in (0..instrs.len()).rev() {
            if !live[i] {
                continue;
            }
            instrs[i].op.visit_operands(|v| {
                let def = value_def[v.index()];
                if def != usize::MAX && !live[def] {
                    live[def] = true;
                    changed = true;
                }
            });
        }
        if !changed {
            break;
        }
    }

    let mut b = FunctionBuilder::new();
    let mut map = ValueMap::new(src);
    for (i, instr) in instrs.iter().enumerate() {
        if live[i] {
            clone_instr(&mut b, src, instr, &mut map);
        }
    }
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::output_subset;
    use crate::builder::FunctionBuilder;
    use crate::instr::{IoSpace, Op, ShaderArg, Slot};
    use crate::types::ScalarType;

    fn store(b: &mut FunctionBuilder, slot: Slot, comps: [Option<crate::ValueId>; 4]) {
        b.push_void(Op::StoreOutput {
            slot,
            space: IoSpace::S32,
            per_primitive: false,
            index: None,
            ty: ScalarType::F32,
            comps,
        });
    }

    #[test]
    fn position_subset_drops_unrelated_work() {
        let mut b = FunctionBuilder::new();
        let vid = b.load_arg(ShaderArg::VertexId, ScalarType::U32);
        let x = b.u2f(vid);
        let one = b.const_f32(1.0);
        let color = b.fadd(one, one);
        store(&mut b, Slot::POS, [Some(x), Some(one), None, Some(one)]);
        store(&mut b, Slot::var(0), [Some(color), None, None, None]);
        let f = b.finish();

        let pos_only = output_subset(&f, |op| {
            matches!(op, Op::StoreOutput { slot, .. } if *slot == Slot::POS)
        });
        let stores = pos_only
            .instrs()
            .iter()
            .filter(|i| matches!(i.op, Op::StoreOutput { .. }))
            .count();
        assert_eq!(stores, 1);
        // The color computation feeds only the dropped store; `one` is
        // shared and must survive.
        assert!(!pos_only
            .instrs()
            .iter()
            .any(|i| matches!(i.op, Op::Alu { op: crate::AluOp::FAdd, .. })));
        assert!(pos_only.instrs().len() < f.instrs().len());
    }
}
