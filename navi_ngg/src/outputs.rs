// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Output aggregation: collecting every `store_output` into a dense
//! (slot, component) table so the export builder and the LDS staging
//! code see one value per channel instead of a scatter of stores.

use std::collections::HashMap;

use navi_ir::passes::{append_function, Rewrite, ValueMap};
use navi_ir::{Function, FunctionBuilder, IoSpace, Op, ScalarType, ShaderArg, Slot, ValueId};

use crate::Error;

/// A recorded scalar output component.
#[derive(Copy, Clone, Debug)]
pub struct OutputValue {
    pub value: ValueId,
    pub ty: ScalarType,
}

/// The dense output table: 64 ordinary 32-bit slots plus the 16 low-half
/// and 16 high-half 16-bit slots, four components each.
///
/// A component written twice before the consuming emit is last-write-wins;
/// duplicate writes indicate undefined shader behavior, not an error.
#[derive(Clone)]
pub struct OutputTable {
    vary: [[Option<OutputValue>; 4]; Slot::COUNT],
    lo16: [[Option<OutputValue>; 4]; 16],
    hi16: [[Option<OutputValue>; 4]; 16],
}

impl Default for OutputTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputTable {
    pub fn new() -> Self {
        Self {
            vary: [[None; 4]; Slot::COUNT],
            lo16: [[None; 4]; 16],
            hi16: [[None; 4]; 16],
        }
    }

    /// Clears every entry; used at each `emit_vertex` of the geometry
    /// path.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    fn row(&mut self, space: IoSpace, slot: Slot) -> &mut [Option<OutputValue>; 4] {
        match space {
            IoSpace::S32 => &mut self.vary[slot.index()],
            IoSpace::Lo16 => &mut self.lo16[slot.index() & 15],
            IoSpace::Hi16 => &mut self.hi16[slot.index() & 15],
        }
    }

    pub fn record(
        &mut self,
        space: IoSpace,
        slot: Slot,
        comp: u8,
        value: ValueId,
        ty: ScalarType,
    ) {
        self.row(space, slot)[comp as usize] = Some(OutputValue { value, ty });
    }

    pub fn get(&self, space: IoSpace, slot: Slot, comp: u8) -> Option<OutputValue> {
        match space {
            IoSpace::S32 => self.vary[slot.index()][comp as usize],
            IoSpace::Lo16 => self.lo16[slot.index() & 15][comp as usize],
            IoSpace::Hi16 => self.hi16[slot.index() & 15][comp as usize],
        }
    }

    /// Channel write mask of one slot.
    pub fn write_mask(&self, space: IoSpace, slot: Slot) -> u8 {
        let row = match space {
            IoSpace::S32 => &self.vary[slot.index()],
            IoSpace::Lo16 => &self.lo16[slot.index() & 15],
            IoSpace::Hi16 => &self.hi16[slot.index() & 15],
        };
        row.iter()
            .enumerate()
            .filter_map(|(c, v)| v.map(|_| 1 << c))
            .fold(0, |a, b| a | b)
    }

    /// Bitmask of written 32-bit slots.
    pub fn slots_written(&self) -> u64 {
        self.vary
            .iter()
            .enumerate()
            .filter(|(_, row)| row.iter().any(Option::is_some))
            .fold(0, |acc, (i, _)| acc | (1 << i))
    }

    /// Records all components of a `store_output`, with its values
    /// remapped through `map`.
    pub fn record_store(&mut self, op: &Op, map: &ValueMap) {
        let Op::StoreOutput {
            slot,
            space,
            ty,
            comps,
            ..
        } = op
        else {
            panic!("record_store on a non-store operation");
        };
        for (c, v) in comps.iter().enumerate() {
            if let Some(v) = v {
                self.record(*space, *slot, c as u8, map.get(*v), *ty);
            }
        }
    }
}

/// Inlines `src` into `dst`, aggregating every plain (non-arrayed,
/// non-per-primitive) output store into `table` and substituting argument
/// loads per `args`.
///
/// This is the body walk of the vertex/tess-eval path; the geometry and
/// mesh paths intercept more operations and carry their own walks.
pub(crate) fn append_aggregating(
    dst: &mut FunctionBuilder,
    src: &Function,
    args: &HashMap<ShaderArg, ValueId>,
    table: &mut OutputTable,
) -> Result<ValueMap, Error> {
    let mut bad: Option<Error> = None;
    let map = append_function(dst, src, |dst, instr, map| match &instr.op {
        Op::StoreOutput { index: None, per_primitive: false, .. } => {
            table.record_store(&instr.op, map);
            Rewrite::Drop
        }
        Op::LoadArg { arg } => match args.get(arg) {
            Some(&v) => Rewrite::Replaced(Some(v)),
            None => {
                let ty = src.value_type(instr.result.unwrap_or_else(|| unreachable!()));
                let v = dst.load_arg(*arg, ty);
                Rewrite::Replaced(Some(v))
            }
        },
        op if op.is_abstract() => {
            if bad.is_none() {
                bad = Some(Error::Unsupported(
                    "geometry-stage operation in a vertex/tess-eval body",
                ));
            }
            Rewrite::Drop
        }
        _ => Rewrite::Keep,
    });
    match bad {
        Some(e) => Err(e),
        None => Ok(map),
    }
}

#[cfg(test)]
mod tests {
    use super::OutputTable;
    use navi_ir::{FunctionBuilder, IoSpace, ScalarType, Slot};

    #[test]
    fn merge_does_not_clobber_siblings() {
        let mut b = FunctionBuilder::new();
        let x = b.const_f32(1.0);
        let y = b.const_f32(2.0);
        let mut table = OutputTable::new();
        table.record(IoSpace::S32, Slot::var(0), 0, x, ScalarType::F32);
        table.record(IoSpace::S32, Slot::var(0), 2, y, ScalarType::F32);
        assert_eq!(table.write_mask(IoSpace::S32, Slot::var(0)), 0b101);
        // Re-writing component 0 is last-write-wins.
        table.record(IoSpace::S32, Slot::var(0), 0, y, ScalarType::F32);
        assert_eq!(
            table.get(IoSpace::S32, Slot::var(0), 0).unwrap().value,
            y
        );
        assert_eq!(table.write_mask(IoSpace::S32, Slot::var(0)), 0b101);
    }

    #[test]
    fn sixteen_bit_halves_are_distinct() {
        let mut b = FunctionBuilder::new();
        let v = b.const_f32(1.0);
        let mut table = OutputTable::new();
        table.record(IoSpace::Lo16, Slot(3), 1, v, ScalarType::F16);
        assert!(table.get(IoSpace::Hi16, Slot(3), 1).is_none());
        assert!(table.get(IoSpace::S32, Slot(3), 1).is_none());
        assert!(table.get(IoSpace::Lo16, Slot(3), 1).is_some());
    }
}
