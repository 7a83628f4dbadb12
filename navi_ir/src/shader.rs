// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::instr::{Instr, Op};
use crate::types::{ScalarType, ValueId};

/// Shading stage of the input program.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Stage {
    Vertex,
    TessEval,
    Geometry,
    Mesh,
}

/// Static metadata of a geometry-shader program.
#[derive(Copy, Clone, Debug)]
pub struct GsInfo {
    /// Declared maximum number of output vertices per invocation.
    pub max_out_vertices: u32,
    /// Vertices per output primitive (1 = points, 2 = lines,
    /// 3 = triangles); output topologies are strips, so every vertex past
    /// the first `out_prim_vertices - 1` completes a primitive.
    pub out_prim_vertices: u32,
    /// Bitmask of active vertex streams.
    pub active_streams: u8,
    /// Per-stream bitmask of the output slots belonging to that stream.
    pub stream_slots: [u64; 4],
}

/// Static metadata of a mesh-shader program.
#[derive(Copy, Clone, Debug)]
pub struct MeshInfo {
    pub max_vertices: u32,
    pub max_primitives: u32,
    /// Vertices per output primitive.
    pub prim_vertices: u32,
    /// The workgroup size the API declared, which may be smaller than the
    /// size the hardware launches.
    pub api_workgroup_size: u32,
    /// Output slots accessed with a dynamic index or from an invocation
    /// other than the writer; these cannot live in plain registers.
    pub cross_invocation_outputs: u64,
}

/// Static metadata consumed from the IR substrate: declared output masks,
/// workgroup size, stage kind.
#[derive(Copy, Clone, Debug)]
pub struct ShaderInfo {
    pub stage: Stage,
    /// Hardware workgroup size, at most 256.
    pub workgroup_size: u32,
    /// Bitmask over [`Slot`](crate::Slot) of written 32-bit outputs.
    pub outputs_written: u64,
    /// Written 16-bit low-half slots, indexed 0..16.
    pub outputs_written_16bit_lo: u16,
    /// Written 16-bit high-half slots, indexed 0..16.
    pub outputs_written_16bit_hi: u16,
    pub gs: Option<GsInfo>,
    pub mesh: Option<MeshInfo>,
}

impl ShaderInfo {
    pub fn new(stage: Stage, workgroup_size: u32) -> Self {
        Self {
            stage,
            workgroup_size,
            outputs_written: 0,
            outputs_written_16bit_lo: 0,
            outputs_written_16bit_hi: 0,
            gs: None,
            mesh: None,
        }
    }
}

/// A function body: a flat instruction stream with structured control-flow
/// markers, plus the per-value type table.
#[derive(Clone, Debug)]
pub struct Function {
    pub(crate) instrs: Vec<Instr>,
    pub(crate) value_types: Vec<ScalarType>,
    pub(crate) var_types: Vec<ScalarType>,
}

impl Function {
    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    pub fn value_type(&self, value: ValueId) -> ScalarType {
        self.value_types[value.index()]
    }

    pub fn num_values(&self) -> usize {
        self.value_types.len()
    }

    pub fn num_vars(&self) -> usize {
        self.var_types.len()
    }

    pub(crate) fn var_types(&self) -> &[ScalarType] {
        &self.var_types
    }

    /// Whether any abstract I/O operation is still present.
    pub fn has_abstract_ops(&self) -> bool {
        self.instrs.iter().any(|i| i.op.is_abstract())
    }

    /// Iterates instructions matching `pred` together with their indices.
    pub fn find_ops<'a>(&'a self, pred: impl Fn(&Op) -> bool + 'a) -> impl Iterator<Item = usize> + 'a {
        self.instrs
            .iter()
            .enumerate()
            .filter_map(move |(i, instr)| pred(&instr.op).then_some(i))
    }
}

/// A shader program handed to (or produced by) a lowering pass.
#[derive(Clone, Debug)]
pub struct Shader {
    pub info: ShaderInfo,
    pub function: Function,
}
