// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Compile-time lowering configuration.
//!
//! Everything here is decided when the shader is compiled. The few
//! per-draw toggles (culling on/off, face-cull settings, small-primitive
//! filtering) are *runtime* state instead: the same compiled shader reads
//! them from the [`ShaderArg::RuntimeFlags`] argument so a draw call can
//! flip them without recompiling.

use navi_ir::Slot;

/// Hardware generation. Each value changes concrete bit layouts and
/// workarounds; see [`crate::export::misc_vec_layout`] for the packed
/// position-export differences.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum GfxLevel {
    Gfx9,
    Gfx10,
    Gfx103,
    Gfx11,
}

impl GfxLevel {
    /// Whether the packed-byte prefix sum of the repacker can use the
    /// `dot_u8` accumulating dot product; earlier generations use the
    /// shift + `sad_u8` form.
    pub fn has_packed_dot_prefix(self) -> bool {
        self >= Self::Gfx103
    }

    /// Parameter outputs go through the attribute ring instead of
    /// parameter exports.
    pub fn has_attr_ring(self) -> bool {
        self >= Self::Gfx11
    }

    /// A workgroup that allocates zero export space hangs this
    /// generation; a degenerate dummy export must be issued instead.
    pub fn needs_zero_prim_workaround(self) -> bool {
        self == Self::Gfx10
    }

    /// Rasterization may begin as soon as position and primitive exports
    /// complete, racing ahead of the shader's buffer writes; a device
    /// release is required before the final export when nothing later
    /// orders those writes.
    pub fn needs_pre_raster_release(self) -> bool {
        self >= Self::Gfx10
    }
}

/// SIMT wave width.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WaveSize {
    W32,
    W64,
}

impl WaveSize {
    pub const fn lanes(self) -> u32 {
        match self {
            Self::W32 => 32,
            Self::W64 => 64,
        }
    }
}

/// Bit assignments of [`ShaderArg::RuntimeFlags`].
///
/// [`ShaderArg::RuntimeFlags`]: navi_ir::ShaderArg::RuntimeFlags
pub mod runtime_flags {
    /// Primitive culling runs at all; when clear the shader takes the
    /// trivial export-everything branch.
    pub const CULL_ENABLE: u32 = 1 << 0;
    pub const CULL_FRONT: u32 = 1 << 1;
    pub const CULL_BACK: u32 = 1 << 2;
    /// Counter-clockwise winding is front-facing.
    pub const FRONT_CCW: u32 = 1 << 3;
    pub const SMALL_PRIM_ENABLE: u32 = 1 << 4;
    /// The provoking vertex is the last vertex of the primitive.
    pub const PROVOKING_LAST: u32 = 1 << 5;
}

/// Mapping from output slots to parameter-export indices in 0..32.
///
/// Multiple slots may alias to the same index; the export builder
/// deduplicates and emits one export per index, keeping the first slot.
#[derive(Clone, Debug)]
pub struct ParamMap {
    offsets: [i8; Slot::COUNT],
}

impl Default for ParamMap {
    fn default() -> Self {
        Self::empty()
    }
}

impl ParamMap {
    pub fn empty() -> Self {
        Self {
            offsets: [-1; Slot::COUNT],
        }
    }

    /// Assigns sequential indices to every written generic varying, in
    /// slot order, followed by the special slots a pixel shader may read.
    pub fn assign_defaults(outputs_written: u64) -> Self {
        let mut map = Self::empty();
        let mut next = 0_u8;
        for s in Slot::VAR0.0..Slot::COUNT as u8 {
            let slot = Slot(s);
            if outputs_written & slot.bit() != 0 {
                map.set(slot, next);
                next += 1;
            }
        }
        for slot in [Slot::LAYER, Slot::VIEWPORT, Slot::PRIM_ID] {
            if outputs_written & slot.bit() != 0 {
                map.set(slot, next);
                next += 1;
            }
        }
        map
    }

    pub fn set(&mut self, slot: Slot, index: u8) {
        debug_assert!(index < 32);
        self.offsets[slot.index()] = index as i8;
    }

    pub fn get(&self, slot: Slot) -> Option<u8> {
        let v = self.offsets[slot.index()];
        (v >= 0).then_some(v as u8)
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.iter().all(|&v| v < 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Slot, u8)> + '_ {
        self.offsets
            .iter()
            .enumerate()
            .filter_map(|(i, &v)| (v >= 0).then(|| (Slot(i as u8), v as u8)))
    }
}

/// Parameter-export mapping of the 16-bit low/high slot pairs, indexed
/// 0..16. Both halves of a pair share one export: low bits in \[15:0\],
/// high bits in \[31:16\] of each channel, the packing the hardware
/// transport expects.
#[derive(Clone, Debug)]
pub struct ParamMap16 {
    offsets: [i8; 16],
}

impl Default for ParamMap16 {
    fn default() -> Self {
        Self::empty()
    }
}

impl ParamMap16 {
    pub fn empty() -> Self {
        Self { offsets: [-1; 16] }
    }

    pub fn set(&mut self, pair: u8, index: u8) {
        debug_assert!(index < 32);
        self.offsets[pair as usize] = index as i8;
    }

    pub fn get(&self, pair: u8) -> Option<u8> {
        let v = self.offsets[pair as usize];
        (v >= 0).then_some(v as u8)
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.iter().all(|&v| v < 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.offsets
            .iter()
            .enumerate()
            .filter_map(|(i, &v)| (v >= 0).then(|| (i as u8, v as u8)))
    }
}

/// One bound transform-feedback buffer.
#[derive(Copy, Clone, Debug)]
pub struct XfbBuffer {
    /// Per-vertex stride in bytes.
    pub stride: u32,
    /// The vertex stream this buffer captures.
    pub stream: u8,
}

/// One captured scalar component.
#[derive(Copy, Clone, Debug)]
pub struct XfbOutput {
    pub buffer: u8,
    /// Byte offset within a captured vertex.
    pub offset: u32,
    pub slot: Slot,
    pub comp: u8,
    pub stream: u8,
    /// Source value is a 16-bit varying and must be widened before the
    /// write; transform feedback targets disallow sub-32-bit components.
    pub is_16bit: bool,
}

/// Transform-feedback configuration.
#[derive(Clone, Default, Debug)]
pub struct XfbInfo {
    pub buffers: [Option<XfbBuffer>; 4],
    pub outputs: Vec<XfbOutput>,
}

impl XfbInfo {
    /// Captured bytes per primitive for the given buffer.
    pub fn prim_stride(&self, buffer: usize, prim_vertices: u32) -> u32 {
        self.buffers[buffer]
            .map(|b| b.stride * prim_vertices)
            .unwrap_or(0)
    }
}

/// Compile-time options of the vertex/tess-eval and geometry NGG paths.
#[derive(Clone, Debug)]
pub struct NggOptions {
    pub gfx_level: GfxLevel,
    pub wave_size: WaveSize,
    /// Hardware workgroup size, at most 256.
    pub workgroup_size: u32,
    /// Vertices per input primitive (1, 2 or 3).
    pub prim_vertices: u32,
    /// Build the deferred-culling code path. Whether it actually runs is
    /// the `CULL_ENABLE` runtime flag.
    pub can_cull: bool,
    /// No culling, no streamout, no repacking: primitives are exported
    /// exactly as the hardware delivered them.
    pub passthrough: bool,
    pub xfb: Option<XfbInfo>,
    /// Route the input primitive id to a parameter export for the pixel
    /// shader.
    pub export_primitive_id: bool,
    /// Fold per-vertex edge flags into the primitive export.
    pub has_edge_flags: bool,
    /// Force a variable-rate-shading rate in the position export.
    pub force_vrs: bool,
    /// Export the view index as the layer.
    pub multiview: bool,
    pub has_gen_prim_query: bool,
    pub has_pipeline_stats_query: bool,
    /// Enabled clip/cull distance planes, one bit each for 8 distances.
    pub clip_cull_mask: u8,
    pub param_map: ParamMap,
    pub param_map_16: ParamMap16,
}

impl NggOptions {
    pub fn new(gfx_level: GfxLevel, wave_size: WaveSize, workgroup_size: u32) -> Self {
        Self {
            gfx_level,
            wave_size,
            workgroup_size,
            prim_vertices: 3,
            can_cull: false,
            passthrough: false,
            xfb: None,
            export_primitive_id: false,
            has_edge_flags: false,
            force_vrs: false,
            multiview: false,
            has_gen_prim_query: false,
            has_pipeline_stats_query: false,
            clip_cull_mask: 0,
            param_map: ParamMap::empty(),
            param_map_16: ParamMap16::empty(),
        }
    }

    pub fn num_waves(&self) -> u32 {
        self.workgroup_size.div_ceil(self.wave_size.lanes())
    }
}

/// Compile-time options of the mesh-shader path.
#[derive(Clone, Debug)]
pub struct MeshOptions {
    pub gfx_level: GfxLevel,
    pub wave_size: WaveSize,
    /// Hardware workgroup size, at most 256; may exceed the API-declared
    /// size, in which case the surplus invocations idle through the
    /// shader's barriers.
    pub workgroup_size: u32,
    pub clip_cull_mask: u8,
    pub param_map: ParamMap,
    pub multiview: bool,
    pub force_vrs: bool,
    pub has_pipeline_stats_query: bool,
}

impl MeshOptions {
    pub fn new(gfx_level: GfxLevel, wave_size: WaveSize, workgroup_size: u32) -> Self {
        Self {
            gfx_level,
            wave_size,
            workgroup_size,
            clip_cull_mask: 0,
            param_map: ParamMap::empty(),
            multiview: false,
            force_vrs: false,
            has_pipeline_stats_query: false,
        }
    }

    pub fn num_waves(&self) -> u32 {
        self.workgroup_size.div_ceil(self.wave_size.lanes())
    }
}

#[cfg(test)]
mod tests {
    use super::ParamMap;
    use navi_ir::Slot;

    #[test]
    fn default_param_assignment_is_dense() {
        let written = Slot::var(0).bit() | Slot::var(3).bit() | Slot::LAYER.bit();
        let map = ParamMap::assign_defaults(written);
        assert_eq!(map.get(Slot::var(0)), Some(0));
        assert_eq!(map.get(Slot::var(3)), Some(1));
        assert_eq!(map.get(Slot::LAYER), Some(2));
        assert_eq!(map.get(Slot::var(1)), None);
    }
}
