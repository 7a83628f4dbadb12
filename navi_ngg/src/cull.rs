// Copyright 2026 the Navi Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Primitive culling math: back-face, frustum and small-primitive
//! rejection from clip-space positions.
//!
//! All comparisons are ordinary IEEE float32 comparisons. A NaN or Inf
//! determinant deliberately rejects nothing here; such primitives are
//! left for the fixed-function hardware to resolve so degenerate-but-
//! finite edge cases keep their hardware behavior.

use navi_ir::{FunctionBuilder, ScalarType, ShaderArg, ValueId};

use crate::options::runtime_flags;

/// Runtime culling state, loaded once from shader arguments.
#[derive(Clone, Debug)]
pub struct CullSettings {
    pub cull_front: ValueId,
    pub cull_back: ValueId,
    pub front_ccw: ValueId,
    pub small_prim_enable: ValueId,
    pub vp_scale: [ValueId; 2],
    pub vp_translate: [ValueId; 2],
    /// Rasterizer precision epsilon, derived by the driver from the
    /// sub-pixel precision bit count.
    pub small_prim_precision: ValueId,
    /// Half line width in NDC units per axis; only lines read these.
    pub half_line_width: [ValueId; 2],
}

impl CullSettings {
    pub fn from_args(b: &mut FunctionBuilder) -> Self {
        let flags = b.load_arg(ShaderArg::RuntimeFlags, ScalarType::U32);
        let zero = b.const_u32(0);
        let bit = |b: &mut FunctionBuilder, flag: u32| {
            let c = b.const_u32(flag);
            let masked = b.iand(flags, c);
            b.ine(masked, zero)
        };
        let cull_front = bit(b, runtime_flags::CULL_FRONT);
        let cull_back = bit(b, runtime_flags::CULL_BACK);
        let front_ccw = bit(b, runtime_flags::FRONT_CCW);
        let small_prim_enable = bit(b, runtime_flags::SMALL_PRIM_ENABLE);
        Self {
            cull_front,
            cull_back,
            front_ccw,
            small_prim_enable,
            vp_scale: [
                b.load_arg(ShaderArg::ViewportScaleX, ScalarType::F32),
                b.load_arg(ShaderArg::ViewportScaleY, ScalarType::F32),
            ],
            vp_translate: [
                b.load_arg(ShaderArg::ViewportTranslateX, ScalarType::F32),
                b.load_arg(ShaderArg::ViewportTranslateY, ScalarType::F32),
            ],
            small_prim_precision: b.load_arg(ShaderArg::SmallPrimPrecision, ScalarType::F32),
            half_line_width: [
                b.load_arg(ShaderArg::HalfLineWidthX, ScalarType::F32),
                b.load_arg(ShaderArg::HalfLineWidthY, ScalarType::F32),
            ],
        }
    }
}

/// Emits the accept/reject computation for one primitive of 2 or 3
/// clip-space vertices. Returns the per-lane accept bit.
///
/// If `on_accept` is provided it runs exactly once, in divergent control
/// flow gated on the accept bit, after all the math; the deferred-culling
/// orchestrator uses it to mark shared state for surviving primitives
/// only.
pub fn cull_primitive(
    b: &mut FunctionBuilder,
    settings: &CullSettings,
    positions: &[[ValueId; 4]],
    accept_in: ValueId,
    on_accept: Option<&mut dyn FnMut(&mut FunctionBuilder)>,
) -> ValueId {
    let num_vertices = positions.len();
    assert!(
        (2..=3).contains(&num_vertices),
        "point culling is not supported"
    );
    let zero = b.const_f32(0.0);

    // W sign classification. All-negative W means the primitive is
    // entirely behind the eye plane: rejected unconditionally. Any
    // negative W makes the bounding-box math unreliable, which disarms
    // the box-based rejections below.
    let mut w_neg = Vec::with_capacity(num_vertices);
    for pos in positions {
        w_neg.push(b.flt(pos[3], zero));
    }
    let mut any_w_neg = w_neg[0];
    let mut all_w_neg = w_neg[0];
    let mut w_parity = b.b2u(w_neg[0]);
    for &wn in &w_neg[1..] {
        any_w_neg = b.bor(any_w_neg, wn);
        all_w_neg = b.band(all_w_neg, wn);
        let u = b.b2u(wn);
        w_parity = b.ixor(w_parity, u);
    }
    let one_u = b.const_u32(1);
    let w_reflection = {
        let masked = b.iand(w_parity, one_u);
        b.ieq(masked, one_u)
    };

    // Projected positions.
    let mut ndc = Vec::with_capacity(num_vertices);
    for pos in positions {
        let x = b.fdiv(pos[0], pos[3]);
        let y = b.fdiv(pos[1], pos[3]);
        ndc.push([x, y]);
    }

    let not_all_behind = b.bnot(all_w_neg);
    let mut accept = b.band(accept_in, not_all_behind);

    // Face culling, triangles only: signed double area via the 2D cross
    // product, sign-corrected for reflected (negative-W) primitives. A
    // zero-area triangle is degenerate and always rejected; a NaN area
    // matches neither sign and falls through.
    if num_vertices == 3 {
        let e0x = b.fsub(ndc[1][0], ndc[0][0]);
        let e0y = b.fsub(ndc[1][1], ndc[0][1]);
        let e1x = b.fsub(ndc[2][0], ndc[0][0]);
        let e1y = b.fsub(ndc[2][1], ndc[0][1]);
        let t0 = b.fmul(e0x, e1y);
        let t1 = b.fmul(e0y, e1x);
        let det_raw = b.fsub(t0, t1);
        let det_neg = b.fneg(det_raw);
        let det = b.select(w_reflection, det_neg, det_raw);

        let is_pos = b.fgt(det, zero);
        let is_neg = b.flt(det, zero);
        let is_zero = b.feq(det, zero);
        // Winding convention maps the sign to facedness.
        let ccw_front = settings.front_ccw;
        let cw_front = b.bnot(ccw_front);
        let front = {
            let a = b.band(ccw_front, is_pos);
            let c = b.band(cw_front, is_neg);
            b.bor(a, c)
        };
        let back = {
            let a = b.band(ccw_front, is_neg);
            let c = b.band(cw_front, is_pos);
            b.bor(a, c)
        };
        let face_reject = {
            let f = b.band(front, settings.cull_front);
            let k = b.band(back, settings.cull_back);
            let fr = b.bor(f, k);
            b.bor(fr, is_zero)
        };
        let keep = b.bnot(face_reject);
        accept = b.band(accept, keep);
    }

    // NDC bounding box; lines are inflated by the half line width.
    let mut min = ndc[0];
    let mut max = ndc[0];
    for p in &ndc[1..] {
        min[0] = b.fmin(min[0], p[0]);
        min[1] = b.fmin(min[1], p[1]);
        max[0] = b.fmax(max[0], p[0]);
        max[1] = b.fmax(max[1], p[1]);
    }
    if num_vertices == 2 {
        for axis in 0..2 {
            min[axis] = b.fsub(min[axis], settings.half_line_width[axis]);
            max[axis] = b.fadd(max[axis], settings.half_line_width[axis]);
        }
    }

    // Frustum: reject a box entirely outside [-1, 1] on either axis.
    let neg_one = b.const_f32(-1.0);
    let pos_one = b.const_f32(1.0);
    let frustum_reject = {
        let a = b.flt(max[0], neg_one);
        let c = b.fgt(min[0], pos_one);
        let d = b.flt(max[1], neg_one);
        let e = b.fgt(min[1], pos_one);
        let ac = b.bor(a, c);
        let de = b.bor(d, e);
        b.bor(ac, de)
    };

    // Small-primitive filter in screen space. The box, inflated by the
    // precision epsilon and with both corners rounded to the nearest
    // integer, collapsing to a single integer point means no sample
    // point can land inside. Lines are tested in 45-degree-rotated
    // coordinates: the diamond-exit rule fills nothing a rotated box
    // collapse would keep, while an axis-aligned box over a thin
    // diagonal line stays conservatively large.
    let small_reject = {
        let to_screen = |b: &mut FunctionBuilder, v: [ValueId; 2]| {
            let sx = b.fmul(v[0], settings.vp_scale[0]);
            let x = b.fadd(sx, settings.vp_translate[0]);
            let sy = b.fmul(v[1], settings.vp_scale[1]);
            let y = b.fadd(sy, settings.vp_translate[1]);
            [x, y]
        };
        let (bmin, bmax) = if num_vertices == 2 {
            let p0 = to_screen(b, ndc[0]);
            let p1 = to_screen(b, ndc[1]);
            let r0 = [b.fadd(p0[0], p0[1]), b.fsub(p0[0], p0[1])];
            let r1 = [b.fadd(p1[0], p1[1]), b.fsub(p1[0], p1[1])];
            (
                [b.fmin(r0[0], r1[0]), b.fmin(r0[1], r1[1])],
                [b.fmax(r0[0], r1[0]), b.fmax(r0[1], r1[1])],
            )
        } else {
            (to_screen(b, min), to_screen(b, max))
        };
        let eps = settings.small_prim_precision;
        let collapse = {
            let mut collapse = None;
            for axis in 0..2 {
                let lo = b.fsub(bmin[axis], eps);
                let hi = b.fadd(bmax[axis], eps);
                let rlo = b.fround(lo);
                let rhi = b.fround(hi);
                let same = b.feq(rlo, rhi);
                collapse = Some(match collapse {
                    None => same,
                    Some(prev) => b.band(prev, same),
                });
            }
            collapse.unwrap_or_else(|| b.const_bool(false))
        };
        b.band(settings.small_prim_enable, collapse)
    };

    // Box-based rejection is unreliable with any vertex behind the eye
    // plane; such primitives are conservatively kept for the clipper.
    let box_reject = b.bor(frustum_reject, small_reject);
    let box_ok = {
        let no = b.bnot(box_reject);
        b.bor(no, any_w_neg)
    };
    accept = b.band(accept, box_ok);

    if let Some(on_accept) = on_accept {
        b.if_(accept);
        on_accept(b);
        b.end_if();
    }
    accept
}
