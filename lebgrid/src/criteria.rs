//! Per-tet refinement criteria for the three complex modalities.
//!
//! Each criterion inspects the function values and gradients at the four
//! corners of one tet and decides whether the tet intersects the implicit
//! complex (`is_active`) and whether linear interpolation inside it is not
//! yet trustworthy (`needs_split`). Interval reasoning is closed; every tie
//! resolves as active.

use nalgebra::{Matrix3, Matrix4, RowVector4, Vector3, Vector4};
use smallvec::SmallVec;

use crate::types::{FuncTable, Interval, Vertex3, FUNC_INLINE};

/// Relative tolerance of the rank decisions in the feasibility solves.
const RANK_EPS: f64 = 1e-12;

/// Slack on barycentric sign checks; boundary contacts count as inside.
const BARY_TOL: f64 = 1e-9;

/// Result of a refinement criterion on one tet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CritOutcome {
    pub needs_split: bool,
    pub is_active: bool,
}

impl CritOutcome {
    const INACTIVE: Self = Self {
        needs_split: false,
        is_active: false,
    };
}

/// Counts of the executed pair and triple interaction tests.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckCounters {
    pub two_func: u64,
    pub three_func: u64,
}

/// Root interval and active leaf indices returned by a CSG evaluator.
#[derive(Clone, Debug)]
pub struct CsgOutcome {
    pub interval: Interval,
    pub active_functions: SmallVec<[usize; FUNC_INLINE]>,
}

type ActiveSet = SmallVec<[usize; FUNC_INLINE]>;

/// Summary of one scalar field over one tet: corner values, the
/// quadratic-bound deviation of the linear interpolant, and the gradient
/// scale that converts the user threshold into value space.
#[derive(Clone, Debug)]
struct FuncSummary {
    values: [f64; 4],
    deviation: f64,
    grad_scale: f64,
}

impl FuncSummary {
    fn new(pts: &[Vertex3; 4], corners: &[&FuncTable; 4], f: usize) -> Self {
        let quads = [corners[0][f], corners[1][f], corners[2][f], corners[3][f]];
        Self::from_quads(pts, &quads)
    }

    /// Summary of the difference field `f - g`; pairwise MI tests run on it.
    fn difference(pts: &[Vertex3; 4], corners: &[&FuncTable; 4], f: usize, g: usize) -> Self {
        let quads = [
            corners[0][f] - corners[0][g],
            corners[1][f] - corners[1][g],
            corners[2][f] - corners[2][g],
            corners[3][f] - corners[3][g],
        ];
        Self::from_quads(pts, &quads)
    }

    fn from_quads(pts: &[Vertex3; 4], quads: &[RowVector4<f64>; 4]) -> Self {
        let values = [quads[0][0], quads[1][0], quads[2][0], quads[3][0]];
        let mut mismatch: f64 = 0.0;
        let mut grad_scale: f64 = 0.0;
        for i in 0..4 {
            let gi = Vector3::new(quads[i][1], quads[i][2], quads[i][3]);
            grad_scale = grad_scale.max(gi.norm());
            for j in 0..4 {
                if j == i {
                    continue;
                }
                let edge = Vector3::new(
                    pts[j][0] - pts[i][0],
                    pts[j][1] - pts[i][1],
                    pts[j][2] - pts[i][2],
                );
                mismatch = mismatch.max((values[j] - values[i] - gi.dot(&edge)).abs());
            }
        }
        // The one-sided Hermite mismatch equals e^T H e / 2 for quadratics,
        // whose linear-interpolation error peaks at a quarter of that at the
        // edge midpoint. Affine fields score exactly 0.
        Self {
            values,
            deviation: mismatch / 4.0,
            grad_scale,
        }
    }

    /// Conservative value range over the tet.
    fn interval(&self) -> Interval {
        let lo = self.values.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = self.values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        [lo - self.deviation, hi + self.deviation]
    }

    fn crosses_zero(&self) -> bool {
        let [lo, hi] = self.interval();
        lo <= 0.0 && hi >= 0.0
    }

    /// Whether the interpolation error is out of tolerance; the threshold is
    /// a geometric tolerance, scaled into value space by the gradient.
    fn exceeds(&self, threshold: f64) -> bool {
        self.deviation > threshold * self.grad_scale
    }
}

fn corner_scale(values: &[f64; 4]) -> f64 {
    values.iter().fold(0.0f64, |m, v| m.max(v.abs()))
}

impl FuncSummary {
    /// Barycentric slack of the zero-set position: the deviation band in
    /// units of the normalized corner values.
    fn bary_slack(&self) -> f64 {
        let scale = corner_scale(&self.values);
        if scale > 0.0 {
            self.deviation / scale
        } else {
            0.0
        }
    }
}

/// Whether the zero bands of two interpolants meet inside the tet.
///
/// In barycentric coordinates the constraints are `sum l = 1`,
/// `sum l_k f_k = 0`, `sum l_k g_k = 0`; the solution line of the 3x4
/// system is clipped against `l >= -slack`, where the slack widens with the
/// deviation bands of both fields. Rank-deficient systems resolve as
/// feasible, extending the tie-as-active convention to the geometry tests.
fn pair_feasible(f: &FuncSummary, g: &FuncSummary) -> bool {
    let sf = corner_scale(&f.values);
    let sg = corner_scale(&g.values);
    if sf == 0.0 || sg == 0.0 {
        // A field vanishing at all corners covers the tet with its zero set.
        return true;
    }
    let tol = BARY_TOL + f.bary_slack() + g.bary_slack();
    let cols: [Vector3<f64>; 4] =
        core::array::from_fn(|k| Vector3::new(1.0, f.values[k] / sf, g.values[k] / sg));

    // Null direction by cofactor expansion over the four columns.
    let mut null = Vector4::zeros();
    for k in 0..4 {
        let mut others = [Vector3::zeros(); 3];
        let mut n = 0;
        for (c, col) in cols.iter().enumerate() {
            if c != k {
                others[n] = *col;
                n += 1;
            }
        }
        let det = Matrix3::from_columns(&others).determinant();
        null[k] = if k % 2 == 0 { det } else { -det };
    }
    let pivot = (0..4).fold(0, |best, k| {
        if null[k].abs() > null[best].abs() {
            k
        } else {
            best
        }
    });
    if null[pivot].abs() <= RANK_EPS {
        return true;
    }

    // Particular solution with l_pivot = 0.
    let mut idx = [0usize; 3];
    let mut n = 0;
    for c in 0..4 {
        if c != pivot {
            idx[n] = c;
            n += 1;
        }
    }
    let m = Matrix3::from_columns(&[cols[idx[0]], cols[idx[1]], cols[idx[2]]]);
    let Some(sol) = m.lu().solve(&Vector3::new(1.0, 0.0, 0.0)) else {
        return true;
    };
    let mut lambda = [0.0f64; 4];
    for (s, &c) in idx.iter().enumerate() {
        lambda[c] = sol[s];
    }

    // Clip l(t) = lambda + t * null against l >= -tol.
    let mut lo = f64::NEG_INFINITY;
    let mut hi = f64::INFINITY;
    for k in 0..4 {
        let dir = null[k];
        let base = lambda[k];
        if dir.abs() <= RANK_EPS {
            if base < -tol {
                return false;
            }
        } else if dir > 0.0 {
            lo = lo.max((-tol - base) / dir);
        } else {
            hi = hi.min((-tol - base) / dir);
        }
    }
    lo <= hi
}

/// Whether the zero bands of three interpolants share a point inside the
/// tet (the 4x4 barycentric solve; singular systems are feasible).
fn triple_feasible(f: &FuncSummary, g: &FuncSummary, h: &FuncSummary) -> bool {
    let sf = corner_scale(&f.values);
    let sg = corner_scale(&g.values);
    let sh = corner_scale(&h.values);
    if sf == 0.0 || sg == 0.0 || sh == 0.0 {
        return true;
    }
    let tol = BARY_TOL + f.bary_slack() + g.bary_slack() + h.bary_slack();
    let m = Matrix4::from_rows(&[
        RowVector4::new(1.0, 1.0, 1.0, 1.0),
        RowVector4::from_row_slice(&f.values.map(|v| v / sf)),
        RowVector4::from_row_slice(&g.values.map(|v| v / sg)),
        RowVector4::from_row_slice(&h.values.map(|v| v / sh)),
    ]);
    match m.lu().solve(&Vector4::new(1.0, 0.0, 0.0, 0.0)) {
        Some(lambda) => lambda.iter().all(|&l| l >= -tol),
        None => true,
    }
}

/// Pair and triple interaction tests shared by the IA and CSG criteria.
fn surface_interactions(
    summaries: &[FuncSummary],
    crossing: &[usize],
    threshold: f64,
    counters: &mut CheckCounters,
    needs_split: &mut bool,
) {
    for (i, &f) in crossing.iter().enumerate() {
        for &g in &crossing[i + 1..] {
            counters.two_func += 1;
            if pair_feasible(&summaries[f], &summaries[g])
                && (summaries[f].exceeds(threshold) || summaries[g].exceeds(threshold))
            {
                *needs_split = true;
            }
        }
    }
    for (i, &f) in crossing.iter().enumerate() {
        for (j, &g) in crossing.iter().enumerate().skip(i + 1) {
            for &h in &crossing[j + 1..] {
                counters.three_func += 1;
                if triple_feasible(&summaries[f], &summaries[g], &summaries[h])
                    && (summaries[f].exceeds(threshold)
                        || summaries[g].exceeds(threshold)
                        || summaries[h].exceeds(threshold))
                {
                    *needs_split = true;
                }
            }
        }
    }
}

/// Implicit-arrangement criterion: the tet is active when any function's
/// conservative range crosses zero; it needs a split while any crossing
/// surface, intersection curve or triple point is under-resolved.
pub fn crit_ia(
    pts: &[Vertex3; 4],
    corners: &[&FuncTable; 4],
    num_functions: usize,
    threshold: f64,
    curve_network: bool,
    counters: &mut CheckCounters,
) -> CritOutcome {
    let mut summaries: SmallVec<[FuncSummary; FUNC_INLINE]> = SmallVec::new();
    let mut crossing: ActiveSet = SmallVec::new();
    for f in 0..num_functions {
        let s = FuncSummary::new(pts, corners, f);
        if s.crosses_zero() {
            crossing.push(f);
        }
        summaries.push(s);
    }
    if crossing.is_empty() {
        return CritOutcome::INACTIVE;
    }

    let mut needs_split = false;
    if !curve_network {
        needs_split = crossing.iter().any(|&f| summaries[f].exceeds(threshold));
    }
    surface_interactions(&summaries, &crossing, threshold, counters, &mut needs_split);
    CritOutcome {
        needs_split,
        is_active: true,
    }
}

/// Material-interface criterion: the tet is active when the dominant
/// function is not the same at all four corners (ties are active); the
/// split tests run on pairwise difference fields of the candidate labels.
pub fn crit_mi(
    pts: &[Vertex3; 4],
    corners: &[&FuncTable; 4],
    num_functions: usize,
    threshold: f64,
    curve_network: bool,
    counters: &mut CheckCounters,
) -> CritOutcome {
    if num_functions < 2 {
        return CritOutcome::INACTIVE;
    }

    // Corner label sets: every function attaining the corner maximum.
    let mut candidates: ActiveSet = SmallVec::new();
    let mut common: ActiveSet = (0..num_functions).collect();
    let mut tied = false;
    for corner in corners {
        let max = (0..num_functions).fold(f64::NEG_INFINITY, |m, f| m.max(corner[f][0]));
        let labels: ActiveSet = (0..num_functions)
            .filter(|&f| corner[f][0] == max)
            .collect();
        tied |= labels.len() > 1;
        for &f in &labels {
            if !candidates.contains(&f) {
                candidates.push(f);
            }
        }
        common.retain(|f| labels.contains(f));
    }
    if !tied && !common.is_empty() {
        return CritOutcome::INACTIVE;
    }

    let mut needs_split = false;
    let mut diffs: SmallVec<[(usize, usize, FuncSummary); FUNC_INLINE]> = SmallVec::new();
    for (i, &f) in candidates.iter().enumerate() {
        for &g in &candidates[i + 1..] {
            counters.two_func += 1;
            let d = FuncSummary::difference(pts, corners, f, g);
            // An interface between two labels is codimension 1; in curve
            // network mode only the triple junctions below may split.
            if !curve_network && d.crosses_zero() && d.exceeds(threshold) {
                needs_split = true;
            }
            diffs.push((f, g, d));
        }
    }
    fn diff_of(diffs: &[(usize, usize, FuncSummary)], f: usize, g: usize) -> &FuncSummary {
        diffs
            .iter()
            .find(|(a, b, _)| (*a == f && *b == g) || (*a == g && *b == f))
            .map(|(_, _, d)| d)
            .expect("difference summaries cover all candidate pairs")
    }
    for (i, &f) in candidates.iter().enumerate() {
        for (j, &g) in candidates.iter().enumerate().skip(i + 1) {
            for &h in &candidates[j + 1..] {
                counters.three_func += 1;
                let dfg = diff_of(&diffs, f, g);
                let dfh = diff_of(&diffs, f, h);
                let dgh = diff_of(&diffs, g, h);
                if pair_feasible(dfg, dfh)
                    && (dfg.exceeds(threshold)
                        || dfh.exceeds(threshold)
                        || dgh.exceeds(threshold))
                {
                    needs_split = true;
                }
            }
        }
    }
    CritOutcome {
        needs_split,
        is_active: true,
    }
}

/// CSG criterion: per-function intervals are combined by the opaque
/// evaluator; activeness follows the root interval and the split tests are
/// restricted to the evaluator's active functions.
pub fn crit_csg(
    pts: &[Vertex3; 4],
    corners: &[&FuncTable; 4],
    num_functions: usize,
    csg_eval: &dyn Fn(&[Interval]) -> CsgOutcome,
    threshold: f64,
    curve_network: bool,
    counters: &mut CheckCounters,
) -> CritOutcome {
    let mut summaries: SmallVec<[FuncSummary; FUNC_INLINE]> = SmallVec::new();
    let mut intervals: SmallVec<[Interval; FUNC_INLINE]> = SmallVec::new();
    for f in 0..num_functions {
        let s = FuncSummary::new(pts, corners, f);
        intervals.push(s.interval());
        summaries.push(s);
    }
    let outcome = csg_eval(&intervals);
    let [lo, hi] = outcome.interval;
    if !(lo <= 0.0 && hi >= 0.0) {
        return CritOutcome::INACTIVE;
    }

    let crossing: ActiveSet = outcome
        .active_functions
        .iter()
        .copied()
        .filter(|&f| f < num_functions && summaries[f].crosses_zero())
        .collect();
    let mut needs_split = false;
    if !curve_network {
        needs_split = crossing.iter().any(|&f| summaries[f].exceeds(threshold));
    }
    surface_interactions(&summaries, &crossing, threshold, counters, &mut needs_split);
    CritOutcome {
        needs_split,
        is_active: true,
    }
}
