//! The adaptive longest-edge-bisection refinement engine.
//!
//! A max-heap of `(squared length, edge)` entries drives strictly sequential
//! refinement: pop the longest candidate edge, drop it if a split already
//! retired it, optionally defer to longer edges of surrounding active tets
//! (the alpha quality rule), otherwise bisect and push the longest edges of
//! the two new rings.

use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use rayon::prelude::*;

use crate::criteria::{crit_csg, crit_ia, crit_mi, CheckCounters, CritOutcome, CsgOutcome};
use crate::error::GridError;
use crate::quality::radius_ratio;
use crate::tetmesh::{EdgeId, TetId, TetMesh, VertexId};
use crate::types::{FuncTable, Interval, Vertex3};

/// Modality of the implicit complex.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Implicit arrangement: the zero sets of all functions.
    ImplicitArrangement,
    /// Material interface: the loci where the dominant function changes.
    MaterialInterface,
    /// Constructive solid geometry over the functions.
    Csg,
}

impl std::str::FromStr for Mode {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, GridError> {
        match s {
            "IA" => Ok(Self::ImplicitArrangement),
            "MI" => Ok(Self::MaterialInterface),
            "CSG" => Ok(Self::Csg),
            other => Err(GridError::UnknownMode(other.to_string())),
        }
    }
}

/// Evaluates all implicit functions (value and gradient) at a point.
pub type FuncEval<'a> = &'a (dyn Fn(Vertex3) -> FuncTable + Sync);

/// Combines per-function value intervals through a CSG tree.
pub type CsgEval<'a> = &'a dyn Fn(&[Interval]) -> CsgOutcome;

/// Settings of one refinement run.
#[derive(Clone, Debug)]
pub struct RefineOptions {
    pub mode: Mode,
    pub num_functions: usize,
    /// Geometric error tolerance; smaller refines further.
    pub threshold: f64,
    /// Quality feedback factor; +inf disables the feedback. Values below 1
    /// make an edge defer to itself and never terminate.
    pub alpha: f64,
    /// Element budget; the loop stops once the tet count exceeds it.
    pub max_elements: usize,
    /// Refinement floor: edges at or below this length are not enqueued.
    pub smallest_edge: f64,
    /// Restrict refinement to the codimension-2 locus of the complex.
    pub curve_network: bool,
}

impl RefineOptions {
    pub fn new(mode: Mode, num_functions: usize, threshold: f64) -> Self {
        Self {
            mode,
            num_functions,
            threshold,
            alpha: f64::INFINITY,
            max_elements: usize::MAX,
            smallest_edge: 0.0,
            curve_network: false,
        }
    }
}

/// Outcome of a refinement run.
#[derive(Debug)]
pub struct RefineMetrics {
    pub total_tet: usize,
    pub active_tet: usize,
    pub min_radius_ratio: f64,
    /// Worst radius ratio among active tets.
    pub active_radius_ratio: f64,
    pub two_func_check: u64,
    pub three_func_check: u64,
    /// Whether the run stopped at `max_elements` (normal termination).
    pub budget_exhausted: bool,
    pub total_seconds: f64,
    /// Live active tets, in mesh iteration order.
    pub active_tets: Vec<TetId>,
    /// Function values and gradients of every evaluated vertex.
    pub vertex_values: HashMap<VertexId, FuncTable>,
}

#[derive(Copy, Clone, Debug)]
struct QueueEntry {
    length_sq: f64,
    edge: EdgeId,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.length_sq.total_cmp(&other.length_sq).is_eq()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.length_sq.total_cmp(&other.length_sq)
    }
}

fn sorted_key(mut vs: [VertexId; 4]) -> [VertexId; 4] {
    vs.sort_unstable();
    vs
}

fn dist_sq(p: Vertex3, q: Vertex3) -> f64 {
    (p[0] - q[0]) * (p[0] - q[0])
        + (p[1] - q[1]) * (p[1] - q[1])
        + (p[2] - q[2]) * (p[2] - q[2])
}

struct Refinement<'a> {
    mesh: &'a mut TetMesh,
    options: &'a RefineOptions,
    evaluator: FuncEval<'a>,
    csg_eval: Option<CsgEval<'a>>,
    vertex_values: HashMap<VertexId, FuncTable>,
    /// Activeness keyed by the sorted vertex 4-tuple, so entries survive the
    /// tet-identity churn of splits.
    tet_active: HashMap<[VertexId; 4], bool>,
    counters: CheckCounters,
}

impl Refinement<'_> {
    /// Runs the mode criterion on one tet, filling the vertex cache on
    /// demand and recording activeness.
    fn evaluate_tet(&mut self, tid: TetId) -> Result<CritOutcome, GridError> {
        let vs = self.mesh.get_tet(tid)?.vertices();
        let mut pts = [[0.0f64; 3]; 4];
        for (i, &v) in vs.iter().enumerate() {
            pts[i] = self.mesh.get_vertex(v)?;
            if !self.vertex_values.contains_key(&v) {
                self.vertex_values.insert(v, (self.evaluator)(pts[i]));
            }
        }
        let corners = [
            &self.vertex_values[&vs[0]],
            &self.vertex_values[&vs[1]],
            &self.vertex_values[&vs[2]],
            &self.vertex_values[&vs[3]],
        ];
        let o = self.options;
        let mut counters = self.counters;
        let outcome = match o.mode {
            Mode::ImplicitArrangement => crit_ia(
                &pts,
                &corners,
                o.num_functions,
                o.threshold,
                o.curve_network,
                &mut counters,
            ),
            Mode::MaterialInterface => crit_mi(
                &pts,
                &corners,
                o.num_functions,
                o.threshold,
                o.curve_network,
                &mut counters,
            ),
            Mode::Csg => crit_csg(
                &pts,
                &corners,
                o.num_functions,
                self.csg_eval.ok_or(GridError::MissingCsgTree)?,
                o.threshold,
                o.curve_network,
                &mut counters,
            ),
        };
        self.counters = counters;
        self.tet_active.insert(sorted_key(vs), outcome.is_active);
        Ok(outcome)
    }

    /// Longest of the six edges; strictly-greater comparison keeps the first
    /// in local order on ties, which pins the heap tie-breaking.
    fn longest_edge(&self, tid: TetId) -> Result<(f64, EdgeId), GridError> {
        let edges = self.mesh.edges_in_tet(tid)?;
        let mut best = (0.0f64, edges[0].0);
        for (e, a, b) in edges {
            let l = dist_sq(self.mesh.get_vertex(a)?, self.mesh.get_vertex(b)?);
            if l > best.0 {
                best = (l, e);
            }
        }
        Ok(best)
    }

    /// Evaluates the criterion and, if the tet needs a split, returns the
    /// queue entry for its longest edge. The caller performs the push.
    fn push_longest_edge(&mut self, tid: TetId) -> Result<Option<QueueEntry>, GridError> {
        let outcome = self.evaluate_tet(tid)?;
        if !outcome.needs_split {
            return Ok(None);
        }
        let (length_sq, edge) = self.longest_edge(tid)?;
        let floor = self.options.smallest_edge;
        if floor > 0.0 && length_sq <= floor * floor {
            return Ok(None);
        }
        Ok(Some(QueueEntry { length_sq, edge }))
    }
}

/// Adaptively refines `mesh` until every tet satisfies the criterion of the
/// configured mode or the element budget is exhausted.
///
/// `evaluator` is called exactly once per distinct vertex; `csg_eval` is
/// required in CSG mode and called once per CSG criterion invocation.
pub fn refine(
    mesh: &mut TetMesh,
    options: &RefineOptions,
    evaluator: FuncEval<'_>,
    csg_eval: Option<CsgEval<'_>>,
) -> Result<RefineMetrics, GridError> {
    if options.mode == Mode::Csg && csg_eval.is_none() {
        return Err(GridError::MissingCsgTree);
    }
    if options.alpha < 1.0 {
        log::warn!(
            "alpha = {} < 1 lets an edge defer to itself; refinement may not terminate",
            options.alpha
        );
    }
    let start = Instant::now();

    let mut state = Refinement {
        vertex_values: HashMap::with_capacity(mesh.num_vertices() * 2),
        tet_active: HashMap::with_capacity(mesh.num_tets() * 2),
        mesh: &mut *mesh,
        options,
        evaluator,
        csg_eval,
        counters: CheckCounters::default(),
    };

    // Evaluate every initial vertex up front, in parallel.
    let initial: Vec<(VertexId, Vertex3)> = state.mesh.vertices().map(|(v, &p)| (v, p)).collect();
    state.vertex_values.extend(
        initial
            .par_iter()
            .map(|&(v, p)| (v, (evaluator)(p)))
            .collect::<Vec<_>>(),
    );

    // Prime the queue with the longest edge of every tet needing a split.
    let tids: Vec<TetId> = state.mesh.tets().map(|(t, _)| t).collect();
    let mut entries = Vec::new();
    for tid in tids {
        if let Some(entry) = state.push_longest_edge(tid)? {
            entries.push(entry);
        }
    }
    let mut queue = BinaryHeap::from(entries);
    log::debug!(
        "initial queue holds {} of {} tets",
        queue.len(),
        state.mesh.num_tets()
    );

    let mut budget_exhausted = state.mesh.num_tets() > options.max_elements;
    while !budget_exhausted {
        let Some(entry) = queue.pop() else { break };
        if !state.mesh.has_edge(entry.edge) {
            continue;
        }

        // Alpha quality feedback: surrounding active tets with even longer
        // edges refine first; the deferred pop stays in the queue.
        if options.alpha.is_finite() {
            let cutoff = options.alpha * entry.length_sq;
            let mut added_active = false;
            for tid in state.mesh.tets_around_edge(entry.edge)? {
                let key = sorted_key(state.mesh.get_tet(tid)?.vertices());
                // Tets the criterion never saw are skipped, not evaluated.
                if state.tet_active.get(&key).copied().unwrap_or(false) {
                    let (length_sq, edge) = state.longest_edge(tid)?;
                    if length_sq > cutoff {
                        queue.push(QueueEntry { length_sq, edge });
                        added_active = true;
                    }
                }
            }
            if added_active {
                queue.push(entry);
                continue;
            }
        }

        let (_, e0, e1) = state.mesh.split_edge(entry.edge)?;
        if state.mesh.num_tets() > options.max_elements {
            budget_exhausted = true;
            break;
        }
        for sub_edge in [e0, e1] {
            for tid in state.mesh.tets_around_edge(sub_edge)? {
                if let Some(entry) = state.push_longest_edge(tid)? {
                    queue.push(entry);
                }
            }
        }
    }

    let Refinement {
        vertex_values,
        tet_active,
        counters,
        ..
    } = state;

    // Final sweep: ratios in parallel, activeness bookkeeping sequentially
    // so the active tet order stays deterministic.
    let mut rows: Vec<(TetId, [VertexId; 4], [Vertex3; 4])> = Vec::with_capacity(mesh.num_tets());
    for (tid, tet) in mesh.tets() {
        let vs = tet.vertices();
        let mut pts = [[0.0f64; 3]; 4];
        for (i, &v) in vs.iter().enumerate() {
            pts[i] = mesh.get_vertex(v)?;
        }
        rows.push((tid, vs, pts));
    }
    let ratios: Vec<f64> = rows.par_iter().map(|(_, _, pts)| radius_ratio(pts)).collect();

    let mut metrics = RefineMetrics {
        total_tet: mesh.num_tets(),
        active_tet: 0,
        min_radius_ratio: f64::INFINITY,
        active_radius_ratio: f64::INFINITY,
        two_func_check: counters.two_func,
        three_func_check: counters.three_func,
        budget_exhausted,
        total_seconds: start.elapsed().as_secs_f64(),
        active_tets: Vec::new(),
        vertex_values,
    };
    for (&(tid, vs, _), &ratio) in rows.iter().zip(&ratios) {
        if ratio < metrics.min_radius_ratio {
            metrics.min_radius_ratio = ratio;
        }
        if tet_active.get(&sorted_key(vs)).copied().unwrap_or(false) {
            metrics.active_tet += 1;
            metrics.active_tets.push(tid);
            if ratio < metrics.active_radius_ratio {
                metrics.active_radius_ratio = ratio;
            }
        }
    }
    log::info!(
        "refined to {} tets ({} active) in {:.3}s{}",
        metrics.total_tet,
        metrics.active_tet,
        metrics.total_seconds,
        if budget_exhausted {
            ", element budget exhausted"
        } else {
            ""
        }
    );
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FuncGrad;
    use lebgrid_test_utils::cube_grid;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A `[-1, 1]^3` cube grid with `n` cells per axis.
    fn build_mesh(n: usize) -> TetMesh {
        let (vertices, tets) = cube_grid(n, [-1.0, -1.0, -1.0], 2.0 / n as f64);
        let mut mesh = TetMesh::new();
        let vids: Vec<VertexId> = vertices
            .iter()
            .map(|p| mesh.add_vertex(p[0], p[1], p[2]))
            .collect();
        for t in &tets {
            mesh.add_tet(vids[t[0]], vids[t[1]], vids[t[2]], vids[t[3]])
                .unwrap();
        }
        mesh.initialize_connectivity().unwrap();
        mesh
    }

    fn sphere_grad(p: Vertex3, center: Vertex3, radius: f64) -> FuncGrad {
        let d = [p[0] - center[0], p[1] - center[1], p[2] - center[2]];
        FuncGrad::new(
            d[0] * d[0] + d[1] * d[1] + d[2] * d[2] - radius * radius,
            2.0 * d[0],
            2.0 * d[1],
            2.0 * d[2],
        )
    }

    fn spheres(params: Vec<(Vertex3, f64)>) -> impl Fn(Vertex3) -> FuncTable + Sync {
        move |p| {
            params
                .iter()
                .map(|&(c, r)| sphere_grad(p, c, r))
                .collect()
        }
    }

    fn metric_tuple(m: &RefineMetrics) -> (usize, usize, u64, u64) {
        (m.total_tet, m.active_tet, m.two_func_check, m.three_func_check)
    }

    #[test]
    fn huge_threshold_marks_active_without_splits() {
        let mut mesh = build_mesh(4);
        let initial = mesh.num_tets();
        let eval = spheres(vec![([0.0, 0.0, 0.0], 0.5)]);
        let options = RefineOptions::new(Mode::ImplicitArrangement, 1, 10.0);
        let metrics = refine(&mut mesh, &options, &eval, None).unwrap();

        assert_eq!(metrics.total_tet, initial, "no split at a huge threshold");
        assert!(metrics.active_tet > 0, "the sphere crosses the grid");
        assert!(metrics.active_tet < metrics.total_tet);
        assert_eq!(metrics.two_func_check, 0);
        assert_eq!(metrics.three_func_check, 0);
        assert!(!metrics.budget_exhausted);
        assert!(metrics.min_radius_ratio <= metrics.active_radius_ratio);
    }

    #[test]
    fn infinite_threshold_never_splits() {
        let mut mesh = build_mesh(2);
        let initial = mesh.num_tets();
        let eval = spheres(vec![([0.0, 0.0, 0.0], 0.5)]);
        let options = RefineOptions::new(Mode::ImplicitArrangement, 1, f64::INFINITY);
        let metrics = refine(&mut mesh, &options, &eval, None).unwrap();
        assert_eq!(metrics.total_tet, initial);
        assert!(!metrics.budget_exhausted);
    }

    #[test]
    fn zero_budget_returns_initial_grid() {
        let mut mesh = build_mesh(2);
        let initial = mesh.num_tets();
        let eval = spheres(vec![([0.0, 0.0, 0.0], 0.5)]);
        let mut options = RefineOptions::new(Mode::ImplicitArrangement, 1, 1e-3);
        options.max_elements = 0;
        let metrics = refine(&mut mesh, &options, &eval, None).unwrap();
        assert_eq!(metrics.total_tet, initial);
        assert!(metrics.budget_exhausted);
    }

    #[test]
    fn refinement_splits_towards_the_surface() {
        let mut mesh = build_mesh(2);
        let initial = mesh.num_tets();
        let eval = spheres(vec![([0.0, 0.0, 0.0], 0.6)]);
        let options = RefineOptions::new(Mode::ImplicitArrangement, 1, 0.05);
        let metrics = refine(&mut mesh, &options, &eval, None).unwrap();

        assert!(metrics.total_tet > initial);
        assert!(metrics.active_tet > 0);
        assert!(metrics.active_tet <= metrics.total_tet);
        assert!(!metrics.budget_exhausted);
        assert_eq!(metrics.active_tet, metrics.active_tets.len());
        assert!(metrics.min_radius_ratio <= metrics.active_radius_ratio);
    }

    #[test]
    fn metrics_are_deterministic() {
        let eval = spheres(vec![([0.2, 0.0, 0.0], 0.5), ([-0.2, 0.1, 0.0], 0.45)]);
        let options = RefineOptions::new(Mode::ImplicitArrangement, 2, 0.05);

        let mut first = build_mesh(2);
        let a = refine(&mut first, &options, &eval, None).unwrap();
        let mut second = build_mesh(2);
        let b = refine(&mut second, &options, &eval, None).unwrap();
        assert_eq!(metric_tuple(&a), metric_tuple(&b));
        assert!(a.two_func_check > 0, "two crossing spheres take pair tests");
    }

    #[test]
    fn refinement_is_idempotent() {
        let eval = spheres(vec![([0.0, 0.0, 0.0], 0.6)]);
        let options = RefineOptions::new(Mode::ImplicitArrangement, 1, 0.05);

        let mut mesh = build_mesh(2);
        let first = refine(&mut mesh, &options, &eval, None).unwrap();
        let second = refine(&mut mesh, &options, &eval, None).unwrap();
        assert_eq!(first.total_tet, second.total_tet, "no splits on re-run");
        assert_eq!(first.active_tet, second.active_tet);
    }

    #[test]
    fn budget_cap_stops_near_the_limit() {
        let mut mesh = build_mesh(2);
        let eval = spheres(vec![([0.0, 0.0, 0.0], 0.6)]);
        let mut options = RefineOptions::new(Mode::ImplicitArrangement, 1, 1e-4);
        options.max_elements = 200;
        let metrics = refine(&mut mesh, &options, &eval, None).unwrap();

        assert!(metrics.budget_exhausted);
        assert!(metrics.total_tet > 200, "the loop stops after overshooting");
        // The overshoot is bounded by the ring size of a single bisection.
        assert!(metrics.total_tet < 200 + 50);
    }

    #[test]
    fn smallest_edge_floor_suppresses_splits() {
        let mut mesh = build_mesh(2);
        let initial = mesh.num_tets();
        let eval = spheres(vec![([0.0, 0.0, 0.0], 0.6)]);
        let mut options = RefineOptions::new(Mode::ImplicitArrangement, 1, 1e-4);
        options.smallest_edge = 10.0;
        let metrics = refine(&mut mesh, &options, &eval, None).unwrap();
        assert_eq!(metrics.total_tet, initial);
    }

    #[test]
    fn csg_mode_without_evaluator_is_an_input_error() {
        let mut mesh = build_mesh(1);
        let eval = spheres(vec![([0.0, 0.0, 0.0], 0.5)]);
        let options = RefineOptions::new(Mode::Csg, 1, 1e-3);
        let err = refine(&mut mesh, &options, &eval, None).unwrap_err();
        assert!(matches!(err, GridError::MissingCsgTree));
        assert!(err.is_input());
    }

    #[test]
    fn vertices_are_evaluated_exactly_once() {
        let mut mesh = build_mesh(2);
        let calls = AtomicUsize::new(0);
        let eval = |p: Vertex3| -> FuncTable {
            calls.fetch_add(1, Ordering::Relaxed);
            std::iter::once(sphere_grad(p, [0.0, 0.0, 0.0], 0.6)).collect()
        };
        let options = RefineOptions::new(Mode::ImplicitArrangement, 1, 0.05);
        let metrics = refine(&mut mesh, &options, &eval, None).unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), metrics.vertex_values.len());
        assert_eq!(metrics.vertex_values.len(), mesh.num_vertices());
    }

    #[test]
    fn alpha_feedback_terminates_and_stays_consistent() {
        let eval = spheres(vec![([0.0, 0.0, 0.0], 0.6)]);
        let mut options = RefineOptions::new(Mode::ImplicitArrangement, 1, 0.05);
        options.alpha = 1.0;

        let mut mesh = build_mesh(2);
        let metrics = refine(&mut mesh, &options, &eval, None).unwrap();
        assert!(metrics.active_tet > 0);
        assert!(metrics.active_tet <= metrics.total_tet);
        assert!(metrics.min_radius_ratio <= metrics.active_radius_ratio);
        assert!(mesh.num_tets() == metrics.total_tet);
    }

    #[test]
    fn mi_mode_refines_label_boundaries() {
        let mut mesh = build_mesh(2);
        let initial = mesh.num_tets();
        // Two distance fields partition the cube into two materials; their
        // difference is curved, so the interface needs refinement.
        let eval = |p: Vertex3| -> FuncTable {
            [([0.3f64, 0.0, 0.0], 0.7f64), ([-0.3, 0.2, 0.0], 0.5)]
                .iter()
                .map(|&(c, r)| {
                    let d = [p[0] - c[0], p[1] - c[1], p[2] - c[2]];
                    let n = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
                    if n > 0.0 {
                        FuncGrad::new(n - r, d[0] / n, d[1] / n, d[2] / n)
                    } else {
                        FuncGrad::new(-r, 0.0, 0.0, 0.0)
                    }
                })
                .collect()
        };
        let options = RefineOptions::new(Mode::MaterialInterface, 2, 0.05);
        let metrics = refine(&mut mesh, &options, &eval, None).unwrap();
        assert!(metrics.total_tet > initial);
        assert!(metrics.active_tet > 0);
        assert!(metrics.two_func_check > 0);
    }

    #[test]
    fn csg_union_refines_both_boundaries() {
        use smallvec::SmallVec;

        let mut mesh = build_mesh(2);
        let eval = spheres(vec![([0.3, 0.0, 0.0], 0.5), ([-0.3, 0.0, 0.0], 0.5)]);
        let union = |iv: &[Interval]| CsgOutcome {
            interval: [
                iv.iter().fold(f64::INFINITY, |m, i| m.min(i[0])),
                iv.iter().fold(f64::INFINITY, |m, i| m.min(i[1])),
            ],
            active_functions: (0..iv.len()).collect::<SmallVec<_>>(),
        };
        let options = RefineOptions::new(Mode::Csg, 2, 0.05);
        let metrics = refine(&mut mesh, &options, &eval, Some(&union)).unwrap();
        assert!(metrics.active_tet > 0);
        assert!(!metrics.budget_exhausted);
    }
}
