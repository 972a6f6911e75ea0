//! Mutable tetrahedral mesh with stable handles and longest-edge bisection.
//!
//! Vertices and tets live in generational slot maps: handles of retired tets
//! stop resolving instead of aliasing a later element, which is what makes
//! lazily-filtered stale edge entries safe for the refinement queue.

use std::collections::HashMap;

use slotmap::{new_key_type, SlotMap};

use crate::error::GridError;
use crate::types::Vertex3;

new_key_type! {
    /// Stable handle of a mesh vertex.
    pub struct VertexId;

    /// Stable handle of a tet. Retired by [`TetMesh::split_edge`], never reused.
    pub struct TetId;
}

/// Corner locals of the six edges of a tet, in canonical order:
///
/// ```text
/// 0:(v0,v1)  1:(v1,v2)  2:(v2,v0)  3:(v0,v3)  4:(v1,v3)  5:(v2,v3)
/// ```
pub const EDGE_VERTICES: [[usize; 2]; 6] = [[0, 1], [1, 2], [2, 0], [0, 3], [1, 3], [2, 3]];

/// Corner locals of the four faces; face `f` is opposite corner `f`.
pub const FACE_VERTICES: [[usize; 3]; 4] = [[1, 2, 3], [0, 2, 3], [0, 1, 3], [0, 1, 2]];

/// Local edge index for an unordered pair of corner locals (diagonal unused).
const EDGE_OF_PAIR: [[usize; 4]; 4] = [
    [6, 0, 2, 3],
    [0, 6, 1, 4],
    [2, 1, 6, 5],
    [3, 4, 5, 6],
];

/// A directed edge, identified by an owning tet and a local edge index 0..6.
///
/// Two edge ids denote the same geometric edge iff they traverse the same
/// unordered vertex pair; [`TetMesh::get_edge_tet`] canonicalizes by owning
/// tet. An id whose owning tet has been retired is stale.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct EdgeId {
    tet: TetId,
    local: u8,
}

impl EdgeId {
    /// The owning tet (possibly retired).
    pub const fn tet(&self) -> TetId {
        self.tet
    }

    /// The local edge index, 0..6.
    pub const fn local_index(&self) -> u8 {
        self.local
    }
}

/// One tetrahedron: an ordered vertex 4-tuple and the mirror tet across each
/// face. The signed volume of `(v1-v0, v2-v0, v3-v0)` is positive.
#[derive(Debug, Clone)]
pub struct Tet {
    vertices: [VertexId; 4],
    neighbors: [Option<TetId>; 4],
}

impl Tet {
    pub const fn vertices(&self) -> [VertexId; 4] {
        self.vertices
    }

    /// Mirror tet across the face opposite corner `face`.
    pub const fn neighbor(&self, face: usize) -> Option<TetId> {
        self.neighbors[face]
    }

    fn local_of(&self, v: VertexId) -> Option<usize> {
        self.vertices.iter().position(|&w| w == v)
    }

    /// Locals of the two corners not on the edge `(a, b)`, ascending.
    fn off_edge_locals(&self, a: VertexId, b: VertexId) -> (usize, usize) {
        let mut locals = [0usize; 2];
        let mut n = 0;
        for (i, &v) in self.vertices.iter().enumerate() {
            if v != a && v != b {
                locals[n] = i;
                n += 1;
            }
        }
        (locals[0], locals[1])
    }

    fn face(&self, f: usize) -> [VertexId; 3] {
        let [i, j, k] = FACE_VERTICES[f];
        [self.vertices[i], self.vertices[j], self.vertices[k]]
    }
}

fn sorted3(mut t: [VertexId; 3]) -> [VertexId; 3] {
    t.sort_unstable();
    t
}

/// Six times the signed volume of the tet `(a, b, c, d)`.
pub(crate) fn signed_volume6(a: Vertex3, b: Vertex3, c: Vertex3, d: Vertex3) -> f64 {
    let u = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let v = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
    let w = [d[0] - a[0], d[1] - a[1], d[2] - a[2]];
    u[0] * (v[1] * w[2] - v[2] * w[1]) - u[1] * (v[0] * w[2] - v[2] * w[0])
        + u[2] * (v[0] * w[1] - v[1] * w[0])
}

/// A conforming tetrahedral mesh under longest-edge bisection.
#[derive(Debug, Default, Clone)]
pub struct TetMesh {
    vertices: SlotMap<VertexId, Vertex3>,
    tets: SlotMap<TetId, Tet>,
}

impl TetMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_tets(&self) -> usize {
        self.tets.len()
    }

    pub fn add_vertex(&mut self, x: f64, y: f64, z: f64) -> VertexId {
        self.vertices.insert([x, y, z])
    }

    /// Appends a tet. The corners must be positively oriented.
    pub fn add_tet(
        &mut self,
        v0: VertexId,
        v1: VertexId,
        v2: VertexId,
        v3: VertexId,
    ) -> Result<TetId, GridError> {
        let vs = [v0, v1, v2, v3];
        for v in vs {
            if !self.vertices.contains_key(v) {
                return Err(GridError::UnknownVertex);
            }
        }
        let [a, b, c, d] = vs.map(|v| self.vertices[v]);
        if signed_volume6(a, b, c, d) <= 0.0 {
            return Err(GridError::FlippedTet);
        }
        Ok(self.tets.insert(Tet {
            vertices: vs,
            neighbors: [None; 4],
        }))
    }

    /// Computes all per-face mirror links. Call once after the initial tets
    /// are added; splits maintain the links incrementally afterwards.
    pub fn initialize_connectivity(&mut self) -> Result<(), GridError> {
        let mut owners: HashMap<[VertexId; 3], Vec<(TetId, usize)>> =
            HashMap::with_capacity(self.tets.len() * 2);
        let tids: Vec<TetId> = self.tets.keys().collect();
        for &tid in &tids {
            for f in 0..4 {
                let key = sorted3(self.tets[tid].face(f));
                owners.entry(key).or_default().push((tid, f));
            }
        }
        for &tid in &tids {
            self.tets[tid].neighbors = [None; 4];
        }
        for (_, list) in owners {
            match list[..] {
                [_] => {}
                [(t0, f0), (t1, f1)] => {
                    self.tets[t0].neighbors[f0] = Some(t1);
                    self.tets[t1].neighbors[f1] = Some(t0);
                }
                _ => return Err(GridError::NonManifold),
            }
        }
        Ok(())
    }

    pub fn has_vertex(&self, v: VertexId) -> bool {
        self.vertices.contains_key(v)
    }

    pub fn has_tet(&self, t: TetId) -> bool {
        self.tets.contains_key(t)
    }

    /// False once the owning tet has been retired; the only admissible
    /// staleness for queued edges.
    pub fn has_edge(&self, e: EdgeId) -> bool {
        self.tets.contains_key(e.tet)
    }

    pub fn get_vertex(&self, v: VertexId) -> Result<Vertex3, GridError> {
        self.vertices.get(v).copied().ok_or(GridError::UnknownVertex)
    }

    pub fn get_tet(&self, t: TetId) -> Result<&Tet, GridError> {
        self.tets.get(t).ok_or(GridError::UnknownTet)
    }

    /// The edge of tet `t` with local index `local`.
    pub fn get_edge(&self, t: TetId, local: u8) -> Result<EdgeId, GridError> {
        if !self.tets.contains_key(t) {
            return Err(GridError::UnknownTet);
        }
        debug_assert!(local < 6);
        Ok(EdgeId { tet: t, local })
    }

    /// Endpoints of a directed edge, in traversal order.
    pub fn get_edge_vertices(&self, e: EdgeId) -> Result<[VertexId; 2], GridError> {
        let tet = self.tets.get(e.tet).ok_or(GridError::StaleEdge)?;
        let [i, j] = EDGE_VERTICES[e.local as usize];
        Ok([tet.vertices[i], tet.vertices[j]])
    }

    /// A live tet containing the edge; canonicalizes an edge id to its owner.
    pub fn get_edge_tet(&self, e: EdgeId) -> Result<TetId, GridError> {
        if self.tets.contains_key(e.tet) {
            Ok(e.tet)
        } else {
            Err(GridError::StaleEdge)
        }
    }

    /// The six edges of a tet with their endpoints, in local order.
    pub fn edges_in_tet(&self, t: TetId) -> Result<[(EdgeId, VertexId, VertexId); 6], GridError> {
        let tet = self.tets.get(t).ok_or(GridError::UnknownTet)?;
        let mut out = [(EdgeId { tet: t, local: 0 }, tet.vertices[0], tet.vertices[1]); 6];
        for (local, &[i, j]) in EDGE_VERTICES.iter().enumerate() {
            out[local] = (
                EdgeId {
                    tet: t,
                    local: local as u8,
                },
                tet.vertices[i],
                tet.vertices[j],
            );
        }
        Ok(out)
    }

    /// Sequential iteration over live vertices in deterministic order.
    pub fn vertices(&self) -> impl Iterator<Item = (VertexId, &Vertex3)> + '_ {
        self.vertices.iter()
    }

    /// Sequential iteration over live tets in deterministic order.
    pub fn tets(&self) -> impl Iterator<Item = (TetId, &Tet)> + '_ {
        self.tets.iter()
    }

    /// Walks from `start` through the edge-adjacent face `leave`, collecting
    /// tets until the ring closes or a boundary is hit.
    fn walk_around(
        &self,
        start: TetId,
        a: VertexId,
        b: VertexId,
        leave_first: usize,
    ) -> (Vec<TetId>, bool) {
        let mut out = Vec::new();
        let mut cur = start;
        let mut leave = leave_first;
        loop {
            let shared = self.tets[cur].face(leave);
            let Some(next) = self.tets[cur].neighbors[leave] else {
                return (out, false);
            };
            if next == start {
                return (out, true);
            }
            out.push(next);
            let next_tet = &self.tets[next];
            // The face we entered through is opposite the one corner of
            // `next` that is not on the shared triangle.
            let enter = next_tet
                .vertices
                .iter()
                .position(|v| !shared.contains(v))
                .expect("adjacent tets share a face");
            let (fa, fb) = next_tet.off_edge_locals(a, b);
            leave = if fa == enter { fb } else { fa };
            cur = next;
        }
    }

    /// All tets incident to the geometric edge, starting with the owner and
    /// proceeding in a deterministic walk order.
    pub fn tets_around_edge(&self, e: EdgeId) -> Result<Vec<TetId>, GridError> {
        let [a, b] = self.get_edge_vertices(e)?;
        let (fa, fb) = self.tets[e.tet].off_edge_locals(a, b);
        let (fwd, closed) = self.walk_around(e.tet, a, b, fa);
        let mut ring = Vec::with_capacity(fwd.len() + 8);
        ring.push(e.tet);
        ring.extend(fwd);
        if !closed {
            let (bwd, _) = self.walk_around(e.tet, a, b, fb);
            ring.extend(bwd);
        }
        Ok(ring)
    }

    /// Bisects the geometric edge at its midpoint.
    ///
    /// Every tet incident to the edge is retired and replaced by two children
    /// sharing the new vertex; mirror links of the neighborhood are rebuilt.
    /// Returns the midpoint and the two sub-edges connecting it to the
    /// original endpoints, in endpoint order.
    pub fn split_edge(&mut self, e: EdgeId) -> Result<(VertexId, EdgeId, EdgeId), GridError> {
        if !self.has_edge(e) {
            return Err(GridError::StaleEdge);
        }
        let [a, b] = self.get_edge_vertices(e)?;
        let ring = self.tets_around_edge(e)?;

        let pa = self.vertices[a];
        let pb = self.vertices[b];
        let m = self.add_vertex(
            (pa[0] + pb[0]) * 0.5,
            (pa[1] + pb[1]) * 0.5,
            (pa[2] + pb[2]) * 0.5,
        );

        // Faces of the ring not containing the edge keep their outer mirror;
        // remember it (and the outer tet's back-pointing face) by vertex key.
        let mut outer: HashMap<[VertexId; 3], Option<(TetId, usize)>> =
            HashMap::with_capacity(ring.len() * 2);
        for &tid in &ring {
            for f in 0..4 {
                let tri = self.tets[tid].face(f);
                if tri.contains(&a) && tri.contains(&b) {
                    continue;
                }
                let entry = match self.tets[tid].neighbors[f] {
                    Some(n) => {
                        let back = self.tets[n]
                            .neighbors
                            .iter()
                            .position(|&nb| nb == Some(tid))
                            .expect("mirror links are symmetric");
                        Some((n, back))
                    }
                    None => None,
                };
                outer.insert(sorted3(tri), entry);
            }
        }

        let mut new_tets: Vec<TetId> = Vec::with_capacity(ring.len() * 2);
        let mut sub_edges: Option<(EdgeId, EdgeId)> = None;
        for &tid in &ring {
            let old = self.tets.remove(tid).expect("ring tets are live");
            let la = old.local_of(a).expect("ring tet contains the edge");
            let lb = old.local_of(b).expect("ring tet contains the edge");

            // Substituting the midpoint for either endpoint halves the
            // volume without changing its sign.
            let mut va = old.vertices;
            va[la] = m;
            let ta = self.tets.insert(Tet {
                vertices: va,
                neighbors: [None; 4],
            });
            let mut vb = old.vertices;
            vb[lb] = m;
            let tb = self.tets.insert(Tet {
                vertices: vb,
                neighbors: [None; 4],
            });
            new_tets.push(ta);
            new_tets.push(tb);

            if sub_edges.is_none() {
                let local = EDGE_OF_PAIR[la][lb] as u8;
                // `tb` kept endpoint `a`, `ta` kept endpoint `b`.
                sub_edges = Some((EdgeId { tet: tb, local }, EdgeId { tet: ta, local }));
            }
        }

        // Re-link: faces shared by two children pair up internally; lone
        // faces either reattach to their recorded outer mirror or stay open.
        let mut owners: HashMap<[VertexId; 3], Vec<(TetId, usize)>> =
            HashMap::with_capacity(new_tets.len() * 4);
        for &tid in &new_tets {
            for f in 0..4 {
                owners
                    .entry(sorted3(self.tets[tid].face(f)))
                    .or_default()
                    .push((tid, f));
            }
        }
        for (tri, list) in owners {
            match list[..] {
                [(t0, f0), (t1, f1)] => {
                    self.tets[t0].neighbors[f0] = Some(t1);
                    self.tets[t1].neighbors[f1] = Some(t0);
                }
                [(t0, f0)] => {
                    if let Some(Some((n, back))) = outer.get(&tri) {
                        self.tets[t0].neighbors[f0] = Some(*n);
                        self.tets[*n].neighbors[*back] = Some(t0);
                    }
                }
                _ => return Err(GridError::NonManifold),
            }
        }

        let (e0, e1) = sub_edges.expect("ring is nonempty");
        Ok((m, e0, e1))
    }

    /// Audits mirror symmetry, face agreement and orientation of every tet.
    pub fn is_sound(&self) -> bool {
        for (tid, tet) in self.tets.iter() {
            if tet.vertices.iter().any(|&v| !self.vertices.contains_key(v)) {
                log::error!("tet {tid:?} references a missing vertex");
                return false;
            }
            let [a, b, c, d] = tet.vertices.map(|v| self.vertices[v]);
            if !(signed_volume6(a, b, c, d) > 0.0) {
                log::error!("tet {tid:?} is degenerate or flipped");
                return false;
            }
            for f in 0..4 {
                let Some(n) = tet.neighbors[f] else { continue };
                let Some(other) = self.tets.get(n) else {
                    log::error!("tet {tid:?} mirrors a retired tet");
                    return false;
                };
                let back = other.neighbors.iter().position(|&nb| nb == Some(tid));
                let Some(back) = back else {
                    log::error!("mirror link of tet {tid:?} is not symmetric");
                    return false;
                };
                if sorted3(tet.face(f)) != sorted3(other.face(back)) {
                    log::error!("tets {tid:?} and {n:?} disagree on their shared face");
                    return false;
                }
            }
        }
        true
    }
}
