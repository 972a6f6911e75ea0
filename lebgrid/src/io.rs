//! Grid and report I/O: JSON grids, Gmsh ASCII meshes, and run reports.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::GridError;
use crate::refinement::RefineMetrics;
use crate::tetmesh::{TetId, TetMesh, VertexId};
use crate::types::FuncTable;

/// JSON grid: a vertex array (Nx3) and a tet index array (Mx4).
#[derive(Debug, Serialize, Deserialize)]
pub struct GridFile {
    pub vertices: Vec<[f64; 3]>,
    pub tets: Vec<[usize; 4]>,
}

fn unreadable(path: &Path) -> impl FnOnce(std::io::Error) -> GridError + '_ {
    move |source| GridError::Unreadable {
        path: path.to_path_buf(),
        source,
    }
}

fn unwritable(path: &Path) -> impl FnOnce(std::io::Error) -> GridError + '_ {
    move |source| GridError::Unwritable {
        path: path.to_path_buf(),
        source,
    }
}

fn malformed(path: &Path, detail: impl Into<String>) -> GridError {
    GridError::Malformed {
        what: "grid",
        path: path.to_path_buf(),
        detail: detail.into(),
    }
}

fn assemble(path: &Path, grid: GridFile) -> Result<TetMesh, GridError> {
    let mut mesh = TetMesh::new();
    let vids: Vec<VertexId> = grid
        .vertices
        .iter()
        .map(|p| mesh.add_vertex(p[0], p[1], p[2]))
        .collect();
    for t in &grid.tets {
        if t.iter().any(|&i| i >= vids.len()) {
            return Err(malformed(path, format!("tet {t:?} references a missing vertex")));
        }
        mesh.add_tet(vids[t[0]], vids[t[1]], vids[t[2]], vids[t[3]])?;
    }
    mesh.initialize_connectivity()?;
    Ok(mesh)
}

/// Loads an initial grid, dispatching on the `.json` suffix.
pub fn load_grid(path: &Path) -> Result<TetMesh, GridError> {
    if path.extension().is_some_and(|e| e == "json") {
        load_grid_json(path)
    } else {
        load_mesh_msh(path)
    }
}

pub fn load_grid_json(path: &Path) -> Result<TetMesh, GridError> {
    let text = fs::read_to_string(path).map_err(unreadable(path))?;
    let grid: GridFile = serde_json::from_str(&text).map_err(|e| malformed(path, e.to_string()))?;
    assemble(path, grid)
}

pub fn save_grid_json(path: &Path, mesh: &TetMesh) -> Result<(), GridError> {
    let mut indices: HashMap<VertexId, usize> = HashMap::with_capacity(mesh.num_vertices());
    let mut grid = GridFile {
        vertices: Vec::with_capacity(mesh.num_vertices()),
        tets: Vec::with_capacity(mesh.num_tets()),
    };
    for (i, (v, p)) in mesh.vertices().enumerate() {
        indices.insert(v, i);
        grid.vertices.push(*p);
    }
    for (_, tet) in mesh.tets() {
        grid.tets.push(tet.vertices().map(|v| indices[&v]));
    }
    let text = serde_json::to_string(&grid)
        .map_err(|e| GridError::Unwritable {
            path: path.to_path_buf(),
            source: std::io::Error::other(e),
        })?;
    fs::write(path, text).map_err(unwritable(path))
}

/// Writes the mesh, or a subset of its tets, as Gmsh ASCII v4.1.
pub fn save_mesh_msh(path: &Path, mesh: &TetMesh, subset: Option<&[TetId]>) -> Result<(), GridError> {
    let mut tags: HashMap<VertexId, usize> = HashMap::with_capacity(mesh.num_vertices());
    let mut coords: Vec<[f64; 3]> = Vec::with_capacity(mesh.num_vertices());
    for (i, (v, p)) in mesh.vertices().enumerate() {
        tags.insert(v, i + 1);
        coords.push(*p);
    }
    let tets: Vec<[usize; 4]> = match subset {
        Some(ids) => {
            let mut out = Vec::with_capacity(ids.len());
            for &t in ids {
                out.push(mesh.get_tet(t)?.vertices().map(|v| tags[&v]));
            }
            out
        }
        None => mesh
            .tets()
            .map(|(_, tet)| tet.vertices().map(|v| tags[&v]))
            .collect(),
    };

    let n = coords.len();
    let m = tets.len();
    let mut out = String::new();
    out.push_str("$MeshFormat\n4.1 0 8\n$EndMeshFormat\n");
    let _ = writeln!(out, "$Nodes\n1 {n} 1 {n}\n3 1 0 {n}");
    for tag in 1..=n {
        let _ = writeln!(out, "{tag}");
    }
    for p in &coords {
        let _ = writeln!(out, "{} {} {}", p[0], p[1], p[2]);
    }
    out.push_str("$EndNodes\n");
    let _ = writeln!(out, "$Elements\n1 {m} 1 {m}\n3 1 4 {m}");
    for (i, t) in tets.iter().enumerate() {
        let _ = writeln!(out, "{} {} {} {} {}", i + 1, t[0], t[1], t[2], t[3]);
    }
    out.push_str("$EndElements\n");
    fs::write(path, out).map_err(unwritable(path))
}

fn section<'a>(text: &'a str, path: &Path, name: &str) -> Result<&'a str, GridError> {
    let open = format!("${name}");
    let close = format!("$End{name}");
    let start = text
        .find(&open)
        .ok_or_else(|| malformed(path, format!("missing {open} section")))?
        + open.len();
    let end = text[start..]
        .find(&close)
        .ok_or_else(|| malformed(path, format!("unterminated {open} section")))?;
    Ok(&text[start..start + end])
}

struct Tokens<'a> {
    iter: std::str::SplitWhitespace<'a>,
    path: &'a Path,
}

impl Tokens<'_> {
    fn f64(&mut self) -> Result<f64, GridError> {
        self.iter
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| malformed(self.path, "truncated or non-numeric msh section"))
    }

    fn usize(&mut self) -> Result<usize, GridError> {
        self.iter
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| malformed(self.path, "truncated or non-numeric msh section"))
    }
}

/// Loads a Gmsh ASCII v4.1 tet mesh. Binary files and non-tet element
/// blocks are rejected.
pub fn load_mesh_msh(path: &Path) -> Result<TetMesh, GridError> {
    let text = fs::read_to_string(path).map_err(unreadable(path))?;

    let format = section(&text, path, "MeshFormat")?;
    let header: Vec<&str> = format.split_whitespace().collect();
    if header.first() != Some(&"4.1") {
        return Err(malformed(path, "only msh format 4.1 is supported"));
    }
    if header.get(1) != Some(&"0") {
        return Err(malformed(path, "binary msh is not supported"));
    }

    let nodes = section(&text, path, "Nodes")?;
    let mut tokens = Tokens {
        iter: nodes.split_whitespace(),
        path,
    };
    let num_blocks = tokens.usize()?;
    let (_num_nodes, _min, _max) = (tokens.usize()?, tokens.usize()?, tokens.usize()?);
    let mut mesh = TetMesh::new();
    let mut by_tag: HashMap<usize, VertexId> = HashMap::new();
    for _ in 0..num_blocks {
        let (_dim, _entity, _parametric) = (tokens.usize()?, tokens.usize()?, tokens.usize()?);
        let in_block = tokens.usize()?;
        let mut block_tags = Vec::with_capacity(in_block);
        for _ in 0..in_block {
            block_tags.push(tokens.usize()?);
        }
        for tag in block_tags {
            let (x, y, z) = (tokens.f64()?, tokens.f64()?, tokens.f64()?);
            by_tag.insert(tag, mesh.add_vertex(x, y, z));
        }
    }

    let elements = section(&text, path, "Elements")?;
    let mut tokens = Tokens {
        iter: elements.split_whitespace(),
        path,
    };
    let num_blocks = tokens.usize()?;
    let (_num_elements, _min, _max) = (tokens.usize()?, tokens.usize()?, tokens.usize()?);
    for _ in 0..num_blocks {
        let (_dim, _entity) = (tokens.usize()?, tokens.usize()?);
        let elem_type = tokens.usize()?;
        let in_block = tokens.usize()?;
        if elem_type != 4 {
            return Err(malformed(
                path,
                format!("unsupported element type {elem_type}, expected tets"),
            ));
        }
        for _ in 0..in_block {
            let _tag = tokens.usize()?;
            let mut vs = [VertexId::default(); 4];
            for v in &mut vs {
                let tag = tokens.usize()?;
                *v = *by_tag
                    .get(&tag)
                    .ok_or_else(|| malformed(path, format!("unknown node tag {tag}")))?;
            }
            mesh.add_tet(vs[0], vs[1], vs[2], vs[3])?;
        }
    }
    mesh.initialize_connectivity()?;
    Ok(mesh)
}

#[derive(Debug, Serialize, Deserialize)]
struct StatsReport {
    total_tet: usize,
    active_tet: usize,
    min_radius_ratio: f64,
    active_radius_ratio: f64,
    two_func_check: u64,
    three_func_check: u64,
    budget_exhausted: bool,
}

/// Writes `stats.json`-style run metrics.
pub fn save_stats(path: &Path, metrics: &RefineMetrics) -> Result<(), GridError> {
    let report = StatsReport {
        total_tet: metrics.total_tet,
        active_tet: metrics.active_tet,
        min_radius_ratio: metrics.min_radius_ratio,
        active_radius_ratio: metrics.active_radius_ratio,
        two_func_check: metrics.two_func_check,
        three_func_check: metrics.three_func_check,
        budget_exhausted: metrics.budget_exhausted,
    };
    let text = serde_json::to_string_pretty(&report).map_err(|e| GridError::Unwritable {
        path: path.to_path_buf(),
        source: std::io::Error::other(e),
    })?;
    fs::write(path, text).map_err(unwritable(path))
}

#[derive(Debug, Serialize, Deserialize)]
struct TimingsReport {
    total_time: f64,
}

/// Writes `timings.json`-style wall-clock totals.
pub fn save_timings(path: &Path, total_seconds: f64) -> Result<(), GridError> {
    let text = serde_json::to_string_pretty(&TimingsReport {
        total_time: total_seconds,
    })
    .map_err(|e| GridError::Unwritable {
        path: path.to_path_buf(),
        source: std::io::Error::other(e),
    })?;
    fs::write(path, text).map_err(unwritable(path))
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionValueFile {
    /// Per vertex, in mesh order: one `[value, gx, gy, gz]` per function.
    values: Vec<Vec<[f64; 4]>>,
}

/// Writes the per-vertex function/gradient table for later discretization.
pub fn save_function_values(
    path: &Path,
    mesh: &TetMesh,
    table: &HashMap<VertexId, FuncTable>,
) -> Result<(), GridError> {
    let values = mesh
        .vertices()
        .map(|(v, _)| {
            table
                .get(&v)
                .map(|t| t.iter().map(|q| [q[0], q[1], q[2], q[3]]).collect())
                .unwrap_or_default()
        })
        .collect();
    let text = serde_json::to_string(&FunctionValueFile { values }).map_err(|e| {
        GridError::Unwritable {
            path: path.to_path_buf(),
            source: std::io::Error::other(e),
        }
    })?;
    fs::write(path, text).map_err(unwritable(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lebgrid_test_utils::cube_grid;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("lebgrid_io_{name}"))
    }

    fn sample_mesh(n: usize) -> TetMesh {
        let (vertices, tets) = cube_grid(n, [-1.0, -1.0, -1.0], 2.0 / n as f64);
        assemble(
            Path::new("sample"),
            GridFile { vertices, tets },
        )
        .unwrap()
    }

    #[test]
    fn grid_json_round_trips() {
        let path = scratch("grid.json");
        let mesh = sample_mesh(2);
        save_grid_json(&path, &mesh).unwrap();
        let loaded = load_grid(&path).unwrap();
        assert_eq!(loaded.num_vertices(), mesh.num_vertices());
        assert_eq!(loaded.num_tets(), mesh.num_tets());
        assert!(loaded.is_sound());
    }

    #[test]
    fn msh_round_trips() {
        let path = scratch("grid.msh");
        let mesh = sample_mesh(2);
        save_mesh_msh(&path, &mesh, None).unwrap();
        let loaded = load_grid(&path).unwrap();
        assert_eq!(loaded.num_vertices(), mesh.num_vertices());
        assert_eq!(loaded.num_tets(), mesh.num_tets());
        assert!(loaded.is_sound());
    }

    #[test]
    fn msh_subset_keeps_only_selected_tets() {
        let path = scratch("subset.msh");
        let mesh = sample_mesh(1);
        let subset: Vec<TetId> = mesh.tets().map(|(t, _)| t).take(2).collect();
        save_mesh_msh(&path, &mesh, Some(&subset)).unwrap();
        let loaded = load_mesh_msh(&path).unwrap();
        assert_eq!(loaded.num_tets(), 2);
        assert_eq!(loaded.num_vertices(), mesh.num_vertices());
    }

    #[test]
    fn missing_grid_is_an_input_error() {
        let err = load_grid(Path::new("/nonexistent/grid.json")).unwrap_err();
        assert!(matches!(err, GridError::Unreadable { .. }));
        assert!(err.is_input());
    }

    #[test]
    fn malformed_grid_json_is_rejected() {
        let path = scratch("broken.json");
        fs::write(&path, "{\"vertices\": [[0, 0]]}").unwrap();
        let err = load_grid(&path).unwrap_err();
        assert!(matches!(err, GridError::Malformed { .. }));
    }

    #[test]
    fn out_of_range_tet_index_is_rejected() {
        let path = scratch("oob.json");
        fs::write(
            &path,
            r#"{"vertices": [[0,0,0],[1,0,0],[0,1,0],[0,0,1]], "tets": [[0,1,2,9]]}"#,
        )
        .unwrap();
        let err = load_grid(&path).unwrap_err();
        assert!(matches!(err, GridError::Malformed { .. }));
    }

    #[test]
    fn binary_msh_is_rejected() {
        let path = scratch("binary.msh");
        fs::write(&path, "$MeshFormat\n4.1 1 8\n$EndMeshFormat\n").unwrap();
        let err = load_mesh_msh(&path).unwrap_err();
        assert!(matches!(err, GridError::Malformed { .. }));
    }

    #[test]
    fn stats_report_round_trips() {
        let path = scratch("stats.json");
        let metrics = RefineMetrics {
            total_tet: 10,
            active_tet: 4,
            min_radius_ratio: 0.5,
            active_radius_ratio: 0.7,
            two_func_check: 3,
            three_func_check: 1,
            budget_exhausted: false,
            total_seconds: 0.0,
            active_tets: Vec::new(),
            vertex_values: HashMap::new(),
        };
        save_stats(&path, &metrics).unwrap();
        let report: StatsReport =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(report.total_tet, 10);
        assert_eq!(report.active_tet, 4);
        assert_eq!(report.two_func_check, 3);
    }
}
