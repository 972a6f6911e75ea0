//! # lebgrid
//!
//! Adaptive tetrahedral background grids for implicit complexes via
//! longest-edge bisection.
//!
//! Starting from a coarse conforming tetrahedralization, [`refine`]
//! repeatedly bisects the longest edge of any tet whose interior is not yet
//! well approximated by linear interpolation of the implicit functions at
//! its corners, under an implicit-arrangement, material-interface or CSG
//! reading of the function set.
//!
//! ```
//! use lebgrid::{refine, Mode, RefineOptions, TetMesh};
//! use lebgrid::types::{FuncGrad, FuncTable};
//!
//! let mut mesh = TetMesh::new();
//! let v0 = mesh.add_vertex(0.0, 0.0, 0.0);
//! let v1 = mesh.add_vertex(1.0, 0.0, 0.0);
//! let v2 = mesh.add_vertex(0.0, 1.0, 0.0);
//! let v3 = mesh.add_vertex(0.0, 0.0, 1.0);
//! mesh.add_tet(v0, v1, v2, v3).unwrap();
//! mesh.initialize_connectivity().unwrap();
//!
//! // One sphere of radius 0.3 around the origin.
//! let eval = |p: [f64; 3]| -> FuncTable {
//!     let d2 = p[0] * p[0] + p[1] * p[1] + p[2] * p[2];
//!     std::iter::once(FuncGrad::new(d2 - 0.09, 2.0 * p[0], 2.0 * p[1], 2.0 * p[2])).collect()
//! };
//! let options = RefineOptions::new(Mode::ImplicitArrangement, 1, 0.05);
//! let metrics = refine(&mut mesh, &options, &eval, None).unwrap();
//! assert!(metrics.active_tet > 0);
//! ```
#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub use error::GridError;
pub use refinement::{refine, Mode, RefineMetrics, RefineOptions};
pub use tetmesh::{EdgeId, Tet, TetId, TetMesh, VertexId};

pub mod criteria;
pub mod csg;
pub mod error;
pub mod implicit;
pub mod io;
pub mod quality;
pub mod refinement;
pub mod tetmesh;
pub mod types;
