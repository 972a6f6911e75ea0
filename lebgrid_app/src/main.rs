//! Adaptive background grid generator.
//!
//! Reads an initial tet grid and an implicit function file, refines the grid
//! by longest-edge bisection until the configured complex is resolved, and
//! writes the refined grid, the active subset and the run reports.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use lebgrid::csg::load_csg_tree;
use lebgrid::implicit::{load_functions, make_evaluator};
use lebgrid::types::Interval;
use lebgrid::{io, refine, GridError, Mode, RefineOptions};

/// Longest edge bisection refinement.
#[derive(Parser, Debug)]
#[command(name = "gridgen")]
#[command(about = "Adaptive background grids for implicit complexes")]
struct Args {
    /// Initial grid file (.json grid, or Gmsh ASCII .msh).
    grid: PathBuf,

    /// Implicit function file.
    function: PathBuf,

    /// Error threshold; smaller refines further.
    #[arg(short = 't', long, default_value_t = 1e-3)]
    threshold: f64,

    /// Alpha quality factor; infinity disables the quality feedback.
    #[arg(short = 'a', long, default_value_t = f64::INFINITY)]
    alpha: f64,

    /// Modality of the implicit complex: IA, CSG or MI.
    #[arg(short = 'o', long = "option", default_value = "IA")]
    mode: String,

    /// CSG tree file (required in CSG mode).
    #[arg(long)]
    tree: Option<PathBuf>,

    /// Maximum number of grid elements.
    #[arg(short = 'm', long)]
    max_elements: Option<usize>,

    /// Shortest edge length; edges at or below it are not refined.
    #[arg(short = 's', long = "shortest-edge", default_value_t = 0.0)]
    smallest_edge: f64,

    /// Generate the curve network only.
    #[arg(short = 'c', long)]
    curve_network: bool,

    /// Also save grid.json and function_value.json for later discretization.
    #[arg(short = 'd', long = "discretize")]
    discretize_later: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mode: Mode = args.mode.parse()?;
    let mut mesh = io::load_grid(&args.grid).context("reading the initial grid")?;
    let functions = load_functions(&args.function).context("reading the function file")?;
    let num_functions = functions.len();
    log::info!(
        "loaded {} tets, {} vertices, {} functions",
        mesh.num_tets(),
        mesh.num_vertices(),
        num_functions
    );

    let csg_tree = match (mode, &args.tree) {
        (Mode::Csg, Some(path)) => {
            Some(load_csg_tree(path, num_functions).context("reading the CSG tree")?)
        }
        (Mode::Csg, None) => return Err(GridError::MissingCsgTree.into()),
        _ => None,
    };

    let mut options = RefineOptions::new(mode, num_functions, args.threshold);
    options.alpha = args.alpha;
    options.curve_network = args.curve_network;
    options.smallest_edge = args.smallest_edge;
    if let Some(max) = args.max_elements {
        options.max_elements = max;
    }

    let evaluator = make_evaluator(&functions);
    let csg_closure = csg_tree
        .as_ref()
        .map(|tree| move |intervals: &[Interval]| tree.evaluate(intervals));
    let csg_eval = csg_closure
        .as_ref()
        .map(|f| f as &dyn Fn(&[Interval]) -> lebgrid::criteria::CsgOutcome);

    let mut metrics = refine(&mut mesh, &options, &evaluator, csg_eval)?;

    io::save_mesh_msh(Path::new("tet_grid.msh"), &mesh, None)?;
    io::save_mesh_msh(Path::new("active_tets.msh"), &mesh, Some(&metrics.active_tets))?;
    io::save_timings(Path::new("timings.json"), metrics.total_seconds)?;
    io::save_stats(Path::new("stats.json"), &metrics)?;

    if args.discretize_later {
        // A run cut short by the element budget may hold vertices the
        // engine never evaluated; top them up for the discretization tools.
        let missing: Vec<_> = mesh
            .vertices()
            .filter(|(v, _)| !metrics.vertex_values.contains_key(v))
            .map(|(v, &p)| (v, p))
            .collect();
        for (v, p) in missing {
            metrics.vertex_values.insert(v, evaluator(p));
        }
        io::save_grid_json(Path::new("grid.json"), &mesh)?;
        io::save_function_values(
            Path::new("function_value.json"),
            &mesh,
            &metrics.vertex_values,
        )?;
    }

    println!(
        "total_tet: {}  active_tet: {}  two_func_check: {}  three_func_check: {}",
        metrics.total_tet, metrics.active_tet, metrics.two_func_check, metrics.three_func_check
    );
    println!("total_time: {:.3}s", metrics.total_seconds);
    Ok(())
}
