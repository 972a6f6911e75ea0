use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by grid loading and refinement.
///
/// Reaching the element budget is not an error; it is reported through
/// [`crate::refinement::RefineMetrics::budget_exhausted`].
#[derive(Debug, Error)]
pub enum GridError {
    #[error("failed to read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Unwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed {what} file {}: {detail}", path.display())]
    Malformed {
        what: &'static str,
        path: PathBuf,
        detail: String,
    },
    #[error("CSG mode requires a CSG tree file")]
    MissingCsgTree,
    #[error("unknown refinement mode `{0}`, expected IA, MI or CSG")]
    UnknownMode(String),
    #[error("edge no longer exists; its owning tet was retired by an earlier split")]
    StaleEdge,
    #[error("tet has non-positive oriented volume")]
    FlippedTet,
    #[error("unknown vertex handle")]
    UnknownVertex,
    #[error("unknown tet handle")]
    UnknownTet,
    #[error("a face is shared by more than two tets; the grid is not a conforming tetrahedralization")]
    NonManifold,
}

impl GridError {
    /// Whether this error stems from unreadable or ill-formed inputs.
    pub const fn is_input(&self) -> bool {
        matches!(
            self,
            GridError::Unreadable { .. }
                | GridError::Malformed { .. }
                | GridError::MissingCsgTree
        )
    }

    /// Whether this error is a violated call precondition.
    pub const fn is_precondition(&self) -> bool {
        matches!(
            self,
            GridError::UnknownMode(_)
                | GridError::StaleEdge
                | GridError::FlippedTet
                | GridError::UnknownVertex
                | GridError::UnknownTet
                | GridError::NonManifold
        )
    }
}
