//! Shared scalar and container aliases.

use nalgebra::RowVector4;
use smallvec::SmallVec;

/// A 3D coordinate.
pub type Vertex3 = [f64; 3];

/// Inline capacity of per-function buffers; complexes rarely combine more
/// functions than this, so the hot path stays allocation-free.
pub const FUNC_INLINE: usize = 20;

/// Value and gradient of one implicit function at one point:
/// `[f, df/dx, df/dy, df/dz]`.
pub type FuncGrad = RowVector4<f64>;

/// Per-point table with one [`FuncGrad`] entry per implicit function.
pub type FuncTable = SmallVec<[FuncGrad; FUNC_INLINE]>;

/// Closed value interval `[lo, hi]`.
pub type Interval = [f64; 2];
