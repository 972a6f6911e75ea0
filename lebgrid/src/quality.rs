//! Tet shape quality.

use nalgebra::{Matrix3, Vector3};

use crate::types::Vertex3;

/// Radius ratio `3 r_in / r_circ` of a tet: 1 for the regular tet, tending
/// to 0 as the tet degenerates.
pub fn radius_ratio(corners: &[Vertex3; 4]) -> f64 {
    let [a, b, c, d] = corners.map(Vector3::from);

    let ab = b - a;
    let ac = c - a;
    let ad = d - a;
    let volume = ab.cross(&ac).dot(&ad).abs() / 6.0;

    let area_sum = 0.5
        * ((c - b).cross(&(d - b)).norm()
            + ac.cross(&ad).norm()
            + ab.cross(&ad).norm()
            + ab.cross(&ac).norm());
    if !(volume > 0.0) || !(area_sum > 0.0) {
        return 0.0;
    }
    let r_in = 3.0 * volume / area_sum;

    // Circumcenter o satisfies 2 (p_i - a) . o = |p_i|^2 - |a|^2.
    let m = Matrix3::from_rows(&[
        (2.0 * ab).transpose(),
        (2.0 * ac).transpose(),
        (2.0 * ad).transpose(),
    ]);
    let rhs = Vector3::new(
        b.norm_squared() - a.norm_squared(),
        c.norm_squared() - a.norm_squared(),
        d.norm_squared() - a.norm_squared(),
    );
    match m.lu().solve(&rhs) {
        Some(center) => {
            let r_circ = (center - a).norm();
            if r_circ > 0.0 {
                3.0 * r_in / r_circ
            } else {
                0.0
            }
        }
        None => 0.0,
    }
}
