//! Deterministic grid builders for lebgrid tests.
#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub type Vertex3 = [f64; 3];

/// Builds an axis-aligned `n`x`n`x`n` cube grid with six tets per cell,
/// anchored at `origin` with the given cell `spacing`.
///
/// Each cell is cut along its main diagonal into the six path tets of the
/// Kuhn subdivision, which is conforming across neighboring cells. All tets
/// are positively oriented.
pub fn cube_grid(n: usize, origin: Vertex3, spacing: f64) -> (Vec<Vertex3>, Vec<[usize; 4]>) {
    let stride = n + 1;
    let index = |i: usize, j: usize, k: usize| (i * stride + j) * stride + k;

    let mut vertices = Vec::with_capacity(stride * stride * stride);
    for i in 0..stride {
        for j in 0..stride {
            for k in 0..stride {
                vertices.push([
                    origin[0] + spacing * i as f64,
                    origin[1] + spacing * j as f64,
                    origin[2] + spacing * k as f64,
                ]);
            }
        }
    }

    // Axis insertion orders of the diagonal paths, with permutation parity.
    const PATHS: [([usize; 3], bool); 6] = [
        ([0, 1, 2], true),
        ([0, 2, 1], false),
        ([1, 0, 2], false),
        ([1, 2, 0], true),
        ([2, 0, 1], true),
        ([2, 1, 0], false),
    ];

    let mut tets = Vec::with_capacity(6 * n * n * n);
    for i in 0..n {
        for j in 0..n {
            for k in 0..n {
                for (axes, even) in PATHS {
                    let mut corner = [i, j, k];
                    let mut tet = [index(corner[0], corner[1], corner[2]); 4];
                    for (step, &axis) in axes.iter().enumerate() {
                        corner[axis] += 1;
                        tet[step + 1] = index(corner[0], corner[1], corner[2]);
                    }
                    if !even {
                        tet.swap(1, 2);
                    }
                    tets.push(tet);
                }
            }
        }
    }

    (vertices, tets)
}

/// A single positively oriented unit tet.
pub fn unit_tet() -> (Vec<Vertex3>, Vec<[usize; 4]>) {
    (
        vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ],
        vec![[0, 1, 2, 3]],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume6(a: Vertex3, b: Vertex3, c: Vertex3, d: Vertex3) -> f64 {
        let u = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
        let v = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
        let w = [d[0] - a[0], d[1] - a[1], d[2] - a[2]];
        u[0] * (v[1] * w[2] - v[2] * w[1]) - u[1] * (v[0] * w[2] - v[2] * w[0])
            + u[2] * (v[0] * w[1] - v[1] * w[0])
    }

    #[test]
    fn cube_grid_counts_and_orientation() {
        for n in [1, 2, 3] {
            let (vertices, tets) = cube_grid(n, [-1.0, -1.0, -1.0], 2.0 / n as f64);
            assert_eq!(vertices.len(), (n + 1).pow(3));
            assert_eq!(tets.len(), 6 * n.pow(3));
            let mut total = 0.0;
            for t in &tets {
                let vol = volume6(
                    vertices[t[0]],
                    vertices[t[1]],
                    vertices[t[2]],
                    vertices[t[3]],
                );
                assert!(vol > 0.0, "tet {t:?} is not positively oriented");
                total += vol / 6.0;
            }
            // The cells tile the cube exactly.
            assert!((total - 8.0).abs() < 1e-12);
        }
    }
}
