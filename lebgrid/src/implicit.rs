//! The implicit-function library: typed scalar fields with analytic
//! gradients, loaded from JSON.
//!
//! Closed surfaces (sphere, cylinder, torus) are signed distances, negative
//! inside; a plane is positive on the side its normal points to. The engine
//! never sees these types directly, only the evaluator closure built by
//! [`make_evaluator`].

use std::fs;
use std::path::Path;

use nalgebra::{Matrix3, Vector3};
use serde::Deserialize;

use crate::error::GridError;
use crate::types::{FuncGrad, FuncTable, Vertex3};

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ImplicitFunction {
    Sphere {
        center: [f64; 3],
        radius: f64,
    },
    Plane {
        point: [f64; 3],
        normal: [f64; 3],
    },
    Cylinder {
        axis_point: [f64; 3],
        axis_direction: [f64; 3],
        radius: f64,
    },
    Torus {
        center: [f64; 3],
        axis: [f64; 3],
        major_radius: f64,
        minor_radius: f64,
    },
    /// General quadric `x^T Q x + b . x + c`.
    Generic {
        quadratic: [[f64; 3]; 3],
        linear: [f64; 3],
        constant: f64,
    },
}

impl ImplicitFunction {
    /// Value and gradient at a point. Fields with a gradient singularity
    /// (sphere center, cylinder axis, torus spine) report a zero gradient
    /// there.
    pub fn evaluate_gradient(&self, p: Vertex3) -> FuncGrad {
        let p = Vector3::from(p);
        match self {
            ImplicitFunction::Sphere { center, radius } => {
                let d = p - Vector3::from(*center);
                let n = d.norm();
                if n > 0.0 {
                    let g = d / n;
                    FuncGrad::new(n - radius, g.x, g.y, g.z)
                } else {
                    FuncGrad::new(-radius, 0.0, 0.0, 0.0)
                }
            }
            ImplicitFunction::Plane { point, normal } => {
                let n = Vector3::from(*normal);
                let value = n.dot(&(p - Vector3::from(*point)));
                FuncGrad::new(value, n.x, n.y, n.z)
            }
            ImplicitFunction::Cylinder {
                axis_point,
                axis_direction,
                radius,
            } => {
                let axis = Vector3::from(*axis_direction).normalize();
                let rel = p - Vector3::from(*axis_point);
                let radial = rel - axis * rel.dot(&axis);
                let n = radial.norm();
                if n > 0.0 {
                    let g = radial / n;
                    FuncGrad::new(n - radius, g.x, g.y, g.z)
                } else {
                    FuncGrad::new(-radius, 0.0, 0.0, 0.0)
                }
            }
            ImplicitFunction::Torus {
                center,
                axis,
                major_radius,
                minor_radius,
            } => {
                let axis = Vector3::from(*axis).normalize();
                let rel = p - Vector3::from(*center);
                let h = rel.dot(&axis);
                let radial = rel - axis * h;
                let rho = radial.norm();
                let s = ((rho - major_radius) * (rho - major_radius) + h * h).sqrt();
                if rho > 0.0 && s > 0.0 {
                    let g = radial * ((rho - major_radius) / (s * rho)) + axis * (h / s);
                    FuncGrad::new(s - minor_radius, g.x, g.y, g.z)
                } else {
                    // On the axis or the spine circle the distance field has
                    // no unique gradient.
                    FuncGrad::new(s - minor_radius, 0.0, 0.0, 0.0)
                }
            }
            ImplicitFunction::Generic {
                quadratic,
                linear,
                constant,
            } => {
                let q = Matrix3::from_fn(|r, c| quadratic[r][c]);
                let b = Vector3::from(*linear);
                let value = (q * p).dot(&p) + b.dot(&p) + constant;
                let g = (q + q.transpose()) * p + b;
                FuncGrad::new(value, g.x, g.y, g.z)
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FunctionFile {
    List(Vec<ImplicitFunction>),
    Wrapped { input: Vec<ImplicitFunction> },
}

/// Loads an implicit-function file: either a bare JSON list or an object
/// with an `input` list.
pub fn load_functions(path: &Path) -> Result<Vec<ImplicitFunction>, GridError> {
    let text = fs::read_to_string(path).map_err(|source| GridError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let file: FunctionFile = serde_json::from_str(&text).map_err(|e| GridError::Malformed {
        what: "function",
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    Ok(match file {
        FunctionFile::List(functions) | FunctionFile::Wrapped { input: functions } => functions,
    })
}

/// Builds the refinement engine's evaluator over a function list.
pub fn make_evaluator(
    functions: &[ImplicitFunction],
) -> impl Fn(Vertex3) -> FuncTable + Sync + '_ {
    move |p| functions.iter().map(|f| f.evaluate_gradient(p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finite_difference(f: &ImplicitFunction, p: Vertex3) -> [f64; 3] {
        let h = 1e-6;
        let mut grad = [0.0; 3];
        for k in 0..3 {
            let mut lo = p;
            let mut hi = p;
            lo[k] -= h;
            hi[k] += h;
            grad[k] =
                (f.evaluate_gradient(hi)[0] - f.evaluate_gradient(lo)[0]) / (2.0 * h);
        }
        grad
    }

    fn assert_gradient_matches(f: &ImplicitFunction, points: &[Vertex3]) {
        for &p in points {
            let eval = f.evaluate_gradient(p);
            let fd = finite_difference(f, p);
            for k in 0..3 {
                assert!(
                    (eval[k + 1] - fd[k]).abs() < 1e-5,
                    "gradient mismatch at {p:?}: analytic {:?}, finite difference {fd:?}",
                    [eval[1], eval[2], eval[3]],
                );
            }
        }
    }

    const PROBES: [Vertex3; 4] = [
        [0.7, 0.3, -0.4],
        [-0.9, 0.5, 0.1],
        [0.2, -0.8, 0.6],
        [1.3, 1.1, -0.7],
    ];

    #[test]
    fn sphere_is_a_signed_distance() {
        let f = ImplicitFunction::Sphere {
            center: [0.1, 0.0, 0.0],
            radius: 0.5,
        };
        assert!(f.evaluate_gradient([0.1, 0.0, 0.0])[0] < 0.0, "negative inside");
        assert!(f.evaluate_gradient([2.0, 0.0, 0.0])[0] > 0.0, "positive outside");
        assert!((f.evaluate_gradient([0.6, 0.0, 0.0])[0]).abs() < 1e-12);
        assert_gradient_matches(&f, &PROBES);
    }

    #[test]
    fn plane_gradient_is_its_normal() {
        let f = ImplicitFunction::Plane {
            point: [0.0, 0.0, 1.0],
            normal: [0.0, 0.0, 2.0],
        };
        let eval = f.evaluate_gradient([5.0, -3.0, 1.5]);
        assert!((eval[0] - 1.0).abs() < 1e-12);
        assert_eq!([eval[1], eval[2], eval[3]], [0.0, 0.0, 2.0]);
        assert_gradient_matches(&f, &PROBES);
    }

    #[test]
    fn cylinder_distance_and_gradient() {
        let f = ImplicitFunction::Cylinder {
            axis_point: [0.0, 0.0, 0.0],
            axis_direction: [0.0, 0.0, 3.0],
            radius: 0.5,
        };
        // Distance is measured from the axis, at any height.
        assert!((f.evaluate_gradient([1.0, 0.0, 7.0])[0] - 0.5).abs() < 1e-12);
        assert_gradient_matches(&f, &PROBES);
    }

    #[test]
    fn torus_distance_and_gradient() {
        let f = ImplicitFunction::Torus {
            center: [0.0, 0.0, 0.0],
            axis: [0.0, 0.0, 1.0],
            major_radius: 1.0,
            minor_radius: 0.25,
        };
        // On the spine circle the distance is -minor_radius.
        assert!((f.evaluate_gradient([1.0, 0.0, 0.0])[0] + 0.25).abs() < 1e-12);
        assert_gradient_matches(&f, &PROBES);
    }

    #[test]
    fn quadric_gradient() {
        let f = ImplicitFunction::Generic {
            quadratic: [[1.0, 0.5, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, -1.0]],
            linear: [0.0, -1.0, 0.5],
            constant: -0.25,
        };
        assert_gradient_matches(&f, &PROBES);
    }

    #[test]
    fn function_file_accepts_both_shapes() {
        let bare = r#"[{"type": "sphere", "center": [0.0, 0.0, 0.0], "radius": 1.0}]"#;
        let wrapped = r#"{"input": [
            {"type": "sphere", "center": [0.0, 0.0, 0.0], "radius": 1.0},
            {"type": "plane", "point": [0.0, 0.0, 0.0], "normal": [1.0, 0.0, 0.0]}
        ]}"#;
        let parse = |s: &str| -> Vec<ImplicitFunction> {
            match serde_json::from_str::<FunctionFile>(s).unwrap() {
                FunctionFile::List(l) | FunctionFile::Wrapped { input: l } => l,
            }
        };
        assert_eq!(parse(bare).len(), 1);
        assert_eq!(parse(wrapped).len(), 2);
    }
}
