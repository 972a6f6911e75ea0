//! CSG trees over implicit functions, evaluated on value intervals.
//!
//! Functions are negative inside, so a union takes the elementwise interval
//! minimum and an intersection the maximum. Besides the combined interval,
//! evaluation reports which leaves can attain the combined bounds; the
//! refinement criteria ignore everything else.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use smallvec::SmallVec;

use crate::criteria::CsgOutcome;
use crate::error::GridError;
use crate::types::{Interval, FUNC_INLINE};

/// One node of a CSG tree.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum CsgNode {
    Union { children: Vec<CsgNode> },
    Intersect { children: Vec<CsgNode> },
    /// First child minus the remaining children.
    Subtract { children: Vec<CsgNode> },
    Negate { children: Vec<CsgNode> },
    Leaf { index: usize },
}

fn merge_active(
    into: &mut SmallVec<[usize; FUNC_INLINE]>,
    from: &SmallVec<[usize; FUNC_INLINE]>,
) {
    for &f in from {
        if !into.contains(&f) {
            into.push(f);
        }
    }
}

/// min-combination: the union surface. A child stays active iff it can
/// attain the minimum somewhere, i.e. its lower bound does not exceed the
/// other side's upper bound (ties propagate).
fn combine_min(a: CsgOutcome, b: CsgOutcome) -> CsgOutcome {
    let mut active = SmallVec::new();
    if a.interval[0] <= b.interval[1] {
        merge_active(&mut active, &a.active_functions);
    }
    if b.interval[0] <= a.interval[1] {
        merge_active(&mut active, &b.active_functions);
    }
    CsgOutcome {
        interval: [
            a.interval[0].min(b.interval[0]),
            a.interval[1].min(b.interval[1]),
        ],
        active_functions: active,
    }
}

/// max-combination: the intersection surface.
fn combine_max(a: CsgOutcome, b: CsgOutcome) -> CsgOutcome {
    let mut active = SmallVec::new();
    if a.interval[1] >= b.interval[0] {
        merge_active(&mut active, &a.active_functions);
    }
    if b.interval[1] >= a.interval[0] {
        merge_active(&mut active, &b.active_functions);
    }
    CsgOutcome {
        interval: [
            a.interval[0].max(b.interval[0]),
            a.interval[1].max(b.interval[1]),
        ],
        active_functions: active,
    }
}

fn negate(a: CsgOutcome) -> CsgOutcome {
    CsgOutcome {
        interval: [-a.interval[1], -a.interval[0]],
        active_functions: a.active_functions,
    }
}

impl CsgNode {
    /// Combines per-function value intervals through the tree.
    ///
    /// Leaf indices must have been checked against the function count (see
    /// [`CsgNode::validate`]).
    pub fn evaluate(&self, intervals: &[Interval]) -> CsgOutcome {
        match self {
            CsgNode::Leaf { index } => CsgOutcome {
                interval: intervals[*index],
                active_functions: std::iter::once(*index).collect(),
            },
            CsgNode::Union { children } => children
                .iter()
                .map(|c| c.evaluate(intervals))
                .reduce(combine_min)
                .unwrap_or_else(empty),
            CsgNode::Intersect { children } => children
                .iter()
                .map(|c| c.evaluate(intervals))
                .reduce(combine_max)
                .unwrap_or_else(empty),
            CsgNode::Subtract { children } => {
                let mut iter = children.iter();
                let Some(first) = iter.next() else {
                    return empty();
                };
                iter.fold(first.evaluate(intervals), |acc, c| {
                    combine_max(acc, negate(c.evaluate(intervals)))
                })
            }
            CsgNode::Negate { children } => children
                .first()
                .map(|c| negate(c.evaluate(intervals)))
                .unwrap_or_else(empty),
        }
    }

    /// Checks that every leaf names an existing function and every operator
    /// has the children it needs.
    pub fn validate(&self, num_functions: usize) -> Result<(), String> {
        match self {
            CsgNode::Leaf { index } => {
                if *index >= num_functions {
                    return Err(format!(
                        "leaf index {index} out of range for {num_functions} functions"
                    ));
                }
            }
            CsgNode::Negate { children } => {
                if children.len() != 1 {
                    return Err("negate takes exactly one child".to_string());
                }
                children[0].validate(num_functions)?;
            }
            CsgNode::Union { children }
            | CsgNode::Intersect { children }
            | CsgNode::Subtract { children } => {
                if children.is_empty() {
                    return Err("operator node without children".to_string());
                }
                for c in children {
                    c.validate(num_functions)?;
                }
            }
        }
        Ok(())
    }
}

fn empty() -> CsgOutcome {
    CsgOutcome {
        interval: [0.0, 0.0],
        active_functions: SmallVec::new(),
    }
}

/// Loads and validates a CSG tree file.
pub fn load_csg_tree(path: &Path, num_functions: usize) -> Result<CsgNode, GridError> {
    let text = fs::read_to_string(path).map_err(|source| GridError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let tree: CsgNode = serde_json::from_str(&text).map_err(|e| GridError::Malformed {
        what: "CSG tree",
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    tree.validate(num_functions)
        .map_err(|detail| GridError::Malformed {
            what: "CSG tree",
            path: path.to_path_buf(),
            detail,
        })?;
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(index: usize) -> CsgNode {
        CsgNode::Leaf { index }
    }

    #[test]
    fn union_takes_elementwise_minimum() {
        let tree = CsgNode::Union {
            children: vec![leaf(0), leaf(1)],
        };
        let out = tree.evaluate(&[[-1.0, 2.0], [-0.5, 1.0]]);
        assert_eq!(out.interval, [-1.0, 1.0]);
        assert_eq!(out.active_functions.as_slice(), &[0, 1]);
    }

    #[test]
    fn union_prunes_a_dominated_child() {
        // Child 1 is everywhere above child 0; it can never be the minimum.
        let tree = CsgNode::Union {
            children: vec![leaf(0), leaf(1)],
        };
        let out = tree.evaluate(&[[-2.0, -1.0], [3.0, 5.0]]);
        assert_eq!(out.interval, [-2.0, -1.0]);
        assert_eq!(out.active_functions.as_slice(), &[0]);
    }

    #[test]
    fn intersection_takes_elementwise_maximum() {
        let tree = CsgNode::Intersect {
            children: vec![leaf(0), leaf(1)],
        };
        let out = tree.evaluate(&[[-1.0, 2.0], [-0.5, 1.0]]);
        assert_eq!(out.interval, [-0.5, 2.0]);
        assert_eq!(out.active_functions.as_slice(), &[0, 1]);
    }

    #[test]
    fn subtract_negates_the_tail() {
        let tree = CsgNode::Subtract {
            children: vec![leaf(0), leaf(1)],
        };
        // a - b = max(a, -b).
        let out = tree.evaluate(&[[-1.0, 2.0], [-3.0, -2.0]]);
        assert_eq!(out.interval, [2.0, 3.0]);
        // a never attains the maximum: -b is at least 2, a at most 2 (tie).
        assert_eq!(out.active_functions.as_slice(), &[0, 1]);
    }

    #[test]
    fn negate_flips_the_interval() {
        let tree = CsgNode::Negate {
            children: vec![leaf(0)],
        };
        let out = tree.evaluate(&[[-1.0, 2.0]]);
        assert_eq!(out.interval, [-2.0, 1.0]);
    }

    #[test]
    fn tree_parses_from_json_schema() {
        let json = r#"{
            "op": "subtract",
            "children": [
                {"op": "union", "children": [{"op": "leaf", "index": 0}, {"op": "leaf", "index": 1}]},
                {"op": "leaf", "index": 2}
            ]
        }"#;
        let tree: CsgNode = serde_json::from_str(json).unwrap();
        tree.validate(3).unwrap();
        let out = tree.evaluate(&[[-1.0, 1.0], [0.5, 2.0], [-4.0, -3.0]]);
        // union = [-1, 1]; minus leaf2 = max([-1, 1], [3, 4]) = [3, 4].
        assert_eq!(out.interval, [3.0, 4.0]);
        assert_eq!(out.active_functions.as_slice(), &[2]);
    }

    #[test]
    fn out_of_range_leaf_fails_validation() {
        let tree = CsgNode::Union {
            children: vec![leaf(0), leaf(7)],
        };
        assert!(tree.validate(2).is_err());
    }
}
