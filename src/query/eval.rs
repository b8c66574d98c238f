//! Query evaluation over a [`Document`] arena.
//!
//! Evaluation is purely synchronous and read-only; results are node ids of
//! the evaluated document in document order without duplicates.

use crate::document::{Document, NodeId, NodeKind};

use super::parser::{Axis, BoolExpr, CompareOp, LocationPath, NodeTest, Operand, Predicate, Query, Step};

/// Evaluate `query` with `context` as the context node.
pub fn evaluate(doc: &Document, query: &Query, context: NodeId) -> Vec<NodeId> {
    let mut out: Vec<NodeId> = query
        .paths
        .iter()
        .flat_map(|path| evaluate_path(doc, path, context))
        .collect();
    normalize(&mut out);
    out
}

fn evaluate_path(doc: &Document, path: &LocationPath, context: NodeId) -> Vec<NodeId> {
    let mut current = vec![if path.absolute { doc.root() } else { context }];

    let mut i = 0;
    while i < path.steps.len() {
        let step = &path.steps[i];

        // `//name` without positional predicates is a plain descendant scan.
        if is_plain_descendant_or_self(step) {
            if let Some(next) = path.steps.get(i + 1) {
                if next.axis == Axis::Child && !has_positional(next) {
                    let merged = Step {
                        axis: Axis::Descendant,
                        test: next.test.clone(),
                        predicates: next.predicates.clone(),
                    };
                    current = apply_step(doc, &merged, &current);
                    i += 2;
                    continue;
                }
            }
        }

        current = apply_step(doc, step, &current);
        i += 1;
        if current.is_empty() {
            break;
        }
    }

    current
}

fn is_plain_descendant_or_self(step: &Step) -> bool {
    step.axis == Axis::DescendantOrSelf && step.test == NodeTest::Node && step.predicates.is_empty()
}

fn has_positional(step: &Step) -> bool {
    step.predicates
        .iter()
        .any(|p| matches!(p, Predicate::Position(_) | Predicate::Last))
}

fn apply_step(doc: &Document, step: &Step, context: &[NodeId]) -> Vec<NodeId> {
    let mut out = Vec::new();
    for &node in context {
        let mut candidates: Vec<NodeId> = axis_nodes(doc, step.axis, node)
            .into_iter()
            .filter(|id| matches_test(doc, step.axis, &step.test, *id))
            .collect();

        for predicate in &step.predicates {
            candidates = apply_predicate(doc, predicate, candidates);
            if candidates.is_empty() {
                break;
            }
        }
        out.extend(candidates);
    }
    normalize(&mut out);
    out
}

/// Nodes along `axis`, in axis order (reverse axes nearest first).
fn axis_nodes(doc: &Document, axis: Axis, node: NodeId) -> Vec<NodeId> {
    match axis {
        Axis::Child => doc.children(node).to_vec(),
        Axis::Descendant => doc.descendants(node),
        Axis::DescendantOrSelf => {
            let mut nodes = vec![node];
            nodes.extend(doc.descendants(node));
            nodes
        }
        Axis::SelfNode => vec![node],
        Axis::Parent => doc.parent(node).into_iter().collect(),
        Axis::Ancestor => {
            let mut nodes = Vec::new();
            let mut cursor = doc.parent(node);
            while let Some(parent) = cursor {
                nodes.push(parent);
                cursor = doc.parent(parent);
            }
            nodes
        }
        Axis::Attribute => doc.attributes(node).to_vec(),
        Axis::FollowingSibling | Axis::PrecedingSibling => {
            if matches!(doc.kind(node), NodeKind::Attribute { .. }) {
                return Vec::new();
            }
            let Some(parent) = doc.parent(node) else {
                return Vec::new();
            };
            let siblings = doc.children(parent);
            let Some(at) = siblings.iter().position(|id| *id == node) else {
                return Vec::new();
            };
            if axis == Axis::FollowingSibling {
                siblings[at + 1..].to_vec()
            } else {
                siblings[..at].iter().rev().copied().collect()
            }
        }
    }
}

fn matches_test(doc: &Document, axis: Axis, test: &NodeTest, id: NodeId) -> bool {
    let kind = doc.kind(id);
    // the principal node type of the attribute axis is attribute, of every
    // other axis element
    let principal = match axis {
        Axis::Attribute => matches!(kind, NodeKind::Attribute { .. }),
        _ => matches!(kind, NodeKind::Element { .. }),
    };

    match test {
        NodeTest::Node => true,
        NodeTest::Text => matches!(kind, NodeKind::Text(_)),
        NodeTest::Any => principal,
        NodeTest::Name(name) => {
            principal
                && (doc.name(id) == Some(name.as_str()) || doc.local_name(id) == Some(name.as_str()))
        }
    }
}

fn apply_predicate(doc: &Document, predicate: &Predicate, candidates: Vec<NodeId>) -> Vec<NodeId> {
    match predicate {
        Predicate::Position(n) => candidates.get(n - 1).copied().into_iter().collect(),
        Predicate::Last => candidates.last().copied().into_iter().collect(),
        Predicate::Expr(expr) => candidates
            .into_iter()
            .filter(|id| test_expr(doc, expr, *id))
            .collect(),
    }
}

fn test_expr(doc: &Document, expr: &BoolExpr, node: NodeId) -> bool {
    match expr {
        BoolExpr::Or(a, b) => test_expr(doc, a, node) || test_expr(doc, b, node),
        BoolExpr::And(a, b) => test_expr(doc, a, node) && test_expr(doc, b, node),
        BoolExpr::Not(inner) => !test_expr(doc, inner, node),
        BoolExpr::Exists(path) => !evaluate_path(doc, path, node).is_empty(),
        BoolExpr::Compare { left, op, right } => {
            let numeric = matches!(left, Operand::Number(_)) || matches!(right, Operand::Number(_));
            let left = operand_values(doc, left, node);
            let right = operand_values(doc, right, node);
            left.iter()
                .any(|l| right.iter().any(|r| compare(l, *op, r, numeric)))
        }
        BoolExpr::Contains(haystack, needle) => {
            string_pairs(doc, haystack, needle, node, |h, n| h.contains(n))
        }
        BoolExpr::StartsWith(haystack, needle) => {
            string_pairs(doc, haystack, needle, node, |h, n| h.starts_with(n))
        }
    }
}

fn string_pairs(
    doc: &Document,
    haystack: &Operand,
    needle: &Operand,
    node: NodeId,
    check: impl Fn(&str, &str) -> bool,
) -> bool {
    // XPath string functions use the first node of a node-set
    let haystack = first_value(doc, haystack, node);
    let needle = first_value(doc, needle, node);
    match (haystack, needle) {
        (Some(h), Some(n)) => check(&h, &n),
        _ => false,
    }
}

fn first_value(doc: &Document, operand: &Operand, node: NodeId) -> Option<String> {
    operand_values(doc, operand, node).into_iter().next()
}

fn operand_values(doc: &Document, operand: &Operand, node: NodeId) -> Vec<String> {
    match operand {
        Operand::Literal(text) => vec![text.clone()],
        Operand::Number(n) => vec![format_number(*n)],
        Operand::Path(path) => evaluate_path(doc, path, node)
            .into_iter()
            .map(|id| doc.text_content(id))
            .collect(),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Equality compares strings unless a number literal is involved;
/// ordering always compares numbers.
fn compare(left: &str, op: CompareOp, right: &str, numeric: bool) -> bool {
    let numbers = || -> Option<(f64, f64)> {
        Some((left.trim().parse().ok()?, right.trim().parse().ok()?))
    };

    match op {
        CompareOp::Eq if numeric => numbers().map_or(false, |(l, r)| l == r),
        CompareOp::Neq if numeric => numbers().map_or(true, |(l, r)| l != r),
        CompareOp::Eq => left == right,
        CompareOp::Neq => left != right,
        CompareOp::Lt | CompareOp::Lte | CompareOp::Gt | CompareOp::Gte => match numbers() {
            Some((l, r)) => match op {
                CompareOp::Lt => l < r,
                CompareOp::Lte => l <= r,
                CompareOp::Gt => l > r,
                _ => l >= r,
            },
            None => false,
        },
    }
}

fn normalize(nodes: &mut Vec<NodeId>) {
    nodes.sort_unstable();
    nodes.dedup();
}
