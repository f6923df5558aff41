//! Dependency analysis: reference extraction, graph construction, and
//! deterministic topological ordering.
//!
//! Every expression-bearing field of every step is walked for `${...}`
//! references. A scope stack tracks loop variables (`item`, `acc`, `a`,
//! `b`, `$index`, the loop's `as` name, and inner loop-step names) so they
//! never surface as dependencies. The graph is built with `petgraph`;
//! ordering is Kahn's algorithm with an original-position tie-break so the
//! order is stable across runs.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;

use rpcflow_types::flow::{Flow, Step, StepBody};

use crate::error::{FlowError, Result};
use crate::expression;
use crate::scope::INDEX_VAR;

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

/// The result of dependency analysis over a flow.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Deterministic topological execution order.
    order: Vec<String>,
    /// Immediate dependencies per step.
    dependencies: HashMap<String, BTreeSet<String>>,
    /// Immediate dependents per step (reverse edges).
    dependents: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Steps in topological order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Immediate dependencies of a step.
    pub fn dependencies_of(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.dependencies.get(name)
    }

    /// Immediate dependents of a step.
    pub fn dependents_of(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.dependents.get(name)
    }

    /// All steps that transitively depend on `name` (excluding `name`).
    pub fn transitive_dependents(&self, name: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(dependents) = self.dependents.get(&current) {
                for dependent in dependents {
                    if seen.insert(dependent.clone()) {
                        stack.push(dependent.clone());
                    }
                }
            }
        }
        seen
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Analyze a flow: extract references, validate them, and order the steps.
pub fn resolve_dependencies(flow: &Flow) -> Result<DependencyGraph> {
    let known: HashSet<&str> = flow.steps.iter().map(|s| s.name.as_str()).collect();

    let mut dependencies: HashMap<String, BTreeSet<String>> = HashMap::new();
    for step in &flow.steps {
        let mut refs = BTreeSet::new();
        let mut scoped = HashSet::new();
        collect_step_refs(step, &mut scoped, &mut refs);

        for dependency in &refs {
            if !known.contains(dependency.as_str()) {
                return Err(FlowError::UnknownDependency {
                    step: step.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        dependencies.insert(step.name.clone(), refs);
    }

    let order = topological_order(flow, &dependencies)?;

    let mut dependents: HashMap<String, BTreeSet<String>> = flow
        .steps
        .iter()
        .map(|s| (s.name.clone(), BTreeSet::new()))
        .collect();
    for (step, deps) in &dependencies {
        for dep in deps {
            dependents
                .entry(dep.clone())
                .or_default()
                .insert(step.clone());
        }
    }

    Ok(DependencyGraph {
        order,
        dependencies,
        dependents,
    })
}

fn topological_order(
    flow: &Flow,
    dependencies: &HashMap<String, BTreeSet<String>>,
) -> Result<Vec<String>> {
    let n = flow.steps.len();
    let index_of: HashMap<&str, usize> = flow
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();

    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<NodeIndex> = (0..n).map(|i| graph.add_node(i)).collect();
    for (i, step) in flow.steps.iter().enumerate() {
        for dep in &dependencies[&step.name] {
            let j = index_of[dep.as_str()];
            if i == j {
                return Err(FlowError::CircularDependency {
                    path: vec![step.name.clone(), step.name.clone()],
                });
            }
            graph.add_edge(nodes[j], nodes[i], ());
        }
    }

    let mut indegree: Vec<usize> = nodes
        .iter()
        .map(|&node| graph.neighbors_directed(node, Direction::Incoming).count())
        .collect();

    // Kahn's algorithm; the heap breaks ties by original step position.
    let mut heap: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(n);
    let mut placed = vec![false; n];
    while let Some(Reverse(i)) = heap.pop() {
        placed[i] = true;
        order.push(flow.steps[i].name.clone());
        for neighbor in graph.neighbors_directed(nodes[i], Direction::Outgoing) {
            let j = graph[neighbor];
            indegree[j] -= 1;
            if indegree[j] == 0 {
                heap.push(Reverse(j));
            }
        }
    }

    if order.len() < n {
        let remaining: HashSet<&str> = flow
            .steps
            .iter()
            .enumerate()
            .filter(|(i, _)| !placed[*i])
            .map(|(_, s)| s.name.as_str())
            .collect();
        return Err(FlowError::CircularDependency {
            path: find_cycle(flow, dependencies, &remaining),
        });
    }

    Ok(order)
}

/// Reconstruct one cycle among the unplaceable steps, returned as a path
/// that starts and ends on the same step.
fn find_cycle(
    flow: &Flow,
    dependencies: &HashMap<String, BTreeSet<String>>,
    remaining: &HashSet<&str>,
) -> Vec<String> {
    let start = flow
        .steps
        .iter()
        .map(|s| s.name.as_str())
        .find(|name| remaining.contains(name))
        .unwrap_or_default()
        .to_string();

    let mut path = vec![start.clone()];
    let mut positions: HashMap<String, usize> = HashMap::from([(start, 0)]);
    loop {
        let current = path.last().expect("path is never empty").clone();
        let next = dependencies
            .get(&current)
            .and_then(|deps| deps.iter().find(|d| remaining.contains(d.as_str())))
            .cloned();
        let Some(next) = next else {
            // Should not happen for nodes left behind by Kahn; bail with
            // what we have.
            return path;
        };
        if let Some(&at) = positions.get(&next) {
            let mut cycle: Vec<String> = path[at..].to_vec();
            cycle.push(next);
            return cycle;
        }
        positions.insert(next.clone(), path.len());
        path.push(next);
    }
}

// ---------------------------------------------------------------------------
// Reference walking
// ---------------------------------------------------------------------------

fn collect_step_refs(step: &Step, scoped: &mut HashSet<String>, out: &mut BTreeSet<String>) {
    match &step.body {
        StepBody::Request(request) => collect_value(&request.params, scoped, out),
        StepBody::Transform(transform) => {
            collect_value(&transform.input, scoped, out);
            let added = add_scoped(
                scoped,
                ["item", "acc", "a", "b", INDEX_VAR].map(String::from),
            );
            for op in &transform.operations {
                collect_expr(&op.using, scoped, out);
                if let Some(initial) = &op.initial {
                    collect_value(initial, scoped, out);
                }
            }
            remove_scoped(scoped, added);
        }
        StepBody::Condition(condition) => {
            collect_expr(&condition.condition, scoped, out);
            collect_step_refs(&condition.then, scoped, out);
            if let Some(otherwise) = &condition.otherwise {
                collect_step_refs(otherwise, scoped, out);
            }
        }
        StepBody::Loop(body) => {
            collect_expr(&body.over, scoped, out);
            let mut names = vec![
                "item".to_string(),
                INDEX_VAR.to_string(),
                body.item_var.clone(),
            ];
            if let Some(steps) = &body.steps {
                // Inner steps may reference each other's per-iteration
                // results by name.
                names.extend(steps.iter().map(|s| s.name.clone()));
            }
            let added = add_scoped(scoped, names);
            if let Some(condition) = &body.condition {
                collect_expr(condition, scoped, out);
            }
            if let Some(inner) = &body.step {
                collect_step_refs(inner, scoped, out);
            }
            if let Some(steps) = &body.steps {
                for inner in steps {
                    collect_step_refs(inner, scoped, out);
                }
            }
            remove_scoped(scoped, added);
        }
        StepBody::Stop(_) => {}
        StepBody::Delay(delay) => collect_step_refs(&delay.step, scoped, out),
        StepBody::Aggregate(_) => {}
    }
}

fn collect_expr(expr: &str, scoped: &HashSet<String>, out: &mut BTreeSet<String>) {
    out.extend(expression::extract_references(expr, scoped));
}

fn collect_value(value: &Value, scoped: &HashSet<String>, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => collect_expr(s, scoped, out),
        Value::Array(items) => {
            for item in items {
                collect_value(item, scoped, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_value(item, scoped, out);
            }
        }
        _ => {}
    }
}

/// Add names to the scope set, returning only those newly inserted so
/// outer frames survive removal.
fn add_scoped(
    scoped: &mut HashSet<String>,
    names: impl IntoIterator<Item = String>,
) -> Vec<String> {
    names
        .into_iter()
        .filter(|name| scoped.insert(name.clone()))
        .collect()
}

fn remove_scoped(scoped: &mut HashSet<String>, added: Vec<String>) {
    for name in added {
        scoped.remove(&name);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
