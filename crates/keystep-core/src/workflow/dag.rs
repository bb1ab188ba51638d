//! Graph compiler: dependency validation, cycle detection, and level computation.
//!
//! Uses `petgraph` to model step dependencies as a directed graph (edge from
//! dependency to dependent). Levels are peeled off by in-degree: every step
//! whose remaining in-degree is zero joins the next level, then its outgoing
//! edges are removed. Steps left over once no progress is possible sit on or
//! behind a cycle.

use std::collections::{HashMap, HashSet};

use keystep_types::workflow::WorkflowDefinition;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use super::definition::{WorkflowError, validate_definition};

// ---------------------------------------------------------------------------
// Execution plan
// ---------------------------------------------------------------------------

/// Steps partitioned into ordered levels.
///
/// Every dependency of a step in level `i` lies in a level `< i`. Steps within
/// a level have no dependency among them and carry no ordering guarantee; they
/// are listed in definition order only so that the plan is reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub levels: Vec<Vec<String>>,
}

impl ExecutionPlan {
    /// Number of steps across all levels.
    pub fn step_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Index of the level containing `step`.
    pub fn level_of(&self, step: &str) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.iter().any(|s| s == step))
    }
}

/// Compile a workflow definition into an execution plan.
///
/// Fails with `DuplicateStep` / `ValidationError` for structural problems,
/// `UnknownDependency` when a step references a missing step, and
/// `CycleDetected` (naming the steps that could not be scheduled) when the
/// dependency relation is not a DAG. Pure: repeated calls on the same
/// definition return identical plans.
pub fn compile(definition: &WorkflowDefinition) -> Result<ExecutionPlan, WorkflowError> {
    validate_definition(definition)?;

    let steps = &definition.steps;
    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<NodeIndex> = steps
        .iter()
        .map(|s| graph.add_node(s.name.as_str()))
        .collect();
    let name_to_idx: HashMap<&str, NodeIndex> = steps
        .iter()
        .zip(&node_indices)
        .map(|(s, idx)| (s.name.as_str(), *idx))
        .collect();

    for (step, &to_idx) in steps.iter().zip(&node_indices) {
        for dep in &step.depends_on {
            let from_idx = name_to_idx.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency {
                    step: step.name.clone(),
                    dependency: dep.clone(),
                }
            })?;
            // A dependency listed twice is still a single edge.
            graph.update_edge(*from_idx, to_idx, ());
        }
    }

    let mut in_degree: Vec<usize> = node_indices
        .iter()
        .map(|&idx| graph.neighbors_directed(idx, Direction::Incoming).count())
        .collect();
    let mut placed = vec![false; steps.len()];
    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut remaining = steps.len();

    while remaining > 0 {
        // Definition order within a level.
        let ready: Vec<usize> = (0..steps.len())
            .filter(|&i| !placed[i] && in_degree[i] == 0)
            .collect();

        if ready.is_empty() {
            let stuck = (0..steps.len())
                .filter(|&i| !placed[i])
                .map(|i| steps[i].name.clone())
                .collect();
            return Err(WorkflowError::CycleDetected(stuck));
        }

        for &i in &ready {
            placed[i] = true;
            for dependent in graph.neighbors_directed(node_indices[i], Direction::Outgoing) {
                in_degree[dependent.index()] -= 1;
            }
        }
        remaining -= ready.len();
        levels.push(ready.into_iter().map(|i| steps[i].name.clone()).collect());
    }

    Ok(ExecutionPlan { levels })
}

// ---------------------------------------------------------------------------
// Transitive dependency closure
// ---------------------------------------------------------------------------

/// Returns the transitive closure of all dependencies for a given step.
///
/// If `step_name` is not found, returns an empty vec.
pub fn get_step_dependencies<'a>(step_name: &str, definition: &'a WorkflowDefinition) -> Vec<&'a str> {
    let step_map: HashMap<&str, _> = definition
        .steps
        .iter()
        .map(|s| (s.name.as_str(), s))
        .collect();

    let mut visited = HashSet::new();
    let mut stack = vec![step_name];

    while let Some(current) = stack.pop() {
        if let Some(step) = step_map.get(current) {
            for dep in &step.depends_on {
                if visited.insert(dep.as_str()) {
                    stack.push(dep.as_str());
                }
            }
        }
    }

    visited.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use keystep_types::workflow::{ErrorPolicy, Outputs, StepDefinition};

    fn step(name: &str, depends_on: Vec<&str>) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            handler: "echo".to_string(),
            depends_on: depends_on.into_iter().map(String::from).collect(),
            config: Outputs::new(),
            outputs: vec![],
            on_error: ErrorPolicy::default(),
            timeout_secs: None,
        }
    }

    fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "test-wf".to_string(),
            version: "1.0.0".to_string(),
            description: None,
            steps,
        }
    }

    fn levels(plan: &ExecutionPlan) -> Vec<Vec<&str>> {
        plan.levels
            .iter()
            .map(|l| l.iter().map(String::as_str).collect())
            .collect()
    }

    /// Every step sits strictly after all of its dependencies.
    fn assert_level_invariant(def: &WorkflowDefinition, plan: &ExecutionPlan) {
        assert_eq!(plan.step_count(), def.steps.len());
        for s in &def.steps {
            let own = plan.level_of(&s.name).expect("step placed");
            for dep in &s.depends_on {
                let dep_level = plan.level_of(dep).expect("dependency placed");
                assert!(dep_level < own, "{dep} must precede {}", s.name);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Level computation
    // -----------------------------------------------------------------------

    #[test]
    fn test_no_dependencies_single_level() {
        let def = workflow(vec![step("a", vec![]), step("b", vec![]), step("c", vec![])]);
        let plan = compile(&def).unwrap();
        assert_eq!(levels(&plan), vec![vec!["a", "b", "c"]]);
    }

    #[test]
    fn test_linear_chain_n_levels() {
        let def = workflow(vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["b"]),
        ]);
        let plan = compile(&def).unwrap();
        assert_eq!(levels(&plan), vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_diamond_three_levels() {
        // A -> {B, C} -> D
        let def = workflow(vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["a"]),
            step("d", vec!["b", "c"]),
        ]);
        let plan = compile(&def).unwrap();
        assert_eq!(levels(&plan), vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
        assert_level_invariant(&def, &plan);
    }

    #[test]
    fn test_declaration_order_does_not_matter() {
        let def = workflow(vec![
            step("d", vec!["b", "c"]),
            step("c", vec!["a"]),
            step("b", vec!["a"]),
            step("a", vec![]),
        ]);
        let plan = compile(&def).unwrap();
        assert_eq!(levels(&plan), vec![vec!["a"], vec!["c", "b"], vec!["d"]]);
        assert_level_invariant(&def, &plan);
    }

    #[test]
    fn test_uneven_depths_use_longest_path() {
        // a -> b -> c, and a -> c directly: c still waits for b.
        let def = workflow(vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["a", "b"]),
            step("x", vec![]),
        ]);
        let plan = compile(&def).unwrap();
        assert_eq!(levels(&plan), vec![vec!["a", "x"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_duplicate_dependency_entry() {
        let def = workflow(vec![step("a", vec![]), step("b", vec!["a", "a"])]);
        let plan = compile(&def).unwrap();
        assert_eq!(levels(&plan), vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let def = workflow(vec![
            step("fetch", vec![]),
            step("parse", vec!["fetch"]),
            step("lint", vec!["fetch"]),
            step("index", vec!["parse"]),
            step("report", vec!["index", "lint"]),
            step("notify", vec![]),
        ]);
        let first = compile(&def).unwrap();
        for _ in 0..10 {
            assert_eq!(compile(&def).unwrap(), first);
        }
        assert_level_invariant(&def, &first);
    }

    #[test]
    fn test_complex_fork_join() {
        //     A
        //    / \
        //   B   C
        //   |   |
        //   D   E
        //    \ /
        //     F
        let def = workflow(vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["a"]),
            step("d", vec!["b"]),
            step("e", vec!["c"]),
            step("f", vec!["d", "e"]),
        ]);
        let plan = compile(&def).unwrap();
        assert_eq!(
            levels(&plan),
            vec![vec!["a"], vec!["b", "c"], vec!["d", "e"], vec!["f"]]
        );
    }

    // -----------------------------------------------------------------------
    // Errors
    // -----------------------------------------------------------------------

    #[test]
    fn test_cycle_detected() {
        let def = workflow(vec![step("a", vec!["b"]), step("b", vec!["a"])]);
        let err = compile(&def).unwrap_err();
        match err {
            WorkflowError::CycleDetected(steps) => assert_eq!(steps, vec!["a", "b"]),
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_cycle_behind_valid_prefix() {
        let def = workflow(vec![
            step("root", vec![]),
            step("a", vec!["root", "c"]),
            step("b", vec!["a"]),
            step("c", vec!["b"]),
        ]);
        let err = compile(&def).unwrap_err();
        assert!(err.to_string().contains("cycle detected"), "got: {err}");
        assert!(!err.to_string().contains("root"), "got: {err}");
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let def = workflow(vec![step("a", vec!["a"])]);
        assert!(matches!(
            compile(&def).unwrap_err(),
            WorkflowError::CycleDetected(_)
        ));
    }

    #[test]
    fn test_unknown_dependency() {
        let def = workflow(vec![step("a", vec!["missing"])]);
        match compile(&def).unwrap_err() {
            WorkflowError::UnknownDependency { step, dependency } => {
                assert_eq!(step, "a");
                assert_eq!(dependency, "missing");
            }
            other => panic!("expected unknown dependency, got {other}"),
        }
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let def = workflow(vec![step("a", vec![]), step("a", vec![])]);
        assert!(matches!(
            compile(&def).unwrap_err(),
            WorkflowError::DuplicateStep(_)
        ));
    }

    // -----------------------------------------------------------------------
    // Transitive dependencies
    // -----------------------------------------------------------------------

    #[test]
    fn test_get_transitive_dependencies() {
        let def = workflow(vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["b"]),
            step("d", vec!["c"]),
        ]);
        let mut deps = get_step_dependencies("d", &def);
        deps.sort();
        assert_eq!(deps, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_get_dependencies_unknown_step() {
        let def = workflow(vec![step("a", vec![])]);
        assert!(get_step_dependencies("nonexistent", &def).is_empty());
        assert!(get_step_dependencies("a", &def).is_empty());
    }
}
