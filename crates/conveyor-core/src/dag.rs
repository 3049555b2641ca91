// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dependency-graph helpers for DAG-mode stage scheduling.

use std::collections::{BTreeMap, BTreeSet};

/// Adjacency view of a pipeline's stage dependencies.
///
/// Keys are stage names; values are the sets of direct prerequisites.
/// Stages without dependencies map to an empty set and act as roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl DepGraph {
    /// Build the graph from (stage name, dependency list) pairs.
    pub fn from_stages<'a>(
        stages: impl IntoIterator<Item = (&'a str, &'a [String])>,
    ) -> Self {
        let mut edges = BTreeMap::new();
        for (name, deps) in stages {
            edges.insert(
                name.to_string(),
                deps.iter().cloned().collect::<BTreeSet<_>>(),
            );
        }
        Self { edges }
    }

    /// Direct prerequisites of `name`, empty when it is a root.
    #[must_use]
    pub fn deps_of(&self, name: &str) -> BTreeSet<String> {
        self.edges.get(name).cloned().unwrap_or_default()
    }

    /// All stage names in the graph.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// `true` when the graph has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// A dependency name that references no stage in the graph, if any.
    #[must_use]
    pub fn unknown_dependency(&self) -> Option<(String, String)> {
        for (name, deps) in &self.edges {
            for dep in deps {
                if !self.edges.contains_key(dep) {
                    return Some((name.clone(), dep.clone()));
                }
            }
        }
        None
    }

    /// Find a dependency cycle, returned as the stage names along it.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            node: &str,
            edges: &BTreeMap<String, BTreeSet<String>>,
            marks: &mut BTreeMap<String, Mark>,
            path: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            match marks.get(node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    // Close the loop starting at the first occurrence.
                    let start = path.iter().position(|n| n == node).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(node.to_string());
                    return Some(cycle);
                }
                None => {}
            }
            marks.insert(node.to_string(), Mark::Visiting);
            path.push(node.to_string());
            if let Some(deps) = edges.get(node) {
                for dep in deps {
                    if edges.contains_key(dep) {
                        if let Some(cycle) = visit(dep, edges, marks, path) {
                            return Some(cycle);
                        }
                    }
                }
            }
            path.pop();
            marks.insert(node.to_string(), Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        let mut path = Vec::new();
        for node in self.edges.keys() {
            if let Some(cycle) = visit(node, &self.edges, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    /// Stages whose every dependency is in `completed` and which are not in
    /// `ineligible` (already started, finished, or blocked).
    #[must_use]
    pub fn ready(
        &self,
        completed: &BTreeSet<String>,
        ineligible: &BTreeSet<String>,
    ) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(name, _)| !ineligible.contains(*name))
            .filter(|(_, deps)| deps.iter().all(|d| completed.contains(d)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Stages not yet in `ineligible` with at least one dependency in `failed`.
    #[must_use]
    pub fn blocked(
        &self,
        failed: &BTreeSet<String>,
        ineligible: &BTreeSet<String>,
    ) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(name, _)| !ineligible.contains(*name))
            .filter(|(_, deps)| deps.iter().any(|d| failed.contains(d)))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(spec: &[(&str, &[&str])]) -> DepGraph {
        let owned: Vec<(String, Vec<String>)> = spec
            .iter()
            .map(|(n, d)| (n.to_string(), d.iter().map(|s| s.to_string()).collect()))
            .collect();
        DepGraph::from_stages(owned.iter().map(|(n, d)| (n.as_str(), d.as_slice())))
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn roots_are_immediately_ready() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"])]);
        assert_eq!(g.ready(&set(&[]), &set(&[])), vec!["a".to_string()]);
    }

    #[test]
    fn ready_unlocks_after_dependencies_complete() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])]);
        let ready = g.ready(&set(&["a"]), &set(&["a"]));
        assert_eq!(ready, vec!["b".to_string()]);
        let ready = g.ready(&set(&["a", "b"]), &set(&["a", "b"]));
        assert_eq!(ready, vec!["c".to_string()]);
    }

    #[test]
    fn blocked_propagates_from_failed_dependency() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"])]);
        let blocked = g.blocked(&set(&["a"]), &set(&["a"]));
        assert_eq!(blocked, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn detects_self_cycle() {
        let g = graph(&[("a", &["a"])]);
        let cycle = g.find_cycle().unwrap();
        assert!(cycle.len() >= 2);
        assert_eq!(cycle.first(), cycle.last());
    }

    #[test]
    fn detects_long_cycle() {
        let g = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);
        assert!(g.find_cycle().is_some());
    }

    #[test]
    fn acyclic_graph_has_no_cycle() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"]), ("d", &["c"])]);
        assert!(g.find_cycle().is_none());
    }

    #[test]
    fn unknown_dependency_is_reported() {
        let g = graph(&[("a", &["ghost"])]);
        let (stage, dep) = g.unknown_dependency().unwrap();
        assert_eq!(stage, "a");
        assert_eq!(dep, "ghost");
    }

    #[test]
    fn diamond_ready_ordering() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        let ready = g.ready(&set(&["a"]), &set(&["a"]));
        assert_eq!(ready, vec!["b".to_string(), "c".to_string()]);
        assert!(g.ready(&set(&["a", "b"]), &set(&["a", "b", "c"])).is_empty());
        let ready = g.ready(&set(&["a", "b", "c"]), &set(&["a", "b", "c"]));
        assert_eq!(ready, vec!["d".to_string()]);
    }
}
