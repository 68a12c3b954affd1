//! Deterministic dependency resolution.
//!
//! The closure of the requested modules is ordered level by level: a level
//! holds every module whose in-closure dependencies are already placed, and
//! each level is sorted by `(category rank, name)`. The result depends only
//! on the set of requested names and the registry, never on request order.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::{debug, error};

use crate::core::errors::{PipelineError, Result};
use crate::registry::{Category, ModuleRegistry};

pub const REASON_REQUESTED: &str = "requested";

/// Resolved order plus the bookkeeping preflight needs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub order: Vec<String>,
    pub levels: Vec<Vec<String>>,
    /// Registered requested names, sorted
    pub requested: Vec<String>,
    /// Requested names absent from the registry, sorted
    pub unknown: Vec<String>,
    /// Modules pulled in only because something depends on them
    pub added_as_dependencies: Vec<String>,
    /// `requested` or `dependency of <module>`
    pub included_reason: BTreeMap<String, String>,
    /// In-closure dependencies of every resolved module
    pub dependency_graph: BTreeMap<String, Vec<String>>,
}

pub struct DependencyResolver<'a> {
    registry: &'a ModuleRegistry,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(registry: &'a ModuleRegistry) -> Self {
        Self { registry }
    }

    pub fn resolve<S: AsRef<str>>(&self, requested: &[S]) -> Result<Resolution> {
        let mut wanted: BTreeSet<String> = BTreeSet::new();
        let mut unknown: BTreeSet<String> = BTreeSet::new();
        for name in requested {
            let name = name.as_ref();
            if self.registry.contains(name) {
                wanted.insert(name.to_string());
            } else {
                unknown.insert(name.to_string());
            }
        }
        if !unknown.is_empty() {
            debug!(unknown = ?unknown, "Dropping unregistered module names");
        }

        let (closure, included_reason) = self.closure(&wanted)?;
        let mut categories: HashMap<String, Category> = HashMap::new();
        let mut dependency_graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in &closure {
            let def = self
                .registry
                .get(name)
                .ok_or_else(|| PipelineError::unknown_module(name.as_str()))?;
            categories.insert(name.clone(), def.category);
            let deps: Vec<String> = def
                .dependencies
                .iter()
                .filter(|d| closure.contains(*d))
                .cloned()
                .collect();
            dependency_graph.insert(name.clone(), deps);
        }

        let levels = compute_levels(&dependency_graph, &categories)?;
        let order: Vec<String> = levels.iter().flatten().cloned().collect();
        let added_as_dependencies = order
            .iter()
            .filter(|name| !wanted.contains(*name))
            .cloned()
            .collect();

        debug!(order = ?order, "Resolved execution order");

        Ok(Resolution {
            order,
            levels,
            requested: wanted.into_iter().collect(),
            unknown: unknown.into_iter().collect(),
            added_as_dependencies,
            included_reason,
            dependency_graph,
        })
    }

    /// Transitive closure over registered names. Declared dependencies that
    /// are not registered are left out here and reported by preflight.
    fn closure(
        &self,
        wanted: &BTreeSet<String>,
    ) -> Result<(BTreeSet<String>, BTreeMap<String, String>)> {
        let mut closure: BTreeSet<String> = BTreeSet::new();
        let mut reasons: BTreeMap<String, String> = BTreeMap::new();
        let mut queue: VecDeque<String> = VecDeque::new();

        for name in wanted {
            closure.insert(name.clone());
            reasons.insert(name.clone(), REASON_REQUESTED.to_string());
            queue.push_back(name.clone());
        }

        while let Some(name) = queue.pop_front() {
            for dep in self.registry.dependencies_of(&name)? {
                if !self.registry.contains(&dep) || closure.contains(&dep) {
                    continue;
                }
                closure.insert(dep.clone());
                reasons.insert(dep.clone(), format!("dependency of {}", name));
                queue.push_back(dep);
            }
        }

        Ok((closure, reasons))
    }
}

fn compute_levels(
    graph: &BTreeMap<String, Vec<String>>,
    categories: &HashMap<String, Category>,
) -> Result<Vec<Vec<String>>> {
    let mut placed: BTreeSet<&str> = BTreeSet::new();
    let mut remaining: BTreeSet<&str> = graph.keys().map(String::as_str).collect();
    let mut levels: Vec<Vec<String>> = Vec::new();

    while !remaining.is_empty() {
        let mut ready: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|name| {
                graph
                    .get(*name)
                    .map(|deps| deps.iter().all(|d| placed.contains(d.as_str())))
                    .unwrap_or(true)
            })
            .collect();

        if ready.is_empty() {
            let cycle = cycle_members(graph, &remaining);
            error!(modules = ?cycle, "Dependency cycle detected");
            return Err(PipelineError::dependency_cycle(cycle));
        }

        ready.sort_by_key(|name| {
            (
                categories.get(*name).copied().unwrap_or_default().rank(),
                name.to_string(),
            )
        });
        for name in &ready {
            remaining.remove(*name);
            placed.insert(*name);
        }
        levels.push(ready.into_iter().map(str::to_string).collect());
    }

    Ok(levels)
}

/// Names of modules on a cycle among the unplaced ones
fn cycle_members(graph: &BTreeMap<String, Vec<String>>, remaining: &BTreeSet<&str>) -> Vec<String> {
    let mut g: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for name in remaining {
        index.insert(*name, g.add_node(*name));
    }
    for name in remaining {
        if let Some(deps) = graph.get(*name) {
            for dep in deps {
                if let (Some(&from), Some(&to)) = (index.get(dep.as_str()), index.get(*name)) {
                    g.add_edge(from, to, ());
                }
            }
        }
    }

    let members: Vec<String> = tarjan_scc(&g)
        .into_iter()
        .filter(|scc| scc.len() > 1 || g.contains_edge(scc[0], scc[0]))
        .flatten()
        .map(|idx| g[idx].to_string())
        .collect();

    if members.is_empty() {
        remaining.iter().map(|s| s.to_string()).collect()
    } else {
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModuleDefinition;
    use pretty_assertions::assert_eq;

    fn registry(defs: Vec<ModuleDefinition>) -> ModuleRegistry {
        let registry = ModuleRegistry::new();
        for def in defs {
            registry.register(def).unwrap();
        }
        registry
    }

    #[test]
    fn test_category_then_name_tie_break() {
        let registry = registry(vec![
            ModuleDefinition::new("zeta").category(Category::Light),
            ModuleDefinition::new("alpha").category(Category::Heavy),
            ModuleDefinition::new("mid").category(Category::Medium),
        ]);
        let res = DependencyResolver::new(&registry)
            .resolve(&["alpha", "mid", "zeta"])
            .unwrap();
        assert_eq!(res.order, vec!["zeta", "mid", "alpha"]);
        assert_eq!(res.levels.len(), 1);
    }

    #[test]
    fn test_pulls_in_dependencies() {
        let registry = registry(vec![
            ModuleDefinition::new("stats"),
            ModuleDefinition::new("sentiment").depends_on(["stats"]),
        ]);
        let res = DependencyResolver::new(&registry).resolve(&["sentiment"]).unwrap();
        assert_eq!(res.order, vec!["stats", "sentiment"]);
        assert_eq!(res.added_as_dependencies, vec!["stats"]);
        assert_eq!(res.included_reason["stats"], "dependency of sentiment");
        assert_eq!(res.included_reason["sentiment"], REASON_REQUESTED);
    }

    #[test]
    fn test_unknown_names_dropped() {
        let registry = registry(vec![ModuleDefinition::new("stats")]);
        let res = DependencyResolver::new(&registry)
            .resolve(&["stats", "ghost"])
            .unwrap();
        assert_eq!(res.order, vec!["stats"]);
        assert_eq!(res.unknown, vec!["ghost"]);
    }

    #[test]
    fn test_unregistered_declared_dependency_ignored_for_order() {
        let registry = registry(vec![ModuleDefinition::new("a").depends_on(["missing"])]);
        let res = DependencyResolver::new(&registry).resolve(&["a"]).unwrap();
        assert_eq!(res.order, vec!["a"]);
        assert!(res.dependency_graph["a"].is_empty());
    }

    #[test]
    fn test_cycle_names_members_only() {
        let registry = registry(vec![
            ModuleDefinition::new("a").depends_on(["b"]),
            ModuleDefinition::new("b").depends_on(["a"]),
            ModuleDefinition::new("c").depends_on(["a"]),
            ModuleDefinition::new("d"),
        ]);
        let err = DependencyResolver::new(&registry)
            .resolve(&["c", "d"])
            .unwrap_err();
        match err {
            PipelineError::DependencyCycle { modules } => {
                assert_eq!(modules, vec!["a".to_string(), "b".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle_only_when_requested() {
        let registry = registry(vec![
            ModuleDefinition::new("loop").depends_on(["loop"]),
            ModuleDefinition::new("stats"),
        ]);
        let res = DependencyResolver::new(&registry).resolve(&["stats"]).unwrap();
        assert_eq!(res.order, vec!["stats"]);

        let err = DependencyResolver::new(&registry)
            .resolve(&["loop", "stats"])
            .unwrap_err();
        match err {
            PipelineError::DependencyCycle { modules } => {
                assert_eq!(modules, vec!["loop".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
