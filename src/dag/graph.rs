// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use crate::errors::{ModeldagError, Result};
use crate::types::ModelId;

/// Collects model registrations before the graph is validated.
///
/// Dependencies may reference models that are registered later; unknown
/// references are only reported by [`DagBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct DagBuilder {
    nodes: BTreeMap<ModelId, BTreeSet<ModelId>>,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model and its direct dependencies.
    pub fn add_model<I, S>(&mut self, id: impl Into<ModelId>, deps: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<ModelId>,
    {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            return Err(ModeldagError::DuplicateModel(id));
        }
        let deps = deps.into_iter().map(Into::into).collect();
        self.nodes.insert(id, deps);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Validate the registrations and compute topological levels with Kahn's
    /// algorithm.
    ///
    /// Level `n` holds every model whose dependencies all sit in levels
    /// `< n`; models inside a level are ordered by id.
    pub fn build(&self) -> Result<DagGraph> {
        for (model, deps) in &self.nodes {
            if let Some(dep) = deps.iter().find(|d| !self.nodes.contains_key(*d)) {
                return Err(ModeldagError::UnknownDependency {
                    model: model.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let mut nodes: BTreeMap<ModelId, DagNode> = self
            .nodes
            .iter()
            .map(|(id, deps)| {
                (
                    id.clone(),
                    DagNode {
                        deps: deps.iter().cloned().collect(),
                        dependents: Vec::new(),
                        level: 0,
                    },
                )
            })
            .collect();

        for (id, deps) in &self.nodes {
            for dep in deps {
                if let Some(dep_node) = nodes.get_mut(dep) {
                    dep_node.dependents.push(id.clone());
                }
            }
        }

        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.len()))
            .collect();

        let mut levels: Vec<Vec<ModelId>> = Vec::new();
        let mut current: Vec<ModelId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| id.to_string())
            .collect();
        let mut placed = 0usize;

        while !current.is_empty() {
            let mut next = Vec::new();
            for id in &current {
                for dependent in &self.dependents_of(&nodes, id) {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(dependent.clone());
                        }
                    }
                }
            }
            placed += current.len();
            next.sort();
            levels.push(std::mem::replace(&mut current, next));
        }

        if placed < self.nodes.len() {
            let remaining: Vec<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(id, _)| *id)
                .collect();
            return Err(self.cycle_error(&remaining));
        }

        for (index, level) in levels.iter().enumerate() {
            for id in level {
                if let Some(node) = nodes.get_mut(id) {
                    node.level = index;
                }
            }
        }

        debug!(
            models = nodes.len(),
            levels = levels.len(),
            "built model DAG"
        );

        Ok(DagGraph { nodes, levels })
    }

    fn dependents_of(&self, nodes: &BTreeMap<ModelId, DagNode>, id: &str) -> Vec<ModelId> {
        nodes
            .get(id)
            .map(|n| n.dependents.clone())
            .unwrap_or_default()
    }

    /// Kahn's algorithm leaves behind every model on a cycle plus everything
    /// downstream of one; strongly connected components pick out an actual
    /// cycle to report.
    fn cycle_error(&self, remaining: &[&str]) -> ModeldagError {
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for id in remaining {
            graph.add_node(*id);
        }
        for id in remaining {
            if let Some(deps) = self.nodes.get(*id) {
                for dep in deps {
                    if graph.contains_node(dep.as_str()) {
                        graph.add_edge(dep.as_str(), *id, ());
                    }
                }
            }
        }

        let mut cycles: Vec<Vec<ModelId>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || scc.iter().any(|n| graph.contains_edge(*n, *n)))
            .map(|scc| {
                let mut members: Vec<ModelId> = scc.iter().map(|s| s.to_string()).collect();
                members.sort();
                members
            })
            .collect();
        cycles.sort();

        let members = cycles
            .into_iter()
            .next()
            .unwrap_or_else(|| remaining.iter().map(|s| s.to_string()).collect());
        let model = members.first().cloned().unwrap_or_default();

        ModeldagError::Cycle { model, members }
    }
}

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone)]
struct DagNode {
    deps: Vec<ModelId>,
    dependents: Vec<ModelId>,
    level: usize,
}

/// Validated, immutable model DAG with its topological levels.
///
/// Any change in topology requires registering the models again and
/// building a fresh graph.
#[derive(Debug, Clone)]
pub struct DagGraph {
    nodes: BTreeMap<ModelId, DagNode>,
    levels: Vec<Vec<ModelId>>,
}

impl DagGraph {
    /// All model ids, in id order.
    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|s| s.as_str())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn levels(&self) -> &[Vec<ModelId>] {
        &self.levels
    }

    pub fn level_of(&self, id: &str) -> Option<usize> {
        self.nodes.get(id).map(|n| n.level)
    }

    /// Immediate dependencies of a model.
    pub fn dependencies_of(&self, id: &str) -> &[ModelId] {
        self.nodes
            .get(id)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a model (models listing it as a dependency).
    pub fn dependents_of(&self, id: &str) -> &[ModelId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Every model reachable downstream of `id`, excluding `id` itself.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<ModelId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);

        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents_of(current) {
                if seen.insert(dependent.clone()) {
                    queue.push_back(dependent.as_str());
                }
            }
        }

        seen
    }
}
