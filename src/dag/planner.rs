// src/dag/planner.rs

//! Resource-aware grouping of topological levels.
//!
//! The plan is a throughput *estimate*: within each level, models are packed
//! first-fit-decreasing into groups that fit the pool and the parallelism
//! cap. The scheduler never waits on plan boundaries; it admits models
//! reactively as soon as dependencies and capacity allow, so models from
//! different levels may well run side by side.
//!
//! First-fit-decreasing is deterministic and cheap but not optimal. That is
//! acceptable for a hint.

use std::cmp::Reverse;
use std::fmt;

use tracing::debug;

use crate::dag::DagGraph;
use crate::engine::ResourceVector;
use crate::types::ModelId;

/// A set of models from one level that fit in the pool together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelGroup {
    pub models: Vec<ModelId>,
    pub footprint: ResourceVector,
    /// The single model in this group cannot fit the pool at all.
    pub oversized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanLevel {
    pub index: usize,
    pub groups: Vec<ParallelGroup>,
}

/// Advisory execution plan: ordered levels of ordered parallel groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    levels: Vec<PlanLevel>,
    capacity: ResourceVector,
}

impl ExecutionPlan {
    pub fn levels(&self) -> &[PlanLevel] {
        &self.levels
    }

    pub fn capacity(&self) -> ResourceVector {
        self.capacity
    }

    /// Total number of groups, i.e. the estimated number of "waves".
    pub fn group_count(&self) -> usize {
        self.levels.iter().map(|l| l.groups.len()).sum()
    }

    /// Largest footprint of any group that fits the pool.
    pub fn peak_footprint(&self) -> ResourceVector {
        self.levels
            .iter()
            .flat_map(|l| l.groups.iter())
            .filter(|g| !g.oversized)
            .fold(ResourceVector::ZERO, |acc, g| acc.max(&g.footprint))
    }

    /// Models that can never be admitted with this pool.
    pub fn oversized_models(&self) -> Vec<&str> {
        self.levels
            .iter()
            .flat_map(|l| l.groups.iter())
            .filter(|g| g.oversized)
            .flat_map(|g| g.models.iter().map(|m| m.as_str()))
            .collect()
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "execution plan (pool {}):", self.capacity)?;
        for level in &self.levels {
            writeln!(f, "  level {}:", level.index)?;
            for (i, group) in level.groups.iter().enumerate() {
                let marker = if group.oversized { " EXCEEDS POOL" } else { "" };
                writeln!(
                    f,
                    "    group {} [{}]{}: {}",
                    i + 1,
                    group.footprint,
                    marker,
                    group.models.join(", ")
                )?;
            }
        }
        Ok(())
    }
}

/// Builds [`ExecutionPlan`]s with a first-fit-decreasing packer.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionPlanner {
    max_parallel_models: usize,
}

impl ExecutionPlanner {
    /// `max_parallel_models` is clamped to at least 1.
    pub fn new(max_parallel_models: usize) -> Self {
        Self {
            max_parallel_models: max_parallel_models.max(1),
        }
    }

    pub fn max_parallel_models(&self) -> usize {
        self.max_parallel_models
    }

    /// Group every level of `graph`, looking up each model's requirement
    /// through `requirement_of`.
    pub fn plan<F>(
        &self,
        graph: &DagGraph,
        capacity: ResourceVector,
        requirement_of: F,
    ) -> ExecutionPlan
    where
        F: Fn(&str) -> ResourceVector,
    {
        let levels = graph
            .levels()
            .iter()
            .enumerate()
            .map(|(index, models)| PlanLevel {
                index,
                groups: self.pack_level(models, capacity, &requirement_of),
            })
            .collect::<Vec<_>>();

        let plan = ExecutionPlan { levels, capacity };
        debug!(
            levels = plan.levels.len(),
            groups = plan.group_count(),
            "computed execution plan"
        );
        plan
    }

    fn pack_level<F>(
        &self,
        models: &[ModelId],
        capacity: ResourceVector,
        requirement_of: &F,
    ) -> Vec<ParallelGroup>
    where
        F: Fn(&str) -> ResourceVector,
    {
        let mut sorted: Vec<(&ModelId, ResourceVector)> = models
            .iter()
            .map(|id| (id, requirement_of(id)))
            .collect();
        sorted.sort_by_key(|(id, req)| (Reverse(req.intensity()), (*id).clone()));

        let mut groups: Vec<ParallelGroup> = Vec::new();

        for (id, req) in sorted {
            if !req.fits_within(&capacity) {
                groups.push(ParallelGroup {
                    models: vec![id.clone()],
                    footprint: req,
                    oversized: true,
                });
                continue;
            }

            let slot = groups.iter_mut().find(|g| {
                !g.oversized
                    && g.models.len() < self.max_parallel_models
                    && g.footprint.saturating_add(&req).fits_within(&capacity)
            });

            match slot {
                Some(group) => {
                    group.models.push(id.clone());
                    group.footprint = group.footprint.saturating_add(&req);
                }
                None => groups.push(ParallelGroup {
                    models: vec![id.clone()],
                    footprint: req,
                    oversized: false,
                }),
            }
        }

        groups
    }
}

impl Default for ExecutionPlanner {
    fn default() -> Self {
        Self::new(4)
    }
}
