// src/engine/cascade.rs

//! Failure propagation through the dependency graph.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::dag::DagGraph;
use crate::engine::record::SkipCause;
use crate::types::{FailurePolicy, ModelId};

/// Compute the models to skip after `failed` did not succeed.
///
/// Under `FailFast`, every transitive dependent for which `is_waiting`
/// returns true is skipped, each with the shortest chain from `failed` to
/// its direct upstream. Under `Degrade` nothing is skipped; dependents are
/// submitted and fail validation instead.
pub fn cascade_skips<F>(
    graph: &DagGraph,
    failed: &str,
    policy: FailurePolicy,
    is_waiting: F,
) -> Vec<(ModelId, SkipCause)>
where
    F: Fn(&str) -> bool,
{
    if policy == FailurePolicy::Degrade {
        return Vec::new();
    }

    let mut parent: HashMap<&str, &str> = HashMap::new();
    let mut seen: BTreeSet<&str> = BTreeSet::from([failed]);
    let mut order: Vec<&str> = Vec::new();
    let mut queue: VecDeque<&str> = VecDeque::from([failed]);

    while let Some(current) = queue.pop_front() {
        for dependent in graph.dependents_of(current) {
            if seen.insert(dependent.as_str()) {
                parent.insert(dependent.as_str(), current);
                order.push(dependent.as_str());
                queue.push_back(dependent.as_str());
            }
        }
    }

    order
        .into_iter()
        .filter(|model| is_waiting(*model))
        .map(|model| {
            let mut chain: Vec<ModelId> = Vec::new();
            let mut cursor = parent.get(model).copied();
            while let Some(upstream) = cursor {
                chain.push(upstream.to_string());
                cursor = parent.get(upstream).copied();
            }
            chain.reverse();
            (
                model.to_string(),
                SkipCause {
                    root: failed.to_string(),
                    chain,
                },
            )
        })
        .collect()
}
