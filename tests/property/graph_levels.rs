use std::collections::BTreeSet;

use proptest::prelude::*;

use modeldag::dag::{DagBuilder, DagGraph, ExecutionPlanner};
use modeldag::engine::ResourceVector;
use modeldag::errors::ModeldagError;

/// Dependency lists where model `i` may only depend on models `0..i`, so the
/// result is always acyclic.
fn acyclic_deps(max_models: usize) -> impl Strategy<Value = Vec<BTreeSet<usize>>> {
    (1..=max_models).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..4), n).prop_map(
            |raw| {
                raw.into_iter()
                    .enumerate()
                    .map(|(i, picks)| {
                        if i == 0 {
                            BTreeSet::new()
                        } else {
                            picks.into_iter().map(|p| p % i).collect()
                        }
                    })
                    .collect()
            },
        )
    })
}

fn name(i: usize) -> String {
    format!("model_{i:02}")
}

fn build_graph(deps: &[BTreeSet<usize>]) -> Result<DagGraph, ModeldagError> {
    let mut builder = DagBuilder::new();
    for (i, d) in deps.iter().enumerate() {
        builder.add_model(name(i), d.iter().map(|j| name(*j)))?;
    }
    builder.build()
}

fn requirement(i: usize) -> ResourceVector {
    ResourceVector::new(512 * (1 + (i as u64 * 7) % 9), 1 + (i as u32 % 3), (i % 5 == 0) as u32)
}

proptest! {
    #[test]
    fn levels_come_strictly_after_dependencies(deps in acyclic_deps(24)) {
        let graph = build_graph(&deps).unwrap();

        let placed: usize = graph.levels().iter().map(Vec::len).sum();
        prop_assert_eq!(placed, deps.len());

        for (i, d) in deps.iter().enumerate() {
            let level = graph.level_of(&name(i)).unwrap();
            for j in d {
                let dep_level = graph.level_of(&name(*j)).unwrap();
                prop_assert!(dep_level < level, "{} at {} but dependency {} at {}", name(i), level, name(*j), dep_level);
            }
            // Level is minimal: some dependency sits right above it.
            if level > 0 {
                prop_assert!(d.iter().any(|j| graph.level_of(&name(*j)) == Some(level - 1)));
            }
        }
    }

    #[test]
    fn back_edge_is_reported_as_cycle(deps in acyclic_deps(12), pick in any::<usize>()) {
        prop_assume!(deps.iter().any(|d| !d.is_empty()));

        // Pick a model with a dependency and make that dependency depend on it.
        let with_deps: Vec<usize> = (0..deps.len()).filter(|i| !deps[*i].is_empty()).collect();
        let from = with_deps[pick % with_deps.len()];
        let to = *deps[from].iter().next().unwrap();

        let mut cyclic = deps.clone();
        cyclic[to].insert(from);

        match build_graph(&cyclic) {
            Err(ModeldagError::Cycle { model, members }) => {
                prop_assert!(members.contains(&model));
                prop_assert!(members.contains(&name(from)) || members.contains(&name(to)));
            }
            other => prop_assert!(false, "expected cycle, got {:?}", other.map(|g| g.len())),
        }
    }

    #[test]
    fn plan_groups_fit_the_pool(deps in acyclic_deps(24), max_parallel in 1usize..5) {
        let graph = build_graph(&deps).unwrap();
        let capacity = ResourceVector::gb(4, 3, 1);
        let plan = ExecutionPlanner::new(max_parallel).plan(&graph, capacity, |id| {
            let index: usize = id.trim_start_matches("model_").parse().unwrap();
            requirement(index)
        });

        prop_assert_eq!(plan.levels().len(), graph.levels().len());
        let mut seen = BTreeSet::new();
        for (level, planned) in graph.levels().iter().zip(plan.levels()) {
            let in_level: BTreeSet<&str> = level.iter().map(String::as_str).collect();
            for group in &planned.groups {
                prop_assert!(group.models.len() <= max_parallel);
                if group.oversized {
                    prop_assert_eq!(group.models.len(), 1);
                } else {
                    prop_assert!(group.footprint.fits_within(&capacity));
                }
                for m in &group.models {
                    prop_assert!(in_level.contains(m.as_str()));
                    prop_assert!(seen.insert(m.clone()), "{} planned twice", m);
                }
            }
        }
        prop_assert_eq!(seen.len(), deps.len());
    }
}
