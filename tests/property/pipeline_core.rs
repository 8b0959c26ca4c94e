use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use proptest::prelude::*;

use modeldag::dag::{DagBuilder, DagGraph};
use modeldag::engine::{CoreCommand, ExecutionStatus, PipelineCore};
use modeldag::types::FailurePolicy;

fn name(i: usize) -> String {
    format!("m{i:02}")
}

fn graph_strategy(max_models: usize) -> impl Strategy<Value = Arc<DagGraph>> {
    (1..=max_models).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n).prop_map(
            |raw| {
                let mut builder = DagBuilder::new();
                for (i, picks) in raw.into_iter().enumerate() {
                    let deps: BTreeSet<String> = if i == 0 {
                        BTreeSet::new()
                    } else {
                        picks.into_iter().map(|p| name(p % i)).collect()
                    };
                    builder.add_model(name(i), deps).unwrap();
                }
                Arc::new(builder.build().unwrap())
            },
        )
    })
}

proptest! {
    #[test]
    fn every_model_reaches_a_terminal_state(
        graph in graph_strategy(16),
        failing in proptest::collection::btree_set(0usize..16, 0..4),
        degrade in any::<bool>(),
    ) {
        let policy = if degrade { FailurePolicy::Degrade } else { FailurePolicy::FailFast };
        let failing: BTreeSet<String> = failing.into_iter().map(name).collect();
        let mut core = PipelineCore::new(Arc::clone(&graph), policy, None).unwrap();

        let mut executing: VecDeque<String> = VecDeque::new();
        let mut ran: BTreeSet<String> = BTreeSet::new();
        let mut skipped: BTreeSet<String> = BTreeSet::new();

        let mut step = core.start();
        let mut rounds = 0;
        loop {
            for command in step.commands.drain(..) {
                match command {
                    CoreCommand::Submit(id) => {
                        // Dependencies of a submitted model have all finished.
                        for dep in graph.dependencies_of(&id) {
                            prop_assert!(core.status_of(dep).is_some(), "{} submitted before {}", id, dep);
                        }
                        executing.push_back(id);
                    }
                    CoreCommand::Skip { model, cause } => {
                        prop_assert_eq!(policy, FailurePolicy::FailFast);
                        prop_assert!(failing.contains(&cause.root), "{} skipped due to {}", model, cause.root);
                        skipped.insert(model);
                    }
                }
            }
            if step.finished {
                break;
            }
            rounds += 1;
            prop_assert!(rounds < 1000, "no progress");

            let Some(id) = executing.pop_front() else {
                return Err(TestCaseError::fail("core is waiting but nothing is executing"));
            };
            prop_assert!(ran.insert(id.clone()), "{} submitted twice", id);
            let status = if failing.contains(&id) {
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Succeeded
            };
            step = core.on_terminal(&id, status);
        }

        prop_assert!(executing.is_empty());
        prop_assert_eq!(ran.len() + skipped.len(), graph.len());
        if policy == FailurePolicy::Degrade {
            prop_assert!(skipped.is_empty());
        }
        for id in &skipped {
            prop_assert!(!ran.contains(id));
            prop_assert_eq!(core.status_of(id), Some(ExecutionStatus::Skipped));
        }
    }
}
