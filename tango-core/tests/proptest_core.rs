//! Property-based tests for step identity and local workspaces.

use proptest::prelude::*;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tango_core::step::compute_unique_id;
use tango_core::{
    Executor, LocalWorkspace, Step, StepContext, StepGraph, StepState, TangoError, Workspace,
};

// --- Unique id properties ---

proptest! {
    #[test]
    fn unique_id_ignores_key_order(
        entries in proptest::collection::btree_map("[a-z]{1,8}", -1000i64..1000, 1..8),
    ) {
        let forward: Map<String, Value> =
            entries.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
        let backward: Map<String, Value> =
            entries.iter().rev().map(|(k, v)| (k.clone(), json!(v))).collect();
        prop_assert_eq!(
            compute_unique_id("flax::eval", Some("002"), &Value::Object(forward), &[]),
            compute_unique_id("flax::eval", Some("002"), &Value::Object(backward), &[])
        );
    }

    #[test]
    fn unique_id_changes_with_version(a in "[0-9]{3}", b in "[0-9]{3}") {
        prop_assume!(a != b);
        let config = json!({"batch_size": 4});
        prop_assert_ne!(
            compute_unique_id("flax::eval", Some(&a), &config, &[]),
            compute_unique_id("flax::eval", Some(&b), &config, &[])
        );
    }

    #[test]
    fn skipped_arguments_do_not_change_id(log_every in 1usize..1000) {
        let base = json!({"seed": 42});
        let with_skipped = json!({"seed": 42, "log_every": log_every});
        prop_assert_eq!(
            compute_unique_id("flax::eval", None, &base, &["log_every"]),
            compute_unique_id("flax::eval", None, &with_skipped, &["log_every"])
        );
    }
}

// --- Local workspace across executors ---

struct Counting {
    value: i64,
    runs: Arc<AtomicUsize>,
}

impl Step for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    fn class_name(&self) -> &str {
        "test::counting"
    }

    fn config(&self) -> Value {
        json!({"value": self.value})
    }

    fn run(&self, _ctx: &StepContext) -> Result<Value, TangoError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(json!(self.value))
    }
}

#[test]
fn results_survive_reopening_the_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let step: Arc<dyn Step> = Arc::new(Counting {
        value: 7,
        runs: Arc::clone(&runs),
    });
    let mut graph = StepGraph::new();
    graph.add(Arc::clone(&step));

    {
        let mut executor = Executor::new(LocalWorkspace::open(dir.path()).unwrap());
        let (_, results) = executor.execute_step_graph(&graph, Some("first")).unwrap();
        assert_eq!(results["counting"], json!(7));
    }

    let mut executor = Executor::new(LocalWorkspace::open(dir.path()).unwrap());
    let (output, results): (_, HashMap<String, Value>) =
        executor.execute_step_graph(&graph, Some("second")).unwrap();
    assert!(output.successful.contains("counting"));
    assert_eq!(results["counting"], json!(7));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let info = executor.workspace().step_info(&step.unique_id()).unwrap();
    assert_eq!(info.state(), StepState::Completed);
    assert_eq!(
        executor.workspace().registered_runs().keys().collect::<Vec<_>>(),
        vec!["first", "second"]
    );
}
