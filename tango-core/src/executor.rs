//! Executor: runs the steps of a step graph against a workspace.

use crate::error::{StepError, TangoError};
use crate::step::{Step, StepContext, StepInfo};
use crate::workspace::Workspace;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Outcome of executing a step graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorOutput {
    /// Steps which ran successfully or were found in the cache.
    pub successful: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    /// Steps skipped because a dependency failed.
    pub not_run: BTreeSet<String>,
}

/// An ordered collection of named steps.
#[derive(Default, Clone)]
pub struct StepGraph {
    steps: Vec<Arc<dyn Step>>,
}

impl StepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, step: Arc<dyn Step>) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Step>> {
        self.steps.iter().find(|s| s.name() == name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps ordered so every step comes after its dependencies.
    pub fn ordered(&self) -> Result<Vec<Arc<dyn Step>>, StepError> {
        let mut ordered: Vec<Arc<dyn Step>> = Vec::with_capacity(self.steps.len());
        let mut placed: BTreeSet<String> = BTreeSet::new();
        let mut remaining: Vec<Arc<dyn Step>> = self.steps.clone();

        while !remaining.is_empty() {
            let before = remaining.len();
            let mut next = Vec::new();
            for step in remaining {
                let deps = step.dependencies();
                if let Some(dep) = deps.iter().find(|d| self.get(d).is_none()) {
                    return Err(StepError::Unknown { name: dep.clone() });
                }
                if deps.iter().all(|d| placed.contains(d)) {
                    placed.insert(step.name().to_string());
                    ordered.push(step);
                } else {
                    next.push(step);
                }
            }
            if next.len() == before {
                return Err(StepError::failed(
                    next[0].name(),
                    "dependency cycle in step graph",
                ));
            }
            remaining = next;
        }
        Ok(ordered)
    }

    fn dependency_ids(&self, step: &dyn Step) -> BTreeSet<String> {
        step.dependencies()
            .iter()
            .filter_map(|d| self.get(d).map(|s| s.unique_id()))
            .collect()
    }
}

/// Runs steps and caches their results in a workspace.
pub struct Executor<W: Workspace> {
    workspace: W,
}

impl<W: Workspace> Executor<W> {
    pub fn new(workspace: W) -> Self {
        Self { workspace }
    }

    pub fn workspace(&self) -> &W {
        &self.workspace
    }

    pub fn into_workspace(self) -> W {
        self.workspace
    }

    /// Run one step, or return its cached result.
    pub fn execute_step(
        &mut self,
        step: &dyn Step,
        info: StepInfo,
        inputs: HashMap<String, Value>,
    ) -> Result<Value, TangoError> {
        let unique_id = info.unique_id.clone();
        if step.cacheable() {
            if let Some(result) = self.workspace.cached_result(&unique_id)? {
                info!(step = %step.name(), %unique_id, "Found result in cache");
                return Ok(result);
            }
        } else if !step.deterministic() {
            warn!(step = %step.name(), "Running non-deterministic step, result will not be cached");
        }

        let ctx = StepContext {
            unique_id: unique_id.clone(),
            work_dir: self.workspace.work_dir(&unique_id)?,
            inputs,
        };

        info!(step = %step.name(), %unique_id, "Starting step");
        self.workspace.step_starting(info)?;
        match step.run(&ctx) {
            Ok(result) => {
                self.workspace
                    .step_finished(&unique_id, &result, step.cacheable())?;
                info!(step = %step.name(), "Finished step");
                Ok(result)
            }
            Err(e) => {
                self.workspace.step_failed(&unique_id, &e.to_string())?;
                Err(e)
            }
        }
    }

    /// Execute every step in dependency order.
    ///
    /// A failing step does not stop the graph: its dependents are skipped,
    /// unrelated steps still run, and the failure is logged.
    pub fn execute_step_graph(
        &mut self,
        graph: &StepGraph,
        run_name: Option<&str>,
    ) -> Result<(ExecutorOutput, HashMap<String, Value>), TangoError> {
        let ordered = graph.ordered()?;
        let targets = ordered
            .iter()
            .map(|s| StepInfo::for_step(s.as_ref(), graph.dependency_ids(s.as_ref())))
            .collect();
        let run_name = self.workspace.register_run(targets, run_name)?;
        info!(run = %run_name, steps = ordered.len(), "Executing step graph");

        let mut output = ExecutorOutput::default();
        let mut results: HashMap<String, Value> = HashMap::new();

        for step in ordered {
            let name = step.name().to_string();
            let deps = step.dependencies();
            if deps
                .iter()
                .any(|d| output.failed.contains(d) || output.not_run.contains(d))
            {
                output.not_run.insert(name);
                continue;
            }

            let inputs = deps
                .iter()
                .filter_map(|d| results.get(d).map(|v| (d.clone(), v.clone())))
                .collect();
            let info = StepInfo::for_step(step.as_ref(), graph.dependency_ids(step.as_ref()));
            match self.execute_step(step.as_ref(), info, inputs) {
                Ok(result) => {
                    results.insert(name.clone(), result);
                    output.successful.insert(name);
                }
                Err(e) => {
                    error!(step = %name, error = %e, "Step failed");
                    output.failed.insert(name);
                }
            }
        }

        Ok((output, results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepState;
    use crate::workspace::MemoryWorkspace;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Constant {
        name: String,
        value: i64,
        deps: Vec<String>,
        fail: bool,
        runs: Arc<AtomicUsize>,
    }

    impl Constant {
        fn new(name: &str, value: i64) -> Self {
            Self {
                name: name.into(),
                value,
                deps: Vec::new(),
                fail: false,
                runs: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Step for Constant {
        fn name(&self) -> &str {
            &self.name
        }
        fn class_name(&self) -> &str {
            "test::constant"
        }
        fn config(&self) -> Value {
            serde_json::json!({"name": self.name, "value": self.value})
        }
        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }
        fn run(&self, ctx: &StepContext) -> Result<Value, TangoError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StepError::failed(&self.name, "boom").into());
            }
            let upstream: i64 = ctx.inputs.values().filter_map(|v| v.as_i64()).sum();
            Ok(serde_json::json!(self.value + upstream))
        }
    }

    #[test]
    fn test_graph_runs_in_dependency_order() {
        let mut graph = StepGraph::new();
        let mut b = Constant::new("b", 10);
        b.deps = vec!["a".into()];
        graph.add(Arc::new(b)).add(Arc::new(Constant::new("a", 1)));

        let mut executor = Executor::new(MemoryWorkspace::new());
        let (output, results) = executor.execute_step_graph(&graph, Some("run")).unwrap();
        assert_eq!(output.successful.len(), 2);
        assert_eq!(results["b"], serde_json::json!(11));
    }

    #[test]
    fn test_failed_dependency_skips_dependents() {
        let mut graph = StepGraph::new();
        let mut a = Constant::new("a", 1);
        a.fail = true;
        let mut b = Constant::new("b", 2);
        b.deps = vec!["a".into()];
        graph
            .add(Arc::new(a))
            .add(Arc::new(b))
            .add(Arc::new(Constant::new("c", 3)));

        let mut executor = Executor::new(MemoryWorkspace::new());
        let (output, _) = executor.execute_step_graph(&graph, None).unwrap();
        assert!(output.failed.contains("a"));
        assert!(output.not_run.contains("b"));
        assert!(output.successful.contains("c"));

        let failed: Vec<_> = executor
            .workspace()
            .steps(true)
            .into_iter()
            .filter(|i| i.state() == StepState::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
    }

    #[test]
    fn test_cached_result_reused() {
        let step = Arc::new(Constant::new("a", 5));
        let runs = step.runs.clone();
        let mut graph = StepGraph::new();
        graph.add(step);

        let mut executor = Executor::new(MemoryWorkspace::new());
        executor.execute_step_graph(&graph, None).unwrap();
        executor.execute_step_graph(&graph, None).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_dependency_and_cycle() {
        let mut graph = StepGraph::new();
        let mut a = Constant::new("a", 1);
        a.deps = vec!["ghost".into()];
        graph.add(Arc::new(a));
        assert!(matches!(graph.ordered(), Err(StepError::Unknown { .. })));

        let mut graph = StepGraph::new();
        let mut a = Constant::new("a", 1);
        a.deps = vec!["b".into()];
        let mut b = Constant::new("b", 1);
        b.deps = vec!["a".into()];
        graph.add(Arc::new(a)).add(Arc::new(b));
        assert!(graph.ordered().is_err());
    }
}
