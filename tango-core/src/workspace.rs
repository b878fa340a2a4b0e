//! Workspaces: where step results, work directories and run records live.
//!
//! [`MemoryWorkspace`] keeps everything in memory and is useful for tests and
//! quick jobs. [`LocalWorkspace`] persists results under a directory so they
//! survive restarts.

use crate::error::TangoError;
use crate::format::JsonFormat;
use crate::step::{StepInfo, StepState};
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A mapping from step unique id to its record.
pub type Run = BTreeMap<String, StepInfo>;

/// Storage for step bookkeeping and results.
pub trait Workspace: Send {
    /// Scratch directory for a step. Created if missing.
    fn work_dir(&self, unique_id: &str) -> Result<PathBuf, TangoError>;

    fn step_info(&self, unique_id: &str) -> Option<StepInfo>;

    fn steps(&self, include_completed: bool) -> Vec<StepInfo>;

    /// Called when a step is about to start running.
    fn step_starting(&mut self, info: StepInfo) -> Result<(), TangoError>;

    /// Called when a step finished. Cacheable results are stored.
    fn step_finished(
        &mut self,
        unique_id: &str,
        result: &Value,
        cache: bool,
    ) -> Result<(), TangoError>;

    /// Called when a step's `run` returned an error.
    fn step_failed(&mut self, unique_id: &str, error: &str) -> Result<(), TangoError>;

    /// A previously stored result, if any.
    fn cached_result(&self, unique_id: &str) -> Result<Option<Value>, TangoError>;

    /// Record a set of target steps under a run name. Invents a name when none is given.
    fn register_run(
        &mut self,
        targets: Vec<StepInfo>,
        name: Option<&str>,
    ) -> Result<String, TangoError>;

    fn registered_runs(&self) -> BTreeMap<String, Run>;

    fn registered_run(&self, name: &str) -> Result<Run, TangoError> {
        self.registered_runs()
            .remove(name)
            .ok_or_else(|| TangoError::workspace(format!("no run named '{name}'")))
    }
}

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "daring", "eager", "fancy", "gentle", "hardy", "jolly", "keen",
    "lively", "mellow", "nimble", "polite", "quick", "rapid", "sunny", "tidy", "vivid", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "condor", "dingo", "egret", "falcon", "gecko", "heron", "ibis", "jackal", "koala",
    "lemur", "marmot", "newt", "otter", "panda", "quail", "raven", "stoat", "tapir", "walrus",
];

/// A readable run name like `brisk-otter`.
pub fn generate_run_name() -> String {
    let id = uuid::Uuid::new_v4();
    let bytes = id.as_bytes();
    let adjective = ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()];
    let noun = NOUNS[bytes[1] as usize % NOUNS.len()];
    format!("{adjective}-{noun}")
}

fn ensure_running(info: &StepInfo, action: &str) -> Result<(), TangoError> {
    if info.state() != StepState::Running {
        return Err(TangoError::workspace(format!(
            "step {} is {action}, but it never started",
            info.unique_id
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MemoryWorkspace
// ---------------------------------------------------------------------------

/// Keeps all records and results in memory. Nothing is cached across restarts.
#[derive(Debug, Default)]
pub struct MemoryWorkspace {
    infos: HashMap<String, StepInfo>,
    results: HashMap<String, Value>,
    runs: BTreeMap<String, BTreeSet<String>>,
}

impl MemoryWorkspace {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Workspace for MemoryWorkspace {
    fn work_dir(&self, unique_id: &str) -> Result<PathBuf, TangoError> {
        let dir = std::env::temp_dir()
            .join("tango")
            .join(format!("{unique_id}.step_dir"));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn step_info(&self, unique_id: &str) -> Option<StepInfo> {
        self.infos.get(unique_id).cloned()
    }

    fn steps(&self, include_completed: bool) -> Vec<StepInfo> {
        self.infos
            .values()
            .filter(|info| include_completed || info.end_time.is_none())
            .cloned()
            .collect()
    }

    fn step_starting(&mut self, mut info: StepInfo) -> Result<(), TangoError> {
        info.start_time = Some(Utc::now());
        info.end_time = None;
        info.error = None;
        self.infos.insert(info.unique_id.clone(), info);
        Ok(())
    }

    fn step_finished(
        &mut self,
        unique_id: &str,
        result: &Value,
        cache: bool,
    ) -> Result<(), TangoError> {
        let info = self
            .infos
            .get_mut(unique_id)
            .ok_or_else(|| TangoError::workspace(format!("unknown step {unique_id}")))?;
        ensure_running(info, "ending")?;
        info.end_time = Some(Utc::now());
        if cache {
            self.results.insert(unique_id.to_string(), result.clone());
        }
        Ok(())
    }

    fn step_failed(&mut self, unique_id: &str, error: &str) -> Result<(), TangoError> {
        let info = self
            .infos
            .get_mut(unique_id)
            .ok_or_else(|| TangoError::workspace(format!("unknown step {unique_id}")))?;
        ensure_running(info, "failing")?;
        info.end_time = Some(Utc::now());
        info.error = Some(error.to_string());
        Ok(())
    }

    fn cached_result(&self, unique_id: &str) -> Result<Option<Value>, TangoError> {
        Ok(self.results.get(unique_id).cloned())
    }

    fn register_run(
        &mut self,
        targets: Vec<StepInfo>,
        name: Option<&str>,
    ) -> Result<String, TangoError> {
        let name = name.map(str::to_string).unwrap_or_else(generate_run_name);
        let mut ids = BTreeSet::new();
        for info in targets {
            ids.insert(info.unique_id.clone());
            self.infos.entry(info.unique_id.clone()).or_insert(info);
        }
        self.runs.insert(name.clone(), ids);
        Ok(name)
    }

    fn registered_runs(&self) -> BTreeMap<String, Run> {
        self.runs
            .iter()
            .map(|(name, ids)| {
                let run = ids
                    .iter()
                    .filter_map(|id| self.infos.get(id).map(|info| (id.clone(), info.clone())))
                    .collect();
                (name.clone(), run)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// LocalWorkspace
// ---------------------------------------------------------------------------

/// Directory-backed workspace.
///
/// Layout:
/// - `cache/<unique_id>/data.json`: step result
/// - `cache/<unique_id>/info.json`: step record
/// - `work/<unique_id>/`: step work directory
/// - `runs/<name>.json`: unique ids of a run's targets
#[derive(Debug, Clone)]
pub struct LocalWorkspace {
    dir: PathBuf,
    format: JsonFormat,
}

impl LocalWorkspace {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, TangoError> {
        let dir = dir.into();
        for sub in ["cache", "work", "runs"] {
            std::fs::create_dir_all(dir.join(sub))?;
        }
        debug!(dir = %dir.display(), "Opened local workspace");
        Ok(Self {
            dir,
            format: JsonFormat,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn cache_dir(&self, unique_id: &str) -> PathBuf {
        self.dir.join("cache").join(unique_id)
    }

    fn read_info(&self, unique_id: &str) -> Result<Option<StepInfo>, TangoError> {
        let path = self.cache_dir(unique_id).join("info.json");
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn write_info(&self, info: &StepInfo) -> Result<(), TangoError> {
        let dir = self.cache_dir(&info.unique_id);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("info.json"), serde_json::to_vec_pretty(info)?)?;
        Ok(())
    }

    fn running_info(&self, unique_id: &str, action: &str) -> Result<StepInfo, TangoError> {
        let info = self
            .read_info(unique_id)?
            .ok_or_else(|| TangoError::workspace(format!("unknown step {unique_id}")))?;
        ensure_running(&info, action)?;
        Ok(info)
    }
}

impl Workspace for LocalWorkspace {
    fn work_dir(&self, unique_id: &str) -> Result<PathBuf, TangoError> {
        let dir = self.dir.join("work").join(unique_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn step_info(&self, unique_id: &str) -> Option<StepInfo> {
        self.read_info(unique_id).ok().flatten()
    }

    fn steps(&self, include_completed: bool) -> Vec<StepInfo> {
        let Ok(entries) = std::fs::read_dir(self.dir.join("cache")) else {
            return Vec::new();
        };
        let mut infos: Vec<StepInfo> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| self.step_info(&e.file_name().to_string_lossy()))
            .filter(|info| include_completed || info.end_time.is_none())
            .collect();
        infos.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
        infos
    }

    fn step_starting(&mut self, mut info: StepInfo) -> Result<(), TangoError> {
        info.start_time = Some(Utc::now());
        info.end_time = None;
        info.error = None;
        self.write_info(&info)
    }

    fn step_finished(
        &mut self,
        unique_id: &str,
        result: &Value,
        cache: bool,
    ) -> Result<(), TangoError> {
        let mut info = self.running_info(unique_id, "ending")?;
        info.end_time = Some(Utc::now());
        if cache {
            let path = self.format.write(result, &self.cache_dir(unique_id))?;
            info.result_location = Some(path.display().to_string());
        }
        self.write_info(&info)
    }

    fn step_failed(&mut self, unique_id: &str, error: &str) -> Result<(), TangoError> {
        let mut info = self.running_info(unique_id, "failing")?;
        info.end_time = Some(Utc::now());
        info.error = Some(error.to_string());
        self.write_info(&info)
    }

    fn cached_result(&self, unique_id: &str) -> Result<Option<Value>, TangoError> {
        match self.read_info(unique_id)? {
            Some(info) if info.state() == StepState::Completed => {
                self.format.read(&self.cache_dir(unique_id))
            }
            _ => Ok(None),
        }
    }

    fn register_run(
        &mut self,
        targets: Vec<StepInfo>,
        name: Option<&str>,
    ) -> Result<String, TangoError> {
        let name = name.map(str::to_string).unwrap_or_else(generate_run_name);
        let mut ids = BTreeSet::new();
        for info in targets {
            if self.read_info(&info.unique_id)?.is_none() {
                self.write_info(&info)?;
            }
            ids.insert(info.unique_id);
        }
        let path = self.dir.join("runs").join(format!("{name}.json"));
        std::fs::write(path, serde_json::to_vec_pretty(&ids)?)?;
        Ok(name)
    }

    fn registered_runs(&self) -> BTreeMap<String, Run> {
        let Ok(entries) = std::fs::read_dir(self.dir.join("runs")) else {
            return BTreeMap::new();
        };
        let mut runs = BTreeMap::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Some(name) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            let ids: BTreeSet<String> = match std::fs::read_to_string(&path)
                .ok()
                .and_then(|c| serde_json::from_str(&c).ok())
            {
                Some(ids) => ids,
                None => continue,
            };
            let run = ids
                .into_iter()
                .filter_map(|id| self.step_info(&id).map(|info| (id, info)))
                .collect();
            runs.insert(name, run);
        }
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str) -> StepInfo {
        StepInfo {
            unique_id: id.to_string(),
            step_name: Some(format!("{id}-name")),
            step_class_name: "test::step".into(),
            version: None,
            dependencies: BTreeSet::new(),
            start_time: None,
            end_time: None,
            error: None,
            result_location: None,
        }
    }

    #[test]
    fn test_memory_lifecycle() {
        let mut ws = MemoryWorkspace::new();
        ws.step_starting(info("a")).unwrap();
        assert_eq!(ws.step_info("a").unwrap().state(), StepState::Running);
        ws.step_finished("a", &serde_json::json!(1), true).unwrap();
        assert_eq!(ws.step_info("a").unwrap().state(), StepState::Completed);
        assert_eq!(ws.cached_result("a").unwrap(), Some(serde_json::json!(1)));
    }

    #[test]
    fn test_finish_without_start_fails() {
        let mut ws = MemoryWorkspace::new();
        ws.register_run(vec![info("a")], Some("r")).unwrap();
        assert!(ws.step_finished("a", &serde_json::json!(1), true).is_err());
        assert!(ws.step_failed("missing", "boom").is_err());
    }

    #[test]
    fn test_memory_failure_recorded() {
        let mut ws = MemoryWorkspace::new();
        ws.step_starting(info("a")).unwrap();
        ws.step_failed("a", "boom").unwrap();
        let info = ws.step_info("a").unwrap();
        assert_eq!(info.state(), StepState::Failed);
        assert_eq!(info.error.as_deref(), Some("boom"));
        assert!(ws.steps(false).is_empty());
    }

    #[test]
    fn test_register_run_generates_name() {
        let mut ws = MemoryWorkspace::new();
        let name = ws.register_run(vec![info("a"), info("b")], None).unwrap();
        assert!(name.contains('-'));
        let run = ws.registered_run(&name).unwrap();
        assert_eq!(run.len(), 2);
        assert!(ws.registered_run("nope").is_err());
    }

    #[test]
    fn test_local_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ws = LocalWorkspace::open(dir.path()).unwrap();
            ws.register_run(vec![info("a")], Some("first")).unwrap();
            ws.step_starting(info("a")).unwrap();
            ws.step_finished("a", &serde_json::json!({"loss": 1.0}), true)
                .unwrap();
        }
        let ws = LocalWorkspace::open(dir.path()).unwrap();
        assert_eq!(
            ws.cached_result("a").unwrap(),
            Some(serde_json::json!({"loss": 1.0}))
        );
        let info = ws.step_info("a").unwrap();
        assert!(info.result_location.unwrap().ends_with("data.json"));
        let runs = ws.registered_runs();
        assert_eq!(runs["first"].len(), 1);
        assert_eq!(ws.steps(true).len(), 1);
    }

    #[test]
    fn test_local_failed_step_has_no_cached_result() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = LocalWorkspace::open(dir.path()).unwrap();
        ws.step_starting(info("a")).unwrap();
        ws.step_failed("a", "boom").unwrap();
        assert_eq!(ws.cached_result("a").unwrap(), None);
        assert!(ws.work_dir("a").unwrap().is_dir());
    }
}
