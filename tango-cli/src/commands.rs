//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::job::EvalJob;
use anyhow::Context;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tango_core::config::{WORKSPACE_CONFIG_FILE, load_config, load_config_with_job};
use tango_core::{
    Executor, LocalWorkspace, MemoryWorkspace, Step, StepGraph, TangoConfig, Workspace,
};
use tango_flax::FlaxRegistry;
use tracing::info;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Eval { config, run_name } => {
            let metrics = run_eval(&config, run_name, workspace).await?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
            Ok(())
        }
        Commands::Config { action } => handle_config(action, workspace).await,
    }
}

async fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace.join(WORKSPACE_CONFIG_FILE);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            let toml_str = toml::to_string_pretty(&TangoConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Assemble the job's evaluation step and run it through an executor.
/// Returns the step's aggregated metrics.
pub(crate) async fn run_eval(
    job_path: &Path,
    run_name: Option<String>,
    workspace: &Path,
) -> anyhow::Result<Value> {
    let config = load_config_with_job(Some(workspace), job_path, None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let job = EvalJob::load(job_path)?;
    let base_dir = job_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let registry = FlaxRegistry::with_builtins()?;
    let step: Arc<dyn Step> = Arc::new(job.build_step(&config, &base_dir, &registry)?);
    let step_name = step.name().to_string();
    info!(step = %step_name, id = %step.unique_id(), "Assembled evaluation step");

    let mut graph = StepGraph::new();
    graph.add(step);

    let store = config.workspace.dir.map(|dir| workspace.join(dir));
    // Steps run synchronously; keep them off the async workers.
    tokio::task::spawn_blocking(move || -> anyhow::Result<Value> {
        match store {
            Some(dir) => run_graph(
                Executor::new(LocalWorkspace::open(dir)?),
                &graph,
                &step_name,
                run_name.as_deref(),
            ),
            None => run_graph(
                Executor::new(MemoryWorkspace::new()),
                &graph,
                &step_name,
                run_name.as_deref(),
            ),
        }
    })
    .await?
}

fn run_graph<W: Workspace>(
    mut executor: Executor<W>,
    graph: &StepGraph,
    step_name: &str,
    run_name: Option<&str>,
) -> anyhow::Result<Value> {
    let (output, mut results) = executor.execute_step_graph(graph, run_name)?;
    if output.failed.contains(step_name) {
        anyhow::bail!("Step '{step_name}' failed, see the log for details");
    }
    results
        .remove(step_name)
        .with_context(|| format!("no result recorded for step '{step_name}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_job(dir: &Path, params: Value) -> PathBuf {
        std::fs::write(
            dir.join("data.json"),
            json!({
                "test": {
                    "x": [[0.0], [1.0], [2.0], [3.0]],
                    "labels": [1.0, 3.0, 5.0, 8.0]
                }
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(dir.join("params.json"), params.to_string()).unwrap();
        let job = dir.join("job.toml");
        std::fs::write(
            &job,
            r#"
[job]
step_name = "regression"
dataset = "data.json"
params = "params.json"
model = { type = "linear", in_features = 1 }
eval_wrapper = "mse"
callbacks = [{ type = "metrics_file", file_name = "final.json" }]

[devices]
count = 1

[dataloader]
batch_size = 2
shuffle = false
"#,
        )
        .unwrap();
        job
    }

    #[tokio::test]
    async fn test_config_init_creates_file() {
        let dir = TempDir::new().unwrap();
        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, dir.path()).await.unwrap();

        let content = std::fs::read_to_string(dir.path().join(WORKSPACE_CONFIG_FILE)).unwrap();
        let parsed: TangoConfig = toml::from_str(&content).unwrap();
        assert_eq!(parsed, TangoConfig::default());
    }

    #[tokio::test]
    async fn test_config_init_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(WORKSPACE_CONFIG_FILE);
        std::fs::write(&path, "[eval]\nseed = 3\n").unwrap();

        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, dir.path()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[eval]\nseed = 3\n");
    }

    #[tokio::test]
    async fn test_config_show_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(WORKSPACE_CONFIG_FILE),
            "[eval]\nlog_every = 0\n",
        )
        .unwrap();
        let command = Commands::Config {
            action: ConfigAction::Show,
        };
        assert!(handle_command(command, dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_eval_runs_and_caches() {
        let dir = TempDir::new().unwrap();
        let job = write_job(dir.path(), json!({"kernel": [[2.0]], "bias": [1.0]}));

        let metrics = run_eval(&job, Some("first".into()), dir.path())
            .await
            .unwrap();
        // Only row 3 is off, by one.
        assert_eq!(metrics, json!({"loss": 0.25}));
        assert!(dir.path().join(".tango").join("runs").join("first.json").exists());

        let again = run_eval(&job, Some("second".into()), dir.path())
            .await
            .unwrap();
        assert_eq!(again, metrics);
    }

    #[tokio::test]
    async fn test_eval_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        // Kernel expects two features, the data has one.
        let job = write_job(dir.path(), json!({"kernel": [[1.0], [1.0]], "bias": [0.0]}));
        let err = run_eval(&job, None, dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("regression"), "{err}");
    }

    #[tokio::test]
    async fn test_eval_missing_job_file() {
        let dir = TempDir::new().unwrap();
        let err = run_eval(&dir.path().join("nope.toml"), None, dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Configuration error"), "{err}");
    }
}
