use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tide_core::impls::{InMemoryKvPubSub, InMemoryRecordStore};
use tide_core::{
    CoordinatorBuilder, Handler, SyncHandler, Task, TaskFailure, TaskId, TideConfig,
    TideCoordinator, TideError, TideRunner,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Runs several coordinator "processes" over one shared in-memory store and
/// shows that only one of them drives tasks at a time.
#[derive(Parser, Debug)]
#[command(name = "tide", about = "Single-active-run task coordinator demo")]
struct Args {
    /// Number of simulated coordinator processes
    #[arg(long, default_value_t = 3, env = "TIDE_PROCESSES")]
    processes: usize,

    /// Number of tasks to submit
    #[arg(long, default_value_t = 6)]
    tasks: u32,

    /// KV + pub/sub endpoint (only memory:// is supported)
    #[arg(long, env = "TIDE_RESULT_CHANNEL_URL", default_value = "memory://local")]
    result_channel_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Square {
    value: i64,
}

impl Task for Square {
    const KIND: &'static str = "demo.square.v1";
    type Output = i64;
}

struct SquareHandler;

#[async_trait]
impl Handler<Square> for SquareHandler {
    async fn handle(&self, task: Square) -> Result<i64, TaskFailure> {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        task.value
            .checked_mul(task.value)
            .ok_or_else(|| TaskFailure::new(format!("{} squared overflows", task.value)))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Shout {
    text: String,
}

impl Task for Shout {
    const KIND: &'static str = "demo.shout.v1";
    type Output = String;
}

struct ShoutHandler;

impl SyncHandler<Shout> for ShoutHandler {
    fn handle(&self, task: Shout) -> Result<String, TaskFailure> {
        Ok(format!("{}!", task.text.to_uppercase()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Explode;

impl Task for Explode {
    const KIND: &'static str = "demo.explode.v1";
    type Output = ();
}

struct ExplodeHandler;

#[async_trait]
impl Handler<Explode> for ExplodeHandler {
    async fn handle(&self, _task: Explode) -> Result<(), TaskFailure> {
        Err(TaskFailure::new("boom").with_trace("ExplodeHandler::handle"))
    }
}

fn check_endpoint(url: &str) -> Result<(), TideError> {
    match url.split_once("://") {
        Some(("memory", _)) => Ok(()),
        Some((scheme, _)) => Err(TideError::Configuration(format!(
            "unsupported result channel scheme '{scheme}' (only memory:// is available)"
        ))),
        None => Err(TideError::Configuration(format!(
            "invalid result channel url '{url}'"
        ))),
    }
}

fn build_process(
    config: &TideConfig,
    store: &InMemoryRecordStore,
    kv: &InMemoryKvPubSub,
) -> Result<Arc<TideCoordinator>, TideError> {
    let coordinator = CoordinatorBuilder::new()
        .store(Arc::new(store.clone()))
        .kv(Arc::new(kv.clone()))
        .config(config.clone())
        .register::<Square, _>(SquareHandler)?
        .register_sync::<Shout, _>(ShoutHandler)?
        .register::<Explode, _>(ExplodeHandler)?
        .expect_kinds(&[Square::KIND, Shout::KIND, Explode::KIND])
        .build()
        .map_err(|e| TideError::Configuration(e.to_string()))?;
    Ok(Arc::new(coordinator))
}

/// Submit through one process, await through another.
async fn run_demo(
    submitter: &TideCoordinator,
    awaiter: &TideCoordinator,
    tasks: u32,
) -> Result<(), TideError> {
    let mut submitted: Vec<(TaskId, &'static str)> = Vec::new();
    for i in 0..tasks {
        let i = i64::from(i);
        let (id, kind) = match i % 3 {
            0 => (submitter.submit_task(&Square { value: i }).await?, Square::KIND),
            1 => (
                submitter
                    .submit_task(&Shout {
                        text: format!("task {i}"),
                    })
                    .await?,
                Shout::KIND,
            ),
            _ => (submitter.submit_task(&Explode).await?, Explode::KIND),
        };
        submitted.push((id, kind));
    }

    for (id, kind) in submitted {
        match awaiter.await_result(id).await {
            Ok(value) => println!("{id} [{kind}] succeeded: {value}"),
            Err(TideError::TaskFailed { failure, .. }) => {
                println!("{id} [{kind}] failed: {failure}")
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), TideError> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tide=info")),
        )
        .init();

    let mut config = TideConfig::from_env()?;
    config.result_channel_url = Some(args.result_channel_url.clone());
    check_endpoint(config.result_channel_url()?)?;

    // 共有の DB / Redis の代わり
    let store = InMemoryRecordStore::new();
    let kv = InMemoryKvPubSub::new();

    let processes = (0..args.processes.max(1))
        .map(|_| build_process(&config, &store, &kv))
        .collect::<Result<Vec<_>, _>>()?;
    let runners: Vec<TideRunner> = processes
        .iter()
        .map(|p| TideRunner::spawn(Arc::clone(p)))
        .collect();
    info!(processes = processes.len(), "coordinators started");

    let submitter = &processes[0];
    let awaiter = &processes[processes.len() - 1];

    let outcome = tokio::select! {
        outcome = run_demo(submitter, awaiter, args.tasks) => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted");
            Ok(())
        }
    };

    for runner in runners {
        runner.shutdown_and_join().await;
    }

    let report = awaiter.report().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    outcome
}
