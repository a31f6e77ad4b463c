//! `swarm` - run coding agents over a task backlog, one git worktree per task
//!
//! Usage:
//!   swarm [run]             work the backlog with the configured agent
//!   swarm add <title> [..]  add a task; extra words become its description
//!   swarm list              show open tasks
//!   swarm agents            detect the supported agent CLIs
//!
//! Everything else is configured through `SWARM_*` environment variables.

mod render;
mod settings;

use std::io::IsTerminal;
use std::sync::Arc;

use agent_runner::color::Palette;
use agent_runner::{
    AgentConfig, AgentRegistry, GitCommitter, ParallelOrchestrator, PluginEngineFactory,
    SandboxDetector,
};
use anyhow::{bail, Context, Result};
use git_worktree::{WorktreeConfig, WorktreeManager};
use swarm_core::task::{FileTaskTracker, Task, TaskTracker};
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::render::EventPrinter;
use crate::settings::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "swarm=info,agent_runner=info,git_worktree=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let settings = Settings::from_env()?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        None | Some("run") => run(&settings).await,
        Some("add") => add(&settings, &args[1..]).await,
        Some("list") => list(&settings).await,
        Some("agents") => agents().await,
        Some(other) => bail!("Unknown command '{}' (expected run, add, list or agents)", other),
    }
}

async fn tracker(settings: &Settings) -> Result<FileTaskTracker> {
    tracing::info!("Using data directory: {:?}", settings.data_dir);
    FileTaskTracker::new(settings.tasks_path())
        .await
        .with_context(|| format!("Failed to open task file {:?}", settings.tasks_path()))
}

async fn add(settings: &Settings, words: &[String]) -> Result<()> {
    let Some((title, rest)) = words.split_first() else {
        bail!("Usage: swarm add <title> [description]");
    };
    let mut task = Task::new(title.clone());
    if !rest.is_empty() {
        task = task.with_description(rest.join(" "));
    }
    let task = tracker(settings).await?.create(task).await?;
    println!("{}", task.id);
    Ok(())
}

async fn list(settings: &Settings) -> Result<()> {
    for task in tracker(settings).await?.list_open().await? {
        println!("{}\t{:?}\t{}", task.id, task.priority, task.title);
    }
    Ok(())
}

async fn agents() -> Result<()> {
    let registry = AgentRegistry::with_builtin();
    for (id, result) in registry.detect_all().await {
        let detail = match (&result.version, &result.error) {
            (Some(version), _) => version.clone(),
            (None, Some(error)) => error.clone(),
            (None, None) => "available".to_string(),
        };
        println!("{}\t{}\t{}", id, if result.available { "ok" } else { "missing" }, detail);
    }
    Ok(())
}

async fn run(settings: &Settings) -> Result<()> {
    let tracker = Arc::new(tracker(settings).await?);

    let repo = tokio::fs::canonicalize(&settings.repo)
        .await
        .with_context(|| format!("Repository {:?} does not exist", settings.repo))?;
    let worktrees = Arc::new(
        WorktreeManager::with_config(
            &repo,
            WorktreeConfig {
                worktree_dir: settings.parallel.worktree_dir.clone(),
                base_ref: settings.parallel.base_branch.clone(),
            },
        )
        .await
        .context("Failed to open repository")?,
    );

    let registry = AgentRegistry::with_builtin();
    let mut agent_config = AgentConfig::default();
    agent_config.model = settings.model.clone();
    let plugin = registry.create(&settings.agent, agent_config)?;

    let setup = plugin.validate_setup().await;
    if !setup.ready {
        bail!("{} is not ready: {}", plugin.meta().name, setup.issues.join("; "));
    }

    let sandbox = SandboxDetector::new().resolve(settings.parallel.sandbox).await;
    tracing::info!(
        "Running {} with up to {} workers (sandbox: {})",
        plugin.meta().name,
        settings.parallel.max_workers,
        sandbox
    );

    let factory = PluginEngineFactory::new(plugin, settings.engine.clone())
        .with_sandbox(sandbox)
        .with_committer(Arc::new(GitCommitter::new(Arc::clone(&worktrees))));
    let orchestrator = Arc::new(ParallelOrchestrator::new(
        settings.parallel.clone(),
        tracker,
        worktrees,
        Arc::new(factory),
    ));

    let palette = if std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none() {
        Palette::Ansi
    } else {
        Palette::Plain
    };
    let mut events = orchestrator.event_stream();
    let printer = tokio::spawn(async move {
        let mut printer = EventPrinter::new(palette);
        while let Some(event) = events.next().await {
            let done = matches!(event, agent_runner::ParallelEvent::AllComplete { .. });
            if let Some(line) = printer.render(&event) {
                println!("{}", line);
            }
            if done {
                break;
            }
        }
    });

    let stopper = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, stopping workers");
            stopper.stop().await;
        }
    });

    let summary = orchestrator.run().await?;
    printer.await.context("Event printer panicked")?;

    if settings.cleanup {
        let removed = orchestrator.cleanup_worktrees().await;
        tracing::info!("Removed {} worktrees", removed);
    }

    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
