//! Settings read from `SWARM_*` environment variables

use std::path::PathBuf;
use std::str::FromStr;

use agent_runner::{AgentKind, EngineConfig, ParallelConfig, SandboxRequest};
use anyhow::{anyhow, Context, Result};

#[derive(Debug, Clone)]
pub struct Settings {
    /// Where the task file lives
    pub data_dir: PathBuf,
    /// Repository the worktrees are cut from
    pub repo: PathBuf,
    pub agent: String,
    pub model: Option<String>,
    pub parallel: ParallelConfig,
    pub engine: EngineConfig,
    /// Remove worktrees of completed tasks after the run
    pub cleanup: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let data_dir = get("SWARM_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".swarm-data"));
        let repo = get("SWARM_REPO")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let agent = match get("SWARM_AGENT") {
            Some(name) => AgentKind::parse(&name)
                .map(|kind| kind.as_str().to_string())
                .unwrap_or(name),
            None => AgentKind::Claude.as_str().to_string(),
        };

        let mut parallel = ParallelConfig::default();
        if let Some(value) = get("SWARM_MAX_WORKERS") {
            parallel.max_workers = parse_number("SWARM_MAX_WORKERS", &value)?;
            if parallel.max_workers == 0 {
                return Err(anyhow!("SWARM_MAX_WORKERS must be at least 1"));
            }
        }
        if let Some(value) = get("SWARM_SANDBOX") {
            parallel.sandbox = SandboxRequest::from_str(&value)
                .with_context(|| format!("Invalid SWARM_SANDBOX value '{}'", value))?;
        }
        if let Some(value) = get("SWARM_BASE_BRANCH") {
            parallel.base_branch = value;
        }

        let mut engine = EngineConfig::default();
        if let Some(value) = get("SWARM_MAX_ITERATIONS") {
            engine.max_iterations = parse_number("SWARM_MAX_ITERATIONS", &value)?;
        }

        let cleanup = match get("SWARM_CLEANUP") {
            Some(value) => parse_flag("SWARM_CLEANUP", &value)?,
            None => false,
        };

        Ok(Self {
            data_dir,
            repo,
            agent,
            model: get("SWARM_MODEL"),
            parallel,
            engine,
            cleanup,
        })
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.data_dir.join("tasks.json")
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{} must be a number, got '{}'", key, value))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{} must be a boolean, got '{}'", key, other)),
    }
}
