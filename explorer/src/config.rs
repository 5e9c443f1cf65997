use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database holding the event log and the screen graph
    pub database_url: String,
    /// Outbox publisher tick period
    pub outbox_poll_ms: u64,
    /// Max outbox rows delivered per tick
    pub outbox_batch_size: i64,
    /// Graph projector tick period
    pub projector_poll_ms: u64,
    /// Max runs the projector serves per tick
    pub projector_max_runs_per_tick: i64,
    /// Max events consumed from one run per tick
    pub projector_events_per_run: i64,
}

impl Config {
    /// Load `.env` (nearest ancestor of the working directory), then read
    /// the process environment. Variables already set win over the file.
    pub fn load() -> anyhow::Result<(Self, Option<PathBuf>)> {
        let env_file = match std::env::current_dir() {
            Ok(cwd) => load_dotenv_from(&cwd),
            Err(e) => {
                tracing::warn!(error = %e, "No working directory; skipping .env lookup");
                None
            }
        };
        Ok((Self::from_env()?, env_file))
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: env_str("EXPLORER_DATABASE_URL", "sqlite:./data/explorer.db"),
            outbox_poll_ms: env_parse("OUTBOX_POLL_MS", 1000)?,
            outbox_batch_size: env_parse("OUTBOX_BATCH_SIZE", 100)?,
            projector_poll_ms: env_parse("PROJECTOR_POLL_MS", 1000)?,
            projector_max_runs_per_tick: env_parse("PROJECTOR_MAX_RUNS_PER_TICK", 8)?,
            projector_events_per_run: env_parse("PROJECTOR_EVENTS_PER_RUN", 200)?,
        })
    }
}

/// Walk up from `start` to the first `.env` and load it. Returns the file
/// that was found, even if it failed to parse.
fn load_dotenv_from(start: &Path) -> Option<PathBuf> {
    let env_file = start.ancestors().map(|dir| dir.join(".env")).find(|f| f.is_file())?;
    if let Err(e) = dotenvy::from_path(&env_file) {
        tracing::warn!(path = %env_file.display(), error = %e, "Failed to load .env file");
    }
    Some(env_file)
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}
