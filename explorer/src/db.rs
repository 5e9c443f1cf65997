use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::time::Duration;

/// How long a connection waits on a held write lock before `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (creating if needed) a file-backed database and run migrations.
///
/// The store, publisher, and projector share the file from separate
/// connections, so it runs in WAL mode: readers never block the writer and
/// writers queue on the busy timeout.
pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let Some(path) = database_path(database_url)? else {
        return connect_in_memory().await;
    };
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!(path = %path.display(), "Opened explorer database");
    Ok(pool)
}

/// Resolve `sqlite:./foo.db` or a bare path against the working directory.
/// `None` means an in-memory database.
fn database_path(database_url: &str) -> anyhow::Result<Option<PathBuf>> {
    let raw = database_url.strip_prefix("sqlite:").unwrap_or(database_url);
    if raw == ":memory:" {
        return Ok(None);
    }
    Ok(Some(std::env::current_dir()?.join(raw)))
}

/// In-memory database for tests. A single connection that is never recycled,
/// otherwise each new connection would see an empty database.
pub async fn connect_in_memory() -> anyhow::Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// Timestamps are stored as fixed-precision RFC 3339 text so they sort
/// lexicographically.
pub(crate) fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}
