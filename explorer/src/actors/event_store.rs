//! EventStoreActor - per-run append-only event log, outbox, and state snapshots
//!
//! This actor owns the SQLite tables that make a run durable:
//!
//! - `runs` - one row per exploration session
//! - `agent_state_snapshots` - one immutable snapshot per committed step
//! - `events` - the append-only log, gapless per run starting at sequence 1
//! - `outbox` - one delivery intent per event, written in the same transaction
//!
//! Snapshot and event writes for a step share a single transaction, so a
//! crash leaves either both or neither.
//!
//! # Example
//!
//! ```rust,ignore
//! use ractor::Actor;
//!
//! let (store_ref, _handle) =
//!     Actor::spawn(None, EventStoreActor, EventStoreArguments::InMemory).await?;
//!
//! let events = commit_step(&store_ref, next_state, vec![payload]).await??;
//! ```

use async_trait::async_trait;
use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::db::{decode_ts, encode_ts};
use shared_types::{AgentState, DomainEvent, EventPayload, NodeName, OutboxEntry, Run, RunStatus};

/// Actor that manages the append-only event log
#[derive(Debug, Default)]
pub struct EventStoreActor;

/// Arguments for spawning EventStoreActor
#[derive(Debug, Clone)]
pub enum EventStoreArguments {
    /// File-based database path
    File(String),
    /// In-memory database (for testing)
    InMemory,
    /// Existing pool shared with the graph store
    Pool(SqlitePool),
}

/// State for EventStoreActor
pub struct EventStoreState {
    pool: SqlitePool,
}

/// Maximum rows returned by a single range query.
const MAX_QUERY_LIMIT: i64 = 1000;

/// Write transactions take the write lock up front so a concurrent writer
/// waits on the busy timeout instead of failing its lock upgrade.
pub(crate) const BEGIN_WRITE: &str = "BEGIN IMMEDIATE";

// ============================================================================
// Messages
// ============================================================================

/// Messages handled by EventStoreActor
#[derive(Debug)]
pub enum EventStoreMsg {
    /// Create a run together with its step-0 snapshot and opening events
    StartRun {
        run: Run,
        initial: AgentState,
        events: Vec<EventPayload>,
        reply: RpcReplyPort<Result<Vec<DomainEvent>, EventStoreError>>,
    },
    /// Persist the next snapshot and append its events atomically
    CommitStep {
        state: AgentState,
        events: Vec<EventPayload>,
        reply: RpcReplyPort<Result<Vec<DomainEvent>, EventStoreError>>,
    },
    /// Append a single event outside of a step commit
    Append {
        run_id: String,
        payload: EventPayload,
        reply: RpcReplyPort<Result<DomainEvent, EventStoreError>>,
    },
    GetRun {
        run_id: String,
        reply: RpcReplyPort<Result<Option<Run>, EventStoreError>>,
    },
    /// Last assigned sequence for a run, 0 if the run has no events
    GetLastEventSequence {
        run_id: String,
        reply: RpcReplyPort<Result<i64, EventStoreError>>,
    },
    /// Events with `sequence >= from_seq`, ascending
    GetEventsFrom {
        run_id: String,
        from_seq: i64,
        limit: i64,
        reply: RpcReplyPort<Result<Vec<DomainEvent>, EventStoreError>>,
    },
    GetLatestSnapshot {
        run_id: String,
        reply: RpcReplyPort<Result<Option<AgentState>, EventStoreError>>,
    },
    GetSnapshotAt {
        run_id: String,
        step_ordinal: i64,
        reply: RpcReplyPort<Result<Option<AgentState>, EventStoreError>>,
    },
    /// Unpublished outbox entries with their events, ascending by sequence
    ListUnpublished {
        limit: i64,
        reply: RpcReplyPort<Result<Vec<PendingDelivery>, EventStoreError>>,
    },
    /// Append `run_failed` and mark the run failed without a new snapshot.
    /// Used when the run's own state can no longer be read or committed.
    FailRun {
        run_id: String,
        node: Option<NodeName>,
        error_id: String,
        summary: String,
        reply: RpcReplyPort<Result<DomainEvent, EventStoreError>>,
    },
    /// Stamp `published_at`; returns false if the entry was already published
    MarkPublished {
        run_id: String,
        seq: i64,
        reply: RpcReplyPort<Result<bool, EventStoreError>>,
    },
}

/// An outbox row joined with the event it mirrors.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub entry: OutboxEntry,
    pub event: DomainEvent,
}

impl EventStoreActor {
    async fn open(args: EventStoreArguments) -> anyhow::Result<SqlitePool> {
        match args {
            EventStoreArguments::File(path) => crate::db::connect(&path).await,
            EventStoreArguments::InMemory => crate::db::connect_in_memory().await,
            EventStoreArguments::Pool(pool) => Ok(pool),
        }
    }
}

#[async_trait]
impl Actor for EventStoreActor {
    type Msg = EventStoreMsg;
    type State = EventStoreState;
    type Arguments = EventStoreArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "EventStoreActor starting");

        let pool = Self::open(args)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to open database: {e}")))?;

        Ok(EventStoreState { pool })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            EventStoreMsg::StartRun {
                run,
                initial,
                events,
                reply,
            } => {
                let result = self.handle_start_run(run, initial, events, state).await;
                let _ = reply.send(result);
            }
            EventStoreMsg::CommitStep {
                state: agent_state,
                events,
                reply,
            } => {
                let result = self.handle_commit_step(agent_state, events, state).await;
                let _ = reply.send(result);
            }
            EventStoreMsg::Append {
                run_id,
                payload,
                reply,
            } => {
                let result = self.handle_append(run_id, payload, state).await;
                let _ = reply.send(result);
            }
            EventStoreMsg::GetRun { run_id, reply } => {
                let result = self.handle_get_run(&run_id, state).await;
                let _ = reply.send(result);
            }
            EventStoreMsg::GetLastEventSequence { run_id, reply } => {
                let result = last_sequence(&state.pool, &run_id).await;
                let _ = reply.send(result);
            }
            EventStoreMsg::GetEventsFrom {
                run_id,
                from_seq,
                limit,
                reply,
            } => {
                let result = self
                    .handle_get_events_from(&run_id, from_seq, limit, state)
                    .await;
                let _ = reply.send(result);
            }
            EventStoreMsg::GetLatestSnapshot { run_id, reply } => {
                let result = self.handle_get_snapshot(&run_id, None, state).await;
                let _ = reply.send(result);
            }
            EventStoreMsg::GetSnapshotAt {
                run_id,
                step_ordinal,
                reply,
            } => {
                let result = self
                    .handle_get_snapshot(&run_id, Some(step_ordinal), state)
                    .await;
                let _ = reply.send(result);
            }
            EventStoreMsg::ListUnpublished { limit, reply } => {
                let result = self.handle_list_unpublished(limit, state).await;
                let _ = reply.send(result);
            }
            EventStoreMsg::FailRun {
                run_id,
                node,
                error_id,
                summary,
                reply,
            } => {
                let result = self
                    .handle_fail_run(run_id, node, error_id, summary, state)
                    .await;
                let _ = reply.send(result);
            }
            EventStoreMsg::MarkPublished { run_id, seq, reply } => {
                let result = self.handle_mark_published(&run_id, seq, state).await;
                let _ = reply.send(result);
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "EventStoreActor stopped");
        Ok(())
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur in EventStoreActor
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum EventStoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Another writer appended or committed for this run first.
    #[error("sequence conflict on run {run_id}: expected {expected}")]
    SequenceConflict { run_id: String, expected: i64 },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run already exists: {0}")]
    RunAlreadyExists(String),

    #[error("Unknown node in snapshot: {0}")]
    UnknownNode(String),

    #[error("Checksum mismatch on run {run_id} seq {seq}")]
    ChecksumMismatch { run_id: String, seq: i64 },

    #[error("Invalid timestamp format: {0}")]
    InvalidTimestamp(String),
}

impl From<sqlx::Error> for EventStoreError {
    fn from(e: sqlx::Error) -> Self {
        EventStoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for EventStoreError {
    fn from(e: serde_json::Error) -> Self {
        EventStoreError::Serialization(e.to_string())
    }
}

impl From<chrono::ParseError> for EventStoreError {
    fn from(e: chrono::ParseError) -> Self {
        EventStoreError::InvalidTimestamp(e.to_string())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// Hex SHA-256 over the stored payload text.
pub fn payload_checksum(body_json: &str) -> String {
    hex::encode(Sha256::digest(body_json.as_bytes()))
}

// ============================================================================
// Message Handlers
// ============================================================================

impl EventStoreActor {
    async fn handle_start_run(
        &self,
        run: Run,
        initial: AgentState,
        events: Vec<EventPayload>,
        state: &mut EventStoreState,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let mut tx = state.pool.begin_with(BEGIN_WRITE).await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO runs (run_id, tenant_id, project_id, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.tenant_id)
        .bind(&run.project_id)
        .bind(run.status.as_str())
        .bind(encode_ts(&run.created_at))
        .bind(encode_ts(&run.updated_at))
        .execute(&mut *tx)
        .await;
        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                return Err(EventStoreError::RunAlreadyExists(run.run_id));
            }
            return Err(e.into());
        }

        insert_snapshot(&mut tx, &initial).await?;
        let appended = append_in_tx(&mut tx, &run, events).await?;
        tx.commit().await?;

        tracing::info!(
            run_id = %run.run_id,
            events = appended.len(),
            "Run created"
        );
        Ok(appended)
    }

    async fn handle_commit_step(
        &self,
        agent_state: AgentState,
        events: Vec<EventPayload>,
        state: &mut EventStoreState,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let mut tx = state.pool.begin_with(BEGIN_WRITE).await?;
        let run = load_run(&mut tx, &agent_state.run_id).await?;

        let (latest,): (Option<i64>,) = sqlx::query_as(
            "SELECT MAX(step_ordinal) FROM agent_state_snapshots WHERE run_id = ?1",
        )
        .bind(&agent_state.run_id)
        .fetch_one(&mut *tx)
        .await?;
        let expected = latest.map(|s| s + 1).unwrap_or(0);
        if agent_state.step_ordinal != expected {
            return Err(EventStoreError::SequenceConflict {
                run_id: agent_state.run_id.clone(),
                expected,
            });
        }

        insert_snapshot(&mut tx, &agent_state).await?;
        let appended = append_in_tx(&mut tx, &run, events).await?;

        sqlx::query("UPDATE runs SET status = ?1, updated_at = ?2 WHERE run_id = ?3")
            .bind(agent_state.status.as_str())
            .bind(encode_ts(&agent_state.timestamps.updated_at))
            .bind(&agent_state.run_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(
            run_id = %agent_state.run_id,
            step_ordinal = agent_state.step_ordinal,
            node = %agent_state.node_name,
            events = appended.len(),
            "Step committed"
        );
        Ok(appended)
    }

    async fn handle_append(
        &self,
        run_id: String,
        payload: EventPayload,
        state: &mut EventStoreState,
    ) -> Result<DomainEvent, EventStoreError> {
        let mut tx = state.pool.begin_with(BEGIN_WRITE).await?;
        let run = load_run(&mut tx, &run_id).await?;
        let mut appended = append_in_tx(&mut tx, &run, vec![payload]).await?;
        tx.commit().await?;
        appended
            .pop()
            .ok_or_else(|| EventStoreError::Database("append produced no event".to_string()))
    }

    async fn handle_get_run(
        &self,
        run_id: &str,
        state: &mut EventStoreState,
    ) -> Result<Option<Run>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT run_id, tenant_id, project_id, status, created_at, updated_at
            FROM runs
            WHERE run_id = ?1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&state.pool)
        .await?;

        row.map(|row| run_from_row(&row)).transpose()
    }

    async fn handle_get_events_from(
        &self,
        run_id: &str,
        from_seq: i64,
        limit: i64,
        state: &mut EventStoreState,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let safe_limit = limit.clamp(1, MAX_QUERY_LIMIT);
        let rows = sqlx::query(
            r#"
            SELECT run_id, seq, event_id, tenant_id, project_id, timestamp, kind, version,
                   payload, checksum
            FROM events
            WHERE run_id = ?1 AND seq >= ?2
            ORDER BY seq ASC
            LIMIT ?3
            "#,
        )
        .bind(run_id)
        .bind(from_seq)
        .bind(safe_limit)
        .fetch_all(&state.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn handle_get_snapshot(
        &self,
        run_id: &str,
        step_ordinal: Option<i64>,
        state: &mut EventStoreState,
    ) -> Result<Option<AgentState>, EventStoreError> {
        let row = match step_ordinal {
            Some(step) => {
                sqlx::query(
                    r#"
                    SELECT node_name, state_json FROM agent_state_snapshots
                    WHERE run_id = ?1 AND step_ordinal = ?2
                    "#,
                )
                .bind(run_id)
                .bind(step)
                .fetch_optional(&state.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT node_name, state_json FROM agent_state_snapshots
                    WHERE run_id = ?1
                    ORDER BY step_ordinal DESC
                    LIMIT 1
                    "#,
                )
                .bind(run_id)
                .fetch_optional(&state.pool)
                .await?
            }
        };

        let Some(row) = row else {
            return Ok(None);
        };
        let node_name: String = row.try_get("node_name")?;
        if node_name.parse::<NodeName>().is_err() {
            return Err(EventStoreError::UnknownNode(node_name));
        }
        let state_json: String = row.try_get("state_json")?;
        decode_snapshot(&state_json).map(Some)
    }

    async fn handle_list_unpublished(
        &self,
        limit: i64,
        state: &mut EventStoreState,
    ) -> Result<Vec<PendingDelivery>, EventStoreError> {
        let safe_limit = limit.clamp(1, MAX_QUERY_LIMIT);
        let rows = sqlx::query(
            r#"
            SELECT e.run_id, e.seq, e.event_id, e.tenant_id, e.project_id, e.timestamp,
                   e.kind, e.version, e.payload, e.checksum
            FROM outbox o
            JOIN events e ON e.run_id = o.run_id AND e.seq = o.seq
            WHERE o.published_at IS NULL
            ORDER BY o.seq ASC, o.run_id ASC
            LIMIT ?1
            "#,
        )
        .bind(safe_limit)
        .fetch_all(&state.pool)
        .await?;

        // An unreadable row stays pending and is skipped so it cannot hold
        // back deliveries for other runs.
        let mut pending = Vec::with_capacity(rows.len());
        for row in &rows {
            match event_from_row(row) {
                Ok(event) => pending.push(PendingDelivery {
                    entry: OutboxEntry {
                        run_id: event.run_id.clone(),
                        sequence: event.sequence,
                        event_id: event.event_id.clone(),
                        published_at: None,
                    },
                    event,
                }),
                Err(err) => {
                    let run_id: String = row.try_get("run_id").unwrap_or_default();
                    let seq: i64 = row.try_get("seq").unwrap_or_default();
                    tracing::error!(run_id = %run_id, seq, error = %err, "Skipping unreadable outbox entry");
                }
            }
        }
        Ok(pending)
    }

    async fn handle_fail_run(
        &self,
        run_id: String,
        node: Option<NodeName>,
        error_id: String,
        summary: String,
        state: &mut EventStoreState,
    ) -> Result<DomainEvent, EventStoreError> {
        let mut tx = state.pool.begin_with(BEGIN_WRITE).await?;
        let run = load_run(&mut tx, &run_id).await?;
        let failed = EventPayload::RunFailed {
            node,
            error_id: error_id.clone(),
            summary,
        };
        let mut appended = append_in_tx(&mut tx, &run, vec![failed]).await?;

        sqlx::query("UPDATE runs SET status = ?1, updated_at = ?2 WHERE run_id = ?3")
            .bind(RunStatus::Failed.as_str())
            .bind(encode_ts(&Utc::now()))
            .bind(&run_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::error!(run_id = %run_id, error_id = %error_id, "Run marked failed");
        appended
            .pop()
            .ok_or_else(|| EventStoreError::Database("fail_run produced no event".to_string()))
    }

    async fn handle_mark_published(
        &self,
        run_id: &str,
        seq: i64,
        state: &mut EventStoreState,
    ) -> Result<bool, EventStoreError> {
        let affected = sqlx::query(
            r#"
            UPDATE outbox SET published_at = ?1
            WHERE run_id = ?2 AND seq = ?3 AND published_at IS NULL
            "#,
        )
        .bind(encode_ts(&Utc::now()))
        .bind(run_id)
        .bind(seq)
        .execute(&state.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }
}

// ============================================================================
// Transaction Helpers
// ============================================================================

async fn load_run(tx: &mut Transaction<'_, Sqlite>, run_id: &str) -> Result<Run, EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT run_id, tenant_id, project_id, status, created_at, updated_at
        FROM runs
        WHERE run_id = ?1
        "#,
    )
    .bind(run_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| EventStoreError::RunNotFound(run_id.to_string()))?;
    run_from_row(&row)
}

async fn insert_snapshot(
    tx: &mut Transaction<'_, Sqlite>,
    agent_state: &AgentState,
) -> Result<(), EventStoreError> {
    let state_json = serde_json::to_string(agent_state)?;
    let inserted = sqlx::query(
        r#"
        INSERT INTO agent_state_snapshots
            (run_id, step_ordinal, node_name, status, resume_token, state_json, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&agent_state.run_id)
    .bind(agent_state.step_ordinal)
    .bind(agent_state.node_name.as_str())
    .bind(agent_state.status.as_str())
    .bind(&agent_state.resume_token)
    .bind(state_json)
    .bind(encode_ts(&agent_state.timestamps.updated_at))
    .execute(&mut **tx)
    .await;

    match inserted {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(EventStoreError::SequenceConflict {
            run_id: agent_state.run_id.clone(),
            expected: agent_state.step_ordinal + 1,
        }),
        Err(e) => Err(e.into()),
    }
}

/// Assign the next sequences for `run` and write each event with its outbox row.
async fn append_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    run: &Run,
    payloads: Vec<EventPayload>,
) -> Result<Vec<DomainEvent>, EventStoreError> {
    let (last,): (i64,) =
        sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM events WHERE run_id = ?1")
            .bind(&run.run_id)
            .fetch_one(&mut **tx)
            .await?;

    let mut appended = Vec::with_capacity(payloads.len());
    for (offset, payload) in payloads.into_iter().enumerate() {
        let sequence = last + 1 + offset as i64;
        let body_json = serde_json::to_string(&payload.body()?)?;
        let event = DomainEvent {
            event_id: ulid::Ulid::new().to_string(),
            run_id: run.run_id.clone(),
            tenant_id: run.tenant_id.clone(),
            project_id: run.project_id.clone(),
            sequence,
            timestamp: Utc::now(),
            kind: payload.kind().to_string(),
            version: payload.version(),
            checksum: payload_checksum(&body_json),
            payload,
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO events
                (run_id, seq, event_id, tenant_id, project_id, timestamp, kind, version,
                 payload, checksum)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&event.run_id)
        .bind(event.sequence)
        .bind(&event.event_id)
        .bind(&event.tenant_id)
        .bind(&event.project_id)
        .bind(encode_ts(&event.timestamp))
        .bind(&event.kind)
        .bind(event.version)
        .bind(&body_json)
        .bind(&event.checksum)
        .execute(&mut **tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(EventStoreError::SequenceConflict {
                    run_id: run.run_id.clone(),
                    expected: sequence,
                });
            }
            Err(e) => return Err(e.into()),
        }

        sqlx::query("INSERT INTO outbox (run_id, seq, event_id, published_at) VALUES (?1, ?2, ?3, NULL)")
            .bind(&event.run_id)
            .bind(event.sequence)
            .bind(&event.event_id)
            .execute(&mut **tx)
            .await?;

        appended.push(event);
    }

    Ok(appended)
}

/// Snapshots name their node twice; the JSON copy is checked here so a bad
/// label reads as `UnknownNode` rather than a generic decode failure.
fn decode_snapshot(state_json: &str) -> Result<AgentState, EventStoreError> {
    let value: serde_json::Value = serde_json::from_str(state_json)?;
    if let Some(raw) = value.get("node_name").and_then(|v| v.as_str()) {
        if raw.parse::<NodeName>().is_err() {
            return Err(EventStoreError::UnknownNode(raw.to_string()));
        }
    }
    Ok(serde_json::from_value(value)?)
}

async fn last_sequence(pool: &SqlitePool, run_id: &str) -> Result<i64, EventStoreError> {
    let (last,): (i64,) =
        sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM events WHERE run_id = ?1")
            .bind(run_id)
            .fetch_one(pool)
            .await?;
    Ok(last)
}

fn run_from_row(row: &SqliteRow) -> Result<Run, EventStoreError> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(Run {
        run_id: row.try_get("run_id")?,
        tenant_id: row.try_get("tenant_id")?,
        project_id: row.try_get("project_id")?,
        status: status
            .parse()
            .map_err(|e: shared_types::UnknownLabel| EventStoreError::Serialization(e.to_string()))?,
        created_at: decode_ts(&created_at)?,
        updated_at: decode_ts(&updated_at)?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<DomainEvent, EventStoreError> {
    let run_id: String = row.try_get("run_id")?;
    let sequence: i64 = row.try_get("seq")?;
    let kind: String = row.try_get("kind")?;
    let body_json: String = row.try_get("payload")?;
    let checksum: String = row.try_get("checksum")?;
    if payload_checksum(&body_json) != checksum {
        return Err(EventStoreError::ChecksumMismatch {
            run_id,
            seq: sequence,
        });
    }
    let timestamp: String = row.try_get("timestamp")?;
    let payload = EventPayload::from_parts(&kind, serde_json::from_str(&body_json)?)?;

    Ok(DomainEvent {
        event_id: row.try_get("event_id")?,
        run_id,
        tenant_id: row.try_get("tenant_id")?,
        project_id: row.try_get("project_id")?,
        sequence,
        timestamp: decode_ts(&timestamp)?,
        kind,
        version: row.try_get("version")?,
        payload,
        checksum,
    })
}

// ============================================================================
// Helper Functions
// ============================================================================

type StoreCall<T> = Result<Result<T, EventStoreError>, ractor::RactorErr<EventStoreMsg>>;

/// Convenience function to create a run with its initial snapshot
pub async fn start_run(
    store: &ActorRef<EventStoreMsg>,
    run: Run,
    initial: AgentState,
    events: Vec<EventPayload>,
) -> StoreCall<Vec<DomainEvent>> {
    ractor::call!(store, |reply| EventStoreMsg::StartRun {
        run,
        initial,
        events,
        reply,
    })
}

/// Convenience function to commit a step's snapshot and events
pub async fn commit_step(
    store: &ActorRef<EventStoreMsg>,
    state: AgentState,
    events: Vec<EventPayload>,
) -> StoreCall<Vec<DomainEvent>> {
    ractor::call!(store, |reply| EventStoreMsg::CommitStep {
        state,
        events,
        reply,
    })
}

/// Convenience function to append a single event
pub async fn append_event(
    store: &ActorRef<EventStoreMsg>,
    run_id: impl Into<String>,
    payload: EventPayload,
) -> StoreCall<DomainEvent> {
    ractor::call!(store, |reply| EventStoreMsg::Append {
        run_id: run_id.into(),
        payload,
        reply,
    })
}

pub async fn get_run(store: &ActorRef<EventStoreMsg>, run_id: impl Into<String>) -> StoreCall<Option<Run>> {
    ractor::call!(store, |reply| EventStoreMsg::GetRun {
        run_id: run_id.into(),
        reply,
    })
}

pub async fn get_last_event_sequence(
    store: &ActorRef<EventStoreMsg>,
    run_id: impl Into<String>,
) -> StoreCall<i64> {
    ractor::call!(store, |reply| EventStoreMsg::GetLastEventSequence {
        run_id: run_id.into(),
        reply,
    })
}

pub async fn get_events_from(
    store: &ActorRef<EventStoreMsg>,
    run_id: impl Into<String>,
    from_seq: i64,
    limit: i64,
) -> StoreCall<Vec<DomainEvent>> {
    ractor::call!(store, |reply| EventStoreMsg::GetEventsFrom {
        run_id: run_id.into(),
        from_seq,
        limit,
        reply,
    })
}

pub async fn get_latest_snapshot(
    store: &ActorRef<EventStoreMsg>,
    run_id: impl Into<String>,
) -> StoreCall<Option<AgentState>> {
    ractor::call!(store, |reply| EventStoreMsg::GetLatestSnapshot {
        run_id: run_id.into(),
        reply,
    })
}

pub async fn get_snapshot_at(
    store: &ActorRef<EventStoreMsg>,
    run_id: impl Into<String>,
    step_ordinal: i64,
) -> StoreCall<Option<AgentState>> {
    ractor::call!(store, |reply| EventStoreMsg::GetSnapshotAt {
        run_id: run_id.into(),
        step_ordinal,
        reply,
    })
}

pub async fn list_unpublished(
    store: &ActorRef<EventStoreMsg>,
    limit: i64,
) -> StoreCall<Vec<PendingDelivery>> {
    ractor::call!(store, |reply| EventStoreMsg::ListUnpublished { limit, reply })
}

pub async fn fail_run(
    store: &ActorRef<EventStoreMsg>,
    run_id: impl Into<String>,
    node: Option<NodeName>,
    error_id: impl Into<String>,
    summary: impl Into<String>,
) -> StoreCall<DomainEvent> {
    ractor::call!(store, |reply| EventStoreMsg::FailRun {
        run_id: run_id.into(),
        node,
        error_id: error_id.into(),
        summary: summary.into(),
        reply,
    })
}

pub async fn mark_published(
    store: &ActorRef<EventStoreMsg>,
    run_id: impl Into<String>,
    seq: i64,
) -> StoreCall<bool> {
    ractor::call!(store, |reply| EventStoreMsg::MarkPublished {
        run_id: run_id.into(),
        seq,
        reply,
    })
}

// ============================================================================
// Tests
// ============================================================================
