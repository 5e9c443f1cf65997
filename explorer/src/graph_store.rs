//! Screen graph persistence for the projector.
//!
//! Every mutation runs in its own transaction together with the
//! `graph_persistence_outcomes` row that records it. The outcome table is
//! keyed by `(run_id, source_event_seq)`, so applying the same event twice
//! is a no-op the second time.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::actors::event_store::BEGIN_WRITE;
use crate::db::{decode_ts, encode_ts};
use shared_types::{
    Action, ActionVerb, DomainEvent, Edge, EventPayload, GraphPersistenceOutcome,
    ProjectionCursor, Screen, ScreenHash, UpsertKind,
};

#[derive(Debug, thiserror::Error)]
pub enum GraphStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid timestamp format: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}

/// What applying one event did to the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyResult {
    /// The event mutated the graph and an outcome row was written.
    Applied(GraphPersistenceOutcome),
    /// An outcome already exists for this `(run_id, sequence)`.
    AlreadyApplied,
    /// The event kind does not touch the graph.
    NotGraphRelevant,
}

/// Per-run view of what the projection has recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProjectionStats {
    pub screens_discovered: i64,
    pub observations_mapped: i64,
    pub outcomes_total: i64,
}

/// A run with events the projector has not consumed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRun {
    pub run_id: String,
    pub next_seq: i64,
    pub last_seq: i64,
}

#[derive(Debug, Clone)]
pub struct GraphStore {
    pool: SqlitePool,
}

impl GraphStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ── Cursors ──────────────────────────────────────────────────────────────

    pub async fn get_cursor(&self, run_id: &str) -> Result<Option<ProjectionCursor>, GraphStoreError> {
        let row = sqlx::query("SELECT run_id, next_seq, updated_at FROM projection_cursors WHERE run_id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let updated_at: String = row.try_get("updated_at")?;
            Ok(ProjectionCursor {
                run_id: row.try_get("run_id")?,
                next_seq: row.try_get("next_seq")?,
                updated_at: decode_ts(&updated_at)?,
            })
        })
        .transpose()
    }

    /// Move the cursor forward. A smaller `next_seq` than the stored one is ignored.
    pub async fn advance_cursor(&self, run_id: &str, next_seq: i64) -> Result<ProjectionCursor, GraphStoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO projection_cursors (run_id, next_seq, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(run_id) DO UPDATE SET
                next_seq = MAX(projection_cursors.next_seq, excluded.next_seq),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(run_id)
        .bind(next_seq)
        .bind(encode_ts(&now))
        .execute(&self.pool)
        .await?;

        self.get_cursor(run_id)
            .await?
            .ok_or_else(|| GraphStoreError::InvalidValue(format!("cursor for {run_id} vanished")))
    }

    /// Send a run to the back of the queue without moving its cursor.
    ///
    /// Used after a failed pass so a run that keeps failing does not take the
    /// first slot of every tick.
    pub async fn defer_run(&self, run_id: &str) -> Result<(), GraphStoreError> {
        sqlx::query(
            r#"
            INSERT INTO projection_cursors (run_id, next_seq, updated_at)
            VALUES (?1, 1, ?2)
            ON CONFLICT(run_id) DO UPDATE SET updated_at = excluded.updated_at
            "#,
        )
        .bind(run_id)
        .bind(encode_ts(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Runs whose log extends past their cursor, least recently projected first.
    ///
    /// Runs without a cursor have never been projected and sort before all others.
    /// The last sequence comes from a per-run `MAX(seq)` lookup on the events
    /// primary key, so the cost follows the number of runs rather than events.
    pub async fn runs_pending_projection(&self, limit: i64) -> Result<Vec<PendingRun>, GraphStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, last_seq, next_seq, updated_at
            FROM (
                SELECT r.run_id AS run_id,
                       (SELECT MAX(e.seq) FROM events e WHERE e.run_id = r.run_id) AS last_seq,
                       COALESCE(c.next_seq, 1) AS next_seq,
                       c.updated_at AS updated_at
                FROM runs r
                LEFT JOIN projection_cursors c ON c.run_id = r.run_id
            )
            WHERE last_seq IS NOT NULL AND last_seq >= next_seq
            ORDER BY (updated_at IS NOT NULL) ASC, updated_at ASC, run_id ASC
            LIMIT ?1
            "#,
        )
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PendingRun {
                    run_id: row.try_get("run_id")?,
                    next_seq: row.try_get("next_seq")?,
                    last_seq: row.try_get("last_seq")?,
                })
            })
            .collect()
    }

    // ── Mutations ────────────────────────────────────────────────────────────

    /// Apply one event's graph mutation exactly once per `(run_id, sequence)`.
    pub async fn apply_event(&self, event: &DomainEvent) -> Result<ApplyResult, GraphStoreError> {
        if !event.payload.is_graph_relevant() {
            return Ok(ApplyResult::NotGraphRelevant);
        }

        let mut tx = self.pool.begin_with(BEGIN_WRITE).await?;

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT outcome_id FROM graph_persistence_outcomes WHERE run_id = ?1 AND source_event_seq = ?2",
        )
        .bind(&event.run_id)
        .bind(event.sequence)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            return Ok(ApplyResult::AlreadyApplied);
        }

        let seen_at = event.timestamp;
        let outcome = match &event.payload {
            EventPayload::ScreenPerceived {
                observation_id,
                app_id,
                step_ordinal,
                perceptual_hash64,
                screenshot_ref_id,
                ui_hierarchy_xml_ref_id,
            } => {
                let (screen_id, upsert_kind) = upsert_screen(
                    &mut tx,
                    app_id,
                    *perceptual_hash64,
                    screenshot_ref_id,
                    ui_hierarchy_xml_ref_id,
                    seen_at,
                )
                .await?;
                GraphPersistenceOutcome {
                    outcome_id: observation_id.clone(),
                    run_id: event.run_id.clone(),
                    step_ordinal: *step_ordinal,
                    screen_id,
                    upsert_kind,
                    source_event_seq: event.sequence,
                }
            }
            EventPayload::EdgeObserved {
                observation_id,
                app_id,
                step_ordinal,
                from_hash,
                verb,
                target_key,
                to_hash,
            } => {
                let from_screen_id = ensure_screen(&mut tx, app_id, *from_hash, seen_at).await?;
                let to_screen_id = ensure_screen(&mut tx, app_id, *to_hash, seen_at).await?;
                let action_id =
                    upsert_action(&mut tx, &from_screen_id, *verb, target_key, seen_at).await?;
                let upsert_kind =
                    upsert_edge(&mut tx, &from_screen_id, &action_id, &to_screen_id, seen_at).await?;
                GraphPersistenceOutcome {
                    outcome_id: observation_id.clone(),
                    run_id: event.run_id.clone(),
                    step_ordinal: *step_ordinal,
                    screen_id: to_screen_id,
                    upsert_kind,
                    source_event_seq: event.sequence,
                }
            }
            _ => return Ok(ApplyResult::NotGraphRelevant),
        };

        sqlx::query(
            r#"
            INSERT INTO graph_persistence_outcomes
                (outcome_id, run_id, step_ordinal, screen_id, upsert_kind, source_event_seq, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&outcome.outcome_id)
        .bind(&outcome.run_id)
        .bind(outcome.step_ordinal)
        .bind(&outcome.screen_id)
        .bind(outcome.upsert_kind.as_str())
        .bind(outcome.source_event_seq)
        .bind(encode_ts(&Utc::now()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ApplyResult::Applied(outcome))
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub async fn get_screen_by_hash(
        &self,
        app_id: &str,
        hash: ScreenHash,
    ) -> Result<Option<Screen>, GraphStoreError> {
        let row = sqlx::query(
            r#"
            SELECT screen_id, app_id, perceptual_hash64, screenshot_ref, xml_ref,
                   evidence_counter, first_seen_at, last_seen_at
            FROM screens
            WHERE app_id = ?1 AND perceptual_hash64 = ?2
            "#,
        )
        .bind(app_id)
        .bind(hash.to_hex())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(screen_from_row).transpose()
    }

    pub async fn list_screens(&self, app_id: &str) -> Result<Vec<Screen>, GraphStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT screen_id, app_id, perceptual_hash64, screenshot_ref, xml_ref,
                   evidence_counter, first_seen_at, last_seen_at
            FROM screens
            WHERE app_id = ?1
            ORDER BY first_seen_at ASC, screen_id ASC
            "#,
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(screen_from_row).collect()
    }

    pub async fn list_actions(&self, from_screen_id: &str) -> Result<Vec<Action>, GraphStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT action_id, from_screen_id, verb, target_key, created_at
            FROM actions
            WHERE from_screen_id = ?1
            ORDER BY created_at ASC, action_id ASC
            "#,
        )
        .bind(from_screen_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let created_at: String = row.try_get("created_at")?;
                Ok(Action {
                    action_id: row.try_get("action_id")?,
                    from_screen_id: row.try_get("from_screen_id")?,
                    verb: row.try_get("verb")?,
                    target_key: row.try_get("target_key")?,
                    created_at: decode_ts(&created_at)?,
                })
            })
            .collect()
    }

    pub async fn list_edges_from(&self, from_screen_id: &str) -> Result<Vec<Edge>, GraphStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT edge_id, from_screen_id, action_id, to_screen_id, evidence_counter, last_seen_at
            FROM edges
            WHERE from_screen_id = ?1
            ORDER BY edge_id ASC
            "#,
        )
        .bind(from_screen_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let last_seen_at: String = row.try_get("last_seen_at")?;
                Ok(Edge {
                    edge_id: row.try_get("edge_id")?,
                    from_screen_id: row.try_get("from_screen_id")?,
                    action_id: row.try_get("action_id")?,
                    to_screen_id: row.try_get("to_screen_id")?,
                    evidence_counter: row.try_get("evidence_counter")?,
                    last_seen_at: decode_ts(&last_seen_at)?,
                })
            })
            .collect()
    }

    pub async fn list_outcomes(&self, run_id: &str) -> Result<Vec<GraphPersistenceOutcome>, GraphStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT outcome_id, run_id, step_ordinal, screen_id, upsert_kind, source_event_seq
            FROM graph_persistence_outcomes
            WHERE run_id = ?1
            ORDER BY source_event_seq ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let upsert_kind: String = row.try_get("upsert_kind")?;
                Ok(GraphPersistenceOutcome {
                    outcome_id: row.try_get("outcome_id")?,
                    run_id: row.try_get("run_id")?,
                    step_ordinal: row.try_get("step_ordinal")?,
                    screen_id: row.try_get("screen_id")?,
                    upsert_kind: upsert_kind
                        .parse()
                        .map_err(|e: shared_types::UnknownLabel| GraphStoreError::InvalidValue(e.to_string()))?,
                    source_event_seq: row.try_get("source_event_seq")?,
                })
            })
            .collect()
    }

    pub async fn projection_stats(&self, run_id: &str) -> Result<ProjectionStats, GraphStoreError> {
        // Edge outcomes point at their destination screen; only perception
        // outcomes count as screen discoveries.
        let (screens_discovered, observations_mapped, outcomes_total): (i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COALESCE(SUM(CASE WHEN o.upsert_kind = 'discovered' AND e.kind = ?2 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN o.upsert_kind = 'mapped' THEN 1 ELSE 0 END), 0),
                    COUNT(*)
                FROM graph_persistence_outcomes o
                JOIN events e ON e.run_id = o.run_id AND e.seq = o.source_event_seq
                WHERE o.run_id = ?1
                "#,
            )
            .bind(run_id)
            .bind(shared_types::EVENT_SCREEN_PERCEIVED)
            .fetch_one(&self.pool)
            .await?;

        Ok(ProjectionStats {
            screens_discovered,
            observations_mapped,
            outcomes_total,
        })
    }
}

// ============================================================================
// Transaction Helpers
// ============================================================================

async fn find_screen_id(
    tx: &mut Transaction<'_, Sqlite>,
    app_id: &str,
    hash: ScreenHash,
) -> Result<Option<String>, GraphStoreError> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT screen_id FROM screens WHERE app_id = ?1 AND perceptual_hash64 = ?2")
            .bind(app_id)
            .bind(hash.to_hex())
            .fetch_optional(&mut **tx)
            .await?;
    Ok(row.map(|(id,)| id))
}

/// Insert on first sight, otherwise bump evidence and `last_seen_at`.
async fn upsert_screen(
    tx: &mut Transaction<'_, Sqlite>,
    app_id: &str,
    hash: ScreenHash,
    screenshot_ref: &str,
    xml_ref: &str,
    seen_at: DateTime<Utc>,
) -> Result<(String, UpsertKind), GraphStoreError> {
    if let Some(screen_id) = find_screen_id(tx, app_id, hash).await? {
        // Placeholder rows created by edge attribution carry no artifacts yet.
        sqlx::query(
            r#"
            UPDATE screens SET
                evidence_counter = evidence_counter + 1,
                last_seen_at = MAX(last_seen_at, ?1),
                screenshot_ref = CASE WHEN screenshot_ref = '' THEN ?2 ELSE screenshot_ref END,
                xml_ref = CASE WHEN xml_ref = '' THEN ?3 ELSE xml_ref END
            WHERE screen_id = ?4
            "#,
        )
        .bind(encode_ts(&seen_at))
        .bind(screenshot_ref)
        .bind(xml_ref)
        .bind(&screen_id)
        .execute(&mut **tx)
        .await?;
        return Ok((screen_id, UpsertKind::Mapped));
    }

    let screen_id = ulid::Ulid::new().to_string();
    sqlx::query(
        r#"
        INSERT INTO screens
            (screen_id, app_id, perceptual_hash64, screenshot_ref, xml_ref,
             evidence_counter, first_seen_at, last_seen_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
        "#,
    )
    .bind(&screen_id)
    .bind(app_id)
    .bind(hash.to_hex())
    .bind(screenshot_ref)
    .bind(xml_ref)
    .bind(encode_ts(&seen_at))
    .execute(&mut **tx)
    .await?;
    Ok((screen_id, UpsertKind::Discovered))
}

/// Resolve a screen referenced by an edge without counting it as an observation.
async fn ensure_screen(
    tx: &mut Transaction<'_, Sqlite>,
    app_id: &str,
    hash: ScreenHash,
    seen_at: DateTime<Utc>,
) -> Result<String, GraphStoreError> {
    if let Some(screen_id) = find_screen_id(tx, app_id, hash).await? {
        return Ok(screen_id);
    }
    let screen_id = ulid::Ulid::new().to_string();
    sqlx::query(
        r#"
        INSERT INTO screens
            (screen_id, app_id, perceptual_hash64, screenshot_ref, xml_ref,
             evidence_counter, first_seen_at, last_seen_at)
        VALUES (?1, ?2, ?3, '', '', 0, ?4, ?4)
        "#,
    )
    .bind(&screen_id)
    .bind(app_id)
    .bind(hash.to_hex())
    .bind(encode_ts(&seen_at))
    .execute(&mut **tx)
    .await?;
    Ok(screen_id)
}

async fn upsert_action(
    tx: &mut Transaction<'_, Sqlite>,
    from_screen_id: &str,
    verb: ActionVerb,
    target_key: &str,
    seen_at: DateTime<Utc>,
) -> Result<String, GraphStoreError> {
    let action_id = ulid::Ulid::new().to_string();
    sqlx::query(
        r#"
        INSERT INTO actions (action_id, from_screen_id, verb, target_key, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(from_screen_id, verb, target_key) DO NOTHING
        "#,
    )
    .bind(&action_id)
    .bind(from_screen_id)
    .bind(verb.as_str())
    .bind(target_key)
    .bind(encode_ts(&seen_at))
    .execute(&mut **tx)
    .await?;

    let (stored,): (String,) = sqlx::query_as(
        "SELECT action_id FROM actions WHERE from_screen_id = ?1 AND verb = ?2 AND target_key = ?3",
    )
    .bind(from_screen_id)
    .bind(verb.as_str())
    .bind(target_key)
    .fetch_one(&mut **tx)
    .await?;
    Ok(stored)
}

async fn upsert_edge(
    tx: &mut Transaction<'_, Sqlite>,
    from_screen_id: &str,
    action_id: &str,
    to_screen_id: &str,
    seen_at: DateTime<Utc>,
) -> Result<UpsertKind, GraphStoreError> {
    let existing: Option<(String,)> = sqlx::query_as(
        "SELECT edge_id FROM edges WHERE from_screen_id = ?1 AND action_id = ?2 AND to_screen_id = ?3",
    )
    .bind(from_screen_id)
    .bind(action_id)
    .bind(to_screen_id)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some((edge_id,)) = existing {
        sqlx::query(
            r#"
            UPDATE edges SET
                evidence_counter = evidence_counter + 1,
                last_seen_at = MAX(last_seen_at, ?1)
            WHERE edge_id = ?2
            "#,
        )
        .bind(encode_ts(&seen_at))
        .bind(&edge_id)
        .execute(&mut **tx)
        .await?;
        return Ok(UpsertKind::Mapped);
    }

    sqlx::query(
        r#"
        INSERT INTO edges (edge_id, from_screen_id, action_id, to_screen_id, evidence_counter, last_seen_at)
        VALUES (?1, ?2, ?3, ?4, 1, ?5)
        "#,
    )
    .bind(ulid::Ulid::new().to_string())
    .bind(from_screen_id)
    .bind(action_id)
    .bind(to_screen_id)
    .bind(encode_ts(&seen_at))
    .execute(&mut **tx)
    .await?;
    Ok(UpsertKind::Discovered)
}

fn screen_from_row(row: &SqliteRow) -> Result<Screen, GraphStoreError> {
    let hash: String = row.try_get("perceptual_hash64")?;
    let first_seen_at: String = row.try_get("first_seen_at")?;
    let last_seen_at: String = row.try_get("last_seen_at")?;
    Ok(Screen {
        screen_id: row.try_get("screen_id")?,
        app_id: row.try_get("app_id")?,
        perceptual_hash64: hash
            .parse()
            .map_err(|e: shared_types::UnknownLabel| GraphStoreError::InvalidValue(e.to_string()))?,
        screenshot_ref: row.try_get("screenshot_ref")?,
        xml_ref: row.try_get("xml_ref")?,
        evidence_counter: row.try_get("evidence_counter")?,
        first_seen_at: decode_ts(&first_seen_at)?,
        last_seen_at: decode_ts(&last_seen_at)?,
    })
}
