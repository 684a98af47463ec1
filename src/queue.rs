use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::operation::{OperationStatus, OperationType, PendingOperation, RetryStrategy};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Operation not found: {0}")]
    NotFound(String),
    #[error("Invalid timestamp in row: {0}")]
    InvalidTimestamp(String),
    #[error("Database corruption detected: {0}")]
    DatabaseCorruption(String),
}

/// Aggregate counts for the operation queue.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
    /// Most recent attempt timestamp across all operations
    pub last_attempt: Option<DateTime<Utc>>,
}

/// Durable, ordered store of pending mutating operations.
///
/// Rows survive process restarts; status transitions happen only through the
/// methods below so concurrent readers never observe partial writes (SQLite
/// serializes each statement).
pub struct OperationStore {
    conn: Connection,
}

fn ts_to_string(ts: DateTime<Utc>) -> String {
    // Fixed-width UTC encoding so ORDER BY on the text column is chronological.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_string(s: &str) -> Result<DateTime<Utc>, QueueError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| QueueError::InvalidTimestamp(s.to_string()))
}

fn row_to_operation(row: &Row<'_>) -> rusqlite::Result<PendingOperation> {
    let operation_type: String = row.get("operation_type")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let last_attempt_at: Option<String> = row.get("last_attempt_at")?;

    let parse = |s: &str| {
        ts_from_string(s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
    };

    Ok(PendingOperation {
        id: row.get("id")?,
        operation_type: OperationType::from(operation_type.as_str()),
        payload: row.get("payload")?,
        status: OperationStatus::from(status.as_str()),
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        error_message: row.get("error_message")?,
        created_at: parse(&created_at)?,
        last_attempt_at: last_attempt_at.as_deref().map(parse).transpose()?,
        priority: row.get("priority")?,
        related_entity_id: row.get("related_entity_id")?,
    })
}

const SELECT_COLUMNS: &str = "id, operation_type, payload, status, retry_count, max_retries, \
     error_message, created_at, last_attempt_at, priority, related_entity_id";

impl OperationStore {
    pub fn new() -> Result<Self, QueueError> {
        let db_path = Self::default_db_path()?;
        Self::open(db_path)
    }

    /// Open (or create) a store at an explicit database path.
    pub fn open(db_path: PathBuf) -> Result<Self, QueueError> {
        let conn = Self::open_with_corruption_handling(&db_path)?;
        Self::init_database(&conn)?;
        Ok(Self { conn })
    }

    pub fn default_db_path() -> Result<PathBuf, QueueError> {
        let mut dir = dirs::home_dir().ok_or_else(|| {
            rusqlite::Error::InvalidPath("Could not determine home directory".to_string().into())
        })?;
        dir.push(".haulsync");
        std::fs::create_dir_all(&dir)?;
        dir.push("queue.db");
        Ok(dir)
    }

    /// Persist a new operation with `status = Pending`.
    pub fn enqueue(&self, operation: &PendingOperation) -> Result<(), QueueError> {
        let status: String = operation.status.into();
        let kind: String = operation.operation_type.into();

        self.conn.execute(
            "INSERT INTO pending_operations \
             (id, operation_type, payload, status, retry_count, max_retries, error_message, \
              created_at, last_attempt_at, priority, related_entity_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                operation.id,
                kind,
                operation.payload,
                status,
                operation.retry_count,
                operation.max_retries,
                operation.error_message,
                ts_to_string(operation.created_at),
                operation.last_attempt_at.map(ts_to_string),
                operation.priority,
                operation.related_entity_id,
            ],
        )?;

        tracing::info!(
            operation = "enqueue",
            operation_id = %operation.id,
            operation_type = %kind,
            priority = operation.priority,
            related_entity_id = ?operation.related_entity_id,
            queue_size = self.count()?,
            "Operation enqueued"
        );

        Ok(())
    }

    /// Enqueue API consumed by the UI/domain layer; returns the operation id.
    pub fn enqueue_new(
        &self,
        operation_type: OperationType,
        payload: String,
        priority: i32,
        related_entity_id: Option<String>,
    ) -> Result<String, QueueError> {
        let mut operation = PendingOperation::new(operation_type, payload).with_priority(priority);
        operation.related_entity_id = related_entity_id;
        let id = operation.id.clone();
        self.enqueue(&operation)?;
        Ok(id)
    }

    /// Up to `limit` Pending operations eligible to run at `now`, ordered by
    /// `(priority ASC, created_at ASC)`.
    ///
    /// Operations sharing a related entity form a line in enqueue order: only
    /// the oldest pending one per entity is a candidate, regardless of the
    /// priority of later arrivals, and if that head is still inside its
    /// backoff window (or InProgress) the whole line waits.
    pub fn next_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        strategy: &RetryStrategy,
    ) -> Result<Vec<PendingOperation>, QueueError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM pending_operations \
             WHERE status = 'pending' \
             AND (related_entity_id IS NULL OR ( \
                 related_entity_id NOT IN ( \
                     SELECT related_entity_id FROM pending_operations \
                     WHERE status = 'in_progress' AND related_entity_id IS NOT NULL) \
                 AND created_at = ( \
                     SELECT MIN(created_at) FROM pending_operations peer \
                     WHERE peer.related_entity_id = pending_operations.related_entity_id \
                     AND peer.status = 'pending'))) \
             ORDER BY priority ASC, created_at ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_operation)?;

        let mut batch = Vec::new();
        let mut seen_entities = std::collections::HashSet::new();
        for row in rows {
            let op = row?;
            // Register the entity before the backoff check: a head that is
            // still waiting out its backoff parks the whole line.
            if let Some(ref entity) = op.related_entity_id {
                if !seen_entities.insert(entity.clone()) {
                    continue;
                }
            }
            if !strategy.eligible(op.retry_count, op.last_attempt_at, now) {
                continue;
            }
            batch.push(op);
            if batch.len() >= limit {
                break;
            }
        }

        Ok(batch)
    }

    /// Claim an operation for execution. Returns false if the operation is no
    /// longer Pending, its entity is already held by another InProgress
    /// operation, or an older pending operation on the same entity exists
    /// (the entity-order rules are re-checked here, not just in `next_batch`).
    pub fn mark_in_progress(&self, id: &str, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let updated = self.conn.execute(
            "UPDATE pending_operations \
             SET status = 'in_progress', last_attempt_at = ?2 \
             WHERE id = ?1 AND status = 'pending' \
             AND (related_entity_id IS NULL OR ( \
                 related_entity_id NOT IN ( \
                     SELECT related_entity_id FROM pending_operations \
                     WHERE status = 'in_progress' AND related_entity_id IS NOT NULL) \
                 AND created_at = ( \
                     SELECT MIN(created_at) FROM pending_operations peer \
                     WHERE peer.related_entity_id = pending_operations.related_entity_id \
                     AND peer.status = 'pending')))",
            params![id, ts_to_string(now)],
        )?;

        tracing::debug!(
            operation = "mark_in_progress",
            operation_id = %id,
            claimed = updated == 1,
            "Operation claim attempted"
        );

        Ok(updated == 1)
    }

    pub fn mark_completed(&self, id: &str) -> Result<(), QueueError> {
        let updated = self.conn.execute(
            "UPDATE pending_operations SET status = 'completed', error_message = NULL \
             WHERE id = ?1",
            params![id],
        )?;
        if updated == 0 {
            return Err(QueueError::NotFound(id.to_string()));
        }

        tracing::info!(operation = "mark_completed", operation_id = %id, "Operation completed");
        Ok(())
    }

    /// Record a failed attempt. Increments the retry count and either parks
    /// the operation back in Pending for a backoff retry, or moves it to
    /// terminal Failed when `terminal` is set or the retry budget is spent.
    pub fn mark_failed(
        &self,
        id: &str,
        error: &str,
        terminal: bool,
        now: DateTime<Utc>,
    ) -> Result<OperationStatus, QueueError> {
        let updated = self.conn.execute(
            "UPDATE pending_operations SET \
               retry_count = CASE WHEN ?3 THEN max_retries ELSE retry_count + 1 END, \
               last_attempt_at = ?4, \
               error_message = ?2, \
               status = CASE WHEN ?3 OR retry_count + 1 >= max_retries \
                             THEN 'failed' ELSE 'pending' END \
             WHERE id = ?1 AND status IN ('pending', 'in_progress')",
            params![id, error, terminal, ts_to_string(now)],
        )?;
        if updated == 0 {
            return Err(QueueError::NotFound(id.to_string()));
        }

        let status = self
            .get(id)?
            .map(|op| op.status)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        tracing::warn!(
            operation = "mark_failed",
            operation_id = %id,
            error = %error,
            terminal = terminal,
            resulting_status = %String::from(status),
            "Operation attempt failed"
        );

        Ok(status)
    }

    /// Withdraw a not-yet-started operation (UI-initiated cancel).
    pub fn cancel(&self, id: &str) -> Result<bool, QueueError> {
        let updated = self.conn.execute(
            "UPDATE pending_operations SET status = 'cancelled' \
             WHERE id = ?1 AND status IN ('pending', 'failed')",
            params![id],
        )?;
        if updated == 1 {
            tracing::info!(operation = "cancel", operation_id = %id, "Operation cancelled");
        }
        Ok(updated == 1)
    }

    /// Put a terminally Failed operation back in the queue with a fresh retry
    /// budget. This is the only way a Failed operation re-enters a drain.
    pub fn resubmit(&self, id: &str) -> Result<bool, QueueError> {
        let updated = self.conn.execute(
            "UPDATE pending_operations \
             SET status = 'pending', retry_count = 0, error_message = NULL, last_attempt_at = NULL \
             WHERE id = ?1 AND status = 'failed'",
            params![id],
        )?;
        if updated == 1 {
            tracing::info!(operation = "resubmit", operation_id = %id, "Operation resubmitted");
        }
        Ok(updated == 1)
    }

    /// Crash recovery: operations left InProgress longer than `stale_after`
    /// were orphaned by a killed process and are reclaimed to Pending.
    pub fn reclaim_stale(
        &self,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, QueueError> {
        let cutoff = now
            - chrono::Duration::from_std(stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let reclaimed = self.conn.execute(
            "UPDATE pending_operations SET status = 'pending' \
             WHERE status = 'in_progress' \
             AND (last_attempt_at IS NULL OR last_attempt_at < ?1)",
            params![ts_to_string(cutoff)],
        )?;

        if reclaimed > 0 {
            tracing::info!(
                operation = "reclaim_stale",
                reclaimed = reclaimed,
                "Stale in-progress operations reclaimed to pending"
            );
        }

        Ok(reclaimed)
    }

    pub fn get(&self, id: &str) -> Result<Option<PendingOperation>, QueueError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM pending_operations WHERE id = ?1");
        let op = self
            .conn
            .query_row(&sql, params![id], row_to_operation)
            .optional()?;
        Ok(op)
    }

    pub fn count(&self) -> Result<usize, QueueError> {
        let count: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM pending_operations", [], |row| {
                    row.get(0)
                })?;
        Ok(count)
    }

    pub fn count_by_status(&self, status: OperationStatus) -> Result<usize, QueueError> {
        let status_str: String = status.into();
        let count: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_operations WHERE status = ?1",
            params![status_str],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats {
            pending: self.count_by_status(OperationStatus::Pending)?,
            in_progress: self.count_by_status(OperationStatus::InProgress)?,
            completed: self.count_by_status(OperationStatus::Completed)?,
            failed: self.count_by_status(OperationStatus::Failed)?,
            cancelled: self.count_by_status(OperationStatus::Cancelled)?,
            total: self.count()?,
            last_attempt: None,
        };

        let last_attempt: Option<String> = self
            .conn
            .query_row(
                "SELECT MAX(last_attempt_at) FROM pending_operations \
                 WHERE last_attempt_at IS NOT NULL",
                [],
                |row| row.get::<_, Option<String>>(0),
            )
            .ok()
            .flatten();
        if let Some(s) = last_attempt {
            stats.last_attempt = ts_from_string(&s).ok();
        }

        Ok(stats)
    }

    /// Failed operations awaiting explicit user action.
    pub fn failed_operations(&self) -> Result<Vec<PendingOperation>, QueueError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM pending_operations \
             WHERE status = 'failed' ORDER BY created_at ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_operation)?;
        let mut ops = Vec::new();
        for row in rows {
            ops.push(row?);
        }
        Ok(ops)
    }

    /// Retention: delete terminal operations older than `max_age_days`.
    /// `max_age_days == 0` removes all terminal rows.
    pub fn cleanup_terminal(&self, max_age_days: i64) -> Result<usize, QueueError> {
        let removed = if max_age_days == 0 {
            self.conn.execute(
                "DELETE FROM pending_operations \
                 WHERE status IN ('completed', 'failed', 'cancelled')",
                [],
            )?
        } else {
            let cutoff = Utc::now() - chrono::Duration::days(max_age_days);
            self.conn.execute(
                "DELETE FROM pending_operations \
                 WHERE status IN ('completed', 'failed', 'cancelled') AND created_at < ?1",
                params![ts_to_string(cutoff)],
            )?
        };

        if removed > 0 {
            tracing::info!(
                operation = "cleanup_terminal",
                max_age_days = max_age_days,
                entries_removed = removed,
                queue_size_after_cleanup = self.count()?,
                "Terminal operations cleaned up"
            );
        }

        Ok(removed)
    }

    pub fn vacuum(&self) -> Result<(), QueueError> {
        self.conn.execute("VACUUM", [])?;
        Ok(())
    }

    fn init_database(conn: &Connection) -> Result<(), QueueError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS pending_operations (
                id TEXT PRIMARY KEY,
                operation_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 5,
                error_message TEXT,
                created_at TEXT NOT NULL,
                last_attempt_at TEXT,
                priority INTEGER NOT NULL DEFAULT 10,
                related_entity_id TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        if current_version < 1 {
            conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
        }

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_operations_status ON pending_operations(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_operations_order \
             ON pending_operations(priority, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_operations_entity \
             ON pending_operations(related_entity_id)",
            [],
        )?;

        Ok(())
    }

    fn open_with_corruption_handling(db_path: &PathBuf) -> Result<Connection, QueueError> {
        match Connection::open(db_path) {
            Ok(conn) => {
                if Self::verify_database_integrity(&conn).is_err() {
                    drop(conn);
                    return Self::attempt_database_recovery(db_path);
                }
                Ok(conn)
            }
            Err(_) => Self::attempt_database_recovery(db_path),
        }
    }

    fn verify_database_integrity(conn: &Connection) -> Result<(), QueueError> {
        let result: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if result.to_lowercase() == "ok" {
            Ok(())
        } else {
            Err(QueueError::DatabaseCorruption(format!(
                "Database integrity check failed: {}",
                result
            )))
        }
    }

    /// Keep a backup of the corrupted file, then start over with a fresh
    /// database. Queued operations are lost but the client stays functional.
    fn attempt_database_recovery(db_path: &PathBuf) -> Result<Connection, QueueError> {
        let backup_path = db_path.with_extension("db.backup");

        if db_path.exists() {
            std::fs::copy(db_path, &backup_path).map_err(|e| {
                QueueError::DatabaseCorruption(format!("Failed to create backup: {}", e))
            })?;
            std::fs::remove_file(db_path).map_err(|e| {
                QueueError::DatabaseCorruption(format!(
                    "Failed to remove corrupted database: {}",
                    e
                ))
            })?;
            tracing::warn!(
                backup = %backup_path.display(),
                "Corrupted operation queue replaced; backup retained"
            );
        }

        let conn = Connection::open(db_path)?;
        Self::init_database(&conn)?;
        Ok(conn)
    }
}
