//! Offline Mutation Queue - persistent FIFO of deferred writes
//!
//! Writes that could not reach the remote store are appended here and replayed
//! by the reconciler once connectivity returns.
//!
//! Features:
//! - SQLite-backed, survives restarts
//! - Strict insertion order (AUTOINCREMENT ids, no dedup or coalescing)
//! - Monotonic per-item retry counter
//! - Dead-letter table for permanently failed mutations

use super::models::{FailedMutation, Mutation, MutationDecodeError, QueueItem};
use crate::db::Database;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const ITEM_COLUMNS: &str =
    "id, client_id, action, payload, enqueued_at, retry_count, last_error";

const FAILED_COLUMNS: &str = "id, queue_id, client_id, action, payload, enqueued_at, \
     retry_count, error_message, failed_at";

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_count: usize,
    /// Pending items that have failed at least once
    pub retrying_count: usize,
    pub failed_count: usize,
}

// ============================================================================
// Mutation Queue
// ============================================================================

/// Ordered store of pending mutations
pub struct MutationQueue {
    db: Arc<Database>,
}

impl MutationQueue {
    pub fn new(db: Arc<Database>) -> Result<Self, QueueError> {
        let queue = Self { db };
        queue.initialize_schema()?;
        Ok(queue)
    }

    fn initialize_schema(&self) -> Result<(), QueueError> {
        self.db
            .execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS mutation_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_id TEXT NOT NULL,
                action TEXT NOT NULL,
                payload TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_mutation_queue_action
                ON mutation_queue(action);

            CREATE TABLE IF NOT EXISTS failed_mutations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_id INTEGER NOT NULL,
                client_id TEXT NOT NULL,
                action TEXT NOT NULL,
                payload TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                error_message TEXT NOT NULL,
                failed_at TEXT NOT NULL
            );
            "#,
            )
            .map_err(|e| QueueError::DatabaseError(e.to_string()))
    }

    // ========================================================================
    // Pending items
    // ========================================================================

    /// Append a mutation with a fresh idempotency key
    pub fn enqueue(&self, mutation: &Mutation) -> Result<QueueItem, QueueError> {
        self.enqueue_with_client_id(mutation, &uuid::Uuid::new_v4().to_string())
    }

    /// Append a mutation reusing the key of an earlier, possibly delivered, attempt
    pub fn enqueue_with_client_id(
        &self,
        mutation: &Mutation,
        client_id: &str,
    ) -> Result<QueueItem, QueueError> {
        let payload = mutation.payload()?;
        let payload =
            serde_json::to_string(&payload).map_err(|e| QueueError::Serialization(e.to_string()))?;

        self.insert_raw(mutation.action().as_str(), &payload, client_id, Utc::now())
    }

    fn insert_raw(
        &self,
        action: &str,
        payload: &str,
        client_id: &str,
        enqueued_at: DateTime<Utc>,
    ) -> Result<QueueItem, QueueError> {
        let now = Utc::now().to_rfc3339();

        let id = self
            .db
            .execute_insert(
                r#"
            INSERT INTO mutation_queue (
                client_id, action, payload, enqueued_at, retry_count, last_error, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 0, NULL, ?5)
            "#,
                params![client_id, action, payload, enqueued_at.to_rfc3339(), now],
            )
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        log::info!("Queued {} as item {}", action, id);

        Ok(QueueItem {
            id,
            client_id: client_id.to_string(),
            action: action.to_string(),
            payload: payload.to_string(),
            enqueued_at,
            retry_count: 0,
            last_error: None,
        })
    }

    /// All pending items, oldest first
    pub fn pending_items(&self) -> Result<Vec<QueueItem>, QueueError> {
        self.db
            .query(
                &format!("SELECT {ITEM_COLUMNS} FROM mutation_queue ORDER BY id ASC"),
                [],
                row_to_item,
            )
            .map_err(|e| QueueError::DatabaseError(e.to_string()))
    }

    /// Pending items that target one entity, oldest first
    pub fn pending_for_entity(
        &self,
        collection: &str,
        entity_id: &str,
    ) -> Result<Vec<QueueItem>, QueueError> {
        Ok(self
            .pending_items()?
            .into_iter()
            .filter(|item| match item.mutation() {
                Ok(mutation) => {
                    mutation.collection() == collection && mutation.entity_id() == entity_id
                }
                Err(_) => false,
            })
            .collect())
    }

    pub fn get_item(&self, id: i64) -> Result<QueueItem, QueueError> {
        let conn = self
            .db
            .get_conn()
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        conn.query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM mutation_queue WHERE id = ?1"),
            params![id],
            row_to_item,
        )
        .optional()
        .map_err(|e| QueueError::DatabaseError(e.to_string()))?
        .ok_or(QueueError::ItemNotFound(id))
    }

    pub fn pending_count(&self) -> Result<usize, QueueError> {
        let count: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM mutation_queue", [], |row| row.get(0))
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        Ok(count as usize)
    }

    /// Record a failed replay; returns the new retry count
    pub fn increment_retry(&self, id: i64, error_message: &str) -> Result<u32, QueueError> {
        let updated = self
            .db
            .execute(
                r#"
            UPDATE mutation_queue
            SET retry_count = retry_count + 1, last_error = ?1, updated_at = ?2
            WHERE id = ?3
            "#,
                params![error_message, Utc::now().to_rfc3339(), id],
            )
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        if updated == 0 {
            return Err(QueueError::ItemNotFound(id));
        }

        let item = self.get_item(id)?;
        log::warn!(
            "Queue item {} failed (retry {}): {}",
            id,
            item.retry_count,
            error_message
        );
        Ok(item.retry_count)
    }

    /// Remove an item after a successful replay
    pub fn remove(&self, id: i64) -> Result<(), QueueError> {
        let deleted = self
            .db
            .execute("DELETE FROM mutation_queue WHERE id = ?1", params![id])
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        if deleted == 0 {
            return Err(QueueError::ItemNotFound(id));
        }

        log::info!("Removed queue item {}", id);
        Ok(())
    }

    /// Move an item to the dead-letter table in one transaction
    pub fn move_to_failed(
        &self,
        item: &QueueItem,
        error_message: &str,
    ) -> Result<FailedMutation, QueueError> {
        let failed_at = Utc::now();

        let failed_id = self
            .db
            .transaction(|tx| {
                let deleted =
                    tx.execute("DELETE FROM mutation_queue WHERE id = ?1", params![item.id])?;
                if deleted == 0 {
                    return Ok(None);
                }

                tx.execute(
                    r#"
                INSERT INTO failed_mutations (
                    queue_id, client_id, action, payload, enqueued_at,
                    retry_count, error_message, failed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                    params![
                        item.id,
                        item.client_id,
                        item.action,
                        item.payload,
                        item.enqueued_at.to_rfc3339(),
                        item.retry_count,
                        error_message,
                        failed_at.to_rfc3339(),
                    ],
                )?;

                Ok(Some(tx.last_insert_rowid()))
            })
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?
            .ok_or(QueueError::ItemNotFound(item.id))?;

        log::error!(
            "Queue item {} ({}) dropped permanently: {}",
            item.id,
            item.action,
            error_message
        );

        Ok(FailedMutation {
            id: failed_id,
            queue_id: item.id,
            client_id: item.client_id.clone(),
            action: item.action.clone(),
            payload: item.payload.clone(),
            enqueued_at: item.enqueued_at,
            retry_count: item.retry_count,
            error_message: error_message.to_string(),
            failed_at,
        })
    }

    // ========================================================================
    // Dead letters
    // ========================================================================

    /// Permanently failed mutations, oldest first
    pub fn failed_items(&self) -> Result<Vec<FailedMutation>, QueueError> {
        self.db
            .query(
                &format!("SELECT {FAILED_COLUMNS} FROM failed_mutations ORDER BY id ASC"),
                [],
                row_to_failed,
            )
            .map_err(|e| QueueError::DatabaseError(e.to_string()))
    }

    pub fn failed_count(&self) -> Result<usize, QueueError> {
        let count: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM failed_mutations", [], |row| row.get(0))
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        Ok(count as usize)
    }

    /// Put a failed mutation back at the tail of the queue with a fresh budget
    ///
    /// The original idempotency key is kept so a replay that did land
    /// server-side is not applied twice.
    pub fn requeue_failed(&self, failed_id: i64) -> Result<QueueItem, QueueError> {
        let enqueued_at = Utc::now();

        let item = self
            .db
            .transaction(|tx| {
                let failed = tx
                    .query_row(
                        &format!("SELECT {FAILED_COLUMNS} FROM failed_mutations WHERE id = ?1"),
                        params![failed_id],
                        row_to_failed,
                    )
                    .optional()?;

                let Some(failed) = failed else {
                    return Ok(None);
                };

                tx.execute("DELETE FROM failed_mutations WHERE id = ?1", params![failed_id])?;
                tx.execute(
                    r#"
                INSERT INTO mutation_queue (
                    client_id, action, payload, enqueued_at, retry_count, last_error, updated_at
                ) VALUES (?1, ?2, ?3, ?4, 0, NULL, ?4)
                "#,
                    params![
                        failed.client_id,
                        failed.action,
                        failed.payload,
                        enqueued_at.to_rfc3339()
                    ],
                )?;

                Ok(Some(QueueItem {
                    id: tx.last_insert_rowid(),
                    client_id: failed.client_id,
                    action: failed.action,
                    payload: failed.payload,
                    enqueued_at,
                    retry_count: 0,
                    last_error: None,
                }))
            })
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?
            .ok_or(QueueError::ItemNotFound(failed_id))?;

        log::info!(
            "Failed mutation {} re-queued as item {}",
            failed_id,
            item.id
        );
        Ok(item)
    }

    /// Forget one failed mutation
    pub fn dismiss_failed(&self, failed_id: i64) -> Result<(), QueueError> {
        let deleted = self
            .db
            .execute(
                "DELETE FROM failed_mutations WHERE id = ?1",
                params![failed_id],
            )
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        if deleted == 0 {
            return Err(QueueError::ItemNotFound(failed_id));
        }
        Ok(())
    }

    /// Forget all failed mutations
    pub fn clear_failed(&self) -> Result<usize, QueueError> {
        let deleted = self
            .db
            .execute("DELETE FROM failed_mutations", [])
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        log::info!("Cleared {} failed mutations", deleted);
        Ok(deleted)
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let (pending, retrying): (i64, i64) = self
            .db
            .query_row(
                r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN retry_count > 0 THEN 1 ELSE 0 END), 0)
            FROM mutation_queue
            "#,
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        Ok(QueueStats {
            pending_count: pending as usize,
            retrying_count: retrying as usize,
            failed_count: self.failed_count()?,
        })
    }
}

fn parse_timestamp(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueItem> {
    Ok(QueueItem {
        id: row.get(0)?,
        client_id: row.get(1)?,
        action: row.get(2)?,
        payload: row.get(3)?,
        enqueued_at: parse_timestamp(&row.get::<_, String>(4)?, 4)?,
        retry_count: row.get(5)?,
        last_error: row.get(6)?,
    })
}

fn row_to_failed(row: &rusqlite::Row<'_>) -> rusqlite::Result<FailedMutation> {
    Ok(FailedMutation {
        id: row.get(0)?,
        queue_id: row.get(1)?,
        client_id: row.get(2)?,
        action: row.get(3)?,
        payload: row.get(4)?,
        enqueued_at: parse_timestamp(&row.get::<_, String>(5)?, 5)?,
        retry_count: row.get(6)?,
        error_message: row.get(7)?,
        failed_at: parse_timestamp(&row.get::<_, String>(8)?, 8)?,
    })
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Queue item not found: {0}")]
    ItemNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Decode(#[from] MutationDecodeError),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::{MutationAction, ARTICLES_COLLECTION};
    use serde_json::json;

    fn create_test_queue() -> MutationQueue {
        let db = Arc::new(Database::in_memory().expect("Failed to create test DB"));
        MutationQueue::new(db).expect("Failed to create MutationQueue")
    }

    fn create(title: &str) -> Mutation {
        let mut data = serde_json::Map::new();
        data.insert("title".to_string(), json!(title));
        Mutation::create_article(data)
    }

    fn update(id: &str, title: &str) -> Mutation {
        let mut changes = serde_json::Map::new();
        changes.insert("title".to_string(), json!(title));
        Mutation::UpdateArticle {
            id: id.to_string(),
            changes,
        }
    }

    #[test]
    fn test_queue_creation() {
        let queue = create_test_queue();
        assert_eq!(queue.pending_count().unwrap(), 0);
        assert_eq!(queue.stats().unwrap(), QueueStats::default());
    }

    #[test]
    fn test_enqueue_preserves_insertion_order() {
        let queue = create_test_queue();

        let a = queue.enqueue(&create("A")).unwrap();
        let b = queue.enqueue(&update("a1", "B")).unwrap();
        let c = queue.enqueue(&update("a1", "C")).unwrap();

        assert!(a.id < b.id && b.id < c.id);
        assert_ne!(a.client_id, b.client_id);

        let pending = queue.pending_items().unwrap();
        let ids: Vec<i64> = pending.iter().map(|item| item.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
        assert_eq!(pending[2].mutation().unwrap(), update("a1", "C"));
        assert_eq!(queue.pending_count().unwrap(), 3);
    }

    #[test]
    fn test_identical_mutations_are_not_deduplicated() {
        let queue = create_test_queue();

        queue.enqueue(&update("a1", "Same")).unwrap();
        queue.enqueue(&update("a1", "Same")).unwrap();

        assert_eq!(queue.pending_count().unwrap(), 2);
        assert_eq!(
            queue.pending_for_entity(ARTICLES_COLLECTION, "a1").unwrap().len(),
            2
        );
        assert!(queue
            .pending_for_entity(ARTICLES_COLLECTION, "other")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_increment_retry_is_monotonic() {
        let queue = create_test_queue();
        let item = queue.enqueue(&create("A")).unwrap();

        assert_eq!(queue.increment_retry(item.id, "timeout").unwrap(), 1);
        assert_eq!(queue.increment_retry(item.id, "timeout again").unwrap(), 2);

        let stored = queue.get_item(item.id).unwrap();
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.last_error.as_deref(), Some("timeout again"));
        assert_eq!(queue.stats().unwrap().retrying_count, 1);
    }

    #[test]
    fn test_remove_exactly_once() {
        let queue = create_test_queue();
        let item = queue.enqueue(&create("A")).unwrap();

        queue.remove(item.id).unwrap();
        assert!(matches!(
            queue.remove(item.id),
            Err(QueueError::ItemNotFound(_))
        ));
        assert!(matches!(
            queue.increment_retry(item.id, "late"),
            Err(QueueError::ItemNotFound(_))
        ));
    }

    #[test]
    fn test_move_to_failed_and_requeue() {
        let queue = create_test_queue();
        let item = queue.enqueue(&update("a1", "B")).unwrap();
        queue.increment_retry(item.id, "503").unwrap();
        let item = queue.get_item(item.id).unwrap();

        let failed = queue.move_to_failed(&item, "gave up").unwrap();
        assert_eq!(failed.queue_id, item.id);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(queue.pending_count().unwrap(), 0);
        assert_eq!(queue.failed_count().unwrap(), 1);

        // Second move of the same item finds nothing to move
        assert!(matches!(
            queue.move_to_failed(&item, "gave up"),
            Err(QueueError::ItemNotFound(_))
        ));

        let requeued = queue.requeue_failed(failed.id).unwrap();
        assert!(requeued.id > item.id);
        assert_eq!(requeued.client_id, item.client_id);
        assert_eq!(requeued.retry_count, 0);
        assert_eq!(requeued.action_kind(), Some(MutationAction::UpdateArticle));
        assert_eq!(queue.failed_count().unwrap(), 0);
        assert_eq!(queue.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_dismiss_and_clear_failed() {
        let queue = create_test_queue();
        for title in ["A", "B", "C"] {
            let item = queue.enqueue(&create(title)).unwrap();
            queue.move_to_failed(&item, "rejected").unwrap();
        }

        let failed = queue.failed_items().unwrap();
        assert_eq!(failed.len(), 3);

        queue.dismiss_failed(failed[0].id).unwrap();
        assert!(queue.dismiss_failed(failed[0].id).is_err());
        assert_eq!(queue.clear_failed().unwrap(), 2);
        assert_eq!(queue.failed_count().unwrap(), 0);
    }

    #[test]
    fn test_unknown_action_row_is_isolated() {
        let queue = create_test_queue();
        queue
            .insert_raw("PublishArticle", r#"{"id":"a1"}"#, "c-legacy", Utc::now())
            .unwrap();
        queue.enqueue(&create("A")).unwrap();

        let pending = queue.pending_items().unwrap();
        assert_eq!(pending.len(), 2);
        assert!(matches!(
            pending[0].mutation(),
            Err(MutationDecodeError::UnknownAction(_))
        ));
        assert!(pending[1].mutation().is_ok());
    }
}
