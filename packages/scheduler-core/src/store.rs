//! Persistent store collaborator (§6.3) and the bot-result recovery
//! contract the processor exposes to handlers (§4.3.5).
//!
//! Two logical tables, `bot_results` and `sync_events`. Business tables
//! (orders, customers, articles, DDT, invoices, ...) are handler-owned; this
//! crate neither reads nor schemas them.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;

use crate::ids::UserId;
use crate::operation::OperationKind;

/// `bot_results(user_id, operation_type, operation_key, result_data)` plus
/// `sync_events(user_id, sync_type, event_type, details, created_at)`,
/// accessed only through this trait.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get_bot_result(
        &self,
        user_id: UserId,
        kind: OperationKind,
        operation_key: &str,
    ) -> anyhow::Result<Option<Value>>;

    /// Upsert-on-save: a second save for the same `(user_id, kind,
    /// operation_key)` replaces the payload.
    async fn put_bot_result(
        &self,
        user_id: UserId,
        kind: OperationKind,
        operation_key: &str,
        payload: Value,
    ) -> anyhow::Result<()>;

    async fn delete_bot_result(
        &self,
        user_id: UserId,
        kind: OperationKind,
        operation_key: &str,
    ) -> anyhow::Result<()>;

    /// Append-only audit row. `event_type` is `sync_completed`,
    /// `sync_error`, or a handler-defined parser/validation warning.
    async fn record_sync_event(
        &self,
        user_id: UserId,
        sync_type: OperationKind,
        event_type: &str,
        details: Value,
    ) -> anyhow::Result<()>;
}

/// Postgres-backed [`PersistentStore`].
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PersistentStore for PostgresStore {
    async fn get_bot_result(
        &self,
        user_id: UserId,
        kind: OperationKind,
        operation_key: &str,
    ) -> anyhow::Result<Option<Value>> {
        let row: Option<(Value,)> = sqlx::query_as(
            r#"
            SELECT result_data
            FROM bot_results
            WHERE user_id = $1 AND operation_type = $2 AND operation_key = $3
            "#,
        )
        .bind(user_id)
        .bind(kind)
        .bind(operation_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(payload,)| payload))
    }

    async fn put_bot_result(
        &self,
        user_id: UserId,
        kind: OperationKind,
        operation_key: &str,
        payload: Value,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bot_results (user_id, operation_type, operation_key, result_data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, operation_type, operation_key)
            DO UPDATE SET result_data = EXCLUDED.result_data
            "#,
        )
        .bind(user_id)
        .bind(kind)
        .bind(operation_key)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_bot_result(
        &self,
        user_id: UserId,
        kind: OperationKind,
        operation_key: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            DELETE FROM bot_results
            WHERE user_id = $1 AND operation_type = $2 AND operation_key = $3
            "#,
        )
        .bind(user_id)
        .bind(kind)
        .bind(operation_key)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_sync_event(
        &self,
        user_id: UserId,
        sync_type: OperationKind,
        event_type: &str,
        details: Value,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_events (user_id, sync_type, event_type, details, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(user_id)
        .bind(sync_type)
        .bind(event_type)
        .bind(details)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// The three bot-result helpers handlers call directly (§4.3.5). Thin
/// pass-throughs over [`PersistentStore`] kept as free functions so a
/// handler only needs `&dyn PersistentStore`, not the processor itself.
pub async fn check_bot_result(
    store: &dyn PersistentStore,
    user_id: UserId,
    kind: OperationKind,
    operation_key: &str,
) -> anyhow::Result<Option<Value>> {
    store.get_bot_result(user_id, kind, operation_key).await
}

pub async fn save_bot_result(
    store: &dyn PersistentStore,
    user_id: UserId,
    kind: OperationKind,
    operation_key: &str,
    payload: Value,
) -> anyhow::Result<()> {
    store.put_bot_result(user_id, kind, operation_key, payload).await
}

pub async fn clear_bot_result(
    store: &dyn PersistentStore,
    user_id: UserId,
    kind: OperationKind,
    operation_key: &str,
) -> anyhow::Result<()> {
    store.delete_bot_result(user_id, kind, operation_key).await
}
