//! Append-only audit trail of admin mutations. Logging is best-effort —
//! callers never let a logging failure abort the mutation that triggered it.

use serde_json::Value as JsonValue;
use sqlx::PgPool;

use crate::models::AdminActionLog;

pub struct AdminActionLogger {
    pool: PgPool,
}

impl AdminActionLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record one admin mutation. Exceptions never propagate: a failure here
    /// is logged via `tracing` and swallowed.
    pub async fn record(
        &self,
        admin_username: &str,
        action: &str,
        target_type: &str,
        target_username: Option<&str>,
        meta: JsonValue,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO xpert_admin_action_log
                (admin_username, action, target_type, target_username, meta)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(admin_username)
        .bind(action)
        .bind(target_type)
        .bind(target_username)
        .bind(meta)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(
                admin = admin_username,
                action,
                error = %e,
                "admin action log write failed, continuing"
            );
        }
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<AdminActionLog>, sqlx::Error> {
        sqlx::query_as::<_, AdminActionLog>(
            r#"
            SELECT id, created_at, admin_id, admin_username, action, target_type, target_username, meta
            FROM xpert_admin_action_log
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }
}
