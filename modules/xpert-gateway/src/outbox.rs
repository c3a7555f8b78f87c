//! Event outbox: reliable at-least-once delivery of domain notifications
//! (traffic-limit breaches, aggregation-tick completion) to the event bus.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRecord {
    pub id: i64,
    pub subject: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

pub async fn enqueue_event<T: Serialize>(
    pool: &PgPool,
    event_type: &str,
    envelope: &event_bus::EventEnvelope<T>,
) -> Result<i64, sqlx::Error> {
    let payload =
        serde_json::to_value(envelope).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    let record = sqlx::query!(
        r#"
        INSERT INTO events_outbox (subject, payload)
        VALUES ($1, $2)
        RETURNING id
        "#,
        event_type,
        payload
    )
    .fetch_one(pool)
    .await?;

    tracing::debug!("enqueued event {} to subject {}", record.id, event_type);
    Ok(record.id)
}

pub async fn fetch_unpublished_events(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<OutboxRecord>, sqlx::Error> {
    sqlx::query_as::<_, OutboxRecord>(
        r#"
        SELECT id, subject, payload, created_at, published_at
        FROM events_outbox
        WHERE published_at IS NULL
        ORDER BY created_at ASC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn mark_as_published(pool: &PgPool, event_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query!(
        "UPDATE events_outbox SET published_at = NOW() WHERE id = $1",
        event_id
    )
    .execute(pool)
    .await?;
    Ok(())
}
