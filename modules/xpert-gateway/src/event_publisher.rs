//! Background task draining the event outbox onto the event bus.
//!
//! Named `event_publisher` rather than `publisher` to avoid colliding with
//! the Subscription Publisher, which owns the `publisher` module name in
//! this crate.

use std::sync::Arc;
use std::time::Duration;

use event_bus::EventBus;
use sqlx::PgPool;
use tokio::time::sleep;

use crate::outbox::{fetch_unpublished_events, mark_as_published};

/// Polls the outbox once a second and republishes anything not yet
/// acknowledged. Runs for the lifetime of the process.
pub async fn run_event_publisher(pool: PgPool, bus: Arc<dyn EventBus>) {
    tracing::info!("starting xpert-gateway event publisher task");

    loop {
        match publish_pending_events(&pool, &bus).await {
            Ok(count) if count > 0 => {
                tracing::debug!("published {} events from outbox", count);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("error publishing outbox events: {}", e);
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}

async fn publish_pending_events(
    pool: &PgPool,
    bus: &Arc<dyn EventBus>,
) -> Result<usize, Box<dyn std::error::Error>> {
    let events = fetch_unpublished_events(pool, 100).await?;

    let mut published_count = 0;

    for event in events {
        let event_id = event.id;
        let nats_subject = format!("xpert.events.{}", event.subject);
        let payload_bytes = serde_json::to_vec(&event.payload)?;

        match bus.publish(&nats_subject, payload_bytes).await {
            Ok(_) => {
                mark_as_published(pool, event_id).await?;
                published_count += 1;
                tracing::trace!("published event {} to subject {}", event_id, nats_subject);
            }
            Err(e) => {
                tracing::error!(
                    "failed to publish event {} to subject {}: {}",
                    event_id,
                    nats_subject,
                    e
                );
            }
        }
    }

    Ok(published_count)
}
