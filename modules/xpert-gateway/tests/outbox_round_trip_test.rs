//! An enqueued event round-trips through `fetch_unpublished_events` and
//! `mark_as_published`.

mod common;

use serial_test::serial;

use xpert_gateway_rs::envelope::create_xpert_envelope;
use xpert_gateway_rs::outbox::{enqueue_event, fetch_unpublished_events, mark_as_published};

#[tokio::test]
#[serial]
async fn enqueued_event_is_fetched_then_disappears_once_published() {
    let pool = common::get_test_pool().await;
    common::cleanup(&pool).await;

    let envelope = create_xpert_envelope(
        uuid::Uuid::new_v4(),
        "xpert-gateway".to_string(),
        None,
        serde_json::json!({"sources_processed": 3}),
    );
    let id = enqueue_event(&pool, "xpert.aggregation.tick_completed", &envelope)
        .await
        .unwrap();

    let unpublished = fetch_unpublished_events(&pool, 100).await.unwrap();
    assert!(unpublished.iter().any(|e| e.id == id));
    assert!(unpublished
        .iter()
        .find(|e| e.id == id)
        .unwrap()
        .published_at
        .is_none());

    mark_as_published(&pool, id).await.unwrap();

    let unpublished_after = fetch_unpublished_events(&pool, 100).await.unwrap();
    assert!(!unpublished_after.iter().any(|e| e.id == id));

    common::cleanup(&pool).await;
}
