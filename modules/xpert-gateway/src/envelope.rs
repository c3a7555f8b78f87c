//! Platform-wide event envelope, specialized for this service.

pub use event_bus::EventEnvelope;

pub fn create_xpert_envelope<T>(
    event_id: uuid::Uuid,
    tenant_id: String,
    correlation_id: Option<String>,
    payload: T,
) -> EventEnvelope<T> {
    EventEnvelope::with_event_id(event_id, tenant_id, "xpert-gateway".to_string(), payload)
        .with_source_version(env!("CARGO_PKG_VERSION").to_string())
        .with_correlation_id(correlation_id)
}
