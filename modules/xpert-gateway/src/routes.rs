//! HTTP surface: the public subscription endpoints and the admin endpoints
//! sitting in front of the core aggregation/policy/traffic modules. Routing
//! is ambient wiring; the interesting behavior lives in the modules these
//! handlers call into.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::json;

use crate::admin_auth::AdminIdentity;
use crate::envelope::create_xpert_envelope;
use crate::errors::{GatewayError, GatewayResult};
use crate::models::*;
use crate::outbox::enqueue_event;
use crate::policy::{extract_client_ip, Decision};
use crate::publisher;
use crate::state::AppState;

pub fn public_router() -> Router<AppState> {
    Router::new()
        .route("/sub/{token}", get(serve_subscription_by_path))
        .route("/xpert/sub", get(serve_subscription_by_query))
        .route("/xpert/direct-configs/sub", get(serve_direct_only_subscription))
}

pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/xpert/sources", get(list_sources).post(create_source))
        .route("/xpert/sources/{id}", delete(delete_source))
        .route("/xpert/sources/{id}/toggle", post(toggle_source))
        .route("/xpert/update", post(force_update))
        .route(
            "/xpert/direct-configs",
            get(list_direct_configs).post(create_direct_config),
        )
        .route(
            "/xpert/direct-configs/{id}",
            put(update_direct_config).delete(delete_direct_config),
        )
        .route("/xpert/direct-configs/{id}/toggle", post(toggle_direct_config))
        .route("/xpert/direct-configs/{id}/move", post(move_direct_config))
        .route("/xpert/direct-configs/batch", post(batch_add_direct_configs))
        .route("/xpert/direct-configs/batch-move", post(batch_move_direct_configs))
        .route("/xpert/direct-configs/ping-refresh", post(ping_refresh_direct_configs))
        .route("/xpert/crypto-link", post(create_crypto_link))
        .route("/xpert/hwid/reset", post(reset_hwid))
        .route("/xpert/ip-limit", get(get_ip_limit).post(set_ip_limit))
        .route("/xpert/traffic-webhook", post(traffic_webhook))
        .route("/xpert/traffic-stats/user", get(traffic_stats_user))
        .route("/xpert/traffic-stats/global", get(traffic_stats_global))
        .route("/xpert/traffic-stats/server", get(traffic_stats_server))
        .route("/xpert/traffic-stats/cleanup", post(traffic_stats_cleanup))
        .route("/xpert/traffic-stats/admin-quota", get(traffic_admin_quota))
        .route("/xpert/traffic-stats/admin-quota/reset", post(traffic_admin_quota_reset))
}

// ---------------------------------------------------------------------------
// Public subscription endpoints
// ---------------------------------------------------------------------------

async fn gate_and_record_ip(
    state: &AppState,
    username: Option<&str>,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    presented_hwid: Option<&str>,
) -> GatewayResult<()> {
    let Some(username) = username else {
        return Ok(());
    };
    if state.policy.check_hwid(username, presented_hwid).await? == Decision::Deny {
        return Err(GatewayError::PolicyDeny);
    }
    if let Some(ip) = extract_client_ip(headers, peer) {
        if state.policy.check_ip_window(username, &ip).await? == Decision::Deny {
            return Err(GatewayError::PolicyDeny);
        }
    }
    Ok(())
}

async fn build_subscription_response(
    state: &AppState,
    username: Option<&str>,
    format: SubscriptionFormat,
    direct_only: bool,
    title: &str,
) -> GatewayResult<Response> {
    let aggregated = state.orchestrator.snapshot().load();
    let direct = state.direct_configs.list().await;
    let body = publisher::build_body(&aggregated, &direct, format, direct_only);

    let (upload, download) = match username {
        Some(u) => state.traffic.user_totals(u).await?,
        None => (0, 0),
    };
    let headers = publisher::build_headers(title, upload, download, upload + download);
    Ok((headers, body).into_response())
}

async fn serve_subscription_by_path(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<SubscriptionQuery>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Response, GatewayError> {
    serve_subscription(&state, &token, query.format, &headers, Some(peer), false).await
}

async fn serve_subscription_by_query(
    State(state): State<AppState>,
    Query(query): Query<SubscriptionQuery>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Response, GatewayError> {
    let token = query.token.clone().unwrap_or_default();
    serve_subscription(&state, &token, query.format, &headers, Some(peer), false).await
}

async fn serve_direct_only_subscription(
    State(state): State<AppState>,
    Query(query): Query<SubscriptionQuery>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Response, GatewayError> {
    let token = query.token.clone().unwrap_or_default();
    serve_subscription(&state, &token, query.format, &headers, Some(peer), true).await
}

async fn serve_subscription(
    state: &AppState,
    token: &str,
    format: SubscriptionFormat,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    direct_only: bool,
) -> Result<Response, GatewayError> {
    let username = state.identity.resolve(token);
    let presented_hwid = headers
        .get("x-hwid")
        .and_then(|v| v.to_str().ok());
    gate_and_record_ip(state, username.as_deref(), headers, peer, presented_hwid).await?;

    let title = if direct_only { "Xpert Direct" } else { "Xpert" };
    build_subscription_response(state, username.as_deref(), format, direct_only, title).await
}

// ---------------------------------------------------------------------------
// Source Registry admin endpoints
// ---------------------------------------------------------------------------

async fn list_sources(State(state): State<AppState>, _admin: AdminIdentity) -> Json<Vec<SubscriptionSource>> {
    Json(state.sources.list().await)
}

async fn create_source(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Json(req): Json<CreateSourceRequest>,
) -> Result<Json<SubscriptionSource>, GatewayError> {
    let source = state.sources.add(req).await?;
    state
        .admin_log
        .record(&admin.username, "source.create", "source", Some(&source.id.to_string()), json!({"url": source.url}))
        .await;
    Ok(Json(source))
}

async fn delete_source(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<i64>,
) -> Result<(), GatewayError> {
    state.sources.delete(id).await?;
    // Cascade: drop this source's configs from the live snapshot immediately
    // rather than waiting for the next aggregation tick.
    state.orchestrator.snapshot().remove_source(id);
    state
        .admin_log
        .record(&admin.username, "source.delete", "source", Some(&id.to_string()), json!({}))
        .await;
    Ok(())
}

async fn toggle_source(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<i64>,
) -> Result<Json<SubscriptionSource>, GatewayError> {
    let source = state.sources.toggle(id).await?;
    state
        .admin_log
        .record(&admin.username, "source.toggle", "source", Some(&id.to_string()), json!({"enabled": source.enabled}))
        .await;
    Ok(Json(source))
}

async fn force_update(
    State(state): State<AppState>,
    admin: AdminIdentity,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let report = state.orchestrator.force_tick().await?;
    state
        .admin_log
        .record(&admin.username, "source.force_update", "aggregation", None, json!({
            "sources_processed": report.sources_processed,
            "configs_ensured": report.configs_ensured,
        }))
        .await;
    Ok(Json(json!({
        "sources_processed": report.sources_processed,
        "configs_ensured": report.configs_ensured,
        "active_configs": report.active_configs,
        "marzban_hosts_ensured": report.marzban_hosts_ensured,
        "marzban_failures": report.marzban_failures,
    })))
}

// ---------------------------------------------------------------------------
// Direct-Config Store admin endpoints
// ---------------------------------------------------------------------------

async fn list_direct_configs(State(state): State<AppState>, _admin: AdminIdentity) -> Json<Vec<DirectConfig>> {
    Json(state.direct_configs.list().await)
}

async fn create_direct_config(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Json(req): Json<CreateDirectConfigRequest>,
) -> Result<Json<DirectConfig>, GatewayError> {
    let config = state.direct_configs.add(req).await?;
    state
        .admin_log
        .record(&admin.username, "direct_config.create", "direct_config", Some(&config.id.to_string()), json!({}))
        .await;
    Ok(Json(config))
}

async fn update_direct_config(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<i64>,
    Json(req): Json<UpdateDirectConfigRequest>,
) -> Result<Json<DirectConfig>, GatewayError> {
    let config = state.direct_configs.update(id, &req.raw_link).await?;
    state
        .admin_log
        .record(&admin.username, "direct_config.update", "direct_config", Some(&id.to_string()), json!({}))
        .await;
    Ok(Json(config))
}

async fn delete_direct_config(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<i64>,
) -> Result<(), GatewayError> {
    state.direct_configs.delete(id).await?;
    state
        .admin_log
        .record(&admin.username, "direct_config.delete", "direct_config", Some(&id.to_string()), json!({}))
        .await;
    Ok(())
}

async fn toggle_direct_config(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<i64>,
) -> Result<Json<DirectConfig>, GatewayError> {
    let config = state.direct_configs.toggle(id).await?;
    state
        .admin_log
        .record(&admin.username, "direct_config.toggle", "direct_config", Some(&id.to_string()), json!({"is_active": config.is_active}))
        .await;
    Ok(Json(config))
}

/// `POST /xpert/direct-configs/batch`: add many raw links in one call.
/// Per-row failures are collected rather than aborting the whole batch.
async fn batch_add_direct_configs(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Json(req): Json<BatchAddDirectConfigsRequest>,
) -> Result<Json<BatchAddResult>, GatewayError> {
    let mut added = Vec::new();
    let mut failed = Vec::new();
    for raw_link in req.raw_links {
        let create = CreateDirectConfigRequest {
            raw_link: raw_link.clone(),
            added_by: req.added_by.clone(),
        };
        match state.direct_configs.add(create).await {
            Ok(config) => added.push(config),
            Err(_) => failed.push(raw_link),
        }
    }
    state
        .admin_log
        .record(&admin.username, "direct_config.batch_add", "direct_config", None, json!({"added": added.len(), "failed": failed.len()}))
        .await;
    Ok(Json(BatchAddResult { added, failed }))
}

async fn move_direct_config(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<i64>,
    Json(req): Json<MoveRequest>,
) -> Result<(), GatewayError> {
    state.direct_configs.move_one(id, req.direction).await?;
    state
        .admin_log
        .record(&admin.username, "direct_config.move", "direct_config", Some(&id.to_string()), json!({}))
        .await;
    Ok(())
}

async fn batch_move_direct_configs(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Json(req): Json<BatchMoveRequest>,
) -> Result<(), GatewayError> {
    state.direct_configs.batch_move(&req.ids, req.direction).await?;
    state
        .admin_log
        .record(&admin.username, "direct_config.batch_move", "direct_config", None, json!({"ids": req.ids}))
        .await;
    Ok(())
}

async fn ping_refresh_direct_configs(
    State(state): State<AppState>,
    _admin: AdminIdentity,
    Json(req): Json<PingRefreshRequest>,
) -> Result<(), GatewayError> {
    state
        .direct_configs
        .refresh_all_pings(&state.prober, req.force)
        .await
}

// ---------------------------------------------------------------------------
// Policy admin endpoints
// ---------------------------------------------------------------------------

/// `POST /xpert/crypto-link`: wraps a raw link with an access policy. A
/// real deployment would hand the signing step to an external service;
/// consistent with the `TokenResolver` trait boundary, the minted token is
/// simply the lowercased username, so the gateway's own fallback resolver
/// maps it straight back.
async fn create_crypto_link(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Json(req): Json<CryptoLinkRequest>,
) -> Result<Json<CryptoLinkResponse>, GatewayError> {
    let username = req.username.trim().to_lowercase();
    if username.len() < 8 {
        return Err(GatewayError::Validation(
            "username must be at least 8 bytes to mint a non-anonymous token".into(),
        ));
    }
    if let Some(hwid) = &req.required_hwid {
        state.policy.set_required_hwid(&username, hwid).await?;
    }
    if let Some(max_pool) = req.max_unique_hwid {
        state.policy.set_hwid_pool_limit(&username, max_pool).await?;
    }
    if let Some(limit) = req.unique_ip_limit {
        state.policy.set_unique_ip_limit(&username, limit).await?;
    }
    state
        .admin_log
        .record(&admin.username, "crypto.encrypt", "subscriber", Some(&username), json!({}))
        .await;
    Ok(Json(CryptoLinkResponse {
        token: username,
        raw_link: req.raw_link,
    }))
}

async fn reset_hwid(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Json(req): Json<HwidResetRequest>,
) -> Result<(), GatewayError> {
    state.policy.reset_hwid(&req.username).await?;
    state
        .admin_log
        .record(&admin.username, "hwid.reset", "subscriber", Some(&req.username), json!({}))
        .await;
    Ok(())
}

async fn get_ip_limit(
    State(state): State<AppState>,
    _admin: AdminIdentity,
    Query(query): Query<IpLimitQuery>,
) -> Json<serde_json::Value> {
    let policy = state.policy.get_policy(&query.username).await;
    Json(json!({
        "username": query.username,
        "unique_ip_limit": policy.as_ref().and_then(|p| p.unique_ip_limit),
        "current_ips": policy.map(|p| p.ip_window.len()).unwrap_or(0),
    }))
}

async fn set_ip_limit(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Json(req): Json<SetIpLimitRequest>,
) -> Result<(), GatewayError> {
    state.policy.set_unique_ip_limit(&req.username, req.limit).await?;
    state
        .admin_log
        .record(&admin.username, "user.ip_limit_set", "subscriber", Some(&req.username), json!({"limit": req.limit}))
        .await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Traffic Accounting admin endpoints
// ---------------------------------------------------------------------------

async fn traffic_webhook(
    State(state): State<AppState>,
    _admin: AdminIdentity,
    Json(req): Json<TrafficWebhookRequest>,
) -> Result<(), GatewayError> {
    state
        .traffic
        .record(
            &req.user_token,
            &req.server,
            req.port,
            &req.protocol,
            req.bytes_uploaded,
            req.bytes_downloaded,
        )
        .await
}

async fn traffic_stats_user(
    State(state): State<AppState>,
    _admin: AdminIdentity,
    Query(query): Query<UserStatsQuery>,
) -> Result<Json<Vec<UserStatsRow>>, GatewayError> {
    Ok(Json(state.traffic.user_stats(&query.token, query.days).await?))
}

async fn traffic_stats_global(
    State(state): State<AppState>,
    _admin: AdminIdentity,
    Query(query): Query<DaysQuery>,
) -> Result<Json<Vec<UserStatsRow>>, GatewayError> {
    Ok(Json(state.traffic.global_stats(query.days).await?))
}

async fn traffic_stats_server(
    State(state): State<AppState>,
    _admin: AdminIdentity,
    Query(query): Query<ServerStatsQuery>,
) -> Result<Json<Vec<TrafficRecord>>, GatewayError> {
    Ok(Json(
        state.traffic.server_stats(&query.server, query.port, query.days).await?,
    ))
}

async fn traffic_stats_cleanup(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Json(req): Json<CleanupRequest>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let deleted = state.traffic.cleanup(req.days).await?;
    state
        .admin_log
        .record(&admin.username, "admin.traffic_cleanup", "traffic", None, json!({"days": req.days, "deleted": deleted}))
        .await;
    Ok(Json(json!({"deleted": deleted})))
}

async fn traffic_admin_quota(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Query(query): Query<AdminQuotaCheckQuery>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let (used, limit, exceeded) = state
        .traffic
        .check_admin_traffic_limit(query.limit_bytes)
        .await?;
    state
        .admin_log
        .record(&admin.username, "admin.traffic_limit_check", "admin", Some(&admin.username), json!({"limit_bytes": limit, "exceeded": exceeded}))
        .await;
    if exceeded {
        let envelope = create_xpert_envelope(
            uuid::Uuid::new_v4(),
            "xpert-gateway".to_string(),
            None,
            json!({"used_bytes": used, "limit_bytes": limit}),
        );
        if let Err(e) = enqueue_event(&state.pool, "xpert.traffic.limit_breached", &envelope).await {
            tracing::warn!(error = %e, "failed to enqueue traffic-limit-breached event");
        }
    }
    Ok(Json(json!({"used_bytes": used, "limit_bytes": limit, "exceeded": exceeded})))
}

/// Deliberately coarse wipe of the traffic table, gated behind the admin
/// token like every other mutation here.
async fn traffic_admin_quota_reset(
    State(state): State<AppState>,
    admin: AdminIdentity,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let (rows, up, down) = state.traffic.reset_admin_external_traffic().await?;
    state
        .admin_log
        .record(&admin.username, "admin.traffic_reset", "traffic", None, json!({"rows_deleted": rows, "bytes_uploaded": up, "bytes_downloaded": down}))
        .await;
    Ok(Json(json!({"rows_deleted": rows, "bytes_uploaded": up, "bytes_downloaded": down})))
}
