//! Audit log API endpoints and helpers.

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts, Query, State},
    http::{header, request::Parts, HeaderMap},
    Json,
};
use chrono::{Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use crate::db::{actor_types, ActionCount, Admin, AuditPage, AuditQuery, NewAuditEntry, Partner};
use crate::AppState;

use super::auth::{CurrentAdmin, SuperAdmin};
use super::error::ApiError;
use super::{ok, ApiResponse};

/// Extract client IP address from request headers or connection info.
/// Checks X-Forwarded-For, X-Real-IP headers first (for reverse proxy scenarios),
/// then falls back to the connection info.
pub fn extract_client_ip(headers: &HeaderMap, conn_info: Option<&SocketAddr>) -> Option<String> {
    // X-Forwarded-For is a comma-separated list, the client comes first
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        if let Some(first_ip) = forwarded.split(',').next() {
            let ip = first_ip.trim();
            if !ip.is_empty() {
                return Some(ip.to_string());
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|h| h.to_str().ok()) {
        let ip = real_ip.trim();
        if !ip.is_empty() {
            return Some(ip.to_string());
        }
    }

    conn_info.map(|addr| addr.ip().to_string())
}

/// Where a request came from, attached to every audit entry it produces
#[derive(Debug, Clone, Default)]
pub struct AuditContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditContext {
    pub fn actor(&self, actor_type: &str, actor_id: Option<i64>, actor_name: Option<&str>, action: &str) -> NewAuditEntry {
        NewAuditEntry {
            actor_id,
            actor_type: actor_type.to_string(),
            actor_name: actor_name.map(str::to_string),
            action: action.to_string(),
            ip_address: self.ip_address.clone(),
            user_agent: self.user_agent.clone(),
            ..Default::default()
        }
    }

    pub fn admin(&self, admin: &Admin, action: &str) -> NewAuditEntry {
        self.actor(actor_types::ADMIN, Some(admin.id), Some(&admin.username), action)
    }

    pub fn partner(&self, partner: &Partner, action: &str) -> NewAuditEntry {
        self.actor(actor_types::PARTNER, Some(partner.id), Some(&partner.name), action)
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuditContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .map(|ua| ua.chars().take(500).collect());

        Ok(Self {
            ip_address: extract_client_ip(&parts.headers, peer.as_ref()),
            user_agent,
        })
    }
}

/// Write an audit entry. Failures are logged and never fail the request.
pub async fn audit_log(state: &AppState, entry: NewAuditEntry) {
    if let Err(e) = state.store.append_audit(&entry, Utc::now()).await {
        tracing::warn!(
            action = %entry.action,
            entity_type = ?entry.entity_type,
            error = %e,
            "Failed to create audit log entry"
        );
    }
}

/// List audit logs with filtering and pagination
///
/// Query parameters:
/// - actorId, actorType: who acted
/// - action: e.g. "claims.publish"
/// - entityType: e.g. "claim", "partner"
/// - dateFrom, dateTo: inclusive day range
/// - search: substring of action, entity, actor name or details
/// - limit: defaults to 50, max 500
/// - offset: defaults to 0
pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    SuperAdmin(_admin): SuperAdmin,
    Query(query): Query<AuditQuery>,
) -> Result<Json<ApiResponse<AuditPage>>, ApiError> {
    let page = state.store.list_audit(&query).await?;
    Ok(ok(page))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatsQuery {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStats {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub total: i64,
    pub actions: Vec<ActionCount>,
}

/// Entry counts per action. The window defaults to the last 30 days.
pub async fn stats(
    State(state): State<Arc<AppState>>,
    SuperAdmin(_admin): SuperAdmin,
    Query(query): Query<StatsQuery>,
) -> Result<Json<ApiResponse<AuditStats>>, ApiError> {
    let today = Utc::now().date_naive();
    let date_to = query.date_to.unwrap_or(today);
    let date_from = query.date_from.unwrap_or(date_to - Duration::days(30));
    if date_from > date_to {
        return Err(ApiError::validation_field("dateFrom", "dateFrom must not be after dateTo"));
    }

    let from = date_from.and_time(NaiveTime::MIN).and_utc();
    let to = (date_to + Duration::days(1)).and_time(NaiveTime::MIN).and_utc();
    let actions = state.store.audit_stats(from, to).await?;

    Ok(ok(AuditStats {
        date_from,
        date_to,
        total: actions.iter().map(|a| a.count).sum(),
        actions,
    }))
}

#[derive(Debug, Deserialize, Default)]
pub struct RecentQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Most recent entries for the admin dashboard
pub async fn recent(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(_admin): CurrentAdmin,
    Query(query): Query<RecentQuery>,
) -> Result<Json<ApiResponse<AuditPage>>, ApiError> {
    let page = state
        .store
        .list_audit(&AuditQuery {
            limit: query.limit,
            offset: query.offset,
            ..Default::default()
        })
        .await?;
    Ok(ok(page))
}
