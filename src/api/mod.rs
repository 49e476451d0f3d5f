pub mod admin;
pub mod admins;
pub mod audit;
pub mod auth;
pub mod error;
pub mod partner;
pub mod partners;
pub mod validation;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Multipart framing on top of the file bytes themselves
const UPLOAD_OVERHEAD: usize = 1024 * 1024;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Public
    let auth_routes = Router::new()
        .route("/login", post(auth::login))
        .route("/admin/login", post(auth::admin_login))
        .route("/forgot-password", post(auth::forgot_password))
        .route("/reset-password/:token", get(auth::check_reset_token))
        .route("/reset-password", post(auth::reset_password))
        .route("/verify", get(auth::verify));

    // Guarded by the CurrentPartner extractor
    let partner_routes = Router::new()
        .route("/profile", get(partner::profile))
        .route("/documents", get(partner::documents))
        .route("/documents/history", get(partner::history))
        .route("/documents/search", get(partner::search))
        .route("/documents/:id", get(partner::document))
        .route("/documents/:id/download", get(partner::download))
        .route("/stats", get(partner::stats));

    let upload_limit = state
        .config
        .upload
        .max_file_size
        .saturating_mul(state.config.upload.max_files)
        .saturating_add(UPLOAD_OVERHEAD);
    let upload_routes = Router::new()
        .route("/upload-files", post(admin::upload_files))
        .route("/auto-upload-files", post(admin::auto_upload_files))
        .layer(DefaultBodyLimit::max(upload_limit));

    // Guarded by CurrentAdmin, admin management by SuperAdmin
    let admin_routes = Router::new()
        // Claims
        .route("/unpublished-claims", get(admin::unpublished_claims))
        .route("/published-claims", get(admin::published_claims))
        .route("/claims/:id", get(admin::get_claim).delete(admin::delete_claim))
        .route("/claims/:id/download", get(admin::download_claim))
        .route("/publish-claims", post(admin::publish_claims))
        .route("/unpublish-claims", post(admin::unpublish_claims))
        // Partners
        .route("/partners", get(partners::list_partners).post(partners::create_partner))
        .route(
            "/partners/:id",
            get(partners::get_partner)
                .put(partners::update_partner)
                .delete(partners::delete_partner),
        )
        .route("/partners/:id/documents", get(partners::partner_documents))
        // Admins
        .route("/admins", get(admins::list_admins).post(admins::create_admin))
        .route("/admins/:id", put(admins::update_admin).delete(admins::delete_admin))
        .route("/admins/:id/password", put(admins::change_password))
        // Dashboard
        .route("/stats", get(admin::stats))
        .route("/audit-log", get(audit::recent))
        .route("/birthdays", get(admin::birthdays))
        .route("/birthdays/check", post(admin::check_birthdays))
        .merge(upload_routes);

    let audit_routes = Router::new()
        .route("/", get(audit::list_logs))
        .route("/stats", get(audit::stats));

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .nest("/auth", auth_routes)
        .nest("/partner", partner_routes)
        .nest("/admin", admin_routes)
        .nest("/audit-logs", audit_routes);

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Success envelope: `{"success": true, ...fields of T}`
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    success: bool,
    #[serde(flatten)]
    data: T,
}

pub fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse { success: true, data })
}

/// File download with an RFC 5987 encoded name, so non-ASCII names survive
pub fn attachment(filename: &str, mime_type: &str, content: Vec<u8>) -> Response {
    let content_type = HeaderValue::from_str(mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let disposition = format!("attachment; filename*=UTF-8''{}", urlencoding::encode(filename));

    (
        [
            (header::CONTENT_TYPE, content_type),
            (
                header::CONTENT_DISPOSITION,
                HeaderValue::from_str(&disposition)
                    .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
            ),
        ],
        content,
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct DatabaseHealth {
    backend: &'static str,
    connected: bool,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    version: &'static str,
    database: DatabaseHealth,
}

async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let connected = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Health check: database unreachable");
            false
        }
    };

    let status = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if connected { "ok" } else { "degraded" },
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION"),
            database: DatabaseHealth {
                backend: state.store.backend_name(),
                connected,
            },
        }),
    )
}
