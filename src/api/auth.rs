//! Login, password recovery, and the extractors guarding protected routes.
//!
//! Every protected handler names its guard as an argument: [`CurrentPartner`],
//! [`CurrentAdmin`] or [`SuperAdmin`]. Each one verifies the bearer token and
//! then re-reads the account, so a deleted or deactivated account loses
//! access before its token expires.

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{header, request::Parts, HeaderMap},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::{hash_token, AuthError, AuthSession, AuthUser, Role, TokenClaims};
use crate::db::{actions, actor_types, entity_types, Admin, Partner};
use crate::notifications::Recipient;
use crate::AppState;

use super::audit::{audit_log, AuditContext};
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{validate_email, validate_partner_password};
use super::{ok, ApiResponse};

/// Bearer token from the Authorization header
fn extract_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn verify_request(parts: &Parts, state: &AppState) -> Result<TokenClaims, ApiError> {
    let token = extract_token(&parts.headers).ok_or_else(|| ApiError::unauthorized("Access token required"))?;
    Ok(state.auth.tokens().verify(token)?)
}

async fn load_partner(state: &AppState, claims: &TokenClaims) -> Result<Partner, ApiError> {
    if claims.role != Role::Partner {
        return Err(ApiError::forbidden("Partner access required"));
    }
    let partner = state
        .store
        .get_partner(claims.sub)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Account no longer exists"))?;
    if !partner.active {
        return Err(ApiError::forbidden("Account is inactive"));
    }
    Ok(partner)
}

async fn load_admin(state: &AppState, claims: &TokenClaims) -> Result<Admin, ApiError> {
    if claims.role != Role::Admin {
        return Err(ApiError::forbidden("Administrator access required"));
    }
    state
        .store
        .get_admin(claims.sub)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Account no longer exists"))
}

/// An authenticated, active partner
pub struct CurrentPartner(pub Partner);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CurrentPartner {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let claims = verify_request(parts, state)?;
        Ok(Self(load_partner(state, &claims).await?))
    }
}

/// An authenticated admin of any role
pub struct CurrentAdmin(pub Admin);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CurrentAdmin {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let claims = verify_request(parts, state)?;
        Ok(Self(load_admin(state, &claims).await?))
    }
}

/// An authenticated super-admin
pub struct SuperAdmin(pub Admin);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for SuperAdmin {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let CurrentAdmin(admin) = CurrentAdmin::from_request_parts(parts, state).await?;
        if !admin.is_super_admin() {
            return Err(ApiError::forbidden("Super-admin access required"));
        }
        Ok(Self(admin))
    }
}

fn partner_user(partner: &Partner) -> AuthUser {
    AuthUser {
        id: partner.id,
        name: partner.name.clone(),
        email: Some(partner.email.clone()),
        login: partner.alias.clone(),
        role: Role::Partner,
        admin_role: None,
    }
}

fn admin_user(admin: &Admin) -> AuthUser {
    AuthUser {
        id: admin.id,
        name: admin.username.clone(),
        email: admin.email.clone(),
        login: admin.username.clone(),
        role: Role::Admin,
        admin_role: Some(admin.role),
    }
}

fn require_credentials(login_field: &str, login: &str, password: &str) -> Result<(), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if login.trim().is_empty() {
        errors.add(login_field, format!("{} is required", login_field));
    }
    if password.is_empty() {
        errors.add("password", "password is required");
    }
    errors.finish()
}

fn failure_reason(err: &AuthError) -> Option<&'static str> {
    match err {
        AuthError::InvalidCredentials => Some("invalid_credentials"),
        AuthError::Locked { .. } => Some("locked"),
        AuthError::Inactive => Some("inactive"),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Alias or email
    #[serde(alias = "alias", alias = "email")]
    pub login: String,
    pub password: String,
}

/// Partner login by alias or email
pub async fn login(
    State(state): State<Arc<AppState>>,
    ctx: AuditContext,
    Json(request): Json<LoginRequest>,
) -> Result<Json<ApiResponse<AuthSession>>, ApiError> {
    require_credentials("login", &request.login, &request.password)?;

    match state
        .auth
        .authenticate_partner(&request.login, &request.password, Utc::now())
        .await
    {
        Ok(session) => {
            let entry = ctx
                .actor(actor_types::PARTNER, Some(session.user.id), Some(&session.user.name), actions::PARTNER_LOGIN)
                .on(entity_types::PARTNER, session.user.id);
            audit_log(&state, entry).await;
            tracing::info!(partner_id = session.user.id, "Partner logged in");
            Ok(ok(session))
        }
        Err(e) => {
            if let Some(reason) = failure_reason(&e) {
                let entry = ctx
                    .actor(actor_types::PARTNER, None, Some(request.login.trim()), actions::PARTNER_LOGIN_FAILED)
                    .with_details(serde_json::json!({ "reason": reason }));
                audit_log(&state, entry).await;
            }
            Err(e.into())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AdminLoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn admin_login(
    State(state): State<Arc<AppState>>,
    ctx: AuditContext,
    Json(request): Json<AdminLoginRequest>,
) -> Result<Json<ApiResponse<AuthSession>>, ApiError> {
    require_credentials("username", &request.username, &request.password)?;

    match state
        .auth
        .authenticate_admin(&request.username, &request.password, Utc::now())
        .await
    {
        Ok(session) => {
            let entry = ctx
                .actor(actor_types::ADMIN, Some(session.user.id), Some(&session.user.name), actions::ADMIN_LOGIN)
                .on(entity_types::ADMIN, session.user.id);
            audit_log(&state, entry).await;
            tracing::info!(admin_id = session.user.id, "Admin logged in");
            Ok(ok(session))
        }
        Err(e) => {
            if let Some(reason) = failure_reason(&e) {
                let entry = ctx
                    .actor(actor_types::ADMIN, None, Some(request.username.trim()), actions::ADMIN_LOGIN_FAILED)
                    .with_details(serde_json::json!({ "reason": reason }));
                audit_log(&state, entry).await;
            }
            Err(e.into())
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

const FORGOT_PASSWORD_REPLY: &str = "If an account with this email exists, a password reset link has been sent";

/// Start password recovery. The lookup and delivery run in the background
/// so the reply and its timing are the same whether or not the email
/// belongs to a partner.
pub async fn forgot_password(
    State(state): State<Arc<AppState>>,
    ctx: AuditContext,
    Json(request): Json<ForgotPasswordRequest>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    let email = request.email.trim().to_string();
    validate_email(&email).map_err(|e| ApiError::validation_field("email", e))?;

    tokio::spawn(send_recovery_link(state, ctx, email));

    Ok(ok(MessageResponse {
        message: FORGOT_PASSWORD_REPLY.to_string(),
    }))
}

async fn send_recovery_link(state: Arc<AppState>, ctx: AuditContext, email: String) {
    let partner = match state.store.find_partner_by_email(&email).await {
        Ok(Some(partner)) => partner,
        Ok(None) => {
            tracing::debug!("Password reset requested for unknown email");
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Password reset lookup failed");
            return;
        }
    };
    if !partner.active {
        tracing::info!(partner_id = partner.id, "Password reset requested for inactive partner, ignored");
        return;
    }

    let token = match state.auth.issue_reset_token(partner.id, Utc::now()).await {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!(partner_id = partner.id, error = %e, "Failed to issue password reset token");
            return;
        }
    };
    let delivery = state
        .notifier
        .password_reset(
            Recipient {
                name: &partner.name,
                email: Some(&partner.email),
                telegram: partner.telegram.as_deref(),
            },
            &token,
            state.auth.reset_ttl_minutes(),
        )
        .await;
    tracing::info!(partner_id = partner.id, email = ?delivery.email, telegram = ?delivery.telegram, "Password reset requested");

    let entry = ctx
        .partner(&partner, actions::PASSWORD_RESET_REQUEST)
        .on(entity_types::PARTNER, partner.id);
    audit_log(&state, entry).await;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetTokenInfo {
    pub email: String,
    pub name: String,
}

/// Check a reset link before showing the password form
pub async fn check_reset_token(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<ApiResponse<ResetTokenInfo>>, ApiError> {
    let owner = state
        .store
        .reset_token_owner(&hash_token(&token), Utc::now())
        .await?
        .ok_or_else(|| ApiError::from(AuthError::InvalidResetToken))?;

    Ok(ok(ResetTokenInfo {
        email: owner.email,
        name: owner.name,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

pub async fn reset_password(
    State(state): State<Arc<AppState>>,
    ctx: AuditContext,
    Json(request): Json<ResetPasswordRequest>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if request.token.trim().is_empty() {
        errors.add("token", "token is required");
    }
    errors.check("password", validate_partner_password(&request.password));
    errors.finish()?;

    let partner_id = state
        .auth
        .reset_password(request.token.trim(), &request.password, Utc::now())
        .await?;

    let entry = ctx
        .actor(actor_types::PARTNER, Some(partner_id), None, actions::PASSWORD_RESET)
        .on(entity_types::PARTNER, partner_id);
    audit_log(&state, entry).await;

    Ok(ok(MessageResponse {
        message: "Password has been set, you can now log in".to_string(),
    }))
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub user: AuthUser,
}

/// Token introspection: who does this token belong to right now
pub async fn verify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<VerifyResponse>>, ApiError> {
    let token = extract_token(&headers).ok_or_else(|| ApiError::unauthorized("Access token required"))?;
    let claims = state.auth.tokens().verify(token)?;

    let user = match claims.role {
        Role::Partner => partner_user(&load_partner(&state, &claims).await?),
        Role::Admin => admin_user(&load_admin(&state, &claims).await?),
    };
    Ok(ok(VerifyResponse { user }))
}
