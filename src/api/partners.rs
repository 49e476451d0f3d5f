//! Partner management for administrators.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;

use crate::auth::{hash_password, AuthError};
use crate::db::{
    actions, entity_types, ClaimRecord, CreatePartnerRequest, NewPartner, Partner, PartnerUpdate,
    UpdatePartnerRequest,
};
use crate::notifications::{Delivery, Recipient};
use crate::AppState;

use super::audit::{audit_log, AuditContext};
use super::auth::{CurrentAdmin, MessageResponse};
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{
    alias_base, non_empty, validate_alias, validate_email, validate_name, validate_partner_password,
    validate_telegram,
};
use super::{ok, ApiResponse};

const ALIAS_ATTEMPTS: usize = 100;

/// Field checks shared by create and update
fn validate_partner_fields(
    name: &str,
    email: &str,
    telegram: Option<&str>,
    alias: Option<&str>,
    password: Option<&str>,
) -> Result<(), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    errors
        .check("name", validate_name(name))
        .check("email", validate_email(email))
        .check("telegram", validate_telegram(telegram));
    if let Some(alias) = alias {
        errors.check("alias", validate_alias(alias));
    }
    if let Some(password) = password {
        errors.check("password", validate_partner_password(password));
    }
    errors.finish()
}

/// A free alias: the requested one, or one derived from the email
async fn resolve_alias(state: &AppState, requested: Option<String>, email: &str) -> Result<String, ApiError> {
    if let Some(alias) = requested {
        if state.store.alias_exists(&alias).await? {
            return Err(ApiError::conflict("This alias is already taken"));
        }
        return Ok(alias);
    }

    let base = alias_base(email);
    if !state.store.alias_exists(&base).await? {
        return Ok(base);
    }
    for _ in 0..ALIAS_ATTEMPTS {
        let candidate = format!("{}{}", base, rand::rng().random_range(100..10_000));
        if !state.store.alias_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(ApiError::conflict("Could not generate a free alias, please choose one"))
}

fn hash(password: Option<&str>) -> Result<Option<String>, ApiError> {
    password
        .map(|p| hash_password(p).map_err(AuthError::from))
        .transpose()
        .map_err(ApiError::from)
}

#[derive(Debug, Serialize)]
pub struct PartnersResponse {
    pub partners: Vec<Partner>,
}

pub async fn list_partners(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(_admin): CurrentAdmin,
) -> Result<Json<ApiResponse<PartnersResponse>>, ApiError> {
    let partners = state.store.list_partners().await?;
    Ok(ok(PartnersResponse { partners }))
}

#[derive(Debug, Serialize)]
pub struct PartnerResponse {
    pub partner: Partner,
}

pub async fn get_partner(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(_admin): CurrentAdmin,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<PartnerResponse>>, ApiError> {
    let partner = state
        .store
        .get_partner(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Partner not found"))?;
    Ok(ok(PartnerResponse { partner }))
}

#[derive(Debug, Serialize)]
pub struct CreatePartnerResponse {
    pub message: String,
    pub partner: Partner,
    /// Outcome of the invitation with the password setup link
    pub invitation: Delivery,
}

/// Create a partner and invite them to set a password
pub async fn create_partner(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(admin): CurrentAdmin,
    ctx: AuditContext,
    Json(request): Json<CreatePartnerRequest>,
) -> Result<Json<ApiResponse<CreatePartnerResponse>>, ApiError> {
    let name = request.name.trim().to_string();
    let email = request.email.trim().to_string();
    let telegram = non_empty(request.telegram.as_deref());
    let alias = non_empty(request.alias.as_deref());
    let password = request.password.as_deref().filter(|p| !p.is_empty());

    validate_partner_fields(&name, &email, telegram.as_deref(), alias.as_deref(), password)?;

    let alias = resolve_alias(&state, alias, &email).await?;
    let partner = state
        .store
        .create_partner(
            &NewPartner {
                name,
                email,
                telegram,
                alias,
                birth_date: request.birth_date,
                password_hash: hash(password)?,
            },
            Utc::now(),
        )
        .await?;

    let token = state.auth.issue_reset_token(partner.id, Utc::now()).await?;
    let invitation = state
        .notifier
        .invitation(
            Recipient {
                name: &partner.name,
                email: Some(&partner.email),
                telegram: partner.telegram.as_deref(),
            },
            &partner.alias,
            &token,
        )
        .await;

    let entry = ctx
        .admin(&admin, actions::PARTNER_CREATE)
        .on(entity_types::PARTNER, partner.id)
        .with_details(serde_json::json!({ "alias": partner.alias, "email": partner.email }));
    audit_log(&state, entry).await;
    tracing::info!(partner_id = partner.id, alias = %partner.alias, "Partner created");

    Ok(ok(CreatePartnerResponse {
        message: "Partner created".to_string(),
        partner,
        invitation,
    }))
}

pub async fn update_partner(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(admin): CurrentAdmin,
    ctx: AuditContext,
    Path(id): Path<i64>,
    Json(request): Json<UpdatePartnerRequest>,
) -> Result<Json<ApiResponse<PartnerResponse>>, ApiError> {
    let name = request.name.trim().to_string();
    let email = request.email.trim().to_string();
    let telegram = non_empty(request.telegram.as_deref());
    let alias = non_empty(request.alias.as_deref());
    let password = request.password.as_deref().filter(|p| !p.is_empty());

    validate_partner_fields(&name, &email, telegram.as_deref(), alias.as_deref(), password)?;

    let partner = state
        .store
        .update_partner(
            id,
            &PartnerUpdate {
                name,
                email,
                telegram,
                birth_date: request.birth_date,
                active: request.active,
                alias,
                password_hash: hash(password)?,
            },
        )
        .await?;

    let entry = ctx
        .admin(&admin, actions::PARTNER_UPDATE)
        .on(entity_types::PARTNER, id)
        .with_details(serde_json::json!({
            "active": partner.active,
            "passwordChanged": password.is_some(),
        }));
    audit_log(&state, entry).await;

    Ok(ok(PartnerResponse { partner }))
}

/// Remove a partner with their claims, documents and tokens
pub async fn delete_partner(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(admin): CurrentAdmin,
    ctx: AuditContext,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    let partner = state
        .store
        .get_partner(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Partner not found"))?;
    if !state.store.delete_partner(id).await? {
        return Err(ApiError::not_found("Partner not found"));
    }

    let entry = ctx
        .admin(&admin, actions::PARTNER_DELETE)
        .on(entity_types::PARTNER, id)
        .with_details(serde_json::json!({ "alias": partner.alias, "name": partner.name }));
    audit_log(&state, entry).await;
    tracing::info!(partner_id = id, "Partner deleted");

    Ok(ok(MessageResponse {
        message: "Partner deleted".to_string(),
    }))
}

#[derive(Debug, Serialize)]
pub struct PartnerDocumentsResponse {
    pub documents: Vec<ClaimRecord>,
}

/// Every claim of a partner, drafts included
pub async fn partner_documents(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(_admin): CurrentAdmin,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<PartnerDocumentsResponse>>, ApiError> {
    if state.store.get_partner(id).await?.is_none() {
        return Err(ApiError::not_found("Partner not found"));
    }
    let documents = state.store.list_partner_claims(id).await?;
    Ok(ok(PartnerDocumentsResponse { documents }))
}
