//! Administrator accounts. Every route here requires a super-admin.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::auth::{hash_password, AuthError};
use crate::db::{
    actions, entity_types, AdminResponse, AdminRole, ChangePasswordRequest, CreateAdminRequest,
    NewAdmin, UpdateAdminRequest,
};
use crate::AppState;

use super::audit::{audit_log, AuditContext};
use super::auth::{MessageResponse, SuperAdmin};
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{non_empty, validate_admin_password, validate_email, validate_username};
use super::{ok, ApiResponse};

fn validate_account(username: &str, email: Option<&str>) -> ValidationErrorBuilder {
    let mut errors = ValidationErrorBuilder::new();
    errors.check("username", validate_username(username));
    if let Some(email) = email {
        errors.check("email", validate_email(email));
    }
    errors
}

#[derive(Debug, Serialize)]
pub struct AdminsResponse {
    pub admins: Vec<AdminResponse>,
}

pub async fn list_admins(
    State(state): State<Arc<AppState>>,
    SuperAdmin(_admin): SuperAdmin,
) -> Result<Json<ApiResponse<AdminsResponse>>, ApiError> {
    let admins = state.store.list_admins().await?;
    Ok(ok(AdminsResponse {
        admins: admins.into_iter().map(AdminResponse::from).collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct AdminAccountResponse {
    pub admin: AdminResponse,
}

pub async fn create_admin(
    State(state): State<Arc<AppState>>,
    SuperAdmin(actor): SuperAdmin,
    ctx: AuditContext,
    Json(request): Json<CreateAdminRequest>,
) -> Result<Json<ApiResponse<AdminAccountResponse>>, ApiError> {
    let username = request.username.trim().to_string();
    let email = non_empty(request.email.as_deref());

    let mut errors = validate_account(&username, email.as_deref());
    errors.check("password", validate_admin_password(&request.password));
    errors.finish()?;

    let role = request.role.unwrap_or(AdminRole::Admin);
    let password_hash = hash_password(&request.password).map_err(AuthError::from)?;
    let id = state
        .store
        .create_admin(
            &NewAdmin {
                username,
                email,
                password_hash,
                role,
            },
            Utc::now(),
        )
        .await?;
    let admin = state
        .store
        .get_admin(id)
        .await?
        .ok_or_else(|| ApiError::internal("Created admin could not be read back"))?;

    let entry = ctx
        .admin(&actor, actions::ADMIN_CREATE)
        .on(entity_types::ADMIN, id)
        .with_details(serde_json::json!({ "username": admin.username, "role": role }));
    audit_log(&state, entry).await;
    tracing::info!(admin_id = id, role = %role, "Admin created");

    Ok(ok(AdminAccountResponse { admin: admin.into() }))
}

pub async fn update_admin(
    State(state): State<Arc<AppState>>,
    SuperAdmin(actor): SuperAdmin,
    ctx: AuditContext,
    Path(id): Path<i64>,
    Json(request): Json<UpdateAdminRequest>,
) -> Result<Json<ApiResponse<AdminAccountResponse>>, ApiError> {
    let username = request.username.trim().to_string();
    let email = non_empty(request.email.as_deref());
    validate_account(&username, email.as_deref()).finish()?;

    let current = state
        .store
        .get_admin(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Admin not found"))?;
    let role = request.role.unwrap_or(current.role);
    if id == actor.id && role != AdminRole::SuperAdmin {
        return Err(ApiError::bad_request("You cannot remove your own super-admin role"));
    }

    if !state
        .store
        .update_admin(id, &username, email.as_deref(), role)
        .await?
    {
        return Err(ApiError::not_found("Admin not found"));
    }
    let admin = state
        .store
        .get_admin(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Admin not found"))?;

    let entry = ctx
        .admin(&actor, actions::ADMIN_UPDATE)
        .on(entity_types::ADMIN, id)
        .with_details(serde_json::json!({
            "username": admin.username,
            "role": role,
            "previousRole": current.role,
        }));
    audit_log(&state, entry).await;

    Ok(ok(AdminAccountResponse { admin: admin.into() }))
}

pub async fn change_password(
    State(state): State<Arc<AppState>>,
    SuperAdmin(actor): SuperAdmin,
    ctx: AuditContext,
    Path(id): Path<i64>,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    validate_admin_password(&request.password).map_err(|e| ApiError::validation_field("password", e))?;

    let password_hash = hash_password(&request.password).map_err(AuthError::from)?;
    if !state.store.set_admin_password(id, &password_hash).await? {
        return Err(ApiError::not_found("Admin not found"));
    }

    let entry = ctx.admin(&actor, actions::ADMIN_PASSWORD).on(entity_types::ADMIN, id);
    audit_log(&state, entry).await;

    Ok(ok(MessageResponse {
        message: "Password changed".to_string(),
    }))
}

pub async fn delete_admin(
    State(state): State<Arc<AppState>>,
    SuperAdmin(actor): SuperAdmin,
    ctx: AuditContext,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    if id == actor.id {
        return Err(ApiError::bad_request("You cannot delete your own account"));
    }
    let target = state
        .store
        .get_admin(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Admin not found"))?;
    if target.is_super_admin() || !state.store.delete_admin(id).await? {
        return Err(ApiError::bad_request("Super-admin accounts cannot be deleted"));
    }

    let entry = ctx
        .admin(&actor, actions::ADMIN_DELETE)
        .on(entity_types::ADMIN, id)
        .with_details(serde_json::json!({ "username": target.username }));
    audit_log(&state, entry).await;
    tracing::info!(admin_id = id, "Admin deleted");

    Ok(ok(MessageResponse {
        message: "Admin deleted".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use chrono::Utc;
    use serde_json::json;

    use crate::db::AdminRole;
    use crate::test_support::{
        admin_session, body_json, delete, get, post_json, put_json, seed_admin, test_state,
    };

    #[tokio::test]
    async fn test_admin_management_requires_super_admin() {
        let (state, _mail) = test_state().await;
        let (_, token) = admin_session(&state, "plain", AdminRole::Admin).await;

        let response = get(&state, "/api/admin/admins", Some(&token)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = json!({ "username": "intruder", "password": "longenough" });
        let response = post_json(&state, "/api/admin/admins", Some(&token), body).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(state.store.get_admin_by_username("intruder").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_update_and_change_password() {
        let (state, _mail) = test_state().await;
        let (_, token) = admin_session(&state, "root", AdminRole::SuperAdmin).await;

        let body = json!({ "username": "operator", "password": "short" });
        let response = post_json(&state, "/api/admin/admins", Some(&token), body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = json!({ "username": "operator", "password": "operator-pass", "email": "op@example.com" });
        let response = post_json(&state, "/api/admin/admins", Some(&token), body).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["admin"]["role"], "admin");
        assert!(body["admin"].get("passwordHash").is_none());
        let id = body["admin"]["id"].as_i64().unwrap();

        let body = json!({ "username": "operator", "password": "operator-pass" });
        let response = post_json(&state, "/api/admin/admins", Some(&token), body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let uri = format!("/api/admin/admins/{}", id);
        let body = json!({ "username": "operator2", "role": "superadmin" });
        let body = body_json(put_json(&state, &uri, Some(&token), body).await).await;
        assert_eq!(body["admin"]["username"], "operator2");
        assert_eq!(body["admin"]["role"], "superadmin");

        let body = json!({ "password": "brand-new-pass" });
        let response = put_json(&state, &format!("{}/password", uri), Some(&token), body).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state
            .auth
            .authenticate_admin("operator2", "brand-new-pass", Utc::now())
            .await
            .is_ok());

        let body = body_json(get(&state, "/api/admin/admins", Some(&token)).await).await;
        assert_eq!(body["admins"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let (state, _mail) = test_state().await;
        let (root, token) = admin_session(&state, "root", AdminRole::SuperAdmin).await;
        let other_super = seed_admin(&state, "second", "adminpass1", AdminRole::SuperAdmin).await;
        let plain = seed_admin(&state, "plain", "adminpass1", AdminRole::Admin).await;

        let response = delete(&state, &format!("/api/admin/admins/{}", root), Some(&token)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = delete(&state, &format!("/api/admin/admins/{}", other_super), Some(&token)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.store.get_admin(other_super).await.unwrap().is_some());

        let response = delete(&state, &format!("/api/admin/admins/{}", plain), Some(&token)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.store.get_admin(plain).await.unwrap().is_none());

        let response = delete(&state, &format!("/api/admin/admins/{}", plain), Some(&token)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cannot_demote_self() {
        let (state, _mail) = test_state().await;
        let (root, token) = admin_session(&state, "root", AdminRole::SuperAdmin).await;
        let body = json!({ "username": "root", "role": "admin" });
        let response = put_json(&state, &format!("/api/admin/admins/{}", root), Some(&token), body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
