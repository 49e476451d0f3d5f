//! Claim administration: uploads, review, publication, and the dashboard.

use axum::{
    extract::{multipart::MultipartError, Multipart, Path, Query, State},
    http::StatusCode,
    response::Response,
    Json,
};
use chrono::{Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::{actions, entity_types, Admin, AdminStats, BirthdayEntry, ClaimRecord};
use crate::engine::birthdays::{sort_by_calendar, BirthdayReport};
use crate::ingest::workbook::{SheetPreview, Workbook};
use crate::ingest::{BatchReport, PartnerSource, UploadedFile};
use crate::publish::PublishReport;
use crate::AppState;

use super::audit::{audit_log, AuditContext};
use super::auth::{CurrentAdmin, MessageResponse};
use super::error::ApiError;
use super::{attachment, ok, ApiResponse};

// ---------------------------------------------------------------------------
// Uploads
// ---------------------------------------------------------------------------

/// Files and form fields of an upload request
#[derive(Debug, Default)]
struct UploadForm {
    files: Vec<UploadedFile>,
    partner_ids: Option<String>,
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::payload_too_large("Upload exceeds the request size limit")
    } else {
        ApiError::bad_request(format!("Invalid multipart body: {}", err.body_text()))
    }
}

async fn read_upload(mut multipart: Multipart, max_files: usize) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        match field.name() {
            Some("files") => {
                if form.files.len() >= max_files {
                    return Err(ApiError::bad_request(format!(
                        "Too many files, at most {} per request",
                        max_files
                    )));
                }
                let filename = field.file_name().unwrap_or("upload.xlsx").to_string();
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await.map_err(multipart_error)?.to_vec();
                form.files.push(UploadedFile {
                    filename,
                    content_type,
                    data,
                });
            }
            Some("partnerIds") => {
                form.partner_ids = Some(field.text().await.map_err(multipart_error)?);
            }
            _ => {}
        }
    }

    if form.files.is_empty() {
        return Err(ApiError::validation_field("files", "No files were uploaded"));
    }
    Ok(form)
}

/// `partnerIds` arrives as a JSON array of numbers or numeric strings,
/// or as a comma-separated list.
fn parse_partner_ids(raw: &str) -> Result<Vec<i64>, String> {
    let raw = raw.trim();
    if raw.starts_with('[') {
        let values: Vec<serde_json::Value> =
            serde_json::from_str(raw).map_err(|e| format!("partnerIds is not a valid list: {}", e))?;
        return values
            .iter()
            .map(|value| match value {
                serde_json::Value::Number(n) => n.as_i64(),
                serde_json::Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }
            .ok_or_else(|| format!("Invalid partner id: {}", value)))
            .collect();
    }

    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(|_| format!("Invalid partner id: {}", s)))
        .collect()
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: String,
    #[serde(flatten)]
    pub report: BatchReport,
}

async fn finish_upload(
    state: &AppState,
    ctx: &AuditContext,
    admin: &Admin,
    mode: &str,
    report: BatchReport,
) -> Json<ApiResponse<UploadResponse>> {
    let claim_ids: Vec<i64> = report.results.iter().map(|r| r.claim_id).collect();
    let entry = ctx.admin(admin, actions::UPLOAD_FILES).with_details(serde_json::json!({
        "mode": mode,
        "claimIds": claim_ids,
        "uploaded": report.results.len(),
        "failed": report.errors.len(),
    }));
    audit_log(state, entry).await;

    ok(UploadResponse {
        message: format!(
            "Processed files: {}, errors: {}",
            report.results.len(),
            report.errors.len()
        ),
        report,
    })
}

/// Upload with the owning partner of each file given in `partnerIds`
pub async fn upload_files(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(admin): CurrentAdmin,
    ctx: AuditContext,
    multipart: Multipart,
) -> Result<Json<ApiResponse<UploadResponse>>, ApiError> {
    let form = read_upload(multipart, state.config.upload.max_files).await?;

    let partner_ids = parse_partner_ids(form.partner_ids.as_deref().unwrap_or_default())
        .map_err(|e| ApiError::validation_field("partnerIds", e))?;
    if partner_ids.len() != form.files.len() {
        return Err(ApiError::validation_field(
            "partnerIds",
            format!(
                "Got {} partner ids for {} files",
                partner_ids.len(),
                form.files.len()
            ),
        ));
    }

    let batch = form
        .files
        .into_iter()
        .zip(partner_ids)
        .map(|(file, id)| (file, PartnerSource::Explicit(id)))
        .collect();
    let report = state.ingestor.ingest_batch(batch, Utc::now()).await;

    Ok(finish_upload(&state, &ctx, &admin, "manual", report).await)
}

/// Upload where each file names its partner in the identity sheet
pub async fn auto_upload_files(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(admin): CurrentAdmin,
    ctx: AuditContext,
    multipart: Multipart,
) -> Result<Json<ApiResponse<UploadResponse>>, ApiError> {
    let form = read_upload(multipart, state.config.upload.max_files).await?;

    let batch = form
        .files
        .into_iter()
        .map(|file| (file, PartnerSource::FromSheet))
        .collect();
    let report = state.ingestor.ingest_batch(batch, Utc::now()).await;

    Ok(finish_upload(&state, &ctx, &admin, "auto", report).await)
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ClaimsResponse {
    pub claims: Vec<ClaimRecord>,
}

pub async fn unpublished_claims(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(_admin): CurrentAdmin,
) -> Result<Json<ApiResponse<ClaimsResponse>>, ApiError> {
    let claims = state.store.get_unpublished_claims().await?;
    Ok(ok(ClaimsResponse { claims }))
}

pub async fn published_claims(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(_admin): CurrentAdmin,
) -> Result<Json<ApiResponse<ClaimsResponse>>, ApiError> {
    let claims = state.store.get_published_claims().await?;
    Ok(ok(ClaimsResponse { claims }))
}

#[derive(Debug, Serialize)]
pub struct ExcelData {
    pub sheets: Vec<SheetPreview>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimDetailResponse {
    pub claim: ClaimRecord,
    /// Cell preview of the stored document, `null` when it cannot be read
    pub excel_data: Option<ExcelData>,
}

pub async fn get_claim(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(_admin): CurrentAdmin,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<ClaimDetailResponse>>, ApiError> {
    let claim = state
        .store
        .get_claim(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Claim not found"))?;

    let excel_data = match state.store.get_claim_document(id).await? {
        Some(document) => match Workbook::open(&document.content).and_then(|wb| wb.preview()) {
            Ok(sheets) => Some(ExcelData { sheets }),
            Err(e) => {
                tracing::warn!(claim_id = id, error = %e, "Stored document is not a readable workbook");
                None
            }
        },
        None => None,
    };

    Ok(ok(ClaimDetailResponse { claim, excel_data }))
}

pub async fn download_claim(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(admin): CurrentAdmin,
    ctx: AuditContext,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let document = state
        .store
        .get_claim_document(id)
        .await?
        .ok_or_else(|| ApiError::not_found("File not found"))?;

    let entry = ctx
        .admin(&admin, actions::DOWNLOAD_DOCUMENT)
        .on(entity_types::DOCUMENT, document.id)
        .with_details(serde_json::json!({ "claimId": id, "fileName": document.filename }));
    audit_log(&state, entry).await;

    Ok(attachment(&document.filename, &document.mime_type, document.content))
}

#[derive(Debug, Deserialize, Default)]
pub struct DeleteClaimQuery {
    #[serde(default)]
    pub force: bool,
}

/// Delete a claim with its document. Published claims need `?force=true`.
pub async fn delete_claim(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(admin): CurrentAdmin,
    ctx: AuditContext,
    Path(id): Path<i64>,
    Query(query): Query<DeleteClaimQuery>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    state.publisher.delete(id, query.force).await?;

    let entry = ctx
        .admin(&admin, actions::DELETE_CLAIM)
        .on(entity_types::CLAIM, id)
        .with_details(serde_json::json!({ "force": query.force }));
    audit_log(&state, entry).await;
    tracing::info!(claim_id = id, force = query.force, admin_id = admin.id, "Claim deleted");

    Ok(ok(MessageResponse {
        message: "Claim deleted".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimIdsRequest {
    #[serde(default)]
    pub claim_ids: Vec<i64>,
}

impl ClaimIdsRequest {
    fn ids(&self) -> Result<&[i64], ApiError> {
        if self.claim_ids.is_empty() {
            return Err(ApiError::validation_field("claimIds", "No claims selected"));
        }
        Ok(&self.claim_ids)
    }
}

pub async fn publish_claims(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(admin): CurrentAdmin,
    ctx: AuditContext,
    Json(request): Json<ClaimIdsRequest>,
) -> Result<Json<ApiResponse<PublishReport>>, ApiError> {
    let ids = request.ids()?;
    let report = state.publisher.publish(ids, Utc::now()).await?;

    let entry = ctx.admin(&admin, actions::PUBLISH_CLAIMS).with_details(serde_json::json!({
        "claimIds": ids,
        "publishedCount": report.published_count,
        "notified": report.notifications.len(),
        "skipped": report.skipped_partners.len(),
    }));
    audit_log(&state, entry).await;

    Ok(ok(report))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnpublishResponse {
    pub unpublished_count: u64,
}

pub async fn unpublish_claims(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(admin): CurrentAdmin,
    ctx: AuditContext,
    Json(request): Json<ClaimIdsRequest>,
) -> Result<Json<ApiResponse<UnpublishResponse>>, ApiError> {
    let ids = request.ids()?;
    let unpublished_count = state.publisher.unpublish(ids).await?;

    let entry = ctx.admin(&admin, actions::UNPUBLISH_CLAIMS).with_details(serde_json::json!({
        "claimIds": ids,
        "unpublishedCount": unpublished_count,
    }));
    audit_log(&state, entry).await;

    Ok(ok(UnpublishResponse { unpublished_count }))
}

// ---------------------------------------------------------------------------
// Dashboard
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub stats: AdminStats,
}

pub async fn stats(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(_admin): CurrentAdmin,
) -> Result<Json<ApiResponse<StatsResponse>>, ApiError> {
    let stats = state.store.admin_stats(Utc::now()).await?;
    Ok(ok(StatsResponse { stats }))
}

#[derive(Debug, Serialize)]
pub struct BirthdaysResponse {
    pub birthdays: Vec<BirthdayEntry>,
}

/// Partners with a birth date, in calendar order
pub async fn birthdays(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(_admin): CurrentAdmin,
) -> Result<Json<ApiResponse<BirthdaysResponse>>, ApiError> {
    let mut birthdays = state.store.partner_birthdays().await?;
    sort_by_calendar(&mut birthdays);
    Ok(ok(BirthdaysResponse { birthdays }))
}

#[derive(Debug, Deserialize, Default)]
pub struct BirthdayCheckQuery {
    /// Day to check, defaults to today in local time
    pub date: Option<NaiveDate>,
}

/// Run the birthday check now instead of waiting for the schedule
pub async fn check_birthdays(
    State(state): State<Arc<AppState>>,
    CurrentAdmin(admin): CurrentAdmin,
    ctx: AuditContext,
    Query(query): Query<BirthdayCheckQuery>,
) -> Result<Json<ApiResponse<BirthdayReport>>, ApiError> {
    let today = query.date.unwrap_or_else(|| Local::now().date_naive());
    let report = state.birthdays.run_once(today).await?;

    let entry = ctx.admin(&admin, actions::BIRTHDAY_CHECK).with_details(serde_json::json!({
        "date": report.date,
        "partners": report.partners.len(),
        "notification": report.notification,
    }));
    audit_log(&state, entry).await;

    Ok(ok(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;

    use crate::db::{AdminRole, AuditQuery, NewPartner, PartnerUpdate};
    use crate::test_support::{
        admin_session, body_bytes, body_json, claim_workbook, delete, get, partner_session,
        post_json, post_multipart, seed_claim, seed_partner, test_state,
    };

    const XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

    fn workbook(net: &str, inc: Option<i64>) -> Vec<u8> {
        let inc = inc.map(|id| format!("#{}", id));
        let mut pairs = vec![
            ("period from", "#46023"),
            ("period till", "#46053"),
            ("net", net),
            ("invoice", "#59000.00"),
            ("tax", "#9000.00"),
        ];
        if let Some(inc) = inc.as_deref() {
            pairs.push(("inc", inc));
        }
        claim_workbook(&pairs)
    }

    #[test]
    fn test_parse_partner_ids() {
        assert_eq!(parse_partner_ids("[1, \"2\", 3]").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_partner_ids(" 4,5 ").unwrap(), vec![4, 5]);
        assert_eq!(parse_partner_ids("").unwrap(), Vec::<i64>::new());
        assert!(parse_partner_ids("[1, true]").is_err());
        assert!(parse_partner_ids("1,x").is_err());
    }

    #[tokio::test]
    async fn test_upload_keeps_going_past_a_bad_file() {
        let (state, _mail) = test_state().await;
        let (_, token) = admin_session(&state, "root", AdminRole::Admin).await;
        let acme = seed_partner(&state, "acme", None).await;

        let broken = claim_workbook(&[("period from", "#46023"), ("net", "#1")]);
        let ids = format!("[{0},{0},{0}]", acme);
        let response = post_multipart(
            &state,
            "/api/admin/upload-files",
            Some(&token),
            &[("partnerIds", &ids)],
            &[
                ("files", "one.xlsx", XLSX, workbook("#50000.00", None)),
                ("files", "two.xlsx", XLSX, broken),
                ("files", "three.xlsx", XLSX, workbook("#100", None)),
            ],
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["results"].as_array().unwrap().len(), 2);
        let errors = body["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["fileName"], "two.xlsx");
        assert_eq!(errors[0]["error"], "Missing required fields: period till, invoice, tax");
        assert_eq!(body["results"][0]["amount"], "50000.00");
        assert_eq!(body["results"][0]["period"], "01.01.2026 - 31.01.2026");

        // Uploads start as drafts with the identity sheet stripped
        let claims = state.store.get_unpublished_claims().await.unwrap();
        assert_eq!(claims.len(), 2);
        let document = state.store.get_claim_document(claims[0].id).await.unwrap().unwrap();
        let names: Vec<String> = Workbook::open(&document.content)
            .unwrap()
            .sheet_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        assert_eq!(names, vec!["Report"]);
    }

    #[tokio::test]
    async fn test_upload_rejects_mismatched_partner_ids() {
        let (state, _mail) = test_state().await;
        let (_, token) = admin_session(&state, "root", AdminRole::Admin).await;

        let response = post_multipart(
            &state,
            "/api/admin/upload-files",
            Some(&token),
            &[("partnerIds", "[1, 2]")],
            &[("files", "one.xlsx", XLSX, workbook("#1", None))],
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = post_multipart(&state, "/api/admin/upload-files", Some(&token), &[], &[]).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.store.get_unpublished_claims().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_rejects_too_many_files() {
        let (state, _mail) = test_state().await;
        let (_, token) = admin_session(&state, "root", AdminRole::Admin).await;

        let max = state.config.upload.max_files;
        let files: Vec<(&str, &str, &str, Vec<u8>)> =
            (0..=max).map(|_| ("files", "f.xlsx", XLSX, Vec::new())).collect();
        let response = post_multipart(&state, "/api/admin/auto-upload-files", Some(&token), &[], &files).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_auto_upload_reads_partner_from_sheet() {
        let (state, _mail) = test_state().await;
        let (_, token) = admin_session(&state, "root", AdminRole::Admin).await;
        let acme = seed_partner(&state, "acme", None).await;

        let response = post_multipart(
            &state,
            "/api/admin/auto-upload-files",
            Some(&token),
            &[],
            &[
                ("files", "acme.xlsx", XLSX, workbook("#10", Some(acme))),
                ("files", "ghost.xlsx", XLSX, workbook("#10", Some(9999))),
                ("files", "anon.xlsx", XLSX, workbook("#10", None)),
            ],
        )
        .await;
        let body = body_json(response).await;
        assert_eq!(body["results"].as_array().unwrap().len(), 1);
        assert_eq!(body["results"][0]["partnerId"], acme);
        assert_eq!(body["results"][0]["partnerName"], "ACME");
        let errors: Vec<&str> = body["errors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["error"].as_str().unwrap())
            .collect();
        assert_eq!(
            errors,
            vec!["Partner 9999 not found", "Field \"inc\" not found in sheet \"partner\""]
        );

        let page = state
            .store
            .list_audit(&AuditQuery {
                action: Some(actions::UPLOAD_FILES.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_upload_requires_admin() {
        let (state, _mail) = test_state().await;
        let (_, partner_token) = partner_session(&state, "acme").await;
        let response = post_multipart(
            &state,
            "/api/admin/auto-upload-files",
            Some(&partner_token),
            &[],
            &[("files", "a.xlsx", XLSX, workbook("#1", None))],
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_publish_notifies_and_skips_repeats() {
        let (state, mail) = test_state().await;
        let (_, token) = admin_session(&state, "root", AdminRole::Admin).await;
        let acme = seed_partner(&state, "acme", Some("secret1")).await;
        let (first, _) = seed_claim(&state, acme, "100", "A.xlsx", false).await;
        let (second, _) = seed_claim(&state, acme, "200", "B.xlsx", false).await;

        let body = serde_json::json!({ "claimIds": [first, second, 9999] });
        let response = post_json(&state, "/api/admin/publish-claims", Some(&token), body).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["publishedCount"], 2);
        assert_eq!(body["notifications"][0]["partnerId"], acme);
        assert_eq!(body["notifications"][0]["documents"], 2);
        assert_eq!(body["notifications"][0]["email"]["status"], "sent");
        assert_eq!(mail.sent().len(), 1);

        // Already published: nothing moves, nobody is mailed again
        let body = serde_json::json!({ "claimIds": [first] });
        let body = body_json(post_json(&state, "/api/admin/publish-claims", Some(&token), body).await).await;
        assert_eq!(body["publishedCount"], 0);
        assert_eq!(mail.sent().len(), 1);

        let body = serde_json::json!({ "claimIds": [first] });
        let body = body_json(post_json(&state, "/api/admin/unpublish-claims", Some(&token), body).await).await;
        assert_eq!(body["unpublishedCount"], 1);

        let response = post_json(
            &state,
            "/api/admin/publish-claims",
            Some(&token),
            serde_json::json!({ "claimIds": [] }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_publish_skips_inactive_partner() {
        let (state, mail) = test_state().await;
        let (_, token) = admin_session(&state, "root", AdminRole::Admin).await;
        let acme = seed_partner(&state, "acme", Some("secret1")).await;
        state
            .store
            .update_partner(
                acme,
                &PartnerUpdate {
                    name: "ACME".to_string(),
                    email: "acme@example.com".to_string(),
                    telegram: None,
                    birth_date: None,
                    active: false,
                    alias: None,
                    password_hash: None,
                },
            )
            .await
            .unwrap();
        let (claim, _) = seed_claim(&state, acme, "100", "A.xlsx", false).await;

        let body = serde_json::json!({ "claimIds": [claim] });
        let body = body_json(post_json(&state, "/api/admin/publish-claims", Some(&token), body).await).await;
        assert_eq!(body["publishedCount"], 1);
        assert_eq!(body["notifications"].as_array().unwrap().len(), 0);
        assert_eq!(body["skippedPartners"][0]["partnerId"], acme);
        assert!(mail.sent().is_empty());
    }

    #[tokio::test]
    async fn test_delete_published_claim_needs_force() {
        let (state, _mail) = test_state().await;
        let (_, token) = admin_session(&state, "root", AdminRole::Admin).await;
        let acme = seed_partner(&state, "acme", None).await;
        let (claim, _) = seed_claim(&state, acme, "100", "A.xlsx", true).await;

        let uri = format!("/api/admin/claims/{}", claim);
        let response = delete(&state, &uri, Some(&token)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "conflict");

        let response = delete(&state, &format!("{}?force=true", uri), Some(&token)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.store.get_claim_document(claim).await.unwrap().is_none());

        let response = delete(&state, &uri, Some(&token)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_claim_detail_and_download() {
        let (state, _mail) = test_state().await;
        let (_, token) = admin_session(&state, "root", AdminRole::Admin).await;
        let acme = seed_partner(&state, "acme", None).await;

        post_multipart(
            &state,
            "/api/admin/upload-files",
            Some(&token),
            &[("partnerIds", &format!("[{}]", acme))],
            &[("files", "January.xlsx", XLSX, workbook("#10", None))],
        )
        .await;
        let claim = state.store.get_unpublished_claims().await.unwrap()[0].id;

        let body = body_json(get(&state, &format!("/api/admin/claims/{}", claim), Some(&token)).await).await;
        assert_eq!(body["claim"]["partnerName"], "ACME");
        assert_eq!(body["claim"]["document"]["fileName"], "January.xlsx");
        assert_eq!(body["excelData"]["sheets"][0]["name"], "Report");
        assert_eq!(body["excelData"]["sheets"].as_array().unwrap().len(), 1);

        // Seeded documents are plain bytes, so there is no preview
        let (plain, _) = seed_claim(&state, acme, "1", "plain.xlsx", false).await;
        let body = body_json(get(&state, &format!("/api/admin/claims/{}", plain), Some(&token)).await).await;
        assert!(body["excelData"].is_null());

        let response = get(&state, &format!("/api/admin/claims/{}/download", plain), Some(&token)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], XLSX);
        assert_eq!(body_bytes(response).await.as_ref(), b"content of plain.xlsx");

        let response = get(&state, "/api/admin/claims/9999", Some(&token)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_claim_lists_and_stats() {
        let (state, _mail) = test_state().await;
        let (_, token) = admin_session(&state, "root", AdminRole::Admin).await;
        let acme = seed_partner(&state, "acme", None).await;
        seed_claim(&state, acme, "1", "a.xlsx", false).await;
        seed_claim(&state, acme, "2", "b.xlsx", true).await;
        seed_claim(&state, acme, "3", "c.xlsx", true).await;

        let body = body_json(get(&state, "/api/admin/unpublished-claims", Some(&token)).await).await;
        assert_eq!(body["claims"].as_array().unwrap().len(), 1);
        let body = body_json(get(&state, "/api/admin/published-claims", Some(&token)).await).await;
        assert_eq!(body["claims"].as_array().unwrap().len(), 2);

        let body = body_json(get(&state, "/api/admin/stats", Some(&token)).await).await;
        assert_eq!(body["stats"]["totalPartners"], 1);
        assert_eq!(body["stats"]["unpublishedClaims"], 1);
        assert_eq!(body["stats"]["publishedClaims"], 2);
        assert_eq!(body["stats"]["publishedThisMonth"], 2);
    }

    #[tokio::test]
    async fn test_birthdays_list_and_check() {
        let (state, _mail) = test_state().await;
        let (_, token) = admin_session(&state, "root", AdminRole::Admin).await;
        for (alias, birth) in [("winter", (1990, 12, 5)), ("spring", (1985, 3, 14)), ("none", (0, 0, 0))] {
            state
                .store
                .create_partner(
                    &NewPartner {
                        name: alias.to_uppercase(),
                        email: format!("{}@example.com", alias),
                        telegram: None,
                        alias: alias.to_string(),
                        birth_date: NaiveDate::from_ymd_opt(birth.0, birth.1, birth.2),
                        password_hash: None,
                    },
                    Utc::now(),
                )
                .await
                .unwrap();
        }

        let body = body_json(get(&state, "/api/admin/birthdays", Some(&token)).await).await;
        let names: Vec<&str> = body["birthdays"]
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["SPRING", "WINTER"]);

        let response = post_json(
            &state,
            "/api/admin/birthdays/check?date=2026-03-14",
            Some(&token),
            serde_json::json!({}),
        )
        .await;
        let body = body_json(response).await;
        assert_eq!(body["date"], "2026-03-14");
        assert_eq!(body["partners"][0]["name"], "SPRING");

        let page = state
            .store
            .list_audit(&AuditQuery {
                action: Some(actions::BIRTHDAY_CHECK.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }
}
