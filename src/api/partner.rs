//! Partner self-service: profile, published documents and their totals.
//!
//! Every handler takes [`CurrentPartner`] and only ever reads claims of that
//! partner. Drafts are invisible here; the store scopes document fetches to
//! published claims of the caller.

use axum::{
    extract::{Path, Query, State},
    response::Response,
    Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

use crate::db::{
    actions, entity_types, history_page, ClaimRecord, HistoryQuery, Pagination, PartnerProfile,
    PartnerStats, SearchQuery,
};
use crate::AppState;

use super::audit::{audit_log, AuditContext};
use super::auth::CurrentPartner;
use super::error::ApiError;
use super::{attachment, ok, ApiResponse};

/// A published claim as its partner sees it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartnerDocument {
    /// Claim id
    pub id: i64,
    pub document_id: Option<i64>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub date_beg: NaiveDate,
    pub date_end: NaiveDate,
    pub period: String,
    pub amount: Decimal,
    pub pay_amount: Decimal,
    pub tax_amount: Decimal,
    pub doc_type: Option<String>,
    pub full_name: Option<String>,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl From<ClaimRecord> for PartnerDocument {
    fn from(claim: ClaimRecord) -> Self {
        let period = claim.period_label();
        Self {
            id: claim.id,
            document_id: claim.document.as_ref().map(|d| d.id),
            file_name: claim.document.as_ref().map(|d| d.filename.clone()),
            file_size: claim.document.as_ref().map(|d| d.size),
            date_beg: claim.period_start,
            date_end: claim.period_end,
            period,
            amount: claim.amount,
            pay_amount: claim.pay_amount,
            tax_amount: claim.tax_amount,
            doc_type: claim.doc_type,
            full_name: claim.full_name,
            currency: claim.currency,
            created_at: claim.created_at,
            published_at: claim.published_at,
        }
    }
}

fn into_documents(claims: Vec<ClaimRecord>) -> Vec<PartnerDocument> {
    claims.into_iter().map(PartnerDocument::from).collect()
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub profile: PartnerProfile,
}

pub async fn profile(CurrentPartner(partner): CurrentPartner) -> Json<ApiResponse<ProfileResponse>> {
    ok(ProfileResponse {
        profile: partner.into(),
    })
}

#[derive(Debug, Serialize)]
pub struct DocumentsResponse {
    pub documents: Vec<PartnerDocument>,
}

/// Published documents, newest publication first
pub async fn documents(
    State(state): State<Arc<AppState>>,
    CurrentPartner(partner): CurrentPartner,
    ctx: AuditContext,
) -> Result<Json<ApiResponse<DocumentsResponse>>, ApiError> {
    let claims = state.store.get_partner_claims(partner.id).await?;

    let entry = ctx
        .partner(&partner, actions::VIEW_DOCUMENTS)
        .with_details(serde_json::json!({ "count": claims.len() }));
    audit_log(&state, entry).await;

    Ok(ok(DocumentsResponse {
        documents: into_documents(claims),
    }))
}

#[derive(Debug, Serialize)]
pub struct DocumentResponse {
    pub document: PartnerDocument,
}

/// One published claim by claim id
pub async fn document(
    State(state): State<Arc<AppState>>,
    CurrentPartner(partner): CurrentPartner,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<DocumentResponse>>, ApiError> {
    let claim = state
        .store
        .get_claim(id)
        .await?
        .filter(|c| c.partner_id == partner.id && c.is_published())
        .ok_or_else(|| ApiError::not_found("Document not found"))?;

    Ok(ok(DocumentResponse {
        document: claim.into(),
    }))
}

/// Download by document id
pub async fn download(
    State(state): State<Arc<AppState>>,
    CurrentPartner(partner): CurrentPartner,
    ctx: AuditContext,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let document = state
        .store
        .get_document(id, Some(partner.id))
        .await?
        .ok_or_else(|| ApiError::not_found("Document not found"))?;

    let entry = ctx
        .partner(&partner, actions::DOWNLOAD_DOCUMENT)
        .on(entity_types::DOCUMENT, document.id)
        .with_details(serde_json::json!({
            "claimId": document.claim_id,
            "fileName": document.filename,
        }));
    audit_log(&state, entry).await;
    tracing::debug!(partner_id = partner.id, document_id = document.id, "Document downloaded");

    Ok(attachment(&document.filename, &document.mime_type, document.content))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub stats: PartnerStats,
}

pub async fn stats(
    State(state): State<Arc<AppState>>,
    CurrentPartner(partner): CurrentPartner,
) -> Result<Json<ApiResponse<StatsResponse>>, ApiError> {
    let claims = state.store.get_partner_claims(partner.id).await?;
    Ok(ok(StatsResponse {
        stats: PartnerStats::compute(&claims, Utc::now()),
    }))
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub documents: Vec<PartnerDocument>,
    pub pagination: Pagination,
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    CurrentPartner(partner): CurrentPartner,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ApiResponse<HistoryResponse>>, ApiError> {
    let claims = state.store.get_partner_claims(partner.id).await?;
    let page = history_page(claims, &query);
    Ok(ok(HistoryResponse {
        documents: into_documents(page.documents),
        pagination: page.pagination,
    }))
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub documents: Vec<PartnerDocument>,
    pub total: usize,
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    CurrentPartner(partner): CurrentPartner,
    Query(query): Query<SearchQuery>,
) -> Result<Json<ApiResponse<SearchResponse>>, ApiError> {
    if let (Some(from), Some(to)) = (query.amount_from, query.amount_to) {
        if from > to {
            return Err(ApiError::validation_field("amountFrom", "amountFrom must not exceed amountTo"));
        }
    }
    let claims = query.apply(state.store.get_partner_claims(partner.id).await?);
    Ok(ok(SearchResponse {
        total: claims.len(),
        documents: into_documents(claims),
    }))
}
