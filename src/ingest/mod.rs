//! Claim ingestion from uploaded spreadsheets.
//!
//! Each upload carries an identity sheet (`partner`) with name/value rows
//! describing the claim. The sheet is read, removed from the workbook, and
//! the remaining workbook is stored as the claim's document.

pub mod fields;
pub mod workbook;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::UploadConfig;
use crate::db::{period_label, NewClaim, NewDocument, Store, StoreError};
use fields::FieldKey;
use workbook::{CellValue, Workbook, WorkbookError};

pub const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const XLS_MIME: &str = "application/vnd.ms-excel";
pub const DEFAULT_CURRENCY: &str = "RUB";

/// Accepted names of the identity sheet, compared case-insensitively
const IDENTITY_SHEETS: [&str; 3] = ["partner", "партнер", "партнёр"];

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Workbook(#[from] WorkbookError),

    #[error("Sheet \"partner\" not found in workbook")]
    MissingIdentitySheet,

    #[error("Missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("Invalid value for \"{field}\": {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("Field \"inc\" not found in sheet \"partner\"")]
    MissingPartnerId,

    #[error("Partner {0} not found")]
    PartnerNotFound(i64),

    #[error("Unsupported file type {0}; only Excel files are accepted")]
    UnsupportedType(String),

    #[error("File is {size} bytes, the limit is {max}")]
    TooLarge { size: usize, max: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Claim fields read from an identity sheet
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimFields {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub amount: Decimal,
    pub pay_amount: Decimal,
    pub tax_amount: Decimal,
    pub doc_type: Option<String>,
    pub full_name: Option<String>,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    /// Partner id from the sheet, used by auto uploads
    pub partner_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ParsedClaimFile {
    pub fields: ClaimFields,
    /// Workbook bytes without the identity sheet
    pub stripped: Vec<u8>,
}

fn is_identity_sheet(name: &str) -> bool {
    let name = name.trim().to_lowercase();
    IDENTITY_SHEETS.iter().any(|candidate| name == *candidate)
}

/// Read the identity sheet and strip it from the workbook.
pub fn parse_claim_file(data: &[u8], now: DateTime<Utc>) -> Result<ParsedClaimFile, IngestError> {
    let workbook = Workbook::open(data)?;
    let index = workbook
        .position(is_identity_sheet)
        .ok_or(IngestError::MissingIdentitySheet)?;

    let sheet = workbook.read_sheet(index)?;
    let fields = extract_fields(&sheet.key_values(), workbook.date1904(), now)?;
    let stripped = workbook.without_sheet(index)?;

    Ok(ParsedClaimFile { fields, stripped })
}

fn extract_fields(
    pairs: &[(String, CellValue)],
    date1904: bool,
    now: DateTime<Utc>,
) -> Result<ClaimFields, IngestError> {
    // First occurrence of a key wins
    let mut values: HashMap<FieldKey, &CellValue> = HashMap::new();
    for (key, value) in pairs {
        if let Some(field) = FieldKey::parse(key) {
            if !value.is_empty() {
                values.entry(field).or_insert(value);
            }
        }
    }

    let missing: Vec<&'static str> = FieldKey::REQUIRED
        .iter()
        .filter(|key| !values.contains_key(key))
        .map(|key| key.canonical())
        .collect();
    if !missing.is_empty() {
        return Err(IngestError::MissingFields(missing));
    }

    let invalid = |key: FieldKey| IngestError::InvalidField {
        field: key.canonical(),
        value: values.get(&key).map(|v| v.display()).unwrap_or_default(),
    };
    let date = |key: FieldKey| {
        values
            .get(&key)
            .and_then(|v| fields::parse_date(v, date1904))
            .ok_or_else(|| invalid(key))
    };
    let amount = |key: FieldKey| {
        values
            .get(&key)
            .and_then(|v| fields::parse_amount(v))
            .ok_or_else(|| invalid(key))
    };
    let text = |key: FieldKey| values.get(&key).and_then(|v| fields::parse_text(v));

    let partner_id = match values.get(&FieldKey::PartnerId) {
        Some(value) => Some(fields::parse_partner_id(value).ok_or_else(|| invalid(FieldKey::PartnerId))?),
        None => None,
    };

    Ok(ClaimFields {
        period_start: date(FieldKey::PeriodFrom)?,
        period_end: date(FieldKey::PeriodTill)?,
        amount: amount(FieldKey::Net)?,
        pay_amount: amount(FieldKey::Invoice)?,
        tax_amount: amount(FieldKey::Tax)?,
        doc_type: text(FieldKey::DocType),
        full_name: text(FieldKey::FullName),
        currency: text(FieldKey::Currency)
            .map(|c| c.to_uppercase())
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
        created_at: values
            .get(&FieldKey::Created)
            .and_then(|v| fields::parse_timestamp(v, date1904))
            .unwrap_or(now),
        partner_id,
    })
}

/// A file received in an upload request
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Where the owning partner of an upload comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartnerSource {
    /// Supplied alongside the file
    Explicit(i64),
    /// Read from the `inc` row of the identity sheet
    FromSheet,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestedClaim {
    pub claim_id: i64,
    pub document_id: i64,
    pub partner_id: i64,
    pub partner_name: String,
    pub file_name: String,
    pub period: String,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileError {
    pub file_name: String,
    pub error: String,
}

/// Outcome of a batch upload: one entry per file in either list
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub results: Vec<IngestedClaim>,
    pub errors: Vec<FileError>,
}

pub struct Ingestor {
    store: Arc<dyn Store>,
    max_file_size: usize,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>, config: &UploadConfig) -> Self {
        Self {
            store,
            max_file_size: config.max_file_size,
        }
    }

    /// Files are processed in order; a failing file is reported and the
    /// rest of the batch continues.
    pub async fn ingest_batch(
        &self,
        files: Vec<(UploadedFile, PartnerSource)>,
        now: DateTime<Utc>,
    ) -> BatchReport {
        let mut report = BatchReport::default();

        for (file, source) in files {
            match self.ingest_file(&file, source, now).await {
                Ok(claim) => report.results.push(claim),
                Err(e) => {
                    warn!(file = %file.filename, error = %e, "Failed to ingest file");
                    report.errors.push(FileError {
                        file_name: file.filename.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            succeeded = report.results.len(),
            failed = report.errors.len(),
            "Upload batch processed"
        );
        report
    }

    pub async fn ingest_file(
        &self,
        file: &UploadedFile,
        source: PartnerSource,
        now: DateTime<Utc>,
    ) -> Result<IngestedClaim, IngestError> {
        let mime_type = accepted_mime(file)?;
        if file.data.len() > self.max_file_size {
            return Err(IngestError::TooLarge {
                size: file.data.len(),
                max: self.max_file_size,
            });
        }

        let parsed = parse_claim_file(&file.data, now)?;
        let fields = parsed.fields;

        let partner_id = match source {
            PartnerSource::Explicit(id) => id,
            PartnerSource::FromSheet => fields.partner_id.ok_or(IngestError::MissingPartnerId)?,
        };
        let partner = self
            .store
            .get_partner(partner_id)
            .await?
            .ok_or(IngestError::PartnerNotFound(partner_id))?;

        let claim = NewClaim {
            partner_id,
            period_start: fields.period_start,
            period_end: fields.period_end,
            amount: fields.amount,
            pay_amount: fields.pay_amount,
            tax_amount: fields.tax_amount,
            doc_type: fields.doc_type,
            full_name: fields.full_name,
            currency: fields.currency.clone(),
            created_at: fields.created_at,
        };
        let document = NewDocument {
            filename: file.filename.clone(),
            content: parsed.stripped,
            mime_type,
        };
        let (claim_id, document_id) = self
            .store
            .create_claim_with_document(&claim, &document, now)
            .await?;

        info!(claim_id, partner_id, file = %file.filename, "Claim created from upload");

        Ok(IngestedClaim {
            claim_id,
            document_id,
            partner_id,
            partner_name: partner.name,
            file_name: file.filename.clone(),
            period: period_label(fields.period_start, fields.period_end),
            amount: fields.amount,
            currency: fields.currency,
        })
    }
}

/// MIME type to store for an accepted upload
fn accepted_mime(file: &UploadedFile) -> Result<String, IngestError> {
    let declared = file
        .content_type
        .as_deref()
        .map(|c| c.split(';').next().unwrap_or(c).trim().to_lowercase())
        .unwrap_or_default();
    let name = file.filename.to_lowercase();
    let excel_name = name.ends_with(".xlsx") || name.ends_with(".xls");

    match declared.as_str() {
        XLSX_MIME | XLS_MIME => Ok(declared),
        "" | "application/octet-stream" if excel_name => Ok(XLSX_MIME.to_string()),
        other => Err(IngestError::UnsupportedType(if other.is_empty() {
            "unknown".to_string()
        } else {
            other.to_string()
        })),
    }
}
