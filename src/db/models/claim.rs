//! Claims, their documents, and the read models built on top of them.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
pub struct NewClaim {
    pub partner_id: i64,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub amount: Decimal,
    pub pay_amount: Decimal,
    pub tax_amount: Decimal,
    pub doc_type: Option<String>,
    pub full_name: Option<String>,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub filename: String,
    pub content: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMeta {
    pub id: i64,
    #[serde(rename = "fileName")]
    pub filename: String,
    #[serde(rename = "fileSize")]
    pub size: i64,
    pub mime_type: String,
}

/// A claim joined with its partner and (at most one) document.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRecord {
    pub id: i64,
    pub partner_id: i64,
    pub partner_name: String,
    pub partner_email: String,
    #[serde(rename = "dateBeg")]
    pub period_start: NaiveDate,
    #[serde(rename = "dateEnd")]
    pub period_end: NaiveDate,
    pub amount: Decimal,
    pub pay_amount: Decimal,
    pub tax_amount: Decimal,
    pub doc_type: Option<String>,
    pub full_name: Option<String>,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub document: Option<DocumentMeta>,
}

impl ClaimRecord {
    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }

    pub fn period_label(&self) -> String {
        period_label(self.period_start, self.period_end)
    }

    pub fn file_name(&self) -> Option<&str> {
        self.document.as_ref().map(|d| d.filename.as_str())
    }
}

/// Billing period in the `DD.MM.YYYY - DD.MM.YYYY` form partners are used to.
pub fn period_label(start: NaiveDate, end: NaiveDate) -> String {
    format!("{} - {}", start.format("%d.%m.%Y"), end.format("%d.%m.%Y"))
}

/// A stored document with its bytes.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: i64,
    pub claim_id: i64,
    pub partner_id: i64,
    pub filename: String,
    pub content: Vec<u8>,
    pub size: i64,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
}

/// A claim that was just moved to published, with what the notifier needs.
#[derive(Debug, Clone)]
pub struct PublishedClaim {
    pub claim_id: i64,
    pub partner_id: i64,
    pub partner_name: String,
    pub partner_email: String,
    pub partner_telegram: Option<String>,
    pub partner_active: bool,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub amount: Decimal,
    pub currency: String,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdminStats {
    pub total_partners: i64,
    pub active_partners: i64,
    pub unpublished_claims: i64,
    pub published_claims: i64,
    pub published_this_month: i64,
}

/// First instant of the calendar month containing `now`.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastDocument {
    pub published_at: DateTime<Utc>,
    #[serde(rename = "dateBeg")]
    pub period_start: NaiveDate,
    #[serde(rename = "dateEnd")]
    pub period_end: NaiveDate,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PartnerStats {
    pub total_documents: usize,
    pub yearly_amount: Decimal,
    pub monthly_amount: Decimal,
    pub last_document: Option<LastDocument>,
}

impl PartnerStats {
    /// Totals over a partner's published claims. Unpublished claims are ignored.
    pub fn compute(claims: &[ClaimRecord], now: DateTime<Utc>) -> Self {
        let year_ago = now - Duration::days(365);
        let month = month_start(now);

        let mut stats = PartnerStats {
            total_documents: 0,
            yearly_amount: Decimal::ZERO,
            monthly_amount: Decimal::ZERO,
            last_document: None,
        };
        let mut latest: Option<&ClaimRecord> = None;

        for claim in claims {
            let Some(published_at) = claim.published_at else {
                continue;
            };
            stats.total_documents += 1;
            if published_at > year_ago {
                stats.yearly_amount += claim.amount;
            }
            if published_at >= month {
                stats.monthly_amount += claim.amount;
            }
            if latest.map_or(true, |l| l.published_at < claim.published_at) {
                latest = Some(claim);
            }
        }

        stats.last_document = latest.and_then(|c| {
            c.published_at.map(|published_at| LastDocument {
                published_at,
                period_start: c.period_start,
                period_end: c.period_end,
                amount: c.amount,
            })
        });
        stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistorySort {
    PublishedAt,
    DateBeg,
    DateEnd,
    Amount,
}

impl HistorySort {
    /// Unknown fields fall back to publication time
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("dateBeg") => Self::DateBeg,
            Some("dateEnd") => Self::DateEnd,
            Some("amount") => Self::Amount,
            _ => Self::PublishedAt,
        }
    }

    fn compare(self, a: &ClaimRecord, b: &ClaimRecord) -> Ordering {
        match self {
            Self::PublishedAt => a.published_at.cmp(&b.published_at),
            Self::DateBeg => a.period_start.cmp(&b.period_start),
            Self::DateEnd => a.period_end.cmp(&b.period_end),
            Self::Amount => a.amount.cmp(&b.amount),
        }
    }
}

/// Query parameters of the partner document history
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub pages: i64,
}

#[derive(Debug, Clone)]
pub struct ClaimPage {
    pub documents: Vec<ClaimRecord>,
    pub pagination: Pagination,
}

/// Sort and slice a partner's claims for the history view.
pub fn history_page(mut claims: Vec<ClaimRecord>, query: &HistoryQuery) -> ClaimPage {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(10).clamp(1, 100);
    let sort = HistorySort::parse(query.sort_by.as_deref());
    let ascending = query
        .sort_order
        .as_deref()
        .is_some_and(|o| o.eq_ignore_ascii_case("asc"));

    claims.sort_by(|a, b| {
        let ord = sort.compare(a, b).then_with(|| a.id.cmp(&b.id));
        if ascending {
            ord
        } else {
            ord.reverse()
        }
    });

    let total = claims.len() as i64;
    let pages = (total + limit - 1) / limit;
    let offset = usize::try_from((page - 1).saturating_mul(limit)).unwrap_or(usize::MAX);
    let documents = claims
        .into_iter()
        .skip(offset)
        .take(limit as usize)
        .collect();

    ClaimPage {
        documents,
        pagination: Pagination {
            page,
            limit,
            total,
            pages,
        },
    }
}

/// Filters of the partner document search
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    /// Period starts on or after this date
    pub date_from: Option<NaiveDate>,
    /// Period ends on or before this date
    pub date_to: Option<NaiveDate>,
    pub amount_from: Option<Decimal>,
    pub amount_to: Option<Decimal>,
    /// Case-insensitive substring of the file name
    pub file_name: Option<String>,
}

impl SearchQuery {
    pub fn matches(&self, claim: &ClaimRecord) -> bool {
        if self.date_from.is_some_and(|from| claim.period_start < from) {
            return false;
        }
        if self.date_to.is_some_and(|to| claim.period_end > to) {
            return false;
        }
        if self.amount_from.is_some_and(|min| claim.amount < min) {
            return false;
        }
        if self.amount_to.is_some_and(|max| claim.amount > max) {
            return false;
        }
        if let Some(needle) = self.file_name.as_deref().filter(|n| !n.is_empty()) {
            let needle = needle.to_lowercase();
            return claim
                .file_name()
                .is_some_and(|name| name.to_lowercase().contains(&needle));
        }
        true
    }

    pub fn apply(&self, claims: Vec<ClaimRecord>) -> Vec<ClaimRecord> {
        claims.into_iter().filter(|c| self.matches(c)).collect()
    }
}
