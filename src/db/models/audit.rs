//! Audit log models for tracking who did what.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit log entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: i64,
    pub actor_id: Option<i64>,
    pub actor_type: String,
    pub actor_name: Option<String>,
    pub action: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub details: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewAuditEntry {
    pub actor_id: Option<i64>,
    pub actor_type: String,
    pub actor_name: Option<String>,
    pub action: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub details: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl NewAuditEntry {
    pub fn on(mut self, entity_type: &str, entity_id: impl ToString) -> Self {
        self.entity_type = Some(entity_type.to_string());
        self.entity_id = Some(entity_id.to_string());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Query parameters for filtering audit logs
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    pub actor_id: Option<i64>,
    /// "partner", "admin" or "system"
    pub actor_type: Option<String>,
    /// Filter by action (e.g., "claims.publish")
    pub action: Option<String>,
    pub entity_type: Option<String>,
    /// First day included
    pub date_from: Option<NaiveDate>,
    /// Last day included
    pub date_to: Option<NaiveDate>,
    /// Substring of action, entity, actor name or details
    pub search: Option<String>,
    /// Defaults to 50, max 500
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AuditQuery {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 500)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    /// Inclusive lower bound on `created_at`
    pub fn created_from(&self) -> Option<DateTime<Utc>> {
        self.date_from.map(|d| d.and_time(NaiveTime::MIN).and_utc())
    }

    /// Exclusive upper bound on `created_at`, the day after `date_to`
    pub fn created_before(&self) -> Option<DateTime<Utc>> {
        self.date_to
            .and_then(|d| d.succ_opt())
            .map(|d| d.and_time(NaiveTime::MIN).and_utc())
    }

    pub fn search_pattern(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub logs: Vec<AuditEntry>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ActionCount {
    pub action: String,
    pub count: i64,
}

pub mod actor_types {
    pub const PARTNER: &str = "partner";
    pub const ADMIN: &str = "admin";
    pub const SYSTEM: &str = "system";
}

/// Common audit action types
pub mod actions {
    // Auth
    pub const PARTNER_LOGIN: &str = "auth.partner_login";
    pub const PARTNER_LOGIN_FAILED: &str = "auth.partner_login_failed";
    pub const ADMIN_LOGIN: &str = "auth.admin_login";
    pub const ADMIN_LOGIN_FAILED: &str = "auth.admin_login_failed";
    pub const PASSWORD_RESET_REQUEST: &str = "auth.password_reset_request";
    pub const PASSWORD_RESET: &str = "auth.password_reset";

    // Partner self-service
    pub const VIEW_DOCUMENTS: &str = "documents.view";
    pub const DOWNLOAD_DOCUMENT: &str = "documents.download";

    // Claims
    pub const UPLOAD_FILES: &str = "claims.upload";
    pub const PUBLISH_CLAIMS: &str = "claims.publish";
    pub const UNPUBLISH_CLAIMS: &str = "claims.unpublish";
    pub const DELETE_CLAIM: &str = "claims.delete";

    // Partners
    pub const PARTNER_CREATE: &str = "partner.create";
    pub const PARTNER_UPDATE: &str = "partner.update";
    pub const PARTNER_DELETE: &str = "partner.delete";

    // Admins
    pub const ADMIN_CREATE: &str = "admin.create";
    pub const ADMIN_UPDATE: &str = "admin.update";
    pub const ADMIN_PASSWORD: &str = "admin.password";
    pub const ADMIN_DELETE: &str = "admin.delete";

    // Scheduled jobs
    pub const BIRTHDAY_CHECK: &str = "birthdays.check";
}

/// Common entity types
pub mod entity_types {
    pub const PARTNER: &str = "partner";
    pub const CLAIM: &str = "claim";
    pub const DOCUMENT: &str = "document";
    pub const ADMIN: &str = "admin";
}
