//! Partner accounts, login records and password reset tokens.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A partner as every layer above the store sees it, whatever the engine.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Partner {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub telegram: Option<String>,
    pub alias: String,
    pub active: bool,
    pub birth_date: Option<NaiveDate>,
    /// A password has been set through a reset link
    pub password_set: bool,
    pub last_visit_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Login record of an active partner, looked up by alias or email.
#[derive(Debug, Clone)]
pub struct PartnerCredentials {
    pub partner_id: i64,
    pub name: String,
    pub email: String,
    pub alias: String,
    pub password_hash: Option<String>,
    pub activated: bool,
    pub failed_attempts: i64,
    pub locked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewPartner {
    pub name: String,
    pub email: String,
    pub telegram: Option<String>,
    pub alias: String,
    pub birth_date: Option<NaiveDate>,
    /// Set when the admin supplies an initial password
    pub password_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PartnerUpdate {
    pub name: String,
    pub email: String,
    pub telegram: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub active: bool,
    /// New login alias, `None` keeps the current one
    pub alias: Option<String>,
    /// New password hash, `None` keeps the current one
    pub password_hash: Option<String>,
}

/// Partner addressed by a password reset token.
#[derive(Debug, Clone)]
pub struct ResetTokenOwner {
    pub partner_id: i64,
    pub name: String,
    pub email: String,
}

/// Birth date of a partner, input of the daily birthday check.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BirthdayEntry {
    pub partner_id: i64,
    pub name: String,
    pub birth_date: NaiveDate,
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePartnerRequest {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub telegram: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePartnerRequest {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub telegram: Option<String>,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_active() -> bool {
    true
}

/// Partner profile shown to the partner themselves
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartnerProfile {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub telegram: Option<String>,
    pub alias: String,
    pub birth_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub last_visit: Option<DateTime<Utc>>,
}

impl From<Partner> for PartnerProfile {
    fn from(partner: Partner) -> Self {
        Self {
            id: partner.id,
            name: partner.name,
            email: partner.email,
            telegram: partner.telegram,
            alias: partner.alias,
            birth_date: partner.birth_date,
            created_at: partner.created_at,
            last_visit: partner.last_visit_at,
        }
    }
}
