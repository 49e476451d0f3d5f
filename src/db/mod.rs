//! Persistence layer.
//!
//! Everything the portal stores goes through the [`Store`] trait. Two engines
//! implement it: [`SqliteStore`], an embedded database file, and
//! [`PostgresStore`], a networked server. [`connect`] picks one from the
//! configuration at startup; the rest of the crate only holds an
//! `Arc<dyn Store>` and never asks which engine is behind it.

mod models;
mod postgres;
mod sqlite;

#[cfg(test)]
mod contract;

pub use models::*;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::config::{DatabaseBackend, DatabaseConfig};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("claim {0} is published and can only be deleted with force")]
    ClaimPublished(i64),

    #[error("{0}")]
    Conflict(String),

    #[error("unreadable {field} in storage: {value}")]
    Corrupt { field: &'static str, value: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage operations shared by both engines.
///
/// Multi-entity writes (`create_partner`, `update_partner`, `delete_partner`,
/// `create_claim_with_document`, `redeem_reset_token`, `delete_claim`) run in
/// a single transaction and roll back on any error.
#[async_trait]
pub trait Store: Send + Sync {
    /// Short engine name for logs and the health endpoint
    fn backend_name(&self) -> &'static str;

    async fn ping(&self) -> StoreResult<()>;

    // ---------------------------------------------------------------------
    // Partners
    // ---------------------------------------------------------------------

    /// Insert the partner and its login record. Fails with `Conflict` when the
    /// email or alias is taken.
    async fn create_partner(&self, partner: &NewPartner, now: DateTime<Utc>) -> StoreResult<Partner>;

    async fn update_partner(&self, id: i64, update: &PartnerUpdate) -> StoreResult<Partner>;

    /// Remove the partner with its tokens, documents, claims and login record.
    /// Returns false when no such partner exists.
    async fn delete_partner(&self, id: i64) -> StoreResult<bool>;

    async fn get_partner(&self, id: i64) -> StoreResult<Option<Partner>>;

    async fn list_partners(&self) -> StoreResult<Vec<Partner>>;

    async fn find_partner_by_email(&self, email: &str) -> StoreResult<Option<Partner>>;

    async fn alias_exists(&self, alias: &str) -> StoreResult<bool>;

    /// Login record of an active partner by alias or email
    async fn partner_credentials(&self, login: &str) -> StoreResult<Option<PartnerCredentials>>;

    async fn record_partner_failure(
        &self,
        partner_id: i64,
        failed_attempts: i64,
        locked_until: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Reset the failure counter, clear any lock and stamp the visit
    async fn record_partner_login(&self, partner_id: i64, at: DateTime<Utc>) -> StoreResult<()>;

    async fn create_reset_token(
        &self,
        partner_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Owner of an unused, unexpired token
    async fn reset_token_owner(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ResetTokenOwner>>;

    /// Consume the token and set the password in one step. Returns the
    /// partner id, or `None` when the token is unknown, used or expired.
    async fn redeem_reset_token(
        &self,
        token_hash: &str,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<i64>>;

    async fn partner_birthdays(&self) -> StoreResult<Vec<BirthdayEntry>>;

    // ---------------------------------------------------------------------
    // Claims & documents
    // ---------------------------------------------------------------------

    async fn create_claim(&self, claim: &NewClaim) -> StoreResult<i64>;

    async fn save_document(
        &self,
        claim_id: i64,
        document: &NewDocument,
        now: DateTime<Utc>,
    ) -> StoreResult<i64>;

    /// Insert a claim and its document together. Returns (claim id, document id).
    async fn create_claim_with_document(
        &self,
        claim: &NewClaim,
        document: &NewDocument,
        now: DateTime<Utc>,
    ) -> StoreResult<(i64, i64)>;

    /// With a partner scope the document is returned only when its claim
    /// belongs to that partner and is published.
    async fn get_document(&self, id: i64, partner_scope: Option<i64>) -> StoreResult<Option<Document>>;

    async fn get_claim_document(&self, claim_id: i64) -> StoreResult<Option<Document>>;

    async fn get_claim(&self, id: i64) -> StoreResult<Option<ClaimRecord>>;

    /// Published claims of a partner, newest publication first
    async fn get_partner_claims(&self, partner_id: i64) -> StoreResult<Vec<ClaimRecord>>;

    /// Every claim of a partner regardless of state, newest first
    async fn list_partner_claims(&self, partner_id: i64) -> StoreResult<Vec<ClaimRecord>>;

    async fn get_unpublished_claims(&self) -> StoreResult<Vec<ClaimRecord>>;

    async fn get_published_claims(&self) -> StoreResult<Vec<ClaimRecord>>;

    /// Move each unpublished claim to published. Ids that are missing or
    /// already published are skipped; only real transitions are returned.
    async fn publish_claims(&self, ids: &[i64], now: DateTime<Utc>) -> StoreResult<Vec<PublishedClaim>>;

    /// Returns how many published claims were moved back to draft
    async fn unpublish_claims(&self, ids: &[i64]) -> StoreResult<u64>;

    /// Delete a claim and its document. Published claims need `force`.
    async fn delete_claim(&self, id: i64, force: bool) -> StoreResult<()>;

    async fn admin_stats(&self, now: DateTime<Utc>) -> StoreResult<AdminStats>;

    // ---------------------------------------------------------------------
    // Admins
    // ---------------------------------------------------------------------

    async fn count_admins(&self) -> StoreResult<i64>;

    async fn get_admin(&self, id: i64) -> StoreResult<Option<Admin>>;

    async fn get_admin_by_username(&self, username: &str) -> StoreResult<Option<Admin>>;

    async fn list_admins(&self) -> StoreResult<Vec<Admin>>;

    async fn create_admin(&self, admin: &NewAdmin, now: DateTime<Utc>) -> StoreResult<i64>;

    async fn update_admin(
        &self,
        id: i64,
        username: &str,
        email: Option<&str>,
        role: AdminRole,
    ) -> StoreResult<bool>;

    async fn set_admin_password(&self, id: i64, password_hash: &str) -> StoreResult<bool>;

    /// Never deletes a super-admin. Returns false when nothing was removed.
    async fn delete_admin(&self, id: i64) -> StoreResult<bool>;

    async fn record_admin_failure(
        &self,
        admin_id: i64,
        failed_attempts: i64,
        locked_until: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    async fn record_admin_login(&self, admin_id: i64, at: DateTime<Utc>) -> StoreResult<()>;

    // ---------------------------------------------------------------------
    // Audit log
    // ---------------------------------------------------------------------

    async fn append_audit(&self, entry: &NewAuditEntry, now: DateTime<Utc>) -> StoreResult<()>;

    async fn list_audit(&self, query: &AuditQuery) -> StoreResult<AuditPage>;

    /// Entries per action in `[from, to)`, most frequent first
    async fn audit_stats(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> StoreResult<Vec<ActionCount>>;
}

/// Open the configured engine and bring its schema up to date.
pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Arc<dyn Store>> {
    match config.backend {
        DatabaseBackend::Sqlite => {
            if let Some(dir) = config.sqlite_path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
            let store = SqliteStore::open(&config.sqlite_path, config.max_connections).await?;
            info!(path = %config.sqlite_path.display(), "Using sqlite store");
            Ok(Arc::new(store))
        }
        DatabaseBackend::Postgres => {
            let url = config
                .url
                .as_deref()
                .context("database.url is required for the postgres backend")?;
            let store = PostgresStore::connect(url, config.max_connections).await?;
            info!("Using postgres store");
            Ok(Arc::new(store))
        }
    }
}

/// Split a migration script into statements, dropping `--` comment lines
fn sql_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(|statement| {
            statement
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Map a unique-constraint violation to `Conflict`, anything else passes through
fn unique_violation(err: sqlx::Error, message: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            StoreError::Conflict(message.to_string())
        }
        _ => StoreError::Database(err),
    }
}
