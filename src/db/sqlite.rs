//! Embedded SQLite engine.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings so they sort and
//! compare as text; money is stored as decimal text.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Executor, FromRow, QueryBuilder, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use super::{
    month_start, sql_statements, unique_violation, ActionCount, Admin, AdminRole, AdminStats,
    AuditEntry, AuditPage, AuditQuery, BirthdayEntry, ClaimRecord, Document, DocumentMeta,
    NewAdmin, NewAuditEntry, NewClaim, NewDocument, NewPartner, Partner, PartnerCredentials,
    PartnerUpdate, PublishedClaim, ResetTokenOwner, Store, StoreError, StoreResult,
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: &Path, max_connections: u32) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database. A single long-lived connection keeps the
    /// data alive and shared between queries.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        for statement in sql_statements(include_str!("../../migrations/sqlite/001_initial.sql")) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------
// Value conversions
// -------------------------------------------------------------------------

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn day(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn corrupt(field: &'static str, value: &str) -> StoreError {
    StoreError::Corrupt {
        field,
        value: value.to_string(),
    }
}

fn parse_ts(field: &'static str, value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| corrupt(field, value))
}

fn parse_opt_ts(field: &'static str, value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(field, &v)).transpose()
}

fn parse_date(field: &'static str, value: &str) -> StoreResult<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| corrupt(field, value))
}

fn parse_decimal(field: &'static str, value: &str) -> StoreResult<Decimal> {
    Decimal::from_str(value).map_err(|_| corrupt(field, value))
}

// -------------------------------------------------------------------------
// Rows
// -------------------------------------------------------------------------

const PARTNER_SELECT: &str = r#"
    SELECT p.id, p.name, p.email, p.telegram, p.birth_date, p.active, p.created_at,
           c.alias, c.activated, c.last_visit_at
    FROM partners p
    JOIN partner_credentials c ON c.partner_id = p.id
"#;

#[derive(FromRow)]
struct PartnerRow {
    id: i64,
    name: String,
    email: String,
    telegram: Option<String>,
    birth_date: Option<String>,
    active: bool,
    created_at: String,
    alias: String,
    activated: bool,
    last_visit_at: Option<String>,
}

impl PartnerRow {
    fn into_partner(self) -> StoreResult<Partner> {
        Ok(Partner {
            id: self.id,
            name: self.name,
            email: self.email,
            telegram: self.telegram,
            alias: self.alias,
            active: self.active,
            birth_date: self
                .birth_date
                .map(|d| parse_date("partners.birth_date", &d))
                .transpose()?,
            password_set: self.activated,
            last_visit_at: parse_opt_ts("partner_credentials.last_visit_at", self.last_visit_at)?,
            created_at: parse_ts("partners.created_at", &self.created_at)?,
        })
    }
}

#[derive(FromRow)]
struct CredentialsRow {
    partner_id: i64,
    name: String,
    email: String,
    alias: String,
    password_hash: Option<String>,
    activated: bool,
    failed_attempts: i64,
    locked_until: Option<String>,
}

impl CredentialsRow {
    fn into_credentials(self) -> StoreResult<PartnerCredentials> {
        Ok(PartnerCredentials {
            partner_id: self.partner_id,
            name: self.name,
            email: self.email,
            alias: self.alias,
            password_hash: self.password_hash,
            activated: self.activated,
            failed_attempts: self.failed_attempts,
            locked_until: parse_opt_ts("partner_credentials.locked_until", self.locked_until)?,
        })
    }
}

const CLAIM_SELECT: &str = r#"
    SELECT c.id, c.partner_id, p.name AS partner_name, p.email AS partner_email,
           c.period_start, c.period_end, c.amount, c.pay_amount, c.tax_amount,
           c.doc_type, c.full_name, c.currency, c.created_at, c.published_at,
           d.id AS document_id, d.filename, d.size AS file_size, d.mime_type
    FROM claims c
    JOIN partners p ON p.id = c.partner_id
    LEFT JOIN documents d ON d.claim_id = c.id
"#;

#[derive(FromRow)]
struct ClaimRow {
    id: i64,
    partner_id: i64,
    partner_name: String,
    partner_email: String,
    period_start: String,
    period_end: String,
    amount: String,
    pay_amount: String,
    tax_amount: String,
    doc_type: Option<String>,
    full_name: Option<String>,
    currency: String,
    created_at: String,
    published_at: Option<String>,
    document_id: Option<i64>,
    filename: Option<String>,
    file_size: Option<i64>,
    mime_type: Option<String>,
}

impl ClaimRow {
    fn into_record(self) -> StoreResult<ClaimRecord> {
        let document = match (self.document_id, self.filename) {
            (Some(id), Some(filename)) => Some(DocumentMeta {
                id,
                filename,
                size: self.file_size.unwrap_or(0),
                mime_type: self.mime_type.unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(ClaimRecord {
            id: self.id,
            partner_id: self.partner_id,
            partner_name: self.partner_name,
            partner_email: self.partner_email,
            period_start: parse_date("claims.period_start", &self.period_start)?,
            period_end: parse_date("claims.period_end", &self.period_end)?,
            amount: parse_decimal("claims.amount", &self.amount)?,
            pay_amount: parse_decimal("claims.pay_amount", &self.pay_amount)?,
            tax_amount: parse_decimal("claims.tax_amount", &self.tax_amount)?,
            doc_type: self.doc_type,
            full_name: self.full_name,
            currency: self.currency,
            created_at: parse_ts("claims.created_at", &self.created_at)?,
            published_at: parse_opt_ts("claims.published_at", self.published_at)?,
            document,
        })
    }
}

fn into_records(rows: Vec<ClaimRow>) -> StoreResult<Vec<ClaimRecord>> {
    rows.into_iter().map(ClaimRow::into_record).collect()
}

#[derive(FromRow)]
struct PublishedRow {
    claim_id: i64,
    partner_id: i64,
    partner_name: String,
    partner_email: String,
    partner_telegram: Option<String>,
    partner_active: bool,
    period_start: String,
    period_end: String,
    amount: String,
    currency: String,
    filename: Option<String>,
}

impl PublishedRow {
    fn into_published(self) -> StoreResult<PublishedClaim> {
        Ok(PublishedClaim {
            claim_id: self.claim_id,
            partner_id: self.partner_id,
            partner_name: self.partner_name,
            partner_email: self.partner_email,
            partner_telegram: self.partner_telegram,
            partner_active: self.partner_active,
            period_start: parse_date("claims.period_start", &self.period_start)?,
            period_end: parse_date("claims.period_end", &self.period_end)?,
            amount: parse_decimal("claims.amount", &self.amount)?,
            currency: self.currency,
            filename: self.filename,
        })
    }
}

const DOCUMENT_SELECT: &str = r#"
    SELECT d.id, d.claim_id, c.partner_id, d.filename, d.content, d.size, d.mime_type, d.uploaded_at
    FROM documents d
    JOIN claims c ON c.id = d.claim_id
"#;

#[derive(FromRow)]
struct DocumentRow {
    id: i64,
    claim_id: i64,
    partner_id: i64,
    filename: String,
    content: Vec<u8>,
    size: i64,
    mime_type: String,
    uploaded_at: String,
}

impl DocumentRow {
    fn into_document(self) -> StoreResult<Document> {
        Ok(Document {
            id: self.id,
            claim_id: self.claim_id,
            partner_id: self.partner_id,
            filename: self.filename,
            content: self.content,
            size: self.size,
            mime_type: self.mime_type,
            uploaded_at: parse_ts("documents.uploaded_at", &self.uploaded_at)?,
        })
    }
}

#[derive(FromRow)]
struct AdminRow {
    id: i64,
    username: String,
    email: Option<String>,
    password_hash: String,
    role: String,
    failed_attempts: i64,
    locked_until: Option<String>,
    last_login_at: Option<String>,
    created_at: String,
}

impl AdminRow {
    fn into_admin(self) -> StoreResult<Admin> {
        Ok(Admin {
            id: self.id,
            role: AdminRole::from_str(&self.role).map_err(|_| corrupt("admins.role", &self.role))?,
            username: self.username,
            email: self.email,
            password_hash: self.password_hash,
            failed_attempts: self.failed_attempts,
            locked_until: parse_opt_ts("admins.locked_until", self.locked_until)?,
            last_login_at: parse_opt_ts("admins.last_login_at", self.last_login_at)?,
            created_at: parse_ts("admins.created_at", &self.created_at)?,
        })
    }
}

#[derive(FromRow)]
struct AuditRow {
    id: i64,
    actor_id: Option<i64>,
    actor_type: String,
    actor_name: Option<String>,
    action: String,
    entity_type: Option<String>,
    entity_id: Option<String>,
    details: Option<String>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    created_at: String,
}

impl AuditRow {
    fn into_entry(self) -> StoreResult<AuditEntry> {
        Ok(AuditEntry {
            id: self.id,
            actor_id: self.actor_id,
            actor_type: self.actor_type,
            actor_name: self.actor_name,
            action: self.action,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            // Details are free-form; keep unparseable text as a JSON string
            details: self.details.map(|d| {
                serde_json::from_str(&d).unwrap_or(serde_json::Value::String(d))
            }),
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            created_at: parse_ts("audit_log.created_at", &self.created_at)?,
        })
    }
}

#[derive(FromRow)]
struct StatsRow {
    total_partners: i64,
    active_partners: i64,
    unpublished_claims: i64,
    published_claims: i64,
    published_this_month: i64,
}

// -------------------------------------------------------------------------
// Shared statements (pool or transaction)
// -------------------------------------------------------------------------

async fn insert_claim<'e, E>(executor: E, claim: &NewClaim) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO claims (partner_id, period_start, period_end, amount, pay_amount, tax_amount,
                            doc_type, full_name, currency, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(claim.partner_id)
    .bind(day(claim.period_start))
    .bind(day(claim.period_end))
    .bind(claim.amount.to_string())
    .bind(claim.pay_amount.to_string())
    .bind(claim.tax_amount.to_string())
    .bind(&claim.doc_type)
    .bind(&claim.full_name)
    .bind(&claim.currency)
    .bind(ts(claim.created_at))
    .execute(executor)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn insert_document<'e, E>(
    executor: E,
    claim_id: i64,
    document: &NewDocument,
    now: DateTime<Utc>,
) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO documents (claim_id, filename, content, size, mime_type, uploaded_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(claim_id)
    .bind(&document.filename)
    .bind(&document.content)
    .bind(document.content.len() as i64)
    .bind(&document.mime_type)
    .bind(ts(now))
    .execute(executor)
    .await?;
    Ok(result.last_insert_rowid())
}

fn push_audit_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &AuditQuery) {
    qb.push(" WHERE 1 = 1");
    if let Some(actor_id) = query.actor_id {
        qb.push(" AND actor_id = ").push_bind(actor_id);
    }
    if let Some(actor_type) = &query.actor_type {
        qb.push(" AND actor_type = ").push_bind(actor_type.clone());
    }
    if let Some(action) = &query.action {
        qb.push(" AND action = ").push_bind(action.clone());
    }
    if let Some(entity_type) = &query.entity_type {
        qb.push(" AND entity_type = ").push_bind(entity_type.clone());
    }
    if let Some(from) = query.created_from() {
        qb.push(" AND created_at >= ").push_bind(ts(from));
    }
    if let Some(before) = query.created_before() {
        qb.push(" AND created_at < ").push_bind(ts(before));
    }
    if let Some(pattern) = query.search_pattern() {
        qb.push(" AND (action LIKE ")
            .push_bind(pattern.clone())
            .push(" OR entity_type LIKE ")
            .push_bind(pattern.clone())
            .push(" OR actor_name LIKE ")
            .push_bind(pattern.clone())
            .push(" OR details LIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_partner(&self, partner: &NewPartner, now: DateTime<Utc>) -> StoreResult<Partner> {
        let mut tx = self.pool.begin().await?;

        let email_taken: Option<i64> =
            sqlx::query_scalar("SELECT id FROM partners WHERE LOWER(email) = LOWER(?)")
                .bind(&partner.email)
                .fetch_optional(&mut *tx)
                .await?;
        if email_taken.is_some() {
            return Err(StoreError::Conflict(
                "A partner with this email already exists".to_string(),
            ));
        }

        let id = sqlx::query(
            r#"
            INSERT INTO partners (name, email, telegram, birth_date, active, created_at)
            VALUES (?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(&partner.name)
        .bind(&partner.email)
        .bind(&partner.telegram)
        .bind(partner.birth_date.map(day))
        .bind(ts(now))
        .execute(&mut *tx)
        .await
        .map_err(|e| unique_violation(e, "A partner with this email already exists"))?
        .last_insert_rowid();

        sqlx::query(
            r#"
            INSERT INTO partner_credentials (partner_id, alias, password_hash, activated)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(&partner.alias)
        .bind(&partner.password_hash)
        .bind(partner.password_hash.is_some())
        .execute(&mut *tx)
        .await
        .map_err(|e| unique_violation(e, "This alias is already taken"))?;

        tx.commit().await?;

        self.get_partner(id).await?.ok_or(StoreError::NotFound("partner"))
    }

    async fn update_partner(&self, id: i64, update: &PartnerUpdate) -> StoreResult<Partner> {
        let mut tx = self.pool.begin().await?;

        let email_taken: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM partners WHERE LOWER(email) = LOWER(?) AND id != ?",
        )
        .bind(&update.email)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        if email_taken.is_some() {
            return Err(StoreError::Conflict(
                "A partner with this email already exists".to_string(),
            ));
        }

        let result = sqlx::query(
            "UPDATE partners SET name = ?, email = ?, telegram = ?, birth_date = ?, active = ? WHERE id = ?",
        )
        .bind(&update.name)
        .bind(&update.email)
        .bind(&update.telegram)
        .bind(update.birth_date.map(day))
        .bind(update.active)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("partner"));
        }

        if let Some(alias) = &update.alias {
            sqlx::query("UPDATE partner_credentials SET alias = ? WHERE partner_id = ?")
                .bind(alias)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| unique_violation(e, "This alias is already taken"))?;
        }

        if let Some(hash) = &update.password_hash {
            sqlx::query(
                r#"
                UPDATE partner_credentials
                SET password_hash = ?, activated = 1, failed_attempts = 0, locked_until = NULL
                WHERE partner_id = ?
                "#,
            )
            .bind(hash)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.get_partner(id).await?.ok_or(StoreError::NotFound("partner"))
    }

    async fn delete_partner(&self, id: i64) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM password_reset_tokens WHERE partner_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM documents WHERE claim_id IN (SELECT id FROM claims WHERE partner_id = ?)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM claims WHERE partner_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM partner_credentials WHERE partner_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM partners WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_partner(&self, id: i64) -> StoreResult<Option<Partner>> {
        let row: Option<PartnerRow> = sqlx::query_as(&format!("{PARTNER_SELECT} WHERE p.id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(PartnerRow::into_partner).transpose()
    }

    async fn list_partners(&self) -> StoreResult<Vec<Partner>> {
        let rows: Vec<PartnerRow> = sqlx::query_as(&format!("{PARTNER_SELECT} ORDER BY p.name, p.id"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(PartnerRow::into_partner).collect()
    }

    async fn find_partner_by_email(&self, email: &str) -> StoreResult<Option<Partner>> {
        let row: Option<PartnerRow> =
            sqlx::query_as(&format!("{PARTNER_SELECT} WHERE LOWER(p.email) = LOWER(?)"))
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        row.map(PartnerRow::into_partner).transpose()
    }

    async fn alias_exists(&self, alias: &str) -> StoreResult<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT partner_id FROM partner_credentials WHERE alias = ?")
                .bind(alias)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn partner_credentials(&self, login: &str) -> StoreResult<Option<PartnerCredentials>> {
        let row: Option<CredentialsRow> = sqlx::query_as(
            r#"
            SELECT p.id AS partner_id, p.name, p.email, c.alias, c.password_hash, c.activated,
                   c.failed_attempts, c.locked_until
            FROM partner_credentials c
            JOIN partners p ON p.id = c.partner_id
            WHERE (c.alias = ? OR LOWER(p.email) = LOWER(?)) AND p.active = 1
            LIMIT 1
            "#,
        )
        .bind(login)
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CredentialsRow::into_credentials).transpose()
    }

    async fn record_partner_failure(
        &self,
        partner_id: i64,
        failed_attempts: i64,
        locked_until: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE partner_credentials SET failed_attempts = ?, locked_until = ? WHERE partner_id = ?",
        )
        .bind(failed_attempts)
        .bind(locked_until.map(ts))
        .bind(partner_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_partner_login(&self, partner_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE partner_credentials
            SET failed_attempts = 0, locked_until = NULL, last_visit_at = ?
            WHERE partner_id = ?
            "#,
        )
        .bind(ts(at))
        .bind(partner_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_reset_token(
        &self,
        partner_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO password_reset_tokens (partner_id, token_hash, expires_at, used, created_at)
            VALUES (?, ?, ?, 0, ?)
            "#,
        )
        .bind(partner_id)
        .bind(token_hash)
        .bind(ts(expires_at))
        .bind(ts(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_token_owner(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ResetTokenOwner>> {
        let row: Option<(i64, String, String)> = sqlx::query_as(
            r#"
            SELECT p.id, p.name, p.email
            FROM password_reset_tokens t
            JOIN partners p ON p.id = t.partner_id
            WHERE t.token_hash = ? AND t.used = 0 AND t.expires_at > ?
            "#,
        )
        .bind(token_hash)
        .bind(ts(now))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(partner_id, name, email)| ResetTokenOwner {
            partner_id,
            name,
            email,
        }))
    }

    async fn redeem_reset_token(
        &self,
        token_hash: &str,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        let partner_id: Option<i64> = sqlx::query_scalar(
            "SELECT partner_id FROM password_reset_tokens WHERE token_hash = ? AND used = 0 AND expires_at > ?",
        )
        .bind(token_hash)
        .bind(ts(now))
        .fetch_optional(&mut *tx)
        .await?;
        let Some(partner_id) = partner_id else {
            return Ok(None);
        };

        let consumed = sqlx::query(
            "UPDATE password_reset_tokens SET used = 1 WHERE token_hash = ? AND used = 0",
        )
        .bind(token_hash)
        .execute(&mut *tx)
        .await?;
        if consumed.rows_affected() != 1 {
            return Ok(None);
        }

        sqlx::query(
            r#"
            UPDATE partner_credentials
            SET password_hash = ?, activated = 1, failed_attempts = 0, locked_until = NULL
            WHERE partner_id = ?
            "#,
        )
        .bind(password_hash)
        .bind(partner_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(partner_id))
    }

    async fn partner_birthdays(&self) -> StoreResult<Vec<BirthdayEntry>> {
        let rows: Vec<(i64, String, String, bool)> = sqlx::query_as(
            "SELECT id, name, birth_date, active FROM partners WHERE birth_date IS NOT NULL ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(partner_id, name, birth_date, active)| {
                Ok(BirthdayEntry {
                    partner_id,
                    name,
                    birth_date: parse_date("partners.birth_date", &birth_date)?,
                    active,
                })
            })
            .collect()
    }

    async fn create_claim(&self, claim: &NewClaim) -> StoreResult<i64> {
        Ok(insert_claim(&self.pool, claim).await?)
    }

    async fn save_document(
        &self,
        claim_id: i64,
        document: &NewDocument,
        now: DateTime<Utc>,
    ) -> StoreResult<i64> {
        Ok(insert_document(&self.pool, claim_id, document, now).await?)
    }

    async fn create_claim_with_document(
        &self,
        claim: &NewClaim,
        document: &NewDocument,
        now: DateTime<Utc>,
    ) -> StoreResult<(i64, i64)> {
        let mut tx = self.pool.begin().await?;
        let claim_id = insert_claim(&mut *tx, claim).await?;
        let document_id = insert_document(&mut *tx, claim_id, document, now).await?;
        tx.commit().await?;
        Ok((claim_id, document_id))
    }

    async fn get_document(&self, id: i64, partner_scope: Option<i64>) -> StoreResult<Option<Document>> {
        let mut qb = QueryBuilder::<Sqlite>::new(DOCUMENT_SELECT);
        qb.push(" WHERE d.id = ").push_bind(id);
        if let Some(partner_id) = partner_scope {
            qb.push(" AND c.partner_id = ")
                .push_bind(partner_id)
                .push(" AND c.published_at IS NOT NULL");
        }

        let row: Option<DocumentRow> = qb.build_query_as().fetch_optional(&self.pool).await?;
        row.map(DocumentRow::into_document).transpose()
    }

    async fn get_claim_document(&self, claim_id: i64) -> StoreResult<Option<Document>> {
        let row: Option<DocumentRow> =
            sqlx::query_as(&format!("{DOCUMENT_SELECT} WHERE d.claim_id = ? ORDER BY d.id LIMIT 1"))
                .bind(claim_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(DocumentRow::into_document).transpose()
    }

    async fn get_claim(&self, id: i64) -> StoreResult<Option<ClaimRecord>> {
        let row: Option<ClaimRow> = sqlx::query_as(&format!("{CLAIM_SELECT} WHERE c.id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ClaimRow::into_record).transpose()
    }

    async fn get_partner_claims(&self, partner_id: i64) -> StoreResult<Vec<ClaimRecord>> {
        let rows: Vec<ClaimRow> = sqlx::query_as(&format!(
            "{CLAIM_SELECT} WHERE c.partner_id = ? AND c.published_at IS NOT NULL ORDER BY c.published_at DESC, c.id DESC"
        ))
        .bind(partner_id)
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    async fn list_partner_claims(&self, partner_id: i64) -> StoreResult<Vec<ClaimRecord>> {
        let rows: Vec<ClaimRow> = sqlx::query_as(&format!(
            "{CLAIM_SELECT} WHERE c.partner_id = ? ORDER BY c.created_at DESC, c.id DESC"
        ))
        .bind(partner_id)
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    async fn get_unpublished_claims(&self) -> StoreResult<Vec<ClaimRecord>> {
        let rows: Vec<ClaimRow> = sqlx::query_as(&format!(
            "{CLAIM_SELECT} WHERE c.published_at IS NULL ORDER BY c.created_at DESC, c.id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    async fn get_published_claims(&self) -> StoreResult<Vec<ClaimRecord>> {
        let rows: Vec<ClaimRow> = sqlx::query_as(&format!(
            "{CLAIM_SELECT} WHERE c.published_at IS NOT NULL ORDER BY c.published_at DESC, c.id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    async fn publish_claims(&self, ids: &[i64], now: DateTime<Utc>) -> StoreResult<Vec<PublishedClaim>> {
        let mut published = Vec::new();

        for &id in ids {
            let result = sqlx::query(
                "UPDATE claims SET published_at = ? WHERE id = ? AND published_at IS NULL",
            )
            .bind(ts(now))
            .bind(id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                tracing::debug!(claim_id = id, "Claim missing or already published, skipped");
                continue;
            }

            let row: Option<PublishedRow> = sqlx::query_as(
                r#"
                SELECT c.id AS claim_id, c.partner_id, p.name AS partner_name,
                       p.email AS partner_email, p.telegram AS partner_telegram,
                       p.active AS partner_active, c.period_start, c.period_end,
                       c.amount, c.currency, d.filename
                FROM claims c
                JOIN partners p ON p.id = c.partner_id
                LEFT JOIN documents d ON d.claim_id = c.id
                WHERE c.id = ?
                LIMIT 1
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                published.push(row.into_published()?);
            }
        }

        Ok(published)
    }

    async fn unpublish_claims(&self, ids: &[i64]) -> StoreResult<u64> {
        let mut count = 0;
        for &id in ids {
            let result = sqlx::query(
                "UPDATE claims SET published_at = NULL WHERE id = ? AND published_at IS NOT NULL",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
            count += result.rows_affected();
        }
        Ok(count)
    }

    async fn delete_claim(&self, id: i64, force: bool) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let published_at: Option<Option<String>> =
            sqlx::query_scalar("SELECT published_at FROM claims WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        match published_at {
            None => return Err(StoreError::NotFound("claim")),
            Some(Some(_)) if !force => return Err(StoreError::ClaimPublished(id)),
            Some(_) => {}
        }

        sqlx::query("DELETE FROM documents WHERE claim_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM claims WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn admin_stats(&self, now: DateTime<Utc>) -> StoreResult<AdminStats> {
        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM partners) AS total_partners,
                (SELECT COUNT(*) FROM partners WHERE active = 1) AS active_partners,
                (SELECT COUNT(*) FROM claims WHERE published_at IS NULL) AS unpublished_claims,
                (SELECT COUNT(*) FROM claims WHERE published_at IS NOT NULL) AS published_claims,
                (SELECT COUNT(*) FROM claims WHERE published_at >= ?) AS published_this_month
            "#,
        )
        .bind(ts(month_start(now)))
        .fetch_one(&self.pool)
        .await?;

        Ok(AdminStats {
            total_partners: row.total_partners,
            active_partners: row.active_partners,
            unpublished_claims: row.unpublished_claims,
            published_claims: row.published_claims,
            published_this_month: row.published_this_month,
        })
    }

    async fn count_admins(&self) -> StoreResult<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM admins")
            .fetch_one(&self.pool)
            .await?)
    }

    async fn get_admin(&self, id: i64) -> StoreResult<Option<Admin>> {
        let row: Option<AdminRow> = sqlx::query_as("SELECT * FROM admins WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(AdminRow::into_admin).transpose()
    }

    async fn get_admin_by_username(&self, username: &str) -> StoreResult<Option<Admin>> {
        let row: Option<AdminRow> = sqlx::query_as("SELECT * FROM admins WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.map(AdminRow::into_admin).transpose()
    }

    async fn list_admins(&self) -> StoreResult<Vec<Admin>> {
        let rows: Vec<AdminRow> = sqlx::query_as("SELECT * FROM admins ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(AdminRow::into_admin).collect()
    }

    async fn create_admin(&self, admin: &NewAdmin, now: DateTime<Utc>) -> StoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO admins (username, email, password_hash, role, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&admin.username)
        .bind(&admin.email)
        .bind(&admin.password_hash)
        .bind(admin.role.as_str())
        .bind(ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation(e, "An admin with this username already exists"))?;
        Ok(result.last_insert_rowid())
    }

    async fn update_admin(
        &self,
        id: i64,
        username: &str,
        email: Option<&str>,
        role: AdminRole,
    ) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE admins SET username = ?, email = ?, role = ? WHERE id = ?")
            .bind(username)
            .bind(email)
            .bind(role.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| unique_violation(e, "An admin with this username already exists"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_admin_password(&self, id: i64, password_hash: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE admins SET password_hash = ?, failed_attempts = 0, locked_until = NULL WHERE id = ?",
        )
        .bind(password_hash)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_admin(&self, id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM admins WHERE id = ? AND role != 'superadmin'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_admin_failure(
        &self,
        admin_id: i64,
        failed_attempts: i64,
        locked_until: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE admins SET failed_attempts = ?, locked_until = ? WHERE id = ?")
            .bind(failed_attempts)
            .bind(locked_until.map(ts))
            .bind(admin_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_admin_login(&self, admin_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "UPDATE admins SET failed_attempts = 0, locked_until = NULL, last_login_at = ? WHERE id = ?",
        )
        .bind(ts(at))
        .bind(admin_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_audit(&self, entry: &NewAuditEntry, now: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (actor_id, actor_type, actor_name, action, entity_type, entity_id,
                                   details, ip_address, user_agent, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.actor_id)
        .bind(&entry.actor_type)
        .bind(&entry.actor_name)
        .bind(&entry.action)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(entry.details.as_ref().map(|d| d.to_string()))
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(ts(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit(&self, query: &AuditQuery) -> StoreResult<AuditPage> {
        let limit = query.limit();
        let offset = query.offset();

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM audit_log");
        push_audit_filters(&mut count, query);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new("SELECT * FROM audit_log");
        push_audit_filters(&mut select, query);
        select
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows: Vec<AuditRow> = select.build_query_as().fetch_all(&self.pool).await?;

        Ok(AuditPage {
            logs: rows
                .into_iter()
                .map(AuditRow::into_entry)
                .collect::<StoreResult<_>>()?,
            total,
            limit,
            offset,
        })
    }

    async fn audit_stats(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> StoreResult<Vec<ActionCount>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT action, COUNT(*) AS count
            FROM audit_log
            WHERE created_at >= ? AND created_at < ?
            GROUP BY action
            ORDER BY count DESC, action
            "#,
        )
        .bind(ts(from))
        .bind(ts(to))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(action, count)| ActionCount { action, count })
            .collect())
    }
}
