//! PostgreSQL engine.
//!
//! Columns carry native types (DATE, NUMERIC, TIMESTAMPTZ, JSONB), so rows
//! decode straight into domain values. Partner-facing claim listings read
//! from the `partner_documents` view.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, FromRow, PgPool, Postgres, QueryBuilder};
use std::str::FromStr;

use super::{
    month_start, sql_statements, unique_violation, ActionCount, Admin, AdminRole, AdminStats,
    AuditEntry, AuditPage, AuditQuery, BirthdayEntry, ClaimRecord, Document, DocumentMeta,
    NewAdmin, NewAuditEntry, NewClaim, NewDocument, NewPartner, Partner, PartnerCredentials,
    PartnerUpdate, PublishedClaim, ResetTokenOwner, Store, StoreError, StoreResult,
};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        for statement in sql_statements(include_str!("../../migrations/postgres/001_initial.sql")) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

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
    birth_date: Option<NaiveDate>,
    active: bool,
    created_at: DateTime<Utc>,
    alias: String,
    activated: bool,
    last_visit_at: Option<DateTime<Utc>>,
}

impl From<PartnerRow> for Partner {
    fn from(row: PartnerRow) -> Self {
        Partner {
            id: row.id,
            name: row.name,
            email: row.email,
            telegram: row.telegram,
            alias: row.alias,
            active: row.active,
            birth_date: row.birth_date,
            password_set: row.activated,
            last_visit_at: row.last_visit_at,
            created_at: row.created_at,
        }
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
    locked_until: Option<DateTime<Utc>>,
}

impl From<CredentialsRow> for PartnerCredentials {
    fn from(row: CredentialsRow) -> Self {
        PartnerCredentials {
            partner_id: row.partner_id,
            name: row.name,
            email: row.email,
            alias: row.alias,
            password_hash: row.password_hash,
            activated: row.activated,
            failed_attempts: row.failed_attempts,
            locked_until: row.locked_until,
        }
    }
}

const CLAIM_SELECT: &str = r#"
    SELECT claim_id, partner_id, partner_name, partner_email, period_start, period_end,
           amount, pay_amount, tax_amount, doc_type, full_name, currency, created_at,
           published_at, document_id, filename, file_size, mime_type
    FROM partner_documents
"#;

#[derive(FromRow)]
struct ClaimRow {
    claim_id: i64,
    partner_id: i64,
    partner_name: String,
    partner_email: String,
    period_start: NaiveDate,
    period_end: NaiveDate,
    amount: Decimal,
    pay_amount: Decimal,
    tax_amount: Decimal,
    doc_type: Option<String>,
    full_name: Option<String>,
    currency: String,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    document_id: Option<i64>,
    filename: Option<String>,
    file_size: Option<i64>,
    mime_type: Option<String>,
}

impl From<ClaimRow> for ClaimRecord {
    fn from(row: ClaimRow) -> Self {
        let document = match (row.document_id, row.filename) {
            (Some(id), Some(filename)) => Some(DocumentMeta {
                id,
                filename,
                size: row.file_size.unwrap_or(0),
                mime_type: row.mime_type.unwrap_or_default(),
            }),
            _ => None,
        };

        ClaimRecord {
            id: row.claim_id,
            partner_id: row.partner_id,
            partner_name: row.partner_name,
            partner_email: row.partner_email,
            period_start: row.period_start,
            period_end: row.period_end,
            amount: row.amount,
            pay_amount: row.pay_amount,
            tax_amount: row.tax_amount,
            doc_type: row.doc_type,
            full_name: row.full_name,
            currency: row.currency,
            created_at: row.created_at,
            published_at: row.published_at,
            document,
        }
    }
}

fn into_records(rows: Vec<ClaimRow>) -> Vec<ClaimRecord> {
    rows.into_iter().map(ClaimRecord::from).collect()
}

#[derive(FromRow)]
struct PublishedRow {
    claim_id: i64,
    partner_id: i64,
    partner_name: String,
    partner_email: String,
    partner_telegram: Option<String>,
    partner_active: bool,
    period_start: NaiveDate,
    period_end: NaiveDate,
    amount: Decimal,
    currency: String,
    filename: Option<String>,
}

impl From<PublishedRow> for PublishedClaim {
    fn from(row: PublishedRow) -> Self {
        PublishedClaim {
            claim_id: row.claim_id,
            partner_id: row.partner_id,
            partner_name: row.partner_name,
            partner_email: row.partner_email,
            partner_telegram: row.partner_telegram,
            partner_active: row.partner_active,
            period_start: row.period_start,
            period_end: row.period_end,
            amount: row.amount,
            currency: row.currency,
            filename: row.filename,
        }
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
    uploaded_at: DateTime<Utc>,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        Document {
            id: row.id,
            claim_id: row.claim_id,
            partner_id: row.partner_id,
            filename: row.filename,
            content: row.content,
            size: row.size,
            mime_type: row.mime_type,
            uploaded_at: row.uploaded_at,
        }
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
    locked_until: Option<DateTime<Utc>>,
    last_login_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl AdminRow {
    fn into_admin(self) -> StoreResult<Admin> {
        let role = AdminRole::from_str(&self.role).map_err(|_| StoreError::Corrupt {
            field: "admins.role",
            value: self.role.clone(),
        })?;
        Ok(Admin {
            id: self.id,
            username: self.username,
            email: self.email,
            password_hash: self.password_hash,
            role,
            failed_attempts: self.failed_attempts,
            locked_until: self.locked_until,
            last_login_at: self.last_login_at,
            created_at: self.created_at,
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
    details: Option<serde_json::Value>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<AuditRow> for AuditEntry {
    fn from(row: AuditRow) -> Self {
        AuditEntry {
            id: row.id,
            actor_id: row.actor_id,
            actor_type: row.actor_type,
            actor_name: row.actor_name,
            action: row.action,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            details: row.details,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            created_at: row.created_at,
        }
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

async fn insert_claim<'e, E>(executor: E, claim: &NewClaim) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar(
        r#"
        INSERT INTO claims (partner_id, period_start, period_end, amount, pay_amount, tax_amount,
                            doc_type, full_name, currency, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING id
        "#,
    )
    .bind(claim.partner_id)
    .bind(claim.period_start)
    .bind(claim.period_end)
    .bind(claim.amount)
    .bind(claim.pay_amount)
    .bind(claim.tax_amount)
    .bind(&claim.doc_type)
    .bind(&claim.full_name)
    .bind(&claim.currency)
    .bind(claim.created_at)
    .fetch_one(executor)
    .await
}

async fn insert_document<'e, E>(
    executor: E,
    claim_id: i64,
    document: &NewDocument,
    now: DateTime<Utc>,
) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar(
        r#"
        INSERT INTO documents (claim_id, filename, content, size, mime_type, uploaded_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(claim_id)
    .bind(&document.filename)
    .bind(&document.content)
    .bind(document.content.len() as i64)
    .bind(&document.mime_type)
    .bind(now)
    .fetch_one(executor)
    .await
}

fn push_audit_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &AuditQuery) {
    qb.push(" WHERE TRUE");
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
        qb.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(before) = query.created_before() {
        qb.push(" AND created_at < ").push_bind(before);
    }
    if let Some(pattern) = query.search_pattern() {
        qb.push(" AND (action ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR entity_type ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR actor_name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR details::text ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

#[async_trait]
impl Store for PostgresStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_partner(&self, partner: &NewPartner, now: DateTime<Utc>) -> StoreResult<Partner> {
        let mut tx = self.pool.begin().await?;

        let email_taken: Option<i64> =
            sqlx::query_scalar("SELECT id FROM partners WHERE LOWER(email) = LOWER($1)")
                .bind(&partner.email)
                .fetch_optional(&mut *tx)
                .await?;
        if email_taken.is_some() {
            return Err(StoreError::Conflict(
                "A partner with this email already exists".to_string(),
            ));
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO partners (name, email, telegram, birth_date, active, created_at)
            VALUES ($1, $2, $3, $4, TRUE, $5)
            RETURNING id
            "#,
        )
        .bind(&partner.name)
        .bind(&partner.email)
        .bind(&partner.telegram)
        .bind(partner.birth_date)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| unique_violation(e, "A partner with this email already exists"))?;

        sqlx::query(
            r#"
            INSERT INTO partner_credentials (partner_id, alias, password_hash, activated)
            VALUES ($1, $2, $3, $4)
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
            "SELECT id FROM partners WHERE LOWER(email) = LOWER($1) AND id != $2",
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
            "UPDATE partners SET name = $1, email = $2, telegram = $3, birth_date = $4, active = $5 WHERE id = $6",
        )
        .bind(&update.name)
        .bind(&update.email)
        .bind(&update.telegram)
        .bind(update.birth_date)
        .bind(update.active)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("partner"));
        }

        if let Some(alias) = &update.alias {
            sqlx::query("UPDATE partner_credentials SET alias = $1 WHERE partner_id = $2")
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
                SET password_hash = $1, activated = TRUE, failed_attempts = 0, locked_until = NULL
                WHERE partner_id = $2
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

        sqlx::query("DELETE FROM password_reset_tokens WHERE partner_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM documents WHERE claim_id IN (SELECT id FROM claims WHERE partner_id = $1)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM claims WHERE partner_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM partner_credentials WHERE partner_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM partners WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_partner(&self, id: i64) -> StoreResult<Option<Partner>> {
        let row: Option<PartnerRow> = sqlx::query_as(&format!("{PARTNER_SELECT} WHERE p.id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Partner::from))
    }

    async fn list_partners(&self) -> StoreResult<Vec<Partner>> {
        let rows: Vec<PartnerRow> = sqlx::query_as(&format!("{PARTNER_SELECT} ORDER BY p.name, p.id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Partner::from).collect())
    }

    async fn find_partner_by_email(&self, email: &str) -> StoreResult<Option<Partner>> {
        let row: Option<PartnerRow> =
            sqlx::query_as(&format!("{PARTNER_SELECT} WHERE LOWER(p.email) = LOWER($1)"))
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Partner::from))
    }

    async fn alias_exists(&self, alias: &str) -> StoreResult<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT partner_id FROM partner_credentials WHERE alias = $1")
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
            WHERE (c.alias = $1 OR LOWER(p.email) = LOWER($1)) AND p.active
            LIMIT 1
            "#,
        )
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(PartnerCredentials::from))
    }

    async fn record_partner_failure(
        &self,
        partner_id: i64,
        failed_attempts: i64,
        locked_until: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE partner_credentials SET failed_attempts = $1, locked_until = $2 WHERE partner_id = $3",
        )
        .bind(failed_attempts)
        .bind(locked_until)
        .bind(partner_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_partner_login(&self, partner_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE partner_credentials
            SET failed_attempts = 0, locked_until = NULL, last_visit_at = $1
            WHERE partner_id = $2
            "#,
        )
        .bind(at)
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
            VALUES ($1, $2, $3, FALSE, $4)
            "#,
        )
        .bind(partner_id)
        .bind(token_hash)
        .bind(expires_at)
        .bind(now)
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
            WHERE t.token_hash = $1 AND NOT t.used AND t.expires_at > $2
            "#,
        )
        .bind(token_hash)
        .bind(now)
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

        // Conditional update doubles as the row lock for concurrent redemptions
        let partner_id: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE password_reset_tokens SET used = TRUE
            WHERE token_hash = $1 AND NOT used AND expires_at > $2
            RETURNING partner_id
            "#,
        )
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(partner_id) = partner_id else {
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE partner_credentials
            SET password_hash = $1, activated = TRUE, failed_attempts = 0, locked_until = NULL
            WHERE partner_id = $2
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
        let rows: Vec<(i64, String, NaiveDate, bool)> = sqlx::query_as(
            "SELECT id, name, birth_date, active FROM partners WHERE birth_date IS NOT NULL ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(partner_id, name, birth_date, active)| BirthdayEntry {
                partner_id,
                name,
                birth_date,
                active,
            })
            .collect())
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
        let mut qb = QueryBuilder::<Postgres>::new(DOCUMENT_SELECT);
        qb.push(" WHERE d.id = ").push_bind(id);
        if let Some(partner_id) = partner_scope {
            qb.push(" AND c.partner_id = ")
                .push_bind(partner_id)
                .push(" AND c.published_at IS NOT NULL");
        }

        let row: Option<DocumentRow> = qb.build_query_as().fetch_optional(&self.pool).await?;
        Ok(row.map(Document::from))
    }

    async fn get_claim_document(&self, claim_id: i64) -> StoreResult<Option<Document>> {
        let row: Option<DocumentRow> =
            sqlx::query_as(&format!("{DOCUMENT_SELECT} WHERE d.claim_id = $1 ORDER BY d.id LIMIT 1"))
                .bind(claim_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Document::from))
    }

    async fn get_claim(&self, id: i64) -> StoreResult<Option<ClaimRecord>> {
        let row: Option<ClaimRow> = sqlx::query_as(&format!("{CLAIM_SELECT} WHERE claim_id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ClaimRecord::from))
    }

    async fn get_partner_claims(&self, partner_id: i64) -> StoreResult<Vec<ClaimRecord>> {
        let rows: Vec<ClaimRow> = sqlx::query_as(&format!(
            "{CLAIM_SELECT} WHERE partner_id = $1 AND published_at IS NOT NULL ORDER BY published_at DESC, claim_id DESC"
        ))
        .bind(partner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(into_records(rows))
    }

    async fn list_partner_claims(&self, partner_id: i64) -> StoreResult<Vec<ClaimRecord>> {
        let rows: Vec<ClaimRow> = sqlx::query_as(&format!(
            "{CLAIM_SELECT} WHERE partner_id = $1 ORDER BY created_at DESC, claim_id DESC"
        ))
        .bind(partner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(into_records(rows))
    }

    async fn get_unpublished_claims(&self) -> StoreResult<Vec<ClaimRecord>> {
        let rows: Vec<ClaimRow> = sqlx::query_as(&format!(
            "{CLAIM_SELECT} WHERE published_at IS NULL ORDER BY created_at DESC, claim_id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(into_records(rows))
    }

    async fn get_published_claims(&self) -> StoreResult<Vec<ClaimRecord>> {
        let rows: Vec<ClaimRow> = sqlx::query_as(&format!(
            "{CLAIM_SELECT} WHERE published_at IS NOT NULL ORDER BY published_at DESC, claim_id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(into_records(rows))
    }

    async fn publish_claims(&self, ids: &[i64], now: DateTime<Utc>) -> StoreResult<Vec<PublishedClaim>> {
        let mut published = Vec::new();

        for &id in ids {
            let row: Option<PublishedRow> = sqlx::query_as(
                r#"
                WITH moved AS (
                    UPDATE claims SET published_at = $1
                    WHERE id = $2 AND published_at IS NULL
                    RETURNING id, partner_id, period_start, period_end, amount, currency
                )
                SELECT m.id AS claim_id, m.partner_id, p.name AS partner_name,
                       p.email AS partner_email, p.telegram AS partner_telegram,
                       p.active AS partner_active, m.period_start, m.period_end,
                       m.amount, m.currency,
                       (SELECT d.filename FROM documents d WHERE d.claim_id = m.id ORDER BY d.id LIMIT 1) AS filename
                FROM moved m
                JOIN partners p ON p.id = m.partner_id
                "#,
            )
            .bind(now)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

            match row {
                Some(row) => published.push(row.into()),
                None => tracing::debug!(claim_id = id, "Claim missing or already published, skipped"),
            }
        }

        Ok(published)
    }

    async fn unpublish_claims(&self, ids: &[i64]) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE claims SET published_at = NULL WHERE id = ANY($1) AND published_at IS NOT NULL",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_claim(&self, id: i64, force: bool) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let published_at: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT published_at FROM claims WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        match published_at {
            None => return Err(StoreError::NotFound("claim")),
            Some(Some(_)) if !force => return Err(StoreError::ClaimPublished(id)),
            Some(_) => {}
        }

        sqlx::query("DELETE FROM documents WHERE claim_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM claims WHERE id = $1")
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
                (SELECT COUNT(*) FROM partners WHERE active) AS active_partners,
                (SELECT COUNT(*) FROM claims WHERE published_at IS NULL) AS unpublished_claims,
                (SELECT COUNT(*) FROM claims WHERE published_at IS NOT NULL) AS published_claims,
                (SELECT COUNT(*) FROM claims WHERE published_at >= $1) AS published_this_month
            "#,
        )
        .bind(month_start(now))
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
        let row: Option<AdminRow> = sqlx::query_as("SELECT * FROM admins WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(AdminRow::into_admin).transpose()
    }

    async fn get_admin_by_username(&self, username: &str) -> StoreResult<Option<Admin>> {
        let row: Option<AdminRow> = sqlx::query_as("SELECT * FROM admins WHERE username = $1")
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
        sqlx::query_scalar(
            r#"
            INSERT INTO admins (username, email, password_hash, role, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&admin.username)
        .bind(&admin.email)
        .bind(&admin.password_hash)
        .bind(admin.role.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unique_violation(e, "An admin with this username already exists"))
    }

    async fn update_admin(
        &self,
        id: i64,
        username: &str,
        email: Option<&str>,
        role: AdminRole,
    ) -> StoreResult<bool> {
        let result =
            sqlx::query("UPDATE admins SET username = $1, email = $2, role = $3 WHERE id = $4")
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
            "UPDATE admins SET password_hash = $1, failed_attempts = 0, locked_until = NULL WHERE id = $2",
        )
        .bind(password_hash)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_admin(&self, id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM admins WHERE id = $1 AND role != 'superadmin'")
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
        sqlx::query("UPDATE admins SET failed_attempts = $1, locked_until = $2 WHERE id = $3")
            .bind(failed_attempts)
            .bind(locked_until)
            .bind(admin_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_admin_login(&self, admin_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "UPDATE admins SET failed_attempts = 0, locked_until = NULL, last_login_at = $1 WHERE id = $2",
        )
        .bind(at)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.actor_id)
        .bind(&entry.actor_type)
        .bind(&entry.actor_name)
        .bind(&entry.action)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.details)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit(&self, query: &AuditQuery) -> StoreResult<AuditPage> {
        let limit = query.limit();
        let offset = query.offset();

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM audit_log");
        push_audit_filters(&mut count, query);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new("SELECT * FROM audit_log");
        push_audit_filters(&mut select, query);
        select
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows: Vec<AuditRow> = select.build_query_as().fetch_all(&self.pool).await?;

        Ok(AuditPage {
            logs: rows.into_iter().map(AuditEntry::from).collect(),
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
            WHERE created_at >= $1 AND created_at < $2
            GROUP BY action
            ORDER BY count DESC, action
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(action, count)| ActionCount { action, count })
            .collect())
    }
}
