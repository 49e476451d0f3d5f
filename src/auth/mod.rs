//! Credential checks, lockout and password reset tokens.

mod token;

pub use token::{Role, TokenClaims, TokenError, TokenService};

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::AuthConfig;
use crate::db::{AdminRole, NewAdmin, Store, StoreError};

pub const PARTNER_MIN_PASSWORD: usize = 6;
pub const ADMIN_MIN_PASSWORD: usize = 8;

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a password against a hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

/// Random reset token handed to the partner
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}

/// Digest of a reset token, the only form that is stored
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    pub max_attempts: i64,
    pub lock_duration: Duration,
}

impl LockoutPolicy {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            max_attempts: config.max_failed_attempts,
            lock_duration: Duration::minutes(config.lockout_minutes),
        }
    }

    /// Whole minutes left on an active lock, rounded up
    pub fn remaining_minutes(&self, locked_until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
        let until = locked_until.filter(|until| *until > now)?;
        let seconds = (until - now).num_seconds();
        Some(((seconds + 59) / 60).max(1))
    }

    /// New failure count and lock after a wrong password. A lapsed lock
    /// starts the count over.
    pub fn register_failure(
        &self,
        failed_attempts: i64,
        locked_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> (i64, Option<DateTime<Utc>>) {
        let previous = match locked_until {
            Some(until) if until <= now => 0,
            _ => failed_attempts,
        };
        let attempts = previous + 1;
        let lock = (attempts >= self.max_attempts).then(|| now + self.lock_duration);
        (attempts, lock)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account is locked. Try again in {minutes} minutes")]
    Locked { minutes: i64 },

    #[error("Account is not activated. Set a password using the link from the invitation email")]
    Inactive,

    #[error("Invalid or expired reset token")]
    InvalidResetToken,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("password hashing failed: {0}")]
    Hash(String),
}

impl From<argon2::password_hash::Error> for AuthError {
    fn from(e: argon2::password_hash::Error) -> Self {
        AuthError::Hash(e.to_string())
    }
}

/// Identity returned with a fresh token
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    /// Partner alias or admin username
    pub login: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_role: Option<AdminRole>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthSession {
    pub token: String,
    pub user: AuthUser,
}

pub struct Authenticator {
    store: Arc<dyn Store>,
    tokens: TokenService,
    lockout: LockoutPolicy,
    reset_ttl: Duration,
}

impl Authenticator {
    pub fn new(store: Arc<dyn Store>, tokens: TokenService, config: &AuthConfig) -> Self {
        Self {
            store,
            tokens,
            lockout: LockoutPolicy::from_config(config),
            reset_ttl: Duration::minutes(config.reset_token_ttl_minutes),
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn reset_ttl_minutes(&self) -> i64 {
        self.reset_ttl.num_minutes()
    }

    /// Partner login by alias or email. The lock is checked before the
    /// password so a locked account never reveals whether it was right.
    pub async fn authenticate_partner(
        &self,
        login: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthSession, AuthError> {
        let credentials = self
            .store
            .partner_credentials(login.trim())
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if let Some(minutes) = self.lockout.remaining_minutes(credentials.locked_until, now) {
            return Err(AuthError::Locked { minutes });
        }

        let Some(hash) = credentials.password_hash.as_deref() else {
            return Err(AuthError::Inactive);
        };

        if !verify_password(password, hash) {
            let (attempts, lock) =
                self.lockout
                    .register_failure(credentials.failed_attempts, credentials.locked_until, now);
            self.store
                .record_partner_failure(credentials.partner_id, attempts, lock)
                .await?;
            if lock.is_some() {
                warn!(partner_id = credentials.partner_id, attempts, "Partner account locked");
            }
            return Err(AuthError::InvalidCredentials);
        }

        if !credentials.activated {
            return Err(AuthError::Inactive);
        }

        self.store.record_partner_login(credentials.partner_id, now).await?;
        let token = self
            .tokens
            .issue(credentials.partner_id, Role::Partner, &credentials.name, now)?;

        Ok(AuthSession {
            token,
            user: AuthUser {
                id: credentials.partner_id,
                name: credentials.name,
                email: Some(credentials.email),
                login: credentials.alias,
                role: Role::Partner,
                admin_role: None,
            },
        })
    }

    /// Admin login. Admins are locked out the same way partners are.
    pub async fn authenticate_admin(
        &self,
        username: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthSession, AuthError> {
        let admin = self
            .store
            .get_admin_by_username(username.trim())
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if let Some(minutes) = self.lockout.remaining_minutes(admin.locked_until, now) {
            return Err(AuthError::Locked { minutes });
        }

        if !verify_password(password, &admin.password_hash) {
            let (attempts, lock) =
                self.lockout
                    .register_failure(admin.failed_attempts, admin.locked_until, now);
            self.store.record_admin_failure(admin.id, attempts, lock).await?;
            if lock.is_some() {
                warn!(admin_id = admin.id, attempts, "Admin account locked");
            }
            return Err(AuthError::InvalidCredentials);
        }

        self.store.record_admin_login(admin.id, now).await?;
        let token = self.tokens.issue(admin.id, Role::Admin, &admin.username, now)?;

        Ok(AuthSession {
            token,
            user: AuthUser {
                id: admin.id,
                name: admin.username.clone(),
                email: admin.email,
                login: admin.username,
                role: Role::Admin,
                admin_role: Some(admin.role),
            },
        })
    }

    /// Create a reset token for the partner. Returns the plain token; only
    /// its digest is stored.
    pub async fn issue_reset_token(&self, partner_id: i64, now: DateTime<Utc>) -> Result<String, AuthError> {
        let token = generate_token();
        self.store
            .create_reset_token(partner_id, &hash_token(&token), now + self.reset_ttl, now)
            .await?;
        Ok(token)
    }

    /// Set a new password with a reset token. The token is consumed in the
    /// same step.
    pub async fn reset_password(
        &self,
        token: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, AuthError> {
        let password_hash = hash_password(password)?;
        let partner_id = self
            .store
            .redeem_reset_token(&hash_token(token), &password_hash, now)
            .await?
            .ok_or(AuthError::InvalidResetToken)?;

        info!(partner_id, "Partner password set via reset token");
        Ok(partner_id)
    }
}

/// Create the first super-admin from configuration when no admin exists yet.
/// Returns the new admin id, or `None` when nothing was created.
pub async fn ensure_super_admin(store: &dyn Store, config: &AuthConfig, now: DateTime<Utc>) -> anyhow::Result<Option<i64>> {
    if store.count_admins().await? > 0 {
        return Ok(None);
    }
    let Some(password) = config.admin_password.as_deref().filter(|p| !p.is_empty()) else {
        warn!("No administrators exist and auth.admin_password is not set; admin login is unavailable");
        return Ok(None);
    };

    let password_hash = hash_password(password).map_err(|e| anyhow::anyhow!("Failed to hash admin password: {}", e))?;
    let id = store
        .create_admin(
            &NewAdmin {
                username: config.admin_username.clone(),
                email: config.admin_email.clone(),
                password_hash,
                role: AdminRole::SuperAdmin,
            },
            now,
        )
        .await?;
    info!(admin_id = id, username = %config.admin_username, "Initial super-admin created");
    Ok(Some(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewPartner, PartnerUpdate, SqliteStore};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
    }

    fn policy() -> LockoutPolicy {
        LockoutPolicy {
            max_attempts: 5,
            lock_duration: Duration::minutes(30),
        }
    }

    async fn authenticator_with_partner(password: Option<&str>) -> (Authenticator, Arc<dyn Store>, i64) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let partner = store
            .create_partner(
                &NewPartner {
                    name: "Acme".to_string(),
                    email: "acme@example.com".to_string(),
                    telegram: None,
                    alias: "acme".to_string(),
                    birth_date: None,
                    password_hash: password.map(|p| hash_password(p).unwrap()),
                },
                now(),
            )
            .await
            .unwrap();

        let tokens = TokenService::new("test-secret", Duration::minutes(30));
        let auth = Authenticator::new(store.clone(), tokens, &AuthConfig::default());
        (auth, store, partner.id)
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong", &hash));
        assert!(!verify_password("anything", "not-a-hash"));
    }

    #[test]
    fn test_token_digest_is_stable() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert_eq!(hash_token(&token), hash_token(&token));
        assert_ne!(hash_token(&token), token);
    }

    #[test]
    fn test_remaining_minutes_rounds_up() {
        let policy = policy();
        let until = now() + Duration::seconds(61);
        assert_eq!(policy.remaining_minutes(Some(until), now()), Some(2));
        assert_eq!(policy.remaining_minutes(Some(now()), now()), None);
        assert_eq!(policy.remaining_minutes(None, now()), None);
    }

    #[test]
    fn test_register_failure_locks_at_threshold() {
        let policy = policy();
        assert_eq!(policy.register_failure(3, None, now()), (4, None));
        assert_eq!(
            policy.register_failure(4, None, now()),
            (5, Some(now() + Duration::minutes(30)))
        );
        // Lapsed lock restarts the count
        let lapsed = now() - Duration::minutes(1);
        assert_eq!(policy.register_failure(5, Some(lapsed), now()), (1, None));
    }

    #[tokio::test]
    async fn test_partner_login_by_alias_and_email() {
        let (auth, _, partner_id) = authenticator_with_partner(Some("secret1")).await;

        let session = auth.authenticate_partner("acme", "secret1", now()).await.unwrap();
        assert_eq!(session.user.id, partner_id);
        assert_eq!(session.user.login, "acme");

        let session = auth
            .authenticate_partner("ACME@example.com", "secret1", Utc::now())
            .await
            .unwrap();
        let claims = auth.tokens().verify(&session.token).unwrap();
        assert_eq!(claims.sub, partner_id);
        assert_eq!(claims.role, Role::Partner);
    }

    #[tokio::test]
    async fn test_unknown_login_is_generic() {
        let (auth, _, _) = authenticator_with_partner(Some("secret1")).await;
        let err = auth.authenticate_partner("nobody", "secret1", now()).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_lockout_after_five_failures_blocks_correct_password() {
        let (auth, store, _) = authenticator_with_partner(Some("secret1")).await;

        for _ in 0..5 {
            let err = auth.authenticate_partner("acme", "wrong", now()).await.unwrap_err();
            assert!(matches!(err, AuthError::InvalidCredentials));
        }

        let err = auth.authenticate_partner("acme", "secret1", now()).await.unwrap_err();
        assert!(matches!(err, AuthError::Locked { minutes: 30 }));

        // The rejected attempt leaves the counter alone
        let credentials = store.partner_credentials("acme").await.unwrap().unwrap();
        assert_eq!(credentials.failed_attempts, 5);

        let later = now() + Duration::minutes(31);
        auth.authenticate_partner("acme", "secret1", later).await.unwrap();
        let credentials = store.partner_credentials("acme").await.unwrap().unwrap();
        assert_eq!(credentials.failed_attempts, 0);
    }

    #[tokio::test]
    async fn test_partner_without_password_is_inactive() {
        let (auth, _, _) = authenticator_with_partner(None).await;
        let err = auth.authenticate_partner("acme", "whatever", now()).await.unwrap_err();
        assert!(matches!(err, AuthError::Inactive));
    }

    #[tokio::test]
    async fn test_deactivated_partner_cannot_login() {
        let (auth, store, partner_id) = authenticator_with_partner(Some("secret1")).await;
        store
            .update_partner(
                partner_id,
                &PartnerUpdate {
                    name: "Acme".to_string(),
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

        let err = auth.authenticate_partner("acme", "secret1", now()).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_reset_token_sets_password_once() {
        let (auth, _, partner_id) = authenticator_with_partner(None).await;

        let token = auth.issue_reset_token(partner_id, now()).await.unwrap();
        assert_eq!(auth.reset_password(&token, "newpass", now()).await.unwrap(), partner_id);
        assert!(matches!(
            auth.reset_password(&token, "again!", now()).await,
            Err(AuthError::InvalidResetToken)
        ));

        auth.authenticate_partner("acme", "newpass", now()).await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_token_expires() {
        let (auth, _, partner_id) = authenticator_with_partner(None).await;
        let token = auth.issue_reset_token(partner_id, now()).await.unwrap();

        let late = now() + Duration::minutes(61);
        assert!(matches!(
            auth.reset_password(&token, "newpass", late).await,
            Err(AuthError::InvalidResetToken)
        ));
    }

    #[tokio::test]
    async fn test_admin_login_and_lockout() {
        let (auth, store, _) = authenticator_with_partner(None).await;
        store
            .create_admin(
                &NewAdmin {
                    username: "root".to_string(),
                    email: None,
                    password_hash: hash_password("rootpass").unwrap(),
                    role: AdminRole::SuperAdmin,
                },
                now(),
            )
            .await
            .unwrap();

        let session = auth.authenticate_admin("root", "rootpass", now()).await.unwrap();
        assert_eq!(session.user.role, Role::Admin);
        assert_eq!(session.user.admin_role, Some(AdminRole::SuperAdmin));

        for _ in 0..5 {
            let _ = auth.authenticate_admin("root", "nope", now()).await;
        }
        let err = auth.authenticate_admin("root", "rootpass", now()).await.unwrap_err();
        assert!(matches!(err, AuthError::Locked { .. }));
    }

    #[tokio::test]
    async fn test_super_admin_bootstrap_runs_once() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let mut config = AuthConfig::default();

        // Without a configured password nothing is created
        assert_eq!(ensure_super_admin(store.as_ref(), &config, now()).await.unwrap(), None);
        assert_eq!(store.count_admins().await.unwrap(), 0);

        config.admin_password = Some("bootstrap-pass".to_string());
        let id = ensure_super_admin(store.as_ref(), &config, now()).await.unwrap().unwrap();
        let admin = store.get_admin(id).await.unwrap().unwrap();
        assert_eq!(admin.username, config.admin_username);
        assert!(admin.is_super_admin());
        assert!(verify_password("bootstrap-pass", &admin.password_hash));

        assert_eq!(ensure_super_admin(store.as_ref(), &config, now()).await.unwrap(), None);
        assert_eq!(store.count_admins().await.unwrap(), 1);
    }
}
