//! Input validation for API requests.
//!
//! Validators return `Err(message)` so several of them can be collected
//! into one response with `ValidationErrorBuilder::check`.

use lazy_static::lazy_static;
use regex::Regex;

use crate::auth::{ADMIN_MIN_PASSWORD, PARTNER_MIN_PASSWORD};

lazy_static! {
    /// Partner login alias
    static ref ALIAS_REGEX: Regex = Regex::new(r"^[A-Za-z0-9._-]{3,50}$").unwrap();

    /// Characters kept when deriving an alias from an email local part
    static ref ALIAS_STRIP_REGEX: Regex = Regex::new(r"[^A-Za-z0-9._-]").unwrap();

    static ref EMAIL_REGEX: Regex = Regex::new(
        r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?)+$"
    ).unwrap();

    /// Admin usernames: letters, digits, dots, dashes and underscores
    static ref USERNAME_REGEX: Regex = Regex::new(r"^[A-Za-z0-9._-]{3,50}$").unwrap();

    /// Telegram handle with optional `@`, or a numeric chat id
    static ref TELEGRAM_REGEX: Regex = Regex::new(r"^(@?[A-Za-z][A-Za-z0-9_]{3,31}|-?\d{1,20})$").unwrap();
}

pub fn validate_name(name: &str) -> Result<(), String> {
    let name = name.trim();
    if name.is_empty() {
        return Err("Name is required".to_string());
    }
    if name.chars().count() > 255 {
        return Err("Name is too long (max 255 characters)".to_string());
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<(), String> {
    let email = email.trim();
    if email.is_empty() {
        return Err("Email is required".to_string());
    }
    if email.len() > 255 {
        return Err("Email is too long (max 255 characters)".to_string());
    }
    if !EMAIL_REGEX.is_match(email) {
        return Err("Invalid email format".to_string());
    }
    Ok(())
}

pub fn validate_alias(alias: &str) -> Result<(), String> {
    if !ALIAS_REGEX.is_match(alias) {
        return Err(
            "Alias must be 3-50 characters of latin letters, digits, dots, dashes or underscores"
                .to_string(),
        );
    }
    Ok(())
}

pub fn validate_username(username: &str) -> Result<(), String> {
    if !USERNAME_REGEX.is_match(username.trim()) {
        return Err(
            "Username must be 3-50 characters of latin letters, digits, dots, dashes or underscores"
                .to_string(),
        );
    }
    Ok(())
}

/// Empty values are allowed and mean "no Telegram contact"
pub fn validate_telegram(telegram: Option<&str>) -> Result<(), String> {
    match telegram.map(str::trim).filter(|t| !t.is_empty()) {
        Some(t) if !TELEGRAM_REGEX.is_match(t) => {
            Err("Telegram must be an @username or a numeric chat id".to_string())
        }
        _ => Ok(()),
    }
}

pub fn validate_partner_password(password: &str) -> Result<(), String> {
    if password.chars().count() < PARTNER_MIN_PASSWORD {
        return Err(format!(
            "Password must be at least {} characters",
            PARTNER_MIN_PASSWORD
        ));
    }
    Ok(())
}

pub fn validate_admin_password(password: &str) -> Result<(), String> {
    if password.chars().count() < ADMIN_MIN_PASSWORD {
        return Err(format!(
            "Password must be at least {} characters",
            ADMIN_MIN_PASSWORD
        ));
    }
    Ok(())
}

/// Alias candidate from the local part of an email address. Falls back to
/// "partner" when too little survives.
pub fn alias_base(email: &str) -> String {
    let local = email.trim().split('@').next().unwrap_or_default();
    let mut base: String = ALIAS_STRIP_REGEX.replace_all(local, "").into_owned();
    base.truncate(40);
    if base.len() < 3 {
        "partner".to_string()
    } else {
        base.to_lowercase()
    }
}

/// Trimmed value, `None` when blank
pub fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}
