//! Daily partner birthday check.
//!
//! Selection is a pure function of the birth dates and "today"; the job
//! wraps it with a store read and a chat message to the operator, and can
//! be driven by a cron schedule or triggered by hand.

use chrono::{Datelike, Local, NaiveDate, Utc};
use cron::Schedule;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::BirthdayConfig;
use crate::db::{actions, actor_types, BirthdayEntry, NewAuditEntry, Store, StoreResult};
use crate::notifications::{ChannelOutcome, NotificationService};

/// Whether a birth date is celebrated on `today`. Feb 29 birthdays fall on
/// Feb 28 in non-leap years.
pub fn celebrates_on(birth_date: NaiveDate, today: NaiveDate) -> bool {
    if birth_date.month() == today.month() && birth_date.day() == today.day() {
        return true;
    }
    let leap = NaiveDate::from_ymd_opt(today.year(), 2, 29).is_some();
    !leap && birth_date.month() == 2 && birth_date.day() == 29 && today.month() == 2 && today.day() == 28
}

/// Active partners whose birthday is `today`, by name
pub fn birthdays_on(entries: &[BirthdayEntry], today: NaiveDate) -> Vec<BirthdayEntry> {
    let mut matches: Vec<BirthdayEntry> = entries
        .iter()
        .filter(|e| e.active && celebrates_on(e.birth_date, today))
        .cloned()
        .collect();
    matches.sort_by(|a, b| a.name.cmp(&b.name));
    matches
}

/// Calendar order (month, day), then name
pub fn sort_by_calendar(entries: &mut [BirthdayEntry]) {
    entries.sort_by(|a, b| {
        (a.birth_date.month(), a.birth_date.day(), &a.name).cmp(&(
            b.birth_date.month(),
            b.birth_date.day(),
            &b.name,
        ))
    });
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BirthdayReport {
    pub date: NaiveDate,
    pub partners: Vec<BirthdayEntry>,
    /// Absent when nobody has a birthday
    pub notification: Option<ChannelOutcome>,
}

pub struct BirthdayJob {
    store: Arc<dyn Store>,
    notifier: Arc<NotificationService>,
    config: BirthdayConfig,
}

impl BirthdayJob {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<NotificationService>, config: BirthdayConfig) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    /// Check one day and message the operator chat when there are matches
    pub async fn run_once(&self, today: NaiveDate) -> StoreResult<BirthdayReport> {
        let entries = self.store.partner_birthdays().await?;
        let partners = birthdays_on(&entries, today);

        if partners.is_empty() {
            tracing::info!(date = %today, "No partner birthdays today");
            return Ok(BirthdayReport {
                date: today,
                partners,
                notification: None,
            });
        }

        let names: Vec<String> = partners.iter().map(|p| p.name.clone()).collect();
        let outcome = self
            .notifier
            .birthday_digest(self.config.chat_id.as_deref(), &names, today)
            .await;
        tracing::info!(date = %today, count = partners.len(), outcome = ?outcome, "Birthday digest processed");

        Ok(BirthdayReport {
            date: today,
            partners,
            notification: Some(outcome),
        })
    }

    /// Run on the configured schedule in local time until the task is aborted.
    /// Returns `None` when the job is disabled.
    pub fn spawn(self: Arc<Self>) -> anyhow::Result<Option<JoinHandle<()>>> {
        if !self.config.enabled {
            tracing::info!("Birthday check disabled");
            return Ok(None);
        }
        let schedule = Schedule::from_str(&self.config.schedule)
            .map_err(|e| anyhow::anyhow!("Invalid birthday schedule '{}': {}", self.config.schedule, e))?;

        tracing::info!(schedule = %self.config.schedule, "Birthday check scheduled");

        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Local).next() else {
                    tracing::warn!("Birthday schedule has no upcoming runs, stopping");
                    return;
                };
                let wait = (next - Local::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                let today = Local::now().date_naive();
                match self.run_once(today).await {
                    Ok(report) => self.record(&report).await,
                    Err(e) => tracing::warn!(error = %e, "Birthday check failed"),
                }
            }
        });
        Ok(Some(handle))
    }

    async fn record(&self, report: &BirthdayReport) {
        let entry = NewAuditEntry {
            actor_type: actor_types::SYSTEM.to_string(),
            actor_name: Some("scheduler".to_string()),
            action: actions::BIRTHDAY_CHECK.to_string(),
            details: Some(serde_json::json!({
                "date": report.date,
                "count": report.partners.len(),
            })),
            ..Default::default()
        };
        if let Err(e) = self.store.append_audit(&entry, Utc::now()).await {
            tracing::warn!(error = %e, "Failed to write audit entry");
        }
    }
}
