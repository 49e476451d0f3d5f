//! Claim publication.
//!
//! Publishing moves drafts to published in the store and then sends each
//! affected partner a digest of their new documents. Notification results
//! are reported per partner and per channel; a failed send never fails
//! the publication itself.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::db::{period_label, PublishedClaim, Store, StoreResult};
use crate::notifications::{ChannelOutcome, DocumentLine, NotificationService, Recipient};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartnerNotification {
    pub partner_id: i64,
    pub partner_name: String,
    /// Newly published documents in the digest
    pub documents: usize,
    pub email: ChannelOutcome,
    pub telegram: ChannelOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedPartner {
    pub partner_id: i64,
    pub partner_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReport {
    /// Claims that actually moved from draft to published
    pub published_count: usize,
    pub notifications: Vec<PartnerNotification>,
    pub skipped_partners: Vec<SkippedPartner>,
}

pub struct PublicationService {
    store: Arc<dyn Store>,
    notifier: Arc<NotificationService>,
}

impl PublicationService {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<NotificationService>) -> Self {
        Self { store, notifier }
    }

    /// Publish the given drafts. Unknown or already published ids are skipped.
    pub async fn publish(&self, ids: &[i64], now: DateTime<Utc>) -> StoreResult<PublishReport> {
        let published = self.store.publish_claims(ids, now).await?;
        let mut report = PublishReport {
            published_count: published.len(),
            ..Default::default()
        };

        for (first, documents) in group_by_partner(published) {
            let partner_id = first.partner_id;
            if !first.partner_active {
                info!(partner_id, "Partner inactive, publication digest not sent");
                report.skipped_partners.push(SkippedPartner {
                    partner_id,
                    partner_name: first.partner_name.clone(),
                    reason: "inactive".to_string(),
                });
                continue;
            }

            let delivery = self
                .notifier
                .documents_published(
                    Recipient {
                        name: &first.partner_name,
                        email: Some(first.partner_email.as_str()).filter(|e| !e.is_empty()),
                        telegram: first.partner_telegram.as_deref(),
                    },
                    &documents,
                )
                .await;

            report.notifications.push(PartnerNotification {
                partner_id,
                partner_name: first.partner_name.clone(),
                documents: documents.len(),
                email: delivery.email,
                telegram: delivery.telegram,
            });
        }

        info!(
            requested = ids.len(),
            published = report.published_count,
            notified = report.notifications.len(),
            "Claims published"
        );
        Ok(report)
    }

    /// Move published claims back to draft; returns how many moved
    pub async fn unpublish(&self, ids: &[i64]) -> StoreResult<u64> {
        let count = self.store.unpublish_claims(ids).await?;
        info!(requested = ids.len(), unpublished = count, "Claims unpublished");
        Ok(count)
    }

    /// Delete a claim with its document. Published claims need `force`.
    pub async fn delete(&self, id: i64, force: bool) -> StoreResult<()> {
        self.store.delete_claim(id, force).await?;
        info!(claim_id = id, force, "Claim deleted");
        Ok(())
    }
}

/// One entry per partner, in order of their first claim: that claim and
/// the digest lines of all their claims
fn group_by_partner(claims: Vec<PublishedClaim>) -> Vec<(PublishedClaim, Vec<DocumentLine>)> {
    let mut groups: Vec<(PublishedClaim, Vec<DocumentLine>)> = Vec::new();
    for claim in claims {
        let line = document_line(&claim);
        match groups.iter_mut().find(|(first, _)| first.partner_id == claim.partner_id) {
            Some((_, lines)) => lines.push(line),
            None => groups.push((claim, vec![line])),
        }
    }
    groups
}

fn document_line(claim: &PublishedClaim) -> DocumentLine {
    DocumentLine {
        file_name: claim
            .filename
            .clone()
            .unwrap_or_else(|| format!("claim-{}", claim.claim_id)),
        period: period_label(claim.period_start, claim.period_end),
        amount: format!("{:.2}", claim.amount),
        currency: claim.currency.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewClaim, NewDocument, NewPartner, PartnerUpdate, StoreError};
    use crate::notifications::{ChatRecipient, Disabled};
    use crate::test_support::{memory_store, RecordingChat, RecordingMailer};
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 5, 9, 0, 0).unwrap()
    }

    async fn partner(store: &Arc<dyn Store>, alias: &str, telegram: Option<&str>) -> i64 {
        store
            .create_partner(
                &NewPartner {
                    name: alias.to_uppercase(),
                    email: format!("{}@example.com", alias),
                    telegram: telegram.map(str::to_string),
                    alias: alias.to_string(),
                    birth_date: None,
                    password_hash: None,
                },
                now(),
            )
            .await
            .unwrap()
            .id
    }

    async fn claim(store: &Arc<dyn Store>, partner_id: i64, file: &str) -> i64 {
        let (claim_id, _) = store
            .create_claim_with_document(
                &NewClaim {
                    partner_id,
                    period_start: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                    period_end: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
                    amount: Decimal::new(5_000_000, 2),
                    pay_amount: Decimal::new(5_900_000, 2),
                    tax_amount: Decimal::new(900_000, 2),
                    doc_type: None,
                    full_name: None,
                    currency: "RUB".to_string(),
                    created_at: now(),
                },
                &NewDocument {
                    filename: file.to_string(),
                    content: vec![1, 2, 3],
                    mime_type: "application/vnd.ms-excel".to_string(),
                },
                now(),
            )
            .await
            .unwrap();
        claim_id
    }

    fn service(
        store: Arc<dyn Store>,
        mail: Arc<RecordingMailer>,
        chat: Arc<RecordingChat>,
    ) -> PublicationService {
        let notifier = NotificationService::new(mail, chat, Duration::from_secs(1), "https://portal");
        PublicationService::new(store, Arc::new(notifier))
    }

    #[test]
    fn test_group_by_partner_keeps_first_claim() {
        let published = |claim_id: i64, partner_id: i64, file: Option<&str>| PublishedClaim {
            claim_id,
            partner_id,
            partner_name: format!("P{}", partner_id),
            partner_email: String::new(),
            partner_telegram: None,
            partner_active: true,
            period_start: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
            amount: Decimal::new(1050, 1),
            currency: "RUB".to_string(),
            filename: file.map(str::to_string),
        };

        let groups = group_by_partner(vec![
            published(1, 7, Some("a.xlsx")),
            published(2, 3, None),
            published(3, 7, Some("b.xlsx")),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0.claim_id, 1);
        let files: Vec<&str> = groups[0].1.iter().map(|l| l.file_name.as_str()).collect();
        assert_eq!(files, vec!["a.xlsx", "b.xlsx"]);
        assert_eq!(groups[0].1[0].amount, "105.00");
        assert_eq!(groups[1].0.partner_id, 3);
        assert_eq!(groups[1].1[0].file_name, "claim-2");

        assert!(group_by_partner(Vec::new()).is_empty());
    }

    #[tokio::test]
    async fn test_publish_groups_digests_per_partner() {
        let store = memory_store().await;
        let acme = partner(&store, "acme", Some("1001")).await;
        let beta = partner(&store, "beta", None).await;
        let a1 = claim(&store, acme, "a1.xlsx").await;
        let b1 = claim(&store, beta, "b1.xlsx").await;
        let a2 = claim(&store, acme, "a2.xlsx").await;

        let mail = Arc::new(RecordingMailer::default());
        let chat = Arc::new(RecordingChat::default());
        let service = service(store.clone(), mail.clone(), chat.clone());

        let report = service.publish(&[a1, b1, a2, 999], now()).await.unwrap();
        assert_eq!(report.published_count, 3);
        assert_eq!(report.notifications.len(), 2);

        let acme_note = &report.notifications[0];
        assert_eq!(acme_note.partner_id, acme);
        assert_eq!(acme_note.documents, 2);
        assert_eq!(acme_note.email, ChannelOutcome::Sent);
        assert_eq!(acme_note.telegram, ChannelOutcome::Sent);

        let beta_note = &report.notifications[1];
        assert_eq!(beta_note.telegram, ChannelOutcome::NoRecipient);

        assert_eq!(mail.sent().len(), 2);
        assert!(mail.sent()[0].text.contains("a2.xlsx"));
        assert!(mail.sent()[0].text.contains("50000.00 RUB"));
        assert_eq!(chat.sent()[0].0, ChatRecipient::ChatId(1001));
    }

    #[tokio::test]
    async fn test_republish_is_a_no_op() {
        let store = memory_store().await;
        let acme = partner(&store, "acme", None).await;
        let id = claim(&store, acme, "a.xlsx").await;

        let mail = Arc::new(RecordingMailer::default());
        let service = service(store, mail.clone(), Arc::new(RecordingChat::default()));

        assert_eq!(service.publish(&[id], now()).await.unwrap().published_count, 1);
        let again = service.publish(&[id], now()).await.unwrap();
        assert_eq!(again.published_count, 0);
        assert!(again.notifications.is_empty());
        assert_eq!(mail.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_inactive_partner_skipped() {
        let store = memory_store().await;
        let acme = partner(&store, "acme", Some("1001")).await;
        store
            .update_partner(
                acme,
                &PartnerUpdate {
                    name: "ACME".to_string(),
                    email: "acme@example.com".to_string(),
                    telegram: Some("1001".to_string()),
                    birth_date: None,
                    active: false,
                    alias: None,
                    password_hash: None,
                },
            )
            .await
            .unwrap();
        let id = claim(&store, acme, "a.xlsx").await;

        let mail = Arc::new(RecordingMailer::default());
        let chat = Arc::new(RecordingChat::default());
        let service = service(store.clone(), mail.clone(), chat.clone());

        let report = service.publish(&[id], now()).await.unwrap();
        assert_eq!(report.published_count, 1);
        assert!(report.notifications.is_empty());
        assert_eq!(report.skipped_partners[0].partner_id, acme);
        assert!(mail.sent().is_empty());
        assert!(chat.sent().is_empty());
        assert!(store.get_claim(id).await.unwrap().unwrap().is_published());
    }

    #[tokio::test]
    async fn test_unstarted_handle_reported_without_blocking_email() {
        let store = memory_store().await;
        let acme = partner(&store, "acme", Some("@acme_handle")).await;
        let id = claim(&store, acme, "a.xlsx").await;

        let mail = Arc::new(RecordingMailer::default());
        let chat = Arc::new(RecordingChat::with_unstarted(&["acme_handle"]));
        let service = service(store, mail.clone(), chat);

        let report = service.publish(&[id], now()).await.unwrap();
        let note = &report.notifications[0];
        assert_eq!(note.email, ChannelOutcome::Sent);
        assert!(matches!(note.telegram, ChannelOutcome::Failed(ref reason) if reason.contains("/start")));
    }

    #[tokio::test]
    async fn test_unpublish_and_forced_delete() {
        let store = memory_store().await;
        let acme = partner(&store, "acme", None).await;
        let id = claim(&store, acme, "a.xlsx").await;
        let notifier = NotificationService::new(
            Arc::new(Disabled),
            Arc::new(Disabled),
            Duration::from_secs(1),
            "https://portal",
        );
        let service = PublicationService::new(store.clone(), Arc::new(notifier));

        let report = service.publish(&[id], now()).await.unwrap();
        assert_eq!(report.notifications[0].email, ChannelOutcome::NotConfigured);

        assert!(matches!(service.delete(id, false).await, Err(StoreError::ClaimPublished(_))));
        assert_eq!(service.unpublish(&[id, id]).await.unwrap(), 1);
        assert_eq!(service.unpublish(&[id]).await.unwrap(), 0);

        service.publish(&[id], now()).await.unwrap();
        service.delete(id, true).await.unwrap();
        assert!(store.get_claim(id).await.unwrap().is_none());
        assert!(store.get_claim_document(id).await.unwrap().is_none());
    }
}
