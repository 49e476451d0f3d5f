//! Behaviour every [`Store`] engine must share.
//!
//! Each check creates its own uniquely named rows and only asserts on them,
//! so the same checks run against a fresh in-memory SQLite database and
//! against a long-lived Postgres server.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

use super::*;

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap()
}

fn unique(prefix: &str) -> String {
    format!("{}-{:08x}", prefix, rand::random::<u32>())
}

pub fn new_partner(name: &str, alias: &str) -> NewPartner {
    NewPartner {
        name: name.to_string(),
        email: format!("{}@example.com", alias),
        telegram: None,
        alias: alias.to_string(),
        birth_date: None,
        password_hash: None,
    }
}

pub fn new_claim(partner_id: i64) -> NewClaim {
    NewClaim {
        partner_id,
        period_start: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        period_end: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
        amount: Decimal::from_str("50000.00").unwrap(),
        pay_amount: Decimal::from_str("59000.00").unwrap(),
        tax_amount: Decimal::from_str("9000.00").unwrap(),
        doc_type: Some("act".to_string()),
        full_name: None,
        currency: "RUB".to_string(),
        created_at: now(),
    }
}

pub fn new_document() -> NewDocument {
    NewDocument {
        filename: "january.xlsx".to_string(),
        content: vec![1, 2, 3, 4],
        mime_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_string(),
    }
}

fn unchanged_update(partner: &Partner) -> PartnerUpdate {
    PartnerUpdate {
        name: partner.name.clone(),
        email: partner.email.clone(),
        telegram: None,
        birth_date: None,
        active: true,
        alias: None,
        password_hash: None,
    }
}

/// A partner with one draft claim. Returns (partner id, claim id, document id).
async fn partner_with_claim(store: &dyn Store) -> (i64, i64, i64) {
    let alias = unique("acme");
    let partner = store.create_partner(&new_partner("Acme", &alias), now()).await.unwrap();
    let (claim_id, document_id) = store
        .create_claim_with_document(&new_claim(partner.id), &new_document(), now())
        .await
        .unwrap();
    (partner.id, claim_id, document_id)
}

pub async fn partner_lookup_and_conflicts(store: &dyn Store) {
    let alias = unique("acme");
    let partner = store.create_partner(&new_partner("Acme", &alias), now()).await.unwrap();
    assert_eq!(partner.alias, alias);
    assert!(partner.active);
    assert!(!partner.password_set);
    assert_eq!(partner.created_at, now());

    let by_alias = store.partner_credentials(&alias).await.unwrap().unwrap();
    let by_email = store
        .partner_credentials(&partner.email.to_uppercase())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_alias.partner_id, partner.id);
    assert_eq!(by_email.partner_id, partner.id);
    assert!(store.alias_exists(&alias).await.unwrap());
    assert!(!store.alias_exists(&unique("nobody")).await.unwrap());

    let mut same_email = new_partner("Other", &unique("other"));
    same_email.email = partner.email.clone();
    let err = store.create_partner(&same_email, now()).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    assert!(!store.alias_exists(&same_email.alias).await.unwrap());

    // The partner row must not survive without its login record
    let mut same_alias = new_partner("Other", &alias);
    same_alias.email = format!("{}@example.com", unique("other"));
    let err = store.create_partner(&same_alias, now()).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    assert!(store.find_partner_by_email(&same_alias.email).await.unwrap().is_none());
}

pub async fn partner_update_rules(store: &dyn Store) {
    let taken = unique("acme");
    store.create_partner(&new_partner("Acme", &taken), now()).await.unwrap();
    let other = store
        .create_partner(&new_partner("Other", &unique("other")), now())
        .await
        .unwrap();

    let clash = PartnerUpdate {
        name: "Renamed".to_string(),
        alias: Some(taken),
        ..unchanged_update(&other)
    };
    let err = store.update_partner(other.id, &clash).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    let kept = store.get_partner(other.id).await.unwrap().unwrap();
    assert_eq!(kept.name, "Other");
    assert_eq!(kept.alias, other.alias);

    let err = store.update_partner(-1, &unchanged_update(&other)).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound("partner")));

    let deactivate = PartnerUpdate {
        active: false,
        ..unchanged_update(&other)
    };
    store.update_partner(other.id, &deactivate).await.unwrap();
    assert!(store.partner_credentials(&other.alias).await.unwrap().is_none());
}

pub async fn claim_roundtrip(store: &dyn Store) {
    let (partner_id, claim_id, document_id) = partner_with_claim(store).await;

    let claim = store.get_claim(claim_id).await.unwrap().unwrap();
    assert_eq!(claim.partner_id, partner_id);
    assert_eq!(claim.amount.to_string(), "50000.00");
    assert_eq!(claim.pay_amount.to_string(), "59000.00");
    assert_eq!(claim.tax_amount.to_string(), "9000.00");
    assert_eq!(claim.period_end, NaiveDate::from_ymd_opt(2026, 1, 31).unwrap());
    assert!(!claim.is_published());
    let document = claim.document.unwrap();
    assert_eq!(document.id, document_id);
    assert_eq!(document.size, 4);

    let unpublished = store.get_unpublished_claims().await.unwrap();
    assert!(unpublished.iter().any(|c| c.id == claim_id));
    assert!(store.get_partner_claims(partner_id).await.unwrap().is_empty());
    let all = store.list_partner_claims(partner_id).await.unwrap();
    assert_eq!(all.len(), 1);

    let draft_id = store.create_claim(&new_claim(partner_id)).await.unwrap();
    let saved = store.save_document(draft_id, &new_document(), now()).await.unwrap();
    let stored = store.get_claim_document(draft_id).await.unwrap().unwrap();
    assert_eq!(stored.id, saved);
    assert_eq!(stored.content, vec![1, 2, 3, 4]);
}

pub async fn publish_and_unpublish(store: &dyn Store) {
    let (partner_id, claim_id, _) = partner_with_claim(store).await;

    let first = store.publish_claims(&[claim_id, claim_id, -1], now()).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].partner_id, partner_id);
    assert_eq!(first[0].filename.as_deref(), Some("january.xlsx"));

    let later = now() + Duration::hours(1);
    assert!(store.publish_claims(&[claim_id], later).await.unwrap().is_empty());

    // The original publication time is kept
    let claim = store.get_claim(claim_id).await.unwrap().unwrap();
    assert_eq!(claim.published_at, Some(now()));
    let published = store.get_partner_claims(partner_id).await.unwrap();
    assert_eq!(published.len(), 1);
    assert!(store
        .get_published_claims()
        .await
        .unwrap()
        .iter()
        .any(|c| c.id == claim_id));

    assert_eq!(store.unpublish_claims(&[claim_id, claim_id]).await.unwrap(), 1);
    assert_eq!(store.unpublish_claims(&[claim_id]).await.unwrap(), 0);
    let claim = store.get_claim(claim_id).await.unwrap().unwrap();
    assert!(claim.published_at.is_none());
}

pub async fn delete_claim_rules(store: &dyn Store) {
    let (_, claim_id, document_id) = partner_with_claim(store).await;
    store.publish_claims(&[claim_id], now()).await.unwrap();

    let err = store.delete_claim(claim_id, false).await.unwrap_err();
    assert!(matches!(err, StoreError::ClaimPublished(id) if id == claim_id));
    assert!(store.get_claim(claim_id).await.unwrap().is_some());

    store.delete_claim(claim_id, true).await.unwrap();
    assert!(store.get_claim(claim_id).await.unwrap().is_none());
    assert!(store.get_document(document_id, None).await.unwrap().is_none());

    let (_, draft_id, draft_document) = partner_with_claim(store).await;
    store.delete_claim(draft_id, false).await.unwrap();
    assert!(store.get_document(draft_document, None).await.unwrap().is_none());
    let err = store.delete_claim(draft_id, false).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound("claim")));
}

pub async fn scoped_document_access(store: &dyn Store) {
    let (partner_id, claim_id, document_id) = partner_with_claim(store).await;
    let other = store
        .create_partner(&new_partner("Other", &unique("other")), now())
        .await
        .unwrap();

    // Unpublished: invisible to the owner, visible without scope
    assert!(store.get_document(document_id, Some(partner_id)).await.unwrap().is_none());
    assert!(store.get_document(document_id, None).await.unwrap().is_some());

    store.publish_claims(&[claim_id], now()).await.unwrap();

    let own = store.get_document(document_id, Some(partner_id)).await.unwrap().unwrap();
    assert_eq!(own.partner_id, partner_id);
    assert_eq!(own.filename, "january.xlsx");
    assert!(store.get_document(document_id, Some(other.id)).await.unwrap().is_none());
}

pub async fn delete_partner_cascades(store: &dyn Store) {
    let (partner_id, claim_id, document_id) = partner_with_claim(store).await;
    let token = unique("token");
    store
        .create_reset_token(partner_id, &token, now() + Duration::hours(1), now())
        .await
        .unwrap();

    assert!(store.delete_partner(partner_id).await.unwrap());
    assert!(store.get_partner(partner_id).await.unwrap().is_none());
    assert!(store.get_claim(claim_id).await.unwrap().is_none());
    assert!(store.get_document(document_id, None).await.unwrap().is_none());
    assert!(store.reset_token_owner(&token, now()).await.unwrap().is_none());
    assert!(!store.delete_partner(partner_id).await.unwrap());
}

pub async fn reset_tokens(store: &dyn Store) {
    let alias = unique("acme");
    let partner = store.create_partner(&new_partner("Acme", &alias), now()).await.unwrap();
    let token = unique("token");
    store
        .create_reset_token(partner.id, &token, now() + Duration::hours(1), now())
        .await
        .unwrap();

    let owner = store.reset_token_owner(&token, now()).await.unwrap().unwrap();
    assert_eq!(owner.partner_id, partner.id);

    store
        .record_partner_failure(partner.id, 5, Some(now() + Duration::minutes(30)))
        .await
        .unwrap();
    let redeemed = store.redeem_reset_token(&token, "new-hash", now()).await.unwrap();
    assert_eq!(redeemed, Some(partner.id));
    assert_eq!(store.redeem_reset_token(&token, "again", now()).await.unwrap(), None);

    let credentials = store.partner_credentials(&alias).await.unwrap().unwrap();
    assert_eq!(credentials.password_hash.as_deref(), Some("new-hash"));
    assert!(credentials.activated);
    assert!(credentials.locked_until.is_none());

    let expired = unique("expired");
    store
        .create_reset_token(partner.id, &expired, now() - Duration::minutes(1), now() - Duration::hours(1))
        .await
        .unwrap();
    assert!(store.reset_token_owner(&expired, now()).await.unwrap().is_none());
    assert_eq!(store.redeem_reset_token(&expired, "hash", now()).await.unwrap(), None);
}

pub async fn login_bookkeeping(store: &dyn Store) {
    let alias = unique("acme");
    let partner = store.create_partner(&new_partner("Acme", &alias), now()).await.unwrap();

    let lock = now() + Duration::minutes(30);
    store.record_partner_failure(partner.id, 5, Some(lock)).await.unwrap();
    let credentials = store.partner_credentials(&alias).await.unwrap().unwrap();
    assert_eq!(credentials.failed_attempts, 5);
    assert_eq!(credentials.locked_until, Some(lock));

    store.record_partner_login(partner.id, now()).await.unwrap();
    let credentials = store.partner_credentials(&alias).await.unwrap().unwrap();
    assert_eq!(credentials.failed_attempts, 0);
    assert!(credentials.locked_until.is_none());
    let partner = store.get_partner(partner.id).await.unwrap().unwrap();
    assert_eq!(partner.last_visit_at, Some(now()));

    let username = unique("operator");
    let admin_id = store
        .create_admin(
            &NewAdmin {
                username: username.clone(),
                email: None,
                password_hash: "x".to_string(),
                role: AdminRole::Admin,
            },
            now(),
        )
        .await
        .unwrap();
    store.record_admin_failure(admin_id, 3, Some(lock)).await.unwrap();
    let admin = store.get_admin_by_username(&username).await.unwrap().unwrap();
    assert_eq!(admin.failed_attempts, 3);
    assert_eq!(admin.locked_until, Some(lock));

    store.record_admin_login(admin_id, now()).await.unwrap();
    let admin = store.get_admin(admin_id).await.unwrap().unwrap();
    assert_eq!(admin.failed_attempts, 0);
    assert!(admin.locked_until.is_none());
    assert_eq!(admin.last_login_at, Some(now()));
}

pub async fn admin_accounts(store: &dyn Store) {
    let new_admin = |username: &str, role: AdminRole| NewAdmin {
        username: username.to_string(),
        email: None,
        password_hash: "x".to_string(),
        role,
    };
    let root_name = unique("root");
    let helper_name = unique("helper");
    let root = store
        .create_admin(&new_admin(&root_name, AdminRole::SuperAdmin), now())
        .await
        .unwrap();
    let helper = store
        .create_admin(&new_admin(&helper_name, AdminRole::Admin), now())
        .await
        .unwrap();

    let duplicate = store.create_admin(&new_admin(&helper_name, AdminRole::Admin), now()).await;
    assert!(matches!(duplicate, Err(StoreError::Conflict(_))));

    assert!(store
        .update_admin(helper, &helper_name, Some("helper@example.com"), AdminRole::Admin)
        .await
        .unwrap());
    assert!(store.set_admin_password(helper, "y").await.unwrap());
    let updated = store.get_admin(helper).await.unwrap().unwrap();
    assert_eq!(updated.email.as_deref(), Some("helper@example.com"));
    assert_eq!(updated.password_hash, "y");

    assert!(!store.delete_admin(root).await.unwrap());
    assert!(store.delete_admin(helper).await.unwrap());
    assert!(store.get_admin(helper).await.unwrap().is_none());
    assert!(store.get_admin(root).await.unwrap().unwrap().is_super_admin());
}
