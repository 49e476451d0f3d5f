pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod engine;
pub mod ingest;
pub mod notifications;
pub mod publish;

#[cfg(test)]
mod test_support;

use chrono::Duration;
use config::Config;
use std::sync::Arc;

use crate::auth::{Authenticator, TokenService};
use crate::db::Store;
use crate::engine::BirthdayJob;
use crate::ingest::Ingestor;
use crate::notifications::NotificationService;
use crate::publish::PublicationService;

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub auth: Authenticator,
    pub notifier: Arc<NotificationService>,
    pub ingestor: Ingestor,
    pub publisher: PublicationService,
    pub birthdays: Arc<BirthdayJob>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn Store>, notifier: Arc<NotificationService>) -> Self {
        let tokens = TokenService::new(
            &config.jwt_secret(),
            Duration::minutes(config.auth.token_ttl_minutes),
        );
        let auth = Authenticator::new(store.clone(), tokens, &config.auth);
        let ingestor = Ingestor::new(store.clone(), &config.upload);
        let publisher = PublicationService::new(store.clone(), notifier.clone());
        let birthdays = Arc::new(BirthdayJob::new(
            store.clone(),
            notifier.clone(),
            config.birthdays.clone(),
        ));

        Self {
            config,
            store,
            auth,
            notifier,
            ingestor,
            publisher,
            birthdays,
        }
    }
}
