//! Background jobs.

pub mod birthdays;

pub use birthdays::{birthdays_on, BirthdayJob, BirthdayReport};
