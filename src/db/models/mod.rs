//! Normalized domain records.
//!
//! Both storage engines map their rows into these types, so nothing above
//! the store ever sees an engine-specific row shape.

pub mod admin;
pub mod audit;
pub mod claim;
pub mod partner;

pub use admin::*;
pub use audit::*;
pub use claim::*;
pub use partner::*;
