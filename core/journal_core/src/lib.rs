//! Daily activity journal: category time accounting, notes and shift
//! tracking, persisted per day.

pub mod config;
pub mod error;
pub mod journal;
pub mod ledger;
pub mod model;
pub mod report;
pub mod scheduler;
pub mod session;
pub mod shift;
pub mod store;
pub mod timer;
