//! Finance Report Dispatcher
//!
//! A multi-tenant backend that bridges a personal-finance ledger API, an
//! AI report workflow API, and chat-webhook notifications:
//! - Evaluates per-user daily/weekly/monthly/yearly report triggers on a
//!   recurring tick, firing at most once per recurrence period
//! - Pulls the ledger data window, invokes the report workflow, and
//!   delivers the result to the user's webhook
//! - Accepts signed ledger events and token-guarded transaction ingestion
//!   over HTTP
//!
//! DISPATCH LOOP:
//! TICK → EVALUATE TRIGGERS → CLAIM (user, kind, period) → FETCH → GENERATE → DELIVER → RECORD

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod ledger;
pub mod models;
pub mod notify;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod workflow;

pub use error::{DispatchError, Result};

// Re-export common types
pub use models::*;
