// Postgres storage layer with sqlx
//
// This crate is the effectful half of the FSM: it is the sole writer of
// status columns. Every mutation reads the observed state under a row lock,
// consults jobmon_core::fsm for legality, writes, and appends the audit row,
// all inside one transaction per operation.

pub mod db;
pub mod models;
pub mod repositories;

pub use db::Database;
pub use models::*;
pub use repositories::{
    QueuedBatch, ReapedRun, ResumeOutcome, StopOutcome, UsageReport, WorkflowOverview,
    BULK_UPDATE_CEILING,
};
