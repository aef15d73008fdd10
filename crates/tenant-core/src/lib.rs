//! Core domain logic for the Tenant Runtime Core.
//!
//! Contains the credential vault, its AES-256-GCM crypto primitives, the
//! durable job engine's state machine, cron schedule computation, and
//! integration token lifecycle rules. This crate depends on no storage
//! engine and no `sqlx` feature — everything here is a pure function or an
//! in-memory state transition, so it is unit tested without a database.
//! Persistence for all of it lives in `tenant-server`.

pub mod cron;
pub mod crypto;
pub mod error;
pub mod jobs;
pub mod tokens;
pub mod vault;
