//! Application layer orchestrating conversions.
//!
//! `ConversionExecutor` is the entry point: it resolves idempotency against the
//! ledger store, drives entries through their state machine and talks to the
//! treasury. `ConversionWorker` is the external poller that makes retries and
//! stale-execution recovery happen without timers inside the executor.

pub mod config;
pub mod executor;
pub mod locks;
pub mod worker;
