//! Shared domain types for the deckhand supervisor.
//!
//! These types describe the persisted registry document. They are kept in a
//! separate crate so that tooling which only reads the registry (status
//! exporters, the CLI's read-only views) does not need the process and HTTP
//! machinery of the main crate.

pub mod app;

pub use app::{
    AppRecord, ExitOutcome, Meta, RegistryDocument, RunStatus, Runtime, ScheduledCommand,
    Settings, CRASH_DETECTED, LOCAL_REPO,
};
