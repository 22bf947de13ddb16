// src/store/mod.rs

//! SQLite-backed job store.
//!
//! Writer discipline: the dispatcher moves jobs
//! `awaiting_dispatch → dispatching → dispatched`; the watcher owns every
//! transition after `dispatched`.
//!
//! One exception: killing a task whose job is still `awaiting_dispatch`
//! fails the row directly ([`JobStore::cancel_awaiting`]). The update is
//! conditional on `awaiting_dispatch`, so it loses any race with the
//! dispatcher's claim and never touches a job a backend knows about.

mod core;
mod jobs;

pub use self::core::{JobRecord, JobStore, NewJob};
