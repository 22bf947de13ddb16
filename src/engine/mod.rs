// src/engine/mod.rs

//! Background job engine.
//!
//! - [`dispatcher`] claims `awaiting_dispatch` jobs and submits them.
//! - [`watcher`] polls backends and moves jobs to their terminal status.
//!
//! Both loops share nothing but the job store.

pub mod dispatcher;
pub mod watcher;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::backend::Backends;
use crate::config::model::ConfigSection;
use crate::store::JobStore;

pub use dispatcher::Dispatcher;
pub use watcher::Watcher;

/// Running dispatcher and watcher loops.
pub struct Engine {
    shutdown: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

impl Engine {
    pub fn start(store: JobStore, backends: Backends, cfg: &ConfigSection) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(store.clone(), backends.clone(), cfg).start(rx.clone());
        let watcher = Watcher::new(store, backends, cfg).start(rx);
        Self {
            shutdown,
            dispatcher,
            watcher,
        }
    }

    /// Stop both loops and wait for them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, handle) in [("dispatcher", self.dispatcher), ("watcher", self.watcher)] {
            if let Err(e) = handle.await {
                warn!(loop_name = name, error = %e, "engine loop ended abnormally");
            }
        }
    }
}
