//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Instant;

use nearguard_core::{Config, ControllerHandle};

/// Shared application state.
pub type SharedState = Arc<AppState>;

/// Handle to the running tracker plus the configuration it was built from.
pub struct AppState {
    controller: ControllerHandle,
    config: Config,
    started_at: Instant,
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub fn new(controller: ControllerHandle, config: Config) -> SharedState {
        Arc::new(Self {
            controller,
            config,
            started_at: Instant::now(),
        })
    }

    /// Front end of the controller task.
    #[must_use]
    pub const fn controller(&self) -> &ControllerHandle {
        &self.controller
    }

    /// Configuration loaded at startup.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Seconds since the state was created.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
