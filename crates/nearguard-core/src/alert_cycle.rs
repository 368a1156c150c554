//! Bounded out-of-range notification cycle.
//!
//! # State Machine
//!
//! ```text
//!            OutOfRange edge (device present)
//!   Idle ──────────────────────────────────────► Firing
//!    ▲        fire #1 now, next at +period         │
//!    │                                             │ tick: fire, count += 1
//!    │   InRange edge / stop() / count == max      │ reschedule at deadline + period
//!    └─────────────────────────────────────────────┘
//! ```
//!
//! The manager holds no timer of its own. Its owner asks for
//! [`next_deadline`](AlertCycleManager::next_deadline), sleeps until then and
//! calls [`on_tick`](AlertCycleManager::on_tick). Clearing the cycle state is
//! therefore a synchronous cancellation of the pending tick.
//!
//! A fire is a local notification delivered through a [`Notifier`]. It does not
//! touch the beacon connection.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AlertConfig;
use crate::types::RangeEdge;

/// Sink for local out-of-range notifications.
pub trait Notifier: Send {
    /// Deliver notification number `fired` (1-based) of at most `max_fires`.
    fn fire(&mut self, fired: u32, max_fires: u32);
}

/// [`Notifier`] that writes each fire to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn fire(&mut self, fired: u32, max_fires: u32) {
        warn!(fired, max_fires, "Beacon out of range");
    }
}

/// State of a running cycle. Exists only while firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertCycleState {
    /// Fires delivered so far in this episode.
    pub fired_count: u32,
    /// When the next fire is due.
    pub next_fire_at: Instant,
}

/// Turns range edges into a self-terminating series of notifications.
pub struct AlertCycleManager {
    max_fires: u32,
    period: Duration,
    cycle: Option<AlertCycleState>,
    notifier: Box<dyn Notifier>,
}

impl AlertCycleManager {
    /// Create an idle manager.
    pub fn new(max_fires: u32, period: Duration, notifier: Box<dyn Notifier>) -> Self {
        Self {
            max_fires: max_fires.max(1),
            period,
            cycle: None,
            notifier,
        }
    }

    /// Create an idle manager from the `[alert]` configuration section.
    pub fn from_config(config: &AlertConfig, notifier: Box<dyn Notifier>) -> Self {
        Self::new(config.max_fires, config.period(), notifier)
    }

    /// React to a range flag flip.
    ///
    /// An out-of-range edge starts a cycle only if a device is present; an
    /// in-range edge always stops the running one.
    pub fn on_edge(&mut self, edge: RangeEdge, device_present: bool, now: Instant) {
        match edge {
            RangeEdge::OutOfRange if device_present => {
                self.start(now);
            }
            RangeEdge::OutOfRange => debug!("Out-of-range edge without a device, ignored"),
            RangeEdge::InRange => self.stop(),
        }
    }

    /// Start a cycle, firing immediately. Returns `false` without doing
    /// anything if a cycle is already running.
    pub fn start(&mut self, now: Instant) -> bool {
        if self.cycle.is_some() {
            debug!("Alert cycle already running");
            return false;
        }

        info!(max_fires = self.max_fires, period = ?self.period, "Alert cycle started");
        self.notifier.fire(1, self.max_fires);
        if self.max_fires > 1 {
            self.cycle = Some(AlertCycleState {
                fired_count: 1,
                next_fire_at: now + self.period,
            });
        } else {
            info!(fired = 1, "Alert cycle complete");
        }
        true
    }

    /// Fire if the next deadline has passed. Returns whether a fire happened.
    pub fn on_tick(&mut self, now: Instant) -> bool {
        let Some(cycle) = self.cycle.as_mut() else {
            return false;
        };
        if now < cycle.next_fire_at {
            return false;
        }

        cycle.fired_count += 1;
        let fired = cycle.fired_count;
        self.notifier.fire(fired, self.max_fires);

        if fired >= self.max_fires {
            self.cycle = None;
            info!(fired, "Alert cycle complete");
        } else {
            cycle.next_fire_at += self.period;
        }
        true
    }

    /// Stop the running cycle, if any. The pending tick is dropped with it.
    pub fn stop(&mut self) {
        if let Some(cycle) = self.cycle.take() {
            info!(fired = cycle.fired_count, "Alert cycle stopped");
        }
    }

    /// When the owner should call [`on_tick`](Self::on_tick) next.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.cycle.map(|c| c.next_fire_at)
    }

    /// Whether a cycle is running.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.cycle.is_some()
    }

    /// Fires delivered in the running cycle, 0 when idle.
    #[must_use]
    pub fn fired_count(&self) -> u32 {
        self.cycle.map_or(0, |c| c.fired_count)
    }

    /// Snapshot of the running cycle.
    #[must_use]
    pub const fn state(&self) -> Option<&AlertCycleState> {
        self.cycle.as_ref()
    }
}
