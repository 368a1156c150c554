//! Top-level operating mode state machine.
//!
//! [`ModeController`] is the only writer of the operating mode, the tracked
//! device and the status line. Every mutation ends with a [`StatusSnapshot`]
//! published on a `watch` channel, so observers never poll.
//!
//! ```text
//!            request_radar                 request_alert_mode
//!   Idle ─────────────────────► Radar ─────────────────────────► Alert
//!    ▲                            │  ▲   connect failed:          │
//!    │                            │  └── re-watch (bounded) ──────┤
//!    │       disconnected         │                               │
//!    └────────────────────────────┴───────────────────────────────┘
//! ```
//!
//! Failures never leave a half-finished transition behind: the controller
//! rolls back to the last stable mode (Idle or Radar) and reports the error.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::alert_cycle::{AlertCycleManager, Notifier};
use crate::battery::BatteryReport;
use crate::config::Config;
use crate::error::{NearGuardError, Result};
use crate::session::{DeviceSession, SessionEvent};
use crate::signal::SignalProcessor;
use crate::transport::{AlertTransport, Transport};
use crate::types::{
    AlertLevel, OperatingMode, RangeEdge, RawSample, StatusSnapshot, TrackedDevice,
};

const STATUS_IDLE: &str = "Idle";

/// Bounded budget of automatic recoveries.
///
/// Refilled on every user-initiated transition, spent by each automatic
/// radar restart after a failed alert connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    max: u8,
    remaining: u8,
}

impl RetryBudget {
    /// A full budget of `max` retries.
    #[must_use]
    pub const fn new(max: u8) -> Self {
        Self {
            max,
            remaining: max,
        }
    }

    /// Refill the budget.
    pub fn reset(&mut self) {
        self.remaining = self.max;
    }

    /// Spend one retry. Returns `false` if none is left.
    pub fn try_consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    /// Retries left.
    #[must_use]
    pub const fn remaining(&self) -> u8 {
        self.remaining
    }
}

/// The proximity tracker's state machine.
pub struct ModeController {
    session: DeviceSession,
    processor: SignalProcessor,
    alert_cycle: AlertCycleManager,
    retries: RetryBudget,

    mode: OperatingMode,
    device: Option<TrackedDevice>,
    out_of_range: bool,
    loading: bool,
    status: String,
    is_error: bool,
    alert_link: Option<Box<dyn AlertTransport>>,

    observers: watch::Sender<StatusSnapshot>,
}

impl ModeController {
    /// Create an idle controller.
    pub fn new(
        session: DeviceSession,
        processor: SignalProcessor,
        alert_cycle: AlertCycleManager,
        max_automatic_retries: u8,
    ) -> Self {
        let (observers, _) = watch::channel(StatusSnapshot {
            mode: OperatingMode::Idle,
            device: None,
            status: STATUS_IDLE.to_string(),
            is_error: false,
            out_of_range: false,
            loading: false,
            alert_cycle_active: false,
            updated_at_utc: Utc::now(),
        });

        Self {
            session,
            processor,
            alert_cycle,
            retries: RetryBudget::new(max_automatic_retries),
            mode: OperatingMode::Idle,
            device: None,
            out_of_range: false,
            loading: false,
            status: STATUS_IDLE.to_string(),
            is_error: false,
            alert_link: None,
            observers,
        }
    }

    /// Wire a controller from configuration.
    pub fn from_config(
        config: &Config,
        transport: Arc<dyn Transport>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self::new(
            DeviceSession::from_config(transport, &config.bluetooth),
            SignalProcessor::from_config(&config.calibration),
            AlertCycleManager::from_config(&config.alert, notifier),
            config.alert.max_automatic_retries,
        )
    }

    // =========================================================================
    // USER-INITIATED OPERATIONS
    // =========================================================================

    /// Discover a beacon and start passive monitoring. Accepted only in Idle.
    ///
    /// Dismissing the picker is not a failure: the controller stays Idle and
    /// `Ok(())` is returned.
    ///
    /// # Errors
    ///
    /// `Rejected` outside Idle; `DeviceUnavailable` if discovery or the watch
    /// failed. The controller is Idle afterwards in both failure cases.
    pub async fn request_radar(&mut self) -> Result<()> {
        if self.mode != OperatingMode::Idle {
            return Err(self.rejected("request_radar"));
        }
        self.retries.reset();

        self.set_status("Searching for beacon", false);
        let device = match self.session.start_discovery().await {
            Ok(device) => device,
            Err(err) if err.is_silent() => {
                info!("Beacon selection cancelled by user");
                self.set_status(STATUS_IDLE, false);
                return Ok(());
            }
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        };

        if let Err(err) = self.session.begin_watching().await {
            self.session.reset().await;
            self.fail(&err);
            return Err(err);
        }

        self.enter_radar(device);
        Ok(())
    }

    /// Open the alert connection. Accepted only in Radar.
    ///
    /// If the connection fails the controller restarts the passive watch on
    /// the same beacon, at most `max_automatic_retries` times per user
    /// request, and falls back to Idle if that fails too.
    ///
    /// # Errors
    ///
    /// `Rejected` outside Radar; `ConnectionFailed` if the connection could
    /// not be opened.
    pub async fn request_alert_mode(&mut self) -> Result<()> {
        if self.mode != OperatingMode::Radar {
            return Err(self.rejected("request_alert_mode"));
        }
        self.retries.reset();

        self.loading = true;
        let label = self.device_label();
        self.set_status(format!("Connecting to {label}"), false);

        match self.session.connect_for_alerts().await {
            Ok(link) => {
                self.alert_link = Some(link);
                self.loading = false;
                self.mode = OperatingMode::Alert;
                // Signal fields freeze; no range edge can happen in Alert.
                self.out_of_range = false;
                self.alert_cycle.stop();
                info!(device = %label, mode = %self.mode, "Alert mode armed");
                self.set_status(format!("Alert mode: connected to {label}"), false);
                Ok(())
            }
            Err(err) => {
                self.loading = false;
                self.fail(&err);
                if err.is_recoverable() {
                    self.recover_radar(&err).await;
                } else {
                    self.reset_to_idle(&err).await;
                }
                Err(err)
            }
        }
    }

    /// Send an alert level to the beacon. Accepted only in Alert.
    ///
    /// # Errors
    ///
    /// `Rejected` outside Alert; `WriteFailed` if the write failed. The mode
    /// never changes.
    pub async fn send_alert(&mut self, level: AlertLevel) -> Result<()> {
        if self.mode != OperatingMode::Alert {
            return Err(self.rejected("send_alert"));
        }
        let Some(link) = self.alert_link.as_ref() else {
            return Err(NearGuardError::Disconnected);
        };

        match link.send_alert(level).await {
            Ok(()) => {
                info!(%level, intensity = level.buzzer_intensity(), "Alert sent");
                let label = self.device_label();
                self.set_status(format!("Alert '{level}' sent to {label}"), false);
                Ok(())
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Read the beacon's battery level. Accepted only in Alert.
    ///
    /// # Errors
    ///
    /// `Rejected` outside Alert; `ReadFailed` if the read failed.
    pub async fn read_battery(&mut self) -> Result<BatteryReport> {
        if self.mode != OperatingMode::Alert {
            return Err(self.rejected("read_battery"));
        }
        match self.session.read_battery().await {
            Ok(report) => {
                info!(percentage = report.percentage, state = ?report.state, "Battery read");
                Ok(report)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Tear the session down. The reset to Idle follows when the resulting
    /// [`SessionEvent::Disconnected`] is handled.
    pub async fn disconnect(&mut self) {
        info!(mode = %self.mode, "Disconnect requested");
        self.alert_cycle.stop();
        self.session.disconnect().await;
    }

    /// Disconnect and settle in Idle without waiting for the session event.
    pub async fn shutdown(&mut self) {
        self.disconnect().await;
        if self.mode != OperatingMode::Idle {
            self.on_disconnected(false);
        }
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    /// Apply one passive-watch sample. Ignored outside Radar.
    pub fn on_sample(&mut self, sample: RawSample, now: Instant) {
        if self.mode != OperatingMode::Radar {
            trace!(rssi = sample.rssi, mode = %self.mode, "Sample discarded");
            return;
        }
        let Some(device) = self.device.as_mut() else {
            return;
        };

        let distance_m = self.processor.estimate_distance(sample.rssi);
        let proximity = SignalProcessor::categorize(distance_m);
        device.last_rssi = Some(sample.rssi);
        device.last_distance_m = Some(distance_m);
        device.proximity = Some(proximity);
        debug!(rssi = sample.rssi, distance_m, %proximity, "Sample applied");

        let out_of_range = self.processor.is_out_of_range(sample.rssi);
        if out_of_range != self.out_of_range {
            self.out_of_range = out_of_range;
            let edge = if out_of_range {
                RangeEdge::OutOfRange
            } else {
                RangeEdge::InRange
            };
            info!(?edge, rssi = sample.rssi, "Range changed");
            self.alert_cycle.on_edge(edge, true, now);
        }
        self.publish();
    }

    /// Deliver an alert-cycle tick.
    pub fn on_timer(&mut self, now: Instant) {
        if self.alert_cycle.on_tick(now) {
            self.publish();
        }
    }

    /// When the alert cycle wants its next tick.
    #[must_use]
    pub fn next_alert_deadline(&self) -> Option<Instant> {
        self.alert_cycle.next_deadline()
    }

    /// Wait for the next session event. Cancel safe.
    pub async fn next_session_event(&mut self) -> SessionEvent {
        self.session.next_event().await
    }

    /// Handle an event produced by [`next_session_event`](Self::next_session_event).
    pub async fn handle_session_event(&mut self, event: SessionEvent, now: Instant) {
        match event {
            SessionEvent::Sample(sample) => self.on_sample(sample, now),
            SessionEvent::Disconnected => self.on_disconnected(false),
            SessionEvent::RemoteLost => {
                if self.session.acknowledge_remote_loss().await {
                    self.on_disconnected(true);
                }
            }
        }
    }

    /// Wait for the next session event and handle it.
    pub async fn process_next_event(&mut self) {
        let event = self.next_session_event().await;
        self.handle_session_event(event, Instant::now()).await;
    }

    fn on_disconnected(&mut self, remote: bool) {
        self.alert_cycle.stop();
        self.alert_link = None;
        self.device = None;
        self.out_of_range = false;
        self.loading = false;
        self.mode = OperatingMode::Idle;

        if remote {
            warn!("Beacon connection lost");
            self.set_status("Beacon connection lost", true);
        } else {
            info!("Beacon disconnected");
            self.set_status("Disconnected", false);
        }
    }

    // =========================================================================
    // TRANSITION HELPERS
    // =========================================================================

    fn enter_radar(&mut self, device: TrackedDevice) {
        let label = device.label().to_string();
        self.device = Some(device);
        self.mode = OperatingMode::Radar;
        self.out_of_range = false;
        self.alert_cycle.stop();
        info!(device = %label, mode = %self.mode, "Radar started");
        self.set_status(format!("Radar: monitoring {label}"), false);
    }

    async fn recover_radar(&mut self, cause: &NearGuardError) {
        if !self.retries.try_consume() {
            warn!(%cause, "No automatic retry left, returning to idle");
            self.reset_to_idle(cause).await;
            return;
        }

        info!(remaining = self.retries.remaining(), "Restarting radar after failed connection");
        match self.session.begin_watching().await {
            Ok(()) => {
                self.mode = OperatingMode::Radar;
                self.out_of_range = false;
                self.alert_cycle.stop();
                self.set_status(format!("{cause}. Radar resumed"), true);
            }
            Err(err) => {
                warn!(%err, "Radar restart failed");
                self.reset_to_idle(&err).await;
            }
        }
    }

    async fn reset_to_idle(&mut self, cause: &NearGuardError) {
        self.session.reset().await;
        self.alert_cycle.stop();
        self.alert_link = None;
        self.device = None;
        self.out_of_range = false;
        self.loading = false;
        self.mode = OperatingMode::Idle;
        self.set_status(cause.to_string(), true);
    }

    fn rejected(&self, operation: &'static str) -> NearGuardError {
        warn!(operation, mode = %self.mode, "Operation rejected");
        NearGuardError::Rejected {
            mode: self.mode,
            operation,
        }
    }

    fn fail(&mut self, err: &NearGuardError) {
        warn!(code = err.error_code(), %err, mode = %self.mode, "Operation failed");
        self.set_status(err.to_string(), true);
    }

    fn set_status(&mut self, status: impl Into<String>, is_error: bool) {
        self.status = status.into();
        self.is_error = is_error;
        self.publish();
    }

    fn device_label(&self) -> String {
        self.device
            .as_ref()
            .map_or_else(|| "beacon".to_string(), |d| d.label().to_string())
    }

    fn publish(&self) {
        self.observers.send_replace(self.snapshot());
    }

    // =========================================================================
    // OBSERVATION
    // =========================================================================

    /// The current state as an observer sees it.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            mode: self.mode,
            device: self.device.clone(),
            status: self.status.clone(),
            is_error: self.is_error,
            out_of_range: self.out_of_range,
            loading: self.loading,
            alert_cycle_active: self.alert_cycle.is_active(),
            updated_at_utc: Utc::now(),
        }
    }

    /// Register an observer. The receiver always holds the latest snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.observers.subscribe()
    }

    /// Current operating mode.
    #[must_use]
    pub const fn mode(&self) -> OperatingMode {
        self.mode
    }

    /// Tracked device, if any.
    #[must_use]
    pub const fn device(&self) -> Option<&TrackedDevice> {
        self.device.as_ref()
    }

    /// Current status line.
    #[must_use]
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Whether the status line describes a failure.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.is_error
    }

    /// Whether the beacon is judged out of range.
    #[must_use]
    pub const fn is_out_of_range(&self) -> bool {
        self.out_of_range
    }

    /// Whether a connection attempt is in flight.
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        self.loading
    }

    /// The alert cycle.
    #[must_use]
    pub const fn alert_cycle(&self) -> &AlertCycleManager {
        &self.alert_cycle
    }

    /// The device session.
    #[must_use]
    pub const fn session(&self) -> &DeviceSession {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::{MockTransport, RecordingNotifier};
    use crate::transport::TransportError;

    fn controller(mock: &MockTransport) -> (ModeController, RecordingNotifier) {
        let notifier = RecordingNotifier::default();
        let controller = ModeController::from_config(
            &Config::default(),
            Arc::new(mock.clone()),
            Box::new(notifier.clone()),
        );
        (controller, notifier)
    }

    #[test]
    fn test_retry_budget() {
        let mut budget = RetryBudget::new(1);
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        budget.reset();
        assert_eq!(budget.remaining(), 1);

        let mut none = RetryBudget::new(0);
        assert!(!none.try_consume());
    }

    #[tokio::test]
    async fn test_starts_idle() {
        let (controller, _) = controller(&MockTransport::new());
        assert_eq!(controller.mode(), OperatingMode::Idle);
        assert!(controller.device().is_none());
        assert_eq!(controller.subscribe().borrow().mode, OperatingMode::Idle);
    }

    #[tokio::test]
    async fn test_radar_updates_device_from_samples() {
        let mock = MockTransport::new();
        let (mut controller, _) = controller(&mock);
        controller.request_radar().await.unwrap();
        assert_eq!(controller.mode(), OperatingMode::Radar);

        controller.on_sample(RawSample { rssi: -64 }, Instant::now());
        let device = controller.device().unwrap();
        assert_eq!(device.last_rssi, Some(-64));
        assert_eq!(device.last_distance_m, Some(2.0));
        assert_eq!(
            device.proximity,
            Some(crate::signal::ProximityCategory::Near)
        );
        assert!(!controller.is_out_of_range());
    }

    #[tokio::test]
    async fn test_cancelled_picker_is_silent() {
        let mock = MockTransport::new();
        mock.script_discovery(Err(TransportError::Cancelled));
        let (mut controller, _) = controller(&mock);

        controller.request_radar().await.unwrap();
        assert_eq!(controller.mode(), OperatingMode::Idle);
        assert!(!controller.is_error());
    }

    #[tokio::test]
    async fn test_unavailable_device_stays_idle_with_error() {
        let mock = MockTransport::new();
        mock.script_discovery(Err(TransportError::Timeout(Duration::from_secs(10))));
        let (mut controller, _) = controller(&mock);

        let result = controller.request_radar().await;
        assert!(matches!(result, Err(NearGuardError::DeviceUnavailable(_))));
        assert_eq!(controller.mode(), OperatingMode::Idle);
        assert!(controller.is_error());
    }

    #[tokio::test]
    async fn test_failed_watch_rolls_back_to_idle() {
        let mock = MockTransport::new();
        mock.fail_next_watch(TransportError::Backend("adapter off".into()));
        let (mut controller, _) = controller(&mock);

        assert!(controller.request_radar().await.is_err());
        assert_eq!(controller.mode(), OperatingMode::Idle);
        assert!(controller.device().is_none());
        assert!(controller.session().device().is_none());
    }

    #[tokio::test]
    async fn test_rejected_operations_leave_state_untouched() {
        let mock = MockTransport::new();
        let (mut controller, _) = controller(&mock);

        assert!(matches!(
            controller.send_alert(AlertLevel::Mild).await,
            Err(NearGuardError::Rejected { .. })
        ));
        assert!(matches!(
            controller.request_alert_mode().await,
            Err(NearGuardError::Rejected { .. })
        ));

        controller.request_radar().await.unwrap();
        let status = controller.status().to_string();
        assert!(matches!(
            controller.request_radar().await,
            Err(NearGuardError::Rejected {
                mode: OperatingMode::Radar,
                ..
            })
        ));
        assert!(matches!(
            controller.read_battery().await,
            Err(NearGuardError::Rejected { .. })
        ));
        assert_eq!(controller.status(), status);
        assert_eq!(controller.mode(), OperatingMode::Radar);
    }

    #[tokio::test]
    async fn test_alert_mode_freezes_signal_fields() {
        let mock = MockTransport::new();
        let (mut controller, _) = controller(&mock);
        controller.request_radar().await.unwrap();
        controller.on_sample(RawSample { rssi: -60 }, Instant::now());

        controller.request_alert_mode().await.unwrap();
        assert_eq!(controller.mode(), OperatingMode::Alert);
        assert!(!controller.is_loading());

        controller.on_sample(RawSample { rssi: -110 }, Instant::now());
        assert_eq!(controller.device().unwrap().last_rssi, Some(-60));
        assert!(!controller.is_out_of_range());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entering_alert_mode_stops_running_cycle() {
        let mock = MockTransport::new();
        let (mut controller, notifier) = controller(&mock);
        controller.request_radar().await.unwrap();
        controller.on_sample(RawSample { rssi: -105 }, Instant::now());
        assert!(controller.alert_cycle().is_active());
        assert_eq!(notifier.fires().len(), 1);

        controller.request_alert_mode().await.unwrap();
        assert!(!controller.alert_cycle().is_active());
        assert!(!controller.is_out_of_range());
        assert_eq!(controller.next_alert_deadline(), None);
        assert_eq!(controller.device().unwrap().last_rssi, Some(-105));

        tokio::time::sleep(Duration::from_secs(10)).await;
        controller.on_timer(Instant::now());
        assert_eq!(notifier.fires().len(), 1);
        assert!(!controller.snapshot().alert_cycle_active);
    }

    #[tokio::test]
    async fn test_write_failure_keeps_alert_mode() {
        let mock = MockTransport::new();
        let (mut controller, _) = controller(&mock);
        controller.request_radar().await.unwrap();
        controller.request_alert_mode().await.unwrap();

        mock.fail_writes(true);
        assert!(matches!(
            controller.send_alert(AlertLevel::Strong).await,
            Err(NearGuardError::WriteFailed(_))
        ));
        assert_eq!(controller.mode(), OperatingMode::Alert);
        assert!(controller.is_error());

        mock.fail_writes(false);
        controller.send_alert(AlertLevel::Strong).await.unwrap();
        assert!(!controller.is_error());
    }

    #[tokio::test]
    async fn test_zero_retry_budget_falls_back_to_idle() {
        let mock = MockTransport::new();
        let mut config = Config::default();
        config.alert.max_automatic_retries = 0;
        let mut controller = ModeController::from_config(
            &config,
            Arc::new(mock.clone()),
            Box::new(RecordingNotifier::default()),
        );
        controller.request_radar().await.unwrap();

        mock.fail_next_connect(TransportError::Timeout(Duration::from_secs(5)));
        assert!(controller.request_alert_mode().await.is_err());
        assert_eq!(controller.mode(), OperatingMode::Idle);
        assert!(controller.device().is_none());
        assert_eq!(mock.watch_count(), 1);
    }

    #[tokio::test]
    async fn test_observers_see_every_transition() {
        let mock = MockTransport::new();
        let (mut controller, _) = controller(&mock);
        let observer = controller.subscribe();

        controller.request_radar().await.unwrap();
        {
            let snapshot = observer.borrow();
            assert_eq!(snapshot.mode, OperatingMode::Radar);
            assert!(snapshot.device.is_some());
            assert!(snapshot.status.starts_with("Radar"));
        }

        controller.on_sample(RawSample { rssi: -101 }, Instant::now());
        assert!(observer.borrow().out_of_range);
        assert!(observer.borrow().alert_cycle_active);
    }

    #[tokio::test]
    async fn test_shutdown_settles_in_idle() {
        let mock = MockTransport::new();
        let (mut controller, _) = controller(&mock);
        controller.request_radar().await.unwrap();
        controller.request_alert_mode().await.unwrap();

        controller.shutdown().await;
        assert_eq!(controller.mode(), OperatingMode::Idle);
        assert_eq!(mock.live_connections(), 0);
    }
}
