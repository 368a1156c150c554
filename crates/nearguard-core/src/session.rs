//! Lifecycle of the single paired beacon.
//!
//! [`DeviceSession`] owns at most one discovered device, at most one passive
//! watch and at most one active connection. Every raw [`TransportError`] passes
//! through [`classify`] here, so nothing above this module sees transport
//! shapes.
//!
//! Teardown is guarded: whichever side disconnects first wins, and the
//! disconnection is reported exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::battery::BatteryReport;
use crate::config::BluetoothConfig;
use crate::error::{NearGuardError, Result};
use crate::transport::{
    encode_alert, AlertTransport, ConnectionHandle, DisconnectSubscription, DiscoveryOptions,
    LinkId, SampleStream, Transport, TransportError,
};
use crate::types::{AlertLevel, DeviceIdentity, RawSample, TrackedDevice};

// =============================================================================
// CANCELLATION
// =============================================================================

/// Single-use cancellation signal for a passive watch.
///
/// Clones share state. Once cancelled a token stays cancelled; restarting a
/// watch always mints a fresh token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// A fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called on any clone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// =============================================================================
// ERROR CLASSIFICATION
// =============================================================================

/// Session operation a transport failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOp {
    /// Device selection.
    Discover,
    /// Opening a passive watch.
    Watch,
    /// Opening the alert connection.
    Connect,
    /// Writing an alert command.
    Write,
    /// Reading a characteristic.
    Read,
}

/// The one classification policy applied to every transport failure.
#[must_use]
pub fn classify(op: SessionOp, err: TransportError) -> NearGuardError {
    match (op, err) {
        (SessionOp::Discover, TransportError::Cancelled) => NearGuardError::UserCancelled,
        (SessionOp::Discover | SessionOp::Watch, err) => {
            NearGuardError::DeviceUnavailable(err.to_string())
        }
        (SessionOp::Connect, err) => NearGuardError::ConnectionFailed(err.to_string()),
        (SessionOp::Write, err) => NearGuardError::WriteFailed(err.to_string()),
        (SessionOp::Read, err) => NearGuardError::ReadFailed(err.to_string()),
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Something the session observed that the controller must react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A passive-watch sample.
    Sample(RawSample),
    /// A local [`DeviceSession::disconnect`] completed its teardown.
    Disconnected,
    /// The remote side dropped the link or the watch ended. Call
    /// [`DeviceSession::acknowledge_remote_loss`] to tear down.
    RemoteLost,
}

/// GATT identifiers used once connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattLayout {
    /// Service carrying the alert characteristic.
    pub alert_service: Uuid,
    /// One-byte alert level characteristic.
    pub alert_characteristic: Uuid,
    /// Battery service.
    pub battery_service: Uuid,
    /// Battery level characteristic.
    pub battery_level: Uuid,
}

impl From<&BluetoothConfig> for GattLayout {
    fn from(config: &BluetoothConfig) -> Self {
        Self {
            alert_service: config.alert_service_uuid,
            alert_characteristic: config.alert_characteristic_uuid,
            battery_service: config.battery_service_uuid,
            battery_level: config.battery_level_uuid,
        }
    }
}

struct ActiveWatch {
    token: CancelToken,
    samples: SampleStream,
}

struct ActiveConnection {
    remote: DisconnectSubscription,
    handle: ConnectionHandle,
}

/// Owner of the one wireless session.
pub struct DeviceSession {
    transport: Arc<dyn Transport>,
    options: DiscoveryOptions,
    gatt: GattLayout,
    device: Option<DeviceIdentity>,
    watch: Option<ActiveWatch>,
    connection: Option<ActiveConnection>,
    torn_down: bool,
    pending_notice: bool,
}

impl DeviceSession {
    /// Create an idle session on top of `transport`.
    pub fn new(transport: Arc<dyn Transport>, options: DiscoveryOptions, gatt: GattLayout) -> Self {
        Self {
            transport,
            options,
            gatt,
            device: None,
            watch: None,
            connection: None,
            torn_down: false,
            pending_notice: false,
        }
    }

    /// Create a session from the `[bluetooth]` configuration section.
    pub fn from_config(transport: Arc<dyn Transport>, config: &BluetoothConfig) -> Self {
        Self::new(transport, config.into(), config.into())
    }

    /// Identity of the current device, if one was discovered.
    #[must_use]
    pub const fn device(&self) -> Option<&DeviceIdentity> {
        self.device.as_ref()
    }

    /// Whether a passive watch is running.
    #[must_use]
    pub const fn is_watching(&self) -> bool {
        self.watch.is_some()
    }

    /// Whether the alert connection is open.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Ask the transport for a device.
    ///
    /// # Errors
    ///
    /// `UserCancelled` if the picker was dismissed, `DeviceUnavailable` if
    /// nothing answered.
    pub async fn start_discovery(&mut self) -> Result<TrackedDevice> {
        let found = self
            .transport
            .discover(&self.options)
            .await
            .map_err(|e| classify(SessionOp::Discover, e))?;

        info!(device = %found.identity, name = ?found.name, "Beacon selected");
        self.device = Some(found.identity.clone());
        self.torn_down = false;
        self.pending_notice = false;
        Ok(TrackedDevice::new(found.identity, found.name))
    }

    /// Open a passive watch on the discovered device, replacing any running
    /// one. Samples are delivered through [`next_event`](Self::next_event).
    ///
    /// # Errors
    ///
    /// `Disconnected` if no device was discovered, `DeviceUnavailable` if the
    /// transport refused the watch.
    pub async fn begin_watching(&mut self) -> Result<()> {
        let identity = self.device.clone().ok_or(NearGuardError::Disconnected)?;
        self.stop_watching();

        let token = CancelToken::new();
        let samples = self
            .transport
            .watch(&identity, token.clone())
            .await
            .map_err(|e| classify(SessionOp::Watch, e))?;

        debug!(device = %identity, "Passive watch started");
        self.watch = Some(ActiveWatch { token, samples });
        Ok(())
    }

    /// Stop the passive watch. Idempotent. No sample is delivered after this
    /// returns.
    pub fn stop_watching(&mut self) {
        if let Some(watch) = self.watch.take() {
            watch.token.cancel();
            debug!("Passive watch stopped");
        }
    }

    /// Open the active connection for alert commands, stopping any watch
    /// first. On failure the session is left without watch or connection but
    /// keeps the device identity so radar can be resumed.
    ///
    /// # Errors
    ///
    /// `ConnectionFailed` if the transport could not connect.
    pub async fn connect_for_alerts(&mut self) -> Result<Box<dyn AlertTransport>> {
        let identity = self.device.clone().ok_or(NearGuardError::Disconnected)?;
        self.stop_watching();

        let handle = self
            .transport
            .connect(&identity)
            .await
            .map_err(|e| classify(SessionOp::Connect, e))?;

        let link = handle.link();
        let remote = self.transport.on_remote_disconnect(&handle);
        self.connection = Some(ActiveConnection { remote, handle });
        info!(device = %identity, %link, "Alert connection established");

        Ok(Box::new(GattAlertTransport {
            transport: Arc::clone(&self.transport),
            link,
            service: self.gatt.alert_service,
            characteristic: self.gatt.alert_characteristic,
        }))
    }

    /// Read the beacon's battery level over the alert connection.
    ///
    /// # Errors
    ///
    /// `Disconnected` without a connection, `ReadFailed` if the read failed or
    /// returned nothing.
    pub async fn read_battery(&mut self) -> Result<BatteryReport> {
        let link = self
            .connection
            .as_ref()
            .map(|c| c.handle.link())
            .ok_or(NearGuardError::Disconnected)?;

        let value = self
            .transport
            .read_characteristic(link, self.gatt.battery_service, self.gatt.battery_level)
            .await
            .map_err(|e| classify(SessionOp::Read, e))?;

        value
            .first()
            .map(|byte| BatteryReport::from_level_byte(*byte))
            .ok_or_else(|| NearGuardError::ReadFailed("empty battery level value".into()))
    }

    /// Tear everything down. Best effort, never fails.
    ///
    /// The first call after a live session queues exactly one
    /// [`SessionEvent::Disconnected`]; later calls, or calls after the remote
    /// side already disconnected, do nothing.
    pub async fn disconnect(&mut self) {
        if self.torn_down || self.device.is_none() {
            debug!("Disconnect requested with no live session");
            return;
        }
        self.teardown().await;
        self.torn_down = true;
        self.pending_notice = true;
    }

    /// Tear down after [`SessionEvent::RemoteLost`].
    ///
    /// Returns `true` if this call performed the teardown, `false` if a local
    /// disconnect already did.
    pub async fn acknowledge_remote_loss(&mut self) -> bool {
        if self.torn_down || self.device.is_none() {
            return false;
        }
        warn!(device = ?self.device, "Beacon lost by remote side");
        self.teardown().await;
        self.torn_down = true;
        true
    }

    /// Forget a half-established session without reporting a disconnect.
    /// Used to roll back a failed transition.
    pub async fn reset(&mut self) {
        self.teardown().await;
        self.torn_down = false;
        self.pending_notice = false;
    }

    /// Wait for the next thing the controller must handle. Cancel safe.
    ///
    /// Stays pending while nothing is live.
    pub async fn next_event(&mut self) -> SessionEvent {
        if self.pending_notice {
            self.pending_notice = false;
            return SessionEvent::Disconnected;
        }

        let woke = tokio::select! {
            sample = next_sample(self.watch.as_mut()) => Some(sample),
            () = remote_gone(self.connection.as_mut()) => None,
        };

        match woke {
            Some(Some(sample)) => SessionEvent::Sample(sample),
            Some(None) => {
                // Drop the exhausted stream so it is never polled again.
                self.watch = None;
                SessionEvent::RemoteLost
            }
            None => SessionEvent::RemoteLost,
        }
    }

    async fn teardown(&mut self) {
        self.stop_watching();
        if let Some(ActiveConnection { remote, handle }) = self.connection.take() {
            drop(remote);
            debug!(link = %handle.link(), "Releasing alert connection");
            self.transport.release(handle).await;
        }
        if let Some(device) = self.device.take() {
            info!(%device, "Session torn down");
        }
    }
}

async fn next_sample(watch: Option<&mut ActiveWatch>) -> Option<RawSample> {
    match watch {
        Some(watch) => watch.samples.next().await,
        None => std::future::pending().await,
    }
}

async fn remote_gone(connection: Option<&mut ActiveConnection>) {
    match connection {
        Some(connection) => connection.remote.notified().await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// ALERT TRANSPORT OVER GATT
// =============================================================================

/// [`AlertTransport`] writing the one-byte level to a GATT characteristic.
struct GattAlertTransport {
    transport: Arc<dyn Transport>,
    link: LinkId,
    service: Uuid,
    characteristic: Uuid,
}

#[async_trait]
impl AlertTransport for GattAlertTransport {
    async fn send_alert(&self, level: AlertLevel) -> Result<()> {
        let bytes = encode_alert(level);
        self.transport
            .write_characteristic(self.link, self.service, self.characteristic, &bytes)
            .await
            .map_err(|e| classify(SessionOp::Write, e))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_test::{assert_pending, task};

    use super::*;
    use crate::mock::MockTransport;

    fn session(mock: &MockTransport) -> DeviceSession {
        DeviceSession::from_config(Arc::new(mock.clone()), &BluetoothConfig::default())
    }

    #[test]
    fn test_classification_policy() {
        assert!(matches!(
            classify(SessionOp::Discover, TransportError::Cancelled),
            NearGuardError::UserCancelled
        ));
        assert!(matches!(
            classify(SessionOp::Discover, TransportError::Timeout(Duration::from_secs(1))),
            NearGuardError::DeviceUnavailable(_)
        ));
        assert!(matches!(
            classify(SessionOp::Connect, TransportError::Cancelled),
            NearGuardError::ConnectionFailed(_)
        ));
        assert!(matches!(
            classify(SessionOp::Write, TransportError::NotConnected),
            NearGuardError::WriteFailed(_)
        ));
        assert!(matches!(
            classify(SessionOp::Read, TransportError::Backend("x".into())),
            NearGuardError::ReadFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_cancel_token_is_single_use() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        token.cancel();
        assert!(clone.is_cancelled());
        clone.cancelled().await;
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let token = CancelToken::new();
        let mut waiter = task::spawn(token.cancelled());
        assert_pending!(waiter.poll());

        token.cancel();
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn test_discovery_returns_device_without_signal() {
        let mock = MockTransport::new();
        let mut session = session(&mock);

        let device = session.start_discovery().await.unwrap();
        assert_eq!(device.display_name.as_deref(), Some(crate::mock::MOCK_BEACON_NAME));
        assert!(device.last_rssi.is_none());
        assert!(session.device().is_some());
    }

    #[tokio::test]
    async fn test_discovery_cancel_is_classified() {
        let mock = MockTransport::new();
        mock.script_discovery(Err(TransportError::Cancelled));
        let mut session = session(&mock);

        assert!(matches!(
            session.start_discovery().await,
            Err(NearGuardError::UserCancelled)
        ));
        assert!(session.device().is_none());
    }

    #[tokio::test]
    async fn test_samples_flow_until_watch_stopped() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        session.start_discovery().await.unwrap();
        session.begin_watching().await.unwrap();

        assert!(mock.push_sample(-60));
        assert_eq!(
            session.next_event().await,
            SessionEvent::Sample(RawSample { rssi: -60 })
        );

        session.stop_watching();
        session.stop_watching();
        mock.push_sample(-61);
        let mut next = task::spawn(session.next_event());
        assert_pending!(next.poll());
    }

    #[tokio::test]
    async fn test_watch_restart_uses_fresh_token() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        session.start_discovery().await.unwrap();

        session.begin_watching().await.unwrap();
        session.stop_watching();
        session.begin_watching().await.unwrap();

        assert_eq!(mock.watch_count(), 2);
        assert!(mock.push_sample(-70));
        assert_eq!(
            session.next_event().await,
            SessionEvent::Sample(RawSample { rssi: -70 })
        );
    }

    #[tokio::test]
    async fn test_connect_stops_watch() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        session.start_discovery().await.unwrap();
        session.begin_watching().await.unwrap();

        let _alerts = session.connect_for_alerts().await.unwrap();
        assert!(!session.is_watching());
        assert!(session.is_connected());
        assert!(!mock.push_sample(-50));
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_session_disconnected() {
        let mock = MockTransport::new();
        mock.fail_next_connect(TransportError::Timeout(Duration::from_secs(5)));
        let mut session = session(&mock);
        session.start_discovery().await.unwrap();
        session.begin_watching().await.unwrap();

        let result = session.connect_for_alerts().await;
        assert!(matches!(result, Err(NearGuardError::ConnectionFailed(_))));
        assert!(!session.is_watching());
        assert!(!session.is_connected());
        assert!(session.device().is_some());
    }

    #[tokio::test]
    async fn test_alert_transport_writes_single_byte() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        session.start_discovery().await.unwrap();
        let alerts = session.connect_for_alerts().await.unwrap();

        alerts.send_alert(AlertLevel::Strong).await.unwrap();
        alerts.send_alert(AlertLevel::Off).await.unwrap();
        assert_eq!(mock.written_bytes(), vec![vec![0x02], vec![0x00]]);
    }

    #[tokio::test]
    async fn test_alert_transport_dead_after_disconnect() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        session.start_discovery().await.unwrap();
        let alerts = session.connect_for_alerts().await.unwrap();

        session.disconnect().await;
        assert!(matches!(
            alerts.send_alert(AlertLevel::Mild).await,
            Err(NearGuardError::WriteFailed(_))
        ));
        assert_eq!(mock.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_battery_read_over_connection() {
        let mock = MockTransport::new();
        mock.set_battery_millivolts(2650);
        let mut session = session(&mock);
        session.start_discovery().await.unwrap();

        assert!(matches!(
            session.read_battery().await,
            Err(NearGuardError::Disconnected)
        ));

        let _alerts = session.connect_for_alerts().await.unwrap();
        let report = session.read_battery().await.unwrap();
        assert_eq!(report.percentage, 50);
    }

    #[tokio::test]
    async fn test_double_disconnect_reports_once() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        session.start_discovery().await.unwrap();
        session.begin_watching().await.unwrap();

        session.disconnect().await;
        session.disconnect().await;

        assert_eq!(session.next_event().await, SessionEvent::Disconnected);
        let mut next = task::spawn(session.next_event());
        assert_pending!(next.poll());
    }

    #[tokio::test]
    async fn test_remote_loss_then_local_disconnect_reports_once() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        session.start_discovery().await.unwrap();
        let _alerts = session.connect_for_alerts().await.unwrap();

        mock.drop_remote();
        assert_eq!(session.next_event().await, SessionEvent::RemoteLost);
        assert!(session.acknowledge_remote_loss().await);
        assert!(!session.acknowledge_remote_loss().await);

        session.disconnect().await;
        let mut next = task::spawn(session.next_event());
        assert_pending!(next.poll());
        assert_eq!(mock.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_watch_end_is_remote_loss() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        session.start_discovery().await.unwrap();
        session.begin_watching().await.unwrap();

        mock.end_watch();
        assert_eq!(session.next_event().await, SessionEvent::RemoteLost);
        assert!(session.acknowledge_remote_loss().await);
        assert!(session.device().is_none());
    }

    #[tokio::test]
    async fn test_idle_session_disconnect_is_noop() {
        let mock = MockTransport::new();
        let mut session = session(&mock);

        session.disconnect().await;
        let mut next = task::spawn(session.next_event());
        assert_pending!(next.poll());
    }
}
