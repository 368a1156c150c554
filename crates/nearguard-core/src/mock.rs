//! Scripted, in-memory transport and a simulated beacon.
//!
//! [`MockTransport`] stands in for the radio in tests and in the server's
//! `mock-bluetooth` build. Outcomes are scripted up front, samples are pushed
//! by hand (or by [`MockTransport::simulate`]) and every write is recorded.
//! Clones share state, so a test keeps one clone to drive the transport while
//! the session owns another.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::alert_cycle::Notifier;
use crate::battery::voltage_to_percentage;
use crate::config::BATTERY_LEVEL_CHARACTERISTIC_UUID;
use crate::session::CancelToken;
use crate::transport::{
    ConnectionHandle, DisconnectSubscription, DiscoveredDevice, DiscoveryOptions, LinkId,
    SampleStream, Transport, TransportError,
};
use crate::types::{DeviceIdentity, RawSample};

/// Address of the simulated beacon.
pub const MOCK_BEACON_ADDRESS: &str = "D4:36:39:6F:AA:01";

/// Advertised name of the simulated beacon.
pub const MOCK_BEACON_NAME: &str = "nearguard-tag";

/// A characteristic write captured by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockWrite {
    /// Target service.
    pub service: Uuid,
    /// Target characteristic.
    pub characteristic: Uuid,
    /// Bytes written.
    pub bytes: Vec<u8>,
}

struct MockState {
    discovery: VecDeque<Result<DiscoveredDevice, TransportError>>,
    watch_failures: VecDeque<TransportError>,
    connect_failures: VecDeque<TransportError>,
    fail_writes: bool,
    samples: Option<mpsc::UnboundedSender<RawSample>>,
    watch_count: usize,
    next_link: u64,
    links: HashMap<LinkId, Option<oneshot::Sender<()>>>,
    writes: Vec<MockWrite>,
    battery_mv: u16,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            discovery: VecDeque::new(),
            watch_failures: VecDeque::new(),
            connect_failures: VecDeque::new(),
            fail_writes: false,
            samples: None,
            watch_count: 0,
            next_link: 1,
            links: HashMap::new(),
            writes: Vec::new(),
            battery_mv: 3000,
        }
    }
}

/// In-memory [`Transport`] with a single simulated beacon.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// A transport whose discovery finds the simulated beacon.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------------------------------------------------------------
    // Scripting
    // -------------------------------------------------------------------------

    /// Queue the outcome of the next discovery.
    pub fn script_discovery(&self, outcome: Result<DiscoveredDevice, TransportError>) {
        self.lock().discovery.push_back(outcome);
    }

    /// Make the next watch fail.
    pub fn fail_next_watch(&self, err: TransportError) {
        self.lock().watch_failures.push_back(err);
    }

    /// Make the next connect fail.
    pub fn fail_next_connect(&self, err: TransportError) {
        self.lock().connect_failures.push_back(err);
    }

    /// Make every characteristic write fail until switched off.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Cell voltage reported by the simulated beacon.
    pub fn set_battery_millivolts(&self, millivolts: u16) {
        self.lock().battery_mv = millivolts;
    }

    // -------------------------------------------------------------------------
    // Driving
    // -------------------------------------------------------------------------

    /// Deliver a sample to the running watch. Returns `false` if no watch is
    /// listening.
    pub fn push_sample(&self, rssi: i16) -> bool {
        self.lock()
            .samples
            .as_ref()
            .is_some_and(|tx| tx.unbounded_send(RawSample { rssi }).is_ok())
    }

    /// End the running watch as if the beacon vanished.
    pub fn end_watch(&self) {
        self.lock().samples = None;
    }

    /// Drop every live connection from the beacon's side.
    pub fn drop_remote(&self) {
        let mut state = self.lock();
        for (link, notice) in state.links.drain() {
            debug!(%link, "Simulating remote disconnect");
            if let Some(notice) = notice {
                let _ = notice.send(());
            }
        }
    }

    /// Push `pattern` forever, one value per `interval`, skipping beats while
    /// nothing is watching.
    #[must_use]
    pub fn simulate(&self, pattern: Vec<i16>, interval: Duration) -> JoinHandle<()> {
        let transport = self.clone();
        tokio::spawn(async move {
            if pattern.is_empty() {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            for rssi in pattern.iter().cycle() {
                ticker.tick().await;
                transport.push_sample(*rssi);
            }
        })
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Every write so far, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<MockWrite> {
        self.lock().writes.clone()
    }

    /// Payloads of every write so far, in order.
    #[must_use]
    pub fn written_bytes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.iter().map(|w| w.bytes.clone()).collect()
    }

    /// Watches opened so far.
    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.lock().watch_count
    }

    /// Connections not yet released or dropped.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.lock().links.len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn discover(
        &self,
        options: &DiscoveryOptions,
    ) -> Result<DiscoveredDevice, TransportError> {
        if let Some(outcome) = self.lock().discovery.pop_front() {
            return outcome;
        }
        if !options.matches(MOCK_BEACON_ADDRESS, Some(MOCK_BEACON_NAME)) {
            return Err(TransportError::NoDevice(
                "simulated beacon does not match the filter".into(),
            ));
        }
        Ok(DiscoveredDevice {
            identity: DeviceIdentity::new(MOCK_BEACON_ADDRESS),
            name: Some(MOCK_BEACON_NAME.to_string()),
        })
    }

    async fn watch(
        &self,
        identity: &DeviceIdentity,
        cancel: CancelToken,
    ) -> Result<SampleStream, TransportError> {
        let mut state = self.lock();
        if let Some(err) = state.watch_failures.pop_front() {
            return Err(err);
        }

        let (tx, rx) = mpsc::unbounded();
        state.samples = Some(tx);
        state.watch_count += 1;
        debug!(device = %identity, watch = state.watch_count, "Mock watch opened");

        Ok(rx
            .take_until(async move { cancel.cancelled().await })
            .boxed())
    }

    async fn connect(&self, identity: &DeviceIdentity) -> Result<ConnectionHandle, TransportError> {
        let mut state = self.lock();
        if let Some(err) = state.connect_failures.pop_front() {
            return Err(err);
        }

        let link = LinkId::new(state.next_link);
        state.next_link += 1;
        state.links.insert(link, None);
        Ok(ConnectionHandle::new(link, identity.clone()))
    }

    async fn write_characteristic(
        &self,
        link: LinkId,
        service: Uuid,
        characteristic: Uuid,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.links.contains_key(&link) {
            return Err(TransportError::NotConnected);
        }
        if state.fail_writes {
            return Err(TransportError::Backend("simulated write failure".into()));
        }
        state.writes.push(MockWrite {
            service,
            characteristic,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    async fn read_characteristic(
        &self,
        link: LinkId,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        let state = self.lock();
        if !state.links.contains_key(&link) {
            return Err(TransportError::NotConnected);
        }
        if characteristic != BATTERY_LEVEL_CHARACTERISTIC_UUID {
            return Err(TransportError::AttributeNotFound(characteristic));
        }
        Ok(vec![voltage_to_percentage(state.battery_mv)])
    }

    fn on_remote_disconnect(&self, handle: &ConnectionHandle) -> DisconnectSubscription {
        let (tx, rx) = oneshot::channel();
        // An unknown link is already gone: dropping `tx` fires the subscription.
        if let Some(slot) = self.lock().links.get_mut(&handle.link()) {
            *slot = Some(tx);
        }
        DisconnectSubscription::new(rx)
    }

    async fn release(&self, handle: ConnectionHandle) {
        if self.lock().links.remove(&handle.link()).is_some() {
            debug!(link = %handle.link(), "Mock connection released");
        }
    }
}

/// [`Notifier`] that records every fire with its timestamp.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    fires: Arc<Mutex<Vec<(u32, Instant)>>>,
}

impl RecordingNotifier {
    /// `(fire number, time)` pairs recorded so far.
    #[must_use]
    pub fn fires(&self) -> Vec<(u32, Instant)> {
        self.fires
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Notifier for RecordingNotifier {
    fn fire(&mut self, fired: u32, _max_fires: u32) {
        self.fires
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((fired, Instant::now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BluetoothConfig;

    #[tokio::test]
    async fn test_default_discovery_finds_beacon() {
        let mock = MockTransport::new();
        let found = mock
            .discover(&DiscoveryOptions::from(&BluetoothConfig::default()))
            .await
            .unwrap();
        assert_eq!(found.identity.as_str(), MOCK_BEACON_ADDRESS);
    }

    #[tokio::test]
    async fn test_discovery_honours_name_filter() {
        let mock = MockTransport::new();
        let config = BluetoothConfig {
            name_prefix: Some("other".into()),
            ..BluetoothConfig::default()
        };
        assert!(matches!(
            mock.discover(&DiscoveryOptions::from(&config)).await,
            Err(TransportError::NoDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_battery_reflects_voltage() {
        let mock = MockTransport::new();
        mock.set_battery_millivolts(2100);
        let handle = mock
            .connect(&DeviceIdentity::new(MOCK_BEACON_ADDRESS))
            .await
            .unwrap();

        let value = mock
            .read_characteristic(
                handle.link(),
                crate::config::BATTERY_SERVICE_UUID,
                BATTERY_LEVEL_CHARACTERISTIC_UUID,
            )
            .await
            .unwrap();
        assert_eq!(value, vec![5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_feeds_watch() {
        let mock = MockTransport::new();
        let mut samples = mock
            .watch(&DeviceIdentity::new(MOCK_BEACON_ADDRESS), CancelToken::new())
            .await
            .unwrap();

        let sim = mock.simulate(vec![-60, -101], Duration::from_millis(500));
        assert_eq!(samples.next().await, Some(RawSample { rssi: -60 }));
        assert_eq!(samples.next().await, Some(RawSample { rssi: -101 }));
        assert_eq!(samples.next().await, Some(RawSample { rssi: -60 }));
        sim.abort();
    }
}
