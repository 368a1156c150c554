//! Boundary contract with the wireless stack.
//!
//! A [`Transport`] discovers a beacon, streams its advertised signal strength,
//! opens the active connection used for alert commands and reads/writes GATT
//! characteristics. Implementations report failures as raw [`TransportError`]s;
//! [`DeviceSession`](crate::session::DeviceSession) classifies them before they
//! reach anything else.
//!
//! Backends:
//! - [`BluezTransport`](crate::bluez::BluezTransport) - BlueZ via `bluer` (feature `bluetooth`)
//! - [`MockTransport`](crate::mock::MockTransport) - scripted, in memory

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::BluetoothConfig;
use crate::error::Result;
use crate::session::CancelToken;
use crate::types::{AlertLevel, DeviceIdentity, RawSample};

/// Lazy, unterminated sequence of samples from a passive watch.
pub type SampleStream = BoxStream<'static, RawSample>;

/// Raw failure reported by a transport backend.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The user dismissed the device picker.
    #[error("operation cancelled")]
    Cancelled,

    /// Nothing matching the discovery filter answered.
    #[error("no matching device: {0}")]
    NoDevice(String),

    /// The operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The link referenced by the call is not live.
    #[error("not connected")]
    NotConnected,

    /// The peer does not expose the requested GATT attribute.
    #[error("GATT attribute {0} not found")]
    AttributeNotFound(Uuid),

    /// Anything else the backend reported.
    #[error("bluetooth backend error: {0}")]
    Backend(String),
}

/// What discovery should look for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Select this address directly.
    pub device_address: Option<String>,
    /// Only accept advertisers whose name starts with this prefix.
    pub name_prefix: Option<String>,
    /// Give up after this long.
    pub timeout: Duration,
}

impl DiscoveryOptions {
    /// Whether an advertiser passes the filter.
    #[must_use]
    pub fn matches(&self, address: &str, name: Option<&str>) -> bool {
        if let Some(wanted) = &self.device_address {
            if !wanted.eq_ignore_ascii_case(address) {
                return false;
            }
        }
        match (&self.name_prefix, name) {
            (Some(prefix), Some(name)) => name.starts_with(prefix.as_str()),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

impl From<&BluetoothConfig> for DiscoveryOptions {
    fn from(config: &BluetoothConfig) -> Self {
        Self {
            device_address: config.device_address.clone(),
            name_prefix: config.name_prefix.clone(),
            timeout: config.discovery_timeout(),
        }
    }
}

/// Result of a successful discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Identity to pass back to the transport.
    pub identity: DeviceIdentity,
    /// Advertised name, if any.
    pub name: Option<String>,
}

/// Copyable key naming a live connection inside its transport.
///
/// Holding a `LinkId` does not keep the connection alive; once the owning
/// [`ConnectionHandle`] is released, calls using the id fail with
/// [`TransportError::NotConnected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl LinkId {
    /// Wrap a backend-assigned link number.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The backend-assigned number.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Ownership token for an active connection. Not `Clone`: exactly one exists
/// per connection, and giving it back through [`Transport::release`] closes it.
#[derive(Debug)]
pub struct ConnectionHandle {
    link: LinkId,
    identity: DeviceIdentity,
}

impl ConnectionHandle {
    /// Mint a handle. Only transports should call this.
    #[must_use]
    pub const fn new(link: LinkId, identity: DeviceIdentity) -> Self {
        Self { link, identity }
    }

    /// Key for read/write calls on this connection.
    #[must_use]
    pub const fn link(&self) -> LinkId {
        self.link
    }

    /// Device this connection belongs to.
    #[must_use]
    pub const fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }
}

/// Registration for the remote side dropping a connection.
///
/// Dropping the subscription releases whatever the backend set up to observe
/// the link.
pub struct DisconnectSubscription {
    notice: oneshot::Receiver<()>,
    fired: bool,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl DisconnectSubscription {
    /// Subscription that fires when `notice` receives a value or its sender is
    /// dropped.
    #[must_use]
    pub fn new(notice: oneshot::Receiver<()>) -> Self {
        Self {
            notice,
            fired: false,
            on_release: None,
        }
    }

    /// Run `release` when the subscription is dropped.
    #[must_use]
    pub fn with_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(release));
        self
    }

    /// Resolve once the remote side has gone away. Cancel safe; resolves at
    /// most once, then stays pending.
    pub async fn notified(&mut self) {
        if self.fired {
            return std::future::pending().await;
        }
        let _ = (&mut self.notice).await;
        self.fired = true;
    }
}

impl Drop for DisconnectSubscription {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

impl fmt::Debug for DisconnectSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisconnectSubscription")
            .field("fired", &self.fired)
            .finish_non_exhaustive()
    }
}

/// The wireless collaborator.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Ask for a device. Fails with [`TransportError::Cancelled`] if the user
    /// dismissed the picker, [`TransportError::NoDevice`] or
    /// [`TransportError::Timeout`] if nothing answered.
    async fn discover(
        &self,
        options: &DiscoveryOptions,
    ) -> std::result::Result<DiscoveredDevice, TransportError>;

    /// Open a passive signal-strength watch. The stream ends when `cancel` is
    /// cancelled or the device goes away.
    async fn watch(
        &self,
        identity: &DeviceIdentity,
        cancel: CancelToken,
    ) -> std::result::Result<SampleStream, TransportError>;

    /// Open the active connection used for alert commands.
    async fn connect(
        &self,
        identity: &DeviceIdentity,
    ) -> std::result::Result<ConnectionHandle, TransportError>;

    /// Write `bytes` to a characteristic. Uses Write Without Response when the
    /// characteristic offers it, so no acknowledgment is awaited.
    async fn write_characteristic(
        &self,
        link: LinkId,
        service: Uuid,
        characteristic: Uuid,
        bytes: &[u8],
    ) -> std::result::Result<(), TransportError>;

    /// Read a characteristic value.
    async fn read_characteristic(
        &self,
        link: LinkId,
        service: Uuid,
        characteristic: Uuid,
    ) -> std::result::Result<Vec<u8>, TransportError>;

    /// Observe the remote side dropping `handle`'s connection.
    fn on_remote_disconnect(&self, handle: &ConnectionHandle) -> DisconnectSubscription;

    /// Close a connection. Best effort; never fails.
    async fn release(&self, handle: ConnectionHandle);
}

/// Sink for alert commands, obtained from
/// [`DeviceSession::connect_for_alerts`](crate::session::DeviceSession::connect_for_alerts).
#[async_trait]
pub trait AlertTransport: Send + Sync {
    /// Send an alert level to the beacon.
    ///
    /// # Errors
    ///
    /// Returns [`NearGuardError::WriteFailed`](crate::error::NearGuardError::WriteFailed)
    /// if the command could not be written.
    async fn send_alert(&self, level: AlertLevel) -> Result<()>;
}

/// Encode an alert level for the wire: a single byte.
#[must_use]
pub const fn encode_alert(level: AlertLevel) -> [u8; 1] {
    [level.as_byte()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(address: Option<&str>, prefix: Option<&str>) -> DiscoveryOptions {
        DiscoveryOptions {
            device_address: address.map(str::to_string),
            name_prefix: prefix.map(str::to_string),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_unfiltered_discovery_accepts_anything() {
        assert!(options(None, None).matches("AA:BB:CC:DD:EE:FF", None));
    }

    #[test]
    fn test_address_filter_ignores_case() {
        let opts = options(Some("aa:bb:cc:dd:ee:ff"), None);
        assert!(opts.matches("AA:BB:CC:DD:EE:FF", Some("tag")));
        assert!(!opts.matches("AA:BB:CC:DD:EE:00", Some("tag")));
    }

    #[test]
    fn test_name_prefix_requires_a_name() {
        let opts = options(None, Some("nearguard"));
        assert!(opts.matches("AA:BB:CC:DD:EE:FF", Some("nearguard-tag")));
        assert!(!opts.matches("AA:BB:CC:DD:EE:FF", Some("headphones")));
        assert!(!opts.matches("AA:BB:CC:DD:EE:FF", None));
    }

    #[test]
    fn test_alert_encoding_is_one_byte() {
        assert_eq!(encode_alert(AlertLevel::Off), [0x00]);
        assert_eq!(encode_alert(AlertLevel::Mild), [0x01]);
        assert_eq!(encode_alert(AlertLevel::Strong), [0x02]);
    }

    #[tokio::test]
    async fn test_subscription_fires_once_then_stays_pending() {
        let (tx, rx) = oneshot::channel();
        let mut sub = DisconnectSubscription::new(rx);
        tx.send(()).unwrap();
        sub.notified().await;

        let mut again = tokio_test::task::spawn(sub.notified());
        tokio_test::assert_pending!(again.poll());
    }

    #[tokio::test]
    async fn test_subscription_fires_when_sender_dropped() {
        let (tx, rx) = oneshot::channel::<()>();
        let mut sub = DisconnectSubscription::new(rx);
        drop(tx);
        sub.notified().await;
    }

    #[test]
    fn test_dropping_subscription_runs_release() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let (_tx, rx) = oneshot::channel::<()>();
        let sub = DisconnectSubscription::new(rx).with_release(move || {
            flag.store(true, Ordering::SeqCst);
        });
        drop(sub);
        assert!(released.load(Ordering::SeqCst));
    }
}
