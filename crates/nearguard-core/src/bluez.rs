//! BlueZ transport backed by `bluer`.
//!
//! Linux only. Discovery runs an adapter scan until an advertiser passes the
//! [`DiscoveryOptions`] filter. A passive watch keeps the scan alive (BlueZ
//! refreshes RSSI only while discovering) and streams `Rssi` property changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bluer::gatt::remote::CharacteristicWriteRequest;
use bluer::gatt::WriteOp;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::{future, stream, StreamExt};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::CancelToken;
use crate::transport::{
    ConnectionHandle, DisconnectSubscription, DiscoveredDevice, DiscoveryOptions, LinkId,
    SampleStream, Transport, TransportError,
};
use crate::types::{DeviceIdentity, RawSample};

/// Write Without Response where the characteristic offers it (Alert Level
/// offers nothing else), an acknowledged request otherwise.
const fn write_op(without_response: bool) -> WriteOp {
    if without_response {
        WriteOp::Command
    } else {
        WriteOp::Request
    }
}

impl From<bluer::Error> for TransportError {
    fn from(err: bluer::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// [`Transport`] talking to the default BlueZ adapter.
pub struct BluezTransport {
    _session: Session,
    adapter: Adapter,
    links: Mutex<HashMap<LinkId, Device>>,
    next_link: AtomicU64,
}

impl BluezTransport {
    /// Open a D-Bus session and power on the default adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if BlueZ is not reachable or no adapter is present.
    pub async fn new() -> Result<Self, TransportError> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        info!(adapter = adapter.name(), "Bluetooth adapter ready");

        Ok(Self {
            _session: session,
            adapter,
            links: Mutex::new(HashMap::new()),
            next_link: AtomicU64::new(1),
        })
    }

    fn links(&self) -> MutexGuard<'_, HashMap<LinkId, Device>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device(&self, identity: &DeviceIdentity) -> Result<Device, TransportError> {
        let address: Address = identity
            .as_str()
            .parse()
            .map_err(|_| TransportError::NoDevice(format!("'{identity}' is not an address")))?;
        Ok(self.adapter.device(address)?)
    }

    fn linked(&self, link: LinkId) -> Result<Device, TransportError> {
        self.links()
            .get(&link)
            .cloned()
            .ok_or(TransportError::NotConnected)
    }

    async fn find_characteristic(
        device: &Device,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<bluer::gatt::remote::Characteristic, TransportError> {
        for svc in device.services().await? {
            if svc.uuid().await? != service {
                continue;
            }
            for chr in svc.characteristics().await? {
                if chr.uuid().await? == characteristic {
                    return Ok(chr);
                }
            }
            return Err(TransportError::AttributeNotFound(characteristic));
        }
        Err(TransportError::AttributeNotFound(service))
    }

    async fn scan(&self, options: &DiscoveryOptions) -> Result<DiscoveredDevice, TransportError> {
        let events = self.adapter.discover_devices().await?;
        futures::pin_mut!(events);

        while let Some(event) = events.next().await {
            let AdapterEvent::DeviceAdded(address) = event else {
                continue;
            };
            let device = self.adapter.device(address)?;
            let name = device.name().await?;
            debug!(%address, ?name, "Advertiser seen");

            if options.matches(&address.to_string(), name.as_deref()) {
                return Ok(DiscoveredDevice {
                    identity: DeviceIdentity::new(address.to_string()),
                    name,
                });
            }
        }
        Err(TransportError::NoDevice("discovery stream ended".into()))
    }
}

#[async_trait]
impl Transport for BluezTransport {
    async fn discover(
        &self,
        options: &DiscoveryOptions,
    ) -> Result<DiscoveredDevice, TransportError> {
        info!(timeout = ?options.timeout, "Scanning for beacon");
        tokio::time::timeout(options.timeout, self.scan(options))
            .await
            .map_err(|_| TransportError::Timeout(options.timeout))?
    }

    async fn watch(
        &self,
        identity: &DeviceIdentity,
        cancel: CancelToken,
    ) -> Result<SampleStream, TransportError> {
        let device = self.device(identity)?;
        let initial = device.rssi().await?.map(|rssi| RawSample { rssi });

        // Held only to keep the adapter scanning; its events are discarded.
        let scanning = self
            .adapter
            .discover_devices_with_changes()
            .await?
            .filter_map(|_| future::ready(None::<RawSample>));

        let changes = device.events().await?.filter_map(|event| {
            future::ready(match event {
                DeviceEvent::PropertyChanged(DeviceProperty::Rssi(rssi)) => {
                    Some(RawSample { rssi })
                }
                _ => None,
            })
        });

        Ok(stream::iter(initial)
            .chain(stream::select(scanning, changes))
            .take_until(async move { cancel.cancelled().await })
            .boxed())
    }

    async fn connect(&self, identity: &DeviceIdentity) -> Result<ConnectionHandle, TransportError> {
        let device = self.device(identity)?;
        if !device.is_connected().await? {
            device.connect().await?;
        }

        let link = LinkId::new(self.next_link.fetch_add(1, Ordering::Relaxed));
        self.links().insert(link, device);
        info!(device = %identity, %link, "Connected");
        Ok(ConnectionHandle::new(link, identity.clone()))
    }

    async fn write_characteristic(
        &self,
        link: LinkId,
        service: Uuid,
        characteristic: Uuid,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        let device = self.linked(link)?;
        let chr = Self::find_characteristic(&device, service, characteristic).await?;

        let op_type = write_op(chr.flags().await?.write_without_response);
        chr.write_ext(
            bytes,
            &CharacteristicWriteRequest {
                op_type,
                ..Default::default()
            },
        )
        .await?;
        Ok(())
    }

    async fn read_characteristic(
        &self,
        link: LinkId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        let device = self.linked(link)?;
        let chr = Self::find_characteristic(&device, service, characteristic).await?;
        Ok(chr.read().await?)
    }

    fn on_remote_disconnect(&self, handle: &ConnectionHandle) -> DisconnectSubscription {
        let (tx, rx) = oneshot::channel();
        // Without a live device `tx` is dropped here, which fires at once.
        let Ok(device) = self.linked(handle.link()) else {
            return DisconnectSubscription::new(rx);
        };

        let link = handle.link();
        let task = tokio::spawn(async move {
            let events = match device.events().await {
                Ok(events) => events,
                Err(err) => {
                    // Keep `tx` alive: an unobservable link is not a lost one.
                    warn!(%link, %err, "Cannot observe connection state");
                    let _keep = tx;
                    return future::pending::<()>().await;
                }
            };
            futures::pin_mut!(events);
            while let Some(event) = events.next().await {
                if matches!(
                    event,
                    DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))
                ) {
                    debug!(%link, "Remote side disconnected");
                    let _ = tx.send(());
                    return;
                }
            }
        });

        DisconnectSubscription::new(rx).with_release(move || task.abort())
    }

    async fn release(&self, handle: ConnectionHandle) {
        let Some(device) = self.links().remove(&handle.link()) else {
            return;
        };
        if let Err(err) = device.disconnect().await {
            debug!(link = %handle.link(), %err, "Disconnect failed, link already down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_write_is_unacknowledged_when_offered() {
        assert!(matches!(write_op(true), WriteOp::Command));
        assert!(matches!(write_op(false), WriteOp::Request));
    }
}
