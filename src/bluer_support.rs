//! [`LinkTransport`] on BlueZ, via `bluer`
//!
//! Supports the initiator role only. Client characteristic configuration is
//! managed by BlueZ itself: starting a notify session writes the descriptor and
//! dropping the session clears it.

use crate::connection::{LinkTransport, NotificationStream};
use crate::registry::CharacteristicHandle;
use crate::types::{DeviceRecord, LinkError, Result};
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::stream::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::sleep;

/// ATT header bytes subtracted from the MTU to get the usable write size
const ATT_HEADER_LEN: usize = 3;

/// Usable write size of a link with the default 23-byte MTU
const DEFAULT_MAX_WRITE: usize = 20;

/// Polls of the "services resolved" flag, one per second
const SERVICES_RESOLVED_POLLS: u32 = 30;

struct ConnectedDevice {
    device: Device,
    characteristics: HashMap<String, Characteristic>,
}

pub struct BlueRSupport {
    _session: Session,
    adapter: Adapter,
    link: Mutex<Option<ConnectedDevice>>,
}

impl BlueRSupport {
    /// Open a BlueZ session on the named adapter, or the default one
    pub async fn new(adapter_name: Option<&str>) -> Result<Self> {
        let session = Session::new().await?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        debug!("Using adapter {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Adapter {} is off, powering on", adapter.name());
            adapter.set_powered(true).await?;
        }

        Ok(Self {
            _session: session,
            adapter,
            link: Mutex::new(None),
        })
    }

    async fn device(&self) -> Option<Device> {
        self.link.lock().await.as_ref().map(|link| link.device.clone())
    }

    async fn characteristic(&self, handle: &CharacteristicHandle) -> Result<Characteristic> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(LinkError::NotConnected)?;
        link.characteristics
            .get(&handle.uuid)
            .cloned()
            .ok_or_else(|| LinkError::Transport(format!("characteristic {} not found", handle.uuid)))
    }

    async fn wait_services_resolved(device: &Device) -> Result<()> {
        for _ in 0..SERVICES_RESOLVED_POLLS {
            match device.is_services_resolved().await {
                Ok(true) => return Ok(()),
                Ok(false) => sleep(Duration::from_secs(1)).await,
                Err(e) => {
                    warn!("Could not check services resolved status: {}", e);
                    sleep(Duration::from_secs(2)).await;
                    return Ok(());
                }
            }
        }
        Err(LinkError::Timeout("GATT service resolution"))
    }
}

#[async_trait::async_trait]
impl LinkTransport for BlueRSupport {
    async fn scan(&self, duration: Duration) -> Result<Vec<DeviceRecord>> {
        let mut events = Box::pin(self.adapter.discover_devices().await?);
        let mut found: Vec<Address> = Vec::new();

        let deadline = sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                Some(event) = events.next() => {
                    if let AdapterEvent::DeviceAdded(address) = event {
                        if !found.contains(&address) {
                            debug!("Discovered {}", address);
                            found.push(address);
                        }
                    }
                }
                _ = &mut deadline => break,
            }
        }
        // Dropping the event stream stops discovery
        drop(events);

        let mut devices = Vec::with_capacity(found.len());
        for address in found {
            let device = self.adapter.device(address)?;
            devices.push(DeviceRecord {
                name: device.name().await?.unwrap_or_default(),
                address: address.to_string(),
                rssi: device.rssi().await?,
            });
        }
        Ok(devices)
    }

    async fn connect(&self, address: &str) -> Result<()> {
        let parsed: Address = address
            .parse()
            .map_err(|_| LinkError::Transport(format!("invalid address {}", address)))?;
        let device = self.adapter.device(parsed)?;

        if device.is_connected().await? {
            debug!("{} already connected", address);
        } else {
            device.connect().await?;
        }

        *self.link.lock().await = Some(ConnectedDevice {
            device,
            characteristics: HashMap::new(),
        });
        Ok(())
    }

    async fn accept(&self) -> Result<String> {
        Err(LinkError::Transport(
            "acceptor role needs a local GATT application, not available on BlueZ".to_string(),
        ))
    }

    async fn discover(&self) -> Result<Vec<CharacteristicHandle>> {
        let device = self.device().await.ok_or(LinkError::NotConnected)?;
        Self::wait_services_resolved(&device).await?;

        let mut characteristics = HashMap::new();
        for service in device.services().await? {
            for characteristic in service.characteristics().await? {
                let uuid = characteristic.uuid().await?.to_string().to_uppercase();
                characteristics.insert(uuid, characteristic);
            }
        }
        debug!("Found {} characteristics", characteristics.len());

        let handles = characteristics
            .keys()
            .map(|uuid| CharacteristicHandle::new(uuid.clone()))
            .collect();
        if let Some(link) = self.link.lock().await.as_mut() {
            link.characteristics = characteristics;
        }
        Ok(handles)
    }

    async fn max_write_len(&self) -> Result<usize> {
        let characteristic = {
            let link = self.link.lock().await;
            let link = link.as_ref().ok_or(LinkError::NotConnected)?;
            link.characteristics.values().next().cloned()
        };

        let Some(characteristic) = characteristic else {
            return Ok(DEFAULT_MAX_WRITE);
        };
        match characteristic.mtu().await {
            Ok(mtu) if mtu > ATT_HEADER_LEN => Ok(mtu - ATT_HEADER_LEN),
            Ok(mtu) => {
                warn!("Implausible MTU {}, using {}", mtu, DEFAULT_MAX_WRITE);
                Ok(DEFAULT_MAX_WRITE)
            }
            Err(e) => {
                warn!("Could not read MTU ({}), using {}", e, DEFAULT_MAX_WRITE);
                Ok(DEFAULT_MAX_WRITE)
            }
        }
    }

    async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(handle).await?;
        Ok(characteristic.read().await?)
    }

    async fn write(&self, handle: &CharacteristicHandle, data: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(handle).await?;
        characteristic.write(data).await?;
        Ok(())
    }

    async fn enable_notifications(
        &self,
        handle: &CharacteristicHandle,
    ) -> Result<NotificationStream> {
        let characteristic = self.characteristic(handle).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let uuid = handle.uuid.clone();

        // The notify session lives as long as this task; it ends once the
        // receiving side is dropped.
        tokio::spawn(async move {
            let stream = match characteristic.notify().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let mut stream = Box::pin(stream);
            loop {
                tokio::select! {
                    value = stream.next() => match value {
                        Some(value) => {
                            if tx.send(value).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = tx.closed() => break,
                }
            }
            debug!("Notify session for {} ended", uuid);
        });

        ready_rx
            .await
            .map_err(|_| LinkError::Transport("notify session task ended".to_string()))??;
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|value| (value, rx))
        })))
    }

    async fn write_client_config(&self, handle: &CharacteristicHandle, enable: bool) -> Result<()> {
        // BlueZ owns the descriptor; only check that the characteristic exists
        self.characteristic(handle).await?;
        debug!(
            "Client config for {} ({}) handled by the notify session",
            handle.uuid,
            if enable { "enable" } else { "disable" }
        );
        Ok(())
    }

    async fn wait_disconnected(&self) {
        let Some(device) = self.device().await else {
            return std::future::pending().await;
        };

        let mut events = match device.events().await {
            Ok(events) => Box::pin(events),
            Err(e) => {
                warn!("Cannot watch {} for disconnects: {}", device.address(), e);
                return std::future::pending().await;
            }
        };

        while let Some(event) = events.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                info!("{} reported disconnected", device.address());
                return;
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(link) = self.link.lock().await.take() else {
            return Ok(());
        };
        if link.device.is_connected().await? {
            link.device.disconnect().await?;
        }
        Ok(())
    }
}
