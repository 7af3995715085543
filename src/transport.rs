//! Radio transport seam and its btleplug implementation.
//!
//! The session only ever talks to [`Transport`] and [`Link`], so the handshake
//! logic can be driven by [`crate::mock::MockTransport`] in tests and by
//! [`BleTransport`] against real hardware.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};

use crate::error::{MuseError, Result};
use crate::protocol::Channel;
use crate::types::NotificationFragment;

/// Notifications from every subscribed channel of one link.  The stream ends
/// when the device disconnects.
pub type NotificationStream = BoxStream<'static, NotificationFragment>;

/// Something that can find and open links to headsets.
#[async_trait]
pub trait Transport: Send + Sync {
    type Link: Link;

    /// Scan for `timeout` and return the addresses of matching devices.
    async fn discover(&self, timeout: Duration) -> Result<Vec<String>>;

    /// Open a link to `address`.  Service discovery is complete on return.
    async fn connect(&self, address: &str) -> Result<Self::Link>;
}

/// One open connection to a headset.
#[async_trait]
pub trait Link: Send + Sync {
    /// Channels the device currently exposes.
    fn channels(&self) -> Vec<Channel>;

    async fn subscribe(&self, channel: Channel) -> Result<()>;

    async fn write(&self, channel: Channel, data: &[u8], ack_required: bool) -> Result<()>;

    /// Take the notification stream for this link.
    async fn notifications(&self) -> Result<NotificationStream>;

    async fn disconnect(&self) -> Result<()>;
}

// ── btleplug ──────────────────────────────────────────────────────────────────

/// BLE transport backed by the first system Bluetooth adapter.
pub struct BleTransport {
    adapter: Adapter,
    name_prefix: String,
    connect_timeout: Duration,
}

impl BleTransport {
    /// Open the first Bluetooth adapter.
    ///
    /// On macOS, `CBCentralManager` needs a moment to reach *poweredOn* after
    /// initialisation; scanning before that is a silent no-op, so we wait up to
    /// 3 s for it here.
    pub async fn new(name_prefix: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MuseError::Transport("no Bluetooth adapter found".into()))?;

        #[cfg(target_os = "macos")]
        {
            use btleplug::api::CentralState;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => break,
                    Ok(state) if tokio::time::Instant::now() >= deadline => {
                        warn!("macOS: adapter still in state {state:?} after 3 s, proceeding");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("macOS: adapter_state() error: {e}");
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        Ok(Self {
            adapter,
            name_prefix: name_prefix.into(),
            connect_timeout,
        })
    }

    async fn matching_peripherals(&self) -> Result<Vec<(String, Peripheral)>> {
        let mut found = vec![];
        for p in self.adapter.peripherals().await? {
            if let Ok(Some(props)) = p.properties().await {
                if let Some(name) = props.local_name {
                    if name.starts_with(&self.name_prefix) {
                        found.push((name, p));
                    }
                }
            }
        }
        Ok(found)
    }

    /// Poll the adapter until `address` shows up or `timeout` expires.
    async fn find(&self, address: &str, timeout: Duration) -> Result<Peripheral> {
        let search = async {
            loop {
                if let Ok(peripherals) = self.adapter.peripherals().await {
                    if let Some(p) = peripherals.into_iter().find(|p| p.id().to_string() == address) {
                        return p;
                    }
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        };
        self.adapter.start_scan(ScanFilter::default()).await?;
        let result = tokio::time::timeout(timeout, search).await;
        self.adapter.stop_scan().await.ok();
        result.map_err(|_| MuseError::Transport(format!("device {address} not found")))
    }
}

#[async_trait]
impl Transport for BleTransport {
    type Link = BleLink;

    async fn discover(&self, timeout: Duration) -> Result<Vec<String>> {
        info!("discover: scanning for {} s …", timeout.as_secs_f32());
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(timeout).await;
        self.adapter.stop_scan().await.ok();

        let found: Vec<String> = self
            .matching_peripherals()
            .await?
            .into_iter()
            .map(|(name, p)| {
                let id = p.id().to_string();
                info!("discover: found {name}  id={id}");
                id
            })
            .collect();
        info!("discover: {} device(s) found", found.len());
        Ok(found)
    }

    async fn connect(&self, address: &str) -> Result<BleLink> {
        let peripheral = self.find(address, self.connect_timeout).await?;

        // BlueZ's Device1.Connect can block forever when the device is out of
        // range, so the connect call gets its own hard timeout.
        tokio::time::timeout(self.connect_timeout, peripheral.connect())
            .await
            .map_err(|_| MuseError::Transport(format!("connect to {address} timed out")))??;

        // bluez signals the connection before the remote GATT cache is
        // populated; discovering services immediately can return an empty set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(Duration::from_secs(15), peripheral.discover_services()).await??;
        let chars = peripheral.characteristics();
        info!("{address}: connected, {} characteristic(s) discovered", chars.len());

        Ok(BleLink {
            peripheral,
            adapter: self.adapter.clone(),
            chars,
        })
    }
}

/// An open btleplug connection.
pub struct BleLink {
    peripheral: Peripheral,
    adapter: Adapter,
    chars: BTreeSet<Characteristic>,
}

impl BleLink {
    fn find_char(&self, channel: Channel) -> Result<&Characteristic> {
        let uuid = channel.uuid();
        self.chars
            .iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| MuseError::Transport(format!("characteristic {uuid} ({channel}) not found")))
    }
}

#[async_trait]
impl Link for BleLink {
    fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> =
            self.chars.iter().filter_map(|c| Channel::from_uuid(c.uuid)).collect();
        channels.sort();
        channels.dedup();
        channels
    }

    async fn subscribe(&self, channel: Channel) -> Result<()> {
        let c = self.find_char(channel)?;
        self.peripheral.subscribe(c).await?;
        debug!("subscribed to {channel}");
        Ok(())
    }

    async fn write(&self, channel: Channel, data: &[u8], ack_required: bool) -> Result<()> {
        let c = self.find_char(channel)?;
        let write_type = if ack_required {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral.write(c, data, write_type).await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let notifications = self.peripheral.notifications().await?;

        // The notification stream does not always end promptly when the link
        // drops, so the adapter's disconnect event also terminates it.
        let peripheral_id = self.peripheral.id();
        let mut events = self.adapter.events().await?;
        let disconnected = async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        info!("disconnect watcher: device {id:?} disconnected");
                        break;
                    }
                }
            }
        };

        Ok(notifications
            .filter_map(|n| async move {
                match Channel::from_uuid(n.uuid) {
                    Some(channel) => Some(NotificationFragment::new(channel, n.value)),
                    None => {
                        debug!("notification from unhandled characteristic {}", n.uuid);
                        None
                    }
                }
            })
            .take_until(disconnected)
            .boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
