//! Bluetooth LE transport built on `bluest`
//!
//! JBD boards expose service `ff00` with a notify characteristic `ff01`
//! (responses) and a write characteristic `ff02` (requests).

use super::transport::{Connector, Transport};
use crate::error::LinkError;
use bluest::{Adapter, Characteristic, Device, Uuid};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};

const SERVICE: Uuid = Uuid::from_u128(0x0000_ff00_0000_1000_8000_0080_5f9b_34fb);
const NOTIFY: Uuid = Uuid::from_u128(0x0000_ff01_0000_1000_8000_0080_5f9b_34fb);
const WRITE: Uuid = Uuid::from_u128(0x0000_ff02_0000_1000_8000_0080_5f9b_34fb);

/// Notification chunks buffered between the forwarder task and the session
const NOTIFY_QUEUE: usize = 64;

/// Connects to units through the default adapter
pub struct BleConnector {
    adapter: Adapter,
}

impl BleConnector {
    pub async fn new() -> Result<Self, LinkError> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| LinkError::io("Default Bluetooth adapter not found"))?;
        adapter
            .wait_available()
            .await
            .map_err(|e| LinkError::io(e.to_string()))?;
        Ok(Self { adapter })
    }

    /// Scan until a device advertising the BMS service matches `address`,
    /// either by platform id or by advertised name.
    async fn discover(&self, address: &str) -> Result<Device, LinkError> {
        let mut scan = self
            .adapter
            .scan(&[SERVICE])
            .await
            .map_err(|e| LinkError::io(e.to_string()))?;
        let wanted = address.to_uppercase();
        while let Some(found) = scan.next().await {
            let id = format!("{:?}", found.device.id()).to_uppercase();
            let name = found.device.name_async().await.unwrap_or_default();
            if id.contains(&wanted) || name.eq_ignore_ascii_case(address) {
                return Ok(found.device);
            }
        }
        Err(LinkError::unreachable(address, "scan ended without a match"))
    }

    async fn characteristic(
        &self,
        address: &str,
        device: &Device,
        uuid: Uuid,
    ) -> Result<Characteristic, LinkError> {
        let service = device
            .discover_services_with_uuid(SERVICE)
            .await
            .map_err(|e| LinkError::unreachable(address, e.to_string()))?
            .first()
            .cloned()
            .ok_or_else(|| LinkError::unreachable(address, "BMS service missing"))?;
        service
            .discover_characteristics_with_uuid(uuid)
            .await
            .map_err(|e| LinkError::unreachable(address, e.to_string()))?
            .first()
            .cloned()
            .ok_or_else(|| LinkError::unreachable(address, format!("characteristic {uuid} missing")))
    }
}

#[async_trait::async_trait]
impl Connector for BleConnector {
    type Transport = BleTransport;

    async fn connect(&self, address: &str) -> Result<BleTransport, LinkError> {
        let device = self.discover(address).await?;
        let mut guard = ConnectGuard {
            adapter: self.adapter.clone(),
            device: device.clone(),
            armed: true,
        };
        self.adapter
            .connect_device(&device)
            .await
            .map_err(|e| LinkError::unreachable(address, e.to_string()))?;

        let notify = self.characteristic(address, &device, NOTIFY).await?;
        let write = self.characteristic(address, &device, WRITE).await?;
        guard.armed = false;

        // The notify stream borrows its characteristic, so it lives in a
        // task of its own and hands chunks over a channel.
        let (tx, rx) = mpsc::channel(NOTIFY_QUEUE);
        let owner = address.to_string();
        let forwarder = tokio::spawn(async move {
            let stream = match notify.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx
                        .send(Err(LinkError::disconnected(owner, e.to_string())))
                        .await;
                    return;
                }
            };
            futures_util::pin_mut!(stream);
            while let Some(item) = stream.next().await {
                let chunk = item.map_err(|e| LinkError::disconnected(owner.clone(), e.to_string()));
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(Err(LinkError::disconnected(owner, "notification stream ended")))
                .await;
        });

        Ok(BleTransport {
            address: address.to_string(),
            adapter: self.adapter.clone(),
            device,
            write,
            chunks: rx,
            forwarder: Some(forwarder),
        })
    }
}

/// Disconnects a half-set-up device when connecting fails or the connect
/// future is dropped by a timeout.
struct ConnectGuard {
    adapter: Adapter,
    device: Device,
    armed: bool,
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let adapter = self.adapter.clone();
        let device = self.device.clone();
        runtime.spawn(async move {
            if let Err(e) = adapter.disconnect_device(&device).await {
                tracing::debug!("Disconnect after failed connect failed: {}", e);
            }
        });
    }
}

/// A connected BMS
pub struct BleTransport {
    address: String,
    adapter: Adapter,
    device: Device,
    write: Characteristic,
    chunks: mpsc::Receiver<Result<Vec<u8>, LinkError>>,
    forwarder: Option<JoinHandle<()>>,
}

#[async_trait::async_trait]
impl Transport for BleTransport {
    async fn write(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        self.write
            .write(frame)
            .await
            .map_err(|e| LinkError::disconnected(self.address.clone(), e.to_string()))
    }

    async fn read_chunk(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, LinkError> {
        match timeout(wait, self.chunks.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(chunk)) => chunk.map(Some),
            Ok(None) => Err(LinkError::disconnected(
                self.address.clone(),
                "notification forwarder stopped",
            )),
        }
    }

    async fn close(&mut self) {
        let Some(forwarder) = self.forwarder.take() else {
            return;
        };
        forwarder.abort();
        if let Err(e) = self.adapter.disconnect_device(&self.device).await {
            tracing::debug!("Disconnect from {} failed: {}", self.address, e);
        }
    }
}
