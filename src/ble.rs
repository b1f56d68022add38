use async_trait::async_trait;
use btleplug::{
    api::{
        Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::{Stream, StreamExt};
use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{Result, VeloxError},
    transport::{GattLink, Notification, NotificationSink, Transport},
    types::ScannedDevice,
    FTMS_SERVICE_UUID,
};

/// Subscribed characteristics and the sink their values are forwarded to
type Routes = Arc<RwLock<HashMap<Uuid, NotificationSink>>>;

/// Bluetooth SIG company identifiers of common trainer and platform vendors
const COMPANY_IDS: [(u16, &str); 8] = [
    (0x004C, "Apple"),
    (0x0006, "Microsoft"),
    (0x000F, "Broadcom"),
    (0x0075, "Samsung"),
    (0x0087, "Garmin"),
    (0x00D2, "Wahoo Fitness"),
    (0x011F, "Tacx"),
    (0x04D8, "Elite"),
];

/// Name fragments that identify a brand when no company id is advertised
const BRAND_HINTS: [(&str, &str); 11] = [
    ("wahoo", "Wahoo Fitness"),
    ("kicker", "Wahoo Fitness"),
    ("kickr", "Wahoo Fitness"),
    ("elite", "Elite"),
    ("direto", "Elite"),
    ("suito", "Elite"),
    ("tacx", "Tacx"),
    ("garmin", "Garmin"),
    ("saris", "Saris"),
    ("stages", "Stages"),
    ("zwift", "Zwift"),
];

/// Infer a manufacturer from advertised company ids, falling back to name hints
///
/// The lowest advertised company id wins. Unknown ids are reported as
/// `MFG 0xNNNN`.
#[must_use]
pub fn resolve_manufacturer(
    name: &str,
    company_ids: impl IntoIterator<Item = u16>,
) -> Option<String> {
    if let Some(id) = company_ids.into_iter().min() {
        return Some(
            COMPANY_IDS
                .iter()
                .find(|(known, _)| *known == id)
                .map_or_else(|| format!("MFG 0x{id:04X}"), |(_, brand)| (*brand).to_string()),
        );
    }

    let lowered = name.to_lowercase();
    BRAND_HINTS
        .iter()
        .find(|(hint, _)| lowered.contains(hint))
        .map(|(_, brand)| (*brand).to_string())
}

/// btleplug-backed [`Transport`]
pub struct BleTransport {
    manager: Manager,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
}

impl BleTransport {
    /// Create a new BLE transport
    ///
    /// # Errors
    ///
    /// Returns [`VeloxError::TransportUnavailable`] if the platform Bluetooth
    /// manager cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| VeloxError::TransportUnavailable(e.to_string()))?;

        Ok(Self {
            manager,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn central(&self) -> Result<Adapter> {
        let adapters = self
            .manager
            .adapters()
            .await
            .map_err(|e| VeloxError::TransportUnavailable(e.to_string()))?;
        adapters
            .into_iter()
            .next()
            .ok_or_else(|| {
                VeloxError::TransportUnavailable("No Bluetooth adapter found".to_string())
            })
    }

    async fn extract_device_info(peripheral: &Peripheral) -> Option<ScannedDevice> {
        let properties = peripheral.properties().await.ok().flatten()?;
        let name = properties
            .local_name
            .clone()
            .unwrap_or_else(|| "Unknown".to_string());
        let manufacturer =
            resolve_manufacturer(&name, properties.manufacturer_data.keys().copied());

        Some(ScannedDevice {
            has_ftms: properties.services.contains(&FTMS_SERVICE_UUID),
            address: properties.address.to_string(),
            rssi: properties.rssi.unwrap_or(i16::MIN),
            name,
            manufacturer,
        })
    }

    async fn cached_peripheral(&self, address: &str) -> Option<Peripheral> {
        self.peripherals
            .lock()
            .await
            .get(&address.to_lowercase())
            .cloned()
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn scan(&self, scan_timeout: Duration) -> Result<Vec<ScannedDevice>> {
        info!("Scanning for trainers for {:?}", scan_timeout);
        let central = self.central().await?;

        central.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(scan_timeout).await;
        central.stop_scan().await?;

        let mut devices = Vec::new();
        let mut cache = self.peripherals.lock().await;
        cache.clear();
        for peripheral in central.peripherals().await? {
            if let Some(device) = Self::extract_device_info(&peripheral).await {
                debug!(
                    "Found {} rssi={} ftms={}",
                    device.label(),
                    device.rssi,
                    device.has_ftms
                );
                cache.insert(device.address.to_lowercase(), peripheral);
                devices.push(device);
            }
        }
        drop(cache);

        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        info!(
            "Scan completed. Found {} device(s), {} with FTMS",
            devices.len(),
            devices.iter().filter(|d| d.has_ftms).count()
        );
        Ok(devices)
    }

    async fn connect(
        &self,
        address: &str,
        pair: bool,
        connect_timeout: Duration,
    ) -> Result<Arc<dyn GattLink>> {
        let peripheral = match self.cached_peripheral(address).await {
            Some(peripheral) => peripheral,
            None => {
                // Peripherals must be discovered before btleplug can connect
                self.scan(connect_timeout.min(Duration::from_secs(5))).await?;
                self.cached_peripheral(address)
                    .await
                    .ok_or(VeloxError::DeviceNotFound)?
            }
        };

        if pair {
            debug!("Pairing is not exposed by btleplug, using plain connect");
        }

        info!("Connecting to {}", address);
        let attempt = async {
            timeout(connect_timeout, peripheral.connect())
                .await
                .map_err(|_| VeloxError::Timeout {
                    timeout_ms: u64::try_from(connect_timeout.as_millis()).unwrap_or(u64::MAX),
                })?
                .map_err(|e| VeloxError::ConnectionFailed(e.to_string()))?;
            peripheral.discover_services().await?;
            // One stream for every characteristic keeps arrival order intact
            Ok::<_, VeloxError>(peripheral.notifications().await?)
        };
        let stream = release_on_error(attempt.await, peripheral.disconnect()).await?;

        let routes: Routes = Arc::new(RwLock::new(HashMap::new()));
        let forwarder = tokio::spawn(route_notifications(stream, Arc::clone(&routes)));
        Ok(Arc::new(BleLink {
            peripheral,
            routes,
            forwarder,
        }))
    }
}

/// Hand back a failed connect result, releasing the peripheral first
///
/// A half-open link (connected but without services or notifications) is
/// torn down so the next connect attempt starts clean.
async fn release_on_error<T, F, E>(result: Result<T>, release: F) -> Result<T>
where
    F: Future<Output = std::result::Result<(), E>>,
    E: fmt::Display,
{
    if let Err(e) = &result {
        debug!("Releasing peripheral after failed connect: {}", e);
        if let Err(release_error) = release.await {
            debug!("Disconnect after failed connect: {}", release_error);
        }
    }
    result
}

/// Active btleplug connection
pub struct BleLink {
    peripheral: Peripheral,
    routes: Routes,
    forwarder: JoinHandle<()>,
}

impl BleLink {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| VeloxError::Protocol(format!("Characteristic {uuid} not found")))
    }
}

#[async_trait]
impl GattLink for BleLink {
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(&characteristic).await?)
    }

    async fn write(&self, characteristic: Uuid, data: &[u8], with_response: bool) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        debug!("Writing {:02X?} to {}", data, characteristic.uuid);
        self.peripheral
            .write(&characteristic, data, write_type)
            .await
            .map_err(|e| {
                VeloxError::Protocol(format!("Failed to write {}: {e}", characteristic.uuid))
            })
    }

    async fn subscribe(&self, characteristic: Uuid, sink: NotificationSink) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        // Route first so the very first value is not dropped
        self.routes.write().await.insert(characteristic.uuid, sink);
        if let Err(e) = self.peripheral.subscribe(&characteristic).await {
            self.routes.write().await.remove(&characteristic.uuid);
            return Err(e.into());
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.forwarder.abort();
        self.routes.write().await.clear();
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Forward the peripheral's notifications to the sinks of subscribed characteristics
///
/// Runs as the only reader of the link's notification stream, so values reach
/// their sinks in the order the peripheral delivered them.
async fn route_notifications(
    mut stream: impl Stream<Item = ValueNotification> + Unpin,
    routes: Routes,
) {
    while let Some(data) = stream.next().await {
        let sink = routes.read().await.get(&data.uuid).cloned();
        let Some(sink) = sink else {
            trace!("Ignoring notification from unsubscribed {}", data.uuid);
            continue;
        };
        let notification = Notification {
            characteristic: data.uuid,
            value: data.value,
        };
        if sink.send(notification).is_err() {
            debug!("Sink for {} closed, dropping route", data.uuid);
            routes.write().await.remove(&data.uuid);
        }
    }
    warn!("Notification stream ended");
}
