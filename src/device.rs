use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        Mutex,
    },
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn, Level};

use crate::{
    ble::BleTransport,
    error::{Result, VeloxError},
    protocol::{ControlPointCommand, ControlPointResponse},
    telemetry::{decode_indoor_bike, flags, indoor_bike_candidates, MetricsMerger},
    trainer::Trainer,
    transport::{GattLink, Notification, NotificationSink, Transport},
    types::{
        ConnectTarget, ConnectionParams, ControlConfig, IndoorBikeMetrics, ScannedDevice,
        SupportedPowerRange,
    },
    workout::TargetMode,
    CYCLING_POWER_MEASUREMENT_UUID, FTMS_CONTROL_POINT_UUID, INDOOR_BIKE_DATA_UUID,
    SUPPORTED_POWER_RANGE_UUID,
};

type MetricsSlot = Arc<Mutex<Option<mpsc::Sender<IndoorBikeMetrics>>>>;

/// Supported power range as known for the current connection
#[derive(Debug, Clone, Copy)]
enum PowerRangeCache {
    Unread,
    Unavailable,
    Known(SupportedPowerRange),
}

/// State that lives exactly as long as one connection
struct Session {
    link: Arc<dyn GattLink>,
    label: String,
    power_range: PowerRangeCache,
    control_indications: bool,
    telemetry_subscribed: bool,
    notifications: NotificationSink,
    metrics: MetricsSlot,
    dispatcher: JoinHandle<()>,
}

impl Session {
    fn start(link: Arc<dyn GattLink>, label: String) -> Self {
        let (notifications, rx) = mpsc::unbounded_channel();
        let metrics: MetricsSlot = Arc::new(Mutex::new(None));
        let dispatcher = tokio::spawn(dispatch_notifications(rx, Arc::clone(&metrics)));

        Self {
            link,
            label,
            power_range: PowerRangeCache::Unread,
            control_indications: false,
            telemetry_subscribed: false,
            notifications,
            metrics,
            dispatcher,
        }
    }

    async fn close(self) -> Result<()> {
        self.dispatcher.abort();
        self.link.disconnect().await
    }

    /// Read the supported power range the first time it is needed
    async fn power_range(&mut self) -> Option<SupportedPowerRange> {
        if matches!(self.power_range, PowerRangeCache::Unread) {
            self.power_range = match self.link.read(SUPPORTED_POWER_RANGE_UUID).await {
                Ok(raw) => match SupportedPowerRange::from_bytes(&raw) {
                    Some(range) => {
                        info!("Supported power range: {}", range);
                        PowerRangeCache::Known(range)
                    }
                    None => {
                        warn!("Supported power range payload too short: {:02X?}", raw);
                        PowerRangeCache::Unavailable
                    }
                },
                Err(e) => {
                    warn!("Supported power range unavailable: {}", e);
                    PowerRangeCache::Unavailable
                }
            };
        }

        match self.power_range {
            PowerRangeCache::Known(range) => Some(range),
            PowerRangeCache::Unread | PowerRangeCache::Unavailable => None,
        }
    }

    async fn ensure_control_indications(&mut self) {
        if self.control_indications {
            return;
        }
        match self
            .link
            .subscribe(FTMS_CONTROL_POINT_UUID, self.notifications.clone())
            .await
        {
            Ok(()) => {
                self.control_indications = true;
                debug!("Control point indications enabled");
            }
            Err(e) => warn!("Control point indications unavailable: {}", e),
        }
    }

    async fn write_command(&self, command: ControlPointCommand) -> Result<()> {
        let bytes = command.to_bytes();
        debug!("Control point <- {:?} {:02X?}", command, &bytes[..]);
        self.link.write(FTMS_CONTROL_POINT_UUID, &bytes, true).await
    }
}

/// FTMS smart trainer reached through a [`Transport`]
///
/// Owns the connection lifecycle: target resolution, capability discovery,
/// ERG control with fallback command sequences and telemetry dispatch.
///
/// # Examples
///
/// ```no_run
/// use velox::{ConnectTarget, FtmsDevice, Trainer};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let trainer = FtmsDevice::bluetooth().await?;
///     let label = trainer.connect(&ConnectTarget::Auto).await?;
///     println!("Connected to {label}");
///
///     let applied = trainer.set_target_power(203).await?;
///     println!("Holding {applied} W");
///
///     trainer.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct FtmsDevice {
    transport: Arc<dyn Transport>,
    params: ConnectionParams,
    control: ControlConfig,
    scan_cache: Mutex<Vec<ScannedDevice>>,
    session: Arc<Mutex<Option<Session>>>,
}

impl FtmsDevice {
    /// Create a device link over `transport` with default settings
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, ConnectionParams::default(), ControlConfig::default())
    }

    /// Create a device link with explicit connection and control settings
    #[must_use]
    pub fn with_config(
        transport: Arc<dyn Transport>,
        params: ConnectionParams,
        control: ControlConfig,
    ) -> Self {
        Self {
            transport,
            params,
            control,
            scan_cache: Mutex::new(Vec::new()),
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a device link on the host Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`VeloxError::TransportUnavailable`] when the Bluetooth stack
    /// cannot be initialized.
    pub async fn bluetooth() -> Result<Self> {
        Ok(Self::new(Arc::new(BleTransport::new().await?)))
    }

    /// Connection settings in use
    #[must_use]
    pub const fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Label of the connected trainer, if any
    pub async fn label(&self) -> Option<String> {
        self.session.lock().await.as_ref().map(|s| s.label.clone())
    }

    /// Resolve a connect target to an address and a display label
    async fn resolve_target(&self, target: &ConnectTarget) -> Result<(String, String)> {
        match target {
            ConnectTarget::Auto => {
                let devices = self.scan().await?;
                devices
                    .iter()
                    .find(|d| d.has_ftms)
                    .map(|d| (d.address.clone(), d.label()))
                    .ok_or(VeloxError::DeviceNotFound)
            }
            ConnectTarget::Named(wanted) => {
                let cached = self
                    .scan_cache
                    .lock()
                    .await
                    .iter()
                    .find(|d| d.matches(wanted))
                    .map(|d| (d.address.clone(), d.label()));
                if let Some(found) = cached {
                    return Ok(found);
                }

                let scanned = self
                    .scan()
                    .await?
                    .into_iter()
                    .find(|d| d.matches(wanted))
                    .map(|d| (d.address.clone(), d.label()));

                // Some trainers accept a direct connection without advertising
                Ok(scanned.unwrap_or_else(|| (wanted.clone(), format!("Unknown ({wanted})"))))
            }
        }
    }

    async fn open_link(&self, address: &str) -> Result<Arc<dyn GattLink>> {
        let timeout = self.params.connect_timeout();
        match self.transport.connect(address, self.params.pair, timeout).await {
            Ok(link) => Ok(link),
            Err(e) if self.params.pair => {
                warn!(
                    "Paired connect to {} failed, retrying without pairing: {}",
                    address, e
                );
                self.transport.connect(address, false, timeout).await
            }
            Err(e) => Err(e),
        }
    }

    /// Write the three control point sequences in order until one succeeds
    async fn write_power_sequences(&self, session: &Session, watts: i16) -> Result<()> {
        let set_target = ControlPointCommand::SetTargetPower(watts);
        let sequences: [&[ControlPointCommand]; 3] = [
            &[
                ControlPointCommand::RequestControl,
                ControlPointCommand::StartResume,
                set_target,
            ],
            &[ControlPointCommand::RequestControl, set_target],
            &[set_target],
        ];
        let spacing = Duration::from_millis(self.control.command_spacing_ms);

        let mut last_error = None;
        for (index, sequence) in sequences.iter().enumerate() {
            match Self::write_sequence(session, sequence, spacing).await {
                Ok(()) => {
                    debug!("ERG target {} W accepted by sequence {}", watts, index + 1);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Control sequence {} failed: {}", index + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(VeloxError::ControlRejected {
            watts: i32::from(watts),
            source: Box::new(
                last_error.unwrap_or_else(|| VeloxError::Protocol("no sequence attempted".into())),
            ),
        })
    }

    async fn write_sequence(
        session: &Session,
        sequence: &[ControlPointCommand],
        spacing: Duration,
    ) -> Result<()> {
        for (i, command) in sequence.iter().enumerate() {
            session.write_command(*command).await?;
            if i + 1 < sequence.len() {
                tokio::time::sleep(spacing).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Trainer for FtmsDevice {
    async fn scan(&self) -> Result<Vec<ScannedDevice>> {
        let devices = self.transport.scan(self.params.scan_timeout()).await?;
        self.scan_cache.lock().await.clone_from(&devices);
        Ok(devices)
    }

    async fn connect(&self, target: &ConnectTarget) -> Result<String> {
        let (address, label) = self.resolve_target(target).await?;

        let previous = self.session.lock().await.take();
        if let Some(previous) = previous {
            info!("Replacing connection to {}", previous.label);
            if let Err(e) = previous.close().await {
                warn!("Failed to close previous connection: {}", e);
            }
        }

        let link = self.open_link(&address).await?;
        info!("Connected to {}", label);
        *self.session.lock().await = Some(Session::start(link, label.clone()));
        Ok(label)
    }

    async fn disconnect(&self) -> Result<()> {
        let session = self.session.lock().await.take();
        match session {
            Some(session) => {
                info!("Disconnecting from {}", session.label);
                session.close().await
            }
            None => Ok(()),
        }
    }

    async fn is_connected(&self) -> bool {
        match self.session.lock().await.as_ref() {
            Some(session) => session.link.is_connected().await,
            None => false,
        }
    }

    async fn subscribe_metrics(&self) -> Result<mpsc::Receiver<IndoorBikeMetrics>> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(VeloxError::NotConnected)?;

        if !session.telemetry_subscribed {
            let mut subscribed_any = false;
            for (characteristic, name) in [
                (INDOOR_BIKE_DATA_UUID, "Indoor Bike Data"),
                (CYCLING_POWER_MEASUREMENT_UUID, "Cycling Power Measurement"),
            ] {
                match session
                    .link
                    .subscribe(characteristic, session.notifications.clone())
                    .await
                {
                    Ok(()) => {
                        info!("Subscribed to {}", name);
                        subscribed_any = true;
                    }
                    Err(e) => debug!("{} unavailable: {}", name, e),
                }
            }
            if !subscribed_any {
                return Err(VeloxError::Protocol(
                    "No compatible measurement characteristic found (expected 0x2AD2 and/or 0x2A63)"
                        .to_string(),
                ));
            }
            session.telemetry_subscribed = true;
        }

        let (tx, rx) = mpsc::channel(self.control.metrics_buffer.max(1));
        *session.metrics.lock().await = Some(tx);
        Ok(rx)
    }

    async fn set_target_power(&self, watts: i32) -> Result<i32> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(VeloxError::NotConnected)?;

        session.ensure_control_indications().await;
        let applied = match session.power_range().await {
            Some(range) => {
                let normalized = range.normalize(watts);
                if normalized != watts {
                    debug!("Adjusted ERG target {} W -> {} W ({})", watts, normalized, range);
                }
                normalized
            }
            None => watts.clamp(i32::from(i16::MIN), i32::from(i16::MAX)),
        };
        let wire = i16::try_from(applied).map_err(|_| {
            VeloxError::InvalidParameters(format!("Target {applied} W does not fit the control point"))
        })?;

        self.write_power_sequences(session, wire).await?;
        info!("ERG target set to {} W", applied);
        Ok(applied)
    }

    async fn probe_erg_support(&self) -> bool {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return false;
        };

        session.ensure_control_indications().await;
        match session.write_command(ControlPointCommand::RequestControl).await {
            Ok(()) => true,
            Err(e) => {
                warn!("ERG probe failed: {}", e);
                false
            }
        }
    }

    async fn set_target_resistance(&self, _level: f64) -> Result<f64> {
        Err(VeloxError::UnsupportedMode(TargetMode::Resistance))
    }

    async fn set_target_slope(&self, _percent: f64) -> Result<f64> {
        Err(VeloxError::UnsupportedMode(TargetMode::Slope))
    }
}

impl Drop for FtmsDevice {
    fn drop(&mut self) {
        let session = Arc::clone(&self.session);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let value = session.lock().await.take();
                if let Some(session) = value {
                    let _ = session.close().await;
                }
            });
        }
    }
}

fn trace_indoor_bike_candidates(value: &[u8]) {
    let Ok(candidates) = indoor_bike_candidates(value) else {
        return;
    };
    trace!(
        "Indoor Bike Data {:02X?} flags={:?}",
        value,
        flags::describe(u16::from_le_bytes([value[0], value[1]]))
    );
    for candidate in candidates.iter().flatten() {
        trace!(
            "  speed_present={} penalty={} consumed={} -> {:?}",
            candidate.speed_present,
            candidate.penalty,
            candidate.consumed,
            candidate.metrics
        );
    }
}

/// Decode every notification of one connection and hand merged metrics off
async fn dispatch_notifications(
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    metrics: MetricsSlot,
) {
    let mut merger = MetricsMerger::new();

    while let Some(Notification {
        characteristic,
        value,
    }) = notifications.recv().await
    {
        if characteristic == INDOOR_BIKE_DATA_UUID {
            if tracing::enabled!(Level::TRACE) {
                trace_indoor_bike_candidates(&value);
            }
            match decode_indoor_bike(&value) {
                Ok(sample) => merger.apply_indoor_bike(sample),
                Err(e) => {
                    warn!("Dropping Indoor Bike Data frame {:02X?}: {}", value, e);
                    continue;
                }
            }
        } else if characteristic == CYCLING_POWER_MEASUREMENT_UUID {
            let sample = merger.apply_cycling_power(&value);
            trace!("Cycling Power Measurement {:02X?} -> {:?}", value, sample);
        } else if characteristic == FTMS_CONTROL_POINT_UUID {
            match ControlPointResponse::parse(&value) {
                Some(response) => debug!(
                    "Control point response req=0x{:02X} result={} payload={:02X?}",
                    response.request_opcode, response.result, value
                ),
                None => debug!("Control point indication {:02X?}", value),
            }
            continue;
        } else {
            trace!("Ignoring notification on {}", characteristic);
            continue;
        }

        let merged = merger.merged();
        if let Some(tx) = metrics.lock().await.as_ref() {
            match tx.try_send(merged) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => debug!("Metrics consumer lagging, sample dropped"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    };
    use uuid::Uuid;

    #[derive(Default)]
    struct MockLink {
        writes: StdMutex<Vec<Vec<u8>>>,
        fail_next_writes: AtomicUsize,
        rejected_opcodes: Vec<u8>,
        power_range: Option<Vec<u8>>,
        range_reads: AtomicUsize,
        subscribable: Vec<Uuid>,
        sinks: StdMutex<Vec<(Uuid, NotificationSink)>>,
    }

    impl MockLink {
        fn ftms() -> Self {
            Self {
                power_range: Some(vec![0x32, 0x00, 0xB0, 0x04, 0x05, 0x00]),
                subscribable: vec![
                    INDOOR_BIKE_DATA_UUID,
                    CYCLING_POWER_MEASUREMENT_UUID,
                    FTMS_CONTROL_POINT_UUID,
                ],
                ..Self::default()
            }
        }

        fn written(&self) -> Vec<Vec<u8>> {
            self.writes.lock().unwrap().clone()
        }

        fn notify(&self, characteristic: Uuid, value: &[u8]) {
            for (uuid, sink) in self.sinks.lock().unwrap().iter() {
                if *uuid == characteristic {
                    sink.send(Notification {
                        characteristic,
                        value: value.to_vec(),
                    })
                    .unwrap();
                }
            }
        }
    }

    #[async_trait]
    impl GattLink for MockLink {
        async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
            assert_eq!(characteristic, SUPPORTED_POWER_RANGE_UUID);
            self.range_reads.fetch_add(1, Ordering::SeqCst);
            self.power_range
                .clone()
                .ok_or_else(|| VeloxError::Protocol("not readable".into()))
        }

        async fn write(&self, characteristic: Uuid, data: &[u8], with_response: bool) -> Result<()> {
            assert_eq!(characteristic, FTMS_CONTROL_POINT_UUID);
            assert!(with_response);
            self.writes.lock().unwrap().push(data.to_vec());

            let fail = self
                .fail_next_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail || self.rejected_opcodes.contains(&data[0]) {
                return Err(VeloxError::Protocol("write not permitted".into()));
            }
            Ok(())
        }

        async fn subscribe(&self, characteristic: Uuid, sink: NotificationSink) -> Result<()> {
            if !self.subscribable.contains(&characteristic) {
                return Err(VeloxError::Protocol("no such characteristic".into()));
            }
            self.sinks.lock().unwrap().push((characteristic, sink));
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            true
        }
    }

    struct MockTransport {
        devices: Vec<ScannedDevice>,
        link: Arc<MockLink>,
        pair_fails: bool,
        scans: AtomicUsize,
        connects: StdMutex<Vec<(String, bool)>>,
    }

    impl MockTransport {
        fn new(link: MockLink) -> Self {
            Self {
                devices: vec![
                    device("HRM-Pro", "11:22:33:44:55:66", -40, false),
                    device("KICKR CORE 1A2B", "C4:7F:51:00:11:22", -55, true),
                    device("DIRETO XR", "D0:00:00:00:00:01", -70, true),
                ],
                link: Arc::new(link),
                pair_fails: false,
                scans: AtomicUsize::new(0),
                connects: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn scan(&self, _timeout: Duration) -> Result<Vec<ScannedDevice>> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            Ok(self.devices.clone())
        }

        async fn connect(
            &self,
            address: &str,
            pair: bool,
            _timeout: Duration,
        ) -> Result<Arc<dyn GattLink>> {
            self.connects
                .lock()
                .unwrap()
                .push((address.to_string(), pair));
            if pair && self.pair_fails {
                return Err(VeloxError::ConnectionFailed("pairing refused".into()));
            }
            Ok(Arc::clone(&self.link) as Arc<dyn GattLink>)
        }
    }

    fn device(name: &str, address: &str, rssi: i16, has_ftms: bool) -> ScannedDevice {
        ScannedDevice {
            name: name.to_string(),
            address: address.to_string(),
            rssi,
            has_ftms,
            manufacturer: None,
        }
    }

    fn trainer_with(transport: &Arc<MockTransport>) -> FtmsDevice {
        FtmsDevice::new(Arc::clone(transport) as Arc<dyn Transport>)
    }

    async fn connected(link: MockLink) -> (Arc<MockTransport>, FtmsDevice) {
        let transport = Arc::new(MockTransport::new(link));
        let trainer = trainer_with(&transport);
        trainer.connect(&ConnectTarget::Auto).await.unwrap();
        (transport, trainer)
    }

    #[tokio::test]
    async fn test_auto_connect_picks_first_ftms_device() {
        let transport = Arc::new(MockTransport::new(MockLink::ftms()));
        let trainer = trainer_with(&transport);

        let label = trainer.connect(&ConnectTarget::Auto).await.unwrap();
        assert_eq!(label, "KICKR CORE 1A2B (C4:7F:51:00:11:22)");
        assert!(trainer.is_connected().await);
        assert_eq!(
            transport.connects.lock().unwrap()[0],
            ("C4:7F:51:00:11:22".to_string(), true)
        );
    }

    #[tokio::test]
    async fn test_auto_connect_without_ftms_device_fails() {
        let mut transport = MockTransport::new(MockLink::ftms());
        transport.devices.retain(|d| !d.has_ftms);
        let trainer = FtmsDevice::new(Arc::new(transport));

        let result = trainer.connect(&ConnectTarget::Auto).await;
        assert!(matches!(result, Err(VeloxError::DeviceNotFound)));
        assert!(!trainer.is_connected().await);
    }

    #[tokio::test]
    async fn test_named_connect_uses_scan_cache() {
        let transport = Arc::new(MockTransport::new(MockLink::ftms()));
        let trainer = trainer_with(&transport);

        trainer.scan().await.unwrap();
        let label = trainer
            .connect(&ConnectTarget::Named("direto xr".to_string()))
            .await
            .unwrap();
        assert_eq!(label, "DIRETO XR (D0:00:00:00:00:01)");
        assert_eq!(transport.scans.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_named_connect_falls_back_to_raw_address() {
        let transport = Arc::new(MockTransport::new(MockLink::ftms()));
        let trainer = trainer_with(&transport);

        let label = trainer
            .connect(&ConnectTarget::Named("AA:BB:CC:DD:EE:FF".to_string()))
            .await
            .unwrap();
        assert_eq!(label, "Unknown (AA:BB:CC:DD:EE:FF)");
        assert_eq!(transport.scans.load(Ordering::SeqCst), 1);
        assert_eq!(transport.connects.lock().unwrap()[0].0, "AA:BB:CC:DD:EE:FF");
    }

    #[tokio::test]
    async fn test_pairing_failure_retries_unpaired() {
        let mut transport = MockTransport::new(MockLink::ftms());
        transport.pair_fails = true;
        let transport = Arc::new(transport);
        let trainer = trainer_with(&transport);

        trainer.connect(&ConnectTarget::Auto).await.unwrap();
        let connects = transport.connects.lock().unwrap().clone();
        assert_eq!(connects.len(), 2);
        assert!(connects[0].1);
        assert!(!connects[1].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_target_power_normalizes_and_writes_full_sequence() {
        let (transport, trainer) = connected(MockLink::ftms()).await;

        assert_eq!(trainer.set_target_power(203).await.unwrap(), 205);
        assert_eq!(
            transport.link.written(),
            vec![vec![0x00], vec![0x07], vec![0x05, 0xCD, 0x00]]
        );

        assert_eq!(trainer.set_target_power(5000).await.unwrap(), 1200);
        assert_eq!(transport.link.range_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_target_power_falls_back_when_start_is_rejected() {
        let link = MockLink {
            rejected_opcodes: vec![0x07],
            ..MockLink::ftms()
        };
        let (transport, trainer) = connected(link).await;

        assert_eq!(trainer.set_target_power(250).await.unwrap(), 250);
        assert_eq!(
            transport.link.written(),
            vec![vec![0x00], vec![0x07], vec![0x00], vec![0x05, 0xFA, 0x00]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_target_power_last_resort_sequence() {
        let link = MockLink {
            fail_next_writes: AtomicUsize::new(2),
            ..MockLink::ftms()
        };
        let (transport, trainer) = connected(link).await;

        assert_eq!(trainer.set_target_power(150).await.unwrap(), 150);
        assert_eq!(
            transport.link.written(),
            vec![vec![0x00], vec![0x00], vec![0x05, 0x96, 0x00]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_target_power_rejected_after_all_sequences() {
        let link = MockLink {
            fail_next_writes: AtomicUsize::new(usize::MAX),
            ..MockLink::ftms()
        };
        let (transport, trainer) = connected(link).await;

        let result = trainer.set_target_power(203).await;
        match result {
            Err(VeloxError::ControlRejected { watts, source }) => {
                assert_eq!(watts, 205);
                assert!(matches!(*source, VeloxError::Protocol(_)));
            }
            other => panic!("expected ControlRejected, got {other:?}"),
        }
        assert_eq!(transport.link.written().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_power_range_sends_request_unchanged() {
        let link = MockLink {
            power_range: None,
            ..MockLink::ftms()
        };
        let (transport, trainer) = connected(link).await;

        assert_eq!(trainer.set_target_power(203).await.unwrap(), 203);
        assert_eq!(trainer.set_target_power(207).await.unwrap(), 207);
        assert_eq!(transport.link.range_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_range_reread_after_reconnect() {
        let (transport, trainer) = connected(MockLink::ftms()).await;

        trainer.set_target_power(200).await.unwrap();
        trainer.disconnect().await.unwrap();
        trainer.disconnect().await.unwrap();
        assert!(!trainer.is_connected().await);

        trainer.connect(&ConnectTarget::Auto).await.unwrap();
        trainer.set_target_power(200).await.unwrap();
        assert_eq!(transport.link.range_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_control_requires_connection() {
        let transport = Arc::new(MockTransport::new(MockLink::ftms()));
        let trainer = trainer_with(&transport);

        assert!(matches!(
            trainer.set_target_power(200).await,
            Err(VeloxError::NotConnected)
        ));
        assert!(matches!(
            trainer.subscribe_metrics().await,
            Err(VeloxError::NotConnected)
        ));
        assert!(!trainer.probe_erg_support().await);
    }

    #[tokio::test]
    async fn test_probe_erg_support() {
        let (transport, trainer) = connected(MockLink::ftms()).await;
        assert!(trainer.probe_erg_support().await);
        assert_eq!(transport.link.written(), vec![vec![0x00]]);

        let link = MockLink {
            rejected_opcodes: vec![0x00],
            ..MockLink::ftms()
        };
        let (_transport, trainer) = connected(link).await;
        assert!(!trainer.probe_erg_support().await);
    }

    #[tokio::test]
    async fn test_resistance_and_slope_are_unsupported() {
        let (_transport, trainer) = connected(MockLink::ftms()).await;
        assert!(matches!(
            trainer.set_target_resistance(10.0).await,
            Err(VeloxError::UnsupportedMode(TargetMode::Resistance))
        ));
        assert!(matches!(
            trainer.set_target_slope(2.0).await,
            Err(VeloxError::UnsupportedMode(TargetMode::Slope))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_merges_notifications() {
        let (transport, trainer) = connected(MockLink::ftms()).await;
        let mut metrics = trainer.subscribe_metrics().await.unwrap();

        // speed 36.00 km/h, cadence 90 rpm, power 200 W
        transport.link.notify(
            INDOOR_BIKE_DATA_UUID,
            &[0x44, 0x00, 0x10, 0x0E, 0xB4, 0x00, 0xC8, 0x00],
        );
        let sample = metrics.recv().await.unwrap();
        assert_eq!(sample.power_watts, Some(200));
        assert_eq!(sample.cadence_rpm, Some(90.0));
        assert_eq!(sample.speed_kmh, Some(36.0));

        transport
            .link
            .notify(CYCLING_POWER_MEASUREMENT_UUID, &[0x00, 0x00, 0xFA, 0x00]);
        let sample = metrics.recv().await.unwrap();
        assert_eq!(sample.power_watts, Some(200));
        assert_eq!(sample.cadence_rpm, Some(90.0));
    }

    #[tokio::test]
    async fn test_decode_error_does_not_end_subscription() {
        let (transport, trainer) = connected(MockLink::ftms()).await;
        let mut metrics = trainer.subscribe_metrics().await.unwrap();

        transport.link.notify(INDOOR_BIKE_DATA_UUID, &[0x44]);
        transport
            .link
            .notify(CYCLING_POWER_MEASUREMENT_UUID, &[0x00, 0x00, 0x2C, 0x01]);
        let sample = metrics.recv().await.unwrap();
        assert_eq!(sample.power_watts, Some(300));
    }

    #[tokio::test]
    async fn test_subscribe_requires_a_measurement_characteristic() {
        let link = MockLink {
            subscribable: vec![FTMS_CONTROL_POINT_UUID],
            ..MockLink::ftms()
        };
        let (_transport, trainer) = connected(link).await;
        assert!(matches!(
            trainer.subscribe_metrics().await,
            Err(VeloxError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_receiver() {
        let (transport, trainer) = connected(MockLink::ftms()).await;
        let mut first = trainer.subscribe_metrics().await.unwrap();
        let mut second = trainer.subscribe_metrics().await.unwrap();

        // each characteristic subscribed once per connection
        assert_eq!(transport.link.sinks.lock().unwrap().len(), 2);

        transport
            .link
            .notify(CYCLING_POWER_MEASUREMENT_UUID, &[0x00, 0x00, 0x64, 0x00]);
        assert_eq!(second.recv().await.unwrap().power_watts, Some(100));
        assert!(first.recv().await.is_none());
    }
}
