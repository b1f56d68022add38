use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{error::Result, types::ScannedDevice};

/// A value pushed by the peripheral on a subscribed characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Characteristic the value arrived on
    pub characteristic: Uuid,
    /// Raw characteristic value
    pub value: Vec<u8>,
}

/// Sink every subscribed characteristic forwards into, preserving arrival order
pub type NotificationSink = mpsc::UnboundedSender<Notification>;

/// Platform BLE stack: discovery and connection establishment
#[async_trait]
pub trait Transport: Send + Sync {
    /// Scan for advertising peripherals, strongest signal first
    async fn scan(&self, timeout: Duration) -> Result<Vec<ScannedDevice>>;

    /// Connect to the peripheral at `address`
    async fn connect(&self, address: &str, pair: bool, timeout: Duration)
        -> Result<Arc<dyn GattLink>>;
}

/// One established link to a GATT peripheral
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Read a characteristic value
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Write a characteristic value
    async fn write(&self, characteristic: Uuid, data: &[u8], with_response: bool) -> Result<()>;

    /// Enable notifications or indications and forward values into `sink`
    async fn subscribe(&self, characteristic: Uuid, sink: NotificationSink) -> Result<()>;

    /// Tear down the link
    async fn disconnect(&self) -> Result<()>;

    /// Whether the link is still up
    async fn is_connected(&self) -> bool;
}
