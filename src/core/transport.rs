//! Abstract GATT transport consumed by the bridge
//! The platform BLE stack lives behind these traits: the bridge issues
//! requests through [`GattTransport`] / [`GattConnection`] and receives the
//! asynchronous completions back through [`TransportEventSink`]. Adapters may
//! invoke the sink from any thread; its methods only enqueue work.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;
use uuid::Uuid;

/// A peripheral seen while scanning
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PeripheralInfo {
    /// The name of the peripheral, if advertised
    pub name: Option<String>,
    /// Platform-specific unique identifier for the peripheral
    pub id: String,
    /// Whether the peripheral is bonded with this host
    pub bonded: bool,
}

impl PeripheralInfo {
    /// Creates a new PeripheralInfo instance
    pub fn new(name: Option<String>, id: String, bonded: bool) -> Self {
        Self { name, id, bonded }
    }

    /// Human-readable handle: the advertised name, or the identifier when
    /// none was advertised
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

/// One event on the discovery scan stream
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A peripheral advertising the control service was seen
    Peripheral(PeripheralInfo),
    /// The platform could not start or continue the scan
    Failed { code: i32 },
}

/// Completion status reported by the platform for a transport operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Error(i32),
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattStatus::Success => write!(f, "status 0"),
            GattStatus::Error(code) => write!(f, "status {}", code),
        }
    }
}

/// Link state reported with a connection state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Connected => write!(f, "connected"),
            LinkState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Errors returned when a transport request cannot be issued
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no bluetooth adapter is available")]
    AdapterUnavailable,
    #[error("the platform bluetooth stack rejected the operation")]
    Rejected,
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("no peripheral known with ID: {0}")]
    UnknownPeripheral(String),
    #[error("code {0}")]
    ScanFailed(i32),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Stream of scan events; dropping it stops the platform scan
pub type ScanStream = BoxStream<'static, ScanEvent>;

/// Entry points into the platform BLE stack
#[async_trait]
pub trait GattTransport: Send + Sync {
    /// Starts a discovery scan for peripherals advertising the control service
    async fn scan(&self) -> Result<ScanStream, TransportError>;

    /// Opens a connection to a scanned peripheral. Completion and all later
    /// session events are delivered through `events`, never before this call
    /// returns the connection handle.
    async fn connect(
        &self,
        peripheral_id: &str,
        events: Arc<dyn TransportEventSink>,
    ) -> Result<Arc<dyn GattConnection>, TransportError>;

    /// The local adapter's name, streamed to the remote control for display
    fn local_name(&self) -> Option<String>;
}

/// An open transport session with one peripheral
///
/// Every method only *issues* a request: `Ok` means the platform accepted it,
/// and the outcome arrives later through the [`TransportEventSink`] given to
/// [`GattTransport::connect`]. At most one request is outstanding at a time.
#[async_trait]
pub trait GattConnection: Send + Sync {
    /// Requests service discovery on the connected peripheral
    async fn discover_services(&self) -> Result<(), TransportError>;

    /// Toggles local notification delivery for a characteristic
    async fn set_characteristic_notification(
        &self,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<(), TransportError>;

    /// Writes a descriptor of the given characteristic
    async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError>;

    /// Writes a characteristic value (with response)
    async fn write_characteristic(
        &self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError>;

    /// Re-establishes the link to the same peripheral after a drop
    async fn reconnect(&self) -> Result<(), TransportError>;

    /// Tears the session down; no events are delivered afterwards
    async fn close(&self);
}

/// Completion events flowing back from the platform BLE stack
///
/// Implemented by the core; adapters call these from their own callback
/// threads. Methods must not block.
pub trait TransportEventSink: Send + Sync {
    fn on_connection_state_change(&self, status: GattStatus, link: LinkState);
    fn on_mtu_changed(&self, mtu: usize, status: GattStatus);
    fn on_services_discovered(&self, status: GattStatus);
    fn on_characteristic_write(&self, characteristic: Uuid, status: GattStatus);
    fn on_descriptor_write(&self, characteristic: Uuid, status: GattStatus);
    fn on_characteristic_changed(&self, characteristic: Uuid, value: &[u8]);
}
