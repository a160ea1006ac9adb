//! Remote control bridge library
//! Control-channel core of a BLE remote-control bridge: scans for the remote,
//! subscribes to its button notifications and turns them into local media and
//! volume actions. The platform's GATT stack plugs in through
//! [`GattTransport`]; the embedding layer receives status updates through
//! [`PresentationSink`] and applies decoded actions via [`LocalActionSink`].

// Module declarations
pub mod config;
pub mod core;
pub mod error;

// Re-export the embedder-facing surface
pub use crate::config::{Preferences, SharedPreferences};
pub use crate::core::bridge::{
    HostQuirks, PresentationSink, RemoteBridge, STATUS_IMPORTANT, STATUS_NOISE, STATUS_RETRY,
};
pub use crate::core::decoder::{Decoded, KeyPhase, LocalAction, LocalActionSink, MediaKey};
pub use crate::core::transport::{
    GattConnection, GattStatus, GattTransport, LinkState, PeripheralInfo, ScanEvent, ScanStream,
    TransportError, TransportEventSink,
};
pub use crate::error::{ConnectionError, SubscriptionError};
