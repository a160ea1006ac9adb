//! Core functionality of the remote control bridge
//! This module contains the control channel: scanning, the subscription
//! session, notification decoding and the dispatch gate they all run on.

pub mod bridge;
pub mod chunk;
pub mod constants;
pub mod decoder;
pub mod dispatch;
pub mod scanner;
pub mod subscription;
pub mod transport;

// Re-export commonly used types
pub use bridge::{HostQuirks, PresentationSink, RemoteBridge};
pub use decoder::{LocalAction, LocalActionSink};
pub use subscription::{SubscriptionCallback, SubscriptionManager};
pub use transport::{GattConnection, GattTransport, TransportEventSink};
