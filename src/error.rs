//! Error reasons surfaced through the bridge callback interface
//! Connection-phase failures and subscription-phase failures are reported
//! through different callback methods, so they live in separate enums. The
//! `Display` text is what ends up in the user-facing status line.

use thiserror::Error;
use uuid::Uuid;

use crate::core::transport::{GattStatus, LinkState};

/// Failures establishing or keeping the link to the remote control
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The platform refused to open a connection to the scanned peripheral
    #[error("could not connect to the remote control")]
    ConnectRejected,

    /// Link establishment completed with a failure status
    #[error("could not connect to the remote control ({status})")]
    ConnectFailed { status: GattStatus },

    /// The connected peripheral did not accept a service discovery request
    #[error("the remote control did not accept service discovery")]
    DiscoveryRejected,

    /// The link dropped or errored while a session was active
    #[error("lost the remote control ({status}, link {link})")]
    LinkLost { status: GattStatus, link: LinkState },
}

/// Failures while subscribing, unsubscribing or streaming the host name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// Service discovery completed with a failure status
    #[error("service discovery failed ({status})")]
    DiscoveryFailed { status: GattStatus },

    /// The remote control service is absent from the discovered services
    #[error("the remote control service was not found")]
    ServiceNotFound,

    /// A characteristic from the subscription set is absent
    #[error("characteristic {uuid} was not found")]
    CharacteristicNotFound { uuid: Uuid },

    /// The platform rejected enabling notifications for a characteristic
    #[error("could not enable notifications for {uuid}")]
    NotificationToggleRejected { uuid: Uuid },

    /// The platform rejected the configuration descriptor write
    #[error("could not write the notification descriptor for {uuid}")]
    DescriptorWriteRejected { uuid: Uuid },

    /// A chunk of the host name could not be handed to the transport
    #[error("could not send the host name to the remote control")]
    NameTransferFailed,
}
