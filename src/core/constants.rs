//! Constants used throughout the crate
//! This module contains the protocol identifiers and wire-level values of the
//! remote control's GATT profile: UUIDs, descriptor payloads and the bit
//! layout of the single-byte button notifications.

use uuid::Uuid;

/// The UUID of the remote control service
pub const UUID_CONTROL_SERVICE: Uuid = Uuid::from_u128(0xacb76f70_2b52_4234_afb4_a8e9ceb925a4);

/// The UUID of the button notification characteristic
pub const UUID_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x70bc9d28_ebec_4ec6_9b27_6b79a718d34c);

/// The UUID of the characteristic receiving the chunked host name
pub const UUID_NAME_CHAR: Uuid = Uuid::from_u128(0x7f2d6df8_1610_4729_9038_a49163702ee2);

/// Standard Bluetooth UUID of the client characteristic configuration descriptor
pub const UUID_CLIENT_CHARACTERISTIC_CONFIG: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Characteristics whose notifications the bridge subscribes to
pub const SUBSCRIPTION_UUIDS: [Uuid; 1] = [UUID_NOTIFY_CHAR];

/// Client characteristic configuration payload enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Client characteristic configuration payload disabling notifications
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Notification bit: press and release arrive as two distinct values
pub const TWO_STEP: u8 = 0x80;

/// Notification bit: press (set) vs. release (clear), meaningful with [`TWO_STEP`]
pub const ACTION_DOWN: u8 = 0x40;

/// Notification bit: toggle mute (or flip the ringer mode when configured)
pub const MUTE: u8 = 0x20;

/// Notification bit: volume down
pub const VOLUME_DOWN: u8 = 0x10;

/// Notification bit: volume up
pub const VOLUME_UP: u8 = 0x08;

/// Notification bit: next track
pub const FORWARD: u8 = 0x04;

/// Notification bit: previous track
pub const BACK: u8 = 0x02;

/// Notification bit: play/pause
pub const PLAY_PAUSE: u8 = 0x01;

/// Reserved all-ones notification value requesting bridge shutdown
pub const STOP: u8 = 0xff;

/// Name-chunk header bit, set while more payload follows the current frame
pub const CHUNK_CONTINUATION: u8 = 0x80;

/// Link MTU assumed until the transport reports otherwise
pub const DEFAULT_MTU: usize = 20;
