//! Constants used throughout the application
//! This module contains all the constant values used by the heart-rate
//! connection logic, such as UUIDs, timeouts and backoff settings.

use uuid::Uuid;

/// Standard Bluetooth Service UUIDs
pub const UUID_GENERIC_ACCESS_SERVICE: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);
pub const UUID_HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_DEVICE_NAME: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);
pub const UUID_HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration descriptor
pub const UUID_CLIENT_CHARACTERISTIC_CONFIG: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Value written to the configuration descriptor to enable notifications
pub const CCCD_NOTIFY_VALUE: [u8; 2] = [0x01, 0x00];

/// Timeout for descriptor writes and value reads in seconds
pub const SHORT_OPERATION_TIMEOUT_SECS: u64 = 1;

/// Timeout for every other Bluetooth operation in seconds
pub const BLUETOOTH_OPERATION_TIMEOUT_SECS: u64 = 5;

/// Base unit of the reconnect backoff in milliseconds
pub const RECONNECT_BASE_DELAY_MS: u64 = 100;

/// Highest value the reconnect attempt counter reaches
pub const MAX_RECONNECT_ATTEMPT: u32 = 7;

/// Attempt index at which the backoff delay stops growing (12.8s)
pub const MAX_BACKOFF_ATTEMPT: u32 = 6;

/// A device that has not advertised for this long is considered inactive
pub const DEFAULT_INACTIVE_AFTER_SECS: u64 = 60 * 5;
