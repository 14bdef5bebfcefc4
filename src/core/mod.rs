//! Core functionality for the heart-rate bridge
//! This module contains the Bluetooth connection logic for heart-rate sensors

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{BluestTransport, HeartrateMonitor};
