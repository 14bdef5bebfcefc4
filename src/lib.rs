//! Bluetooth heart-rate bridge library
//! Finds a BLE heart-rate sensor, keeps its measurement subscription alive
//! across drop-outs and reports samples to a host.

pub mod config;
pub mod core;
pub mod logging;
pub mod utils;
