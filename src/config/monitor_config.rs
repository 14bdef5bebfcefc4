use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::bluetooth::DEFAULT_INACTIVE_AFTER_SECS;
use crate::utils::normalize_address;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Address of the heart-rate sensor to connect to, empty for none
    pub selected_device_mac: String,

    /// Connect to the first heart-rate sensor seen when no address is selected
    pub connect_without_target: bool,

    /// Devices silent for longer than this are listed as inactive
    pub inactive_after_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            selected_device_mac: String::new(),
            connect_without_target: false,
            inactive_after_secs: DEFAULT_INACTIVE_AFTER_SECS,
        }
    }
}

impl MonitorConfig {
    /// The selected address in canonical form, if one is set and valid
    pub fn target_address(&self) -> Option<String> {
        normalize_address(&self.selected_device_mac)
    }

    pub fn inactive_after(&self) -> Duration {
        Duration::from_secs(self.inactive_after_secs)
    }
}
