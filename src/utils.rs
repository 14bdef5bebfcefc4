use std::sync::OnceLock;

use regex::Regex;

fn mac_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"([0-9A-Fa-f]{2}[:\-_]){5}([0-9A-Fa-f]{2})").ok())
        .as_ref()
}

/// Canonical form of a radio address: upper-case hex octets joined by colons
pub fn normalize_address(address: &str) -> Option<String> {
    let trimmed = address.trim();
    let found = mac_pattern()?.find(trimmed)?;
    if found.start() != 0 || found.end() != trimmed.len() {
        return None;
    }
    Some(canonical(found.as_str()))
}

/// Pulls the last MAC address out of a platform device identifier,
/// e.g. `/org/bluez/hci0/dev_A0_9E_1A_12_34_56` or
/// `BluetoothLE#BluetoothLE00:1a:7d:da:71:13-a0:9e:1a:12:34:56`.
pub fn extract_mac_address(device_id: &str) -> Option<String> {
    mac_pattern()?
        .find_iter(device_id)
        .last()
        .map(|m| canonical(m.as_str()))
}

fn canonical(raw: &str) -> String {
    raw.replace(['-', '_'], ":").to_uppercase()
}
