use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::control_interface::command::Method;

/// Default TCP port of the bulb's command interface.
pub const DEFAULT_COMMAND_PORT: u16 = 55443;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerStatus {
    On,
    Off,
    #[default]
    Unknown,
}

impl PowerStatus {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "on" => PowerStatus::On,
            "off" => PowerStatus::Off,
            _ => PowerStatus::Unknown,
        }
    }
}

impl Display for PowerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let power = match self {
            PowerStatus::On => "on",
            PowerStatus::Off => "off",
            PowerStatus::Unknown => "?",
        };
        write!(f, "{}", power)
    }
}

/// Key used to deduplicate devices.
///
/// Devices found by the IP scan carry no vendor id, so they fall back to
/// their endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceKey {
    Id(String),
    Endpoint(String, u16),
}

/// A bulb as reported by its discovery advertisement.
///
/// A device found by the IP scan only has `host` and `port` set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub location: String,
    pub host: String,
    pub port: u16,
    pub model: String,
    pub fw_version: String,
    pub capabilities: Vec<String>,
    pub power: PowerStatus,
    /// Brightness percentage, 0 to 100.
    pub bright: u8,
    pub color_mode: u8,
    pub ct: u32,
    pub rgb: u32,
    pub hue: u16,
    pub sat: u8,
}

impl Device {
    pub fn from_endpoint(host: impl Into<String>, port: u16) -> Self {
        Device {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn key(&self) -> DeviceKey {
        if self.id.is_empty() {
            DeviceKey::Endpoint(self.host.clone(), self.port)
        } else {
            DeviceKey::Id(self.id.clone())
        }
    }

    /// Whether the advertisement listed `method` as supported.
    ///
    /// Devices without capability information (IP scan results) report false.
    pub fn supports(&self, method: Method) -> bool {
        self.capabilities.iter().any(|c| c == method.as_str())
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.id.is_empty() {
            write!(f, "{}:{}", self.host, self.port)
        } else {
            write!(f, "{} ({}) at {}:{}", self.id, self.model, self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_prefers_id() {
        let mut device = Device::from_endpoint("192.168.1.20", DEFAULT_COMMAND_PORT);
        assert_eq!(
            device.key(),
            DeviceKey::Endpoint("192.168.1.20".to_string(), 55443)
        );
        device.id = "0x000000000af2608f".to_string();
        assert_eq!(device.key(), DeviceKey::Id("0x000000000af2608f".to_string()));
    }

    #[test]
    fn test_supports() {
        let device = Device {
            capabilities: vec!["get_prop".to_string(), "set_rgb".to_string()],
            ..Default::default()
        };
        assert!(device.supports(Method::SetRgb));
        assert!(!device.supports(Method::SetMusic));
    }
}
