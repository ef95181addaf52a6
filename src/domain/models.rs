//! Core data model shared across the gateway.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A normalized 6-byte BLE hardware address.
///
/// Canonical form is `XX:XX:XX:XX:XX:XX` (uppercase hex, colon-separated).
/// Parsing is case-insensitive; the sole key type for the device registry
/// and scan reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress([u8; 6]);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is not a valid MAC address")]
pub struct AddressParseError(pub String);

impl DeviceAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(AddressParseError(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(AddressParseError(s.to_string()));
            }
            octets[i] =
                u8::from_str_radix(part, 16).map_err(|_| AddressParseError(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// BLE address type, set on successful connect or observed during a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Public,
    Random,
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Random => write!(f, "random"),
        }
    }
}

/// Connection state of a registered device.
///
/// `disconnected` is the terminal state and has no variant: a disconnected
/// device simply has no record in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Retrying,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Retrying => write!(f, "retrying"),
            Self::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// List-operation entry for one registered device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    #[serde(rename = "connection-state")]
    pub connection_state: ConnectionState,
    #[serde(rename = "addr-type")]
    pub addr_type: Option<AddressType>,
}

/// One decoded advertisement data field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdTypeField {
    #[serde(rename = "adtype-value")]
    pub value: String,
    pub description: String,
}

/// Everything observed for one address during a single scan pass.
///
/// Built fresh each pass, never merged with a previous pass.
#[derive(Debug, Clone, Serialize)]
pub struct AdvertisementReport {
    #[serde(skip)]
    pub address: DeviceAddress,
    #[serde(rename = "address-type")]
    pub address_type: AddressType,
    #[serde(rename = "rssi-db")]
    pub signal_strength: i16,
    #[serde(rename = "ad-data-types")]
    pub data_types: BTreeMap<String, AdTypeField>,
}

/// Aggregated result of one scan pass.
pub type ScanReport = BTreeMap<DeviceAddress, AdvertisementReport>;

/// Asynchronous events emitted by the engine toward the message router.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A payload arrived from a connected peripheral.
    DeviceData {
        address: DeviceAddress,
        payload: Vec<u8>,
    },
    /// A device's connection state changed. `None` means absent
    /// (no record / disconnected).
    StateChanged {
        address: DeviceAddress,
        previous: Option<ConnectionState>,
        current: Option<ConnectionState>,
    },
    /// A condition outside any single request's scope, reported on the
    /// error topic.
    Fault { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_canonicalizes_mac() {
        let addr: DeviceAddress = "3c:61:05:12:ee:0a".parse().unwrap();
        assert_eq!(addr.to_string(), "3C:61:05:12:EE:0A");
    }

    #[test]
    fn mac_equality_is_case_insensitive() {
        let lower: DeviceAddress = "ac:67:b2:3c:92:06".parse().unwrap();
        let upper: DeviceAddress = "AC:67:B2:3C:92:06".parse().unwrap();
        assert_eq!(lower, upper);
    }

    #[test]
    fn rejects_malformed_macs() {
        assert!("".parse::<DeviceAddress>().is_err());
        assert!("3C:61:05:12:EE".parse::<DeviceAddress>().is_err());
        assert!("3C:61:05:12:EE:0A:FF".parse::<DeviceAddress>().is_err());
        assert!("3C-61-05-12-EE-0A".parse::<DeviceAddress>().is_err());
        assert!("zz:61:05:12:ee:0a".parse::<DeviceAddress>().is_err());
        assert!("3c6:1:05:12:ee:0a".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn address_serializes_as_canonical_string() {
        let addr: DeviceAddress = "ac:67:b2:3c:92:06".parse().unwrap();
        assert_eq!(
            serde_json::to_string(&addr).unwrap(),
            "\"AC:67:B2:3C:92:06\""
        );
        let back: DeviceAddress = serde_json::from_str("\"ac:67:b2:3c:92:06\"").unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn device_status_wire_shape() {
        let status = DeviceStatus {
            connection_state: ConnectionState::Connected,
            addr_type: Some(AddressType::Public),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["connection-state"], "connected");
        assert_eq!(json["addr-type"], "public");
    }
}
