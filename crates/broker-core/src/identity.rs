//! Resource and device identities
//!
//! A resource is addressed by the device hosting it, its URI on that device
//! and the connectivity used to reach the device. Resources that share a
//! device id and connectivity share one [`DeviceIdentity`] and therefore one
//! presence subscription.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport/profile used to reach a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    /// IPv4/IPv6 over UDP
    #[default]
    Ip,
    /// IPv4/IPv6 over TCP
    Tcp,
    /// Bluetooth Low Energy GATT
    GattBtle,
    /// Bluetooth classic RFCOMM
    RfcommBtedr,
    /// Near-field communication
    Nfc,
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Connectivity::Ip => "ip",
            Connectivity::Tcp => "tcp",
            Connectivity::GattBtle => "gatt_btle",
            Connectivity::RfcommBtedr => "rfcomm_btedr",
            Connectivity::Nfc => "nfc",
        };
        f.write_str(name)
    }
}

/// Identity of one monitorable resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    /// Id of the hosting device
    pub device_id: String,
    /// Resource URI on the device (e.g. "/a/light")
    pub uri: String,
    /// How the device is reached
    #[serde(default)]
    pub connectivity: Connectivity,
}

impl ResourceIdentity {
    /// Create a new resource identity
    pub fn new(
        device_id: impl Into<String>,
        uri: impl Into<String>,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            uri: uri.into(),
            connectivity,
        }
    }

    /// Identity of the device hosting this resource
    pub fn device(&self) -> DeviceIdentity {
        DeviceIdentity {
            device_id: self.device_id.clone(),
            connectivity: self.connectivity,
        }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} ({})", self.device_id, self.uri, self.connectivity)
    }
}

/// Identity of a device, grouping the resources it hosts
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    #[serde(default)]
    pub connectivity: Connectivity,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<String>, connectivity: Connectivity) -> Self {
        Self {
            device_id: device_id.into(),
            connectivity,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.device_id, self.connectivity)
    }
}
