//! Device identity model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::sanitize_token;
use crate::{Error, Result};

/// Sync role of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    /// Administrator device: merges inbox entries and publishes the master.
    Hub,
    /// Staff device: pushes inbox entries and pulls the master.
    #[default]
    Spoke,
}

impl DeviceRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hub => "hub",
            Self::Spoke => "spoke",
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hub" => Ok(Self::Hub),
            "spoke" => Ok(Self::Spoke),
            other => Err(Error::InvalidInput(format!(
                "Unknown device role '{other}'. Expected 'hub' or 'spoke'"
            ))),
        }
    }
}

/// Stable identity of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Lowercase token; also the submitter id in inbox entry paths
    pub device_id: String,
    pub role: DeviceRole,
}

impl DeviceIdentity {
    /// Create an identity from a user-supplied id.
    pub fn new(device_id: &str, role: DeviceRole) -> Result<Self> {
        let device_id = sanitize_token(device_id);
        if device_id.is_empty() {
            return Err(Error::InvalidInput(
                "Device id must contain at least one letter or digit".to_string(),
            ));
        }
        Ok(Self { device_id, role })
    }

    /// Create an identity with a fresh random id.
    pub fn generate(role: DeviceRole) -> Self {
        Self {
            device_id: Uuid::now_v7().simple().to_string(),
            role,
        }
    }

    pub fn is_hub(&self) -> bool {
        self.role == DeviceRole::Hub
    }
}
