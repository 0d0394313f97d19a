//! Sensor readout modes and port ranges.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sensor port number on a controller.
pub type Port = u8;

/// Highest valid analog port.
pub const MAX_ANALOG_PORT: Port = 5;

/// Highest valid digital port.
pub const MAX_DIGITAL_PORT: Port = 9;

/// Upper bound (inclusive) of an analog reading.
pub const ANALOG_MAX_VALUE: i32 = 4095;

/// Upper bound (inclusive) of a digital reading.
pub const DIGITAL_MAX_VALUE: i32 = 1;

/// Readout mode of a sensor port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorMode {
    Analog,
    Digital,
}

impl SensorMode {
    /// Both modes, in wire order.
    pub const ALL: [SensorMode; 2] = [SensorMode::Analog, SensorMode::Digital];

    /// Returns the key used for this mode in `sensor` payloads.
    pub fn key(self) -> &'static str {
        match self {
            Self::Analog => "analog",
            Self::Digital => "digital",
        }
    }

    /// Parses a payload key.
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "analog" => Some(Self::Analog),
            "digital" => Some(Self::Digital),
            _ => None,
        }
    }

    /// Highest valid port for this mode.
    pub fn max_port(self) -> Port {
        match self {
            Self::Analog => MAX_ANALOG_PORT,
            Self::Digital => MAX_DIGITAL_PORT,
        }
    }

    /// Validates a raw port number, returning it narrowed if in range.
    pub fn validate_port(self, port: i64) -> Option<Port> {
        if port < 0 || port > i64::from(self.max_port()) {
            return None;
        }
        Port::try_from(port).ok()
    }
}

impl fmt::Display for SensorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}
