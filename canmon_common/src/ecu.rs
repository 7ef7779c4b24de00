//! ECU identities on the vehicle network.
//!
//! Every node on the CAN bus is one of five ECUs. The identity drives the
//! firmware file naming scheme, the per-ECU MQTT topics and the indices
//! into the per-ECU columns of [`crate::config::MonitorConfig`].

use serde::{Deserialize, Serialize};

/// Number of ECUs in the vehicle network.
pub const ECU_COUNT: usize = 5;

/// An ECU on the vehicle network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EcuId {
    /// Monitor node — mesh root and gateway.
    Monitor = 0,
    /// Acceleration control ECU.
    Acceleration = 1,
    /// Steering control ECU.
    Steering = 2,
    /// Motor control ECU.
    Motor = 3,
    /// Brake control ECU.
    Brake = 4,
}

impl EcuId {
    /// All ECUs, in column order.
    pub const ALL: [EcuId; ECU_COUNT] = [
        EcuId::Monitor,
        EcuId::Acceleration,
        EcuId::Steering,
        EcuId::Motor,
        EcuId::Brake,
    ];

    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Monitor),
            1 => Some(Self::Acceleration),
            2 => Some(Self::Steering),
            3 => Some(Self::Motor),
            4 => Some(Self::Brake),
            _ => None,
        }
    }

    /// Column index into per-ECU configuration arrays.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Canonical node name, as used on the mesh and in firmware file names.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Monitor => "monitor_ecu",
            Self::Acceleration => "acceleration_control_ecu",
            Self::Steering => "steering_control_ecu",
            Self::Motor => "motor_control_ecu",
            Self::Brake => "brake_control_ecu",
        }
    }

    /// Configuration key suffix (`OTA_FIRMWARE_VERSION_<suffix>` etc.).
    pub const fn key_suffix(self) -> &'static str {
        match self {
            Self::Monitor => "MONITOR",
            Self::Acceleration => "ACCELERATION",
            Self::Steering => "STEERING",
            Self::Motor => "MOTOR",
            Self::Brake => "BRAKE",
        }
    }

    /// Default MQTT topic for this ECU's update channel.
    pub fn default_topic(self) -> String {
        format!("canmon/ota/{}", self.name())
    }

    /// Canonical firmware file name for a given version.
    pub fn firmware_file_name(self, version: u32) -> String {
        format!("firmware_{}_v{}.bin", self.name(), version)
    }

    /// Parse a canonical node name back into an identity.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecu_id_roundtrip() {
        for v in 0..=4u8 {
            let ecu = EcuId::from_u8(v).unwrap();
            assert_eq!(ecu as u8, v);
        }
        assert!(EcuId::from_u8(5).is_none());
        assert!(EcuId::from_u8(255).is_none());
    }

    #[test]
    fn name_roundtrip() {
        for ecu in EcuId::ALL {
            assert_eq!(EcuId::from_name(ecu.name()), Some(ecu));
        }
        assert!(EcuId::from_name("gearbox_ecu").is_none());
    }

    #[test]
    fn firmware_file_naming() {
        assert_eq!(
            EcuId::Monitor.firmware_file_name(2),
            "firmware_monitor_ecu_v2.bin"
        );
        assert_eq!(
            EcuId::Brake.firmware_file_name(17),
            "firmware_brake_control_ecu_v17.bin"
        );
    }

    #[test]
    fn indices_are_dense() {
        for (i, ecu) in EcuId::ALL.iter().enumerate() {
            assert_eq!(ecu.index(), i);
        }
    }
}
