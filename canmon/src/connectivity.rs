//! Wireless connectivity bring-up seam.
//!
//! Wi-Fi station setup, the MQTT session and the mesh radio are opaque
//! collaborators; the supervisor only needs them up before routing and
//! OTA start, and down at teardown.

use crate::supervisor::SupervisorError;
use tracing::info;

/// Opaque Wi-Fi / MQTT / mesh bring-up contract.
pub trait Connectivity: Send + Sync {
    /// Bring the wireless stack up. Called once during supervisor init.
    fn bring_up(&self) -> Result<(), SupervisorError>;

    /// Tear the wireless stack down.
    fn shut_down(&self);
}

/// Connectivity double for simulation runs and tests.
#[derive(Debug, Default)]
pub struct SimConnectivity;

impl Connectivity for SimConnectivity {
    fn bring_up(&self) -> Result<(), SupervisorError> {
        info!("sim connectivity up (wifi/mqtt/mesh)");
        Ok(())
    }

    fn shut_down(&self) {
        info!("sim connectivity down");
    }
}
