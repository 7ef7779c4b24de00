//! The `CanDriver` trait and bus status types.
//!
//! The transport manages the physical controller through this trait,
//! enabling pluggable backends (platform controller, simulation).
//!
//! # Lifecycle
//!
//! 1. `install()` - configure the controller, called once per configuration
//! 2. `start()` - join the bus
//! 3. `transmit()` / `receive()` - frame I/O with bounded timeouts
//! 4. `stop()` / `uninstall()` - leave the bus and release the controller
//!
//! Implementations must be safe to call from the TX and RX workers
//! concurrently; all methods take `&self`.

use crate::error::CanError;
use crate::frame::CanFrame;
use std::time::Duration;

/// Bus controller state as reported by `status_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Controller installed but not started.
    Stopped,
    /// On the bus, transmitting and receiving.
    Running,
    /// Silent after excessive transmit errors.
    BusOff,
    /// Re-joining the bus after bus-off.
    Recovering,
}

/// Error-counter snapshot from the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverStatus {
    /// Transmit error counter.
    pub tx_error_counter: u32,
    /// Receive error counter.
    pub rx_error_counter: u32,
    /// Controller state.
    pub state: BusState,
}

impl Default for DriverStatus {
    fn default() -> Self {
        Self {
            tx_error_counter: 0,
            rx_error_counter: 0,
            state: BusState::Stopped,
        }
    }
}

/// Bus configuration handed to `install` and kept by the transport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanBusConfig {
    /// Nominal bitrate [bit/s].
    pub bitrate: u32,
    /// Acceptance filter identifier.
    pub acceptance_id: u32,
    /// Acceptance filter mask; zero accepts everything.
    pub acceptance_mask: u32,
    /// Driver-level transmit timeout [ms].
    pub tx_timeout_ms: u64,
    /// Driver-level receive timeout used by the RX worker [ms].
    pub rx_timeout_ms: u64,
    /// Append/verify the XOR payload checksum.
    pub checksum_enabled: bool,
    /// Loop transmitted frames back to this node.
    pub self_reception: bool,
}

impl Default for CanBusConfig {
    fn default() -> Self {
        Self {
            bitrate: 500_000,
            acceptance_id: 0,
            acceptance_mask: 0,
            tx_timeout_ms: 100,
            rx_timeout_ms: 10,
            checksum_enabled: false,
            self_reception: false,
        }
    }
}

/// Interface to a CAN bus controller.
pub trait CanDriver: Send + Sync {
    /// The driver's unique identifier (e.g. "sim").
    fn name(&self) -> &'static str;

    /// Configure the controller. Must be called before `start`.
    ///
    /// # Errors
    ///
    /// `CanError::DriverInstall` — non-recoverable at the transport layer.
    fn install(&self, config: &CanBusConfig) -> Result<(), CanError>;

    /// Join the bus.
    fn start(&self) -> Result<(), CanError>;

    /// Leave the bus. Frame I/O fails until the next `start`.
    fn stop(&self) -> Result<(), CanError>;

    /// Release the controller. `install` is required before further use.
    fn uninstall(&self) -> Result<(), CanError>;

    /// Transmit one frame, waiting at most `timeout` for bus access.
    fn transmit(&self, frame: &CanFrame, timeout: Duration) -> Result<(), CanError>;

    /// Receive one frame, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// `CanError::Timeout` when no frame arrives in time — non-fatal.
    fn receive(&self, timeout: Duration) -> Result<CanFrame, CanError>;

    /// Error counters and controller state.
    fn status_info(&self) -> Result<DriverStatus, CanError>;

    /// Toggle self-reception at runtime (used by the loopback self-test).
    ///
    /// Default implementation accepts silently, for controllers where
    /// self-reception is fixed per frame.
    fn set_self_reception(&self, _enabled: bool) -> Result<(), CanError> {
        Ok(())
    }
}

/// Factory function type for creating driver instances.
pub type DriverFactory = fn() -> std::sync::Arc<dyn CanDriver>;
