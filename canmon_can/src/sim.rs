//! In-process simulation driver.
//!
//! Stands in for the platform CAN controller during development and in the
//! test suites. Transmitted frames are captured for inspection; scripted
//! failures exercise the transport's retry path; frames can be injected
//! into the receive side from tests or from a paired node.

use crate::driver::{BusState, CanBusConfig, CanDriver, DriverStatus};
use crate::error::CanError;
use crate::frame::{CanFrame, FrameFlags};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct SimState {
    installed: bool,
    started: bool,
    self_reception: bool,
    status: DriverStatus,
    fail_plan: VecDeque<CanError>,
    wire: Vec<CanFrame>,
}

/// Simulated CAN bus controller.
pub struct SimCanDriver {
    state: Mutex<SimState>,
    rx: Mutex<VecDeque<CanFrame>>,
    rx_ready: Condvar,
}

impl SimCanDriver {
    /// Create an uninstalled simulated controller.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                installed: false,
                started: false,
                self_reception: false,
                status: DriverStatus::default(),
                fail_plan: VecDeque::new(),
                wire: Vec::new(),
            }),
            rx: Mutex::new(VecDeque::new()),
            rx_ready: Condvar::new(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue transmit errors to be returned, in order, by upcoming
    /// `transmit` calls.
    pub fn script_transmit_failures(&self, errors: impl IntoIterator<Item = CanError>) {
        self.state().fail_plan.extend(errors);
    }

    /// Deliver a frame to the receive side, as if it arrived from the bus.
    pub fn inject_rx(&self, frame: CanFrame) {
        let mut rx = match self.rx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rx.push_back(frame);
        self.rx_ready.notify_one();
    }

    /// Frames successfully transmitted so far, in order.
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.state().wire.clone()
    }

    /// Force the reported error counters and bus state (test hook).
    pub fn set_status(&self, tx_error_counter: u32, rx_error_counter: u32, bus_off: bool) {
        let mut state = self.state();
        state.status.tx_error_counter = tx_error_counter;
        state.status.rx_error_counter = rx_error_counter;
        state.status.state = if bus_off {
            BusState::BusOff
        } else if state.started {
            BusState::Running
        } else {
            BusState::Stopped
        };
    }
}

impl Default for SimCanDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CanDriver for SimCanDriver {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn install(&self, config: &CanBusConfig) -> Result<(), CanError> {
        let mut state = self.state();
        if state.installed {
            return Err(CanError::DriverInstall("already installed".to_string()));
        }
        state.installed = true;
        state.self_reception = config.self_reception;
        state.status.state = BusState::Stopped;
        Ok(())
    }

    fn start(&self) -> Result<(), CanError> {
        let mut state = self.state();
        if !state.installed {
            return Err(CanError::DriverStart("not installed".to_string()));
        }
        state.started = true;
        if state.status.state == BusState::Stopped {
            state.status.state = BusState::Running;
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), CanError> {
        let mut state = self.state();
        if !state.installed {
            return Err(CanError::DriverStop("not installed".to_string()));
        }
        state.started = false;
        state.status.state = BusState::Stopped;
        Ok(())
    }

    fn uninstall(&self) -> Result<(), CanError> {
        let mut state = self.state();
        if state.started {
            return Err(CanError::DriverUninstall("still started".to_string()));
        }
        state.installed = false;
        Ok(())
    }

    fn transmit(&self, frame: &CanFrame, _timeout: Duration) -> Result<(), CanError> {
        let loop_back = {
            let mut state = self.state();
            if !state.started {
                return Err(CanError::Transmit("driver not started".to_string()));
            }
            if let Some(err) = state.fail_plan.pop_front() {
                state.status.tx_error_counter += 1;
                return Err(err);
            }
            state.wire.push(*frame);
            state.self_reception || frame.flags.contains(FrameFlags::SELF_RX)
        };
        if loop_back {
            self.inject_rx(*frame);
        }
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<CanFrame, CanError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut rx = match self.rx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if let Some(frame) = rx.pop_front() {
                return Ok(frame);
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(CanError::Timeout(timeout.as_millis() as u64));
            }
            let (guard, _timeout_result) = match self.rx_ready.wait_timeout(rx, remaining) {
                Ok(pair) => pair,
                Err(poisoned) => poisoned.into_inner(),
            };
            rx = guard;
        }
    }

    fn status_info(&self) -> Result<DriverStatus, CanError> {
        let state = self.state();
        if !state.installed {
            return Err(CanError::Unknown("driver not installed".to_string()));
        }
        Ok(state.status)
    }

    fn set_self_reception(&self, enabled: bool) -> Result<(), CanError> {
        self.state().self_reception = enabled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started_driver() -> SimCanDriver {
        let driver = SimCanDriver::new();
        driver.install(&CanBusConfig::default()).unwrap();
        driver.start().unwrap();
        driver
    }

    #[test]
    fn lifecycle_order_is_enforced() {
        let driver = SimCanDriver::new();
        assert!(matches!(driver.start(), Err(CanError::DriverStart(_))));
        driver.install(&CanBusConfig::default()).unwrap();
        driver.start().unwrap();
        assert!(matches!(driver.uninstall(), Err(CanError::DriverUninstall(_))));
        driver.stop().unwrap();
        driver.uninstall().unwrap();
    }

    #[test]
    fn transmit_requires_started() {
        let driver = SimCanDriver::new();
        driver.install(&CanBusConfig::default()).unwrap();
        let frame = CanFrame::new(0x100, &[1]).unwrap();
        assert!(matches!(
            driver.transmit(&frame, Duration::from_millis(10)),
            Err(CanError::Transmit(_))
        ));
    }

    #[test]
    fn scripted_failures_are_consumed_in_order() {
        let driver = started_driver();
        driver.script_transmit_failures([CanError::Transmit("bus busy".to_string())]);

        let frame = CanFrame::new(0x100, &[1]).unwrap();
        assert!(driver.transmit(&frame, Duration::from_millis(10)).is_err());
        assert!(driver.transmit(&frame, Duration::from_millis(10)).is_ok());
        assert_eq!(driver.status_info().unwrap().tx_error_counter, 1);
        assert_eq!(driver.sent_frames().len(), 1);
    }

    #[test]
    fn self_reception_loops_frames_back() {
        let driver = started_driver();
        driver.set_self_reception(true).unwrap();

        let frame = CanFrame::new(0x42, &[9, 9]).unwrap();
        driver.transmit(&frame, Duration::from_millis(10)).unwrap();
        let echoed = driver.receive(Duration::from_millis(10)).unwrap();
        assert_eq!(echoed.id, 0x42);
        assert_eq!(echoed.payload(), &[9, 9]);
    }

    #[test]
    fn receive_times_out_when_idle() {
        let driver = started_driver();
        assert!(matches!(
            driver.receive(Duration::from_millis(5)),
            Err(CanError::Timeout(_))
        ));
    }
}
