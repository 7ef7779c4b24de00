//! Monitor node supervisor library.
//!
//! The supervisor brings up the CAN transport, diagnosis engine, alert
//! sink, persistent logger, routing layer and OTA orchestrator, owns the
//! shared configuration, and hosts the periodic task set.

pub mod connectivity;
pub mod supervisor;

pub use connectivity::{Connectivity, SimConnectivity};
pub use supervisor::{MonitorSupervisor, Subsystems, SupervisorError, SupervisorStats, run_ota_cycle};
