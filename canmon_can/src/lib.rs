//! CAN transport layer.
//!
//! Reliable, priority-aware frame I/O over a pluggable bus driver:
//!
//! - [`frame`] - Frame shape, 29-bit identifier codec, optional XOR checksum
//! - [`error`] - Error kinds surfaced at the transport boundary
//! - [`driver`] - The `CanDriver` trait and bus status types
//! - [`registry`] - Name-keyed driver factory registry
//! - [`sim`] - In-process simulation driver with failure injection
//! - [`metrics`] - Latency metrics, diagnostics record, counters
//! - [`queue`] - Bounded TX queue and drop-oldest RX buffer
//! - [`transport`] - `CanTransport`: workers, retry policy, self-test

pub mod driver;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod sim;
pub mod transport;

pub use driver::{BusState, CanBusConfig, CanDriver, DriverStatus};
pub use error::CanError;
pub use frame::{CanFrame, FrameFlags, decode_id, encode_id};
pub use metrics::{CanDiagnostics, LatencyMetrics, QueueStatus};
pub use transport::{CanTransport, RxObserver, TxObserver};
