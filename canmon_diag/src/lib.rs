//! Diagnosis engine and alert sink.
//!
//! The engine periodically fuses CAN transport counters into samples,
//! evaluates configurable thresholds and retains a fixed-size history.
//! The alert sink turns abnormal samples into ring-buffered alerts and
//! forwards them to the logger and a registered subscriber.

pub mod alert;
pub mod engine;
pub mod sample;

pub use alert::{AlertEntry, AlertObserver, AlertSink, AlertThresholds};
pub use engine::{DiagError, DiagnosisEngine, DiagnosisObserver};
pub use sample::{BreachFlags, DiagnosisSample, DiagnosisThresholds};
