//! Persistent logger.
//!
//! Level-filtered ring of log entries with three background workers: a
//! 60-second flush of warning/critical entries to non-volatile storage,
//! an asynchronous SD writer draining an in-process queue, and a
//! 30-second free-space monitor.

pub mod entry;
pub mod logger;
pub mod storage;

pub use entry::LogEntry;
pub use logger::{LogAlertObserver, PersistentLogger};
pub use storage::{ClockRtc, DirStorage, MemNvs, NvsStore, Rtc, SdStorage, StorageError};
