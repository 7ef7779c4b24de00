//! The persistent logger.
//!
//! A 100-entry ring under one mutex, gated by a minimum severity before
//! timestamping. Warning and critical entries additionally fire the alert
//! callback. Three workers run once started: the NVS flush (60 s), the
//! asynchronous SD writer (draining an in-process queue) and the
//! free-space monitor (30 s).

use crate::entry::LogEntry;
use crate::storage::{NvsStore, Rtc, SdStorage, StorageError};
use canmon_common::consts::{
    LOG_FLUSH_INTERVAL_S, LOG_MONITOR_INTERVAL_S, LOG_RING_LEN, SD_FAILURE_RESET_LIMIT,
    SD_LOCAL_RETRIES,
};
use canmon_common::level::Severity;
use canmon_common::text::bounded_string;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const NVS_NAMESPACE: &str = "canmon";
const NVS_CRITICAL_KEY: &str = "critical_log";

/// Observer of warning/critical log entries.
pub trait LogAlertObserver: Send + Sync {
    /// Called for every recorded entry at warning severity or above.
    fn on_log_alert(&self, entry: &LogEntry);
}

struct Ring {
    entries: [LogEntry; LOG_RING_LEN],
    next: usize,
    total: u64,
}

struct LoggerState {
    ring: Ring,
    min_severity: Severity,
    sd_dir: String,
    max_file_size: u64,
    consecutive_sd_failures: u32,
}

/// Level-filtered log ring with SD/NVS persistence workers.
pub struct PersistentLogger {
    state: Mutex<LoggerState>,
    storage: Arc<dyn SdStorage>,
    nvs: Arc<dyn NvsStore>,
    rtc: Arc<dyn Rtc>,
    alert_cb: Mutex<Option<Arc<dyn LogAlertObserver>>>,
    async_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    free_space_threshold: AtomicU64,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Sleep in small slices so a stopping logger joins promptly.
fn interruptible_sleep(running: &AtomicBool, duration: Duration) {
    let slice = Duration::from_millis(50);
    let mut remaining = duration;
    while running.load(Ordering::SeqCst) && !remaining.is_zero() {
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
}

impl PersistentLogger {
    /// Create a logger over the given collaborators.
    ///
    /// The RTC handle is obtained once here and kept for the logger's
    /// lifetime.
    pub fn new(storage: Arc<dyn SdStorage>, nvs: Arc<dyn NvsStore>, rtc: Arc<dyn Rtc>) -> Self {
        Self {
            state: Mutex::new(LoggerState {
                ring: Ring {
                    entries: core::array::from_fn(|_| LogEntry::default()),
                    next: 0,
                    total: 0,
                },
                min_severity: Severity::Info,
                sd_dir: "logs".to_string(),
                max_file_size: 1_048_576,
                consecutive_sd_failures: 0,
            }),
            storage,
            nvs,
            rtc,
            alert_cb: Mutex::new(None),
            async_tx: Mutex::new(None),
            free_space_threshold: AtomicU64::new(1_048_576),
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Mount the storage and prepare the log directory.
    pub fn init(&self) -> Result<(), StorageError> {
        self.storage.init()?;
        let dir = lock(&self.state).sd_dir.clone();
        self.storage.create_directory(&dir)?;
        self.running.store(true, Ordering::SeqCst);
        info!(dir, "persistent logger initialised");
        Ok(())
    }

    /// Record an entry if it passes the minimum severity gate.
    pub fn log(&self, severity: Severity, message: &str) {
        if severity < lock(&self.state).min_severity {
            return;
        }
        self.record(severity, message);
    }

    /// Record an alert entry; the severity gate does not apply.
    pub fn log_alert(&self, severity: Severity, message: &str) {
        self.record(severity, message);
    }

    fn record(&self, severity: Severity, message: &str) {
        let entry = LogEntry {
            timestamp_ms: self.rtc.timestamp_ms(),
            severity,
            message: bounded_string(message),
        };

        {
            let mut state = lock(&self.state);
            let slot = state.ring.next;
            state.ring.entries[slot] = entry.clone();
            state.ring.next = (state.ring.next + 1) % LOG_RING_LEN;
            state.ring.total += 1;
        }

        if severity >= Severity::Warning {
            if let Some(callback) = lock(&self.alert_cb).clone() {
                callback.on_log_alert(&entry);
            }
        }
    }

    /// Register the alert callback, replacing any previous one.
    pub fn register_alert_callback(&self, callback: Arc<dyn LogAlertObserver>) {
        *lock(&self.alert_cb) = Some(callback);
    }

    /// Set the minimum severity recorded by [`Self::log`].
    pub fn set_level(&self, severity: Severity) {
        lock(&self.state).min_severity = severity;
    }

    /// Set the SD directory receiving persisted log files.
    pub fn set_sd_directory(&self, dir: &str) {
        lock(&self.state).sd_dir = dir.to_string();
    }

    /// Set the rotation size for SD-resident files [bytes].
    pub fn set_max_file_size(&self, bytes: u64) {
        lock(&self.state).max_file_size = bytes;
    }

    /// Set the free-space floor for the monitor worker [bytes].
    pub fn set_free_space_threshold(&self, bytes: u64) {
        self.free_space_threshold.store(bytes, Ordering::SeqCst);
    }

    /// Log every retained entry.
    pub fn print_buffer(&self) {
        for entry in self.snapshot() {
            info!(
                timestamp_ms = entry.timestamp_ms,
                severity = %entry.severity,
                "{}",
                entry.message
            );
        }
    }

    /// Retained entries, oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        let state = lock(&self.state);
        let mut out = Vec::new();
        for offset in 0..LOG_RING_LEN {
            let entry = &state.ring.entries[(state.ring.next + offset) % LOG_RING_LEN];
            if entry.timestamp_ms != 0 {
                out.push(entry.clone());
            }
        }
        out
    }

    /// Persist the whole buffer to the SD card.
    ///
    /// Retries locally before escalating to a critical alert.
    pub fn save_to_sd(&self) -> Result<(), StorageError> {
        let dir = lock(&self.state).sd_dir.clone();
        let body: String = self
            .snapshot()
            .iter()
            .map(|e| e.render_line())
            .collect::<Vec<_>>()
            .join("\n");
        let path = format!("{dir}/logbuf_{}.log", self.storage.formatted_timestamp());

        let mut last_error = None;
        for attempt in 1..=SD_LOCAL_RETRIES {
            match self.storage.write(&path, body.as_bytes()) {
                Ok(()) => {
                    lock(&self.state).consecutive_sd_failures = 0;
                    return Ok(());
                }
                Err(e) => {
                    debug!(attempt, "SD save failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        lock(&self.state).consecutive_sd_failures += 1;
        let err = last_error.unwrap_or(StorageError::NotMounted);
        self.log_alert(
            Severity::Critical,
            &format!("SD save failed after {SD_LOCAL_RETRIES} retries: {err}"),
        );
        Err(err)
    }

    /// Persist warning/critical entries to the non-volatile store.
    pub fn save_critical_to_nvs(&self) -> Result<(), StorageError> {
        let critical: Vec<LogEntry> = self
            .snapshot()
            .into_iter()
            .filter(|e| e.severity >= Severity::Warning)
            .collect();
        let blob = serde_json::to_vec(&critical).map_err(|e| StorageError::Serde(e.to_string()))?;
        self.nvs.set_blob(NVS_NAMESPACE, NVS_CRITICAL_KEY, &blob)?;
        self.nvs.commit()
    }

    /// Load the previously persisted warning/critical entries.
    pub fn load_critical_from_nvs(&self) -> Result<Vec<LogEntry>, StorageError> {
        match self.nvs.get_blob(NVS_NAMESPACE, NVS_CRITICAL_KEY)? {
            None => Ok(Vec::new()),
            Some(blob) => {
                serde_json::from_slice(&blob).map_err(|e| StorageError::Serde(e.to_string()))
            }
        }
    }

    /// Queue a message for the asynchronous SD writer.
    ///
    /// The data is heap-copied; the worker owns it from here.
    pub fn async_write(&self, data: &[u8]) -> Result<(), StorageError> {
        let sender = lock(&self.async_tx)
            .clone()
            .ok_or_else(|| StorageError::Io("async writer not running".to_string()))?;
        sender
            .send(data.to_vec())
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    /// Start the 60-second NVS flush worker.
    ///
    /// Takes a clone of the logger's `Arc`; the caller keeps its own.
    pub fn start_flush_task(self: Arc<Self>) {
        let logger = Arc::clone(&self);
        let running = Arc::clone(&self.running);
        lock(&self.workers).push(std::thread::spawn(move || {
            debug!("log flush worker started");
            while running.load(Ordering::SeqCst) {
                interruptible_sleep(&running, Duration::from_secs(LOG_FLUSH_INTERVAL_S));
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = logger.save_critical_to_nvs() {
                    warn!("critical-log flush failed: {e}");
                }
            }
            debug!("log flush worker stopped");
        }));
    }

    /// Start the asynchronous SD write worker.
    pub fn start_async_write_task(self: Arc<Self>) {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        *lock(&self.async_tx) = Some(tx);

        let logger = Arc::clone(&self);
        lock(&self.workers).push(std::thread::spawn(move || {
            debug!("async write worker started");
            // The loop ends when every sender is dropped at shutdown.
            for data in rx.iter() {
                let (dir, max_file_size) = {
                    let state = lock(&logger.state);
                    (state.sd_dir.clone(), state.max_file_size)
                };
                let line = String::from_utf8_lossy(&data);
                if let Err(e) =
                    logger
                        .storage
                        .write_with_rotation(&dir, "async", line.trim_end(), max_file_size)
                {
                    warn!("async SD write failed: {e}");
                }
            }
            debug!("async write worker stopped");
        }));
    }

    /// Start the 30-second free-space monitor worker.
    pub fn start_monitor_task(self: Arc<Self>) {
        let logger = Arc::clone(&self);
        let running = Arc::clone(&self.running);
        lock(&self.workers).push(std::thread::spawn(move || {
            debug!("storage monitor worker started");
            while running.load(Ordering::SeqCst) {
                interruptible_sleep(&running, Duration::from_secs(LOG_MONITOR_INTERVAL_S));
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                logger.monitor_once();
            }
            debug!("storage monitor worker stopped");
        }));
    }

    /// One pass of the free-space monitor.
    pub fn monitor_once(&self) {
        let threshold = self.free_space_threshold.load(Ordering::SeqCst);
        match self.storage.free_space() {
            Ok(free) if free < threshold => {
                self.log_alert(
                    Severity::Critical,
                    &format!("SD free space low: {free} bytes (threshold {threshold})"),
                );
                let _ = self.save_to_sd();
            }
            Ok(_) => {}
            Err(e) => {
                warn!("free-space query failed: {e}");
                lock(&self.state).consecutive_sd_failures += 1;
            }
        }

        let mut state = lock(&self.state);
        if state.consecutive_sd_failures >= SD_FAILURE_RESET_LIMIT {
            // TODO(storage): remount/reformat recovery; for now only the
            // counter is reset so alerts keep flowing.
            error!(
                failures = state.consecutive_sd_failures,
                "persistent SD failures - resetting error counter"
            );
            state.consecutive_sd_failures = 0;
        }
    }

    /// Export the retained entries as CSV.
    pub fn export_csv(&self) -> String {
        let mut out = String::from("timestamp_ms,severity,message\n");
        for entry in self.snapshot() {
            let escaped = entry.message.replace('"', "\"\"");
            out.push_str(&format!("{},{},\"{}\"\n", entry.timestamp_ms, entry.severity.tag(), escaped));
        }
        out
    }

    /// Export the retained entries as JSON.
    pub fn export_json(&self) -> Result<String, StorageError> {
        serde_json::to_string_pretty(&self.snapshot())
            .map_err(|e| StorageError::Serde(e.to_string()))
    }

    /// Upload the buffer to the fleet backend.
    pub fn send_logs(&self) -> Result<(), StorageError> {
        // TODO(mqtt): remote log upload is unresolved upstream; the MQTT
        // path for log batches has never been specified.
        warn!("send_logs: MQTT log upload not implemented");
        Ok(())
    }

    /// Consecutive SD failures recorded by the save/monitor paths.
    pub fn consecutive_sd_failures(&self) -> u32 {
        lock(&self.state).consecutive_sd_failures
    }

    /// Stop every worker and release the async queue.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        *lock(&self.async_tx) = None;
        for handle in lock(&self.workers).drain(..) {
            let _ = handle.join();
        }
        info!("persistent logger stopped");
    }
}
