//! The monitor supervisor.
//!
//! Owns every subsystem instance (no hidden statics), is the only writer
//! of `current_time_ms`, and hosts the periodic task set:
//!
//! | Task | Cadence |
//! |---|---|
//! | CAN acquisition | 5 ms loop (dedicated thread) |
//! | Diagnosis acquisition | `MONITOR_DIAG_ACQ_INTERVAL_MS` |
//! | Communication | `MONITOR_COMM_INTERVAL_MS` |
//! | Configuration reload | `MONITOR_CONFIG_CHECK_INTERVAL_MS` |
//! | OTA orchestration | `OTA_CHECK_INTERVAL_MS`, retries per step |
//!
//! Any failure during init aborts the bring-up and is returned.

use crate::connectivity::Connectivity;
use canmon_can::{CanBusConfig, CanError, CanTransport, decode_id};
use canmon_common::clock::Clock;
use canmon_common::config::{ConfigError, ConfigFile, MonitorConfig};
use canmon_common::ecu::EcuId;
use canmon_diag::{AlertEntry, AlertObserver, AlertSink, DiagError, DiagnosisEngine};
use canmon_logger::{PersistentLogger, StorageError};
use canmon_ota::{OtaError, OtaOrchestrator};
use canmon_routing::{RoutingError, RoutingLayer};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Error type for supervisor bring-up and teardown.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Configuration load or persistence failed.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// CAN transport bring-up failed.
    #[error("CAN transport error: {0}")]
    Can(#[from] CanError),

    /// Routing layer bring-up failed.
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Logger storage bring-up failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Diagnosis wiring failed.
    #[error("diagnosis error: {0}")]
    Diag(#[from] DiagError),

    /// OTA wiring failed.
    #[error("OTA error: {0}")]
    Ota(#[from] OtaError),

    /// Anything else that aborts init.
    #[error("supervisor init failed: {0}")]
    Init(String),
}

/// Counters accumulated across the supervisor's lifetime.
#[derive(Debug, Default)]
pub struct SupervisorStats {
    /// Frames drained by the CAN acquisition task.
    pub frames_seen: AtomicU64,
    /// Alerts emitted by the alert sink.
    pub alerts_raised: AtomicU64,
    /// Diagnosis samples flagged abnormal.
    pub abnormal_samples: AtomicU64,
    /// OTA pipelines started.
    pub ota_runs: AtomicU64,
}

/// The subsystem instances the supervisor owns and wires together.
pub struct Subsystems {
    /// CAN transport.
    pub transport: Arc<CanTransport>,
    /// Diagnosis engine.
    pub engine: Arc<Mutex<DiagnosisEngine>>,
    /// Alert sink.
    pub alerts: Arc<AlertSink>,
    /// Persistent logger.
    pub logger: Arc<PersistentLogger>,
    /// Routing layer.
    pub routing: Arc<RoutingLayer>,
    /// OTA orchestrator.
    pub ota: Arc<OtaOrchestrator>,
    /// Shared runtime view of the configuration record.
    pub config: Arc<Mutex<MonitorConfig>>,
}

/// Forwards alert-sink emissions into the logger's alert channel.
struct LoggerAlertChannel {
    logger: Arc<PersistentLogger>,
}

impl AlertObserver for LoggerAlertChannel {
    fn on_alert(&self, entry: &AlertEntry) {
        self.logger.log_alert(entry.severity, &entry.message);
    }
}

/// Counts alerts for the shutdown summary.
struct AlertCounter {
    stats: Arc<SupervisorStats>,
}

impl AlertObserver for AlertCounter {
    fn on_alert(&self, _entry: &AlertEntry) {
        self.stats.alerts_raised.fetch_add(1, Ordering::Relaxed);
    }
}

/// Audits every OTA transition into the persistent log.
struct OtaAudit {
    logger: Arc<PersistentLogger>,
}

impl canmon_ota::OtaObserver for OtaAudit {
    fn on_transition(&self, state: canmon_ota::OtaState, ecu: EcuId, detail: Option<&str>) {
        let suffix = detail.map(|d| format!(" ({d})")).unwrap_or_default();
        self.logger.log(
            canmon_common::level::Severity::Info,
            &format!("ota {}: {state:?}{suffix}", ecu.name()),
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The monitor node supervisor.
pub struct MonitorSupervisor {
    clock: Arc<dyn Clock>,
    current_time_ms: Arc<AtomicU64>,
    config_file: Arc<ConfigFile>,
    connectivity: Arc<dyn Connectivity>,
    subsystems: Subsystems,
    stats: Arc<SupervisorStats>,
    running: Arc<AtomicBool>,
    tokio_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    acquisition_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl MonitorSupervisor {
    /// Create a supervisor over the given collaborators and subsystems.
    pub fn new(
        clock: Arc<dyn Clock>,
        config_file: Arc<ConfigFile>,
        connectivity: Arc<dyn Connectivity>,
        subsystems: Subsystems,
    ) -> Self {
        Self {
            clock,
            current_time_ms: Arc::new(AtomicU64::new(0)),
            config_file,
            connectivity,
            subsystems,
            stats: Arc::new(SupervisorStats::default()),
            running: Arc::new(AtomicBool::new(false)),
            tokio_tasks: Mutex::new(Vec::new()),
            acquisition_thread: Mutex::new(None),
        }
    }

    /// Milliseconds timestamp maintained by the acquisition task.
    pub fn current_time_ms(&self) -> u64 {
        self.current_time_ms.load(Ordering::SeqCst)
    }

    /// Lifetime counters.
    pub fn stats(&self) -> &SupervisorStats {
        &self.stats
    }

    /// The owned subsystem instances.
    pub fn subsystems(&self) -> &Subsystems {
        &self.subsystems
    }

    /// Bring everything up and spawn the periodic task set.
    ///
    /// # Errors
    ///
    /// Any subsystem failure aborts init and is returned; nothing keeps
    /// running in that case apart from already-started workers, which
    /// `shutdown` cleans up.
    pub async fn init(&self) -> Result<(), SupervisorError> {
        info!("🔧 initialising monitor supervisor");

        if rt_scheduling_active() {
            info!("running under a real-time scheduling policy");
        } else {
            info!("running under standard scheduling");
        }

        // 1. Wireless collaborators first: routing and OTA depend on them.
        self.connectivity.bring_up()?;

        // 2. Logger and its storage.
        self.subsystems.logger.init()?;

        // 3. Load the knobs; the config file is the source of truth.
        let config = self.config_file.load_or_init()?;
        self.apply_config(&config);
        *lock(&self.subsystems.config) = config.clone();

        // 4. Alert chain: engine → alert sink → logger (+ counters).
        self.subsystems.alerts.set_log_channel(Arc::new(LoggerAlertChannel {
            logger: Arc::clone(&self.subsystems.logger),
        }));
        self.subsystems.alerts.register_callback(Arc::new(AlertCounter {
            stats: Arc::clone(&self.stats),
        }));
        let alert_sink =
            Arc::clone(&self.subsystems.alerts) as Arc<dyn canmon_diag::DiagnosisObserver>;
        lock(&self.subsystems.engine).register_alert_callback(alert_sink)?;

        // 5. Routing up, then its workers.
        self.subsystems.routing.init()?;
        Arc::clone(&self.subsystems.routing).start();

        // 6. OTA status handler: audit every transition.
        self.subsystems.ota.register_status_callback(Arc::new(OtaAudit {
            logger: Arc::clone(&self.subsystems.logger),
        }))?;

        // 7. CAN transport with the configured receive timeout.
        self.subsystems.transport.init(CanBusConfig {
            rx_timeout_ms: config.monitor.can_receive_timeout_ms,
            ..CanBusConfig::default()
        })?;

        // 8. Logger workers.
        Arc::clone(&self.subsystems.logger).start_flush_task();
        Arc::clone(&self.subsystems.logger).start_async_write_task();
        Arc::clone(&self.subsystems.logger).start_monitor_task();

        self.running.store(true, Ordering::SeqCst);
        self.spawn_acquisition_thread();
        self.spawn_periodic_tasks(&config);

        info!("✅ monitor supervisor initialised");
        Ok(())
    }

    /// Push freshly loaded knobs into the subsystems that cache them.
    fn apply_config(&self, config: &MonitorConfig) {
        lock(&self.subsystems.engine).set_thresholds(config.diagnosis.into());
        self.subsystems.alerts.set_thresholds(canmon_diag::AlertThresholds {
            tx_errors: config.diagnosis.tx_error_threshold,
            rx_errors: config.diagnosis.rx_error_threshold,
            bus_load_pct: config.diagnosis.bus_load_threshold,
            retransmissions: config.diagnosis.retrans_threshold,
        });
        self.subsystems.logger.set_max_file_size(config.sd.max_log_file_size);
        self.subsystems
            .logger
            .set_free_space_threshold(config.sd.free_space_threshold);
    }

    // ── Task spawning ──────────────────────────────────────────────

    /// CAN acquisition: a dedicated 5 ms thread draining the transport.
    fn spawn_acquisition_thread(&self) {
        let running = Arc::clone(&self.running);
        let clock = Arc::clone(&self.clock);
        let current_time_ms = Arc::clone(&self.current_time_ms);
        let transport = Arc::clone(&self.subsystems.transport);
        let config = Arc::clone(&self.subsystems.config);
        let stats = Arc::clone(&self.stats);

        let handle = std::thread::spawn(move || {
            debug!("CAN acquisition task started");
            while running.load(Ordering::SeqCst) {
                current_time_ms.store(clock.now_ms(), Ordering::SeqCst);

                let timeout =
                    Duration::from_millis(lock(&config).monitor.can_receive_timeout_ms);
                match transport.receive_sync(timeout) {
                    Ok(frame) => {
                        stats.frames_seen.fetch_add(1, Ordering::Relaxed);
                        let (priority, module, command) = decode_id(frame.id);
                        debug!(
                            "frame {:#010x}: prio={priority} module={module} cmd={command:#06x} dlc={}",
                            frame.id, frame.dlc
                        );
                    }
                    Err(CanError::Timeout(_)) => {}
                    Err(e) => debug!("acquisition receive error: {e}"),
                }

                std::thread::sleep(Duration::from_millis(5));
            }
            debug!("CAN acquisition task stopped");
        });
        *lock(&self.acquisition_thread) = Some(handle);
    }

    fn spawn_periodic_tasks(&self, config: &MonitorConfig) {
        let mut tasks = lock(&self.tokio_tasks);

        // Diagnosis acquisition.
        {
            let running = Arc::clone(&self.running);
            let clock = Arc::clone(&self.clock);
            let engine = Arc::clone(&self.subsystems.engine);
            let logger = Arc::clone(&self.subsystems.logger);
            let stats = Arc::clone(&self.stats);
            let shared_config = Arc::clone(&self.subsystems.config);
            let period = Duration::from_millis(config.monitor.diag_acq_interval_ms);

            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                let mut last_persist_ms = clock.now_ms();
                loop {
                    ticker.tick().await;
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }

                    let sample = lock(&engine).update();
                    match sample {
                        Ok(sample) => {
                            if sample.abnormal {
                                stats.abnormal_samples.fetch_add(1, Ordering::Relaxed);
                            }
                            let persist_interval =
                                lock(&shared_config).monitor.diag_persist_interval_ms;
                            let now_ms = clock.now_ms();
                            if sample.abnormal
                                || now_ms.saturating_sub(last_persist_ms) >= persist_interval
                            {
                                let line = format!(
                                    "diag ts={} tx_err={} rx_err={} bus_off={} load={:.1}% \
                                     queue={} retrans={} attempts={} max_lat={}us abnormal={}",
                                    sample.timestamp_us,
                                    sample.can.tx_error_counter,
                                    sample.can.rx_error_counter,
                                    sample.can.bus_off,
                                    sample.bus_load_pct,
                                    sample.queue_depth,
                                    sample.can.retransmissions,
                                    sample.can.tx_attempts,
                                    sample.latency.max_us,
                                    sample.abnormal,
                                );
                                if logger.async_write(line.as_bytes()).is_ok() {
                                    last_persist_ms = now_ms;
                                }
                            }
                        }
                        Err(e) => warn!("diagnosis update failed: {e}"),
                    }
                }
            }));
        }

        // Communication: periodic route recompute.
        {
            let running = Arc::clone(&self.running);
            let routing = Arc::clone(&self.subsystems.routing);
            let period = Duration::from_millis(config.monitor.comm_interval_ms);

            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                loop {
                    ticker.tick().await;
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    routing.recalculate_routes();
                }
            }));
        }

        // Configuration reload.
        {
            let running = Arc::clone(&self.running);
            let config_file = Arc::clone(&self.config_file);
            let shared_config = Arc::clone(&self.subsystems.config);
            let engine = Arc::clone(&self.subsystems.engine);
            let alerts = Arc::clone(&self.subsystems.alerts);
            let logger = Arc::clone(&self.subsystems.logger);
            let period = Duration::from_millis(config.monitor.config_check_interval_ms);

            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.tick().await; // skip the immediate first tick
                loop {
                    ticker.tick().await;
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    match config_file.load() {
                        Ok(fresh) => {
                            lock(&engine).set_thresholds(fresh.diagnosis.into());
                            alerts.set_thresholds(canmon_diag::AlertThresholds {
                                tx_errors: fresh.diagnosis.tx_error_threshold,
                                rx_errors: fresh.diagnosis.rx_error_threshold,
                                bus_load_pct: fresh.diagnosis.bus_load_threshold,
                                retransmissions: fresh.diagnosis.retrans_threshold,
                            });
                            logger.set_max_file_size(fresh.sd.max_log_file_size);
                            logger.set_free_space_threshold(fresh.sd.free_space_threshold);
                            *lock(&shared_config) = fresh;
                            info!("configuration reloaded from config.ini");
                        }
                        Err(e) => warn!("configuration reload failed: {e}"),
                    }
                }
            }));
        }

        // OTA orchestration.
        {
            let running = Arc::clone(&self.running);
            let ota = Arc::clone(&self.subsystems.ota);
            let shared_config = Arc::clone(&self.subsystems.config);
            let stats = Arc::clone(&self.stats);
            let period = Duration::from_millis(config.ota.check_interval_ms);

            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.tick().await; // skip the immediate first tick
                loop {
                    ticker.tick().await;
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    let ota = Arc::clone(&ota);
                    let stats = Arc::clone(&stats);
                    let (max_retries, retry_delay) = {
                        let config = lock(&shared_config);
                        (
                            config.monitor.max_retry_count,
                            Duration::from_millis(config.monitor.retry_delay_ms),
                        )
                    };
                    let cycle = tokio::task::spawn_blocking(move || {
                        run_ota_cycle(&ota, max_retries, retry_delay, &stats)
                    });
                    if let Err(e) = cycle.await {
                        warn!("OTA cycle panicked: {e}");
                    }
                }
            }));
        }
    }

    /// Stop the task set and tear the subsystems down in reverse order.
    pub async fn shutdown(&self) {
        info!("🛑 monitor supervisor shutting down");
        self.running.store(false, Ordering::SeqCst);

        for task in lock(&self.tokio_tasks).drain(..) {
            task.abort();
        }
        if let Some(handle) = lock(&self.acquisition_thread).take() {
            let _ = handle.join();
        }

        self.subsystems.routing.shutdown();

        if let Err(e) = self.subsystems.logger.save_critical_to_nvs() {
            warn!("final critical-log flush failed: {e}");
        }
        let snapshot = lock(&self.subsystems.config).clone();
        if let Err(e) = self.config_file.save(&snapshot) {
            warn!("final configuration save failed: {e}");
        }
        self.subsystems.logger.shutdown();

        if let Err(e) = self.subsystems.transport.shutdown() {
            warn!("CAN transport shutdown failed: {e}");
        }
        self.connectivity.shut_down();

        info!(
            frames_seen = self.stats.frames_seen.load(Ordering::Relaxed),
            alerts_raised = self.stats.alerts_raised.load(Ordering::Relaxed),
            abnormal_samples = self.stats.abnormal_samples.load(Ordering::Relaxed),
            ota_runs = self.stats.ota_runs.load(Ordering::Relaxed),
            "🏁 monitor supervisor stopped"
        );
    }
}

/// One OTA cycle: check for an update, then run the pipeline with the
/// supervisor's bounded per-step retry. Exhaustion triggers rollback.
pub fn run_ota_cycle(
    ota: &OtaOrchestrator,
    max_retries: u32,
    retry_delay: Duration,
    stats: &SupervisorStats,
) {
    match ota.check_update() {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            debug!("update check failed: {e}");
            return;
        }
    }

    stats.ota_runs.fetch_add(1, Ordering::Relaxed);
    let ecu = EcuId::Monitor;

    let steps: [(&str, Box<dyn Fn() -> Result<(), OtaError> + '_>); 3] = [
        ("download", Box::new(move || ota.download_firmware(ecu))),
        ("distribute", Box::new(move || ota.distribute_firmware(ecu))),
        ("apply", Box::new(move || ota.apply_update(ecu))),
    ];

    for (name, step) in &steps {
        let mut completed = false;
        for attempt in 1..=max_retries {
            match step() {
                Ok(()) => {
                    completed = true;
                    break;
                }
                Err(e) => {
                    warn!(step = name, attempt, max_retries, "OTA step failed: {e}");
                    if attempt < max_retries {
                        ota.acknowledge_failure(ecu);
                        std::thread::sleep(retry_delay);
                    }
                }
            }
        }
        if !completed {
            warn!(step = name, "OTA retries exhausted, rolling back");
            ota.rollback_update(ecu);
            return;
        }
    }
}

/// Detect whether this process runs under a real-time scheduling policy.
fn rt_scheduling_active() -> bool {
    #[cfg(target_os = "linux")]
    {
        use libc::{SCHED_FIFO, SCHED_RR, sched_getscheduler};
        unsafe {
            let policy = sched_getscheduler(0);
            policy == SCHED_FIFO || policy == SCHED_RR
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}
