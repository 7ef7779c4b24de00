//! `CanTransport`: reliable, priority-aware frame I/O over a bus driver.
//!
//! Two workers run for the lifetime of the transport. The TX worker drains
//! the bounded TX queue, retries failed transmissions with a fixed backoff
//! and re-enqueues them at the front so higher-priority frames never fall
//! behind lower-priority ones across a retry. The RX worker is the sole
//! caller of `CanDriver::receive`; it feeds the registered RX callback and
//! an internal buffer served by [`CanTransport::receive_sync`].
//!
//! All mutable state apart from the queues sits behind the config and
//! latency mutexes; counters are atomics.

use crate::driver::{CanBusConfig, CanDriver};
use crate::error::CanError;
use crate::frame::{CanFrame, FrameFlags, MAX_PAYLOAD, apply_checksum, verify_and_strip_checksum};
use crate::metrics::{CanDiagnostics, LatencyMetrics, QueueStatus, TransportCounters};
use crate::queue::{RxQueue, TxQueue};
use canmon_common::clock::Clock;
use canmon_common::consts::{
    CAN_ID_LOOPBACK_TEST, CAN_MAX_RETRIES, CAN_RETRY_BACKOFF_MS, PRIO_CAN_TX,
    PRIO_CAN_TX_ELEVATED, RX_QUEUE_CAPACITY, TX_QUEUE_CAPACITY, TX_QUEUE_HIGH_WATERMARK_PCT,
};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Observer of TX completions, invoked by the TX worker.
pub trait TxObserver: Send + Sync {
    /// Called once per frame leaving the queue: `Ok` after a successful
    /// transmission, `Err` when the retry budget is exhausted.
    fn on_tx_result(&self, frame: &CanFrame, result: &Result<(), CanError>);
}

/// Observer of received frames, invoked by the RX worker.
pub trait RxObserver: Send + Sync {
    /// Called for every verified frame taken off the bus.
    fn on_frame(&self, frame: &CanFrame);
}

struct Shared {
    driver: Arc<dyn CanDriver>,
    config: Mutex<CanBusConfig>,
    tx_queue: TxQueue,
    rx_queue: RxQueue,
    latency: parking_lot::Mutex<LatencyMetrics>,
    counters: TransportCounters,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    tx_priority: AtomicU8,
    start_time_us: AtomicU64,
    tx_observer: Mutex<Option<Arc<dyn TxObserver>>>,
    rx_observer: Mutex<Option<Arc<dyn RxObserver>>>,
}

/// The CAN transport layer.
pub struct CanTransport {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Logical TX worker priority for a queue fill percentage.
fn tx_priority_for_fill(fill_pct: usize) -> u8 {
    if fill_pct >= TX_QUEUE_HIGH_WATERMARK_PCT {
        PRIO_CAN_TX_ELEVATED
    } else {
        PRIO_CAN_TX
    }
}

impl CanTransport {
    /// Create a transport over the given driver. Workers start in `init`.
    pub fn new(driver: Arc<dyn CanDriver>, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                driver,
                config: Mutex::new(CanBusConfig::default()),
                tx_queue: TxQueue::new(TX_QUEUE_CAPACITY),
                rx_queue: RxQueue::new(RX_QUEUE_CAPACITY),
                latency: parking_lot::Mutex::new(LatencyMetrics::default()),
                counters: TransportCounters::default(),
                clock,
                running: AtomicBool::new(false),
                tx_priority: AtomicU8::new(PRIO_CAN_TX),
                start_time_us: AtomicU64::new(0),
                tx_observer: Mutex::new(None),
                rx_observer: Mutex::new(None),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Install and start the driver, then spawn the TX and RX workers.
    pub fn init(&self, config: CanBusConfig) -> Result<(), CanError> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(CanError::Unknown("transport already running".to_string()));
        }

        self.shared.driver.install(&config)?;
        self.shared.driver.start()?;
        *lock(&self.shared.config) = config;

        self.shared
            .start_time_us
            .store(self.shared.clock.now_us(), Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);

        let mut workers = lock(&self.workers);
        let tx_shared = Arc::clone(&self.shared);
        workers.push(std::thread::spawn(move || tx_worker(tx_shared)));
        let rx_shared = Arc::clone(&self.shared);
        workers.push(std::thread::spawn(move || rx_worker(rx_shared)));

        info!(
            driver = self.shared.driver.name(),
            bitrate = config.bitrate,
            checksum = config.checksum_enabled,
            "CAN transport started"
        );
        Ok(())
    }

    /// Replace the bus configuration: drain the queue, reinstall the driver.
    pub fn reconfigure(&self, config: CanBusConfig) -> Result<(), CanError> {
        let mut current = lock(&self.shared.config);

        let dropped = self.shared.tx_queue.drain();
        if dropped > 0 {
            warn!("reconfigure dropped {dropped} queued frames");
        }

        self.shared.driver.stop()?;
        self.shared.driver.uninstall()?;
        self.shared.driver.install(&config)?;
        self.shared.driver.start()?;

        *current = config;
        info!(bitrate = config.bitrate, "CAN transport reconfigured");
        Ok(())
    }

    /// Stop the workers and tear the driver down.
    pub fn shutdown(&self) -> Result<(), CanError> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.tx_queue.close();
        self.shared.rx_queue.close();

        for handle in lock(&self.workers).drain(..) {
            let _ = handle.join();
        }

        self.shared.driver.stop()?;
        self.shared.driver.uninstall()?;
        info!("CAN transport stopped");
        Ok(())
    }

    /// Queue a frame for asynchronous transmission.
    ///
    /// `high_priority` prepends the frame so it preempts everything queued.
    /// Blocks while the queue is at capacity.
    pub fn enqueue(&self, mut frame: CanFrame, high_priority: bool) -> Result<(), CanError> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(CanError::Transmit("transport not running".to_string()));
        }
        if frame.dlc as usize > MAX_PAYLOAD {
            return Err(CanError::InvalidLength {
                len: frame.dlc as usize,
                limit: MAX_PAYLOAD,
            });
        }
        if lock(&self.shared.config).checksum_enabled {
            apply_checksum(&mut frame)?;
        }

        let accepted = if high_priority {
            self.shared.tx_queue.push_front(frame)
        } else {
            self.shared.tx_queue.push_back(frame)
        };
        if accepted {
            Ok(())
        } else {
            Err(CanError::Transmit("TX queue closed".to_string()))
        }
    }

    /// Transmit a frame synchronously, bypassing the queue and retry policy.
    pub fn send_sync(&self, id: u32, data: &[u8]) -> Result<(), CanError> {
        let mut frame = CanFrame::new(id, data)?;
        let (checksum_enabled, timeout) = {
            let config = lock(&self.shared.config);
            (config.checksum_enabled, Duration::from_millis(config.tx_timeout_ms))
        };
        if checksum_enabled {
            apply_checksum(&mut frame)?;
        }

        self.shared.counters.attempts.fetch_add(1, Ordering::Relaxed);
        let t0 = self.shared.clock.now_us();
        self.shared.driver.transmit(&frame, timeout)?;
        let elapsed = self.shared.clock.now_us().saturating_sub(t0);

        self.shared.latency.lock().record(elapsed);
        self.shared
            .counters
            .bus_busy_us
            .fetch_add(elapsed, Ordering::Relaxed);
        Ok(())
    }

    /// Receive the next frame, waiting at most `timeout`.
    ///
    /// With checksum mode enabled the trailing byte is verified and
    /// stripped; a mismatch surfaces as `CanError::Receive`.
    pub fn receive_sync(&self, timeout: Duration) -> Result<CanFrame, CanError> {
        let mut frame = self
            .shared
            .rx_queue
            .pop(timeout)
            .ok_or_else(|| CanError::Timeout(timeout.as_millis() as u64))?;

        if lock(&self.shared.config).checksum_enabled {
            verify_and_strip_checksum(&mut frame).inspect_err(|_| {
                self.shared
                    .counters
                    .rx_checksum_failures
                    .fetch_add(1, Ordering::Relaxed);
            })?;
        }
        Ok(frame)
    }

    /// Register the RX callback, replacing any previous one.
    pub fn register_rx_callback(&self, observer: Arc<dyn RxObserver>) {
        *lock(&self.shared.rx_observer) = Some(observer);
    }

    /// Register the TX completion callback, replacing any previous one.
    pub fn register_tx_callback(&self, observer: Arc<dyn TxObserver>) {
        *lock(&self.shared.tx_observer) = Some(observer);
    }

    /// Controller error counters plus transport-derived totals.
    ///
    /// # Errors
    ///
    /// Propagates a failed controller status read.
    pub fn diagnostics(&self) -> Result<CanDiagnostics, CanError> {
        let status = self.shared.driver.status_info()?;
        Ok(self.shared.counters.diagnostics(status))
    }

    /// Snapshot of the TX latency metrics.
    pub fn latency_metrics(&self) -> LatencyMetrics {
        *self.shared.latency.lock()
    }

    /// TX queue occupancy.
    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            depth: self.shared.tx_queue.len(),
            capacity: self.shared.tx_queue.capacity(),
        }
    }

    /// Share of wall time the bus spent on traffic from this node [%].
    ///
    /// Clamped to zero until the transport has been running for a
    /// measurable interval.
    pub fn bus_load(&self) -> f64 {
        let now = self.shared.clock.now_us();
        let start = self.shared.start_time_us.load(Ordering::SeqCst);
        if now <= start {
            return 0.0;
        }
        let busy = self.shared.counters.bus_busy_us.load(Ordering::Relaxed);
        busy as f64 * 100.0 / (now - start) as f64
    }

    /// Total retransmissions performed by the TX worker.
    pub fn retransmission_count(&self) -> u64 {
        self.shared.counters.retransmissions.load(Ordering::Relaxed)
    }

    /// Collision proxy total.
    pub fn collision_count(&self) -> u64 {
        self.shared.counters.collisions.load(Ordering::Relaxed)
    }

    /// Total transmission attempts (first tries plus retries).
    pub fn transmission_attempts(&self) -> u64 {
        self.shared.counters.attempts.load(Ordering::Relaxed)
    }

    /// Frames taken off the bus so far.
    pub fn frames_received(&self) -> u64 {
        self.shared.counters.frames_received.load(Ordering::Relaxed)
    }

    /// Current logical priority of the TX worker.
    pub fn tx_task_priority(&self) -> u8 {
        self.shared.tx_priority.load(Ordering::SeqCst)
    }

    /// Loopback self-test: round-trip one frame through the controller.
    ///
    /// Temporarily enables self-reception, sends the current µs timestamp
    /// on the reserved loopback ID and waits for the echo. The previous
    /// self-reception setting is restored regardless of outcome. Returns
    /// the measured round-trip time [µs].
    pub fn measure_round_trip(&self, timeout: Duration) -> Result<u64, CanError> {
        let previous = {
            let mut config = lock(&self.shared.config);
            let previous = config.self_reception;
            config.self_reception = true;
            previous
        };
        let enable_result = self.shared.driver.set_self_reception(true);

        let result = match enable_result {
            Ok(()) => self.loopback_roundtrip(timeout),
            Err(e) => Err(e),
        };

        lock(&self.shared.config).self_reception = previous;
        if let Err(e) = self.shared.driver.set_self_reception(previous) {
            warn!("failed to restore self-reception: {e}");
        }
        result
    }

    fn loopback_roundtrip(&self, timeout: Duration) -> Result<u64, CanError> {
        let sent_us = self.shared.clock.now_us();
        let mut frame = CanFrame::new(CAN_ID_LOOPBACK_TEST, &sent_us.to_le_bytes())?;
        frame.flags |= FrameFlags::SELF_RX;

        let tx_timeout = Duration::from_millis(lock(&self.shared.config).tx_timeout_ms);
        self.shared.counters.attempts.fetch_add(1, Ordering::Relaxed);
        self.shared.driver.transmit(&frame, tx_timeout)?;

        // Wait for the echo, letting unrelated traffic pass through.
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CanError::Timeout(timeout.as_millis() as u64));
            }
            let echo = self
                .shared
                .rx_queue
                .pop(remaining)
                .ok_or_else(|| CanError::Timeout(timeout.as_millis() as u64))?;
            if echo.id != CAN_ID_LOOPBACK_TEST {
                continue;
            }
            if (echo.dlc as usize) < MAX_PAYLOAD {
                return Err(CanError::Receive(format!(
                    "loopback payload too short: {} bytes",
                    echo.dlc
                )));
            }
            let echoed_ts = u64::from_le_bytes(echo.data);
            return Ok(self.shared.clock.now_us().saturating_sub(echoed_ts));
        }
    }
}

// ─── Workers ───────────────────────────────────────────────────────

fn notify_tx(shared: &Shared, frame: &CanFrame, result: &Result<(), CanError>) {
    if let Some(observer) = lock(&shared.tx_observer).clone() {
        observer.on_tx_result(frame, result);
    }
}

fn tx_worker(shared: Arc<Shared>) {
    debug!("TX worker started");
    while shared.running.load(Ordering::SeqCst) {
        let Some(mut frame) = shared.tx_queue.pop(Duration::from_millis(100)) else {
            continue;
        };

        shared.counters.attempts.fetch_add(1, Ordering::Relaxed);
        let timeout = Duration::from_millis(lock(&shared.config).tx_timeout_ms);
        let t0 = shared.clock.now_us();

        match shared.driver.transmit(&frame, timeout) {
            Ok(()) => {
                let elapsed = shared.clock.now_us().saturating_sub(t0);
                shared.latency.lock().record(elapsed);
                shared
                    .counters
                    .bus_busy_us
                    .fetch_add(elapsed, Ordering::Relaxed);
                notify_tx(&shared, &frame, &Ok(()));
            }
            Err(e) if frame.retry_count < CAN_MAX_RETRIES => {
                frame.retry_count += 1;
                shared.counters.retransmissions.fetch_add(1, Ordering::Relaxed);
                // TODO(metrics): the collision proxy just shadows the
                // retransmission count; split it out once the controller
                // reports arbitration losses separately.
                shared.counters.collisions.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "transmit of {:#010x} failed ({e}), retry {} after backoff",
                    frame.id, frame.retry_count
                );
                std::thread::sleep(Duration::from_millis(CAN_RETRY_BACKOFF_MS));
                shared.tx_queue.requeue_front(frame);
            }
            Err(e) => {
                shared.counters.fatal_tx_errors.fetch_add(1, Ordering::Relaxed);
                error!(
                    "TX frame {:#010x} dropped after {} attempts: {e}",
                    frame.id,
                    frame.retry_count + 1
                );
                notify_tx(&shared, &frame, &Err(e));
            }
        }

        // Re-evaluate the worker priority against the queue watermark.
        let fill_pct = QueueStatus {
            depth: shared.tx_queue.len(),
            capacity: shared.tx_queue.capacity(),
        }
        .fill_pct();
        let target = tx_priority_for_fill(fill_pct);
        let previous = shared.tx_priority.swap(target, Ordering::SeqCst);
        if previous != target {
            debug!("TX queue at {fill_pct}% - task priority {previous} -> {target}");
        }
    }
    debug!("TX worker stopped");
}

fn rx_worker(shared: Arc<Shared>) {
    debug!("RX worker started");
    while shared.running.load(Ordering::SeqCst) {
        let (timeout, checksum_enabled) = {
            let config = lock(&shared.config);
            (Duration::from_millis(config.rx_timeout_ms), config.checksum_enabled)
        };

        match shared.driver.receive(timeout) {
            Ok(frame) => {
                shared.counters.frames_received.fetch_add(1, Ordering::Relaxed);

                if let Some(observer) = lock(&shared.rx_observer).clone() {
                    if checksum_enabled {
                        let mut verified = frame;
                        match verify_and_strip_checksum(&mut verified) {
                            Ok(()) => observer.on_frame(&verified),
                            Err(e) => {
                                shared
                                    .counters
                                    .rx_checksum_failures
                                    .fetch_add(1, Ordering::Relaxed);
                                warn!("received frame {:#010x} failed checksum: {e}", frame.id);
                            }
                        }
                    } else {
                        observer.on_frame(&frame);
                    }
                }

                if shared.rx_queue.push(frame) > 0 {
                    debug!("RX buffer full - oldest frame dropped");
                }
            }
            Err(CanError::Timeout(_)) => {}
            Err(e) => {
                if shared.running.load(Ordering::SeqCst) {
                    warn!("RX worker receive error: {e}");
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }
    debug!("RX worker stopped");
}
