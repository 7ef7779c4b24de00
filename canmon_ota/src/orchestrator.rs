//! The OTA orchestrator.
//!
//! Drives the per-ECU pipeline: check → download → distribute → apply,
//! with rollback on terminal failure. While an update is in progress a
//! second one is refused for any ECU. Retry policy lives in the
//! supervisor, not here: every step either succeeds or moves the machine
//! to `Failure` and returns the error.
//!
//! The context is serialised by its mutex; subscriber notifications are
//! delivered outside the lock.

use crate::error::OtaError;
use crate::mqtt::{MqttClient, PlatformOta};
use crate::segment::segment_firmware;
use crate::state::OtaState;
use canmon_common::config::{ConfigFile, MonitorConfig};
use canmon_common::consts::{MAX_SUBSCRIBERS, OTA_SEGMENT_SIZE};
use canmon_common::ecu::EcuId;
use canmon_common::level::Severity;
use canmon_logger::{PersistentLogger, SdStorage};
use canmon_routing::{DispatchMode, RoutingLayer};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Subscriber to pipeline state transitions (bounded to 5).
pub trait OtaObserver: Send + Sync {
    /// Called on every state transition with optional detail text.
    fn on_transition(&self, state: OtaState, ecu: EcuId, detail: Option<&str>);
}

struct OtaContext {
    state: OtaState,
    ecu: Option<EcuId>,
    target_version: u32,
    buffer: Arc<Vec<u8>>,
    in_progress: bool,
    rollback_in_progress: bool,
}

/// The per-ECU update orchestrator.
pub struct OtaOrchestrator {
    ctx: Mutex<OtaContext>,
    mqtt: Arc<dyn MqttClient>,
    storage: Arc<dyn SdStorage>,
    platform: Arc<dyn PlatformOta>,
    routing: Arc<RoutingLayer>,
    logger: Arc<PersistentLogger>,
    config: Arc<Mutex<MonitorConfig>>,
    config_file: Arc<ConfigFile>,
    observers: Mutex<heapless::Vec<Arc<dyn OtaObserver>, MAX_SUBSCRIBERS>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl OtaOrchestrator {
    /// Create an orchestrator over the given collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mqtt: Arc<dyn MqttClient>,
        storage: Arc<dyn SdStorage>,
        platform: Arc<dyn PlatformOta>,
        routing: Arc<RoutingLayer>,
        logger: Arc<PersistentLogger>,
        config: Arc<Mutex<MonitorConfig>>,
        config_file: Arc<ConfigFile>,
    ) -> Self {
        Self {
            ctx: Mutex::new(OtaContext {
                state: OtaState::Idle,
                ecu: None,
                target_version: 0,
                buffer: Arc::new(Vec::new()),
                in_progress: false,
                rollback_in_progress: false,
            }),
            mqtt,
            storage,
            platform,
            routing,
            logger,
            config,
            config_file,
            observers: Mutex::new(heapless::Vec::new()),
        }
    }

    // ── Accessors ──────────────────────────────────────────────────

    /// Current pipeline state.
    pub fn state(&self) -> OtaState {
        lock(&self.ctx).state
    }

    /// An update occupies the pipeline.
    pub fn in_progress(&self) -> bool {
        lock(&self.ctx).in_progress
    }

    /// A rollback is being executed.
    pub fn rollback_in_progress(&self) -> bool {
        lock(&self.ctx).rollback_in_progress
    }

    /// Version targeted by the current (or last) update.
    pub fn target_version(&self) -> u32 {
        lock(&self.ctx).target_version
    }

    /// Register a transition subscriber.
    ///
    /// # Errors
    ///
    /// `OtaError::Unknown` when the bounded list (5) is full.
    pub fn register_status_callback(&self, observer: Arc<dyn OtaObserver>) -> Result<(), OtaError> {
        lock(&self.observers)
            .push(observer)
            .map_err(|_| OtaError::Unknown(format!("subscriber limit ({MAX_SUBSCRIBERS}) reached")))
    }

    // ── Pipeline steps ─────────────────────────────────────────────

    /// Poll the monitor update topic for a newer advertised version.
    ///
    /// Returns `true` (and moves to `UpdateAvailable`) when the advertised
    /// version exceeds the installed one. A busy pipeline reports `false`.
    pub fn check_update(&self) -> Result<bool, OtaError> {
        if lock(&self.ctx).state != OtaState::Idle {
            return Ok(false);
        }
        let (topic, installed) = {
            let config = lock(&self.config);
            (
                config.topic(EcuId::Monitor).to_string(),
                config.installed_version(EcuId::Monitor),
            )
        };
        let advertised = self.mqtt.get_update_version(&topic)?;
        if advertised <= installed {
            debug!(advertised, installed, "no newer firmware advertised");
            return Ok(false);
        }

        {
            let mut ctx = lock(&self.ctx);
            ctx.ecu = Some(EcuId::Monitor);
            ctx.target_version = advertised;
        }
        let detail = format!("v{advertised} advertised");
        self.transition(OtaState::UpdateAvailable, EcuId::Monitor, Some(detail.as_str()));
        self.logger.log(
            Severity::Info,
            &format!("update available for monitor_ecu: v{installed} -> v{advertised}"),
        );
        Ok(true)
    }

    /// Fetch the firmware for an ECU onto the SD card and into the buffer.
    ///
    /// # Errors
    ///
    /// `UpdateInProgress` while another update is alive. Any collaborator
    /// failure moves the machine to `Failure`, clears the in-progress
    /// flag and is returned.
    pub fn download_firmware(&self, ecu: EcuId) -> Result<(), OtaError> {
        {
            let mut ctx = lock(&self.ctx);
            if ctx.in_progress {
                return Err(OtaError::UpdateInProgress);
            }
            ctx.in_progress = true;
            ctx.ecu = Some(ecu);
        }
        self.transition(OtaState::Downloading, ecu, None);

        match self.download_inner(ecu) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(ecu, &e, true);
                Err(e)
            }
        }
    }

    fn download_inner(&self, ecu: EcuId) -> Result<(), OtaError> {
        let topic = lock(&self.config).topic(ecu).to_string();
        let version = self.mqtt.get_update_version(&topic)?;
        let filename = ecu.firmware_file_name(version);

        self.mqtt.download_file(&topic, &filename)?;
        let image = self.storage.read(&filename)?;
        self.logger.log(
            Severity::Info,
            &format!("downloaded {filename} ({} bytes)", image.len()),
        );

        let mut ctx = lock(&self.ctx);
        ctx.buffer = Arc::new(image);
        ctx.target_version = version;
        Ok(())
    }

    /// Segment the buffered image and unicast every segment to the ECU.
    ///
    /// Segment descriptors are dropped when this returns, whatever the
    /// outcome.
    pub fn distribute_firmware(&self, ecu: EcuId) -> Result<(), OtaError> {
        let buffer = {
            let ctx = lock(&self.ctx);
            if ctx.buffer.is_empty() {
                return Err(OtaError::NullInput("firmware buffer"));
            }
            Arc::clone(&ctx.buffer)
        };
        self.transition(OtaState::Distributing, ecu, None);

        let segments = segment_firmware(&buffer)?;
        for (index, segment) in segments.iter().enumerate() {
            if let Err(e) = self
                .routing
                .send_message(ecu.name(), segment, DispatchMode::Unicast)
            {
                let error = OtaError::Distribute(format!("segment {index}: {e}"));
                self.fail(ecu, &error, false);
                return Err(error);
            }
        }

        self.logger.log(
            Severity::Info,
            &format!("distributed {} segments to {}", segments.len(), ecu.name()),
        );
        Ok(())
    }

    /// Commit the buffered image through the platform OTA interface and
    /// persist the new installed version.
    pub fn apply_update(&self, ecu: EcuId) -> Result<(), OtaError> {
        let (buffer, version) = {
            let ctx = lock(&self.ctx);
            if ctx.buffer.is_empty() {
                return Err(OtaError::NullInput("firmware buffer"));
            }
            (Arc::clone(&ctx.buffer), ctx.target_version)
        };
        self.transition(OtaState::Applying, ecu, None);

        if let Err(e) = self.apply_inner(ecu, &buffer, version) {
            self.fail(ecu, &e, false);
            return Err(e);
        }

        {
            let mut ctx = lock(&self.ctx);
            ctx.buffer = Arc::new(Vec::new());
            ctx.in_progress = false;
        }
        let detail = format!("v{version} installed");
        self.transition(OtaState::Success, ecu, Some(detail.as_str()));
        self.logger.log(
            Severity::Info,
            &format!("{} updated to v{version}", ecu.name()),
        );
        self.transition(OtaState::Idle, ecu, None);
        Ok(())
    }

    fn apply_inner(&self, ecu: EcuId, image: &[u8], version: u32) -> Result<(), OtaError> {
        self.platform.begin(image.len())?;
        for chunk in image.chunks(OTA_SEGMENT_SIZE) {
            self.platform.write(chunk)?;
        }
        self.platform.end()?;
        self.platform.set_boot_partition()?;

        {
            let mut config = lock(&self.config);
            config.set_installed_version(ecu, version);
        }
        self.update_config()
    }

    /// Persist the shared configuration record to `config.ini`.
    pub fn update_config(&self) -> Result<(), OtaError> {
        let snapshot = lock(&self.config).clone();
        self.config_file
            .save(&snapshot)
            .map_err(|e| OtaError::Config(e.to_string()))
    }

    /// Restore the previously installed image.
    ///
    /// Rollback success is tracked only through the notification channel;
    /// the call itself reports `true`.
    pub fn rollback_update(&self, ecu: EcuId) -> bool {
        {
            let mut ctx = lock(&self.ctx);
            ctx.rollback_in_progress = true;
        }
        self.transition(OtaState::Rollback, ecu, None);
        self.logger
            .log_alert(Severity::Warning, &format!("rolling back {}", ecu.name()));

        {
            let mut ctx = lock(&self.ctx);
            ctx.rollback_in_progress = false;
            ctx.in_progress = false;
            ctx.buffer = Arc::new(Vec::new());
        }
        self.transition(OtaState::Idle, ecu, None);
        true
    }

    /// Reset a failed pipeline back to `Idle` ahead of a retry.
    pub fn acknowledge_failure(&self, ecu: EcuId) {
        let failed = lock(&self.ctx).state == OtaState::Failure;
        if failed {
            self.transition(OtaState::Idle, ecu, None);
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    fn fail(&self, ecu: EcuId, error: &OtaError, clear_in_progress: bool) {
        if clear_in_progress {
            lock(&self.ctx).in_progress = false;
        }
        let detail = error.to_string();
        self.transition(OtaState::Failure, ecu, Some(detail.as_str()));
        self.logger.log_alert(
            Severity::Warning,
            &format!("OTA step failed for {}: {error}", ecu.name()),
        );
    }

    fn transition(&self, to: OtaState, ecu: EcuId, detail: Option<&str>) {
        {
            let mut ctx = lock(&self.ctx);
            let from = ctx.state;
            if from != to && !from.can_transition(to) {
                warn!(?from, ?to, "transition outside the documented graph");
            }
            ctx.state = to;
        }
        info!(state = ?to, ecu = ecu.name(), detail, "OTA transition");

        let observers = lock(&self.observers).clone();
        for observer in &observers {
            observer.on_transition(to, ecu, detail);
        }
    }
}
