//! Monitor configuration record and `config.ini` codec.
//!
//! The persisted configuration is a flat text file, one `KEY=VALUE` per
//! line, with `#`/`;` comments. It is the single source of truth for every
//! knob loaded at boot; runtime mutations write the file back under an
//! exclusive lock before reporting success.
//!
//! Parsing is a single pass that splits `KEY=VALUE`, trims whitespace and
//! dispatches through a key table. Unknown keys warn but do not fail, and
//! are preserved verbatim so a round-trip never loses foreign entries.

use crate::consts::*;
use crate::ecu::{ECU_COUNT, EcuId};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

/// Error type for configuration loading and persistence.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// A line or value could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Writing the file back failed.
    #[error("Failed to persist configuration: {0}")]
    WriteError(String),

    /// The exclusive file lock could not be taken.
    #[error("Failed to lock configuration file: {0}")]
    LockError(String),
}

// ─── Sub-records ───────────────────────────────────────────────────

/// OTA knobs: installed versions, update topics, check cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct OtaKnobs {
    /// Installed firmware version per ECU (indexed by [`EcuId::index`]).
    pub installed_versions: [u32; ECU_COUNT],
    /// MQTT update topic per ECU.
    pub topics: [String; ECU_COUNT],
    /// Cadence of the update check [ms].
    pub check_interval_ms: u64,
}

impl Default for OtaKnobs {
    fn default() -> Self {
        Self {
            installed_versions: [1; ECU_COUNT],
            topics: EcuId::ALL.map(|e| e.default_topic()),
            check_interval_ms: 60_000,
        }
    }
}

/// Routing knobs persisted as `ROUTING_*` keys.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutingKnobs {
    /// Cost assigned to recomputed single-hop routes.
    pub default_cost: u8,
    /// Route-miss recompute attempts before reporting failure.
    pub retry_count: u32,
    /// Delay between route-miss recompute attempts [ms].
    pub retry_delay_ms: u64,
}

impl Default for RoutingKnobs {
    fn default() -> Self {
        Self {
            default_cost: 1,
            retry_count: 3,
            retry_delay_ms: 100,
        }
    }
}

/// Diagnosis thresholds persisted as `DIAG_*` keys.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiagnosisKnobs {
    /// TX error counter threshold.
    pub tx_error_threshold: u32,
    /// RX error counter threshold.
    pub rx_error_threshold: u32,
    /// Bus-load threshold [%].
    pub bus_load_threshold: f64,
    /// Maximum-latency threshold [µs].
    pub max_latency_threshold_us: u64,
    /// Retransmission-count threshold.
    pub retrans_threshold: u64,
    /// Collision-count threshold.
    pub collision_threshold: u64,
}

impl Default for DiagnosisKnobs {
    fn default() -> Self {
        Self {
            tx_error_threshold: DEFAULT_TX_ERROR_THRESHOLD,
            rx_error_threshold: DEFAULT_RX_ERROR_THRESHOLD,
            bus_load_threshold: DEFAULT_BUS_LOAD_THRESHOLD,
            max_latency_threshold_us: DEFAULT_MAX_LATENCY_THRESHOLD_US,
            retrans_threshold: DEFAULT_RETRANS_THRESHOLD,
            collision_threshold: DEFAULT_COLLISION_THRESHOLD,
        }
    }
}

/// Logger knobs: RTC wiring and rotation size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoggerKnobs {
    /// RTC I²C SDA pin.
    pub rtc_sda: u8,
    /// RTC I²C SCL pin.
    pub rtc_scl: u8,
    /// RTC I²C port number.
    pub rtc_i2c_port: u8,
    /// Log file rotation size [bytes].
    pub max_log_file_size: u64,
}

impl Default for LoggerKnobs {
    fn default() -> Self {
        Self {
            rtc_sda: 21,
            rtc_scl: 22,
            rtc_i2c_port: 0,
            max_log_file_size: 1_048_576,
        }
    }
}

/// SD storage knobs: SPI wiring, rotation size and free-space floor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SdKnobs {
    /// SPI MOSI pin.
    pub mosi_pin: u8,
    /// SPI MISO pin.
    pub miso_pin: u8,
    /// SPI SCLK pin.
    pub sclk_pin: u8,
    /// SPI chip-select pin.
    pub cs_pin: u8,
    /// Rotation size for SD-resident log files [bytes].
    pub max_log_file_size: u64,
    /// Free-space floor below which the monitor worker raises a critical alert [bytes].
    pub free_space_threshold: u64,
}

impl Default for SdKnobs {
    fn default() -> Self {
        Self {
            mosi_pin: 23,
            miso_pin: 19,
            sclk_pin: 18,
            cs_pin: 5,
            max_log_file_size: 1_048_576,
            free_space_threshold: 1_048_576,
        }
    }
}

/// Supervisor timing knobs persisted as `MONITOR_*` keys.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorKnobs {
    /// Retry attempts per OTA step before rollback.
    pub max_retry_count: u32,
    /// Delay between OTA step retries [ms].
    pub retry_delay_ms: u64,
    /// Cadence of the configuration reload task [ms].
    pub config_check_interval_ms: u64,
    /// Maximum age of the last diagnosis persistence before a forced write [ms].
    pub diag_persist_interval_ms: u64,
    /// RX timeout used by the CAN acquisition task [ms].
    pub can_receive_timeout_ms: u64,
    /// Cadence of the diagnosis acquisition task [ms].
    pub diag_acq_interval_ms: u64,
    /// Cadence of the communication (route recompute) task [ms].
    pub comm_interval_ms: u64,
}

impl Default for MonitorKnobs {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            retry_delay_ms: 1_000,
            config_check_interval_ms: 300_000,
            diag_persist_interval_ms: 60_000,
            can_receive_timeout_ms: 10,
            diag_acq_interval_ms: 1_000,
            comm_interval_ms: 1_000,
        }
    }
}

// ─── MonitorConfig ─────────────────────────────────────────────────

/// The complete runtime configuration record, mirrored in `config.ini`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorConfig {
    /// OTA versions, topics and check cadence.
    pub ota: OtaKnobs,
    /// Routing cost/retry knobs.
    pub routing: RoutingKnobs,
    /// Diagnosis thresholds.
    pub diagnosis: DiagnosisKnobs,
    /// Logger RTC wiring and rotation size.
    pub logger: LoggerKnobs,
    /// SD storage wiring and thresholds.
    pub sd: SdKnobs,
    /// Supervisor timing knobs.
    pub monitor: MonitorKnobs,
    /// Keys this firmware does not consume, preserved for round-tripping.
    pub unknown: Vec<(String, String)>,
}

impl MonitorConfig {
    /// Installed firmware version for an ECU.
    #[inline]
    pub fn installed_version(&self, ecu: EcuId) -> u32 {
        self.ota.installed_versions[ecu.index()]
    }

    /// Record a newly installed firmware version for an ECU.
    #[inline]
    pub fn set_installed_version(&mut self, ecu: EcuId, version: u32) {
        self.ota.installed_versions[ecu.index()] = version;
    }

    /// MQTT update topic for an ECU.
    #[inline]
    pub fn topic(&self, ecu: EcuId) -> &str {
        &self.ota.topics[ecu.index()]
    }

    /// Parse a full `config.ini` text.
    ///
    /// Unknown keys warn and are retained; malformed lines fail the parse.
    pub fn parse_str(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                ConfigError::ParseError(format!("line {}: expected KEY=VALUE, got '{line}'", lineno + 1))
            })?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() {
                return Err(ConfigError::ParseError(format!("line {}: empty key", lineno + 1)));
            }

            if !config.apply_key(key, value)? {
                warn!("config: unknown key '{key}' (preserved)");
                config.unknown.push((key.to_string(), value.to_string()));
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Dispatch one `KEY=VALUE` pair. Returns `Ok(false)` for unknown keys.
    fn apply_key(&mut self, key: &str, value: &str) -> Result<bool, ConfigError> {
        // Per-ECU columns first.
        for ecu in EcuId::ALL {
            if key == format!("OTA_FIRMWARE_VERSION_{}", ecu.key_suffix()) {
                self.ota.installed_versions[ecu.index()] = parse_num(key, value)?;
                return Ok(true);
            }
            if key == format!("MQTT_TOPIC_{}", ecu.key_suffix()) {
                self.ota.topics[ecu.index()] = value.to_string();
                return Ok(true);
            }
        }

        match key {
            "OTA_CHECK_INTERVAL_MS" => self.ota.check_interval_ms = parse_num(key, value)?,

            "ROUTING_DEFAULT_COST" => self.routing.default_cost = parse_num(key, value)?,
            "ROUTING_RETRY_COUNT" => self.routing.retry_count = parse_num(key, value)?,
            "ROUTING_RETRY_DELAY_MS" => self.routing.retry_delay_ms = parse_num(key, value)?,

            "DIAG_TX_ERROR_THRESHOLD" => self.diagnosis.tx_error_threshold = parse_num(key, value)?,
            "DIAG_RX_ERROR_THRESHOLD" => self.diagnosis.rx_error_threshold = parse_num(key, value)?,
            "DIAG_BUS_LOAD_THRESHOLD" => self.diagnosis.bus_load_threshold = parse_num(key, value)?,
            "DIAG_MAX_LATENCY_US" => self.diagnosis.max_latency_threshold_us = parse_num(key, value)?,
            "DIAG_RETRANS_THRESHOLD" => self.diagnosis.retrans_threshold = parse_num(key, value)?,
            "DIAG_COLLISION_THRESHOLD" => self.diagnosis.collision_threshold = parse_num(key, value)?,

            "RTC_SDA" => self.logger.rtc_sda = parse_num(key, value)?,
            "RTC_SCL" => self.logger.rtc_scl = parse_num(key, value)?,
            "RTC_I2C_PORT" => self.logger.rtc_i2c_port = parse_num(key, value)?,
            "MAX_LOG_FILE_SIZE" => self.logger.max_log_file_size = parse_num(key, value)?,

            "mosi_pin" => self.sd.mosi_pin = parse_num(key, value)?,
            "miso_pin" => self.sd.miso_pin = parse_num(key, value)?,
            "sclk_pin" => self.sd.sclk_pin = parse_num(key, value)?,
            "cs_pin" => self.sd.cs_pin = parse_num(key, value)?,
            "max_log_file_size" => self.sd.max_log_file_size = parse_num(key, value)?,
            "free_space_threshold" => self.sd.free_space_threshold = parse_num(key, value)?,

            "MONITOR_MAX_RETRY_COUNT" => self.monitor.max_retry_count = parse_num(key, value)?,
            "MONITOR_RETRY_DELAY_MS" => self.monitor.retry_delay_ms = parse_num(key, value)?,
            "MONITOR_CONFIG_CHECK_INTERVAL_MS" => {
                self.monitor.config_check_interval_ms = parse_num(key, value)?
            }
            "MONITOR_DIAG_PERSIST_INTERVAL_MS" => {
                self.monitor.diag_persist_interval_ms = parse_num(key, value)?
            }
            "MONITOR_CAN_RECEIVE_TIMEOUT_MS" => {
                self.monitor.can_receive_timeout_ms = parse_num(key, value)?
            }
            "MONITOR_DIAG_ACQ_INTERVAL_MS" => {
                self.monitor.diag_acq_interval_ms = parse_num(key, value)?
            }
            "MONITOR_COMM_INTERVAL_MS" => self.monitor.comm_interval_ms = parse_num(key, value)?,

            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Render the record in canonical key order.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(1024);
        out.push_str("# CAN monitor node configuration\n");
        out.push_str("# Rewritten in place by the monitor at runtime.\n");

        out.push_str("\n# OTA\n");
        for ecu in EcuId::ALL {
            out.push_str(&format!(
                "OTA_FIRMWARE_VERSION_{}={}\n",
                ecu.key_suffix(),
                self.ota.installed_versions[ecu.index()]
            ));
        }
        for ecu in EcuId::ALL {
            out.push_str(&format!(
                "MQTT_TOPIC_{}={}\n",
                ecu.key_suffix(),
                self.ota.topics[ecu.index()]
            ));
        }
        out.push_str(&format!("OTA_CHECK_INTERVAL_MS={}\n", self.ota.check_interval_ms));

        out.push_str("\n# Routing\n");
        out.push_str(&format!("ROUTING_DEFAULT_COST={}\n", self.routing.default_cost));
        out.push_str(&format!("ROUTING_RETRY_COUNT={}\n", self.routing.retry_count));
        out.push_str(&format!("ROUTING_RETRY_DELAY_MS={}\n", self.routing.retry_delay_ms));

        out.push_str("\n# Diagnosis\n");
        out.push_str(&format!(
            "DIAG_TX_ERROR_THRESHOLD={}\n",
            self.diagnosis.tx_error_threshold
        ));
        out.push_str(&format!(
            "DIAG_RX_ERROR_THRESHOLD={}\n",
            self.diagnosis.rx_error_threshold
        ));
        out.push_str(&format!(
            "DIAG_BUS_LOAD_THRESHOLD={}\n",
            self.diagnosis.bus_load_threshold
        ));
        out.push_str(&format!(
            "DIAG_MAX_LATENCY_US={}\n",
            self.diagnosis.max_latency_threshold_us
        ));
        out.push_str(&format!("DIAG_RETRANS_THRESHOLD={}\n", self.diagnosis.retrans_threshold));
        out.push_str(&format!(
            "DIAG_COLLISION_THRESHOLD={}\n",
            self.diagnosis.collision_threshold
        ));

        out.push_str("\n# Logger\n");
        out.push_str(&format!("RTC_SDA={}\n", self.logger.rtc_sda));
        out.push_str(&format!("RTC_SCL={}\n", self.logger.rtc_scl));
        out.push_str(&format!("RTC_I2C_PORT={}\n", self.logger.rtc_i2c_port));
        out.push_str(&format!("MAX_LOG_FILE_SIZE={}\n", self.logger.max_log_file_size));

        out.push_str("\n# SD storage\n");
        out.push_str(&format!("mosi_pin={}\n", self.sd.mosi_pin));
        out.push_str(&format!("miso_pin={}\n", self.sd.miso_pin));
        out.push_str(&format!("sclk_pin={}\n", self.sd.sclk_pin));
        out.push_str(&format!("cs_pin={}\n", self.sd.cs_pin));
        out.push_str(&format!("max_log_file_size={}\n", self.sd.max_log_file_size));
        out.push_str(&format!("free_space_threshold={}\n", self.sd.free_space_threshold));

        out.push_str("\n# Supervisor\n");
        out.push_str(&format!("MONITOR_MAX_RETRY_COUNT={}\n", self.monitor.max_retry_count));
        out.push_str(&format!("MONITOR_RETRY_DELAY_MS={}\n", self.monitor.retry_delay_ms));
        out.push_str(&format!(
            "MONITOR_CONFIG_CHECK_INTERVAL_MS={}\n",
            self.monitor.config_check_interval_ms
        ));
        out.push_str(&format!(
            "MONITOR_DIAG_PERSIST_INTERVAL_MS={}\n",
            self.monitor.diag_persist_interval_ms
        ));
        out.push_str(&format!(
            "MONITOR_CAN_RECEIVE_TIMEOUT_MS={}\n",
            self.monitor.can_receive_timeout_ms
        ));
        out.push_str(&format!(
            "MONITOR_DIAG_ACQ_INTERVAL_MS={}\n",
            self.monitor.diag_acq_interval_ms
        ));
        out.push_str(&format!("MONITOR_COMM_INTERVAL_MS={}\n", self.monitor.comm_interval_ms));

        if !self.unknown.is_empty() {
            out.push_str("\n# Foreign keys (preserved)\n");
            for (k, v) in &self.unknown {
                out.push_str(&format!("{k}={v}\n"));
            }
        }

        out
    }

    /// Validate all fields against allowed bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.diagnosis.bus_load_threshold) {
            return Err(ConfigError::ValidationError(format!(
                "DIAG_BUS_LOAD_THRESHOLD={} out of range [0, 100]",
                self.diagnosis.bus_load_threshold
            )));
        }
        if !(1..=100).contains(&self.monitor.max_retry_count) {
            return Err(ConfigError::ValidationError(format!(
                "MONITOR_MAX_RETRY_COUNT={} out of range [1, 100]",
                self.monitor.max_retry_count
            )));
        }
        if self.monitor.diag_acq_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "MONITOR_DIAG_ACQ_INTERVAL_MS must be > 0".to_string(),
            ));
        }
        if self.monitor.comm_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "MONITOR_COMM_INTERVAL_MS must be > 0".to_string(),
            ));
        }
        if self.monitor.config_check_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "MONITOR_CONFIG_CHECK_INTERVAL_MS must be > 0".to_string(),
            ));
        }
        if self.ota.check_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "OTA_CHECK_INTERVAL_MS must be > 0".to_string(),
            ));
        }
        if self.routing.retry_count == 0 {
            return Err(ConfigError::ValidationError(
                "ROUTING_RETRY_COUNT must be > 0".to_string(),
            ));
        }
        if self.logger.max_log_file_size == 0 || self.sd.max_log_file_size == 0 {
            return Err(ConfigError::ValidationError(
                "log rotation size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a numeric value with a key-qualified error.
fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::ParseError(format!("{key}: invalid value '{value}'")))
}

// ─── ConfigFile ────────────────────────────────────────────────────

/// Handle to the on-disk `config.ini`.
///
/// All readers and writers of the file go through one shared instance, so
/// the in-process mutex serialises the runtime while the advisory `flock`
/// excludes other processes.
#[derive(Debug)]
pub struct ConfigFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ConfigFile {
    /// Create a handle for the given path. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and parse the file.
    pub fn load(&self) -> Result<MonitorConfig, ConfigError> {
        let _guard = self.lock.lock().map_err(|e| ConfigError::LockError(e.to_string()))?;
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(format!("{}: {e}", self.path.display()))
            }
        })?;
        MonitorConfig::parse_str(&text)
    }

    /// Load the file, or persist and return defaults when it does not exist.
    pub fn load_or_init(&self) -> Result<MonitorConfig, ConfigError> {
        match self.load() {
            Ok(config) => Ok(config),
            Err(ConfigError::FileNotFound) => {
                let config = MonitorConfig::default();
                self.save(&config)?;
                Ok(config)
            }
            Err(e) => Err(e),
        }
    }

    /// Rewrite the file from the record, in canonical order, under an
    /// exclusive advisory lock.
    pub fn save(&self, config: &MonitorConfig) -> Result<(), ConfigError> {
        use nix::fcntl::{Flock, FlockArg};

        let _guard = self.lock.lock().map_err(|e| ConfigError::LockError(e.to_string()))?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| ConfigError::WriteError(format!("{}: {e}", self.path.display())))?;

        let locked = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| ConfigError::LockError(errno.to_string()))?;

        locked
            .set_len(0)
            .map_err(|e| ConfigError::WriteError(e.to_string()))?;
        (&*locked)
            .write_all(config.render().as_bytes())
            .map_err(|e| ConfigError::WriteError(e.to_string()))?;
        (&*locked)
            .sync_all()
            .map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }

    /// Load the record, apply a mutation, validate and save it back.
    pub fn update<F>(&self, mutate: F) -> Result<MonitorConfig, ConfigError>
    where
        F: FnOnce(&mut MonitorConfig),
    {
        let mut config = self.load_or_init()?;
        mutate(&mut config);
        config.validate()?;
        self.save(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        MonitorConfig::default().validate().unwrap();
    }

    #[test]
    fn render_parse_roundtrip_preserves_values() {
        let mut config = MonitorConfig::default();
        config.set_installed_version(EcuId::Motor, 7);
        config.routing.retry_delay_ms = 250;
        config.diagnosis.bus_load_threshold = 75.5;
        config.monitor.can_receive_timeout_ms = 20;

        let parsed = MonitorConfig::parse_str(&config.render()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn render_is_byte_stable() {
        let config = MonitorConfig::default();
        let first = config.render();
        let reparsed = MonitorConfig::parse_str(&first).unwrap();
        assert_eq!(reparsed.render(), first);
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let text = "# comment\n; another\n\nROUTING_DEFAULT_COST=9\n";
        let config = MonitorConfig::parse_str(text).unwrap();
        assert_eq!(config.routing.default_cost, 9);
    }

    #[test]
    fn whitespace_is_trimmed() {
        let config = MonitorConfig::parse_str("  ROUTING_RETRY_COUNT =  7 \n").unwrap();
        assert_eq!(config.routing.retry_count, 7);
    }

    #[test]
    fn unknown_keys_are_preserved() {
        let config = MonitorConfig::parse_str("SOME_FUTURE_KNOB=42\n").unwrap();
        assert_eq!(config.unknown, vec![("SOME_FUTURE_KNOB".to_string(), "42".to_string())]);
        assert!(config.render().contains("SOME_FUTURE_KNOB=42\n"));
    }

    #[test]
    fn malformed_line_fails() {
        let result = MonitorConfig::parse_str("NOT A PAIR\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn bad_number_fails_with_key() {
        let result = MonitorConfig::parse_str("ROUTING_RETRY_COUNT=banana\n");
        match result {
            Err(ConfigError::ParseError(msg)) => assert!(msg.contains("ROUTING_RETRY_COUNT")),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn out_of_range_threshold_fails_validation() {
        let result = MonitorConfig::parse_str("DIAG_BUS_LOAD_THRESHOLD=150\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn per_ecu_columns_parse() {
        let text = "OTA_FIRMWARE_VERSION_BRAKE=4\nMQTT_TOPIC_BRAKE=fleet/brake\n";
        let config = MonitorConfig::parse_str(text).unwrap();
        assert_eq!(config.installed_version(EcuId::Brake), 4);
        assert_eq!(config.topic(EcuId::Brake), "fleet/brake");
    }

    #[test]
    fn save_then_load_reproduces_every_knob() {
        let dir = TempDir::new().unwrap();
        let file = ConfigFile::new(dir.path().join("config.ini"));

        let mut config = MonitorConfig::default();
        config.set_installed_version(EcuId::Steering, 3);
        config.monitor.retry_delay_ms = 500;
        config.unknown.push(("X_CUSTOM".to_string(), "yes".to_string()));

        file.save(&config).unwrap();
        let loaded = file.load().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn load_missing_file_is_file_not_found() {
        let dir = TempDir::new().unwrap();
        let file = ConfigFile::new(dir.path().join("missing.ini"));
        assert!(matches!(file.load(), Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn load_or_init_creates_defaults() {
        let dir = TempDir::new().unwrap();
        let file = ConfigFile::new(dir.path().join("config.ini"));
        let config = file.load_or_init().unwrap();
        assert_eq!(config, MonitorConfig::default());
        assert!(file.path().exists());
    }

    #[test]
    fn update_persists_mutation() {
        let dir = TempDir::new().unwrap();
        let file = ConfigFile::new(dir.path().join("config.ini"));
        file.load_or_init().unwrap();

        file.update(|c| c.set_installed_version(EcuId::Monitor, 2)).unwrap();
        assert_eq!(file.load().unwrap().installed_version(EcuId::Monitor), 2);
    }
}
