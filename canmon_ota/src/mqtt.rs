//! MQTT and platform-OTA collaborator traits, with simulation doubles.
//!
//! The MQTT collaborator advertises firmware versions per topic and can
//! download an image to the SD card under a caller-chosen file name. The
//! platform OTA collaborator commits an image through the usual
//! begin → write → end → set-boot sequence.

use crate::error::OtaError;
use canmon_logger::SdStorage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Interface to the fleet MQTT client.
pub trait MqttClient: Send + Sync {
    /// Subscribe to a topic.
    fn subscribe(&self, topic: &str) -> Result<(), OtaError>;

    /// Publish a payload on a topic.
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), OtaError>;

    /// Latest firmware version advertised on an update topic.
    fn get_update_version(&self, topic: &str) -> Result<u32, OtaError>;

    /// Download the topic's firmware image to the SD card as `filename`.
    fn download_file(&self, topic: &str, filename: &str) -> Result<(), OtaError>;
}

/// Interface to the platform's OTA commit mechanism.
pub trait PlatformOta: Send + Sync {
    /// Open an update of `size` bytes.
    fn begin(&self, size: usize) -> Result<(), OtaError>;

    /// Write the next chunk of the image.
    fn write(&self, chunk: &[u8]) -> Result<(), OtaError>;

    /// Finalise and verify the image.
    fn end(&self) -> Result<(), OtaError>;

    /// Mark the new image as the boot target.
    fn set_boot_partition(&self) -> Result<(), OtaError>;
}

// ─── Simulation doubles ────────────────────────────────────────────

/// In-process MQTT client backed by maps of advertised versions and
/// firmware images.
pub struct SimMqtt {
    storage: Arc<dyn SdStorage>,
    advertised: Mutex<HashMap<String, u32>>,
    firmware: Mutex<HashMap<String, Vec<u8>>>,
    subscriptions: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl SimMqtt {
    /// Create a client writing downloads to the given storage.
    pub fn new(storage: Arc<dyn SdStorage>) -> Self {
        Self {
            storage,
            advertised: Mutex::new(HashMap::new()),
            firmware: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        }
    }

    /// Advertise a firmware version on a topic.
    pub fn advertise(&self, topic: &str, version: u32) {
        self.advertised
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(topic.to_string(), version);
    }

    /// Provide the firmware image served for a topic.
    pub fn set_firmware(&self, topic: &str, image: Vec<u8>) {
        self.firmware
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(topic.to_string(), image);
    }

    /// Payloads published so far (test hook).
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl MqttClient for SimMqtt {
    fn subscribe(&self, topic: &str) -> Result<(), OtaError> {
        debug!(topic, "sim mqtt subscribe");
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(topic.to_string());
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), OtaError> {
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn get_update_version(&self, topic: &str) -> Result<u32, OtaError> {
        self.advertised
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(topic)
            .copied()
            .ok_or_else(|| OtaError::Mqtt(format!("no advertised version on '{topic}'")))
    }

    fn download_file(&self, topic: &str, filename: &str) -> Result<(), OtaError> {
        let image = self
            .firmware
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(topic)
            .cloned()
            .ok_or_else(|| OtaError::Mqtt(format!("no firmware on '{topic}'")))?;
        self.storage.write(filename, &image)?;
        debug!(topic, filename, bytes = image.len(), "sim mqtt download");
        Ok(())
    }
}

/// Which platform OTA step a simulated failure targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaStep {
    /// `begin` fails.
    Begin,
    /// `write` fails.
    Write,
    /// `end` fails.
    End,
    /// `set_boot_partition` fails.
    SetBoot,
}

/// In-process platform OTA recording the committed image.
#[derive(Default)]
pub struct SimPlatformOta {
    begun: AtomicBool,
    boot_set: AtomicBool,
    written: Mutex<Vec<u8>>,
    fail_at: Mutex<Option<OtaStep>>,
}

impl SimPlatformOta {
    /// Create a platform that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make one pipeline step fail (test hook).
    pub fn fail_at(&self, step: OtaStep) {
        *self.fail_at.lock().unwrap_or_else(|p| p.into_inner()) = Some(step);
    }

    /// The image committed so far.
    pub fn written(&self) -> Vec<u8> {
        self.written
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Whether the boot partition was switched.
    pub fn boot_set(&self) -> bool {
        self.boot_set.load(Ordering::SeqCst)
    }

    fn check(&self, step: OtaStep, what: &str) -> Result<(), OtaError> {
        if *self.fail_at.lock().unwrap_or_else(|p| p.into_inner()) == Some(step) {
            return Err(OtaError::Apply(format!("simulated {what} failure")));
        }
        Ok(())
    }
}

impl PlatformOta for SimPlatformOta {
    fn begin(&self, size: usize) -> Result<(), OtaError> {
        self.check(OtaStep::Begin, "begin")?;
        debug!(size, "sim ota begin");
        self.begun.store(true, Ordering::SeqCst);
        self.written.lock().unwrap_or_else(|p| p.into_inner()).clear();
        Ok(())
    }

    fn write(&self, chunk: &[u8]) -> Result<(), OtaError> {
        self.check(OtaStep::Write, "write")?;
        if !self.begun.load(Ordering::SeqCst) {
            return Err(OtaError::Apply("write before begin".to_string()));
        }
        self.written
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(chunk);
        Ok(())
    }

    fn end(&self) -> Result<(), OtaError> {
        self.check(OtaStep::End, "end")?;
        self.begun.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_boot_partition(&self) -> Result<(), OtaError> {
        self.check(OtaStep::SetBoot, "set_boot")?;
        self.boot_set.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canmon_logger::DirStorage;
    use tempfile::TempDir;

    #[test]
    fn sim_mqtt_download_writes_to_storage() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(DirStorage::new(dir.path()));
        storage.init().unwrap();

        let mqtt = SimMqtt::new(storage.clone());
        mqtt.advertise("fleet/motor", 3);
        mqtt.set_firmware("fleet/motor", vec![1, 2, 3, 4]);

        assert_eq!(mqtt.get_update_version("fleet/motor").unwrap(), 3);
        mqtt.download_file("fleet/motor", "fw.bin").unwrap();
        assert_eq!(storage.read("fw.bin").unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn unadvertised_topic_errors() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(DirStorage::new(dir.path()));
        storage.init().unwrap();
        let mqtt = SimMqtt::new(storage);
        assert!(matches!(
            mqtt.get_update_version("fleet/ghost"),
            Err(OtaError::Mqtt(_))
        ));
    }

    #[test]
    fn platform_pipeline_accumulates_image() {
        let platform = SimPlatformOta::new();
        platform.begin(6).unwrap();
        platform.write(&[1, 2, 3]).unwrap();
        platform.write(&[4, 5, 6]).unwrap();
        platform.end().unwrap();
        platform.set_boot_partition().unwrap();

        assert_eq!(platform.written(), vec![1, 2, 3, 4, 5, 6]);
        assert!(platform.boot_set());
    }

    #[test]
    fn scripted_step_failure_fires() {
        let platform = SimPlatformOta::new();
        platform.fail_at(OtaStep::End);
        platform.begin(1).unwrap();
        platform.write(&[9]).unwrap();
        assert!(matches!(platform.end(), Err(OtaError::Apply(_))));
    }
}
