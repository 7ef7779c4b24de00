//! # OTA Integration Tests
//!
//! The full pipeline over simulated MQTT, storage, routing and platform
//! OTA: check → download → distribute → apply, the in-progress exclusion,
//! and rollback after terminal failure.

use canmon_common::clock::SystemClock;
use canmon_common::config::{ConfigFile, MonitorConfig};
use canmon_common::ecu::EcuId;
use canmon_logger::{ClockRtc, DirStorage, MemNvs, PersistentLogger, SdStorage};
use canmon_ota::{
    MqttClient, OtaError, OtaObserver, OtaOrchestrator, OtaState, OtaStep, SimMqtt,
    SimPlatformOta,
};
use canmon_routing::{MeshRadio, NeighbourEntry, RoutingLayer, SimMeshRadio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct Rig {
    mqtt: Arc<SimMqtt>,
    storage: Arc<DirStorage>,
    platform: Arc<SimPlatformOta>,
    radio: Arc<SimMeshRadio>,
    routing: Arc<RoutingLayer>,
    config: Arc<Mutex<MonitorConfig>>,
    config_file: Arc<ConfigFile>,
    ota: OtaOrchestrator,
    transitions: Arc<TransitionLog>,
}

#[derive(Default)]
struct TransitionLog(Mutex<Vec<OtaState>>);

impl OtaObserver for TransitionLog {
    fn on_transition(&self, state: OtaState, _ecu: EcuId, _detail: Option<&str>) {
        self.0.lock().unwrap().push(state);
    }
}

fn rig(dir: &TempDir) -> Rig {
    let clock = Arc::new(SystemClock);

    let storage = Arc::new(DirStorage::new(dir.path().join("sd")));
    let nvs = Arc::new(MemNvs::new());
    let logger = Arc::new(PersistentLogger::new(
        Arc::clone(&storage) as Arc<dyn SdStorage>,
        nvs,
        Arc::new(ClockRtc::new(clock.clone())),
    ));
    logger.init().unwrap();

    let config_file = Arc::new(ConfigFile::new(dir.path().join("config.ini")));
    let config = Arc::new(Mutex::new(config_file.load_or_init().unwrap()));

    let radio = Arc::new(SimMeshRadio::new());
    let routing = Arc::new(RoutingLayer::new(
        Arc::clone(&radio) as Arc<dyn MeshRadio>,
        clock,
        Arc::clone(&config_file),
    ));
    routing.init().unwrap();
    Arc::clone(&routing).start();

    let mqtt = Arc::new(SimMqtt::new(Arc::clone(&storage) as Arc<dyn SdStorage>));
    let platform = Arc::new(SimPlatformOta::new());

    let ota = OtaOrchestrator::new(
        Arc::clone(&mqtt) as Arc<dyn MqttClient>,
        Arc::clone(&storage) as Arc<dyn SdStorage>,
        Arc::clone(&platform) as Arc<dyn canmon_ota::PlatformOta>,
        Arc::clone(&routing),
        logger,
        Arc::clone(&config),
        Arc::clone(&config_file),
    );

    let transitions = Arc::new(TransitionLog::default());
    ota.register_status_callback(Arc::clone(&transitions) as Arc<dyn OtaObserver>)
        .unwrap();

    Rig {
        mqtt,
        storage,
        platform,
        radio,
        routing,
        config,
        config_file,
        ota,
        transitions,
    }
}

fn wait_for(deadline: Duration, predicate: impl Fn() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

#[test]
fn full_pipeline_updates_monitor_firmware() {
    let dir = TempDir::new().unwrap();
    let rig = rig(&dir);

    // Advertised v2 over installed v1, 2500-byte image.
    let topic = rig.config.lock().unwrap().topic(EcuId::Monitor).to_string();
    let image: Vec<u8> = (0..2_500u32).map(|i| (i % 256) as u8).collect();
    rig.mqtt.advertise(&topic, 2);
    rig.mqtt.set_firmware(&topic, image.clone());

    // The monitor ECU is reachable as a neighbour.
    rig.routing.update_topology(&[NeighbourEntry::named("monitor_ecu")]);
    rig.routing.recalculate_routes();

    assert!(rig.ota.check_update().unwrap());
    assert_eq!(rig.ota.state(), OtaState::UpdateAvailable);

    rig.ota.download_firmware(EcuId::Monitor).unwrap();
    assert!(
        rig.storage.read("firmware_monitor_ecu_v2.bin").unwrap() == image,
        "canonical firmware file should land on the SD card"
    );

    rig.ota.distribute_firmware(EcuId::Monitor).unwrap();
    assert!(
        wait_for(Duration::from_secs(2), || rig.radio.sent().len() == 3),
        "2500 bytes should travel as 3 unicast segments"
    );
    let sent = rig.radio.sent();
    assert_eq!(sent[0].1.len(), 1_024);
    assert_eq!(sent[1].1.len(), 1_024);
    assert_eq!(sent[2].1.len(), 452);
    assert!(sent.iter().all(|(hop, _)| hop == "monitor_ecu"));

    rig.ota.apply_update(EcuId::Monitor).unwrap();
    assert_eq!(rig.platform.written(), image);
    assert!(rig.platform.boot_set());
    assert_eq!(rig.ota.state(), OtaState::Idle);
    assert!(!rig.ota.in_progress());

    // Installed version updated in memory and persisted to config.ini.
    assert_eq!(rig.config.lock().unwrap().installed_version(EcuId::Monitor), 2);
    let persisted = rig.config_file.load().unwrap();
    assert_eq!(persisted.installed_version(EcuId::Monitor), 2);

    assert_eq!(
        *rig.transitions.0.lock().unwrap(),
        vec![
            OtaState::UpdateAvailable,
            OtaState::Downloading,
            OtaState::Distributing,
            OtaState::Applying,
            OtaState::Success,
            OtaState::Idle,
        ]
    );

    rig.routing.shutdown();
}

#[test]
fn check_update_ignores_stale_versions() {
    let dir = TempDir::new().unwrap();
    let rig = rig(&dir);

    let topic = rig.config.lock().unwrap().topic(EcuId::Monitor).to_string();
    rig.mqtt.advertise(&topic, 1); // equal to installed

    assert!(!rig.ota.check_update().unwrap());
    assert_eq!(rig.ota.state(), OtaState::Idle);

    rig.routing.shutdown();
}

#[test]
fn second_update_is_refused_while_first_is_alive() {
    let dir = TempDir::new().unwrap();
    let rig = rig(&dir);

    let topic = rig.config.lock().unwrap().topic(EcuId::Motor).to_string();
    rig.mqtt.advertise(&topic, 5);
    rig.mqtt.set_firmware(&topic, vec![9u8; 100]);

    rig.ota.download_firmware(EcuId::Motor).unwrap();
    assert!(rig.ota.in_progress());

    assert!(matches!(
        rig.ota.download_firmware(EcuId::Brake),
        Err(OtaError::UpdateInProgress)
    ));

    rig.routing.shutdown();
}

#[test]
fn download_failure_clears_in_progress() {
    let dir = TempDir::new().unwrap();
    let rig = rig(&dir);

    // No advertisement and no firmware on the brake topic.
    let result = rig.ota.download_firmware(EcuId::Brake);
    assert!(matches!(result, Err(OtaError::Mqtt(_))));
    assert_eq!(rig.ota.state(), OtaState::Failure);
    assert!(!rig.ota.in_progress());

    // Acknowledging returns to Idle so a retry can re-enter.
    rig.ota.acknowledge_failure(EcuId::Brake);
    assert_eq!(rig.ota.state(), OtaState::Idle);

    rig.routing.shutdown();
}

#[test]
fn distribute_without_route_fails_pipeline() {
    let dir = TempDir::new().unwrap();
    let rig = rig(&dir);

    // Shrink the fallback so the miss resolves quickly.
    let knobs = canmon_common::config::RoutingKnobs {
        default_cost: 1,
        retry_count: 1,
        retry_delay_ms: 10,
    };
    assert!(rig.routing.set_config(&knobs));

    let topic = rig.config.lock().unwrap().topic(EcuId::Steering).to_string();
    rig.mqtt.advertise(&topic, 2);
    rig.mqtt.set_firmware(&topic, vec![3u8; 64]);

    rig.ota.download_firmware(EcuId::Steering).unwrap();
    let result = rig.ota.distribute_firmware(EcuId::Steering);
    assert!(matches!(result, Err(OtaError::Distribute(_))));
    assert_eq!(rig.ota.state(), OtaState::Failure);

    rig.routing.shutdown();
}

#[test]
fn apply_failure_then_rollback_returns_to_idle() {
    let dir = TempDir::new().unwrap();
    let rig = rig(&dir);

    let topic = rig.config.lock().unwrap().topic(EcuId::Monitor).to_string();
    rig.mqtt.advertise(&topic, 3);
    rig.mqtt.set_firmware(&topic, vec![1u8; 2_048]);
    rig.routing.update_topology(&[NeighbourEntry::named("monitor_ecu")]);
    rig.routing.recalculate_routes();

    rig.platform.fail_at(OtaStep::SetBoot);

    rig.ota.download_firmware(EcuId::Monitor).unwrap();
    rig.ota.distribute_firmware(EcuId::Monitor).unwrap();
    assert!(matches!(
        rig.ota.apply_update(EcuId::Monitor),
        Err(OtaError::Apply(_))
    ));
    assert_eq!(rig.ota.state(), OtaState::Failure);

    assert!(rig.ota.rollback_update(EcuId::Monitor));
    assert_eq!(rig.ota.state(), OtaState::Idle);
    assert!(!rig.ota.in_progress());
    assert!(!rig.ota.rollback_in_progress());

    // Installed version unchanged on disk after the failed run.
    assert_eq!(rig.config_file.load().unwrap().installed_version(EcuId::Monitor), 1);

    let log = rig.transitions.0.lock().unwrap();
    let tail: Vec<OtaState> = log.iter().rev().take(2).rev().copied().collect();
    assert_eq!(tail, vec![OtaState::Rollback, OtaState::Idle]);

    rig.routing.shutdown();
}

#[test]
fn distribute_requires_a_downloaded_image() {
    let dir = TempDir::new().unwrap();
    let rig = rig(&dir);

    assert!(matches!(
        rig.ota.distribute_firmware(EcuId::Monitor),
        Err(OtaError::NullInput(_))
    ));

    rig.routing.shutdown();
}
