//! # Supervisor Integration Tests
//!
//! Full bring-up over the simulated collaborators: the init/shutdown
//! lifecycle, frame acquisition, and the OTA cycle with its bounded
//! per-step retry and rollback-on-exhaustion policy.

use canmon::{
    Connectivity, MonitorSupervisor, SimConnectivity, Subsystems, SupervisorError,
    SupervisorStats, run_ota_cycle,
};
use canmon_can::sim::SimCanDriver;
use canmon_can::{CanFrame, CanTransport};
use canmon_common::clock::{Clock, SystemClock};
use canmon_common::config::ConfigFile;
use canmon_common::ecu::EcuId;
use canmon_diag::{AlertSink, DiagnosisEngine};
use canmon_logger::{ClockRtc, DirStorage, MemNvs, PersistentLogger, SdStorage};
use canmon_ota::{
    MqttClient, OtaOrchestrator, OtaState, OtaStep, PlatformOta, SimMqtt, SimPlatformOta,
};
use canmon_routing::{MeshRadio, NeighbourEntry, RoutingLayer, SimMeshRadio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct Rig {
    driver: Arc<SimCanDriver>,
    mqtt: Arc<SimMqtt>,
    platform: Arc<SimPlatformOta>,
    radio: Arc<SimMeshRadio>,
    config_file: Arc<ConfigFile>,
    supervisor: MonitorSupervisor,
}

fn rig(dir: &TempDir, connectivity: Arc<dyn Connectivity>) -> Rig {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let config_file = Arc::new(ConfigFile::new(dir.path().join("config.ini")));
    let config = Arc::new(Mutex::new(config_file.load_or_init().unwrap()));

    let storage = Arc::new(DirStorage::new(dir.path().join("sd")));
    let nvs = Arc::new(MemNvs::new());
    let logger = Arc::new(PersistentLogger::new(
        Arc::clone(&storage) as Arc<dyn SdStorage>,
        nvs,
        Arc::new(ClockRtc::new(Arc::clone(&clock))),
    ));

    let driver = Arc::new(SimCanDriver::new());
    let transport = Arc::new(CanTransport::new(
        Arc::clone(&driver) as Arc<dyn canmon_can::driver::CanDriver>,
        Arc::clone(&clock),
    ));

    let engine = Arc::new(Mutex::new(DiagnosisEngine::new(
        Arc::clone(&transport),
        Arc::clone(&clock),
    )));
    let alerts = Arc::new(AlertSink::new(Arc::clone(&clock)));

    let radio = Arc::new(SimMeshRadio::new());
    let routing = Arc::new(RoutingLayer::new(
        Arc::clone(&radio) as Arc<dyn MeshRadio>,
        Arc::clone(&clock),
        Arc::clone(&config_file),
    ));

    let mqtt = Arc::new(SimMqtt::new(Arc::clone(&storage) as Arc<dyn SdStorage>));
    let platform = Arc::new(SimPlatformOta::new());
    let ota = Arc::new(OtaOrchestrator::new(
        Arc::clone(&mqtt) as Arc<dyn MqttClient>,
        Arc::clone(&storage) as Arc<dyn SdStorage>,
        Arc::clone(&platform) as Arc<dyn PlatformOta>,
        Arc::clone(&routing),
        Arc::clone(&logger),
        Arc::clone(&config),
        Arc::clone(&config_file),
    ));

    let supervisor = MonitorSupervisor::new(
        clock,
        Arc::clone(&config_file),
        connectivity,
        Subsystems {
            transport,
            engine,
            alerts,
            logger,
            routing,
            ota: Arc::clone(&ota),
            config,
        },
    );

    Rig {
        driver,
        mqtt,
        platform,
        radio,
        config_file,
        supervisor,
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

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn init_acquires_frames_then_shuts_down() {
    let dir = TempDir::new().unwrap();
    let rig = rig(&dir, Arc::new(SimConnectivity));

    rig.supervisor.init().await.expect("supervisor init");

    // The acquisition task maintains the shared millisecond timestamp.
    assert!(
        wait_for(Duration::from_secs(2), || rig.supervisor.current_time_ms() > 0),
        "current_time_ms should be maintained"
    );

    rig.driver.inject_rx(CanFrame::new(0x0401_0101, &[1, 2, 3]).unwrap());
    assert!(
        wait_for(Duration::from_secs(2), || {
            rig.supervisor
                .stats()
                .frames_seen
                .load(std::sync::atomic::Ordering::Relaxed)
                > 0
        }),
        "injected frame should be drained by the acquisition task"
    );

    rig.supervisor.shutdown().await;

    // The final config save leaves the file in place.
    assert!(rig.config_file.path().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_connectivity_aborts_init() {
    struct BrokenConnectivity;
    impl Connectivity for BrokenConnectivity {
        fn bring_up(&self) -> Result<(), SupervisorError> {
            Err(SupervisorError::Init("no radio hardware".to_string()))
        }
        fn shut_down(&self) {}
    }

    let dir = TempDir::new().unwrap();
    let rig = rig(&dir, Arc::new(BrokenConnectivity));

    let result = rig.supervisor.init().await;
    assert!(matches!(result, Err(SupervisorError::Init(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ota_cycle_completes_update_with_retries() {
    let dir = TempDir::new().unwrap();
    let rig = rig(&dir, Arc::new(SimConnectivity));
    rig.supervisor.init().await.expect("supervisor init");

    // Monitor ECU reachable; v2 advertised over installed v1.
    let topic = EcuId::Monitor.default_topic();
    let image = vec![0x5A; 2_048];
    rig.mqtt.advertise(&topic, 2);
    rig.mqtt.set_firmware(&topic, image.clone());
    let routing = rig.supervisor_routing();
    routing.update_topology(&[NeighbourEntry::named("monitor_ecu")]);
    routing.recalculate_routes();

    let stats = SupervisorStats::default();
    let ota = rig.supervisor_ota();
    tokio::task::spawn_blocking(move || {
        run_ota_cycle(&ota, 3, Duration::from_millis(10), &stats);
        assert_eq!(stats.ota_runs.load(std::sync::atomic::Ordering::Relaxed), 1);
    })
    .await
    .unwrap();

    assert!(wait_for(Duration::from_secs(2), || rig.radio.sent().len() == 2));
    assert_eq!(rig.platform.written(), image);
    assert_eq!(rig.config_file.load().unwrap().installed_version(EcuId::Monitor), 2);

    rig.supervisor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ota_retry_exhaustion_rolls_back() {
    let dir = TempDir::new().unwrap();
    let rig = rig(&dir, Arc::new(SimConnectivity));
    rig.supervisor.init().await.expect("supervisor init");

    let topic = EcuId::Monitor.default_topic();
    rig.mqtt.advertise(&topic, 2);
    rig.mqtt.set_firmware(&topic, vec![1u8; 512]);
    let routing = rig.supervisor_routing();
    routing.update_topology(&[NeighbourEntry::named("monitor_ecu")]);
    routing.recalculate_routes();

    // Every apply attempt fails at the boot-partition switch.
    rig.platform.fail_at(OtaStep::SetBoot);

    let stats = SupervisorStats::default();
    let ota = rig.supervisor_ota();
    let state_after = tokio::task::spawn_blocking(move || {
        run_ota_cycle(&ota, 2, Duration::from_millis(10), &stats);
        ota.state()
    })
    .await
    .unwrap();

    assert_eq!(state_after, OtaState::Idle);
    // The installed version was never bumped.
    assert_eq!(rig.config_file.load().unwrap().installed_version(EcuId::Monitor), 1);

    rig.supervisor.shutdown().await;
}

impl Rig {
    fn supervisor_routing(&self) -> Arc<RoutingLayer> {
        Arc::clone(&self.supervisor_subsystems().routing)
    }

    fn supervisor_ota(&self) -> Arc<OtaOrchestrator> {
        Arc::clone(&self.supervisor_subsystems().ota)
    }

    fn supervisor_subsystems(&self) -> &Subsystems {
        self.supervisor.subsystems()
    }
}
