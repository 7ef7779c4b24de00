//! # CAN Monitor Node Supervisor Binary
//!
//! Assembles the monitor runtime — CAN transport, diagnosis, alerting,
//! persistent logging, mesh routing and OTA — and runs the periodic task
//! set until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Run against the simulated bus and radio
//! canmon --config-dir config --simulate
//!
//! # Pick an explicit CAN driver and verbose logging
//! canmon -c config -d sim -v
//! ```

use canmon::{Connectivity, MonitorSupervisor, SimConnectivity, Subsystems};
use canmon_can::registry::DriverRegistry;
use canmon_can::{CanTransport, RxObserver};
use canmon_common::clock::{Clock, SystemClock};
use canmon_common::config::ConfigFile;
use canmon_common::consts::DEFAULT_CONFIG_FILE;
use canmon_diag::{AlertSink, DiagnosisEngine};
use canmon_logger::{ClockRtc, DirStorage, MemNvs, PersistentLogger, SdStorage};
use canmon_ota::{MqttClient, OtaOrchestrator, PlatformOta, SimMqtt, SimPlatformOta};
use canmon_routing::{MeshRadio, RoutingLayer, SimMeshRadio};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

/// CAN monitor node supervisor.
#[derive(Parser, Debug)]
#[command(name = "canmon")]
#[command(version)]
#[command(about = "Monitor node runtime: CAN transport, diagnosis, routing, OTA")]
#[command(long_about = None)]
struct Args {
    /// Directory holding config.ini
    #[arg(short = 'c', long, default_value = "config")]
    config_dir: PathBuf,

    /// Directory backing the SD card storage
    #[arg(long, default_value = "sdcard")]
    sd_dir: PathBuf,

    /// Force the simulation CAN driver
    #[arg(short = 's', long)]
    simulate: bool,

    /// CAN driver to load
    #[arg(short = 'd', long = "driver", default_value = "sim")]
    driver: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("monitor startup failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_tracing(&args);

    info!("🚀 canmon v{} starting", env!("CARGO_PKG_VERSION"));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Configuration file is the single source of truth for the knobs.
    std::fs::create_dir_all(&args.config_dir)?;
    let config_file = Arc::new(ConfigFile::new(args.config_dir.join(DEFAULT_CONFIG_FILE)));
    let config = Arc::new(Mutex::new(config_file.load_or_init()?));

    // Storage collaborators.
    let storage: Arc<DirStorage> = Arc::new(DirStorage::new(&args.sd_dir));
    let nvs = Arc::new(MemNvs::new());
    let rtc = Arc::new(ClockRtc::new(Arc::clone(&clock)));
    let logger = Arc::new(PersistentLogger::new(
        Arc::clone(&storage) as Arc<dyn SdStorage>,
        nvs,
        rtc,
    ));

    // CAN transport over the selected driver.
    let registry = DriverRegistry::with_builtin();
    let driver_name = if args.simulate { "sim" } else { args.driver.as_str() };
    let driver = registry.create_driver(driver_name)?;
    info!(driver = driver_name, "CAN driver selected");
    let transport = Arc::new(CanTransport::new(driver, Arc::clone(&clock)));

    // Diagnosis engine and alert sink.
    let engine = Arc::new(Mutex::new(DiagnosisEngine::new(
        Arc::clone(&transport),
        Arc::clone(&clock),
    )));
    let alerts = Arc::new(AlertSink::new(Arc::clone(&clock)));

    // Mesh routing over the simulated radio.
    let radio = Arc::new(SimMeshRadio::new());
    let routing = Arc::new(RoutingLayer::new(
        radio as Arc<dyn MeshRadio>,
        Arc::clone(&clock),
        Arc::clone(&config_file),
    ));

    // OTA orchestrator over the simulated MQTT client and platform.
    let mqtt = Arc::new(SimMqtt::new(Arc::clone(&storage) as Arc<dyn SdStorage>));
    let platform = Arc::new(SimPlatformOta::new());
    let ota = Arc::new(OtaOrchestrator::new(
        mqtt as Arc<dyn MqttClient>,
        Arc::clone(&storage) as Arc<dyn SdStorage>,
        platform as Arc<dyn PlatformOta>,
        Arc::clone(&routing),
        Arc::clone(&logger),
        Arc::clone(&config),
        Arc::clone(&config_file),
    ));

    // Frame sniffer: surface application-layer traffic in the log.
    struct FrameLog;
    impl RxObserver for FrameLog {
        fn on_frame(&self, frame: &canmon_can::CanFrame) {
            let (priority, module, command) = canmon_can::decode_id(frame.id);
            tracing::trace!(priority, module, command, dlc = frame.dlc, "rx frame");
        }
    }
    transport.register_rx_callback(Arc::new(FrameLog));

    let connectivity: Arc<dyn Connectivity> = Arc::new(SimConnectivity);
    let supervisor = MonitorSupervisor::new(
        clock,
        config_file,
        connectivity,
        Subsystems {
            transport,
            engine,
            alerts,
            logger,
            routing,
            ota,
            config,
        },
    );

    supervisor.init().await?;

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("🛑 received shutdown signal (Ctrl+C)"),
        Err(e) => error!("unable to listen for shutdown signal: {e}"),
    }

    supervisor.shutdown().await;
    info!("🏁 canmon shutdown complete");
    Ok(())
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
