use clap::{App, Arg};
use obu::bridge::{self, Bridge};
use obu::fault_injection::FaultInjectionConfig;
use obu::protocol::device;
use obu::subsystems::{BrakeUnit, DeviceManager, SteerUnit, UnitController};
use obu::{BusAdapter, LoopbackBus, Mode, ObuConfig, ObuStatus, OnboardUnit, SimulatedMotor};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Resolves once the supervisor has reached Off on its own.
async fn supervisor_off(mut status: watch::Receiver<ObuStatus>) {
    loop {
        if status.borrow_and_update().mode == Mode::Off {
            return;
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("obu")
        .version("0.1.0")
        .author("Vehicle Systems Engineering Team")
        .about("On-board unit supervisor on a simulated vehicle bus")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Operator bridge port")
                .takes_value(true)
                .default_value("8090"),
        )
        .arg(
            Arg::with_name("fault-rate")
                .long("fault-rate")
                .value_name("PERCENT")
                .help("Transient motor write fault rate")
                .takes_value(true)
                .default_value("0")
                .validator(|v| match v.parse::<f32>() {
                    Ok(rate) if (0.0..=100.0).contains(&rate) => Ok(()),
                    _ => Err("fault rate must be between 0 and 100".into()),
                }),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Debug logging"),
        )
        .get_matches();

    let default_level = if matches.is_present("verbose") { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = match matches.value_of("config") {
        Some(path) => ObuConfig::load(Path::new(path))?,
        None => ObuConfig::default(),
    };
    let port: u16 = matches.value_of("port").unwrap_or("8090").parse()?;
    let fault_rate: f32 = matches.value_of("fault-rate").unwrap_or("0").parse()?;

    println!("🚗 On-Board Unit Supervisor");
    println!("===========================");

    let registry = Arc::new(config.load_registry()?);
    let bus = LoopbackBus::new();

    let obu_node = BusAdapter::on_loopback(&config.device_name, Arc::clone(&registry), &bus)?;
    let brake_node = BusAdapter::on_loopback(device::BRAKE, Arc::clone(&registry), &bus)?;
    let steer_node = BusAdapter::on_loopback(device::STEER, Arc::clone(&registry), &bus)?;
    let operator_node = BusAdapter::on_loopback(device::OPERATOR, Arc::clone(&registry), &bus)?;

    let brake_units: Vec<Box<dyn UnitController>> = vec![Box::new(BrakeUnit::new(&config.brake))];
    let steer_units: Vec<Box<dyn UnitController>> = vec![Box::new(SteerUnit::new())];
    let brake_task = tokio::spawn(DeviceManager::new(Arc::clone(&brake_node), brake_units).run());
    let steer_task = tokio::spawn(DeviceManager::new(Arc::clone(&steer_node), steer_units).run());

    let motor = SimulatedMotor::with_faults(
        config.actuator.max_torque,
        FaultInjectionConfig {
            enabled: fault_rate > 0.0,
            write_fault_rate_percent: fault_rate,
            ..FaultInjectionConfig::default()
        },
    );
    let handle = OnboardUnit::new(config, obu_node, Some(Box::new(motor)))?.spawn();

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let bridge = Bridge::new(Arc::clone(&operator_node), handle.subscribe(), shutdown_tx)
        .with_traffic(Arc::clone(&bus));
    let bridge_task = tokio::spawn(async move {
        if let Err(err) = bridge.bind(addr).await {
            error!(%err, "bridge stopped");
        }
    });
    info!(%addr, default_port = bridge::DEFAULT_PORT, "operator bridge started");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(%err, "ctrl-c handler failed");
            }
            info!("interrupt received");
        }
        _ = shutdown_rx.recv() => info!("shutdown requested by operator"),
        _ = supervisor_off(handle.subscribe()) => info!("supervisor reached off"),
    }

    if let Err(err) = handle.shutdown().await {
        error!(%err, "supervisor task failed");
    }
    operator_node.shutdown();
    brake_node.shutdown();
    steer_node.shutdown();
    for (name, task) in [("brake", brake_task), ("steer", steer_task)] {
        match task.await {
            Ok(exit) => info!(node = name, ?exit, "unit node exited"),
            Err(err) => error!(node = name, %err, "unit node failed"),
        }
    }
    bridge_task.abort();

    println!("🛑 On-board unit stopped");
    Ok(())
}
