use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use motion_compensation_rs::config::ServerConfig;
use motion_compensation_rs::ipc::{default_namespace, ControlHandler, IpcServer};
use motion_compensation_rs::simulator::{
    pose_loop, MotionPlatformSimulator, PlatformMotion, SIM_HMD_ID, SIM_INTERFACE_VERSION,
    SIM_TRACKER_ID,
};
use motion_compensation_rs::{CompensationDriver, CompensationMode};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

#[derive(Parser, Debug)]
#[command(name = "motion_compensation")]
#[command(about = "Motion compensation driver running against a simulated motion platform", long_about = None)]
struct Args {
    /// Duration in seconds (0 = continuous)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// Driver config file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pose rate [Hz]
    #[arg(long, default_value = "250")]
    rate: f64,

    /// Compensate the HMD against the simulated tracker right away
    #[arg(long)]
    auto_arm: bool,

    /// Status file (overrides the config)
    #[arg(long)]
    status_path: Option<PathBuf>,
}

#[derive(Default)]
struct Residual {
    sum_sq: f64,
    peak: f64,
    count: u64,
}

impl Residual {
    fn add(&mut self, error: f64) {
        self.sum_sq += error * error;
        self.peak = self.peak.max(error);
        self.count += 1;
    }

    fn rms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum_sq / self.count as f64).sqrt()
        }
    }
}

fn start_server(config: &ServerConfig, handler: Arc<dyn ControlHandler>) -> Result<IpcServer> {
    let namespace = default_namespace(&config.queue_dir).context("creating queue namespace")?;
    let server = IpcServer::start(namespace, config, handler).context("starting IPC server")?;
    Ok(server)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if args.status_path.is_some() {
        config.status_path = args.status_path.clone();
    }

    log::info!("Motion compensation driver starting");
    log::info!("  Duration: {} seconds (0=continuous)", args.duration);
    log::info!("  Pose rate: {} Hz", args.rate);
    log::info!("  Queue: {} in {}", config.queue_name, config.queue_dir.display());

    let driver = Arc::new(CompensationDriver::new(config.parameters));
    let handler: Arc<dyn ControlHandler> = driver.clone();
    let mut server = match start_server(&config, handler) {
        Ok(server) => Some(server),
        Err(e) => {
            log::error!("IPC unavailable, running without remote control: {:#}", e);
            None
        }
    };
    let ipc_clients = |server: &Option<IpcServer>| server.as_ref().map_or(0, |s| s.client_count());

    for (device_id, serial, device_class) in MotionPlatformSimulator::devices() {
        driver.device_added(device_id, serial, device_class)?;
        log::info!("Device {} attached: {} ({:?})", device_id, serial, device_class);
    }
    if args.auto_arm {
        driver.set_compensation_mode(SIM_HMD_ID, SIM_TRACKER_ID, CompensationMode::ReferenceTracker)?;
    }

    let simulator = MotionPlatformSimulator::new(PlatformMotion::default());
    let expected = simulator.clone();
    let (pose_tx, mut pose_rx) = mpsc::channel(64);
    let _pose_handle = tokio::spawn(pose_loop(pose_tx, simulator, args.rate));

    let mut status_timer = interval(Duration::from_millis(config.status_interval_ms.max(10)));
    let mut report_timer = interval(Duration::from_secs(5));
    let mut residual = Residual::default();
    let mut batches = 0u64;
    let start = Utc::now();

    loop {
        if args.duration > 0 {
            let elapsed = Utc::now().signed_duration_since(start);
            if elapsed.num_seconds() as u64 >= args.duration {
                log::info!("Duration reached, stopping...");
                break;
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, stopping...");
                break;
            }
            batch = pose_rx.recv() => {
                let Some(batch) = batch else {
                    log::warn!("Pose source stopped");
                    break;
                };
                batches += 1;
                for (device_id, mut sample) in batch {
                    driver.pose_updated(SIM_INTERFACE_VERSION, device_id, &mut sample);
                    // residual only means something when the zero pose was taken on the first batch
                    if args.auto_arm && device_id == SIM_HMD_ID && driver.engine().is_reference_valid() {
                        let (position, _) = expected.expected_hmd(sample.timestamp);
                        residual.add((sample.position - position).norm());
                    }
                }
            }
            _ = status_timer.tick() => {
                if let Some(path) = &config.status_path {
                    let status = driver.status().with_ipc_clients(ipc_clients(&server));
                    if let Err(e) = status.save(path) {
                        log::warn!("Failed to write status {}: {}", path.display(), e);
                    }
                }
            }
            _ = report_timer.tick() => {
                let snapshot = driver.engine().snapshot();
                log::info!(
                    "{} batches | mode {:?} | reference valid: {} | compensated {} | residual rms {:.2} mm peak {:.2} mm",
                    batches,
                    snapshot.mode,
                    snapshot.reference_valid,
                    snapshot.compensated_samples,
                    residual.rms() * 1000.0,
                    residual.peak * 1000.0
                );
            }
        }
    }

    if let Some(path) = &config.status_path {
        let status = driver.status().with_ipc_clients(ipc_clients(&server));
        match status.save(path) {
            Ok(()) => log::info!("Final status written to {}", path.display()),
            Err(e) => log::warn!("Failed to write final status {}: {}", path.display(), e),
        }
    }
    if let Some(server) = server.as_mut() {
        server.shutdown();
    }
    log::info!(
        "Stopped after {} batches, residual rms {:.2} mm",
        batches,
        residual.rms() * 1000.0
    );
    Ok(())
}
