use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use motion_compensation_rs::config::ClientConfig;
use motion_compensation_rs::ipc::{default_namespace, CompensationClient, ReplyStatus};
use motion_compensation_rs::types::MAX_TRACKED_DEVICES;
use motion_compensation_rs::{ClientError, CompensationMode, CompensationParameters, PoseOffset};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mocomp_ctl")]
#[command(about = "Control a running motion compensation driver", long_about = None)]
struct Args {
    /// Client config file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the driver answers
    Ping,
    /// List attached devices
    Devices,
    /// Show one device
    Info { device_id: u32 },
    /// Compensate TARGET against REFERENCE
    SetMode {
        target: u32,
        reference: u32,
        /// Turn compensation off instead
        #[arg(long)]
        disable: bool,
    },
    /// Replace the compensation parameters
    SetParams(ParamArgs),
    /// Capture a new zero pose on the next reference sample
    ResetZero,
}

#[derive(clap::Args, Debug)]
struct ParamArgs {
    /// Low-pass coefficient in [0, 1]
    #[arg(long, default_value_t = motion_compensation_rs::compensation::DEFAULT_LPF_BETA)]
    lpf_beta: f64,

    /// DEMA window length (below 2 disables smoothing)
    #[arg(long, default_value_t = motion_compensation_rs::compensation::DEFAULT_SAMPLES)]
    samples: u32,

    /// Report zero velocity and acceleration for the compensated device
    #[arg(long)]
    zero_velocity: bool,

    /// Translation offset [m]
    #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"], allow_negative_numbers = true)]
    offset: Option<Vec<f64>>,

    /// Rotation offset roll/pitch/yaw [deg]
    #[arg(long, num_args = 3, value_names = ["ROLL", "PITCH", "YAW"], allow_negative_numbers = true)]
    rotation_offset: Option<Vec<f64>>,
}

fn triple(values: Option<&Vec<f64>>) -> [f64; 3] {
    match values {
        Some(v) if v.len() == 3 => [v[0], v[1], v[2]],
        _ => [0.0; 3],
    }
}

fn build_parameters(args: &ParamArgs) -> CompensationParameters {
    CompensationParameters {
        lpf_beta: args.lpf_beta,
        samples: args.samples,
        zero_velocity: args.zero_velocity,
        offset: PoseOffset {
            translation: triple(args.offset.as_ref()),
            rotation: triple(args.rotation_offset.as_ref()),
        },
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if config.reply_timeout_ms.is_none() {
        config.reply_timeout_ms = Some(2000);
    }

    let namespace = default_namespace(&config.queue_dir).context("opening queue namespace")?;
    let mut client = CompensationClient::new(namespace, config);
    let client_id = client.connect().context("connecting to driver")?;
    log::debug!("Connected as client {}", client_id);

    match &args.command {
        Command::Ping => {
            client.ping(true, true)?;
            println!("pong");
        }
        Command::Devices => {
            let mut devices = Vec::new();
            for device_id in 0..MAX_TRACKED_DEVICES {
                match client.device_info(device_id) {
                    Ok(info) => devices.push(info),
                    Err(ClientError::Status(ReplyStatus::NotFound)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if args.json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else {
                for info in &devices {
                    println!("{:>3}  {:<16?} {:?}", info.device_id, info.device_class, info.role);
                }
            }
        }
        Command::Info { device_id } => {
            let info = client.device_info(*device_id)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("{:>3}  {:<16?} {:?}", info.device_id, info.device_class, info.role);
            }
        }
        Command::SetMode {
            target,
            reference,
            disable,
        } => {
            let mode = if *disable {
                CompensationMode::Disabled
            } else {
                CompensationMode::ReferenceTracker
            };
            client.set_compensation_mode(*target, *reference, mode, true)?;
            println!("mode set: {:?}", mode);
        }
        Command::SetParams(param_args) => {
            let params = build_parameters(param_args);
            client.set_compensation_parameters(params, true)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&params)?);
            } else {
                println!("parameters set");
            }
        }
        Command::ResetZero => {
            client.reset_zero_pose(true)?;
            println!("zero pose reset");
        }
    }

    client.disconnect();
    Ok(())
}
