use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use teleop_controller::{
    arm_config::{ArmConfig, Units},
    arm_driver::{ArmDriver, ArmRole, SerialArmDriver},
    follower::{FollowerController, FollowerSettings},
    helper_process::{HelperProcesses, ProcessSpec},
    jump_protection::{
        JumpProtection, MaxRelativeTarget, MissingJointPolicy, DEFAULT_MAX_RELATIVE_TARGET,
    },
    shutdown::stop_signal,
    transport::{Subscription, TransportError},
};
use teleop_zenoh::{
    load_arm_config, logging, stop_on_signal,
    zenoh_transport::{ZenohChannel, DEFAULT_QUEUE_SIZE},
    DEFAULT_TOPIC,
};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about = "Drive a follower arm from commands received over zenoh")]
struct Args {
    /// Serial port of the follower arm
    #[arg(long, default_value = "/dev/ttyACM0")]
    port: String,

    /// Arm id, used to find its calibration file
    #[arg(long, default_value = "so_follower")]
    id: String,

    /// Arm config in json or yaml. Included SO-101 config when not set
    #[arg(long)]
    config: Option<PathBuf>,

    /// Calibration file written by the lerobot calibration tooling
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Zenoh endpoint to connect to, e.g. tcp/192.168.1.10:7447
    #[arg(long)]
    connect: Vec<String>,

    /// Key expression to receive commands on
    #[arg(long, default_value = DEFAULT_TOPIC)]
    topic: String,

    /// Largest step one command may move any joint, overrides the config file
    #[arg(long)]
    max_relative_target: Option<f32>,

    /// Write goals exactly as received
    #[arg(long, conflicts_with = "max_relative_target")]
    no_jump_protection: bool,

    /// Drop joints the arm does not report instead of rejecting the command
    #[arg(long)]
    skip_missing_joints: bool,

    /// Units of joint positions, degrees or normalized
    #[arg(long, default_value_t = Units::Degrees)]
    units: Units,

    /// Stream this V4L2 device with ustreamer, e.g. /dev/video0
    #[arg(long)]
    camera: Option<String>,

    #[arg(long, default_value = "0.0.0.0")]
    cam_host: String,

    #[arg(long, default_value_t = 8080)]
    cam_port: u16,

    #[arg(long, default_value = "640x480")]
    cam_res: String,

    /// Serve a directory over http on this port
    #[arg(long)]
    http_server: Option<u16>,

    /// Directory served by the http server, home directory when not set
    #[arg(long)]
    http_dir: Option<PathBuf>,

    /// Sets the level of verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log json lines
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn jump_protection(&self, config: &ArmConfig) -> Result<JumpProtection> {
        let max_relative_target = if self.no_jump_protection {
            None
        } else if let Some(max) = self.max_relative_target {
            Some(MaxRelativeTarget::Uniform(max))
        } else {
            Some(
                config
                    .max_relative_target
                    .clone()
                    .unwrap_or(MaxRelativeTarget::Uniform(DEFAULT_MAX_RELATIVE_TARGET)),
            )
        };
        let policy = if self.skip_missing_joints {
            MissingJointPolicy::Skip
        } else {
            MissingJointPolicy::Abort
        };
        Ok(JumpProtection::new(max_relative_target, policy)?)
    }

    fn helper_specs(&self) -> Vec<ProcessSpec> {
        let mut specs = Vec::new();
        if let Some(device) = &self.camera {
            specs.push(ProcessSpec::video_stream(
                device,
                &self.cam_host,
                self.cam_port,
                &self.cam_res,
            ));
        }
        if let Some(port) = self.http_server {
            let directory = self
                .http_dir
                .clone()
                .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("."));
            specs.push(ProcessSpec::file_server(port, &directory));
        }
        specs
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_tracing(args.verbose, args.json_logs);

    let config = load_arm_config(
        args.config.as_deref(),
        args.calibration.as_deref(),
        "robots/so101_follower",
        &args.id,
    )?;
    let protection = args.jump_protection(&config)?;
    info!(
        id = %args.id,
        max_relative_target = ?protection.max_relative_target(),
        policy = ?protection.missing_joint_policy(),
        "Jump protection configured"
    );

    let helpers = HelperProcesses::start_all(&args.helper_specs())
        .await
        .context("Failed to start helper processes")?;

    let (stop_handle, stop) = stop_signal();
    stop_on_signal(stop_handle);

    let mut follower = FollowerController::new(FollowerSettings {
        topic: args.topic.clone(),
        units: args.units,
        protection,
    });
    let started = follower
        .start(
            async {
                SerialArmDriver::new(&args.port, config, args.units, ArmRole::Follower)
                    .await
                    .map(|driver| driver as Box<dyn ArmDriver>)
            },
            async {
                let channel = ZenohChannel::open(&args.connect).await?;
                let subscription = channel.subscribe(&args.topic, DEFAULT_QUEUE_SIZE).await?;
                Ok::<Box<dyn Subscription>, TransportError>(Box::new(subscription))
            },
        )
        .await;
    if let Err(err) = started {
        helpers.stop_all().await;
        return Err(err).context("Failed to start follower");
    }

    let result = follower.run(stop).await;
    helpers.stop_all().await;
    let stats = result?;
    info!(?stats, "Follower exited");
    Ok(())
}
