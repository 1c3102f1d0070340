use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use teleop_controller::{
    arm_config::Units,
    arm_driver::{ArmDriver, ArmRole, SerialArmDriver},
    leader::{LeaderSender, LeaderSettings},
    shutdown::stop_signal,
};
use teleop_zenoh::{
    load_arm_config, logging, stop_on_signal, zenoh_transport::ZenohChannel, DEFAULT_TOPIC,
};
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about = "Publish leader arm positions over zenoh")]
struct Args {
    /// Serial port of the leader arm
    #[arg(long, default_value = "/dev/ttyACM0")]
    port: String,

    /// Arm id, used to find its calibration file
    #[arg(long, default_value = "so_leader")]
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

    /// Key expression to publish commands on
    #[arg(long, default_value = DEFAULT_TOPIC)]
    topic: String,

    /// Publish rate in Hz
    #[arg(long, default_value_t = 60.0)]
    fps: f32,

    /// Seconds to wait for zenoh before giving up
    #[arg(long, default_value_t = 5.0)]
    connect_timeout: f32,

    /// Units of joint positions, degrees or normalized
    #[arg(long, default_value_t = Units::Degrees)]
    units: Units,

    /// Sets the level of verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log json lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_tracing(args.verbose, args.json_logs);

    let connect_timeout = Duration::try_from_secs_f32(args.connect_timeout)
        .context("Connect timeout must be a positive number of seconds")?;
    let config = load_arm_config(
        args.config.as_deref(),
        args.calibration.as_deref(),
        "teleoperators/so101_leader",
        &args.id,
    )?;

    let (stop_handle, stop) = stop_signal();
    stop_on_signal(stop_handle);

    let mut driver = SerialArmDriver::new(&args.port, config, args.units, ArmRole::Leader)
        .await
        .context("Failed to connect leader arm")?;
    let publisher = match ZenohChannel::open(&args.connect).await {
        Ok(channel) => channel.publisher(&args.topic).await,
        Err(err) => Err(err),
    };
    let publisher = match publisher {
        Ok(publisher) => publisher,
        Err(err) => {
            if let Err(disconnect_err) = driver.disconnect().await {
                error!(error = %disconnect_err, "Failed to disconnect leader arm");
            }
            return Err(err).context("Failed to open zenoh publisher");
        }
    };

    let leader = LeaderSender::start(
        driver,
        Box::new(publisher),
        LeaderSettings {
            units: args.units,
            fps: args.fps,
            connect_timeout,
        },
    )
    .await
    .context("Failed to start leader")?;
    info!(period = ?leader.period(), "Leader running");

    let stats = leader.run(stop).await;
    info!(?stats, "Leader exited");
    Ok(())
}
