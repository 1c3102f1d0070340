pub mod error;
pub mod logging;
pub mod zenoh_transport;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use teleop_controller::arm_config::ArmConfig;
use teleop_controller::shutdown::StopHandle;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

/// Key expression commands are exchanged on
pub const DEFAULT_TOPIC: &str = "watchman_robotarm/so-101";

/// Fire `handle` on Ctrl+c or SIGTERM
pub fn stop_on_signal(handle: StopHandle) {
    tokio::spawn(async move {
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => Some(terminate),
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                None
            }
        };
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("Detected Ctrl+c"),
                Err(err) => error!(error = %err, "Failed to wait for Ctrl+c"),
            },
            Some(_) = async {
                match terminate.as_mut() {
                    Some(terminate) => terminate.recv().await,
                    None => std::future::pending().await,
                }
            } => info!("Detected SIGTERM"),
        }
        handle.stop();
    });
}

/// Where the lerobot calibration tooling stores the file for `id`
///
/// `kind` is `robots/so101_follower` or `teleoperators/so101_leader`.
pub fn lerobot_calibration_path(kind: &str, id: &str) -> Option<PathBuf> {
    let root = match std::env::var_os("HF_LEROBOT_CALIBRATION") {
        Some(root) => PathBuf::from(root),
        None => PathBuf::from(std::env::var_os("HOME")?)
            .join(".cache/huggingface/lerobot/calibration"),
    };
    Some(root.join(kind).join(format!("{}.json", id)))
}

/// Arm config from `config` or the included one, with calibration applied.
///
/// An explicit calibration file must exist. The lerobot default location is
/// only used when a file is there.
pub fn load_arm_config(
    config: Option<&Path>,
    calibration: Option<&Path>,
    calibration_kind: &str,
    id: &str,
) -> Result<ArmConfig> {
    let mut arm_config = match config {
        Some(path) => ArmConfig::load(path)
            .with_context(|| format!("Failed to load arm config {}", path.display()))?,
        None => ArmConfig::included(),
    };
    let calibration = match calibration {
        Some(path) => Some(path.to_owned()),
        None => lerobot_calibration_path(calibration_kind, id).filter(|path| path.exists()),
    };
    match calibration {
        Some(path) => {
            let file = ArmConfig::load_calibration(&path)
                .with_context(|| format!("Failed to load calibration {}", path.display()))?;
            arm_config.apply_calibration(&file)?;
            info!(path = %path.display(), "Calibration applied");
        }
        None => warn!(id, "No calibration found, using uncalibrated ranges"),
    }
    Ok(arm_config)
}
