//! Companion programs started next to the follower: a camera stream and a
//! static file server.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(3);
const OUTPUT_TAIL_LINES: usize = 20;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("{0:?} is not installed or not in PATH")]
    NotFound(String),
    #[error("failed to spawn {name:?}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{name:?} exited right after start ({status}): {output}")]
    ExitedEarly {
        name: String,
        status: ExitStatus,
        output: String,
    },
    #[error("failed to query {name:?}")]
    Wait {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, ProcessError>;

/// How to launch a helper and how long it gets to fail on its own
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub startup_wait: Duration,
}

impl ProcessSpec {
    /// MJPEG stream of a V4L2 device through `ustreamer`
    pub fn video_stream(device: &str, host: &str, port: u16, resolution: &str) -> Self {
        Self {
            name: "ustreamer".to_owned(),
            program: "ustreamer".to_owned(),
            args: vec![
                format!("--device={}", device),
                format!("--host={}", host),
                format!("--port={}", port),
                format!("--resolution={}", resolution),
            ],
            startup_wait: Duration::from_millis(400),
        }
    }

    /// `python3 -m http.server` rooted at `directory`
    pub fn file_server(port: u16, directory: &Path) -> Self {
        Self {
            name: "http.server".to_owned(),
            program: "python3".to_owned(),
            args: vec![
                "-m".to_owned(),
                "http.server".to_owned(),
                port.to_string(),
                "--directory".to_owned(),
                directory.display().to_string(),
            ],
            startup_wait: Duration::from_millis(200),
        }
    }
}

type OutputTail = Arc<Mutex<VecDeque<String>>>;

fn forward_output<R>(name: String, stream: R, tail: OutputTail) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(process = %name, "{}", line);
            if let Ok(mut tail) = tail.lock() {
                if tail.len() == OUTPUT_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    })
}

/// A running helper. Killed when dropped.
#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    child: Child,
    forwarders: Vec<JoinHandle<()>>,
}

impl ManagedProcess {
    /// Spawn and fail if the program exits within its startup wait
    pub async fn start(spec: &ProcessSpec) -> Result<Self> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    ProcessError::NotFound(spec.program.clone())
                } else {
                    ProcessError::Spawn {
                        name: spec.name.clone(),
                        source,
                    }
                }
            })?;

        let tail = OutputTail::default();
        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(forward_output(spec.name.clone(), stdout, tail.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(forward_output(spec.name.clone(), stderr, tail.clone()));
        }

        tokio::time::sleep(spec.startup_wait).await;
        let exited = child.try_wait().map_err(|source| ProcessError::Wait {
            name: spec.name.clone(),
            source,
        })?;
        if let Some(status) = exited {
            // pipes are closed once the process is gone, let the readers drain them
            for forwarder in forwarders {
                let _ = tokio::time::timeout(Duration::from_secs(1), forwarder).await;
            }
            let output = tail
                .lock()
                .map(|tail| tail.iter().cloned().collect::<Vec<_>>().join("\n"))
                .unwrap_or_default();
            return Err(ProcessError::ExitedEarly {
                name: spec.name.clone(),
                status,
                output,
            });
        }

        info!(process = %spec.name, pid = ?child.id(), "Helper process started");
        Ok(Self {
            name: spec.name.clone(),
            child,
            forwarders,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Terminate, give it `grace` to exit and kill it after that
    pub async fn stop(mut self, grace: Duration) {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                warn!(process = %self.name, %status, "Helper process already exited");
                return;
            }
            Ok(None) => {}
            Err(err) => error!(process = %self.name, error = %err, "Failed to query helper process"),
        }

        if let Some(pid) = self.child.id() {
            if let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(process = %self.name, error = %err, "Failed to send SIGTERM");
            }
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!(process = %self.name, %status, "Helper process stopped"),
            Ok(Err(err)) => error!(process = %self.name, error = %err, "Failed to wait for helper process"),
            Err(_) => {
                warn!(process = %self.name, "Helper process ignored SIGTERM, killing");
                if let Err(err) = self.child.kill().await {
                    error!(process = %self.name, error = %err, "Failed to kill helper process");
                }
            }
        }
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
    }
}

/// Helpers that live and die together with the follower
#[derive(Debug, Default)]
pub struct HelperProcesses {
    processes: Vec<ManagedProcess>,
}

impl HelperProcesses {
    /// Start every spec in order. On failure the ones already running are stopped.
    pub async fn start_all(specs: &[ProcessSpec]) -> Result<Self> {
        let mut helpers = Self::default();
        for spec in specs {
            match ManagedProcess::start(spec).await {
                Ok(process) => helpers.processes.push(process),
                Err(err) => {
                    helpers.stop_all().await;
                    return Err(err);
                }
            }
        }
        Ok(helpers)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub async fn stop_all(self) {
        for process in self.processes.into_iter().rev() {
            process.stop(STOP_GRACE_PERIOD).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(name: &str, script: &str, startup_wait: Duration) -> ProcessSpec {
        ProcessSpec {
            name: name.to_owned(),
            program: "sh".to_owned(),
            args: vec!["-c".to_owned(), script.to_owned()],
            startup_wait,
        }
    }

    #[test]
    fn video_stream_arguments() {
        let spec = ProcessSpec::video_stream("/dev/video0", "0.0.0.0", 8080, "640x480");
        assert_eq!(spec.program, "ustreamer");
        assert_eq!(
            spec.args,
            vec![
                "--device=/dev/video0",
                "--host=0.0.0.0",
                "--port=8080",
                "--resolution=640x480"
            ]
        );
        assert_eq!(spec.startup_wait, Duration::from_millis(400));
    }

    #[test]
    fn file_server_arguments() {
        let spec = ProcessSpec::file_server(8000, Path::new("/srv/www"));
        assert_eq!(spec.program, "python3");
        assert_eq!(
            spec.args,
            vec!["-m", "http.server", "8000", "--directory", "/srv/www"]
        );
        assert_eq!(spec.startup_wait, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn missing_program_is_reported() {
        let spec = ProcessSpec {
            name: "ghost".to_owned(),
            program: "definitely-not-an-installed-program".to_owned(),
            args: Vec::new(),
            startup_wait: Duration::from_millis(10),
        };
        assert!(matches!(
            ManagedProcess::start(&spec).await,
            Err(ProcessError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn early_exit_carries_output() {
        let spec = shell("broken", "echo device busy; exit 3", Duration::from_millis(300));
        match ManagedProcess::start(&spec).await {
            Err(ProcessError::ExitedEarly { status, output, .. }) => {
                assert_eq!(status.code(), Some(3));
                assert!(output.contains("device busy"), "output: {:?}", output);
            }
            other => panic!("expected early exit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn running_process_is_terminated() {
        let spec = shell("sleeper", "exec sleep 30", Duration::from_millis(50));
        let process = ManagedProcess::start(&spec).await.unwrap();
        assert!(process.id().is_some());
        assert_eq!(process.name(), "sleeper");
        tokio::time::timeout(Duration::from_secs(2), process.stop(STOP_GRACE_PERIOD))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn process_ignoring_sigterm_is_killed() {
        let spec = shell(
            "stubborn",
            "trap '' TERM; while true; do sleep 1; done",
            Duration::from_millis(100),
        );
        let process = ManagedProcess::start(&spec).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            process.stop(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn failed_start_stops_earlier_helpers() {
        let specs = vec![
            shell("sleeper", "exec sleep 30", Duration::from_millis(50)),
            shell("broken", "exit 1", Duration::from_millis(200)),
        ];
        let result = tokio::time::timeout(Duration::from_secs(5), HelperProcesses::start_all(&specs))
            .await
            .unwrap();
        assert!(matches!(result, Err(ProcessError::ExitedEarly { .. })));
    }

    #[tokio::test]
    async fn empty_group_starts_and_stops() {
        let helpers = HelperProcesses::start_all(&[]).await.unwrap();
        assert!(helpers.is_empty());
        assert_eq!(helpers.len(), 0);
        helpers.stop_all().await;
    }
}
