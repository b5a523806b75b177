//! Load generator supervision.
//!
//! [`Iperf3Driver`] spawns exactly one iperf3 process per call and waits
//! for it to exit, for the hard timeout (run duration plus grace) or for
//! cancellation, whichever comes first. Every path ends with the process
//! reaped: timeouts and cancellations escalate from SIGTERM to SIGKILL.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{iperf, LoadError, LoadSummary};
use crate::config::LoadConfig;
use crate::experiment::descriptor::{Role, RunDescriptor};

/// Outcome of one load-generator invocation.
#[derive(Debug)]
pub struct LoadRun {
    /// `Ok(None)` when the workload produces no summary (idle capture).
    pub outcome: Result<Option<LoadSummary>, LoadError>,
    /// Complete stdout, kept even when parsing failed.
    pub raw_output: Option<String>,
}

impl LoadRun {
    pub fn failed(error: LoadError) -> Self {
        Self {
            outcome: Err(error),
            raw_output: None,
        }
    }
}

/// Something that generates (or deliberately does not generate) load for
/// the span of one run.
#[async_trait::async_trait]
pub trait LoadGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Run the workload to completion. Must not return while a spawned
    /// process is still running.
    async fn run(&self, descriptor: &RunDescriptor, cancel: &CancellationToken) -> LoadRun;
}

/// Monitor-only workload: waits out the descriptor's duration.
pub struct IdleLoad;

#[async_trait::async_trait]
impl LoadGenerator for IdleLoad {
    fn name(&self) -> &str {
        "idle"
    }

    async fn run(&self, descriptor: &RunDescriptor, cancel: &CancellationToken) -> LoadRun {
        tokio::select! {
            _ = cancel.cancelled() => LoadRun::failed(LoadError::Cancelled),
            _ = tokio::time::sleep(descriptor.duration) => LoadRun {
                outcome: Ok(None),
                raw_output: None,
            },
        }
    }
}

pub struct Iperf3Driver {
    program: String,
    prefix: Vec<String>,
    grace: Duration,
    terminate_wait: Duration,
}

enum Ended {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

impl Iperf3Driver {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            prefix: Vec::new(),
            grace: Duration::from_secs(10),
            terminate_wait: Duration::from_secs(5),
        }
    }

    pub fn from_config(cfg: &LoadConfig) -> Self {
        Self::new(cfg.iperf3_path.clone())
            .with_prefix(cfg.command_prefix.clone())
            .with_timeouts(
                Duration::from_secs(cfg.grace_sec),
                Duration::from_secs(cfg.terminate_wait_sec),
            )
    }

    /// Launch through a wrapper command, e.g. `taskset -c 2,3`.
    pub fn with_prefix(mut self, prefix: Vec<String>) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn with_timeouts(mut self, grace: Duration, terminate_wait: Duration) -> Self {
        self.grace = grace;
        self.terminate_wait = terminate_wait;
        self
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = match self.prefix.split_first() {
            Some((wrapper, wrapper_args)) => {
                let mut c = Command::new(wrapper);
                c.args(wrapper_args).arg(&self.program);
                c
            }
            None => Command::new(&self.program),
        };
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Build the iperf3 argument vector for a descriptor.
pub fn build_args(d: &RunDescriptor) -> Vec<String> {
    let mut args = Vec::new();
    match d.role {
        Role::Server => {
            args.extend(["-s", "-p"].map(String::from));
            args.push(d.port.to_string());
            // one client, then exit
            args.push("-1".to_string());
            args.push("-J".to_string());
        }
        Role::Client => {
            args.push("-c".to_string());
            args.push(d.server.clone());
            args.push("-p".to_string());
            args.push(d.port.to_string());
            args.push("-J".to_string());
            args.push("-P".to_string());
            args.push(d.parallel.to_string());
            match &d.transfer_size {
                Some(size) => {
                    args.push("-n".to_string());
                    args.push(size.clone());
                }
                None => {
                    args.push("-t".to_string());
                    args.push(d.duration.as_secs().to_string());
                }
            }
            if let Some(rate) = &d.bitrate {
                args.push("-b".to_string());
                args.push(rate.clone());
            }
            if d.reverse {
                args.push("-R".to_string());
            }
        }
    }
    args
}

#[async_trait::async_trait]
impl LoadGenerator for Iperf3Driver {
    fn name(&self) -> &str {
        &self.program
    }

    async fn run(&self, d: &RunDescriptor, cancel: &CancellationToken) -> LoadRun {
        let args = build_args(d);
        let limit = d.duration + self.grace;

        let mut child = match self.command(&args).spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!(run = %d.name, program = %self.program, error = %e, "failed to spawn load generator");
                return LoadRun::failed(LoadError::Spawn {
                    program: self.program.clone(),
                    reason: e.to_string(),
                });
            }
        };

        info!(
            run = %d.name,
            pid = child.id(),
            role = %d.role,
            args = ?args,
            limit_secs = limit.as_secs(),
            "load generator started"
        );

        let stdout = child.stdout.take().map(|s| tokio::spawn(read_all(s)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(read_all(s)));

        let ended = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!(run = %d.name, "load generator cancelled, terminating");
                Ended::Cancelled
            }

            status = child.wait() => Ended::Exited(status),

            _ = tokio::time::sleep(limit) => {
                warn!(run = %d.name, limit_secs = limit.as_secs(), "load generator timed out, terminating");
                Ended::TimedOut
            }
        };

        if !matches!(ended, Ended::Exited(_)) {
            terminate_child(&mut child, self.terminate_wait).await;
        }

        let stdout = collect(stdout, self.terminate_wait).await;
        let stderr = collect(stderr, self.terminate_wait).await;

        let outcome = match ended {
            Ended::Cancelled => Err(LoadError::Cancelled),
            Ended::TimedOut => Err(LoadError::Timeout {
                limit_secs: limit.as_secs(),
            }),
            Ended::Exited(Err(e)) => Err(LoadError::Exit {
                code: None,
                stderr: format!("failed to wait for load generator: {}", e),
            }),
            Ended::Exited(Ok(status)) if status.success() => iperf::parse_output(&stdout)
                .and_then(|r| r.summary())
                .map(Some)
                .map_err(|e| LoadError::Parse(e.to_string())),
            Ended::Exited(Ok(status)) => {
                let mut message = stderr.trim().to_string();
                if message.is_empty() {
                    message = iperf::error_message(&stdout).unwrap_or_default();
                }
                Err(LoadError::Exit {
                    code: status.code(),
                    stderr: message,
                })
            }
        };

        match &outcome {
            Ok(_) => info!(run = %d.name, "load generator completed"),
            Err(e) => warn!(run = %d.name, error = %e, "load generator failed"),
        }

        LoadRun {
            outcome,
            raw_output: (!stdout.trim().is_empty()).then_some(stdout),
        }
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!(error = %e, "load generator pipe read ended with error");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// A descendant that inherited the pipe can keep it open after the child
/// is gone; give up on the rest of the output after `wait`.
async fn collect(handle: Option<JoinHandle<String>>, wait: Duration) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(wait, &mut handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}

/// SIGTERM, wait up to `wait`, then SIGKILL. Returns with the child reaped.
async fn terminate_child(child: &mut Child, wait: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(wait, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "load generator exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for load generator after SIGTERM");
        }
        Err(_) => {
            warn!("load generator did not exit after SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL load generator");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn descriptor(role: Role) -> RunDescriptor {
        RunDescriptor {
            name: "t".to_string(),
            duration: Duration::from_secs(1),
            parallel: 2,
            interface: "lo".to_string(),
            output_dir: PathBuf::from("/tmp/t"),
            transfer_size: None,
            bitrate: None,
            role,
            server: "127.0.0.1".to_string(),
            port: 5201,
            reverse: false,
        }
    }

    #[test]
    fn test_client_args() {
        let mut d = descriptor(Role::Client);
        assert_eq!(
            build_args(&d),
            ["-c", "127.0.0.1", "-p", "5201", "-J", "-P", "2", "-t", "1"]
        );

        d.transfer_size = Some("1G".to_string());
        d.bitrate = Some("500M".to_string());
        d.reverse = true;
        assert_eq!(
            build_args(&d),
            ["-c", "127.0.0.1", "-p", "5201", "-J", "-P", "2", "-n", "1G", "-b", "500M", "-R"]
        );
    }

    #[test]
    fn test_server_args() {
        let mut d = descriptor(Role::Server);
        d.port = 5300;
        assert_eq!(build_args(&d), ["-s", "-p", "5300", "-1", "-J"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_load_waits_duration() {
        let start = tokio::time::Instant::now();
        let run = IdleLoad
            .run(&descriptor(Role::Client), &CancellationToken::new())
            .await;
        assert!(matches!(run.outcome, Ok(None)));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let driver = Iperf3Driver::new("/nonexistent/iperf3");
        let run = driver
            .run(&descriptor(Role::Client), &CancellationToken::new())
            .await;
        assert!(matches!(run.outcome, Err(LoadError::Spawn { .. })));
        assert!(run.raw_output.is_none());
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::throughput::iperf::tests::TCP_OUTPUT;
        use tempfile::TempDir;

        /// The fake generator is run as `sh <script> iperf3 <args...>`.
        fn fake(dir: &TempDir, body: &str) -> Iperf3Driver {
            let path = dir.path().join("fake-iperf3.sh");
            std::fs::write(&path, body).unwrap();
            Iperf3Driver::new("iperf3")
                .with_prefix(vec!["sh".to_string(), path.display().to_string()])
                .with_timeouts(Duration::from_millis(500), Duration::from_millis(300))
        }

        fn pid_gone(pid_file: &std::path::Path) -> bool {
            let pid = std::fs::read_to_string(pid_file).unwrap();
            !std::path::Path::new(&format!("/proc/{}", pid.trim())).exists()
        }

        #[tokio::test]
        async fn test_completed_run_is_parsed() {
            let dir = TempDir::new().unwrap();
            let args_file = dir.path().join("args");
            let driver = fake(
                &dir,
                &format!(
                    "shift\necho \"$@\" > {}\ncat <<'JSON'\n{}\nJSON\n",
                    args_file.display(),
                    TCP_OUTPUT
                ),
            );

            let run = driver
                .run(&descriptor(Role::Client), &CancellationToken::new())
                .await;
            let summary = run.outcome.unwrap().unwrap();
            assert_eq!(summary.streams, 2);
            assert!(run.raw_output.unwrap().contains("sum_received"));

            let args = std::fs::read_to_string(args_file).unwrap();
            assert_eq!(args.trim(), "-c 127.0.0.1 -p 5201 -J -P 2 -t 1");
        }

        #[tokio::test]
        async fn test_nonzero_exit_reports_stderr() {
            let dir = TempDir::new().unwrap();
            let driver = fake(&dir, "echo 'iperf3: error - unable to connect' >&2\nexit 1\n");

            let run = driver
                .run(&descriptor(Role::Client), &CancellationToken::new())
                .await;
            match run.outcome {
                Err(LoadError::Exit { code, stderr }) => {
                    assert_eq!(code, Some(1));
                    assert!(stderr.contains("unable to connect"));
                }
                other => panic!("unexpected outcome: {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_json_error_used_when_stderr_empty() {
            let dir = TempDir::new().unwrap();
            let driver = fake(&dir, "echo '{\"error\": \"the server is busy\"}'\nexit 1\n");

            let run = driver
                .run(&descriptor(Role::Client), &CancellationToken::new())
                .await;
            match run.outcome {
                Err(LoadError::Exit { stderr, .. }) => assert_eq!(stderr, "the server is busy"),
                other => panic!("unexpected outcome: {:?}", other),
            }
            assert!(run.raw_output.is_some());
        }

        #[tokio::test]
        async fn test_malformed_output_is_parse_failure() {
            let dir = TempDir::new().unwrap();
            let driver = fake(&dir, "echo 'Connecting to host 127.0.0.1'\n");

            let run = driver
                .run(&descriptor(Role::Client), &CancellationToken::new())
                .await;
            assert!(matches!(run.outcome, Err(LoadError::Parse(_))));
            assert_eq!(run.raw_output.unwrap().trim(), "Connecting to host 127.0.0.1");
        }

        #[tokio::test]
        async fn test_timeout_terminates_and_reaps() {
            let dir = TempDir::new().unwrap();
            let pid_file = dir.path().join("pid");
            let driver = fake(
                &dir,
                &format!("echo $$ > {}\nexec sleep 30\n", pid_file.display()),
            );

            let started = std::time::Instant::now();
            let run = driver
                .run(&descriptor(Role::Client), &CancellationToken::new())
                .await;

            assert!(matches!(run.outcome, Err(LoadError::Timeout { limit_secs: 1 })));
            assert!(started.elapsed() < Duration::from_secs(5));
            assert!(pid_gone(&pid_file));
        }

        #[tokio::test]
        async fn test_sigterm_ignored_escalates_to_sigkill() {
            let dir = TempDir::new().unwrap();
            let pid_file = dir.path().join("pid");
            let driver = fake(
                &dir,
                &format!(
                    "trap '' TERM\necho $$ > {}\nwhile true; do sleep 0.1; done\n",
                    pid_file.display()
                ),
            );

            let run = driver
                .run(&descriptor(Role::Client), &CancellationToken::new())
                .await;
            assert!(matches!(run.outcome, Err(LoadError::Timeout { .. })));
            assert!(pid_gone(&pid_file));
        }

        #[tokio::test]
        async fn test_cancel_stops_generator() {
            let dir = TempDir::new().unwrap();
            let pid_file = dir.path().join("pid");
            let driver = fake(
                &dir,
                &format!("echo $$ > {}\nexec sleep 30\n", pid_file.display()),
            );

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                trigger.cancel();
            });

            let run = driver.run(&descriptor(Role::Client), &cancel).await;
            assert!(matches!(run.outcome, Err(LoadError::Cancelled)));
            assert!(pid_gone(&pid_file));
        }
    }
}
