/// you-get subprocess runner.
///
/// Spawns one engine process per download, parses its console output into
/// typed events, and keeps a kill handle per task so downloads can be
/// stopped mid-flight. Stderr is forwarded to tracing logs and its tail is
/// kept for error detail.
use std::collections::HashMap;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use you_get_web_shared::engine::{parse_line, EngineEvent};
use you_get_web_shared::errors::EngineError;

/// Stderr lines retained for failure detail.
const STDERR_TAIL: usize = 20;
/// Seconds before a --version or --json run is abandoned.
const PROBE_TIMEOUT_SECS: u64 = 60;

/// One message on a run's event channel.
#[derive(Debug)]
pub enum RunMessage {
    /// A parsed console line.
    Event(EngineEvent),
    /// The process finished; always the last message.
    Finished(Result<(), EngineError>),
}

/// Spawns and tracks engine processes.
pub struct EngineRunner {
    engine_path: String,
    /// Kill handles for running downloads, keyed by task id.
    kills: Arc<Mutex<HashMap<i64, oneshot::Sender<()>>>>,
}

impl EngineRunner {
    pub fn new(engine_path: String) -> Self {
        Self {
            engine_path,
            kills: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Ask the engine for its version banner. Used at startup to confirm the
    /// executable is reachable.
    pub async fn version(&self) -> Result<String, EngineError> {
        let output = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            Command::new(&self.engine_path)
                .arg("--version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| EngineError::ProbeTimeout(10))?
        .map_err(|e| spawn_error(&self.engine_path, e))?;

        // you-get prints the banner on stderr
        let banner = if output.stderr.is_empty() {
            String::from_utf8_lossy(&output.stdout).to_string()
        } else {
            String::from_utf8_lossy(&output.stderr).to_string()
        };
        Ok(banner.lines().next().unwrap_or_default().trim().to_string())
    }

    /// Run a media-info probe and hand back raw stdout for parsing.
    pub async fn probe(&self, args: &[String]) -> Result<String, EngineError> {
        debug!("Probing: {} {}", self.engine_path, args.join(" "));
        let output = tokio::time::timeout(
            std::time::Duration::from_secs(PROBE_TIMEOUT_SECS),
            Command::new(&self.engine_path)
                .args(args)
                .stdin(Stdio::null())
                .env("PATH", augmented_path())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| EngineError::ProbeTimeout(PROBE_TIMEOUT_SECS))?
        .map_err(|e| spawn_error(&self.engine_path, e))?;

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let detail = String::from_utf8_lossy(&output.stderr)
                .lines()
                .last()
                .unwrap_or_default()
                .to_string();
            return Err(EngineError::Exited { code, detail });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Spawn a download. Events stream on the returned channel, closed by a
    /// final `Finished` message.
    pub async fn run(
        &self,
        task_id: i64,
        args: &[String],
    ) -> Result<mpsc::UnboundedReceiver<RunMessage>, EngineError> {
        info!("Starting engine for task {}: {} {}", task_id, self.engine_path, args.join(" "));

        let mut command = Command::new(&self.engine_path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PATH", augmented_path())
            .kill_on_drop(true);
        // own process group, so a stop takes merge helpers down with the
        // engine itself
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| spawn_error(&self.engine_path, e))?;

        debug!("Engine spawned for task {} (pid: {:?})", task_id, child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::SpawnFailed("No stdout handle".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::SpawnFailed("No stderr handle".into()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (kill_tx, mut kill_rx) = oneshot::channel();
        self.kills.lock().await.insert(task_id, kill_tx);

        // Stdout reader: progress bars repaint with carriage returns, so
        // lines split on \r as well as \n.
        let event_tx = tx.clone();
        let stdout_handle = tokio::spawn(async move {
            let result = read_console_lines(stdout, |line| {
                let _ = event_tx.send(RunMessage::Event(parse_line(line)));
            })
            .await;
            if let Err(e) = result {
                warn!("Engine stdout read error: {}", e);
            }
        });

        // Stderr reader: forward to logs, keep the tail for error detail.
        let tail: Arc<std::sync::Mutex<VecDeque<String>>> =
            Arc::new(std::sync::Mutex::new(VecDeque::new()));
        let tail_writer = tail.clone();
        let stderr_handle = tokio::spawn(async move {
            let result = read_console_lines(stderr, |line| {
                debug!(target: "you_get", "{}", line);
                if let Ok(mut tail) = tail_writer.lock() {
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                }
            })
            .await;
            if let Err(e) = result {
                warn!("Engine stderr read error: {}", e);
            }
        });

        // Waiter: reaps the child (or kills it), then emits the final
        // message once both readers have drained.
        let kills = self.kills.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => match status {
                    Ok(s) if s.success() => Ok(()),
                    Ok(s) => Err(PendingOutcome::Exit(s.code().unwrap_or(-1))),
                    Err(e) => Err(PendingOutcome::Fail(e.to_string())),
                },
                _ = &mut kill_rx => {
                    warn!("Killing engine for task {}", task_id);
                    kill_engine_group(&mut child).await;
                    Err(PendingOutcome::Killed)
                }
            };

            let _ = stdout_handle.await;
            let _ = stderr_handle.await;
            kills.lock().await.remove(&task_id);

            let result = match outcome {
                Ok(()) => Ok(()),
                Err(PendingOutcome::Killed) => Err(EngineError::Killed),
                Err(PendingOutcome::Fail(detail)) => Err(EngineError::SpawnFailed(detail)),
                Err(PendingOutcome::Exit(code)) => {
                    let detail = tail
                        .lock()
                        .map(|t| t.iter().cloned().collect::<Vec<_>>().join(" | "))
                        .unwrap_or_default();
                    Err(EngineError::Exited { code, detail })
                }
            };
            let _ = tx.send(RunMessage::Finished(result));
        });

        Ok(rx)
    }

    /// Kill the engine process of a running task. Returns false when no
    /// process is tracked for it.
    pub async fn kill(&self, task_id: i64) -> bool {
        match self.kills.lock().await.remove(&task_id) {
            Some(kill_tx) => kill_tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Kill every tracked engine process. Used at shutdown so no download
    /// outlives the server.
    pub async fn kill_all(&self) {
        let mut kills = self.kills.lock().await;
        for (task_id, kill_tx) in kills.drain() {
            debug!("Killing engine for task {} at shutdown", task_id);
            let _ = kill_tx.send(());
        }
    }

    /// How many engine processes are currently tracked.
    pub async fn active_count(&self) -> usize {
        self.kills.lock().await.len()
    }
}

/// Kill the engine and everything it spawned. The engine runs in its own
/// process group, so merge helpers like ffmpeg go down with it.
async fn kill_engine_group(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// What the waiter saw before the readers drained.
enum PendingOutcome {
    Killed,
    Fail(String),
    Exit(i32),
}

fn spawn_error(engine_path: &str, e: std::io::Error) -> EngineError {
    if e.kind() == std::io::ErrorKind::NotFound {
        EngineError::NotFound(engine_path.to_string())
    } else {
        EngineError::SpawnFailed(e.to_string())
    }
}

/// PATH handed to engine children; FFMPEG_PATH is appended when set so
/// merging works with a privately installed ffmpeg.
fn augmented_path() -> String {
    let current = std::env::var("PATH").unwrap_or_default();
    match std::env::var("FFMPEG_PATH") {
        Ok(extra) if !extra.is_empty() => {
            let sep = if cfg!(target_os = "windows") { ";" } else { ":" };
            format!("{}{}{}", current, sep, extra)
        }
        _ => current,
    }
}

/// Read console output, treating both \n and \r as line breaks so progress
/// repaints arrive as they happen.
async fn read_console_lines<R>(
    reader: R,
    mut on_line: impl FnMut(&str),
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut acc: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if !acc.is_empty() {
                on_line(String::from_utf8_lossy(&acc).trim_end());
            }
            return Ok(());
        }
        for &byte in &chunk[..n] {
            if byte == b'\n' || byte == b'\r' {
                if !acc.is_empty() {
                    on_line(String::from_utf8_lossy(&acc).trim_end());
                    acc.clear();
                }
            } else {
                acc.push(byte);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_lines(input: &str) -> Vec<String> {
        let mut lines = Vec::new();
        read_console_lines(input.as_bytes(), |line| lines.push(line.to_string()))
            .await
            .unwrap();
        lines
    }

    #[tokio::test]
    async fn test_carriage_return_splits_lines() {
        let lines = collect_lines("  1.0% ( 0.1/10.8 MB)\r  2.0% ( 0.2/10.8 MB)\rdone\n").await;
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "  1.0% ( 0.1/10.8 MB)");
        assert_eq!(lines[2], "done");
    }

    #[tokio::test]
    async fn test_trailing_line_without_newline() {
        let lines = collect_lines("title:  clip").await;
        assert_eq!(lines, vec!["title:  clip"]);
    }

    #[tokio::test]
    async fn test_blank_runs_collapse() {
        let lines = collect_lines("a\r\n\r\nb\n").await;
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_kill_unknown_task_is_false() {
        let runner = EngineRunner::new("you-get".to_string());
        assert!(!runner.kill(42).await);
        assert_eq!(runner.active_count().await, 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_kill_takes_down_helper_processes() {
        use std::os::unix::fs::PermissionsExt;

        // engine stand-in that forks a long-lived helper, like a merge step
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("helper.pid");
        let script = dir.path().join("engine.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nsleep 30 &\necho $! > {}\nwait\n",
                pidfile.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = EngineRunner::new(script.display().to_string());
        let mut rx = runner.run(1, &[]).await.unwrap();

        let mut helper_pid = None;
        for _ in 0..100 {
            if let Some(pid) = std::fs::read_to_string(&pidfile)
                .ok()
                .and_then(|text| text.trim().parse::<u32>().ok())
            {
                helper_pid = Some(pid);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        // alive means present in /proc and not a zombie awaiting a reaper
        fn helper_alive(pid: u32) -> bool {
            match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
                Ok(stat) => !stat.contains(") Z"),
                Err(_) => false,
            }
        }

        let helper_pid = helper_pid.expect("helper never started");
        assert!(helper_alive(helper_pid));

        assert!(runner.kill(1).await);
        loop {
            match rx.recv().await {
                Some(RunMessage::Finished(result)) => {
                    assert!(matches!(result, Err(EngineError::Killed)));
                    break;
                }
                Some(RunMessage::Event(_)) => continue,
                None => panic!("channel closed without a finish message"),
            }
        }

        let mut helper_gone = false;
        for _ in 0..100 {
            if !helper_alive(helper_pid) {
                helper_gone = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(helper_gone, "helper process survived the engine kill");
    }
}
