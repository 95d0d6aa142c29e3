//! Helpers for the external ffmpeg/ffprobe processes

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Check whether an ffmpeg-family tool can be executed
pub fn tool_available(bin: &Path) -> bool {
    Command::new(bin)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Forward a child's stderr to the log, one line at a time.
///
/// A long-running ffmpeg must never block on a full stderr pipe, so the
/// stream is drained on its own thread until the child closes it.
pub fn forward_stderr<R>(stderr: R, label: String)
where
    R: Read + Send + 'static,
{
    let spawned = std::thread::Builder::new()
        .name(format!("stderr-{}", label))
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) if !line.trim().is_empty() => {
                        tracing::warn!("[{}] {}", label, line.trim());
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });

    if let Err(e) = spawned {
        tracing::warn!("Failed to spawn stderr forwarder: {}", e);
    }
}

/// Poll a child until it exits or `timeout` elapses.
///
/// Returns `Ok(None)` when the child is still running at the deadline.
pub fn wait_timeout(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<Option<std::process::ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_missing_tool_is_unavailable() {
        assert!(!tool_available(&PathBuf::from("/definitely/not/a/real/ffmpeg")));
    }

    #[test]
    fn test_wait_timeout_reports_exit() {
        let mut child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let status = wait_timeout(&mut child, Duration::from_secs(5)).unwrap();
        assert_eq!(status.and_then(|s| s.code()), Some(3));
    }

    #[test]
    fn test_wait_timeout_expires_on_running_child() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let status = wait_timeout(&mut child, Duration::from_millis(100)).unwrap();
        assert!(status.is_none());
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
