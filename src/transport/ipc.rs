//! Child process channel
//!
//! Spawns the test host as a child process and talks newline-delimited
//! JSON over its stdin (updates) and stdout (host events). Stderr is
//! inherited so the host's own logging stays visible.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{HostLink, TransportBridge};
use crate::error::{Error, Result};

/// How long a child gets to exit after its stdin closes
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A running host process attached to the bridge
#[derive(Debug)]
pub struct ChildProcessChannel {
    child: Child,
    stop: oneshot::Sender<()>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl ChildProcessChannel {
    /// Spawn `command` (program followed by arguments) and attach it as the host
    pub fn spawn(bridge: TransportBridge, command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::transport("child transport needs a command"))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::transport(format!("cannot spawn {}: {}", program, e)))?;
        info!(pid = ?child.id(), "spawned host process {}", program);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::transport("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::transport("child stdout unavailable"))?;

        let (exited_tx, exited_rx) = oneshot::channel();
        let (stop, stop_rx) = oneshot::channel();
        let link = bridge.connect();
        let writer = tokio::spawn(write_frames(bridge.clone(), link, stdin, exited_rx, stop_rx));
        let reader = tokio::spawn(read_events(bridge, stdout, exited_tx));

        Ok(Self {
            child,
            stop,
            writer,
            reader,
        })
    }

    /// OS process id, if still running
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Let the writer finish the frames already queued, close the child's
    /// stdin, give it a grace period to exit, then kill it
    pub async fn shutdown(self) -> Result<Option<ExitStatus>> {
        let Self {
            mut child,
            stop,
            writer,
            reader,
        } = self;
        let _ = stop.send(());
        if let Err(e) = writer.await {
            warn!("host writer task failed: {}", e);
        }

        let status = match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(status) => Some(status?),
            Err(_) => {
                warn!("host process did not exit in time, killing it");
                child.kill().await?;
                None
            }
        };
        reader.abort();
        info!(?status, "host process released");
        Ok(status)
    }
}

async fn write_frames(
    bridge: TransportBridge,
    mut link: HostLink,
    mut stdin: ChildStdin,
    mut exited: oneshot::Receiver<()>,
    mut stop: oneshot::Receiver<()>,
) {
    let id = link.id;
    let mut in_flight = None;
    loop {
        // A frame is always written whole; stop is only seen between frames
        // and after the queue ran dry.
        tokio::select! {
            biased;
            _ = &mut exited => break,
            frame = link.recv() => {
                let Some(frame) = frame else { break };
                let mut line = frame.clone();
                line.push('\n');
                let written = match stdin.write_all(line.as_bytes()).await {
                    Ok(()) => stdin.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    debug!(link = id, "write to host process failed: {}", e);
                    in_flight = Some(frame);
                    break;
                }
            }
            _ = &mut stop => break,
        }
    }
    if let Err(e) = stdin.shutdown().await {
        debug!(link = id, "closing host stdin failed: {}", e);
    }
    drop(stdin);
    let unsent = link.into_unsent(in_flight);
    bridge.disconnect(id, unsent);
}

async fn read_events(bridge: TransportBridge, stdout: ChildStdout, exited: oneshot::Sender<()>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if !line.is_empty() {
                    let _ = bridge.deliver(line);
                }
            }
            Ok(None) => {
                info!("host process closed its output");
                break;
            }
            Err(e) => {
                warn!("reading host process output failed: {}", e);
                break;
            }
        }
    }
    let _ = exited.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::UpdateKind;
    use crate::transport::{HmrUpdateMessage, HostMessage};

    #[tokio::test]
    async fn test_child_round_trip() {
        let bridge = TransportBridge::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bridge.on_host_message(move |m| {
            let _ = tx.send(m.clone());
        });

        let script = r#"while read line; do echo '{"type":"hmr:ready"}'; done"#;
        let channel = ChildProcessChannel::spawn(
            bridge.clone(),
            &["sh".to_string(), "-c".to_string(), script.to_string()],
        )
        .unwrap();

        bridge.send(&HmrUpdateMessage {
            kind: UpdateKind::Update,
            path: "/out/a.js".to_string(),
            timestamp: 1,
            content: Some("1".to_string()),
            affected_tests: None,
            reason: "test".to_string(),
        });

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, HostMessage::Ready);

        let status = channel.shutdown().await.unwrap();
        assert!(status.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_writes_queued_frames_before_closing_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let count_file = dir.path().join("count");
        let script = format!(
            "n=0; while read line; do n=$((n+1)); done; echo $n > '{}'",
            count_file.display()
        );
        let bridge = TransportBridge::new();
        let channel =
            ChildProcessChannel::spawn(bridge.clone(), &["sh".to_string(), "-c".to_string(), script]).unwrap();

        for n in 0..3 {
            bridge.send(&HmrUpdateMessage {
                kind: UpdateKind::Update,
                path: format!("/out/{}.js", n),
                timestamp: 1,
                content: Some("x".repeat(4096)),
                affected_tests: None,
                reason: "test".to_string(),
            });
        }

        let status = channel.shutdown().await.unwrap();
        assert!(status.is_some_and(|s| s.success()));
        assert_eq!(std::fs::read_to_string(&count_file).unwrap().trim(), "3");
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let err = ChildProcessChannel::spawn(TransportBridge::new(), &[]).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
