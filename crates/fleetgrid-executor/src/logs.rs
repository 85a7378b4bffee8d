//! Restartable log following.
//!
//! A background task runs a `tail -F` style command and forwards lines into
//! a channel. When the command exits (connection drop, log rotation, node
//! reboot) it is restarted with exponential backoff. The task ends as soon
//! as the consumer drops the stream.

use std::process::Stdio;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::executor::LogStream;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const CHANNEL_DEPTH: usize = 256;

/// Lines of history replayed on the first connection.
pub(crate) const HISTORY_LINES: u32 = 100;

/// Follow the stdout of the command produced by `build`.
///
/// `build(first)` is called on every (re)connect; `first` is true only for
/// the initial attempt so callers can skip history on reconnects.
pub fn follow_command<F>(label: String, build: F) -> LogStream
where
    F: Fn(bool) -> Command + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<String>(CHANNEL_DEPTH);

    tokio::spawn(async move {
        let mut backoff = INITIAL_BACKOFF;
        let mut first = true;
        loop {
            let mut cmd = build(first);
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true);

            match cmd.spawn() {
                Ok(mut child) => {
                    if let Some(stdout) = child.stdout.take() {
                        let mut lines = BufReader::new(stdout).lines();
                        loop {
                            let next = tokio::select! {
                                line = lines.next_line() => line,
                                _ = tx.closed() => return,
                            };
                            match next {
                                Ok(Some(line)) => {
                                    backoff = INITIAL_BACKOFF;
                                    if tx.send(line).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(%label, error = %e, "log read failed");
                                    break;
                                }
                            }
                        }
                    }
                    let _ = child.kill().await;
                }
                Err(e) => warn!(%label, error = %e, "failed to start log follower"),
            }

            first = false;
            debug!(%label, ?backoff, "log stream reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = tx.closed() => return,
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    });

    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|line| (line, rx)) }).boxed()
}
