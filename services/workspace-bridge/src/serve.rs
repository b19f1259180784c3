//! Stdio serve loop
//!
//! Reads tool requests line by line, handles each on its own task and
//! writes responses through a single writer task so lines never interleave.
//! Responses may arrive out of order; callers match them by `id`.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::bridge::Bridge;
use crate::tools;

/// How long in-flight tool calls may run after input ends or shutdown.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const RESPONSE_QUEUE: usize = 64;

/// Serve until `input` reaches EOF or `shutdown` resolves. Returns the
/// writer once every response has been flushed.
pub async fn run<R, W>(
    bridge: Arc<Bridge>,
    input: R,
    output: W,
    shutdown: impl Future<Output = ()>,
) -> io::Result<W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<String>(RESPONSE_QUEUE);
    let writer = tokio::spawn(write_responses(rx, output));

    let mut lines = input.lines();
    let mut in_flight = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested, draining in-flight tool calls");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let bridge = bridge.clone();
                    let tx = tx.clone();
                    in_flight.spawn(async move {
                        let response = tools::handle_line(&bridge, &line).await;
                        if tx.send(response).await.is_err() {
                            debug!("response writer closed, dropping response");
                        }
                    });
                }
                Ok(None) => {
                    info!("input closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "failed to read input");
                    break;
                }
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "tool call task failed");
                }
            }
        }
    }

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = in_flight.len(),
            "drain timeout reached, aborting remaining tool calls"
        );
        in_flight.abort_all();
        while in_flight.join_next().await.is_some() {}
    }

    drop(tx);
    writer
        .await
        .map_err(|e| io::Error::other(format!("response writer failed: {e}")))?
}

async fn write_responses<W>(mut rx: mpsc::Receiver<String>, mut output: W) -> io::Result<W>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    Ok(output)
}
