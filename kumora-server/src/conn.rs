//! Connection handling.
//!
//! Single-threaded cooperative model: one task owns the dispatcher (and
//! through it the engine) and serializes every command; per-connection
//! tasks only parse frames and shuttle them over a channel. The engine
//! task interleaves a 20 ms maintenance tick with command execution.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use kumora_core::metrics::Metrics;

use crate::dispatcher::Dispatcher;
use crate::resp::{resp_error, RespCommand, RespParser};

const TICK_INTERVAL: Duration = Duration::from_millis(20);
const ENGINE_QUEUE_DEPTH: usize = 1024;
const READ_BUF_BYTES: usize = 4096;

/// Per-connection and per-iteration budgets.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    pub max_connections: usize,
    pub max_pending_out: usize,
    pub max_cmds_per_iteration: usize,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 512,
            max_pending_out: 1 << 20,
            max_cmds_per_iteration: 64,
        }
    }
}

struct DispatchRequest {
    args: Vec<Bytes>,
    reply: oneshot::Sender<Vec<u8>>,
}

/// Accept connections until interrupted; returns on ctrl-c for a clean
/// shutdown.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Dispatcher,
    metrics: Metrics,
    limits: ServerLimits,
) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel::<DispatchRequest>(ENGINE_QUEUE_DEPTH);
    let engine_task = tokio::spawn(engine_loop(dispatcher, rx));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                if metrics.snapshot().active_connections >= limits.max_connections as u64 {
                    metrics.connection_rejected();
                    reject_connection(stream).await;
                    continue;
                }
                metrics.connection_opened();
                debug!(%peer, "connection accepted");
                let tx = tx.clone();
                let metrics = metrics.clone();
                let limits = limits.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, tx, &metrics, &limits).await {
                        debug!(%peer, error = %e, "connection error");
                    }
                    metrics.connection_closed();
                });
            }
        }
    }

    drop(tx);
    let _ = engine_task.await;
    Ok(())
}

/// The single dispatcher owner: interleaves maintenance ticks with command
/// execution so long queues cannot starve expiry and tier work.
async fn engine_loop(mut dispatcher: Dispatcher, mut rx: mpsc::Receiver<DispatchRequest>) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => dispatcher.tick(),
            request = rx.recv() => match request {
                Some(DispatchRequest { args, reply }) => {
                    let encoded = dispatcher.dispatch(&args);
                    let _ = reply.send(encoded);
                }
                None => break,
            }
        }
    }
}

async fn reject_connection(mut stream: TcpStream) {
    let _ = stream.write_all(&resp_error("connection limit reached")).await;
}

async fn handle_connection(
    mut stream: TcpStream,
    tx: mpsc::Sender<DispatchRequest>,
    metrics: &Metrics,
    limits: &ServerLimits,
) -> anyhow::Result<()> {
    let mut parser = RespParser::new();
    let mut buf = [0u8; READ_BUF_BYTES];
    let mut out: Vec<u8> = Vec::new();

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        parser.feed(&buf[..n]);

        let mut processed = 0;
        while processed < limits.max_cmds_per_iteration {
            match parser.next_command() {
                None => break,
                Some(RespCommand::Malformed) => {
                    metrics.record_rejected();
                    out.extend_from_slice(&resp_error("malformed request framing"));
                    break;
                }
                Some(RespCommand::Args(args)) => {
                    processed += 1;
                    let request_bytes: usize = args.iter().map(|a| a.len()).sum();
                    metrics.record_command(request_bytes as u64);

                    let (reply_tx, reply_rx) = oneshot::channel();
                    if tx
                        .send(DispatchRequest {
                            args,
                            reply: reply_tx,
                        })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                    match reply_rx.await {
                        Ok(reply) => out.extend_from_slice(&reply),
                        Err(_) => return Ok(()),
                    }
                }
            }
            if out.len() > limits.max_pending_out {
                metrics.record_rejected();
                // Back-pressure violation: drop the connection.
                return Ok(());
            }
        }

        if !out.is_empty() {
            stream.write_all(&out).await?;
            out.clear();
        }
    }
}
