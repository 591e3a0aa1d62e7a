//! Stdio frontend channel
//!
//! One client over stdin/stdout: each line in is one JSON-RPC message, each
//! line out is one serialized response or notification. Writes go through a
//! single queue so every message lands atomically with its trailing newline.
//! Once the channel is accepting requests, a `{"status":"ready"}` object is
//! written to stderr.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::GatewayServer;
use crate::error::rpc_codes;
use crate::protocol::JsonRpcResponse;
use crate::Result;

/// Drive the stdio frontend until EOF or shutdown.
pub async fn run_stdio_frontend(
    server: Arc<GatewayServer>,
    shutdown: CancellationToken,
) -> Result<()> {
    let client_id = format!("stdio-{}", Uuid::new_v4());
    let mut notifications = server.hub().register(&client_id);

    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    // Serialized outbound lines; responses from spawned request tasks and
    // notifications share the same queue.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    // Readiness signal for whoever spawned us.
    eprintln!("{}", json!({"status": "ready"}));

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    handle_line(&server, &client_id, &line, &out_tx);
                }
                Ok(None) => {
                    debug!(client = %client_id, "stdin EOF");
                    break;
                }
                Err(e) => {
                    warn!(client = %client_id, error = %e, "Error reading stdin");
                    break;
                }
            },
            Some(outbound) = out_rx.recv() => {
                if write_line(&mut stdout, &outbound).await.is_err() {
                    break;
                }
            }
            Some(notification) = notifications.recv() => {
                let Ok(serialized) = serde_json::to_string(&notification) else { continue };
                if write_line(&mut stdout, &serialized).await.is_err() {
                    break;
                }
            }
            () = shutdown.cancelled() => {
                debug!(client = %client_id, "Shutdown, closing stdio channel");
                break;
            }
        }
    }

    server.disconnect_client(&client_id).await;
    Ok(())
}

fn handle_line(
    server: &Arc<GatewayServer>,
    client_id: &str,
    line: &str,
    out_tx: &mpsc::UnboundedSender<String>,
) {
    let message: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            let response = JsonRpcResponse::error(
                None,
                rpc_codes::PARSE_ERROR,
                format!("Invalid JSON: {e}"),
            );
            if let Ok(serialized) = serde_json::to_string(&response) {
                let _ = out_tx.send(serialized);
            }
            return;
        }
    };

    // Each request runs concurrently; responses are keyed by id and may
    // complete out of order.
    let server = Arc::clone(server);
    let client_id = client_id.to_string();
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        if let Some(response) = server.handle_value(&client_id, &message).await {
            if let Ok(serialized) = serde_json::to_string(&response) {
                let _ = out_tx.send(serialized);
            }
        }
    });
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
