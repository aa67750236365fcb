//! Newline-delimited JSON transport on stdin/stdout.
//!
//! In stdio mode stdout belongs to the protocol; every diagnostic goes to
//! stderr (the logging setup guarantees that).

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use super::McpHandler;

pub async fn run(handler: Arc<McpHandler>, cancel: CancellationToken) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = tokio::io::stdout();

    info!(message = "mcp stdio transport ready");
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!(message = "stdin closed, stopping stdio transport");
                break;
            }
            Err(error) => {
                error!(message = "stdin read failed", %error);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let Some(response) = handler.handle_raw(&line).await else {
            continue;
        };
        let mut bytes = match serde_json::to_vec(&response) {
            Ok(bytes) => bytes,
            Err(error) => {
                error!(message = "response serialization failed", %error);
                continue;
            }
        };
        bytes.push(b'\n');
        if let Err(error) = stdout.write_all(&bytes).await {
            error!(message = "stdout write failed", %error);
            break;
        }
        if let Err(error) = stdout.flush().await {
            error!(message = "stdout flush failed", %error);
            break;
        }
    }
}
