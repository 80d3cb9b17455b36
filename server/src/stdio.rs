//! stdio transport: read line-delimited JSON-RPC from stdin, write responses
//! to stdout. Three tasks — reader, processor, writer — joined by bounded
//! channels, so a slow upstream can never block the protocol channel and
//! stdout writes are serialized in one place.

use std::io::Result as IoResult;
use std::sync::Arc;

use mcp_types::JSONRPCMessage;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;

use toolmux_core::ProxyHandler;

/// Size of the bounded channels used to communicate between tasks.
const CHANNEL_CAPACITY: usize = 128;

/// Serve the proxy over stdio until the host closes stdin, then stop every
/// running child.
pub async fn run_stdio(handler: Arc<ProxyHandler>) -> IoResult<()> {
    let (incoming_tx, mut incoming_rx) = mpsc::channel::<JSONRPCMessage>(CHANNEL_CAPACITY);
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JSONRPCMessage>(CHANNEL_CAPACITY);

    // Task: read from stdin, push to `incoming_tx`.
    let stdin_reader_handle = tokio::spawn(async move {
        let stdin = tokio::io::stdin();
        let reader = BufReader::new(stdin);
        let mut lines = reader.lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<JSONRPCMessage>(line) {
                Ok(message) => {
                    if incoming_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("failed to deserialize JSON-RPC message: {e}"),
            }
        }

        debug!("stdin reader finished (EOF)");
    });

    // Task: dispatch incoming messages. Each request runs in its own task so
    // one slow upstream does not serialize the rest.
    let processor_handle = tokio::spawn({
        let handler = handler.clone();
        let outgoing_tx = outgoing_tx.clone();
        async move {
            while let Some(message) = incoming_rx.recv().await {
                let handler = handler.clone();
                let outgoing_tx = outgoing_tx.clone();
                tokio::spawn(async move {
                    if let Some(response) = handler.handle_message(message).await {
                        let _ = outgoing_tx.send(response).await;
                    }
                });
            }
            info!("processor task exited (channel closed)");
        }
    });
    drop(outgoing_tx);

    // Task: write outgoing messages to stdout.
    let stdout_writer_handle = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = outgoing_rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if let Err(e) = stdout.write_all(json.as_bytes()).await {
                        error!("failed to write to stdout: {e}");
                        break;
                    }
                    if let Err(e) = stdout.write_all(b"\n").await {
                        error!("failed to write newline to stdout: {e}");
                        break;
                    }
                    if let Err(e) = stdout.flush().await {
                        error!("failed to flush stdout: {e}");
                        break;
                    }
                }
                Err(e) => error!("failed to serialize JSON-RPC message: {e}"),
            }
        }
        info!("stdout writer exited (channel closed)");
    });

    // The typical exit path is the stdin reader hitting EOF, which drops
    // `incoming_tx` and shuts down the processor. Stopping the children then
    // fails any in-flight upstream waits, which releases the writer.
    let _ = tokio::join!(stdin_reader_handle, processor_handle);

    info!("host disconnected; stopping children");
    handler.manager().shutdown_all().await;
    let _ = stdout_writer_handle.await;

    Ok(())
}
