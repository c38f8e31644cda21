// Line-delimited JSON-RPC transport (stdio and anything byte-stream shaped)

use crate::dispatcher::Dispatcher;
use crate::protocol::{methods, parse_envelope, JsonRpcRequest, JsonRpcResponse};
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Serve MCP over the process's stdin and stdout
pub async fn serve_stdio(dispatcher: Arc<Dispatcher>) -> Result<()> {
    serve(dispatcher, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Read one JSON-RPC message per line from `reader` until EOF, answering on
/// `writer`. Each request runs in its own task so a slow tool does not hold
/// up the messages behind it; cancellation notifications are applied as
/// soon as they are read.
pub async fn serve<R, W>(dispatcher: Arc<Dispatcher>, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (response_tx, response_rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
    let (notification_tx, notification_rx) = mpsc::unbounded_channel::<JsonRpcRequest>();
    dispatcher.attach_notifier(notification_tx);

    let writer_task = tokio::spawn(write_loop(writer, response_rx, notification_rx));

    info!(session_id = %dispatcher.session_id(), "MCP transport ready");

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read from transport")?
    {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request = match parse_envelope(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(code = e.error.code(), "Rejected message: {}", e.error);
                let _ = response_tx.send(e.into_response());
                continue;
            }
        };

        if request.method == methods::NOTIFICATION_CANCELLED {
            dispatcher.handle(request, None).await;
            continue;
        }

        // Registered here, in read order, so a cancel on the next line finds it
        let call = match dispatcher.begin(&request) {
            Ok(call) => call,
            Err(e) => {
                warn!(method = %request.method, code = e.code(), "Rejected request: {}", e);
                let _ = response_tx.send(JsonRpcResponse::error(request.id.clone(), e.into()));
                continue;
            }
        };

        let dispatcher = dispatcher.clone();
        let response_tx = response_tx.clone();
        tokio::spawn(async move {
            if let Some(response) = dispatcher.handle_with(request, call).await {
                // The writer only goes away once every handler has finished
                let _ = response_tx.send(response);
            }
        });
    }

    debug!("Transport reached end of input");
    dispatcher.cancel_all();
    drop(response_tx);

    let written = writer_task.await.context("Writer task panicked")?;
    dispatcher.detach_notifier();
    written
}

/// Single writer so lines from concurrent handlers never interleave.
/// Pending notifications go out before responses. Ends once every
/// response sender is gone.
async fn write_loop<W>(
    mut writer: W,
    mut responses: mpsc::UnboundedReceiver<JsonRpcResponse>,
    mut notifications: mpsc::UnboundedReceiver<JsonRpcRequest>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut notifications_open = true;

    loop {
        tokio::select! {
            biased;

            notification = notifications.recv(), if notifications_open => match notification {
                Some(notification) => write_message(&mut writer, &notification).await?,
                None => notifications_open = false,
            },
            response = responses.recv() => match response {
                Some(response) => write_message(&mut writer, &response).await?,
                None => break,
            },
        }
    }

    writer.flush().await.context("Failed to flush transport")?;
    Ok(())
}

async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = match serde_json::to_vec(message) {
        Ok(line) => line,
        Err(e) => {
            error!(error = %e, "Failed to serialize outgoing message");
            return Ok(());
        }
    };
    line.push(b'\n');

    writer
        .write_all(&line)
        .await
        .context("Failed to write to transport")?;
    writer.flush().await.context("Failed to flush transport")?;
    Ok(())
}
