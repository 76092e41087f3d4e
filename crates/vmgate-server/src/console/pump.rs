//! Tunnel Pump: dial the console server, then relay bytes both ways.

use crate::transport::websocket::{PassthroughPhase, ENVELOPE_WRITE_TIMEOUT};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use vmgate_core::{GateError, GateResult};

/// Retry policy for the console TCP dial. The delay between attempts is fixed.
#[derive(Debug, Clone)]
pub struct DialPolicy {
    pub attempts: u32,
    pub connect_timeout: Duration,
    pub retry_delay: Duration,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            connect_timeout: Duration::from_secs(3),
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Connect to `address` with bounded retries. The stream has `TCP_NODELAY` set.
pub async fn dial(address: &str, policy: &DialPolicy) -> GateResult<TcpStream> {
    let attempts = policy.attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(address = %address, error = %e, "set_nodelay failed");
                }
                return Ok(stream);
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = "connect timed out".to_string(),
        }
        debug!(address = %address, attempt, attempts, error = %last_error, "console dial failed");

        if attempt < attempts {
            tokio::time::sleep(policy.retry_delay).await;
        }
    }

    Err(GateError::Transport(format!(
        "dial {address} failed after {attempts} attempts: {last_error}"
    )))
}

/// Which leg ended the relay, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnd {
    ClientClosed,
    ClientError(String),
    ConsoleClosed,
    ConsoleError(String),
}

impl fmt::Display for RelayEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEnd::ClientClosed => f.write_str("client closed"),
            RelayEnd::ClientError(e) => write!(f, "client error: {e}"),
            RelayEnd::ConsoleClosed => f.write_str("console closed"),
            RelayEnd::ConsoleError(e) => write!(f, "console error: {e}"),
        }
    }
}

/// Relay between the client WebSocket and the console TCP stream until
/// either leg closes or fails, then tear both down.
///
/// Client frames (binary or text) are written to TCP verbatim. Console bytes
/// are read in `chunk_size` pieces and sent as binary frames.
pub async fn run_pump<S>(conn: PassthroughPhase<S>, tcp: TcpStream, chunk_size: usize) -> RelayEnd
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (ws_sink, mut ws_stream) = conn.split();
    let ws_sink = Arc::new(Mutex::new(ws_sink));
    let (mut tcp_read, mut tcp_write) = tcp.into_split();

    // One slot per direction.
    let (end_tx, mut end_rx) = mpsc::channel::<RelayEnd>(2);

    let tx = end_tx.clone();
    let client_to_console = tokio::spawn(async move {
        let end = loop {
            let data = match ws_stream.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Close(_))) | None => break RelayEnd::ClientClosed,
                Some(Ok(_)) => continue,
                Some(Err(e)) => break RelayEnd::ClientError(e.to_string()),
            };
            if let Err(e) = tcp_write.write_all(&data).await {
                break RelayEnd::ConsoleError(e.to_string());
            }
        };
        let _ = tx.send(end).await;
    });

    let tx = end_tx;
    let sink = ws_sink.clone();
    let chunk_size = chunk_size.max(1);
    let console_to_client = tokio::spawn(async move {
        let mut buf = vec![0u8; chunk_size];
        let end = loop {
            let n = match tcp_read.read(&mut buf).await {
                Ok(0) => break RelayEnd::ConsoleClosed,
                Ok(n) => n,
                Err(e) => break RelayEnd::ConsoleError(e.to_string()),
            };
            let mut sink = sink.lock().await;
            if let Err(e) = sink.send(Message::Binary(buf[..n].to_vec())).await {
                break RelayEnd::ClientError(e.to_string());
            }
        };
        let _ = tx.send(end).await;
    });

    let end = end_rx.recv().await.unwrap_or(RelayEnd::ClientClosed);

    client_to_console.abort();
    console_to_client.abort();
    let _ = client_to_console.await;
    let _ = console_to_client.await;

    let mut sink = ws_sink.lock().await;
    let _ = tokio::time::timeout(ENVELOPE_WRITE_TIMEOUT, sink.close()).await;

    end
}
