//! Two-phase console connection over an upgraded WebSocket.
//!
//! A console connection starts in [`NegotiationPhase`], where the only
//! traffic is one JSON control envelope per text frame. Switching to
//! [`PassthroughPhase`] consumes the negotiation handle, so no envelope can
//! be written once raw binary relaying has begun.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use vmgate_core::{ControlEnvelope, ErrorEnvelope, GateError, GateResult};

/// Bound on writing a single control envelope or the closing handshake.
pub const ENVELOPE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct NegotiationPhase<S> {
    ws: WebSocketStream<S>,
}

impl<S> NegotiationPhase<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self { ws }
    }

    async fn send_envelope(&mut self, envelope: &ControlEnvelope) -> GateResult<()> {
        let text = envelope.to_json()?;
        match tokio::time::timeout(ENVELOPE_WRITE_TIMEOUT, self.ws.send(Message::Text(text))).await
        {
            Ok(result) => result.map_err(|e| GateError::Transport(format!("WS send failed: {e}"))),
            Err(_) => Err(GateError::Timeout),
        }
    }

    /// Emit a `status` progress envelope.
    pub async fn send_status(&mut self, message: impl Into<String>) -> GateResult<()> {
        self.send_envelope(&ControlEnvelope::status(message)).await
    }

    /// Emit exactly one `error` envelope, then close the connection.
    pub async fn fail(mut self, error: ErrorEnvelope) -> GateResult<()> {
        let code = error.code;
        let sent = self.send_envelope(&ControlEnvelope::Error(error)).await;
        self.close().await;
        if let Err(ref e) = sent {
            debug!(code = %code, error = %e, "error envelope not delivered");
        }
        sent
    }

    /// Close without a further envelope.
    pub async fn close(mut self) {
        let _ = tokio::time::timeout(ENVELOPE_WRITE_TIMEOUT, self.ws.close(None)).await;
    }

    /// End negotiation. Only raw frames may follow.
    pub fn into_passthrough(self) -> PassthroughPhase<S> {
        PassthroughPhase { ws: self.ws }
    }
}

pub struct PassthroughPhase<S> {
    ws: WebSocketStream<S>,
}

impl<S> PassthroughPhase<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn split(
        self,
    ) -> (
        SplitSink<WebSocketStream<S>, Message>,
        SplitStream<WebSocketStream<S>>,
    ) {
        self.ws.split()
    }
}
