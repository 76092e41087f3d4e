//! Subscriber seam and the WebSocket adapter behind `/ws/vm-status`.

use super::hub::StatusHub;
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use vmgate_core::{GateError, GateResult};

/// Write side of a registered subscriber, owned by the hub loop.
#[async_trait]
pub trait Subscriber: Send {
    async fn send_text(&mut self, text: &str) -> GateResult<()>;

    async fn close(&mut self);
}

/// Sink half of a subscriber's WebSocket.
pub struct WsSubscriber<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> WsSubscriber<S> {
    pub fn new(sink: SplitSink<WebSocketStream<S>, Message>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl<S> Subscriber for WsSubscriber<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_text(&mut self, text: &str) -> GateResult<()> {
        self.sink
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|e| GateError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

/// Serve one status subscriber until it disconnects.
///
/// Registers the write half with the hub (with `snapshot` as its first
/// message), then reads inbound frames only to notice close or error.
pub async fn serve_subscriber<S>(ws: WebSocketStream<S>, hub: StatusHub, snapshot: Option<String>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut stream) = ws.split();
    let id = match hub.register(Box::new(WsSubscriber::new(sink)), snapshot).await {
        Ok(id) => id,
        Err(e) => {
            debug!(error = %e, "could not register status subscriber");
            return;
        }
    };

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(subscriber = id, error = %e, "status subscriber read error");
                break;
            }
        }
    }

    hub.unregister(id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::HubConfig;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use vmgate_core::{BroadcastMessage, VmRecord, VmStatus};

    async fn connect(hub: &StatusHub, snapshot: &str) -> WebSocketStream<DuplexStream> {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        tokio::spawn(serve_subscriber(server, hub.clone(), Some(snapshot.to_string())));
        WebSocketStream::from_raw_socket(client_io, Role::Client, None).await
    }

    async fn next_text(ws: &mut WebSocketStream<DuplexStream>) -> String {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .expect("read error");
        match msg {
            Message::Text(t) => t,
            other => panic!("expected text, got {other:?}"),
        }
    }

    async fn wait_for_count(hub: &StatusHub, n: usize) {
        for _ in 0..100 {
            if hub.subscriber_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subscriber count never reached {n}");
    }

    #[tokio::test]
    async fn two_subscribers_receive_same_update() {
        let (hub, _task) = StatusHub::spawn(HubConfig::default());
        let snapshot = BroadcastMessage::VmList { vms: vec![] }.to_json().unwrap();
        let mut a = connect(&hub, &snapshot).await;
        let mut b = connect(&hub, &snapshot).await;
        assert_eq!(next_text(&mut a).await, snapshot);
        assert_eq!(next_text(&mut b).await, snapshot);

        let vm = VmRecord {
            id: 5,
            uuid: "u-5".into(),
            name: "echo".into(),
            cpu: 4,
            memory: 4096,
            status: VmStatus::Running,
        };
        assert!(hub.publish_vm_update(&vm));

        let got_a = next_text(&mut a).await;
        let got_b = next_text(&mut b).await;
        assert_eq!(got_a, got_b);
        assert_eq!(
            BroadcastMessage::from_json(&got_a).unwrap(),
            BroadcastMessage::VmUpdate { vm }
        );
    }

    #[tokio::test]
    async fn unread_client_is_evicted_without_stalling_others() {
        let (hub, _task) = StatusHub::spawn(HubConfig {
            capacity: 8,
            write_timeout: Duration::from_millis(100),
        });

        // Tiny pipe whose client end is never read.
        let (_stuck_client, stuck_server) = tokio::io::duplex(256);
        let server = WebSocketStream::from_raw_socket(stuck_server, Role::Server, None).await;
        tokio::spawn(serve_subscriber(server, hub.clone(), None));

        let mut good = connect(&hub, "[]").await;
        assert_eq!(next_text(&mut good).await, "[]");
        wait_for_count(&hub, 2).await;

        let big = "x".repeat(4096);
        assert!(hub.broadcast(big.clone()));
        assert_eq!(next_text(&mut good).await, big);
        assert!(hub.broadcast("second".into()));
        assert_eq!(next_text(&mut good).await, "second");
        wait_for_count(&hub, 1).await;
    }

    #[tokio::test]
    async fn disconnect_unregisters() {
        let (hub, _task) = StatusHub::spawn(HubConfig::default());
        let mut a = connect(&hub, "[]").await;
        next_text(&mut a).await;
        wait_for_count(&hub, 1).await;

        a.close(None).await.unwrap();
        drop(a);
        wait_for_count(&hub, 0).await;
    }
}
