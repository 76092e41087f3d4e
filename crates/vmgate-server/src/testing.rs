//! Shared fakes for unit tests.

use crate::backend::{Hypervisor, VmStore};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::io::DuplexStream;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use vmgate_core::{ControlEnvelope, GateError, GateResult, VmRecord, VmStatus};

/// Scriptable hypervisor.
pub struct FakeHypervisor {
    status: Mutex<VmStatus>,
    /// Whether `start` actually brings the VM up.
    boots: bool,
    start_error: Option<String>,
    port: Result<u16, String>,
    /// `live_status` fails this many times before answering.
    status_failures: AtomicUsize,
    pub starts: AtomicUsize,
}

impl FakeHypervisor {
    pub fn new(status: VmStatus) -> Self {
        Self {
            status: Mutex::new(status),
            boots: true,
            start_error: None,
            port: Err("no console".to_string()),
            status_failures: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Ok(port);
        self
    }

    pub fn with_port_error(mut self, msg: &str) -> Self {
        self.port = Err(msg.to_string());
        self
    }

    pub fn never_boots(mut self) -> Self {
        self.boots = false;
        self
    }

    pub fn failing_start(mut self, msg: &str) -> Self {
        self.start_error = Some(msg.to_string());
        self
    }

    pub fn failing_status_queries(self, n: usize) -> Self {
        self.status_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn live_status(&self, _name: &str) -> GateResult<VmStatus> {
        let failing = self
            .status_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(GateError::Hypervisor("failed to connect to the hypervisor".into()));
        }
        Ok(*self.status.lock().unwrap())
    }

    async fn start(&self, _name: &str) -> GateResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = &self.start_error {
            return Err(GateError::Hypervisor(msg.clone()));
        }
        if self.boots {
            *self.status.lock().unwrap() = VmStatus::Running;
        }
        Ok(())
    }

    async fn console_port(&self, _name: &str) -> GateResult<u16> {
        self.port.clone().map_err(GateError::Hypervisor)
    }
}

/// Store whose every call fails.
pub struct BrokenStore;

#[async_trait]
impl VmStore for BrokenStore {
    async fn find_by_uuid(&self, _uuid: &str) -> GateResult<Option<VmRecord>> {
        Err(GateError::Store("connection pool exhausted".into()))
    }

    async fn list(&self) -> GateResult<Vec<VmRecord>> {
        Err(GateError::Store("connection pool exhausted".into()))
    }

    async fn update_status(&self, _uuid: &str, _status: VmStatus) -> GateResult<()> {
        Err(GateError::Store("connection pool exhausted".into()))
    }
}

pub fn vm(uuid: &str, status: VmStatus) -> VmRecord {
    VmRecord {
        id: 1,
        uuid: uuid.to_string(),
        name: "alpha".to_string(),
        cpu: 2,
        memory: 2048,
        status,
    }
}

/// Server and client ends of an in-memory WebSocket.
pub async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    (server, client)
}

/// Read control envelopes until the first non-text frame or end of stream.
/// Returns the envelopes and whether a binary frame was seen.
pub async fn read_envelopes<S>(client: &mut WebSocketStream<S>) -> (Vec<ControlEnvelope>, Option<Vec<u8>>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    use futures_util::StreamExt;

    let mut envelopes = Vec::new();
    loop {
        let next = tokio::time::timeout(std::time::Duration::from_secs(10), client.next())
            .await
            .expect("timed out waiting for frame");
        match next {
            Some(Ok(Message::Text(t))) => envelopes.push(ControlEnvelope::from_json(&t).unwrap()),
            Some(Ok(Message::Binary(b))) => return (envelopes, Some(b)),
            _ => return (envelopes, None),
        }
    }
}

/// The `message` of every `status` envelope.
pub fn status_messages(envelopes: &[ControlEnvelope]) -> Vec<String> {
    envelopes
        .iter()
        .filter_map(|e| match e {
            ControlEnvelope::Status { message } => Some(message.clone()),
            _ => None,
        })
        .collect()
}
