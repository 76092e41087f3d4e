//! Console tunnel pipeline: resolve and ready the VM, dial its console,
//! admit the session, then pump bytes until either side goes away.

pub mod orchestrator;
pub mod pump;
pub mod session;

pub use orchestrator::{ReadinessOrchestrator, ReadinessPolicy};
pub use pump::{dial, run_pump, DialPolicy, RelayEnd};
pub use session::{ConsoleSession, ConsoleSessionManager, SessionLimits};

use crate::transport::NegotiationPhase;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use vmgate_core::{ErrorCode, ErrorEnvelope, GateError, Principal, VmRecord};

/// Why negotiation stopped short of the pump.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Report this envelope to the client, then close.
    #[error("rejected: {0}")]
    Rejected(ErrorEnvelope),
    /// The client connection itself failed; nothing more can be sent.
    #[error(transparent)]
    Transport(#[from] GateError),
}

impl From<ErrorEnvelope> for StageError {
    fn from(e: ErrorEnvelope) -> Self {
        StageError::Rejected(e)
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// Host the console servers listen on.
    pub console_host: String,
    pub dial: DialPolicy,
    /// Read size for console-to-client relaying.
    pub chunk_size: usize,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            console_host: "localhost".to_string(),
            dial: DialPolicy::default(),
            chunk_size: 4096,
        }
    }
}

/// Everything the pump needs once negotiation succeeds.
struct Established {
    vm: VmRecord,
    tcp: TcpStream,
    session: ConsoleSession,
}

pub struct ConsoleService {
    orchestrator: ReadinessOrchestrator,
    sessions: Arc<ConsoleSessionManager>,
    config: ConsoleConfig,
}

impl ConsoleService {
    pub fn new(
        orchestrator: ReadinessOrchestrator,
        sessions: Arc<ConsoleSessionManager>,
        config: ConsoleConfig,
    ) -> Self {
        Self {
            orchestrator,
            sessions,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<ConsoleSessionManager> {
        &self.sessions
    }

    /// Drive one upgraded console connection to completion.
    pub async fn serve<S>(
        &self,
        ws: WebSocketStream<S>,
        principal: Principal,
        vm_uuid: Option<String>,
        remote_addr: Option<SocketAddr>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut conn = NegotiationPhase::new(ws);

        let established = match self
            .negotiate(&mut conn, &principal, vm_uuid.as_deref(), remote_addr)
            .await
        {
            Ok(established) => established,
            Err(StageError::Rejected(envelope)) => {
                warn!(
                    code = %envelope.code,
                    vm_uuid = vm_uuid.as_deref().unwrap_or(""),
                    user_id = principal.user_id,
                    username = %principal.username,
                    "console request rejected"
                );
                let _ = conn.fail(envelope).await;
                return;
            }
            Err(StageError::Transport(e)) => {
                debug!(user_id = principal.user_id, error = %e, "client gone during negotiation");
                conn.close().await;
                return;
            }
        };

        let Established { vm, tcp, session } = established;
        let end = run_pump(conn.into_passthrough(), tcp, self.config.chunk_size).await;

        info!(
            vm_uuid = %vm.uuid,
            vm_name = %vm.name,
            user_id = principal.user_id,
            username = %principal.username,
            session_id = %session.id,
            end = %end,
            "console session closed"
        );
        self.sessions.end(&session.id, &end.to_string()).await;
    }

    async fn negotiate<S>(
        &self,
        conn: &mut NegotiationPhase<S>,
        principal: &Principal,
        vm_uuid: Option<&str>,
        remote_addr: Option<SocketAddr>,
    ) -> Result<Established, StageError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        conn.send_status("Connected, checking VM status...").await?;

        let mut vm = self.orchestrator.resolve(vm_uuid).await?;
        let port = self.orchestrator.prepare(conn, &mut vm).await?;

        let address = format!("{}:{}", self.config.console_host, port);
        conn.send_status(format!("Connecting to VNC server on port {port}..."))
            .await?;
        let tcp = match dial(&address, &self.config.dial).await {
            Ok(tcp) => tcp,
            Err(e) => {
                warn!(vm_uuid = %vm.uuid, vm_name = %vm.name, address = %address, error = %e, stage = "dial", "console dial failed");
                return Err(ErrorEnvelope::new(ErrorCode::VncConnectionFailed)
                    .with_vm_uuid(vm.uuid.clone())
                    .with_address(address)
                    .with_message("VNC server not ready. Please wait a moment and try again.")
                    .into());
            }
        };

        let session = self.sessions.admit(principal, &vm.uuid, remote_addr).await?;

        if let Err(e) = conn
            .send_status("VNC connection established, starting proxy...")
            .await
        {
            self.sessions.end(&session.id, "client gone before relay").await;
            return Err(e.into());
        }

        info!(
            vm_uuid = %vm.uuid,
            vm_name = %vm.name,
            user_id = principal.user_id,
            username = %principal.username,
            address = %address,
            "console tunnel established"
        );
        Ok(Established { vm, tcp, session })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Hypervisor, VmInventory, VmStore};
    use crate::broadcast::{HubConfig, StatusHub};
    use crate::testing::{read_envelopes, status_messages, vm, ws_pair, BrokenStore, FakeHypervisor};
    use futures_util::SinkExt;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;
    use vmgate_core::{ControlEnvelope, VmStatus};

    fn principal() -> Principal {
        Principal {
            user_id: 11,
            username: "riley".into(),
            role: "user".into(),
            approved: true,
        }
    }

    fn service(
        store: Arc<dyn VmStore>,
        hv: Arc<dyn Hypervisor>,
        limits: SessionLimits,
    ) -> Arc<ConsoleService> {
        let (hub, _task) = StatusHub::spawn(HubConfig::default());
        let orchestrator = ReadinessOrchestrator::new(
            store,
            hv,
            hub,
            ReadinessPolicy {
                start_timeout: Duration::from_millis(500),
                poll_interval: Duration::from_millis(50),
            },
        );
        Arc::new(ConsoleService::new(
            orchestrator,
            Arc::new(ConsoleSessionManager::new(limits)),
            ConsoleConfig {
                console_host: "127.0.0.1".into(),
                dial: DialPolicy {
                    attempts: 3,
                    connect_timeout: Duration::from_millis(500),
                    retry_delay: Duration::from_millis(20),
                },
                chunk_size: 4096,
            },
        ))
    }

    fn only_error(envelopes: &[ControlEnvelope]) -> ErrorEnvelope {
        let errors: Vec<&ErrorEnvelope> = envelopes
            .iter()
            .filter_map(|e| match e {
                ControlEnvelope::Error(err) => Some(err),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1, "expected exactly one error envelope");
        // The error is always the last envelope.
        assert!(matches!(envelopes.last(), Some(ControlEnvelope::Error(_))));
        errors[0].clone()
    }

    async fn run(
        svc: Arc<ConsoleService>,
        vm_uuid: Option<&str>,
    ) -> (Vec<ControlEnvelope>, Option<Vec<u8>>) {
        let (server, mut client) = ws_pair().await;
        let vm_uuid = vm_uuid.map(str::to_string);
        let task = tokio::spawn(async move { svc.serve(server, principal(), vm_uuid, None).await });
        let out = read_envelopes(&mut client).await;
        drop(client);
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        out
    }

    #[tokio::test]
    async fn missing_vm_uuid() {
        let svc = service(
            Arc::new(VmInventory::new(vec![])),
            Arc::new(FakeHypervisor::new(VmStatus::Running)),
            SessionLimits::default(),
        );
        let (envelopes, binary) = run(svc, None).await;
        assert_eq!(only_error(&envelopes).code, ErrorCode::MissingVmUuid);
        assert!(binary.is_none());

        let json = ControlEnvelope::Error(only_error(&envelopes)).to_json().unwrap();
        assert!(json.contains(r#""code":"MISSING_VM_UUID""#));
    }

    #[tokio::test]
    async fn unknown_vm() {
        let svc = service(
            Arc::new(VmInventory::new(vec![vm("u-1", VmStatus::Running)])),
            Arc::new(FakeHypervisor::new(VmStatus::Running)),
            SessionLimits::default(),
        );
        let (envelopes, _) = run(svc, Some("ghost")).await;
        let err = only_error(&envelopes);
        assert_eq!(err.code, ErrorCode::VmNotFound);
        assert_eq!(err.vm_uuid.as_deref(), Some("ghost"));
    }

    #[tokio::test]
    async fn store_failure_sends_one_db_error() {
        let hv = Arc::new(FakeHypervisor::new(VmStatus::Running).with_port(5901));
        let svc = service(Arc::new(BrokenStore), hv.clone(), SessionLimits::default());
        let (envelopes, binary) = run(svc.clone(), Some("u-1")).await;

        let err = only_error(&envelopes);
        assert_eq!(err.code, ErrorCode::DbError);
        assert!(err.details.is_none());
        assert!(binary.is_none());
        assert_eq!(
            status_messages(&envelopes),
            vec!["Connected, checking VM status..."]
        );
        assert_eq!(hv.start_count(), 0);
        assert_eq!(svc.sessions().count().await, 0);
    }

    #[tokio::test]
    async fn stopped_vm_starts_and_pumps() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"RFB 003.008\n").await.unwrap();
            let mut buf = [0u8; 64];
            let _ = sock.read(&mut buf).await;
        });

        let hv = Arc::new(FakeHypervisor::new(VmStatus::Stopped).with_port(port));
        let svc = service(
            Arc::new(VmInventory::new(vec![vm("u-1", VmStatus::Stopped)])),
            hv.clone(),
            SessionLimits::default(),
        );
        let (envelopes, binary) = run(svc, Some("u-1")).await;

        assert!(envelopes
            .iter()
            .all(|e| matches!(e, ControlEnvelope::Status { .. })));
        let statuses = status_messages(&envelopes);
        let expected = [
            "Starting VM...".to_string(),
            "Getting VNC port...".to_string(),
            format!("Connecting to VNC server on port {port}..."),
        ];
        let positions: Vec<usize> = expected
            .iter()
            .map(|m| statuses.iter().position(|s| s == m).expect(m))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(
            statuses.last().map(String::as_str),
            Some("VNC connection established, starting proxy...")
        );
        assert_eq!(binary.as_deref(), Some(&b"RFB 003.008\n"[..]));
        assert_eq!(hv.start_count(), 1);
    }

    #[tokio::test]
    async fn dial_exhausts_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let svc = service(
            Arc::new(VmInventory::new(vec![vm("u-1", VmStatus::Running)])),
            Arc::new(FakeHypervisor::new(VmStatus::Running).with_port(port)),
            SessionLimits::default(),
        );
        let (envelopes, _) = run(svc.clone(), Some("u-1")).await;
        let err = only_error(&envelopes);
        assert_eq!(err.code, ErrorCode::VncConnectionFailed);
        assert_eq!(err.address, Some(format!("127.0.0.1:{port}")));
        assert_eq!(svc.sessions().count().await, 0);
    }

    #[tokio::test]
    async fn session_limit_rejects_and_releases() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let _ = sock.write_all(b"RFB 003.008\n").await;
                    let mut buf = [0u8; 64];
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });

        let svc = service(
            Arc::new(VmInventory::new(vec![vm("u-1", VmStatus::Running)])),
            Arc::new(FakeHypervisor::new(VmStatus::Running).with_port(port)),
            SessionLimits {
                max_sessions_per_user: 1,
                reconnect_limit: 10,
                reconnect_window: Duration::from_secs(30),
            },
        );

        // First session stays open.
        let (server, mut first) = ws_pair().await;
        let s = svc.clone();
        let first_task =
            tokio::spawn(async move { s.serve(server, principal(), Some("u-1".into()), None).await });
        let (_, binary) = read_envelopes(&mut first).await;
        assert!(binary.is_some());
        assert_eq!(svc.sessions().count().await, 1);

        let (envelopes, _) = run(svc.clone(), Some("u-1")).await;
        assert_eq!(only_error(&envelopes).code, ErrorCode::SessionLimitExceeded);

        // Closing the first tunnel frees the slot.
        first.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), first_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(svc.sessions().count().await, 0);
    }

    #[tokio::test]
    async fn client_frames_reach_console() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let console = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"RFB 003.008\n").await.unwrap();
            let mut buf = [0u8; 12];
            sock.read_exact(&mut buf).await.unwrap();
            buf
        });

        let svc = service(
            Arc::new(VmInventory::new(vec![vm("u-1", VmStatus::Running)])),
            Arc::new(FakeHypervisor::new(VmStatus::Running).with_port(port)),
            SessionLimits::default(),
        );
        let (server, mut client) = ws_pair().await;
        let s = svc.clone();
        tokio::spawn(async move { s.serve(server, principal(), Some("u-1".into()), None).await });

        let (_, banner) = read_envelopes(&mut client).await;
        assert!(banner.is_some());
        client
            .send(Message::Binary(b"RFB 003.008\n".to_vec()))
            .await
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), console)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got, b"RFB 003.008\n");
    }
}
