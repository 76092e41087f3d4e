//! Hypervisor driver that shells out to `virsh`.

use super::Hypervisor;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, warn};
use vmgate_core::{GateError, GateResult, VmStatus};

/// First VNC port; display `:N` listens on `VNC_BASE_PORT + N`.
pub const VNC_BASE_PORT: u16 = 5900;
/// Exclusive upper bound of the fallback port scan.
const VNC_SCAN_END: u16 = 6000;

const PORT_ATTEMPTS: u32 = 10;
const PORT_INITIAL_DELAY: Duration = Duration::from_millis(200);
const PORT_DELAY_GROWTH: f64 = 1.5;
const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

pub struct VirshHypervisor {
    binary: String,
    /// Host the console servers listen on, used for port probes.
    console_host: String,
}

impl VirshHypervisor {
    pub fn new(console_host: impl Into<String>) -> Self {
        Self {
            binary: "virsh".to_string(),
            console_host: console_host.into(),
        }
    }

    /// Use a different `virsh` executable.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Run `virsh <args>`, returning trimmed stdout. Non-zero exit becomes a
    /// `Hypervisor` error carrying stderr.
    async fn run(&self, args: &[&str]) -> GateResult<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| GateError::Hypervisor(format!("failed to run {}: {e}", self.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(GateError::Hypervisor(stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn probe(&self, port: u16) -> bool {
        let addr = format!("{}:{}", self.console_host, port);
        matches!(
            tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        )
    }

    async fn scan(&self) -> Option<u16> {
        for port in VNC_BASE_PORT..VNC_SCAN_END {
            if self.probe(port).await {
                return Some(port);
            }
        }
        None
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn live_status(&self, name: &str) -> GateResult<VmStatus> {
        match self.run(&["domstate", name]).await {
            Ok(state) => Ok(parse_domstate(&state)),
            Err(GateError::Hypervisor(msg)) if is_missing_domain(&msg) => Ok(VmStatus::Stopped),
            Err(e) => Err(e),
        }
    }

    async fn start(&self, name: &str) -> GateResult<()> {
        self.run(&["start", name]).await.map(|_| ())
    }

    async fn console_port(&self, name: &str) -> GateResult<u16> {
        if !self.live_status(name).await?.is_running() {
            return Err(GateError::Hypervisor("VM is not running".to_string()));
        }

        let mut delay = PORT_INITIAL_DELAY;
        for attempt in 1..=PORT_ATTEMPTS {
            match self.run(&["vncdisplay", name]).await {
                Ok(out) => match parse_vncdisplay(&out) {
                    Some(port) if self.probe(port).await => return Ok(port),
                    Some(port) => debug!(vm_name = %name, port, attempt, "vnc port not listening yet"),
                    None => debug!(vm_name = %name, output = %out, attempt, "no vnc display yet"),
                },
                Err(e) => debug!(vm_name = %name, attempt, error = %e, "vncdisplay failed"),
            }

            if attempt == PORT_ATTEMPTS {
                if let Some(port) = self.scan().await {
                    warn!(vm_name = %name, port, "vnc port found by scan");
                    return Ok(port);
                }
                break;
            }

            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(PORT_DELAY_GROWTH);
        }

        Err(GateError::Hypervisor(format!(
            "VNC port not found after {PORT_ATTEMPTS} attempts"
        )))
    }
}

/// Map `virsh domstate` output onto a VM status. Any active state counts as
/// running.
pub fn parse_domstate(state: &str) -> VmStatus {
    match state.trim() {
        "shut off" | "crashed" | "" => VmStatus::Stopped,
        _ => VmStatus::Running,
    }
}

/// Parse `virsh vncdisplay` output (`:1`, `127.0.0.1:1`) into a TCP port.
pub fn parse_vncdisplay(output: &str) -> Option<u16> {
    let (_, display) = output.trim().rsplit_once(':')?;
    let display: u16 = display.parse().ok()?;
    VNC_BASE_PORT.checked_add(display)
}

fn is_missing_domain(stderr: &str) -> bool {
    stderr.contains("failed to get domain")
        || stderr.contains("not found")
        || stderr.contains("No such domain")
}
