//! vmgate-server: VM console tunnel and live status broadcast.
//!
//! Bridges browser WebSockets to per-VM VNC servers, starting the VM on
//! demand, and pushes VM status changes to subscribed dashboards.

mod auth;
mod backend;
mod broadcast;
mod config;
mod console;
mod server;
mod transport;

#[cfg(test)]
mod testing;

use anyhow::Context;
use backend::{spawn_periodic_sync, Hypervisor, VirshHypervisor, VmInventory, VmStore};
use broadcast::StatusHub;
use clap::Parser;
use config::ServerConfig;
use server::VmGateServer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// vmgate-server: VM console tunnel and status broadcast
#[derive(Parser, Debug)]
#[command(name = "vmgate-server", version, about = "VM console tunnel and status broadcast")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Generate self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// Config file path
    #[arg(long, default_value = "~/.vmgate/config.toml")]
    config: String,

    /// Allowed browser origin (repeatable; "*" allows any)
    #[arg(long = "allowed-origin")]
    allowed_origins: Vec<String>,

    /// HS256 secret for bearer tokens
    #[arg(long, env = "VMGATE_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "starting vmgate-server");

    // Resolve cert/key paths
    let (cert_path, key_path) = if cli.generate_cert {
        match generate_self_signed_cert() {
            Ok((c, k)) => {
                info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
                (Some(c), Some(k))
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    } else {
        (
            cli.cert.as_ref().map(PathBuf::from),
            cli.key.as_ref().map(PathBuf::from),
        )
    };

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.port,
        cli.bind.as_deref(),
        cert_path.as_ref().and_then(|p| p.to_str()),
        key_path.as_ref().and_then(|p| p.to_str()),
        &cli.allowed_origins,
        cli.jwt_secret.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    // Load TLS config
    let tls_config = match &server_config.tls {
        Some((cert, key)) => match load_tls_config(cert, key) {
            Ok(cfg) => Some(Arc::new(cfg)),
            Err(e) => {
                error!(error = %format!("{e:#}"), "failed to load TLS config");
                std::process::exit(1);
            }
        },
        None => None,
    };

    // Collaborators
    let (hub, _hub_task) = StatusHub::spawn(server_config.hub.clone());
    let inventory = VmInventory::new(server_config.vms.clone());
    info!(vms = inventory.len().await, "seeded vm inventory");
    let store: Arc<dyn VmStore> = Arc::new(inventory);
    let hypervisor: Arc<dyn Hypervisor> =
        Arc::new(VirshHypervisor::new(server_config.console.console_host.clone()));

    if let Some(interval) = server_config.sync_interval {
        spawn_periodic_sync(store.clone(), hypervisor.clone(), hub.clone(), interval);
        info!(interval_secs = interval.as_secs(), "periodic status sync enabled");
    }

    // Create server
    let vmgate = match VmGateServer::new(server_config, store, hypervisor, hub) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    // Run until shutdown signal
    tokio::select! {
        result = vmgate.run(tls_config) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("vmgate-server stopped");
}

/// Load TLS certificate and key from PEM files, returning a rustls ServerConfig.
fn load_tls_config(cert_path: &Path, key_path: &Path) -> anyhow::Result<rustls::ServerConfig> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("cannot read cert {}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .with_context(|| format!("cannot read key {}", key_path.display()))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .context("invalid certificate PEM")?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .context("invalid key PEM")?
        .context("no private key found in PEM")?;

    let mut tls_config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;

    // WebSocket upgrades ride on HTTP/1.1
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(tls_config)
}

/// Generate a self-signed certificate for development use.
fn generate_self_signed_cert() -> anyhow::Result<(PathBuf, PathBuf)> {
    let vmgate_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".vmgate");
    std::fs::create_dir_all(&vmgate_dir)?;

    let cert_path = vmgate_dir.join("cert.pem");
    let key_path = vmgate_dir.join("key.pem");

    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "vmgate-server dev cert");

    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
