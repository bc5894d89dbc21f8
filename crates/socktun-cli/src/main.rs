use std::path::PathBuf;
use clap::{Parser, Subcommand};
use socktun_config::{HostKeyPolicy, expand_tilde, load_from, load_from_paths};
use socktun_logging::init_logging;
use socktun_provision::{ExecutableProvisioner, FileSource};
use socktun_proxy::{CommandSystemProxy, NoopSystemProxy};
use socktun_session::{SessionError, TunnelSession};
use socktun_traits::cancel::CancelFlag;
use socktun_traits::config::Config;
use socktun_traits::proxy::SystemProxy;
use socktun_trust::HostKeyFile;
use merge::Merge;
use tokio::signal;
use tracing::{info, warn, debug, error};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long)]
    pub server_address: Option<String>,
    #[arg(long)]
    pub server_port: Option<u16>,
    /// Base64 SSH public key of the server (ssh-rsa).
    #[arg(long)]
    pub server_host_key: Option<String>,
    #[arg(long)]
    pub username: Option<String>,
    #[arg(long, env = "SOCKTUN_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    #[arg(long)]
    pub local_socks_port: Option<u16>,
    #[arg(long)]
    pub local_http_port: Option<u16>,
    /// Path to the plink binary to provision; a bare name is looked up in PATH.
    #[arg(long)]
    pub tunnel_client_path: Option<String>,
    /// Path to the polipo binary to provision; a bare name is looked up in PATH.
    #[arg(long)]
    pub proxy_client_path: Option<String>,
    #[arg(long)]
    pub provision_dir: Option<String>,
    #[arg(long)]
    pub trust_store_path: Option<String>,
    /// best-effort or required
    #[arg(long)]
    pub host_key_policy: Option<HostKeyPolicy>,
    #[arg(long)]
    pub grace_period_ms: Option<u64>,
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,
    #[arg(long)]
    pub probe_ticks: Option<u32>,
    #[arg(long)]
    pub join_timeout_ms: Option<u64>,
    /// Shell command that points the system at the local HTTP proxy ({host}, {port}).
    #[arg(long)]
    pub system_proxy_configure_command: Option<String>,
    #[arg(long)]
    pub system_proxy_revert_command: Option<String>,
    #[arg(long)]
    pub log_level: Option<String>,
    #[arg(long)]
    pub config: Option<String>,
    #[arg(long)]
    pub no_color: bool,
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Starts the SSH tunnel and the HTTP proxy and keeps them running until Ctrl+C.
    Connect,
    /// Writes the server host key into the tunnel client's host key cache.
    RegisterHostKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- Configuration Setup ---
    let file_config = match &cli.config {
        Some(path) => load_from(expand_path(path)?)?,
        None => load_from_paths()?,
    };
    let cli_config = Config {
        server_address: cli.server_address,
        server_port: cli.server_port,
        server_host_key: cli.server_host_key,
        username: cli.username,
        password: cli.password,
        local_socks_port: cli.local_socks_port,
        local_http_port: cli.local_http_port,
        tunnel_client_path: cli.tunnel_client_path,
        proxy_client_path: cli.proxy_client_path,
        provision_dir: cli.provision_dir,
        trust_store_path: cli.trust_store_path,
        host_key_policy: cli.host_key_policy,
        grace_period_ms: cli.grace_period_ms,
        poll_interval_ms: cli.poll_interval_ms,
        probe_ticks: cli.probe_ticks,
        join_timeout_ms: cli.join_timeout_ms,
        system_proxy_configure_command: cli.system_proxy_configure_command,
        system_proxy_revert_command: cli.system_proxy_revert_command,
        log_level: cli.log_level,
    };
    let mut config = Config::default();
    config.merge(file_config);
    config.merge(cli_config);

    // --- Logging ---
    init_logging(config.log_level.as_deref().unwrap_or("info"), !cli.no_color)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    debug!("Final configuration: {:#?}", config);

    match cli.command {
        Commands::Connect => connect(&config, cli.dry_run).await,
        Commands::RegisterHostKey => register_host_key(&config, cli.dry_run),
    }
}

async fn connect(config: &Config, dry_run: bool) -> anyhow::Result<()> {
    let session_config = config.session_config()?;
    let timings = config.timings()?;
    let tunnel_client_path = required_path(&config.tunnel_client_path, "tunnel_client_path")?;
    let proxy_client_path = required_path(&config.proxy_client_path, "proxy_client_path")?;
    let trust_store_path = required_path(&config.trust_store_path, "trust_store_path")?;

    if dry_run {
        info!("[dry-run] Would execute the following steps:");
        info!("[dry-run] 1. Provision {} and {}", tunnel_client_path.display(), proxy_client_path.display());
        info!("[dry-run] 2. Register the host key of {}:{} in {}", session_config.server_address, session_config.server_port, trust_store_path.display());
        info!("[dry-run] 3. Start the SSH tunnel with a SOCKS listener on port {}", session_config.local_socks_port);
        info!("[dry-run] 4. Start the HTTP proxy on port {}", session_config.local_http_port);
        info!("[dry-run] 5. Wait up to {:?} for the SOCKS listener", timings.poll_interval * timings.probe_ticks);
        info!("[dry-run] 6. On exit, stop both processes and revert the system proxy");
        return Ok(());
    }

    let source = FileSource::new(tunnel_client_path, proxy_client_path);
    let provisioner = match &config.provision_dir {
        Some(dir) => ExecutableProvisioner::with_dir(source, expand_path(dir)?),
        None => ExecutableProvisioner::new(source),
    };
    let system_proxy: Box<dyn SystemProxy> = match &config.system_proxy_configure_command {
        Some(command) => Box::new(CommandSystemProxy::new(
            command.clone(),
            config.system_proxy_revert_command.clone(),
            session_config.local_http_port,
        )),
        None => Box::new(NoopSystemProxy),
    };

    // Set up graceful shutdown
    let cancel = CancelFlag::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received shutdown signal. Cleaning up...");
            canceller.cancel();
        }
    });

    let mut session = TunnelSession::new(
        provisioner,
        HostKeyFile::new(trust_store_path),
        system_proxy,
        cancel.clone(),
    )
    .with_timings(timings)
    .with_host_key_policy(config.host_key_policy());

    if let Err(e) = session.connect(&session_config).await {
        error!("Connect failed: {}", e);
        session.disconnect().await;
        return Err(e.into());
    }

    match session.wait_for_connected().await {
        Ok(true) => {}
        Ok(false) => {
            session.disconnect().await;
            if cancel.is_cancelled() {
                info!("Connection attempt cancelled.");
                return Ok(());
            }
            return Err(SessionError::ConnectionTimeout.into());
        }
        Err(e) => {
            session.disconnect().await;
            return Err(e.into());
        }
    }

    info!("HTTP proxy is now running on 127.0.0.1:{}", session_config.local_http_port);
    info!("SOCKS proxy is now running on 127.0.0.1:{}", session_config.local_socks_port);
    info!("Press Ctrl+C to exit.");

    // Wait for either helper to exit or for a shutdown signal
    let exited = session.watch().await;
    session.disconnect().await;

    match exited {
        Some(helper) => anyhow::bail!("{} exited unexpectedly", helper),
        None => {
            info!("Shutdown complete.");
            Ok(())
        }
    }
}

fn register_host_key(config: &Config, dry_run: bool) -> anyhow::Result<()> {
    let session_config = config.session_config()?;
    let trust_store_path = required_path(&config.trust_store_path, "trust_store_path")?;

    if dry_run {
        let record = socktun_trust::encode_host_key(
            &session_config.server_address,
            session_config.server_port,
            &session_config.server_host_key,
        )?;
        info!("[dry-run] Would write {} to {}", record.key_name(), trust_store_path.display());
        return Ok(());
    }

    let mut store = HostKeyFile::new(&trust_store_path);
    let record = socktun_trust::register(
        &mut store,
        &session_config.server_address,
        session_config.server_port,
        &session_config.server_host_key,
    )?;
    info!("Stored {} in {}", record.key_name(), trust_store_path.display());
    Ok(())
}

fn required_path(value: &Option<String>, field: &'static str) -> anyhow::Result<PathBuf> {
    let path = value
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("Missing required setting '{}'", field))?;
    expand_path(path)
}

fn expand_path(path: &str) -> anyhow::Result<PathBuf> {
    expand_tilde(path).ok_or_else(|| anyhow::anyhow!("Could not resolve home directory for '{}'", path))
}
