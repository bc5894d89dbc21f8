use std::path::Path;
use async_trait::async_trait;
use tracing::{error, info, warn};

use socktun_traits::cancel::CancelFlag;
use socktun_traits::config::{SessionConfig, Timings};
use socktun_traits::provision::Helper;
use socktun_traits::tunnel::{HelperPaths, TunnelError};

mod process;

pub use process::{ProcessHandle, ProcessPair};

/// Arguments for the PuTTY command line client.
///
/// `-batch` makes an unexpected host key fail the connection instead of prompting on a
/// console nobody is watching. `-D` opens the SOCKS listener only once the SSH session
/// is up, which is what the connection probe relies on.
pub fn tunnel_client_args(config: &SessionConfig) -> Vec<String> {
    vec![
        "-ssh".to_string(),
        "-C".to_string(),
        "-N".to_string(),
        "-batch".to_string(),
        "-P".to_string(),
        config.server_port.to_string(),
        "-l".to_string(),
        config.username.clone(),
        "-pw".to_string(),
        config.password.clone(),
        "-D".to_string(),
        config.local_socks_port.to_string(),
        config.server_address.clone(),
    ]
}

/// Arguments for polipo: chained to the SOCKS listener, no disk cache, no admin pages.
pub fn proxy_client_args(config: &SessionConfig) -> Vec<String> {
    vec![
        format!("proxyPort={}", config.local_http_port),
        format!("socksParentProxy=127.0.0.1:{}", config.local_socks_port),
        "diskCacheRoot=\"\"".to_string(),
        "disableLocalInterface=true".to_string(),
        "logLevel=1".to_string(),
    ]
}

/// The `TunnelService` trait defines the contract for running the helper pair.
#[async_trait]
pub trait TunnelService {
    fn new(timings: Timings) -> Self
    where
        Self: Sized;

    /// Starts the tunnel client, then the proxy client, into `processes`.
    ///
    /// A proxy failure leaves the tunnel client running in its slot; shutting the pair
    /// down is the caller's job.
    fn launch(
        &self,
        paths: &HelperPaths,
        config: &SessionConfig,
        processes: &mut ProcessPair,
    ) -> Result<(), TunnelError>;

    /// Graceful interrupt, grace period, forced kill, then waits for the helpers to be
    /// reaped. Returns whether both were seen gone.
    async fn shutdown(&self, processes: &mut ProcessPair, cancel: &CancelFlag) -> bool;

    /// Blocks while both helpers run and reports which one exited first.
    async fn watch(&self, processes: &mut ProcessPair, cancel: &CancelFlag) -> Option<Helper>;
}

pub struct TunnelServiceImpl {
    timings: Timings,
}

impl TunnelServiceImpl {
    fn spawn(&self, helper: Helper, path: &Path, args: Vec<String>) -> Result<ProcessHandle, TunnelError> {
        let mut cmd = std::process::Command::new(path);
        cmd.args(&args);

        // The tunnel client's argv carries the password.
        if helper == Helper::TunnelClient {
            info!("Spawning {}: {} (arguments hidden)", helper, path.display());
        } else {
            info!("Spawning {}: {} {}", helper, path.display(), args.join(" "));
        }

        ProcessHandle::spawn(helper, cmd).map_err(|source| {
            error!("Failed to spawn {} from {}: {}", helper, path.display(), source);
            TunnelError::Spawn {
                helper,
                path: path.to_path_buf(),
                source,
            }
        })
    }
}

#[async_trait]
impl TunnelService for TunnelServiceImpl {
    fn new(timings: Timings) -> Self {
        Self { timings }
    }

    fn launch(
        &self,
        paths: &HelperPaths,
        config: &SessionConfig,
        processes: &mut ProcessPair,
    ) -> Result<(), TunnelError> {
        let tunnel = self.spawn(
            Helper::TunnelClient,
            &paths.tunnel_client,
            tunnel_client_args(config),
        )?;
        processes.insert(tunnel);

        let proxy = self.spawn(
            Helper::ProxyClient,
            &paths.proxy_client,
            proxy_client_args(config),
        )?;
        processes.insert(proxy);

        Ok(())
    }

    async fn shutdown(&self, processes: &mut ProcessPair, cancel: &CancelFlag) -> bool {
        processes.signal_shutdown(self.timings.grace_period).await;

        let joined = processes
            .join(cancel, self.timings.poll_interval, self.timings.join_timeout)
            .await;
        if !joined {
            warn!("Helpers still running after shutdown; releasing them anyway");
        }
        joined
    }

    async fn watch(&self, processes: &mut ProcessPair, cancel: &CancelFlag) -> Option<Helper> {
        let exited = processes.wait_for_exit(cancel, self.timings.poll_interval).await;
        if let Some(helper) = exited {
            error!("{} exited unexpectedly", helper);
        }
        exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn session_config() -> SessionConfig {
        SessionConfig {
            server_address: "203.0.113.7".to_string(),
            server_port: 2222,
            server_host_key: String::new(),
            username: "tunnel".to_string(),
            password: "s3cret".to_string(),
            local_socks_port: 1081,
            local_http_port: 8081,
        }
    }

    fn fast_timings() -> Timings {
        Timings {
            grace_period: Duration::from_millis(20),
            poll_interval: Duration::from_millis(10),
            probe_ticks: 10,
            join_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_tunnel_client_args() {
        let args = tunnel_client_args(&session_config());
        assert_eq!(
            args,
            vec![
                "-ssh", "-C", "-N", "-batch", "-P", "2222", "-l", "tunnel", "-pw", "s3cret", "-D",
                "1081", "203.0.113.7",
            ]
        );
    }

    #[test]
    fn test_proxy_client_args() {
        let args = proxy_client_args(&session_config());
        assert_eq!(
            args,
            vec![
                "proxyPort=8081",
                "socksParentProxy=127.0.0.1:1081",
                "diskCacheRoot=\"\"",
                "disableLocalInterface=true",
                "logLevel=1",
            ]
        );
    }

    #[tokio::test]
    async fn test_tunnel_spawn_failure_skips_proxy() {
        let service = TunnelServiceImpl::new(fast_timings());
        let paths = HelperPaths {
            tunnel_client: PathBuf::from("/nonexistent/socktun/plink"),
            proxy_client: PathBuf::from("/bin/sh"),
        };
        let mut processes = ProcessPair::new();

        let err = service.launch(&paths, &session_config(), &mut processes).unwrap_err();

        assert!(matches!(err, TunnelError::Spawn { helper: Helper::TunnelClient, .. }));
        assert!(processes.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_proxy_spawn_failure_keeps_tunnel_client() {
        let service = TunnelServiceImpl::new(fast_timings());
        let paths = HelperPaths {
            tunnel_client: PathBuf::from("/bin/sh"),
            proxy_client: PathBuf::from("/nonexistent/socktun/polipo"),
        };
        let mut processes = ProcessPair::new();

        let err = service.launch(&paths, &session_config(), &mut processes).unwrap_err();

        assert!(matches!(err, TunnelError::Spawn { helper: Helper::ProxyClient, .. }));
        assert!(processes.get(Helper::TunnelClient).is_some());
        assert!(processes.get(Helper::ProxyClient).is_none());

        assert!(service.shutdown(&mut processes, &CancelFlag::new()).await);
        processes.release();
        assert!(processes.is_empty());
    }
}
