//! One tunnel session: a tunnel client exposing a local SOCKS port and an HTTP proxy
//! chained to it, started and stopped as a unit.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
//! ```
//!
//! `connect` starts both helpers without waiting for the tunnel. `wait_for_connected`
//! probes the SOCKS port and turns the system proxy on. `disconnect` is always safe and
//! always reverts the system proxy.

use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

use socktun_provision::ExecutableProvisioner;
use socktun_ssh::{ProcessPair, TunnelService, TunnelServiceImpl};
use socktun_traits::cancel::CancelFlag;
use socktun_traits::config::{HostKeyPolicy, SessionConfig, Timings};
use socktun_traits::provision::{ExecutableSource, Helper, ProvisionError};
use socktun_traits::proxy::SystemProxy;
use socktun_traits::trust::{TrustError, TrustStore};
use socktun_traits::tunnel::TunnelError;

pub mod probe;

pub use probe::wait_for_connected;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Provisioning failed: {0}")]
    Provision(#[from] ProvisionError),
    #[error("Launch failed: {0}")]
    Tunnel(#[from] TunnelError),
    #[error("Host key registration failed: {0}")]
    Trust(#[from] TrustError),
    #[error("Tunnel did not come up in time or the attempt was cancelled")]
    ConnectionTimeout,
    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Owns the helper processes of one tunnel and the collaborators needed to run them.
///
/// Methods take `&mut self`; callers that share a session across tasks must serialize
/// access themselves. The only state shared with other tasks is the [`CancelFlag`].
pub struct TunnelSession<S: ExecutableSource, T: TrustStore, P: SystemProxy> {
    state: SessionState,
    provisioner: ExecutableProvisioner<S>,
    trust_store: T,
    system_proxy: P,
    service: TunnelServiceImpl,
    processes: ProcessPair,
    cancel: CancelFlag,
    timings: Timings,
    host_key_policy: HostKeyPolicy,
    local_socks_port: Option<u16>,
}

impl<S: ExecutableSource, T: TrustStore, P: SystemProxy> TunnelSession<S, T, P> {
    pub fn new(
        provisioner: ExecutableProvisioner<S>,
        trust_store: T,
        system_proxy: P,
        cancel: CancelFlag,
    ) -> Self {
        let timings = Timings::default();
        Self {
            state: SessionState::Disconnected,
            provisioner,
            trust_store,
            system_proxy,
            service: TunnelServiceImpl::new(timings),
            processes: ProcessPair::new(),
            cancel,
            timings,
            host_key_policy: HostKeyPolicy::default(),
            local_socks_port: None,
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self.service = TunnelServiceImpl::new(timings);
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn trust_store(&self) -> &T {
        &self.trust_store
    }

    pub fn system_proxy(&self) -> &P {
        &self.system_proxy
    }

    pub fn processes(&self) -> &ProcessPair {
        &self.processes
    }

    fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("Session {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Provisions the helpers, tears down whatever ran before, registers the host key
    /// and starts both helpers. Returns before the tunnel is established.
    ///
    /// On a launch error the session stays `Connecting` with any helper that did start;
    /// call [`disconnect`](Self::disconnect) to clean up.
    pub async fn connect(&mut self, config: &SessionConfig) -> Result<(), SessionError> {
        info!(
            "Connecting to {}:{} as {}",
            config.server_address, config.server_port, config.username
        );

        let paths = self.provisioner.provision_all()?;

        self.disconnect().await;
        self.transition(SessionState::Connecting)?;

        if let Err(e) = socktun_trust::register(
            &mut self.trust_store,
            &config.server_address,
            config.server_port,
            &config.server_host_key,
        ) {
            match self.host_key_policy {
                HostKeyPolicy::BestEffort => {
                    warn!("Host key not registered, continuing without it: {}", e);
                }
                HostKeyPolicy::Required => {
                    self.transition(SessionState::Disconnected)?;
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = self.service.launch(&paths, config, &mut self.processes) {
            if self.processes.is_empty() {
                self.transition(SessionState::Disconnected)?;
            }
            return Err(e.into());
        }

        self.local_socks_port = Some(config.local_socks_port);
        Ok(())
    }

    /// Probes the SOCKS endpoint. `Ok(false)` means timed out or cancelled; the caller
    /// decides whether to retry or disconnect.
    pub async fn wait_for_connected(&mut self) -> Result<bool, SessionError> {
        let port = match (self.state, self.local_socks_port) {
            (SessionState::Connecting, Some(port)) => port,
            _ => {
                return Err(SessionError::InvalidTransition {
                    from: self.state,
                    to: SessionState::Connected,
                });
            }
        };

        let connected =
            probe::wait_for_connected(port, &self.cancel, &self.timings, &mut self.system_proxy).await;
        if connected {
            self.transition(SessionState::Connected)?;
        }
        Ok(connected)
    }

    /// Blocks while both helpers are alive. Returns the helper that exited first, or
    /// `None` when cancelled or when no complete pair is running.
    pub async fn watch(&mut self) -> Option<Helper> {
        match self.state {
            SessionState::Connecting | SessionState::Connected => {
                self.service.watch(&mut self.processes, &self.cancel).await
            }
            _ => None,
        }
    }

    /// Stops both helpers and reverts the system proxy. Safe from any state and
    /// idempotent.
    pub async fn disconnect(&mut self) {
        let was_connected = self.state == SessionState::Connected;
        match self.state {
            SessionState::Connecting | SessionState::Connected => {
                // Both edges are always valid.
                let _ = self.transition(SessionState::Disconnecting);
            }
            // A previous disconnect was interrupted; finish it.
            SessionState::Disconnecting => {}
            SessionState::Disconnected => {
                if !self.processes.is_empty() {
                    warn!("Helpers present while disconnected, stopping them");
                }
            }
        }

        if !self.processes.is_empty() {
            self.service.shutdown(&mut self.processes, &self.cancel).await;
        }
        self.processes.release();
        self.local_socks_port = None;

        if let Err(e) = self.system_proxy.revert() {
            warn!("Failed to revert system proxy: {}", e);
        }

        if self.state != SessionState::Disconnected {
            debug!("Session {} -> {}", self.state, SessionState::Disconnected);
            self.state = SessionState::Disconnected;
        }
        if was_connected {
            info!("Tunnel disconnected");
        }
    }
}

impl<S: ExecutableSource, T: TrustStore, P: SystemProxy> Drop for TunnelSession<S, T, P> {
    fn drop(&mut self) {
        if self.state == SessionState::Disconnected && self.processes.is_empty() {
            return;
        }
        warn!("Tunnel session dropped while {}, killing helpers", self.state);
        self.processes.release();
        if let Err(e) = self.system_proxy.revert() {
            warn!("Failed to revert system proxy: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use socktun_provision::EmbeddedSource;
    use socktun_traits::proxy::ProxyError;
    use socktun_trust::MemoryTrustStore;

    const IDLE_SCRIPT: &[u8] = b"#!/bin/sh\nexec sleep 30\n";
    const BROKEN_SCRIPT: &[u8] = b"#!/nonexistent/socktun-interpreter\n";
    const STUBBORN_SCRIPT: &[u8] = b"#!/bin/sh\ntrap '' INT\nwhile :; do sleep 1; done\n";
    // "ssh-rsa", e = 0x010001, n = 0x0000c30fa0
    const RSA_KEY: &str = "AAAAB3NzaC1yc2EAAAADAQABAAAABQAAww+g";

    /// Serializes tests that write helper executables and then spawn them, so no
    /// concurrent fork holds a write handle to a file we are about to exec.
    static SPAWN_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

    #[derive(Default)]
    struct RecordingProxy {
        configured: usize,
        reverted: usize,
    }

    impl SystemProxy for RecordingProxy {
        fn configure(&mut self) -> Result<(), ProxyError> {
            self.configured += 1;
            Ok(())
        }

        fn revert(&mut self) -> Result<(), ProxyError> {
            self.reverted += 1;
            Ok(())
        }
    }

    type TestSession = TunnelSession<EmbeddedSource, MemoryTrustStore, RecordingProxy>;

    fn session(dir: &tempfile::TempDir, proxy_client: &'static [u8]) -> TestSession {
        let source = EmbeddedSource {
            tunnel_client: Some(IDLE_SCRIPT),
            proxy_client: Some(proxy_client),
        };
        TunnelSession::new(
            ExecutableProvisioner::with_dir(source, dir.path()),
            MemoryTrustStore::new(),
            RecordingProxy::default(),
            CancelFlag::new(),
        )
        .with_timings(Timings {
            grace_period: Duration::from_millis(20),
            poll_interval: Duration::from_millis(20),
            probe_ticks: 5,
            join_timeout: Duration::from_secs(2),
        })
    }

    fn session_config(local_socks_port: u16, host_key: &str) -> SessionConfig {
        SessionConfig {
            server_address: "203.0.113.7".to_string(),
            server_port: 22,
            server_host_key: host_key.to_string(),
            username: "tunnel".to_string(),
            password: "s3cret".to_string(),
            local_socks_port,
            local_http_port: 18080,
        }
    }

    #[test]
    fn test_state_transitions() {
        use SessionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnecting));
        assert!(Disconnecting.can_transition_to(Disconnected));
        assert!(Connecting.can_transition_to(Disconnecting));

        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Connected.can_transition_to(Disconnected));
        assert!(!Disconnecting.can_transition_to(Connecting));
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir, IDLE_SCRIPT);

        session.disconnect().await;
        session.disconnect().await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.system_proxy().configured, 0);
        assert_eq!(session.system_proxy().reverted, 2);
    }

    #[tokio::test]
    async fn test_wait_for_connected_requires_connect() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir, IDLE_SCRIPT);

        let result = session.wait_for_connected().await;
        assert!(matches!(
            result,
            Err(SessionError::InvalidTransition { from: SessionState::Disconnected, .. })
        ));
    }

    #[tokio::test]
    async fn test_required_host_key_blocks_launch() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir, IDLE_SCRIPT).with_host_key_policy(HostKeyPolicy::Required);

        let err = session.connect(&session_config(1, "not base64!")).await.unwrap_err();

        assert!(matches!(err, SessionError::Trust(TrustError::Decode(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.processes().is_empty());
        assert!(session.trust_store().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_disconnect_kills_helper_ignoring_interrupt() {
        let _guard = SPAWN_LOCK.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir, STUBBORN_SCRIPT);

        session.connect(&session_config(1, RSA_KEY)).await.unwrap();
        let pid = session.processes().get(Helper::ProxyClient).unwrap().pid();
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        session.disconnect().await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.processes().is_empty());
        // SAFETY: signal 0 only checks for existence.
        let alive = unsafe { libc::kill(pid as libc::pid_t, 0) == 0 };
        assert!(!alive);
        assert_eq!(session.system_proxy().reverted, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_probe_and_disconnect() {
        let _guard = SPAWN_LOCK.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir, IDLE_SCRIPT);

        // Stand-in for the SOCKS listener the tunnel client would open.
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        session.connect(&session_config(port, RSA_KEY)).await.unwrap();
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.processes().get(Helper::TunnelClient).is_some());
        assert!(session.processes().get(Helper::ProxyClient).is_some());
        assert_eq!(
            session.trust_store().get("rsa2@22:203.0.113.7"),
            Some("0x010001,0xc30fa0")
        );

        assert!(session.wait_for_connected().await.unwrap());
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.system_proxy().configured, 1);

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.processes().is_empty());
        assert_eq!(session.system_proxy().reverted, 2);

        // The session can be reused and provisions nothing new.
        session.connect(&session_config(port, RSA_KEY)).await.unwrap();
        assert_eq!(session.state(), SessionState::Connecting);
        session.disconnect().await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_best_effort_host_key_still_launches() {
        let _guard = SPAWN_LOCK.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir, IDLE_SCRIPT);

        let ed25519 = "AAAAC3NzaC1lZDI1NTE5AAAAIAABAgMEBQYHCAkKCwwNDg8QERITFBUWFxgZGhscHR4f";
        session.connect(&session_config(1, ed25519)).await.unwrap();

        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.trust_store().is_empty());

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_timeout_leaves_session_connecting() {
        let _guard = SPAWN_LOCK.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir, IDLE_SCRIPT);

        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        session.connect(&session_config(port, RSA_KEY)).await.unwrap();
        assert!(!session.wait_for_connected().await.unwrap());
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.system_proxy().configured, 0);

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.processes().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_proxy_launch_failure_keeps_tunnel_until_disconnect() {
        let _guard = SPAWN_LOCK.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir, BROKEN_SCRIPT);

        let err = session.connect(&session_config(1, RSA_KEY)).await.unwrap_err();

        assert!(matches!(
            err,
            SessionError::Tunnel(TunnelError::Spawn { helper: Helper::ProxyClient, .. })
        ));
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.processes().get(Helper::TunnelClient).is_some());

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.processes().is_empty());
    }
}
