use std::process::{Command, Stdio};
use tracing::{debug, info};

use socktun_traits::proxy::{ProxyError, SystemProxy};

/// Leaves the machine's proxy settings alone; applications are pointed at the local
/// HTTP port by hand.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSystemProxy;

impl SystemProxy for NoopSystemProxy {
    fn configure(&mut self) -> Result<(), ProxyError> {
        debug!("System proxy management disabled");
        Ok(())
    }

    fn revert(&mut self) -> Result<(), ProxyError> {
        Ok(())
    }
}

/// Runs user supplied shell commands to switch the system proxy on and off, e.g.
/// `gsettings set org.gnome.system.proxy.http port {port}`.
///
/// `{host}` and `{port}` expand to the local HTTP proxy endpoint.
#[derive(Debug, Clone)]
pub struct CommandSystemProxy {
    configure_command: String,
    revert_command: Option<String>,
    host: String,
    port: u16,
    applied: bool,
}

impl CommandSystemProxy {
    pub fn new(configure_command: impl Into<String>, revert_command: Option<String>, port: u16) -> Self {
        Self {
            configure_command: configure_command.into(),
            revert_command,
            host: "127.0.0.1".to_string(),
            port,
            applied: false,
        }
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    fn expand(&self, template: &str) -> String {
        template
            .replace("{host}", &self.host)
            .replace("{port}", &self.port.to_string())
    }
}

impl SystemProxy for CommandSystemProxy {
    fn configure(&mut self) -> Result<(), ProxyError> {
        let command = self.expand(&self.configure_command);
        run_shell(&command)?;
        self.applied = true;
        info!("System proxy set to {}:{}", self.host, self.port);
        Ok(())
    }

    fn revert(&mut self) -> Result<(), ProxyError> {
        if !self.applied {
            return Ok(());
        }
        if let Some(template) = &self.revert_command {
            let command = self.expand(template);
            run_shell(&command)?;
        }
        self.applied = false;
        info!("System proxy reverted");
        Ok(())
    }
}

fn run_shell(command: &str) -> Result<(), ProxyError> {
    #[cfg(unix)]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    };
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    };

    debug!("Running system proxy command: {}", command);
    let status = cmd
        .stdin(Stdio::null())
        .status()
        .map_err(|source| ProxyError::Spawn {
            command: command.to_string(),
            source,
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(ProxyError::Failed {
            command: command.to_string(),
            status: status.to_string(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_configure_then_revert_runs_both_commands() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("proxy");
        let mut proxy = CommandSystemProxy::new(
            format!("echo {{host}}:{{port}} > {}", marker.display()),
            Some(format!("echo off > {}", marker.display())),
            8118,
        );

        proxy.configure().unwrap();
        assert!(proxy.is_applied());
        assert_eq!(fs::read_to_string(&marker).unwrap().trim(), "127.0.0.1:8118");

        proxy.revert().unwrap();
        assert!(!proxy.is_applied());
        assert_eq!(fs::read_to_string(&marker).unwrap().trim(), "off");
    }

    #[test]
    fn test_revert_without_configure_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("proxy");
        let mut proxy = CommandSystemProxy::new(
            "true",
            Some(format!("touch {}", marker.display())),
            8118,
        );

        proxy.revert().unwrap();
        assert!(!marker.exists());
    }

    #[test]
    fn test_failing_command_is_reported() {
        let mut proxy = CommandSystemProxy::new("exit 7", None, 8118);
        let err = proxy.configure().unwrap_err();
        assert!(matches!(err, ProxyError::Failed { .. }));
        assert!(!proxy.is_applied());
    }
}
