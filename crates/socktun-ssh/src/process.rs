use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use socktun_traits::cancel::CancelFlag;
use socktun_traits::provision::Helper;

/// A running helper process, leader of its own process group.
///
/// Dropping the handle kills the process, so a handle that escapes an early return
/// still never leaks a helper.
pub struct ProcessHandle {
    helper: Helper,
    pid: u32,
    child: Child,
}

impl ProcessHandle {
    /// Spawns `cmd` detached from our process group with its output forwarded to the log.
    pub fn spawn(helper: Helper, mut cmd: std::process::Command) -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            use windows_sys::Win32::System::Threading::{CREATE_NEW_PROCESS_GROUP, CREATE_NO_WINDOW};
            let flags = if cfg!(debug_assertions) {
                CREATE_NEW_PROCESS_GROUP
            } else {
                CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW
            };
            cmd.creation_flags(flags);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut cmd = Command::from(cmd);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or_default();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(helper, stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(helper, stderr, true));
        }

        info!("Started {} with PID {}", helper, pid);
        Ok(Self { helper, pid, child })
    }

    pub fn helper(&self) -> Helper {
        self.helper
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Reaps the process if it has exited.
    pub fn is_running(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("{} (PID {}) exited with {}", self.helper, self.pid, status);
                false
            }
            Err(e) => {
                warn!("Failed to poll {} (PID {}): {}", self.helper, self.pid, e);
                false
            }
        }
    }

    /// Asks the helper's process group to shut down.
    pub fn interrupt(&mut self) {
        if !self.is_running() {
            return;
        }

        #[cfg(unix)]
        {
            if let Err(e) = signal_group(self.pid, libc::SIGINT) {
                warn!("Failed to send SIGINT to {} (PID {}): {}", self.helper, self.pid, e);
            }
        }

        #[cfg(windows)]
        {
            if let Err(e) = break_group(self.pid) {
                warn!("Failed to send CTRL_BREAK to {} (PID {}): {}", self.helper, self.pid, e);
            }
        }
    }

    /// Kills the helper's process group without waiting for it.
    pub fn terminate(&mut self) {
        if !self.is_running() {
            return;
        }

        #[cfg(unix)]
        {
            if let Err(e) = signal_group(self.pid, libc::SIGKILL) {
                debug!("Failed to send SIGKILL to group of {} (PID {}): {}", self.helper, self.pid, e);
            }
        }

        if let Err(e) = self.child.start_kill() {
            debug!("Failed to kill {} (PID {}): {}", self.helper, self.pid, e);
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "PID out of range"));
    };
    if pgid <= 0 {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "no PID"));
    }
    // SAFETY: the group was created for this child by `process_group(0)`, and the
    // child is unreaped (checked by the caller), so the id cannot have been recycled.
    let ret = unsafe { libc::kill(-pgid, signal) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn break_group(pid: u32) -> std::io::Result<()> {
    use windows_sys::Win32::System::Console::{CTRL_BREAK_EVENT, GenerateConsoleCtrlEvent};

    // SAFETY: plain FFI call; `pid` names a group created by CREATE_NEW_PROCESS_GROUP.
    let ok = unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) };
    if ok == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

async fn forward_output<R>(helper: Helper, stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            warn!("[{}] {}", helper, line);
        } else {
            debug!("[{}] {}", helper, line);
        }
    }
}

/// The two process slots of a session. Each slot holds at most one live helper.
#[derive(Default)]
pub struct ProcessPair {
    tunnel_client: Option<ProcessHandle>,
    proxy_client: Option<ProcessHandle>,
}

impl ProcessPair {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, helper: Helper) -> Option<&ProcessHandle> {
        match helper {
            Helper::TunnelClient => self.tunnel_client.as_ref(),
            Helper::ProxyClient => self.proxy_client.as_ref(),
        }
    }

    fn slot_mut(&mut self, helper: Helper) -> &mut Option<ProcessHandle> {
        match helper {
            Helper::TunnelClient => &mut self.tunnel_client,
            Helper::ProxyClient => &mut self.proxy_client,
        }
    }

    /// Stores `handle` in its helper's slot. A previous occupant is killed on drop.
    pub fn insert(&mut self, handle: ProcessHandle) {
        let slot = self.slot_mut(handle.helper());
        if let Some(mut previous) = slot.replace(handle) {
            warn!("Replacing {} (PID {}) in its slot", previous.helper(), previous.pid());
            previous.terminate();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tunnel_client.is_none() && self.proxy_client.is_none()
    }

    fn handles_mut(&mut self) -> impl Iterator<Item = &mut ProcessHandle> {
        self.tunnel_client.iter_mut().chain(self.proxy_client.iter_mut())
    }

    pub fn live_count(&mut self) -> usize {
        self.handles_mut()
            .filter_map(|h| h.is_running().then_some(()))
            .count()
    }

    /// Interrupts each live helper, gives it `grace` to exit, then kills it regardless.
    pub async fn signal_shutdown(&mut self, grace: Duration) {
        for handle in self.handles_mut() {
            if !handle.is_running() {
                continue;
            }
            debug!("Stopping {} (PID {})", handle.helper(), handle.pid());
            handle.interrupt();
            sleep(grace).await;
            handle.terminate();
        }
    }

    /// Polls until no helper is left running. Gives up on cancel or after `timeout`.
    pub async fn join(&mut self, cancel: &CancelFlag, poll: Duration, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            if self.live_count() == 0 {
                return true;
            }
            if cancel.is_cancelled() || started.elapsed() >= timeout {
                return false;
            }
            sleep(poll).await;
        }
    }

    /// Waits while both helpers run. Returns the first one seen exited, or `None` when
    /// cancelled or when the pair was never complete.
    pub async fn wait_for_exit(&mut self, cancel: &CancelFlag, poll: Duration) -> Option<Helper> {
        loop {
            for helper in [Helper::TunnelClient, Helper::ProxyClient] {
                match self.slot_mut(helper) {
                    Some(handle) => {
                        if !handle.is_running() {
                            return Some(helper);
                        }
                    }
                    None => return None,
                }
            }
            if cancel.is_cancelled() {
                return None;
            }
            sleep(poll).await;
        }
    }

    /// Drops both handles, killing anything still alive.
    pub fn release(&mut self) {
        for helper in [Helper::TunnelClient, Helper::ProxyClient] {
            if let Some(mut handle) = self.slot_mut(helper).take() {
                if handle.is_running() {
                    warn!("{} (PID {}) still running at release, killing", helper, handle.pid());
                    handle.terminate();
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(helper: Helper, script: &str) -> ProcessHandle {
        let mut cmd = std::process::Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        ProcessHandle::spawn(helper, cmd).unwrap()
    }

    fn pid_exists(pid: u32) -> bool {
        // SAFETY: signal 0 only checks for existence.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[tokio::test]
    async fn test_interrupt_stops_cooperative_helper() {
        let mut pair = ProcessPair::new();
        pair.insert(shell(Helper::TunnelClient, "exec sleep 30"));
        assert_eq!(pair.live_count(), 1);

        pair.signal_shutdown(Duration::from_millis(50)).await;
        let joined = pair
            .join(&CancelFlag::new(), Duration::from_millis(10), Duration::from_secs(2))
            .await;

        assert!(joined);
        assert_eq!(pair.live_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_escalates_when_interrupt_is_ignored() {
        let mut pair = ProcessPair::new();
        pair.insert(shell(Helper::ProxyClient, "trap '' INT; while :; do sleep 1; done"));
        let pid = pair.get(Helper::ProxyClient).unwrap().pid();

        // Let the shell install its trap first.
        sleep(Duration::from_millis(200)).await;

        pair.signal_shutdown(Duration::from_millis(50)).await;
        let joined = pair
            .join(&CancelFlag::new(), Duration::from_millis(10), Duration::from_secs(2))
            .await;
        pair.release();

        assert!(joined);
        assert!(!pid_exists(pid));
        assert!(pair.is_empty());
    }

    #[tokio::test]
    async fn test_join_gives_up_when_cancelled() {
        let mut pair = ProcessPair::new();
        pair.insert(shell(Helper::TunnelClient, "exec sleep 30"));

        let cancel = CancelFlag::new();
        cancel.cancel();
        let started = Instant::now();
        let joined = pair
            .join(&cancel, Duration::from_millis(10), Duration::from_secs(10))
            .await;

        assert!(!joined);
        assert!(started.elapsed() < Duration::from_secs(1));
        pair.release();
    }

    #[tokio::test]
    async fn test_wait_for_exit_reports_first_exited_helper() {
        let mut pair = ProcessPair::new();
        pair.insert(shell(Helper::TunnelClient, "exec sleep 30"));
        pair.insert(shell(Helper::ProxyClient, "exit 3"));

        let exited = pair
            .wait_for_exit(&CancelFlag::new(), Duration::from_millis(10))
            .await;

        assert_eq!(exited, Some(Helper::ProxyClient));
        pair.signal_shutdown(Duration::from_millis(10)).await;
        pair.release();
    }

    #[tokio::test]
    async fn test_live_count_skips_exited_helpers() {
        let mut pair = ProcessPair::new();
        pair.insert(shell(Helper::TunnelClient, "exec sleep 30"));
        pair.insert(shell(Helper::ProxyClient, "exit 0"));
        sleep(Duration::from_millis(200)).await;

        assert_eq!(pair.live_count(), 1);
        assert!(pair.get(Helper::ProxyClient).is_some());

        pair.release();
        assert_eq!(pair.live_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_exit_without_pair_returns_immediately() {
        let mut pair = ProcessPair::new();
        let exited = pair
            .wait_for_exit(&CancelFlag::new(), Duration::from_millis(10))
            .await;
        assert_eq!(exited, None);
    }
}
