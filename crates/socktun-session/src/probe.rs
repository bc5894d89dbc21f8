use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, trace, warn};

use socktun_traits::cancel::CancelFlag;
use socktun_traits::config::Timings;
use socktun_traits::proxy::SystemProxy;

/// Waits for the tunnel client's SOCKS listener on `127.0.0.1:<port>` and switches the
/// system proxy over once it accepts a connection.
///
/// The tunnel client only opens its dynamic forward after the SSH session is up. The
/// wait is bounded by `timings.probe_ticks` ticks of `timings.poll_interval` and checks
/// `cancel` before every tick.
pub async fn wait_for_connected<P: SystemProxy + ?Sized>(
    port: u16,
    cancel: &CancelFlag,
    timings: &Timings,
    system_proxy: &mut P,
) -> bool {
    let connected = probe_socks_endpoint(port, cancel, timings).await;

    if connected {
        if let Err(e) = system_proxy.configure() {
            warn!("Tunnel is up but the system proxy could not be configured: {}", e);
        }
        info!("Tunnel connected, SOCKS endpoint listening on port {}", port);
    }

    connected
}

async fn probe_socks_endpoint(port: u16, cancel: &CancelFlag, timings: &Timings) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut attempt = Box::pin(TcpStream::connect(addr));

    for tick in 0..timings.probe_ticks {
        if cancel.is_cancelled() {
            debug!("Connection probe cancelled after {} ticks", tick);
            return false;
        }

        let tick_started = Instant::now();
        match timeout(timings.poll_interval, &mut attempt).await {
            Ok(Ok(_stream)) => return true,
            Ok(Err(e)) => {
                // Nothing listening yet. Retry on the next tick.
                trace!("SOCKS endpoint not ready: {}", e);
                sleep_until(tick_started + timings.poll_interval).await;
                attempt = Box::pin(TcpStream::connect(addr));
            }
            Err(_) => {}
        }
    }

    debug!("SOCKS endpoint on port {} did not come up in {} ticks", port, timings.probe_ticks);
    false
}
