//! Host address discovery for the command topic.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use tracing::{debug, warn};

/// Any routable address works; connecting a UDP socket sends nothing.
const PROBE_TARGET: &str = "8.8.8.8:80";

/// The address this host uses for outbound traffic, or `127.0.0.1` when no
/// route exists.
pub fn local_ip() -> IpAddr {
    match probe_route() {
        Ok(ip) => {
            debug!(%ip, "discovered host address");
            ip
        }
        Err(e) => {
            warn!(error = %e, "could not discover host address, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn probe_route() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(PROBE_TARGET)?;
    Ok(socket.local_addr()?.ip())
}
