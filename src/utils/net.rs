use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use tracing::debug;

// Any routable address works; connecting a UDP socket sends nothing.
const PROBE_TARGET: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 80);

/// Address of the interface this host would use for outbound traffic,
/// or loopback when there is no route.
pub fn local_ip() -> IpAddr {
    match probe_outbound_ip() {
        Ok(ip) => ip,
        Err(e) => {
            debug!(error = %e, "could not determine local address, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn probe_outbound_ip() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(PROBE_TARGET)?;
    Ok(socket.local_addr()?.ip())
}
