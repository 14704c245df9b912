use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::OnceLock;

use rand::{Rng, rng};
use tokio::net::TcpListener;

/// This machine's primary LAN IPv4 address, used to build the
/// `socks5://<ip>:<port>` address handed out for managed ports.
///
/// Resolved once per process; falls back to loopback when no route exists.
pub fn local_ipv4() -> Ipv4Addr {
    static CACHED: OnceLock<Ipv4Addr> = OnceLock::new();
    *CACHED.get_or_init(|| discover_ipv4().unwrap_or(Ipv4Addr::LOCALHOST))
}

fn discover_ipv4() -> Option<Ipv4Addr> {
    // Connecting a UDP socket sends no packets; it only selects the
    // outbound interface.
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}

/// Pick a free local port by bind-probing random high ports.
pub async fn free_port() -> Option<u16> {
    for _ in 0..100 {
        let port = {
            let mut rng = rng();
            rng.random_range(10000_u16..60000_u16)
        };
        if let Ok(listener) = TcpListener::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        ))
        .await
        {
            drop(listener);
            return Some(port);
        }
    }
    None
}
