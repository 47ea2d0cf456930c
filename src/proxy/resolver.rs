use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

/// Resolve `host:port`, keeping the resolver's order and dropping duplicates.
///
/// Literal addresses bypass the system resolver.
pub fn resolve_host(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let addrs = (host, port).to_socket_addrs()?;
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for addr in addrs {
        if seen.insert(addr) {
            unique.push(addr);
        }
    }
    if unique.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("DNS lookup for {host}:{port} returned no usable addresses"),
        ));
    }
    Ok(unique)
}
