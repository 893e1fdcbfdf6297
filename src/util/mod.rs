//! Small shared helpers: bus timestamps, host identity.

pub mod time;

/// Best-effort local IPv4 address for status reporting.
///
/// Opens a throwaway UDP socket toward a public address; no packet is sent.
pub fn local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|sock| {
            sock.connect("8.8.8.8:80")?;
            sock.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

pub fn pid() -> u32 {
    std::process::id()
}
