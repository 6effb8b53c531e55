//! §4.9 Listener: the TCP (+ optional TLS) and UDP sockets a client binds
//! when it's active, and the fallback to passive mode when it isn't.

use crate::error::{CoreError, CoreResult};
use mio::net::{TcpListener, UdpSocket};
use mio::{Interest, Registry, Token};
use std::net::SocketAddr;

/// Whether we could bind a public listener at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Active,
    Passive,
}

/// A single incoming UDP datagram, already split by dialect on its first
/// byte (`U` for modern `SCH`/`RES`, `$` for legacy `$SR`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpDialect {
    Modern,
    Legacy,
}

pub fn sniff_udp_dialect(datagram: &[u8]) -> Option<UdpDialect> {
    match datagram.first() {
        Some(b'U') => Some(UdpDialect::Modern),
        Some(b'$') => Some(UdpDialect::Legacy),
        _ => None,
    }
}

pub struct Listener {
    pub mode: Mode,
    pub tcp: Option<TcpListener>,
    pub udp: Option<UdpSocket>,
    /// A second TCP listener on `addr`'s port + 1, accepting connections
    /// that immediately start a TLS handshake (the `NMDCS`/`ADCS` secure
    /// variants). Best-effort: absent if the port couldn't be bound, same
    /// as the plaintext listener falling back to `Mode::Passive`.
    pub tcp_tls: Option<TcpListener>,
    pub tcp_token: Token,
    pub udp_token: Token,
    pub tcp_tls_token: Token,
}

impl Listener {
    /// Try to bind TCP and UDP on the same port. Falls back to `Mode::Passive`
    /// (no listener at all -- every CC connection must be inbound-initiated
    /// by the peer via `$RevConnectToMe`/`RCM`) if binding fails. The TLS
    /// port (`addr`'s port + 1) is bound best-effort regardless of whether
    /// the plaintext pair succeeded.
    pub fn bind(addr: SocketAddr, tcp_token: Token, udp_token: Token, tcp_tls_token: Token) -> Self {
        match (TcpListener::bind(addr), UdpSocket::bind(addr)) {
            (Ok(tcp), Ok(udp)) => {
                // `addr`'s port may be 0 (pick any free port); bind the TLS
                // listener one above whatever port the OS actually handed
                // the plaintext listener, not the requested one.
                let tls_port = tcp.local_addr().map(|a| a.port()).unwrap_or_else(|_| addr.port()).saturating_add(1);
                let mut tls_addr = addr;
                tls_addr.set_port(tls_port);
                let tcp_tls = TcpListener::bind(tls_addr).ok();
                Listener {
                    mode: Mode::Active,
                    tcp: Some(tcp),
                    udp: Some(udp),
                    tcp_tls,
                    tcp_token,
                    udp_token,
                    tcp_tls_token,
                }
            }
            _ => Listener {
                mode: Mode::Passive,
                tcp: None,
                udp: None,
                tcp_tls: None,
                tcp_token,
                udp_token,
                tcp_tls_token,
            },
        }
    }

    pub fn register(&mut self, registry: &Registry) -> CoreResult<()> {
        if let Some(tcp) = &mut self.tcp {
            registry
                .register(tcp, self.tcp_token, Interest::READABLE)
                .map_err(|e| CoreError::Transport(e.to_string()))?;
        }
        if let Some(udp) = &mut self.udp {
            registry
                .register(udp, self.udp_token, Interest::READABLE)
                .map_err(|e| CoreError::Transport(e.to_string()))?;
        }
        if let Some(tcp_tls) = &mut self.tcp_tls {
            registry
                .register(tcp_tls, self.tcp_tls_token, Interest::READABLE)
                .map_err(|e| CoreError::Transport(e.to_string()))?;
        }
        Ok(())
    }

    /// Accept every pending inbound connection (edge-triggered `mio` socket,
    /// so callers must loop until `WouldBlock`).
    pub fn accept(&mut self) -> CoreResult<Option<(mio::net::TcpStream, SocketAddr)>> {
        let Some(tcp) = &mut self.tcp else { return Ok(None) };
        match tcp.accept() {
            Ok((stream, addr)) => Ok(Some((stream, addr))),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(CoreError::Transport(e.to_string())),
        }
    }

    /// Accept every pending inbound connection on the TLS port. The caller
    /// wraps the returned stream in a server-side `TlsSession` before
    /// handing it to `Endpoint::wrap_tls`.
    pub fn accept_tls(&mut self) -> CoreResult<Option<(mio::net::TcpStream, SocketAddr)>> {
        let Some(tcp_tls) = &mut self.tcp_tls else { return Ok(None) };
        match tcp_tls.accept() {
            Ok((stream, addr)) => Ok(Some((stream, addr))),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(CoreError::Transport(e.to_string())),
        }
    }

    /// Receive one pending UDP datagram, if any, tagged with the dialect it
    /// claims to speak.
    pub fn recv_udp(&mut self, buf: &mut [u8]) -> CoreResult<Option<(usize, SocketAddr, UdpDialect)>> {
        let Some(udp) = &mut self.udp else { return Ok(None) };
        match udp.recv_from(buf) {
            Ok((n, addr)) => {
                let dialect = sniff_udp_dialect(&buf[..n])
                    .ok_or_else(|| CoreError::Protocol("unrecognised UDP datagram".into()))?;
                Ok(Some((n, addr, dialect)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(CoreError::Transport(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_recognises_both_dialects() {
        assert_eq!(sniff_udp_dialect(b"URES ..."), Some(UdpDialect::Modern));
        assert_eq!(sniff_udp_dialect(b"$SR Bob ..."), Some(UdpDialect::Legacy));
        assert_eq!(sniff_udp_dialect(b"garbage"), None);
    }

    #[test]
    fn bind_on_loopback_succeeds_active() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), Token(0), Token(1), Token(2));
        assert_eq!(listener.mode, Mode::Active);
    }

    #[test]
    fn bind_also_opens_a_best_effort_tls_port() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), Token(0), Token(1), Token(2));
        assert!(listener.tcp_tls.is_some());
    }
}
