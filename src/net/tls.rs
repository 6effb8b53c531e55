//! Optional TLS wrapping for hub and CC connections, via `rustls`. Hubs and
//! peers that advertise the `ADCS`/`NMDCS` secure variants get wrapped
//! through here instead of talking to the raw `TcpStream` directly.

use crate::error::{CoreError, CoreResult};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

pub fn load_server_config(cert_path: &Path, key_path: &Path) -> CoreResult<Arc<rustls::ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert_path).map_err(CoreError::LocalIo)?,
    ))
    .map_err(|e| CoreError::Config(format!("bad certificate file: {e}")))?
    .into_iter()
    .map(rustls::Certificate)
    .collect();

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(
        File::open(key_path).map_err(CoreError::LocalIo)?,
    ))
    .map_err(|e| CoreError::Config(format!("bad private key file: {e}")))?;
    let key = keys
        .pop()
        .map(rustls::PrivateKey)
        .ok_or_else(|| CoreError::Config("no private key found".into()))?;

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| CoreError::Config(format!("invalid certificate/key pair: {e}")))?;
    Ok(Arc::new(config))
}

/// A client config that accepts any server certificate. Direct Connect
/// hubs are identified by address and known-hub list, not by a CA chain,
/// so certificate verification happens at the application layer (key
/// fingerprint pinning), not here.
pub fn client_config_no_verification() -> Arc<rustls::ClientConfig> {
    struct NoVerify;
    impl rustls::client::ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::Certificate,
            _intermediates: &[rustls::Certificate],
            _server_name: &rustls::ServerName,
            _scts: &mut dyn Iterator<Item = &[u8]>,
            _ocsp_response: &[u8],
            _now: std::time::SystemTime,
        ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::ServerCertVerified::assertion())
        }
    }
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    Arc::new(config)
}

/// Either side of a TLS session, wrapping the two `rustls` connection
/// types behind one interface for the endpoint layer.
pub enum TlsSession {
    Server(rustls::ServerConnection),
    Client(rustls::ClientConnection),
}

impl TlsSession {
    pub fn new_server(config: Arc<rustls::ServerConfig>) -> CoreResult<Self> {
        rustls::ServerConnection::new(config)
            .map(TlsSession::Server)
            .map_err(|e| CoreError::Transport(format!("TLS server setup failed: {e}")))
    }

    pub fn new_client(config: Arc<rustls::ClientConfig>, server_name: &str) -> CoreResult<Self> {
        let name = rustls::ServerName::try_from(server_name)
            .map_err(|_| CoreError::Config(format!("invalid TLS server name: {server_name}")))?;
        rustls::ClientConnection::new(config, name)
            .map(TlsSession::Client)
            .map_err(|e| CoreError::Transport(format!("TLS client setup failed: {e}")))
    }

    pub fn is_handshaking(&self) -> bool {
        match self {
            TlsSession::Server(c) => c.is_handshaking(),
            TlsSession::Client(c) => c.is_handshaking(),
        }
    }

    pub fn wants_read(&self) -> bool {
        match self {
            TlsSession::Server(c) => c.wants_read(),
            TlsSession::Client(c) => c.wants_read(),
        }
    }

    pub fn wants_write(&self) -> bool {
        match self {
            TlsSession::Server(c) => c.wants_write(),
            TlsSession::Client(c) => c.wants_write(),
        }
    }

    /// Feed ciphertext read from the socket into the session.
    pub fn read_tls(&mut self, bytes: &mut dyn std::io::Read) -> std::io::Result<usize> {
        match self {
            TlsSession::Server(c) => c.read_tls(bytes),
            TlsSession::Client(c) => c.read_tls(bytes),
        }
    }

    /// Push any pending ciphertext out to the socket.
    pub fn write_tls(&mut self, bytes: &mut dyn std::io::Write) -> std::io::Result<usize> {
        match self {
            TlsSession::Server(c) => c.write_tls(bytes),
            TlsSession::Client(c) => c.write_tls(bytes),
        }
    }

    pub fn process_new_packets(&mut self) -> CoreResult<rustls::IoState> {
        match self {
            TlsSession::Server(c) => c.process_new_packets(),
            TlsSession::Client(c) => c.process_new_packets(),
        }
        .map_err(|e| CoreError::Transport(format!("TLS record processing failed: {e}")))
    }

    pub fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsSession::Server(c) => c.reader(),
            TlsSession::Client(c) => c.reader(),
        }
    }

    pub fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsSession::Server(c) => c.writer(),
            TlsSession::Client(c) => c.writer(),
        }
    }
}
