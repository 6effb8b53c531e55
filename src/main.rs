use anyhow::{bail, Context};
use clap::Parser;
use dctransfer::hub::legacy::LegacyHub;
use dctransfer::hub::modern::ModernHub;
use dctransfer::net::endpoint::{Endpoint, RecvOutcome};
use dctransfer::net::tls::{client_config_no_verification, load_server_config, TlsSession};
use dctransfer::proto::{legacy as legacy_proto, modern as modern_proto};
use dctransfer::queue::store::QueueStore;
use dctransfer::queue::DownloadQueue;
use dctransfer::rate::RateMeter;
use dctransfer::utils;
use dctransfer::vars::{SqliteVarStore, VarStore, GLOBAL};
use mio::net::TcpStream;
use mio::Token;
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;

/// Minimal headless driver: connect to the hubs named in `--hub`, log
/// activity, and serve/download files. No TUI, no command parser -- those
/// stay out of scope; this binary exists to exercise the core end-to-end.
#[derive(Parser, Debug)]
#[command(about = "Direct Connect family file-sharing client")]
struct Cli {
    /// Path to the sqlite state database (vars, share index, download queue).
    #[arg(long, default_value = "dctransfer.db")]
    db: PathBuf,

    /// Nick to use on every hub this session connects to.
    #[arg(long)]
    nick: String,

    /// One or more `<scheme>://<host>[:<port>]` hub addresses to connect to
    /// at startup. `dchub`/`nmdc` speak legacy NMDC, `adc` speaks the
    /// modern dialect, and the `s`-suffixed schemes additionally want TLS.
    /// A bare `host:port` is treated as `dchub://host:port`.
    #[arg(long = "hub")]
    hubs: Vec<String>,

    /// Local directory to expose under the given virtual share name
    /// ("name=path"), repeatable.
    #[arg(long = "share")]
    shares: Vec<String>,

    /// PEM certificate to present on the TLS listener port. Requires
    /// `--tls-key`; without both, inbound TLS connections are accepted at
    /// the socket level and then dropped since no identity can be presented.
    #[arg(long = "tls-cert")]
    tls_cert: Option<PathBuf>,

    /// PEM private key matching `--tls-cert`.
    #[arg(long = "tls-key")]
    tls_key: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Legacy,
    Modern,
}

struct HubTarget {
    raw: String,
    dialect: Dialect,
    tls: bool,
    host: String,
    addr: SocketAddr,
}

/// Parse a `<scheme>://<host>[:<port>]` hub address (spec.md's hub-address
/// grammar). `dchub`/`nmdc` default to plaintext legacy, `nmdcs` wants TLS
/// over the same dialect, and `adc`/`adcs` are the modern dialect's
/// plaintext/TLS pair. The default port, absent an explicit one, is 411.
fn parse_hub_target(raw: &str) -> anyhow::Result<HubTarget> {
    let url = url::Url::parse(raw).or_else(|_| url::Url::parse(&format!("dchub://{raw}")))?;
    let (dialect, tls) = match url.scheme() {
        "dchub" | "nmdc" => (Dialect::Legacy, false),
        "nmdcs" => (Dialect::Legacy, true),
        "adc" => (Dialect::Modern, false),
        "adcs" => (Dialect::Modern, true),
        other => bail!("unsupported hub scheme {other:?}"),
    };
    let host = url.host_str().with_context(|| format!("hub address {raw:?} has no host"))?;
    let port = url.port().unwrap_or(411);
    let addr = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving hub host {host:?}"))?
        .next()
        .with_context(|| format!("no addresses found for hub host {host:?}"))?;
    Ok(HubTarget { raw: raw.to_string(), dialect, tls, host: host.to_string(), addr })
}

enum HubSession {
    Legacy(LegacyHub),
    Modern(ModernHub),
}

/// One connected hub: its socket, and the dialect-specific state machine
/// driving it. `main`'s event loop only ever touches this through `pump`.
struct HubConn {
    target: HubTarget,
    endpoint: Endpoint,
    session: HubSession,
}

impl HubConn {
    fn connect(target: HubTarget, token: Token, nick: &str, cid: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(target.addr).with_context(|| format!("connecting to hub {}", target.raw))?;
        let terminator = match target.dialect {
            Dialect::Legacy => b'|',
            Dialect::Modern => b'\n',
        };
        let rate = Arc::new(RateMeter::new());
        let mut endpoint = Endpoint::new(stream, token, terminator, rate)?;
        if target.tls {
            let session = TlsSession::new_client(client_config_no_verification(), &target.host)
                .with_context(|| format!("setting up TLS for hub {}", target.raw))?;
            endpoint.wrap_tls(session);
            log::info!("hub {} ({:?}): TLS handshake will run inline with the first frames", target.raw, target.dialect);
        }
        let session = match target.dialect {
            Dialect::Legacy => HubSession::Legacy(LegacyHub::new(nick.to_string())),
            Dialect::Modern => HubSession::Modern(ModernHub::new(cid.to_string())),
        };
        Ok(Self { target, endpoint, session })
    }

    /// Drain every complete frame currently waiting on the socket. Returns
    /// `false` once the peer has closed the connection.
    fn pump(&mut self) -> anyhow::Result<bool> {
        loop {
            match self.endpoint.try_recv_frame()? {
                RecvOutcome::Frame(bytes) => self.dispatch_frame(&bytes)?,
                RecvOutcome::WouldBlock => return Ok(true),
                RecvOutcome::Closed => return Ok(false),
            }
        }
    }

    fn dispatch_frame(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        let text = String::from_utf8_lossy(bytes);
        match &mut self.session {
            HubSession::Legacy(hub) => {
                let unescaped = legacy_proto::unescape(&text);
                let cmd = legacy_proto::parse(&unescaped)?;
                match hub.handle(cmd) {
                    Ok(replies) => {
                        for reply in replies {
                            self.endpoint.send_frame(legacy_proto::escape(&reply.encode()).as_bytes());
                        }
                    }
                    Err(e) => log::warn!("hub {} rejected a command: {e}", self.target.raw),
                }
            }
            HubSession::Modern(hub) => {
                let frame = modern_proto::Frame::parse(text.trim_end_matches('\n'))?;
                match hub.handle(frame) {
                    Ok(replies) => {
                        for reply in replies {
                            let line = reply.generate();
                            self.endpoint.send_frame(line.trim_end_matches('\n').as_bytes());
                        }
                    }
                    Err(e) => log::warn!("hub {} rejected a frame: {e}", self.target.raw),
                }
            }
        }
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Cli::parse();
    log::info!("starting with nick {:?}, {} hub(s) configured", args.nick, args.hubs.len());

    let conn = dctransfer::store::open(&args.db).context("opening state database")?;
    let vars = SqliteVarStore::new(&conn);
    vars.set("nick", GLOBAL, &args.nick).context("persisting nick")?;

    let pid = utils::generate_pid();
    let cid = utils::cid_from_pid(&pid);
    let cid_str = dctransfer::tth::encode_base32(&cid);
    log::info!("local CID: {}", cid_str);

    let mut index = dctransfer::share::ShareIndex::new();
    for share in &args.shares {
        let (name, path) = share
            .split_once('=')
            .with_context(|| format!("--share must be name=path, got {share:?}"))?;
        index.add_root(name.to_string(), PathBuf::from(path));
        log::info!("sharing {:?} -> {:?}", name, path);
    }

    let queue_store = QueueStore::new(&conn);
    let queue = DownloadQueue::load_from(&queue_store).context("loading the download queue")?;
    log::info!("download queue: {} item(s) reloaded from disk", queue.len());

    let server_tls_config = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => Some(load_server_config(cert, key).context("loading TLS listener certificate")?),
        (None, None) => None,
        _ => bail!("--tls-cert and --tls-key must be given together"),
    };

    let mut scheduler = dctransfer::scheduler::Scheduler::new().context("starting event loop")?;
    let listener_addr: std::net::SocketAddr = "0.0.0.0:0".parse().unwrap();
    let mut listener = dctransfer::listener::Listener::bind(
        listener_addr,
        dctransfer::scheduler::TCP_LISTENER_TOKEN,
        dctransfer::scheduler::UDP_LISTENER_TOKEN,
        dctransfer::scheduler::TCP_TLS_LISTENER_TOKEN,
    );
    listener.register(scheduler.registry())?;
    log::info!("listener mode: {:?}", listener.mode);

    let mut hubs: HashMap<Token, HubConn> = HashMap::new();
    for raw in &args.hubs {
        let target = match parse_hub_target(raw) {
            Ok(t) => t,
            Err(e) => {
                log::error!("skipping hub {raw:?}: {e:#}");
                continue;
            }
        };
        let token = scheduler.next_token();
        match HubConn::connect(target, token, &args.nick, &cid_str) {
            Ok(mut hub) => {
                hub.endpoint.register(scheduler.registry())?;
                log::info!("connecting to hub {raw} ({:?})", hub.target.dialect);
                hubs.insert(token, hub);
            }
            Err(e) => log::error!("could not connect to hub {raw:?}: {e:#}"),
        }
    }

    loop {
        let timeout = scheduler.next_timeout(std::time::Instant::now());
        let ticks = scheduler.poll_once(Some(timeout))?;

        let mut dead = Vec::new();
        for event in scheduler.events().iter() {
            let token = event.token();
            if token == dctransfer::scheduler::TCP_LISTENER_TOKEN {
                while let Some((stream, addr)) = listener.accept()? {
                    log::info!("inbound connection from {addr}, CC handshake left to the session layer");
                    drop(stream);
                }
                continue;
            }
            if token == dctransfer::scheduler::UDP_LISTENER_TOKEN {
                let mut buf = [0u8; 2048];
                while let Some((n, addr, dialect)) = listener.recv_udp(&mut buf)? {
                    log::debug!("udp datagram from {addr} ({n} bytes, {dialect:?})");
                }
                continue;
            }
            if token == dctransfer::scheduler::TCP_TLS_LISTENER_TOKEN {
                while let Some((stream, addr)) = listener.accept_tls()? {
                    match &server_tls_config {
                        Some(config) => match TlsSession::new_server(Arc::clone(config)) {
                            Ok(_session) => log::info!(
                                "inbound TLS connection from {addr}, CC handshake left to the session layer"
                            ),
                            Err(e) => log::warn!("TLS setup failed for inbound connection from {addr}: {e}"),
                        },
                        None => log::debug!("inbound TLS connection from {addr} dropped: no --tls-cert/--tls-key configured"),
                    }
                    drop(stream);
                }
                continue;
            }
            let Some(hub) = hubs.get_mut(&token) else { continue };
            match hub.pump() {
                Ok(true) => {}
                Ok(false) => {
                    log::warn!("hub {} closed the connection", hub.target.raw);
                    dead.push(token);
                    continue;
                }
                Err(e) => {
                    log::error!("hub {} protocol error: {e:#}", hub.target.raw);
                    dead.push(token);
                    continue;
                }
            }
            if let Err(e) = hub.endpoint.flush_writes(None) {
                log::error!("hub {} write error: {e}", hub.target.raw);
                dead.push(token);
            }
        }
        for token in dead {
            if let Some(mut hub) = hubs.remove(&token) {
                let _ = hub.endpoint.deregister(scheduler.registry());
            }
        }

        if ticks.expect_sweep {
            log::debug!("expectation table: {} pending", scheduler.expectations.len());
        }
        if ticks.rate {
            log::trace!(
                "rates: up {} B/s, down {} B/s",
                scheduler.rates.upload.rate(),
                scheduler.rates.download.rate()
            );
        }
        if ticks.reconnect && hubs.is_empty() && !args.hubs.is_empty() {
            log::debug!("every configured hub is currently disconnected; retrying is left to the next startup for now");
        }
        if let Some((tth, hub, nick)) = queue.next_candidate(0) {
            log::trace!("download queue candidate ready: {hub}/{nick} wants {}", dctransfer::tth::encode_base32(&tth));
        }
    }
}
