//! netio command line tool.
//!
//! `serve` runs an echo server, `send` writes messages to a server and
//! prints the replies, and `multicast` joins a group to print (and
//! optionally send) datagrams. All three share the session settings loaded
//! from the YAML config file.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use netio_session::{
    registry, ByteArrayMessage, ByteArrayRecognizer, Message, MessageRecognizer, MessageRef, Session,
    SessionError, SessionListener, SimpleSessionFactory,
};
use netio_wire::{
    DelimitedMessage, DelimiterRecognizer, FrameCodec, FrameMessage, LengthPrefixedRecognizer,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::{Codec, NetioConfig};
use logging::NetioLogFormatter;

/// Session framework tool: echo server, client and multicast demo
#[derive(Parser, Debug)]
#[command(name = "netio", version, about = "Event-driven network sessions")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Message framing, overrides the config file
    #[arg(long, value_enum)]
    codec: Option<Codec>,

    /// Session timeout, e.g. 30s; overrides the config file
    #[arg(long)]
    session_timeout: Option<humantime::Duration>,

    /// Collect and report traffic statistics
    #[arg(long)]
    statistics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and echo every message back
    Serve {
        /// Listen address, e.g. 0.0.0.0:7070
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Enable TLS with the configured certificate
        #[arg(long)]
        tls: bool,

        /// Path to TLS certificate file (PEM format)
        #[arg(long)]
        tls_cert: Option<PathBuf>,

        /// Path to TLS private key file (PEM format)
        #[arg(long)]
        tls_key: Option<PathBuf>,

        /// Require client certificates signed by this CA (PEM format)
        #[arg(long)]
        tls_ca: Option<PathBuf>,
    },

    /// Connect, write messages and print the replies
    Send {
        /// Server address, e.g. 127.0.0.1:7070
        remote: SocketAddr,

        /// Messages to send, in order
        #[arg(required = true)]
        messages: Vec<String>,

        /// How long to wait for replies
        #[arg(long, default_value = "5s")]
        wait: humantime::Duration,

        /// Connect with TLS
        #[arg(long)]
        tls: bool,

        /// CA certificate trusted for the server (PEM format)
        #[arg(long)]
        tls_ca: Option<PathBuf>,

        /// Name verified against the server certificate
        #[arg(long)]
        tls_sni: Option<String>,
    },

    /// Join a multicast group and print datagrams
    Multicast {
        /// Group address, e.g. 239.1.2.3
        group: IpAddr,

        /// Group port
        #[arg(long, default_value = "7071")]
        port: u16,

        /// Send this message to the group once joined
        #[arg(long)]
        message: Option<String>,

        /// How long to listen; ctrl-c stops earlier
        #[arg(long, default_value = "30s")]
        duration: humantime::Duration,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("netio={}", args.log_level).parse()?)
        .add_directive(format!("netio_session={}", args.log_level).parse()?)
        .add_directive(format!("netio_wire={}", args.log_level).parse()?)
        .add_directive(format!("netio_util={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(NetioLogFormatter::new("netio"))
        .init();

    info!("Starting netio v{}", env!("CARGO_PKG_VERSION"));

    let mut config = NetioConfig::load_from_file(&args.config)?;
    if let Some(codec) = args.codec {
        config.codec = codec;
    }
    if let Some(timeout) = args.session_timeout {
        config.session_timeout = timeout.into();
    }
    config.statistics |= args.statistics;

    let defaults = registry::global().defaults();
    debug!(
        "Session defaults: buffer_capacity={}, buffer_capacity_limit={}, check_interval={}",
        defaults.buffer_capacity,
        defaults.buffer_capacity_limit,
        humantime::format_duration(defaults.check_interval)
    );

    match args.command {
        Command::Serve {
            listen,
            tls,
            tls_cert,
            tls_key,
            tls_ca,
        } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            config.tls.enabled |= tls;
            override_path(&mut config.tls.cert_file, tls_cert);
            override_path(&mut config.tls.key_file, tls_key);
            override_path(&mut config.tls.ca_file, tls_ca);
            serve(config).await
        }
        Command::Send {
            remote,
            messages,
            wait,
            tls,
            tls_ca,
            tls_sni,
        } => {
            config.tls.enabled |= tls;
            override_path(&mut config.tls.ca_file, tls_ca);
            if let Some(sni) = tls_sni {
                config.tls.server_name = sni;
            }
            send(config, remote, messages, wait.into()).await
        }
        Command::Multicast {
            group,
            port,
            message,
            duration,
        } => multicast(config, SocketAddr::new(group, port), message, duration.into()).await,
    }
}

fn override_path(target: &mut String, path: Option<PathBuf>) {
    if let Some(path) = path {
        *target = path.to_string_lossy().into_owned();
    }
}

/// Codec selected for a run: builds recognizers and messages, and renders
/// received messages as text.
#[derive(Debug, Clone, Copy)]
struct Wire {
    codec: Codec,
    frames: FrameCodec,
}

impl Wire {
    fn new(config: &NetioConfig) -> Self {
        Self {
            codec: config.codec,
            frames: FrameCodec::new()
                .with_max_frame_size(config.max_frame_size)
                .with_checksum(config.frame_checksum),
        }
    }

    fn recognizer(&self) -> Arc<dyn MessageRecognizer> {
        match self.codec {
            Codec::Raw => Arc::new(ByteArrayRecognizer),
            Codec::Frame => Arc::new(LengthPrefixedRecognizer::new(self.frames)),
            Codec::Line => Arc::new(DelimiterRecognizer::lines()),
        }
    }

    fn encode(&self, text: &str, peer: Option<SocketAddr>) -> Result<MessageRef> {
        let bytes = text.as_bytes().to_vec();
        let message: MessageRef = match (self.codec, peer) {
            (Codec::Raw, None) => Arc::new(ByteArrayMessage::new(bytes)),
            (Codec::Raw, Some(peer)) => Arc::new(ByteArrayMessage::new(bytes).with_peer_addr(peer)),
            (Codec::Frame, peer) => {
                let frame = self.frames.frame(bytes)?;
                match peer {
                    Some(peer) => Arc::new(frame.with_peer_addr(peer)),
                    None => Arc::new(frame),
                }
            }
            (Codec::Line, None) => Arc::new(DelimitedMessage::line(text)),
            (Codec::Line, Some(peer)) => Arc::new(DelimitedMessage::line(text).with_peer_addr(peer)),
        };
        Ok(message)
    }

    fn render(message: &MessageRef) -> String {
        if let Some(line) = message.downcast_ref::<DelimitedMessage>() {
            return line.text().into_owned();
        }
        let bytes = match (
            message.downcast_ref::<FrameMessage>(),
            message.downcast_ref::<ByteArrayMessage>(),
        ) {
            (Some(frame), _) => frame.payload().clone(),
            (None, Some(raw)) => raw.content().clone(),
            (None, None) => return format!("{:?}", message),
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn configure(session: &Session, config: &NetioConfig, wire: &Wire) -> Result<()> {
    session.set_message_recognizer(wire.recognizer())?;
    session.set_session_timeout(config.session_timeout)?;
    session.set_buffer_capacity_limit(config.buffer_capacity_limit)?;
    session.set_statistics_enabled(config.statistics)?;
    session.set_log_exceptions(config.log_exceptions)?;
    Ok(())
}

/// Run a blocking session call off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Blocking session task failed")
}

fn report(session: &Session) {
    if session.is_statistics_enabled() {
        match serde_json::to_string(&session.snapshot()) {
            Ok(json) => info!(component = "stats", "{}", json),
            Err(e) => warn!("Failed to serialize session {} snapshot: {}", session.id(), e),
        }
    }
}

/// Writes every received message back to its sender.
struct Echo;

impl SessionListener for Echo {
    fn session_established(&self, session: &Session) -> Result<()> {
        info!(
            component = "serve",
            "Session {} connected from {}",
            session.id(),
            display_addr(session.remote_addr())
        );
        Ok(())
    }

    fn session_closed(&self, session: &Session) -> Result<()> {
        info!(component = "serve", "Session {} closed", session.id());
        report(session);
        Ok(())
    }

    fn session_timeout(&self, session: &Session) -> Result<()> {
        info!(component = "serve", "Session {} timed out", session.id());
        session.close(false);
        Ok(())
    }

    fn message_received(&self, session: &Session, message: &MessageRef) -> Result<()> {
        debug!(component = "serve", "Session {} echoing {:?}", session.id(), Wire::render(message));
        session.write(Arc::clone(message))?;
        Ok(())
    }

    fn exception_caught(&self, session: &Session, cause: &SessionError) -> Result<()> {
        warn!(component = "serve", "Session {}: {}", session.id(), cause);
        // The stream can't be resynchronised after a codec error.
        if matches!(cause, SessionError::Recognizer(_)) {
            session.close(false);
        }
        Ok(())
    }
}

/// Forwards received messages and closure to the async side.
struct Forward {
    tx: mpsc::UnboundedSender<Option<(Option<SocketAddr>, String)>>,
}

impl SessionListener for Forward {
    fn message_received(&self, _session: &Session, message: &MessageRef) -> Result<()> {
        let _ = self.tx.send(Some((message.peer_addr(), Wire::render(message))));
        Ok(())
    }

    fn session_closed(&self, session: &Session) -> Result<()> {
        report(session);
        let _ = self.tx.send(None);
        Ok(())
    }

    fn exception_caught(&self, session: &Session, cause: &SessionError) -> Result<()> {
        warn!("Session {}: {}", session.id(), cause);
        Ok(())
    }
}

fn display_addr(addr: Option<SocketAddr>) -> String {
    addr.map_or_else(|| "-".to_string(), |a| a.to_string())
}

async fn serve(config: NetioConfig) -> Result<()> {
    let wire = Wire::new(&config);
    let listener = Session::listener();
    listener.set_local_addr(config.listen)?;
    configure(&listener, &config, &wire)?;
    listener.set_session_factory(Arc::new(SimpleSessionFactory::new().with_listener(Arc::new(Echo))))?;
    listener.set_close_children_on_close(true)?;

    if config.tls.enabled {
        #[cfg(feature = "tls")]
        listener.set_tls_server(Arc::new(tls::server_config(&config.tls)?))?;
        #[cfg(not(feature = "tls"))]
        bail!("TLS requested but netio was built without the `tls` feature");
    }

    let starting = listener.clone();
    blocking(move || starting.start(true)).await??;
    info!(
        component = "serve",
        "Listening on {} (codec {:?}, tls {})",
        display_addr(listener.local_addr()),
        wire.codec,
        config.tls.enabled
    );

    tokio::signal::ctrl_c().await.context("Failed to wait for ctrl-c")?;
    info!(
        component = "serve",
        "Shutting down with {} connected sessions",
        listener.connected_sessions().len()
    );

    let closing = listener.clone();
    blocking(move || closing.close(true)).await?;
    info!("netio stopped");
    Ok(())
}

#[cfg(feature = "tls")]
fn client_session(config: &NetioConfig) -> Result<Session> {
    if !config.tls.enabled {
        return Ok(Session::tcp());
    }
    let (client, name) = tls::client_config(&config.tls)?;
    Ok(Session::tls_client(Arc::new(client), name))
}

#[cfg(not(feature = "tls"))]
fn client_session(config: &NetioConfig) -> Result<Session> {
    if config.tls.enabled {
        bail!("TLS requested but netio was built without the `tls` feature");
    }
    Ok(Session::tcp())
}

async fn send(config: NetioConfig, remote: SocketAddr, messages: Vec<String>, wait: Duration) -> Result<()> {
    let wire = Wire::new(&config);
    let session = client_session(&config)?;
    session.set_remote_addr(remote)?;
    configure(&session, &config, &wire)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    session.add_session_listener(Arc::new(Forward { tx }));

    let starting = session.clone();
    blocking(move || starting.start(true))
        .await?
        .with_context(|| format!("Failed to connect to {}", remote))?;
    if !session.is_established() {
        bail!("Connection to {} failed", remote);
    }

    for text in &messages {
        let receipt = session.write_with_receipt(wire.encode(text, None)?)?;
        if !receipt.await {
            bail!("Session closed before '{}' was written", text);
        }
    }

    let mut replies = 0;
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);
    while replies < messages.len() {
        tokio::select! {
            received = rx.recv() => match received {
                Some(Some((_, text))) => {
                    println!("{}", text);
                    replies += 1;
                }
                _ => break,
            },
            _ = &mut deadline => {
                warn!("Timed out after {} with {} of {} replies", humantime::format_duration(wait), replies, messages.len());
                break;
            }
        }
    }

    blocking(move || session.close(true)).await?;
    Ok(())
}

async fn multicast(config: NetioConfig, group: SocketAddr, message: Option<String>, duration: Duration) -> Result<()> {
    let wire = Wire::new(&config);
    let session = Session::multicast();
    let any = match group.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    session.set_local_addr(SocketAddr::new(any, group.port()))?;
    session.set_multicast_group(group.ip())?;
    configure(&session, &config, &wire)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    session.add_session_listener(Arc::new(Forward { tx }));

    let starting = session.clone();
    blocking(move || starting.start(true))
        .await?
        .with_context(|| format!("Failed to join {}", group))?;
    info!(component = "multicast", "Joined {} on {}", group, display_addr(session.local_addr()));

    if let Some(text) = message {
        session.write(wire.encode(&text, Some(group))?)?;
    }

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(Some((peer, text))) => println!("{} {}", display_addr(peer), text),
                _ => break,
            },
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    blocking(move || session.close(true)).await?;
    Ok(())
}

#[cfg(feature = "tls")]
mod tls {
    use crate::config::TlsConfig;
    use anyhow::{bail, Context, Result};
    use netio_session::rustls::pki_types::ServerName;
    use netio_session::rustls::{ClientConfig, ServerConfig};

    fn read_pem(path: &str, what: &str) -> Result<String> {
        if path.is_empty() {
            bail!("TLS {} file is not configured", what);
        }
        std::fs::read_to_string(path).with_context(|| format!("Failed to read TLS {} from {}", what, path))
    }

    pub fn server_config(tls: &TlsConfig) -> Result<ServerConfig> {
        let cert = read_pem(&tls.cert_file, "certificate")?;
        let key = read_pem(&tls.key_file, "private key")?;
        let client_ca = if tls.ca_file.is_empty() {
            None
        } else {
            Some(read_pem(&tls.ca_file, "CA certificate")?)
        };
        netio_session::tls::server_config_from_pem(&cert, &key, client_ca.as_deref())
    }

    pub fn client_config(tls: &TlsConfig) -> Result<(ClientConfig, ServerName<'static>)> {
        let ca = read_pem(&tls.ca_file, "CA certificate")?;
        let client_auth = if tls.cert_file.is_empty() {
            None
        } else {
            Some((
                read_pem(&tls.cert_file, "certificate")?,
                read_pem(&tls.key_file, "private key")?,
            ))
        };
        let config = netio_session::tls::client_config_from_pem(
            &ca,
            client_auth.as_ref().map(|(cert, key)| (cert.as_str(), key.as_str())),
        )?;
        let name = netio_session::tls::server_name(&tls.server_name)?;
        Ok((config, name))
    }
}
