//! TLS framing for stream sessions.
//!
//! The handshake engine sits between the transport and the message layer:
//! raw bytes read from the socket are fed into the engine and the decrypted
//! plaintext is what recognizers see, while outbound message segments are
//! encrypted into records just before they are written.
//!
//! Handshake records travel through the ordinary write queue as internal
//! flush entries, so they are never reordered with application data and
//! never reported as sent messages.

use crate::error::{Result, SessionError};
use anyhow::Context as AnyhowContext;
use bytes::{Bytes, BytesMut};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{debug, info};

/// Which side of the handshake a TLS session plays.
#[derive(Clone)]
pub enum TlsRole {
    /// Initiates the handshake and verifies the server name
    Client {
        /// Client configuration
        config: Arc<ClientConfig>,
        /// Name to verify the server certificate against
        server_name: ServerName<'static>,
    },
    /// Waits for the client hello
    Server {
        /// Server configuration
        config: Arc<ServerConfig>,
    },
}

impl std::fmt::Debug for TlsRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsRole::Client { server_name, .. } => {
                f.debug_struct("Client").field("server_name", server_name).finish()
            }
            TlsRole::Server { .. } => f.write_str("Server"),
        }
    }
}

impl TlsRole {
    /// Whether this is the client side.
    pub fn is_client(&self) -> bool {
        matches!(self, TlsRole::Client { .. })
    }
}

enum TlsConnection {
    Client(ClientConnection),
    Server(ServerConnection),
}

macro_rules! with_conn {
    ($conn:expr, $c:ident => $body:expr) => {
        match $conn {
            TlsConnection::Client($c) => $body,
            TlsConnection::Server($c) => $body,
        }
    };
}

/// What feeding network bytes produced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TlsProgress {
    /// The engine has records to send
    pub(crate) wants_write: bool,
    /// The first handshake finished during this call
    pub(crate) handshake_completed: bool,
    /// The peer sent close_notify
    pub(crate) peer_closed: bool,
}

/// Handshake engine state for one connection.
pub(crate) struct TlsState {
    conn: TlsConnection,
    handshake_completed: bool,
}

impl TlsState {
    pub(crate) fn new(role: &TlsRole) -> Result<Self> {
        let conn = match role {
            TlsRole::Client { config, server_name } => {
                TlsConnection::Client(ClientConnection::new(Arc::clone(config), server_name.clone())?)
            }
            TlsRole::Server { config } => TlsConnection::Server(ServerConnection::new(Arc::clone(config))?),
        };
        Ok(Self {
            conn,
            handshake_completed: false,
        })
    }

    pub(crate) fn wants_write(&self) -> bool {
        with_conn!(&self.conn, c => c.wants_write())
    }

    /// Decrypt `raw` network bytes, appending plaintext to `plain`.
    ///
    /// Partial records are kept inside the engine until the rest arrives.
    pub(crate) fn feed(&mut self, mut raw: &[u8], plain: &mut BytesMut) -> Result<TlsProgress> {
        let mut progress = TlsProgress::default();
        while !raw.is_empty() {
            let consumed = with_conn!(&mut self.conn, c => c.read_tls(&mut raw))?;
            let state = with_conn!(&mut self.conn, c => c.process_new_packets())?;
            if state.plaintext_bytes_to_read() > 0 {
                self.drain_plaintext(plain)?;
            }
            if state.peer_has_closed() {
                progress.peer_closed = true;
                break;
            }
            if consumed == 0 {
                return Err(SessionError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "tls engine refused network bytes",
                )));
            }
        }

        if !self.handshake_completed && !with_conn!(&self.conn, c => c.is_handshaking()) {
            self.handshake_completed = true;
            progress.handshake_completed = true;
            debug!("TLS handshake completed");
        }
        progress.wants_write = self.wants_write();
        Ok(progress)
    }

    fn drain_plaintext(&mut self, plain: &mut BytesMut) -> Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            match with_conn!(&mut self.conn, c => c.reader().read(&mut chunk)) {
                Ok(0) => return Ok(()),
                Ok(n) => plain.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Encrypt application segments into records, preceded by anything the
    /// engine already had pending.
    pub(crate) fn encode(&mut self, segments: &[Bytes]) -> Result<VecDeque<Bytes>> {
        let mut records = VecDeque::new();
        for segment in segments {
            let mut rest = &segment[..];
            while !rest.is_empty() {
                let n = with_conn!(&mut self.conn, c => c.writer().write(rest))?;
                let flushed = self.flush_into(&mut records)?;
                if n == 0 && flushed == 0 {
                    return Err(SessionError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "tls engine accepted no plaintext",
                    )));
                }
                rest = &rest[n..];
            }
        }
        self.flush_into(&mut records)?;
        Ok(records)
    }

    /// Records pending in the engine, such as handshake messages.
    pub(crate) fn flush(&mut self) -> Result<VecDeque<Bytes>> {
        let mut records = VecDeque::new();
        self.flush_into(&mut records)?;
        Ok(records)
    }

    fn flush_into(&mut self, records: &mut VecDeque<Bytes>) -> Result<usize> {
        let mut out = Vec::new();
        while self.wants_write() {
            with_conn!(&mut self.conn, c => c.write_tls(&mut out))?;
        }
        let n = out.len();
        if n > 0 {
            records.push_back(Bytes::from(out));
        }
        Ok(n)
    }

    /// Start a new key exchange on an established connection.
    pub(crate) fn refresh_keys(&mut self) -> Result<()> {
        with_conn!(&mut self.conn, c => c.refresh_traffic_keys())?;
        Ok(())
    }

    /// Queue close_notify and return the records to send.
    pub(crate) fn close_notify(&mut self) -> Vec<u8> {
        with_conn!(&mut self.conn, c => c.send_close_notify());
        let mut out = Vec::new();
        while self.wants_write() {
            if with_conn!(&mut self.conn, c => c.write_tls(&mut out)).is_err() {
                break;
            }
        }
        out
    }
}

fn install_crypto_provider() {
    // Another crate may have installed one already.
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn parse_certs(pem: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse certificate chain")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in certificate chain");
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .context("Failed to parse private key")?
        .ok_or_else(|| anyhow::anyhow!("No private key found"))
}

fn parse_roots(pem: &str) -> anyhow::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(pem).context("Failed to parse CA certificates")? {
        roots
            .add(cert)
            .context("Failed to add CA certificate to root store")?;
    }
    Ok(roots)
}

/// Build a server configuration from PEM text.
///
/// With `client_ca_pem` set, clients must present a certificate signed by
/// one of those authorities.
pub fn server_config_from_pem(
    cert_chain_pem: &str,
    private_key_pem: &str,
    client_ca_pem: Option<&str>,
) -> anyhow::Result<ServerConfig> {
    install_crypto_provider();
    let certs = parse_certs(cert_chain_pem)?;
    let key = parse_key(private_key_pem)?;

    let builder = ServerConfig::builder();
    let config = match client_ca_pem {
        Some(ca_pem) => {
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(parse_roots(ca_pem)?))
                .build()
                .context("Failed to build client certificate verifier")?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .context("Failed to configure server certificate")?;

    info!("TLS server configuration created");
    Ok(config)
}

/// Build a client configuration trusting the authorities in `ca_pem`,
/// optionally presenting a client certificate.
pub fn client_config_from_pem(
    ca_pem: &str,
    client_auth: Option<(&str, &str)>,
) -> anyhow::Result<ClientConfig> {
    install_crypto_provider();
    let builder = ClientConfig::builder().with_root_certificates(parse_roots(ca_pem)?);
    let config = match client_auth {
        Some((cert_chain_pem, private_key_pem)) => builder
            .with_client_auth_cert(parse_certs(cert_chain_pem)?, parse_key(private_key_pem)?)
            .context("Failed to configure client certificate")?,
        None => builder.with_no_client_auth(),
    };

    info!("TLS client configuration created");
    Ok(config)
}

/// Parse a DNS name or IP address for certificate verification.
pub fn server_name(name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(name.to_string())
        .map_err(|_| SessionError::IllegalArgument("invalid tls server name"))
}
