//! Peer connections: plain TCP or TLS, framed with the line codec

use crate::replication::config::{PeerConfig, TlsConfig};
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::codec::Framed;
use zonesync_protocol::{Frame, FrameCodec, Message, ProtocolError};

/// Byte stream a peer connection runs over
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PeerStream for T {}

/// Boxed plain or TLS stream
pub type BoxedStream = Box<dyn PeerStream>;

/// Framed peer connection
pub type PeerFramed = Framed<BoxedStream, FrameCodec>;

/// What a read from a peer produced
#[derive(Debug)]
pub enum Incoming {
    /// A well-formed message
    Message(Message),
    /// A frame that is not a valid message; the connection stays usable
    Invalid(ProtocolError),
    /// The peer closed the connection
    Closed,
    /// Nothing arrived within the limit
    TimedOut,
}

/// Wrap a stream in the frame codec
pub fn framed(stream: BoxedStream) -> PeerFramed {
    Framed::new(stream, FrameCodec::default())
}

/// Read one message, waiting at most `limit`
pub async fn recv(framed: &mut PeerFramed, limit: Duration) -> Result<Incoming> {
    match tokio::time::timeout(limit, framed.next()).await {
        Err(_) => Ok(Incoming::TimedOut),
        Ok(None) => Ok(Incoming::Closed),
        // Framing errors leave the byte stream out of sync
        Ok(Some(Err(e))) => Err(e.into()),
        Ok(Some(Ok(frame))) => match Message::try_from(frame) {
            Ok(msg) => Ok(Incoming::Message(msg)),
            Err(e) => Ok(Incoming::Invalid(e)),
        },
    }
}

/// Send one message
pub async fn send(framed: &mut PeerFramed, msg: Message) -> Result<()> {
    tracing::trace!("-> {}", msg.command());
    framed.send(Frame::try_from(msg)?).await?;
    Ok(())
}

struct TlsContext {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

/// Opens and accepts peer connections, optionally over TLS
pub struct Transport {
    tls: Option<TlsContext>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::tls(format!("failed to open {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::tls(format!("failed to parse {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::tls(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::tls(format!("failed to open {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::tls(format!("failed to parse {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::tls(format!("no private key in {}", path.display())))
}

impl Transport {
    /// Unencrypted TCP
    pub fn plain() -> Self {
        Self { tls: None }
    }

    /// TLS when configured, plain TCP otherwise
    pub fn from_config(tls: Option<&TlsConfig>) -> Result<Self> {
        let Some(tls) = tls else {
            return Ok(Self::plain());
        };

        let certs = load_certs(&tls.cert_path)?;
        let key = load_key(&tls.key_path)?;
        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::tls(format!("invalid certificate or key: {}", e)))?;

        let mut roots = RootCertStore::empty();
        let trusted = tls.ca_path.as_deref().unwrap_or(&tls.cert_path);
        for cert in load_certs(trusted)? {
            roots
                .add(cert)
                .map_err(|e| Error::tls(format!("untrusted certificate: {}", e)))?;
        }
        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        tracing::info!("TLS enabled for peer connections");
        Ok(Self {
            tls: Some(TlsContext {
                acceptor: TlsAcceptor::from(Arc::new(server)),
                connector: TlsConnector::from(Arc::new(client)),
            }),
        })
    }

    /// Whether connections are encrypted
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Finish accepting an inbound connection
    pub async fn accept(&self, stream: TcpStream) -> Result<BoxedStream> {
        stream.set_nodelay(true)?;
        match &self.tls {
            Some(tls) => {
                let stream = tls.acceptor.accept(stream).await?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(stream)),
        }
    }

    /// Connect to `peer` within `timeout`
    pub async fn connect(&self, peer: &PeerConfig, timeout: Duration) -> Result<BoxedStream> {
        let address = peer.address();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| Error::protocol(format!("connect to {} timed out", address)))??;
        stream.set_nodelay(true)?;

        match &self.tls {
            Some(tls) => {
                let server_name = ServerName::try_from(peer.host.clone())
                    .map_err(|e| Error::tls(format!("invalid server name {}: {}", peer.host, e)))?;
                let stream = tokio::time::timeout(timeout, tls.connector.connect(server_name, stream))
                    .await
                    .map_err(|_| Error::protocol(format!("TLS handshake with {} timed out", address)))??;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(stream)),
        }
    }
}
