//! Relay-network transport over QUIC
//!
//! A single endpoint both accepts connections and dials the configured
//! relays. Each frame travels on its own unidirectional stream; streams of
//! one connection are read in the order they were opened.

use crate::peer::PeerId;
use crate::transport::codec::{decode_frame, MAX_FRAME_SIZE};
use crate::transport::error::{TransportError, TransportResult};
use crate::transport::types::{
    InboundFrame, InboundSink, LinkDestination, QuicRelayConfig, SendOutcome, TransportKind,
};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use quinn::{Connection, Endpoint, ServerConfig};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct QuicRelayTransport {
    endpoint: Endpoint,
    connections: Arc<DashMap<SocketAddr, Connection>>,
    /// Connection each transmitter was last heard on
    routes: Arc<DashMap<PeerId, SocketAddr>>,
    sinks: Arc<Mutex<Vec<InboundSink>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    insecure_mode: bool,
}

impl QuicRelayTransport {
    /// Bind the endpoint, start accepting and dial every configured relay.
    ///
    /// A relay that cannot be reached is logged and skipped; the transport
    /// stays unavailable until at least one connection exists.
    pub async fn start(config: &QuicRelayConfig) -> TransportResult<Arc<Self>> {
        // Already installed is fine
        let _ = rustls::crypto::ring::default_provider().install_default();

        if config.insecure_skip_verify {
            tracing::warn!(
                "TLS certificate verification is DISABLED for relay connections; \
                 only use this against self-signed test relays"
            );
        }

        let endpoint = Self::make_endpoint(config)?;
        let transport = Arc::new(Self {
            endpoint,
            connections: Arc::new(DashMap::new()),
            routes: Arc::new(DashMap::new()),
            sinks: Arc::new(Mutex::new(Vec::new())),
            tasks: Mutex::new(Vec::new()),
            insecure_mode: config.insecure_skip_verify,
        });

        let accept = tokio::spawn(Self::accept_loop(
            transport.endpoint.clone(),
            transport.connections.clone(),
            transport.routes.clone(),
            transport.sinks.clone(),
        ));
        transport.tasks.lock().push(accept);

        for relay in &config.relays {
            if let Err(e) = transport.connect(*relay).await {
                tracing::warn!(%relay, "Relay unreachable: {}", e);
            }
        }

        tracing::info!(
            addr = %transport.local_addr()?,
            connections = transport.connection_count(),
            "QUIC relay transport started"
        );
        Ok(transport)
    }

    fn make_endpoint(config: &QuicRelayConfig) -> TransportResult<Endpoint> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| TransportError::CertificateError(e.to_string()))?;
        let cert_der = cert.cert.der().to_vec();
        let priv_key = rustls::pki_types::PrivateKeyDer::try_from(cert.key_pair.serialize_der())
            .map_err(|e| TransportError::CertificateError(e.to_string()))?;

        let mut server_config = ServerConfig::with_single_cert(
            vec![rustls::pki_types::CertificateDer::from(cert_der)],
            priv_key,
        )
        .map_err(|e| TransportError::CertificateError(e.to_string()))?;
        server_config.transport_config(Arc::new(Self::transport_config(config)?));

        let mut endpoint = Endpoint::server(server_config, config.bind_addr)?;
        endpoint.set_default_client_config(Self::client_config(config)?);
        Ok(endpoint)
    }

    fn transport_config(config: &QuicRelayConfig) -> TransportResult<quinn::TransportConfig> {
        let idle = config
            .idle_timeout
            .try_into()
            .map_err(|_| TransportError::QuicError("idle timeout out of range".into()))?;

        let mut transport_config = quinn::TransportConfig::default();
        transport_config
            .max_concurrent_uni_streams(256_u32.into())
            .max_idle_timeout(Some(idle))
            .keep_alive_interval(Some(config.keep_alive_interval));
        Ok(transport_config)
    }

    fn client_config(config: &QuicRelayConfig) -> TransportResult<quinn::ClientConfig> {
        let crypto = if config.insecure_skip_verify {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
                .with_no_client_auth()
        } else {
            let mut root_store = rustls::RootCertStore::empty();
            match rustls_native_certs::load_native_certs() {
                Ok(certs) => {
                    for cert in certs {
                        if let Err(e) = root_store.add(cert) {
                            tracing::warn!("Failed to add certificate to root store: {}", e);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to load native certificates: {}. Using webpki roots.", e);
                }
            }
            if root_store.is_empty() {
                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }

            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        };

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| TransportError::CertificateError(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(Self::transport_config(config)?));
        Ok(client_config)
    }

    /// Dial a relay endpoint and start reading from it
    pub async fn connect(&self, remote: SocketAddr) -> TransportResult<()> {
        let conn = self
            .endpoint
            .connect(remote, "localhost")
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?
            .await?;

        let reader = tokio::spawn(Self::read_connection(
            conn.clone(),
            self.connections.clone(),
            self.routes.clone(),
            self.sinks.clone(),
        ));
        self.connections.insert(remote, conn);
        self.tasks.lock().push(reader);

        tracing::debug!(%remote, insecure = self.insecure_mode, "Connected to relay");
        Ok(())
    }

    async fn accept_loop(
        endpoint: Endpoint,
        connections: Arc<DashMap<SocketAddr, Connection>>,
        routes: Arc<DashMap<PeerId, SocketAddr>>,
        sinks: Arc<Mutex<Vec<InboundSink>>>,
    ) {
        while let Some(incoming) = endpoint.accept().await {
            let conn = match incoming.await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::debug!("Relay handshake failed: {}", e);
                    continue;
                }
            };
            tracing::debug!(remote = %conn.remote_address(), "Accepted relay connection");
            connections.insert(conn.remote_address(), conn.clone());
            tokio::spawn(Self::read_connection(
                conn,
                connections.clone(),
                routes.clone(),
                sinks.clone(),
            ));
        }
    }

    async fn read_connection(
        conn: Connection,
        connections: Arc<DashMap<SocketAddr, Connection>>,
        routes: Arc<DashMap<PeerId, SocketAddr>>,
        sinks: Arc<Mutex<Vec<InboundSink>>>,
    ) {
        let remote = conn.remote_address();
        loop {
            let mut stream = match conn.accept_uni().await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(%remote, "Relay connection closed: {}", e);
                    break;
                }
            };

            let data = match stream.read_to_end(MAX_FRAME_SIZE).await {
                Ok(data) => data,
                Err(e) => {
                    tracing::debug!(%remote, "Dropping relay stream: {}", e);
                    continue;
                }
            };

            let (from, envelope) = match decode_frame(&data) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::debug!(%remote, "Dropping malformed relay frame: {}", e);
                    continue;
                }
            };

            routes.insert(from, remote);
            fan_out(
                &sinks,
                InboundFrame {
                    envelope,
                    from,
                    via: TransportKind::Relay,
                    address: remote.to_string(),
                },
            );
        }

        connections.remove(&remote);
        routes.retain(|_, addr| *addr != remote);
    }

    async fn send_frame(conn: &Connection, frame: &[u8]) -> TransportResult<()> {
        let mut stream = conn.open_uni().await?;
        stream.write_all(frame).await?;
        stream
            .finish()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn close(&self) {
        for entry in self.connections.iter() {
            entry.value().close(0u32.into(), b"closing");
        }
        self.connections.clear();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

fn fan_out(sinks: &Mutex<Vec<InboundSink>>, frame: InboundFrame) {
    let mut sinks = sinks.lock();
    sinks.retain(|sink| !sink.is_closed());
    for sink in sinks.iter() {
        let _ = sink.send(frame.clone());
    }
}

impl Drop for QuicRelayTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Transport for QuicRelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn is_available(&self) -> bool {
        !self.connections.is_empty()
    }

    async fn send(&self, frame: Bytes, destination: &LinkDestination) -> SendOutcome {
        if !self.is_available() {
            return SendOutcome::TransportUnavailable;
        }

        let targets: Vec<Connection> = match destination {
            LinkDestination::Peer(peer) => {
                let conn = self
                    .routes
                    .get(peer)
                    .and_then(|addr| self.connections.get(addr.value()).map(|c| c.clone()));
                match conn {
                    Some(conn) => vec![conn],
                    None => return SendOutcome::DestinationUnreachable,
                }
            }
            LinkDestination::Broadcast { exclude } => {
                let excluded: HashSet<SocketAddr> = exclude
                    .iter()
                    .filter_map(|id| self.routes.get(id).map(|addr| *addr.value()))
                    .collect();
                self.connections
                    .iter()
                    .filter(|entry| !excluded.contains(entry.key()))
                    .map(|entry| entry.value().clone())
                    .collect()
            }
        };

        let mut failures = 0;
        for conn in &targets {
            if let Err(e) = Self::send_frame(conn, &frame).await {
                tracing::debug!(remote = %conn.remote_address(), "Relay send failed: {}", e);
                failures += 1;
            }
        }

        if !targets.is_empty() && failures == targets.len() {
            SendOutcome::TransportUnavailable
        } else {
            SendOutcome::AcceptedForTransmission
        }
    }

    fn subscribe(&self, sink: InboundSink) {
        self.sinks.lock().push(sink);
    }
}

// Certificate verifier that accepts any certificate (test relays only)
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Destination, MessageEnvelope, MessageKind};
    use crate::peer::LocalIdentity;
    use crate::transport::codec::encode_frame;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn loopback(relays: Vec<SocketAddr>) -> QuicRelayConfig {
        QuicRelayConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            relays,
            insecure_skip_verify: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unavailable_without_connections() {
        let transport = QuicRelayTransport::start(&loopback(vec![])).await.unwrap();
        assert!(!transport.is_available());
        assert_eq!(
            transport
                .send(Bytes::from_static(b"x"), &LinkDestination::broadcast())
                .await,
            SendOutcome::TransportUnavailable
        );
    }

    #[tokio::test]
    async fn test_frame_over_relay_connection() {
        let alice = LocalIdentity::generate();

        let relay = QuicRelayTransport::start(&loopback(vec![])).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        relay.subscribe(tx);

        let client = QuicRelayTransport::start(&loopback(vec![relay.local_addr().unwrap()]))
            .await
            .unwrap();
        assert!(client.is_available());

        let env = MessageEnvelope::originate(
            &alice,
            Destination::Broadcast,
            MessageKind::Data {
                ack_requested: false,
            },
            Bytes::from_static(b"via relay"),
            4,
        );
        let frame = encode_frame(alice.peer_id(), &env).unwrap();
        assert!(client
            .send(frame, &LinkDestination::broadcast())
            .await
            .is_accepted());

        let inbound = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.from, alice.peer_id());
        assert_eq!(inbound.via, TransportKind::Relay);
        assert_eq!(inbound.envelope.payload, env.payload);
    }
}
