use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use pin_project_lite::pin_project;
use quinn::{ClientConfig, Connection, Endpoint, ServerConfig, TransportConfig};
use tokio::sync::mpsc;

use crate::backhaul::net;
use crate::backhaul::tunnel::transport::{
    Accepted, BoxedStream, QuicDialOptions, QuicListenOptions, Transport, TransportDialOptions,
    TransportListenOptions, TransportListener, default_alpn,
};

/// Control stream carried as a single bidirectional QUIC stream. QUIC brings
/// TLS 1.3, so this is the transport to use across untrusted networks.
pub struct QuicTransport;

impl QuicTransport {
    pub fn new() -> Self {
        Self
    }
}

fn transport_config() -> anyhow::Result<TransportConfig> {
    let mut cfg = TransportConfig::default();
    cfg.max_idle_timeout(Some(Duration::from_secs(60).try_into()?));
    cfg.keep_alive_interval(Some(Duration::from_secs(20)));
    Ok(cfg)
}

#[async_trait]
impl Transport for QuicTransport {
    fn name(&self) -> &'static str {
        "quic"
    }

    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind_addr = net::normalize_bind_addr(addr);
        let addr: SocketAddr = bind_addr
            .parse()
            .with_context(|| format!("quic: invalid listen address {addr:?}"))?;
        let QuicListenOptions {
            cert_file,
            key_file,
            next_protos,
        } = opts.quic;

        let next_protos = default_alpn(&next_protos);
        let (cert_chain, key) = quic_tls::load_or_generate_cert(&cert_file, &key_file)?;

        let server_crypto = quic_tls::server_crypto_config(cert_chain, key, next_protos)?;
        let mut server_cfg = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
        ));
        server_cfg.transport_config(Arc::new(transport_config()?));

        let endpoint = Endpoint::server(server_cfg, addr)?;
        Ok(Box::new(QuicTransportListener::new(endpoint)))
    }

    async fn dial(&self, addr: &str, opts: TransportDialOptions) -> anyhow::Result<BoxedStream> {
        let QuicDialOptions {
            server_name,
            ca_file,
            insecure_skip_verify,
            next_protos,
        } = opts.quic;
        let next_protos = default_alpn(&next_protos);

        let client_crypto =
            quic_tls::client_crypto_config(&ca_file, insecure_skip_verify, next_protos)?;
        let mut client_cfg = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)?,
        ));
        client_cfg.transport_config(Arc::new(transport_config()?));

        let remote = net::resolve_socket_addr(addr).await?;
        let bind: SocketAddr = if remote.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0u8; 4], 0))
        };
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_cfg);

        let name = if server_name.trim().is_empty() {
            "localhost".to_string()
        } else {
            server_name.trim().to_string()
        };

        let conn = endpoint.connect(remote, &name)?.await?;
        let (send, recv) = conn.open_bi().await?;
        Ok(Box::new(QuicControlStream {
            send,
            recv,
            _conn: conn,
            _endpoint: Some(endpoint),
        }))
    }
}

pub struct QuicTransportListener {
    endpoint: Endpoint,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Accepted>>,
    task: tokio::task::JoinHandle<()>,
}

impl QuicTransportListener {
    fn new(endpoint: Endpoint) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let ep = endpoint.clone();
        // Handshakes run off the accept path so one slow peer cannot stall it.
        let task = tokio::spawn(async move {
            while let Some(incoming) = ep.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let remote = incoming.remote_address();
                    let conn = match incoming.await {
                        Ok(c) => c,
                        Err(err) => {
                            tracing::debug!(client = %remote, err = %err, "quic: handshake failed");
                            return;
                        }
                    };
                    match conn.accept_bi().await {
                        Ok((send, recv)) => {
                            let stream = QuicControlStream {
                                send,
                                recv,
                                _conn: conn,
                                _endpoint: None,
                            };
                            let _ = tx
                                .send(Accepted {
                                    stream: Box::new(stream),
                                    remote: Some(remote),
                                })
                                .await;
                        }
                        Err(err) => {
                            tracing::debug!(client = %remote, err = %err, "quic: no control stream opened");
                        }
                    }
                });
            }
        });

        Self {
            endpoint,
            incoming: tokio::sync::Mutex::new(rx),
            task,
        }
    }
}

#[async_trait]
impl TransportListener for QuicTransportListener {
    async fn accept(&self) -> anyhow::Result<Accepted> {
        let mut rx = self.incoming.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("tunnel: quic endpoint closed"))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.task.abort();
        self.endpoint.close(0u32.into(), b"");
        Ok(())
    }
}

pin_project! {
    /// One QUIC bidi stream; keeps its connection (and the client endpoint)
    /// alive for as long as the control stream is in use.
    struct QuicControlStream {
        #[pin]
        send: quinn::SendStream,
        #[pin]
        recv: quinn::RecvStream,
        _conn: Connection,
        _endpoint: Option<Endpoint>,
    }
}

impl tokio::io::AsyncRead for QuicControlStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncRead::poll_read(self.project().recv, cx, buf)
    }
}

impl tokio::io::AsyncWrite for QuicControlStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        data: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        tokio::io::AsyncWrite::poll_write(self.project().send, cx, data)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncWrite::poll_flush(self.project().send, cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncWrite::poll_shutdown(self.project().send, cx)
    }
}

mod quic_tls {
    use std::{fs, path::Path, sync::Arc};

    use anyhow::Context;
    use rcgen::generate_simple_self_signed;
    use rustls::{
        client::danger::{ServerCertVerified, ServerCertVerifier},
        crypto::CryptoProvider,
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    };

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    pub fn load_or_generate_cert(
        cert_file: &str,
        key_file: &str,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let cert_file = cert_file.trim();
        let key_file = key_file.trim();

        if !cert_file.is_empty() || !key_file.is_empty() {
            if cert_file.is_empty() || key_file.is_empty() {
                anyhow::bail!(
                    "quic: requires both cert_file and key_file (or neither to auto-generate)"
                );
            }

            let certs = load_certs(Path::new(cert_file))?;
            let key = load_key(Path::new(key_file))?;
            return Ok((certs, key));
        }

        tracing::warn!("quic: no certificate configured; using a self-signed one for localhost");
        let rcgen::CertifiedKey { cert, signing_key } =
            generate_simple_self_signed(["localhost".to_string()])?;
        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
        Ok((vec![cert_der], key_der))
    }

    fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
        let data = fs::read(path).with_context(|| format!("quic: read {}", path.display()))?;
        let mut rd = std::io::Cursor::new(&data);
        let certs = rustls_pemfile::certs(&mut rd).collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            anyhow::bail!("quic: no certificates found in {}", path.display());
        }
        Ok(certs)
    }

    fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
        let data = fs::read(path).with_context(|| format!("quic: read {}", path.display()))?;
        let mut rd = std::io::Cursor::new(&data);
        let Some(k) = rustls_pemfile::private_key(&mut rd)? else {
            anyhow::bail!("quic: no private key found in {}", path.display());
        };
        Ok(k)
    }

    pub fn server_crypto_config(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        next_protos: Vec<Vec<u8>>,
    ) -> anyhow::Result<rustls::ServerConfig> {
        let mut cfg = rustls::ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        cfg.alpn_protocols = next_protos;
        Ok(cfg)
    }

    pub fn client_crypto_config(
        ca_file: &str,
        insecure_skip_verify: bool,
        next_protos: Vec<Vec<u8>>,
    ) -> anyhow::Result<rustls::ClientConfig> {
        let builder = rustls::ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?;

        if insecure_skip_verify {
            let mut cfg = builder
                .dangerous()
                .with_custom_certificate_verifier(SkipServerVerification::new())
                .with_no_client_auth();
            cfg.alpn_protocols = next_protos;
            return Ok(cfg);
        }

        let ca_file = ca_file.trim();
        if ca_file.is_empty() {
            anyhow::bail!("quic: client needs ca_file, or insecure_skip_verify for testing");
        }
        let mut root = rustls::RootCertStore::empty();
        for cert in load_certs(Path::new(ca_file))? {
            root.add(cert)?;
        }
        let mut cfg = builder.with_root_certificates(root).with_no_client_auth();
        cfg.alpn_protocols = next_protos;
        Ok(cfg)
    }

    /// Accepts any server certificate. Signatures are still checked, so only
    /// the identity of the server goes unverified.
    #[derive(Debug)]
    struct SkipServerVerification(Arc<CryptoProvider>);

    impl SkipServerVerification {
        fn new() -> Arc<Self> {
            Arc::new(Self(provider()))
        }
    }

    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn half_configured_cert_is_rejected() {
            let err = load_or_generate_cert("cert.pem", "").unwrap_err();
            assert!(err.to_string().contains("both cert_file and key_file"));
        }

        #[test]
        fn self_signed_cert_builds_a_server_config() {
            let (certs, key) = load_or_generate_cert("", "").unwrap();
            assert_eq!(certs.len(), 1);
            let cfg = server_crypto_config(certs, key, vec![b"backhaul-tunnel".to_vec()]).unwrap();
            assert_eq!(cfg.alpn_protocols, vec![b"backhaul-tunnel".to_vec()]);
        }

        #[test]
        fn client_without_trust_anchor_is_rejected() {
            assert!(client_crypto_config("", false, vec![]).is_err());
            assert!(client_crypto_config("", true, vec![]).is_ok());
        }
    }
}
