//! Reachability probes for proxy nodes.
//!
//! [`Prober`] is the seam the validator pool drives. The default
//! [`HandshakeProber`] opens a TCP connection to the node, adds a TLS
//! handshake when the node's transport uses TLS, then performs the
//! protocol's own greeting (SOCKS5 method negotiation, HTTP `CONNECT`).
//! Latency is the time from connect start to a completed handshake.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::node::{Handshake, Node, Protocol};

/// Authority requested by the HTTP `CONNECT` probe.
const CONNECT_TARGET: &str = "www.gstatic.com:443";

/// Largest HTTP status line we read before giving up.
const MAX_STATUS_LINE: usize = 1024;

/// Result of a probe that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Handshake completed.
    Reachable { latency: Duration },
    /// Refused, unresolvable or rejected by the peer.
    Unreachable { reason: String },
    /// No complete handshake within the timeout.
    TimedOut,
}

impl ProbeOutcome {
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::Unreachable {
            reason: reason.into(),
        }
    }
}

/// Capability to test one node.
///
/// `Err` means the probe itself broke (not that the node is down); the pool
/// records such nodes as `probe_error`.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, node: &Node, timeout: Duration) -> Result<ProbeOutcome>;
}

/// Default prober: TCP connect, optional TLS, protocol greeting.
pub struct HandshakeProber {
    tls: TlsConnector,
}

impl HandshakeProber {
    pub fn new() -> Result<Self> {
        let config = insecure_tls_config()?;
        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
        })
    }

    async fn handshake(&self, node: &Node) -> Result<ProbeOutcome> {
        let kind = node.protocol().handshake();
        if kind == Handshake::Unsupported {
            return Ok(ProbeOutcome::unreachable("udp transport not probeable"));
        }

        let start = Instant::now();
        let tcp = match TcpStream::connect((node.host(), node.port())).await {
            Ok(stream) => stream,
            Err(e) => return Ok(ProbeOutcome::unreachable(format!("connect failed: {e}"))),
        };
        if let Err(e) = tcp.set_nodelay(true) {
            tracing::trace!("set_nodelay failed for {}: {e}", node.endpoint());
        }

        let use_tls = node.transport().tls || *node.protocol() == Protocol::Https;
        let verdict = if use_tls {
            let sni = node
                .transport()
                .sni
                .clone()
                .unwrap_or_else(|| node.host().to_string());
            let server_name = ServerName::try_from(sni.clone())
                .with_context(|| format!("invalid TLS server name '{sni}'"))?;
            match self.tls.connect(server_name, tcp).await {
                Ok(mut tls) => greet(&mut tls, node, kind).await,
                Err(e) => Err(format!("tls handshake failed: {e}")),
            }
        } else {
            let mut tcp = tcp;
            greet(&mut tcp, node, kind).await
        };

        Ok(match verdict {
            Ok(()) => ProbeOutcome::Reachable {
                latency: start.elapsed(),
            },
            Err(reason) => ProbeOutcome::Unreachable { reason },
        })
    }
}

#[async_trait]
impl Prober for HandshakeProber {
    async fn probe(&self, node: &Node, timeout: Duration) -> Result<ProbeOutcome> {
        match tokio::time::timeout(timeout, self.handshake(node)).await {
            Ok(outcome) => outcome,
            Err(_) => Ok(ProbeOutcome::TimedOut),
        }
    }
}

/// Protocol greeting on an established stream. `Err` carries the
/// rejection reason.
async fn greet<S>(stream: &mut S, node: &Node, kind: Handshake) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match kind {
        Handshake::Tcp => Ok(()),
        Handshake::Socks5 => socks5_greeting(stream, !node.identity().is_empty()).await,
        Handshake::HttpConnect => http_connect(stream, node.identity()).await,
        Handshake::Unsupported => Err("udp transport not probeable".into()),
    }
}

/// SOCKS5 method negotiation (RFC 1928 §3). Offers username/password when
/// the node carries credentials.
async fn socks5_greeting<S>(stream: &mut S, with_auth: bool) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello: &[u8] = if with_auth {
        &[0x05, 0x02, 0x00, 0x02]
    } else {
        &[0x05, 0x01, 0x00]
    };
    stream
        .write_all(hello)
        .await
        .map_err(|e| format!("socks5 write failed: {e}"))?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| format!("socks5 read failed: {e}"))?;

    match reply {
        [0x05, 0xFF] => Err("socks5: no acceptable auth method".into()),
        [0x05, _] => Ok(()),
        [v, _] => Err(format!("not a socks5 server (version byte {v:#04x})")),
    }
}

/// Send `CONNECT` and require a `2xx` status line.
async fn http_connect<S>(stream: &mut S, identity: &str) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {CONNECT_TARGET} HTTP/1.1\r\nHost: {CONNECT_TARGET}\r\n");
    if !identity.is_empty() {
        let token = base64::engine::general_purpose::STANDARD.encode(identity);
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| format!("http write failed: {e}"))?;

    let mut buf = Vec::with_capacity(128);
    let mut chunk = [0u8; 256];
    while !buf.windows(2).any(|w| w == b"\r\n") {
        if buf.len() >= MAX_STATUS_LINE {
            return Err("http status line too long".into());
        }
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| format!("http read failed: {e}"))?;
        if n == 0 {
            return Err("http proxy closed connection".into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let line = String::from_utf8_lossy(&buf);
    let status_line = line.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(format!("not an http proxy: '{status_line}'"));
    }
    if code.starts_with('2') {
        Ok(())
    } else {
        Err(format!("http CONNECT rejected: {code}"))
    }
}

// ── TLS ─────────────────────────────────────────────────────────────

/// Client config that completes handshakes without checking the peer
/// certificate. Only reachability is being measured; public nodes
/// routinely present self-signed or mismatched certificates.
fn insecure_tls_config() -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
        .with_no_client_auth();
    Ok(config)
}

#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
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
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sieve::node::Transport;
    use tokio::net::TcpListener;

    fn node(protocol: Protocol, port: u16, identity: &str) -> Node {
        Node::new(protocol, "127.0.0.1", port, identity, Transport::tcp(), "", "raw")
    }

    async fn listener() -> (TcpListener, u16) {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = l.local_addr().unwrap().port();
        (l, port)
    }

    #[tokio::test]
    async fn tcp_connect_reachable() {
        let (l, port) = listener().await;
        tokio::spawn(async move {
            let _conn = l.accept().await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        let prober = HandshakeProber::new().unwrap();
        let out = prober
            .probe(&node(Protocol::Vmess, port, "id"), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(out, ProbeOutcome::Reachable { .. }));
    }

    #[tokio::test]
    async fn refused_is_unreachable() {
        let (l, port) = listener().await;
        drop(l);
        let prober = HandshakeProber::new().unwrap();
        let out = prober
            .probe(&node(Protocol::Trojan, port, "pw"), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(out, ProbeOutcome::Unreachable { .. }));
    }

    #[tokio::test]
    async fn socks5_accepts_no_auth() {
        let (l, port) = listener().await;
        tokio::spawn(async move {
            let (mut s, _) = l.accept().await.unwrap();
            let mut hello = [0u8; 3];
            s.read_exact(&mut hello).await.unwrap();
            assert_eq!(hello, [0x05, 0x01, 0x00]);
            s.write_all(&[0x05, 0x00]).await.unwrap();
        });
        let prober = HandshakeProber::new().unwrap();
        let out = prober
            .probe(&node(Protocol::Socks, port, ""), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(out, ProbeOutcome::Reachable { .. }));
    }

    #[tokio::test]
    async fn socks5_rejection_is_unreachable() {
        let (l, port) = listener().await;
        tokio::spawn(async move {
            let (mut s, _) = l.accept().await.unwrap();
            let mut hello = [0u8; 4];
            s.read_exact(&mut hello).await.unwrap();
            s.write_all(&[0x05, 0xFF]).await.unwrap();
        });
        let prober = HandshakeProber::new().unwrap();
        let out = prober
            .probe(&node(Protocol::Socks, port, "u:p"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(
            out,
            ProbeOutcome::unreachable("socks5: no acceptable auth method")
        );
    }

    #[tokio::test]
    async fn http_connect_status() {
        for (reply, reachable) in [
            ("HTTP/1.1 200 Connection established\r\n\r\n", true),
            ("HTTP/1.1 407 Proxy Authentication Required\r\n\r\n", false),
            ("SSH-2.0-OpenSSH\r\n", false),
        ] {
            let (l, port) = listener().await;
            tokio::spawn(async move {
                let (mut s, _) = l.accept().await.unwrap();
                let mut buf = [0u8; 512];
                let _ = s.read(&mut buf).await.unwrap();
                s.write_all(reply.as_bytes()).await.unwrap();
            });
            let prober = HandshakeProber::new().unwrap();
            let out = prober
                .probe(&node(Protocol::Http, port, ""), Duration::from_secs(2))
                .await
                .unwrap();
            assert_eq!(
                matches!(out, ProbeOutcome::Reachable { .. }),
                reachable,
                "reply {reply:?} gave {out:?}"
            );
        }
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (l, port) = listener().await;
        tokio::spawn(async move {
            let (_s, _) = l.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let prober = HandshakeProber::new().unwrap();
        let out = prober
            .probe(&node(Protocol::Socks, port, ""), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(out, ProbeOutcome::TimedOut);
    }

    #[tokio::test]
    async fn udp_protocols_not_probed() {
        let prober = HandshakeProber::new().unwrap();
        let out = prober
            .probe(&node(Protocol::WireGuard, 51820, "k"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out, ProbeOutcome::unreachable("udp transport not probeable"));
    }

    #[tokio::test]
    async fn tls_against_plain_server_is_unreachable() {
        let (l, port) = listener().await;
        tokio::spawn(async move {
            let (mut s, _) = l.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let _ = s.read(&mut buf).await;
            let _ = s.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        });
        let tls_node = Node::new(
            Protocol::Trojan,
            "127.0.0.1",
            port,
            "pw",
            Transport {
                tls: true,
                sni: Some("example.com".into()),
                ..Transport::tcp()
            },
            "",
            "raw",
        );
        let prober = HandshakeProber::new().unwrap();
        let out = prober.probe(&tls_node, Duration::from_secs(2)).await.unwrap();
        assert!(matches!(out, ProbeOutcome::Unreachable { .. }));
    }
}
