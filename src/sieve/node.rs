//! Canonical proxy node representation.
//!
//! Every descriptor format the parser understands is normalized into a
//! [`Node`]. Identity-relevant fields feed a SHA-256 fingerprint that serves
//! as the dedup key and as the key of the validator's result map.

use std::fmt;
use std::time::Duration;

use base64::Engine as _;
use sha2::{Digest, Sha256};

/// Tunnel protocol of a node, selected by the descriptor scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    ShadowsocksR,
    Http,
    Https,
    Socks,
    Hysteria,
    WireGuard,
    Other(String),
}

impl Protocol {
    /// Map a URI scheme (without `://`) to a protocol. Unknown schemes are
    /// kept as `Other` with the lower-cased scheme.
    pub fn from_scheme(scheme: &str) -> Self {
        match scheme.to_ascii_lowercase().as_str() {
            "vmess" => Self::Vmess,
            "vless" => Self::Vless,
            "trojan" => Self::Trojan,
            "ss" | "shadowsocks" => Self::Shadowsocks,
            "ssr" => Self::ShadowsocksR,
            "http" => Self::Http,
            "https" => Self::Https,
            "socks" | "socks5" => Self::Socks,
            "hysteria" => Self::Hysteria,
            "wireguard" | "wg" => Self::WireGuard,
            other => Self::Other(other.to_string()),
        }
    }

    /// Handshake the default prober performs for this protocol.
    pub fn handshake(&self) -> Handshake {
        match self {
            Self::Http | Self::Https => Handshake::HttpConnect,
            Self::Socks => Handshake::Socks5,
            Self::Hysteria | Self::WireGuard => Handshake::Unsupported,
            _ => Handshake::Tcp,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vmess => write!(f, "vmess"),
            Self::Vless => write!(f, "vless"),
            Self::Trojan => write!(f, "trojan"),
            Self::Shadowsocks => write!(f, "ss"),
            Self::ShadowsocksR => write!(f, "ssr"),
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
            Self::Socks => write!(f, "socks"),
            Self::Hysteria => write!(f, "hysteria"),
            Self::WireGuard => write!(f, "wireguard"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Reachability test performed after the TCP (and optional TLS) connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Connect (plus TLS when the transport asks for it) is the whole probe.
    Tcp,
    /// SOCKS5 method negotiation.
    Socks5,
    /// HTTP `CONNECT` request.
    HttpConnect,
    /// UDP-based transports; a TCP probe says nothing about them.
    Unsupported,
}

/// Transport options that take part in node identity and probing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Transport {
    /// Network type (`tcp`, `ws`, `grpc`, `h2`, ...).
    pub network: String,
    pub tls: bool,
    pub sni: Option<String>,
    pub path: Option<String>,
    pub host_header: Option<String>,
}

impl Transport {
    pub fn tcp() -> Self {
        Self {
            network: "tcp".into(),
            ..Self::default()
        }
    }
}

/// Validation status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Not probed yet.
    Untested,
    /// Handshake completed within the timeout.
    Reachable,
    /// Refused, timed out, rejected or cancelled.
    Unreachable,
    /// The probe itself failed unexpectedly.
    ProbeError,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Untested => write!(f, "untested"),
            Self::Reachable => write!(f, "reachable"),
            Self::Unreachable => write!(f, "unreachable"),
            Self::ProbeError => write!(f, "probe_error"),
        }
    }
}

/// One canonical proxy endpoint.
///
/// Everything except `status` and `latency` is fixed at construction;
/// those two are written once through [`Node::finalize`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Node {
    protocol: Protocol,
    host: String,
    port: u16,
    identity: String,
    transport: Transport,
    name: String,
    raw: String,
    fingerprint: String,
    status: NodeStatus,
    #[serde(skip)]
    latency: Option<Duration>,
}

impl Node {
    /// Build a node. `raw` is kept verbatim apart from surrounding
    /// whitespace; the fingerprint is derived here.
    pub fn new(
        protocol: Protocol,
        host: impl Into<String>,
        port: u16,
        identity: impl Into<String>,
        transport: Transport,
        name: impl Into<String>,
        raw: impl Into<String>,
    ) -> Self {
        let host = host.into();
        let identity = identity.into();
        let fingerprint = fingerprint(&protocol, &host, port, &identity, &transport);
        Self {
            protocol,
            host,
            port,
            identity,
            transport,
            name: name.into(),
            raw: raw.into().trim().to_string(),
            fingerprint,
            status: NodeStatus::Untested,
            latency: None,
        }
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Record the terminal status. Only the first call on an untested node
    /// takes effect; latency is kept only for `Reachable`.
    ///
    /// Returns `false` when the node was already finalized or `status` is
    /// `Untested`.
    pub fn finalize(&mut self, status: NodeStatus, latency: Option<Duration>) -> bool {
        if self.status != NodeStatus::Untested || status == NodeStatus::Untested {
            return false;
        }
        self.status = status;
        self.latency = if status == NodeStatus::Reachable {
            latency
        } else {
            None
        };
        true
    }

    /// Replace `raw` with the node's own URI rendering.
    pub(crate) fn with_rendered_raw(mut self) -> Self {
        self.raw = self.to_uri();
        self
    }

    /// Render the node as a share URI. Used for nodes that did not come from
    /// a URI line (JSON documents), so they still have a one-line `raw` form.
    pub fn to_uri(&self) -> String {
        let b64 = base64::engine::general_purpose::STANDARD;
        let name = urlencoding::encode(&self.name);
        let hostport = self.endpoint();
        match &self.protocol {
            Protocol::Vmess => {
                let config = serde_json::json!({
                    "v": "2",
                    "ps": self.name,
                    "add": self.host,
                    "port": self.port.to_string(),
                    "id": self.identity,
                    "aid": "0",
                    "net": self.transport.network,
                    "tls": if self.transport.tls { "tls" } else { "" },
                    "sni": self.transport.sni.clone().unwrap_or_default(),
                    "path": self.transport.path.clone().unwrap_or_default(),
                    "host": self.transport.host_header.clone().unwrap_or_default(),
                });
                format!("vmess://{}", b64.encode(config.to_string()))
            }
            Protocol::Shadowsocks => {
                format!("ss://{}@{hostport}#{name}", b64.encode(&self.identity))
            }
            Protocol::Vless | Protocol::Trojan => {
                let mut query = vec![format!("type={}", self.transport.network)];
                if self.transport.tls {
                    query.push("security=tls".into());
                }
                if let Some(sni) = &self.transport.sni {
                    query.push(format!("sni={}", urlencoding::encode(sni)));
                }
                if let Some(path) = &self.transport.path {
                    query.push(format!("path={}", urlencoding::encode(path)));
                }
                if let Some(host) = &self.transport.host_header {
                    query.push(format!("host={}", urlencoding::encode(host)));
                }
                format!(
                    "{}://{}@{hostport}?{}#{name}",
                    self.protocol,
                    urlencoding::encode(&self.identity),
                    query.join("&")
                )
            }
            other => {
                if self.identity.is_empty() {
                    format!("{other}://{hostport}#{name}")
                } else {
                    format!("{other}://{}@{hostport}#{name}", self.identity)
                }
            }
        }
    }
}

/// Deterministic identity hash over `(protocol, host, port, identity,
/// transport)`. Fields are length-prefixed so adjacent values cannot bleed
/// into each other; the host is compared case-insensitively.
pub fn fingerprint(
    protocol: &Protocol,
    host: &str,
    port: u16,
    identity: &str,
    transport: &Transport,
) -> String {
    let mut hasher = Sha256::new();
    let mut field = |value: &str| {
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value.as_bytes());
    };
    field(&protocol.to_string());
    field(&host.to_ascii_lowercase());
    field(&port.to_string());
    field(identity);
    field(&transport.network);
    field(if transport.tls { "tls" } else { "" });
    field(transport.sni.as_deref().unwrap_or(""));
    field(transport.path.as_deref().unwrap_or(""));
    field(transport.host_header.as_deref().unwrap_or(""));
    hex::encode(hasher.finalize())
}
