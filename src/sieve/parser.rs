//! Subscription descriptor parser.
//!
//! Turns one raw subscription body into [`Node`] values. Bodies may be a
//! plain list of share URIs, the same list wrapped in base64 (the usual
//! subscription convention), a Clash YAML config, or a JSON document of
//! server objects.
//!
//! Parsing is pure and lazy: [`parse_blob`] only splits and decodes the
//! body, each entry is parsed when the iterator is pulled. Entries that
//! cannot be turned into a node are skipped and counted.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde_json::Value;
use url::Url;

use super::node::{Node, Protocol, Transport};

/// Keys of JSON documents that may hold a list of server objects.
const JSON_LIST_KEYS: [&str; 4] = ["servers", "proxies", "nodes", "configs"];

/// Top-level keys of Clash YAML configs that may hold the proxy list,
/// in lookup order.
const YAML_LIST_KEYS: [&str; 4] = ["proxies", "proxy-providers", "Proxy", "proxys"];

/// Lazy sequence of nodes parsed from one subscription body.
pub struct Descriptors {
    entries: std::vec::IntoIter<Entry>,
    skipped: usize,
}

enum Entry {
    Line(String),
    Json(Value),
}

impl Descriptors {
    /// Entries skipped so far because they could not be parsed.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for Descriptors {
    type Item = Node;

    fn next(&mut self) -> Option<Node> {
        for entry in self.entries.by_ref() {
            let parsed = match &entry {
                Entry::Line(line) => parse_descriptor(line),
                Entry::Json(value) => parse_json_node(value),
            };
            match parsed {
                Some(node) => return Some(node),
                None => {
                    self.skipped += 1;
                    if let Entry::Line(line) = &entry {
                        tracing::trace!("skipping malformed descriptor: {}", truncate(line, 80));
                    }
                }
            }
        }
        None
    }
}

/// Split a subscription body into descriptor entries.
///
/// Decoding order: whole-body base64 (only accepted when the decoded text
/// contains `://`), then Clash YAML, then JSON, then plain lines. Blank lines and `#`
/// comments are dropped without counting as skipped.
pub fn parse_blob(blob: &str) -> Descriptors {
    let blob = blob.trim_start_matches('\u{feff}');

    let entries: Vec<Entry> = if let Some(decoded) = decode_subscription(blob) {
        lines_of(&decoded)
    } else if let Some(items) = yaml_items(blob) {
        items.into_iter().map(Entry::Json).collect()
    } else if let Some(items) = json_items(blob) {
        items.into_iter().map(Entry::Json).collect()
    } else {
        lines_of(blob)
    };

    Descriptors {
        entries: entries.into_iter(),
        skipped: 0,
    }
}

fn lines_of(text: &str) -> Vec<Entry> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| Entry::Line(l.to_string()))
        .collect()
}

/// Decode a base64-wrapped subscription body.
fn decode_subscription(blob: &str) -> Option<String> {
    let compact: String = blob.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() || compact.contains("://") {
        return None;
    }
    let bytes = decode_base64(&compact)?;
    let text = String::from_utf8_lossy(&bytes).into_owned();
    text.contains("://").then_some(text)
}

/// Lenient base64: standard or URL-safe alphabet, padding optional.
pub(crate) fn decode_base64(input: &str) -> Option<Vec<u8>> {
    let trimmed = input.trim().trim_end_matches('=');
    STANDARD_NO_PAD
        .decode(trimmed)
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
        .ok()
}

fn decode_base64_text(input: &str) -> Option<String> {
    decode_base64(input).and_then(|b| String::from_utf8(b).ok())
}

/// Parse a single share-URI line into a node.
///
/// Known schemes use their own layout. Any other `scheme://` line is kept
/// as [`Protocol::Other`] when a host and port can be read from its
/// authority.
pub fn parse_descriptor(line: &str) -> Option<Node> {
    let line = line.trim();
    let (scheme, _) = line.split_once("://")?;
    if scheme.is_empty()
        || !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    {
        return None;
    }

    match Protocol::from_scheme(scheme) {
        Protocol::Vmess => parse_vmess(line),
        Protocol::Shadowsocks => parse_shadowsocks(line),
        Protocol::ShadowsocksR => parse_ssr(line),
        protocol => parse_url_style(protocol, line),
    }
}

// ── vmess ───────────────────────────────────────────────────────────

fn parse_vmess(line: &str) -> Option<Node> {
    let payload = line.get("vmess://".len()..)?;
    let payload = payload.split(['#', '?']).next()?;
    let decoded = decode_base64_text(payload)?;
    let config: Value = serde_json::from_str(decoded.trim()).ok()?;
    vmess_from_json(&config, Some(line))
}

/// Build a vmess node from a v2rayN style object (`add`, `port`, `id`).
fn vmess_from_json(config: &Value, raw: Option<&str>) -> Option<Node> {
    let host = json_str(config, "add")?;
    let port = json_port(config, "port")?;
    let id = json_str(config, "id")?;
    let transport = Transport {
        network: json_str(config, "net").unwrap_or_else(|| "tcp".into()),
        tls: json_str(config, "tls").is_some_and(|t| t == "tls"),
        sni: json_str(config, "sni"),
        path: json_str(config, "path"),
        host_header: json_str(config, "host"),
    };
    let name = json_str(config, "ps")
        .or_else(|| json_str(config, "remarks"))
        .unwrap_or_default();
    let node = Node::new(
        Protocol::Vmess,
        host,
        port,
        id,
        transport,
        name,
        raw.unwrap_or_default(),
    );
    Some(match raw {
        Some(_) => node,
        None => node.with_rendered_raw(),
    })
}

// ── shadowsocks ─────────────────────────────────────────────────────

fn parse_shadowsocks(line: &str) -> Option<Node> {
    let body = line.get("ss://".len()..)?;
    let (body, name) = split_fragment(body);
    let body = body.split('?').next()?;

    let (userinfo, hostport) = match body.rsplit_once('@') {
        Some((userinfo, hostport)) => {
            let userinfo = percent_decode(userinfo);
            let userinfo = decode_base64_text(&userinfo)
                .filter(|d| d.contains(':'))
                .unwrap_or(userinfo);
            (userinfo, hostport.trim_end_matches('/').to_string())
        }
        None => {
            // ss://BASE64(method:password@host:port)
            let decoded = decode_base64_text(body)?;
            let (userinfo, hostport) = decoded.rsplit_once('@')?;
            (userinfo.to_string(), hostport.to_string())
        }
    };

    if !userinfo.contains(':') {
        return None;
    }
    let (host, port) = split_host_port(&hostport)?;
    Some(Node::new(
        Protocol::Shadowsocks,
        host,
        port,
        userinfo,
        Transport::tcp(),
        name,
        line,
    ))
}

// ── shadowsocksr ────────────────────────────────────────────────────

fn parse_ssr(line: &str) -> Option<Node> {
    let payload = line.get("ssr://".len()..)?;
    let decoded = decode_base64_text(payload)?;
    let (main, params) = match decoded.split_once("/?") {
        Some((main, params)) => (main, params),
        None => (decoded.as_str(), ""),
    };

    // host:port:protocol:method:obfs:base64(password); host may be IPv6
    let mut parts = main.rsplitn(6, ':');
    let password_b64 = parts.next()?;
    let obfs = parts.next()?;
    let method = parts.next()?;
    let proto = parts.next()?;
    let port: u16 = parts.next()?.parse().ok()?;
    let host = parts.next()?.trim_matches(['[', ']']);
    if host.is_empty() || port == 0 {
        return None;
    }
    let password = decode_base64_text(password_b64)?;

    let name = params
        .split('&')
        .find_map(|kv| kv.strip_prefix("remarks="))
        .and_then(decode_base64_text)
        .unwrap_or_default();

    Some(Node::new(
        Protocol::ShadowsocksR,
        host,
        port,
        format!("{proto}:{method}:{obfs}:{password}"),
        Transport::tcp(),
        name,
        line,
    ))
}

// ── URL-shaped schemes ──────────────────────────────────────────────

fn default_port(protocol: &Protocol) -> Option<u16> {
    match protocol {
        Protocol::Vless | Protocol::Trojan | Protocol::Https | Protocol::Hysteria => Some(443),
        Protocol::Http => Some(80),
        Protocol::Socks => Some(1080),
        Protocol::WireGuard => Some(51820),
        _ => None,
    }
}

fn parse_url_style(protocol: Protocol, line: &str) -> Option<Node> {
    let url = Url::parse(line).ok()?;
    let host = url.host_str()?.trim_matches(['[', ']']).to_string();
    if host.is_empty() {
        return None;
    }
    let port = url.port().or_else(|| default_port(&protocol))?;
    if port == 0 {
        return None;
    }

    let query = |key: &str| -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())
    };
    let username = percent_decode(url.username());
    let password = url.password().map(percent_decode);

    let security = query("security");
    let tls = match protocol {
        Protocol::Https => true,
        Protocol::Trojan => security.as_deref() != Some("none"),
        _ => matches!(security.as_deref(), Some("tls" | "reality" | "xtls")),
    };
    let transport = Transport {
        network: query("type").unwrap_or_else(|| "tcp".into()),
        tls,
        sni: query("sni").or_else(|| query("peer")),
        path: query("path").or_else(|| query("serviceName")),
        host_header: query("host"),
    };

    let identity = match protocol {
        Protocol::Vless | Protocol::Trojan => {
            if username.is_empty() {
                return None;
            }
            username
        }
        Protocol::Hysteria => {
            if username.is_empty() {
                query("auth").unwrap_or_default()
            } else {
                username
            }
        }
        Protocol::WireGuard => query("privateKey").unwrap_or_default(),
        _ => match password {
            Some(password) => format!("{username}:{password}"),
            None => username,
        },
    };

    let name = url
        .fragment()
        .map(percent_decode)
        .filter(|n| !n.is_empty())
        .or_else(|| query("remarks"))
        .unwrap_or_default();

    Some(Node::new(protocol, host, port, identity, transport, name, line))
}

// ── JSON documents ──────────────────────────────────────────────────

/// Server objects of a JSON body, or `None` if the body is not JSON.
/// Proxy objects of a Clash YAML config. Entries share the Clash object
/// layout handled by [`parse_json_node`].
fn yaml_items(blob: &str) -> Option<Vec<Value>> {
    let has_list_key = blob.lines().any(|line| {
        YAML_LIST_KEYS
            .iter()
            .any(|k| line.strip_prefix(k).is_some_and(|rest| rest.starts_with(':')))
    });
    if !has_list_key {
        return None;
    }

    let doc: Value = match serde_yaml::from_str(blob) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::debug!("body looks like Clash YAML but does not parse: {e}");
            return None;
        }
    };
    let map = doc.as_object()?;
    YAML_LIST_KEYS
        .iter()
        .find_map(|k| map.get(*k).and_then(Value::as_array))
        .filter(|items| !items.is_empty())
        .cloned()
}

fn json_items(blob: &str) -> Option<Vec<Value>> {
    let trimmed = blob.trim();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    let doc: Value = serde_json::from_str(trimmed).ok()?;
    let items = match doc {
        Value::Array(items) => items,
        Value::Object(map) => {
            let listed: Vec<Value> = JSON_LIST_KEYS
                .iter()
                .filter_map(|k| map.get(*k).and_then(Value::as_array))
                .flatten()
                .cloned()
                .collect();
            if listed.is_empty() {
                vec![Value::Object(map)]
            } else {
                listed
            }
        }
        _ => return None,
    };
    Some(items)
}

/// Parse one server object: shadowsocks (`server_port` + `method`), v2rayN
/// vmess (`add` + `id`), or Clash style (`type` + `server` + `port`).
fn parse_json_node(item: &Value) -> Option<Node> {
    let obj = item.as_object()?;

    if obj.contains_key("server_port") && obj.contains_key("method") {
        let identity = format!(
            "{}:{}",
            json_str(item, "method")?,
            json_str(item, "password").unwrap_or_default()
        );
        let node = Node::new(
            Protocol::Shadowsocks,
            json_str(item, "server")?,
            json_port(item, "server_port")?,
            identity,
            Transport::tcp(),
            json_str(item, "remarks").unwrap_or_default(),
            "",
        );
        return Some(node.with_rendered_raw());
    }

    if obj.contains_key("add") && obj.contains_key("id") {
        return vmess_from_json(item, None);
    }

    let kind = json_str(item, "type")?.to_ascii_lowercase();
    let protocol = Protocol::from_scheme(&kind);
    let host = json_str(item, "server")?;
    let port = json_port(item, "port")?;

    let tls = item.get("tls").and_then(Value::as_bool).unwrap_or(false)
        || matches!(protocol, Protocol::Trojan | Protocol::Https);
    let path = item
        .get("ws-opts")
        .and_then(|o| json_str(o, "path"))
        .or_else(|| json_str(item, "ws-path"));
    let transport = Transport {
        network: json_str(item, "network").unwrap_or_else(|| "tcp".into()),
        tls,
        sni: json_str(item, "sni").or_else(|| json_str(item, "servername")),
        path,
        host_header: None,
    };

    let identity = match protocol {
        Protocol::Vmess | Protocol::Vless => json_str(item, "uuid")?,
        Protocol::Trojan => json_str(item, "password")?,
        Protocol::Shadowsocks => format!(
            "{}:{}",
            json_str(item, "cipher")?,
            json_str(item, "password").unwrap_or_default()
        ),
        Protocol::ShadowsocksR => format!(
            "{}:{}:{}:{}",
            json_str(item, "protocol").unwrap_or_default(),
            json_str(item, "cipher").unwrap_or_default(),
            json_str(item, "obfs").unwrap_or_default(),
            json_str(item, "password").unwrap_or_default()
        ),
        _ => match (json_str(item, "username"), json_str(item, "password")) {
            (Some(user), Some(pass)) => format!("{user}:{pass}"),
            (Some(user), None) => user,
            _ => String::new(),
        },
    };

    let name = json_str(item, "name").unwrap_or_default();
    Some(Node::new(protocol, host, port, identity, transport, name, "").with_rendered_raw())
}

// ── helpers ─────────────────────────────────────────────────────────

/// Non-empty string field; numbers are accepted and stringified.
fn json_str(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Non-zero port from a number or numeric string.
fn json_port(value: &Value, key: &str) -> Option<u16> {
    let port = match value.get(key)? {
        Value::Number(n) => u16::try_from(n.as_u64()?).ok()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    (port != 0).then_some(port)
}

fn split_fragment(body: &str) -> (&str, String) {
    match body.split_once('#') {
        Some((rest, name)) => (rest, percent_decode(name)),
        None => (body, String::new()),
    }
}

/// `host:port` or `[v6]:port`.
fn split_host_port(hostport: &str) -> Option<(String, u16)> {
    let (host, port) = hostport.trim().rsplit_once(':')?;
    let host = host.trim_matches(['[', ']']);
    let port: u16 = port.parse().ok()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}

fn percent_decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
