//! Endpoint descriptor model and URI parser.
//!
//! A descriptor is the validated, immutable representation of one candidate
//! proxy endpoint. Parsing follows parse-don't-validate: every field of a
//! constructed descriptor is already normalized into its closed set, so the
//! rest of the engine never re-checks them.
//!
//! Malformed input never panics and never aborts a run: a line either parses
//! into a descriptor or is dropped with a definite [`ParseError`].

use std::fmt;
use std::sync::LazyLock;

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use regex::Regex;
use serde::Serialize;
use url::Url;

pub mod canonical;

pub use canonical::CanonicalKey;

/// Reality public keys are fixed-length base64url.
static PUBLIC_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{43,44}$").expect("static regex"));

/// Flow values the core understands; anything else is cleared.
const FLOW_ALLOWED: [&str; 4] = ["", "xtls-rprx-vision", "xtls-rprx-direct", "xtls-rprx-splice"];

/// Longest accepted Reality short id (hex chars).
const SHORT_ID_MAX: usize = 32;

/// Characters that must be escaped when a field is placed in the userinfo or
/// fragment position of a URI.
const URI_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'@')
    .add(b':')
    .add(b'/')
    .add(b'?')
    .add(b'#')
    .add(b'%');

/// Transport kind, normalized into a closed set.
///
/// Unrecognized values fall back to [`Transport::Tcp`] rather than failing
/// the whole descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Plain stream.
    #[default]
    Tcp,
    /// WebSocket stream.
    Ws,
    /// gRPC-style stream.
    Grpc,
    /// HTTP-upgrade stream.
    Http,
}

impl Transport {
    fn from_param(value: &str) -> Self {
        match value {
            "ws" | "websocket" => Self::Ws,
            "grpc" | "gun" => Self::Grpc,
            "http" | "h2" | "httpupgrade" => Self::Http,
            _ => Self::Tcp,
        }
    }

    /// Wire name of the transport, as the core's configuration spells it.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Ws => "ws",
            Self::Grpc => "grpc",
            Self::Http => "http",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-layer security mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    /// No transport security.
    #[default]
    None,
    /// Opportunistic TLS.
    Tls,
    /// Authenticated Reality TLS; requires a valid public key.
    Reality,
}

impl Security {
    fn from_param(value: &str) -> Self {
        match value {
            "tls" => Self::Tls,
            "reality" => Self::Reality,
            _ => Self::None,
        }
    }

    /// Wire name of the security mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Tls => "tls",
            Self::Reality => "reality",
        }
    }
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated, immutable representation of one candidate proxy endpoint.
///
/// Created once per input line and never mutated afterwards; the engine only
/// compares and serializes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// User credential (opaque token, lowercased). Never empty.
    pub uuid: String,
    /// Remote host. Never empty.
    pub address: String,
    /// Remote port; URIs without a port default to 443.
    pub port: u16,
    /// Transport kind.
    pub transport: Transport,
    /// Security mode, consistent with the parameters below: `Reality` is
    /// only ever set when `public_key` passed format validation.
    pub security: Security,
    /// Encryption parameter, normalized lowercase; "none" when absent.
    pub encryption: String,
    /// Flow-control hint; empty unless in the allow-set.
    pub flow: String,
    /// Reality public key; empty unless it matched the base64url format.
    pub public_key: String,
    /// Reality short id; even-length hex, at most 32 chars, or empty.
    pub short_id: String,
    /// Server name indication; falls back to `address` when absent.
    pub sni: String,
    /// TLS fingerprint hint; "chrome" when absent.
    pub fingerprint: String,
    /// ALPN list; empty means absent.
    pub alpn: Vec<String>,
    /// Host header for websocket/HTTP-upgrade transports.
    pub host: String,
    /// Request path for websocket/HTTP-upgrade transports.
    pub path: String,
    /// Service name for gRPC-style transports.
    pub service_name: String,
    /// Stream header-obfuscation kind for plain-stream; "none" when absent.
    pub header_type: String,
    /// Free-text display tag from the URI fragment.
    pub tag: String,
}

/// A descriptor paired with the cleaned input line it was parsed from.
///
/// The original line is what ends up in the output file; the descriptor is
/// what the engine works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Cleaned input line.
    pub url: String,
    /// Parsed descriptor.
    pub descriptor: EndpointDescriptor,
}

impl Candidate {
    /// Parse one input line into a candidate.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] for any line that does not yield a valid
    /// descriptor.
    pub fn from_line(line: &str) -> Result<Self, ParseError> {
        let url = clean_line(line);
        let descriptor = EndpointDescriptor::parse(&url)?;
        Ok(Self { url, descriptor })
    }
}

/// Strip byte-order marks, zero-width characters and line terminators.
#[must_use]
pub fn clean_line(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, '\u{feff}' | '\u{200b}' | '\n' | '\r'))
        .collect()
}

/// Why a line failed to parse.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// The line does not carry the `vless://` scheme.
    #[error("not a vless uri")]
    WrongScheme,

    /// The URI is syntactically broken.
    #[error("malformed uri: {0}")]
    Malformed(String),

    /// The userinfo component (credential) is missing or empty.
    #[error("missing identity")]
    MissingIdentity,

    /// The host component is missing or empty.
    #[error("missing address")]
    MissingAddress,
}

impl EndpointDescriptor {
    /// Parse a raw URI string into a descriptor.
    ///
    /// Invalid security parameters are cleared rather than rejecting the
    /// descriptor; clearing a public key that implied Reality also
    /// downgrades the security mode to plain TLS.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] when the scheme, identity, or address is
    /// missing or the URI is syntactically unparseable.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let cleaned = clean_line(raw);
        if !cleaned.starts_with("vless://") {
            return Err(ParseError::WrongScheme);
        }

        let url = Url::parse(&cleaned).map_err(|e| ParseError::Malformed(e.to_string()))?;

        let uuid = percent_decode_str(url.username())
            .decode_utf8_lossy()
            .to_lowercase();
        if uuid.is_empty() {
            return Err(ParseError::MissingIdentity);
        }

        let address = url
            .host_str()
            .map(str::to_string)
            .filter(|h| !h.is_empty())
            .ok_or(ParseError::MissingAddress)?;
        let port = url.port().unwrap_or(443);

        let params = QueryParams::from_url(&url);

        let transport = Transport::from_param(&params.first("type").to_lowercase());
        let encryption = {
            let value = params.first("encryption").to_lowercase();
            if value.is_empty() { "none".to_string() } else { value }
        };

        let flow = {
            let value = params.first("flow").to_lowercase();
            if FLOW_ALLOWED.contains(&value.as_str()) {
                value
            } else {
                String::new()
            }
        };

        let mut security = Security::from_param(&params.first("security").to_lowercase());

        let mut public_key = params.first("pbk");
        if PUBLIC_KEY_RE.is_match(&public_key) {
            // A well-formed key implies Reality even when the uri said
            // otherwise.
            security = Security::Reality;
        } else {
            public_key.clear();
            if security == Security::Reality {
                // Reality without its key cannot be satisfied; fall back to
                // plain TLS instead of emitting an unmeetable requirement.
                security = Security::Tls;
            }
        }

        let short_id = normalize_short_id(&params.first("sid"));

        let sni = {
            let value = params.first("sni");
            if value.is_empty() { address.clone() } else { value }
        };
        let fingerprint = {
            let value = params.first("fp");
            if value.is_empty() { "chrome".to_string() } else { value }
        };

        let alpn = {
            let value = params.first("alpn");
            if value.is_empty() {
                Vec::new()
            } else {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            }
        };

        let host = params.first("host");
        let path = params.first("path");
        let service_name = params.first("serviceName");
        let header_type = {
            let value = params.first("headerType");
            if value.is_empty() { "none".to_string() } else { value }
        };

        let tag = url
            .fragment()
            .map(|f| {
                percent_decode_str(f)
                    .decode_utf8_lossy()
                    .trim()
                    .to_string()
            })
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "vless".to_string());

        Ok(Self {
            uuid,
            address,
            port,
            transport,
            security,
            encryption,
            flow,
            public_key,
            short_id,
            sni,
            fingerprint,
            alpn,
            host,
            path,
            service_name,
            header_type,
            tag,
        })
    }

    /// Serialize the descriptor back into URI form.
    ///
    /// Round-trips through [`parse`](Self::parse) on every field the URI
    /// covers.
    #[must_use]
    pub fn to_uri(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("type", self.transport.as_str());
        query.append_pair("security", self.security.as_str());
        if self.encryption != "none" {
            query.append_pair("encryption", &self.encryption);
        }
        if !self.flow.is_empty() {
            query.append_pair("flow", &self.flow);
        }
        if !self.public_key.is_empty() {
            query.append_pair("pbk", &self.public_key);
        }
        if !self.short_id.is_empty() {
            query.append_pair("sid", &self.short_id);
        }
        query.append_pair("sni", &self.sni);
        query.append_pair("fp", &self.fingerprint);
        if !self.alpn.is_empty() {
            query.append_pair("alpn", &self.alpn.join(","));
        }
        if !self.host.is_empty() {
            query.append_pair("host", &self.host);
        }
        if !self.path.is_empty() {
            query.append_pair("path", &self.path);
        }
        if !self.service_name.is_empty() {
            query.append_pair("serviceName", &self.service_name);
        }
        if self.header_type != "none" {
            query.append_pair("headerType", &self.header_type);
        }

        let mut uri = format!(
            "vless://{}@{}:{}?{}",
            utf8_percent_encode(&self.uuid, URI_ESCAPE),
            self.address,
            self.port,
            query.finish(),
        );
        if !self.tag.is_empty() {
            uri.push('#');
            uri.push_str(&utf8_percent_encode(&self.tag, URI_ESCAPE).to_string());
        }
        uri
    }

    /// `host:port` of the remote, for log lines.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Derive the deduplication key for this descriptor.
    #[must_use]
    pub fn canonical_key(&self) -> CanonicalKey {
        CanonicalKey::of(self)
    }
}

/// First-value-wins view over the URI query string.
struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    fn from_url(url: &Url) -> Self {
        Self {
            pairs: url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
        }
    }

    /// First value for `key`, trimmed; empty string when absent.
    fn first(&self, key: &str) -> String {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.trim().to_string())
            .unwrap_or_default()
    }
}

/// Strip a short id down to hex characters and reject odd or oversized
/// remainders.
fn normalize_short_id(raw: &str) -> String {
    let hex: String = raw.chars().filter(char::is_ascii_hexdigit).collect();
    if hex.len() > SHORT_ID_MAX || hex.len() % 2 != 0 {
        String::new()
    } else {
        hex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PBK: &str = "mN3iQ0kWc4aPq7XyZ1sB8dE5fG2hJ6kL9mN3iQ0kWc4";

    fn parse(raw: &str) -> EndpointDescriptor {
        EndpointDescriptor::parse(raw).unwrap()
    }

    #[test]
    fn parses_full_uri() {
        let d = parse(
            "vless://AB-12@203.0.113.7:8443?type=ws&security=tls&sni=example.com\
             &fp=firefox&alpn=h2,http/1.1&host=front.example.com&path=%2Fws&flow=xtls-rprx-vision#my%20tag",
        );
        assert_eq!(d.uuid, "ab-12");
        assert_eq!(d.address, "203.0.113.7");
        assert_eq!(d.port, 8443);
        assert_eq!(d.transport, Transport::Ws);
        assert_eq!(d.security, Security::Tls);
        assert_eq!(d.sni, "example.com");
        assert_eq!(d.fingerprint, "firefox");
        assert_eq!(d.alpn, vec!["h2", "http/1.1"]);
        assert_eq!(d.host, "front.example.com");
        assert_eq!(d.path, "/ws");
        assert_eq!(d.flow, "xtls-rprx-vision");
        assert_eq!(d.tag, "my tag");
    }

    #[test]
    fn defaults_apply_when_params_absent() {
        let d = parse("vless://u@example.org:443");
        assert_eq!(d.transport, Transport::Tcp);
        assert_eq!(d.security, Security::None);
        assert_eq!(d.encryption, "none");
        assert_eq!(d.sni, "example.org");
        assert_eq!(d.fingerprint, "chrome");
        assert_eq!(d.header_type, "none");
        assert_eq!(d.tag, "vless");
        assert!(d.alpn.is_empty());
    }

    #[test]
    fn port_defaults_to_443() {
        let d = parse("vless://u@example.org");
        assert_eq!(d.port, 443);
    }

    #[test]
    fn strips_bom_and_zero_width() {
        let d = parse("\u{feff}vless://u@example.org:443\u{200b}\r\n");
        assert_eq!(d.address, "example.org");
    }

    #[test]
    fn unknown_transport_normalizes_to_tcp() {
        let d = parse("vless://u@h.example:1?type=quic");
        assert_eq!(d.transport, Transport::Tcp);
    }

    #[test]
    fn transport_aliases_normalize() {
        assert_eq!(
            parse("vless://u@h.example:1?type=websocket").transport,
            Transport::Ws
        );
        assert_eq!(
            parse("vless://u@h.example:1?type=gun").transport,
            Transport::Grpc
        );
        assert_eq!(
            parse("vless://u@h.example:1?type=httpupgrade").transport,
            Transport::Http
        );
    }

    #[test]
    fn disallowed_flow_is_cleared() {
        let d = parse("vless://u@h.example:1?flow=xtls-rprx-unknown");
        assert_eq!(d.flow, "");
    }

    #[test]
    fn valid_public_key_upgrades_security_to_reality() {
        let d = parse(&format!("vless://u@h.example:1?security=tls&pbk={PBK}"));
        assert_eq!(d.security, Security::Reality);
        assert_eq!(d.public_key, PBK);
    }

    #[test]
    fn invalid_public_key_downgrades_requested_reality() {
        let d = parse("vless://u@h.example:1?security=reality&pbk=short");
        assert_ne!(d.security, Security::Reality);
        assert_eq!(d.public_key, "");
    }

    #[test]
    fn short_id_is_hex_filtered_and_length_checked() {
        assert_eq!(
            parse("vless://u@h.example:1?sid=ab-cd").short_id,
            "abcd",
            "non-hex separators are stripped"
        );
        assert_eq!(
            parse("vless://u@h.example:1?sid=abc").short_id,
            "",
            "odd length clears"
        );
        let long = "a".repeat(34);
        assert_eq!(
            parse(&format!("vless://u@h.example:1?sid={long}")).short_id,
            "",
            "over 32 chars clears"
        );
    }

    #[test]
    fn missing_identity_is_a_parse_failure() {
        assert_eq!(
            EndpointDescriptor::parse("vless://@example.org:443"),
            Err(ParseError::MissingIdentity)
        );
    }

    #[test]
    fn wrong_scheme_is_a_parse_failure() {
        assert_eq!(
            EndpointDescriptor::parse("trojan://u@example.org:443"),
            Err(ParseError::WrongScheme)
        );
    }

    #[test]
    fn uri_round_trips() {
        let original = parse(&format!(
            "vless://u@198.51.100.4:2053?type=grpc&security=reality&pbk={PBK}\
             &sid=aabb&sni=cdn.example&fp=safari&serviceName=svc&alpn=h2#tag-1"
        ));
        let reparsed = parse(&original.to_uri());
        assert_eq!(original, reparsed);
    }

    #[test]
    fn uri_round_trips_with_spaces_and_path() {
        let original = parse(
            "vless://u@example.org:443?type=ws&path=%2Fdeep%2Fpath&host=h.example#Spaced%20Tag",
        );
        let reparsed = parse(&original.to_uri());
        assert_eq!(original, reparsed);
    }

    #[test]
    fn candidate_keeps_cleaned_line() {
        let c = Candidate::from_line(" vless://u@example.org:443 \r\n").unwrap();
        assert_eq!(c.url, "vless://u@example.org:443");
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn parse_to_uri_round_trips(
                uuid in "[a-z0-9]{4,12}",
                host in "[a-z]{1,10}(\\.[a-z]{2,5}){1,2}",
                port in 1u16..=u16::MAX,
                transport in prop::sample::select(vec!["tcp", "ws", "grpc", "http"]),
                security in prop::sample::select(vec!["none", "tls"]),
                path in "(/[a-z0-9]{1,6}){0,3}",
                tag in "[A-Za-z0-9 _-]{0,12}",
            ) {
                let uri = format!(
                    "vless://{uuid}@{host}:{port}?type={transport}\
                     &security={security}&path={path}#{tag}"
                );
                let parsed = EndpointDescriptor::parse(&uri).unwrap();
                let reparsed = EndpointDescriptor::parse(&parsed.to_uri()).unwrap();
                prop_assert_eq!(parsed, reparsed);
            }
        }
    }
}
