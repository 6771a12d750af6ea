//! Core process configuration synthesis.
//!
//! Turns an ordered list of descriptors into the JSON document an
//! xray-compatible core consumes: one local SOCKS inbound per descriptor,
//! one vless outbound per descriptor, and a routing rule pinning each
//! inbound to its outbound. Stream settings are derived deterministically
//! from the descriptor's transport kind and security mode.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::descriptor::{Candidate, EndpointDescriptor, Security, Transport};

/// One (descriptor, local port) assignment inside a batch.
#[derive(Debug, Clone)]
pub struct PlannedEndpoint {
    /// The candidate this listener routes to.
    pub candidate: Candidate,
    /// Local SOCKS port assigned to it.
    pub port: u16,
}

/// Ordered listener assignments plus the synthesized configuration for one
/// batch attempt.
///
/// Owned exclusively by the worker executing the batch and discarded after
/// the batch's process exits.
#[derive(Debug)]
pub struct BatchPlan {
    /// Descriptors that produced a usable outbound, in assignment order.
    pub entries: Vec<PlannedEndpoint>,
    start_port: u16,
    config: ProxyConfig,
}

impl BatchPlan {
    /// Plan a batch: assign `start_port + i` to the i-th candidate and
    /// synthesize the combined configuration.
    ///
    /// Candidates that produce no usable outbound are excluded from the
    /// plan (their port stays dark); exclusion is logged and never fails
    /// the batch.
    #[must_use]
    pub fn new(candidates: &[Candidate], start_port: u16) -> Self {
        let mut entries = Vec::with_capacity(candidates.len());
        let mut inbounds = Vec::new();
        let mut outbounds = Vec::new();
        let mut rules = Vec::new();

        for (i, candidate) in candidates.iter().enumerate() {
            let port = start_port + u16::try_from(i).unwrap_or(0);
            let in_tag = format!("in_{port}");
            let out_tag = format!("out_{port}");

            let outbound = match synthesize_outbound(&candidate.descriptor, &out_tag) {
                Ok(outbound) => outbound,
                Err(reason) => {
                    debug!(
                        endpoint = %candidate.descriptor.endpoint(),
                        reason,
                        "skipping descriptor with no usable outbound"
                    );
                    continue;
                },
            };

            inbounds.push(Inbound::socks(port, in_tag.clone()));
            rules.push(Rule::pin(in_tag, out_tag));
            outbounds.push(outbound);
            entries.push(PlannedEndpoint {
                candidate: candidate.clone(),
                port,
            });
        }

        Self {
            entries,
            start_port,
            config: ProxyConfig {
                log: LogSection { loglevel: "none" },
                inbounds,
                outbounds,
                routing: Routing {
                    rules,
                    domain_strategy: "AsIs",
                },
            },
        }
    }

    /// Plan a single-listener configuration for the fallback path.
    #[must_use]
    pub fn singleton(candidate: &Candidate, port: u16) -> Self {
        Self::new(std::slice::from_ref(candidate), port)
    }

    /// True when no candidate produced a usable outbound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Assigned local ports, in assignment order.
    #[must_use]
    pub fn ports(&self) -> Vec<u16> {
        self.entries.iter().map(|e| e.port).collect()
    }

    /// Write the configuration into `dir` as a uniquely named artifact.
    ///
    /// The caller owns removal; workers keep plans inside a scoped
    /// temporary directory so every exit path cleans up.
    ///
    /// # Errors
    ///
    /// Returns [`SynthError`] when serialization or the write fails.
    pub fn write_config(&self, dir: &Path) -> Result<PathBuf, SynthError> {
        let path = dir.join(format!("batch_{}.json", self.start_port));
        let body = serde_json::to_vec_pretty(&self.config).map_err(SynthError::Serialize)?;
        std::fs::write(&path, body).map_err(|source| SynthError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// The synthesized document, for inspection in tests.
    #[must_use]
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

/// Configuration synthesis error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SynthError {
    /// The configuration could not be serialized.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The configuration artifact could not be written.
    #[error("failed to write configuration to {path}: {source}")]
    Write {
        /// Artifact path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Build the outbound for one descriptor.
///
/// The parser already guarantees mode/parameter consistency; the remaining
/// failure is a Reality descriptor whose key was lost, which is excluded
/// from the batch rather than failing it.
fn synthesize_outbound(
    descriptor: &EndpointDescriptor,
    tag: &str,
) -> Result<Outbound, &'static str> {
    if descriptor.security == Security::Reality && descriptor.public_key.is_empty() {
        return Err("reality outbound without a public key");
    }

    let user = User {
        id: descriptor.uuid.clone(),
        encryption: "none",
        flow: if descriptor.flow.is_empty() {
            None
        } else {
            Some(descriptor.flow.clone())
        },
    };

    let mut stream = StreamSettings {
        network: descriptor.transport.as_str(),
        security: descriptor.security.as_str(),
        tls: None,
        reality: None,
        ws: None,
        grpc: None,
        http: None,
        tcp: None,
    };

    match descriptor.security {
        Security::Tls => {
            stream.tls = Some(TlsSettings {
                server_name: descriptor.sni.clone(),
                fingerprint: descriptor.fingerprint.clone(),
                allow_insecure: true,
                alpn: if descriptor.alpn.is_empty() {
                    None
                } else {
                    Some(descriptor.alpn.clone())
                },
            });
        },
        Security::Reality => {
            stream.reality = Some(RealitySettings {
                public_key: descriptor.public_key.clone(),
                short_id: descriptor.short_id.clone(),
                server_name: descriptor.sni.clone(),
                fingerprint: descriptor.fingerprint.clone(),
                spider_x: "/",
            });
        },
        Security::None => {},
    }

    match descriptor.transport {
        Transport::Ws => {
            let host = effective_host(descriptor);
            let mut headers = BTreeMap::new();
            if !host.is_empty() {
                headers.insert("Host".to_string(), host);
            }
            stream.ws = Some(WsSettings {
                path: effective_path(descriptor),
                headers,
            });
        },
        Transport::Grpc => {
            stream.grpc = Some(GrpcSettings {
                service_name: descriptor.service_name.clone(),
                multi_mode: false,
            });
        },
        Transport::Http => {
            let host = effective_host(descriptor);
            stream.http = Some(HttpSettings {
                path: effective_path(descriptor),
                host: if host.is_empty() { Vec::new() } else { vec![host] },
            });
        },
        Transport::Tcp => {
            if descriptor.header_type != "none" {
                stream.tcp = Some(TcpSettings {
                    header: TcpHeader {
                        kind: descriptor.header_type.clone(),
                    },
                });
            }
        },
    }

    Ok(Outbound {
        protocol: "vless",
        tag: tag.to_string(),
        settings: OutboundSettings {
            vnext: vec![Vnext {
                address: descriptor.address.clone(),
                port: descriptor.port,
                users: vec![user],
            }],
        },
        stream,
    })
}

/// Host header with fallback to the SNI, matching core expectations for
/// fronted websocket/HTTP-upgrade endpoints.
fn effective_host(descriptor: &EndpointDescriptor) -> String {
    if descriptor.host.is_empty() {
        descriptor.sni.clone()
    } else {
        descriptor.host.clone()
    }
}

fn effective_path(descriptor: &EndpointDescriptor) -> String {
    if descriptor.path.is_empty() {
        "/".to_string()
    } else {
        descriptor.path.clone()
    }
}

// Wire structs below mirror the core's JSON schema; field names follow the
// document, not Rust convention.

/// Top-level configuration document.
#[derive(Debug, Serialize)]
pub struct ProxyConfig {
    log: LogSection,
    inbounds: Vec<Inbound>,
    outbounds: Vec<Outbound>,
    routing: Routing,
}

#[derive(Debug, Serialize)]
struct LogSection {
    loglevel: &'static str,
}

#[derive(Debug, Serialize)]
struct Inbound {
    port: u16,
    listen: &'static str,
    protocol: &'static str,
    tag: String,
    settings: SocksSettings,
}

impl Inbound {
    fn socks(port: u16, tag: String) -> Self {
        Self {
            port,
            listen: "127.0.0.1",
            protocol: "socks",
            tag,
            settings: SocksSettings { udp: false },
        }
    }
}

#[derive(Debug, Serialize)]
struct SocksSettings {
    udp: bool,
}

#[derive(Debug, Serialize)]
struct Outbound {
    protocol: &'static str,
    tag: String,
    settings: OutboundSettings,
    #[serde(rename = "streamSettings")]
    stream: StreamSettings,
}

#[derive(Debug, Serialize)]
struct OutboundSettings {
    vnext: Vec<Vnext>,
}

#[derive(Debug, Serialize)]
struct Vnext {
    address: String,
    port: u16,
    users: Vec<User>,
}

#[derive(Debug, Serialize)]
struct User {
    id: String,
    encryption: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    flow: Option<String>,
}

#[derive(Debug, Serialize)]
struct StreamSettings {
    network: &'static str,
    security: &'static str,
    #[serde(rename = "tlsSettings", skip_serializing_if = "Option::is_none")]
    tls: Option<TlsSettings>,
    #[serde(rename = "realitySettings", skip_serializing_if = "Option::is_none")]
    reality: Option<RealitySettings>,
    #[serde(rename = "wsSettings", skip_serializing_if = "Option::is_none")]
    ws: Option<WsSettings>,
    #[serde(rename = "grpcSettings", skip_serializing_if = "Option::is_none")]
    grpc: Option<GrpcSettings>,
    #[serde(rename = "httpSettings", skip_serializing_if = "Option::is_none")]
    http: Option<HttpSettings>,
    #[serde(rename = "tcpSettings", skip_serializing_if = "Option::is_none")]
    tcp: Option<TcpSettings>,
}

#[derive(Debug, Serialize)]
struct TlsSettings {
    #[serde(rename = "serverName")]
    server_name: String,
    fingerprint: String,
    #[serde(rename = "allowInsecure")]
    allow_insecure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    alpn: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct RealitySettings {
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(rename = "shortId")]
    short_id: String,
    #[serde(rename = "serverName")]
    server_name: String,
    fingerprint: String,
    #[serde(rename = "spiderX")]
    spider_x: &'static str,
}

#[derive(Debug, Serialize)]
struct WsSettings {
    path: String,
    headers: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct GrpcSettings {
    #[serde(rename = "serviceName")]
    service_name: String,
    #[serde(rename = "multiMode")]
    multi_mode: bool,
}

#[derive(Debug, Serialize)]
struct HttpSettings {
    path: String,
    host: Vec<String>,
}

#[derive(Debug, Serialize)]
struct TcpSettings {
    header: TcpHeader,
}

#[derive(Debug, Serialize)]
struct TcpHeader {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct Routing {
    rules: Vec<Rule>,
    #[serde(rename = "domainStrategy")]
    domain_strategy: &'static str,
}

#[derive(Debug, Serialize)]
struct Rule {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "inboundTag")]
    inbound_tag: Vec<String>,
    #[serde(rename = "outboundTag")]
    outbound_tag: String,
}

impl Rule {
    fn pin(in_tag: String, out_tag: String) -> Self {
        Self {
            kind: "field",
            inbound_tag: vec![in_tag],
            outbound_tag: out_tag,
        }
    }
}
