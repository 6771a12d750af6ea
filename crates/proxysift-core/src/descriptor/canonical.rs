//! Canonical equality key for deduplication.
//!
//! Two descriptors are the same proxy when every compared field matches
//! under case-normalized equality, with "empty" and "absent" treated as
//! equal. The display tag and the transport host-header field are excluded
//! on purpose: two otherwise-identical endpoints reachable through different
//! front-door hostnames are one underlying proxy.

use super::{EndpointDescriptor, Security, Transport};

/// Equality-defining projection of a descriptor.
///
/// Derive it with [`EndpointDescriptor::canonical_key`]; equal keys mean
/// duplicate endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalKey {
    address: String,
    port: u16,
    uuid: String,
    encryption: String,
    transport: Transport,
    header_type: String,
    path: String,
    security: Security,
    flow: String,
    sni: String,
    alpn: Vec<String>,
    fingerprint: String,
    public_key: String,
    short_id: String,
}

impl CanonicalKey {
    /// Project a descriptor onto its compared fields.
    #[must_use]
    pub fn of(descriptor: &EndpointDescriptor) -> Self {
        Self {
            address: descriptor.address.to_lowercase(),
            port: descriptor.port,
            uuid: descriptor.uuid.to_lowercase(),
            encryption: descriptor.encryption.to_lowercase(),
            transport: descriptor.transport,
            header_type: descriptor.header_type.to_lowercase(),
            path: descriptor.path.clone(),
            security: descriptor.security,
            flow: descriptor.flow.to_lowercase(),
            sni: descriptor.sni.to_lowercase(),
            alpn: descriptor
                .alpn
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            fingerprint: descriptor.fingerprint.to_lowercase(),
            public_key: descriptor.public_key.clone(),
            short_id: descriptor.short_id.to_lowercase(),
        }
    }
}
