//! DNS-SD name decomposition.
//!
//! Names are split on the transport label (`._udp.` or `._tcp.`): everything
//! after it is the domain, the label pair ending in it is the service type,
//! and anything before that is the instance label. A name without a
//! transport label is a host name whose first label is the host.

use crate::error::{Error, Result};
use crate::protocol::{TRANSPORT_TCP, TRANSPORT_UDP};

/// Decomposed components of a full DNS name.
///
/// `domain` always ends with a dot. Which of the other fields are empty
/// tells the kind of name, see [`DnsNameInfo::name_type`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsNameInfo {
    pub instance_name: String,
    pub service_name: String,
    pub host_name: String,
    pub domain: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsNameType {
    Host,
    Service,
    Instance,
    Unknown,
}

impl DnsNameInfo {
    pub fn is_service_instance(&self) -> bool {
        !self.instance_name.is_empty()
    }

    pub fn is_service(&self) -> bool {
        !self.service_name.is_empty() && self.instance_name.is_empty()
    }

    pub fn is_host(&self) -> bool {
        self.service_name.is_empty()
    }

    pub fn name_type(&self) -> DnsNameType {
        if self.is_service_instance() && !self.service_name.is_empty() {
            DnsNameType::Instance
        } else if self.is_service() {
            DnsNameType::Service
        } else if self.is_host() && !self.host_name.is_empty() {
            DnsNameType::Host
        } else {
            DnsNameType::Unknown
        }
    }
}

fn with_trailing_dot(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

/// Split a full DNS name into instance, service, host and domain parts.
pub fn split_full_dns_name(name: &str) -> DnsNameInfo {
    let full_name = with_trailing_dot(name);
    let mut info = DnsNameInfo::default();

    let transport_pos = full_name
        .rfind(TRANSPORT_UDP)
        .or_else(|| full_name.rfind(TRANSPORT_TCP));

    match transport_pos {
        None => {
            // host.domain
            if let Some(dot) = full_name.find('.') {
                info.host_name = full_name[..dot].to_string();
                info.domain = full_name[dot + 1..].to_string();
            }
        }
        // no service label in front of the transport
        Some(0) => return info,
        Some(transport_pos) => {
            // "._udp." and "._tcp." are both six bytes long
            info.domain = full_name[transport_pos + TRANSPORT_UDP.len()..].to_string();

            match full_name[..transport_pos].rfind('.') {
                // empty instance label
                Some(0) => return DnsNameInfo::default(),
                // service.domain
                None => info.service_name = full_name[..transport_pos + 5].to_string(),
                // instance.service.domain
                Some(dot) => {
                    info.instance_name = full_name[..dot].to_string();
                    info.service_name = full_name[dot + 1..transport_pos + 5].to_string();
                }
            }
        }
    }

    if !info.domain.ends_with('.') {
        info.domain.push('.');
    }

    info
}

/// Split "instance.service.domain." into its three parts.
pub fn split_full_service_instance_name(full_name: &str) -> Result<(String, String, String)> {
    let info = split_full_dns_name(full_name);
    if info.name_type() != DnsNameType::Instance {
        return Err(Error::InvalidArgs);
    }
    Ok((info.instance_name, info.service_name, info.domain))
}

/// Split "host.domain." into host label and domain.
pub fn split_full_host_name(full_name: &str) -> Result<(String, String)> {
    let info = split_full_dns_name(full_name);
    if info.name_type() != DnsNameType::Host {
        return Err(Error::InvalidArgs);
    }
    Ok((info.host_name, info.domain))
}

/// Service types compare case-insensitively, ignoring a trailing dot.
pub fn is_service_type_equal(first: &str, second: &str) -> bool {
    let first = first.strip_suffix('.').unwrap_or(first);
    let second = second.strip_suffix('.').unwrap_or(second);
    first.eq_ignore_ascii_case(second)
}
