use std::net::Ipv6Addr;

/// Multicast scope values (RFC 7346)
pub const SCOPE_LINK_LOCAL: u8 = 2;
pub const SCOPE_REALM_LOCAL: u8 = 3;

/// fe80::/10
pub fn is_link_local(address: &Ipv6Addr) -> bool {
    (address.segments()[0] & 0xffc0) == 0xfe80
}

/// Scope nibble of a multicast address, or `None` for unicast.
pub fn multicast_scope(address: &Ipv6Addr) -> Option<u8> {
    if address.is_multicast() {
        Some(address.octets()[1] & 0x0f)
    } else {
        None
    }
}
