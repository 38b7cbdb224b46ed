/// Domain the local discovery daemon publishes and browses in
pub const LOCAL_DOMAIN: &str = "local.";

/// Ceiling applied to TTLs forwarded to the mesh by the discovery proxy (seconds)
pub const SERVICE_TTL_CAP_LIMIT: u32 = 10;

/// Longest single TXT entry (`key=value`) that fits its length byte
pub const MAX_TXT_ENTRY_SIZE: usize = 255;

/// Transport labels that mark the end of a DNS-SD service name
pub const TRANSPORT_UDP: &str = "._udp.";
pub const TRANSPORT_TCP: &str = "._tcp.";

/// Length of a Thread mesh-local prefix in bytes
pub const MESH_LOCAL_PREFIX_LEN: usize = 8;

/// Upper bound of an operational dataset TLV blob
pub const MAX_DATASET_TLVS_LEN: usize = 254;
