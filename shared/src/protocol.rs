/// mDNS service type carrying the presence record of every peer-link node
pub const PRESENCE_SERVICE_TYPE: &str = "_peerlink._udp.local.";

/// TXT record keys used in the presence record
pub const TXT_ADDRESS: &str = "addr";
pub const TXT_INTENT: &str = "intent";
pub const TXT_DEVICE_TYPE: &str = "devtype";

/// TXT key stamped on every advertised service so responses can be
/// correlated with the device that sent them
pub const TXT_PEER: &str = "peer";

/// Default service advertised by a node
pub const DEFAULT_SERVICE_TYPE: &str = "_presence._tcp";
pub const DEFAULT_SERVICE_INSTANCE: &str = "_test";

/// Service record attribute keys
pub const TXT_LISTEN_PORT: &str = "listenport";
pub const TXT_BUDDY_NAME: &str = "buddyname";
pub const TXT_AVAILABLE: &str = "available";

/// Group owner intent range. 15 demands the owner role, 0 yields it.
pub const MAX_GROUP_OWNER_INTENT: u8 = 15;

/// API path prefix
pub const API_PREFIX: &str = "/v1";
