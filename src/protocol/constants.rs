//! Relay Protocol Constants

// Frame tags
pub const TAG_CONNECT_SUCCESS_SID: u16 = 0x0001;
pub const TAG_RECONNECT_SUCCESS_ACK: u16 = 0x0002;
pub const TAG_DATA: u16 = 0x0004;
pub const TAG_ACK: u16 = 0x0007;

// Field sizes
pub const TAG_LEN: usize = 2;
pub const LENGTH_FIELD_LEN: usize = 4;
pub const ACK_FIELD_LEN: usize = 8;

/// Largest payload a single DATA frame may carry.
pub const MAX_DATA_LEN: usize = 16 * 1024;

/// Smallest buffer a caller may pass to a relay read. A single DATA frame
/// must always fit.
pub const MIN_READ_SIZE: usize = MAX_DATA_LEN;

/// Upper bound on session ids accepted from the relay.
pub const MAX_SID_LEN: usize = 1024;

// Relay endpoint defaults
pub const DEFAULT_RELAY_ENDPOINT: &str = "wss://tunnel.cloudproxy.app/v4";
pub const RELAY_ORIGIN: &str = "bot:iap-tunneler";
pub const RELAY_SUBPROTOCOL: &str = "relay.tunnel.cloudproxy.app";
pub const CONNECT_PATH: &str = "connect";
pub const RECONNECT_PATH: &str = "reconnect";
pub const DEFAULT_NETWORK_INTERFACE: &str = "nic0";

// WebSocket close codes used by the relay
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_ERROR_UNKNOWN: u16 = 4000;
pub const CLOSE_SID_UNKNOWN: u16 = 4001;
pub const CLOSE_SID_IN_USE: u16 = 4002;
pub const CLOSE_FAILED_TO_CONNECT_TO_BACKEND: u16 = 4003;
pub const CLOSE_REAUTHENTICATION_REQUIRED: u16 = 4004;
pub const CLOSE_BAD_ACK: u16 = 4005;
pub const CLOSE_INVALID_ACK: u16 = 4006;
pub const CLOSE_INVALID_WEBSOCKET_OPCODE: u16 = 4007;
pub const CLOSE_INVALID_TAG: u16 = 4008;
pub const CLOSE_DESTINATION_WRITE_FAILED: u16 = 4009;
pub const CLOSE_DESTINATION_READ_FAILED: u16 = 4010;
pub const CLOSE_INVALID_DATA: u16 = 4013;
pub const CLOSE_NOT_AUTHORIZED: u16 = 4033;
pub const CLOSE_LOOKUP_FAILED: u16 = 4047;
pub const CLOSE_LOOKUP_FAILED_RECONNECT: u16 = 4051;
