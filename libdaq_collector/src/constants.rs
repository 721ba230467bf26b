use std::time::Duration;

/// Protocol word exchanged during the producer handshake
pub const PROTOCOL_NAME: &str = "EUDAQ";
/// Connection kind announced in the handshake line
pub const DATA_CONNECTION: &str = "DATA";
/// Handshake acknowledgement
pub const HANDSHAKE_OK: &str = "OK";

/// Frame type byte for a text line (handshake, acknowledgements)
pub const FRAME_TYPE_TEXT: u8 = 1;
/// Frame type byte for a serialized Event
pub const FRAME_TYPE_EVENT: u8 = 2;
/// Size of the frame header (u32 length + u8 type)
pub const FRAME_HEADER_SIZE: usize = 5;
/// Largest frame we accept from a producer (64 MiB)
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;
/// Maximum nesting of sub-events in a serialized Event
pub const MAX_SUB_EVENT_DEPTH: usize = 16;

/// Default per-source queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;
/// Default capacity of a hub dispatch queue
pub const DEFAULT_HUB_CAPACITY: usize = 1024;
/// Default capacity of the buffer in front of the sink
pub const DEFAULT_SINK_BUFFER: usize = 256;

/// How long a hub waits before re-attempting parked deliveries
pub const RETRY_INTERVAL: Duration = Duration::from_micros(100);
/// Poll interval of the accept loop
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Interval between status snapshots in the run loop
pub const STATUS_INTERVAL: Duration = Duration::from_millis(500);

/// How long a stopping hub keeps re-offering parked events before giving up on them
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// How long a new connection may take to identify itself
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
