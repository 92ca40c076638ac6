use std::time::Duration;

/// Default TCP port for file transfer
pub const TRANSFER_PORT: u16 = 8513;

/// Default chunk size (1MB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest chunk a receiver will agree to (4MB)
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Smallest negotiable chunk size (4KB)
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// Maximum size of a JSON control message (64KB)
pub const MAX_MSG_SIZE: usize = 64 * 1024;

/// Maximum file name length accepted in an offer
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Default upper bound on an offered file (1TB)
pub const MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024 * 1024;

/// Free space a receiver keeps in reserve beyond the file itself (64MB)
pub const DISK_SPACE_MARGIN: u64 = 64 * 1024 * 1024;

/// Frames buffered between the socket reader task and the session loop
pub const FRAME_QUEUE_DEPTH: usize = 4;

/// Version carried in every transfer offer
pub const TRANSFER_PROTOCOL_VERSION: u32 = 1;

/// Default acknowledgement cadence (8MB)
pub const ACK_INTERVAL_BYTES: u64 = 8 * 1024 * 1024;

/// How long a best-effort Cancel/Abort to the peer may take
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a cancelled sender keeps pushing the chunk already on the wire
pub const CANCEL_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Default SO_SNDBUF / SO_RCVBUF for transfer sockets (2MB)
pub const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;
