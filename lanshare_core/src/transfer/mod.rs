//! TCP file transfer: one connection per file.
//!
//! This module provides:
//! - The frame codec shared by both ends (`protocol`)
//! - The session state machine and progress snapshots (`session`)
//! - The sending and receiving halves of a session
//! - The accept loop for incoming connections (`server`)

pub mod constants;
pub mod hash;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod session;
pub mod utils;

// Re-export public API
pub use constants::TRANSFER_PORT;
pub use hash::ChecksumAlgorithm;
pub use server::{bind_listener, run_server};
pub use session::{
    Role, SessionState, TransferId, TransferOutcome, TransferProgress, TransferRequest,
};
