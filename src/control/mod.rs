//! Control plane: runtime management of a running proxy.
//!
//! This module provides a local IPC interface to the proxy:
//! - Unix domain socket server, owner-only permissions
//! - Length-prefixed bincode messages
//! - Policy changes (block, unblock, allow, remove, list)
//! - Cache statistics and purge
//!
//! The `webproxy` CLI subcommands are thin clients of this socket.

mod error;
pub mod protocol;
pub mod socket;

pub use error::{ControlError, ControlResult};
pub use protocol::{ControlRequest, ControlResponse};
pub use socket::{ControlClient, ControlHandler, ControlServer, MAX_MESSAGE_SIZE};
