// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
//! Pieces shared by the FocusKnob daemon and its UI clients: the IPC
//! message model, the pending-request correlator, socket plumbing and
//! the settings file.

#[cfg(unix)]
pub mod ipc;
pub mod paths;
pub mod pending;
pub mod protocol;
pub mod settings;

pub use pending::{CorrelatorError, PendingHandle, PendingRequests};
pub use protocol::{
    DaemonStatus, InputField, InputReply, InputRequest, Message, PromptKind, ProtocolError,
    RequestKind,
};
pub use settings::{ConfigError, Settings};
