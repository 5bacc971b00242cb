use thiserror::*;

/// Describes everything that can go wrong while driving a guest module.
#[derive(Debug, Error)]
pub enum GuestError {
    /// The guest handed the host an address or reference that does not decode.
    #[error("Guest and host disagree on the calling convention: {0}")]
    ProtocolMismatch(String),
    /// The guest's own call dispatch reported a failure.
    #[error("The guest raised an exception: {0}")]
    GuestException(String),
    /// The well-known entrypoint was not registered by guest startup.
    #[error("The guest did not register `{0}` during startup")]
    NotInitialized(String),
    /// The engine refused to grow linear memory.
    #[error("Linear memory could not grow by {pages} pages: {reason}")]
    MemoryGrowthFailure {
        /// The number of pages requested.
        pages: u32,
        /// The engine's explanation.
        reason: String
    },
    /// The bytecode was rejected or lacks an export the shim needs.
    #[error("The module was invalid: {0}")]
    InvalidModule(String),
    /// `start` was called on a runtime that already ran its entry point.
    #[error("The guest program has already been started")]
    AlreadyStarted,
    /// The guest called its exit routine and can no longer be resumed.
    #[error("The guest program has already exited with code {0}")]
    Exited(i32),
    /// The operating system could not supply random bytes.
    #[error("Could not gather random bytes: {0}")]
    Entropy(getrandom::Error),
    /// The engine trapped for a reason unrelated to the shim.
    #[error("{0}")]
    Trap(String)
}

impl GuestError {
    pub fn from_protocol(x: impl std::fmt::Display) -> Self {
        Self::ProtocolMismatch(x.to_string())
    }

    pub fn from_invalid_module(x: impl std::fmt::Display) -> Self {
        Self::InvalidModule(x.to_string())
    }

    pub fn from_trap(x: impl std::fmt::Display) -> Self {
        Self::Trap(x.to_string())
    }

    /// Whether this error leaves the runtime unusable for further calls.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::GuestException(_) | Self::NotInitialized(_) | Self::AlreadyStarted)
    }
}
