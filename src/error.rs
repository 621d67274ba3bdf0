//! Error types for the DHCP front end.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. Failures reported by the inventory
//! and workflow collaborators use [`JobError`], which is `Clone` so a single
//! outcome can be handed to every caller sharing an in-flight lookup.

/// Errors that can occur while serving DHCP.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error (`show-config`).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed DHCP packet received.
    ///
    /// This includes packets that are too short, have invalid magic cookies,
    /// invalid option lengths, or other protocol violations.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// Relay agent information (option 82) whose declared lengths do not fit
    /// the bytes actually present.
    #[error("Malformed option {code}: {reason}")]
    MalformedOption { code: u8, reason: String },

    /// Every offset in the lease pool is leased or reserved.
    #[error("No IP addresses left to assign")]
    PoolExhausted,

    /// Invalid configuration value read from the environment.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67 without administrator privileges.
    #[error("Socket error: {0}")]
    Socket(String),

    /// An inventory or workflow call failed.
    #[error(transparent)]
    Job(#[from] JobError),

    /// The startup supervisor ran out of attempts.
    #[error("Gave up after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },
}

impl Error {
    pub(crate) fn malformed(code: u8, reason: impl Into<String>) -> Self {
        Self::MalformedOption {
            code,
            reason: reason.into(),
        }
    }
}

/// Errors returned by the inventory and workflow collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// The inventory has no hardware matching the lookup.
    #[error("hardware not found")]
    NotFound,

    /// The backend rejected or failed the call.
    #[error("backend error: {0}")]
    Backend(String),
}

/// A specialized Result type for DHCP operations.
pub type Result<T> = std::result::Result<T, Error>;
