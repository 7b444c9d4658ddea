//! Error types for the OVSDB client.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-11: Error Handling - Per-operation database errors are aggregated, never truncated
//! - SC-5: Denial of Service Protection - Connection establishment is bounded

use ovs_cfgmgr_common::CfgMgrError;
use thiserror::Error;

/// Errors that can occur talking to OVSDB or operating on bridges/ports.
#[derive(Debug, Error)]
pub enum OvsdbError {
    /// Server unreachable after all connect attempts.
    #[error("Failed to connect to OVSDB at {endpoint} after {attempts} attempt(s): {message}")]
    Connection {
        endpoint: String,
        attempts: u32,
        message: String,
    },

    /// The connection dropped while a request was outstanding.
    #[error("OVSDB connection closed")]
    Disconnected,

    /// The root `Open_vSwitch` row never showed up in the cache.
    #[error("Root table row not observed after {attempts} poll(s)")]
    RootNotFound { attempts: u32 },

    /// JSON-RPC level error object returned by the server.
    #[error("OVSDB RPC error in {method}: {message}")]
    Rpc { method: String, message: String },

    /// Message did not follow the expected JSON-RPC / RFC 7047 shape.
    #[error("OVSDB protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Fewer results than submitted operations.
    #[error("Number of replies ({actual}) doesn't match operations number ({expected})")]
    ReplyMismatch { expected: usize, actual: usize },

    /// One or more operations were rejected. Each entry is `error(details)`.
    #[error("Transaction failed: {}", .0.join("; "))]
    Transaction(Vec<String>),

    #[error("Bridge {0} already exists")]
    BridgeAlreadyExists(String),

    #[error("Bridge {0} does not exist")]
    BridgeNotExists(String),

    #[error("Port {0} does not exist")]
    PortNotExists(String),

    /// A write committed but the follow-up Select disagrees.
    #[error("Failed to {action} {name}: not visible after commit")]
    PostCondition { action: String, name: String },

    /// The `ovs-vsctl` compatibility path also failed.
    #[error("ovs-vsctl fallback failed: {0}")]
    Fallback(#[from] CfgMgrError),
}

/// Result type alias for OVSDB operations.
pub type OvsdbResult<T> = std::result::Result<T, OvsdbError>;

impl OvsdbError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn post_condition(action: impl Into<String>, name: impl Into<String>) -> Self {
        Self::PostCondition {
            action: action.into(),
            name: name.into(),
        }
    }

    /// True for the create-when-present condition callers treat as success.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, OvsdbError::BridgeAlreadyExists(_))
    }

    /// True for the remove/delete-when-absent conditions.
    pub fn is_not_exists(&self) -> bool {
        matches!(
            self,
            OvsdbError::BridgeNotExists(_) | OvsdbError::PortNotExists(_)
        )
    }

    /// True when the client instance is unusable and must be rebuilt.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            OvsdbError::Connection { .. }
                | OvsdbError::Disconnected
                | OvsdbError::RootNotFound { .. }
                | OvsdbError::Io(_)
        )
    }

    /// Per-operation messages of a rejected transaction, empty otherwise.
    pub fn transaction_errors(&self) -> &[String] {
        match self {
            OvsdbError::Transaction(errors) => errors,
            _ => &[],
        }
    }
}
