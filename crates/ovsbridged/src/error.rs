//! Error types for ovsbridged
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-11: Error Handling - The failure that triggered a rollback stays the primary cause
//! - CP-10: System Recovery and Reconstitution - Compensation failures are reported, not dropped

use crate::commands::PipelineState;
use ovs_cfgmgr_common::CfgMgrError;
use ovs_ovsdb::OvsdbError;
use thiserror::Error;

/// Errors raised while provisioning or tearing down a bridge.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A command failed after earlier ones succeeded; those were undone.
    ///
    /// `cause` is the forward failure. `undo_errors` lists compensation
    /// failures in the order they happened and may be empty.
    #[error("{cause} (rolled back, {} undo failure(s){})", .undo_errors.len(), format_undo(.undo_errors))]
    Rollback {
        cause: Box<ProvisionError>,
        undo_errors: Vec<ProvisionError>,
    },

    /// Pop on an empty command stack.
    #[error("Command stack is empty")]
    EmptyStack,

    /// A command pipeline runs once; it was already started.
    #[error("Command pipeline is {0}, expected idle")]
    NotIdle(PipelineState),

    /// The default-bridge network must use the default bridge name.
    #[error("Bridge name {name} is not the default bridge name {expected}")]
    NonDefaultBridge { name: String, expected: String },

    #[error("Default network bridge {0} cannot be deleted")]
    DefaultBridgeProtected(String),

    #[error("Interface {0} not found")]
    InterfaceNotFound(String),

    /// No host interface carries a default route with a usable address.
    #[error("No host interface with a default route and IPv4 address")]
    NoHostInterface,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Ovsdb(#[from] OvsdbError),

    #[error(transparent)]
    Host(#[from] CfgMgrError),
}

fn format_undo(errors: &[ProvisionError]) -> String {
    if errors.is_empty() {
        return String::new();
    }
    let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!(": {}", joined.join("; "))
}

/// Result type alias for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;

impl ProvisionError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// The forward failure, looking through any rollback wrapper.
    pub fn root_cause(&self) -> &ProvisionError {
        match self {
            ProvisionError::Rollback { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Compensation failures attached to a rollback, empty otherwise.
    pub fn undo_errors(&self) -> &[ProvisionError] {
        match self {
            ProvisionError::Rollback { undo_errors, .. } => undo_errors,
            _ => &[],
        }
    }

    /// Whether re-running the whole provisioning attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self.root_cause() {
            ProvisionError::Ovsdb(e) => e.is_connection_error(),
            ProvisionError::Host(e) => e.is_retryable(),
            _ => false,
        }
    }
}
