//! Failures from the host side of bridge provisioning: spawned `ip` and
//! `ovs-vsctl` processes, `/proc/sys` knobs and `/proc/net` tables.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type CfgMgrResult<T> = Result<T, CfgMgrError>;

#[derive(Debug, Error)]
pub enum CfgMgrError {
    /// `/bin/sh` could not be started at all.
    #[error("Cannot spawn '{command}': {source}")]
    ShellExec {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The command ran and exited non-zero. `output` is stdout and stderr.
    #[error("'{command}' exited with {exit_code}: {output}")]
    ShellCommandFailed {
        command: String,
        exit_code: i32,
        output: String,
    },

    /// `key` is in dotted form (`net.ipv4.ip_forward`), `path` is the
    /// backing file under `/proc/sys`.
    #[error("Sysctl {key} at {}: {source}", path.display())]
    Sysctl {
        key: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot read {}: {source}", path.display())]
    ProcRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Output from `ip` or a kernel table that does not look the way we
    /// expect.
    #[error("Cannot parse {what}: {message}")]
    Parse { what: String, message: String },

    /// A broken invariant in our own bookkeeping rather than on the host.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CfgMgrError {
    pub fn parse(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// A failed `ip`/`ovs-vsctl` run may pass on a later attempt, e.g. once
    /// udev has renamed a device or `ovs-vswitchd` has caught up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CfgMgrError::ShellCommandFailed { .. })
    }
}
