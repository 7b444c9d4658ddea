//! Running `ip` and `ovs-vsctl` through `/bin/sh`.
//!
//! Device names and addresses end up inside a command line, so every
//! interpolated value goes through [`shellquote`] first.
//!
//! ```ignore
//! let cmd = format!("{} link set dev {} up", IP_CMD, shellquote("ovs0"));
//! shell::exec_or_throw(&cmd).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::error::{CfgMgrError, CfgMgrResult};

pub const IP_CMD: &str = "/sbin/ip";

/// Looked up on `PATH`; the OVS packages install it under different prefixes.
pub const OVS_VSCTL_CMD: &str = "ovs-vsctl";

static DOUBLE_QUOTE_SPECIALS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[$`"\\\n]"#).expect("static pattern"));

/// Double-quotes `s` for `/bin/sh`, backslash-escaping the characters
/// that stay live inside double quotes.
///
/// ```
/// use ovs_cfgmgr_common::shell::shellquote;
///
/// assert_eq!(shellquote("ovs0"), "\"ovs0\"");
/// assert_eq!(shellquote("a$b"), "\"a\\$b\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    quoted.push_str(&DOUBLE_QUOTE_SPECIALS.replace_all(s, r"\$0"));
    quoted.push('"');
    quoted
}

/// Exit status and trimmed output of one command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// `-1` if the process died from a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    fn from_output(output: &Output) -> Self {
        let text = |bytes: &[u8]| String::from_utf8_lossy(bytes).trim().to_string();
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: text(&output.stdout),
            stderr: text(&output.stderr),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Both streams, newline separated, skipping whichever is empty.
    pub fn combined_output(&self) -> String {
        [self.stdout.as_str(), self.stderr.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Runs `cmd` under `/bin/sh -c`. Only a failure to spawn is an error; the
/// exit status is left to the caller.
pub async fn exec(cmd: &str) -> CfgMgrResult<ExecResult> {
    debug!(command = %cmd, "exec");

    let output = Command::new("/bin/sh")
        .args(["-c", cmd])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| CfgMgrError::ShellExec {
            command: cmd.to_string(),
            source,
        })?;
    let result = ExecResult::from_output(&output);

    match result.exit_code {
        0 => trace!(command = %cmd, "exec ok"),
        code => warn!(
            command = %cmd,
            exit_code = code,
            stderr = %result.stderr,
            "Command exited non-zero"
        ),
    }
    Ok(result)
}

/// Like [`exec`], but a non-zero exit becomes
/// [`CfgMgrError::ShellCommandFailed`]. Yields stdout.
pub async fn exec_or_throw(cmd: &str) -> CfgMgrResult<String> {
    let result = exec(cmd).await?;
    if !result.success() {
        return Err(CfgMgrError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        });
    }
    Ok(result.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_shellquote_plain_names() {
        assert_eq!(shellquote("ovs0"), "\"ovs0\"");
        assert_eq!(shellquote("veth1a2b"), "\"veth1a2b\"");
        assert_eq!(shellquote("br-4c1f0b8e2d9a"), "\"br-4c1f0b8e2d9a\"");
    }

    #[test]
    fn test_shellquote_escapes_metacharacters() {
        assert_eq!(shellquote("$(reboot)"), "\"\\$(reboot)\"");
        assert_eq!(shellquote("`id`"), "\"\\`id\\`\"");
        assert_eq!(shellquote("a\"b"), "\"a\\\"b\"");
        assert_eq!(shellquote("a\\b"), "\"a\\\\b\"");
    }

    #[test]
    fn test_combined_output() {
        let both = ExecResult {
            exit_code: 1,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
        };
        assert_eq!(both.combined_output(), "out\nerr");

        let only_err = ExecResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: "Cannot find device".to_string(),
        };
        assert!(!only_err.success());
        assert_eq!(only_err.combined_output(), "Cannot find device");
    }

    #[tokio::test]
    async fn test_exec_captures_stdout() {
        let result = assert_ok!(exec("echo ovs0").await);
        assert!(result.success());
        assert_eq!(result.stdout, "ovs0");
    }

    #[tokio::test]
    async fn test_exec_reports_exit_code() {
        let result = assert_ok!(exec("exit 3").await);
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_exec_or_throw_keeps_stderr() {
        match assert_err!(exec_or_throw("echo nope >&2; exit 1").await) {
            CfgMgrError::ShellCommandFailed {
                exit_code, output, ..
            } => {
                assert_eq!(exit_code, 1);
                assert_eq!(output, "nope");
            }
            other => panic!("expected ShellCommandFailed, got {:?}", other),
        }
    }
}
