// Consistent exit codes for the annosync CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/argument error
//   10 = annotation index missing or unreadable
//   11 = invalid or unreadable configuration

use annosync_client::config::ConfigError;
use annosync_client::IndexError;

/// Named exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    IndexUnavailable = 10,
    Config = 11,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if cause.downcast_ref::<UsageError>().is_some() {
                return Self::Usage;
            }
            if cause.downcast_ref::<IndexError>().is_some() {
                return Self::IndexUnavailable;
            }
            if cause.downcast_ref::<ConfigError>().is_some() {
                return Self::Config;
            }
        }

        let msg = format!("{err:#}");
        if msg.contains("no annotation index") {
            return Self::IndexUnavailable;
        }

        Self::Error
    }
}

/// A command was invoked in a way it refuses to act on (missing `--yes`,
/// existing file without `--force`).
#[derive(Debug)]
pub struct UsageError(pub String);

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for UsageError {}
