// Copyright (c) The cmdt Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use camino::Utf8PathBuf;
use cmdt_runner::errors::{
    AsyncFlushError, ChannelError, ConfigError, ErrorList, SessionError, TailError, WorkDirError,
};
use owo_colors::OwoColorize;
use std::error::Error;
use thiserror::Error;
use tracing::error;

/// Documented exit codes for `cmdt` failures.
///
/// Unknown or unexpected failures always result in exit code 1.
pub enum CmdtExitCode {}

impl CmdtExitCode {
    /// No errors occurred and every test passed.
    pub const OK: i32 = 0;

    /// One or more tests failed, timed out or errored.
    pub const TEST_RUN_FAILED: i32 = 100;

    /// Recording a suite's output produced an error.
    pub const RECORD_FAILED: i32 = 104;

    /// Replaying a suite's output produced an error.
    pub const TAIL_FAILED: i32 = 106;

    /// Removing a suite's recorded output produced an error.
    pub const CLEAR_FAILED: i32 = 107;

    /// A user issue happened while setting up a cmdt invocation.
    pub const SETUP_ERROR: i32 = 96;
}

/// An error that cmdt knows how to report.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("config file not found")]
    ConfigNotFound { path: Utf8PathBuf },

    #[error("error loading config")]
    Config {
        #[source]
        error: ConfigError,
    },

    #[error("error setting up work directory")]
    WorkDir {
        #[source]
        error: WorkDirError,
    },

    #[error("error creating async runtime")]
    Runtime {
        #[source]
        error: std::io::Error,
    },

    #[error("error recording output")]
    Session {
        #[source]
        error: SessionError,
    },

    #[error("error reading output of `{command}`")]
    CommandOutput {
        command: String,
        #[source]
        error: std::io::Error,
    },

    #[error("test task failed")]
    TestTask {
        #[source]
        error: tokio::task::JoinError,
    },

    #[error("error flushing recorded output")]
    Flush {
        #[source]
        error: AsyncFlushError,
    },

    #[error("error displaying suite")]
    Display {
        #[source]
        error: TailError,
    },

    #[error("error tailing suite")]
    Tail {
        #[source]
        error: TailError,
    },

    #[error("error tailing suites")]
    TailAll {
        #[source]
        error: ErrorList<TailError>,
    },

    #[error("error clearing suite `{suite}`")]
    Clear {
        suite: String,
        #[source]
        error: ChannelError,
    },
}

impl ExpectedError {
    pub(crate) fn config_error(error: ConfigError) -> Self {
        Self::Config { error }
    }

    pub(crate) fn work_dir_error(error: WorkDirError) -> Self {
        Self::WorkDir { error }
    }

    pub(crate) fn session_error(error: SessionError) -> Self {
        Self::Session { error }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::ConfigNotFound { .. }
            | Self::Config { .. }
            | Self::WorkDir { .. }
            | Self::Runtime { .. } => CmdtExitCode::SETUP_ERROR,
            Self::Session { .. }
            | Self::CommandOutput { .. }
            | Self::TestTask { .. }
            | Self::Flush { .. }
            | Self::Display { .. } => CmdtExitCode::RECORD_FAILED,
            Self::Tail { .. } | Self::TailAll { .. } => CmdtExitCode::TAIL_FAILED,
            Self::Clear { .. } => CmdtExitCode::CLEAR_FAILED,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match self {
            Self::ConfigNotFound { path } => {
                error!("config file not found at `{}`", path.style(styles.bold));
                None
            }
            Self::Config { error } => {
                error!("failed to load config");
                Some(error as &dyn Error)
            }
            Self::WorkDir { error } => {
                error!("failed to set up work directory");
                Some(error as &dyn Error)
            }
            Self::Runtime { error } => {
                error!("failed to create async runtime");
                Some(error as &dyn Error)
            }
            Self::Session { error } => {
                error!("failed to record test output");
                Some(error as &dyn Error)
            }
            Self::CommandOutput { command, error } => {
                error!(
                    "failed to read output of `{}`",
                    command.style(styles.bold)
                );
                Some(error as &dyn Error)
            }
            Self::TestTask { error } => {
                error!("a test task failed unexpectedly");
                Some(error as &dyn Error)
            }
            Self::Flush { error } => {
                error!("failed to flush recorded output");
                Some(error as &dyn Error)
            }
            Self::Display { error } => {
                error!("failed to display suite output");
                Some(error as &dyn Error)
            }
            Self::Tail { error } => {
                error!("failed to tail suite output");
                Some(error as &dyn Error)
            }
            Self::TailAll { error } => {
                error!("failed to tail suite output");
                Some(error as &dyn Error)
            }
            Self::Clear { suite, error } => {
                error!("failed to clear suite `{}`", suite.style(styles.bold));
                Some(error as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_by_family() {
        let setup = ExpectedError::ConfigNotFound {
            path: "missing.toml".into(),
        };
        assert_eq!(setup.process_exit_code(), CmdtExitCode::SETUP_ERROR);

        let clear = ExpectedError::Clear {
            suite: "smoke".to_owned(),
            error: ChannelError::Remove {
                path: "smoke.out".into(),
                error: std::io::Error::other("denied"),
            },
        };
        assert_eq!(clear.process_exit_code(), CmdtExitCode::CLEAR_FAILED);
        assert_eq!(clear.to_string(), "error clearing suite `smoke`");
    }
}
