// Copyright (c) The cmdt Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by cmdt-runner.

use camino::Utf8PathBuf;
use std::{error::Error, fmt, time::Duration};
use thiserror::Error;

/// An I/O error that occurred while operating on a suite's data or sentinel files.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// Appending captured bytes to a data file failed.
    #[error("error appending to `{path}`")]
    Append {
        /// The data file.
        path: Utf8PathBuf,

        /// The error that occurred.
        #[source]
        error: std::io::Error,
    },

    /// Reading newly available bytes from a data file failed.
    #[error("error reading from `{path}` at offset {offset}")]
    Read {
        /// The data file.
        path: Utf8PathBuf,

        /// The offset the read started at.
        offset: u64,

        /// The error that occurred.
        #[source]
        error: std::io::Error,
    },

    /// Creating or checking a sentinel file failed.
    #[error("error accessing sentinel file `{path}`")]
    Sentinel {
        /// The sentinel file.
        path: Utf8PathBuf,

        /// The error that occurred.
        #[source]
        error: std::io::Error,
    },

    /// Removing a suite's files failed.
    #[error("error removing `{path}`")]
    Remove {
        /// The file that couldn't be removed.
        path: Utf8PathBuf,

        /// The error that occurred.
        #[source]
        error: std::io::Error,
    },

    /// Reading or replacing a suite's generation stamp failed.
    #[error("error recording run generation in `{path}`")]
    Generation {
        /// The generation file.
        path: Utf8PathBuf,

        /// The error that occurred.
        #[source]
        error: std::io::Error,
    },

    /// Listing the namespace directory failed.
    #[error("error listing suites in `{dir}`")]
    ListSuites {
        /// The namespace directory.
        dir: Utf8PathBuf,

        /// The error that occurred.
        #[source]
        error: std::io::Error,
    },
}

/// An error that occurred while setting up the per-run working directory.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkDirError {
    /// The system temporary directory is not valid UTF-8.
    #[error("temporary directory `{}` is not valid UTF-8", path.display())]
    TempDirNotUtf8 {
        /// The temporary directory.
        path: std::path::PathBuf,
    },

    /// Creating the namespace directory failed.
    #[error("error creating working directory `{dir}`")]
    Create {
        /// The directory that couldn't be created.
        dir: Utf8PathBuf,

        /// The error that occurred.
        #[source]
        error: std::io::Error,
    },
}

/// An error that occurred while flushing a suite's buffered output.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SuiteFlushError {
    /// No forward progress was made within the inactivity window.
    #[error(
        "suite `{suite}` stalled: no progress in {:?} (waiting on test #{cursor}, highest test #{max_seen})",
        idle
    )]
    Stalled {
        /// The suite that stalled.
        suite: String,

        /// The sequence number the suite is waiting on.
        cursor: u32,

        /// The highest sequence number registered so far.
        max_seen: u32,

        /// How long the suite has gone without progress.
        idle: Duration,
    },

    /// Writing to or checking the suite's files failed.
    #[error("error flushing suite `{suite}`")]
    Channel {
        /// The suite being flushed.
        suite: String,

        /// The underlying error.
        #[source]
        error: ChannelError,
    },
}

/// An error that occurred while tailing a suite's recorded output.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TailError {
    /// The suite was not marked flushed within the deadline.
    #[error("timed out after {timeout:?} waiting for suite `{suite}` to be flushed")]
    Timeout {
        /// The suite being tailed.
        suite: String,

        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// Reading the suite's files failed.
    #[error("error reading recorded output for suite `{suite}`")]
    Channel {
        /// The suite being tailed.
        suite: String,

        /// The underlying error.
        #[source]
        error: ChannelError,
    },

    /// Forwarding bytes to the final destination failed.
    #[error("error writing output for suite `{suite}`")]
    Write {
        /// The suite being tailed.
        suite: String,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// Discovering the suites to tail failed.
    #[error("error discovering suites to tail")]
    ListSuites {
        /// The underlying error.
        #[source]
        error: ChannelError,
    },

    /// The producer side failed while displaying recorded output in-process.
    #[error("error flushing suite `{suite}` while displaying it")]
    Flush {
        /// The suite being displayed.
        suite: String,

        /// The underlying error.
        #[source]
        error: SuiteFlushError,
    },
}

/// An error returned by a background flush task.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AsyncFlushError {
    /// The suite did not reach its done state within the deadline.
    #[error("timed out after {timeout:?} flushing suite `{suite}`")]
    Timeout {
        /// The suite being flushed.
        suite: String,

        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The flush loop failed.
    #[error("background flush of suite `{suite}` failed")]
    Flush {
        /// The suite being flushed.
        suite: String,

        /// The underlying error.
        #[source]
        error: SuiteFlushError,
    },

    /// Checking or creating a sentinel file failed.
    #[error("error signaling completion for suite `{suite}`")]
    Channel {
        /// The suite being flushed.
        suite: String,

        /// The underlying error.
        #[source]
        error: ChannelError,
    },

    /// The flush task was cancelled before it finished, typically because the runtime shut
    /// down.
    #[error("background flush of suite `{suite}` was cancelled")]
    Cancelled {
        /// The suite being flushed.
        suite: String,
    },

    /// The flush task panicked.
    #[error("background flush of suite `{suite}` panicked: {message}")]
    Panicked {
        /// The suite being flushed.
        suite: String,

        /// The panic message, if any.
        message: String,
    },
}

/// An error returned by a test display session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    /// The session was already closed.
    #[error("test #{seq} in suite `{suite}` was already closed")]
    Closed {
        /// The suite.
        suite: String,

        /// The test's sequence number.
        seq: u32,
    },

    /// The suite has been reported and accepts no new sessions until it is opened again.
    #[error("suite `{suite}` has already been reported")]
    Reported {
        /// The suite.
        suite: String,
    },

    /// Sequence number 0 is reserved for suite-level output.
    #[error("sequence number 0 is reserved for suite-level output (suite `{suite}`)")]
    ReservedSequence {
        /// The suite.
        suite: String,
    },

    /// Setting up or signaling the suite's files failed.
    #[error("error accessing files for suite `{suite}`")]
    Channel {
        /// The suite.
        suite: String,

        /// The underlying error.
        #[source]
        error: ChannelError,
    },
}

/// An error that occurred while loading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The config file couldn't be read.
    #[error("failed to read config file `{path}`")]
    Read {
        /// The config file.
        path: Utf8PathBuf,

        /// The error that occurred.
        #[source]
        error: std::io::Error,
    },

    /// The config file couldn't be parsed.
    #[error("failed to parse config file `{path}`")]
    Parse {
        /// The config file.
        path: Utf8PathBuf,

        /// The error that occurred.
        #[source]
        error: toml::de::Error,
    },

    /// A configured value was invalid.
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue {
        /// The configuration key.
        key: &'static str,

        /// Why the value is invalid.
        reason: String,
    },
}

/// A non-empty list of errors collected from independent suites.
///
/// A single error displays as itself. Several display as a count line followed by one bulleted
/// cause chain per error.
#[derive(Debug)]
pub struct ErrorList<T> {
    // A description of what the errors are.
    description: &'static str,
    // Invariant: this list is non-empty.
    inner: Vec<T>,
}

impl<T: Error> ErrorList<T> {
    /// Creates a new `ErrorList`, returning `None` if `errors` is empty.
    pub fn new(description: &'static str, errors: Vec<T>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self {
                description,
                inner: errors,
            })
        }
    }

    /// Returns the errors in this list.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.inner.iter()
    }

    /// Returns the number of errors in this list.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Always returns false, since the list is non-empty by construction.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl<T: Error> fmt::Display for ErrorList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // If a single error occurred, pretend that this is just that.
        if self.inner.len() == 1 {
            return write!(f, "{}", self.inner[0]);
        }

        writeln!(
            f,
            "{} errors occurred {}:",
            self.inner.len(),
            self.description,
        )?;
        for error in &self.inner {
            writeln!(f, "* {}", DisplayErrorChain::new(error))?;
        }
        Ok(())
    }
}

impl<T: Error> Error for ErrorList<T> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        if self.inner.len() == 1 {
            self.inner[0].source()
        } else {
            // More than one error occurred, so we can't return a single error here. Instead, we
            // return `None` and display the chain of causes in `fmt::Display`.
            None
        }
    }
}

/// A wrapper type to display a chain of errors with internal indentation.
///
/// This is similar to the display-error-chain crate, but uses a "caused by"
/// list rather than repeating the top-level message.
#[derive(Debug)]
pub struct DisplayErrorChain<E> {
    error: E,
}

impl<E: Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E: Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        let mut cause = self.error.source();
        while let Some(error) = cause {
            write!(f, "\n  caused by:\n  - {error}")?;
            cause = error.source();
        }

        Ok(())
    }
}
