// Copyright (c) The cmdt Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for the output multiplexer.
//!
//! All state that identifies a run (the token and isolation identifier) and every poll interval
//! and timeout lives in an explicit [`MuxConfig`]. Nothing is read from ambient process state
//! once a config has been built, so several independent multiplexers can coexist in one process.

use crate::errors::{ConfigError, WorkDirError};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::{collections::BTreeSet, io, time::Duration};
use tracing::{debug, warn};

/// The default interval between flush passes while blocking on a suite.
pub const DEFAULT_FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// The default interval between reads while tailing a suite.
pub const DEFAULT_TAIL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The default inactivity window after which a suite is considered stalled.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// The default deadline for blocking flush and tail calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Configuration for a multiplexer instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MuxConfig {
    token: String,
    isolation: String,
    work_dir: Utf8PathBuf,
    flush_poll_interval: Duration,
    tail_poll_interval: Duration,
    stall_timeout: Duration,
    default_timeout: Duration,
}

impl MuxConfig {
    /// Creates a new builder for the given run token.
    pub fn builder(token: impl Into<String>) -> MuxConfigBuilder {
        MuxConfigBuilder::new(token)
    }

    /// The caller-supplied token identifying this run.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The isolation identifier within the token.
    pub fn isolation(&self) -> &str {
        &self.isolation
    }

    /// The root working directory.
    pub fn work_dir(&self) -> &Utf8Path {
        &self.work_dir
    }

    /// The directory holding this run's suite files: `<work_dir>/<token>/<isolation>`.
    pub fn namespace_dir(&self) -> Utf8PathBuf {
        self.work_dir.join(&self.token).join(&self.isolation)
    }

    /// The interval between flush passes while blocking on a suite.
    pub fn flush_poll_interval(&self) -> Duration {
        self.flush_poll_interval
    }

    /// The interval between reads while tailing a suite.
    pub fn tail_poll_interval(&self) -> Duration {
        self.tail_poll_interval
    }

    /// How long a suite may go without progress before flushing fails.
    pub fn stall_timeout(&self) -> Duration {
        self.stall_timeout
    }

    /// The deadline used for blocking calls when the caller doesn't specify one.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

/// A builder for [`MuxConfig`].
#[derive(Clone, Debug)]
pub struct MuxConfigBuilder {
    token: String,
    isolation: String,
    work_dir: Option<Utf8PathBuf>,
    flush_poll_interval: Duration,
    tail_poll_interval: Duration,
    stall_timeout: Duration,
    default_timeout: Duration,
}

impl MuxConfigBuilder {
    fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            isolation: "default".to_owned(),
            work_dir: None,
            flush_poll_interval: DEFAULT_FLUSH_POLL_INTERVAL,
            tail_poll_interval: DEFAULT_TAIL_POLL_INTERVAL,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the isolation identifier (default: `default`).
    pub fn isolation(mut self, isolation: impl Into<String>) -> Self {
        self.isolation = isolation.into();
        self
    }

    /// Sets the root working directory (default: `<system temp dir>/cmdt`).
    pub fn work_dir(mut self, work_dir: impl Into<Utf8PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    /// Sets the interval between flush passes.
    pub fn flush_poll_interval(mut self, interval: Duration) -> Self {
        self.flush_poll_interval = interval;
        self
    }

    /// Sets the interval between tail reads.
    pub fn tail_poll_interval(mut self, interval: Duration) -> Self {
        self.tail_poll_interval = interval;
        self
    }

    /// Sets the inactivity window for stall detection.
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Sets the deadline for blocking calls.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Applies the values set in a config file on top of this builder.
    pub fn apply_file(mut self, file: &MuxConfigFile) -> Self {
        let mux = &file.mux;
        if let Some(isolation) = &mux.isolation {
            self.isolation = isolation.clone();
        }
        if let Some(work_dir) = &mux.work_dir {
            self.work_dir = Some(work_dir.clone());
        }
        if let Some(interval) = mux.flush_poll_interval {
            self.flush_poll_interval = interval;
        }
        if let Some(interval) = mux.tail_poll_interval {
            self.tail_poll_interval = interval;
        }
        if let Some(timeout) = mux.stall_timeout {
            self.stall_timeout = timeout;
        }
        if let Some(timeout) = mux.default_timeout {
            self.default_timeout = timeout;
        }
        self
    }

    /// Validates the configuration and builds it.
    pub fn build(self) -> Result<MuxConfig, ConfigError> {
        validate_component("token", &self.token)?;
        validate_component("isolation", &self.isolation)?;
        for (key, value) in [
            ("flush-poll-interval", self.flush_poll_interval),
            ("tail-poll-interval", self.tail_poll_interval),
            ("stall-timeout", self.stall_timeout),
            ("default-timeout", self.default_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key,
                    reason: "must be greater than zero".to_owned(),
                });
            }
        }

        let work_dir = match self.work_dir {
            Some(work_dir) => work_dir,
            None => default_work_dir().map_err(|error| ConfigError::InvalidValue {
                key: "work-dir",
                reason: error.to_string(),
            })?,
        };

        Ok(MuxConfig {
            token: self.token,
            isolation: self.isolation,
            work_dir,
            flush_poll_interval: self.flush_poll_interval,
            tail_poll_interval: self.tail_poll_interval,
            stall_timeout: self.stall_timeout,
            default_timeout: self.default_timeout,
        })
    }
}

// Tokens and isolation identifiers become directory names.
fn validate_component(key: &'static str, value: &str) -> Result<(), ConfigError> {
    let reason = if value.is_empty() {
        "must not be empty"
    } else if value == "." || value == ".." {
        "must not be `.` or `..`"
    } else if value.contains(['/', '\\']) {
        "must not contain path separators"
    } else {
        return Ok(());
    };
    Err(ConfigError::InvalidValue {
        key,
        reason: reason.to_owned(),
    })
}

fn default_work_dir() -> Result<Utf8PathBuf, WorkDirError> {
    let temp_dir = std::env::temp_dir();
    let temp_dir = Utf8PathBuf::from_path_buf(temp_dir)
        .map_err(|path| WorkDirError::TempDirNotUtf8 { path })?;
    Ok(temp_dir.join("cmdt"))
}

/// The deserialized form of a cmdt config file.
///
/// ```toml
/// [mux]
/// isolation = "ci"
/// flush-poll-interval = "2ms"
/// tail-poll-interval = "20ms"
/// stall-timeout = "60s"
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct MuxConfigFile {
    /// Multiplexer settings.
    #[serde(default)]
    pub mux: DeserializedMuxConfig,
}

/// The `[mux]` section of a config file. Every key is optional.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct DeserializedMuxConfig {
    /// The isolation identifier.
    #[serde(default)]
    pub isolation: Option<String>,

    /// The root working directory.
    #[serde(default)]
    pub work_dir: Option<Utf8PathBuf>,

    /// Interval between flush passes.
    #[serde(default, with = "humantime_serde")]
    pub flush_poll_interval: Option<Duration>,

    /// Interval between tail reads.
    #[serde(default, with = "humantime_serde")]
    pub tail_poll_interval: Option<Duration>,

    /// Inactivity window for stall detection.
    #[serde(default, with = "humantime_serde")]
    pub stall_timeout: Option<Duration>,

    /// Deadline for blocking calls.
    #[serde(default, with = "humantime_serde")]
    pub default_timeout: Option<Duration>,
}

impl MuxConfigFile {
    /// Loads a config file from disk.
    ///
    /// Returns `Ok(None)` if the file does not exist. Unknown keys are logged as warnings.
    pub fn from_path(path: &Utf8Path) -> Result<Option<Self>, ConfigError> {
        debug!("config: attempting to load from {path}");
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!("config: file does not exist at {path}");
                return Ok(None);
            }
            Err(error) => {
                return Err(ConfigError::Read {
                    path: path.to_owned(),
                    error,
                });
            }
        };

        let (config, unknown) =
            Self::deserialize_toml(&contents).map_err(|error| ConfigError::Parse {
                path: path.to_owned(),
                error,
            })?;
        if !unknown.is_empty() {
            let keys = unknown.into_iter().collect::<Vec<_>>().join(", ");
            warn!("in config file {path}, ignoring unknown configuration keys: {keys}");
        }

        Ok(Some(config))
    }

    /// Deserializes TOML content and returns the config along with any unknown keys.
    fn deserialize_toml(contents: &str) -> Result<(Self, BTreeSet<String>), toml::de::Error> {
        let deserializer = toml::Deserializer::parse(contents)?;
        let mut unknown = BTreeSet::new();
        let config: MuxConfigFile = serde_ignored::deserialize(deserializer, |path| {
            unknown.insert(path.to_string());
        })?;
        Ok((config, unknown))
    }
}
