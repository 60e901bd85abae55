// Copyright (c) The cmdt Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The entry point that ties the pieces together.

use crate::{
    channel::{ChannelStore, FileStore},
    config::MuxConfig,
    errors::{AsyncFlushError, ChannelError, ErrorList, SessionError, TailError, WorkDirError},
    format::{DisplayFormatter, SuiteReport},
    registry::SuiteRegistry,
    session::{SessionTable, TestSession},
    tail::{AsyncFlushHandle, AsyncFlushHandles, Tailer, async_flush_all, spawn_async_flush},
};
use std::{io::Write, sync::Arc};

/// An ordered output multiplexer for one run namespace.
///
/// Cloning is cheap and clones share all state. Producers open sessions through this type,
/// and consumers tail or display suites through it.
#[derive(Clone, Debug)]
pub struct OutputMux {
    config: Arc<MuxConfig>,
    registry: Arc<SuiteRegistry>,
    sessions: Arc<SessionTable>,
    tailer: Arc<Tailer>,
}

impl OutputMux {
    /// Creates a multiplexer that persists suites to files in the config's namespace directory.
    pub fn with_file_store(
        config: MuxConfig,
        formatter: Arc<dyn DisplayFormatter>,
    ) -> Result<Self, WorkDirError> {
        let store = FileStore::new(&config)?;
        Ok(Self::new(config, Arc::new(store), formatter))
    }

    /// Creates a multiplexer over an arbitrary channel store.
    pub fn new(
        config: MuxConfig,
        store: Arc<dyn ChannelStore>,
        formatter: Arc<dyn DisplayFormatter>,
    ) -> Self {
        let registry = Arc::new(SuiteRegistry::new(store, &config));
        let sessions = Arc::new(SessionTable::new(registry.clone(), formatter));
        let tailer = Arc::new(Tailer::new(registry.clone(), &config));
        Self {
            config: Arc::new(config),
            registry,
            sessions,
            tailer,
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// The suite registry.
    pub fn registry(&self) -> &Arc<SuiteRegistry> {
        &self.registry
    }

    /// The consumer side.
    pub fn tailer(&self) -> &Tailer {
        &self.tailer
    }

    /// See [`SessionTable::open_suite`]. The tailer also forgets how far it read the
    /// previous run.
    pub fn open_suite(&self, suite: &str, header: Option<&str>) -> Result<(), SessionError> {
        self.tailer.forget(suite);
        self.sessions.open_suite(suite, header)
    }

    /// See [`SessionTable::report_suite`].
    pub fn report_suite(&self, suite: &str, report: &SuiteReport) -> Result<(), SessionError> {
        self.sessions.report_suite(suite, report)
    }

    /// See [`SessionTable::open`].
    pub fn open(&self, suite: &str, seq: u32) -> Result<Arc<TestSession>, SessionError> {
        self.sessions.open(suite, seq)
    }

    /// See [`SessionTable::close`].
    pub fn close(&self, suite: &str, seq: u32) -> Result<(), SessionError> {
        self.sessions.close(suite, seq)
    }

    /// Returns every suite referenced so far, in first-reference order.
    pub fn list_touched_suites(&self) -> Vec<String> {
        self.registry.list_touched_suites()
    }

    /// Discards a suite, its sessions and tail offsets, and deletes its files.
    pub fn clear_suite(&self, suite: &str) -> Result<(), ChannelError> {
        self.sessions.forget_suite(suite);
        self.tailer.forget(suite);
        self.registry.clear(suite)
    }

    /// Flushes one suite in the background, bounded by the default timeout.
    pub fn flush(&self, suite: &str) -> AsyncFlushHandle {
        spawn_async_flush(
            self.registry.clone(),
            suite,
            self.config.default_timeout(),
        )
    }

    /// Flushes every touched suite in the background, bounded by the default timeout.
    pub fn flush_all(&self) -> AsyncFlushHandles {
        async_flush_all(&self.registry, self.config.default_timeout())
    }

    /// Flushes every touched suite and waits for all of them.
    pub async fn flush_all_and_wait(&self) -> Result<(), ErrorList<AsyncFlushError>> {
        self.flush_all().wait().await
    }

    /// Tails every known suite until each is flushed, bounded by the default timeout.
    pub async fn tail_all(
        &self,
        out: &mut impl Write,
        err: &mut impl Write,
    ) -> Result<(), ErrorList<TailError>> {
        self.tailer
            .block_tail_all(self.config.default_timeout(), out, err)
            .await
    }

    /// Displays one suite in this process, bounded by the default timeout.
    pub async fn display_recorded(
        &self,
        suite: &str,
        out: &mut impl Write,
        err: &mut impl Write,
    ) -> Result<(), TailError> {
        self.tailer
            .display_recorded(suite, self.config.default_timeout(), out, err)
            .await
    }
}
