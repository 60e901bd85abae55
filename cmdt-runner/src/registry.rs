// Copyright (c) The cmdt Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The set of live suite multiplexers.
//!
//! The registry maps suite names to [`SuiteMultiplexer`]s. All structural changes to the map
//! happen under a single lock, and flushing never holds that lock: a flush marks the suite's
//! entry as being flushed, then runs passes against the multiplexer's own lock.

use crate::{
    channel::ChannelStore,
    config::MuxConfig,
    errors::{ChannelError, SuiteFlushError},
    helpers::lock,
    printer::BufferedPrinter,
    suite::{FlushState, SuiteMultiplexer},
};
use indexmap::IndexSet;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::debug;

/// How long [`SuiteRegistry::flush`] keeps going.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    /// Run one ordering pass.
    SinglePass,

    /// Run passes until the suite reaches its done state, sleeping between passes.
    UntilDone,
}

/// The result of a [`SuiteRegistry::flush`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The suite isn't registered, or another caller is already flushing it.
    NothingToFlush,

    /// A single pass ran, and the suite isn't done yet.
    Pending,

    /// The suite reached its done state and was removed from the registry.
    Done,
}

/// Holds one [`SuiteMultiplexer`] per suite name.
#[derive(Debug)]
pub struct SuiteRegistry {
    store: Arc<dyn ChannelStore>,
    flush_poll_interval: Duration,
    stall_timeout: Duration,
    inner: Mutex<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    suites: HashMap<String, SuiteEntry>,
    // Every suite name ever referenced, in first-reference order.
    touched: IndexSet<String>,
}

#[derive(Debug)]
struct SuiteEntry {
    mux: Arc<Mutex<SuiteMultiplexer>>,
    // Set while a flush owns this entry. At most one flush runs per suite.
    flushing: bool,
}

impl SuiteRegistry {
    /// Creates an empty registry whose suites write to `store`.
    pub fn new(store: Arc<dyn ChannelStore>, config: &MuxConfig) -> Self {
        Self {
            store,
            flush_poll_interval: config.flush_poll_interval(),
            stall_timeout: config.stall_timeout(),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// The channel store suites write to.
    pub fn store(&self) -> &Arc<dyn ChannelStore> {
        &self.store
    }

    /// How long [`FlushMode::UntilDone`] sleeps between passes.
    pub fn flush_poll_interval(&self) -> Duration {
        self.flush_poll_interval
    }

    /// Returns the printer for `seq` in `suite`, creating the suite if necessary.
    ///
    /// Creating a suite clears any files left over from a previous run under the same name.
    pub fn printer(&self, suite: &str, seq: u32) -> Result<Arc<BufferedPrinter>, ChannelError> {
        let mux = self.get_or_create(suite)?;
        let printer = lock(&mux).printer(seq);
        Ok(printer)
    }

    /// Returns the report printer for `suite`, creating the suite if necessary.
    pub fn report_printer(&self, suite: &str) -> Result<Arc<BufferedPrinter>, ChannelError> {
        let mux = self.get_or_create(suite)?;
        let printer = lock(&mux).report_printer();
        Ok(printer)
    }

    /// Records that `seq` in `suite` will produce no more output.
    ///
    /// Does nothing if the suite isn't registered: recreating it here would wipe output that a
    /// completed flush already wrote.
    pub fn mark_ended(&self, suite: &str, seq: u32) {
        let mux = lock(&self.inner)
            .suites
            .get(suite)
            .map(|entry| entry.mux.clone());
        match mux {
            Some(mux) => lock(&mux).mark_ended(seq),
            None => debug!("suite {suite}: ignoring end of test #{seq}, suite not registered"),
        }
    }

    /// Returns true if `suite` currently has a multiplexer.
    pub fn is_registered(&self, suite: &str) -> bool {
        lock(&self.inner).suites.contains_key(suite)
    }

    /// Returns every suite name ever referenced, in first-reference order.
    ///
    /// Suites that were flushed or cleared are still listed.
    pub fn list_touched_suites(&self) -> Vec<String> {
        lock(&self.inner).touched.iter().cloned().collect()
    }

    /// Removes `suite` from the registry and deletes its files.
    pub fn clear(&self, suite: &str) -> Result<(), ChannelError> {
        let removed = lock(&self.inner).suites.remove(suite);
        if removed.is_some() {
            debug!("suite {suite}: cleared");
        }
        self.store.channel(suite).reset()
    }

    /// Flushes `suite`.
    ///
    /// At most one flush runs per suite: if another caller is flushing it, or it isn't
    /// registered, this returns [`FlushOutcome::NothingToFlush`] immediately. Once the suite
    /// reaches its done state, its entry is removed and later calls see nothing to flush.
    ///
    /// With [`FlushMode::UntilDone`], this blocks the current thread, sleeping for the flush
    /// poll interval between passes. A stall is returned as an error and leaves the suite
    /// registered, so the flush can be retried.
    pub fn flush(&self, suite: &str, mode: FlushMode) -> Result<FlushOutcome, SuiteFlushError> {
        let Some(guard) = self.begin_flush(suite) else {
            return Ok(FlushOutcome::NothingToFlush);
        };
        loop {
            match guard.pass()? {
                FlushState::Done => {
                    guard.finish();
                    return Ok(FlushOutcome::Done);
                }
                FlushState::Pending => match mode {
                    FlushMode::SinglePass => return Ok(FlushOutcome::Pending),
                    FlushMode::UntilDone => std::thread::sleep(self.flush_poll_interval),
                },
            }
        }
    }

    /// Like [`Self::flush`], but sleeps on the tokio timer between passes.
    ///
    /// Dropping the returned future releases the suite so another flush can pick it up.
    pub async fn flush_async(
        &self,
        suite: &str,
        mode: FlushMode,
    ) -> Result<FlushOutcome, SuiteFlushError> {
        let Some(guard) = self.begin_flush(suite) else {
            return Ok(FlushOutcome::NothingToFlush);
        };
        loop {
            match guard.pass()? {
                FlushState::Done => {
                    guard.finish();
                    return Ok(FlushOutcome::Done);
                }
                FlushState::Pending => match mode {
                    FlushMode::SinglePass => return Ok(FlushOutcome::Pending),
                    FlushMode::UntilDone => tokio::time::sleep(self.flush_poll_interval).await,
                },
            }
        }
    }

    fn get_or_create(&self, suite: &str) -> Result<Arc<Mutex<SuiteMultiplexer>>, ChannelError> {
        let mut inner = lock(&self.inner);
        if !inner.touched.contains(suite) {
            inner.touched.insert(suite.to_owned());
        }
        if let Some(entry) = inner.suites.get(suite) {
            return Ok(entry.mux.clone());
        }

        let mux = Arc::new(Mutex::new(SuiteMultiplexer::new(
            self.store.channel(suite),
            self.stall_timeout,
        )?));
        inner.suites.insert(
            suite.to_owned(),
            SuiteEntry {
                mux: mux.clone(),
                flushing: false,
            },
        );
        Ok(mux)
    }

    fn begin_flush(&self, suite: &str) -> Option<FlushGuard<'_>> {
        let mut inner = lock(&self.inner);
        let entry = inner.suites.get_mut(suite)?;
        if entry.flushing {
            debug!("suite {suite}: already being flushed");
            return None;
        }
        entry.flushing = true;
        Some(FlushGuard {
            registry: self,
            suite: suite.to_owned(),
            mux: entry.mux.clone(),
        })
    }
}

/// Exclusive flush rights over one suite entry.
///
/// Dropping the guard without calling [`Self::finish`] hands the entry back.
struct FlushGuard<'a> {
    registry: &'a SuiteRegistry,
    suite: String,
    mux: Arc<Mutex<SuiteMultiplexer>>,
}

impl FlushGuard<'_> {
    fn pass(&self) -> Result<FlushState, SuiteFlushError> {
        lock(&self.mux).flush()
    }

    fn finish(self) {
        let mut inner = lock(&self.registry.inner);
        // The suite may have been cleared and recreated while this flush was running.
        if inner
            .suites
            .get(&self.suite)
            .is_some_and(|entry| Arc::ptr_eq(&entry.mux, &self.mux))
        {
            inner.suites.remove(&self.suite);
            debug!("suite {}: flush complete, removed from registry", self.suite);
        }
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        let mut inner = lock(&self.registry.inner);
        if let Some(entry) = inner.suites.get_mut(&self.suite)
            && Arc::ptr_eq(&entry.mux, &self.mux)
        {
            entry.flushing = false;
        }
    }
}
