// Copyright (c) The cmdt Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Moving ordered output from the channels to real destinations.
//!
//! There are two sides to the protocol:
//!
//! * The producer side, [`spawn_async_flush`] and [`async_flush_all`], drives a suite's
//!   multiplexer in the background until the suite's `done` sentinel exists and everything has
//!   drained, then creates the `flushed` sentinel.
//! * The consumer side, [`Tailer`], copies newly available bytes out of a suite's data streams
//!   into arbitrary writers, remembering how far it got so that nothing is copied twice. The
//!   consumer can live in a different process: it only looks at sentinels, byte offsets and the
//!   suite's generation stamp.
//!
//! [`Tailer::display_recorded`] combines the two for callers that produce and display output
//! in the same process.

use crate::{
    channel::{ChannelStore, OutputStream, Sentinel, SuiteChannel},
    config::MuxConfig,
    errors::{AsyncFlushError, DisplayErrorChain, ErrorList, TailError},
    helpers::lock,
    registry::{FlushMode, FlushOutcome, SuiteRegistry},
};
use indexmap::IndexSet;
use std::{
    any::Any,
    collections::HashMap,
    io::Write,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Starts a background task that flushes `suite` to completion.
///
/// The task runs the registry's flush loop until the suite is done, creates the suite's
/// `flushed` sentinel, and exits. If `timeout` elapses first, the task fails with
/// [`AsyncFlushError::Timeout`]; output flushed so far stays in the data streams.
///
/// Must be called from within a tokio runtime.
pub fn spawn_async_flush(
    registry: Arc<SuiteRegistry>,
    suite: impl Into<String>,
    timeout: Duration,
) -> AsyncFlushHandle {
    let suite = suite.into();
    let task_suite = suite.clone();
    let handle = tokio::spawn(async move { async_flush(&registry, &task_suite, timeout).await });
    AsyncFlushHandle { suite, handle }
}

/// Starts one background flush per suite the registry has seen.
pub fn async_flush_all(registry: &Arc<SuiteRegistry>, timeout: Duration) -> AsyncFlushHandles {
    let handles = registry
        .list_touched_suites()
        .into_iter()
        .map(|suite| spawn_async_flush(registry.clone(), suite, timeout))
        .collect();
    AsyncFlushHandles { handles }
}

async fn async_flush(
    registry: &SuiteRegistry,
    suite: &str,
    timeout: Duration,
) -> Result<(), AsyncFlushError> {
    let channel = registry.store().channel(suite);
    match tokio::time::timeout(timeout, flush_until_done(registry, &*channel)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(AsyncFlushError::Timeout {
                suite: suite.to_owned(),
                timeout,
            });
        }
    }

    channel
        .mark(Sentinel::Flushed)
        .map_err(|error| AsyncFlushError::Channel {
            suite: suite.to_owned(),
            error,
        })?;
    debug!("suite {suite}: background flush complete");
    Ok(())
}

async fn flush_until_done(
    registry: &SuiteRegistry,
    channel: &dyn SuiteChannel,
) -> Result<(), AsyncFlushError> {
    let suite = channel.suite();
    loop {
        let outcome = registry
            .flush_async(suite, FlushMode::UntilDone)
            .await
            .map_err(|error| AsyncFlushError::Flush {
                suite: suite.to_owned(),
                error,
            })?;
        if outcome == FlushOutcome::Done {
            return Ok(());
        }
        // Someone else is flushing the suite, or it was never registered here. Either way it's
        // finished once it's done and no longer registered.
        let done = channel
            .is_marked(Sentinel::Done)
            .map_err(|error| AsyncFlushError::Channel {
                suite: suite.to_owned(),
                error,
            })?;
        if done && !registry.is_registered(suite) {
            return Ok(());
        }
        tokio::time::sleep(registry.flush_poll_interval()).await;
    }
}

/// A handle to a background flush started by [`spawn_async_flush`].
#[derive(Debug)]
pub struct AsyncFlushHandle {
    suite: String,
    handle: JoinHandle<Result<(), AsyncFlushError>>,
}

impl AsyncFlushHandle {
    /// The suite being flushed.
    pub fn suite(&self) -> &str {
        &self.suite
    }

    /// Returns true if the task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the flush to finish, returning its error if it failed.
    ///
    /// A panic in the flush task is returned as [`AsyncFlushError::Panicked`].
    pub async fn wait(self) -> Result<(), AsyncFlushError> {
        match self.handle.await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => Err(AsyncFlushError::Panicked {
                suite: self.suite,
                message: panic_payload_to_string(join_error.into_panic()),
            }),
            Err(_) => Err(AsyncFlushError::Cancelled { suite: self.suite }),
        }
    }

    /// Lets the flush run unobserved. If it fails, the error is logged.
    pub fn detach(self) {
        tokio::spawn(async move {
            if let Err(error) = self.wait().await {
                warn!("{}", DisplayErrorChain::new(&error));
            }
        });
    }
}

/// The handles returned by [`async_flush_all`].
#[derive(Debug)]
pub struct AsyncFlushHandles {
    handles: Vec<AsyncFlushHandle>,
}

impl AsyncFlushHandles {
    /// The suites being flushed, in first-reference order.
    pub fn suites(&self) -> impl Iterator<Item = &str> {
        self.handles.iter().map(|handle| handle.suite())
    }

    /// The number of background flushes.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if there were no suites to flush.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every flush, collecting all failures.
    pub async fn wait(self) -> Result<(), ErrorList<AsyncFlushError>> {
        let mut errors = Vec::new();
        for handle in self.handles {
            if let Err(error) = handle.wait().await {
                errors.push(error);
            }
        }
        match ErrorList::new("while flushing suites", errors) {
            Some(errors) => Err(errors),
            None => Ok(()),
        }
    }

    /// Lets every flush run unobserved.
    pub fn detach(self) {
        for handle in self.handles {
            handle.detach();
        }
    }
}

fn panic_payload_to_string(payload: Box<dyn Any + Send + 'static>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "(unknown panic payload)".to_owned()
    }
}

/// How far a consumer has read into a suite's data streams.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TailOffsets {
    /// The offset into captured stdout.
    pub stdout: u64,

    /// The offset into captured stderr.
    pub stderr: u64,
}

impl TailOffsets {
    fn get_mut(&mut self, stream: OutputStream) -> &mut u64 {
        match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        }
    }
}

// Offsets are only meaningful for the run they were taken from.
#[derive(Clone, Copy, Debug, Default)]
struct TailState {
    generation: Option<u64>,
    offsets: TailOffsets,
}

struct CopyPass {
    copied: usize,
    generation: Option<u64>,
    // The suite was reset while this pass was reading, so nothing was copied.
    torn: bool,
}

/// Copies recorded suite output to real destinations.
///
/// Offsets are kept per suite for the lifetime of the tailer, so tailing a suite twice never
/// repeats bytes. Offsets are tied to the suite's generation stamp: once the suite is reset,
/// copying starts again from the beginning of the new run, however long it is.
#[derive(Debug)]
pub struct Tailer {
    registry: Arc<SuiteRegistry>,
    poll_interval: Duration,
    states: Mutex<HashMap<String, TailState>>,
}

impl Tailer {
    /// Creates a tailer reading from the registry's channel store.
    pub fn new(registry: Arc<SuiteRegistry>, config: &MuxConfig) -> Self {
        Self {
            registry,
            poll_interval: config.tail_poll_interval(),
            states: Mutex::new(HashMap::new()),
        }
    }

    fn store(&self) -> &Arc<dyn ChannelStore> {
        self.registry.store()
    }

    /// Returns how far `suite` has been copied.
    pub fn offsets(&self, suite: &str) -> TailOffsets {
        self.state(suite).offsets
    }

    fn state(&self, suite: &str) -> TailState {
        lock(&self.states).get(suite).copied().unwrap_or_default()
    }

    /// Drops everything remembered about `suite`, so that the next copy starts from the
    /// beginning of its streams.
    pub fn forget(&self, suite: &str) {
        if lock(&self.states).remove(suite).is_some() {
            debug!("suite {suite}: forgot tail offsets");
        }
    }

    /// Copies everything that's newly available for `suite`, returning the number of bytes
    /// copied.
    ///
    /// If the suite was reset since the last copy, its generation stamp has changed and copying
    /// restarts from the beginning of the new run. A data stream that has become shorter than
    /// the recorded offset is also read from the beginning.
    pub fn copy_available(
        &self,
        suite: &str,
        out: &mut impl Write,
        err: &mut impl Write,
    ) -> Result<usize, TailError> {
        let channel = self.store().channel(suite);
        Ok(self.copy_from(&*channel, out, err)?.copied)
    }

    fn copy_from(
        &self,
        channel: &dyn SuiteChannel,
        out: &mut impl Write,
        err: &mut impl Write,
    ) -> Result<CopyPass, TailError> {
        let suite = channel.suite();
        let channel_error = |error| TailError::Channel {
            suite: suite.to_owned(),
            error,
        };

        let generation = channel.generation().map_err(channel_error)?;
        let mut state = self.state(suite);
        if state.generation != generation {
            if state.offsets != TailOffsets::default() {
                debug!(
                    "suite {suite}: generation changed from {:?} to {generation:?}, \
                     restarting from 0",
                    state.generation,
                );
            }
            state = TailState {
                generation,
                offsets: TailOffsets::default(),
            };
        }

        let mut chunks = Vec::with_capacity(OutputStream::ALL.len());
        for stream in OutputStream::ALL {
            let offset = *state.offsets.get_mut(stream);
            let chunk = channel.read_from(stream, offset).map_err(channel_error)?;
            if chunk.start < offset {
                debug!(
                    "suite {suite}: {stream:?} is shorter than offset {offset}, restarting from 0",
                );
            }
            chunks.push((stream, chunk));
        }

        // A reset between the two generation reads means the chunks may mix two runs.
        let generation_after = channel.generation().map_err(channel_error)?;
        if generation_after != generation {
            debug!("suite {suite}: reset while copying, retrying");
            return Ok(CopyPass {
                copied: 0,
                generation: generation_after,
                torn: true,
            });
        }

        let mut copied = 0;
        for (stream, chunk) in chunks {
            if !chunk.bytes.is_empty() {
                let dest: &mut dyn Write = match stream {
                    OutputStream::Stdout => &mut *out,
                    OutputStream::Stderr => &mut *err,
                };
                dest.write_all(&chunk.bytes)
                    .and_then(|()| dest.flush())
                    .map_err(|error| TailError::Write {
                        suite: suite.to_owned(),
                        error,
                    })?;
                copied += chunk.bytes.len();
            }
            *state.offsets.get_mut(stream) = chunk.end();
        }

        lock(&self.states).insert(suite.to_owned(), state);
        Ok(CopyPass {
            copied,
            generation,
            torn: false,
        })
    }

    /// Copies `suite`'s output as it arrives until the suite is marked flushed.
    ///
    /// Fails with [`TailError::Timeout`] if the `flushed` sentinel doesn't appear within
    /// `timeout`. Bytes copied before the timeout stay copied, and a later call resumes where
    /// this one stopped.
    pub async fn block_tail(
        &self,
        suite: &str,
        timeout: Duration,
        out: &mut impl Write,
        err: &mut impl Write,
    ) -> Result<(), TailError> {
        let channel = self.store().channel(suite);
        tokio::time::timeout(timeout, self.tail_until_flushed(&*channel, out, err))
            .await
            .unwrap_or_else(|_| {
                Err(TailError::Timeout {
                    suite: suite.to_owned(),
                    timeout,
                })
            })
    }

    async fn tail_until_flushed(
        &self,
        channel: &dyn SuiteChannel,
        out: &mut impl Write,
        err: &mut impl Write,
    ) -> Result<(), TailError> {
        let suite = channel.suite();
        let channel_error = |error| TailError::Channel {
            suite: suite.to_owned(),
            error,
        };
        loop {
            // Check before copying so that the final copy happens after the last write. The
            // sentinel only counts if it belongs to the run that was copied.
            let generation = channel.generation().map_err(channel_error)?;
            let flushed = channel
                .is_marked(Sentinel::Flushed)
                .map_err(channel_error)?;
            let pass = self.copy_from(channel, out, err)?;
            if flushed && !pass.torn && pass.generation == generation {
                debug!("suite {suite}: tail complete");
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Tails every known suite in turn: suites this process has referenced, followed by any
    /// other suites found in the channel store.
    ///
    /// `timeout` bounds the whole call. A suite that fails doesn't stop the others from being
    /// tailed.
    pub async fn block_tail_all(
        &self,
        timeout: Duration,
        out: &mut impl Write,
        err: &mut impl Write,
    ) -> Result<(), ErrorList<TailError>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut errors = Vec::new();

        let mut suites: IndexSet<String> =
            self.registry.list_touched_suites().into_iter().collect();
        match self.store().list_suites() {
            Ok(stored) => suites.extend(stored),
            Err(error) => errors.push(TailError::ListSuites { error }),
        }

        for suite in &suites {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if let Err(error) = self.block_tail(suite, remaining, out, err).await {
                errors.push(error);
            }
        }

        match ErrorList::new("while tailing suites", errors) {
            Some(errors) => Err(errors),
            None => Ok(()),
        }
    }

    /// Flushes and displays `suite` in this process until it is done.
    ///
    /// Each iteration runs one ordering pass and copies whatever it produced. Once the suite is
    /// done and fully copied, the `flushed` sentinel is created. If another task is flushing the
    /// suite, this only copies, and finishes once that flush has completed.
    pub async fn display_recorded(
        &self,
        suite: &str,
        timeout: Duration,
        out: &mut impl Write,
        err: &mut impl Write,
    ) -> Result<(), TailError> {
        let channel = self.store().channel(suite);
        tokio::time::timeout(timeout, self.display_until_done(&*channel, out, err))
            .await
            .unwrap_or_else(|_| {
                Err(TailError::Timeout {
                    suite: suite.to_owned(),
                    timeout,
                })
            })
    }

    async fn display_until_done(
        &self,
        channel: &dyn SuiteChannel,
        out: &mut impl Write,
        err: &mut impl Write,
    ) -> Result<(), TailError> {
        let suite = channel.suite();
        let channel_error = |error| TailError::Channel {
            suite: suite.to_owned(),
            error,
        };
        loop {
            let outcome = self
                .registry
                .flush_async(suite, FlushMode::SinglePass)
                .await
                .map_err(|error| TailError::Flush {
                    suite: suite.to_owned(),
                    error,
                })?;
            // Decide before copying, so that everything flushed up to this point is copied
            // below.
            let finished = match outcome {
                FlushOutcome::Done => true,
                FlushOutcome::Pending => false,
                FlushOutcome::NothingToFlush => {
                    channel.is_marked(Sentinel::Done).map_err(channel_error)?
                        && !self.registry.is_registered(suite)
                }
            };
            let pass = self.copy_from(channel, out, err)?;
            if finished && !pass.torn {
                channel.mark(Sentinel::Flushed).map_err(channel_error)?;
                debug!("suite {suite}: displayed");
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
