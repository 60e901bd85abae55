// Copyright (c) The cmdt Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-suite ordering of buffered output.
//!
//! A [`SuiteMultiplexer`] owns one [`BufferedPrinter`] per sequence number and a cursor. Each
//! flush pass drains the suite-level slot 0, then drains the printer under the cursor and moves
//! the cursor forward only past sequence numbers that have been marked ended. Output for test
//! `N + 1` therefore never reaches the channel before test `N` has been fully drained, no matter
//! the order in which tests finish.

use crate::{
    channel::{Sentinel, SuiteChannel},
    errors::{ChannelError, SuiteFlushError},
    printer::BufferedPrinter,
    time::{StopwatchStart, stopwatch},
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::debug;

/// The sequence number of the suite-level output slot.
pub const SUITE_SLOT: u32 = 0;

/// The result of a single flush pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushState {
    /// More output may arrive, or a registered test hasn't been drained yet.
    Pending,

    /// Every registered test and the suite report have been drained, and the producer has
    /// signaled that no more output will arrive.
    Done,
}

#[derive(Debug)]
struct Slot {
    printer: Arc<BufferedPrinter>,
    ended: bool,
}

impl Slot {
    fn new() -> Self {
        Self {
            printer: Arc::new(BufferedPrinter::new()),
            ended: false,
        }
    }
}

/// Buffers and orders the output of one suite.
#[derive(Debug)]
pub struct SuiteMultiplexer {
    suite: String,
    channel: Arc<dyn SuiteChannel>,
    slots: BTreeMap<u32, Slot>,
    // Drained only once the cursor has passed every registered test.
    report: Option<Arc<BufferedPrinter>>,
    cursor: u32,
    max_seen: u32,
    max_ended: u32,
    last_activity: StopwatchStart,
    stall_timeout: Duration,
}

impl SuiteMultiplexer {
    /// Creates a multiplexer for the channel's suite, clearing any files left over from a
    /// previous run under the same name.
    pub fn new(
        channel: Arc<dyn SuiteChannel>,
        stall_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        channel.reset()?;
        let suite = channel.suite().to_owned();
        debug!("suite {suite}: created multiplexer");
        Ok(Self {
            suite,
            channel,
            slots: BTreeMap::new(),
            report: None,
            cursor: 1,
            max_seen: 0,
            max_ended: 0,
            last_activity: stopwatch(),
            stall_timeout,
        })
    }

    /// The suite name.
    pub fn suite(&self) -> &str {
        &self.suite
    }

    /// The channel output is flushed to.
    pub fn channel(&self) -> &Arc<dyn SuiteChannel> {
        &self.channel
    }

    /// The next sequence number that has to drain before later ones can.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// The highest test sequence number with a printer.
    pub fn max_seen(&self) -> u32 {
        self.max_seen
    }

    /// The highest test sequence number marked ended so far.
    pub fn max_ended(&self) -> u32 {
        self.max_ended
    }

    /// Returns the printer for `seq`, creating it on first use.
    pub fn printer(&mut self, seq: u32) -> Arc<BufferedPrinter> {
        self.slot(seq).printer.clone()
    }

    /// Returns the printer for the suite report.
    pub fn report_printer(&mut self) -> Arc<BufferedPrinter> {
        self.report
            .get_or_insert_with(|| Arc::new(BufferedPrinter::new()))
            .clone()
    }

    /// Records that no more output will be written for `seq`.
    ///
    /// The suite-level slot is always eligible for draining, so ending it has no effect.
    pub fn mark_ended(&mut self, seq: u32) {
        if seq == SUITE_SLOT {
            return;
        }
        self.slot(seq).ended = true;
        self.max_ended = self.max_ended.max(seq);
        debug!("suite {}: test #{seq} ended", self.suite);
    }

    fn slot(&mut self, seq: u32) -> &mut Slot {
        if seq != SUITE_SLOT && seq > self.max_seen {
            self.max_seen = seq;
        }
        self.slots.entry(seq).or_insert_with(Slot::new)
    }

    /// Performs one ordering pass.
    ///
    /// Returns [`FlushState::Done`] once the cursor has moved past every registered test, the
    /// report has been drained and the channel's `done` sentinel exists. Returns
    /// [`SuiteFlushError::Stalled`] if neither the cursor nor any byte has moved for longer than
    /// the stall timeout.
    pub fn flush(&mut self) -> Result<FlushState, SuiteFlushError> {
        // Read the sentinel before draining: everything written before the producer signaled
        // completion is then drained in this same pass.
        let done_signaled = self
            .channel
            .is_marked(Sentinel::Done)
            .map_err(|error| self.channel_error(error))?;

        let mut drained = self.drain(SUITE_SLOT)?;
        let mut advanced = false;
        while let Some(slot) = self.slots.get(&self.cursor) {
            let ended = slot.ended;
            drained += self.drain(self.cursor)?;
            if !ended {
                break;
            }
            debug!("suite {}: test #{} drained", self.suite, self.cursor);
            self.cursor += 1;
            advanced = true;
        }

        let caught_up = self.cursor > self.max_seen;
        if caught_up && let Some(report) = &self.report {
            drained += report
                .flush_to(&*self.channel)
                .map_err(|error| self.channel_error(error))?;
        }

        if advanced || drained > 0 {
            self.last_activity = stopwatch();
        }

        if caught_up && done_signaled {
            debug!("suite {}: all output drained", self.suite);
            return Ok(FlushState::Done);
        }

        let idle = self.last_activity.elapsed();
        if idle > self.stall_timeout {
            return Err(SuiteFlushError::Stalled {
                suite: self.suite.clone(),
                cursor: self.cursor,
                max_seen: self.max_seen,
                idle,
            });
        }

        Ok(FlushState::Pending)
    }

    fn drain(&self, seq: u32) -> Result<usize, SuiteFlushError> {
        match self.slots.get(&seq) {
            Some(slot) => slot
                .printer
                .flush_to(&*self.channel)
                .map_err(|error| self.channel_error(error)),
            None => Ok(0),
        }
    }

    fn channel_error(&self, error: ChannelError) -> SuiteFlushError {
        SuiteFlushError::Channel {
            suite: self.suite.clone(),
            error,
        }
    }
}
