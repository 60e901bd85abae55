// Copyright (c) The cmdt Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-test display sessions.
//!
//! A session is the producer-facing handle for one `(suite, sequence)` pair. It routes the
//! test's title, captured output and outcome to the test's printer, formatting through a
//! [`DisplayFormatter`]. A session moves from opened to closed exactly once; a closed key is
//! remembered so that late writers can't bring it back. Once a suite has been reported, its
//! closed keys are dropped and the whole suite refuses new sessions until it is opened again.

use crate::{
    channel::Sentinel,
    errors::SessionError,
    format::{DisplayFormatter, SuiteReport, TestInstance, TestOutcome},
    helpers::lock,
    printer::BufferedPrinter,
    registry::SuiteRegistry,
    suite::SUITE_SLOT,
};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};
use tracing::debug;

type SessionKey = (String, u32);

/// Tracks the open sessions of every suite.
#[derive(Debug)]
pub struct SessionTable {
    registry: Arc<SuiteRegistry>,
    formatter: Arc<dyn DisplayFormatter>,
    inner: Mutex<SessionTableInner>,
}

#[derive(Debug, Default)]
struct SessionTableInner {
    open: HashMap<SessionKey, Arc<TestSession>>,
    closed: HashSet<SessionKey>,
    reported: HashSet<String>,
}

impl SessionTableInner {
    fn discard_sessions(&mut self, suite: &str) {
        self.open.retain(|(key_suite, _), session| {
            if key_suite == suite {
                session.close_in_place();
                false
            } else {
                true
            }
        });
        self.closed.retain(|(key_suite, _)| key_suite != suite);
    }
}

impl SessionTable {
    /// Creates an empty table.
    pub fn new(registry: Arc<SuiteRegistry>, formatter: Arc<dyn DisplayFormatter>) -> Self {
        Self {
            registry,
            formatter,
            inner: Mutex::new(SessionTableInner::default()),
        }
    }

    /// Starts a new run of `suite`.
    ///
    /// Any previous run under the same name is discarded, along with its files and sessions.
    /// `header` is written to the suite-level slot; if it's `None`, the formatter's header is
    /// used.
    pub fn open_suite(&self, suite: &str, header: Option<&str>) -> Result<(), SessionError> {
        {
            let mut inner = lock(&self.inner);
            inner.discard_sessions(suite);
            inner.reported.remove(suite);
        }

        self.registry
            .clear(suite)
            .map_err(|error| channel_error(suite, error))?;
        let header = match header {
            Some(header) => header.to_owned(),
            None => self.formatter.suite_header(suite),
        };
        self.registry
            .printer(suite, SUITE_SLOT)
            .map_err(|error| channel_error(suite, error))?
            .out(header);
        debug!("suite {suite}: opened");
        Ok(())
    }

    /// Writes the suite report and signals that the suite will produce no more output.
    ///
    /// The report is held back until every test's output has been flushed.
    pub fn report_suite(&self, suite: &str, report: &SuiteReport) -> Result<(), SessionError> {
        self.registry
            .report_printer(suite)
            .map_err(|error| channel_error(suite, error))?
            .out(self.formatter.report(suite, report));
        self.registry
            .store()
            .channel(suite)
            .mark(Sentinel::Done)
            .map_err(|error| channel_error(suite, error))?;

        let mut inner = lock(&self.inner);
        inner.closed.retain(|(key_suite, _)| key_suite != suite);
        inner.reported.insert(suite.to_owned());
        debug!("suite {suite}: reported, marked done");
        Ok(())
    }

    /// Forgets every session of `suite` without touching its files.
    ///
    /// Open sessions are closed in place. Afterwards the suite behaves as if it had never been
    /// seen.
    pub fn forget_suite(&self, suite: &str) {
        let mut inner = lock(&self.inner);
        inner.discard_sessions(suite);
        inner.reported.remove(suite);
    }

    /// Returns the session for `(suite, seq)`, opening it on first use.
    ///
    /// Opening is idempotent: every call for the same key returns the same session until it is
    /// closed. A closed key can't be reopened until the suite is opened again, and neither can
    /// any key of a suite that has been reported.
    pub fn open(&self, suite: &str, seq: u32) -> Result<Arc<TestSession>, SessionError> {
        if seq == SUITE_SLOT {
            return Err(SessionError::ReservedSequence {
                suite: suite.to_owned(),
            });
        }

        let key = (suite.to_owned(), seq);
        let mut inner = lock(&self.inner);
        if inner.reported.contains(suite) {
            return Err(SessionError::Reported {
                suite: suite.to_owned(),
            });
        }
        if inner.closed.contains(&key) {
            return Err(SessionError::Closed {
                suite: suite.to_owned(),
                seq,
            });
        }
        if let Some(session) = inner.open.get(&key) {
            return Ok(session.clone());
        }

        let printer = self
            .registry
            .printer(suite, seq)
            .map_err(|error| channel_error(suite, error))?;
        let session = Arc::new(TestSession {
            suite: suite.to_owned(),
            seq,
            printer,
            formatter: self.formatter.clone(),
            state: Mutex::new(SessionState::default()),
        });
        inner.open.insert(key, session.clone());
        Ok(session)
    }

    /// Returns the session for `(suite, seq)` if it is open.
    pub fn get(&self, suite: &str, seq: u32) -> Option<Arc<TestSession>> {
        lock(&self.inner)
            .open
            .get(&(suite.to_owned(), seq))
            .cloned()
    }

    /// Closes the session for `(suite, seq)` and marks the test ended.
    ///
    /// Closing a test that was never opened still marks it ended, so later tests aren't held
    /// back by it. Closing twice is a no-op, as is closing an unopened test of a reported suite.
    pub fn close(&self, suite: &str, seq: u32) -> Result<(), SessionError> {
        if seq == SUITE_SLOT {
            return Err(SessionError::ReservedSequence {
                suite: suite.to_owned(),
            });
        }

        let key = (suite.to_owned(), seq);
        {
            let mut inner = lock(&self.inner);
            let reported = inner.reported.contains(suite);
            if let Some(session) = inner.open.remove(&key) {
                session.close_in_place();
                if !reported {
                    inner.closed.insert(key);
                }
            } else if reported || inner.closed.contains(&key) {
                return Ok(());
            } else {
                // Register the slot so the cursor has something to drain.
                self.registry
                    .printer(suite, seq)
                    .map_err(|error| channel_error(suite, error))?;
                inner.closed.insert(key);
            }
        }

        self.registry.mark_ended(suite, seq);
        Ok(())
    }
}

/// The display handle for one test.
#[derive(Debug)]
pub struct TestSession {
    suite: String,
    seq: u32,
    printer: Arc<BufferedPrinter>,
    formatter: Arc<dyn DisplayFormatter>,
    state: Mutex<SessionState>,
}

#[derive(Debug, Default)]
struct SessionState {
    name: Option<String>,
    closed: bool,
}

impl TestSession {
    /// The suite this session belongs to.
    pub fn suite(&self) -> &str {
        &self.suite
    }

    /// The test's sequence number.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Writes the test's title. Only the first call writes anything.
    ///
    /// Returns true if this call wrote the title.
    pub fn title(&self, name: &str) -> Result<bool, SessionError> {
        let mut state = self.open_state()?;
        if state.name.is_some() {
            return Ok(false);
        }
        self.printer.out(self.formatter.title(TestInstance {
            suite: &self.suite,
            seq: self.seq,
            name,
        }));
        state.name = Some(name.to_owned());
        Ok(true)
    }

    /// Writes captured standard output, unchanged.
    pub fn stdout(&self, bytes: impl AsRef<[u8]>) -> Result<(), SessionError> {
        let _state = self.open_state()?;
        self.printer.out(bytes);
        Ok(())
    }

    /// Writes captured standard error, unchanged.
    pub fn stderr(&self, bytes: impl AsRef<[u8]>) -> Result<(), SessionError> {
        let _state = self.open_state()?;
        self.printer.err(bytes);
        Ok(())
    }

    /// Writes the test's outcome.
    pub fn outcome(&self, outcome: &TestOutcome) -> Result<(), SessionError> {
        let state = self.open_state()?;
        let name = state.name.as_deref().unwrap_or_default();
        self.printer.out(self.formatter.outcome(
            TestInstance {
                suite: &self.suite,
                seq: self.seq,
                name,
            },
            outcome,
        ));
        Ok(())
    }

    /// Returns true once the session has been closed.
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn open_state(&self) -> Result<std::sync::MutexGuard<'_, SessionState>, SessionError> {
        let state = lock(&self.state);
        if state.closed {
            return Err(SessionError::Closed {
                suite: self.suite.clone(),
                seq: self.seq,
            });
        }
        Ok(state)
    }

    fn close_in_place(&self) {
        lock(&self.state).closed = true;
    }
}

fn channel_error(suite: &str, error: crate::errors::ChannelError) -> SessionError {
    SessionError::Channel {
        suite: suite.to_owned(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{ChannelStore, MemoryStore, OutputStream},
        config::MuxConfig,
        format::{PlainFormatter, SuiteStats, TestResult},
        registry::{FlushMode, FlushOutcome},
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Fixture {
        store: MemoryStore,
        registry: Arc<SuiteRegistry>,
        table: SessionTable,
    }

    impl Fixture {
        fn new() -> Self {
            let store = MemoryStore::new();
            let config = MuxConfig::builder("session-tests")
                .flush_poll_interval(Duration::from_millis(1))
                .build()
                .expect("valid config");
            let registry = Arc::new(SuiteRegistry::new(Arc::new(store.clone()), &config));
            let table = SessionTable::new(registry.clone(), Arc::new(PlainFormatter::new()));
            Self {
                store,
                registry,
                table,
            }
        }

        fn stdout(&self, suite: &str) -> String {
            String::from_utf8(self.store.memory_channel(suite).contents(OutputStream::Stdout))
                .expect("valid UTF-8")
        }
    }

    #[test]
    fn open_is_idempotent() {
        let fixture = Fixture::new();
        let first = fixture.table.open("s", 1).expect("opened");
        let second = fixture.table.open("s", 1).expect("opened");
        assert!(Arc::ptr_eq(&first, &second));

        assert!(first.title("one").expect("title written"));
        assert!(!second.title("one").expect("no error"));

        fixture
            .registry
            .flush("s", FlushMode::SinglePass)
            .expect("flushed");
        assert_eq!(fixture.stdout("s"), "       START s #1 one\n");
    }

    #[test]
    fn writes_after_close_are_rejected() {
        let fixture = Fixture::new();
        let session = fixture.table.open("s", 1).expect("opened");
        session.stdout("before").expect("written");
        fixture.table.close("s", 1).expect("closed");
        fixture.table.close("s", 1).expect("closing twice is fine");

        assert!(session.is_closed());
        assert!(matches!(
            session.stdout("after"),
            Err(SessionError::Closed { seq: 1, .. })
        ));
        assert!(matches!(
            fixture.table.open("s", 1),
            Err(SessionError::Closed { seq: 1, .. })
        ));
        assert!(fixture.table.get("s", 1).is_none());
    }

    #[test]
    fn sequence_zero_is_reserved() {
        let fixture = Fixture::new();
        assert!(matches!(
            fixture.table.open("s", 0),
            Err(SessionError::ReservedSequence { .. })
        ));
        assert!(matches!(
            fixture.table.close("s", 0),
            Err(SessionError::ReservedSequence { .. })
        ));
    }

    #[test]
    fn closing_unopened_test_unblocks_cursor() {
        let fixture = Fixture::new();
        let second = fixture.table.open("s", 2).expect("opened");
        second.stdout("two").expect("written");
        fixture.table.close("s", 2).expect("closed");
        fixture.table.close("s", 1).expect("closed");

        fixture
            .registry
            .flush("s", FlushMode::SinglePass)
            .expect("flushed");
        assert_eq!(fixture.stdout("s"), "two");
    }

    #[test]
    fn full_suite_in_order() {
        let fixture = Fixture::new();
        let table = &fixture.table;
        table.open_suite("s", Some("header\n")).expect("opened suite");

        let mut stats = SuiteStats::new();
        let sessions: Vec<_> = (1..=2)
            .map(|seq| table.open("s", seq).expect("opened"))
            .collect();
        // The second test finishes first.
        for session in sessions.iter().rev() {
            session.title(&format!("t{}", session.seq())).expect("title");
            session.stdout(format!("out{}\n", session.seq())).expect("stdout");
            session
                .outcome(&TestOutcome::new(TestResult::Passed, Duration::ZERO))
                .expect("outcome");
            stats.record(TestResult::Passed);
            table.close("s", session.seq()).expect("closed");
        }
        let mut report = stats.report();
        report.elapsed = Duration::ZERO;
        table.report_suite("s", &report).expect("reported");

        assert_eq!(
            fixture
                .registry
                .flush("s", FlushMode::UntilDone)
                .expect("flushed"),
            FlushOutcome::Done,
        );
        assert_eq!(
            fixture.stdout("s"),
            "header\n\
             \x20      START s #1 t1\n\
             out1\n\
             \x20       PASS [   0.000s] s #1 t1\n\
             \x20      START s #2 t2\n\
             out2\n\
             \x20       PASS [   0.000s] s #2 t2\n\
             ------------\n\
             \x20    Summary [   0.000s] 2 tests run in s: 2 passed, 0 ignored\n",
        );
    }

    #[test]
    fn reporting_suite_drops_closed_keys() {
        let fixture = Fixture::new();
        let table = &fixture.table;
        table.open_suite("s", None).expect("opened suite");
        for seq in 1..=3 {
            table.open("s", seq).expect("opened");
            table.close("s", seq).expect("closed");
        }
        table.open("t", 1).expect("opened");
        table.close("t", 1).expect("closed");
        assert_eq!(lock(&table.inner).closed.len(), 4);

        table
            .report_suite("s", &SuiteStats::new().report())
            .expect("reported");
        assert_eq!(
            lock(&table.inner).closed,
            HashSet::from([("t".to_owned(), 1)])
        );

        // The suite stays sealed without remembering individual keys.
        assert!(matches!(
            table.open("s", 1),
            Err(SessionError::Reported { ref suite }) if suite == "s"
        ));
        assert!(matches!(
            table.open("s", 4),
            Err(SessionError::Reported { .. })
        ));
        table.close("s", 2).expect("closing after report is a no-op");
        table.close("s", 9).expect("closing after report is a no-op");
        assert_eq!(lock(&table.inner).closed.len(), 1);

        // Opening the suite again makes it usable.
        table.open_suite("s", None).expect("reopened suite");
        table.open("s", 1).expect("opened");
    }

    #[test]
    fn forget_suite_closes_open_sessions() {
        let fixture = Fixture::new();
        let table = &fixture.table;
        let session = table.open("s", 1).expect("opened");
        table.open("s", 2).expect("opened");
        table.close("s", 2).expect("closed");
        table
            .report_suite("s", &SuiteStats::new().report())
            .expect("reported");

        table.forget_suite("s");
        assert!(session.is_closed());
        assert!(table.get("s", 1).is_none());
        let inner = lock(&table.inner);
        assert!(inner.open.is_empty());
        assert!(inner.closed.is_empty());
        assert!(inner.reported.is_empty());
    }

    #[test]
    fn reopening_suite_discards_previous_run() {
        let fixture = Fixture::new();
        let table = &fixture.table;
        table.open_suite("s", Some("run 1\n")).expect("opened suite");
        let old = table.open("s", 1).expect("opened");
        old.stdout("stale").expect("written");
        table.close("s", 1).expect("closed");
        fixture
            .registry
            .flush("s", FlushMode::SinglePass)
            .expect("flushed");
        assert_eq!(fixture.stdout("s"), "run 1\nstale");

        table.open_suite("s", Some("run 2\n")).expect("reopened suite");
        let new = table.open("s", 1).expect("key is usable again");
        assert!(!Arc::ptr_eq(&old, &new));
        new.stdout("fresh").expect("written");
        fixture
            .registry
            .flush("s", FlushMode::SinglePass)
            .expect("flushed");
        assert_eq!(fixture.stdout("s"), "run 2\nfresh");
        assert!(
            !fixture
                .store
                .channel("s")
                .is_marked(Sentinel::Done)
                .expect("checked")
        );
    }
}
