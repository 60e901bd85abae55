// Copyright (c) The cmdt Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test outcomes and how they're rendered.
//!
//! The multiplexer only moves bytes. Turning a title, an outcome or a suite report into text is
//! the job of a [`DisplayFormatter`]; [`PlainFormatter`] is the one the command-line front-end
//! uses.

use crate::{
    helpers::plural,
    time::{DisplayBracketedDuration, StopwatchStart, stopwatch},
};
use chrono::{DateTime, Local};
use owo_colors::{OwoColorize, Style};
use std::{fmt, time::Duration};
use swrite::{SWrite, swrite, swriteln};

/// The result of running a single test.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub enum TestResult {
    /// The test passed.
    Passed,

    /// The test failed.
    Failed,

    /// The test ran past its deadline and was stopped.
    Timeout,

    /// The test couldn't be run at all.
    Error,

    /// The test was skipped.
    Ignored,
}

impl TestResult {
    /// Returns true if this result shouldn't fail the suite.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Passed | Self::Ignored)
    }

    fn status_str(self) -> &'static str {
        match self {
            Self::Passed => "PASS",
            Self::Failed => "FAIL",
            Self::Timeout => "TIMEOUT",
            Self::Error => "ERROR",
            Self::Ignored => "IGNORED",
        }
    }
}

/// The result of one assertion made about a test's output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssertionResult {
    /// What was asserted, for example `exit-code == 0`.
    pub name: String,

    /// Whether the assertion held.
    pub passed: bool,

    /// Extra detail, typically why the assertion failed.
    pub message: Option<String>,
}

/// The structured outcome of a test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestOutcome {
    /// The overall result.
    pub result: TestResult,

    /// How long the test ran.
    pub duration: Duration,

    /// Assertions evaluated against the test, in evaluation order.
    pub assertions: Vec<AssertionResult>,
}

impl TestOutcome {
    /// Creates an outcome without assertions.
    pub fn new(result: TestResult, duration: Duration) -> Self {
        Self {
            result,
            duration,
            assertions: Vec::new(),
        }
    }

    /// Adds an assertion result.
    pub fn with_assertion(mut self, assertion: AssertionResult) -> Self {
        self.assertions.push(assertion);
        self
    }
}

/// Counts of test results across a suite, plus the suite's wall time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuiteReport {
    /// When the suite started.
    pub start_time: DateTime<Local>,

    /// Wall time from the start of the suite to the report.
    pub elapsed: Duration,

    /// The number of tests that passed.
    pub passed: usize,

    /// The number of tests that failed.
    pub failed: usize,

    /// The number of tests that timed out.
    pub timed_out: usize,

    /// The number of tests that couldn't be run.
    pub errored: usize,

    /// The number of tests that were skipped.
    pub ignored: usize,
}

impl SuiteReport {
    /// The number of tests that finished, including ignored ones.
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.timed_out + self.errored + self.ignored
    }

    /// Returns true if no test failed, timed out or errored.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.timed_out == 0 && self.errored == 0
    }
}

/// Accumulates outcomes while a suite runs.
#[derive(Clone, Debug)]
pub struct SuiteStats {
    start: StopwatchStart,
    passed: usize,
    failed: usize,
    timed_out: usize,
    errored: usize,
    ignored: usize,
}

impl SuiteStats {
    /// Starts the suite clock.
    pub fn new() -> Self {
        Self {
            start: stopwatch(),
            passed: 0,
            failed: 0,
            timed_out: 0,
            errored: 0,
            ignored: 0,
        }
    }

    /// Counts a finished test.
    pub fn record(&mut self, result: TestResult) {
        let count = match result {
            TestResult::Passed => &mut self.passed,
            TestResult::Failed => &mut self.failed,
            TestResult::Timeout => &mut self.timed_out,
            TestResult::Error => &mut self.errored,
            TestResult::Ignored => &mut self.ignored,
        };
        *count += 1;
    }

    /// Produces the report as of now.
    pub fn report(&self) -> SuiteReport {
        let snapshot = self.start.snapshot();
        SuiteReport {
            start_time: snapshot.start_time,
            elapsed: snapshot.duration,
            passed: self.passed,
            failed: self.failed,
            timed_out: self.timed_out,
            errored: self.errored,
            ignored: self.ignored,
        }
    }
}

impl Default for SuiteStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies a test for display purposes.
#[derive(Clone, Copy, Debug)]
pub struct TestInstance<'a> {
    /// The suite the test belongs to.
    pub suite: &'a str,

    /// The test's sequence number within the suite.
    pub seq: u32,

    /// The test's name.
    pub name: &'a str,
}

/// Renders titles, outcomes and reports as text.
///
/// An empty string means nothing should be shown.
pub trait DisplayFormatter: fmt::Debug + Send + Sync {
    /// The header written when a suite is opened.
    fn suite_header(&self, suite: &str) -> String;

    /// The title written when a test's session is opened.
    fn title(&self, test: TestInstance<'_>) -> String;

    /// The status block written for a finished test.
    fn outcome(&self, test: TestInstance<'_>, outcome: &TestOutcome) -> String;

    /// The summary written after every test in the suite.
    fn report(&self, suite: &str, report: &SuiteReport) -> String;
}

/// The default formatter: one status line per test, in the style of a test runner.
#[derive(Clone, Debug, Default)]
pub struct PlainFormatter {
    styles: Styles,
    verbosity: u8,
    quiet: bool,
}

impl PlainFormatter {
    /// Creates an uncolored formatter at the default verbosity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Colorizes output.
    pub fn colorize(mut self) -> Self {
        self.styles.colorize();
        self
    }

    /// Sets the verbosity level. At 1 and above, every assertion is listed, not just failing
    /// ones.
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// In quiet mode, only failures and the suite report are shown.
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    fn result_style(&self, result: TestResult) -> Style {
        match result {
            TestResult::Passed => self.styles.pass,
            TestResult::Ignored => self.styles.skip,
            TestResult::Failed | TestResult::Timeout | TestResult::Error => self.styles.fail,
        }
    }

    fn write_assertions(&self, outcome: &TestOutcome, out: &mut String) {
        for assertion in &outcome.assertions {
            if assertion.passed && self.verbosity == 0 {
                continue;
            }
            let (marker, style) = if assertion.passed {
                ("ok", self.styles.pass)
            } else {
                ("not ok", self.styles.fail)
            };
            swrite!(out, "{:>12} {}", marker.style(style), assertion.name);
            match &assertion.message {
                Some(message) => swriteln!(out, ": {message}"),
                None => out.push('\n'),
            }
        }
    }
}

impl DisplayFormatter for PlainFormatter {
    fn suite_header(&self, suite: &str) -> String {
        if self.quiet {
            return String::new();
        }
        format!(
            "------------\n{:>12} suite {}\n",
            "Starting".style(self.styles.pass),
            suite.style(self.styles.suite),
        )
    }

    fn title(&self, test: TestInstance<'_>) -> String {
        if self.quiet {
            return String::new();
        }
        format!(
            "{:>12} {}\n",
            "START".style(self.styles.pass),
            DisplayTestInstance::new(test, &self.styles),
        )
    }

    fn outcome(&self, test: TestInstance<'_>, outcome: &TestOutcome) -> String {
        if self.quiet && outcome.result.is_success() {
            return String::new();
        }
        let mut out = String::new();
        swriteln!(
            out,
            "{:>12} {}{}",
            outcome
                .result
                .status_str()
                .style(self.result_style(outcome.result)),
            DisplayBracketedDuration(outcome.duration),
            DisplayTestInstance::new(test, &self.styles),
        );
        self.write_assertions(outcome, &mut out);
        out
    }

    fn report(&self, suite: &str, report: &SuiteReport) -> String {
        let summary_style = if report.total() == 0 {
            self.styles.skip
        } else if report.is_success() {
            self.styles.pass
        } else {
            self.styles.fail
        };

        let mut out = String::new();
        swrite!(
            out,
            "------------\n{:>12} {}{} {} run in {}: ",
            "Summary".style(summary_style),
            DisplayBracketedDuration(report.elapsed),
            report.total().style(self.styles.count),
            plural::tests_str(report.total()),
            suite.style(self.styles.suite),
        );
        swrite!(
            out,
            "{} {}",
            report.passed.style(self.styles.count),
            "passed".style(self.styles.pass),
        );
        for (count, label) in [
            (report.failed, "failed"),
            (report.timed_out, "timed out"),
            (report.errored, "errored"),
        ] {
            if count > 0 {
                swrite!(
                    out,
                    ", {} {}",
                    count.style(self.styles.count),
                    label.style(self.styles.fail),
                );
            }
        }
        swriteln!(
            out,
            ", {} {}",
            report.ignored.style(self.styles.count),
            "ignored".style(self.styles.skip),
        );
        out
    }
}

struct DisplayTestInstance<'a> {
    test: TestInstance<'a>,
    styles: &'a Styles,
}

impl<'a> DisplayTestInstance<'a> {
    fn new(test: TestInstance<'a>, styles: &'a Styles) -> Self {
        Self { test, styles }
    }
}

impl fmt::Display for DisplayTestInstance<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} #{} {}",
            self.test.suite.style(self.styles.suite),
            self.test.seq.style(self.styles.count),
            self.test.name.style(self.styles.name),
        )
    }
}

#[derive(Clone, Debug, Default)]
struct Styles {
    count: Style,
    pass: Style,
    fail: Style,
    skip: Style,
    suite: Style,
    name: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.skip = Style::new().yellow().bold();
        self.suite = Style::new().magenta().bold();
        self.name = Style::new().blue().bold();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;
    use test_strategy::proptest;

    const TEST: TestInstance<'static> = TestInstance {
        suite: "smoke",
        seq: 2,
        name: "echo hello",
    };

    fn failing_outcome() -> TestOutcome {
        TestOutcome::new(TestResult::Failed, Duration::from_millis(1500))
            .with_assertion(AssertionResult {
                name: "exit-code == 0".to_owned(),
                passed: true,
                message: None,
            })
            .with_assertion(AssertionResult {
                name: "stdout contains \"hi\"".to_owned(),
                passed: false,
                message: Some("not found".to_owned()),
            })
    }

    #[test]
    fn title_and_outcome() {
        let formatter = PlainFormatter::new();
        assert_eq!(formatter.title(TEST), "       START smoke #2 echo hello\n");
        assert_eq!(
            formatter.outcome(TEST, &failing_outcome()),
            "        FAIL [   1.500s] smoke #2 echo hello\n      \
             not ok stdout contains \"hi\": not found\n",
        );
    }

    #[test]
    fn verbose_lists_passing_assertions() {
        let formatter = PlainFormatter::new().with_verbosity(1);
        let lines = [
            "        FAIL [   1.500s] smoke #2 echo hello",
            "          ok exit-code == 0",
            "      not ok stdout contains \"hi\": not found",
        ];
        assert_eq!(
            formatter.outcome(TEST, &failing_outcome()),
            format!("{}\n", lines.join("\n")),
        );
    }

    #[test_case(TestResult::Passed, true ; "passed is hidden")]
    #[test_case(TestResult::Ignored, true ; "ignored is hidden")]
    #[test_case(TestResult::Failed, false ; "failed is shown")]
    #[test_case(TestResult::Timeout, false ; "timeout is shown")]
    #[test_case(TestResult::Error, false ; "error is shown")]
    fn quiet_outcomes(result: TestResult, hidden: bool) {
        let formatter = PlainFormatter::new().with_quiet(true);
        assert_eq!(formatter.title(TEST), "");
        assert_eq!(formatter.suite_header("smoke"), "");
        let outcome = TestOutcome::new(result, Duration::ZERO);
        assert_eq!(formatter.outcome(TEST, &outcome).is_empty(), hidden);
    }

    #[test]
    fn report_line() {
        let mut stats = SuiteStats::new();
        for result in [
            TestResult::Passed,
            TestResult::Passed,
            TestResult::Failed,
            TestResult::Ignored,
        ] {
            stats.record(result);
        }
        let mut report = stats.report();
        report.elapsed = Duration::from_millis(250);

        assert_eq!(report.total(), 4);
        assert!(!report.is_success());
        assert_eq!(
            PlainFormatter::new().report("smoke", &report),
            "------------\n     Summary [   0.250s] 4 tests run in smoke: \
             2 passed, 1 failed, 1 ignored\n",
        );
    }

    #[proptest]
    fn colorized_output_differs_only_in_escapes(result: TestResult) {
        let outcome = TestOutcome::new(result, Duration::from_millis(10));
        let plain = PlainFormatter::new().outcome(TEST, &outcome);
        let colored = PlainFormatter::new().colorize().outcome(TEST, &outcome);
        let stripped = strip_ansi(&colored);
        assert_eq!(plain, stripped);
    }

    fn strip_ansi(s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        let mut chars = s.chars();
        while let Some(c) = chars.next() {
            if c == '\x1b' {
                // Skip to the end of the CSI sequence.
                for c in chars.by_ref() {
                    if c == 'm' {
                        break;
                    }
                }
            } else {
                out.push(c);
            }
        }
        out
    }
}
