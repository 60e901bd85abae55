// Copyright (c) The cmdt Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    ExpectedError,
    errors::CmdtExitCode,
    output::{Color, OutputContext, OutputOpts, clap_styles},
};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use cmdt_runner::{
    OutputMux,
    config::{MuxConfig, MuxConfigFile},
    errors::{SessionError, TailError},
    format::{AssertionResult, PlainFormatter, SuiteStats, TestOutcome, TestResult},
    session::TestSession,
};
use std::{
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Child,
    sync::Semaphore,
};
use tracing::{debug, info, warn};

/// Run shell commands as tests, with output kept in order.
///
/// Commands in a suite run concurrently, but their output is shown one test at a time, in the
/// order the commands were given.
#[derive(Debug, Parser)]
#[command(version, styles = clap_styles::style())]
pub struct CmdtApp {
    #[clap(flatten)]
    output: OutputOpts,

    #[clap(flatten)]
    config_opts: ConfigOpts,

    #[clap(subcommand)]
    command: Command,
}

impl CmdtApp {
    /// Initializes logging and color support.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, returning the process exit code.
    pub fn exec(self, output: OutputContext) -> Result<i32, ExpectedError> {
        let config = self.config_opts.make_config()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|error| ExpectedError::Runtime { error })?;
        runtime.block_on(self.command.exec(config, output))
    }
}

#[derive(Debug, Args)]
struct ConfigOpts {
    /// Run token shared by the producer and consumers of one run
    #[arg(long, global = true, env = "CMDT_TOKEN", default_value = "default")]
    token: String,

    /// Isolation identifier within the run [default: from config, or `default`]
    #[arg(long, global = true, env = "CMDT_ISOLATION")]
    isolation: Option<String>,

    /// Root directory for recorded output [default: from config, or a temp directory]
    #[arg(long, global = true, value_name = "PATH", env = "CMDT_WORK_DIR")]
    work_dir: Option<Utf8PathBuf>,

    /// Config file
    #[arg(long, global = true, value_name = "PATH", env = "CMDT_CONFIG")]
    config: Option<Utf8PathBuf>,
}

impl ConfigOpts {
    /// Resolves the config: defaults, then the config file, then the command line.
    fn make_config(&self) -> Result<MuxConfig, ExpectedError> {
        let mut builder = MuxConfig::builder(self.token.clone());
        if let Some(path) = &self.config {
            match MuxConfigFile::from_path(path).map_err(ExpectedError::config_error)? {
                Some(file) => builder = builder.apply_file(&file),
                None => return Err(ExpectedError::ConfigNotFound { path: path.clone() }),
            }
        }
        if let Some(isolation) = &self.isolation {
            builder = builder.isolation(isolation.clone());
        }
        if let Some(work_dir) = &self.work_dir {
            builder = builder.work_dir(work_dir.clone());
        }
        builder.build().map_err(ExpectedError::config_error)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run commands as the tests of a suite
    ///
    /// Each command is run with `sh -c`. A command passes if it exits with status 0. Output is
    /// shown in command order as tests complete, or with --record-only, written to the work
    /// directory for `cmdt tail` to replay.
    Run(RunOpts),

    /// Replay recorded suites from the work directory
    ///
    /// Blocks until each suite has been completely recorded. With no --suite, every suite in
    /// the run is replayed.
    Tail {
        /// Suite to replay (may be repeated)
        #[arg(long, short = 's', value_name = "NAME")]
        suite: Vec<String>,
    },

    /// Remove a suite's recorded output
    Clear {
        /// Suite to remove (may be repeated)
        #[arg(long, short = 's', value_name = "NAME", required = true)]
        suite: Vec<String>,
    },
}

#[derive(Debug, Args)]
struct RunOpts {
    /// Suite name
    #[arg(long, short = 's', value_name = "NAME")]
    suite: String,

    /// Command to run as a test (may be repeated)
    #[arg(long = "command", short = 'c', value_name = "CMD", required = true)]
    commands: Vec<String>,

    /// Number of commands to run at once [default: number of logical CPUs]
    #[arg(long, short = 'j', value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    jobs: Option<u32>,

    /// Stop a command after this long and count it as timed out
    #[arg(long, value_name = "DURATION", value_parser = non_zero_duration)]
    test_timeout: Option<Duration>,

    /// Record output to the work directory without displaying it
    #[arg(long)]
    record_only: bool,
}

fn non_zero_duration(input: &str) -> Result<Duration, String> {
    let duration = humantime::parse_duration(input).map_err(|error| error.to_string())?;
    if duration.is_zero() {
        Err("duration must be non-zero".to_string())
    } else {
        Ok(duration)
    }
}

impl Command {
    async fn exec(self, config: MuxConfig, output: OutputContext) -> Result<i32, ExpectedError> {
        match self {
            Command::Run(opts) => {
                let formatter = make_formatter(output, opts.record_only);
                let mux = OutputMux::with_file_store(config, Arc::new(formatter))
                    .map_err(ExpectedError::work_dir_error)?;
                opts.exec(mux).await
            }
            Command::Tail { suite } => {
                let mux = OutputMux::with_file_store(config, Arc::new(PlainFormatter::new()))
                    .map_err(ExpectedError::work_dir_error)?;
                exec_tail(&mux, &suite).await?;
                Ok(CmdtExitCode::OK)
            }
            Command::Clear { suite } => {
                let mux = OutputMux::with_file_store(config, Arc::new(PlainFormatter::new()))
                    .map_err(ExpectedError::work_dir_error)?;
                for suite in suite {
                    mux.clear_suite(&suite)
                        .map_err(|error| ExpectedError::Clear {
                            suite: suite.clone(),
                            error,
                        })?;
                    info!("cleared suite {suite}");
                }
                Ok(CmdtExitCode::OK)
            }
        }
    }
}

fn make_formatter(output: OutputContext, record_only: bool) -> PlainFormatter {
    let formatter = PlainFormatter::new()
        .with_verbosity(output.verbose)
        .with_quiet(output.quiet);
    // Recorded output is replayed later, possibly on another terminal, so only bake colors in
    // when asked to explicitly.
    let colorize = if record_only {
        output.color == Color::Always
    } else {
        output.color.should_colorize(supports_color::Stream::Stdout)
    };
    if colorize {
        formatter.colorize()
    } else {
        formatter
    }
}

impl RunOpts {
    async fn exec(self, mux: OutputMux) -> Result<i32, ExpectedError> {
        let RunOpts {
            suite,
            commands,
            jobs,
            test_timeout,
            record_only,
        } = self;

        mux.open_suite(&suite, None)
            .map_err(ExpectedError::session_error)?;

        // The consumer runs alongside the tests so output appears as soon as it's in order.
        let display = if record_only {
            tokio::spawn(flush_suite(mux.clone(), suite.clone()))
        } else {
            tokio::spawn(display_suite(mux.clone(), suite.clone()))
        };

        let jobs = jobs.map_or_else(default_jobs, |jobs| jobs as usize);
        debug!("running {} commands in suite {suite} with {jobs} jobs", commands.len());
        let semaphore = Arc::new(Semaphore::new(jobs));
        let mut tasks = Vec::with_capacity(commands.len());
        for (seq, command) in (1..).zip(commands) {
            let test = CommandTest {
                mux: mux.clone(),
                suite: suite.clone(),
                seq,
                command,
                timeout: test_timeout,
            };
            let semaphore = semaphore.clone();
            tasks.push(tokio::spawn(async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await.ok();
                test.run().await
            }));
        }

        let mut stats = SuiteStats::new();
        for task in tasks {
            let result = task
                .await
                .map_err(|error| ExpectedError::TestTask { error })??;
            stats.record(result);
        }

        let report = stats.report();
        mux.report_suite(&suite, &report)
            .map_err(ExpectedError::session_error)?;
        display
            .await
            .map_err(|error| ExpectedError::TestTask { error })??;

        if report.is_success() {
            Ok(CmdtExitCode::OK)
        } else {
            Ok(CmdtExitCode::TEST_RUN_FAILED)
        }
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism().map_or(1, |jobs| jobs.get())
}

async fn display_suite(mux: OutputMux, suite: String) -> Result<(), ExpectedError> {
    let (mut out, mut err) = (std::io::stdout(), std::io::stderr());
    mux.display_recorded(&suite, &mut out, &mut err)
        .await
        .map_err(|error| ExpectedError::Display { error })
}

async fn flush_suite(mux: OutputMux, suite: String) -> Result<(), ExpectedError> {
    mux.flush(&suite)
        .wait()
        .await
        .map_err(|error| ExpectedError::Flush { error })
}

async fn exec_tail(mux: &OutputMux, suites: &[String]) -> Result<(), ExpectedError> {
    let (mut out, mut err) = (std::io::stdout(), std::io::stderr());
    if suites.is_empty() {
        return mux
            .tail_all(&mut out, &mut err)
            .await
            .map_err(|error| ExpectedError::TailAll { error });
    }

    let timeout = mux.config().default_timeout();
    for suite in suites {
        mux.tailer()
            .block_tail(suite, timeout, &mut out, &mut err)
            .await
            .map_err(|error: TailError| ExpectedError::Tail { error })?;
    }
    Ok(())
}

/// One command run as a test.
struct CommandTest {
    mux: OutputMux,
    suite: String,
    seq: u32,
    command: String,
    timeout: Option<Duration>,
}

impl CommandTest {
    async fn run(self) -> Result<TestResult, ExpectedError> {
        let session = self
            .mux
            .open(&self.suite, self.seq)
            .map_err(ExpectedError::session_error)?;
        session
            .title(&self.command)
            .map_err(ExpectedError::session_error)?;

        let start = Instant::now();
        let outcome = match self.spawn() {
            Ok(mut child) => self.wait(&mut child, &session, start).await?,
            Err(error) => {
                warn!("failed to spawn `{}`: {error}", self.command);
                session
                    .stderr(format!("failed to spawn command: {error}\n"))
                    .map_err(ExpectedError::session_error)?;
                TestOutcome::new(TestResult::Error, start.elapsed())
            }
        };

        session
            .outcome(&outcome)
            .map_err(ExpectedError::session_error)?;
        self.mux
            .close(&self.suite, self.seq)
            .map_err(ExpectedError::session_error)?;
        Ok(outcome.result)
    }

    fn spawn(&self) -> std::io::Result<Child> {
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    async fn wait(
        &self,
        child: &mut Child,
        session: &TestSession,
        start: Instant,
    ) -> Result<TestOutcome, ExpectedError> {
        let status = match self.timeout {
            Some(timeout) => {
                tokio::time::timeout(timeout, forward_and_wait(child, session, &self.command))
                    .await
                    .ok()
            }
            None => Some(forward_and_wait(child, session, &self.command).await),
        };

        let Some(status) = status else {
            // The child may have exited just as the timeout fired, so failures here are only
            // worth a debug message.
            if let Err(error) = child.start_kill() {
                debug!("failed to kill `{}`: {error}", self.command);
            }
            if let Err(error) = child.wait().await {
                debug!("failed to reap `{}`: {error}", self.command);
            }
            let elapsed = start.elapsed();
            session
                .stderr(format!(
                    "command timed out after {}\n",
                    humantime::format_duration(elapsed)
                ))
                .map_err(ExpectedError::session_error)?;
            return Ok(TestOutcome::new(TestResult::Timeout, elapsed));
        };

        let status = status?;
        let passed = status.success();
        let result = if passed {
            TestResult::Passed
        } else {
            TestResult::Failed
        };
        Ok(
            TestOutcome::new(result, start.elapsed()).with_assertion(AssertionResult {
                name: "exit-code == 0".to_owned(),
                passed,
                message: (!passed).then(|| describe_status(status)),
            }),
        )
    }
}

async fn forward_and_wait(
    child: &mut Child,
    session: &TestSession,
    command: &str,
) -> Result<ExitStatus, ExpectedError> {
    let (stdout, stderr) = (child.stdout.take(), child.stderr.take());
    let (out, err) = tokio::join!(
        forward_output(stdout, command, |bytes| session.stdout(bytes)),
        forward_output(stderr, command, |bytes| session.stderr(bytes)),
    );
    out?;
    err?;
    child.wait().await.map_err(|error| ExpectedError::CommandOutput {
        command: command.to_owned(),
        error,
    })
}

/// Copies a child's pipe into the session as bytes arrive.
async fn forward_output<R>(
    reader: Option<R>,
    command: &str,
    mut write: impl FnMut(&[u8]) -> Result<(), SessionError>,
) -> Result<(), ExpectedError>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut buf = vec![0u8; 8192];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|error| ExpectedError::CommandOutput {
                command: command.to_owned(),
                error,
            })?;
        if n == 0 {
            return Ok(());
        }
        write(&buf[..n]).map_err(ExpectedError::session_error)?;
    }
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with code {code}"),
        None => format!("terminated ({status})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_argument_parsing() {
        use clap::error::ErrorKind::{self, *};

        let valid: &[&'static str] = &[
            "cmdt run --suite smoke -c true",
            "cmdt run -s smoke -c true -c 'exit 1' -j 2",
            "cmdt run -s smoke -c 'sleep 1' --test-timeout 500ms",
            "cmdt run -s smoke -c true --record-only",
            "cmdt --token ci --isolation worker-1 run -s smoke -c true",
            "cmdt run -s smoke -c true --work-dir /tmp/cmdt --config cmdt.toml",
            "cmdt -vv run -s smoke -c true",
            "cmdt -q --color never run -s smoke -c true",
            "cmdt tail",
            "cmdt tail --suite smoke --suite other",
            "cmdt --token ci tail -s smoke",
            "cmdt clear --suite smoke",
        ];
        let invalid: &[(&'static str, ErrorKind)] = &[
            ("cmdt run -c true", MissingRequiredArgument),
            ("cmdt run --suite smoke", MissingRequiredArgument),
            ("cmdt run -s smoke -c true -j 0", ValueValidation),
            ("cmdt run -s smoke -c true --test-timeout 0s", ValueValidation),
            ("cmdt run -s smoke -c true --test-timeout soon", ValueValidation),
            ("cmdt -q -v run -s smoke -c true", ArgumentConflict),
            ("cmdt --color sometimes tail", InvalidValue),
            ("cmdt clear", MissingRequiredArgument),
            ("cmdt", DisplayHelpOnMissingArgumentOrSubcommand),
        ];

        // Unset all CMDT_ env vars because they can conflict with the try_parse_from below.
        for (k, _) in std::env::vars() {
            if k.starts_with("CMDT_") {
                // SAFETY: this test doesn't run any other threads that read the environment.
                unsafe { std::env::remove_var(k) };
            }
        }

        for valid_args in valid {
            let cmd = shell_words::split(valid_args).expect("valid command line");
            if let Err(error) = CmdtApp::try_parse_from(cmd) {
                panic!("{valid_args} should have successfully parsed, but didn't: {error}");
            }
        }

        for &(invalid_args, kind) in invalid {
            match CmdtApp::try_parse_from(
                shell_words::split(invalid_args).expect("valid command line"),
            ) {
                Ok(_) => panic!("{invalid_args} should have errored out but successfully parsed"),
                Err(error) => {
                    let actual_kind = error.kind();
                    if kind != actual_kind {
                        panic!(
                            "{invalid_args} should error with kind {kind:?}, but actual kind was {actual_kind:?}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn config_layers() {
        let dir = camino_tempfile::tempdir().expect("created temp dir");
        let path = dir.path().join("cmdt.toml");
        std::fs::write(
            &path,
            indoc! {r#"
                [mux]
                isolation = "from-file"
                work-dir = "/from/file"
                stall-timeout = "5s"
            "#},
        )
        .expect("wrote config");

        let opts = ConfigOpts {
            token: "ci".to_owned(),
            isolation: None,
            work_dir: Some("/from/flag".into()),
            config: Some(path.clone()),
        };
        let config = opts.make_config().expect("valid config");
        assert_eq!(config.token(), "ci");
        assert_eq!(config.isolation(), "from-file");
        assert_eq!(config.work_dir(), "/from/flag");
        assert_eq!(config.stall_timeout(), Duration::from_secs(5));

        let missing = ConfigOpts {
            config: Some(path.with_file_name("missing.toml")),
            ..opts
        };
        assert!(matches!(
            missing.make_config(),
            Err(ExpectedError::ConfigNotFound { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_records_in_command_order() {
        let dir = camino_tempfile::tempdir().expect("created temp dir");
        let config = MuxConfig::builder("dispatch-tests")
            .work_dir(dir.path())
            .flush_poll_interval(Duration::from_millis(1))
            .tail_poll_interval(Duration::from_millis(2))
            .default_timeout(Duration::from_secs(30))
            .build()
            .expect("valid config");
        let producer = OutputMux::with_file_store(config.clone(), Arc::new(PlainFormatter::new()))
            .expect("created namespace dir");

        // The first command finishes last.
        let opts = RunOpts {
            suite: "cmds".to_owned(),
            commands: vec![
                "sleep 0.2; echo first".to_owned(),
                "echo second >&2; exit 3".to_owned(),
                "sleep 5".to_owned(),
            ],
            jobs: Some(3),
            test_timeout: Some(Duration::from_secs(1)),
            record_only: true,
        };
        let code = opts.exec(producer).await.expect("suite ran");
        assert_eq!(code, CmdtExitCode::TEST_RUN_FAILED);

        let consumer = OutputMux::with_file_store(config, Arc::new(PlainFormatter::new()))
            .expect("opened namespace dir");
        let (mut out, mut err) = (Vec::new(), Vec::new());
        consumer
            .tailer()
            .block_tail("cmds", Duration::from_secs(30), &mut out, &mut err)
            .await
            .expect("tailed");
        let out = String::from_utf8(out).expect("UTF-8");
        let err = String::from_utf8(err).expect("UTF-8");

        let positions: Vec<_> = [
            "    Starting suite cmds\n",
            "START cmds #1 sleep 0.2; echo first\nfirst\n",
            "PASS [",
            "START cmds #2 echo second >&2; exit 3\n",
            "FAIL [",
            "exit-code == 0: exited with code 3",
            "START cmds #3 sleep 5\n",
            "TIMEOUT [",
            "Summary [",
        ]
        .iter()
        .map(|needle| {
            out.find(needle)
                .unwrap_or_else(|| panic!("{needle:?} not found in:\n{out}"))
        })
        .collect();
        assert!(
            positions.is_sorted(),
            "output out of order ({positions:?}):\n{out}"
        );
        assert!(out.ends_with("3 tests run in cmds: 1 passed, 1 failed, 1 timed out, 0 ignored\n"));
        assert!(err.starts_with("second\ncommand timed out after "), "{err}");
    }

    #[test]
    fn exit_status_descriptions() {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(
                describe_status(ExitStatus::from_raw(3 << 8)),
                "exited with code 3"
            );
        }
    }
}
