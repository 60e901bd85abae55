// Copyright (c) The cmdt Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persistence channels for suite output.
//!
//! Each suite owns a [`SuiteChannel`]: two append-only data streams (captured stdout and captured
//! stderr) plus two sentinels. The `done` sentinel means the producer will write nothing more
//! for the suite, and the `flushed` sentinel means every buffered byte has reached the data
//! streams. Producers and consumers never share memory; they coordinate purely through sentinel
//! existence, byte offsets and a generation stamp that changes every time the suite is reset.
//!
//! [`FileStore`] backs channels with files in a per-run namespace directory so a separate process
//! can replay them. [`MemoryStore`] keeps everything in memory for tests and single-process use.

use crate::{
    config::MuxConfig,
    errors::{ChannelError, WorkDirError},
    helpers::{decode_suite_name, encode_suite_name, lock},
};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use std::{
    collections::BTreeSet,
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    sync::{Arc, Mutex},
};
use tracing::debug;

/// One of the two captured output streams of a suite.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputStream {
    /// Captured standard output.
    Stdout,
    /// Captured standard error.
    Stderr,
}

impl OutputStream {
    /// Both streams, in the order they're drained.
    pub const ALL: [Self; 2] = [Self::Stdout, Self::Stderr];

    fn extension(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// A zero-byte marker whose existence communicates a state transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Sentinel {
    /// The producer will emit no more output for the suite.
    Done,
    /// Every byte the producer buffered has been written to the data streams.
    Flushed,
}

impl Sentinel {
    fn extension(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Flushed => "flushed",
        }
    }
}

/// Bytes read from a data stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadChunk {
    /// The offset the bytes start at.
    ///
    /// This is the requested offset, unless the stream has become shorter than that offset (the
    /// suite was reset and rewritten), in which case it is 0.
    pub start: u64,

    /// The bytes read, up to the current end of the stream.
    pub bytes: Vec<u8>,
}

impl ReadChunk {
    /// The offset just past the bytes read.
    pub fn end(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }
}

/// The append-write/offset-read destination for one suite.
pub trait SuiteChannel: fmt::Debug + Send + Sync {
    /// The suite this channel belongs to.
    fn suite(&self) -> &str;

    /// Removes all data and sentinels for the suite.
    fn reset(&self) -> Result<(), ChannelError>;

    /// Appends bytes to a data stream, creating it if necessary.
    fn append(&self, stream: OutputStream, bytes: &[u8]) -> Result<(), ChannelError>;

    /// Reads everything available in a data stream starting at `offset`.
    ///
    /// A stream that doesn't exist yet reads as empty.
    fn read_from(&self, stream: OutputStream, offset: u64) -> Result<ReadChunk, ChannelError>;

    /// Creates a sentinel. Creating an existing sentinel is a no-op.
    fn mark(&self, sentinel: Sentinel) -> Result<(), ChannelError>;

    /// Returns true if the sentinel exists.
    fn is_marked(&self, sentinel: Sentinel) -> Result<bool, ChannelError>;

    /// Returns the stamp of the suite's current run.
    ///
    /// Every [`reset`](Self::reset) replaces the stamp, so a consumer that sees it change knows
    /// that its offsets refer to a previous run. `None` means the suite has never been reset
    /// through this store.
    fn generation(&self) -> Result<Option<u64>, ChannelError>;
}

/// A factory for suite channels within one run namespace.
pub trait ChannelStore: fmt::Debug + Send + Sync {
    /// Returns the channel for a suite. This does not touch any files.
    fn channel(&self, suite: &str) -> Arc<dyn SuiteChannel>;

    /// Lists the suites that currently have data or sentinels in this store.
    fn list_suites(&self) -> Result<Vec<String>, ChannelError>;
}

/// A store that keeps suite channels as files in a namespace directory.
///
/// For a suite `S` the layout is:
///
/// ```text
/// <work-dir>/<token>/<isolation>/<S>.stdout
/// <work-dir>/<token>/<isolation>/<S>.stderr
/// <work-dir>/<token>/<isolation>/<S>.done
/// <work-dir>/<token>/<isolation>/<S>.flushed
/// <work-dir>/<token>/<isolation>/<S>.generation
/// ```
///
/// where `<S>` is encoded with [`encode_suite_name`]. Files are readable and writable by the
/// owning user only.
#[derive(Clone, Debug)]
pub struct FileStore {
    dir: Utf8PathBuf,
}

impl FileStore {
    /// Creates the namespace directory for `config` if necessary and returns a store over it.
    pub fn new(config: &MuxConfig) -> Result<Self, WorkDirError> {
        let dir = config.namespace_dir();
        create_private_dir(&dir).map_err(|error| WorkDirError::Create {
            dir: dir.clone(),
            error,
        })?;
        debug!("file store: using namespace directory {dir}");
        Ok(Self { dir })
    }

    /// The namespace directory.
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn file_channel(&self, suite: &str) -> FileChannel {
        FileChannel {
            suite: suite.to_owned(),
            stem: self.dir.join(encode_suite_name(suite)),
        }
    }
}

impl ChannelStore for FileStore {
    fn channel(&self, suite: &str) -> Arc<dyn SuiteChannel> {
        Arc::new(self.file_channel(suite))
    }

    fn list_suites(&self) -> Result<Vec<String>, ChannelError> {
        let list_error = |error| ChannelError::ListSuites {
            dir: self.dir.clone(),
            error,
        };
        let entries = match self.dir.read_dir_utf8() {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(list_error(error)),
        };

        // Generation stamps outlive clearing, so they don't count as suite files.
        let known_extensions = [
            OutputStream::Stdout.extension(),
            OutputStream::Stderr.extension(),
            Sentinel::Done.extension(),
            Sentinel::Flushed.extension(),
        ];
        let mut suites = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(list_error)?;
            let path = entry.path();
            let (Some(stem), Some(extension)) = (path.file_stem(), path.extension()) else {
                continue;
            };
            if !known_extensions.contains(&extension) {
                continue;
            }
            match decode_suite_name(stem) {
                Some(suite) => {
                    suites.insert(suite);
                }
                None => debug!("file store: ignoring unrecognized file {path}"),
            }
        }

        Ok(suites.into_iter().collect())
    }
}

/// The channel for one suite within a [`FileStore`].
#[derive(Clone, Debug)]
pub struct FileChannel {
    suite: String,
    stem: Utf8PathBuf,
}

impl FileChannel {
    /// The path of a data stream.
    pub fn stream_path(&self, stream: OutputStream) -> Utf8PathBuf {
        self.stem.with_extension(stream.extension())
    }

    /// The path of a sentinel.
    pub fn sentinel_path(&self, sentinel: Sentinel) -> Utf8PathBuf {
        self.stem.with_extension(sentinel.extension())
    }

    /// The path of the generation stamp.
    pub fn generation_path(&self) -> Utf8PathBuf {
        self.stem.with_extension(GENERATION_EXTENSION)
    }

    // Replaced with a rename so that readers never see a partially written stamp.
    fn write_generation(&self, generation: u64) -> Result<(), ChannelError> {
        let path = self.generation_path();
        let temp_path = self.stem.with_extension(GENERATION_TEMP_EXTENSION);
        private_options()
            .truncate(true)
            .open(&temp_path)
            .and_then(|mut file| file.write_all(generation.to_string().as_bytes()))
            .and_then(|()| fs::rename(&temp_path, &path))
            .map_err(|error| ChannelError::Generation { path, error })
    }
}

const GENERATION_EXTENSION: &str = "generation";
const GENERATION_TEMP_EXTENSION: &str = "generation-tmp";

// Later than any previous stamp for the suite, and unlikely to repeat one whose file was
// removed from under us.
fn next_generation(previous: Option<u64>) -> u64 {
    let now = chrono::Utc::now()
        .timestamp_nanos_opt()
        .and_then(|nanos| u64::try_from(nanos).ok())
        .unwrap_or(0);
    previous.map_or(0, |previous| previous.saturating_add(1)).max(now)
}

impl SuiteChannel for FileChannel {
    fn suite(&self) -> &str {
        &self.suite
    }

    fn reset(&self) -> Result<(), ChannelError> {
        let paths = OutputStream::ALL
            .into_iter()
            .map(|stream| self.stream_path(stream))
            .chain([
                self.sentinel_path(Sentinel::Done),
                self.sentinel_path(Sentinel::Flushed),
            ]);
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => debug!("suite {}: removed {path}", self.suite),
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => return Err(ChannelError::Remove { path, error }),
            }
        }
        // The data files are gone before the stamp changes, so nothing from the new run can be
        // read under the old stamp.
        let generation = next_generation(self.generation()?);
        self.write_generation(generation)?;
        debug!("suite {}: reset to generation {generation}", self.suite);
        Ok(())
    }

    fn append(&self, stream: OutputStream, bytes: &[u8]) -> Result<(), ChannelError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let path = self.stream_path(stream);
        // The handle is dropped (and closed) on every return path.
        let mut file = private_options()
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(bytes).map(|()| file))
            .map_err(|error| ChannelError::Append {
                path: path.clone(),
                error,
            })?;
        file.flush()
            .map_err(|error| ChannelError::Append { path, error })
    }

    fn read_from(&self, stream: OutputStream, offset: u64) -> Result<ReadChunk, ChannelError> {
        let path = self.stream_path(stream);
        let read_error = |error| ChannelError::Read {
            path: path.clone(),
            offset,
            error,
        };

        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Ok(ReadChunk {
                    start: offset,
                    bytes: Vec::new(),
                });
            }
            Err(error) => return Err(read_error(error)),
        };

        let len = file.metadata().map_err(read_error)?.len();
        let start = if len < offset { 0 } else { offset };
        file.seek(SeekFrom::Start(start)).map_err(read_error)?;
        let mut bytes = Vec::with_capacity((len - start) as usize);
        file.read_to_end(&mut bytes).map_err(read_error)?;

        Ok(ReadChunk { start, bytes })
    }

    fn mark(&self, sentinel: Sentinel) -> Result<(), ChannelError> {
        let path = self.sentinel_path(sentinel);
        private_options()
            .open(&path)
            .map_err(|error| ChannelError::Sentinel {
                path: path.clone(),
                error,
            })?;
        debug!("suite {}: created sentinel {path}", self.suite);
        Ok(())
    }

    fn is_marked(&self, sentinel: Sentinel) -> Result<bool, ChannelError> {
        let path = self.sentinel_path(sentinel);
        path.try_exists()
            .map_err(|error| ChannelError::Sentinel { path, error })
    }

    fn generation(&self) -> Result<Option<u64>, ChannelError> {
        let path = self.generation_path();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(ChannelError::Generation { path, error }),
        };
        contents
            .trim()
            .parse()
            .map(Some)
            .map_err(|error| ChannelError::Generation {
                path,
                error: io::Error::new(io::ErrorKind::InvalidData, error),
            })
    }
}

fn private_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.create(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}

fn create_private_dir(dir: &Utf8Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

/// A store that keeps suite channels in memory.
///
/// Cloning the store shares the underlying channels.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    channels: Arc<Mutex<IndexMap<String, Arc<MemoryChannel>>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the concrete in-memory channel for a suite, for inspection.
    pub fn memory_channel(&self, suite: &str) -> Arc<MemoryChannel> {
        lock(&self.channels)
            .entry(suite.to_owned())
            .or_insert_with(|| Arc::new(MemoryChannel::new(suite)))
            .clone()
    }
}

impl ChannelStore for MemoryStore {
    fn channel(&self, suite: &str) -> Arc<dyn SuiteChannel> {
        self.memory_channel(suite)
    }

    fn list_suites(&self) -> Result<Vec<String>, ChannelError> {
        let channels = lock(&self.channels);
        Ok(channels
            .iter()
            .filter(|(_, channel)| channel.has_contents())
            .map(|(suite, _)| suite.clone())
            .collect())
    }
}

/// An in-memory suite channel.
#[derive(Debug)]
pub struct MemoryChannel {
    suite: String,
    state: Mutex<MemoryChannelState>,
}

#[derive(Debug, Default)]
struct MemoryChannelState {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    done: bool,
    flushed: bool,
    generation: Option<u64>,
}

impl MemoryChannel {
    fn new(suite: &str) -> Self {
        Self {
            suite: suite.to_owned(),
            state: Mutex::new(MemoryChannelState::default()),
        }
    }

    /// Returns a copy of everything written to a stream.
    pub fn contents(&self, stream: OutputStream) -> Vec<u8> {
        let state = lock(&self.state);
        match stream {
            OutputStream::Stdout => state.stdout.clone(),
            OutputStream::Stderr => state.stderr.clone(),
        }
    }

    fn has_contents(&self) -> bool {
        let state = lock(&self.state);
        !state.stdout.is_empty() || !state.stderr.is_empty() || state.done || state.flushed
    }
}

impl SuiteChannel for MemoryChannel {
    fn suite(&self) -> &str {
        &self.suite
    }

    fn reset(&self) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        let generation = state.generation.map_or(0, |generation| generation + 1);
        *state = MemoryChannelState {
            generation: Some(generation),
            ..MemoryChannelState::default()
        };
        Ok(())
    }

    fn append(&self, stream: OutputStream, bytes: &[u8]) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        match stream {
            OutputStream::Stdout => state.stdout.extend_from_slice(bytes),
            OutputStream::Stderr => state.stderr.extend_from_slice(bytes),
        }
        Ok(())
    }

    fn read_from(&self, stream: OutputStream, offset: u64) -> Result<ReadChunk, ChannelError> {
        let state = lock(&self.state);
        let data = match stream {
            OutputStream::Stdout => &state.stdout,
            OutputStream::Stderr => &state.stderr,
        };
        let start = if (data.len() as u64) < offset {
            0
        } else {
            offset
        };
        Ok(ReadChunk {
            start,
            bytes: data[start as usize..].to_vec(),
        })
    }

    fn mark(&self, sentinel: Sentinel) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        match sentinel {
            Sentinel::Done => state.done = true,
            Sentinel::Flushed => state.flushed = true,
        }
        Ok(())
    }

    fn is_marked(&self, sentinel: Sentinel) -> Result<bool, ChannelError> {
        let state = lock(&self.state);
        Ok(match sentinel {
            Sentinel::Done => state.done,
            Sentinel::Flushed => state.flushed,
        })
    }

    fn generation(&self) -> Result<Option<u64>, ChannelError> {
        Ok(lock(&self.state).generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use pretty_assertions::assert_eq;

    fn file_store(dir: &Utf8Path) -> FileStore {
        let config = MuxConfig::builder("token")
            .isolation("iso")
            .work_dir(dir)
            .build()
            .expect("valid config");
        FileStore::new(&config).expect("created namespace dir")
    }

    #[test]
    fn file_channel_append_and_read() {
        let dir = tempdir().expect("created temp dir");
        let store = file_store(dir.path());
        assert_eq!(store.dir(), dir.path().join("token").join("iso").as_path());
        let channel = store.channel("smoke");

        // Nothing written yet reads as empty.
        let chunk = channel
            .read_from(OutputStream::Stdout, 0)
            .expect("missing file reads as empty");
        assert_eq!(chunk, ReadChunk::default());

        channel
            .append(OutputStream::Stdout, b"hello ")
            .expect("appended");
        channel
            .append(OutputStream::Stdout, b"world")
            .expect("appended");
        channel
            .append(OutputStream::Stderr, b"oops")
            .expect("appended");

        let chunk = channel.read_from(OutputStream::Stdout, 0).expect("read");
        assert_eq!(chunk.bytes, b"hello world");
        let chunk = channel.read_from(OutputStream::Stdout, 6).expect("read");
        assert_eq!(chunk.start, 6);
        assert_eq!(chunk.bytes, b"world");
        assert_eq!(chunk.end(), 11);
        let chunk = channel.read_from(OutputStream::Stderr, 4).expect("read");
        assert_eq!(chunk.bytes, b"");
    }

    #[test]
    fn file_channel_sentinels_and_reset() {
        let dir = tempdir().expect("created temp dir");
        let store = file_store(dir.path());
        let channel = store.channel("a/b");

        assert!(!channel.is_marked(Sentinel::Done).expect("checked"));
        channel.mark(Sentinel::Done).expect("marked");
        channel.mark(Sentinel::Done).expect("marking twice is fine");
        assert!(channel.is_marked(Sentinel::Done).expect("checked"));
        assert!(!channel.is_marked(Sentinel::Flushed).expect("checked"));
        channel
            .append(OutputStream::Stderr, b"data")
            .expect("appended");

        channel.reset().expect("reset");
        assert!(!channel.is_marked(Sentinel::Done).expect("checked"));
        let chunk = channel.read_from(OutputStream::Stderr, 0).expect("read");
        assert_eq!(chunk.bytes, b"");
        channel.reset().expect("resetting twice is fine");
    }

    #[test]
    fn file_channel_generation_changes_on_reset() {
        let dir = tempdir().expect("created temp dir");
        let store = file_store(dir.path());
        let channel = store.channel("gen");
        assert_eq!(channel.generation().expect("read"), None);

        channel.reset().expect("reset");
        let first = channel.generation().expect("read").expect("stamped");
        channel.reset().expect("reset");
        let second = channel.generation().expect("read").expect("stamped");
        assert!(second > first, "{second} > {first}");

        // A separate store over the same directory sees the same stamp.
        let other = file_store(dir.path());
        assert_eq!(
            other.channel("gen").generation().expect("read"),
            Some(second)
        );
        // The stamp isn't mistaken for a suite.
        assert_eq!(store.list_suites().expect("listed"), Vec::<String>::new());
    }

    #[test]
    fn memory_channel_generation_changes_on_reset() {
        let store = MemoryStore::new();
        let channel = store.channel("gen");
        assert_eq!(channel.generation().expect("read"), None);
        channel.reset().expect("reset");
        assert_eq!(channel.generation().expect("read"), Some(0));
        channel.append(OutputStream::Stdout, b"x").expect("appended");
        channel.reset().expect("reset");
        assert_eq!(channel.generation().expect("read"), Some(1));
        assert!(store.memory_channel("gen").contents(OutputStream::Stdout).is_empty());
    }

    #[test]
    fn file_channel_read_after_truncation_restarts() {
        let dir = tempdir().expect("created temp dir");
        let store = file_store(dir.path());
        let channel = store.channel("reused");

        channel
            .append(OutputStream::Stdout, b"first run output")
            .expect("appended");
        channel.reset().expect("reset");
        channel
            .append(OutputStream::Stdout, b"second")
            .expect("appended");

        let chunk = channel.read_from(OutputStream::Stdout, 16).expect("read");
        assert_eq!(chunk.start, 0);
        assert_eq!(chunk.bytes, b"second");
    }

    #[cfg(unix)]
    #[test]
    fn file_channel_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().expect("created temp dir");
        let store = file_store(dir.path());
        let channel = store.file_channel("private");
        channel
            .append(OutputStream::Stdout, b"secret")
            .expect("appended");
        channel.mark(Sentinel::Flushed).expect("marked");

        for path in [
            channel.stream_path(OutputStream::Stdout),
            channel.sentinel_path(Sentinel::Flushed),
        ] {
            let mode = fs::metadata(&path).expect("file exists").permissions().mode();
            assert_eq!(mode & 0o077, 0, "{path} is private");
        }
    }

    #[test]
    fn file_store_lists_suites() {
        let dir = tempdir().expect("created temp dir");
        let store = file_store(dir.path());
        assert_eq!(store.list_suites().expect("listed"), Vec::<String>::new());

        store
            .channel("beta")
            .append(OutputStream::Stdout, b"x")
            .expect("appended");
        store
            .channel("alpha.v2")
            .mark(Sentinel::Done)
            .expect("marked");
        fs::write(store.dir().join("README"), "not a suite").expect("wrote");

        assert_eq!(
            store.list_suites().expect("listed"),
            vec!["alpha.v2".to_owned(), "beta".to_owned()]
        );
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        let channel = store.channel("mem");
        assert_eq!(store.list_suites().expect("listed"), Vec::<String>::new());

        channel.append(OutputStream::Stdout, b"abc").expect("appended");
        channel.mark(Sentinel::Done).expect("marked");
        assert_eq!(store.list_suites().expect("listed"), vec!["mem".to_owned()]);
        assert_eq!(
            store.memory_channel("mem").contents(OutputStream::Stdout),
            b"abc"
        );
        assert_eq!(
            channel.read_from(OutputStream::Stdout, 1).expect("read").bytes,
            b"bc"
        );
        assert_eq!(
            channel.read_from(OutputStream::Stdout, 10).expect("read").start,
            0
        );
    }
}
