// Copyright (c) The cmdt Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory buffering for a single output slot.

use crate::{
    channel::{OutputStream, SuiteChannel},
    errors::ChannelError,
    helpers::lock,
};
use bytes::BytesMut;
use std::sync::Mutex;

/// Accumulates writes for one slot until an explicit flush pushes them to a channel.
///
/// A slot is either one test (sequence number 1 and up) or the suite-level slot 0. Writes to a
/// printer only contend with other writers of the same printer.
#[derive(Debug, Default)]
pub struct BufferedPrinter {
    pending: Mutex<Pending>,
}

#[derive(Debug, Default)]
struct Pending {
    stdout: BytesMut,
    stderr: BytesMut,
}

impl BufferedPrinter {
    /// Creates an empty printer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers bytes for the given stream.
    pub fn write(&self, stream: OutputStream, bytes: impl AsRef<[u8]>) {
        let mut pending = lock(&self.pending);
        match stream {
            OutputStream::Stdout => pending.stdout.extend_from_slice(bytes.as_ref()),
            OutputStream::Stderr => pending.stderr.extend_from_slice(bytes.as_ref()),
        }
    }

    /// Buffers bytes for stdout.
    pub fn out(&self, bytes: impl AsRef<[u8]>) {
        self.write(OutputStream::Stdout, bytes)
    }

    /// Buffers bytes for stderr.
    pub fn err(&self, bytes: impl AsRef<[u8]>) {
        self.write(OutputStream::Stderr, bytes)
    }

    /// Returns the number of bytes waiting to be flushed.
    pub fn pending_len(&self) -> usize {
        let pending = lock(&self.pending);
        pending.stdout.len() + pending.stderr.len()
    }

    /// Pushes all pending bytes to `channel`, returning how many bytes were written.
    ///
    /// Flushing with nothing pending is a no-op. If a write fails, the bytes for that stream stay
    /// pending; a stream that was already written is not rolled back.
    pub fn flush_to(&self, channel: &dyn SuiteChannel) -> Result<usize, ChannelError> {
        let mut pending = lock(&self.pending);
        let mut written = 0;
        for stream in OutputStream::ALL {
            let buf = match stream {
                OutputStream::Stdout => &mut pending.stdout,
                OutputStream::Stderr => &mut pending.stderr,
            };
            if buf.is_empty() {
                continue;
            }
            channel.append(stream, buf)?;
            written += buf.len();
            buf.clear();
        }
        Ok(written)
    }
}
