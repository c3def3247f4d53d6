// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::{self, Read, Write};

/// Writer that applies chunked transfer-encoding framing to everything
/// written through it.
///
/// The terminal chunk is emitted by `finish()`.  Dropping the writer
/// without calling `finish()` writes the terminator on a best-effort
/// basis, since errors cannot surface from drop.
pub struct ChunkedWriter<W: Write> {
    inner: W,
    finished: bool,
}

impl<W: Write> ChunkedWriter<W> {
    pub fn new(inner: W) -> ChunkedWriter<W> {
        ChunkedWriter {
            inner,
            finished: false,
        }
    }

    /// Write the terminal chunk and flush.
    pub fn finish(&mut self) -> io::Result<()> {
        if !self.finished {
            self.finished = true;
            self.inner.write_all(b"0\r\n\r\n")?;
            self.inner.flush()?;
        }
        Ok(())
    }
}

impl<W: Write> Write for ChunkedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // An empty chunk would terminate the body.
        if buf.is_empty() {
            return Ok(0);
        }
        write!(self.inner, "{:x}\r\n", buf.len())?;
        self.inner.write_all(buf)?;
        self.inner.write_all(b"\r\n")?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write> Drop for ChunkedWriter<W> {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            let _ = self.inner.write_all(b"0\r\n\r\n");
            let _ = self.inner.flush();
        }
    }
}

/// Reader that guarantees the wrapped reader is read to exhaustion.
///
/// If dropped before end-of-stream, the remainder is read and discarded so
/// that the underlying transport is left clean for the next transaction.
/// A read error stops the drain; there is nothing more to salvage then.
pub struct DrainReader<R: Read> {
    inner: R,
    count: u64,
    done: bool,
}

impl<R: Read> DrainReader<R> {
    pub fn new(inner: R) -> DrainReader<R> {
        DrainReader {
            inner,
            count: 0,
            done: false,
        }
    }

    /// Total bytes read through or discarded by this reader.
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for DrainReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Ok(0) => {
                self.done = true;
                Ok(0)
            }
            Ok(n) => {
                self.count += n as u64;
                Ok(n)
            }
            Err(e) => {
                self.done = true;
                Err(e)
            }
        }
    }
}

impl<R: Read> Drop for DrainReader<R> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut buf = [0u8; 8192];
        loop {
            match self.inner.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => self.count += n as u64,
            }
        }
    }
}
