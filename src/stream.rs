//! Streaming file engine: line-oriented forward and reverse passes over a
//! data file, with in-place random writes and buffered tail appends.
//!
//! Every line is delivered with its byte offset into the pre-pass file and
//! its content length, so callers can rewrite a line in place when the new
//! encoding has the same length, or overwrite just the leading marker byte
//! to tombstone it. Appends made during an update session are buffered and
//! land past the original end of file, so the ongoing scan never observes
//! its own output.

use std::io::{BufRead, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs_err::{File, OpenOptions};

use crate::errors::DbError;

/// Block size for reverse reads and the append-buffer flush threshold.
const BLOCK: usize = 8192;

/// One complete line together with its location in the file.
#[derive(Debug, Clone)]
pub struct LineRecord {
    /// Byte offset of the first byte of the line.
    pub position: u64,
    /// Content length in bytes, excluding the line feed.
    pub length: usize,
    /// The line text without its trailing line feed.
    pub text: String,
}

/// Forward line stream over a data file or an external byte source.
pub struct DocReader {
    inner: BufReader<Box<dyn Read + Send>>,
    position: u64,
}

impl DocReader {
    /// Opens a forward stream. A missing file yields an empty stream
    /// rather than an error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        match File::open(path.as_ref()) {
            Ok(file) => Ok(Self::from_reader(file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::from_reader(Cursor::new(Vec::new())))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Streams from an externally provided byte source with the same
    /// contract as a file-backed stream.
    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        DocReader {
            inner: BufReader::new(Box::new(reader)),
            position: 0,
        }
    }

    /// Reads the next complete line, or `None` at end of stream.
    pub fn next_line(&mut self) -> Result<Option<LineRecord>, DbError> {
        let mut buf = String::new();
        let read = self.inner.read_line(&mut buf)?;
        if read == 0 {
            return Ok(None);
        }

        let position = self.position;
        self.position += read as u64;

        let mut length = read;
        if buf.ends_with('\n') {
            buf.pop();
            length -= 1;
            if buf.ends_with('\r') {
                buf.pop();
                length -= 1;
            }
        }

        Ok(Some(LineRecord {
            position,
            length,
            text: buf,
        }))
    }

    /// Reads up to `max` lines into one batch. An empty batch means EOF.
    pub fn next_batch(&mut self, max: usize) -> Result<Vec<LineRecord>, DbError> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.next_line()? {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        Ok(batch)
    }
}

/// Reverse line stream: EOF to BOF with a rolling block buffer.
///
/// Positions reported are identical to what the forward reader would
/// report for the same lines.
pub struct ReverseLineReader {
    file: Option<File>,
    /// Unconsumed bytes; `offset` is the file position of `buf[0]`.
    buf: Vec<u8>,
    offset: u64,
    trimmed_eof: bool,
}

impl ReverseLineReader {
    /// Opens a reverse stream. A missing file yields an empty stream.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let mut file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ReverseLineReader {
                    file: None,
                    buf: Vec::new(),
                    offset: 0,
                    trimmed_eof: true,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let len = file.seek(SeekFrom::End(0))?;
        Ok(ReverseLineReader {
            file: Some(file),
            buf: Vec::new(),
            offset: len,
            trimmed_eof: false,
        })
    }

    /// Reads the previous line (the one closest to the current tail of the
    /// unconsumed region), or `None` once the beginning is reached.
    pub fn next_line(&mut self) -> Result<Option<LineRecord>, DbError> {
        loop {
            // The LF at the very end of the file terminates the final line;
            // it is consumed once without producing an empty record.
            if !self.trimmed_eof && !self.buf.is_empty() {
                if self.buf.last() == Some(&b'\n') {
                    self.buf.pop();
                }
                self.trimmed_eof = true;
            }

            if let Some(idx) = self.buf.iter().rposition(|&b| b == b'\n') {
                let line = self.buf.split_off(idx + 1);
                self.buf.pop(); // the separator itself
                return Ok(Some(record_at(self.offset + idx as u64 + 1, line)));
            }

            if self.offset == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let line = std::mem::take(&mut self.buf);
                return Ok(Some(record_at(0, line)));
            }

            self.fill_previous_block()?;
        }
    }

    /// Reads up to `max` lines, latest first.
    pub fn next_batch(&mut self, max: usize) -> Result<Vec<LineRecord>, DbError> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.next_line()? {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        Ok(batch)
    }

    fn fill_previous_block(&mut self) -> Result<(), DbError> {
        // offset > 0 only happens for a stream opened over a real file
        let Some(file) = self.file.as_mut() else {
            self.offset = 0;
            return Ok(());
        };
        let take = BLOCK.min(self.offset as usize);
        let new_offset = self.offset - take as u64;
        file.seek(SeekFrom::Start(new_offset))?;
        let mut block = vec![0u8; take];
        file.read_exact(&mut block)?;
        block.extend_from_slice(&self.buf);
        self.buf = block;
        self.offset = new_offset;
        Ok(())
    }
}

fn record_at(position: u64, bytes: Vec<u8>) -> LineRecord {
    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if text.ends_with('\r') {
        text.pop();
    }
    LineRecord {
        position,
        length: text.len(),
        text,
    }
}

/// Forward scan plus write capabilities, for the update and remove phases.
///
/// `write_at` overwrites bytes inside an existing record without moving
/// anything; `append` buffers new lines that are flushed past the original
/// end of file when the session finishes (or when the buffer fills).
pub struct UpdateSession {
    reader: DocReader,
    writer: File,
    tail: Vec<u8>,
    appended: bool,
}

impl UpdateSession {
    /// Opens the file for a combined read/write pass. A missing file
    /// yields `None`; there is nothing to update.
    pub fn open(path: impl AsRef<Path>) -> Result<Option<Self>, DbError> {
        let path = path.as_ref();
        let read = match File::open(path) {
            Ok(f) => f,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let writer = OpenOptions::new().write(true).open(path)?;
        Ok(Some(UpdateSession {
            reader: DocReader::from_reader(read),
            writer,
            tail: Vec::new(),
            appended: false,
        }))
    }

    /// Next line of the forward scan.
    pub fn next_line(&mut self) -> Result<Option<LineRecord>, DbError> {
        self.reader.next_line()
    }

    /// In-place random write. The caller guarantees the byte range lies
    /// inside an existing record and does not cross a line boundary.
    pub fn write_at(&mut self, bytes: &[u8], position: u64) -> Result<(), DbError> {
        self.writer.seek(SeekFrom::Start(position))?;
        self.writer.write_all(bytes)?;
        Ok(())
    }

    /// Buffered append of one encoded line (newline added here).
    pub fn append(&mut self, line: &str) -> Result<(), DbError> {
        self.tail.extend_from_slice(line.as_bytes());
        self.tail.push(b'\n');
        if self.tail.len() >= BLOCK {
            self.flush_tail()?;
        }
        Ok(())
    }

    /// Flushes pending appends and closes the session.
    pub fn finish(mut self) -> Result<bool, DbError> {
        self.flush_tail()?;
        self.writer.flush()?;
        Ok(self.appended)
    }

    fn flush_tail(&mut self) -> Result<(), DbError> {
        if self.tail.is_empty() {
            return Ok(());
        }
        self.writer.seek(SeekFrom::End(0))?;
        self.writer.write_all(&self.tail)?;
        self.tail.clear();
        self.appended = true;
        Ok(())
    }
}

/// Appends a pre-assembled batch of encoded lines to the end of a file,
/// creating it when absent. One call per batch.
pub fn append_file(path: impl AsRef<Path>, data: &[u8]) -> Result<(), DbError> {
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path.as_ref())?;
    file.write_all(data)?;
    file.flush()?;
    Ok(())
}

/// Writes a whole file through a temporary sibling and renames it into
/// place. Used by compaction, schema extension and counter flushes.
pub struct SwapWriter {
    target: PathBuf,
    tmp: PathBuf,
    file: File,
}

impl SwapWriter {
    pub fn create(target: impl Into<PathBuf>, tmp: impl Into<PathBuf>) -> Result<Self, DbError> {
        let target = target.into();
        let tmp = tmp.into();
        let file = File::create(&tmp)?;
        Ok(SwapWriter { target, tmp, file })
    }

    pub fn write_line(&mut self, line: &str) -> Result<(), DbError> {
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        Ok(())
    }

    pub fn commit(mut self) -> Result<(), DbError> {
        self.file.flush()?;
        fs_err::rename(&self.tmp, &self.target)?;
        Ok(())
    }
}
