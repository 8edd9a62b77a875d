//! Content-Length framing over a duplex byte stream.
//!
//! A frame is a block of `Name: value` header lines, a blank line, then
//! exactly `Content-Length` bytes of UTF-8 JSON. Only `Content-Length` is
//! interpreted; other headers are read and discarded.

use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Header lines longer than this are truncated and ignored.
const MAX_HEADER_LINE: usize = 8 * 1024;

/// Initial body allocation; the buffer grows as bytes arrive.
const BODY_CHUNK: usize = 64 * 1024;

/// Outcome of one attempt to read a frame.
#[derive(Debug)]
pub enum Frame {
    /// A complete, parsed message body.
    Message(Value),
    /// The stream has nothing buffered right now; retry after a short pause.
    Pending,
    /// A frame was discarded: no usable Content-Length, a body over the size
    /// limit, or a body that is not JSON. An oversized body is not consumed;
    /// the reader resynchronises on the next header block.
    Dropped,
    /// The peer went away (or reading was cancelled) mid-frame.
    Closed,
}

pub struct FrameReader<R> {
    reader: R,
    cancel: Arc<AtomicBool>,
    max_body: usize,
    line: Vec<u8>,
    overlong: bool,
    content_length: Option<String>,
    saw_header: bool,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_cancel(reader, Arc::new(AtomicBool::new(false)))
    }

    pub fn with_cancel(reader: R, cancel: Arc<AtomicBool>) -> Self {
        Self {
            reader,
            cancel,
            max_body: DEFAULT_MAX_FRAME_BYTES,
            line: Vec::new(),
            overlong: false,
            content_length: None,
            saw_header: false,
        }
    }

    /// Cap on the declared Content-Length; larger frames are dropped.
    pub fn max_body(mut self, bytes: usize) -> Self {
        self.max_body = bytes;
        self
    }

    /// Read the next frame. Header state survives a `Pending` result, so a
    /// frame that arrives in pieces is assembled across calls.
    ///
    /// Malformed input never surfaces as an error; only failures of the
    /// underlying stream do.
    pub fn read_frame(&mut self) -> io::Result<Frame> {
        loop {
            if self.cancelled() {
                return Ok(Frame::Closed);
            }
            if !self.read_header_line()? {
                return Ok(Frame::Pending);
            }

            let raw = std::mem::take(&mut self.line);
            if std::mem::take(&mut self.overlong) {
                debug!(kept = raw.len(), "ignoring overlong header line");
                self.saw_header = true;
                continue;
            }
            let Ok(text) = std::str::from_utf8(&raw) else {
                debug!(bytes = raw.len(), "ignoring header line that is not UTF-8");
                self.saw_header = true;
                continue;
            };
            let line = text.trim_end_matches(['\r', '\n']);
            if !line.is_empty() {
                self.saw_header = true;
                if let Some((name, value)) = line.split_once(':') {
                    if name.trim().eq_ignore_ascii_case("content-length") {
                        self.content_length = Some(value.trim().to_string());
                    }
                }
                continue;
            }
            if !self.saw_header {
                // stray blank line between frames
                continue;
            }

            self.saw_header = false;
            let declared = self.content_length.take();
            let Some(length) = declared.as_deref().and_then(|raw| raw.parse::<usize>().ok())
            else {
                debug!(content_length = ?declared, "dropping frame without usable Content-Length");
                return Ok(Frame::Dropped);
            };
            if length > self.max_body {
                debug!(length, limit = self.max_body, "dropping frame over size limit");
                return Ok(Frame::Dropped);
            }
            return self.read_body(length);
        }
    }

    /// Buffer bytes up to and including the next newline. `false` means the
    /// stream has nothing more for now and the partial line is kept.
    fn read_header_line(&mut self) -> io::Result<bool> {
        loop {
            let available = match self.reader.fill_buf() {
                Ok(available) => available,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            if available.is_empty() {
                return Ok(false);
            }
            let (chunk, complete) = match available.iter().position(|b| *b == b'\n') {
                Some(end) => (&available[..=end], true),
                None => (available, false),
            };
            let room = MAX_HEADER_LINE.saturating_sub(self.line.len());
            if chunk.len() > room {
                self.overlong = true;
            }
            self.line.extend_from_slice(&chunk[..chunk.len().min(room)]);
            let used = chunk.len();
            self.reader.consume(used);
            if complete {
                return Ok(true);
            }
        }
    }

    fn read_body(&mut self, length: usize) -> io::Result<Frame> {
        let mut body = Vec::with_capacity(length.min(BODY_CHUNK));
        while body.len() < length {
            if self.cancelled() {
                return Ok(Frame::Closed);
            }
            let available = match self.reader.fill_buf() {
                Ok(available) => available,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            if available.is_empty() {
                debug!(expected = length, received = body.len(), "stream ended mid-body");
                return Ok(Frame::Closed);
            }
            let take = available.len().min(length - body.len());
            body.extend_from_slice(&available[..take]);
            self.reader.consume(take);
        }
        match serde_json::from_slice::<Value>(&body) {
            Ok(value) => Ok(Frame::Message(value)),
            Err(err) => {
                debug!(error = %err, "dropping frame with invalid JSON body");
                Ok(Frame::Dropped)
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Serialize `value` compactly and write it as one frame, flushing at once.
pub fn write_frame<W: Write>(writer: &mut W, value: &Value) -> io::Result<()> {
    let body = serde_json::to_vec(value)?;
    write!(writer, "Content-Length: {}\r\n\r\n", body.len())?;
    writer.write_all(&body)?;
    writer.flush()
}
