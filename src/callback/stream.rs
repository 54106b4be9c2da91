//! Stream callbacks: line sources and sinks for Channel I/O

use super::context::{self, SlotKind};
use super::contract;
use crate::error::CallbackError;
use std::ffi::{c_char, CStr, CString};
use std::io::{BufRead, Write};

/// Supplies lines to `Channel::read`; `None` marks end of input
pub trait Source {
    fn read_line(&mut self) -> Result<Option<String>, CallbackError>;
}

/// Receives the lines written by `Channel::write`
pub trait Sink {
    fn write_line(&mut self, line: &str) -> Result<(), CallbackError>;
}

/// In-memory line store; a sink that can be read back as a source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineBuffer {
    lines: Vec<String>,
    cursor: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            cursor: 0,
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Lines not yet read
    pub fn remaining(&self) -> usize {
        self.lines.len() - self.cursor
    }

    /// Read again from the first line
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.cursor = 0;
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

impl Source for LineBuffer {
    fn read_line(&mut self) -> Result<Option<String>, CallbackError> {
        let line = self.lines.get(self.cursor).cloned();
        if line.is_some() {
            self.cursor += 1;
        }
        Ok(line)
    }
}

impl Sink for LineBuffer {
    fn write_line(&mut self, line: &str) -> Result<(), CallbackError> {
        self.lines.push(line.to_string());
        Ok(())
    }
}

/// Source over any buffered reader, one line per `read_line`
pub struct ReaderSource<R> {
    reader: R,
    buf: String,
}

impl<R: BufRead> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: String::new(),
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: BufRead> Source for ReaderSource<R> {
    fn read_line(&mut self) -> Result<Option<String>, CallbackError> {
        self.buf.clear();
        if self.reader.read_line(&mut self.buf)? == 0 {
            return Ok(None);
        }
        let line = self.buf.trim_end_matches(['\n', '\r']);
        Ok(Some(line.to_string()))
    }
}

/// Sink writing each line, newline-terminated, to any writer
pub struct WriterSink<W> {
    writer: W,
}

impl<W: Write> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Sink for WriterSink<W> {
    fn write_line(&mut self, line: &str) -> Result<(), CallbackError> {
        writeln!(self.writer, "{}", line)?;
        Ok(())
    }
}

/// Installed as the Channel source function
pub(crate) extern "C" fn source_trampoline() -> *const c_char {
    let Some(call) = context::resolve_source() else {
        return std::ptr::null();
    };
    let line = context::invoke(&call, SlotKind::Source, || {
        let source = unsafe { &mut *call.target };
        match source.read_line()? {
            None => Ok(None),
            Some(line) => CString::new(line)
                .map(Some)
                .map_err(|_| contract("source returned a line containing a NUL character")),
        }
    });
    match line {
        Some(Some(text)) => context::keep_line(call.call_id, text),
        _ => std::ptr::null(),
    }
}

/// Installed as the Channel sink function
pub(crate) extern "C" fn sink_trampoline(line: *const c_char) {
    let Some(call) = context::resolve_sink() else {
        return;
    };
    // Copied before the callback runs: the library owns the buffer
    let text = if line.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(line) }.to_string_lossy().into_owned())
    };
    context::invoke(&call, SlotKind::Sink, || {
        let text = text.ok_or_else(|| contract("sink called with a null line"))?;
        let sink = unsafe { &mut *call.target };
        sink.write_line(&text)
    });
}
