//! Output sinks.
//!
//! The interpreter writes through [`Writer`]; embedders provide a
//! string-buffer, a stream, or their own implementation.

use std::io;

/// Caller-provided output sink.
pub trait Writer {
    /// Writes a chunk of output.
    fn write_str(&mut self, s: &str) -> io::Result<()>;

    /// Flushes buffered data to the underlying target.
    fn flush(&mut self) -> io::Result<()>;
}

/// Collects all output into a string.
#[derive(Debug, Default)]
pub struct StringWriter(String);

impl StringWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn output(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl Writer for StringWriter {
    fn write_str(&mut self, s: &str) -> io::Result<()> {
        self.0.push_str(s);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Adapts any `io::Write` (a file, stdout, a socket) into a sink.
#[derive(Debug)]
pub struct StreamWriter<W: io::Write>(W);

impl<W: io::Write> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> W {
        self.0
    }
}

impl<W: io::Write> Writer for StreamWriter<W> {
    fn write_str(&mut self, s: &str) -> io::Result<()> {
        self.0.write_all(s.as_bytes())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_writer_collects() {
        let mut writer = StringWriter::new();
        writer.write_str("a").unwrap();
        writer.write_str("b").unwrap();
        assert_eq!(writer.output(), "ab");
    }

    #[test]
    fn stream_writer_writes_bytes() {
        let mut writer = StreamWriter::new(Vec::new());
        writer.write_str("xyz").unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.into_inner(), b"xyz");
    }
}
