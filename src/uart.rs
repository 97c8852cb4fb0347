//! Serial console output.
use std::io::{self, Write};

/// Writer for a serial terminal: every line feed goes out as CR LF, unless the writer is in raw
/// mode.
pub struct UartWriter<W> {
    inner: W,
    raw: bool,
}

impl<W: Write> UartWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, raw: false }
    }

    /// A writer that passes bytes through untouched, for binary trace data.
    pub fn raw(inner: W) -> Self {
        Self { inner, raw: true }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for UartWriter<W> {
    /// Reports the whole input as written, not the number of bytes sent to the line.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.raw {
            self.inner.write_all(buf)?;
            return Ok(buf.len());
        }

        for line in buf.split_inclusive(|byte| *byte == b'\n') {
            match line.split_last() {
                Some((b'\n', text)) => {
                    self.inner.write_all(text)?;
                    self.inner.write_all(b"\r\n")?;
                }
                _ => self.inner.write_all(line)?,
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
