//! Async socket line bridge
//!
//! Adapts raw non-blocking reads and writes into line-shaped suspension
//! points. A read fills a fixed-size buffer once and hands the decoded
//! chunk over as the next line; a write appends the fixed `"\n"` separator
//! and flushes before returning.
//!
//! Framing limitation: one read maps to one logical line. Two lines arriving
//! in a single chunk, or one line split across chunks, are not reassembled.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Wire line separator
pub const LINE_SEPARATOR: &str = "\n";

/// Bytes read from the socket per line
const READ_BUFFER_SIZE: usize = 1024;

/// Reads one chunk per call and decodes it as a line
pub struct LineReader<R> {
    reader: R,
    buffer: [u8; READ_BUFFER_SIZE],
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: [0; READ_BUFFER_SIZE],
        }
    }

    /// Read the next line, or `None` when the remote end closed the socket
    ///
    /// The chunk is decoded as UTF-8 (lossily) with one trailing line
    /// separator stripped.
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.reader.read(&mut self.buffer).await?;
        if read == 0 {
            return Ok(None);
        }
        let mut line = String::from_utf8_lossy(&self.buffer[..read]).into_owned();
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        Ok(Some(line))
    }
}

/// Writes lines with the fixed separator appended
pub struct LineWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write `line` followed by the separator and flush the whole buffer
    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(LINE_SEPARATOR.as_bytes()).await?;
        self.writer.flush().await
    }

    /// Close the write direction of the socket
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.writer.shutdown().await
    }
}
