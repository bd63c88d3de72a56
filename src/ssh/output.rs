//! Line-oriented view over raw shell output

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, OwnedMutexGuard};

/// Longest unterminated line kept before it is emitted as is
pub const MAX_PARTIAL_LINE: usize = 64 * 1024;

/// Splits a byte stream into text lines
///
/// Lines end at `\n`; a trailing `\r` is dropped. Bytes are decoded as
/// UTF-8, invalid sequences replaced. An unterminated line longer than
/// `MAX_PARTIAL_LINE` is emitted in pieces.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            lines.push(decode_line(&self.buf[start..end]));
            start = end + 1;
        }
        self.buf.drain(..start);

        while self.buf.len() >= MAX_PARTIAL_LINE {
            match self.flush_partial() {
                Some(piece) => lines.push(piece),
                None => break,
            }
        }
        lines
    }

    /// Whether bytes of an unterminated line are buffered
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Emit the unterminated line (e.g. a prompt) if there is one.
    ///
    /// An incomplete trailing UTF-8 sequence and a trailing `\r` stay
    /// buffered so the next chunk can complete them.
    pub fn flush_partial(&mut self) -> Option<String> {
        let mut keep = incomplete_utf8_tail(&self.buf);
        if self.buf.len() > keep && self.buf[self.buf.len() - keep - 1] == b'\r' {
            keep += 1;
        }

        let emit = self.buf.len() - keep;
        if emit == 0 {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf[..emit]).into_owned();
        self.buf.drain(..emit);
        Some(line)
    }

    /// Emit whatever is left, complete or not
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = decode_line(&self.buf);
        self.buf.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Length of a UTF-8 sequence cut off at the end of `bytes`
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let b = bytes[bytes.len() - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let needed = match b {
            0xF0..=0xF7 => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

/// Consumer side of a session's output queue
///
/// Survives individual subscriptions, so a new stream picks up exactly
/// where the previous one stopped.
pub(crate) struct OutputReader {
    rx: mpsc::Receiver<Vec<u8>>,
    decoder: LineDecoder,
    ready: VecDeque<String>,
    finished: bool,
}

impl OutputReader {
    pub(crate) fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            decoder: LineDecoder::new(),
            ready: VecDeque::new(),
            finished: false,
        }
    }

    /// Next line, `None` at end of output.
    ///
    /// A partial line is emitted once no output arrived for `idle_flush`.
    /// `still_connected` is consulted whenever the reader sits idle.
    async fn next_line(
        &mut self,
        idle_flush: Duration,
        still_connected: &(dyn Fn() -> bool + Send + Sync),
    ) -> Option<String> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Some(line);
            }
            if self.finished {
                return self.decoder.finish();
            }

            match tokio::time::timeout(idle_flush, self.rx.recv()).await {
                Ok(Some(chunk)) => self.ready.extend(self.decoder.push(&chunk)),
                Ok(None) => self.finished = true,
                Err(_) => {
                    if let Some(partial) = self.decoder.flush_partial() {
                        return Some(partial);
                    }
                    if !still_connected() {
                        // Deliver what was already queued, then stop
                        self.rx.close();
                    }
                }
            }
        }
    }
}

/// Line stream holding exclusive access to an `OutputReader` while alive
pub(crate) fn line_stream<F>(
    reader: OwnedMutexGuard<OutputReader>,
    idle_flush: Duration,
    still_connected: F,
) -> BoxStream<'static, String>
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    stream::unfold(
        (reader, still_connected),
        move |(mut reader, still_connected)| async move {
            let line = reader.next_line(idle_flush, &still_connected).await?;
            Some((line, (reader, still_connected)))
        },
    )
    .boxed()
}
