//! Bounded log chunking for streamed command output.
//!
//! Bytes are buffered and emitted as chunks of at most `chunk_bytes`. Chunks
//! end on a newline where one exists inside the window; a single line longer
//! than the window is hard-split on a UTF-8 character boundary. Concatenating
//! every emitted chunk reproduces the input exactly (for valid UTF-8 input).

/// Smallest chunk size that always fits one UTF-8 character.
const MIN_CHUNK_BYTES: usize = 4;

#[derive(Debug)]
pub struct LogChunker {
    buf: Vec<u8>,
    chunk_bytes: usize,
    /// A partial trailing line survived the previous interval flush.
    tail_pending: bool,
}

impl LogChunker {
    pub fn new(chunk_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            chunk_bytes: chunk_bytes.max(MIN_CHUNK_BYTES),
            tail_pending: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// True once the buffer holds at least one full chunk.
    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.chunk_bytes
    }

    /// Size-triggered flush: emit chunks until less than one chunk remains.
    pub fn drain_full(&mut self) -> Vec<String> {
        let mut chunks = Vec::new();
        while self.is_full() {
            match self.take_chunk(false) {
                Some(chunk) => chunks.push(chunk),
                None => break,
            }
        }
        chunks
    }

    /// Interval flush: emit complete lines. A partial trailing line is held for
    /// one interval, then emitted on the next flush if no newline arrived.
    pub fn flush_interval(&mut self) -> Vec<String> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.take_chunk(false) {
            chunks.push(chunk);
        }
        if self.buf.is_empty() {
            self.tail_pending = false;
        } else if self.tail_pending {
            if let Some(chunk) = self.take_chunk(true) {
                chunks.push(chunk);
            }
            self.tail_pending = !self.buf.is_empty();
        } else {
            self.tail_pending = true;
        }
        chunks
    }

    /// Final flush at process exit: emit everything that is buffered.
    pub fn finish(&mut self) -> Vec<String> {
        let mut chunks = Vec::new();
        while !self.buf.is_empty() {
            match self.take_chunk(true) {
                Some(chunk) => chunks.push(chunk),
                None => {
                    let rest: Vec<u8> = self.buf.drain(..).collect();
                    chunks.push(String::from_utf8_lossy(&rest).into_owned());
                }
            }
        }
        self.tail_pending = false;
        chunks
    }

    fn take_chunk(&mut self, allow_partial: bool) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let window = self.buf.len().min(self.chunk_bytes);
        let cut = match self.buf[..window].iter().rposition(|&b| b == b'\n') {
            Some(idx) => idx + 1,
            None if self.buf.len() >= self.chunk_bytes => hard_split(&self.buf, window),
            None if allow_partial => complete_prefix_len(&self.buf),
            None => return None,
        };
        if cut == 0 {
            return None;
        }
        let chunk: Vec<u8> = self.buf.drain(..cut).collect();
        Some(String::from_utf8_lossy(&chunk).into_owned())
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0b1100_0000 == 0b1000_0000
}

/// Largest cut at or below `window` that does not split a character.
fn hard_split(buf: &[u8], window: usize) -> usize {
    let mut cut = window;
    while cut > 0 && cut < buf.len() && is_continuation(buf[cut]) {
        cut -= 1;
    }
    if cut == 0 { window } else { cut }
}

/// Length of the prefix that excludes an incomplete trailing sequence.
fn complete_prefix_len(buf: &[u8]) -> usize {
    match std::str::from_utf8(buf) {
        Ok(_) => buf.len(),
        Err(err) if err.error_len().is_none() => err.valid_up_to(),
        Err(_) => buf.len(),
    }
}
