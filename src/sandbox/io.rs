//! Output capture for sandboxed runs.
//!
//! Every run owns its own buffers. Nothing here is shared between requests,
//! and a buffer belonging to an abandoned run is simply dropped with it.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use wasmtime_wasi::{HostOutputStream, StdoutStream, StreamResult, Subscribe};

/// Largest single write the guest is invited to make.
const WRITE_BUDGET: usize = 64 * 1024;

/// A size-capped output buffer.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    buffer: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CapturedOutput {
    /// Create a buffer that keeps at most `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
            truncated: false,
        }
    }

    /// Append raw bytes, dropping whatever does not fit.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        if self.truncated {
            return;
        }
        let room = self.limit - self.buffer.len();
        if bytes.len() <= room {
            self.buffer.extend_from_slice(bytes);
            return;
        }
        self.buffer.extend_from_slice(&bytes[..room]);
        self.truncated = true;
    }

    /// Append text, dropping whatever does not fit.
    pub fn push_str(&mut self, text: &str) {
        self.push_bytes(text.as_bytes());
    }

    /// Whether anything was dropped.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Get the length of captured data.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Consume the buffer, returning the text and the truncation flag.
    ///
    /// A character split by the cap is dropped rather than replaced; other
    /// invalid UTF-8 is replaced.
    pub fn into_parts(mut self) -> (String, bool) {
        if self.truncated {
            if let Err(e) = std::str::from_utf8(&self.buffer) {
                if e.error_len().is_none() {
                    self.buffer.truncate(e.valid_up_to());
                }
            }
        }
        let text = match String::from_utf8(self.buffer) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };
        (text, self.truncated)
    }
}

/// A [`CapturedOutput`] the guest writes into through WASI.
///
/// Cloning shares the buffer; the run keeps one handle and gives the other to
/// the WASI context.
#[derive(Debug, Clone)]
pub struct SharedOutput {
    inner: Arc<Mutex<CapturedOutput>>,
}

impl SharedOutput {
    /// Create a shared buffer that keeps at most `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CapturedOutput::with_limit(limit))),
        }
    }

    /// Append raw bytes.
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_bytes(bytes);
    }

    /// Copy out what has been captured so far.
    pub fn snapshot(&self) -> CapturedOutput {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl StdoutStream for SharedOutput {
    fn stream(&self) -> Box<dyn HostOutputStream> {
        Box::new(self.clone())
    }

    fn isatty(&self) -> bool {
        false
    }
}

#[async_trait]
impl Subscribe for SharedOutput {
    async fn ready(&mut self) {}
}

#[async_trait]
impl HostOutputStream for SharedOutput {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        // Past the cap the guest keeps running; its output is dropped.
        self.push_bytes(&bytes);
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(WRITE_BUDGET)
    }
}
