//! # Output Capture
//!
//! Every evaluation writes its emitted text (prints, diagnostics) into its own
//! [`CaptureBuffer`]. A session hands out a fresh buffer per evaluation, so a
//! worker that keeps running after its request timed out can only write into
//! a buffer nobody reads any more.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

const TRUNCATION_NOTICE: &str = "\n(output truncated)";

/// Factory for per-evaluation buffers with a shared size limit.
#[derive(Debug, Clone, Copy)]
pub struct OutputCapture {
    limit: usize,
}

impl OutputCapture {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    /// Starts capturing for one evaluation.
    pub fn begin(&self) -> CaptureBuffer {
        CaptureBuffer {
            inner: Arc::new(Mutex::new(Inner {
                text: String::new(),
                limit: self.limit,
                truncated: false,
            })),
        }
    }
}

#[derive(Debug)]
struct Inner {
    text: String,
    limit: usize,
    truncated: bool,
}

/// Shared handle to one evaluation's output.
#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl CaptureBuffer {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking engine must not make the buffer unreadable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn write_str(&self, s: &str) {
        let mut inner = self.lock();
        if inner.truncated {
            return;
        }
        let room = inner.limit.saturating_sub(inner.text.len());
        if s.len() <= room {
            inner.text.push_str(s);
            return;
        }
        let mut cut = room;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        inner.text.push_str(&s[..cut]);
        inner.truncated = true;
    }

    pub fn writeln(&self, s: &str) {
        self.write_str(s);
        self.write_str("\n");
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.lock();
        inner.text.is_empty() && !inner.truncated
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.text.clear();
        inner.truncated = false;
    }

    /// Drains the captured text, leaving the buffer empty.
    pub fn take(&self) -> String {
        let mut inner = self.lock();
        let mut text = std::mem::take(&mut inner.text);
        if std::mem::take(&mut inner.truncated) {
            text.push_str(TRUNCATION_NOTICE);
        }
        text
    }
}

impl fmt::Write for CaptureBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        CaptureBuffer::write_str(self, s);
        Ok(())
    }
}
