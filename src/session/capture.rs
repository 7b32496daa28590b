//! Bounded output capture.
//!
//! Every chunk a sandboxed process writes is offered to a [`CaptureSink`].
//! Bytes past the per-stream cap are counted and dropped, never buffered.

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Default)]
pub struct BoundedBuffer {
    data: Vec<u8>,
    cap: usize,
    dropped: u64,
}

impl BoundedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        let take = room.min(chunk.len());
        self.data.extend_from_slice(&chunk[..take]);
        self.dropped += (chunk.len() - take) as u64;
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn truncated(&self) -> bool {
        self.dropped > 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Shared by all commands of one session, so the cap covers the whole run.
#[derive(Debug)]
pub struct CaptureSink {
    stdout: Mutex<BoundedBuffer>,
    stderr: Mutex<BoundedBuffer>,
}

/// Point-in-time copy of both streams
#[derive(Debug, Clone, Default)]
pub struct CaptureSnapshot {
    pub stdout: BoundedBuffer,
    pub stderr: BoundedBuffer,
}

impl CaptureSink {
    pub fn new(cap_per_stream: usize) -> Self {
        Self {
            stdout: Mutex::new(BoundedBuffer::new(cap_per_stream)),
            stderr: Mutex::new(BoundedBuffer::new(cap_per_stream)),
        }
    }

    pub fn push(&self, stream: Stream, chunk: &[u8]) {
        match stream {
            Stream::Stdout => self.stdout.lock().push(chunk),
            Stream::Stderr => self.stderr.lock().push(chunk),
        }
    }

    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            stdout: self.stdout.lock().clone(),
            stderr: self.stderr.lock().clone(),
        }
    }
}
