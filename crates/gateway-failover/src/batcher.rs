//! Groups chunks so a worker publishes several per round trip.
//!
//! A batch is released when it reaches the size limit or when its oldest
//! chunk has waited for the flush interval, whichever comes first.

use gateway_core::StreamChunk;
use std::time::Duration;
use tokio::time::Instant;

/// Size- and time-bounded chunk buffer
#[derive(Debug)]
pub struct ChunkBatcher {
    batch_size: usize,
    flush_interval: Duration,
    buffer: Vec<StreamChunk>,
    started: Option<Instant>,
}

impl ChunkBatcher {
    /// Create a batcher; a batch size of 0 is treated as 1
    #[must_use]
    pub fn new(batch_size: usize, flush_interval: Duration) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            flush_interval,
            buffer: Vec::with_capacity(batch_size),
            started: None,
        }
    }

    /// Buffer a chunk; returns a full batch when the size limit is reached
    pub fn push(&mut self, chunk: StreamChunk) -> Option<Vec<StreamChunk>> {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
        self.buffer.push(chunk);
        if self.buffer.len() >= self.batch_size {
            self.take()
        } else {
            None
        }
    }

    /// When the buffered batch must be flushed, if anything is buffered
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.started.map(|started| started + self.flush_interval)
    }

    /// Drain whatever is buffered
    pub fn take(&mut self) -> Option<Vec<StreamChunk>> {
        self.started = None;
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::replace(
                &mut self.buffer,
                Vec::with_capacity(self.batch_size),
            ))
        }
    }

    /// Chunks currently buffered
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
