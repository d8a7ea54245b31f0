//! # Chunk Buffer
//!
//! Accumulates the binary fragments of one session until the session decides
//! to drain them. Fragments are opaque: they are concatenated in arrival order
//! and never parsed, so a drain hands the model exactly the bytes the client
//! sent since the previous drain.
//!
//! ## Rust Concepts:
//! - **`std::mem::take`**: swaps the accumulated bytes out for an empty `Vec`,
//!   so draining is O(1) and the buffer is immediately reusable
//! - **Single owner**: each session owns its buffer outright; no locking needed

/// Ordered accumulation of binary audio fragments for one session.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    data: Vec<u8>,
    /// Fragments appended since the last drain
    chunk_count: usize,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one fragment.
    ///
    /// Zero-length fragments are ignored (warning logged) and do not count
    /// towards the drain threshold. Returns whether the fragment was kept.
    pub fn append(&mut self, fragment: &[u8]) -> bool {
        if fragment.is_empty() {
            tracing::warn!("Ignoring zero-length audio fragment");
            return false;
        }
        self.data.extend_from_slice(fragment);
        self.chunk_count += 1;
        true
    }

    /// True once `threshold` fragments have arrived since the last drain.
    pub fn should_flush(&self, threshold: usize) -> bool {
        self.chunk_count >= threshold
    }

    /// Take everything accumulated so far and reset the fragment counter.
    pub fn drain(&mut self) -> Vec<u8> {
        self.chunk_count = 0;
        std::mem::take(&mut self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }
}
