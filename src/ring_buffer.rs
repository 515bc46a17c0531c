//! Chunked byte queue backing the PTY read and write buffers.
//!
//! Data is appended at the tail and consumed at the head without ever
//! shifting unconsumed bytes. Storage is a list of chunks: the first chunk is
//! readable from `head`, the last one is filled up to `tail`, and every chunk
//! in between is full. Reservations hand out a contiguous slice, so a
//! `read(2)` can land directly in the buffer and be trimmed afterwards with
//! [`RingBuffer::unreserve`] when the kernel returned fewer bytes.

use std::collections::VecDeque;

/// Default chunk capacity. Larger reservations get an oversized chunk.
pub const CHUNK_SIZE: usize = 4096;

/// A growable queue of byte chunks
#[derive(Debug)]
pub struct RingBuffer {
    chunks: VecDeque<Vec<u8>>,
    /// Read offset into the first chunk
    head: usize,
    /// Write offset into the last chunk
    tail: usize,
    /// Readable bytes across all chunks
    total: usize,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RingBuffer {
    /// Create an empty buffer holding a single chunk
    pub fn new() -> Self {
        let mut chunks = VecDeque::with_capacity(4);
        chunks.push_back(vec![0; CHUNK_SIZE]);
        Self {
            chunks,
            head: 0,
            tail: 0,
            total: 0,
        }
    }

    /// Drop all data and go back to a single empty chunk
    pub fn clear(&mut self) {
        self.chunks.truncate(1);
        self.reset_single();
    }

    fn reset_single(&mut self) {
        debug_assert_eq!(self.chunks.len(), 1);
        if let Some(chunk) = self.chunks.front_mut() {
            chunk.resize(CHUNK_SIZE, 0);
            chunk.shrink_to(CHUNK_SIZE);
        }
        self.head = 0;
        self.tail = 0;
        self.total = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.len() == 1 && self.tail == 0
    }

    /// Number of readable bytes
    pub fn len(&self) -> usize {
        self.total
    }

    /// Number of chunks currently allocated
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Size of the contiguous readable span at the head
    pub fn read_size(&self) -> usize {
        let end = if self.chunks.len() == 1 {
            self.tail
        } else {
            self.chunks[0].len()
        };
        end - self.head
    }

    /// The contiguous readable span at the head
    pub fn read_slice(&self) -> &[u8] {
        let size = self.read_size();
        &self.chunks[0][self.head..self.head + size]
    }

    /// Consume `bytes` from the head, releasing exhausted chunks.
    pub fn free(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.total, "free past end of buffer");
        let mut bytes = bytes.min(self.total);
        self.total -= bytes;

        loop {
            let nbs = self.read_size();

            if bytes < nbs {
                self.head += bytes;
                break;
            }

            bytes -= nbs;
            if self.chunks.len() == 1 {
                self.reset_single();
                break;
            }

            self.chunks.pop_front();
            self.head = 0;
        }
    }

    /// Grow the buffer by `bytes` and return the slice to fill.
    ///
    /// The returned slice is contiguous. When the last chunk lacks room it is
    /// trimmed to its filled part and a new chunk of at least [`CHUNK_SIZE`]
    /// bytes is appended.
    pub fn reserve(&mut self, bytes: usize) -> &mut [u8] {
        if self.is_empty() && bytes > CHUNK_SIZE {
            self.chunks[0] = vec![0; bytes];
            self.head = 0;
        }

        self.total += bytes;

        let last = self.chunks.len() - 1;
        if self.tail + bytes <= self.chunks[last].len() {
            let start = self.tail;
            self.tail += bytes;
            return &mut self.chunks[last][start..start + bytes];
        }

        let tail = self.tail;
        self.chunks[last].truncate(tail);
        self.chunks.push_back(vec![0; bytes.max(CHUNK_SIZE)]);
        self.tail = bytes;
        &mut self.chunks[last + 1][..bytes]
    }

    /// Give back the trailing `bytes` of the most recent reservation.
    pub fn unreserve(&mut self, bytes: usize) {
        let bytes = bytes.min(self.tail).min(self.total);
        self.total -= bytes;
        self.tail -= bytes;

        if self.tail == 0 && self.chunks.len() > 1 {
            self.chunks.pop_back();
            self.tail = self.chunks[self.chunks.len() - 1].len();
        }
        if self.total == 0 {
            self.chunks.truncate(1);
            self.reset_single();
        }
    }

    /// Append a copy of `data`
    pub fn write(&mut self, data: &[u8]) {
        self.reserve(data.len()).copy_from_slice(data);
    }

    /// Copy up to `dst.len()` bytes out of the buffer and consume them.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let to_read = self.total.min(dst.len());
        let mut done = 0;
        while done < to_read {
            let bs = (to_read - done).min(self.read_size());
            dst[done..done + bs].copy_from_slice(&self.read_slice()[..bs]);
            done += bs;
            self.free(bs);
        }
        done
    }

    /// Find the first `byte` within `max_len` bytes of the head.
    ///
    /// Returns the index just past the match. If the scan reaches `max_len`
    /// before running out of data, `Some(max_len)` is returned so the caller
    /// can consume a bounded prefix. `None` means the whole buffer was
    /// scanned without a match.
    pub fn index_after(&self, byte: u8, max_len: usize) -> Option<usize> {
        let mut index = 0;
        let mut remaining = max_len;
        let mut start = self.head;
        let last = self.chunks.len() - 1;

        for (i, chunk) in self.chunks.iter().enumerate() {
            if remaining == 0 {
                return Some(index);
            }
            if index == self.total {
                return None;
            }
            let end = if i == last { self.tail } else { chunk.len() };
            let len = (end - start).min(remaining);
            if let Some(pos) = chunk[start..start + len].iter().position(|&b| b == byte) {
                return Some(index + pos + 1);
            }
            index += len;
            remaining -= len;
            start = 0;
        }

        if remaining == 0 {
            Some(index)
        } else {
            None
        }
    }

    /// Length of the first line including its `\n`, bounded by `max_len`
    pub fn line_size(&self, max_len: usize) -> Option<usize> {
        self.index_after(b'\n', max_len)
    }

    pub fn can_read_line(&self) -> bool {
        self.line_size(usize::MAX).is_some()
    }

    /// Read one line, or at most `dst.len()` bytes of it.
    pub fn read_line(&mut self, dst: &mut [u8]) -> usize {
        let limit = dst.len().min(self.total);
        match self.line_size(limit) {
            Some(n) => self.read(&mut dst[..n]),
            None => 0,
        }
    }

    /// Drain every readable byte
    pub fn read_all(&mut self) -> Vec<u8> {
        let mut out = vec![0; self.total];
        let n = self.read(&mut out);
        out.truncate(n);
        out
    }
}
