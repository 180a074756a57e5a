use std::collections::VecDeque;

use crate::error::{RawError, Result};

/// Ordered byte segments with a consumption offset into the head segment.
///
/// Holds output that could not be written synchronously, and input that was
/// received but not yet handed to the application.
#[derive(Debug, Default)]
pub struct BufList {
    segments: VecDeque<Vec<u8>>,
    offset: usize,
    len: usize,
    limit: Option<usize>,
}

impl BufList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the unconsumed bytes the list may hold; `None` lifts the cap.
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    /// Copies `data` onto the tail. Empty slices are ignored.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if let Some(limit) = self.limit {
            if self.len + data.len() > limit {
                return Err(RawError::Allocation(format!(
                    "{} buffered bytes would exceed the {} byte cap",
                    self.len + data.len(),
                    limit
                )));
            }
        }
        let mut segment = Vec::new();
        segment
            .try_reserve_exact(data.len())
            .map_err(|e| RawError::Allocation(e.to_string()))?;
        segment.extend_from_slice(data);
        self.segments.push_back(segment);
        self.len += data.len();
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Unconsumed bytes across all segments.
    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn segments(&self) -> usize {
        self.segments.len()
    }

    /// Unconsumed part of the head segment.
    pub fn head(&self) -> Option<&[u8]> {
        self.segments.front().map(|s| &s[self.offset..])
    }

    /// Marks `n` bytes consumed, possibly spanning segments. Returns the
    /// number of bytes left.
    pub fn consume(&mut self, mut n: usize) -> usize {
        while n > 0 {
            let Some(head) = self.segments.front() else {
                break;
            };
            let available = head.len() - self.offset;
            if n < available {
                self.offset += n;
                self.len -= n;
                break;
            }
            n -= available;
            self.len -= available;
            self.offset = 0;
            self.segments.pop_front();
        }
        self.len
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.offset = 0;
        self.len = 0;
    }
}
