//! Registry of player reads that could not be served from the buffer yet.
//!
//! Requests are kept ordered by their start offset so that the read closest to the playback
//! position is serviced first. Reads are non-exclusive: two requests covering the same bytes
//! both receive them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::buffer::ByteRangeBuffer;

/// Identifier of a pending range read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// A registered read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: RequestId,
    pub requested_offset: u64,
    /// `None` reads to the end of the resource.
    pub requested_length: Option<u64>,
    /// How much of the range has become available so far.
    pub bytes_delivered_so_far: u64,
}

impl PendingRequest {
    /// Exclusive end of the range, clamped to `total_length` when known.
    ///
    /// `None` while the read is open-ended and the total length is unknown.
    pub fn requested_end(&self, total_length: Option<u64>) -> Option<u64> {
        resolve_end(self.requested_offset, self.requested_length, total_length)
    }
}

/// Exclusive end of `[offset, offset + length)`, clamped to `total_length` when known.
pub(crate) fn resolve_end(offset: u64, length: Option<u64>, total_length: Option<u64>) -> Option<u64> {
    let end = match (length, total_length) {
        (Some(len), Some(total)) => offset.saturating_add(len).min(total),
        (Some(len), None) => offset.saturating_add(len),
        (None, Some(total)) => total,
        (None, None) => return None,
    };
    Some(end.max(offset))
}

/// Progress made by one pending request during [`PendingRequestRegistry::advance_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    pub id: RequestId,
    /// Start of the range.
    pub offset: u64,
    /// Final length of the range. Only meaningful once `satisfied`.
    pub length: u64,
    /// Bytes of the range that became available since the previous advance.
    pub newly_available: u64,
    /// The whole range is buffered; the request has been removed.
    pub satisfied: bool,
}

/// Outstanding player reads, ordered by offset.
#[derive(Debug, Default)]
pub struct PendingRequestRegistry {
    next_id: u64,
    by_offset: BTreeMap<(u64, RequestId), PendingRequest>,
    offsets: HashMap<RequestId, u64>,
}

impl PendingRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_offset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_offset.is_empty()
    }

    pub fn get(&self, id: RequestId) -> Option<&PendingRequest> {
        let offset = *self.offsets.get(&id)?;
        self.by_offset.get(&(offset, id))
    }

    /// Register a read and return its id.
    pub fn register(&mut self, offset: u64, length: Option<u64>) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        self.by_offset.insert(
            (offset, id),
            PendingRequest {
                id,
                requested_offset: offset,
                requested_length: length,
                bytes_delivered_so_far: 0,
            },
        );
        self.offsets.insert(id, offset);
        id
    }

    /// Remove a read. Returns `false` if it was unknown (already satisfied or cancelled).
    pub fn cancel(&mut self, id: RequestId) -> bool {
        match self.offsets.remove(&id) {
            Some(offset) => self.by_offset.remove(&(offset, id)).is_some(),
            None => false,
        }
    }

    /// Remove and return every read, in offset order.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.offsets.clear();
        std::mem::take(&mut self.by_offset).into_values().collect()
    }

    /// Re-evaluate every read against the buffer, lowest offset first.
    ///
    /// Reads whose whole range is now buffered are removed and reported as `satisfied`.
    /// Reads that merely gained bytes stay registered. Reads that made no progress are not
    /// reported.
    pub fn advance_all(&mut self, buffer: &ByteRangeBuffer) -> Vec<Advance> {
        self.advance(buffer.downloaded_length(), buffer.total_length())
    }

    /// Like [`advance_all`](Self::advance_all), but treats the buffered prefix as the whole
    /// resource: every read is satisfied, clamped to what is buffered.
    pub fn resolve_all(&mut self, downloaded_length: u64) -> Vec<Advance> {
        self.advance(downloaded_length, Some(downloaded_length))
    }

    fn advance(&mut self, downloaded: u64, total: Option<u64>) -> Vec<Advance> {
        let mut out = Vec::new();
        let mut done = Vec::new();

        for (key, req) in self.by_offset.iter_mut() {
            let end = req.requested_end(total);
            let available_end = end.map_or(downloaded, |end| end.min(downloaded));
            let available = available_end.saturating_sub(req.requested_offset);
            let newly_available = available.saturating_sub(req.bytes_delivered_so_far);
            // A read starting at or past the end of the resource is satisfied by zero bytes.
            let past_end = total.is_some_and(|total| req.requested_offset >= total);
            let satisfied = end.is_some_and(|end| end <= downloaded) || past_end;

            if newly_available == 0 && !satisfied {
                continue;
            }
            req.bytes_delivered_so_far = available;

            out.push(Advance {
                id: req.id,
                offset: req.requested_offset,
                length: end.map_or(available, |end| end - req.requested_offset),
                newly_available,
                satisfied,
            });
            if satisfied {
                done.push(*key);
            }
        }

        for key in done {
            self.by_offset.remove(&key);
            self.offsets.remove(&key.1);
        }
        out
    }
}
