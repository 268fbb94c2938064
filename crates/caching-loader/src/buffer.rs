//! Append-only in-memory buffer for a single resource.
//!
//! Bytes are appended strictly in stream order by the coordinator (which only accepts chunks
//! from the current download session), so the buffer is always a contiguous prefix
//! `[0, downloaded_length)` of the resource. It never shrinks and is never evicted.

use bytes::{Bytes, BytesMut};

use crate::error::{LoaderError, LoaderResult};

/// Resource metadata learned from the first response (or the seeded data).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceMetadata {
    /// Expected total length, if the server declared it.
    pub total_length: Option<u64>,
    /// MIME type reported to the player.
    pub content_type: Option<String>,
}

/// Growing buffer of downloaded bytes.
#[derive(Debug, Default)]
pub struct ByteRangeBuffer {
    data: BytesMut,
    metadata: Option<ResourceMetadata>,
}

impl ByteRangeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer seeded with a complete resource.
    pub fn seeded(data: &[u8], content_type: Option<String>) -> Self {
        let mut buffer = Self::new();
        buffer.append(data);
        buffer.metadata = Some(ResourceMetadata {
            total_length: Some(data.len() as u64),
            content_type,
        });
        buffer
    }

    /// Number of contiguous bytes buffered from offset 0.
    #[inline]
    pub fn downloaded_length(&self) -> u64 {
        self.data.len() as u64
    }

    /// Expected total length, once known.
    #[inline]
    pub fn total_length(&self) -> Option<u64> {
        self.metadata.as_ref().and_then(|m| m.total_length)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.content_type.as_deref())
    }

    pub fn metadata(&self) -> Option<&ResourceMetadata> {
        self.metadata.as_ref()
    }

    /// Whether the whole resource is buffered. False while the total length is unknown.
    pub fn is_complete(&self) -> bool {
        self.total_length()
            .is_some_and(|total| self.downloaded_length() >= total)
    }

    /// Append the next chunk of the stream.
    pub fn append(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    /// Copy of `[offset, offset + length)`.
    ///
    /// Fails with [`LoaderError::RangeUnavailable`] unless the whole range is buffered; the
    /// result is never padded or truncated.
    pub fn read(&self, offset: u64, length: u64) -> LoaderResult<Bytes> {
        let available = self.downloaded_length();
        let unavailable = || LoaderError::RangeUnavailable {
            offset,
            length,
            available,
        };
        let end = offset.checked_add(length).ok_or_else(unavailable)?;
        if end > available {
            return Err(unavailable());
        }
        // `end <= len`, so both bounds fit in usize.
        Ok(Bytes::copy_from_slice(
            &self.data[offset as usize..end as usize],
        ))
    }

    /// Everything buffered so far.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    /// Record the resource metadata.
    ///
    /// May be set once. Later calls (e.g. the response of a resumed download) must agree
    /// with what is recorded; values a later response does not carry are not a conflict,
    /// and values an earlier one did not carry are filled in.
    pub fn set_metadata(
        &mut self,
        total_length: Option<u64>,
        content_type: Option<String>,
    ) -> LoaderResult<()> {
        let current = self.metadata.get_or_insert_with(ResourceMetadata::default);

        if let (Some(old), Some(new)) = (current.total_length, total_length) {
            if old != new {
                return Err(LoaderError::MetadataConflict(format!(
                    "total length {old} != {new}"
                )));
            }
        }
        if let (Some(old), Some(new)) = (&current.content_type, &content_type) {
            if old != new {
                return Err(LoaderError::MetadataConflict(format!(
                    "content type {old} != {new}"
                )));
            }
        }
        // Fill in what an earlier response left out.
        if current.total_length.is_none() {
            current.total_length = total_length;
        }
        if current.content_type.is_none() {
            current.content_type = content_type;
        }
        Ok(())
    }

    /// Fix the total length at the downloaded length when the stream ended without ever
    /// declaring one.
    pub fn finalize_length(&mut self) {
        let len = self.downloaded_length();
        let metadata = self.metadata.get_or_insert_with(ResourceMetadata::default);
        if metadata.total_length.is_none() {
            metadata.total_length = Some(len);
        }
    }
}
