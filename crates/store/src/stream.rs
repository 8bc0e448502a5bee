//! Ranged assembly of completed files from their chunk blobs.
//!
//! A completed file is never materialized on disk; reads walk the
//! manifest's ordered chunk hashes and pull each blob (or only the
//! overlapping slice of it) on demand, so memory stays bounded by one
//! chunk regardless of file size.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use crate::blob::BlobStore;
use crate::error::ServiceError;
use crate::meta::Manifest;

/// An inclusive byte range in absolute file offsets, per
/// `Range: bytes=start-end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered (inclusive bounds, never zero).
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parses `bytes=start-end` / `bytes=start-` against a file of
/// `file_size` bytes.
///
/// An over-long `end` clamps to the last byte (RFC 7233); a start at
/// or past the end of the file, suffix forms (`bytes=-n`), multiple
/// ranges, and malformed specs are not satisfiable.
pub fn parse_range(spec: &str, file_size: u64) -> Result<ByteRange, ServiceError> {
    let unsatisfiable = |detail: &str| ServiceError::RangeNotSatisfiable(format!("{spec:?}: {detail}"));

    let rest = spec
        .strip_prefix("bytes=")
        .ok_or_else(|| unsatisfiable("missing bytes= prefix"))?;
    if rest.contains(',') {
        return Err(unsatisfiable("multiple ranges are not supported"));
    }
    let (start_str, end_str) = rest
        .split_once('-')
        .ok_or_else(|| unsatisfiable("missing range separator"))?;
    if start_str.is_empty() {
        return Err(unsatisfiable("suffix ranges are not supported"));
    }

    let start: u64 = start_str
        .trim()
        .parse()
        .map_err(|_| unsatisfiable("invalid start offset"))?;
    if file_size == 0 || start >= file_size {
        return Err(unsatisfiable("start beyond end of file"));
    }

    let end = if end_str.trim().is_empty() {
        file_size - 1
    } else {
        let end: u64 = end_str
            .trim()
            .parse()
            .map_err(|_| unsatisfiable("invalid end offset"))?;
        if end < start {
            return Err(unsatisfiable("end before start"));
        }
        end.min(file_size - 1)
    };

    Ok(ByteRange { start, end })
}

/// One piece of the response: a slice `[start, end)` of the blob
/// stored under `hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamPart {
    hash: String,
    start: u64,
    end: u64,
}

/// Lazily-pulled byte stream over the ordered chunk blobs of a
/// completed file.
pub struct FileStream {
    blob: Arc<dyn BlobStore>,
    parts: VecDeque<StreamPart>,
    /// 200 for a full read, 206 for a partial one.
    pub status_code: u16,
    /// Exact body length in bytes.
    pub content_length: u64,
    /// `bytes start-end/total` when partial.
    pub content_range: Option<String>,
    pub mime_type: String,
    pub total_size: u64,
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream")
            .field("parts", &self.parts)
            .field("status_code", &self.status_code)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .field("mime_type", &self.mime_type)
            .field("total_size", &self.total_size)
            .finish()
    }
}

/// Advertised value for the `Accept-Ranges` surface.
pub const ACCEPT_RANGES: &str = "bytes";

impl FileStream {
    /// Plans a stream over `manifest`, optionally restricted to
    /// `range` (absolute inclusive offsets, already validated against
    /// the file size).
    pub(crate) fn plan(
        blob: Arc<dyn BlobStore>,
        manifest: &Manifest,
        range: Option<ByteRange>,
    ) -> Result<Self, ServiceError> {
        let (read_start, read_end_incl, partial) = match range {
            Some(r) => (r.start, r.end, true),
            None => (0, manifest.file_size.saturating_sub(1), false),
        };

        let mut parts = VecDeque::new();
        if manifest.file_size > 0 {
            for (index, slot) in manifest.chunks.iter().enumerate() {
                let hash = slot.as_ref().ok_or_else(|| {
                    ServiceError::Storage(format!(
                        "manifest {} is completed but chunk {index} is missing",
                        manifest.file_id
                    ))
                })?;
                let (chunk_start, chunk_end) = manifest.chunk_span(index);
                // Overlap of [chunk_start, chunk_end) with the
                // requested [read_start, read_end_incl].
                let lo = chunk_start.max(read_start);
                let hi = chunk_end.min(read_end_incl + 1);
                if lo < hi {
                    parts.push_back(StreamPart {
                        hash: hash.clone(),
                        start: lo - chunk_start,
                        end: hi - chunk_start,
                    });
                }
            }
        }

        let content_length = if manifest.file_size == 0 {
            0
        } else {
            read_end_incl - read_start + 1
        };
        Ok(Self {
            blob,
            parts,
            status_code: if partial { 206 } else { 200 },
            content_length,
            content_range: partial.then(|| {
                format!(
                    "bytes {read_start}-{read_end_incl}/{}",
                    manifest.file_size
                )
            }),
            mime_type: manifest.mime_type.clone(),
            total_size: manifest.file_size,
        })
    }

    /// Pulls the next block of bytes; `None` once drained.
    pub fn next_block(&mut self) -> Option<Result<Bytes, ServiceError>> {
        let part = self.parts.pop_front()?;
        let result = self
            .blob
            .read(&part.hash, Some((part.start, part.end)))
            .map_err(|e| ServiceError::Storage(e.to_string()));
        Some(result)
    }

    /// Drains the stream into one buffer. Convenient for tests and
    /// small files; large files should pull block by block.
    pub fn read_to_end(mut self) -> Result<Vec<u8>, ServiceError> {
        let mut out = Vec::with_capacity(self.content_length as usize);
        while let Some(block) = self.next_block() {
            out.extend_from_slice(&block?);
        }
        Ok(out)
    }
}
