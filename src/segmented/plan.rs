//! Byte-range planning for segmented downloads.
//!
//! A [`SegmentPlan`] is derived once from the remote content length and a
//! [`SplitApproach`]. Its segments partition `[0, content_length)` in
//! ascending order with no gaps or overlaps.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::debug;

use crate::transport::{ByteRange, new_correlation_id};

/// Smallest chunk worth a separate request (256 KiB).
pub const MIN_CHUNK_SIZE: u64 = 256 * 1024;

/// Chunk size used by size-based splitting (5 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Segment count used when none is given.
pub const DEFAULT_SEGMENTS: u64 = 100;

/// Hard cap on the number of segments.
pub const MAX_SEGMENTS: u64 = 200;

/// Below this length `Auto` splits by count, above it by size.
const AUTO_SIZE_THRESHOLD: u64 = 10 * DEFAULT_CHUNK_SIZE;

/// How the content is divided into segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitApproach {
    /// Pick count or size splitting from the content length.
    #[default]
    Auto,
    /// `param` segments, reduced so no chunk falls under 256 KiB.
    ByCount,
    /// Chunks of `param` bytes, never under 5 MiB.
    BySize,
    /// Exactly `param` segments regardless of chunk size.
    ByQuantity,
}

impl fmt::Display for SplitApproach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::ByCount => "count",
            Self::BySize => "size",
            Self::ByQuantity => "quantity",
        };
        f.write_str(name)
    }
}

impl FromStr for SplitApproach {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "count" | "by-count" => Ok(Self::ByCount),
            "size" | "by-size" => Ok(Self::BySize),
            "quantity" | "by-quantity" => Ok(Self::ByQuantity),
            other => Err(format!(
                "unknown split approach '{other}' (expected auto, count, size or quantity)"
            )),
        }
    }
}

/// One planned byte range and the temp file it downloads into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSpec {
    /// Position in the merge order.
    pub index: usize,
    /// First byte.
    pub byte_start: u64,
    /// Last byte (inclusive).
    pub byte_end: u64,
    /// Temp file receiving this range.
    pub temp_path: PathBuf,
    /// Correlation id of the segment request.
    pub correlation_id: String,
}

impl SegmentSpec {
    /// Number of bytes in the segment.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.byte_end - self.byte_start + 1
    }

    /// Segments are never empty; provided for API symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Byte range requested for this segment.
    #[must_use]
    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.byte_start, self.byte_end)
    }

    /// The same range against a fresh temp file, for the retry round.
    #[must_use]
    pub fn for_retry(&self) -> Self {
        Self {
            temp_path: with_suffix(&self.temp_path, ".retry"),
            correlation_id: new_correlation_id(),
            ..self.clone()
        }
    }
}

/// Ordered segments covering a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    content_length: u64,
    chunk_size: u64,
    segments: Vec<SegmentSpec>,
}

impl SegmentPlan {
    /// Total bytes covered.
    #[must_use]
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Nominal chunk size (the last segment may be shorter).
    #[must_use]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Segments in ascending order.
    #[must_use]
    pub fn segments(&self) -> &[SegmentSpec] {
        &self.segments
    }

    /// Number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the plan has no segments (only for a zero length).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Plans the segments of a `content_length`-byte resource saved to `target`.
///
/// A zero `param` selects the approach's default. Temp files are named
/// `<target>.part<index>`.
#[must_use]
pub fn plan_segments(
    content_length: u64,
    approach: SplitApproach,
    param: u64,
    target: &Path,
) -> SegmentPlan {
    if content_length == 0 {
        return SegmentPlan {
            content_length,
            chunk_size: 0,
            segments: Vec::new(),
        };
    }

    let mut count = segment_count(content_length, approach, param);
    if content_length < MIN_CHUNK_SIZE {
        count = 1;
    }
    let count = count.clamp(1, MAX_SEGMENTS);
    let chunk_size = content_length.div_ceil(count);

    let segments: Vec<SegmentSpec> = (0..count)
        .map(|i| i * chunk_size)
        .take_while(|&start| start < content_length)
        .enumerate()
        .map(|(index, start)| SegmentSpec {
            index,
            byte_start: start,
            byte_end: (start + chunk_size).min(content_length) - 1,
            temp_path: with_suffix(target, &format!(".part{index}")),
            correlation_id: new_correlation_id(),
        })
        .collect();

    debug!(
        content_length,
        %approach,
        param,
        chunk_size,
        segments = segments.len(),
        "planned segments"
    );

    SegmentPlan {
        content_length,
        chunk_size,
        segments,
    }
}

fn segment_count(content_length: u64, approach: SplitApproach, param: u64) -> u64 {
    let or_default = |value: u64| if value == 0 { DEFAULT_SEGMENTS } else { value };
    match approach {
        SplitApproach::ByCount => {
            let count = or_default(param);
            if content_length / count < MIN_CHUNK_SIZE {
                (content_length / MIN_CHUNK_SIZE).max(1)
            } else {
                count
            }
        }
        SplitApproach::BySize => content_length.div_ceil(param.max(DEFAULT_CHUNK_SIZE)),
        SplitApproach::ByQuantity => or_default(param),
        SplitApproach::Auto if content_length < AUTO_SIZE_THRESHOLD => {
            (content_length / MIN_CHUNK_SIZE).clamp(1, DEFAULT_SEGMENTS)
        }
        SplitApproach::Auto => content_length.div_ceil(DEFAULT_CHUNK_SIZE),
    }
}

pub(super) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
