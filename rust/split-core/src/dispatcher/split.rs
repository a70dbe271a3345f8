// rust/split-core/src/dispatcher/split.rs

use std::fmt;

use serde::{Deserialize, Serialize};

/// Depth-first ordinal of a source node among the splittable sources of a
/// pipeline, following [`PipelineNode::split_children`](crate::pipeline::PipelineNode::split_children).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub u32);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source-{}", self.0)
    }
}

/// Half-open range of element indices within one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRange {
    /// Start index (inclusive).
    pub start: u64,
    /// End index (exclusive).
    pub end: u64,
}

impl IndexRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of indices in this range.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keeps at most `max` indices from the front of the range.
    pub fn truncate(&mut self, max: u64) {
        self.end = self.end.min(self.start.saturating_add(max));
    }
}

/// An atomic unit of work: a contiguous index range of one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    /// Job-unique id, used to complete the lease.
    pub id: u64,
    pub source: SourceId,
    /// Epoch path of the request this split was issued for.
    pub epoch: Vec<u64>,
    pub range: IndexRange,
    /// Position of the split within its source's pass.
    pub ordinal: u64,
    /// Number of earlier deliveries that were released before completion.
    pub attempt: u32,
}

/// A worker's request for the next split of one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRequest {
    pub source: SourceId,
    /// One iteration counter per enclosing repeat, outermost first.
    pub epoch: Vec<u64>,
}

impl SplitRequest {
    pub fn new(source: SourceId, epoch: Vec<u64>) -> Self {
        Self { source, epoch }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitResponse {
    Split(Split),
    /// The source has nothing more for the requested epoch.
    EndOfEpoch,
    /// Another worker still holds a split of this source; ask again later.
    Retry,
    /// The job is over; no request will produce splits again.
    EndOfJob,
}

impl SplitResponse {
    pub fn into_split(self) -> Option<Split> {
        match self {
            SplitResponse::Split(split) => Some(split),
            _ => None,
        }
    }
}

/// Lazily divides `len` indices into consecutive chunks of `split_size`.
///
/// The last chunk may be shorter. Yields nothing for an empty source or a
/// zero split size.
#[derive(Debug, Clone)]
pub struct SplitChunks {
    len: u64,
    split_size: u64,
    next_start: u64,
}

impl SplitChunks {
    pub fn new(len: u64, split_size: u64) -> Self {
        Self {
            len,
            split_size,
            next_start: 0,
        }
    }

    /// Whether every chunk has been handed out.
    pub fn is_done(&self) -> bool {
        self.split_size == 0 || self.next_start >= self.len
    }

    /// Number of chunks handed out so far.
    pub fn issued(&self) -> u64 {
        if self.split_size == 0 {
            return 0;
        }
        self.next_start.div_ceil(self.split_size)
    }

    /// Starts over from index 0.
    pub fn reset(&mut self) {
        self.next_start = 0;
    }
}

impl Iterator for SplitChunks {
    type Item = IndexRange;

    fn next(&mut self) -> Option<IndexRange> {
        if self.is_done() {
            return None;
        }
        let start = self.next_start;
        let end = start.saturating_add(self.split_size).min(self.len);
        self.next_start = end;
        Some(IndexRange::new(start, end))
    }
}

/// Divides `len` indices into consecutive chunks of `split_size`.
pub fn calculate_splits(len: u64, split_size: u64) -> Vec<IndexRange> {
    SplitChunks::new(len, split_size).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_calculate_splits_single_index() {
        let ranges = calculate_splits(4, 1);
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[3], IndexRange::new(3, 4));
    }

    #[test]
    fn test_calculate_splits_uneven() {
        let ranges = calculate_splits(10, 4);
        assert_eq!(
            ranges,
            vec![IndexRange::new(0, 4), IndexRange::new(4, 8), IndexRange::new(8, 10)]
        );
    }

    #[test]
    fn test_calculate_splits_edge_cases() {
        assert!(calculate_splits(0, 4).is_empty());
        assert!(calculate_splits(10, 0).is_empty());
        assert_eq!(calculate_splits(3, 100), vec![IndexRange::new(0, 3)]);
    }

    #[test]
    fn test_index_range_truncate() {
        let mut r = IndexRange::new(5, 10);
        r.truncate(2);
        assert_eq!(r, IndexRange::new(5, 7));
        r.truncate(0);
        assert!(r.is_empty());
    }

    #[test]
    fn test_split_chunks_reset() {
        let mut chunks = SplitChunks::new(5, 2);
        assert_eq!(chunks.next(), Some(IndexRange::new(0, 2)));
        assert_eq!(chunks.issued(), 1);
        chunks.by_ref().for_each(drop);
        assert!(chunks.is_done());
        assert_eq!(chunks.issued(), 3);

        chunks.reset();
        assert!(!chunks.is_done());
        assert_eq!(chunks.next(), Some(IndexRange::new(0, 2)));
    }

    proptest! {
        #[test]
        fn prop_splits_cover_every_index_once(len in 0u64..5_000, split_size in 1u64..300) {
            let ranges = calculate_splits(len, split_size);

            let total: u64 = ranges.iter().map(|r| r.len()).sum();
            prop_assert_eq!(total, len);
            prop_assert!(ranges.iter().all(|r| !r.is_empty() && r.len() <= split_size));
            prop_assert!(ranges.windows(2).all(|w| w[0].end == w[1].start));
            if let (Some(first), Some(last)) = (ranges.first(), ranges.last()) {
                prop_assert_eq!(first.start, 0);
                prop_assert_eq!(last.end, len);
            }
        }
    }
}
