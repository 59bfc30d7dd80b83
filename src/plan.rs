use crate::error::CoreError;
use serde::{Deserialize, Serialize};

/// One fixed-size (except possibly the last) contiguous byte range of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkDescriptor {
    pub fn length(&self) -> u64 {
        self.end - self.start
    }
}

/// Deterministic mapping of `(file_size, chunk_size)` onto an ordered
/// sequence of chunk descriptors. Pure, no I/O; identical inputs always
/// produce a byte-identical plan, which is what makes resumption across
/// restarts safe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub descriptors: Vec<ChunkDescriptor>,
}

impl ChunkPlan {
    /// A zero-length file produces a single zero-length descriptor rather
    /// than an empty plan: the resumption protocol always expects at least
    /// one chunk POST (or a probe-reported `exists:true`) before it will
    /// issue commit, and the server side shares this convention.
    pub fn new(file_size: u64, chunk_size: u64) -> Result<Self, CoreError> {
        if chunk_size == 0 {
            return Err(CoreError::InvalidArgument(
                "chunk_size must be greater than zero".into(),
            ));
        }

        if file_size == 0 {
            return Ok(Self {
                file_size,
                chunk_size,
                total_chunks: 1,
                descriptors: vec![ChunkDescriptor {
                    index: 0,
                    start: 0,
                    end: 0,
                }],
            });
        }

        let total_chunks = file_size.div_ceil(chunk_size);
        let total_chunks = u32::try_from(total_chunks).map_err(|_| {
            CoreError::InvalidArgument("file produces too many chunks to index with u32".into())
        })?;

        let mut descriptors = Vec::with_capacity(total_chunks as usize);
        for index in 0..total_chunks {
            let start = index as u64 * chunk_size;
            let end = std::cmp::min(start + chunk_size, file_size);
            descriptors.push(ChunkDescriptor { index, start, end });
        }

        Ok(Self {
            file_size,
            chunk_size,
            total_chunks,
            descriptors,
        })
    }

    pub fn remaining(&self, uploaded: &std::collections::BTreeSet<u32>) -> Vec<ChunkDescriptor> {
        self.descriptors
            .iter()
            .copied()
            .filter(|d| !uploaded.contains(&d.index))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_file_exactly() {
        let plan = ChunkPlan::new(10, 4).unwrap();
        assert_eq!(plan.total_chunks, 3);
        assert_eq!(plan.descriptors[0], ChunkDescriptor { index: 0, start: 0, end: 4 });
        assert_eq!(plan.descriptors[1], ChunkDescriptor { index: 1, start: 4, end: 8 });
        assert_eq!(plan.descriptors[2], ChunkDescriptor { index: 2, start: 8, end: 10 });
        assert_eq!(plan.descriptors[2].length(), 2);
    }

    #[test]
    fn exact_multiple_has_uniform_lengths() {
        let plan = ChunkPlan::new(8, 4).unwrap();
        assert_eq!(plan.total_chunks, 2);
        assert!(plan.descriptors.iter().all(|d| d.length() == 4));
    }

    #[test]
    fn zero_length_file_is_one_empty_chunk() {
        let plan = ChunkPlan::new(0, 4).unwrap();
        assert_eq!(plan.total_chunks, 1);
        assert_eq!(plan.descriptors[0].length(), 0);
    }

    #[test]
    fn rejects_zero_chunk_size() {
        assert!(matches!(
            ChunkPlan::new(10, 0),
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn deterministic_across_invocations() {
        let a = ChunkPlan::new(1_000_003, 65_536).unwrap();
        let b = ChunkPlan::new(1_000_003, 65_536).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn remaining_excludes_uploaded_indices() {
        let plan = ChunkPlan::new(12, 4).unwrap();
        let mut uploaded = std::collections::BTreeSet::new();
        uploaded.insert(0);
        uploaded.insert(2);
        let remaining = plan.remaining(&uploaded);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].index, 1);
    }
}
