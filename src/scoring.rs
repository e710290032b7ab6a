//! Per-read duplicate scores
//!
//! The highest-scoring member of a duplicate group is kept. Pair ends add the
//! scores of both mates.

use clap::ValueEnum;

use crate::read::AlignedRead;

/// Bases below this quality do not count towards the score.
pub const MIN_BASE_QUALITY: u8 = 15;

/// Per-read ceiling, so a pair sum always fits in an `i16`.
pub const MAX_READ_SCORE: u32 = (i16::MAX / 2) as u32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ScoringStrategy {
    /// Sum of base qualities at or above Q15
    #[default]
    SumOfBaseQualities,
    /// Number of reference bases covered by the alignment
    TotalMappedReferenceLength,
}

impl ScoringStrategy {
    pub fn score<R: AlignedRead>(self, read: &R) -> std::io::Result<u32> {
        let score = match self {
            Self::SumOfBaseQualities => read.base_quality_sum(MIN_BASE_QUALITY),
            Self::TotalMappedReferenceLength => {
                if read.flags().is_unmapped() {
                    0
                } else {
                    read.reference_length()?
                }
            }
        };
        Ok(score.min(MAX_READ_SCORE))
    }
}
