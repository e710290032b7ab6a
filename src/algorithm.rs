//! Duplicate selection over sorted read ends
//!
//! Adjacent comparable ends form a duplicate set. Within a set of pair ends
//! the highest-scoring pair is kept and both reads of every other pair are
//! marked. Fragment ends are marked only when the set contains at least one
//! read without a mapped mate: if a paired read shares the position, every
//! unpaired read is marked; otherwise all but the best unpaired read are.

use anyhow::Result;

use crate::errors::MarkDupError;
use crate::library::LibraryIdGenerator;
use crate::optical::{OpticalDuplicateFinder, track_optical_duplicates};
use crate::read_ends::ReadEnd;
use crate::spool::IndexSpool;

/// Whether two ends belong to the same duplicate set.
///
/// Fragments compare library, barcodes and the read-1 position and strand;
/// pairs also compare the read-2 position.
pub fn are_comparable(lhs: &ReadEnd, rhs: &ReadEnd, compare_read2: bool) -> bool {
    let same = lhs.library_id == rhs.library_id
        && lhs.barcodes == rhs.barcodes
        && lhs.read1_reference_index == rhs.read1_reference_index
        && lhs.read1_coordinate == rhs.read1_coordinate
        && lhs.orientation == rhs.orientation;

    same && (!compare_read2
        || (lhs.read2_reference_index == rhs.read2_reference_index
            && lhs.read2_coordinate == rhs.read2_coordinate))
}

/// Position of the first end with the highest score.
fn best_end(group: &[ReadEnd]) -> usize {
    let mut best = 0;
    for (i, end) in group.iter().enumerate().skip(1) {
        if end.score > group[best].score {
            best = i;
        }
    }
    best
}

/// Mark both reads of every pair except the best one.
///
/// Returns the number of pairs marked.
pub fn mark_duplicate_pairs(
    group: &[ReadEnd],
    indices: &mut IndexSpool,
) -> Result<u64, MarkDupError> {
    let best = best_end(group);
    let mut marked = 0;
    for (i, end) in group.iter().enumerate() {
        if i != best {
            indices.add(end.read1_index_in_file)?;
            indices.add(end.read2_index_in_file)?;
            marked += 1;
        }
    }
    Ok(marked)
}

/// Mark unpaired reads in a fragment duplicate set.
///
/// Returns the number of reads marked.
pub fn mark_duplicate_fragments(
    group: &[ReadEnd],
    contains_pairs: bool,
    indices: &mut IndexSpool,
) -> Result<u64, MarkDupError> {
    let mut marked = 0;
    if contains_pairs {
        for end in group.iter().filter(|e| !e.is_paired()) {
            indices.add(end.read1_index_in_file)?;
            marked += 1;
        }
    } else {
        let best = best_end(group);
        for (i, end) in group.iter().enumerate() {
            if i != best {
                indices.add(end.read1_index_in_file)?;
                marked += 1;
            }
        }
    }
    Ok(marked)
}

/// Accumulates runs of comparable ends and hands each finished run to a
/// flush callback.
struct Grouper {
    compare_read2: bool,
    chunk: Vec<ReadEnd>,
}

impl Grouper {
    fn new(compare_read2: bool) -> Self {
        Self {
            compare_read2,
            chunk: Vec::new(),
        }
    }

    fn push<F>(&mut self, end: ReadEnd, mut flush: F) -> Result<()>
    where
        F: FnMut(&[ReadEnd]) -> Result<()>,
    {
        if let Some(first) = self.chunk.first()
            && !are_comparable(first, &end, self.compare_read2)
        {
            flush(&self.chunk)?;
            self.chunk.clear();
        }
        self.chunk.push(end);
        Ok(())
    }

    fn finish<F>(&mut self, mut flush: F) -> Result<()>
    where
        F: FnMut(&[ReadEnd]) -> Result<()>,
    {
        if !self.chunk.is_empty() {
            flush(&self.chunk)?;
            self.chunk.clear();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionStats {
    /// Pair duplicate sets with more than one member
    pub pair_duplicate_sets: u64,
    pub duplicate_pairs: u64,
    /// Fragment duplicate sets that produced marks
    pub fragment_duplicate_sets: u64,
    pub duplicate_fragments: u64,
    /// Record indices written to the index spool
    pub duplicate_indices: u64,
}

/// Walks sorted read ends and records the indices of duplicate reads.
pub struct DuplicateSelector<'a> {
    indices: &'a mut IndexSpool,
    libraries: &'a mut LibraryIdGenerator,
    optical: Option<&'a OpticalDuplicateFinder>,
    stats: SelectionStats,
}

impl<'a> DuplicateSelector<'a> {
    pub fn new(
        indices: &'a mut IndexSpool,
        libraries: &'a mut LibraryIdGenerator,
        optical: Option<&'a OpticalDuplicateFinder>,
    ) -> Self {
        Self {
            indices,
            libraries,
            optical,
            stats: SelectionStats::default(),
        }
    }

    /// Pair pass; `ends` must be in [`ReadEnd`] order.
    pub fn select_pairs<I>(&mut self, ends: I) -> Result<()>
    where
        I: IntoIterator<Item = Result<ReadEnd, MarkDupError>>,
    {
        let mut grouper = Grouper::new(true);
        for end in ends {
            grouper.push(end?, |group| self.flush_pairs(group))?;
        }
        grouper.finish(|group| self.flush_pairs(group))
    }

    /// Fragment pass; `ends` must be in [`ReadEnd`] order.
    pub fn select_fragments<I>(&mut self, ends: I) -> Result<()>
    where
        I: IntoIterator<Item = Result<ReadEnd, MarkDupError>>,
    {
        let mut grouper = Grouper::new(false);
        for end in ends {
            grouper.push(end?, |group| self.flush_fragments(group))?;
        }
        grouper.finish(|group| self.flush_fragments(group))
    }

    pub fn stats(&self) -> &SelectionStats {
        &self.stats
    }

    pub fn finish(self) -> SelectionStats {
        self.stats
    }

    fn flush_pairs(&mut self, group: &[ReadEnd]) -> Result<()> {
        if group.len() < 2 {
            return Ok(());
        }
        let marked = mark_duplicate_pairs(group, self.indices)?;
        self.stats.pair_duplicate_sets += 1;
        self.stats.duplicate_pairs += marked;
        self.stats.duplicate_indices += 2 * marked;

        if let Some(finder) = self.optical {
            track_optical_duplicates(group, finder, self.libraries)?;
        }
        Ok(())
    }

    fn flush_fragments(&mut self, group: &[ReadEnd]) -> Result<()> {
        let contains_fragments = group.iter().any(|e| !e.is_paired());
        if group.len() < 2 || !contains_fragments {
            return Ok(());
        }
        let contains_pairs = group.iter().any(ReadEnd::is_paired);
        let marked = mark_duplicate_fragments(group, contains_pairs, self.indices)?;
        self.stats.fragment_duplicate_sets += 1;
        self.stats.duplicate_fragments += marked;
        self.stats.duplicate_indices += marked;
        Ok(())
    }
}
