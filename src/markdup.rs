//! Two-pass duplicate marking
//!
//! [`MarkDuplicates::find_duplicates`] runs read-end extraction and duplicate
//! selection over a first traversal of the input and leaves the sorted
//! duplicate indices behind; [`MarkDuplicates::mark_duplicates`] consumes them
//! during a second traversal.

use std::io;

use anyhow::{Context, Result, bail};
use log::info;

use crate::algorithm::{DuplicateSelector, SelectionStats};
use crate::config::MarkDupConfig;
use crate::extract::{ExtractionStats, build_sorted_read_ends};
use crate::library::{DuplicationMetrics, LibraryIdGenerator};
use crate::optical::OpticalDuplicateFinder;
use crate::read::{AlignedRead, ReadSink};
use crate::remark::{self, MarkingStats};
use crate::spool::IndexSpool;

pub struct MarkDuplicates {
    config: MarkDupConfig,
    libraries: LibraryIdGenerator,
    optical: Option<OpticalDuplicateFinder>,
    indices: Option<IndexSpool>,
    extraction: ExtractionStats,
    selection: SelectionStats,
}

impl MarkDuplicates {
    pub fn new(config: MarkDupConfig, libraries: LibraryIdGenerator) -> Result<Self> {
        config.validate()?;
        let optical = config
            .optical_duplicates
            .then(|| OpticalDuplicateFinder::new(config.optical_pixel_distance));
        Ok(Self {
            config,
            libraries,
            optical,
            indices: None,
            extraction: ExtractionStats::default(),
            selection: SelectionStats::default(),
        })
    }

    pub fn config(&self) -> &MarkDupConfig {
        &self.config
    }

    /// First pass: collect the indices of every duplicate record.
    pub fn find_duplicates<R, I>(&mut self, reads: I) -> Result<&SelectionStats>
    where
        R: AlignedRead + Send,
        I: Iterator<Item = io::Result<R>> + Send,
    {
        if self.indices.is_some() {
            bail!("duplicates were already collected for this run");
        }

        let mut ends = build_sorted_read_ends(
            reads,
            &self.config,
            &mut self.libraries,
            self.optical.as_ref(),
        )
        .context("failed to build read ends")?;

        let mut indices = IndexSpool::new(
            "indices",
            self.config.index_spool_budget(),
            &self.config.tmp_dirs,
        )
        .with_parallel_sort(self.config.parallel_sort());

        let mut selector =
            DuplicateSelector::new(&mut indices, &mut self.libraries, self.optical.as_ref());
        selector.select_pairs(ends.pairs.iter()?)?;
        selector.select_fragments(ends.fragments.iter()?)?;
        let selection = selector.finish();

        ends.cleanup()
            .context("failed to remove read-end spill files")?;
        indices.done_adding()?;

        info!(
            "Found {} duplicate pairs and {} duplicate fragments ({} records to mark)",
            selection.duplicate_pairs, selection.duplicate_fragments, selection.duplicate_indices
        );
        if self.optical.is_some() {
            info!(
                "Found {} optical duplicates in {} duplicate sets",
                self.libraries.total_optical_duplicates(),
                self.libraries.optical_duplicate_sets()
            );
        }

        self.extraction = ends.stats;
        self.selection = selection;
        self.indices = Some(indices);
        Ok(&self.selection)
    }

    /// Second pass: flag (or drop) duplicates while copying reads to `sink`.
    pub fn mark_duplicates<R, I, S>(&mut self, reads: I, sink: &mut S) -> Result<MarkingStats>
    where
        R: AlignedRead + Send,
        I: Iterator<Item = io::Result<R>> + Send,
        S: ReadSink<R>,
    {
        let Some(indices) = self.indices.as_mut() else {
            bail!("find_duplicates must run before mark_duplicates");
        };

        let stats = remark::mark_duplicates(
            reads,
            indices,
            &mut self.libraries,
            sink,
            self.config.remove_duplicates,
            self.config.channel_capacity,
        )?;
        indices
            .cleanup()
            .context("failed to remove duplicate index spill files")?;

        info!(
            "Marked {} of {} records as duplicates",
            stats.duplicates_flagged, stats.records_read
        );
        Ok(stats)
    }

    pub fn extraction_stats(&self) -> &ExtractionStats {
        &self.extraction
    }

    pub fn selection_stats(&self) -> &SelectionStats {
        &self.selection
    }

    pub fn libraries(&self) -> &LibraryIdGenerator {
        &self.libraries
    }

    /// Remove any spill files still on disk.
    pub fn cleanup(&mut self) -> io::Result<()> {
        match self.indices.as_mut() {
            Some(indices) => indices.cleanup(),
            None => Ok(()),
        }
    }

    /// Finalized per-library metrics.
    pub fn into_metrics(self) -> Vec<DuplicationMetrics> {
        self.libraries.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read::MarkedRead;
    use crate::read::testing::TestRead;
    use noodles::sam::alignment::record::Flags;
    use noodles::sam::alignment::record::data::field::Tag;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn config(max_memory: usize, tmp: &TempDir) -> MarkDupConfig {
        MarkDupConfig {
            max_memory,
            channel_capacity: 4,
            tmp_dirs: vec![tmp.path().to_path_buf()],
            ..MarkDupConfig::default()
        }
    }

    /// A coordinate-sorted mix of pairs, fragments, supplementary records and
    /// an unmapped tail, with plenty of duplicates.
    fn synthetic_reads(seed: u64) -> Vec<TestRead> {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut reads: Vec<TestRead> = Vec::new();
        for i in 0..120 {
            let start = rng.i32(1..40) * 10;
            let name = format!("q{i}");
            let score = rng.u32(1..6) * 15;
            match rng.u8(0..4) {
                0 => reads.push(TestRead::fragment(&name, 0, start).with_score(score)),
                1 => reads.push(
                    TestRead::fragment(&name, 0, start)
                        .reverse()
                        .with_score(score),
                ),
                _ => {
                    let insert = rng.i32(1..4) * 50;
                    reads.push(TestRead::mate(&name, true, 0, start, 0).with_score(score));
                    reads.push(
                        TestRead::mate(&name, false, 0, start + insert, 0)
                            .reverse()
                            .with_score(score),
                    );
                }
            }
            if rng.u8(0..20) == 0 {
                reads.push(
                    TestRead::fragment(&name, 0, start).with_flags(Flags::SUPPLEMENTARY),
                );
            }
        }
        reads.sort_by_key(|r| r.five_prime);
        reads.push(TestRead::unmapped("tail1"));
        reads.push(TestRead::unmapped("tail2"));
        reads
    }

    fn run(reads: &[TestRead], config: MarkDupConfig) -> (Vec<MarkedRead<TestRead>>, MarkDuplicates) {
        let mut markdup = MarkDuplicates::new(config, LibraryIdGenerator::default()).unwrap();
        markdup
            .find_duplicates(reads.iter().cloned().map(Ok))
            .unwrap();
        let mut sink = Vec::new();
        markdup
            .mark_duplicates(reads.iter().cloned().map(Ok), &mut sink)
            .unwrap();
        (sink, markdup)
    }

    fn duplicate_indices(sink: &[MarkedRead<TestRead>]) -> Vec<u64> {
        sink.iter()
            .filter(|m| m.duplicate == Some(true))
            .map(|m| m.index)
            .collect()
    }

    #[test]
    fn test_result_does_not_depend_on_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let reads = synthetic_reads(11);

        let (large, _) = run(&reads, config(1 << 30, &tmp));
        let (small, _) = run(&reads, config(4096, &tmp));
        let (zero, _) = run(&reads, config(0, &tmp));

        let expected = duplicate_indices(&large);
        assert!(!expected.is_empty());
        assert_eq!(duplicate_indices(&small), expected);
        assert_eq!(duplicate_indices(&zero), expected);
        // scratch directories are gone
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_output_preserves_count_and_order() {
        let tmp = tempfile::tempdir().unwrap();
        let reads = synthetic_reads(3);
        let (sink, _) = run(&reads, config(1 << 20, &tmp));

        assert_eq!(sink.len(), reads.len());
        for (i, (marked, original)) in sink.iter().zip(&reads).enumerate() {
            assert_eq!(marked.index, i as u64);
            assert_eq!(&marked.read, original);
        }
    }

    #[test]
    fn test_marked_reads_are_unique_primary_reads() {
        let tmp = tempfile::tempdir().unwrap();
        let reads = synthetic_reads(5);
        let (sink, markdup) = run(&reads, config(2048, &tmp));

        let marked = duplicate_indices(&sink);
        let unique: HashSet<u64> = marked.iter().copied().collect();
        assert_eq!(unique.len(), marked.len());
        for &i in &marked {
            assert!(!reads[i as usize].is_secondary_or_supplementary());
        }
        assert_eq!(
            marked.len() as u64,
            markdup.selection_stats().duplicate_indices
        );
    }

    #[test]
    fn test_pair_and_fragment_scenario() {
        let tmp = tempfile::tempdir().unwrap();
        let reads = vec![
            TestRead::mate("low", true, 1, 1000, 1).with_score(30),
            TestRead::mate("high", true, 1, 1000, 1).with_score(30),
            TestRead::mate("low", false, 1, 1200, 1).reverse().with_score(0),
            TestRead::mate("high", false, 1, 1200, 1).reverse().with_score(15),
            TestRead::fragment("frag", 2, 500).with_score(90),
            TestRead::mate("p", true, 2, 500, 2),
            TestRead::mate("p", false, 2, 700, 2).reverse(),
        ];
        let (sink, markdup) = run(&reads, config(1 << 20, &tmp));
        assert_eq!(duplicate_indices(&sink), vec![0, 2, 4]);

        let stats = markdup.extraction_stats().clone();
        assert_eq!(stats.pair_ends, 3);
        let metrics = markdup.into_metrics();
        assert_eq!(metrics[0].read_pairs_examined, 3);
        assert_eq!(metrics[0].read_pair_duplicates, 1);
        assert_eq!(metrics[0].unpaired_read_duplicates, 1);
    }

    #[test]
    fn test_remove_duplicates() {
        let tmp = tempfile::tempdir().unwrap();
        let reads = synthetic_reads(7);
        let (flagged, _) = run(&reads, config(1 << 20, &tmp));
        let dups = duplicate_indices(&flagged).len();

        let mut remove = config(1 << 20, &tmp);
        remove.remove_duplicates = true;
        let (kept, _) = run(&reads, remove);
        assert_eq!(kept.len(), reads.len() - dups);
        assert!(kept.iter().all(|m| m.duplicate != Some(true)));
    }

    #[test]
    fn test_libraries_do_not_mix() {
        let tmp = tempfile::tempdir().unwrap();
        let mut libraries = LibraryIdGenerator::default();
        libraries.add_read_group("a", Some("libA")).unwrap();
        libraries.add_read_group("b", Some("libB")).unwrap();
        let reads = vec![
            TestRead::fragment("x", 0, 100).with_tag(Tag::READ_GROUP, "a"),
            TestRead::fragment("y", 0, 100).with_tag(Tag::READ_GROUP, "b"),
            TestRead::fragment("z", 0, 100).with_tag(Tag::READ_GROUP, "b"),
        ];
        let mut markdup = MarkDuplicates::new(config(1 << 20, &tmp), libraries).unwrap();
        markdup.find_duplicates(reads.iter().cloned().map(Ok)).unwrap();
        let mut sink = Vec::new();
        markdup
            .mark_duplicates(reads.iter().cloned().map(Ok), &mut sink)
            .unwrap();
        assert_eq!(duplicate_indices(&sink), vec![2]);

        let metrics = markdup.into_metrics();
        let names: Vec<&str> = metrics.iter().map(|m| m.library.as_str()).collect();
        assert_eq!(names, vec!["libA", "libB"]);
        assert_eq!(metrics[1].unpaired_read_duplicates, 1);
    }

    #[test]
    fn test_mate_without_partner_is_never_marked() {
        let tmp = tempfile::tempdir().unwrap();
        let reads = vec![
            TestRead::mate("orphan", true, 0, 500, 0).with_score(0),
            TestRead::fragment("frag", 0, 500).with_score(90),
        ];
        let (sink, markdup) = run(&reads, config(1 << 20, &tmp));
        assert_eq!(duplicate_indices(&sink), vec![1]);
        assert_eq!(markdup.extraction_stats().unmatched_pairs, 1);
        assert_eq!(markdup.extraction_stats().pair_ends, 0);
    }

    #[test]
    fn test_passes_must_run_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let mut markdup =
            MarkDuplicates::new(config(1 << 20, &tmp), LibraryIdGenerator::default()).unwrap();
        let mut sink: Vec<MarkedRead<TestRead>> = Vec::new();
        assert!(
            markdup
                .mark_duplicates(std::iter::empty::<io::Result<TestRead>>(), &mut sink)
                .is_err()
        );

        markdup
            .find_duplicates(std::iter::empty::<io::Result<TestRead>>())
            .unwrap();
        assert!(
            markdup
                .find_duplicates(std::iter::empty::<io::Result<TestRead>>())
                .is_err()
        );
        markdup.cleanup().unwrap();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = MarkDupConfig {
            channel_capacity: 0,
            ..MarkDupConfig::default()
        };
        assert!(MarkDuplicates::new(config, LibraryIdGenerator::default()).is_err());
    }
}
