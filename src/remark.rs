//! Second pass: set or clear the duplicate flag on every record
//!
//! A reader thread walks the input in lock-step with the ascending duplicate
//! indices, decides each primary read's flag and updates the library metrics;
//! the calling thread forwards the reads to a [`ReadSink`] in input order.

use std::io;
use std::thread;

use anyhow::{Context, Result};

use crate::errors::MarkDupError;
use crate::handoff::{HandoffReceiver, HandoffSender, handoff, join_stages};
use crate::library::LibraryIdGenerator;
use crate::read::{AlignedRead, MarkedRead, ReadSink};
use crate::spool::IndexSpool;
use crate::utils::ProgressLogger;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkingStats {
    pub records_read: u64,
    pub duplicates_flagged: u64,
    /// Secondary and supplementary records passed through untouched
    pub passed_through: u64,
    pub records_written: u64,
    /// Duplicates dropped because removal was requested
    pub duplicates_removed: u64,
}

#[derive(Debug, Default)]
struct ProducerStats {
    records_read: u64,
    duplicates_flagged: u64,
    passed_through: u64,
}

/// Decide the duplicate flag of one record and count it in its library.
fn classify<R: AlignedRead>(
    read: &R,
    is_duplicate: bool,
    libraries: &mut LibraryIdGenerator,
) -> Result<Option<bool>, MarkDupError> {
    let library_id = libraries.library_id(read)?;
    let metrics = libraries.metrics_mut(library_id);
    if read.is_secondary_or_supplementary() {
        metrics.secondary_or_supplementary_reads += 1;
        return Ok(None);
    }

    let flags = read.flags();
    let unpaired = !flags.is_segmented() || flags.is_mate_unmapped();
    if flags.is_unmapped() {
        metrics.unmapped_reads += 1;
    } else if unpaired {
        metrics.unpaired_reads_examined += 1;
    } else {
        metrics.read_pairs_examined += 1;
    }

    if is_duplicate {
        if unpaired {
            metrics.unpaired_read_duplicates += 1;
        } else {
            metrics.read_pair_duplicates += 1;
        }
    }
    Ok(Some(is_duplicate))
}

fn produce<R, I>(
    reads: I,
    indices: &mut IndexSpool,
    libraries: &mut LibraryIdGenerator,
    tx: HandoffSender<MarkedRead<R>>,
) -> Result<ProducerStats>
where
    R: AlignedRead,
    I: Iterator<Item = io::Result<R>>,
{
    let mut stats = ProducerStats::default();
    let mut progress = ProgressLogger::new("records", "Marked");
    let mut cursor = indices.iter()?;
    let mut next_duplicate = cursor.next().transpose()?;

    for (index, result) in reads.enumerate() {
        let read = result.with_context(|| format!("failed to read record {index}"))?;
        let index = index as u64;
        stats.records_read += 1;
        progress.record();

        let primary = !read.is_secondary_or_supplementary();
        let is_duplicate = primary && next_duplicate == Some(index);
        if is_duplicate {
            next_duplicate = cursor.next().transpose()?;
        }

        let duplicate = classify(&read, is_duplicate, libraries)?;
        match duplicate {
            None => stats.passed_through += 1,
            Some(true) => stats.duplicates_flagged += 1,
            Some(false) => {}
        }
        tx.put(MarkedRead {
            index,
            read,
            duplicate,
        })?;
    }

    if next_duplicate.is_some() {
        let mut remaining = 1;
        for index in cursor {
            index?;
            remaining += 1;
        }
        return Err(MarkDupError::InputChanged { remaining }.into());
    }

    progress.log_final();
    tx.finish()?;
    Ok(stats)
}

fn consume<R, S>(
    mut rx: HandoffReceiver<MarkedRead<R>>,
    sink: &mut S,
    remove_duplicates: bool,
) -> Result<(u64, u64)>
where
    S: ReadSink<R>,
{
    let mut written = 0;
    let mut removed = 0;
    while let Some(marked) = rx.take()? {
        if remove_duplicates && marked.duplicate == Some(true) {
            removed += 1;
            continue;
        }
        sink.write_read(marked)?;
        written += 1;
    }
    Ok((written, removed))
}

/// Re-read the input and forward every record to `sink` with its duplicate
/// flag decided by `indices`.
///
/// `reads` must yield the same records, in the same order, as the first pass.
pub fn mark_duplicates<R, I, S>(
    reads: I,
    indices: &mut IndexSpool,
    libraries: &mut LibraryIdGenerator,
    sink: &mut S,
    remove_duplicates: bool,
    channel_capacity: usize,
) -> Result<MarkingStats>
where
    R: AlignedRead + Send,
    I: Iterator<Item = io::Result<R>> + Send,
    S: ReadSink<R>,
{
    let (tx, rx) = handoff(channel_capacity);
    let (produced, consumed) = thread::scope(|s| {
        let producer = s.spawn(move || produce(reads, indices, libraries, tx));
        let consumed = consume(rx, sink, remove_duplicates);
        (producer.join(), consumed)
    });
    let (produced, (written, removed)) = join_stages("duplicate marking", produced, consumed)?;

    Ok(MarkingStats {
        records_read: produced.records_read,
        duplicates_flagged: produced.duplicates_flagged,
        passed_through: produced.passed_through,
        records_written: written,
        duplicates_removed: removed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::UNKNOWN_LIBRARY;
    use crate::read::testing::TestRead;
    use noodles::sam::alignment::record::Flags;
    use tempfile::TempDir;

    fn indices_of(values: &[u64]) -> (TempDir, IndexSpool) {
        let tmp = tempfile::tempdir().unwrap();
        let mut spool = IndexSpool::new("indices", 16, &[tmp.path().to_path_buf()]);
        for &v in values {
            spool.add(v).unwrap();
        }
        (tmp, spool)
    }

    fn reads() -> Vec<TestRead> {
        vec![
            TestRead::fragment("a", 0, 10),
            TestRead::fragment("b", 0, 10),
            TestRead::fragment("b", 0, 900).with_flags(Flags::SUPPLEMENTARY),
            TestRead::mate("c", true, 0, 20, 0),
            TestRead::mate("c", false, 0, 80, 0),
            TestRead::unmapped("d"),
        ]
    }

    fn run(
        reads: Vec<TestRead>,
        duplicates: &[u64],
        remove: bool,
    ) -> (Result<MarkingStats>, Vec<MarkedRead<TestRead>>, LibraryIdGenerator) {
        let (_tmp, mut indices) = indices_of(duplicates);
        let mut libraries = LibraryIdGenerator::default();
        let mut sink = Vec::new();
        let stats = mark_duplicates(
            reads.into_iter().map(Ok),
            &mut indices,
            &mut libraries,
            &mut sink,
            remove,
            2,
        );
        (stats, sink, libraries)
    }

    #[test]
    fn test_flags_follow_indices() {
        let (stats, sink, _) = run(reads(), &[1, 3, 4], false);
        let stats = stats.unwrap();
        assert_eq!(stats.records_read, 6);
        assert_eq!(stats.records_written, 6);
        assert_eq!(stats.duplicates_flagged, 3);
        assert_eq!(stats.passed_through, 1);

        let flags: Vec<Option<bool>> = sink.iter().map(|m| m.duplicate).collect();
        assert_eq!(
            flags,
            vec![
                Some(false),
                Some(true),
                None,
                Some(true),
                Some(true),
                Some(false)
            ]
        );
        let order: Vec<u64> = sink.iter().map(|m| m.index).collect();
        assert_eq!(order, (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn test_metrics_are_counted() {
        let (stats, _, libraries) = run(reads(), &[1, 3, 4], false);
        stats.unwrap();
        let metrics = libraries.finalize();
        assert_eq!(metrics.len(), 1);
        let m = &metrics[0];
        assert_eq!(m.library, UNKNOWN_LIBRARY);
        assert_eq!(m.unpaired_reads_examined, 2);
        assert_eq!(m.unpaired_read_duplicates, 1);
        assert_eq!(m.read_pairs_examined, 1);
        assert_eq!(m.read_pair_duplicates, 1);
        assert_eq!(m.unmapped_reads, 1);
        assert_eq!(m.secondary_or_supplementary_reads, 1);
    }

    #[test]
    fn test_remove_duplicates_drops_flagged_reads() {
        let (stats, sink, _) = run(reads(), &[1, 3, 4], true);
        let stats = stats.unwrap();
        assert_eq!(stats.duplicates_removed, 3);
        assert_eq!(stats.records_written, 3);
        let kept: Vec<u64> = sink.iter().map(|m| m.index).collect();
        assert_eq!(kept, vec![0, 2, 5]);
    }

    #[test]
    fn test_secondary_never_consumes_an_index() {
        // index 2 names the supplementary record, which must not take it
        let (stats, _, _) = run(reads(), &[2], false);
        let err = stats.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MarkDupError>(),
            Some(MarkDupError::InputChanged { remaining: 1 })
        ));
    }

    #[test]
    fn test_leftover_indices_are_fatal() {
        let (stats, _, _) = run(reads(), &[4, 10, 11], false);
        let err = stats.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MarkDupError>(),
            Some(MarkDupError::InputChanged { remaining: 2 })
        ));
    }

    #[test]
    fn test_no_duplicates_clears_flags() {
        let reads = vec![TestRead::fragment("a", 0, 10).with_flags(Flags::DUPLICATE)];
        let (stats, sink, _) = run(reads, &[], false);
        assert_eq!(stats.unwrap().duplicates_flagged, 0);
        assert_eq!(sink[0].duplicate, Some(false));
    }

    struct FailingSink;

    impl ReadSink<TestRead> for FailingSink {
        fn write_read(&mut self, _marked: MarkedRead<TestRead>) -> Result<()> {
            Err(anyhow::anyhow!("disk full"))
        }
    }

    #[test]
    fn test_sink_error_is_reported() {
        let (_tmp, mut indices) = indices_of(&[]);
        let mut libraries = LibraryIdGenerator::default();
        let many: Vec<TestRead> = (0..100).map(|i| TestRead::fragment("x", 0, i)).collect();
        let err = mark_duplicates(
            many.into_iter().map(Ok),
            &mut indices,
            &mut libraries,
            &mut FailingSink,
            false,
            1,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "disk full");
    }
}
