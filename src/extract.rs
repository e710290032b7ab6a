//! First pass: turn aligned reads into sorted read ends
//!
//! A reader thread walks the input once and hands mapped reads, tagged with
//! their ordinal index, to the calling thread over a bounded channel. The
//! calling thread builds a fragment end for every primary read and a pair end
//! for every pair whose mates have both been seen, feeding two sorting spools.

use std::io;
use std::thread;

use anyhow::{Context, Result};
use log::{info, warn};
use noodles::sam::alignment::record::data::field::Tag;

use crate::config::MarkDupConfig;
use crate::handoff::{HandoffReceiver, HandoffSender, handoff, join_stages};
use crate::library::LibraryIdGenerator;
use crate::optical::OpticalDuplicateFinder;
use crate::pending::{PendingPairs, pair_key};
use crate::read::{AlignedRead, IndexedRead};
use crate::read_ends::{Barcodes, PendingPair, PhysicalLocation, ReadEnd, barcode_value};
use crate::spool::SortingSpool;
use crate::utils::ProgressLogger;

/// Counters from the read-end extraction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    /// Records pulled from the input, up to the unmapped tail
    pub records_read: u64,
    /// Unmapped reads placed among mapped ones
    pub unmapped_skipped: u64,
    pub secondary_or_supplementary: u64,
    pub fragment_ends: u64,
    pub pair_ends: u64,
    /// Mates whose partner never showed up
    pub unmatched_pairs: u64,
    /// Reads claiming a mapped mate without a mate reference or a name
    pub malformed_pairs: u64,
}

/// The two read-end spools, sealed and ready to iterate.
pub struct SortedReadEnds {
    pub pairs: SortingSpool<ReadEnd>,
    pub fragments: SortingSpool<ReadEnd>,
    pub stats: ExtractionStats,
}

impl SortedReadEnds {
    pub fn cleanup(&mut self) -> io::Result<()> {
        self.pairs.cleanup()?;
        self.fragments.cleanup()
    }
}

/// Builds the fragment end of a single read.
pub struct ReadEndBuilder<'a> {
    config: &'a MarkDupConfig,
    libraries: &'a mut LibraryIdGenerator,
    optical: Option<&'a OpticalDuplicateFinder>,
}

impl<'a> ReadEndBuilder<'a> {
    pub fn new(
        config: &'a MarkDupConfig,
        libraries: &'a mut LibraryIdGenerator,
        optical: Option<&'a OpticalDuplicateFinder>,
    ) -> Self {
        Self {
            config,
            libraries,
            optical,
        }
    }

    /// `paired` marks reads whose mapped mate will produce a pair end.
    pub fn build<R: AlignedRead>(&mut self, read: &R, index: u64, paired: bool) -> Result<ReadEnd> {
        let flags = read.flags();
        let reference_index = read
            .reference_index()?
            .map_or(-1, |i| i as i32);
        let score = self.config.scoring_strategy.score(read)?;

        let mut end = ReadEnd::fragment(
            self.libraries.library_id(read)?,
            reference_index,
            read.five_prime_coordinate()?,
            flags.is_reverse_complemented(),
            index,
            score,
        );
        end.paired = paired;

        if let Some(finder) = self.optical {
            let read_group = read.read_group();
            let rg_index = self.libraries.read_group_index(read_group.as_ref());
            end.location = read
                .read_name()
                .and_then(|name| finder.location(name, rg_index))
                .unwrap_or_else(PhysicalLocation::default);
        }

        if self.config.use_barcodes() {
            end.barcodes = self.barcodes(read);
        }

        Ok(end)
    }

    fn barcodes<R: AlignedRead>(&self, read: &R) -> Barcodes {
        let value = |tag: Tag| {
            let tag_value = read.string_tag(tag);
            barcode_value(tag_value.as_ref().map(|v| v.as_slice()))
        };
        let flags = read.flags();
        let mut barcodes = Barcodes {
            barcode: self.config.barcode_tag.map_or(0, value),
            ..Barcodes::default()
        };
        if !flags.is_segmented() || flags.is_first_segment() {
            barcodes.read_one = self.config.read_one_barcode_tag.map_or(0, value);
        } else {
            barcodes.read_two = self.config.read_two_barcode_tag.map_or(0, value);
        }
        barcodes
    }
}

#[derive(Debug, Default)]
struct ProducerStats {
    records_read: u64,
    unmapped_skipped: u64,
}

/// Reader half: forward reads until the unmapped tail of the input.
fn produce<R, I>(reads: I, tx: HandoffSender<IndexedRead<R>>) -> Result<ProducerStats>
where
    R: AlignedRead,
    I: Iterator<Item = io::Result<R>>,
{
    let mut stats = ProducerStats::default();
    let mut progress = ProgressLogger::new("records", "Read");

    for (index, result) in reads.enumerate() {
        let read = result.with_context(|| format!("failed to read record {index}"))?;
        let index = index as u64;
        stats.records_read += 1;
        progress.record();

        if read.flags().is_unmapped() {
            if read.reference_index()?.is_none() {
                // unmapped tail, nothing more to pair up
                stats.records_read -= 1;
                break;
            }
            stats.unmapped_skipped += 1;
            continue;
        }
        tx.put(IndexedRead { index, read })?;
    }

    progress.log_final();
    tx.finish()?;
    Ok(stats)
}

struct Consumer<'a> {
    builder: ReadEndBuilder<'a>,
    pairs: &'a mut SortingSpool<ReadEnd>,
    fragments: &'a mut SortingSpool<ReadEnd>,
    pending: PendingPairs,
    stats: ExtractionStats,
}

impl Consumer<'_> {
    fn run<R: AlignedRead>(&mut self, mut rx: HandoffReceiver<IndexedRead<R>>) -> Result<()> {
        while let Some(IndexedRead { index, read }) = rx.take()? {
            self.accept(index, &read)?;
        }
        Ok(())
    }

    fn accept<R: AlignedRead>(&mut self, index: u64, read: &R) -> Result<()> {
        if read.is_secondary_or_supplementary() {
            self.stats.secondary_or_supplementary += 1;
            return Ok(());
        }

        let mate = if read.has_mapped_mate() {
            match (read.mate_reference_index()?, read.read_name()) {
                (Some(mate_reference), Some(name)) => Some((mate_reference as i32, name)),
                _ => {
                    warn!(
                        "record {index} claims a mapped mate but has no mate reference or name; \
                         treating it as a fragment"
                    );
                    self.stats.malformed_pairs += 1;
                    None
                }
            }
        } else {
            None
        };

        let fragment = self.builder.build(read, index, mate.is_some())?;
        self.fragments.add(fragment.clone())?;
        self.stats.fragment_ends += 1;

        if let Some((mate_reference, name)) = mate {
            let key = pair_key(read.read_group().as_ref().map(|rg| rg.as_slice()), name);
            match self.pending.remove(fragment.read1_reference_index, &key) {
                Some(pending) => {
                    let pair = pending.complete(&fragment, read.flags().is_first_segment());
                    self.pairs.add(pair)?;
                    self.stats.pair_ends += 1;
                }
                None => self
                    .pending
                    .insert(key, PendingPair::new(fragment, mate_reference)),
            }
        }
        Ok(())
    }
}

/// Run the first pass over `reads` and return the sealed read-end spools.
pub fn build_sorted_read_ends<R, I>(
    reads: I,
    config: &MarkDupConfig,
    libraries: &mut LibraryIdGenerator,
    optical: Option<&OpticalDuplicateFinder>,
) -> Result<SortedReadEnds>
where
    R: AlignedRead + Send,
    I: Iterator<Item = io::Result<R>> + Send,
{
    let budget = config.read_end_spool_budget();
    let mut pairs = SortingSpool::new("pairs", budget, &config.tmp_dirs)
        .with_parallel_sort(config.parallel_sort());
    let mut fragments = SortingSpool::new("fragments", budget, &config.tmp_dirs)
        .with_parallel_sort(config.parallel_sort());

    let (tx, rx) = handoff(config.channel_capacity);
    let mut consumer = Consumer {
        builder: ReadEndBuilder::new(config, libraries, optical),
        pairs: &mut pairs,
        fragments: &mut fragments,
        pending: PendingPairs::new(),
        stats: ExtractionStats::default(),
    };

    let (produced, consumed) = thread::scope(|s| {
        let producer = s.spawn(move || produce(reads, tx));
        let consumed = consumer.run(rx);
        (producer.join(), consumed)
    });
    let (produced, ()) = join_stages("read-end extraction", produced, consumed)?;

    let mut stats = consumer.stats;
    stats.records_read = produced.records_read;
    stats.unmapped_skipped = produced.unmapped_skipped;
    stats.unmatched_pairs = consumer.pending.len() as u64;
    if !consumer.pending.is_empty() {
        info!(
            "{} mates never found their partner (e.g. {:?})",
            stats.unmatched_pairs,
            consumer.pending.unmatched_names(3)
        );
    }

    pairs.done_adding()?;
    fragments.done_adding()?;
    info!(
        "Built {} fragment ends and {} pair ends from {} records",
        stats.fragment_ends, stats.pair_ends, stats.records_read
    );

    Ok(SortedReadEnds {
        pairs,
        fragments,
        stats,
    })
}
