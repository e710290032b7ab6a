// Command-line argument parsing
use clap::Parser;
use noodles::sam::alignment::record::data::field::Tag;
use std::path::PathBuf;

use crate::config::{DEFAULT_CHANNEL_CAPACITY, MarkDupConfig};
use crate::errors::MarkDupError;
use crate::optical::DEFAULT_OPTICAL_PIXEL_DISTANCE;
use crate::scoring::ScoringStrategy;
use crate::utils::parse_memory_size;

#[derive(Parser, Debug)]
#[command(name = "mkduprs", about = "Mark duplicate reads in a coordinate-sorted BAM file")]
pub struct Args {
    #[arg(short, long)]
    pub input: PathBuf,
    #[arg(short, long)]
    pub output: PathBuf,
    /// Drop duplicates from the output instead of flagging them
    #[arg(short = 'r', long)]
    pub remove_duplicates: bool,
    #[arg(short = 't', long, default_value_t = num_cpus())]
    pub threads: usize,
    /// Force single-threaded mode (useful for Windows or I/O-bound workloads)
    #[arg(long)]
    pub single_threaded: bool,
    /// Memory ceiling for sorting, with an optional K/M/G suffix
    #[arg(long, default_value = "2G")]
    pub max_memory: String,
    /// Reads buffered between the reader and the worker thread
    #[arg(long, default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    pub channel_capacity: usize,
    /// Scratch directory for spill files; may be given more than once
    #[arg(long)]
    pub tmp_dir: Vec<PathBuf>,
    #[arg(long, value_parser = parse_tag)]
    pub barcode_tag: Option<Tag>,
    #[arg(long, value_parser = parse_tag)]
    pub read_one_barcode_tag: Option<Tag>,
    #[arg(long, value_parser = parse_tag)]
    pub read_two_barcode_tag: Option<Tag>,
    /// Count optical duplicates from Illumina read names
    #[arg(long)]
    pub optical_duplicates: bool,
    #[arg(long, default_value_t = DEFAULT_OPTICAL_PIXEL_DISTANCE)]
    pub optical_pixel_distance: i32,
    #[arg(long, value_enum, default_value_t = ScoringStrategy::SumOfBaseQualities)]
    pub scoring_strategy: ScoringStrategy,
}

pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Get effective thread count based on args and platform
#[inline]
pub fn effective_threads(args: &Args) -> usize {
    if args.single_threaded {
        1
    } else {
        args.threads.max(1)
    }
}

/// Two-character aux tag such as `BC`
pub fn parse_tag(s: &str) -> Result<Tag, String> {
    match s.as_bytes() {
        &[a, b] if a.is_ascii_alphabetic() && b.is_ascii_alphanumeric() => Ok(Tag::from([a, b])),
        _ => Err(format!("invalid tag '{s}': expected two characters like 'BC'")),
    }
}

impl Args {
    pub fn to_config(&self) -> Result<MarkDupConfig, MarkDupError> {
        let config = MarkDupConfig {
            max_memory: parse_memory_size(&self.max_memory)?,
            channel_capacity: self.channel_capacity,
            tmp_dirs: self.tmp_dir.clone(),
            barcode_tag: self.barcode_tag,
            read_one_barcode_tag: self.read_one_barcode_tag,
            read_two_barcode_tag: self.read_two_barcode_tag,
            optical_duplicates: self.optical_duplicates,
            optical_pixel_distance: self.optical_pixel_distance,
            scoring_strategy: self.scoring_strategy,
            remove_duplicates: self.remove_duplicates,
            threads: effective_threads(self),
        };
        config.validate()?;
        Ok(config)
    }
}
