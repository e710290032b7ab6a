//! mkduprs - duplicate read marking for coordinate-sorted BAM files
//!
//! Duplicates are found in two passes over the input. The first pass turns
//! every read into a compact read end, sorts the ends with a bounded-memory
//! external sort and picks the best read of every duplicate set; the second
//! pass copies the input, setting or clearing the duplicate flag. Results do
//! not depend on how much memory the sort is given.
//!
//! # Example
//!
//! ```ignore
//! use mkduprs::{LibraryIdGenerator, MarkDupConfig, MarkDuplicates};
//! use mkduprs::io::{BamSink, open_bam};
//!
//! let mut reader = open_bam("input.bam".as_ref())?;
//! let header = reader.read_header()?;
//! let mut markdup = MarkDuplicates::new(
//!     MarkDupConfig::default(),
//!     LibraryIdGenerator::from_header(&header)?,
//! )?;
//! markdup.find_duplicates(reader.records())?;
//!
//! let mut reader = open_bam("input.bam".as_ref())?;
//! reader.read_header()?;
//! let mut sink = BamSink::create("output.bam".as_ref(), &header)?;
//! markdup.mark_duplicates(reader.records(), &mut sink)?;
//! sink.finish()?;
//! ```

pub mod algorithm;
pub mod args;
pub mod config;
pub mod errors;
pub mod extract;
pub mod handoff;
pub mod io;
pub mod library;
pub mod markdup;
pub mod optical;
pub mod pending;
pub mod read;
pub mod read_ends;
pub mod remark;
pub mod scoring;
pub mod spool;
pub mod utils;

// Re-export commonly used items
pub use algorithm::{DuplicateSelector, SelectionStats, are_comparable};
pub use args::Args;
pub use config::MarkDupConfig;
pub use errors::MarkDupError;
pub use io::{DUPLICATE_FLAG, FLAG_OFFSET, toggle_duplicate_flag};
pub use library::{DuplicationMetrics, LibraryIdGenerator};
pub use markdup::MarkDuplicates;
pub use read::{AlignedRead, MarkedRead, ReadSink};
pub use read_ends::{Orientation, ReadEnd};
pub use scoring::ScoringStrategy;
pub use spool::{IndexSpool, SortingSpool, SpoolRecord};
