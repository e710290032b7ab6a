//! The view of an aligned read that duplicate marking needs
//!
//! The engine never parses or writes alignment containers itself. Any record
//! type implementing [`AlignedRead`] can be pushed through both passes; the BAM
//! binding lives in [`crate::io`].

use std::io;

use bstr::BString;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record::data::field::Tag;

pub trait AlignedRead {
    fn flags(&self) -> Flags;

    /// `None` for reads without a reference sequence.
    fn reference_index(&self) -> io::Result<Option<usize>>;

    fn mate_reference_index(&self) -> io::Result<Option<usize>>;

    /// 1-based unclipped 5' coordinate: unclipped start on the forward strand,
    /// unclipped end on the reverse strand.
    fn five_prime_coordinate(&self) -> io::Result<i32>;

    /// Number of reference bases covered by the alignment.
    fn reference_length(&self) -> io::Result<u32>;

    fn read_name(&self) -> Option<&[u8]>;

    /// Sum of the Phred base qualities at or above `min_quality`.
    fn base_quality_sum(&self, min_quality: u8) -> u32;

    /// Value of a string-typed aux field, if present.
    fn string_tag(&self, tag: Tag) -> Option<BString>;

    fn read_group(&self) -> Option<BString> {
        self.string_tag(Tag::READ_GROUP)
    }

    fn is_secondary_or_supplementary(&self) -> bool {
        let flags = self.flags();
        flags.is_secondary() || flags.is_supplementary()
    }

    /// Paired, with a mapped mate.
    fn has_mapped_mate(&self) -> bool {
        let flags = self.flags();
        flags.is_segmented() && !flags.is_mate_unmapped()
    }
}

/// A read tagged with its ordinal position in the input stream.
#[derive(Debug, Clone)]
pub struct IndexedRead<R> {
    pub index: u64,
    pub read: R,
}

/// A read leaving the re-marking stage.
///
/// `duplicate` is `None` for secondary and supplementary records, whose flag
/// must be left as it was.
#[derive(Debug, Clone)]
pub struct MarkedRead<R> {
    pub index: u64,
    pub read: R,
    pub duplicate: Option<bool>,
}

/// Destination for re-marked reads, in input order.
pub trait ReadSink<R> {
    fn write_read(&mut self, marked: MarkedRead<R>) -> anyhow::Result<()>;
}

impl<R> ReadSink<R> for Vec<MarkedRead<R>> {
    fn write_read(&mut self, marked: MarkedRead<R>) -> anyhow::Result<()> {
        self.push(marked);
        Ok(())
    }
}
