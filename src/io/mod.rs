//! BAM and scratch-file I/O
//!
//! BAM reading goes through noodles; output records are re-serialized and have
//! their duplicate bit patched in place before being BGZF-compressed. Spill
//! runs of the sorting spools are LZ4 frames of fixed-size records.

use anyhow::Result;
use bstr::BString;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use noodles::bam;
use noodles::bgzf::io::Writer as BgzfWriter;
use noodles::sam::alignment::io::Write as SamWrite;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record::cigar::op::Kind;
use noodles::sam::alignment::record::data::field::{Tag, Value};
use noodles::sam::header::Header as SamHeader;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use crate::read::{AlignedRead, MarkedRead, ReadSink};
use crate::spool::SpoolRecord;

/// Offset of the flag field in a serialized BAM record
///
/// block_size (4) + ref_id (4) + pos (4) + l_read_name (1) + mapq (1)
/// + bin (2) + n_cigar_op (2) = 18
pub const FLAG_OFFSET: usize = 18;

/// The DUPLICATE flag bit in BAM format
pub const DUPLICATE_FLAG: u16 = 0x400;

/// Modify the DUPLICATE flag in raw BAM record bytes
///
/// Returns the modified flag value.
#[inline]
pub fn toggle_duplicate_flag(data: &mut [u8], is_duplicate: bool) -> Option<u16> {
    if data.len() < FLAG_OFFSET + 2 {
        return None;
    }

    let flag = u16::from_le_bytes([data[FLAG_OFFSET], data[FLAG_OFFSET + 1]]);
    let new_flag = if is_duplicate {
        flag | DUPLICATE_FLAG
    } else {
        flag & !DUPLICATE_FLAG
    };

    data[FLAG_OFFSET..FLAG_OFFSET + 2].copy_from_slice(&new_flag.to_le_bytes());

    Some(new_flag)
}

/// Open a BAM file; the header still has to be read by the caller.
pub fn open_bam(path: &Path) -> io::Result<bam::io::Reader<noodles::bgzf::io::Reader<File>>> {
    File::open(path).map(bam::io::Reader::new)
}

/// Write header to BGZF-compressed BAM file
pub fn write_header<W: Write>(writer: &mut BgzfWriter<W>, header: &SamHeader) -> Result<()> {
    let mut header_buf = Vec::new();
    {
        let mut writer = bam::io::Writer::from(&mut header_buf);
        writer.write_header(header)?;
    }
    writer.write_all(&header_buf)?;
    writer.flush()?;
    Ok(())
}

/// Serialize a BAM record to raw bytes, block size included
pub fn record_to_bytes(header: &SamHeader, record: &bam::Record) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    {
        let mut writer = bam::io::Writer::from(&mut data);
        writer.write_alignment_record(header, record)?;
    }
    Ok(data)
}

/// Writes re-marked records to a BGZF-compressed BAM stream.
pub struct BamSink<'h, W: Write> {
    header: &'h SamHeader,
    writer: BgzfWriter<W>,
    written: u64,
}

impl<'h> BamSink<'h, File> {
    /// Create `path` and write `header` to it.
    pub fn create(path: &Path, header: &'h SamHeader) -> Result<Self> {
        Self::new(File::create(path)?, header)
    }
}

impl<'h, W: Write> BamSink<'h, W> {
    pub fn new(inner: W, header: &'h SamHeader) -> Result<Self> {
        let mut writer = BgzfWriter::new(inner);
        write_header(&mut writer, header)?;
        Ok(Self {
            header,
            writer,
            written: 0,
        })
    }

    pub fn records_written(&self) -> u64 {
        self.written
    }

    /// Flush the final block and the BGZF EOF marker.
    pub fn finish(self) -> Result<W> {
        Ok(self.writer.finish()?)
    }
}

impl<W: Write> ReadSink<bam::Record> for BamSink<'_, W> {
    fn write_read(&mut self, marked: MarkedRead<bam::Record>) -> Result<()> {
        let mut data = record_to_bytes(self.header, &marked.read)?;
        if let Some(is_duplicate) = marked.duplicate {
            toggle_duplicate_flag(&mut data, is_duplicate);
        }
        self.writer.write_all(&data)?;
        self.written += 1;
        Ok(())
    }
}

impl AlignedRead for bam::Record {
    fn flags(&self) -> Flags {
        bam::Record::flags(self)
    }

    fn reference_index(&self) -> io::Result<Option<usize>> {
        self.reference_sequence_id().transpose()
    }

    fn mate_reference_index(&self) -> io::Result<Option<usize>> {
        self.mate_reference_sequence_id().transpose()
    }

    fn five_prime_coordinate(&self) -> io::Result<i32> {
        let Some(start) = self.alignment_start().transpose()? else {
            return Ok(0);
        };
        let start = start.get() as i32;
        let ops: Vec<_> = self.cigar().iter().collect::<io::Result<_>>()?;
        let is_clip = |kind: Kind| matches!(kind, Kind::SoftClip | Kind::HardClip);

        if !bam::Record::flags(self).is_reverse_complemented() {
            let clipped: i32 = ops
                .iter()
                .take_while(|op| is_clip(op.kind()))
                .map(|op| op.len() as i32)
                .sum();
            Ok(start - clipped)
        } else {
            let ref_span: i32 = ops
                .iter()
                .filter(|op| op.kind().consumes_reference())
                .map(|op| op.len() as i32)
                .sum();
            let clipped_end: i32 = ops
                .iter()
                .rev()
                .take_while(|op| is_clip(op.kind()))
                .map(|op| op.len() as i32)
                .sum();
            Ok(start + ref_span.max(1) - 1 + clipped_end)
        }
    }

    fn reference_length(&self) -> io::Result<u32> {
        let mut span = 0u32;
        for op in self.cigar().iter() {
            let op = op?;
            if op.kind().consumes_reference() {
                span += op.len() as u32;
            }
        }
        Ok(span)
    }

    fn read_name(&self) -> Option<&[u8]> {
        self.name().map(|name| -> &[u8] { name.as_ref() })
    }

    fn base_quality_sum(&self, min_quality: u8) -> u32 {
        self.quality_scores()
            .as_ref()
            .iter()
            .filter(|&&q| q >= min_quality)
            .map(|&q| q as u32)
            .sum()
    }

    fn string_tag(&self, tag: Tag) -> Option<BString> {
        match self.data().get(&tag)? {
            Ok(Value::String(s)) => Some(BString::from(s.to_vec())),
            _ => None,
        }
    }
}

pub type SpillWriter = FrameEncoder<BufWriter<File>>;

/// Start a new spill run; records are appended with [`SpoolRecord::write_to`].
pub fn create_spill_run(path: &Path) -> io::Result<SpillWriter> {
    Ok(FrameEncoder::new(BufWriter::with_capacity(
        1 << 20,
        File::create(path)?,
    )))
}

/// Close the LZ4 frame and flush it to disk
pub fn finish_spill_run(writer: SpillWriter) -> io::Result<()> {
    let mut inner = writer.finish().map_err(io::Error::other)?;
    inner.flush()
}

/// Write one sorted spill run as an LZ4 frame
pub fn write_spill_run<T: SpoolRecord>(records: &[T], path: &Path) -> io::Result<()> {
    let mut enc = create_spill_run(path)?;
    for record in records {
        record.write_to(&mut enc)?;
    }
    finish_spill_run(enc)
}

/// Open a spill run for reading
pub fn open_spill_run(path: &Path) -> io::Result<BufReader<FrameDecoder<File>>> {
    Ok(BufReader::with_capacity(
        1 << 18,
        FrameDecoder::new(File::open(path)?),
    ))
}
