//! Read-end summaries used as sort and grouping keys
//!
//! A [`ReadEnd`] describes the 5' end of a single read (a fragment end) or
//! both 5' ends of a mapped pair (a pair end), with enough bookkeeping to find
//! the originating records again by their ordinal index in the input.

use std::cmp::Ordering;
use std::io::{self, Read, Write};

use crate::spool::{SpoolRecord, read_record_bytes};

/// Reference index / coordinate for read-2 fields of a fragment end.
pub const NO_POSITION: i32 = -1;

/// Strand combination of a read end.
///
/// Single-strand values apply to fragment ends, two-letter values to pairs
/// (read 1 first).
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Orientation {
    #[default]
    F = 0,
    R = 1,
    FF = 2,
    FR = 3,
    RR = 4,
    RF = 5,
}

impl Orientation {
    pub fn single(reverse: bool) -> Self {
        if reverse { Self::R } else { Self::F }
    }

    pub fn pair(read1_reverse: bool, read2_reverse: bool) -> Self {
        match (read1_reverse, read2_reverse) {
            (false, false) => Self::FF,
            (false, true) => Self::FR,
            (true, true) => Self::RR,
            (true, false) => Self::RF,
        }
    }

    /// Strand of a single end; for pairs this is the strand of read 1.
    pub fn is_reverse(self) -> bool {
        matches!(self, Self::R | Self::RR | Self::RF)
    }

    fn from_u8(b: u8) -> io::Result<Self> {
        match b {
            0 => Ok(Self::F),
            1 => Ok(Self::R),
            2 => Ok(Self::FF),
            3 => Ok(Self::FR),
            4 => Ok(Self::RR),
            5 => Ok(Self::RF),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid orientation byte {b}"),
            )),
        }
    }
}

/// Hashed barcode tag values; zero when a tag is absent or not configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Barcodes {
    pub barcode: i32,
    pub read_one: i32,
    pub read_two: i32,
}

/// Stable 32-bit value of a barcode tag string.
pub fn barcode_value(value: Option<&[u8]>) -> i32 {
    value.map_or(0, |bytes| {
        bytes
            .iter()
            .fold(0i32, |h, &b| h.wrapping_mul(31).wrapping_add(b as i32))
    })
}

/// Position of a cluster on the flowcell, decoded from the read name.
///
/// `tile` is negative when the name could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalLocation {
    pub read_group: i16,
    pub tile: i16,
    pub x: i32,
    pub y: i32,
}

impl Default for PhysicalLocation {
    fn default() -> Self {
        Self {
            read_group: -1,
            tile: -1,
            x: 0,
            y: 0,
        }
    }
}

impl PhysicalLocation {
    pub fn has_location(&self) -> bool {
        self.tile >= 0
    }
}

/// Sort/group key for duplicate detection.
///
/// Ordering: library, barcodes, read-1 position, orientation, pairing,
/// read-2 position, then the file indices, which makes the order total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadEnd {
    pub library_id: i16,
    pub barcodes: Barcodes,
    pub read1_reference_index: i32,
    pub read1_coordinate: i32,
    pub orientation: Orientation,
    pub read2_reference_index: i32,
    pub read2_coordinate: i32,
    pub read1_index_in_file: u64,
    pub read2_index_in_file: u64,
    pub score: u32,
    /// Strands in first-of-pair, second-of-pair order.
    pub orientation_for_optical_duplicates: Orientation,
    /// The read has a mapped mate (always true for pair ends).
    pub paired: bool,
    pub location: PhysicalLocation,
}

impl ReadEnd {
    /// A single-read end; read-2 fields hold [`NO_POSITION`].
    pub fn fragment(
        library_id: i16,
        reference_index: i32,
        coordinate: i32,
        reverse: bool,
        index_in_file: u64,
        score: u32,
    ) -> Self {
        Self {
            library_id,
            barcodes: Barcodes::default(),
            read1_reference_index: reference_index,
            read1_coordinate: coordinate,
            orientation: Orientation::single(reverse),
            read2_reference_index: NO_POSITION,
            read2_coordinate: NO_POSITION,
            read1_index_in_file: index_in_file,
            read2_index_in_file: index_in_file,
            score,
            orientation_for_optical_duplicates: Orientation::single(reverse),
            paired: false,
            location: PhysicalLocation::default(),
        }
    }

    /// Whether this end was built from a read whose mate is mapped.
    pub fn is_paired(&self) -> bool {
        self.paired
    }

    /// Both ends are filled in.
    pub fn is_pair_end(&self) -> bool {
        self.read2_reference_index != NO_POSITION
    }

    /// Binary size of one encoded end.
    pub const fn binary_size() -> usize {
        2 + 12 + 4 + 4 + 1 + 4 + 4 + 8 + 8 + 4 + 1 + 1 + 2 + 2 + 4 + 4 // 65 bytes
    }
}

impl PartialOrd for ReadEnd {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadEnd {
    fn cmp(&self, other: &Self) -> Ordering {
        self.library_id
            .cmp(&other.library_id)
            .then_with(|| self.barcodes.cmp(&other.barcodes))
            .then_with(|| self.read1_reference_index.cmp(&other.read1_reference_index))
            .then_with(|| self.read1_coordinate.cmp(&other.read1_coordinate))
            .then_with(|| self.orientation.cmp(&other.orientation))
            .then_with(|| self.paired.cmp(&other.paired))
            .then_with(|| self.read2_reference_index.cmp(&other.read2_reference_index))
            .then_with(|| self.read2_coordinate.cmp(&other.read2_coordinate))
            .then_with(|| self.read1_index_in_file.cmp(&other.read1_index_in_file))
            .then_with(|| self.read2_index_in_file.cmp(&other.read2_index_in_file))
    }
}

impl SpoolRecord for ReadEnd {
    const ENCODED_SIZE: usize = ReadEnd::binary_size();

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut buf = [0u8; Self::ENCODED_SIZE];
        let mut c = Cursor::new(&mut buf);
        c.put(&self.library_id.to_le_bytes());
        c.put(&self.barcodes.barcode.to_le_bytes());
        c.put(&self.barcodes.read_one.to_le_bytes());
        c.put(&self.barcodes.read_two.to_le_bytes());
        c.put(&self.read1_reference_index.to_le_bytes());
        c.put(&self.read1_coordinate.to_le_bytes());
        c.put(&[self.orientation as u8]);
        c.put(&self.read2_reference_index.to_le_bytes());
        c.put(&self.read2_coordinate.to_le_bytes());
        c.put(&self.read1_index_in_file.to_le_bytes());
        c.put(&self.read2_index_in_file.to_le_bytes());
        c.put(&self.score.to_le_bytes());
        c.put(&[self.orientation_for_optical_duplicates as u8, self.paired as u8]);
        c.put(&self.location.read_group.to_le_bytes());
        c.put(&self.location.tile.to_le_bytes());
        c.put(&self.location.x.to_le_bytes());
        c.put(&self.location.y.to_le_bytes());
        w.write_all(&buf)
    }

    fn read_from<R: Read>(r: &mut R) -> io::Result<Option<Self>> {
        let mut buf = [0u8; Self::ENCODED_SIZE];
        if !read_record_bytes(r, &mut buf)? {
            return Ok(None);
        }
        let mut c = Cursor::new(&mut buf);
        let library_id = i16::from_le_bytes(c.take());
        let barcodes = Barcodes {
            barcode: i32::from_le_bytes(c.take()),
            read_one: i32::from_le_bytes(c.take()),
            read_two: i32::from_le_bytes(c.take()),
        };
        let read1_reference_index = i32::from_le_bytes(c.take());
        let read1_coordinate = i32::from_le_bytes(c.take());
        let [orientation] = c.take();
        let read2_reference_index = i32::from_le_bytes(c.take());
        let read2_coordinate = i32::from_le_bytes(c.take());
        let read1_index_in_file = u64::from_le_bytes(c.take());
        let read2_index_in_file = u64::from_le_bytes(c.take());
        let score = u32::from_le_bytes(c.take());
        let [optical, paired] = c.take();
        let location = PhysicalLocation {
            read_group: i16::from_le_bytes(c.take()),
            tile: i16::from_le_bytes(c.take()),
            x: i32::from_le_bytes(c.take()),
            y: i32::from_le_bytes(c.take()),
        };

        Ok(Some(Self {
            library_id,
            barcodes,
            read1_reference_index,
            read1_coordinate,
            orientation: Orientation::from_u8(orientation)?,
            read2_reference_index,
            read2_coordinate,
            read1_index_in_file,
            read2_index_in_file,
            score,
            orientation_for_optical_duplicates: Orientation::from_u8(optical)?,
            paired: paired != 0,
            location,
        }))
    }

    fn estimated_size() -> usize {
        std::mem::size_of::<ReadEnd>()
    }
}

/// Fixed-layout reader/writer over the encode buffer.
struct Cursor<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }
}

/// First mate of a pair, waiting for the second one.
#[derive(Debug, Clone)]
pub struct PendingPair {
    end: ReadEnd,
}

impl PendingPair {
    /// `first_seen` is the fragment end built from the first mate; its
    /// `read2_reference_index` becomes the mate's reference index.
    pub fn new(first_seen: ReadEnd, mate_reference_index: i32) -> Self {
        let mut end = first_seen;
        end.read2_reference_index = mate_reference_index;
        end.paired = true;
        Self { end }
    }

    pub fn mate_reference_index(&self) -> i32 {
        self.end.read2_reference_index
    }

    /// Combine with the fragment end of the second mate.
    ///
    /// The end at the lower (reference, coordinate) becomes read 1; the later
    /// mate wins ties. Optical orientation always lists the first-of-pair
    /// strand first.
    pub fn complete(self, mate: &ReadEnd, mate_is_first_of_pair: bool) -> ReadEnd {
        let stored = self.end;
        let stored_reverse = stored.orientation.is_reverse();
        let mate_reverse = mate.orientation.is_reverse();

        let orientation_for_optical_duplicates = if mate_is_first_of_pair {
            Orientation::pair(mate_reverse, stored_reverse)
        } else {
            Orientation::pair(stored_reverse, mate_reverse)
        };

        let mut barcodes = stored.barcodes;
        if mate_is_first_of_pair {
            barcodes.read_one = mate.barcodes.read_one;
        } else {
            barcodes.read_two = mate.barcodes.read_two;
        }

        let mate_is_later = (mate.read1_reference_index, mate.read1_coordinate)
            >= (stored.read1_reference_index, stored.read1_coordinate);

        let (read1, read2, read1_reverse, read2_reverse) = if mate_is_later {
            (&stored, mate, stored_reverse, mate_reverse)
        } else {
            (mate, &stored, mate_reverse, stored_reverse)
        };

        ReadEnd {
            library_id: stored.library_id,
            barcodes,
            read1_reference_index: read1.read1_reference_index,
            read1_coordinate: read1.read1_coordinate,
            orientation: Orientation::pair(read1_reverse, read2_reverse),
            read2_reference_index: read2.read1_reference_index,
            read2_coordinate: read2.read1_coordinate,
            read1_index_in_file: read1.read1_index_in_file,
            read2_index_in_file: read2.read1_index_in_file,
            score: stored.score + mate.score,
            orientation_for_optical_duplicates,
            paired: true,
            location: stored.location,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(reference: i32, coordinate: i32, reverse: bool, index: u64, score: u32) -> ReadEnd {
        ReadEnd::fragment(1, reference, coordinate, reverse, index, score)
    }

    #[test]
    fn test_orientation_bytes() {
        assert_eq!(Orientation::pair(false, true), Orientation::FR);
        assert_eq!(Orientation::pair(true, false), Orientation::RF);
        assert_eq!(Orientation::pair(true, true), Orientation::RR);
        assert_eq!(Orientation::single(true), Orientation::R);
        assert!(Orientation::RF.is_reverse());
        assert!(!Orientation::FR.is_reverse());
        for b in 0..6u8 {
            assert_eq!(Orientation::from_u8(b).unwrap() as u8, b);
        }
        assert!(Orientation::from_u8(6).is_err());
    }

    #[test]
    fn test_fragment_has_sentinel_read2() {
        let end = frag(0, 100, false, 3, 40);
        assert_eq!(end.read2_reference_index, NO_POSITION);
        assert_eq!(end.read2_coordinate, NO_POSITION);
        assert!(!end.is_pair_end());
        assert!(!end.is_paired());
    }

    #[test]
    fn test_codec_roundtrip_pair() {
        let first = frag(1, 1000, false, 10, 30);
        let mut end = PendingPair::new(first, 1).complete(&frag(1, 1200, true, 11, 15), false);
        end.barcodes = Barcodes {
            barcode: -5,
            read_one: 7,
            read_two: i32::MAX,
        };
        end.location = PhysicalLocation {
            read_group: 2,
            tile: 1101,
            x: 15000,
            y: 27000,
        };

        let mut buf = Vec::new();
        end.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), ReadEnd::binary_size());
        let back = ReadEnd::read_from(&mut io::Cursor::new(buf)).unwrap().unwrap();
        assert_eq!(back, end);
    }

    #[test]
    fn test_read_from_empty() {
        let mut cursor = io::Cursor::new(Vec::new());
        assert!(ReadEnd::read_from(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_binary_size() {
        assert_eq!(ReadEnd::binary_size(), 65);
    }

    #[test]
    fn test_ordering() {
        // position first
        assert!(frag(0, 100, false, 5, 0) < frag(0, 200, false, 1, 0));
        // then orientation
        assert!(frag(0, 100, false, 5, 0) < frag(0, 100, true, 1, 0));
        // then file index
        assert!(frag(0, 100, false, 1, 0) < frag(0, 100, false, 2, 0));
        // library dominates everything
        let mut other_lib = frag(0, 1, false, 0, 0);
        other_lib.library_id = 2;
        assert!(frag(5, 9999, true, 9, 0) < other_lib);
        // unpaired fragments sort before paired ones at the same position
        let paired = PendingPair::new(frag(0, 100, false, 1, 0), 0).end;
        assert!(frag(0, 100, false, 9, 0) < paired);
    }

    #[test]
    fn test_complete_second_mate_later() {
        let first = frag(1, 1000, false, 10, 30);
        let pending = PendingPair::new(first, 1);
        assert_eq!(pending.mate_reference_index(), 1);

        let end = pending.complete(&frag(1, 1200, true, 11, 45), false);
        assert_eq!(
            (end.read1_reference_index, end.read1_coordinate),
            (1, 1000)
        );
        assert_eq!(
            (end.read2_reference_index, end.read2_coordinate),
            (1, 1200)
        );
        assert_eq!(end.orientation, Orientation::FR);
        assert_eq!((end.read1_index_in_file, end.read2_index_in_file), (10, 11));
        assert_eq!(end.score, 75);
        assert_eq!(end.orientation_for_optical_duplicates, Orientation::FR);
        assert!(end.is_pair_end() && end.is_paired());
    }

    #[test]
    fn test_complete_swaps_when_mate_is_earlier() {
        // stored mate is reverse at 1200, arriving mate is forward at 1000
        let pending = PendingPair::new(frag(1, 1200, true, 20, 10), 1);
        let end = pending.complete(&frag(1, 1000, false, 21, 10), true);
        assert_eq!(end.read1_coordinate, 1000);
        assert_eq!(end.read2_coordinate, 1200);
        assert_eq!((end.read1_index_in_file, end.read2_index_in_file), (21, 20));
        assert_eq!(end.orientation, Orientation::FR);
        // first-of-pair is the arriving forward mate
        assert_eq!(end.orientation_for_optical_duplicates, Orientation::FR);
    }

    #[test]
    fn test_optical_orientation_follows_pair_order() {
        // first-of-pair is reverse and genomically later
        let pending = PendingPair::new(frag(0, 500, false, 1, 0), 0);
        let end = pending.complete(&frag(0, 800, true, 2, 0), true);
        assert_eq!(end.orientation, Orientation::FR);
        assert_eq!(end.orientation_for_optical_duplicates, Orientation::RF);
    }

    #[test]
    fn test_complete_tie_keeps_stored_as_read1() {
        let pending = PendingPair::new(frag(0, 500, true, 1, 0), 0);
        let end = pending.complete(&frag(0, 500, false, 2, 0), false);
        assert_eq!((end.read1_index_in_file, end.read2_index_in_file), (1, 2));
        assert_eq!(end.orientation, Orientation::RF);
    }

    #[test]
    fn test_complete_takes_mate_barcode() {
        let mut first = frag(0, 1, false, 1, 0);
        first.barcodes = Barcodes {
            barcode: 9,
            read_one: 3,
            read_two: 0,
        };
        let mut mate = frag(0, 2, true, 2, 0);
        mate.barcodes.read_two = 4;
        let end = PendingPair::new(first, 0).complete(&mate, false);
        assert_eq!(
            end.barcodes,
            Barcodes {
                barcode: 9,
                read_one: 3,
                read_two: 4
            }
        );
    }

    #[test]
    fn test_barcode_value() {
        assert_eq!(barcode_value(None), 0);
        assert_eq!(barcode_value(Some(b"")), 0);
        // same as java.lang.String#hashCode for ASCII
        assert_eq!(barcode_value(Some(b"AC")), 65 * 31 + 67);
        assert_ne!(barcode_value(Some(b"ACGT")), barcode_value(Some(b"ACGA")));
    }
}
