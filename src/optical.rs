//! Optical duplicate detection
//!
//! Reads in a duplicate set that sit close together on the same tile of the
//! flowcell are most likely one cluster read twice. They are counted per
//! library; they never change which reads are marked.

use crate::errors::MarkDupError;
use crate::library::LibraryIdGenerator;
use crate::read_ends::{Orientation, PhysicalLocation, ReadEnd};

/// Default maximum offset, in pixels, between optical duplicates.
pub const DEFAULT_OPTICAL_PIXEL_DISTANCE: i32 = 100;

/// Decodes the flowcell position embedded in a read name.
pub trait ReadNameParser: Send + Sync {
    /// `(tile, x, y)`, or `None` when the name carries no location.
    fn parse(&self, name: &[u8]) -> Option<(i16, i32, i32)>;
}

/// Colon-delimited Illumina names: with 5 fields the last three are
/// tile, x and y; with 7 fields (Casava 1.8) likewise.
#[derive(Debug, Clone, Copy, Default)]
pub struct IlluminaReadNameParser;

impl ReadNameParser for IlluminaReadNameParser {
    fn parse(&self, name: &[u8]) -> Option<(i16, i32, i32)> {
        let fields: Vec<&[u8]> = name.split(|&b| b == b':').collect();
        let (tile, x, y) = match fields.len() {
            5 => (fields[2], fields[3], fields[4]),
            7 => (fields[4], fields[5], fields[6]),
            _ => return None,
        };
        let tile = i16::try_from(leading_int(tile)?).ok()?;
        Some((tile, leading_int(x)?, leading_int(y)?))
    }
}

/// Parse the leading decimal digits of a field, ignoring any suffix such as
/// `#0/1`.
fn leading_int(field: &[u8]) -> Option<i32> {
    let (negative, digits) = match field.first() {
        Some(b'-') => (true, &field[1..]),
        _ => (false, field),
    };
    let len = digits.iter().take_while(|b| b.is_ascii_digit()).count();
    if len == 0 {
        return None;
    }
    let mut value: i32 = 0;
    for &d in &digits[..len] {
        value = value.checked_mul(10)?.checked_add((d - b'0') as i32)?;
    }
    Some(if negative { -value } else { value })
}

pub struct OpticalDuplicateFinder {
    pixel_distance: i32,
    parser: Box<dyn ReadNameParser>,
}

impl Default for OpticalDuplicateFinder {
    fn default() -> Self {
        Self::new(DEFAULT_OPTICAL_PIXEL_DISTANCE)
    }
}

impl OpticalDuplicateFinder {
    pub fn new(pixel_distance: i32) -> Self {
        Self::with_parser(pixel_distance, Box::new(IlluminaReadNameParser))
    }

    pub fn with_parser(pixel_distance: i32, parser: Box<dyn ReadNameParser>) -> Self {
        Self {
            pixel_distance,
            parser,
        }
    }

    /// Location of a read, or `None` when the name cannot be parsed.
    pub fn location(&self, name: &[u8], read_group: i16) -> Option<PhysicalLocation> {
        let (tile, x, y) = self.parser.parse(name)?;
        Some(PhysicalLocation {
            read_group,
            tile,
            x,
            y,
        })
    }

    /// Flag every entry lying within the pixel distance of an earlier entry
    /// on the same read group and tile.
    pub fn find_optical_duplicates(&self, locations: &[PhysicalLocation]) -> Vec<bool> {
        let mut flags = vec![false; locations.len()];
        for (i, lhs) in locations.iter().enumerate() {
            if !lhs.has_location() {
                continue;
            }
            for (j, rhs) in locations.iter().enumerate().skip(i + 1) {
                if flags[j] || !rhs.has_location() {
                    continue;
                }
                if lhs.read_group == rhs.read_group
                    && lhs.tile == rhs.tile
                    && (lhs.x - rhs.x).abs() <= self.pixel_distance
                    && (lhs.y - rhs.y).abs() <= self.pixel_distance
                {
                    flags[j] = true;
                }
            }
        }
        flags
    }
}

/// Count optical duplicates in a duplicate set of pair ends and add them to
/// the library's counter.
///
/// When the set holds both FR and RF pairs (by first-of-pair strand), the two
/// are treated as separate sets, and any other orientation is an error.
pub fn track_optical_duplicates(
    ends: &[ReadEnd],
    finder: &OpticalDuplicateFinder,
    libraries: &mut LibraryIdGenerator,
) -> Result<(), MarkDupError> {
    let has_fr = ends
        .iter()
        .any(|e| e.orientation_for_optical_duplicates == Orientation::FR);
    let has_rf = ends
        .iter()
        .any(|e| e.orientation_for_optical_duplicates == Orientation::RF);

    if has_fr && has_rf {
        let mut fr = Vec::new();
        let mut rf = Vec::new();
        for end in ends {
            match end.orientation_for_optical_duplicates {
                Orientation::FR => fr.push(end),
                Orientation::RF => rf.push(end),
                orientation => return Err(MarkDupError::UnexpectedOrientation { orientation }),
            }
        }
        count_optical_duplicates(&fr, finder, libraries);
        count_optical_duplicates(&rf, finder, libraries);
    } else {
        let all: Vec<&ReadEnd> = ends.iter().collect();
        count_optical_duplicates(&all, finder, libraries);
    }
    Ok(())
}

fn count_optical_duplicates(
    ends: &[&ReadEnd],
    finder: &OpticalDuplicateFinder,
    libraries: &mut LibraryIdGenerator,
) {
    let Some(first) = ends.first() else {
        return;
    };
    let locations: Vec<PhysicalLocation> = ends.iter().map(|e| e.location).collect();
    let count = finder
        .find_optical_duplicates(&locations)
        .into_iter()
        .filter(|&f| f)
        .count() as u64;
    libraries.record_optical_duplicates(first.library_id, count);
}
