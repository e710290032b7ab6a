//! Libraries, read groups and per-library duplication metrics

use std::collections::HashMap;

use bstr::BString;
use log::info;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::header::Header as SamHeader;

use crate::errors::MarkDupError;
use crate::read::AlignedRead;

/// Library name used when a read has no read group or the read group has no
/// `LB` field.
pub const UNKNOWN_LIBRARY: &str = "Unknown Library";

/// Duplication counters for one library.
///
/// The pair counters count reads while marking and are halved by
/// [`DuplicationMetrics::finalize`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DuplicationMetrics {
    pub library: String,
    pub unpaired_reads_examined: u64,
    pub read_pairs_examined: u64,
    pub secondary_or_supplementary_reads: u64,
    pub unmapped_reads: u64,
    pub unpaired_read_duplicates: u64,
    pub read_pair_duplicates: u64,
    pub read_pair_optical_duplicates: u64,
    pub percent_duplication: f64,
    pub estimated_library_size: Option<u64>,
}

impl DuplicationMetrics {
    pub fn new(library: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            ..Self::default()
        }
    }

    /// Halve the pair counters and fill in the derived fields.
    pub fn finalize(&mut self) {
        self.read_pairs_examined /= 2;
        self.read_pair_duplicates /= 2;
        self.calculate_derived_metrics();
    }

    pub fn calculate_derived_metrics(&mut self) {
        self.estimated_library_size = estimate_library_size(
            self.read_pairs_examined
                .saturating_sub(self.read_pair_optical_duplicates),
            self.read_pairs_examined
                .saturating_sub(self.read_pair_duplicates),
        );

        let examined = self.unpaired_reads_examined + self.read_pairs_examined * 2;
        self.percent_duplication = if examined == 0 {
            0.0
        } else {
            (self.unpaired_read_duplicates + self.read_pair_duplicates * 2) as f64
                / examined as f64
        };
    }
}

/// Lander-Waterman estimate of the number of distinct molecules in a library
///
/// Solves `c/x = 1 - exp(-n/x)` for `x` by bisection, where `n` is the number
/// of read pairs and `c` the number of distinct pairs. `None` when there are
/// no pairs or no duplicates.
pub fn estimate_library_size(read_pairs: u64, unique_read_pairs: u64) -> Option<u64> {
    if read_pairs == 0 || unique_read_pairs >= read_pairs || unique_read_pairs == 0 {
        return None;
    }
    let n = read_pairs as f64;
    let c = unique_read_pairs as f64;
    let f = |x: f64| c / x - 1.0 + (-n / x).exp();

    let mut m = 1.0;
    let mut upper = 100.0;
    if f(m * c) < 0.0 {
        return None;
    }
    while f(upper * c) >= 0.0 {
        upper *= 10.0;
    }
    for _ in 0..40 {
        let r = (m + upper) / 2.0;
        let u = f(r * c);
        if u == 0.0 {
            break;
        } else if u > 0.0 {
            m = r;
        } else {
            upper = r;
        }
    }
    Some((c * (m + upper) / 2.0) as u64)
}

/// Maps reads to library ids and read-group indices, and owns the
/// per-library metrics for a run.
#[derive(Debug, Default)]
pub struct LibraryIdGenerator {
    read_group_libraries: HashMap<BString, String>,
    read_group_indices: HashMap<BString, i16>,
    library_ids: HashMap<String, i16>,
    metrics: HashMap<i16, DuplicationMetrics>,
    optical_duplicates: HashMap<i16, u64>,
    optical_duplicate_sets: u64,
}

/// Ids and indices are stored as `i16` in read ends.
fn checked_id(value: usize, what: &'static str) -> Result<i16, MarkDupError> {
    i16::try_from(value).map_err(|_| MarkDupError::TooMany {
        what,
        limit: i16::MAX as usize,
    })
}

impl LibraryIdGenerator {
    /// Index the header's read groups; ids are assigned lazily as reads are
    /// seen, starting at 1.
    pub fn from_header(header: &SamHeader) -> Result<Self, MarkDupError> {
        let mut generator = Self::default();
        for (index, (id, rg)) in header.read_groups().iter().enumerate() {
            let lib_name = rg
                .other_fields()
                .get(Tag::LIBRARY.as_ref())
                .map(|v| v.to_string())
                .unwrap_or_else(|| UNKNOWN_LIBRARY.to_string());
            let index = checked_id(index, "read groups")?;
            generator
                .read_group_libraries
                .insert(id.clone(), lib_name);
            generator
                .read_group_indices
                .entry(id.clone())
                .or_insert(index);
        }
        Ok(generator)
    }

    /// Register a read group directly, mostly for tests.
    pub fn add_read_group(&mut self, id: &str, library: Option<&str>) -> Result<(), MarkDupError> {
        let next = checked_id(self.read_group_indices.len(), "read groups")?;
        self.read_group_indices.entry(BString::from(id)).or_insert(next);
        self.read_group_libraries.insert(
            BString::from(id),
            library.unwrap_or(UNKNOWN_LIBRARY).to_string(),
        );
        Ok(())
    }

    pub fn library_name<R: AlignedRead>(&self, read: &R) -> &str {
        read.read_group()
            .and_then(|rg| self.read_group_libraries.get(&rg))
            .map_or(UNKNOWN_LIBRARY, String::as_str)
    }

    /// Id of the read's library, assigning the next free one on first sight.
    pub fn library_id<R: AlignedRead>(&mut self, read: &R) -> Result<i16, MarkDupError> {
        let name = self.library_name(read);
        if let Some(&id) = self.library_ids.get(name) {
            return Ok(id);
        }
        let name = name.to_string();
        let id = checked_id(self.library_ids.len() + 1, "libraries")?;
        self.library_ids.insert(name, id);
        Ok(id)
    }

    /// Position of the read group in the header, 0 when unknown.
    pub fn read_group_index(&self, read_group: Option<&BString>) -> i16 {
        read_group
            .and_then(|rg| self.read_group_indices.get(rg))
            .copied()
            .unwrap_or(0)
    }

    /// Metrics of a library id handed out by [`Self::library_id`].
    pub fn metrics_mut(&mut self, library_id: i16) -> &mut DuplicationMetrics {
        let library_ids = &self.library_ids;
        self.metrics.entry(library_id).or_insert_with(|| {
            let name = library_ids
                .iter()
                .find(|&(_, &id)| id == library_id)
                .map_or(UNKNOWN_LIBRARY, |(name, _)| name.as_str());
            DuplicationMetrics::new(name)
        })
    }

    /// Add optical duplicates found in one duplicate set.
    pub fn record_optical_duplicates(&mut self, library_id: i16, count: u64) {
        if count > 0 {
            *self.optical_duplicates.entry(library_id).or_default() += count;
            self.optical_duplicate_sets += 1;
        }
    }

    pub fn optical_duplicates(&self, library_id: i16) -> u64 {
        self.optical_duplicates.get(&library_id).copied().unwrap_or(0)
    }

    /// Optical duplicates over every library.
    pub fn total_optical_duplicates(&self) -> u64 {
        self.optical_duplicates.values().sum()
    }

    /// Number of duplicate sets that contained at least one optical duplicate.
    pub fn optical_duplicate_sets(&self) -> u64 {
        self.optical_duplicate_sets
    }

    /// Attach optical counts, finalize every library, and return them sorted
    /// by library name.
    pub fn finalize(mut self) -> Vec<DuplicationMetrics> {
        for (id, count) in std::mem::take(&mut self.optical_duplicates) {
            self.metrics_mut(id).read_pair_optical_duplicates = count;
        }
        let mut metrics: Vec<_> = self.metrics.into_values().collect();
        metrics.sort_by(|a, b| a.library.cmp(&b.library));
        for m in &mut metrics {
            m.finalize();
        }
        metrics
    }
}

/// Log one line per library.
pub fn log_metrics(metrics: &[DuplicationMetrics]) {
    for m in metrics {
        info!(
            "{}: {} unpaired, {} pairs examined; {} unpaired dups, {} pair dups ({} optical); \
             {} unmapped; {:.4} duplication; estimated size {}",
            m.library,
            m.unpaired_reads_examined,
            m.read_pairs_examined,
            m.unpaired_read_duplicates,
            m.read_pair_duplicates,
            m.read_pair_optical_duplicates,
            m.unmapped_reads,
            m.percent_duplication,
            m.estimated_library_size
                .map_or_else(|| "n/a".to_string(), |n| n.to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read::testing::TestRead;

    fn read_in(rg: Option<&str>) -> TestRead {
        let read = TestRead::fragment("q", 0, 1);
        match rg {
            Some(rg) => read.with_tag(Tag::READ_GROUP, rg),
            None => read,
        }
    }

    #[test]
    fn test_library_ids_start_at_one() {
        let mut generator = LibraryIdGenerator::default();
        generator.add_read_group("rg1", Some("libA")).unwrap();
        generator.add_read_group("rg2", Some("libB")).unwrap();
        generator.add_read_group("rg3", Some("libA")).unwrap();

        assert_eq!(generator.library_id(&read_in(Some("rg2"))).unwrap(), 1);
        assert_eq!(generator.library_id(&read_in(Some("rg1"))).unwrap(), 2);
        assert_eq!(generator.library_id(&read_in(Some("rg3"))).unwrap(), 2);
        assert_eq!(generator.library_id(&read_in(None)).unwrap(), 3);
        assert_eq!(generator.library_name(&read_in(None)), UNKNOWN_LIBRARY);
        assert_eq!(generator.library_name(&read_in(Some("zz"))), UNKNOWN_LIBRARY);
    }

    #[test]
    fn test_read_group_without_library() {
        let mut generator = LibraryIdGenerator::default();
        generator.add_read_group("rg1", None).unwrap();
        assert_eq!(generator.library_name(&read_in(Some("rg1"))), UNKNOWN_LIBRARY);
    }

    #[test]
    fn test_read_group_index() {
        let mut generator = LibraryIdGenerator::default();
        generator.add_read_group("a", None).unwrap();
        generator.add_read_group("b", None).unwrap();
        assert_eq!(generator.read_group_index(Some(&BString::from("b"))), 1);
        assert_eq!(generator.read_group_index(Some(&BString::from("x"))), 0);
        assert_eq!(generator.read_group_index(None), 0);
    }

    #[test]
    fn test_id_overflow_is_an_error() {
        let mut generator = LibraryIdGenerator::default();
        for i in 0..i16::MAX {
            let rg = format!("rg{i}");
            let lib = format!("lib{i}");
            generator.add_read_group(&rg, Some(lib.as_str())).unwrap();
            generator.library_id(&read_in(Some(rg.as_str()))).unwrap();
        }
        // read-group index 32767 still fits, library id 32768 does not
        generator.add_read_group("last", Some("last")).unwrap();
        assert!(matches!(
            generator.library_id(&read_in(Some("last"))),
            Err(MarkDupError::TooMany { what: "libraries", .. })
        ));
        assert!(matches!(
            generator.add_read_group("overflow", None),
            Err(MarkDupError::TooMany { what: "read groups", .. })
        ));
    }

    #[test]
    fn test_metrics_are_keyed_by_library_id() {
        let mut generator = LibraryIdGenerator::default();
        generator.add_read_group("a", Some("libZ")).unwrap();
        generator.add_read_group("b", Some("libA")).unwrap();
        let z = generator.library_id(&read_in(Some("a"))).unwrap();
        let a = generator.library_id(&read_in(Some("b"))).unwrap();
        generator.metrics_mut(z).unmapped_reads += 1;
        generator.metrics_mut(a).unmapped_reads += 2;
        generator.metrics_mut(z).unmapped_reads += 1;

        let metrics = generator.finalize();
        let summary: Vec<(&str, u64)> = metrics
            .iter()
            .map(|m| (m.library.as_str(), m.unmapped_reads))
            .collect();
        assert_eq!(summary, vec![("libA", 2), ("libZ", 2)]);
    }

    #[test]
    fn test_finalize_halves_pairs_and_derives() {
        let mut generator = LibraryIdGenerator::default();
        let id = generator.library_id(&read_in(None)).unwrap();
        let m = generator.metrics_mut(id);
        m.unpaired_reads_examined = 10;
        m.unpaired_read_duplicates = 2;
        m.read_pairs_examined = 200;
        m.read_pair_duplicates = 40;
        generator.record_optical_duplicates(id, 3);
        generator.record_optical_duplicates(id, 0);
        generator.record_optical_duplicates(id, 2);
        assert_eq!(generator.optical_duplicate_sets(), 2);
        assert_eq!(generator.total_optical_duplicates(), 5);

        let metrics = generator.finalize();
        assert_eq!(metrics.len(), 1);
        let m = &metrics[0];
        assert_eq!(m.library, UNKNOWN_LIBRARY);
        assert_eq!(m.read_pairs_examined, 100);
        assert_eq!(m.read_pair_duplicates, 20);
        assert_eq!(m.read_pair_optical_duplicates, 5);
        assert!((m.percent_duplication - 42.0 / 210.0).abs() < 1e-12);
        assert!(m.estimated_library_size.is_some());
    }

    #[test]
    fn test_percent_duplication_with_nothing_examined() {
        let mut m = DuplicationMetrics::new("x");
        m.finalize();
        assert_eq!(m.percent_duplication, 0.0);
        assert_eq!(m.estimated_library_size, None);
    }

    #[test]
    fn test_estimate_library_size() {
        assert_eq!(estimate_library_size(0, 0), None);
        assert_eq!(estimate_library_size(100, 100), None);

        // c/x = 1 - exp(-n/x) must hold at the estimate
        let (n, c) = (1_000_000u64, 800_000u64);
        let x = estimate_library_size(n, c).unwrap() as f64;
        let residual = c as f64 / x - 1.0 + (-(n as f64) / x).exp();
        assert!(residual.abs() < 1e-6, "residual {residual}");
        assert!(x > c as f64);
    }
}
