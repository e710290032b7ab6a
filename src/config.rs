//! Run configuration for duplicate marking

use std::path::PathBuf;

use noodles::sam::alignment::record::data::field::Tag;

use crate::errors::MarkDupError;
use crate::optical::DEFAULT_OPTICAL_PIXEL_DISTANCE;
use crate::scoring::ScoringStrategy;

pub const DEFAULT_MAX_MEMORY: usize = 2 << 30;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct MarkDupConfig {
    /// Memory ceiling for the spools, in bytes
    pub max_memory: usize,
    /// In-flight reads between the reader thread and the worker thread
    pub channel_capacity: usize,
    /// Scratch roots for spill files; the system temp dir when empty
    pub tmp_dirs: Vec<PathBuf>,
    pub barcode_tag: Option<Tag>,
    pub read_one_barcode_tag: Option<Tag>,
    pub read_two_barcode_tag: Option<Tag>,
    pub optical_duplicates: bool,
    pub optical_pixel_distance: i32,
    pub scoring_strategy: ScoringStrategy,
    pub remove_duplicates: bool,
    pub threads: usize,
}

impl Default for MarkDupConfig {
    fn default() -> Self {
        Self {
            max_memory: DEFAULT_MAX_MEMORY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            tmp_dirs: Vec::new(),
            barcode_tag: None,
            read_one_barcode_tag: None,
            read_two_barcode_tag: None,
            optical_duplicates: false,
            optical_pixel_distance: DEFAULT_OPTICAL_PIXEL_DISTANCE,
            scoring_strategy: ScoringStrategy::default(),
            remove_duplicates: false,
            threads: 1,
        }
    }
}

impl MarkDupConfig {
    pub fn validate(&self) -> Result<(), MarkDupError> {
        if self.channel_capacity == 0 {
            return Err(invalid("channel_capacity", "must be at least 1"));
        }
        if self.threads == 0 {
            return Err(invalid("threads", "must be at least 1"));
        }
        if self.optical_pixel_distance < 0 {
            return Err(invalid("optical_pixel_distance", "must not be negative"));
        }
        if let Some(dir) = self.tmp_dirs.iter().find(|d| !d.is_dir()) {
            return Err(invalid(
                "tmp_dir",
                &format!("{} is not a directory", dir.display()),
            ));
        }
        Ok(())
    }

    pub fn use_barcodes(&self) -> bool {
        self.barcode_tag.is_some()
            || self.read_one_barcode_tag.is_some()
            || self.read_two_barcode_tag.is_some()
    }

    /// Budget for each of the pair and fragment spools.
    pub fn read_end_spool_budget(&self) -> usize {
        self.max_memory / 4
    }

    /// Budget for the duplicate index spool.
    pub fn index_spool_budget(&self) -> usize {
        self.max_memory / 20
    }

    pub fn parallel_sort(&self) -> bool {
        self.threads > 1
    }
}

fn invalid(parameter: &str, reason: &str) -> MarkDupError {
    MarkDupError::InvalidParameter {
        parameter: parameter.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = MarkDupConfig::default();
        config.validate().unwrap();
        assert!(!config.use_barcodes());
        assert!(!config.parallel_sort());
    }

    #[test]
    fn test_budget_split() {
        let config = MarkDupConfig {
            max_memory: 2000,
            ..MarkDupConfig::default()
        };
        assert_eq!(config.read_end_spool_budget(), 500);
        assert_eq!(config.index_spool_budget(), 100);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let config = MarkDupConfig {
            channel_capacity: 0,
            ..MarkDupConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("channel_capacity"));
    }

    #[test]
    fn test_rejects_missing_tmp_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let config = MarkDupConfig {
            tmp_dirs: vec![tmp.path().to_path_buf(), tmp.path().join("nope")],
            ..MarkDupConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_any_barcode_tag_enables_barcodes() {
        let config = MarkDupConfig {
            read_two_barcode_tag: Some(Tag::from([b'B', b'2'])),
            ..MarkDupConfig::default()
        };
        assert!(config.use_barcodes());
    }
}
