//! Bounded-memory external sort
//!
//! A [`SortingSpool`] buffers records in memory up to a budget, spills sorted
//! runs to LZ4-compressed scratch files, and hands back a single ascending
//! iteration that merges the spilled runs with whatever is left in memory.
//!
//! # Ordering
//!
//! Runs are sorted with a stable sort and merged with ties broken by run
//! number, so records that compare equal come out in the order they were
//! added. Spilled runs always hold older records than the in-memory run.
//!
//! # Fan-in
//!
//! At most `max_open_runs` spill files are open at once. When more runs than
//! that exist, consecutive runs are merged in batches into intermediate runs
//! before the final merge, which keeps both file descriptors and reader
//! buffers bounded.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use lz4_flex::frame::FrameDecoder;
use log::debug;
use rayon::prelude::*;
use tempfile::{Builder, TempDir};

use crate::errors::MarkDupError;
use crate::io::{create_spill_run, finish_spill_run, open_spill_run, write_spill_run};

/// A record that can be kept in a [`SortingSpool`].
///
/// `Ord` is the sort order; the codec must write exactly `ENCODED_SIZE`
/// bytes per record.
pub trait SpoolRecord: Ord + Send + Sized {
    const ENCODED_SIZE: usize;

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()>;

    /// Returns `Ok(None)` at a clean end of stream.
    fn read_from<R: Read>(r: &mut R) -> io::Result<Option<Self>>;

    /// In-memory footprint used for budgeting.
    fn estimated_size() -> usize {
        std::mem::size_of::<Self>().max(1)
    }
}

/// Fill `buf` completely, or report a clean end of stream if nothing at all
/// could be read.
pub(crate) fn read_record_bytes<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated spill record",
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

impl SpoolRecord for u64 {
    const ENCODED_SIZE: usize = 8;

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.to_le_bytes())
    }

    fn read_from<R: Read>(r: &mut R) -> io::Result<Option<Self>> {
        let mut buf = [0u8; 8];
        if !read_record_bytes(r, &mut buf)? {
            return Ok(None);
        }
        Ok(Some(u64::from_le_bytes(buf)))
    }
}

/// Spill files merged at once.
pub const DEFAULT_MAX_OPEN_RUNS: usize = 128;

/// Spool of duplicate record indices.
pub type IndexSpool = SortingSpool<u64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpoolState {
    Adding,
    Done,
    Consumed,
}

pub struct SortingSpool<T> {
    label: &'static str,
    buffer: Vec<T>,
    max_records_in_ram: usize,
    scratch_roots: Vec<PathBuf>,
    scratch_dirs: Vec<Option<TempDir>>,
    runs: Vec<PathBuf>,
    runs_created: usize,
    max_open_runs: usize,
    state: SpoolState,
    parallel_sort: bool,
    total_records: u64,
}

impl<T: SpoolRecord> SortingSpool<T> {
    /// Create a spool that keeps roughly `memory_budget` bytes of records in
    /// memory and spills into fresh directories under `scratch_roots`
    /// (the system temp dir when empty).
    pub fn new(label: &'static str, memory_budget: usize, scratch_roots: &[PathBuf]) -> Self {
        let max_records_in_ram = (memory_budget / T::estimated_size()).max(1);
        let scratch_roots = if scratch_roots.is_empty() {
            vec![std::env::temp_dir()]
        } else {
            scratch_roots.to_vec()
        };
        let scratch_dirs = scratch_roots.iter().map(|_| None).collect();
        Self {
            label,
            buffer: Vec::new(),
            max_records_in_ram,
            scratch_roots,
            scratch_dirs,
            runs: Vec::new(),
            runs_created: 0,
            max_open_runs: DEFAULT_MAX_OPEN_RUNS,
            state: SpoolState::Adding,
            parallel_sort: false,
            total_records: 0,
        }
    }

    /// Sort runs with rayon instead of on the calling thread.
    pub fn with_parallel_sort(mut self, enabled: bool) -> Self {
        self.parallel_sort = enabled;
        self
    }

    /// Cap the number of spill files open during a merge (at least 2).
    pub fn with_max_open_runs(mut self, max_open_runs: usize) -> Self {
        self.max_open_runs = max_open_runs.max(2);
        self
    }

    pub fn max_records_in_ram(&self) -> usize {
        self.max_records_in_ram
    }

    /// Number of records added so far.
    pub fn len(&self) -> u64 {
        self.total_records
    }

    pub fn is_empty(&self) -> bool {
        self.total_records == 0
    }

    pub fn spill_count(&self) -> usize {
        self.runs.len()
    }

    pub fn add(&mut self, record: T) -> Result<(), MarkDupError> {
        if self.state != SpoolState::Adding {
            return Err(MarkDupError::SpoolSealed { label: self.label });
        }
        self.buffer.push(record);
        self.total_records += 1;
        if self.buffer.len() >= self.max_records_in_ram {
            self.spill()?;
        }
        Ok(())
    }

    /// Sort whatever is still buffered. Nothing is written to disk here.
    pub fn done_adding(&mut self) -> Result<(), MarkDupError> {
        match self.state {
            SpoolState::Adding => {
                self.sort_buffer();
                self.buffer.shrink_to_fit();
                self.state = SpoolState::Done;
                debug!(
                    "{} spool sealed: {} records, {} spill runs",
                    self.label,
                    self.total_records,
                    self.runs.len()
                );
                Ok(())
            }
            SpoolState::Done => Ok(()),
            SpoolState::Consumed => Err(MarkDupError::SpoolConsumed { label: self.label }),
        }
    }

    /// Single-pass ascending iteration over every record added.
    pub fn iter(&mut self) -> Result<SpoolIter<'_, T>, MarkDupError> {
        if self.state == SpoolState::Adding {
            self.done_adding()?;
        }
        if self.state == SpoolState::Consumed {
            return Err(MarkDupError::SpoolConsumed { label: self.label });
        }
        self.state = SpoolState::Consumed;

        self.reduce_runs()?;
        let memory = std::mem::take(&mut self.buffer);
        if self.runs.is_empty() {
            return Ok(SpoolIter {
                label: self.label,
                inner: Inner::Memory(memory.into_iter()),
                _spool: PhantomData,
            });
        }

        let mut sources = Vec::with_capacity(self.runs.len() + 1);
        for path in &self.runs {
            sources.push(RunSource::open(self.label, path)?);
        }
        sources.push(RunSource::Memory(memory.into_iter()));

        Ok(SpoolIter {
            label: self.label,
            inner: Inner::Merge(MergeState::new(sources, self.label)?),
            _spool: PhantomData,
        })
    }

    /// Merge consecutive runs in batches until at most `max_open_runs` remain.
    ///
    /// Batches keep their relative order, so the final merge stays stable.
    fn reduce_runs(&mut self) -> Result<(), MarkDupError> {
        while self.runs.len() > self.max_open_runs {
            let runs = std::mem::take(&mut self.runs);
            debug!(
                "{} spool: merging {} runs in batches of {}",
                self.label,
                runs.len(),
                self.max_open_runs
            );
            for batch in runs.chunks(self.max_open_runs) {
                let merged = match batch {
                    [single] => single.clone(),
                    _ => self.merge_runs(batch)?,
                };
                self.runs.push(merged);
            }
        }
        Ok(())
    }

    fn merge_runs(&mut self, batch: &[PathBuf]) -> Result<PathBuf, MarkDupError> {
        let label = self.label;
        let sources = batch
            .iter()
            .map(|path| RunSource::open(label, path))
            .collect::<Result<Vec<RunSource<T>>, _>>()?;
        let mut merge = MergeState::new(sources, label)?;

        let path = self.next_run_path()?;
        let write_error = |source: io::Error| MarkDupError::SpillWrite {
            label,
            path: path.clone(),
            source,
        };
        let mut writer = create_spill_run(&path).map_err(write_error)?;
        while let Some(record) = merge.pop(label)? {
            record.write_to(&mut writer).map_err(write_error)?;
        }
        finish_spill_run(writer).map_err(write_error)?;
        drop(merge);

        for input in batch {
            std::fs::remove_file(input).map_err(|source| MarkDupError::SpillWrite {
                label,
                path: input.clone(),
                source,
            })?;
        }
        Ok(path)
    }

    /// Delete spill files and scratch directories. Safe to call repeatedly.
    pub fn cleanup(&mut self) -> io::Result<()> {
        for path in self.runs.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        for dir in self.scratch_dirs.iter_mut().filter_map(Option::take) {
            dir.close()?;
        }
        self.buffer = Vec::new();
        Ok(())
    }

    fn sort_buffer(&mut self) {
        if self.parallel_sort {
            self.buffer.par_sort();
        } else {
            self.buffer.sort();
        }
    }

    fn spill(&mut self) -> Result<(), MarkDupError> {
        self.sort_buffer();
        let path = self.next_run_path()?;
        write_spill_run(&self.buffer, &path).map_err(|source| MarkDupError::SpillWrite {
            label: self.label,
            path: path.clone(),
            source,
        })?;
        debug!(
            "{} spool: spilled {} records to {}",
            self.label,
            self.buffer.len(),
            path.display()
        );
        self.buffer.clear();
        self.runs.push(path);
        Ok(())
    }

    fn next_run_path(&mut self) -> Result<PathBuf, MarkDupError> {
        let run = self.runs_created;
        let slot = run % self.scratch_roots.len();
        let dir = match &mut self.scratch_dirs[slot] {
            Some(dir) => dir.path().to_path_buf(),
            empty => {
                let root = &self.scratch_roots[slot];
                let dir = Builder::new()
                    .prefix("mkduprs")
                    .tempdir_in(root)
                    .map_err(|source| MarkDupError::ScratchDir {
                        path: root.clone(),
                        source,
                    })?;
                let path = dir.path().to_path_buf();
                *empty = Some(dir);
                path
            }
        };
        self.runs_created += 1;
        Ok(dir.join(format!(
            "{}-{:05}-{:08x}.lz4",
            self.label,
            run,
            fastrand::u32(..)
        )))
    }
}

/// Iterator returned by [`SortingSpool::iter`].
///
/// Stops after the first read error.
pub struct SpoolIter<'a, T> {
    label: &'static str,
    inner: Inner<T>,
    _spool: PhantomData<&'a mut SortingSpool<T>>,
}

enum Inner<T> {
    Memory(std::vec::IntoIter<T>),
    Merge(MergeState<T>),
    Failed,
}

struct MergeState<T> {
    heap: BinaryHeap<Reverse<HeapEntry<T>>>,
    sources: Vec<RunSource<T>>,
}

impl<T: SpoolRecord> MergeState<T> {
    fn new(mut sources: Vec<RunSource<T>>, label: &'static str) -> Result<Self, MarkDupError> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (run, source) in sources.iter_mut().enumerate() {
            if let Some(record) = source.next_record(label)? {
                heap.push(Reverse(HeapEntry { record, run }));
            }
        }
        Ok(Self { heap, sources })
    }

    fn pop(&mut self, label: &'static str) -> Result<Option<T>, MarkDupError> {
        let Some(Reverse(entry)) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some(record) = self.sources[entry.run].next_record(label)? {
            self.heap.push(Reverse(HeapEntry {
                record,
                run: entry.run,
            }));
        }
        Ok(Some(entry.record))
    }
}

enum RunSource<T> {
    Spilled {
        path: PathBuf,
        reader: BufReader<FrameDecoder<File>>,
    },
    Memory(std::vec::IntoIter<T>),
}

impl<T: SpoolRecord> RunSource<T> {
    fn open(label: &'static str, path: &Path) -> Result<Self, MarkDupError> {
        let reader = open_spill_run(path).map_err(|source| MarkDupError::SpillRead {
            label,
            path: path.to_path_buf(),
            source,
        })?;
        Ok(RunSource::Spilled {
            path: path.to_path_buf(),
            reader,
        })
    }

    fn next_record(&mut self, label: &'static str) -> Result<Option<T>, MarkDupError> {
        match self {
            RunSource::Spilled { path, reader } => {
                T::read_from(reader).map_err(|source| MarkDupError::SpillRead {
                    label,
                    path: path.clone(),
                    source,
                })
            }
            RunSource::Memory(records) => Ok(records.next()),
        }
    }
}

impl<T: SpoolRecord> Iterator for SpoolIter<'_, T> {
    type Item = Result<T, MarkDupError>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = match &mut self.inner {
            Inner::Memory(records) => return records.next().map(Ok),
            Inner::Merge(state) => state.pop(self.label),
            Inner::Failed => return None,
        };
        match result {
            Ok(record) => record.map(Ok),
            Err(e) => {
                self.inner = Inner::Failed;
                Some(Err(e))
            }
        }
    }
}

/// Entry in the merge heap; ties go to the lower run number.
struct HeapEntry<T> {
    record: T,
    run: usize,
}

impl<T: Ord> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for HeapEntry<T> {}

impl<T: Ord> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.record
            .cmp(&other.record)
            .then_with(|| self.run.cmp(&other.run))
    }
}
