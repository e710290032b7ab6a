//! Error kinds raised by the duplicate-marking engine.
//!
//! Call sites wrap these in `anyhow::Error` with extra context; the typed
//! variants exist so callers (and tests) can tell fatal resource failures
//! apart from pipeline shutdown signals.

use std::path::PathBuf;

use thiserror::Error;

use crate::read_ends::Orientation;

#[derive(Error, Debug)]
pub enum MarkDupError {
    /// Invalid configuration value
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// The parameter name
        parameter: String,
        /// Explanation of why it's invalid
        reason: String,
    },

    /// A scratch directory could not be created under one of the tmp roots
    #[error("could not create scratch directory under {}", path.display())]
    ScratchDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spill {label} records to {}", path.display())]
    SpillWrite {
        label: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read spilled {label} records from {}", path.display())]
    SpillRead {
        label: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot add records to the {label} spool after done_adding")]
    SpoolSealed { label: &'static str },

    #[error("the {label} spool was already iterated")]
    SpoolConsumed { label: &'static str },

    #[error("producer stopped without signalling end of stream")]
    ProducerDisconnected,

    #[error("consumer stopped before end of stream")]
    ConsumerDisconnected,

    #[error("end of stream was already taken from the handoff channel")]
    HandoffDrained,

    #[error("{stage} worker panicked")]
    WorkerPanicked { stage: &'static str },

    /// A set mixing FR and RF pairs also held a same-strand pair
    #[error("unexpected pair orientation {orientation:?} in a duplicate set with both FR and RF pairs")]
    UnexpectedOrientation { orientation: Orientation },

    /// More libraries or read groups than a read end can index
    #[error("more than {limit} {what}")]
    TooMany { what: &'static str, limit: usize },

    /// Second pass ran out of reads before every duplicate index was seen
    #[error("input changed between passes: {remaining} duplicate indices were never matched")]
    InputChanged { remaining: u64 },
}
