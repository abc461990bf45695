//! Error taxonomy.
//!
//! - [`EntryNameError`]: one archive entry cannot become a construct; the
//!   entry is skipped and the scan continues.
//! - [`InstrumentError`]: one class could not be instrumented; it is counted
//!   and left untouched.
//! - [`AnalysisError`]: the whole archive could not be analyzed or rewritten;
//!   attached to that archive's result, siblings are unaffected.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntryNameError {
    #[error("entry [{0}] is not a class file")]
    NotAClass(String),

    #[error("entry [{0}] belongs to a multi-release overlay, which is not supported")]
    MultiRelease(String),

    #[error("entry [{0}] is a package-info or module-info descriptor, which is ignored")]
    SyntheticDescriptor(String),

    #[error("entry [{entry}] cannot be turned into a class identifier: [{segment}] is not a valid identifier")]
    InvalidSegment { entry: String, segment: String },
}

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("cannot compile probe for class [{class}]: {reason}")]
    Compile { class: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ClassFileError {
    #[error("class file truncated at offset {0}")]
    Truncated(usize),

    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),

    #[error("unknown constant pool tag {tag} at index {index}")]
    UnknownConstantTag { tag: u8, index: u16 },

    #[error("constant pool index {0} does not point to the expected entry")]
    BadConstantIndex(u16),
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("cannot open archive [{path}]: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("cannot extract archive [{path}]: {reason}")]
    Extract { path: PathBuf, reason: String },

    #[error("error while writing entry [{entry}] to [{target}]: {reason}")]
    WriteEntry {
        entry: String,
        target: PathBuf,
        reason: String,
    },

    #[error("error while writing rewritten archive [{target}]: {reason}")]
    Write { target: PathBuf, reason: String },

    #[error("worker panicked while analyzing [{0}]")]
    Panicked(PathBuf),
}

impl AnalysisError {
    pub fn open(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        AnalysisError::Open {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("class [{0}] not found on the classpath")]
    NotFound(String),

    #[error("cannot read class [{class}] from [{location}]: {reason}")]
    Read {
        class: String,
        location: PathBuf,
        reason: String,
    },

    #[error("cannot parse class [{class}]: {source}")]
    Parse {
        class: String,
        #[source]
        source: ClassFileError,
    },
}
