//! Fast-import stream engine: parses the fast-import command language and
//! drives pack construction directly, without going through an on-disk
//! object database for new objects.

pub mod branch;
pub mod crash;
pub mod engine;
pub mod marks;
pub mod notes;
pub mod odb_source;
pub mod parser;
pub mod tree;

pub use branch::{Branch, BranchTable, DEFAULT_MAX_ACTIVE};
pub use crash::{handle_fatal_error, CommandHistory};
pub use engine::FastImportEngine;
pub use marks::{MarkTable, MarkedObject};
pub use parser::{Command, FileChange, Parser};
pub use tree::WorkingTree;

use git_hash::ObjectId;
use thiserror::Error;

/// Errors raised while driving a fast-import stream.
#[derive(Debug, Error)]
pub enum FastImportError {
    /// The stream violates the command grammar or references something it
    /// shouldn't (unknown command, undefined mark, non-commit parent, a
    /// file path with an empty component, a directory where a blob was
    /// expected, and so on).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A line or block didn't parse as the format it was expected to be in.
    #[error("format error: {0}")]
    Format(String),

    /// Object content failed a consistency check (e.g. an `original-oid`
    /// that doesn't match the object actually produced).
    #[error("integrity error: {0}")]
    Integrity(String),

    /// A ref update couldn't be applied (non-fast-forward without `force`,
    /// lock contention, missing parent ref). Reported and counted, but does
    /// not abort the rest of the import.
    #[error("ref update error on {name}: {reason}")]
    RefUpdate { name: String, reason: String },

    /// A resource limit was hit (pack size, open file handles, and so on).
    #[error("resource error: {0}")]
    Resource(String),

    #[error("object store error: {0}")]
    Odb(#[from] git_odb::OdbError),

    #[error("pack error: {0}")]
    Pack(#[from] git_pack::PackError),

    #[error("ref store error: {0}")]
    Ref(#[from] git_ref::RefError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FastImportError {
    pub fn undefined_mark(mark: u64) -> Self {
        FastImportError::Protocol(format!("undefined mark :{mark}"))
    }

    pub fn unknown_command(line: impl AsRef<str>) -> Self {
        FastImportError::Protocol(format!("unknown command: {}", line.as_ref()))
    }

    pub fn non_commit_parent(id: ObjectId) -> Self {
        FastImportError::Protocol(format!("{} is not a commit", id.to_hex()))
    }
}

pub type Result<T> = std::result::Result<T, FastImportError>;
