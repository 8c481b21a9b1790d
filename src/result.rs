//! # Result Taxonomy
//!
//! Every fallible engine operation returns `eyre::Result` carrying an
//! [`EngineError`] payload, so callers can recover the machine-readable
//! [`ErrorKind`] with [`ErrorKind::of`] while still getting rich context
//! strings for free.
//!
//! ## Kinds
//!
//! - `OutOfMemory`: the underlying heap or mmap allocation failed. A hard
//!   OS-level failure.
//! - `RecordFileFull`: a configured memory ceiling (global RAM+MMAP or the
//!   per-table limit) was reached. A soft, policy-driven refusal,
//!   deliberately distinct from `OutOfMemory`.
//! - `DuplicateKey`: a unique-index insert collided with an existing key.
//! - `KeyNotFound` / `EndOfFile`: lookup or iteration exhaustion. Expected
//!   control-flow outcomes, not faults.
//! - `WrongCommand` / `WrongIndex` / `Unsupported`: the caller invoked an
//!   operation in a state that cannot service it (for example enabling
//!   indexes on a populated table).
//! - `TableExists` / `NoSuchTable`: table-identity errors at the
//!   create/open/drop boundary.

use std::fmt;

/// Machine-readable classification of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    OutOfMemory,
    RecordFileFull,
    DuplicateKey,
    KeyNotFound,
    EndOfFile,
    WrongCommand,
    WrongIndex,
    Unsupported,
    TableExists,
    NoSuchTable,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::OutOfMemory => "out-of-memory",
            ErrorKind::RecordFileFull => "record-file-full",
            ErrorKind::DuplicateKey => "found-duplicate-key",
            ErrorKind::KeyNotFound => "key-not-found",
            ErrorKind::EndOfFile => "end-of-file",
            ErrorKind::WrongCommand => "wrong-command",
            ErrorKind::WrongIndex => "wrong-index",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::TableExists => "table-exist",
            ErrorKind::NoSuchTable => "no-such-table",
        }
    }

    /// Recovers the kind from an `eyre::Report`, walking the error chain.
    pub fn of(report: &eyre::Report) -> Option<ErrorKind> {
        report
            .chain()
            .find_map(|e| e.downcast_ref::<EngineError>())
            .map(|e| e.kind)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed payload carried inside `eyre::Report` by every engine failure.
#[derive(Debug)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl EngineError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.detail)
        }
    }
}

impl std::error::Error for EngineError {}

/// Shorthand used at engine failure sites.
pub(crate) fn engine_error(kind: ErrorKind, detail: impl Into<String>) -> eyre::Report {
    eyre::Report::new(EngineError::new(kind, detail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_recoverable_through_report() {
        let report = engine_error(ErrorKind::RecordFileFull, "per-table limit of 2 MiB reached");
        assert_eq!(ErrorKind::of(&report), Some(ErrorKind::RecordFileFull));
    }

    #[test]
    fn kind_recoverable_through_wrapped_report() {
        let report = engine_error(ErrorKind::DuplicateKey, "key collides in index 1")
            .wrap_err("inserting row into table t1");
        assert_eq!(ErrorKind::of(&report), Some(ErrorKind::DuplicateKey));
    }

    #[test]
    fn foreign_report_has_no_kind() {
        let report = eyre::eyre!("some unrelated failure");
        assert_eq!(ErrorKind::of(&report), None);
    }

    #[test]
    fn display_includes_detail() {
        let err = EngineError::new(ErrorKind::OutOfMemory, "mmap failed");
        assert_eq!(err.to_string(), "out-of-memory: mmap failed");
    }
}
