//
// Copyright (c) The heracles Core Contributors
//
// SPDX-License-Identifier: MIT
//

use crate::pathx::{PathxError, PathxErrorKind};

/// A convenience wrapper around `Result` for `heracles::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Error codes reported by the engine.
///
/// Every public operation that fails leaves one of these codes in the
/// handle's last-error slot, together with a detail string describing the
/// failure. The canonical English message for a code is available through
/// [`ErrorCode::message`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    /// No error.
    NoError,
    /// Out of memory.
    NoMem,
    /// Internal error (bug).
    Internal,
    /// Invalid path expression.
    PathX,
    /// No match for path expression.
    NoMatch,
    /// Too many matches for path expression.
    MMatch,
    /// Syntax error in lens definition.
    Syntax,
    /// Lens lookup failed.
    NoLens,
    /// Multiple transforms apply to one file.
    MXfm,
    /// Node has no span information.
    NoSpan,
    /// Cannot move a node into its own descendant.
    MvDesc,
    /// Failed to execute command.
    CmdRun,
    /// Invalid argument in function call.
    BadArg,
    /// Invalid label.
    Label,
}

impl ErrorCode {
    /// The canonical English message for this code.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "No error",
            ErrorCode::NoMem => "Cannot allocate memory",
            ErrorCode::Internal => "Internal error (please file a bug)",
            ErrorCode::PathX => "Invalid path expression",
            ErrorCode::NoMatch => "No match for path expression",
            ErrorCode::MMatch => "Too many matches for path expression",
            ErrorCode::Syntax => "Syntax error in lens definition",
            ErrorCode::NoLens => "Lens not found",
            ErrorCode::MXfm => "Multiple transforms",
            ErrorCode::NoSpan => "Node has no span info",
            ErrorCode::MvDesc => "Cannot move node into its descendant",
            ErrorCode::CmdRun => "Failed to execute command",
            ErrorCode::BadArg => "Invalid argument in function call",
            ErrorCode::Label => "Invalid label",
        }
    }
}

/// An error raised by a public engine operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Error {
    pub code: ErrorCode,
    /// Human readable explanation, e.g. the offending substring of a path
    /// expression together with its character offset.
    pub details: Option<String>,
    /// Human readable version of the minor code, from a canonical table.
    pub minor_details: Option<&'static str>,
}

impl Error {
    pub(crate) fn new(code: ErrorCode, details: Option<String>) -> Error {
        Error {
            code,
            details,
            minor_details: None,
        }
    }
}

impl std::fmt::Display for Error {
    // Print the canonical message, followed by details when present.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.details {
            Some(details) => {
                write!(f, "{}: {}", self.code.message(), details)
            }
            None => write!(f, "{}", self.code.message()),
        }
    }
}

impl std::error::Error for Error {}

impl From<PathxError> for Error {
    fn from(e: PathxError) -> Error {
        let code = match e.kind {
            PathxErrorKind::NoMem => ErrorCode::NoMem,
            PathxErrorKind::NoMatch => ErrorCode::NoMatch,
            PathxErrorKind::MMatch => ErrorCode::MMatch,
            PathxErrorKind::Internal => ErrorCode::Internal,
            _ => ErrorCode::PathX,
        };
        Error {
            code,
            details: Some(e.details()),
            minor_details: Some(e.kind.message()),
        }
    }
}
