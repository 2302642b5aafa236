use std::fmt;
use std::io;

use crate::log;

/// Why a tag line was rejected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MalformedTagReason {
    MissingOpeningBracket,
    MissingClosingBracket,
    /// More than one `[...]` on a single line. Legal PGN, but not supported.
    MultipleTags,
    MalformedQuotes,
}

impl fmt::Display for MalformedTagReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::MissingOpeningBracket => "expected opening bracket",
            Self::MissingClosingBracket => "expected closing bracket",
            Self::MultipleTags => "found multiple tags per line",
            Self::MalformedQuotes => "malformed tag value quotes",
        };
        f.write_str(msg)
    }
}

/// Fatal parse failure. The archive's record sequence ends after one of these.
#[derive(Debug)]
pub enum ParseError {
    MalformedTag {
        line: usize,
        reason: MalformedTagReason,
    },
    /// A non-blank, non-tag line that does not start with `<integer>.`.
    UnexpectedLine { line: usize },
    Io { line: usize, source: io::Error },
}

impl ParseError {
    /// 1-based line number the error was raised on.
    pub fn line(&self) -> usize {
        match self {
            Self::MalformedTag { line, .. }
            | Self::UnexpectedLine { line }
            | Self::Io { line, .. } => *line,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedTag { line, reason } => write!(f, "{line}: malformed tag: {reason}"),
            Self::UnexpectedLine { line } => write!(f, "{line}: unexpected start of line"),
            Self::Io { line, source } => write!(f, "{line}: read error: {source}"),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Non-fatal condition; parsing continues after one of these is reported.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Warning {
    /// The key was already present in the current record; the new value won.
    DuplicateTag { line: usize, key: String },
    /// A move line not starting at move 1 was dropped together with its tags.
    PartialGameSkipped { line: usize, move_number: String },
}

impl Warning {
    pub fn line(&self) -> usize {
        match self {
            Self::DuplicateTag { line, .. } | Self::PartialGameSkipped { line, .. } => *line,
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateTag { line, key } => {
                write!(f, "{line}: duplicate tag '{key}', overwriting previous value")
            }
            Self::PartialGameSkipped { line, move_number } => {
                write!(f, "{line}: skipping partial game starting at move {move_number}")
            }
        }
    }
}

/// Side channel for non-fatal warnings raised while parsing.
pub trait Diagnostics {
    fn report(&mut self, warning: Warning);
}

/// Forwards warnings to the crate logger at warn level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDiagnostics;

impl Diagnostics for LogDiagnostics {
    fn report(&mut self, warning: Warning) {
        log::warn(warning.to_string());
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreDiagnostics;

impl Diagnostics for IgnoreDiagnostics {
    fn report(&mut self, _: Warning) {}
}

impl Diagnostics for Vec<Warning> {
    fn report(&mut self, warning: Warning) {
        self.push(warning);
    }
}

impl<D: Diagnostics + ?Sized> Diagnostics for &mut D {
    fn report(&mut self, warning: Warning) {
        (**self).report(warning);
    }
}

/// Joins per-row diagnostic messages with `; `.
#[derive(Debug, Clone, Default)]
pub struct ErrorAccumulator(Option<String>);

impl ErrorAccumulator {
    pub fn push(&mut self, msg: &str) {
        match &mut self.0 {
            Some(existing) => {
                existing.push_str("; ");
                existing.push_str(msg);
            }
            None => {
                self.0 = Some(msg.to_string());
            }
        }
    }

    pub fn take(&mut self) -> Option<String> {
        self.0.take()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}
