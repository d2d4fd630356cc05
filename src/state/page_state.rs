//! Page state definitions for tracking a page through a run
//!
//! A page enters the store once its HTML has been fetched and then moves
//! through processing and indexing.

use std::fmt;

/// Represents the current state of a stored page within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageState {
    /// HTML is stored and waiting for processing
    Fetched,

    /// Text was extracted and hashed; waiting to be chunked
    Extracted,

    /// Content hash matches the source's previous run; nothing to re-index
    Unchanged,

    /// Processing or indexing failed permanently
    Failed,

    /// Chunks are stored and waiting for embedding
    Indexed,
}

impl PageState {
    /// Returns true once no further stage will touch the page
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Unchanged | Self::Failed | Self::Indexed)
    }

    /// Converts the page state to a database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Fetched => "fetched",
            Self::Extracted => "extracted",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
            Self::Indexed => "indexed",
        }
    }

    /// Parses a page state from a database string representation
    ///
    /// Returns None if the string doesn't match any known state.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "fetched" => Some(Self::Fetched),
            "extracted" => Some(Self::Extracted),
            "unchanged" => Some(Self::Unchanged),
            "failed" => Some(Self::Failed),
            "indexed" => Some(Self::Indexed),
            _ => None,
        }
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
