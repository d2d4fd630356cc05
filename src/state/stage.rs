//! Run stages and run statuses
//!
//! The two are independent: the stage says where in the pipeline a run is,
//! the status says how it is doing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The six fixed pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovering,
    Scraping,
    Processing,
    Indexing,
    Embedding,
    Completed,
}

impl Stage {
    /// Every stage in execution order
    pub const ORDER: [Stage; 6] = [
        Stage::Discovering,
        Stage::Scraping,
        Stage::Processing,
        Stage::Indexing,
        Stage::Embedding,
        Stage::Completed,
    ];

    /// The stage that follows this one; `None` for the terminal stage
    pub fn next(self) -> Option<Stage> {
        match self {
            Self::Discovering => Some(Self::Scraping),
            Self::Scraping => Some(Self::Processing),
            Self::Processing => Some(Self::Indexing),
            Self::Indexing => Some(Self::Embedding),
            Self::Embedding => Some(Self::Completed),
            Self::Completed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn to_db_string(self) -> &'static str {
        match self {
            Self::Discovering => "discovering",
            Self::Scraping => "scraping",
            Self::Processing => "processing",
            Self::Indexing => "indexing",
            Self::Embedding => "embedding",
            Self::Completed => "completed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|stage| stage.to_db_string() == s)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    /// Finished with both successes and failures
    Partial,
    Succeeded,
    /// Finished without a single success
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn to_db_string(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Partial => "partial",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "partial" => Some(Self::Partial),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_fixed() {
        let mut stage = Stage::Discovering;
        let mut walked = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            walked.push(next);
            stage = next;
        }
        assert_eq!(walked, Stage::ORDER.to_vec());
        assert!(stage.is_terminal());
    }

    #[test]
    fn test_stage_db_strings() {
        for stage in Stage::ORDER {
            assert_eq!(Stage::from_db_string(stage.to_db_string()), Some(stage));
        }
        assert_eq!(Stage::from_db_string("DISCOVERING"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Partial.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
    }
}
