//! Run and page state
//!
//! # Components
//!
//! - `Stage` / `RunStatus`: where a run is and how it is doing
//! - `Run` / `Source`: durable run records and their crawl configuration
//! - `PageState`: the state of a page within one run
//! - `CrawlState`: the shared per-run frontier and dedup set
//! - `StageProgressTracker`: atomic per-stage completion counters

mod crawl_state;
mod page_state;
mod progress;
mod run;
mod stage;

pub use crawl_state::{CrawlMetadata, CrawlState};
pub use page_state::PageState;
pub use progress::{ProgressUpdate, StageProgress, StageProgressTracker};
pub use run::{classify_final_status, NewRun, Run, RunStat, RunStats, Source};
pub use stage::{RunStatus, Stage};
