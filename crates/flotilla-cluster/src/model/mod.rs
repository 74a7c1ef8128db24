//! Typed views of fleet rows used by the reconciler.

pub mod story;

pub use story::{StoryRecord, StoryStatus, status_rank};
