pub mod config;
pub mod merge;
pub mod pipeline;

pub use config::MergeConfig;
pub use merge::{decide_merge, MergeDecision};
pub use pipeline::{CaptureReport, Pipeline};
