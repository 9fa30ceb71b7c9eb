pub mod event;
pub mod queue_entry;
pub mod screenshot;

pub use event::{Event, EventClassification, EventStatus};
pub use queue_entry::QueueEntry;
pub use screenshot::Screenshot;
