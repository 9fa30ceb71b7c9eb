pub mod events;
pub mod projects;
pub mod queue;
pub mod screenshots;
