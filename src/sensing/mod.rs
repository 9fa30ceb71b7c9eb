pub mod bridge;
pub mod context;
pub mod controller;
pub mod frame_store;
pub mod hasher;
pub mod loop_worker;
pub mod spool;

pub use bridge::{CaptureSource, CapturedFrame, NoopOcr, OcrEngine, WindowMetadata};
pub use context::{ContextExtractor, ContextProvider};
pub use controller::CaptureController;
pub use frame_store::FrameStore;
pub use spool::SpoolCaptureSource;
